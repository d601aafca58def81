//! The optional MCP capability: an opaque collaborator that augments
//! requests with tool definitions and can run a tool-call
//! agentic loop after a response comes back. Treated as an external
//! collaborator, not part of the dispatch core — the trait here exists
//! only so `router-engine` has something to call.
//!
//! A trait plus a zero-behavior default that callers wire in when no real
//! MCP subsystem is configured.

use async_trait::async_trait;
use router_common::RouterError;
use router_provider::TypedRequest;
use serde_json::Value as Json;

#[async_trait]
pub trait McpClient: Send + Sync {
    /// Inject tool definitions into the request before dispatch.
    async fn add_tools_to_request(&self, req: TypedRequest) -> Result<TypedRequest, RouterError>;

    /// Run the post-response agentic tool-call loop for a chat request.
    async fn check_and_execute_agent_for_chat_request(
        &self,
        response: Json,
    ) -> Result<Json, RouterError>;

    /// Run the post-response agentic tool-call loop for a responses-API
    /// request.
    async fn check_and_execute_agent_for_responses_request(
        &self,
        response: Json,
    ) -> Result<Json, RouterError>;

    async fn reconnect(&self) -> Result<(), RouterError>;

    async fn cleanup(&self);
}

/// The default when no MCP subsystem is configured.
pub struct NoopMcp;

#[async_trait]
impl McpClient for NoopMcp {
    async fn add_tools_to_request(&self, req: TypedRequest) -> Result<TypedRequest, RouterError> {
        Ok(req)
    }

    async fn check_and_execute_agent_for_chat_request(
        &self,
        response: Json,
    ) -> Result<Json, RouterError> {
        Ok(response)
    }

    async fn check_and_execute_agent_for_responses_request(
        &self,
        response: Json,
    ) -> Result<Json, RouterError> {
        Ok(response)
    }

    async fn reconnect(&self) -> Result<(), RouterError> {
        Ok(())
    }

    async fn cleanup(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn noop_mcp_passes_requests_through_unchanged() {
        let mcp = NoopMcp;
        let req = TypedRequest::ListModels(router_provider::ListModelsPayload {
            provider: "openai".into(),
            model: String::new(),
            fallbacks: vec![],
            page_token: None,
        });
        let out = mcp.add_tools_to_request(req.clone()).await.unwrap();
        assert_eq!(out.provider(), req.provider());
    }
}
