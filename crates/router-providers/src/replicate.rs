//! A Replicate-shaped `UpstreamProvider`. Replicate's own API is
//! prediction-based (POST a version + input, poll or wait for a
//! terminal status) rather than request/response-per-call like
//! OpenAI-shaped vendors; this adapter flattens that into `call` using
//! Replicate's synchronous `Prefer: wait` header. Everything else about
//! retries, fallbacks, and key selection stays in `router-engine` and is
//! untouched here.

use async_trait::async_trait;
use serde_json::{json, Value as Json};
use tokio::sync::mpsc;

use router_common::RouterError;
use router_provider::{
    Key, ModelListResponse, Op, StreamEvent, TypedRequest, TypedResponse, UpstreamProvider,
};

use crate::http::{api_error, classify_transport_error, decode_error, shared_client, unsupported};

const PROVIDER_NAME: &str = "replicate";
const DEFAULT_BASE_URL: &str = "https://api.replicate.com/v1";

pub struct ReplicateProvider {
    base_url: String,
}

impl ReplicateProvider {
    pub fn new() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
        }
    }

    fn input_for(&self, req: &TypedRequest) -> Result<Json, RouterError> {
        match req {
            TypedRequest::Chat(p) => Ok(json!({ "messages": p.messages })),
            TypedRequest::TextCompletion(p) => Ok(json!({ "prompt": p.prompt })),
            TypedRequest::ImageGen(p) => Ok(json!({ "prompt": p.prompt })),
            other => Err(unsupported(PROVIDER_NAME, Op::from_request(other))),
        }
    }

    async fn run_prediction(&self, key: &Key, model: &str, input: Json) -> Result<TypedResponse, RouterError> {
        let client = shared_client();
        let url = format!("{}/models/{}/predictions", self.base_url, model);
        let resp = client
            .post(&url)
            .bearer_auth(&key.value)
            .header("Prefer", "wait")
            .json(&json!({ "input": input }))
            .send()
            .await
            .map_err(|e| classify_transport_error(PROVIDER_NAME, e))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| classify_transport_error(PROVIDER_NAME, e))?;

        if !status.is_success() {
            return Err(api_error(PROVIDER_NAME, status.as_u16(), &body));
        }
        let payload: Json = serde_json::from_str(&body).map_err(|e| decode_error(PROVIDER_NAME, e))?;
        Ok(TypedResponse {
            payload,
            raw_response: None,
        })
    }
}

impl Default for ReplicateProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UpstreamProvider for ReplicateProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn supports(&self, op: Op) -> bool {
        matches!(op, Op::Chat | Op::Text | Op::ImageGen)
    }

    async fn call(&self, op: Op, key: &Key, req: &TypedRequest) -> Result<TypedResponse, RouterError> {
        if !self.supports(op) {
            return Err(unsupported(PROVIDER_NAME, op));
        }
        let input = self.input_for(req)?;
        self.run_prediction(key, req.model(), input).await
    }

    async fn call_stream(
        &self,
        op: Op,
        _key: &Key,
        _req: &TypedRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, RouterError> {
        Err(unsupported(PROVIDER_NAME, op))
    }

    async fn list_models(
        &self,
        _key: &Key,
        _page_token: Option<&str>,
        _page_size: u32,
    ) -> Result<ModelListResponse, RouterError> {
        Err(unsupported(PROVIDER_NAME, Op::ListModels))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unsupported_op_does_not_build_a_request() {
        let provider = ReplicateProvider::new();
        assert!(!provider.supports(Op::Embedding));
    }

    #[test]
    fn input_for_chat_carries_messages_through() {
        let provider = ReplicateProvider::new();
        let req = TypedRequest::Chat(router_provider::ChatPayload {
            provider: PROVIDER_NAME.into(),
            model: "meta/llama-2-70b-chat".into(),
            fallbacks: vec![],
            messages: json!([{"role": "user", "content": "hi"}]),
        });
        let input = provider.input_for(&req).unwrap();
        assert!(input["messages"].is_array());
    }
}
