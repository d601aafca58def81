//! A Vertex-shaped `UpstreamProvider`. Vertex addresses models by
//! `{project}/{location}/{model}` rather than a flat model string, and
//! gates access by a deployment id — the deployment *selection*
//! already happened in `router-engine`'s scalar
//! key selector (`VendorDeployments::deployment_for`) before this
//! adapter is ever called; all this provider does is turn the already-
//! resolved deployment id into a `generateContent`-shaped wire call.

use async_trait::async_trait;
use serde_json::{json, Value as Json};
use tokio::sync::mpsc;

use router_common::RouterError;
use router_provider::{
    Key, ModelListResponse, Op, StreamEvent, TypedRequest, TypedResponse, UpstreamProvider,
};

use crate::http::{api_error, classify_transport_error, decode_error, shared_client, unsupported};

const PROVIDER_NAME: &str = "vertex";

pub struct VertexProvider {
    base_url: String,
    project: String,
    location: String,
}

impl VertexProvider {
    pub fn new(project: impl Into<String>, location: impl Into<String>) -> Self {
        Self {
            base_url: "https://aiplatform.googleapis.com/v1".to_string(),
            project: project.into(),
            location: location.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// A key without a registered `vertex` deployment for this model
    /// should never reach this adapter (the scalar selector in
    /// `router-engine` filters it out first); this is a defensive
    /// re-check, not the primary gate.
    fn deployment_id<'a>(&self, key: &'a Key, model: &str) -> Result<&'a str, RouterError> {
        key.deployments
            .deployment_for("vertex", model)
            .map(|d| d.deployment_id.as_str())
            .ok_or_else(|| {
                RouterError::new(
                    router_common::ErrorKind::ConfigurationError,
                    format!("no vertex deployment registered for model {model}"),
                )
            })
    }

    fn contents_for(&self, req: &TypedRequest) -> Result<Json, RouterError> {
        match req {
            TypedRequest::Chat(p) | TypedRequest::ChatStream(p) => Ok(p.messages.clone()),
            TypedRequest::Responses(p) | TypedRequest::ResponsesStream(p) => Ok(p.input.clone()),
            other => Err(unsupported(PROVIDER_NAME, Op::from_request(other))),
        }
    }

    async fn generate_content(
        &self,
        key: &Key,
        deployment_id: &str,
        contents: Json,
    ) -> Result<TypedResponse, RouterError> {
        let client = shared_client();
        let url = format!(
            "{}/projects/{}/locations/{}/publishers/google/models/{}:generateContent",
            self.base_url, self.project, self.location, deployment_id
        );
        let resp = client
            .post(&url)
            .bearer_auth(&key.value)
            .json(&json!({ "contents": contents }))
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

#[async_trait]
impl UpstreamProvider for VertexProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    fn supports(&self, op: Op) -> bool {
        matches!(op, Op::Chat | Op::ChatStream | Op::Responses | Op::ResponsesStream)
    }

    async fn call(&self, op: Op, key: &Key, req: &TypedRequest) -> Result<TypedResponse, RouterError> {
        if !self.supports(op) {
            return Err(unsupported(PROVIDER_NAME, op));
        }
        let deployment_id = self.deployment_id(key, req.model())?.to_string();
        let contents = self.contents_for(req)?;
        self.generate_content(key, &deployment_id, contents).await
    }

    async fn call_stream(
        &self,
        op: Op,
        _key: &Key,
        _req: &TypedRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, RouterError> {
        // Streaming requires Server-Sent-Events decoding of Vertex's
        // `:streamGenerateContent` endpoint; not implemented by this
        // adapter.
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
