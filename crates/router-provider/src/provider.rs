use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

use router_common::RouterError;

use crate::key::Key;
use crate::request::TypedRequest;

/// One operation a `UpstreamProvider` may or may not implement. Covers
/// every request kind the router accepts; not every provider
/// implements every op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Op {
    Chat,
    ChatStream,
    Responses,
    ResponsesStream,
    Text,
    TextStream,
    Embedding,
    Speech,
    SpeechStream,
    Transcription,
    TranscriptionStream,
    ImageGen,
    ImageGenStream,
    ListModels,
    CountTokens,
    FileUpload,
    FileList,
    FileRetrieve,
    FileDelete,
    FileContent,
    BatchCreate,
    BatchList,
    BatchRetrieve,
    BatchCancel,
    BatchResults,
    ContainerCreate,
    ContainerList,
    ContainerRetrieve,
    ContainerDelete,
    ContainerFileUpload,
    ContainerFileList,
    ContainerFileRetrieve,
    ContainerFileDelete,
}

impl Op {
    pub fn from_request(req: &TypedRequest) -> Op {
        use crate::request::{BatchOp, ContainerOp, FileOp};
        match req {
            TypedRequest::Chat(_) => Op::Chat,
            TypedRequest::ChatStream(_) => Op::ChatStream,
            TypedRequest::TextCompletion(_) => Op::Text,
            TypedRequest::TextCompletionStream(_) => Op::TextStream,
            TypedRequest::Responses(_) => Op::Responses,
            TypedRequest::ResponsesStream(_) => Op::ResponsesStream,
            TypedRequest::Embedding(_) => Op::Embedding,
            TypedRequest::Speech(_) => Op::Speech,
            TypedRequest::SpeechStream(_) => Op::SpeechStream,
            TypedRequest::Transcription(_) => Op::Transcription,
            TypedRequest::TranscriptionStream(_) => Op::TranscriptionStream,
            TypedRequest::ImageGen(_) => Op::ImageGen,
            TypedRequest::ImageGenStream(_) => Op::ImageGenStream,
            TypedRequest::ListModels(_) => Op::ListModels,
            TypedRequest::CountTokens(_) => Op::CountTokens,
            TypedRequest::File(p) => match p.op {
                FileOp::Upload => Op::FileUpload,
                FileOp::List => Op::FileList,
                FileOp::Retrieve => Op::FileRetrieve,
                FileOp::Delete => Op::FileDelete,
                FileOp::Content => Op::FileContent,
            },
            TypedRequest::Batch(p) => match p.op {
                BatchOp::Create => Op::BatchCreate,
                BatchOp::List => Op::BatchList,
                BatchOp::Retrieve => Op::BatchRetrieve,
                BatchOp::Cancel => Op::BatchCancel,
                BatchOp::Results => Op::BatchResults,
            },
            TypedRequest::Container(p) => match p.op {
                ContainerOp::Create => Op::ContainerCreate,
                ContainerOp::List => Op::ContainerList,
                ContainerOp::Retrieve => Op::ContainerRetrieve,
                ContainerOp::Delete => Op::ContainerDelete,
                ContainerOp::FileUpload => Op::ContainerFileUpload,
                ContainerOp::FileList => Op::ContainerFileList,
                ContainerOp::FileRetrieve => Op::ContainerFileRetrieve,
                ContainerOp::FileDelete => Op::ContainerFileDelete,
            },
        }
    }

    /// Ops that require a credential be selected before dispatch;
    /// `ListModels` and internal aggregation ops don't.
    pub fn requires_credential(self) -> bool {
        !matches!(self, Op::ListModels)
    }

    /// Multi-key ops use the multi-key resolver rather than the scalar
    /// selector.
    pub fn uses_multi_key_resolver(self) -> bool {
        matches!(
            self,
            Op::FileList
                | Op::FileRetrieve
                | Op::FileDelete
                | Op::FileContent
                | Op::BatchList
                | Op::BatchRetrieve
                | Op::BatchCancel
                | Op::BatchResults
        )
    }
}

pub type ByteStream = tokio::sync::mpsc::Receiver<Bytes>;

/// One incremental response element, carrying either a payload or an
/// error plus a monotonic chunk index.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub index: u64,
    pub payload: Option<Json>,
    pub error: Option<RouterError>,
    pub finish_reason: Option<String>,
    /// Reserved-context "stream-end indicator" materialized onto the
    /// wire chunk so downstream observers can correlate completion.
    pub stream_end: bool,
}

pub type StreamChunk = StreamEvent;

#[derive(Debug, Clone)]
pub struct TypedResponse {
    pub payload: Json,
    pub raw_response: Option<Json>,
}

#[derive(Debug, Clone, Default)]
pub struct ModelListResponse {
    pub models: Vec<ModelInfo>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub provider: String,
}

/// The Provider capability: translates one typed request to a vendor
/// wire call and back. Vendor wire logic is out of scope here — this
/// crate only defines the interface; see `router-providers` for example
/// implementations.
#[async_trait]
pub trait UpstreamProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// `true` if this provider implements the given operation at all —
    /// not every provider implements every op.
    fn supports(&self, op: Op) -> bool;

    async fn call(
        &self,
        op: Op,
        key: &Key,
        req: &TypedRequest,
    ) -> Result<TypedResponse, RouterError>;

    /// Multi-key ops pass every eligible key at once so
    /// the provider can shard pagination across credentials.
    async fn call_multi_key(
        &self,
        op: Op,
        keys: &[Key],
        req: &TypedRequest,
    ) -> Result<TypedResponse, RouterError> {
        match keys.first() {
            Some(key) => self.call(op, key, req).await,
            None => Err(RouterError::new(
                router_common::ErrorKind::ConfigurationError,
                "no keys provided",
            )),
        }
    }

    /// Streaming variant: returns a channel of chunks. The worker hands
    /// this back to the caller immediately and does not await stream
    /// completion.
    async fn call_stream(
        &self,
        op: Op,
        key: &Key,
        req: &TypedRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamEvent>, RouterError>;

    async fn list_models(
        &self,
        key: &Key,
        page_token: Option<&str>,
        page_size: u32,
    ) -> Result<ModelListResponse, RouterError> {
        let _ = (key, page_token, page_size);
        Err(RouterError::new(
            router_common::ErrorKind::UnsupportedOperation,
            format!("{} does not implement list_models", self.name()),
        ))
    }
}
