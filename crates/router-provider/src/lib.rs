//! External collaborators consumed by the dispatch core:
//! `Account`, `Provider`, and the `TypedRequest`/`Key`/`Fallback` data
//! model. No vendor wire logic lives here — see `router-providers` for
//! pluggable implementations.

mod account;
mod key;
mod provider;
mod request;

pub use account::{
    Account, AccountError, ConcurrencyAndBufferSize, CustomProviderConfig, NetworkConfig,
    ProviderConfig,
};
pub use key::{AzureDeployment, Key, VendorDeployments};
pub use request::{
    BatchOp, BatchPayload, ChatPayload, ContainerOp, ContainerPayload, EmbeddingPayload, Fallback,
    FileOp, FilePayload, ImageGenPayload, ListModelsPayload, ResponsesPayload, SpeechPayload,
    TextCompletionPayload, TranscriptionPayload, TypedRequest,
};

pub use provider::{
    ByteStream, ModelInfo, ModelListResponse, Op, StreamChunk, StreamEvent, TypedResponse,
    UpstreamProvider,
};
