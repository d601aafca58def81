//! The dispatch core: request validation, plugin pipeline,
//! per-provider queues and worker pools, key selection, retry/fallback,
//! and the public `Dispatcher` surface.

mod context;
mod dispatcher;
mod key_selection;
mod pipeline;
mod queue;
mod registry;
mod retry;
mod worker;

pub use context::RequestContext;
pub use dispatcher::{AggregatedModelsResponse, Dispatcher};
pub use key_selection::{KeySelector, WeightedRandomKeySelector};
pub use pipeline::{HookOutcome, Plugin, PluginPipeline, PostHookStats};
pub use queue::{ChannelMessage, ProviderQueue, ResultSlot, WorkerWaitGroup};
pub use registry::{PluginsRegistry, ProvidersRegistry, RegistryError};
pub use retry::{is_retryable, RetryPolicy};
