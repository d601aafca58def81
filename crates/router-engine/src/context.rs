use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use router_common::{ErrorKind, RouterError};

/// Reserved context keys. Plugins
/// may read any of these but may not *write* them while restricted-writes
/// is active (i.e. during pipeline execution).
pub const KEY_REQUEST_ID: &str = "request_id";
pub const KEY_FALLBACK_INDEX: &str = "fallback_index";
pub const KEY_FALLBACK_REQUEST_ID: &str = "fallback_request_id";
pub const KEY_SELECTED_KEY_ID: &str = "selected_key_id";
pub const KEY_SELECTED_KEY_NAME: &str = "selected_key_name";
pub const KEY_TRACER_HANDLE: &str = "tracer_handle";
pub const KEY_SPAN_ID: &str = "span_id";
pub const KEY_TRACE_ID: &str = "trace_id";
pub const KEY_STREAM_START_TS: &str = "stream_start_ts";
pub const KEY_STREAM_END: &str = "stream_end";
pub const KEY_POSTHOOK_FINALIZER: &str = "posthook_span_finalizer";
pub const KEY_SUPPRESS_RAW: &str = "suppress_raw";
pub const KEY_REQUESTED_KEY_NAME: &str = "requested_key_name";
pub const KEY_NUMBER_OF_RETRIES: &str = "number_of_retries";

const RESERVED_KEYS: &[&str] = &[
    KEY_REQUEST_ID,
    KEY_FALLBACK_INDEX,
    KEY_FALLBACK_REQUEST_ID,
    KEY_SELECTED_KEY_ID,
    KEY_SELECTED_KEY_NAME,
    KEY_TRACER_HANDLE,
    KEY_SPAN_ID,
    KEY_TRACE_ID,
    KEY_STREAM_START_TS,
    KEY_STREAM_END,
    KEY_POSTHOOK_FINALIZER,
    KEY_SUPPRESS_RAW,
    KEY_REQUESTED_KEY_NAME,
    KEY_NUMBER_OF_RETRIES,
];

fn is_reserved(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// A per-request key/value carrier plus a cancellation signal and a
/// "restricted writes" gate. Values are type-erased ("string → any")
/// and recovered with `get::<T>`.
pub struct RequestContext {
    values: RwLock<HashMap<String, Arc<dyn Any + Send + Sync>>>,
    cancel: CancellationToken,
    restricted_writes: AtomicBool,
}

impl RequestContext {
    pub fn new() -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
            restricted_writes: AtomicBool::new(false),
        }
    }

    /// A context derived from a root token, so `Shutdown`
    /// cancels every in-flight request by cancelling the root.
    pub fn child_of(root: &CancellationToken) -> Self {
        Self {
            values: RwLock::new(HashMap::new()),
            cancel: root.child_token(),
            restricted_writes: AtomicBool::new(false),
        }
    }

    pub async fn get<T: Clone + Send + Sync + 'static>(&self, key: &str) -> Option<T> {
        let values = self.values.read().await;
        values.get(key).and_then(|v| v.downcast_ref::<T>()).cloned()
    }

    /// Plugin-facing write: rejected for reserved keys while
    /// restricted-writes is active.
    pub async fn set<T: Send + Sync + 'static>(
        &self,
        key: &str,
        value: T,
    ) -> Result<(), RouterError> {
        if self.restricted_writes.load(Ordering::Acquire) && is_reserved(key) {
            return Err(RouterError::new(
                ErrorKind::ConfigurationError,
                format!("reserved context key cannot be written by a plugin: {key}"),
            ));
        }
        self.values
            .write()
            .await
            .insert(key.to_string(), Arc::new(value));
        Ok(())
    }

    /// Engine-internal write: bypasses the restricted-writes gate. Used by
    /// the dispatcher/worker/retry executor to set reserved keys.
    pub async fn set_reserved<T: Send + Sync + 'static>(&self, key: &'static str, value: T) {
        self.values
            .write()
            .await
            .insert(key.to_string(), Arc::new(value));
    }

    pub fn enter_restricted_writes(&self) {
        self.restricted_writes.store(true, Ordering::Release);
    }

    pub fn exit_restricted_writes(&self) {
        self.restricted_writes.store(false, Ordering::Release);
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn restricted_writes_reject_reserved_keys() {
        let ctx = RequestContext::new();
        ctx.enter_restricted_writes();
        let err = ctx.set(KEY_SELECTED_KEY_ID, "evil".to_string()).await;
        assert!(err.is_err());
        ctx.exit_restricted_writes();
        assert!(ctx.set(KEY_SELECTED_KEY_ID, "ok".to_string()).await.is_ok());
    }

    #[tokio::test]
    async fn non_reserved_keys_are_always_writable() {
        let ctx = RequestContext::new();
        ctx.enter_restricted_writes();
        assert!(ctx.set("plugin_scratch", 42u64).await.is_ok());
        assert_eq!(ctx.get::<u64>("plugin_scratch").await, Some(42));
    }

    #[tokio::test]
    async fn child_context_observes_root_cancellation() {
        let root = CancellationToken::new();
        let ctx = RequestContext::child_of(&root);
        assert!(!ctx.is_cancelled());
        root.cancel();
        assert!(ctx.is_cancelled());
    }
}
