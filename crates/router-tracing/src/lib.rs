//! The Tracer capability, implemented over the `tracing` ecosystem
//! rather than a bespoke span type.
//!
//! `tracing::Span` is already a cheap-to-clone handle, so `SpanHandle` is
//! a thin newtype rather than a fresh abstraction.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::field::Empty;
use tracing::{Level, Span};

/// Span kinds used by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    LlmCall,
    Retry,
    Fallback,
    Plugin,
    Internal,
}

impl SpanKind {
    fn as_str(self) -> &'static str {
        match self {
            SpanKind::LlmCall => "llm_call",
            SpanKind::Retry => "retry",
            SpanKind::Fallback => "fallback",
            SpanKind::Plugin => "plugin",
            SpanKind::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanStatus {
    Ok,
    Error,
}

#[derive(Clone)]
pub struct SpanHandle {
    pub span: Span,
}

/// A thin tracer over `tracing::Span`s plus a deferred-span store keyed by
/// trace id, so a streaming goroutine can end a span opened by the retry
/// executor.
#[derive(Clone)]
pub struct Tracer {
    deferred: Arc<Mutex<HashMap<String, SpanHandle>>>,
}

impl Default for Tracer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracer {
    pub fn new() -> Self {
        Self {
            deferred: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn start_span(&self, name: &str, kind: SpanKind) -> SpanHandle {
        let span = tracing::span!(
            Level::INFO,
            "router_span",
            name = name,
            kind = kind.as_str(),
            status_code = Empty,
            error = Empty,
            invocations = Empty,
            avg_duration_ms = Empty,
            total_duration_ms = Empty,
            error_count = Empty,
            provider_name = Empty,
            request_type = Empty,
            retry_count = Empty,
            model = Empty,
        );
        SpanHandle { span }
    }

    /// Nested child span — used by the streaming PostHook finalizer to
    /// build `{invocations, avgDurationMs, totalDurationMs, errorCount}`
    /// spans nested in first-seen plugin order.
    pub fn start_child_span(&self, parent: &SpanHandle, name: &str) -> SpanHandle {
        let span = tracing::span!(
            parent: &parent.span,
            Level::INFO,
            "router_span",
            name = name,
            invocations = Empty,
            avg_duration_ms = Empty,
            total_duration_ms = Empty,
            error_count = Empty,
        );
        SpanHandle { span }
    }

    pub fn set_attribute(&self, handle: &SpanHandle, key: &str, value: &str) {
        handle.span.record(key, value);
    }

    pub fn set_attribute_u64(&self, handle: &SpanHandle, key: &str, value: u64) {
        handle.span.record(key, value);
    }

    pub fn set_attribute_f64(&self, handle: &SpanHandle, key: &str, value: f64) {
        handle.span.record(key, value);
    }

    pub fn end_span(&self, handle: &SpanHandle, status: SpanStatus, message: &str) {
        match status {
            SpanStatus::Ok => tracing::debug!(parent: &handle.span, "span ok"),
            SpanStatus::Error => tracing::warn!(parent: &handle.span, message, "span error"),
        }
    }

    /// LLM request attributes (messages, params) — attached when
    /// available.
    pub fn populate_llm_request_attributes(&self, handle: &SpanHandle, model: &str) {
        handle.span.record("model", model);
    }

    pub async fn store_deferred_span(&self, trace_id: impl Into<String>, handle: SpanHandle) {
        self.deferred.lock().await.insert(trace_id.into(), handle);
    }

    pub async fn take_deferred_span(&self, trace_id: &str) -> Option<SpanHandle> {
        self.deferred.lock().await.remove(trace_id)
    }

    pub async fn stop(&self) {
        self.deferred.lock().await.clear();
    }
}
