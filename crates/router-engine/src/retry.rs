use std::future::Future;
use std::time::Duration;

use router_common::{ErrorKind, RouterError};
use router_provider::{StreamEvent, TypedResponse};
use router_tracing::{SpanKind, SpanStatus, Tracer};

use crate::context::{RequestContext, KEY_NUMBER_OF_RETRIES};

/// Exponential backoff with a cap. No jitter: the choice of curve is
/// implementation-defined, as long as it is exponential with a cap.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(20);
        let millis = (self.base_backoff.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(millis).min(self.max_backoff)
    }
}

/// Transport/rate-limit classification: internal-flagged
/// errors and `RequestCancelled` are never retried regardless of kind.
pub fn is_retryable(err: &RouterError) -> bool {
    if err.internal || err.kind == ErrorKind::RequestCancelled {
        return false;
    }
    err.kind.is_retryable()
}

const STALE_CONNECTION_PATTERNS: &[&str] = &[
    "cannot find whitespace in the first line of response",
    "connection reset by peer",
    "EOF",
];

/// The standalone stale-connection retry policy for the HTTP layer:
/// retry at most once, only on the first attempt, only for a fixed
/// lexicon of transport messages.
pub fn classify_stale_connection(attempt: u32, message: Option<&str>) -> (bool, bool) {
    if attempt != 1 {
        return (false, false);
    }
    match message {
        Some(msg) if STALE_CONNECTION_PATTERNS.iter().any(|p| msg.contains(p)) => (true, true),
        _ => (false, false),
    }
}

/// Attempt accounting plus tracing-span management around one provider
/// call.
pub struct RetryExecutor {
    policy: RetryPolicy,
    tracer: Tracer,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy, tracer: Tracer) -> Self {
        Self { policy, tracer }
    }

    fn span_name(attempt: u32) -> String {
        if attempt == 0 {
            "llm.call".to_string()
        } else {
            format!("retry.attempt.{attempt}")
        }
    }

    /// Runs a unary provider call up to `maxRetries+1` times.
    pub async fn run_unary<F, Fut>(
        &self,
        ctx: &RequestContext,
        provider_name: &str,
        request_model: &str,
        request_type: &str,
        mut call: F,
    ) -> Result<TypedResponse, RouterError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<TypedResponse, RouterError>>,
    {
        let mut attempt = 0u32;
        loop {
            ctx.set_reserved(KEY_NUMBER_OF_RETRIES, attempt).await;
            if attempt > 0 {
                let wait = self.policy.backoff(attempt - 1);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {},
                    _ = ctx.cancelled() => return Err(RouterError::cancelled()),
                }
            }

            let kind = if attempt == 0 { SpanKind::LlmCall } else { SpanKind::Retry };
            let span = self.tracer.start_span(&Self::span_name(attempt), kind);
            self.tracer.set_attribute(&span, "provider_name", provider_name);
            self.tracer.populate_llm_request_attributes(&span, request_model);
            self.tracer.set_attribute(&span, "request_type", request_type);
            if attempt > 0 {
                self.tracer.set_attribute_u64(&span, "retry_count", attempt as u64);
            }

            let result = call().await;
            match result {
                Ok(resp) => {
                    self.tracer.end_span(&span, SpanStatus::Ok, "");
                    return Ok(resp);
                }
                Err(err) => {
                    let retry = is_retryable(&err) && attempt < self.policy.max_retries;
                    self.tracer.end_span(&span, SpanStatus::Error, &err.message);
                    if !retry {
                        return Err(err);
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// Streaming variant: on success, the span is handed to the tracer's
    /// deferred-span store under `traceId` rather than ended here, so the
    /// streaming task can end it on stream termination — the span must
    /// not be ended here.
    pub async fn run_streaming<F, Fut>(
        &self,
        ctx: &RequestContext,
        trace_id: &str,
        provider_name: &str,
        request_model: &str,
        request_type: &str,
        mut call: F,
    ) -> Result<tokio::sync::mpsc::Receiver<StreamEvent>, RouterError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<tokio::sync::mpsc::Receiver<StreamEvent>, RouterError>>,
    {
        let mut attempt = 0u32;
        loop {
            ctx.set_reserved(KEY_NUMBER_OF_RETRIES, attempt).await;
            if attempt > 0 {
                let wait = self.policy.backoff(attempt - 1);
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {},
                    _ = ctx.cancelled() => return Err(RouterError::cancelled()),
                }
            }

            let kind = if attempt == 0 { SpanKind::LlmCall } else { SpanKind::Retry };
            let span = self.tracer.start_span(&Self::span_name(attempt), kind);
            self.tracer.set_attribute(&span, "provider_name", provider_name);
            self.tracer.populate_llm_request_attributes(&span, request_model);
            self.tracer.set_attribute(&span, "request_type", request_type);
            if attempt > 0 {
                self.tracer.set_attribute_u64(&span, "retry_count", attempt as u64);
            }

            let result = call().await;
            match result {
                Ok(rx) => {
                    self.tracer.store_deferred_span(trace_id.to_string(), span).await;
                    return Ok(rx);
                }
                Err(err) => {
                    let retry = is_retryable(&err) && attempt < self.policy.max_retries;
                    self.tracer.end_span(&span, SpanStatus::Error, &err.message);
                    if !retry {
                        return Err(err);
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn request_cancelled_is_attempted_exactly_once() {
        let attempts = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(policy(2), Tracer::new());
        let ctx = RequestContext::new();
        let attempts_clone = attempts.clone();
        let result = executor
            .run_unary(&ctx, "p", "m", "chat", move || {
                attempts_clone.fetch_add(1, Ordering::SeqCst);
                async { Err(RouterError::cancelled()) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rate_limit_retries_up_to_max_retries_plus_one() {
        let attempts = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(policy(2), Tracer::new());
        let ctx = RequestContext::new();
        let attempts_clone = attempts.clone();
        let result = executor
            .run_unary(&ctx, "p", "m", "chat", move || {
                attempts_clone.fetch_add(1, Ordering::SeqCst);
                async { Err(RouterError::new(ErrorKind::RateLimit, "429")) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn plain_provider_error_is_attempted_exactly_once() {
        let attempts = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(policy(2), Tracer::new());
        let ctx = RequestContext::new();
        let attempts_clone = attempts.clone();
        let result = executor
            .run_unary(&ctx, "p", "m", "chat", move || {
                attempts_clone.fetch_add(1, Ordering::SeqCst);
                async { Err(RouterError::new(ErrorKind::ProviderApiError, "400").with_status(400)) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn success_after_retries_returns_response() {
        let attempts = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(policy(2), Tracer::new());
        let ctx = RequestContext::new();
        let attempts_clone = attempts.clone();
        let result = executor
            .run_unary(&ctx, "p", "m", "chat", move || {
                let n = attempts_clone.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(RouterError::new(ErrorKind::ProviderNetworkError, "reset"))
                    } else {
                        Ok(TypedResponse {
                            payload: serde_json::json!({"content": "hi"}),
                            raw_response: None,
                        })
                    }
                }
            })
            .await;
        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn stale_connection_policy_matches_property_12() {
        assert_eq!(classify_stale_connection(1, Some("EOF")), (true, true));
        assert_eq!(
            classify_stale_connection(1, Some("connection reset by peer")),
            (true, true)
        );
        assert_eq!(classify_stale_connection(2, Some("EOF")), (false, false));
        assert_eq!(classify_stale_connection(1, Some("timeout")), (false, false));
        assert_eq!(classify_stale_connection(1, None), (false, false));
    }
}
