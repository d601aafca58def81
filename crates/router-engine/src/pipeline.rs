use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use router_common::RouterError;
use router_provider::{StreamEvent, TypedRequest, TypedResponse};
use router_tracing::{SpanHandle, SpanStatus, Tracer};

use crate::context::RequestContext;

/// What a PreHook produced: a result/variant, never a sentinel value.
pub enum HookOutcome {
    Continue(TypedRequest),
    ShortCircuitResponse(TypedResponse),
    ShortCircuitStream(mpsc::Receiver<StreamEvent>),
    ShortCircuitError(RouterError),
}

/// What a PostHook produced: may recover an error into a response,
/// invalidate a response into an error, or transform either.
pub struct PostHookResult {
    pub response: Option<TypedResponse>,
    pub error: Option<RouterError>,
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    async fn pre_hook(
        &self,
        ctx: &RequestContext,
        req: TypedRequest,
    ) -> Result<HookOutcome, RouterError>;

    async fn post_hook(
        &self,
        ctx: &RequestContext,
        response: Option<TypedResponse>,
        error: Option<RouterError>,
    ) -> Result<PostHookResult, RouterError>;

    /// Invoked exactly once after a CAS-successful replace in the plugins
    /// registry.
    async fn cleanup(&self) {}
}

#[derive(Debug, Clone, Default)]
pub struct PostHookStats {
    pub total_duration: Duration,
    pub invocations: u64,
    pub errors: u64,
}

/// One request's (or one stream's) run through the ordered plugin set.
/// Built fresh per request from a registry snapshot; pooling it is an
/// optimization left optional.
pub struct PluginPipeline {
    plugins: Vec<Arc<dyn Plugin>>,
    executed: usize,
    /// First-seen-ordered per-plugin streaming stats: accumulates
    /// per-plugin {totalDuration, invocations, errors, firstSeenOrder}.
    /// A `Vec` rather than a map preserves insertion order without a
    /// second index.
    stream_stats: Mutex<Vec<(String, PostHookStats)>>,
}

impl PluginPipeline {
    pub fn new(plugins: Vec<Arc<dyn Plugin>>) -> Self {
        Self {
            plugins,
            executed: 0,
            stream_stats: Mutex::new(Vec::new()),
        }
    }

    pub fn executed_count(&self) -> usize {
        self.executed
    }

    /// Runs PreHooks in registered order. Stops at the first
    /// short-circuit and remembers how many ran, so PostHooks later only
    /// traverse the executed prefix. A hook-level error (distinct from an
    /// error *inside* the request/response) is logged and does not stop
    /// the pipeline.
    pub async fn run_pre_hooks(&mut self, ctx: &RequestContext, req: TypedRequest) -> HookOutcome {
        ctx.enter_restricted_writes();
        let mut current = req;
        for plugin in &self.plugins {
            match plugin.pre_hook(ctx, current.clone()).await {
                Ok(HookOutcome::Continue(next)) => {
                    current = next;
                    self.executed += 1;
                }
                Ok(outcome) => {
                    self.executed += 1;
                    ctx.exit_restricted_writes();
                    return outcome;
                }
                Err(err) => {
                    tracing::warn!(plugin = plugin.name(), error = %err, "pre_hook returned an error; continuing");
                    self.executed += 1;
                }
            }
        }
        ctx.exit_restricted_writes();
        HookOutcome::Continue(current)
    }

    /// Runs PostHooks in reverse order over the executed prefix. Applies
    /// the final "empty-by-value error + present response ⇒ recovery"
    /// rule once all hooks have run.
    pub async fn run_post_hooks(
        &self,
        ctx: &RequestContext,
        response: Option<TypedResponse>,
        error: Option<RouterError>,
    ) -> (Option<TypedResponse>, Option<RouterError>) {
        ctx.enter_restricted_writes();
        let mut resp = response;
        let mut err = error;
        for plugin in self.plugins[..self.executed].iter().rev() {
            match plugin.post_hook(ctx, resp.clone(), err.clone()).await {
                Ok(result) => {
                    resp = result.response;
                    err = result.error;
                }
                Err(hook_err) => {
                    tracing::warn!(plugin = plugin.name(), error = %hook_err, "post_hook returned an error; continuing");
                }
            }
        }
        ctx.exit_restricted_writes();
        if let Some(e) = &err {
            if e.is_empty_by_value() && resp.is_some() {
                err = None;
            }
        }
        (resp, err)
    }

    /// Runs the same PostHooks over one stream chunk, accumulating
    /// per-plugin duration/invocation/error stats instead of opening a
    /// span per chunk.
    pub async fn run_post_hooks_chunk(&self, ctx: &RequestContext, event: StreamEvent) -> StreamEvent {
        ctx.enter_restricted_writes();
        let mut resp = event.payload.clone().map(|payload| TypedResponse {
            payload,
            raw_response: None,
        });
        let mut err = event.error.clone();

        for plugin in self.plugins[..self.executed].iter().rev() {
            let start = Instant::now();
            let outcome = plugin.post_hook(ctx, resp.clone(), err.clone()).await;
            let elapsed = start.elapsed();

            let mut stats = self.stream_stats.lock().await;
            let is_err = outcome.is_err();
            match stats.iter_mut().find(|(name, _)| name == plugin.name()) {
                Some((_, s)) => {
                    s.total_duration += elapsed;
                    s.invocations += 1;
                    if is_err {
                        s.errors += 1;
                    }
                }
                None => stats.push((
                    plugin.name().to_string(),
                    PostHookStats {
                        total_duration: elapsed,
                        invocations: 1,
                        errors: if is_err { 1 } else { 0 },
                    },
                )),
            }

            match outcome {
                Ok(result) => {
                    resp = result.response;
                    err = result.error;
                }
                Err(hook_err) => {
                    tracing::warn!(plugin = plugin.name(), error = %hook_err, "post_hook returned an error on a stream chunk; continuing");
                }
            }
        }
        ctx.exit_restricted_writes();

        StreamEvent {
            index: event.index,
            payload: resp.map(|r| r.payload),
            error: err,
            finish_reason: event.finish_reason,
            stream_end: event.stream_end,
        }
    }

    /// At stream end, walks plugins in registered order building nested
    /// spans (each a child of the previous), so the first-registered
    /// plugin is outermost. `stream_stats` itself is filled in
    /// first-*completed* order by `run_post_hooks_chunk`, which walks the
    /// executed prefix back to front — reversing it here recovers
    /// registration order. Ends spans in reverse order. Returns the
    /// number of spans created.
    pub async fn finalize_stream(&self, tracer: &Tracer, root: &SpanHandle) -> usize {
        let stats = self.stream_stats.lock().await;
        let mut spans: Vec<SpanHandle> = Vec::with_capacity(stats.len());
        let mut parent = root.clone();
        for (name, s) in stats.iter().rev() {
            let span = tracer.start_child_span(&parent, name);
            tracer.set_attribute_u64(&span, "invocations", s.invocations);
            let avg_ms = if s.invocations > 0 {
                s.total_duration.as_millis() as f64 / s.invocations as f64
            } else {
                0.0
            };
            tracer.set_attribute_f64(&span, "avg_duration_ms", avg_ms);
            tracer.set_attribute_u64(&span, "total_duration_ms", s.total_duration.as_millis() as u64);
            tracer.set_attribute_u64(&span, "error_count", s.errors);
            parent = span.clone();
            spans.push(span);
        }
        let count = spans.len();
        for span in spans.into_iter().rev() {
            tracer.end_span(&span, SpanStatus::Ok, "");
        }
        count
    }
}
