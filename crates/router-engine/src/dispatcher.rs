use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use router_common::{ErrorKind, EngineConfig, ExtraFields, RouterError};
use router_mcp::{McpClient, NoopMcp};
use router_provider::{
    Account, Key, ModelInfo, StreamEvent, TypedRequest, TypedResponse, UpstreamProvider,
};
use router_tracing::{SpanKind, SpanStatus, Tracer};

use crate::context::{
    RequestContext, KEY_FALLBACK_INDEX, KEY_FALLBACK_REQUEST_ID, KEY_REQUEST_ID, KEY_STREAM_END,
    KEY_STREAM_START_TS, KEY_TRACE_ID,
};
use crate::key_selection::{KeySelector, WeightedRandomKeySelector};
use crate::pipeline::{HookOutcome, Plugin, PluginPipeline};
use crate::queue::{ChannelMessage, ProviderQueue, ResultSlot, WorkerWaitGroup};
use crate::registry::{PluginsRegistry, ProvidersRegistry, RegistryError};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::worker::{self, WorkerConfig};

/// Result of `ListAllModels`: the sorted union of every
/// provider's models plus the fan-out's wall-clock latency ("aggregate
/// latency >= max(per-provider latency)", scenario S6).
#[derive(Debug, Clone)]
pub struct AggregatedModelsResponse {
    pub models: Vec<ModelInfo>,
    pub latency: Duration,
}

/// Everything the dispatcher needs to keep alive for one active provider
///: the queue, its WaitGroup, and the
/// worker-facing config snapshot workers were spawned with.
struct ProviderRuntime {
    queue: Arc<ProviderQueue>,
    wg: WorkerWaitGroup,
}

fn spawn_workers(queue: &Arc<ProviderQueue>, wg: &WorkerWaitGroup, cfg: &Arc<WorkerConfig>, n: usize) {
    for _ in 0..n.max(1) {
        tokio::spawn(worker::run(queue.clone(), wg.clone(), cfg.clone()));
    }
}

/// A placeholder credential for ops that don't need one (`ListModels`) or
/// for ambient-credential providers.
fn ambient_key() -> Key {
    Key {
        id: String::new(),
        name: String::new(),
        value: String::new(),
        weight: 0.0,
        enabled: true,
        models: Vec::new(),
        use_for_batch_api: false,
        deployments: Default::default(),
    }
}

fn config_error(message: impl Into<String>) -> RouterError {
    RouterError::new(ErrorKind::ConfigurationError, message)
}

/// Names the attempted provider/model/request type on an error regardless
/// of where in `tryRequest`/`tryStreamRequest` it originated: a
/// fallback's error still identifies its own attempt, not the primary's.
fn stamp_error_source(mut err: RouterError, provider: &str, model: &str, request_type: &'static str) -> RouterError {
    err.extra.provider = Some(provider.to_string());
    err.extra.model_requested = Some(model.to_string());
    err.extra.request_type = Some(request_type.to_string());
    err
}

/// `allowFallbacks == None` is treated as `true`;
/// `RequestCancelled` never falls back regardless of the flag.
fn allows_fallback(err: &RouterError) -> bool {
    !err.kind.never_falls_back() && err.allow_fallbacks()
}

/// The public entrypoint layer: validates typed requests,
/// owns the plugin pipeline invocation, walks the primary/fallback chain,
/// and enqueues onto each provider's `ProviderQueue`. Also owns the
/// per-provider queue lifecycle and hot-reload protocol,
/// since that lifecycle only has one owner in this design — there is no
/// separate "provider manager" object.
pub struct Dispatcher {
    account: Arc<dyn Account>,
    providers: ProvidersRegistry,
    plugins: PluginsRegistry,
    key_selector: Arc<dyn KeySelector>,
    mcp: Arc<dyn McpClient>,
    tracer: Tracer,
    config: EngineConfig,
    runtimes: RwLock<HashMap<String, Arc<ProviderRuntime>>>,
    /// Per-provider RWMutex guarding structural transitions, lazily
    /// created and never removed — cheap, and avoids a second CAS dance
    /// just to manage the locks.
    provider_locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
    root_cancel: CancellationToken,
    default_context: Arc<RequestContext>,
    shutting_down: AtomicBool,
}

impl Dispatcher {
    pub fn new(account: Arc<dyn Account>, config: EngineConfig) -> Self {
        let root_cancel = CancellationToken::new();
        let default_context = Arc::new(RequestContext::child_of(&root_cancel));
        Self {
            account,
            providers: ProvidersRegistry::new(),
            plugins: PluginsRegistry::new(),
            key_selector: Arc::new(WeightedRandomKeySelector),
            mcp: Arc::new(NoopMcp),
            tracer: Tracer::new(),
            config,
            runtimes: RwLock::new(HashMap::new()),
            provider_locks: Mutex::new(HashMap::new()),
            root_cancel,
            default_context,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn with_key_selector(mut self, selector: Arc<dyn KeySelector>) -> Self {
        self.key_selector = selector;
        self
    }

    pub fn with_mcp(mut self, mcp: Arc<dyn McpClient>) -> Self {
        self.mcp = mcp;
        self
    }

    pub fn with_tracer(mut self, tracer: Tracer) -> Self {
        self.tracer = tracer;
        self
    }

    /// Registers a `Provider` capability under its own name. Does not
    /// create a queue or spawn workers — that happens lazily on first
    /// use.
    pub async fn register_provider(&self, provider: Arc<dyn UpstreamProvider>) -> Result<(), RegistryError> {
        self.providers.upsert(provider.name(), provider)
    }

    /// `ReloadPlugin`: upserts by name, CAS-replacing the
    /// plugins slice; the replaced instance's `Cleanup` runs exactly once.
    pub async fn reload_plugin(&self, name: &str, plugin: Arc<dyn Plugin>) -> Result<(), RegistryError> {
        self.plugins.upsert(name, plugin).await
    }

    pub async fn remove_plugin(&self, name: &str) -> Result<(), RegistryError> {
        self.plugins.remove(name).await
    }

    async fn provider_lock(&self, name: &str) -> Arc<RwLock<()>> {
        let mut locks = self.provider_locks.lock().await;
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    /// Lazy creation under a per-provider RWMutex with double-checked
    /// locking.
    async fn prepare_provider(&self, name: &str) -> Result<Arc<ProviderRuntime>, RouterError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(RouterError::new(ErrorKind::ProviderShuttingDown, "dispatcher is shutting down"));
        }
        if let Some(rt) = self.runtimes.read().await.get(name).cloned() {
            return Ok(rt);
        }
        let lock = self.provider_lock(name).await;
        let _guard = lock.write().await;
        if let Some(rt) = self.runtimes.read().await.get(name).cloned() {
            return Ok(rt);
        }
        let runtime = self.build_runtime(name).await?;
        self.runtimes.write().await.insert(name.to_string(), runtime.clone());
        Ok(runtime)
    }

    async fn build_runtime(&self, name: &str) -> Result<Arc<ProviderRuntime>, RouterError> {
        let provider = self
            .providers
            .get(name)
            .ok_or_else(|| config_error(format!("provider not registered: {name}")))?
            .provider
            .clone();
        let account_cfg = self
            .account
            .config_for_provider(name)
            .await
            .map_err(|e| config_error(e.to_string()))?;
        let keys = self
            .account
            .keys_for_provider(name)
            .await
            .map_err(|e| config_error(e.to_string()))?;

        let queue = Arc::new(ProviderQueue::new(account_cfg.concurrency_and_buffer_size.buffer_size));
        let wg = WorkerWaitGroup::new();
        let retry = Arc::new(RetryExecutor::new(
            RetryPolicy {
                max_retries: self.config.max_retries,
                base_backoff: self.config.retry_backoff_base,
                max_backoff: self.config.retry_backoff_cap,
            },
            self.tracer.clone(),
        ));
        let worker_cfg = Arc::new(WorkerConfig {
            provider_name: name.to_string(),
            provider,
            keys,
            selector: self.key_selector.clone(),
            retry,
            tracer: self.tracer.clone(),
        });
        spawn_workers(&queue, &wg, &worker_cfg, account_cfg.concurrency_and_buffer_size.concurrency);
        Ok(Arc::new(ProviderRuntime { queue, wg }))
    }

    /// The atomic queue-replacement transition:
    /// publish a new queue, signal the old one closing, transfer its
    /// buffered messages, close it, and join its WaitGroup before
    /// returning.
    pub async fn update_provider(&self, name: &str) -> Result<(), RouterError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(RouterError::new(ErrorKind::ProviderShuttingDown, "dispatcher is shutting down"));
        }
        let lock = self.provider_lock(name).await;
        let _guard = lock.write().await;

        let Some(old) = self.runtimes.read().await.get(name).cloned() else {
            drop(_guard);
            return self.prepare_provider(name).await.map(|_| ());
        };

        let new_runtime = self.build_runtime(name).await?;
        self.runtimes.write().await.insert(name.to_string(), new_runtime.clone());

        old.queue.signal_closing();
        transfer_buffered(&old.queue, &new_runtime.queue).await;
        old.queue.close_queue().await;
        old.wg.wait().await;
        Ok(())
    }

    /// `RemoveProvider`: signalClosing → closeQueue → wait
    /// workers → delete queue/waitgroup entries → CAS-remove from the
    /// providers slice.
    pub async fn remove_provider(&self, name: &str) -> Result<(), RouterError> {
        let lock = self.provider_lock(name).await;
        let _guard = lock.write().await;
        let Some(rt) = self.runtimes.write().await.remove(name) else {
            return Err(config_error(format!("provider not active: {name}")));
        };
        rt.queue.signal_closing();
        rt.queue.close_queue().await;
        rt.wg.wait().await;
        self.providers.remove(name).map_err(|err| match err {
            RegistryError::ContentionExceeded(n) => {
                RouterError::new(ErrorKind::ContentionExceeded, format!("CAS contention exceeded after {n} attempts"))
            }
            RegistryError::NotFound(name) => config_error(format!("provider not registered: {name}")),
        })
    }

    /// Cancels the root context, drains and closes every queue, joins
    /// every WaitGroup, then cleans up MCP, the tracer, and every
    /// registered plugin. Idempotent-ish: a second
    /// call finds an empty runtime map and simply no-ops the join loop.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        self.root_cancel.cancel();
        let runtimes: Vec<Arc<ProviderRuntime>> = self.runtimes.read().await.values().cloned().collect();
        for rt in &runtimes {
            rt.queue.signal_closing();
            rt.queue.close_queue().await;
        }
        for rt in &runtimes {
            rt.wg.wait().await;
        }
        self.runtimes.write().await.clear();
        self.mcp.cleanup().await;
        self.tracer.stop().await;
        for plugin in self.plugins.ordered_plugins() {
            plugin.cleanup().await;
        }
    }

    /// `Dispatcher` → core loop for unary request types: validate,
    /// resolve the fallback chain, enqueue, await the result.
    pub async fn dispatch_unary(
        &self,
        ctx: Option<Arc<RequestContext>>,
        request: TypedRequest,
    ) -> Result<TypedResponse, RouterError> {
        if let Err(field) = request.validate() {
            return Err(self.invalid_argument(&request, field));
        }
        let ctx = ctx.unwrap_or_else(|| self.default_context.clone());
        self.prime_context(&ctx).await;

        let primary_result = self.try_request(&ctx, request.clone()).await;
        let primary_err = match primary_result {
            Ok(resp) => return Ok(resp),
            Err(err) => {
                if !allows_fallback(&err) {
                    return Err(err);
                }
                err
            }
        };

        let fallbacks = request.fallbacks().to_vec();
        if fallbacks.is_empty() {
            return Err(primary_err);
        }

        for (i, fb) in fallbacks.iter().enumerate() {
            let idx = (i + 1) as u32;
            ctx.set_reserved(KEY_FALLBACK_INDEX, idx).await;
            ctx.set_reserved(KEY_FALLBACK_REQUEST_ID, router_common::new_request_id().0).await;
            let fb_request = request.with_provider_model(&fb.provider, &fb.model);

            let span = self.tracer.start_span("fallback", SpanKind::Fallback);
            match self.try_request(&ctx, fb_request).await {
                Ok(resp) => {
                    self.tracer.end_span(&span, SpanStatus::Ok, "");
                    return Ok(resp);
                }
                Err(err) => {
                    self.tracer.end_span(&span, SpanStatus::Error, &err.message);
                    if !allows_fallback(&err) {
                        return Err(err);
                    }
                }
            }
        }

        // Property 2: "If all fail, the returned error carries the
        // PRIMARY provider/model" — the primary error, untouched.
        Err(primary_err)
    }

    /// Streaming counterpart of `dispatch_unary`.
    pub async fn dispatch_stream(
        &self,
        ctx: Option<Arc<RequestContext>>,
        request: TypedRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, RouterError> {
        if let Err(field) = request.validate() {
            return Err(self.invalid_argument(&request, field));
        }
        let ctx = ctx.unwrap_or_else(|| self.default_context.clone());
        self.prime_context(&ctx).await;

        let primary_result = self.try_stream_request(&ctx, request.clone()).await;
        let primary_err = match primary_result {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                if !allows_fallback(&err) {
                    return Err(err);
                }
                err
            }
        };

        let fallbacks = request.fallbacks().to_vec();
        if fallbacks.is_empty() {
            return Err(primary_err);
        }

        for (i, fb) in fallbacks.iter().enumerate() {
            let idx = (i + 1) as u32;
            ctx.set_reserved(KEY_FALLBACK_INDEX, idx).await;
            ctx.set_reserved(KEY_FALLBACK_REQUEST_ID, router_common::new_request_id().0).await;
            let fb_request = request.with_provider_model(&fb.provider, &fb.model);

            let span = self.tracer.start_span("fallback", SpanKind::Fallback);
            match self.try_stream_request(&ctx, fb_request).await {
                Ok(stream) => {
                    self.tracer.end_span(&span, SpanStatus::Ok, "");
                    return Ok(stream);
                }
                Err(err) => {
                    self.tracer.end_span(&span, SpanStatus::Error, &err.message);
                    if !allows_fallback(&err) {
                        return Err(err);
                    }
                }
            }
        }

        Err(primary_err)
    }

    fn invalid_argument(&self, request: &TypedRequest, missing_field: &'static str) -> RouterError {
        RouterError::invalid_argument(format!("missing required field: {missing_field}")).with_extra(ExtraFields {
            request_type: Some(request.type_name().to_string()),
            provider: Some(request.provider().to_string()),
            model_requested: Some(request.model().to_string()),
            raw_request: None,
            raw_response: None,
        })
    }

    async fn prime_context(&self, ctx: &RequestContext) {
        ctx.set_reserved(KEY_FALLBACK_INDEX, 0u32).await;
        if ctx.get::<String>(KEY_REQUEST_ID).await.is_none() {
            ctx.set_reserved(KEY_REQUEST_ID, router_common::new_request_id().0).await;
        }
    }

    /// `tryRequest`: resolve the queue, let MCP augment the
    /// request, run PreHooks, enqueue, await the result, run PostHooks.
    /// Whatever error comes out — config, MCP, pipeline, or the provider
    /// call itself — is stamped with the provider/model actually attempted.
    async fn try_request(&self, ctx: &Arc<RequestContext>, request: TypedRequest) -> Result<TypedResponse, RouterError> {
        let provider_name = request.provider().to_string();
        let model = request.model().to_string();
        let request_type = request.type_name();
        self.try_request_inner(ctx, request)
            .await
            .map_err(|err| stamp_error_source(err, &provider_name, &model, request_type))
    }

    async fn try_request_inner(&self, ctx: &Arc<RequestContext>, request: TypedRequest) -> Result<TypedResponse, RouterError> {
        let provider_name = request.provider().to_string();
        let request_type = request.type_name();
        let runtime = self.prepare_provider(&provider_name).await?;
        let request = self.mcp.add_tools_to_request(request).await?;
        self.ensure_trace_id(ctx).await;

        let mut pipeline = PluginPipeline::new(self.plugins.ordered_plugins());
        let outcome = pipeline.run_pre_hooks(ctx, request).await;

        let (response, error) = match outcome {
            HookOutcome::Continue(req) => self.enqueue_and_await_unary(&runtime, ctx, req).await,
            HookOutcome::ShortCircuitResponse(resp) => (Some(resp), None),
            HookOutcome::ShortCircuitError(err) => (None, Some(err)),
            HookOutcome::ShortCircuitStream(_) => (
                None,
                Some(config_error("a plugin short-circuited a unary request with a stream")),
            ),
        };

        let (response, error) = self.run_agentic_loop(request_type, response, error).await;

        let (response, error) = pipeline.run_post_hooks(ctx, response, error).await;
        match (response, error) {
            (Some(resp), _) => Ok(resp),
            (None, Some(err)) => Err(err),
            (None, None) => Err(config_error("pipeline produced neither a response nor an error")),
        }
    }

    /// MCP's post-response agentic tool-call loop runs on the provider's
    /// raw response before PostHooks see it, and only for the two request
    /// types that carry a tool-call protocol (chat and the responses
    /// API). Any other outcome passes through untouched.
    async fn run_agentic_loop(
        &self,
        request_type: &'static str,
        response: Option<TypedResponse>,
        error: Option<RouterError>,
    ) -> (Option<TypedResponse>, Option<RouterError>) {
        let Some(resp) = response else {
            return (None, error);
        };
        if !matches!(request_type, "chat" | "responses") {
            return (Some(resp), error);
        }
        let TypedResponse { payload, raw_response } = resp;
        let agent_result = if request_type == "chat" {
            self.mcp.check_and_execute_agent_for_chat_request(payload).await
        } else {
            self.mcp.check_and_execute_agent_for_responses_request(payload).await
        };
        match agent_result {
            Ok(payload) => (Some(TypedResponse { payload, raw_response }), error),
            Err(err) => (None, Some(err)),
        }
    }

    async fn enqueue_and_await_unary(
        &self,
        runtime: &Arc<ProviderRuntime>,
        ctx: &Arc<RequestContext>,
        request: TypedRequest,
    ) -> (Option<TypedResponse>, Option<RouterError>) {
        let (tx, rx) = oneshot::channel();
        let msg = ChannelMessage {
            request,
            context: ctx.clone(),
            slot: ResultSlot::Unary(tx),
            pipeline: None,
        };
        if let Err(err) = runtime.queue.enqueue(msg, ctx, self.config.drop_excess_requests).await {
            return (None, Some(err));
        }
        match rx.await {
            Ok(Ok(resp)) => (Some(resp), None),
            Ok(Err(err)) => (None, Some(err)),
            Err(_) => (
                None,
                Some(RouterError::new(ErrorKind::ProviderShuttingDown, "worker dropped the response channel")),
            ),
        }
    }

    /// `tryStreamRequest`: same shape as `tryRequest`, but the
    /// pipeline is handed to the worker so it can PostHook every chunk,
    /// and short-circuit outcomes are themselves turned into chunk
    /// streams so PostHooks still run over them.
    async fn try_stream_request(
        &self,
        ctx: &Arc<RequestContext>,
        request: TypedRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, RouterError> {
        let provider_name = request.provider().to_string();
        let model = request.model().to_string();
        let request_type = request.type_name();
        self.try_stream_request_inner(ctx, request)
            .await
            .map_err(|err| stamp_error_source(err, &provider_name, &model, request_type))
    }

    async fn try_stream_request_inner(
        &self,
        ctx: &Arc<RequestContext>,
        request: TypedRequest,
    ) -> Result<mpsc::Receiver<StreamEvent>, RouterError> {
        let provider_name = request.provider().to_string();
        let runtime = self.prepare_provider(&provider_name).await?;
        let request = self.mcp.add_tools_to_request(request).await?;
        self.ensure_trace_id(ctx).await;
        ctx.set_reserved(KEY_STREAM_START_TS, Instant::now()).await;

        let mut pipeline = PluginPipeline::new(self.plugins.ordered_plugins());
        let outcome = pipeline.run_pre_hooks(ctx, request).await;
        let pipeline = Arc::new(Mutex::new(pipeline));

        match outcome {
            HookOutcome::Continue(req) => self.enqueue_and_await_stream(&runtime, ctx, req, pipeline).await,
            HookOutcome::ShortCircuitStream(inner) => Ok(self.wrap_short_circuit(ctx, inner, pipeline).await),
            HookOutcome::ShortCircuitResponse(resp) => {
                Ok(self.wrap_short_circuit(ctx, singleton_stream(resp), pipeline).await)
            }
            HookOutcome::ShortCircuitError(err) => self.recover_stream_error(ctx, err, pipeline).await,
        }
    }

    async fn ensure_trace_id(&self, ctx: &RequestContext) {
        if ctx.get::<String>(KEY_TRACE_ID).await.is_none() {
            ctx.set_reserved(KEY_TRACE_ID, router_common::new_request_id().0).await;
        }
    }

    async fn enqueue_and_await_stream(
        &self,
        runtime: &Arc<ProviderRuntime>,
        ctx: &Arc<RequestContext>,
        request: TypedRequest,
        pipeline: Arc<Mutex<PluginPipeline>>,
    ) -> Result<mpsc::Receiver<StreamEvent>, RouterError> {
        let (tx, rx) = oneshot::channel();
        let msg = ChannelMessage {
            request,
            context: ctx.clone(),
            slot: ResultSlot::Streaming(tx),
            pipeline: Some(pipeline.clone()),
        };
        if let Err(err) = runtime.queue.enqueue(msg, ctx, self.config.drop_excess_requests).await {
            return self.recover_stream_error(ctx, err, pipeline).await;
        }
        match rx.await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(err)) => self.recover_stream_error(ctx, err, pipeline).await,
            Err(_) => {
                let err = RouterError::new(ErrorKind::ProviderShuttingDown, "worker dropped the stream channel");
                self.recover_stream_error(ctx, err, pipeline).await
            }
        }
    }

    /// Streaming error path: mark the stream-end indicator, run PostHooks
    /// on the error for final recovery, and either surface the (possibly
    /// transformed) error or hand back a singleton-chunk channel built
    /// from the recovered response.
    async fn recover_stream_error(
        &self,
        ctx: &RequestContext,
        err: RouterError,
        pipeline: Arc<Mutex<PluginPipeline>>,
    ) -> Result<mpsc::Receiver<StreamEvent>, RouterError> {
        ctx.set_reserved(KEY_STREAM_END, true).await;
        let (resp, err) = {
            let p = pipeline.lock().await;
            p.run_post_hooks(ctx, None, Some(err)).await
        };
        match (resp, err) {
            (Some(resp), _) => Ok(singleton_stream(resp)),
            (None, Some(err)) => Err(err),
            (None, None) => Err(config_error("pipeline produced neither a response nor an error")),
        }
    }

    /// Runs a short-circuited stream (or a synthesized singleton-response
    /// stream) through the same per-chunk PostHook + deferred-span
    /// finalize path a real provider stream takes, by
    /// pre-seeding a deferred span under this request's trace id and
    /// reusing the worker's chunk-forwarding loop.
    async fn wrap_short_circuit(
        &self,
        ctx: &RequestContext,
        inner: mpsc::Receiver<StreamEvent>,
        pipeline: Arc<Mutex<PluginPipeline>>,
    ) -> mpsc::Receiver<StreamEvent> {
        let trace_id = ctx.get::<String>(KEY_TRACE_ID).await.unwrap_or_else(|| "unknown".to_string());
        let span = self.tracer.start_span("plugin.short_circuit", SpanKind::Plugin);
        self.tracer.store_deferred_span(trace_id.clone(), span).await;

        let (out_tx, out_rx) = mpsc::channel(32);
        let tracer = self.tracer.clone();
        let cancel = ctx.cancellation_token();
        tokio::spawn(worker::forward_chunks(inner, out_tx, pipeline, tracer, trace_id, cancel));
        out_rx
    }

    /// `ListAllModels`: fan-out to every configured provider,
    /// paginate each up to `maxPaginationRequests`, skip "no keys"/
    /// "unsupported" errors, sort the merged models by id.
    pub async fn list_all_models(&self) -> AggregatedModelsResponse {
        let started = Instant::now();
        let provider_names = self.account.configured_providers().await;
        let fetches = provider_names.iter().map(|name| self.list_models_for_provider(name));
        let results = futures_util::future::join_all(fetches).await;

        let mut models = Vec::new();
        for (name, result) in provider_names.iter().zip(results) {
            match result {
                Ok(page) => models.extend(page),
                Err(err) => {
                    tracing::debug!(provider = %name, error = %err, "skipping provider in list_all_models");
                }
            }
        }
        models.sort_by(|a, b| a.id.cmp(&b.id));
        AggregatedModelsResponse {
            models,
            latency: started.elapsed(),
        }
    }

    async fn list_models_for_provider(&self, name: &str) -> Result<Vec<ModelInfo>, RouterError> {
        let entry = self
            .providers
            .get(name)
            .ok_or_else(|| config_error(format!("provider not registered: {name}")))?;
        let keys = self
            .account
            .keys_for_provider(name)
            .await
            .map_err(|e| config_error(e.to_string()))?;
        let key = keys.into_iter().find(|k| k.enabled).unwrap_or_else(ambient_key);

        let mut out = Vec::new();
        let mut page_token: Option<String> = None;
        for _ in 0..self.config.max_pagination_requests {
            let page = entry
                .provider
                .list_models(&key, page_token.as_deref(), self.config.default_page_size)
                .await?;
            out.extend(page.models);
            match page.next_page_token {
                Some(tok) => page_token = Some(tok),
                None => break,
            }
        }
        Ok(out)
    }
}

fn singleton_stream(resp: TypedResponse) -> mpsc::Receiver<StreamEvent> {
    let (tx, rx) = mpsc::channel(1);
    let _ = tx.try_send(StreamEvent {
        index: 0,
        payload: Some(resp.payload),
        error: None,
        finish_reason: Some("stop".to_string()),
        stream_end: true,
    });
    rx
}

/// Drain every message currently buffered in `old`, handing each to `new`
/// with a non-blocking reservation first; anything that doesn't fit
/// immediately is handed to a background task bounded by a 5s deadline.
async fn transfer_buffered(old: &Arc<ProviderQueue>, new: &Arc<ProviderQueue>) {
    let receiver = old.receiver_handle();
    loop {
        let msg = {
            let mut guard = receiver.lock().await;
            guard.try_recv()
        };
        let msg = match msg {
            Ok(msg) => msg,
            Err(_) => break,
        };
        let sender = new.sender_for_transfer();
        match sender.try_reserve() {
            Ok(permit) => permit.send(msg),
            Err(_) => {
                tokio::spawn(deliver_or_timeout(sender, msg, Duration::from_secs(5)));
            }
        }
    }
}

async fn deliver_or_timeout(sender: mpsc::Sender<ChannelMessage>, msg: ChannelMessage, deadline: Duration) {
    let expiry = Instant::now() + deadline;
    loop {
        match sender.try_reserve() {
            Ok(permit) => {
                permit.send(msg);
                return;
            }
            Err(TrySendError::Full(_)) => {
                if Instant::now() >= expiry {
                    deliver_transfer_timeout_error(msg).await;
                    return;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
            Err(TrySendError::Closed(_)) => {
                deliver_transfer_timeout_error(msg).await;
                return;
            }
        }
    }
}

/// The documented "request failed during provider concurrency update"
/// error.
async fn deliver_transfer_timeout_error(msg: ChannelMessage) {
    let err = RouterError::new(
        ErrorKind::ProviderShuttingDown,
        "request failed during provider concurrency update",
    );
    match msg.slot {
        ResultSlot::Unary(tx) => {
            let _ = tx.send(Err(err));
        }
        ResultSlot::Streaming(tx) => {
            let _ = tx.send(Err(err));
        }
    }
}
