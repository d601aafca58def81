use std::sync::Arc;
use std::time::Duration;

use router_common::RouterError;
use router_provider::{Key, Op, StreamEvent, TypedResponse, UpstreamProvider};
use router_tracing::Tracer;

use crate::context::{
    RequestContext, KEY_REQUESTED_KEY_NAME, KEY_SELECTED_KEY_ID, KEY_SELECTED_KEY_NAME,
    KEY_TRACE_ID,
};
use crate::key_selection::{resolve_multi_key, select_scalar_key, skip_key_selection, KeySelector};
use crate::queue::{ChannelMessage, ProviderQueue, ResultSlot, WorkerWaitGroup};
use crate::retry::RetryExecutor;

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything a worker needs that is stable across messages for its
/// provider. `keys` is a point-in-time snapshot; a fresh
/// `WorkerConfig` is installed whenever `UpdateProvider` runs.
pub struct WorkerConfig {
    pub provider_name: String,
    pub provider: Arc<dyn UpstreamProvider>,
    pub keys: Vec<Key>,
    pub selector: Arc<dyn KeySelector>,
    pub retry: Arc<RetryExecutor>,
    pub tracer: Tracer,
}

/// Spawns the consumer loop for one provider queue: workers spawn 1:1
/// with the queue's concurrency and exit when the queue is closed and
/// drained.
pub async fn run(queue: Arc<ProviderQueue>, wg: WorkerWaitGroup, cfg: Arc<WorkerConfig>) {
    wg.add(1);
    let receiver = queue.receiver_handle();
    loop {
        let msg = {
            let mut guard = receiver.lock().await;
            guard.recv().await
        };
        match msg {
            Some(msg) => {
                queue.begin_processing();
                process_message(&cfg, msg).await;
                queue.end_processing();
            }
            None => break,
        }
    }
    wg.done();
}

/// What key selection produced for one message: a single credential for
/// the scalar path, the full eligible set for a multi-key op, or
/// nothing when the op skips key selection entirely.
enum SelectedKeys {
    None,
    Scalar(Key),
    Multi(Vec<Key>),
}

impl SelectedKeys {
    /// The key whose id/name gets recorded on the context — the sole key
    /// for scalar ops, the first (lowest-id) key for multi-key ops.
    fn representative(&self) -> Option<&Key> {
        match self {
            SelectedKeys::Scalar(key) => Some(key),
            SelectedKeys::Multi(keys) => keys.first(),
            SelectedKeys::None => None,
        }
    }

    fn into_scalar_or_ambient(self) -> Key {
        match self {
            SelectedKeys::Scalar(key) => key,
            SelectedKeys::Multi(keys) => keys.into_iter().next().unwrap_or_else(ambient_key),
            SelectedKeys::None => ambient_key(),
        }
    }
}

async fn process_message(cfg: &WorkerConfig, msg: ChannelMessage) {
    let ChannelMessage {
        request,
        context,
        slot,
        pipeline,
    } = msg;

    let op = Op::from_request(&request);

    let keys = if op.requires_credential() && !skip_key_selection(request.provider()) {
        match select_keys(cfg, &context, &request, op).await {
            Ok(keys) => keys,
            Err(err) => {
                deliver_error(slot, err).await;
                return;
            }
        }
    } else {
        SelectedKeys::None
    };

    if let Some(k) = keys.representative() {
        context
            .set_reserved(KEY_SELECTED_KEY_ID, k.id.clone())
            .await;
        context
            .set_reserved(KEY_SELECTED_KEY_NAME, k.name.clone())
            .await;
    }

    match slot {
        ResultSlot::Unary(tx) => {
            let result = run_unary(cfg, &context, &request, op, keys).await;
            if tx.send(result).is_err() {
                tracing::debug!("receiver dropped before unary result delivery");
            }
        }
        ResultSlot::Streaming(tx) => {
            let key = keys.into_scalar_or_ambient();
            let result = run_streaming(cfg, &context, &request, op, &key, pipeline).await;
            if tx.send(result).is_err() {
                tracing::debug!("receiver dropped before stream handoff");
            }
        }
    }
}

async fn select_keys(
    cfg: &WorkerConfig,
    context: &RequestContext,
    request: &router_provider::TypedRequest,
    op: Op,
) -> Result<SelectedKeys, RouterError> {
    if op.uses_multi_key_resolver() {
        let resolved = resolve_multi_key(&cfg.keys, Some(request.model()), false);
        if resolved.is_empty() {
            return Err(RouterError::new(
                router_common::ErrorKind::ConfigurationError,
                "no enabled keys available for this multi-key operation",
            ));
        }
        return Ok(SelectedKeys::Multi(resolved));
    }
    let requested_name = context.get::<String>(KEY_REQUESTED_KEY_NAME).await;
    let key = select_scalar_key(
        &cfg.keys,
        request.provider(),
        request.model(),
        requested_name.as_deref(),
        cfg.selector.as_ref(),
    )
    .await?;
    Ok(SelectedKeys::Scalar(key))
}

/// Placeholder credential for ambient-auth providers that skip key
/// selection entirely — honored for a narrow allow-list of providers
/// with their own out-of-band credential source.
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

/// Multi-key ops (file/batch list, retrieve, delete, content, cancel,
/// results) hand the provider every eligible key at once via
/// `call_multi_key`, rather than the single credential the scalar path
/// resolves for every other op.
async fn run_unary(
    cfg: &WorkerConfig,
    ctx: &RequestContext,
    request: &router_provider::TypedRequest,
    op: Op,
    keys: SelectedKeys,
) -> Result<TypedResponse, RouterError> {
    let provider = cfg.provider.clone();
    let req = request.clone();

    match keys {
        SelectedKeys::Multi(keys) => {
            cfg.retry
                .run_unary(ctx, &cfg.provider_name, req.model(), req.type_name(), move || {
                    let provider = provider.clone();
                    let req = req.clone();
                    let keys = keys.clone();
                    async move { provider.call_multi_key(op, &keys, &req).await }
                })
                .await
        }
        other => {
            let key = other.into_scalar_or_ambient();
            cfg.retry
                .run_unary(ctx, &cfg.provider_name, req.model(), req.type_name(), move || {
                    let provider = provider.clone();
                    let req = req.clone();
                    let key = key.clone();
                    async move { provider.call(op, &key, &req).await }
                })
                .await
        }
    }
}

/// The worker owns the pipeline for the lifetime of the stream,
/// PostHooking every chunk as the provider produces it, then finalizing
/// aggregated spans at stream end. The worker returns as soon as the
/// provider hands back a channel: it does not await stream
/// completion itself, only spawns the forwarding task.
async fn run_streaming(
    cfg: &WorkerConfig,
    ctx: &RequestContext,
    request: &router_provider::TypedRequest,
    op: Op,
    key: &Key,
    pipeline: Option<Arc<tokio::sync::Mutex<crate::pipeline::PluginPipeline>>>,
) -> Result<tokio::sync::mpsc::Receiver<StreamEvent>, RouterError> {
    let provider = cfg.provider.clone();
    let req = request.clone();
    let key_owned = key.clone();
    let trace_id = ctx
        .get::<String>(KEY_TRACE_ID)
        .await
        .unwrap_or_else(|| "unknown".to_string());

    let inner = cfg
        .retry
        .run_streaming(
            ctx,
            &trace_id,
            &cfg.provider_name,
            req.model(),
            req.type_name(),
            move || {
                let provider = provider.clone();
                let req = req.clone();
                let key = key_owned.clone();
                async move { provider.call_stream(op, &key, &req).await }
            },
        )
        .await?;

    let Some(pipeline) = pipeline else {
        return Ok(inner);
    };

    let (out_tx, out_rx) = tokio::sync::mpsc::channel(32);
    let tracer = cfg.tracer.clone();
    let ctx_cancel = ctx.cancellation_token();
    tokio::spawn(forward_chunks(inner, out_tx, pipeline, tracer, trace_id, ctx_cancel));
    Ok(out_rx)
}

pub(crate) async fn forward_chunks(
    mut inner: tokio::sync::mpsc::Receiver<StreamEvent>,
    out_tx: tokio::sync::mpsc::Sender<StreamEvent>,
    pipeline: Arc<tokio::sync::Mutex<crate::pipeline::PluginPipeline>>,
    tracer: Tracer,
    trace_id: String,
    cancel: tokio_util::sync::CancellationToken,
) {
    let scratch_ctx = RequestContext::new();
    loop {
        tokio::select! {
            chunk = inner.recv() => {
                let Some(chunk) = chunk else { break };
                let processed = pipeline.lock().await.run_post_hooks_chunk(&scratch_ctx, chunk).await;
                let is_end = processed.stream_end;
                // Send-to-client selects add a 5-second timeout to avoid
                // indefinite blocking on a disconnected client.
                let sent = tokio::select! {
                    res = out_tx.send(processed) => res.is_ok(),
                    _ = tokio::time::sleep(SEND_TIMEOUT) => {
                        tracing::warn!("timed out sending a chunk to a disconnected client");
                        false
                    }
                };
                if !sent || is_end {
                    break;
                }
            }
            _ = cancel.cancelled() => {
                let terminal = StreamEvent {
                    index: u64::MAX,
                    payload: None,
                    error: Some(RouterError::cancelled()),
                    finish_reason: Some("cancelled".to_string()),
                    stream_end: true,
                };
                let _ = out_tx.send(terminal).await;
                break;
            }
        }
    }

    if let Some(span) = tracer.take_deferred_span(&trace_id).await {
        let count = pipeline.lock().await.finalize_stream(&tracer, &span).await;
        tracing::debug!(finalized_spans = count, "stream finalized");
        tracer.end_span(&span, router_tracing::SpanStatus::Ok, "");
    }
}

async fn deliver_error(slot: ResultSlot, err: RouterError) {
    match slot {
        ResultSlot::Unary(tx) => {
            let _ = tx.send(Err(err));
        }
        ResultSlot::Streaming(tx) => {
            let _ = tx.send(Err(err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use router_provider::TypedRequest;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::sync::oneshot;

    struct FlakyProvider {
        fail_times: AtomicU32,
    }

    #[async_trait]
    impl UpstreamProvider for FlakyProvider {
        fn name(&self) -> &'static str {
            "flaky"
        }
        fn supports(&self, _op: Op) -> bool {
            true
        }
        async fn call(&self, _op: Op, _key: &Key, _req: &TypedRequest) -> Result<TypedResponse, RouterError> {
            if self.fail_times.fetch_sub(1, Ordering::SeqCst) > 0 {
                Err(RouterError::new(router_common::ErrorKind::ProviderNetworkError, "reset"))
            } else {
                Ok(TypedResponse {
                    payload: serde_json::json!({"content": "hi"}),
                    raw_response: None,
                })
            }
        }
        async fn call_stream(
            &self,
            _op: Op,
            _key: &Key,
            _req: &TypedRequest,
        ) -> Result<tokio::sync::mpsc::Receiver<StreamEvent>, RouterError> {
            unimplemented!()
        }
    }

    fn test_config(fail_times: u32) -> WorkerConfig {
        WorkerConfig {
            provider_name: "flaky".into(),
            provider: Arc::new(FlakyProvider {
                fail_times: AtomicU32::new(fail_times),
            }),
            keys: vec![Key {
                id: "k1".into(),
                name: "k1".into(),
                value: "secret".into(),
                weight: 1.0,
                enabled: true,
                models: vec![],
                use_for_batch_api: false,
                deployments: Default::default(),
            }],
            selector: Arc::new(crate::key_selection::WeightedRandomKeySelector),
            retry: Arc::new(RetryExecutor::new(
                crate::retry::RetryPolicy {
                    max_retries: 2,
                    ..Default::default()
                },
                Tracer::new(),
            )),
            tracer: Tracer::new(),
        }
    }

    #[tokio::test]
    async fn process_message_selects_key_and_delivers_unary_result() {
        let cfg = test_config(1);
        let (tx, rx) = oneshot::channel();
        let msg = ChannelMessage {
            request: crate::tests_support::dummy_chat_request(),
            context: Arc::new(RequestContext::new()),
            slot: ResultSlot::Unary(tx),
            pipeline: None,
        };
        process_message(&cfg, msg).await;
        let result = rx.await.unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn queue_drains_to_worker_and_delivers_result() {
        let queue = Arc::new(ProviderQueue::new(4));
        let wg = WorkerWaitGroup::new();
        let cfg = Arc::new(test_config(0));

        let worker_queue = queue.clone();
        let worker_wg = wg.clone();
        let handle = tokio::spawn(run(worker_queue, worker_wg, cfg));

        let (tx, rx) = oneshot::channel();
        let ctx = RequestContext::new();
        queue
            .enqueue(
                ChannelMessage {
                    request: crate::tests_support::dummy_chat_request(),
                    context: Arc::new(RequestContext::new()),
                    slot: ResultSlot::Unary(tx),
                    pipeline: None,
                },
                &ctx,
                false,
            )
            .await
            .unwrap();

        let result = rx.await.unwrap();
        assert!(result.is_ok());

        queue.signal_closing();
        queue.close_queue().await;
        wg.wait().await;
        handle.await.unwrap();
    }

    struct MultiKeyRecordingProvider {
        seen_key_ids: tokio::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl UpstreamProvider for MultiKeyRecordingProvider {
        fn name(&self) -> &'static str {
            "files"
        }
        fn supports(&self, _op: Op) -> bool {
            true
        }
        async fn call(&self, _op: Op, _key: &Key, _req: &TypedRequest) -> Result<TypedResponse, RouterError> {
            panic!("a multi-key op must call call_multi_key, not call");
        }
        async fn call_multi_key(&self, _op: Op, keys: &[Key], _req: &TypedRequest) -> Result<TypedResponse, RouterError> {
            let mut seen = self.seen_key_ids.lock().await;
            *seen = keys.iter().map(|k| k.id.clone()).collect();
            Ok(TypedResponse {
                payload: serde_json::json!({"key_count": keys.len()}),
                raw_response: None,
            })
        }
        async fn call_stream(
            &self,
            _op: Op,
            _key: &Key,
            _req: &TypedRequest,
        ) -> Result<tokio::sync::mpsc::Receiver<StreamEvent>, RouterError> {
            unimplemented!()
        }
    }

    fn two_keys() -> Vec<Key> {
        vec![
            Key {
                id: "k-a".into(),
                name: "a".into(),
                value: "va".into(),
                weight: 1.0,
                enabled: true,
                models: vec![],
                use_for_batch_api: false,
                deployments: Default::default(),
            },
            Key {
                id: "k-b".into(),
                name: "b".into(),
                value: "vb".into(),
                weight: 1.0,
                enabled: true,
                models: vec![],
                use_for_batch_api: false,
                deployments: Default::default(),
            },
        ]
    }

    #[tokio::test]
    async fn multi_key_ops_are_dispatched_through_call_multi_key_with_every_eligible_key() {
        let provider = Arc::new(MultiKeyRecordingProvider {
            seen_key_ids: tokio::sync::Mutex::new(vec![]),
        });
        let cfg = WorkerConfig {
            provider_name: "files".into(),
            provider: provider.clone(),
            keys: two_keys(),
            selector: Arc::new(crate::key_selection::WeightedRandomKeySelector),
            retry: Arc::new(RetryExecutor::new(crate::retry::RetryPolicy::default(), Tracer::new())),
            tracer: Tracer::new(),
        };

        let request = TypedRequest::File(router_provider::FilePayload {
            provider: "files".into(),
            model: String::new(),
            fallbacks: vec![],
            op: router_provider::FileOp::List,
            file_id: None,
            body: None,
        });
        let (tx, rx) = oneshot::channel();
        let msg = ChannelMessage {
            request,
            context: Arc::new(RequestContext::new()),
            slot: ResultSlot::Unary(tx),
            pipeline: None,
        };
        process_message(&cfg, msg).await;
        let result = rx.await.unwrap().unwrap();
        assert_eq!(result.payload["key_count"], 2);
        assert_eq!(*provider.seen_key_ids.lock().await, vec!["k-a".to_string(), "k-b".to_string()]);
    }
}
