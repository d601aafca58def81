//! Black-box end-to-end scenarios, driven
//! entirely through `Dispatcher`'s public surface rather than any
//! crate-internal type, alongside the `#[cfg(test)]` unit tests that
//! cover individual behaviors in isolation.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use router_common::{EngineConfig, ErrorKind, RouterError};
use router_engine::Dispatcher;
use router_provider::{
    Account, AccountError, ChatPayload, ConcurrencyAndBufferSize, Fallback, Key, Key as ProviderKey,
    ModelInfo, ModelListResponse, NetworkConfig, Op, ProviderConfig, StreamEvent, TypedRequest,
    TypedResponse, UpstreamProvider,
};

fn some_key(id: &str) -> Key {
    Key {
        id: id.into(),
        name: id.into(),
        value: "secret".into(),
        weight: 1.0,
        enabled: true,
        models: vec![],
        use_for_batch_api: false,
        deployments: Default::default(),
    }
}

fn chat(provider: &str, fallbacks: Vec<Fallback>) -> TypedRequest {
    TypedRequest::Chat(ChatPayload {
        provider: provider.to_string(),
        model: "m".to_string(),
        fallbacks,
        messages: serde_json::json!([{"role": "user", "content": "hi"}]),
    })
}

/// An `Account` whose per-provider concurrency/buffer sizing is
/// configurable, for the few scenarios (S4) that depend on it.
struct FixedAccount {
    providers: Vec<String>,
    sizing: ConcurrencyAndBufferSize,
}

impl FixedAccount {
    fn new(providers: &[&str]) -> Self {
        Self {
            providers: providers.iter().map(|p| p.to_string()).collect(),
            sizing: ConcurrencyAndBufferSize::default(),
        }
    }

    fn with_sizing(mut self, concurrency: usize, buffer_size: usize) -> Self {
        self.sizing = ConcurrencyAndBufferSize { concurrency, buffer_size };
        self
    }
}

#[async_trait]
impl Account for FixedAccount {
    async fn configured_providers(&self) -> Vec<String> {
        self.providers.clone()
    }

    async fn config_for_provider(&self, _id: &str) -> Result<ProviderConfig, AccountError> {
        Ok(ProviderConfig {
            network: NetworkConfig::default(),
            concurrency_and_buffer_size: self.sizing,
            custom_provider_config: None,
            proxy_config: None,
            send_back_raw_request: false,
            send_back_raw_response: false,
        })
    }

    async fn keys_for_provider(&self, _id: &str) -> Result<Vec<ProviderKey>, AccountError> {
        Ok(vec![some_key("k1")])
    }
}

/// S1: a provider that fails with HTTP 429 a fixed number of times, then
/// succeeds with the literal body from the scenario.
struct FlakyRateLimited {
    remaining_429s: AtomicU32,
    attempts: AtomicU32,
}

#[async_trait]
impl UpstreamProvider for FlakyRateLimited {
    fn name(&self) -> &'static str {
        "p"
    }
    fn supports(&self, _op: Op) -> bool {
        true
    }
    async fn call(&self, _op: Op, _key: &Key, _req: &TypedRequest) -> Result<TypedResponse, RouterError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.remaining_429s.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)).is_ok() {
            return Err(RouterError::new(ErrorKind::RateLimit, "rate limited").with_status(429));
        }
        Ok(TypedResponse {
            payload: serde_json::json!({"choices": [{"message": {"role": "assistant", "content": "hi"}}]}),
            raw_response: None,
        })
    }
    async fn call_stream(&self, _op: Op, _key: &Key, _req: &TypedRequest) -> Result<mpsc::Receiver<StreamEvent>, RouterError> {
        unimplemented!()
    }
}

#[tokio::test]
async fn s1_retries_twice_on_429_then_succeeds() {
    let provider = Arc::new(FlakyRateLimited {
        remaining_429s: AtomicU32::new(2),
        attempts: AtomicU32::new(0),
    });
    let dispatcher = Dispatcher::new(
        Arc::new(FixedAccount::new(&["p"])),
        EngineConfig {
            max_retries: 2,
            retry_backoff_base: Duration::from_millis(10),
            retry_backoff_cap: Duration::from_millis(10),
            ..Default::default()
        },
    );
    dispatcher.register_provider(provider.clone()).await.unwrap();

    let resp = dispatcher.dispatch_unary(None, chat("p", vec![])).await.unwrap();
    assert_eq!(resp.payload["choices"][0]["message"]["content"], "hi");
    assert_eq!(provider.attempts.load(Ordering::SeqCst), 3);
}

/// S2: primary errors 500; F1 errors 401 with `allowFallbacks=false`; F2
/// must never be attempted, and the caller sees F1's 401.
struct FixedError {
    name: &'static str,
    status: u16,
    allow_fallbacks: Option<bool>,
    calls: AtomicU32,
}

#[async_trait]
impl UpstreamProvider for FixedError {
    fn name(&self) -> &'static str {
        self.name
    }
    fn supports(&self, _op: Op) -> bool {
        true
    }
    async fn call(&self, _op: Op, _key: &Key, _req: &TypedRequest) -> Result<TypedResponse, RouterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut err = RouterError::new(ErrorKind::ProviderApiError, format!("{} failed", self.name)).with_status(self.status);
        err.allow_fallbacks = self.allow_fallbacks;
        Err(err)
    }
    async fn call_stream(&self, _op: Op, _key: &Key, _req: &TypedRequest) -> Result<mpsc::Receiver<StreamEvent>, RouterError> {
        unimplemented!()
    }
}

#[tokio::test]
async fn s2_veto_on_f1_stops_before_f2() {
    let primary = Arc::new(FixedError { name: "p", status: 500, allow_fallbacks: None, calls: AtomicU32::new(0) });
    let f1 = Arc::new(FixedError { name: "f1", status: 401, allow_fallbacks: Some(false), calls: AtomicU32::new(0) });
    let f2 = Arc::new(FixedError { name: "f2", status: 500, allow_fallbacks: None, calls: AtomicU32::new(0) });

    let dispatcher = Dispatcher::new(
        Arc::new(FixedAccount::new(&["p", "f1", "f2"])),
        EngineConfig { max_retries: 0, ..Default::default() },
    );
    dispatcher.register_provider(primary).await.unwrap();
    dispatcher.register_provider(f1.clone()).await.unwrap();
    dispatcher.register_provider(f2.clone()).await.unwrap();

    let req = chat("p", vec![
        Fallback { provider: "f1".into(), model: "m".into() },
        Fallback { provider: "f2".into(), model: "m".into() },
    ]);
    let err = dispatcher.dispatch_unary(None, req).await.unwrap_err();
    assert_eq!(err.status_code, Some(401));
    assert_eq!(err.extra.provider.as_deref(), Some("f1"));
    assert_eq!(f1.calls.load(Ordering::SeqCst), 1);
    assert_eq!(f2.calls.load(Ordering::SeqCst), 0);
}

/// A provider whose `call` blocks on a `Notify` until released, so a test
/// can hold a worker busy while more requests queue up behind it.
struct Blocking {
    gate: Arc<Notify>,
    calls: AtomicU32,
}

#[async_trait]
impl UpstreamProvider for Blocking {
    fn name(&self) -> &'static str {
        "p"
    }
    fn supports(&self, _op: Op) -> bool {
        true
    }
    async fn call(&self, _op: Op, _key: &Key, _req: &TypedRequest) -> Result<TypedResponse, RouterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.gate.notified().await;
        Ok(TypedResponse { payload: serde_json::json!({"ok": true}), raw_response: None })
    }
    async fn call_stream(&self, _op: Op, _key: &Key, _req: &TypedRequest) -> Result<mpsc::Receiver<StreamEvent>, RouterError> {
        unimplemented!()
    }
}

/// S4: `UpdateProvider` while messages are buffered/in-flight; all of
/// them eventually complete through the new queue/workers, none lost.
#[tokio::test]
async fn s4_update_provider_transfers_buffered_messages() {
    let gate = Arc::new(Notify::new());
    let provider = Arc::new(Blocking { gate: gate.clone(), calls: AtomicU32::new(0) });
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(FixedAccount::new(&["p"]).with_sizing(1, 8)),
        EngineConfig { max_retries: 0, ..Default::default() },
    ));
    dispatcher.register_provider(provider.clone()).await.unwrap();

    // Prime the one worker so it is blocked in `call`, then queue three
    // more behind it.
    let mut handles = Vec::new();
    for _ in 0..4 {
        let d = dispatcher.clone();
        handles.push(tokio::spawn(async move { d.dispatch_unary(None, chat("p", vec![])).await }));
    }
    tokio::time::sleep(Duration::from_millis(20)).await;

    dispatcher.update_provider("p").await.unwrap();

    gate.notify_waiters();
    // The in-flight call on the old queue already passed `notified()`
    // once; the buffered three run on the new queue's worker(s), which
    // also wait on the same gate, so keep notifying until all drain.
    for _ in 0..8 {
        gate.notify_waiters();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let mut ok_count = 0;
    for h in handles {
        if h.await.unwrap().is_ok() {
            ok_count += 1;
        }
    }
    assert_eq!(ok_count, 4, "all four requests must complete, none lost across the provider update");
}

/// A streaming provider that emits one chunk and then waits indefinitely
/// (until the receiving end is dropped), so a test can assert on
/// mid-stream shutdown behavior.
struct StallingStream;

#[async_trait]
impl UpstreamProvider for StallingStream {
    fn name(&self) -> &'static str {
        "p"
    }
    fn supports(&self, _op: Op) -> bool {
        true
    }
    async fn call(&self, _op: Op, _key: &Key, _req: &TypedRequest) -> Result<TypedResponse, RouterError> {
        unimplemented!()
    }
    async fn call_stream(&self, _op: Op, _key: &Key, _req: &TypedRequest) -> Result<mpsc::Receiver<StreamEvent>, RouterError> {
        let (tx, rx) = mpsc::channel(4);
        tokio::spawn(async move {
            let _ = tx
                .send(StreamEvent { index: 0, payload: Some(serde_json::json!("A")), error: None, finish_reason: None, stream_end: false })
                .await;
            // Never closes on its own; the test drives cancellation.
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        Ok(rx)
    }
}

/// S5: Shutdown mid-stream delivers a final chunk with
/// `stream_end=true` and a `RequestCancelled` error, and the channel
/// closes — never hangs.
#[tokio::test]
async fn s5_shutdown_mid_stream_delivers_cancelled_terminal_chunk() {
    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(FixedAccount::new(&["p"])),
        EngineConfig::default(),
    ));
    dispatcher.register_provider(Arc::new(StallingStream)).await.unwrap();

    let mut rx = dispatcher
        .dispatch_stream(None, TypedRequest::ChatStream(ChatPayload {
            provider: "p".into(),
            model: "m".into(),
            fallbacks: vec![],
            messages: serde_json::json!([]),
        }))
        .await
        .unwrap();

    let first = rx.recv().await.unwrap();
    assert_eq!(first.payload, Some(serde_json::json!("A")));
    assert!(!first.stream_end);

    let d = dispatcher.clone();
    tokio::spawn(async move { d.shutdown().await });

    let terminal = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("shutdown must deliver a terminal chunk within 1s")
        .expect("channel must not close without a terminal chunk");
    assert!(terminal.stream_end);
    assert_eq!(terminal.error.map(|e| e.kind), Some(ErrorKind::RequestCancelled));
    assert!(rx.recv().await.is_none(), "the stream channel must close after the terminal chunk");
}

/// S6: `ListAllModels` across three providers where the middle one fails
/// ("no keys found"); its error is suppressed and the rest are merged,
/// sorted by id.
#[tokio::test]
async fn s6_with_three_providers_sorts_union_and_skips_the_failing_one() {
    struct ThreeProviderAccount;
    #[async_trait]
    impl Account for ThreeProviderAccount {
        async fn configured_providers(&self) -> Vec<String> {
            vec!["p1".into(), "p2".into(), "p3".into()]
        }
        async fn config_for_provider(&self, _id: &str) -> Result<ProviderConfig, AccountError> {
            Ok(ProviderConfig {
                network: NetworkConfig::default(),
                concurrency_and_buffer_size: ConcurrencyAndBufferSize::default(),
                custom_provider_config: None,
                proxy_config: None,
                send_back_raw_request: false,
                send_back_raw_response: false,
            })
        }
        async fn keys_for_provider(&self, _id: &str) -> Result<Vec<ProviderKey>, AccountError> {
            Ok(vec![some_key("k1")])
        }
    }

    struct NamedPaged {
        name: &'static str,
        pages: Vec<Vec<&'static str>>,
    }
    #[async_trait]
    impl UpstreamProvider for NamedPaged {
        fn name(&self) -> &'static str {
            self.name
        }
        fn supports(&self, _op: Op) -> bool {
            true
        }
        async fn call(&self, _op: Op, _key: &Key, _req: &TypedRequest) -> Result<TypedResponse, RouterError> {
            unimplemented!()
        }
        async fn call_stream(&self, _op: Op, _key: &Key, _req: &TypedRequest) -> Result<mpsc::Receiver<StreamEvent>, RouterError> {
            unimplemented!()
        }
        async fn list_models(&self, _key: &Key, page_token: Option<&str>, _page_size: u32) -> Result<ModelListResponse, RouterError> {
            let idx: usize = page_token.map(|t| t.parse().unwrap()).unwrap_or(0);
            let models = self.pages[idx].iter().map(|id| ModelInfo { id: id.to_string(), provider: self.name.into() }).collect();
            let next_page_token = if idx + 1 < self.pages.len() { Some((idx + 1).to_string()) } else { None };
            Ok(ModelListResponse { models, next_page_token })
        }
    }
    struct NoKeys;
    #[async_trait]
    impl UpstreamProvider for NoKeys {
        fn name(&self) -> &'static str {
            "p2"
        }
        fn supports(&self, _op: Op) -> bool {
            true
        }
        async fn call(&self, _op: Op, _key: &Key, _req: &TypedRequest) -> Result<TypedResponse, RouterError> {
            unimplemented!()
        }
        async fn call_stream(&self, _op: Op, _key: &Key, _req: &TypedRequest) -> Result<mpsc::Receiver<StreamEvent>, RouterError> {
            unimplemented!()
        }
        async fn list_models(&self, _key: &Key, _page_token: Option<&str>, _page_size: u32) -> Result<ModelListResponse, RouterError> {
            Err(RouterError::new(ErrorKind::ConfigurationError, "no keys found"))
        }
    }

    let dispatcher = Dispatcher::new(Arc::new(ThreeProviderAccount), EngineConfig::default());
    dispatcher.register_provider(Arc::new(NamedPaged { name: "p1", pages: vec![vec!["m2"], vec!["m4"]] })).await.unwrap();
    dispatcher.register_provider(Arc::new(NoKeys)).await.unwrap();
    dispatcher.register_provider(Arc::new(NamedPaged { name: "p3", pages: vec![vec!["m1"]] })).await.unwrap();

    let aggregated = dispatcher.list_all_models().await;
    let ids: Vec<&str> = aggregated.models.iter().map(|m| m.id.as_str()).collect();
    assert_eq!(ids, vec!["m1", "m2", "m4"]);
}
