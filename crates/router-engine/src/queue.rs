use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::{Mutex, Notify, OnceCell, oneshot, watch};

use router_common::{ErrorKind, RouterError};
use router_provider::{StreamEvent, TypedRequest, TypedResponse};

use crate::context::RequestContext;
use crate::pipeline::PluginPipeline;

/// Exactly one of these is produced by a worker for a given message: a
/// `Result` makes "exactly one of response/error" a type-level invariant
/// instead of two racing optional slots.
pub enum ResultSlot {
    Unary(oneshot::Sender<Result<TypedResponse, RouterError>>),
    Streaming(oneshot::Sender<Result<tokio::sync::mpsc::Receiver<StreamEvent>, RouterError>>),
}

/// The envelope carrying one request plus its response/error/stream
/// one-shot slot.
pub struct ChannelMessage {
    pub request: TypedRequest,
    pub context: Arc<RequestContext>,
    pub slot: ResultSlot,
    /// Set only for streaming variants: the pipeline
    /// instance that already ran PreHooks in the dispatcher, carried
    /// through so the worker can PostHook every chunk as it is produced.
    pub pipeline: Option<Arc<Mutex<PluginPipeline>>>,
}

fn provider_shutting_down() -> RouterError {
    RouterError::new(ErrorKind::ProviderShuttingDown, "provider queue is shutting down")
}

fn queue_full() -> RouterError {
    RouterError::new(ErrorKind::QueueFull, "provider queue is full")
}

/// A `{buffer, closing, done}` bundle: a bounded channel plus lifecycle
/// flags routing requests to workers for one provider.
pub struct ProviderQueue {
    sender: tokio::sync::mpsc::Sender<ChannelMessage>,
    receiver: Arc<Mutex<tokio::sync::mpsc::Receiver<ChannelMessage>>>,
    closing: Arc<AtomicBool>,
    done_tx: watch::Sender<bool>,
    close_once: Arc<OnceCell<()>>,
    pub buffer_size: usize,
    /// Counts workers currently processing a message pulled from this
    /// queue. `tokio::sync::mpsc` can't be built with zero capacity, so a
    /// `bufferSize == 0` queue still gets a 1-slot channel underneath;
    /// this counter closes that gap by rejecting admission whenever the
    /// lone slot would otherwise let a second message queue up behind
    /// the one a worker already holds.
    in_flight: Arc<AtomicUsize>,
    /// Notified by `end_processing` so a blocked (non-drop) enqueue can
    /// retry as soon as `in_flight` may have dropped to zero.
    capacity_notify: Arc<Notify>,
}

impl ProviderQueue {
    pub fn new(buffer_size: usize) -> Self {
        let (sender, receiver) = tokio::sync::mpsc::channel(buffer_size.max(1));
        let (done_tx, _done_rx) = watch::channel(false);
        Self {
            sender,
            receiver: Arc::new(Mutex::new(receiver)),
            closing: Arc::new(AtomicBool::new(false)),
            done_tx,
            close_once: Arc::new(OnceCell::new()),
            buffer_size,
            in_flight: Arc::new(AtomicUsize::new(0)),
            capacity_notify: Arc::new(Notify::new()),
        }
    }

    /// Marks a message pulled from this queue as actively being
    /// processed by a worker. Paired with `end_processing`.
    pub fn begin_processing(&self) {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
    }

    /// Marks the worker as done with the message it called
    /// `begin_processing` for.
    pub fn end_processing(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.capacity_notify.notify_waiters();
    }

    fn zero_buffer_busy(&self) -> bool {
        self.buffer_size == 0 && self.in_flight.load(Ordering::Acquire) > 0
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Idempotent: sets `closing=1` and broadcasts on `done`.
    pub fn signal_closing(&self) {
        if !self.closing.swap(true, Ordering::AcqRel) {
            let _ = self.done_tx.send(true);
        }
    }

    /// Idempotent: closes the buffer so workers drain it and exit. Uses
    /// `Receiver::close`, which stops accepting new sends while letting
    /// buffered items continue to drain.
    pub async fn close_queue(&self) {
        let receiver = self.receiver.clone();
        self.close_once
            .get_or_init(|| async move {
                receiver.lock().await.close();
            })
            .await;
    }

    pub(crate) fn receiver_handle(&self) -> Arc<Mutex<tokio::sync::mpsc::Receiver<ChannelMessage>>> {
        self.receiver.clone()
    }

    /// A raw clone of the sender half, for the lifecycle owner transferring
    /// buffered messages to a replacement queue. Bypasses
    /// the `enqueue` closing/backpressure protocol, which is for producers,
    /// not for the owner performing the swap itself.
    pub(crate) fn sender_for_transfer(&self) -> tokio::sync::mpsc::Sender<ChannelMessage> {
        self.sender.clone()
    }

    /// The layered non-blocking-then-blocking send protocol: fails fast
    /// if closing; tries a non-blocking send; honors
    /// `dropExcessRequests`; otherwise blocks selectable on `done` and
    /// `ctx.Done()`.
    pub async fn enqueue(
        &self,
        msg: ChannelMessage,
        ctx: &RequestContext,
        drop_excess_requests: bool,
    ) -> Result<(), RouterError> {
        if self.is_closing() {
            return Err(provider_shutting_down());
        }

        let send_result = if self.zero_buffer_busy() {
            Err(tokio::sync::mpsc::error::TrySendError::Full(msg))
        } else {
            self.sender.try_send(msg)
        };

        match send_result {
            Ok(()) => Ok(()),
            Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => {
                Err(provider_shutting_down())
            }
            Err(tokio::sync::mpsc::error::TrySendError::Full(msg)) => {
                if drop_excess_requests {
                    return Err(queue_full());
                }
                if self.is_closing() {
                    return Err(provider_shutting_down());
                }
                if self.buffer_size == 0 {
                    return self.enqueue_unbuffered_blocking(msg, ctx).await;
                }
                let mut done_rx = self.done_tx.subscribe();
                tokio::select! {
                    res = self.sender.send(msg) => res.map_err(|_| provider_shutting_down()),
                    _ = done_rx.changed() => Err(provider_shutting_down()),
                    _ = ctx.cancelled() => Err(RouterError::cancelled()),
                }
            }
        }
    }

    /// Blocking admission path for a `bufferSize == 0` queue: waits for
    /// `in_flight` to drop to zero (or for closing/cancellation) before
    /// attempting the send. A second producer racing for the same
    /// just-freed slot loses with `QueueFull` rather than retrying
    /// indefinitely.
    async fn enqueue_unbuffered_blocking(
        &self,
        msg: ChannelMessage,
        ctx: &RequestContext,
    ) -> Result<(), RouterError> {
        let mut done_rx = self.done_tx.subscribe();
        while self.zero_buffer_busy() {
            tokio::select! {
                _ = self.capacity_notify.notified() => {}
                _ = done_rx.changed() => return Err(provider_shutting_down()),
                _ = ctx.cancelled() => return Err(RouterError::cancelled()),
            }
            if self.is_closing() {
                return Err(provider_shutting_down());
            }
        }

        match self.sender.try_send(msg) {
            Ok(()) => Ok(()),
            Err(tokio::sync::mpsc::error::TrySendError::Closed(_)) => Err(provider_shutting_down()),
            Err(tokio::sync::mpsc::error::TrySendError::Full(_)) => Err(queue_full()),
        }
    }
}

/// Tracks worker liveness per provider: a WaitGroup per provider tracks
/// worker liveness.
#[derive(Clone, Default)]
pub struct WorkerWaitGroup {
    count: Arc<AtomicUsize>,
    notify: Arc<Notify>,
}

impl WorkerWaitGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, n: usize) {
        self.count.fetch_add(n, Ordering::AcqRel);
    }

    pub fn done(&self) {
        if self.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.notify.notify_waiters();
        }
    }

    pub async fn wait(&self) {
        while self.count.load(Ordering::Acquire) > 0 {
            self.notify.notified().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn signal_closing_is_idempotent() {
        let queue = ProviderQueue::new(4);
        queue.signal_closing();
        queue.signal_closing();
        assert!(queue.is_closing());
    }

    #[tokio::test]
    async fn enqueue_after_closing_fails_immediately() {
        let queue = ProviderQueue::new(4);
        queue.signal_closing();
        let (tx, _rx) = oneshot::channel();
        let ctx = RequestContext::new();
        let msg = ChannelMessage {
            request: crate::tests_support::dummy_chat_request(),
            context: Arc::new(RequestContext::new()),
            slot: ResultSlot::Unary(tx),
            pipeline: None,
        };
        let err = queue.enqueue(msg, &ctx, false).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ProviderShuttingDown);
    }

    #[tokio::test]
    async fn drop_excess_requests_fails_fast_when_full() {
        let queue = ProviderQueue::new(1);
        let ctx = RequestContext::new();

        let (tx1, _rx1) = oneshot::channel();
        queue
            .enqueue(
                ChannelMessage {
                    request: crate::tests_support::dummy_chat_request(),
                    context: Arc::new(RequestContext::new()),
                    slot: ResultSlot::Unary(tx1),
                    pipeline: None,
                },
                &ctx,
                true,
            )
            .await
            .unwrap();

        let (tx2, _rx2) = oneshot::channel();
        let err = queue
            .enqueue(
                ChannelMessage {
                    request: crate::tests_support::dummy_chat_request(),
                    context: Arc::new(RequestContext::new()),
                    slot: ResultSlot::Unary(tx2),
                    pipeline: None,
                },
                &ctx,
                true,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::QueueFull);
    }

    #[tokio::test]
    async fn zero_buffer_size_rejects_second_enqueue_while_worker_is_busy() {
        let queue = ProviderQueue::new(0);
        let ctx = RequestContext::new();

        let (tx1, _rx1) = oneshot::channel();
        queue
            .enqueue(
                ChannelMessage {
                    request: crate::tests_support::dummy_chat_request(),
                    context: Arc::new(RequestContext::new()),
                    slot: ResultSlot::Unary(tx1),
                    pipeline: None,
                },
                &ctx,
                true,
            )
            .await
            .unwrap();

        // The lone worker pulls the message off the channel and starts
        // processing it, freeing the physical slot but marking itself
        // busy.
        {
            let mut guard = queue.receiver_handle().lock().await;
            guard.recv().await.unwrap();
        }
        queue.begin_processing();

        let (tx2, _rx2) = oneshot::channel();
        let err = queue
            .enqueue(
                ChannelMessage {
                    request: crate::tests_support::dummy_chat_request(),
                    context: Arc::new(RequestContext::new()),
                    slot: ResultSlot::Unary(tx2),
                    pipeline: None,
                },
                &ctx,
                true,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::QueueFull);

        queue.end_processing();
    }

    #[tokio::test]
    async fn zero_buffer_size_admits_next_message_once_worker_frees_up() {
        let queue = Arc::new(ProviderQueue::new(0));
        let ctx = RequestContext::new();

        let (tx1, _rx1) = oneshot::channel();
        queue
            .enqueue(
                ChannelMessage {
                    request: crate::tests_support::dummy_chat_request(),
                    context: Arc::new(RequestContext::new()),
                    slot: ResultSlot::Unary(tx1),
                    pipeline: None,
                },
                &ctx,
                true,
            )
            .await
            .unwrap();
        {
            let mut guard = queue.receiver_handle().lock().await;
            guard.recv().await.unwrap();
        }
        queue.begin_processing();

        let blocked_queue = queue.clone();
        let (tx2, _rx2) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let ctx = RequestContext::new();
            blocked_queue
                .enqueue(
                    ChannelMessage {
                        request: crate::tests_support::dummy_chat_request(),
                        context: Arc::new(RequestContext::new()),
                        slot: ResultSlot::Unary(tx2),
                        pipeline: None,
                    },
                    &ctx,
                    false,
                )
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        queue.end_processing();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn waitgroup_wait_returns_once_all_done() {
        let wg = WorkerWaitGroup::new();
        wg.add(2);
        wg.done();
        let wg2 = wg.clone();
        let handle = tokio::spawn(async move { wg2.wait().await });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        wg.done();
        handle.await.unwrap();
    }
}
