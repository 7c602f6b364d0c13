use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Instant;

use bytes::Bytes;
use http::header::EXPECT;
use http::{HeaderMap, StatusCode};
use tokio::sync::oneshot;
use tracing::debug;

use crate::ConnexResult;
use crate::channel::Channel;
use crate::error::ConnexError;
use crate::handler::ResponseHandler;
use crate::manager::ChannelManager;
use crate::partition::PartitionKey;
use crate::request::Request;
use crate::util::lock_unpoisoned;

/// Where the exchange's channel came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum ChannelState {
    New,
    Pooled,
    Reconnected,
    Closed,
}

impl ChannelState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Pooled,
            2 => Self::Reconnected,
            3 => Self::Closed,
            _ => Self::New,
        }
    }

    const fn as_u8(self) -> u8 {
        match self {
            Self::New => 0,
            Self::Pooled => 1,
            Self::Reconnected => 2,
            Self::Closed => 3,
        }
    }
}

/// The buffered response delivered through [`ResponseFuture`].
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl Response {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }
}

#[derive(Default)]
struct ResponseAssembly {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: Vec<u8>,
}

struct ExchangeInner {
    manager: Weak<ChannelManager>,
    handler: Mutex<Box<dyn ResponseHandler>>,
    max_retry: usize,

    target_request: Mutex<Request>,
    current_request: Mutex<Request>,

    channel_state: AtomicU8,
    done: AtomicBool,
    cancelled: AtomicBool,
    handler_notified: AtomicBool,
    content_processed: AtomicBool,

    in_auth: AtomicBool,
    in_proxy_auth: AtomicBool,
    keep_alive: AtomicBool,
    headers_written_on_continue: AtomicBool,
    dont_write_body_expect_continue: AtomicBool,
    connect_allowed: AtomicBool,
    reuse_channel: AtomicBool,

    redirect_count: AtomicUsize,
    retry_count: AtomicUsize,

    channel: Mutex<Option<Channel>>,
    partition_lock: Mutex<Option<PartitionKey>>,
    pending_error: Mutex<Option<ConnexError>>,
    assembly: Mutex<ResponseAssembly>,
    completion: Mutex<Option<oneshot::Sender<ConnexResult<Response>>>>,
    touch: Mutex<Instant>,
}

/// Per-exchange lifecycle state, shared between the execution layer,
/// the channel owner attachment and the public future.
///
/// Exactly one terminal transition (`done` / `abort` / `cancel`) takes
/// effect; later calls are no-ops.
#[derive(Clone)]
pub(crate) struct Exchange {
    inner: Arc<ExchangeInner>,
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Exchange")
            .field("channel_state", &self.channel_state())
            .field("done", &self.inner.done.load(Ordering::Relaxed))
            .field("cancelled", &self.inner.cancelled.load(Ordering::Relaxed))
            .field("in_auth", &self.inner.in_auth.load(Ordering::Relaxed))
            .field("keep_alive", &self.inner.keep_alive.load(Ordering::Relaxed))
            .field(
                "redirect_count",
                &self.inner.redirect_count.load(Ordering::Relaxed),
            )
            .field("retry_count", &self.inner.retry_count.load(Ordering::Relaxed))
            .field("last_touch", &self.last_touch())
            .finish()
    }
}

impl Exchange {
    pub(crate) fn new(
        request: Request,
        handler: Box<dyn ResponseHandler>,
        max_retry: usize,
        manager: Weak<ChannelManager>,
    ) -> (Self, ResponseFuture) {
        let (sender, receiver) = oneshot::channel();
        let expect_continue = request
            .headers()
            .get(EXPECT)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|value| value.eq_ignore_ascii_case("100-continue"));
        // CONNECT tunneling is on the table whenever a secured target
        // goes through a proxy
        let connect_allowed = request.proxy().is_some() && request.is_secured();

        let exchange = Self {
            inner: Arc::new(ExchangeInner {
                manager,
                handler: Mutex::new(handler),
                max_retry,
                target_request: Mutex::new(request.clone()),
                current_request: Mutex::new(request),
                channel_state: AtomicU8::new(ChannelState::New.as_u8()),
                done: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                handler_notified: AtomicBool::new(false),
                content_processed: AtomicBool::new(false),
                in_auth: AtomicBool::new(false),
                in_proxy_auth: AtomicBool::new(false),
                keep_alive: AtomicBool::new(true),
                headers_written_on_continue: AtomicBool::new(false),
                dont_write_body_expect_continue: AtomicBool::new(expect_continue),
                connect_allowed: AtomicBool::new(connect_allowed),
                reuse_channel: AtomicBool::new(false),
                redirect_count: AtomicUsize::new(0),
                retry_count: AtomicUsize::new(0),
                channel: Mutex::new(None),
                partition_lock: Mutex::new(None),
                pending_error: Mutex::new(None),
                assembly: Mutex::new(ResponseAssembly::default()),
                completion: Mutex::new(Some(sender)),
                touch: Mutex::new(Instant::now()),
            }),
        };
        let future = ResponseFuture {
            exchange: exchange.clone(),
            receiver,
        };
        (exchange, future)
    }

    pub(crate) fn handler<R>(&self, call: impl FnOnce(&mut dyn ResponseHandler) -> R) -> R {
        let mut handler = lock_unpoisoned(&self.inner.handler);
        call(handler.as_mut())
    }

    // requests

    pub(crate) fn target_request(&self) -> Request {
        lock_unpoisoned(&self.inner.target_request).clone()
    }

    pub(crate) fn set_target_request(&self, request: Request) {
        *lock_unpoisoned(&self.inner.target_request) = request;
    }

    pub(crate) fn current_request(&self) -> Request {
        lock_unpoisoned(&self.inner.current_request).clone()
    }

    pub(crate) fn set_current_request(&self, request: Request) {
        *lock_unpoisoned(&self.inner.current_request) = request;
    }

    pub(crate) fn partition_key(&self) -> PartitionKey {
        let target = lock_unpoisoned(&self.inner.target_request);
        let manager_partitioning = self
            .inner
            .manager
            .upgrade()
            .map(|manager| manager.partitioning())
            .unwrap_or_default();
        manager_partitioning.partition_key(target.uri(), target.virtual_host(), target.proxy())
    }

    // flags and counters

    pub(crate) fn channel_state(&self) -> ChannelState {
        ChannelState::from_u8(self.inner.channel_state.load(Ordering::Acquire))
    }

    pub(crate) fn set_channel_state(&self, state: ChannelState) {
        self.inner
            .channel_state
            .store(state.as_u8(), Ordering::Release);
    }

    pub(crate) fn is_done(&self) -> bool {
        self.inner.done.load(Ordering::Acquire) || self.is_cancelled()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn is_in_auth(&self) -> bool {
        self.inner.in_auth.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_auth(&self, value: bool) {
        self.inner.in_auth.store(value, Ordering::Release);
    }

    pub(crate) fn is_in_proxy_auth(&self) -> bool {
        self.inner.in_proxy_auth.load(Ordering::Acquire)
    }

    pub(crate) fn set_in_proxy_auth(&self, value: bool) {
        self.inner.in_proxy_auth.store(value, Ordering::Release);
    }

    pub(crate) fn is_keep_alive(&self) -> bool {
        self.inner.keep_alive.load(Ordering::Acquire)
    }

    pub(crate) fn set_keep_alive(&self, value: bool) {
        self.inner.keep_alive.store(value, Ordering::Release);
    }

    pub(crate) fn headers_written_on_continue(&self) -> bool {
        self.inner
            .headers_written_on_continue
            .load(Ordering::Acquire)
    }

    pub(crate) fn set_headers_written_on_continue(&self, value: bool) {
        self.inner
            .headers_written_on_continue
            .store(value, Ordering::Release);
    }

    pub(crate) fn dont_write_body_expect_continue(&self) -> bool {
        self.inner
            .dont_write_body_expect_continue
            .load(Ordering::Acquire)
    }

    pub(crate) fn set_dont_write_body_expect_continue(&self, value: bool) {
        self.inner
            .dont_write_body_expect_continue
            .store(value, Ordering::Release);
    }

    pub(crate) fn is_connect_allowed(&self) -> bool {
        self.inner.connect_allowed.load(Ordering::Acquire)
    }

    pub(crate) fn set_connect_allowed(&self, value: bool) {
        self.inner.connect_allowed.store(value, Ordering::Release);
    }

    pub(crate) fn is_reuse_channel(&self) -> bool {
        self.inner.reuse_channel.load(Ordering::Acquire)
    }

    pub(crate) fn set_reuse_channel(&self, value: bool) {
        self.inner.reuse_channel.store(value, Ordering::Release);
    }

    /// Bumps the redirect counter and returns the new count.
    pub(crate) fn increment_redirect_count(&self) -> usize {
        self.inner.redirect_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Consumes one replay attempt; false once the cap is exhausted.
    /// A cap of zero disables replays entirely.
    pub(crate) fn increment_retry_and_check(&self) -> bool {
        self.inner.max_retry > 0
            && self.inner.retry_count.fetch_add(1, Ordering::AcqRel) + 1 <= self.inner.max_retry
    }

    pub(crate) fn touch(&self) {
        *lock_unpoisoned(&self.inner.touch) = Instant::now();
    }

    /// Last moment the exchange saw activity; exposed for idle-exchange
    /// diagnostics.
    pub(crate) fn last_touch(&self) -> Instant {
        *lock_unpoisoned(&self.inner.touch)
    }

    pub(crate) fn set_pending_error(&self, error: ConnexError) {
        *lock_unpoisoned(&self.inner.pending_error) = Some(error);
    }

    pub(crate) fn take_pending_error(&self) -> Option<ConnexError> {
        lock_unpoisoned(&self.inner.pending_error).take()
    }

    // channel custody

    pub(crate) fn attach_channel(&self, channel: Channel, reuse: bool) {
        // the exchange may have been cancelled before the channel was
        // ready; close it rather than adopting it
        if self.is_done() {
            channel.set_discard();
            channel.close();
        }
        *lock_unpoisoned(&self.inner.channel) = Some(channel);
        self.set_reuse_channel(reuse);
    }

    pub(crate) fn channel(&self) -> Option<Channel> {
        lock_unpoisoned(&self.inner.channel).clone()
    }

    /// Whether a failed exchange may be transparently resumed on a
    /// different connection: not already terminal, not mid-auth, and
    /// the current channel is not an open secure one (an open TLS
    /// channel in an ambiguous state must not be blindly replayed).
    pub(crate) fn is_replay_possible(&self) -> bool {
        let open_and_secure = self
            .channel()
            .map(|channel| channel.is_active() && channel.is_secure())
            .unwrap_or(false);
        !self.is_done() && !open_and_secure && !self.is_in_auth() && !self.is_in_proxy_auth()
    }

    // partition lock custody

    /// Acquires a connection slot for this exchange's partition unless
    /// one is already held. The slot is released exactly once: either
    /// transferred to the connected channel's close hook, or given back
    /// by the terminal transition.
    pub(crate) async fn acquire_partition_lock_lazily(
        &self,
        manager: &Arc<ChannelManager>,
    ) -> ConnexResult<()> {
        if lock_unpoisoned(&self.inner.partition_lock).is_some() {
            return Ok(());
        }

        let partition = self.partition_key();
        manager.acquire_channel_lock(&partition).await?;
        let previous = lock_unpoisoned(&self.inner.partition_lock).replace(partition);
        debug_assert!(previous.is_none(), "partition lock acquired concurrently");
        if let Some(previous) = previous {
            manager.release_channel_lock(&previous);
        }

        if self.is_done() {
            // cancelled while we were waiting for the slot
            self.release_partition_lock();
        }
        Ok(())
    }

    /// Detaches the held partition key without releasing the permit;
    /// used to transfer release responsibility to a channel close hook.
    pub(crate) fn take_partition_lock(&self) -> Option<PartitionKey> {
        lock_unpoisoned(&self.inner.partition_lock).take()
    }

    fn release_partition_lock(&self) {
        let Some(partition) = self.take_partition_lock() else {
            return;
        };
        if let Some(manager) = self.inner.manager.upgrade() {
            manager.release_channel_lock(&partition);
        }
    }

    // response assembly

    pub(crate) fn assembly_begin(&self, status: StatusCode, headers: &HeaderMap) {
        let mut assembly = lock_unpoisoned(&self.inner.assembly);
        assembly.status = Some(status);
        assembly.headers = headers.clone();
        assembly.body.clear();
    }

    pub(crate) fn assembly_append_body(&self, chunk: &Bytes) {
        lock_unpoisoned(&self.inner.assembly)
            .body
            .extend_from_slice(chunk);
    }

    pub(crate) fn assembly_reset(&self) {
        *lock_unpoisoned(&self.inner.assembly) = ResponseAssembly::default();
    }

    // terminal transitions

    /// Releases held resources and flips the terminal flag; true if the
    /// exchange was already terminal.
    fn terminate_and_exit(&self) -> bool {
        self.release_partition_lock();
        *lock_unpoisoned(&self.inner.channel) = None;
        self.set_reuse_channel(false);
        self.inner.done.swap(true, Ordering::AcqRel) || self.is_cancelled()
    }

    fn complete(&self, result: ConnexResult<Response>) {
        if let Some(sender) = lock_unpoisoned(&self.inner.completion).take() {
            let _ = sender.send(result);
        }
    }

    pub(crate) fn done(&self) {
        if self.terminate_and_exit() {
            return;
        }

        // no more replays once delivery started
        self.inner
            .retry_count
            .store(self.inner.max_retry, Ordering::Release);

        if !self.inner.content_processed.swap(true, Ordering::AcqRel) {
            let assembly = std::mem::take(&mut *lock_unpoisoned(&self.inner.assembly));
            self.handler(|handler| handler.on_completed());
            self.complete(Ok(Response {
                status: assembly.status.unwrap_or(StatusCode::OK),
                headers: assembly.headers,
                body: Bytes::from(assembly.body),
            }));
        }
    }

    pub(crate) fn abort(&self, error: ConnexError) {
        if self.terminate_and_exit() {
            return;
        }

        debug!(error = %error, "aborting exchange");
        if !self.inner.handler_notified.swap(true, Ordering::AcqRel) {
            self.handler(|handler| handler.on_error(&error));
        }
        self.complete(Err(error));
    }

    /// Cancels the exchange: the channel is discarded (never handed
    /// back half-used), the held slot released exactly once, and the
    /// failure callback invoked at most once.
    pub(crate) fn cancel(&self) -> bool {
        self.release_partition_lock();

        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return false;
        }

        if let Some(channel) = self.channel() {
            channel.set_discard();
            channel.close();
        }

        if !self.inner.handler_notified.swap(true, Ordering::AcqRel) {
            self.handler(|handler| handler.on_error(&ConnexError::Cancelled));
        }
        self.complete(Err(ConnexError::Cancelled));
        true
    }
}

/// Completion side of one submitted request.
///
/// Resolves with the buffered [`Response`] on success or exactly one
/// terminal error. Dropping the future does not cancel the exchange;
/// use [`ResponseFuture::cancel`].
pub struct ResponseFuture {
    exchange: Exchange,
    receiver: oneshot::Receiver<ConnexResult<Response>>,
}

impl ResponseFuture {
    pub fn cancel(&self) -> bool {
        self.exchange.cancel()
    }
}

impl Future for ResponseFuture {
    type Output = ConnexResult<Response>;

    fn poll(mut self: Pin<&mut Self>, context: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver).poll(context).map(|result| {
            match result {
                Ok(outcome) => outcome,
                // completion sender dropped without a terminal
                // transition; treat as cancellation
                Err(_) => Err(ConnexError::Cancelled),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::NoopResponseHandler;

    fn test_exchange(max_retry: usize) -> (Exchange, ResponseFuture) {
        let request = Request::get("http://example.com/").build().expect("request");
        Exchange::new(request, Box::new(NoopResponseHandler), max_retry, Weak::new())
    }

    #[tokio::test]
    async fn done_completes_future_with_assembled_response() {
        let (exchange, future) = test_exchange(5);
        let mut headers = HeaderMap::new();
        headers.insert("x-test", "1".parse().expect("value"));
        exchange.assembly_begin(StatusCode::CREATED, &headers);
        exchange.assembly_append_body(&Bytes::from_static(b"hello"));
        exchange.done();

        let response = future.await.expect("response");
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(response.headers().get("x-test").map(|v| v.as_bytes()), Some(&b"1"[..]));
        assert_eq!(response.body().as_ref(), b"hello");
    }

    #[tokio::test]
    async fn first_terminal_transition_wins() {
        let (exchange, future) = test_exchange(5);
        exchange.assembly_begin(StatusCode::OK, &HeaderMap::new());
        exchange.done();
        exchange.abort(ConnexError::RemotelyClosed);
        exchange.cancel();

        assert!(future.await.is_ok());
        assert!(exchange.is_done());
    }

    #[tokio::test]
    async fn cancel_closes_the_attached_channel() {
        let (exchange, future) = test_exchange(5);
        let channel = Channel::detached();
        exchange.attach_channel(channel.clone(), false);

        assert!(exchange.cancel());
        assert!(!exchange.cancel());
        assert!(!channel.is_open());
        assert!(matches!(future.await, Err(ConnexError::Cancelled)));
    }

    #[tokio::test]
    async fn attaching_to_a_terminal_exchange_closes_the_channel() {
        let (exchange, _future) = test_exchange(5);
        exchange.cancel();

        let channel = Channel::detached();
        exchange.attach_channel(channel.clone(), false);
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn touch_moves_the_activity_timestamp_forward() {
        let (exchange, _future) = test_exchange(5);
        let before = exchange.last_touch();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        exchange.touch();
        assert!(exchange.last_touch() > before);
    }

    #[test]
    fn retry_cap_counts_down_and_zero_disables() {
        let (exchange, _future) = test_exchange(2);
        assert!(exchange.increment_retry_and_check());
        assert!(exchange.increment_retry_and_check());
        assert!(!exchange.increment_retry_and_check());

        let (no_retry, _future) = test_exchange(0);
        assert!(!no_retry.increment_retry_and_check());
    }

    #[test]
    fn replay_gate_honours_auth_and_secure_channel() {
        let (exchange, _future) = test_exchange(5);
        assert!(exchange.is_replay_possible());

        exchange.set_in_auth(true);
        assert!(!exchange.is_replay_possible());
        exchange.set_in_auth(false);

        let channel = Channel::detached();
        channel.pipeline_add_first(crate::channel::SSL_STAGE);
        exchange.attach_channel(channel.clone(), false);
        assert!(!exchange.is_replay_possible());

        // a closed secure channel no longer blocks the replay
        channel.close();
        assert!(exchange.is_replay_possible());
    }

    #[tokio::test]
    async fn expect_continue_header_defers_the_body() {
        let request = Request::post("http://example.com/upload")
            .header("expect", "100-continue")
            .expect("header")
            .body(Bytes::from_static(b"payload"))
            .build()
            .expect("request");
        let (exchange, _future) =
            Exchange::new(request, Box::new(NoopResponseHandler), 5, Weak::new());
        assert!(exchange.dont_write_body_expect_continue());
    }
}
