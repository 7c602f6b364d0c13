use std::net::SocketAddr;

use bytes::Bytes;
use http::{HeaderMap, HeaderValue, StatusCode};

use crate::channel::Channel;
use crate::error::ConnexError;
use crate::request::Request;

/// Streaming callbacks and lifecycle hooks for one exchange.
///
/// Every method has a no-op default so implementors only override what
/// they care about. Callbacks may run on any I/O task; implementations
/// must be `Send`. The terminal pair is exclusive: exactly one of
/// `on_completed` / `on_error` fires, exactly once.
pub trait ResponseHandler: Send {
    fn on_status(&mut self, _status: StatusCode) {}

    fn on_headers(&mut self, _headers: &HeaderMap) {}

    fn on_body_chunk(&mut self, _chunk: &Bytes, _last: bool) {}

    fn on_completed(&mut self) {}

    fn on_error(&mut self, _error: &ConnexError) {}

    /// The execution layer is about to look for a pooled channel.
    fn on_connection_pool_attempt(&mut self) {}

    /// A pooled channel was leased for this exchange.
    fn on_connection_pooled(&mut self, _channel: &Channel) {}

    /// The channel was handed back to the pool after this exchange.
    fn on_connection_offer(&mut self, _channel: &Channel) {}

    fn on_connect_attempt(&mut self, _address: SocketAddr) {}

    /// A connect attempt succeeded and the channel is registered.
    fn on_connect_success(&mut self, _address: SocketAddr, _channel: &Channel) {}

    fn on_connect_failure(&mut self, _address: SocketAddr, _error: &std::io::Error) {}

    /// The exchange is being transparently replayed on a fresh channel.
    fn on_retry(&mut self) {}

    fn on_request_send(&mut self, _request: &Request) {}
}

/// Handler used when the caller only wants the buffered [`crate::Response`].
pub(crate) struct NoopResponseHandler;

impl ResponseHandler for NoopResponseHandler {}

/// Produces the authorization header value replayed after a 401/407
/// challenge. The credential math (Basic/Digest/...) lives with the
/// implementor; the core only moves the header and drives the replay.
pub trait Authenticator: Send + Sync {
    fn authorization(&self, challenge: &HeaderValue, request: &Request) -> Option<HeaderValue>;
}

/// Outcome of one [`IoExceptionFilter`].
pub enum FilterDecision {
    /// Let the error continue through the remaining filters and, if
    /// none intervenes, the normal retry/abort path.
    Surface,
    /// Replay the exchange with this (possibly modified) request.
    Replay(Request),
}

/// User hook inspecting I/O errors on an in-flight exchange. The first
/// filter in the chain that returns [`FilterDecision::Replay`] wins;
/// the replay is still subject to the retry cap and the replay gate.
pub trait IoExceptionFilter: Send + Sync {
    fn filter(&self, error: &std::io::Error, request: &Request) -> FilterDecision;
}
