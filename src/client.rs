use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::config::ClientConfig;
use crate::future::ResponseFuture;
use crate::handler::{NoopResponseHandler, ResponseHandler};
use crate::manager::{ChannelManager, ClientStats};
use crate::partition::PartitionKey;
use crate::request::Request;
use crate::sender::RequestSender;

struct ClientInner {
    manager: Arc<ChannelManager>,
    sender: Arc<RequestSender>,
    closed: AtomicBool,
}

/// Asynchronous HTTP client facade over the connection-lifecycle core.
///
/// Cheap to clone; all clones share one channel pool, one admission
/// semaphore and one open-channel registry. Must be created inside a
/// tokio runtime. Call [`Client::close`] when done; in-flight
/// exchanges then fail with a `ClientClosed` error instead of hanging.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let manager = ChannelManager::new(&config);
        let sender = RequestSender::new(config, Arc::clone(&manager));
        Self {
            inner: Arc::new(ClientInner {
                manager,
                sender,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Submits a request; the returned future resolves with the
    /// buffered response or exactly one terminal error.
    pub fn execute(&self, request: Request) -> ResponseFuture {
        self.inner
            .sender
            .submit(request, Box::new(NoopResponseHandler))
    }

    /// Like [`Client::execute`], with streaming callbacks and lifecycle
    /// hooks delivered to the handler as the exchange progresses.
    pub fn execute_with_handler(
        &self,
        request: Request,
        handler: Box<dyn ResponseHandler>,
    ) -> ResponseFuture {
        self.inner.sender.submit(request, handler)
    }

    /// The channel-event surface for the transport/codec collaborator:
    /// response, chunk, inactive and error events are fed through it.
    pub fn sender(&self) -> &Arc<RequestSender> {
        &self.inner.sender
    }

    /// Per-host active/idle connection counts.
    pub fn client_stats(&self) -> ClientStats {
        self.inner.manager.client_stats()
    }

    /// Proactively closes all idle channels of the matching partitions,
    /// e.g. after detecting a host-level failure.
    pub fn flush_partitions(&self, predicate: &dyn Fn(&PartitionKey) -> bool) {
        self.inner.manager.flush_partitions(predicate);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Idempotent shutdown: closes every open channel, destroys the
    /// pool and fails whatever is still in flight. Safe to call
    /// concurrently with running exchanges.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!("closing client");
        self.inner.sender.set_closed();
        self.inner.manager.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConnexError;

    #[tokio::test]
    async fn execute_after_close_fails_with_client_closed() {
        let client = Client::new(ClientConfig::default());
        client.close();
        client.close();
        assert!(client.is_closed());

        let request = Request::get("http://example.com/").build().expect("request");
        let error = client.execute(request).await.unwrap_err();
        assert!(matches!(error, ConnexError::ClientClosed));
    }

    #[tokio::test]
    async fn fresh_client_reports_empty_stats() {
        let client = Client::new(ClientConfig::default());
        let stats = client.client_stats();
        assert_eq!(stats.total_connection_count(), 0);
        assert!(stats.per_host().is_empty());
        client.close();
    }
}
