use std::sync::Arc;
use std::time::Duration;

use crate::handler::{Authenticator, IoExceptionFilter};
use crate::partition::Partitioning;
use crate::request::{Http1Codec, RequestCodec};

pub(crate) const DEFAULT_POOLED_CONNECTION_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
pub(crate) const DEFAULT_POOL_CLEANER_PERIOD: Duration = Duration::from_millis(100);
pub(crate) const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_MAX_REDIRECTS: usize = 5;
pub(crate) const DEFAULT_MAX_REQUEST_RETRY: usize = 5;

/// Order in which idle channels are leased from a pool partition.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PoolLeaseOrder {
    /// Most recently returned channel first (the default; keeps the hot
    /// connection hot and lets the tail idle out).
    #[default]
    Lifo,
    /// Oldest idle channel first.
    Fifo,
}

/// Configuration consumed by the connection-lifecycle core.
///
/// Limits configured as `None` are disabled entirely: no semaphore is
/// created for them and acquisition always succeeds. A zero
/// `acquire_free_channel_timeout` means "try once, non-blocking".
#[derive(Clone)]
pub struct ClientConfig {
    pub(crate) max_connections: Option<usize>,
    pub(crate) max_connections_per_host: Option<usize>,
    pub(crate) acquire_free_channel_timeout: Duration,
    pub(crate) pooled_connection_idle_timeout: Option<Duration>,
    pub(crate) connection_ttl: Option<Duration>,
    pub(crate) pool_cleaner_period: Duration,
    pub(crate) pool_lease_order: PoolLeaseOrder,
    pub(crate) keep_alive: bool,
    pub(crate) connect_timeout: Duration,
    pub(crate) follow_redirect: bool,
    pub(crate) max_redirects: usize,
    pub(crate) strict_302_handling: bool,
    pub(crate) remove_query_params_on_redirect: bool,
    pub(crate) max_request_retry: usize,
    pub(crate) partitioning: Partitioning,
    pub(crate) request_codec: Arc<dyn RequestCodec>,
    pub(crate) authenticator: Option<Arc<dyn Authenticator>>,
    pub(crate) proxy_authenticator: Option<Arc<dyn Authenticator>>,
    pub(crate) io_exception_filters: Vec<Arc<dyn IoExceptionFilter>>,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("ClientConfig")
            .field("max_connections", &self.max_connections)
            .field("max_connections_per_host", &self.max_connections_per_host)
            .field(
                "acquire_free_channel_timeout",
                &self.acquire_free_channel_timeout,
            )
            .field(
                "pooled_connection_idle_timeout",
                &self.pooled_connection_idle_timeout,
            )
            .field("connection_ttl", &self.connection_ttl)
            .field("pool_cleaner_period", &self.pool_cleaner_period)
            .field("pool_lease_order", &self.pool_lease_order)
            .field("keep_alive", &self.keep_alive)
            .field("connect_timeout", &self.connect_timeout)
            .field("follow_redirect", &self.follow_redirect)
            .field("max_redirects", &self.max_redirects)
            .field("strict_302_handling", &self.strict_302_handling)
            .field(
                "remove_query_params_on_redirect",
                &self.remove_query_params_on_redirect,
            )
            .field("max_request_retry", &self.max_request_retry)
            .field("partitioning", &self.partitioning)
            .finish_non_exhaustive()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_connections: None,
            max_connections_per_host: None,
            acquire_free_channel_timeout: Duration::ZERO,
            pooled_connection_idle_timeout: Some(DEFAULT_POOLED_CONNECTION_IDLE_TIMEOUT),
            connection_ttl: None,
            pool_cleaner_period: DEFAULT_POOL_CLEANER_PERIOD,
            pool_lease_order: PoolLeaseOrder::default(),
            keep_alive: true,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            follow_redirect: false,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            strict_302_handling: false,
            remove_query_params_on_redirect: false,
            max_request_retry: DEFAULT_MAX_REQUEST_RETRY,
            partitioning: Partitioning::default(),
            request_codec: Arc::new(Http1Codec),
            authenticator: None,
            proxy_authenticator: None,
            io_exception_filters: Vec::new(),
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder {
            config: Self::default(),
        }
    }
}

#[derive(Debug)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Global cap on concurrent connections; `None` disables the limit.
    pub fn max_connections(mut self, max_connections: Option<usize>) -> Self {
        self.config.max_connections = max_connections.map(|value| value.max(1));
        self
    }

    /// Per-host cap on concurrent connections; `None` disables the limit.
    pub fn max_connections_per_host(mut self, max_connections_per_host: Option<usize>) -> Self {
        self.config.max_connections_per_host = max_connections_per_host.map(|value| value.max(1));
        self
    }

    /// How long an acquisition may wait for a connection slot.
    /// `Duration::ZERO` means fail immediately when no slot is free.
    pub fn acquire_free_channel_timeout(mut self, timeout: Duration) -> Self {
        self.config.acquire_free_channel_timeout = timeout;
        self
    }

    /// Idle timeout after which a pooled channel is evicted; `None`
    /// disables idle eviction.
    pub fn pooled_connection_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.pooled_connection_idle_timeout = timeout;
        self
    }

    /// Hard cap on a connection's age, independent of idle time;
    /// `None` disables TTL eviction.
    pub fn connection_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.config.connection_ttl = ttl;
        self
    }

    pub fn pool_cleaner_period(mut self, period: Duration) -> Self {
        self.config.pool_cleaner_period = period.max(Duration::from_millis(1));
        self
    }

    pub fn pool_lease_order(mut self, order: PoolLeaseOrder) -> Self {
        self.config.pool_lease_order = order;
        self
    }

    /// Disabling keep-alive swaps the pool for a no-op backend: every
    /// channel is closed after its exchange completes.
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.config.keep_alive = keep_alive;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout.max(Duration::from_millis(1));
        self
    }

    pub fn follow_redirect(mut self, follow: bool) -> Self {
        self.config.follow_redirect = follow;
        self
    }

    pub fn max_redirects(mut self, max_redirects: usize) -> Self {
        self.config.max_redirects = max_redirects;
        self
    }

    /// With strict 302 handling a `302 Found` keeps the original method
    /// and body instead of being rewritten to `GET`.
    pub fn strict_302_handling(mut self, strict: bool) -> Self {
        self.config.strict_302_handling = strict;
        self
    }

    pub fn remove_query_params_on_redirect(mut self, remove: bool) -> Self {
        self.config.remove_query_params_on_redirect = remove;
        self
    }

    /// How many times an exchange may be transparently replayed after a
    /// retryable failure. Zero disables replays entirely.
    pub fn max_request_retry(mut self, max_request_retry: usize) -> Self {
        self.config.max_request_retry = max_request_retry;
        self
    }

    pub fn partitioning(mut self, partitioning: Partitioning) -> Self {
        self.config.partitioning = partitioning;
        self
    }

    pub fn request_codec(mut self, codec: Arc<dyn RequestCodec>) -> Self {
        self.config.request_codec = codec;
        self
    }

    /// Authenticator consulted on a 401 challenge to produce a new
    /// `Authorization` header for the replayed request.
    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.config.authenticator = Some(authenticator);
        self
    }

    /// Authenticator consulted on a 407 challenge to produce a new
    /// `Proxy-Authorization` header for the replayed request.
    pub fn proxy_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.config.proxy_authenticator = Some(authenticator);
        self
    }

    /// Appends a filter to the I/O-exception filter chain. Filters run
    /// in registration order; the first one requesting a replay wins.
    pub fn io_exception_filter(mut self, filter: Arc<dyn IoExceptionFilter>) -> Self {
        self.config.io_exception_filters.push(filter);
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_are_clamped_to_at_least_one() {
        let config = ClientConfig::builder()
            .max_connections(Some(0))
            .max_connections_per_host(Some(0))
            .build();
        assert_eq!(config.max_connections, Some(1));
        assert_eq!(config.max_connections_per_host, Some(1));
    }

    #[test]
    fn defaults_disable_limits_and_enable_keep_alive() {
        let config = ClientConfig::default();
        assert!(config.max_connections.is_none());
        assert!(config.max_connections_per_host.is_none());
        assert!(config.keep_alive);
        assert_eq!(config.acquire_free_channel_timeout, Duration::ZERO);
        assert_eq!(config.max_request_retry, DEFAULT_MAX_REQUEST_RETRY);
    }
}
