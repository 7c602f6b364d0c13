use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use dashmap::DashMap;
use tracing::debug;

use crate::ConnexResult;
use crate::channel::{
    Channel, ChannelOwner, DrainAction, DrainingState, HTTP_CODEC_STAGE, SSL_STAGE,
    WS_DECODER_STAGE, WS_ENCODER_STAGE,
};
use crate::config::ClientConfig;
use crate::error::ConnexError;
use crate::future::Exchange;
use crate::partition::{PartitionKey, Partitioning};
use crate::pool::{ChannelPool, DefaultChannelPool, NoopChannelPool};
use crate::semaphore::ConnectionSemaphore;

/// Per-host connection counts reported by [`ClientStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HostStats {
    active: usize,
    idle: usize,
}

impl HostStats {
    pub fn active_connection_count(&self) -> usize {
        self.active
    }

    pub fn idle_connection_count(&self) -> usize {
        self.idle
    }

    pub fn total_connection_count(&self) -> usize {
        self.active + self.idle
    }
}

/// Snapshot of the client's connection bookkeeping.
#[derive(Clone, Debug, Default)]
pub struct ClientStats {
    per_host: HashMap<String, HostStats>,
}

impl ClientStats {
    pub fn per_host(&self) -> &HashMap<String, HostStats> {
        &self.per_host
    }

    pub fn total_connection_count(&self) -> usize {
        self.per_host
            .values()
            .map(HostStats::total_connection_count)
            .sum()
    }

    pub fn total_idle_connection_count(&self) -> usize {
        self.per_host
            .values()
            .map(HostStats::idle_connection_count)
            .sum()
    }
}

/// Top-level owner of the connection-lifecycle machinery: the
/// admission semaphore(s), the channel pool and the registry of every
/// open channel.
pub(crate) struct ChannelManager {
    partitioning: Partitioning,
    pool: Arc<dyn ChannelPool>,
    semaphore: ConnectionSemaphore,
    open_channels: DashMap<u64, Channel>,
    closed: AtomicBool,
}

impl ChannelManager {
    pub(crate) fn new(config: &ClientConfig) -> Arc<Self> {
        let pool: Arc<dyn ChannelPool> = if config.keep_alive {
            DefaultChannelPool::from_config(config)
        } else {
            NoopChannelPool::new()
        };
        Arc::new(Self {
            partitioning: config.partitioning,
            pool,
            semaphore: ConnectionSemaphore::from_config(config),
            open_channels: DashMap::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub(crate) fn partitioning(&self) -> Partitioning {
        self.partitioning
    }

    pub(crate) fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.pool.is_open()
    }

    /// Admits one new connection for the partition. The pool-closed
    /// condition is checked before any permit is touched, so a closed
    /// client can never surface an admission error instead of
    /// `PoolAlreadyClosed`.
    pub(crate) async fn acquire_channel_lock(&self, partition: &PartitionKey) -> ConnexResult<()> {
        if !self.is_open() {
            return Err(ConnexError::PoolAlreadyClosed);
        }
        self.semaphore.acquire(partition).await
    }

    pub(crate) fn release_channel_lock(&self, partition: &PartitionKey) {
        self.semaphore.release(partition);
    }

    pub(crate) fn poll(&self, partition: &PartitionKey) -> Option<Channel> {
        self.pool.poll(partition)
    }

    /// Hands a finished channel back to the pool, or closes it when it
    /// is no longer reusable or the pool refuses it. Either way the
    /// channel never leaks.
    pub(crate) fn try_to_offer_channel_to_pool(
        &self,
        channel: &Channel,
        exchange: &Exchange,
        keep_alive: bool,
        partition: &PartitionKey,
    ) {
        if channel.is_active() && keep_alive {
            debug!(channel = channel.id(), partition = %partition, "returning channel to pool");
            channel.set_discard();
            if self.pool.offer(channel.clone(), partition) {
                exchange.handler(|handler| handler.on_connection_offer(channel));
            } else {
                // rejected by the pool
                self.close_channel(channel);
            }
        } else {
            self.close_channel(channel);
        }
    }

    /// Arms the one-shot drain callback: once the last chunk of the
    /// current response is observed the channel is handed back to the
    /// pool under the given partition.
    pub(crate) fn drain_channel_and_offer(
        &self,
        channel: &Channel,
        exchange: &Exchange,
        keep_alive: bool,
        partition: PartitionKey,
    ) {
        channel.set_owner(ChannelOwner::Draining(DrainingState {
            exchange: exchange.clone(),
            action: DrainAction::OfferToPool {
                keep_alive,
                partition,
            },
        }));
    }

    /// Tracks a newly-connected channel in the open-channel registry.
    /// When a connection slot was consumed for it, release moves to the
    /// channel's close hook so the permit is returned exactly once no
    /// matter which path closes the channel.
    pub(crate) fn register_open_channel(
        self: &Arc<Self>,
        channel: &Channel,
        permit: Option<PartitionKey>,
    ) {
        self.open_channels.insert(channel.id(), channel.clone());
        let manager = Arc::downgrade(self);
        let channel_id = channel.id();
        channel.on_close(Box::new(move || {
            if let Some(manager) = manager.upgrade() {
                manager.open_channels.remove(&channel_id);
                if let Some(partition) = &permit {
                    manager.release_channel_lock(partition);
                }
            }
        }));
    }

    pub(crate) fn close_channel(&self, channel: &Channel) {
        debug!(channel = channel.id(), "closing channel");
        channel.set_discard();
        self.pool.remove_all(channel);
        channel.close();
    }

    pub(crate) fn flush_partitions(&self, predicate: &dyn Fn(&PartitionKey) -> bool) {
        self.pool.flush_partitions(predicate);
    }

    // pipeline upgrades; these re-frame a live channel, so each one is
    // sequenced through the pipeline lock and only ever runs while the
    // channel has no in-flight reads being demultiplexed by the old
    // layout (after a drain, or right after connect)

    pub(crate) fn add_tls_stage(&self, channel: &Channel) {
        channel.pipeline_add_first(SSL_STAGE);
    }

    pub(crate) fn upgrade_pipeline_for_websockets(&self, channel: &Channel) {
        channel.pipeline_add_after(HTTP_CODEC_STAGE, WS_ENCODER_STAGE);
        channel.pipeline_add_after(WS_ENCODER_STAGE, WS_DECODER_STAGE);
        channel.pipeline_remove(HTTP_CODEC_STAGE);
    }

    /// After a CONNECT tunnel is established the channel re-frames:
    /// the old codec goes away and, for a secured target, a TLS stage
    /// now sits below a fresh codec.
    pub(crate) fn update_pipeline_for_tunneling(&self, channel: &Channel, secured: bool) {
        channel.pipeline_remove(HTTP_CODEC_STAGE);
        if secured {
            channel.pipeline_add_first(SSL_STAGE);
            channel.pipeline_add_after(SSL_STAGE, HTTP_CODEC_STAGE);
        } else {
            channel.pipeline_add_first(HTTP_CODEC_STAGE);
        }
    }

    /// Idempotent shutdown: force-closes every open channel and
    /// destroys the pool. Safe to call while exchanges are in flight;
    /// their channels close underneath them and they fail over the
    /// regular closed-channel path.
    pub(crate) fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let channels: Vec<Channel> = self
            .open_channels
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for channel in channels {
            channel.set_discard();
            channel.close();
        }
        self.open_channels.clear();
        self.pool.destroy();
    }

    pub(crate) fn client_stats(&self) -> ClientStats {
        let mut per_host: HashMap<String, HostStats> = HashMap::new();

        let mut total_per_host: HashMap<String, usize> = HashMap::new();
        for entry in self.open_channels.iter() {
            if let Some(address) = entry.value().remote_address() {
                *total_per_host.entry(address.ip().to_string()).or_insert(0) += 1;
            }
        }
        let idle_per_host = self.pool.idle_channel_count_per_host();

        for (host, total) in total_per_host {
            let idle = idle_per_host.get(&host).copied().unwrap_or(0);
            per_host.insert(
                host,
                HostStats {
                    active: total.saturating_sub(idle),
                    idle,
                },
            );
        }
        for (host, idle) in idle_per_host {
            per_host.entry(host).or_insert(HostStats { active: 0, idle });
        }

        ClientStats { per_host }
    }

    #[cfg(test)]
    pub(crate) fn open_channel_count(&self) -> usize {
        self.open_channels.len()
    }

    #[cfg(test)]
    pub(crate) fn semaphore(&self) -> &ConnectionSemaphore {
        &self.semaphore
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::NoopResponseHandler;
    use crate::request::Request;
    use std::sync::Weak;
    use std::time::Duration;

    fn partition(host: &str) -> PartitionKey {
        Partitioning::PerHost.partition_key(
            &format!("http://{host}/").parse().expect("uri"),
            None,
            None,
        )
    }

    fn test_exchange() -> Exchange {
        let request = Request::get("http://example.com/").build().expect("request");
        Exchange::new(request, Box::new(NoopResponseHandler), 5, Weak::new()).0
    }

    #[tokio::test]
    async fn offer_rejection_closes_the_channel() {
        let config = ClientConfig::builder().keep_alive(false).build();
        let manager = ChannelManager::new(&config);
        let channel = Channel::detached();
        let exchange = test_exchange();

        // the no-op pool refuses every offer; the channel must be
        // closed, not leaked
        manager.try_to_offer_channel_to_pool(&channel, &exchange, true, &partition("example.com"));
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn non_keep_alive_hand_back_closes_the_channel() {
        let config = ClientConfig::default();
        let manager = ChannelManager::new(&config);
        let channel = Channel::detached();
        let exchange = test_exchange();

        manager.try_to_offer_channel_to_pool(&channel, &exchange, false, &partition("example.com"));
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn accepted_offer_is_pollable_again() {
        let config = ClientConfig::default();
        let manager = ChannelManager::new(&config);
        let channel = Channel::detached();
        let exchange = test_exchange();
        let key = partition("example.com");

        manager.try_to_offer_channel_to_pool(&channel, &exchange, true, &key);
        assert!(channel.is_open());
        assert_eq!(manager.poll(&key).map(|c| c.id()), Some(channel.id()));
        assert!(manager.poll(&key).is_none());
    }

    #[tokio::test]
    async fn closed_manager_reports_pool_already_closed_before_admission() {
        let config = ClientConfig::builder()
            .max_connections(Some(1))
            .acquire_free_channel_timeout(Duration::ZERO)
            .build();
        let manager = ChannelManager::new(&config);
        let key = partition("example.com");

        // exhaust the only permit, then close: the closed check must
        // win over the admission error
        manager.acquire_channel_lock(&key).await.expect("first");
        manager.close();
        let error = manager.acquire_channel_lock(&key).await.unwrap_err();
        assert!(matches!(error, ConnexError::PoolAlreadyClosed));
    }

    #[tokio::test]
    async fn registered_channel_releases_its_permit_exactly_once_on_close() {
        let config = ClientConfig::builder()
            .max_connections(Some(1))
            .acquire_free_channel_timeout(Duration::ZERO)
            .build();
        let manager = ChannelManager::new(&config);
        let key = partition("example.com");

        manager.acquire_channel_lock(&key).await.expect("acquire");
        assert_eq!(manager.semaphore().available_global_permits(), Some(0));

        let channel = Channel::detached();
        manager.register_open_channel(&channel, Some(key.clone()));
        assert_eq!(manager.open_channel_count(), 1);

        channel.close();
        channel.close();
        assert_eq!(manager.open_channel_count(), 0);
        assert_eq!(manager.semaphore().available_global_permits(), Some(1));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_closes_registered_channels() {
        let config = ClientConfig::default();
        let manager = ChannelManager::new(&config);
        let channel = Channel::detached();
        manager.register_open_channel(&channel, None);

        manager.close();
        manager.close();
        assert!(!channel.is_open());
        assert!(!manager.is_open());
        assert!(manager.poll(&partition("example.com")).is_none());
    }

    #[tokio::test]
    async fn tunnel_upgrade_reframes_the_pipeline() {
        let config = ClientConfig::default();
        let manager = ChannelManager::new(&config);
        let channel = Channel::detached();

        manager.update_pipeline_for_tunneling(&channel, true);
        assert_eq!(
            channel.pipeline_stages(),
            vec![SSL_STAGE, HTTP_CODEC_STAGE]
        );

        manager.upgrade_pipeline_for_websockets(&channel);
        assert_eq!(
            channel.pipeline_stages(),
            vec![SSL_STAGE, WS_ENCODER_STAGE, WS_DECODER_STAGE]
        );
    }
}
