use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::channel::Channel;
use crate::config::{ClientConfig, PoolLeaseOrder};
use crate::partition::PartitionKey;
use crate::util::lock_unpoisoned;

/// Storage of idle, reusable channels keyed by partition.
///
/// `offer` must refuse (and not store) channels once the pool is closed
/// or past their TTL; `poll` must never return a channel that another
/// caller (or the background reaper) already claimed.
pub(crate) trait ChannelPool: Send + Sync {
    fn offer(&self, channel: Channel, partition: &PartitionKey) -> bool;

    fn poll(&self, partition: &PartitionKey) -> Option<Channel>;

    /// Purges a specific channel from whichever partition holds it.
    fn remove_all(&self, channel: &Channel) -> bool;

    /// Closes and drops every idle channel of the matching partitions.
    fn flush_partitions(&self, predicate: &dyn Fn(&PartitionKey) -> bool);

    fn is_open(&self) -> bool;

    /// Idempotent; afterwards `offer` always returns false and `poll`
    /// always returns `None`.
    fn destroy(&self);

    fn idle_channel_count_per_host(&self) -> HashMap<String, usize>;
}

/// One pooled entry. The `taken` flag is the single arbitration point
/// between `poll` and the idle reaper: whoever wins the swap owns the
/// channel, the loser must walk away.
pub(crate) struct IdleChannel {
    channel: Channel,
    since: Instant,
    taken: AtomicBool,
}

impl IdleChannel {
    fn new(channel: Channel, since: Instant) -> Self {
        Self {
            channel,
            since,
            taken: AtomicBool::new(false),
        }
    }

    pub(crate) fn take_ownership(&self) -> bool {
        !self.taken.swap(true, Ordering::AcqRel)
    }
}

pub(crate) struct DefaultChannelPool {
    partitions: DashMap<PartitionKey, VecDeque<Arc<IdleChannel>>>,
    closed: AtomicBool,
    max_idle_time: Option<Duration>,
    connection_ttl: Option<Duration>,
    lease_order: PoolLeaseOrder,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl DefaultChannelPool {
    pub(crate) fn from_config(config: &ClientConfig) -> Arc<Self> {
        Self::new(
            config.pooled_connection_idle_timeout,
            config.connection_ttl,
            config.pool_lease_order,
            config.pool_cleaner_period,
        )
    }

    pub(crate) fn new(
        max_idle_time: Option<Duration>,
        connection_ttl: Option<Duration>,
        lease_order: PoolLeaseOrder,
        cleaner_period: Duration,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            partitions: DashMap::new(),
            closed: AtomicBool::new(false),
            max_idle_time,
            connection_ttl,
            lease_order,
            reaper: Mutex::new(None),
        });

        if max_idle_time.is_some() || connection_ttl.is_some() {
            // scan at least as often as the tightest enabled limit
            let period = [Some(cleaner_period), max_idle_time, connection_ttl]
                .into_iter()
                .flatten()
                .min()
                .unwrap_or(cleaner_period)
                .max(Duration::from_millis(1));
            let handle = tokio::spawn(reaper_loop(Arc::downgrade(&pool), period));
            *lock_unpoisoned(&pool.reaper) = Some(handle);
        }

        pool
    }

    fn is_ttl_expired(&self, channel: &Channel, now: Instant) -> bool {
        let Some(ttl) = self.connection_ttl else {
            return false;
        };
        channel
            .birth_instant()
            .is_some_and(|at| now.saturating_duration_since(at) >= ttl)
    }

    fn is_idle_timeout_expired(&self, idle: &IdleChannel, now: Instant) -> bool {
        self.max_idle_time
            .is_some_and(|timeout| now.saturating_duration_since(idle.since) >= timeout)
    }

    fn is_expired(&self, idle: &IdleChannel, now: Instant) -> bool {
        self.is_idle_timeout_expired(idle, now)
            || !idle.channel.is_active()
            || self.is_ttl_expired(&idle.channel, now)
    }

    /// One reaper scan: compute the candidate set, claim each candidate
    /// through the ownership swap (skipping entries a concurrent `poll`
    /// got to first), close the claimed ones and drop them from their
    /// deques. Returns how many channels were closed.
    pub(crate) fn run_eviction_pass(&self, now: Instant) -> usize {
        if self.closed.load(Ordering::Acquire) {
            return 0;
        }

        let mut to_close: Vec<Channel> = Vec::new();
        for mut entry in self.partitions.iter_mut() {
            let deque = entry.value_mut();
            let candidates: Vec<Arc<IdleChannel>> = deque
                .iter()
                .filter(|idle| self.is_expired(idle, now))
                .cloned()
                .collect();
            if candidates.is_empty() {
                continue;
            }

            let claimed: Vec<Arc<IdleChannel>> = candidates
                .into_iter()
                .filter(|idle| idle.take_ownership())
                .collect();
            if claimed.is_empty() {
                continue;
            }

            deque.retain(|idle| !claimed.iter().any(|taken| Arc::ptr_eq(taken, idle)));
            to_close.extend(claimed.iter().map(|idle| idle.channel.clone()));
        }

        let closed_count = to_close.len();
        for channel in to_close {
            trace!(channel = channel.id(), "closing expired idle channel");
            channel.set_discard();
            channel.close();
        }
        if closed_count > 0 {
            debug!(closed = closed_count, "idle channel eviction pass");
        }
        closed_count
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self, partition: &PartitionKey) -> usize {
        self.partitions
            .get(partition)
            .map(|deque| deque.len())
            .unwrap_or(0)
    }
}

impl ChannelPool for DefaultChannelPool {
    fn offer(&self, channel: Channel, partition: &PartitionKey) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }

        let now = Instant::now();
        if self.is_ttl_expired(&channel, now) {
            return false;
        }

        // mark discarded before the entry becomes visible to other
        // threads: a server push racing the hand-back must find a
        // channel that drops unsolicited events
        channel.set_discard();

        let idle = Arc::new(IdleChannel::new(channel.clone(), now));
        self.partitions
            .entry(partition.clone())
            .or_default()
            .push_front(idle);

        if self.connection_ttl.is_some() {
            channel.record_birth(now, partition.clone());
        }
        true
    }

    fn poll(&self, partition: &PartitionKey) -> Option<Channel> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }

        let mut rejected: Vec<Channel> = Vec::new();
        let leased = {
            let mut deque = self.partitions.get_mut(partition)?;
            loop {
                let idle = match self.lease_order {
                    PoolLeaseOrder::Lifo => deque.pop_front(),
                    PoolLeaseOrder::Fifo => deque.pop_back(),
                };
                let Some(idle) = idle else {
                    break None;
                };
                if !idle.channel.is_active() {
                    trace!(
                        channel = idle.channel.id(),
                        "pooled channel is inactive, probably remotely closed"
                    );
                    rejected.push(idle.channel.clone());
                    continue;
                }
                if !idle.take_ownership() {
                    trace!(
                        channel = idle.channel.id(),
                        "could not take ownership, channel is being expired"
                    );
                    continue;
                }
                break Some(idle.channel.clone());
            }
        };

        for channel in rejected {
            channel.close();
        }
        leased
    }

    fn remove_all(&self, channel: &Channel) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        let Some(partition) = channel.birth_partition() else {
            return false;
        };
        let Some(mut deque) = self.partitions.get_mut(partition) else {
            return false;
        };
        let before = deque.len();
        deque.retain(|idle| idle.channel.id() != channel.id());
        before != deque.len()
    }

    fn flush_partitions(&self, predicate: &dyn Fn(&PartitionKey) -> bool) {
        let matching: Vec<PartitionKey> = self
            .partitions
            .iter()
            .filter(|entry| predicate(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();

        for partition in matching {
            let Some((_, deque)) = self.partitions.remove(&partition) else {
                continue;
            };
            for idle in deque {
                if idle.take_ownership() {
                    idle.channel.set_discard();
                    idle.channel.close();
                }
            }
        }
    }

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn destroy(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(reaper) = lock_unpoisoned(&self.reaper).take() {
            reaper.abort();
        }
        self.partitions.clear();
    }

    fn idle_channel_count_per_host(&self) -> HashMap<String, usize> {
        let mut counts = HashMap::new();
        for entry in self.partitions.iter() {
            if entry.value().is_empty() {
                continue;
            }
            *counts.entry(entry.key().host().to_owned()).or_insert(0) += entry.value().len();
        }
        counts
    }
}

impl Drop for DefaultChannelPool {
    fn drop(&mut self) {
        if let Some(reaper) = lock_unpoisoned(&self.reaper).take() {
            reaper.abort();
        }
    }
}

async fn reaper_loop(pool: Weak<DefaultChannelPool>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately; skip it so a fresh pool is
    // not scanned before anything could expire
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(pool) = pool.upgrade() else {
            return;
        };
        if !pool.is_open() {
            return;
        }
        pool.run_eviction_pass(Instant::now());
    }
}

/// Pool backend used when keep-alive is disabled: nothing is ever
/// stored, every hand-back is refused so the channel gets closed.
pub(crate) struct NoopChannelPool {
    closed: AtomicBool,
}

impl NoopChannelPool {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            closed: AtomicBool::new(false),
        })
    }
}

impl ChannelPool for NoopChannelPool {
    fn offer(&self, _channel: Channel, _partition: &PartitionKey) -> bool {
        false
    }

    fn poll(&self, _partition: &PartitionKey) -> Option<Channel> {
        None
    }

    fn remove_all(&self, _channel: &Channel) -> bool {
        false
    }

    fn flush_partitions(&self, _predicate: &dyn Fn(&PartitionKey) -> bool) {}

    fn is_open(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn destroy(&self) {
        self.closed.store(true, Ordering::Release);
    }

    fn idle_channel_count_per_host(&self) -> HashMap<String, usize> {
        HashMap::new()
    }
}
