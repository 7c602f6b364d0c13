use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::time::timeout;

use crate::ConnexResult;
use crate::config::ClientConfig;
use crate::error::ConnexError;
use crate::partition::PartitionKey;
use crate::util::lock_unpoisoned;

/// Admission control for new connections.
///
/// `acquire` and `release` are paired one-to-one per logical connection
/// attempt: a failed acquire never leaves a permit taken, and a permit
/// taken for a connection that is later discarded is released exactly
/// once (by the channel close hook holding the partition key).
pub(crate) enum ConnectionSemaphore {
    /// No limit configured; acquisition always succeeds and release is
    /// a no-op.
    Unbounded,
    Global(GlobalSemaphore),
    PerHost(PerHostSemaphore),
    /// Global first, then per-host with whatever remains of the timeout
    /// budget. On a per-host failure the global permit is released
    /// before the error propagates.
    Combined {
        global: GlobalSemaphore,
        per_host: PerHostSemaphore,
    },
}

impl ConnectionSemaphore {
    pub(crate) fn from_config(config: &ClientConfig) -> Self {
        let acquire_timeout = config.acquire_free_channel_timeout;
        match (config.max_connections, config.max_connections_per_host) {
            (Some(max), Some(max_per_host)) => Self::Combined {
                global: GlobalSemaphore::new(max, acquire_timeout),
                per_host: PerHostSemaphore::new(max_per_host, acquire_timeout),
            },
            (Some(max), None) => Self::Global(GlobalSemaphore::new(max, acquire_timeout)),
            (None, Some(max_per_host)) => {
                Self::PerHost(PerHostSemaphore::new(max_per_host, acquire_timeout))
            }
            (None, None) => Self::Unbounded,
        }
    }

    pub(crate) async fn acquire(&self, partition: &PartitionKey) -> ConnexResult<()> {
        match self {
            Self::Unbounded => Ok(()),
            Self::Global(global) => global.acquire_within(global.acquire_timeout).await,
            Self::PerHost(per_host) => {
                per_host
                    .acquire_within(partition, per_host.acquire_timeout)
                    .await
            }
            Self::Combined { global, per_host } => {
                let started = Instant::now();
                global.acquire_within(global.acquire_timeout).await?;
                let remaining = global.acquire_timeout.saturating_sub(started.elapsed());
                match per_host.acquire_within(partition, remaining).await {
                    Ok(()) => Ok(()),
                    Err(error) => {
                        // the global permit must not leak past a per-host failure
                        global.release();
                        Err(error)
                    }
                }
            }
        }
    }

    pub(crate) fn release(&self, partition: &PartitionKey) {
        match self {
            Self::Unbounded => {}
            Self::Global(global) => global.release(),
            Self::PerHost(per_host) => per_host.release(partition),
            Self::Combined { global, per_host } => {
                per_host.release(partition);
                global.release();
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn available_global_permits(&self) -> Option<usize> {
        match self {
            Self::Global(global) | Self::Combined { global, .. } => Some(global.available()),
            _ => None,
        }
    }
}

pub(crate) struct GlobalSemaphore {
    permits: Arc<Semaphore>,
    max: usize,
    acquire_timeout: Duration,
}

impl GlobalSemaphore {
    fn new(max: usize, acquire_timeout: Duration) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max)),
            max,
            acquire_timeout,
        }
    }

    async fn acquire_within(&self, budget: Duration) -> ConnexResult<()> {
        acquire_with_budget(&self.permits, budget)
            .await
            .map_err(|_| ConnexError::TooManyConnections { max: self.max })
    }

    fn release(&self) {
        self.permits.add_permits(1);
    }

    #[cfg(test)]
    fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

pub(crate) struct PerHostSemaphore {
    partitions: Mutex<HashMap<PartitionKey, Arc<Semaphore>>>,
    max_per_host: usize,
    acquire_timeout: Duration,
}

impl PerHostSemaphore {
    fn new(max_per_host: usize, acquire_timeout: Duration) -> Self {
        Self {
            partitions: Mutex::new(HashMap::new()),
            max_per_host,
            acquire_timeout,
        }
    }

    fn partition_semaphore(&self, partition: &PartitionKey) -> Arc<Semaphore> {
        let mut partitions = lock_unpoisoned(&self.partitions);
        partitions
            .entry(partition.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(self.max_per_host)))
            .clone()
    }

    async fn acquire_within(&self, partition: &PartitionKey, budget: Duration) -> ConnexResult<()> {
        let semaphore = self.partition_semaphore(partition);
        acquire_with_budget(&semaphore, budget)
            .await
            .map_err(|_| ConnexError::TooManyConnectionsPerHost {
                max: self.max_per_host,
            })
    }

    fn release(&self, partition: &PartitionKey) {
        if let Some(semaphore) = lock_unpoisoned(&self.partitions).get(partition) {
            semaphore.add_permits(1);
        }
    }

    #[cfg(test)]
    pub(crate) fn available(&self, partition: &PartitionKey) -> Option<usize> {
        lock_unpoisoned(&self.partitions)
            .get(partition)
            .map(|semaphore| semaphore.available_permits())
    }
}

struct AcquireFailed;

/// Takes one permit (forgetting it so release is explicit via
/// `add_permits`). A zero budget means try-once, never wait.
async fn acquire_with_budget(semaphore: &Arc<Semaphore>, budget: Duration) -> Result<(), AcquireFailed> {
    if budget.is_zero() {
        return match semaphore.try_acquire() {
            Ok(permit) => {
                permit.forget();
                Ok(())
            }
            Err(_) => Err(AcquireFailed),
        };
    }

    match timeout(budget, semaphore.acquire()).await {
        Ok(Ok(permit)) => {
            permit.forget();
            Ok(())
        }
        // closed semaphores and elapsed budgets both mean no permit
        Ok(Err(_)) | Err(_) => Err(AcquireFailed),
    }
}
