use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::trace;

use crate::future::Exchange;
use crate::partition::PartitionKey;
use crate::request::Request;
use crate::util::lock_unpoisoned;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Named pipeline stages. The stages are structural markers consumed by
/// the transport/codec collaborator; the core only sequences their
/// insertion and removal so that no bytes are framed with a stale
/// layout after an upgrade.
pub const SSL_STAGE: &str = "ssl";
pub const HTTP_CODEC_STAGE: &str = "http-codec";
pub const WS_ENCODER_STAGE: &str = "ws-encoder";
pub const WS_DECODER_STAGE: &str = "ws-decoder";

/// What a channel is currently doing, attached as a tagged value so no
/// caller ever has to downcast an opaque attachment.
///
/// `Idle` doubles as the discard marker: unsolicited events delivered
/// to an `Idle` channel are dropped.
pub(crate) enum ChannelOwner {
    Idle,
    Draining(DrainingState),
    InFlight(Exchange),
}

/// Armed on a channel whose current response still has unread chunks.
/// Fires exactly once, when the last chunk of that response is
/// observed, then performs the hand-back or replay action.
pub(crate) struct DrainingState {
    pub(crate) exchange: Exchange,
    pub(crate) action: DrainAction,
}

pub(crate) enum DrainAction {
    /// Hand the drained channel back to the pool, then nothing more:
    /// the exchange already continues (or completed) elsewhere.
    OfferToPool {
        keep_alive: bool,
        partition: PartitionKey,
    },
    /// Reuse this very channel for the next request of the exchange.
    SendNextRequest { request: Request },
}

struct ChannelBirth {
    at: Instant,
    partition: PartitionKey,
}

enum ChannelIo {
    Tcp(Option<TcpStream>),
    /// No transport attached; used by unit tests and by collaborators
    /// that take the stream over with [`Channel::take_io`].
    Detached,
}

struct ChannelInner {
    id: u64,
    remote_address: Option<SocketAddr>,
    io: Mutex<ChannelIo>,
    open: AtomicBool,
    active: AtomicBool,
    owner: Mutex<ChannelOwner>,
    pipeline: Mutex<Vec<&'static str>>,
    birth: OnceLock<ChannelBirth>,
    close_hooks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

/// Opaque handle to one bidirectional byte stream. Cheap to clone; all
/// clones refer to the same underlying connection.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Channel")
            .field("id", &self.inner.id)
            .field("remote", &self.inner.remote_address)
            .field("open", &self.is_open())
            .field("active", &self.is_active())
            .finish()
    }
}

impl Channel {
    fn new(io: ChannelIo, remote_address: Option<SocketAddr>) -> Self {
        Self {
            inner: Arc::new(ChannelInner {
                id: NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed),
                remote_address,
                io: Mutex::new(io),
                open: AtomicBool::new(true),
                active: AtomicBool::new(true),
                owner: Mutex::new(ChannelOwner::Idle),
                pipeline: Mutex::new(vec![HTTP_CODEC_STAGE]),
                birth: OnceLock::new(),
                close_hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn from_tcp(stream: TcpStream) -> Self {
        let remote_address = stream.peer_addr().ok();
        Self::new(ChannelIo::Tcp(Some(stream)), remote_address)
    }

    pub(crate) fn detached() -> Self {
        Self::new(ChannelIo::Detached, None)
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.inner.remote_address
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Open and not known to be remotely closed.
    pub fn is_active(&self) -> bool {
        self.is_open() && self.inner.active.load(Ordering::Acquire)
    }

    /// Marks the channel remotely closed without running the close
    /// hooks; the owning manager decides when to fully close it.
    pub(crate) fn set_inactive(&self) {
        self.inner.active.store(false, Ordering::Release);
    }

    /// A channel is secure once a TLS stage sits in its pipeline.
    pub fn is_secure(&self) -> bool {
        self.pipeline_contains(SSL_STAGE)
    }

    /// Hands the transport stream over to a codec collaborator. The
    /// channel stays open; writes through [`Channel::write_all`] become
    /// no-ops from then on.
    pub fn take_io(&self) -> Option<TcpStream> {
        match &mut *lock_unpoisoned(&self.inner.io) {
            ChannelIo::Tcp(stream) => stream.take(),
            ChannelIo::Detached => None,
        }
    }

    pub(crate) async fn write_all(&self, bytes: &[u8]) -> std::io::Result<()> {
        if !self.is_open() {
            return Err(std::io::ErrorKind::NotConnected.into());
        }
        let stream = match &mut *lock_unpoisoned(&self.inner.io) {
            ChannelIo::Tcp(stream) => stream.take(),
            ChannelIo::Detached => None,
        };
        let Some(mut stream) = stream else {
            // detached or concurrently closed; nothing to write to
            return Ok(());
        };
        let result = async {
            stream.write_all(bytes).await?;
            stream.flush().await
        }
        .await;
        if self.is_open() {
            if let ChannelIo::Tcp(slot) = &mut *lock_unpoisoned(&self.inner.io) {
                *slot = Some(stream);
            }
        }
        result
    }

    /// Idempotent close: marks the channel closed, drops the transport
    /// and runs the close hooks exactly once. Never fails; teardown
    /// problems must not mask the error being reported elsewhere.
    pub fn close(&self) {
        if self.inner.open.swap(false, Ordering::AcqRel) {
            self.inner.active.store(false, Ordering::Release);
            let io = std::mem::replace(&mut *lock_unpoisoned(&self.inner.io), ChannelIo::Detached);
            drop(io);
            let hooks = std::mem::take(&mut *lock_unpoisoned(&self.inner.close_hooks));
            for hook in hooks {
                hook();
            }
            trace!(channel = self.inner.id, "channel closed");
        }
    }

    /// Registers a hook to run when the channel closes. If the channel
    /// is already closed the hook runs immediately.
    pub(crate) fn on_close(&self, hook: Box<dyn FnOnce() + Send>) {
        if self.is_open() {
            lock_unpoisoned(&self.inner.close_hooks).push(hook);
            // close() may have raced us; re-check so the hook cannot be lost
            if !self.is_open() {
                let hooks = std::mem::take(&mut *lock_unpoisoned(&self.inner.close_hooks));
                for hook in hooks {
                    hook();
                }
            }
        } else {
            hook();
        }
    }

    // owner attachment

    pub(crate) fn set_owner(&self, owner: ChannelOwner) {
        *lock_unpoisoned(&self.inner.owner) = owner;
    }

    /// Marks the channel discarded: any further unsolicited events on
    /// it are dropped.
    pub(crate) fn set_discard(&self) {
        self.set_owner(ChannelOwner::Idle);
    }

    pub(crate) fn take_owner(&self) -> ChannelOwner {
        std::mem::replace(&mut *lock_unpoisoned(&self.inner.owner), ChannelOwner::Idle)
    }

    /// The in-flight exchange, if any, without detaching it.
    pub(crate) fn current_exchange(&self) -> Option<Exchange> {
        match &*lock_unpoisoned(&self.inner.owner) {
            ChannelOwner::InFlight(exchange) => Some(exchange.clone()),
            _ => None,
        }
    }

    /// Whether the channel is waiting out the tail of a response before
    /// its next action; a codec can use this to keep feeding chunks
    /// without starting a fresh exchange.
    pub fn is_draining(&self) -> bool {
        matches!(
            &*lock_unpoisoned(&self.inner.owner),
            ChannelOwner::Draining(_)
        )
    }

    // TTL birth record

    pub(crate) fn record_birth(&self, at: Instant, partition: PartitionKey) {
        let _ = self.inner.birth.set(ChannelBirth { at, partition });
    }

    pub(crate) fn birth_instant(&self) -> Option<Instant> {
        self.inner.birth.get().map(|birth| birth.at)
    }

    pub(crate) fn birth_partition(&self) -> Option<&PartitionKey> {
        self.inner.birth.get().map(|birth| &birth.partition)
    }

    // pipeline

    pub fn pipeline_stages(&self) -> Vec<&'static str> {
        lock_unpoisoned(&self.inner.pipeline).clone()
    }

    pub fn pipeline_contains(&self, name: &str) -> bool {
        lock_unpoisoned(&self.inner.pipeline)
            .iter()
            .any(|stage| *stage == name)
    }

    pub(crate) fn pipeline_add_first(&self, name: &'static str) {
        let mut pipeline = lock_unpoisoned(&self.inner.pipeline);
        if !pipeline.contains(&name) {
            pipeline.insert(0, name);
        }
    }

    pub(crate) fn pipeline_add_after(&self, existing: &str, name: &'static str) {
        let mut pipeline = lock_unpoisoned(&self.inner.pipeline);
        if pipeline.contains(&name) {
            return;
        }
        if let Some(position) = pipeline.iter().position(|stage| *stage == existing) {
            pipeline.insert(position + 1, name);
        } else {
            pipeline.push(name);
        }
    }

    pub(crate) fn pipeline_remove(&self, name: &str) -> bool {
        let mut pipeline = lock_unpoisoned(&self.inner.pipeline);
        if let Some(position) = pipeline.iter().position(|stage| *stage == name) {
            pipeline.remove(position);
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn close_is_idempotent_and_runs_hooks_once() {
        let channel = Channel::detached();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        channel.on_close(Box::new(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));

        channel.close();
        channel.close();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!channel.is_open());
        assert!(!channel.is_active());
    }

    #[test]
    fn late_close_hook_runs_immediately() {
        let channel = Channel::detached();
        channel.close();

        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = Arc::clone(&fired);
        channel.on_close(Box::new(move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pipeline_mutations_keep_order() {
        let channel = Channel::detached();
        assert!(channel.pipeline_contains(HTTP_CODEC_STAGE));
        assert!(!channel.is_secure());

        channel.pipeline_add_first(SSL_STAGE);
        assert!(channel.is_secure());
        assert_eq!(
            channel.pipeline_stages(),
            vec![SSL_STAGE, HTTP_CODEC_STAGE]
        );

        channel.pipeline_add_after(HTTP_CODEC_STAGE, WS_ENCODER_STAGE);
        channel.pipeline_add_after(WS_ENCODER_STAGE, WS_DECODER_STAGE);
        assert!(channel.pipeline_remove(HTTP_CODEC_STAGE));
        assert_eq!(
            channel.pipeline_stages(),
            vec![SSL_STAGE, WS_ENCODER_STAGE, WS_DECODER_STAGE]
        );
    }

    #[test]
    fn birth_is_recorded_once() {
        let channel = Channel::detached();
        let first = Instant::now();
        let key = crate::partition::Partitioning::PerHost.partition_key(
            &"http://example.com/".parse().expect("uri"),
            None,
            None,
        );
        channel.record_birth(first, key.clone());
        channel.record_birth(first + std::time::Duration::from_secs(5), key);
        assert_eq!(channel.birth_instant(), Some(first));
    }
}
