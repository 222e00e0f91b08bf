//! WAL replication: a `Sender` streams appended entries to a `Receiver`,
//! synchronously or asynchronously, per spec §4.6.
//!
//! The transport itself (the actual peer connection) is out of scope here —
//! the Receiver side is the seam a real network client would sit behind.
//! What this module owns is the buffering/back-pressure/ack-timeout
//! contract, built the way the teacher builds its bounded producer/consumer
//! channel in `execution::journal::AsyncJournal`: a bounded `crossbeam`
//! channel plus a dedicated sender thread, Drop-joined.

use crate::core::errors::RejectReason;
use crossbeam::channel::{self, RecvTimeoutError, Sender as ChannelSender, TrySendError};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMode {
    Sync,
    Async,
    Disabled,
}

#[derive(Debug, Clone)]
pub struct ReplicatedEntry {
    pub sequence: u64,
    pub frame: Vec<u8>,
}

/// Anything that can accept a replicated frame and (for sync mode)
/// acknowledge it. A real implementation ships the frame to a standby
/// process over the network; tests use an in-process channel.
pub trait Receiver: Send + 'static {
    fn receive(&mut self, entry: ReplicatedEntry) -> anyhow::Result<()>;
}

/// A `Receiver` backed by a bounded in-process channel, used for
/// same-process integration tests and as the reference implementation a
/// network transport would wrap.
pub struct ChannelReceiver {
    sink: ChannelSender<ReplicatedEntry>,
}

impl ChannelReceiver {
    pub fn new(sink: ChannelSender<ReplicatedEntry>) -> Self {
        Self { sink }
    }
}

impl Receiver for ChannelReceiver {
    fn receive(&mut self, entry: ReplicatedEntry) -> anyhow::Result<()> {
        self.sink.send(entry)?;
        Ok(())
    }
}

struct SenderInner {
    mode: ReplicationMode,
    max_pending: usize,
    ack_timeout: Duration,
    queue_tx: ChannelSender<ReplicatedEntry>,
    ack_rx: channel::Receiver<u64>,
    pending_count: Arc<AtomicU64>,
    worker: Option<JoinHandle<()>>,
    stop: Arc<AtomicBool>,
}

/// Streams WAL frames to a [`Receiver`] as they are appended.
///
/// `Sync` mode blocks `send` until the receiver acks the sequence (or the
/// ack timeout elapses, surfaced to the caller as a local error). `Async`
/// mode enqueues and returns immediately; once the bounded buffer is full,
/// `send` returns `replication_overflow` rather than silently dropping the
/// entry. `Disabled` is a no-op.
pub struct ReplicationSender {
    inner: Option<SenderInner>,
}

impl ReplicationSender {
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Spawn a worker thread draining `queue_rx` into `receiver`, acking
    /// each processed sequence back over `ack_tx` for synchronous callers.
    pub fn spawn(
        mode: ReplicationMode,
        max_pending: usize,
        ack_timeout: Duration,
        mut receiver: impl Receiver,
    ) -> Self {
        if mode == ReplicationMode::Disabled {
            return Self::disabled();
        }

        let (queue_tx, queue_rx) = channel::bounded::<ReplicatedEntry>(max_pending.max(1));
        let (ack_tx, ack_rx) = channel::unbounded::<u64>();
        let stop = Arc::new(AtomicBool::new(false));
        let pending_count = Arc::new(AtomicU64::new(0));

        let worker_stop = Arc::clone(&stop);
        let worker_pending = Arc::clone(&pending_count);
        let worker = thread::Builder::new()
            .name("wal-replication".into())
            .spawn(move || {
                while let Ok(entry) = queue_rx.recv() {
                    let sequence = entry.sequence;
                    if let Err(e) = receiver.receive(entry) {
                        warn!(error = %e, sequence, "replication receiver failed");
                    }
                    worker_pending.fetch_sub(1, Ordering::SeqCst);
                    let _ = ack_tx.send(sequence);
                    if worker_stop.load(Ordering::SeqCst) {
                        break;
                    }
                }
            })
            .expect("spawning replication worker thread");

        Self {
            inner: Some(SenderInner {
                mode,
                max_pending,
                ack_timeout,
                queue_tx,
                ack_rx,
                pending_count,
                worker: Some(worker),
                stop,
            }),
        }
    }

    /// Submit a freshly-appended WAL frame for replication. No-op under
    /// `Disabled`.
    pub fn send(&self, sequence: u64, frame: Vec<u8>) -> Result<(), RejectReason> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };

        let entry = ReplicatedEntry { sequence, frame };
        match inner.queue_tx.try_send(entry) {
            Ok(()) => {
                inner.pending_count.fetch_add(1, Ordering::SeqCst);
            }
            Err(TrySendError::Full(_)) => return Err(RejectReason::ReplicationOverflow),
            Err(TrySendError::Disconnected(_)) => return Err(RejectReason::ReplicationOverflow),
        }

        if inner.mode == ReplicationMode::Sync {
            self.wait_for_ack(inner, sequence)?;
        }

        Ok(())
    }

    fn wait_for_ack(&self, inner: &SenderInner, sequence: u64) -> Result<(), RejectReason> {
        loop {
            match inner.ack_rx.recv_timeout(inner.ack_timeout) {
                Ok(acked) if acked == sequence => return Ok(()),
                Ok(_) => continue, // an earlier ack arriving out of turn; keep waiting for ours
                Err(RecvTimeoutError::Timeout) => return Err(RejectReason::ReplicationOverflow),
                Err(RecvTimeoutError::Disconnected) => return Err(RejectReason::ReplicationOverflow),
            }
        }
    }

    pub fn pending(&self) -> u64 {
        self.inner
            .as_ref()
            .map(|i| i.pending_count.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    pub fn max_pending(&self) -> usize {
        self.inner.as_ref().map(|i| i.max_pending).unwrap_or(0)
    }

    pub fn mode(&self) -> ReplicationMode {
        self.inner.as_ref().map(|i| i.mode).unwrap_or(ReplicationMode::Disabled)
    }
}

impl Drop for ReplicationSender {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.as_mut() {
            inner.stop.store(true, Ordering::SeqCst);
            drop(inner.queue_tx.clone());
            if let Some(handle) = inner.worker.take() {
                let _ = handle.join();
            }
        }
    }
}

/// The two roles a replicated engine can play. Only the primary owns the
/// WAL write-point; promotion/demotion is driven by an external
/// lease-based coordinator this crate does not implement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Standby,
}

/// Tracks the current role and exposes the promotion/demotion callbacks a
/// coordinator invokes. Demotion aborts in-flight mutations before
/// acknowledging; promotion must complete recovery before accepting
/// external commands — both are caller responsibilities this type only
/// gates with its role flag.
pub struct RoleGate {
    role: Arc<parking_lot::RwLock<Role>>,
}

impl RoleGate {
    pub fn new(initial: Role) -> Self {
        Self {
            role: Arc::new(parking_lot::RwLock::new(initial)),
        }
    }

    pub fn role(&self) -> Role {
        *self.role.read()
    }

    pub fn become_primary(&self) {
        *self.role.write() = Role::Primary;
    }

    pub fn become_standby(&self) {
        *self.role.write() = Role::Standby;
    }

    pub fn is_primary(&self) -> bool {
        self.role() == Role::Primary
    }
}
