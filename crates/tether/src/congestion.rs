//! Outbound congestion tracking and the send gate.
//!
//! The tracker watches two figures: bytes currently queued for transmission
//! and a decaying count of recently flushed bytes (the channel's observed
//! throughput). From those it publishes a congestion level in [-100, 100]:
//!
//! - `-100`: nothing queued, no pending outbound traffic
//! - `0`: nominal load (queued bytes roughly match capacity)
//! - positive: the sender should throttle
//!
//! The sign carries meaning to consumers (negative = headroom, positive =
//! throttle), so the level is never normalized to an unsigned scale. The
//! level is an atomic: it must be readable from any thread without taking
//! a lock shared with dispatch logic.
//!
//! Senders pass through the gate before enqueuing: while queued bytes sit
//! above the high watermark the sender suspends until the writer has
//! drained below the low watermark, bounded by a stall timeout.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{watch, Notify};

use crate::errors::ChannelError;

/// Queued-byte level above which senders are suspended.
pub const HIGH_WATERMARK: usize = 64 * 1024;
/// Queued-byte level below which suspended senders are released.
pub const LOW_WATERMARK: usize = HIGH_WATERMARK / 2;
/// Upper bound on a single gate wait. A send that stalls this long fails
/// with [`ChannelError::SendStalled`] rather than hanging forever.
pub const SEND_STALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Congestion level reported while nothing is queued.
pub const CONGESTION_IDLE: i32 = -100;

struct Throughput {
    /// Decaying count of recently flushed bytes.
    recent: usize,
    /// Last level published through the watch channel.
    last_level: i32,
}

pub(crate) struct CongestionTracker {
    queued: AtomicUsize,
    closed: AtomicBool,
    level: AtomicI32,
    throughput: Mutex<Throughput>,
    drained: Notify,
    level_tx: watch::Sender<i32>,
}

impl CongestionTracker {
    pub(crate) fn new() -> (std::sync::Arc<Self>, watch::Receiver<i32>) {
        let (level_tx, level_rx) = watch::channel(CONGESTION_IDLE);
        let tracker = std::sync::Arc::new(Self {
            queued: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            level: AtomicI32::new(CONGESTION_IDLE),
            throughput: Mutex::new(Throughput {
                recent: 0,
                last_level: CONGESTION_IDLE,
            }),
            drained: Notify::new(),
            level_tx,
        });
        (tracker, level_rx)
    }

    /// Current congestion level. Lock-free, callable from any thread.
    pub(crate) fn level(&self) -> i32 {
        self.level.load(Ordering::Acquire)
    }

    /// Account for `bytes` handed to the writer queue.
    pub(crate) fn enqueued(&self, bytes: usize) {
        self.queued.fetch_add(bytes, Ordering::AcqRel);
        self.recompute();
    }

    /// Account for `bytes` the writer actually put on the wire.
    pub(crate) fn flushed(&self, bytes: usize) {
        let prev = self.queued.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes, "flushed more bytes than were queued");
        {
            let mut t = lock(&self.throughput);
            t.recent = t.recent - t.recent / 4 + bytes;
        }
        self.recompute();
        if self.queued.load(Ordering::Acquire) < LOW_WATERMARK {
            self.drained.notify_waiters();
        }
    }

    /// Stop gating: the channel is closed, all waiters fail fast.
    pub(crate) fn set_closed(&self) {
        self.closed.store(true, Ordering::Release);
        self.drained.notify_waiters();
    }

    /// Suspend until the outbound queue has headroom.
    ///
    /// This is the backpressure point for `send_command` and friends: not
    /// an error, just a deliberate stall, bounded by [`SEND_STALL_TIMEOUT`].
    pub(crate) async fn ready(&self) -> Result<(), ChannelError> {
        let deadline = tokio::time::Instant::now() + SEND_STALL_TIMEOUT;
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(ChannelError::Closed);
            }
            // Register interest before re-checking so a flush between the
            // check and the await is not a lost wakeup.
            let notified = self.drained.notified();
            if self.queued.load(Ordering::Acquire) < HIGH_WATERMARK {
                return Ok(());
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(ChannelError::SendStalled);
            }
        }
    }

    fn recompute(&self) {
        let mut t = lock(&self.throughput);
        let queued = self.queued.load(Ordering::Acquire);
        let level = compute_level(queued, t.recent);
        self.level.store(level, Ordering::Release);
        if level != t.last_level {
            t.last_level = level;
            let _ = self.level_tx.send(level);
        }
    }
}

/// Level from queued bytes and recent throughput.
///
/// Monotone in `queued`: enqueuing without flushing never lowers the level,
/// and flushing both shrinks the queue and grows `recent`, so it never
/// raises it. Exactly -100 when the queue is empty.
fn compute_level(queued: usize, recent: usize) -> i32 {
    if queued == 0 {
        return CONGESTION_IDLE;
    }
    let capacity = HIGH_WATERMARK.max(recent) as i64;
    let raw = (queued as i64).saturating_mul(100) / capacity - 100;
    raw.clamp(-99, 100) as i32
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idle_tracker_reports_no_traffic() {
        let (tracker, _rx) = CongestionTracker::new();
        assert_eq!(tracker.level(), CONGESTION_IDLE);
    }

    #[test]
    fn enqueue_never_lowers_the_level() {
        let (tracker, _rx) = CongestionTracker::new();
        let mut last = tracker.level();
        for _ in 0..40 {
            tracker.enqueued(8 * 1024);
            let level = tracker.level();
            assert!(level >= last, "level dropped from {last} to {level}");
            last = level;
        }
        assert_eq!(last, 100);
    }

    #[test]
    fn flush_never_raises_the_level() {
        let (tracker, _rx) = CongestionTracker::new();
        tracker.enqueued(2 * HIGH_WATERMARK);
        let mut last = tracker.level();
        for _ in 0..16 {
            tracker.flushed(8 * 1024);
            let level = tracker.level();
            assert!(level <= last, "level rose from {last} to {level}");
            last = level;
        }
        assert_eq!(tracker.level(), CONGESTION_IDLE);
    }

    #[test]
    fn nominal_load_sits_at_zero() {
        assert_eq!(compute_level(HIGH_WATERMARK, 0), 0);
        assert_eq!(compute_level(2 * HIGH_WATERMARK, 0), 100);
        assert!(compute_level(1, 0) < 0);
        assert_ne!(compute_level(1, 0), CONGESTION_IDLE);
    }

    #[tokio::test]
    async fn gate_blocks_until_drained() {
        let (tracker, _rx) = CongestionTracker::new();
        tracker.enqueued(HIGH_WATERMARK + 1);

        let blocked =
            tokio::time::timeout(Duration::from_millis(50), tracker.ready()).await;
        assert!(blocked.is_err(), "gate should hold above the watermark");

        tracker.flushed(HIGH_WATERMARK + 1);
        tracker.ready().await.unwrap();
    }

    #[tokio::test]
    async fn gate_fails_fast_once_closed() {
        let (tracker, _rx) = CongestionTracker::new();
        tracker.enqueued(HIGH_WATERMARK + 1);
        tracker.set_closed();
        assert!(matches!(
            tracker.ready().await,
            Err(ChannelError::Closed)
        ));
    }
}
