//! Monotonic clock abstraction and single-shot timers with
//! cancel-by-identity semantics.
//!
//! The core components never read the system clock directly - they get
//! a [Clock] injected so tests can drive time by hand. Timers are keyed
//! by [TimerKey]; starting a timer with a key that already has one
//! pending replaces it, cancel removes the matching pending timer if
//! any. Fired keys are delivered over an mpsc channel drained by the
//! owner's event loop (single consumer).

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Production clock - std monotonic time.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Manually advanced clock for tests and simulations.
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }
    pub fn advance(&self, d: Duration) {
        let mut offset = self.offset.lock().unwrap();
        *offset += d;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Shared retransmission/ack-flush timer of the reliable message manager.
    Retransmit,
    /// Per-peer counter synchronization timeout.
    CounterSync,
}

/// Timer identity - kind plus a kind-specific id (peer node id for
/// counter sync, 0 for the shared retransmit timer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey {
    pub kind: TimerKind,
    pub id: u64,
}

pub struct TimerService {
    pending: Mutex<HashMap<TimerKey, CancellationToken>>,
    tx: mpsc::UnboundedSender<TimerKey>,
}

impl TimerService {
    /// Returns the service and the channel on which fired timer keys
    /// are delivered.
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TimerKey>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                pending: Mutex::new(HashMap::new()),
                tx,
            }),
            rx,
        )
    }

    /// Arm a single-shot timer. A pending timer with the same key is
    /// replaced.
    pub fn start(self: &Arc<Self>, key: TimerKey, delay: Duration) {
        let token = CancellationToken::new();
        {
            let mut pending = self.pending.lock().unwrap();
            if let Some(old) = pending.insert(key, token.clone()) {
                old.cancel();
            }
        }
        let service = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            {
                let mut pending = service.pending.lock().unwrap();
                pending.remove(&key);
            }
            _ = service.tx.send(key);
        });
    }

    /// Cancel the pending timer with this key, if any.
    pub fn cancel(&self, key: TimerKey) {
        let mut pending = self.pending.lock().unwrap();
        if let Some(token) = pending.remove(&key) {
            token.cancel();
        }
    }
}
