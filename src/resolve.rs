//! Bounded retry queue for in-flight peer address lookups.
//!
//! The resolver above this component fires the actual queries (mdns or
//! otherwise); this tracks which peers still owe us an answer and when
//! the next query is due. The queue is fixed-size: overflow evicts the
//! most-backed-off entry rather than blocking or failing the caller,
//! and a lookup whose retry delay would exceed [MAX_RETRY_DELAY] is
//! abandoned with an error log.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use crate::timer::Clock;

pub const RETRY_QUEUE_SIZE: usize = 4;
const INITIAL_RETRY_DELAY: Duration = Duration::from_secs(1);
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(16);

/// Composite peer identity - operational lookups are scoped to a fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerId {
    pub fabric_id: u64,
    pub node_id: u64,
}

#[derive(Debug, Clone, Copy)]
struct Attempt {
    peer: PeerId,
    query_due: Instant,
    next_retry_delay: Duration,
}

pub struct ActiveResolveAttempts {
    clock: Arc<dyn Clock>,
    attempts: [Option<Attempt>; RETRY_QUEUE_SIZE],
}

impl ActiveResolveAttempts {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            attempts: [None; RETRY_QUEUE_SIZE],
        }
    }

    /// Register a lookup for this peer. An existing entry for the same
    /// peer is reset to "due now" with the initial backoff. When the
    /// queue is full the entry with the largest backoff (ties broken by
    /// earliest due time) is evicted - best effort: a late reply for
    /// the evicted peer is still accepted by the wider system, just not
    /// retried by us.
    pub fn mark_pending(&mut self, peer: PeerId) {
        let now = self.clock.now();
        let fresh = Attempt {
            peer,
            query_due: now,
            next_retry_delay: INITIAL_RETRY_DELAY,
        };

        if let Some(a) = self
            .attempts
            .iter_mut()
            .flatten()
            .find(|a| a.peer == peer)
        {
            *a = fresh;
            return;
        }
        if let Some(slot) = self.attempts.iter_mut().find(|s| s.is_none()) {
            *slot = Some(fresh);
            return;
        }

        let mut victim = 0;
        for i in 1..self.attempts.len() {
            let (a, b) = (self.attempts[i].unwrap(), self.attempts[victim].unwrap());
            if a.next_retry_delay > b.next_retry_delay
                || (a.next_retry_delay == b.next_retry_delay && a.query_due < b.query_due)
            {
                victim = i;
            }
        }
        log::error!(
            "resolve queue full - evicting peer {:?} before its reply arrived",
            self.attempts[victim].unwrap().peer
        );
        self.attempts[victim] = Some(fresh);
    }

    /// A reply arrived (or the lookup was cancelled) - stop retrying.
    /// Unknown peers are expected here: boot-time multicast
    /// announcements answer lookups nobody asked for.
    pub fn complete(&mut self, peer: PeerId) {
        for slot in self.attempts.iter_mut() {
            if matches!(slot, Some(a) if a.peer == peer) {
                *slot = None;
                return;
            }
        }
        log::info!("resolve complete for untracked peer {:?}", peer);
    }

    /// Minimum delay until the next entry is due: zero when something
    /// is already overdue, `None` when the queue is empty. Sizes the
    /// event loop's next wait.
    pub fn time_until_next(&self) -> Option<Duration> {
        let now = self.clock.now();
        self.attempts
            .iter()
            .flatten()
            .map(|a| a.query_due.saturating_duration_since(now))
            .min()
    }

    /// Pop the next due peer: its retry delay doubles and its due time
    /// advances to now + the new delay. A lookup whose doubled delay
    /// exceeds [MAX_RETRY_DELAY] is abandoned instead of returned.
    /// Returns at most one peer per call; invoke repeatedly to drain
    /// multiple due entries.
    pub fn next_scheduled_peer(&mut self) -> Option<PeerId> {
        let now = self.clock.now();
        for slot in self.attempts.iter_mut() {
            let Some(a) = slot else { continue };
            if a.query_due > now {
                continue;
            }
            let doubled = a.next_retry_delay * 2;
            if doubled > MAX_RETRY_DELAY {
                log::error!(
                    "abandoning resolve of peer {:?} - retry delay past {:?}",
                    a.peer,
                    MAX_RETRY_DELAY
                );
                *slot = None;
                continue;
            }
            a.next_retry_delay = doubled;
            a.query_due = now + doubled;
            return Some(a.peer);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::ManualClock;

    fn peer(n: u64) -> PeerId {
        PeerId {
            fabric_id: 1,
            node_id: n,
        }
    }

    fn setup() -> (Arc<ManualClock>, ActiveResolveAttempts) {
        let clock = Arc::new(ManualClock::new());
        let attempts = ActiveResolveAttempts::new(clock.clone());
        (clock, attempts)
    }

    #[test]
    fn backoff_doubles_until_abandoned() {
        let (clock, mut attempts) = setup();
        attempts.mark_pending(peer(1));

        let mut delays = Vec::new();
        loop {
            match attempts.time_until_next() {
                Some(d) => clock.advance(d),
                None => break,
            }
            if attempts.next_scheduled_peer() == Some(peer(1)) {
                delays.push(attempts.time_until_next().unwrap());
            }
        }
        // initial query due immediately, then doubling up to the cap
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(16),
            ]
        );
        // abandoned - the peer is never scheduled again
        assert_eq!(attempts.next_scheduled_peer(), None);
        assert_eq!(attempts.time_until_next(), None);
    }

    #[test]
    fn complete_clears_entry() {
        let (_clock, mut attempts) = setup();
        attempts.mark_pending(peer(1));
        attempts.mark_pending(peer(2));
        attempts.complete(peer(1));
        assert_eq!(attempts.next_scheduled_peer(), Some(peer(2)));
        assert_eq!(attempts.next_scheduled_peer(), None);
    }

    #[test]
    fn complete_of_unknown_peer_is_harmless() {
        let (_clock, mut attempts) = setup();
        attempts.mark_pending(peer(1));
        attempts.complete(peer(99));
        assert_eq!(attempts.next_scheduled_peer(), Some(peer(1)));
    }

    #[test]
    fn mark_pending_resets_existing_entry() {
        let (_clock, mut attempts) = setup();
        attempts.mark_pending(peer(1));
        assert_eq!(attempts.next_scheduled_peer(), Some(peer(1)));
        // entry now backed off into the future; re-marking makes it due again
        assert!(attempts.time_until_next().unwrap() > Duration::ZERO);
        attempts.mark_pending(peer(1));
        assert_eq!(attempts.time_until_next(), Some(Duration::ZERO));
    }

    #[test]
    fn overflow_evicts_most_backed_off() {
        let (clock, mut attempts) = setup();
        attempts.mark_pending(peer(1));
        // peer 1 gets scheduled twice - largest backoff in the queue
        assert_eq!(attempts.next_scheduled_peer(), Some(peer(1)));
        clock.advance(Duration::from_secs(2));
        assert_eq!(attempts.next_scheduled_peer(), Some(peer(1)));

        attempts.mark_pending(peer(2));
        attempts.mark_pending(peer(3));
        attempts.mark_pending(peer(4));
        // queue of 4 is full - the fifth evicts peer 1
        attempts.mark_pending(peer(5));

        assert_eq!(attempts.time_until_next(), Some(Duration::ZERO));
        let mut scheduled = Vec::new();
        while let Some(p) = attempts.next_scheduled_peer() {
            scheduled.push(p.node_id);
        }
        scheduled.sort();
        assert_eq!(scheduled, vec![2, 3, 4, 5]);
    }
}
