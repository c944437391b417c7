//! Reliable message delivery: per-exchange acknowledgement state and
//! the shared retransmission table.
//!
//! Every reliably-sent message must end with either an application
//! response or a standalone acknowledgement. The per-exchange
//! [ReliableMessageContext] tracks the single ack we currently owe the
//! peer; the manager owns the retransmission table and the shared
//! timer that drives both ack flushing and retransmission with
//! exponential backoff.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use crate::{
    error::Error,
    messages,
    timer::{Clock, TimerKey, TimerKind, TimerService},
    transport::MessageSender,
};

/// Upper bound on concurrently open exchanges, and thereby on the
/// retransmission table and the counter-sync queues.
pub const MAX_EXCHANGES: usize = 8;

/// How long a received reliable message may wait for a piggybacked ack
/// before a standalone one is sent.
pub const ACK_TIMEOUT: Duration = Duration::from_millis(200);
const BASE_RETRANSMIT_INTERVAL: Duration = Duration::from_millis(300);
const MAX_RETRANSMITS: u32 = 4;

const RETRANSMIT_TIMER: TimerKey = TimerKey {
    kind: TimerKind::Retransmit,
    id: 0,
};

/// Ack bookkeeping of one exchange. Owned exclusively by its exchange
/// and mutated only from the single stack task.
#[derive(Debug, Clone, Copy)]
pub struct ReliableMessageContext {
    exchange_id: u16,
    peer: u64,
    flags: u8,
    pending_peer_ack_counter: u32,
    next_ack_time: Instant,
}

impl ReliableMessageContext {
    pub const AUTO_REQUEST_ACK: u8 = 1;
    pub const ACK_PENDING: u8 = 2;
    pub const MSG_RCVD_FROM_PEER: u8 = 4;
    pub const DROP_ACK_DEBUG: u8 = 8;
    pub const OCCUPIED: u8 = 16;

    fn new(now: Instant) -> Self {
        Self {
            exchange_id: 0,
            peer: 0,
            flags: 0,
            pending_peer_ack_counter: 0,
            next_ack_time: now,
        }
    }

    fn is(&self, flag: u8) -> bool {
        (self.flags & flag) != 0
    }
}

struct RetransEntry {
    exchange_id: u16,
    peer: u64,
    msg_counter: u32,
    data: Vec<u8>,
    /// Number of sends so far, the initial transmission included.
    send_count: u32,
    next_send: Instant,
}

pub struct ReliableMessageMgr {
    contexts: [ReliableMessageContext; MAX_EXCHANGES],
    retrans: Vec<RetransEntry>,
    clock: Arc<dyn Clock>,
    sender: Arc<dyn MessageSender>,
    timers: Arc<TimerService>,
}

impl ReliableMessageMgr {
    pub fn new(
        clock: Arc<dyn Clock>,
        sender: Arc<dyn MessageSender>,
        timers: Arc<TimerService>,
    ) -> Self {
        let now = clock.now();
        Self {
            contexts: std::array::from_fn(|_| ReliableMessageContext::new(now)),
            retrans: Vec::new(),
            clock,
            sender,
            timers,
        }
    }

    fn ctx_index(&self, exchange_id: u16) -> Option<usize> {
        self.contexts
            .iter()
            .position(|c| c.is(ReliableMessageContext::OCCUPIED) && c.exchange_id == exchange_id)
    }

    /// Claim a context slot for a new exchange. Allocating an exchange
    /// id that already has one resets it.
    pub fn alloc_context(&mut self, exchange_id: u16, peer: u64) -> Result<(), Error> {
        let idx = match self.ctx_index(exchange_id) {
            Some(idx) => {
                log::debug!("context for exchange {} re-allocated", exchange_id);
                idx
            }
            None => self
                .contexts
                .iter()
                .position(|c| !c.is(ReliableMessageContext::OCCUPIED))
                .ok_or(Error::NoMemory)?,
        };
        self.contexts[idx] = ReliableMessageContext {
            exchange_id,
            peer,
            flags: ReliableMessageContext::OCCUPIED | ReliableMessageContext::AUTO_REQUEST_ACK,
            pending_peer_ack_counter: 0,
            next_ack_time: self.clock.now(),
        };
        Ok(())
    }

    /// Close an exchange: flush an owed ack (best effort), drop its
    /// retransmissions, free the slot.
    pub fn release_context(&mut self, exchange_id: u16) {
        if let Err(e) = self.flush_acks(exchange_id) {
            log::debug!("flush on release of exchange {} failed: {}", exchange_id, e);
        }
        if let Some(idx) = self.ctx_index(exchange_id) {
            self.contexts[idx].flags = 0;
        }
        self.retrans.retain(|e| e.exchange_id != exchange_id);
        self.reschedule();
    }

    pub fn is_ack_pending(&self, exchange_id: u16) -> bool {
        self.ctx_index(exchange_id)
            .map(|i| self.contexts[i].is(ReliableMessageContext::ACK_PENDING))
            .unwrap_or(false)
    }

    pub fn pending_ack_counter(&self, exchange_id: u16) -> Option<u32> {
        let idx = self.ctx_index(exchange_id)?;
        self.contexts[idx]
            .is(ReliableMessageContext::ACK_PENDING)
            .then_some(self.contexts[idx].pending_peer_ack_counter)
    }

    /// Testing aid only: drop all ack processing for this exchange.
    pub fn set_drop_ack_debug(&mut self, exchange_id: u16, drop: bool) {
        if let Some(idx) = self.ctx_index(exchange_id) {
            if drop {
                self.contexts[idx].flags |= ReliableMessageContext::DROP_ACK_DEBUG;
            } else {
                self.contexts[idx].flags &= !ReliableMessageContext::DROP_ACK_DEBUG;
            }
        }
    }

    pub fn outstanding(&self) -> usize {
        self.retrans.len()
    }

    /// Send an encoded frame reliably: enter it into the retransmission
    /// table, then transmit. The frame stays in the table until its
    /// counter is acknowledged or retransmissions are exhausted.
    pub fn send_reliable(&mut self, exchange_id: u16, data: &[u8]) -> Result<(), Error> {
        let idx = self.ctx_index(exchange_id).ok_or(Error::KeyNotFound)?;
        let peer = self.contexts[idx].peer;
        if self.retrans.len() >= MAX_EXCHANGES {
            return Err(Error::NoMemory);
        }
        let (header, _) = messages::MessageHeader::decode(data).map_err(|_| Error::Malformed)?;
        let now = self.clock.now();
        log::trace!(
            "tracking sent message counter:{} exchange:{}",
            header.message_counter,
            exchange_id
        );
        self.retrans.push(RetransEntry {
            exchange_id,
            peer,
            msg_counter: header.message_counter,
            data: data.to_vec(),
            send_count: 1,
            next_send: now + BASE_RETRANSMIT_INTERVAL,
        });
        if let Err(e) = self.sender.send(peer, data) {
            log::debug!("send on exchange {} failed: {}", exchange_id, e);
            self.retrans.pop();
            return Err(e);
        }
        self.reschedule();
        Ok(())
    }

    /// Peer acknowledged `counter` - drop the matching retransmission
    /// entry. An ack with no matching outstanding message (stale or
    /// duplicate) is a reportable protocol error, never retried.
    pub fn handle_rcvd_ack(&mut self, exchange_id: u16, counter: u32) -> Result<(), Error> {
        let pos = self
            .retrans
            .iter()
            .position(|e| e.exchange_id == exchange_id && e.msg_counter == counter)
            .ok_or(Error::InvalidAckCounter)?;
        self.retrans.remove(pos);
        log::trace!("received ack counter:{} exchange:{}", counter, exchange_id);
        self.reschedule();
        Ok(())
    }

    /// A reliable message arrived and the peer expects an ack for
    /// `counter`. Due timer work is expired first so every decision
    /// sees current time; the shared timer is rescheduled on exit
    /// regardless of the path taken.
    pub fn handle_needs_ack(
        &mut self,
        exchange_id: u16,
        counter: u32,
        is_duplicate: bool,
    ) -> Result<(), Error> {
        let now = self.clock.now();
        self.expire_due(now);
        let result = self.handle_needs_ack_inner(exchange_id, counter, is_duplicate, now);
        self.reschedule();
        result
    }

    fn handle_needs_ack_inner(
        &mut self,
        exchange_id: u16,
        counter: u32,
        is_duplicate: bool,
        now: Instant,
    ) -> Result<(), Error> {
        let idx = self.ctx_index(exchange_id).ok_or(Error::KeyNotFound)?;
        if self.contexts[idx].is(ReliableMessageContext::DROP_ACK_DEBUG) {
            log::trace!("drop-ack-debug set, ignoring ack request");
            return Ok(());
        }
        self.contexts[idx].flags |= ReliableMessageContext::MSG_RCVD_FROM_PEER;
        let peer = self.contexts[idx].peer;

        if is_duplicate {
            // A duplicate will never get an application response, so
            // the sender must not be left waiting: ack it right now,
            // keeping any pending ack for a different message intact.
            let saved = {
                let ctx = &self.contexts[idx];
                (ctx.is(ReliableMessageContext::ACK_PENDING)
                    && ctx.pending_peer_ack_counter != counter)
                    .then_some((ctx.pending_peer_ack_counter, ctx.next_ack_time))
            };
            let result = self.send_standalone_ack(exchange_id, peer, counter);
            let ctx = &mut self.contexts[idx];
            match saved {
                Some((pending, due)) => {
                    ctx.pending_peer_ack_counter = pending;
                    ctx.next_ack_time = due;
                }
                None => ctx.flags &= !ReliableMessageContext::ACK_PENDING,
            }
            return result;
        }

        // Pending-ack depth is exactly one: an ack owed for a different
        // message is flushed as a standalone ack before the new counter
        // is recorded.
        let flush = {
            let ctx = &self.contexts[idx];
            (ctx.is(ReliableMessageContext::ACK_PENDING)
                && ctx.pending_peer_ack_counter != counter)
                .then_some(ctx.pending_peer_ack_counter)
        };
        if let Some(old) = flush {
            self.send_standalone_ack(exchange_id, peer, old)?;
        }
        let ctx = &mut self.contexts[idx];
        ctx.pending_peer_ack_counter = counter;
        ctx.next_ack_time = now + ACK_TIMEOUT;
        ctx.flags |= ReliableMessageContext::ACK_PENDING;
        Ok(())
    }

    /// Send the owed standalone ack, if any. Idempotent.
    pub fn flush_acks(&mut self, exchange_id: u16) -> Result<(), Error> {
        let Some(idx) = self.ctx_index(exchange_id) else {
            return Ok(());
        };
        if !self.contexts[idx].is(ReliableMessageContext::ACK_PENDING) {
            return Ok(());
        }
        let (peer, counter) = (
            self.contexts[idx].peer,
            self.contexts[idx].pending_peer_ack_counter,
        );
        self.send_standalone_ack(exchange_id, peer, counter)?;
        self.contexts[idx].flags &= !ReliableMessageContext::ACK_PENDING;
        self.reschedule();
        Ok(())
    }

    fn send_standalone_ack(&self, exchange_id: u16, peer: u64, counter: u32) -> Result<(), Error> {
        let frame = match messages::ack(exchange_id, counter) {
            Ok(f) => f,
            Err(e) => {
                log::error!("failed to encode standalone ack: {:?}", e);
                return Err(Error::Malformed);
            }
        };
        match self.sender.send(peer, &frame) {
            Ok(()) => {
                log::trace!(
                    "sending ack for exchange:{} counter:{}",
                    exchange_id,
                    counter
                );
                Ok(())
            }
            // Unreachable peer is normal on an unreliable network -
            // success for protocol purposes.
            Err(Error::SendFailed) => {
                log::debug!(
                    "standalone ack for exchange:{} counter:{} not sent",
                    exchange_id,
                    counter
                );
                Ok(())
            }
            Err(e) => {
                log::error!("standalone ack send error: {}", e);
                Err(e)
            }
        }
    }

    /// Timer callback: flush overdue acks, retransmit due entries,
    /// rearm.
    pub fn on_timer(&mut self) {
        let now = self.clock.now();
        self.expire_due(now);
        self.reschedule();
    }

    fn expire_due(&mut self, now: Instant) {
        // overdue standalone acks
        for idx in 0..self.contexts.len() {
            let ctx = self.contexts[idx];
            if ctx.is(ReliableMessageContext::OCCUPIED)
                && ctx.is(ReliableMessageContext::ACK_PENDING)
                && ctx.next_ack_time <= now
            {
                if self
                    .send_standalone_ack(ctx.exchange_id, ctx.peer, ctx.pending_peer_ack_counter)
                    .is_ok()
                {
                    self.contexts[idx].flags &= !ReliableMessageContext::ACK_PENDING;
                }
            }
        }

        // due retransmissions
        let mut i = 0;
        while i < self.retrans.len() {
            if self.retrans[i].next_send <= now {
                if self.retrans[i].send_count > MAX_RETRANSMITS {
                    let e = self.retrans.remove(i);
                    log::warn!(
                        "giving up on counter:{} exchange:{} after {} sends",
                        e.msg_counter,
                        e.exchange_id,
                        e.send_count
                    );
                    continue;
                }
                let (peer, data) = (self.retrans[i].peer, self.retrans[i].data.clone());
                if let Err(e) = self.sender.send(peer, &data) {
                    log::debug!("retransmit failed: {}", e);
                }
                let entry = &mut self.retrans[i];
                entry.send_count += 1;
                let shift = (entry.send_count - 1).min(6);
                entry.next_send = now + BASE_RETRANSMIT_INTERVAL * (1u32 << shift);
                log::trace!(
                    "retransmit counter:{} send_count:{}",
                    entry.msg_counter,
                    entry.send_count
                );
            }
            i += 1;
        }
    }

    /// Minimum delay until the next ack deadline or retransmission,
    /// `None` when neither is outstanding.
    pub fn next_wakeup(&self) -> Option<Duration> {
        let now = self.clock.now();
        let mut next: Option<Instant> = None;
        for ctx in &self.contexts {
            if ctx.is(ReliableMessageContext::OCCUPIED)
                && ctx.is(ReliableMessageContext::ACK_PENDING)
            {
                next = Some(next.map_or(ctx.next_ack_time, |n| n.min(ctx.next_ack_time)));
            }
        }
        for e in &self.retrans {
            next = Some(next.map_or(e.next_send, |n| n.min(e.next_send)));
        }
        next.map(|t| t.saturating_duration_since(now))
    }

    fn reschedule(&self) {
        match self.next_wakeup() {
            Some(delay) => self.timers.start(RETRANSMIT_TIMER, delay),
            None => self.timers.cancel(RETRANSMIT_TIMER),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::timer::ManualClock;
    use crate::transport::ChannelSender;
    use tokio::sync::mpsc::UnboundedReceiver;

    const PEER: u64 = 7;
    const EXCHANGE: u16 = 42;

    fn frame(counter: u32) -> Vec<u8> {
        let hdr = messages::MessageHeader {
            flags: 0,
            security_flags: 0,
            session_id: 1,
            message_counter: counter,
            source_node_id: None,
            destination_node_id: None,
        };
        let mut b = hdr.encode().unwrap();
        b.extend_from_slice(b"payload");
        b
    }

    fn setup() -> (
        Arc<ManualClock>,
        ReliableMessageMgr,
        UnboundedReceiver<(u64, Vec<u8>)>,
    ) {
        let clock = Arc::new(ManualClock::new());
        let (sender, rx) = ChannelSender::new();
        let (timers, _timer_rx) = TimerService::new();
        let mut mgr = ReliableMessageMgr::new(clock.clone(), Arc::new(sender), timers);
        mgr.alloc_context(EXCHANGE, PEER).unwrap();
        (clock, mgr, rx)
    }

    fn ack_counter_of(frame: &[u8]) -> u32 {
        let (hdr, _) = messages::ProtocolMessageHeader::decode(frame).unwrap();
        assert_eq!(hdr.opcode, messages::ProtocolMessageHeader::OPCODE_ACK);
        hdr.ack_counter
    }

    #[tokio::test]
    async fn ack_removes_retrans_entry() {
        let (_clock, mut mgr, mut rx) = setup();
        mgr.send_reliable(EXCHANGE, &frame(100)).unwrap();
        assert_eq!(mgr.outstanding(), 1);
        rx.recv().await.unwrap();

        // unknown counter is a protocol error and leaves state alone
        assert_eq!(
            mgr.handle_rcvd_ack(EXCHANGE, 999),
            Err(Error::InvalidAckCounter)
        );
        assert_eq!(mgr.outstanding(), 1);

        mgr.handle_rcvd_ack(EXCHANGE, 100).unwrap();
        assert_eq!(mgr.outstanding(), 0);
    }

    #[tokio::test]
    async fn retransmits_until_exhausted() {
        let (clock, mut mgr, mut rx) = setup();
        mgr.send_reliable(EXCHANGE, &frame(5)).unwrap();
        let (peer, _) = rx.recv().await.unwrap();
        assert_eq!(peer, PEER);

        // 4 retransmissions with doubling intervals, then the entry is dropped
        for _ in 0..MAX_RETRANSMITS {
            let delay = mgr.next_wakeup().unwrap();
            assert!(delay > Duration::ZERO);
            clock.advance(delay);
            mgr.on_timer();
            let (_, data) = rx.recv().await.unwrap();
            assert_eq!(data, frame(5));
        }
        assert_eq!(mgr.outstanding(), 1);
        clock.advance(mgr.next_wakeup().unwrap());
        mgr.on_timer();
        assert_eq!(mgr.outstanding(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn overdue_ack_flushes_standalone() {
        let (clock, mut mgr, mut rx) = setup();
        mgr.handle_needs_ack(EXCHANGE, 11, false).unwrap();
        assert_eq!(mgr.pending_ack_counter(EXCHANGE), Some(11));
        assert!(rx.try_recv().is_err());

        clock.advance(ACK_TIMEOUT);
        mgr.on_timer();
        let (_, data) = rx.recv().await.unwrap();
        assert_eq!(ack_counter_of(&data), 11);
        assert!(!mgr.is_ack_pending(EXCHANGE));
    }

    #[tokio::test]
    async fn duplicate_forces_ack_and_preserves_pending() {
        let (_clock, mut mgr, mut rx) = setup();
        mgr.handle_needs_ack(EXCHANGE, 11, false).unwrap();

        // duplicate of another message: immediate ack for it, pending
        // ack for 11 untouched
        mgr.handle_needs_ack(EXCHANGE, 22, true).unwrap();
        let (_, data) = rx.recv().await.unwrap();
        assert_eq!(ack_counter_of(&data), 22);
        assert_eq!(mgr.pending_ack_counter(EXCHANGE), Some(11));
    }

    #[tokio::test]
    async fn second_pending_ack_flushes_first() {
        let (_clock, mut mgr, mut rx) = setup();
        mgr.handle_needs_ack(EXCHANGE, 11, false).unwrap();
        mgr.handle_needs_ack(EXCHANGE, 12, false).unwrap();

        // depth-1 queue: the ack for 11 went out as a standalone
        let (_, data) = rx.recv().await.unwrap();
        assert_eq!(ack_counter_of(&data), 11);
        assert_eq!(mgr.pending_ack_counter(EXCHANGE), Some(12));
    }

    #[tokio::test]
    async fn flush_acks_is_idempotent() {
        let (_clock, mut mgr, mut rx) = setup();
        mgr.flush_acks(EXCHANGE).unwrap();
        assert!(rx.try_recv().is_err());

        mgr.handle_needs_ack(EXCHANGE, 3, false).unwrap();
        mgr.flush_acks(EXCHANGE).unwrap();
        let (_, data) = rx.recv().await.unwrap();
        assert_eq!(ack_counter_of(&data), 3);

        mgr.flush_acks(EXCHANGE).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn drop_ack_debug_skips_processing() {
        let (_clock, mut mgr, mut rx) = setup();
        mgr.set_drop_ack_debug(EXCHANGE, true);
        mgr.handle_needs_ack(EXCHANGE, 5, false).unwrap();
        assert!(!mgr.is_ack_pending(EXCHANGE));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn retrans_table_bounded() {
        let (_clock, mut mgr, _rx) = setup();
        for i in 0..MAX_EXCHANGES as u32 {
            mgr.send_reliable(EXCHANGE, &frame(i)).unwrap();
        }
        assert_eq!(
            mgr.send_reliable(EXCHANGE, &frame(99)),
            Err(Error::NoMemory)
        );
    }

    #[tokio::test]
    async fn release_context_drops_state() {
        let (_clock, mut mgr, _rx) = setup();
        mgr.send_reliable(EXCHANGE, &frame(1)).unwrap();
        mgr.release_context(EXCHANGE);
        assert_eq!(mgr.outstanding(), 0);
        assert_eq!(
            mgr.handle_needs_ack(EXCHANGE, 2, false),
            Err(Error::KeyNotFound)
        );
    }

    #[tokio::test]
    async fn context_pool_bounded() {
        let (_clock, mut mgr, _rx) = setup();
        // one slot taken by setup
        for i in 0..(MAX_EXCHANGES - 1) as u16 {
            mgr.alloc_context(100 + i, PEER).unwrap();
        }
        assert_eq!(mgr.alloc_context(999, PEER), Err(Error::NoMemory));
        mgr.release_context(100);
        mgr.alloc_context(999, PEER).unwrap();
    }
}
