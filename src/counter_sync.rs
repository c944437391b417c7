//! Message counter synchronization (MCSP).
//!
//! Group-style peers whose receive counter is unknown cannot be checked
//! for replay, so traffic to and from such a peer is held back while a
//! challenge/response exchange establishes the peer's current counter.
//! Outbound frames wait in `outgoing`, inbound frames in `incoming`;
//! both drain in slot order once the response proves freshness. A sync
//! that does not complete within [SYNC_TIMEOUT] is abandoned and the
//! held frames are dropped.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::mpsc;

use crate::{
    error::Error,
    messages::{self, SYNC_CHALLENGE_SIZE},
    reliable::MAX_EXCHANGES,
    retransmit::{Cache, OwnedPayloads},
    timer::{TimerKey, TimerKind, TimerService},
    transport::MessageSender,
};

pub const SYNC_TIMEOUT: Duration = Duration::from_millis(500);

fn sync_timer(peer: u64) -> TimerKey {
    TimerKey {
        kind: TimerKind::CounterSync,
        id: peer,
    }
}

struct SyncState {
    challenge: [u8; SYNC_CHALLENGE_SIZE],
    exchange_id: u16,
}

/// Tracks per-peer counter knowledge and the frames held back while a
/// sync is in flight. Queued inbound frames are redelivered on the
/// `processed` channel once their peer's counter is known.
pub struct MessageCounterManager {
    outgoing: Cache<(u64, u32), Vec<u8>, OwnedPayloads, MAX_EXCHANGES>,
    incoming: Cache<(u64, u32), Vec<u8>, OwnedPayloads, MAX_EXCHANGES>,
    sync: HashMap<u64, SyncState>,
    peer_counters: HashMap<u64, u32>,
    sender: Arc<dyn MessageSender>,
    timers: Arc<TimerService>,
    processed_tx: mpsc::UnboundedSender<(u64, Vec<u8>)>,
}

impl MessageCounterManager {
    pub fn new(
        sender: Arc<dyn MessageSender>,
        timers: Arc<TimerService>,
    ) -> (Self, mpsc::UnboundedReceiver<(u64, Vec<u8>)>) {
        let (processed_tx, processed_rx) = mpsc::unbounded_channel();
        (
            Self {
                outgoing: Cache::new(OwnedPayloads),
                incoming: Cache::new(OwnedPayloads),
                sync: HashMap::new(),
                peer_counters: HashMap::new(),
                sender,
                timers,
                processed_tx,
            },
            processed_rx,
        )
    }

    pub fn is_sync_in_progress(&self, peer: u64) -> bool {
        self.sync.contains_key(&peer)
    }

    pub fn peer_counter(&self, peer: u64) -> Option<u32> {
        self.peer_counters.get(&peer).copied()
    }

    /// Begin a counter sync with `peer`: send a fresh random challenge
    /// and arm the per-peer timeout. A second call while one is already
    /// in flight is a no-op.
    pub fn start_sync(&mut self, peer: u64, exchange_id: u16) -> Result<(), Error> {
        if self.sync.contains_key(&peer) {
            log::trace!("sync with peer {} already in progress", peer);
            return Ok(());
        }
        let challenge: [u8; SYNC_CHALLENGE_SIZE] = rand::random();
        let frame = messages::msg_counter_sync_req(exchange_id, &challenge).map_err(|e| {
            log::error!("failed to encode sync request: {:?}", e);
            Error::Malformed
        })?;
        self.sync.insert(
            peer,
            SyncState {
                challenge,
                exchange_id,
            },
        );
        self.timers.start(sync_timer(peer), SYNC_TIMEOUT);
        log::debug!("counter sync with peer {} started", peer);
        // An unreachable peer is handled by the timeout, not here.
        if let Err(e) = self.sender.send(peer, &frame) {
            log::debug!("sync request to peer {} not sent: {}", peer, e);
        }
        Ok(())
    }

    /// Hold an encoded outbound frame until the sync with its peer
    /// completes.
    pub fn queue_outgoing(&mut self, peer: u64, counter: u32, frame: Vec<u8>) -> Result<(), Error> {
        self.outgoing.add((peer, counter), frame)
    }

    /// Hold a received frame whose peer counter is not yet trusted.
    pub fn queue_incoming(&mut self, peer: u64, counter: u32, frame: Vec<u8>) -> Result<(), Error> {
        self.incoming.add((peer, counter), frame)
    }

    /// Park an outbound frame and make sure a sync with its peer is
    /// running. The frame is not parked when the table is full.
    pub fn queue_outgoing_and_sync(
        &mut self,
        peer: u64,
        counter: u32,
        frame: Vec<u8>,
        exchange_id: u16,
    ) -> Result<(), Error> {
        self.queue_outgoing(peer, counter, frame)?;
        self.start_sync(peer, exchange_id)
    }

    /// Park a received frame and make sure a sync with its peer is
    /// running.
    pub fn queue_incoming_and_sync(
        &mut self,
        peer: u64,
        counter: u32,
        frame: Vec<u8>,
        exchange_id: u16,
    ) -> Result<(), Error> {
        self.queue_incoming(peer, counter, frame)?;
        self.start_sync(peer, exchange_id)
    }

    /// Answer a peer's sync request: echo its challenge together with
    /// our current counter.
    pub fn handle_sync_request(
        &mut self,
        peer: u64,
        exchange_id: u16,
        payload: &[u8],
        local_counter: u32,
    ) -> Result<(), Error> {
        let challenge = messages::parse_sync_req(payload).map_err(|e| {
            log::debug!("bad sync request from peer {}: {:?}", peer, e);
            Error::Malformed
        })?;
        let frame = messages::msg_counter_sync_rsp(exchange_id, &challenge, local_counter)
            .map_err(|e| {
                log::error!("failed to encode sync response: {:?}", e);
                Error::Malformed
            })?;
        if let Err(e) = self.sender.send(peer, &frame) {
            log::debug!("sync response to peer {} not sent: {}", peer, e);
        }
        Ok(())
    }

    /// Complete an in-flight sync. On a challenge match the peer's
    /// counter is recorded and everything held for that peer drains:
    /// outbound frames are transmitted, inbound frames redelivered. A
    /// mismatched challenge leaves the sync untouched - the genuine
    /// response may still arrive.
    pub fn handle_sync_response(&mut self, peer: u64, payload: &[u8]) -> Result<(), Error> {
        let state = self.sync.get(&peer).ok_or(Error::KeyNotFound)?;
        let (challenge, counter) = messages::parse_sync_rsp(payload).map_err(|e| {
            log::debug!("bad sync response from peer {}: {:?}", peer, e);
            Error::Malformed
        })?;
        if challenge != state.challenge {
            log::debug!("sync response challenge mismatch from peer {}", peer);
            return Err(Error::ChallengeMismatch);
        }
        self.sync.remove(&peer);
        self.timers.cancel(sync_timer(peer));
        self.peer_counters.insert(peer, counter);
        log::debug!("peer {} counter synchronized to {}", peer, counter);

        for ((_, _), frame) in self.outgoing.drain_matching(|(p, _)| *p == peer) {
            if let Err(e) = self.sender.send(peer, &frame) {
                log::debug!("queued frame to peer {} not sent: {}", peer, e);
            }
        }
        for ((_, _), frame) in self.incoming.drain_matching(|(p, _)| *p == peer) {
            _ = self.processed_tx.send((peer, frame));
        }
        Ok(())
    }

    /// The sync with `peer` timed out. The peer's counter stays
    /// unknown, so the held frames cannot be validated or safely sent -
    /// they are dropped.
    pub fn on_sync_timeout(&mut self, peer: u64) {
        if self.sync.remove(&peer).is_none() {
            return;
        }
        let dropped_out = self.outgoing.drain_matching(|(p, _)| *p == peer).len();
        let dropped_in = self.incoming.drain_matching(|(p, _)| *p == peer).len();
        log::warn!(
            "counter sync with peer {} timed out, dropping {} outbound and {} inbound frames",
            peer,
            dropped_out,
            dropped_in
        );
    }

    pub fn sync_exchange_id(&self, peer: u64) -> Option<u16> {
        self.sync.get(&peer).map(|s| s.exchange_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ProtocolMessageHeader;
    use crate::transport::ChannelSender;
    use tokio::sync::mpsc::UnboundedReceiver;

    const PEER: u64 = 9;
    const EXCHANGE: u16 = 3;

    fn setup() -> (
        MessageCounterManager,
        UnboundedReceiver<(u64, Vec<u8>)>,
        UnboundedReceiver<(u64, Vec<u8>)>,
    ) {
        let (sender, sent_rx) = ChannelSender::new();
        let (timers, _timer_rx) = TimerService::new();
        let (mgr, processed_rx) = MessageCounterManager::new(Arc::new(sender), timers);
        (mgr, sent_rx, processed_rx)
    }

    fn sent_challenge(frame: &[u8]) -> [u8; SYNC_CHALLENGE_SIZE] {
        let (hdr, payload) = ProtocolMessageHeader::decode(frame).unwrap();
        assert_eq!(hdr.opcode, ProtocolMessageHeader::OPCODE_MSG_COUNTER_SYNC_REQ);
        messages::parse_sync_req(&payload).unwrap()
    }

    #[tokio::test]
    async fn sync_completion_drains_queues_in_order() {
        let (mut mgr, mut sent, mut processed) = setup();
        mgr.start_sync(PEER, EXCHANGE).unwrap();
        assert!(mgr.is_sync_in_progress(PEER));
        let (_, req) = sent.recv().await.unwrap();
        let challenge = sent_challenge(&req);

        mgr.queue_outgoing(PEER, 1, b"out-1".to_vec()).unwrap();
        mgr.queue_outgoing(PEER, 2, b"out-2".to_vec()).unwrap();
        mgr.queue_incoming(PEER, 50, b"in-50".to_vec()).unwrap();

        let rsp = messages::msg_counter_sync_rsp(EXCHANGE, &challenge, 777).unwrap();
        let (_, payload) = ProtocolMessageHeader::decode(&rsp).unwrap();
        mgr.handle_sync_response(PEER, &payload).unwrap();

        assert!(!mgr.is_sync_in_progress(PEER));
        assert_eq!(mgr.peer_counter(PEER), Some(777));
        assert_eq!(sent.recv().await.unwrap().1, b"out-1");
        assert_eq!(sent.recv().await.unwrap().1, b"out-2");
        assert_eq!(processed.recv().await.unwrap().1, b"in-50");
    }

    #[tokio::test]
    async fn challenge_mismatch_keeps_sync_alive() {
        let (mut mgr, mut sent, _processed) = setup();
        mgr.start_sync(PEER, EXCHANGE).unwrap();
        _ = sent.recv().await.unwrap();
        mgr.queue_outgoing(PEER, 1, b"held".to_vec()).unwrap();

        let wrong = [0xAAu8; SYNC_CHALLENGE_SIZE];
        let rsp = messages::msg_counter_sync_rsp(EXCHANGE, &wrong, 1).unwrap();
        let (_, payload) = ProtocolMessageHeader::decode(&rsp).unwrap();
        assert_eq!(
            mgr.handle_sync_response(PEER, &payload),
            Err(Error::ChallengeMismatch)
        );
        assert!(mgr.is_sync_in_progress(PEER));
        assert!(sent.try_recv().is_err());
        assert_eq!(mgr.peer_counter(PEER), None);
    }

    #[tokio::test]
    async fn response_without_sync_is_rejected() {
        let (mut mgr, _sent, _processed) = setup();
        let challenge = [1u8; SYNC_CHALLENGE_SIZE];
        let rsp = messages::msg_counter_sync_rsp(EXCHANGE, &challenge, 5).unwrap();
        let (_, payload) = ProtocolMessageHeader::decode(&rsp).unwrap();
        assert_eq!(
            mgr.handle_sync_response(PEER, &payload),
            Err(Error::KeyNotFound)
        );
    }

    #[tokio::test]
    async fn truncated_response_is_malformed() {
        let (mut mgr, mut sent, _processed) = setup();
        mgr.start_sync(PEER, EXCHANGE).unwrap();
        _ = sent.recv().await.unwrap();
        assert_eq!(
            mgr.handle_sync_response(PEER, &[0u8; 5]),
            Err(Error::Malformed)
        );
        assert!(mgr.is_sync_in_progress(PEER));
    }

    #[tokio::test]
    async fn queues_are_bounded() {
        let (mut mgr, _sent, _processed) = setup();
        for i in 0..MAX_EXCHANGES as u32 {
            mgr.queue_outgoing(PEER, i, vec![i as u8]).unwrap();
        }
        assert_eq!(
            mgr.queue_outgoing(PEER, 100, b"overflow".to_vec()),
            Err(Error::NoMemory)
        );
    }

    #[tokio::test]
    async fn timeout_drops_held_frames() {
        let (mut mgr, mut sent, mut processed) = setup();
        // parking the first frame kicks off the sync by itself
        mgr.queue_outgoing_and_sync(PEER, 1, b"held-out".to_vec(), EXCHANGE)
            .unwrap();
        assert!(mgr.is_sync_in_progress(PEER));
        _ = sent.recv().await.unwrap();
        mgr.queue_incoming_and_sync(PEER, 2, b"held-in".to_vec(), EXCHANGE)
            .unwrap();
        // second call found the sync already running - no second request
        assert!(sent.try_recv().is_err());

        mgr.on_sync_timeout(PEER);
        assert!(!mgr.is_sync_in_progress(PEER));
        assert!(sent.try_recv().is_err());
        assert!(processed.try_recv().is_err());
        assert_eq!(mgr.peer_counter(PEER), None);

        // stale timer fire after completion is harmless
        mgr.on_sync_timeout(PEER);
    }

    #[tokio::test]
    async fn sync_request_echoes_challenge_and_counter() {
        let (mut mgr, mut sent, _processed) = setup();
        let challenge = [3u8; SYNC_CHALLENGE_SIZE];
        let req = messages::msg_counter_sync_req(EXCHANGE, &challenge).unwrap();
        let (_, payload) = ProtocolMessageHeader::decode(&req).unwrap();
        mgr.handle_sync_request(PEER, EXCHANGE, &payload, 4242).unwrap();

        let (_, rsp) = sent.recv().await.unwrap();
        let (hdr, payload) = ProtocolMessageHeader::decode(&rsp).unwrap();
        assert_eq!(
            hdr.opcode,
            ProtocolMessageHeader::OPCODE_MSG_COUNTER_SYNC_RSP
        );
        let (echoed, counter) = messages::parse_sync_rsp(&payload).unwrap();
        assert_eq!(echoed, challenge);
        assert_eq!(counter, 4242);
    }
}
