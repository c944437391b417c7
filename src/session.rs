//! Secure sessions and the bounded session table.
//!
//! A [SecureSession] carries the AES-128-CCM message protection state
//! of one established (or being-established) secure channel. The
//! [SecureSessionTable] hands out collision-free local 16-bit session
//! ids from a bounded pool; id 0 is reserved for the unsecured session
//! and never allocated.

use aes::cipher::crypto_common;
use byteorder::{LittleEndian, WriteBytesExt};
use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::Error;
use crate::messages;
use anyhow::Result;

pub const SESSION_POOL_SIZE: usize = 16;

type Aes128Ccm = ccm::Ccm<aes::Aes128, ccm::consts::U16, ccm::consts::U13>;

fn aes128_ccm_encrypt(
    key: &crypto_common::Key<Aes128Ccm>,
    nonce: &[u8],
    aad: &[u8],
    msg: &[u8],
) -> Result<Vec<u8>> {
    let cipher = <Aes128Ccm as ccm::KeyInit>::new(key);
    match ccm::aead::Aead::encrypt(
        &cipher,
        crypto_common::generic_array::GenericArray::from_slice(nonce),
        ccm::aead::Payload { msg, aad },
    ) {
        Ok(o) => Ok(o),
        Err(e) => Err(anyhow::anyhow!("encrypt error {:?}", e)),
    }
}

fn aes128_ccm_decrypt(
    key: &crypto_common::Key<Aes128Ccm>,
    nonce: &[u8],
    aad: &[u8],
    msg: &[u8],
) -> Result<Vec<u8>> {
    let cipher = <Aes128Ccm as ccm::KeyInit>::new(key);
    match ccm::aead::Aead::decrypt(
        &cipher,
        crypto_common::generic_array::GenericArray::from_slice(nonce),
        ccm::aead::Payload { msg, aad },
    ) {
        Ok(o) => Ok(o),
        Err(e) => Err(anyhow::anyhow!("decrypt error {:?}", e)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionType {
    Pase,
    Case,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Allocated but not yet activated - no peer info, no keys.
    Provisional,
    Active,
}

pub struct SecureSession {
    local_session_id: u16,
    session_type: SessionType,
    state: SessionState,
    peer_session_id: u16,
    peer_node_id: u64,
    local_node_id: u64,
    counter: AtomicU32,
    encrypt_key: Option<crypto_common::Key<Aes128Ccm>>,
    decrypt_key: Option<crypto_common::Key<Aes128Ccm>>,
}

impl SecureSession {
    fn new(local_session_id: u16, session_type: SessionType) -> Self {
        Self {
            local_session_id,
            session_type,
            state: SessionState::Provisional,
            peer_session_id: 0,
            peer_node_id: 0,
            local_node_id: 0,
            counter: AtomicU32::new(rand::random()),
            encrypt_key: None,
            decrypt_key: None,
        }
    }

    pub fn local_session_id(&self) -> u16 {
        self.local_session_id
    }
    pub fn session_type(&self) -> SessionType {
        self.session_type
    }
    pub fn state(&self) -> SessionState {
        self.state
    }
    pub fn peer_node_id(&self) -> u64 {
        self.peer_node_id
    }
    pub fn peer_session_id(&self) -> u16 {
        self.peer_session_id
    }

    /// Current outbound message counter (next value to be used).
    pub fn message_counter(&self) -> u32 {
        self.counter.load(Ordering::Relaxed)
    }

    /// Sessions come out of the table provisional; the handshake layer
    /// activates them once peer ids and keys are known.
    pub fn activate(&mut self, local_node_id: u64, peer_node_id: u64, peer_session_id: u16) {
        self.local_node_id = local_node_id;
        self.peer_node_id = peer_node_id;
        self.peer_session_id = peer_session_id;
        self.state = SessionState::Active;
    }

    pub fn set_encrypt_key(&mut self, k: &[u8]) {
        self.encrypt_key = Some(*crypto_common::Key::<Aes128Ccm>::from_slice(k))
    }
    pub fn set_decrypt_key(&mut self, k: &[u8]) {
        self.decrypt_key = Some(*crypto_common::Key::<Aes128Ccm>::from_slice(k))
    }

    /// Build the full frame for one protocol message: message header
    /// addressed to the peer session, payload encrypted when an
    /// encrypt key is installed. Consumes one message counter value.
    pub fn encode_message(&self, data: &[u8]) -> Result<Vec<u8>> {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        let header = messages::MessageHeader {
            flags: 0,
            security_flags: 0,
            session_id: self.peer_session_id,
            message_counter: counter,
            source_node_id: Some(self.local_node_id),
            destination_node_id: None,
        };
        let mut b = header.encode()?;
        match self.encrypt_key {
            Some(key) => {
                let nonce = make_nonce(counter, self.local_node_id)?;
                let enc = aes128_ccm_encrypt(&key, &nonce, &b, data)?;
                b.extend_from_slice(&enc);
            }
            None => b.extend_from_slice(data),
        };
        Ok(b)
    }

    /// Verify and decrypt an incoming frame. Returns header bytes plus
    /// plaintext payload, i.e. the same layout the unencrypted path
    /// sees.
    pub fn decode_message(&self, data: &[u8]) -> Result<Vec<u8>> {
        if self.decrypt_key.is_none() {
            return Ok(data.to_vec());
        }
        let (header, rest) = messages::MessageHeader::decode(data)?;
        if header.session_id != self.local_session_id {
            anyhow::bail!(
                "session id mismatch. expected:{} got:{}",
                self.local_session_id,
                header.session_id
            );
        }
        log::trace!(
            "decode msg header:{:?} session:{}",
            header,
            self.local_session_id
        );
        let nonce = make_nonce(header.message_counter, self.peer_node_id)?;
        let aad = &data[..data.len() - rest.len()];
        let decoded = aes128_ccm_decrypt(
            &self.decrypt_key.unwrap_or_default(),
            &nonce,
            aad,
            &rest,
        )?;
        let mut out = Vec::new();
        out.extend_from_slice(aad);
        out.extend_from_slice(&decoded);
        Ok(out)
    }
}

/// 13-byte CCM nonce: security flags byte, 4-byte counter, 8-byte
/// source node id, all little endian.
fn make_nonce(counter: u32, node_id: u64) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(13);
    out.write_u8(0)?;
    out.write_u32::<LittleEndian>(counter)?;
    out.write_u64::<LittleEndian>(node_id)?;
    Ok(out)
}

pub struct SecureSessionTable {
    sessions: Vec<SecureSession>,
    /// Rolling allocation hint - advanced past every allocated id so
    /// reuse is round-robin-like rather than lowest-free-first.
    next_session_id: u16,
}

impl SecureSessionTable {
    pub fn new() -> Self {
        let mut seed: u16 = rand::random();
        if seed == 0 {
            seed = 1;
        }
        Self {
            sessions: Vec::with_capacity(SESSION_POOL_SIZE),
            next_session_id: seed,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Allocate a session with a collision-free local id. The session
    /// comes back provisional; the caller activates it separately.
    /// Fails with [Error::NoMemory] when the pool is exhausted or the
    /// whole id space is occupied.
    pub fn create_session(&mut self, session_type: SessionType) -> Result<&mut SecureSession, Error> {
        if self.sessions.len() >= SESSION_POOL_SIZE {
            return Err(Error::NoMemory);
        }
        let id = self.find_unused_session_id().ok_or(Error::NoMemory)?;
        self.next_session_id = match id.wrapping_add(1) {
            0 => 1,
            n => n,
        };
        self.sessions.push(SecureSession::new(id, session_type));
        Ok(self.sessions.last_mut().unwrap())
    }

    /// Scan the id space in 64-wide buckets starting at the hint. Each
    /// bucket gets a 64-bit occupancy mask built from the live sessions
    /// (id 0 always marked occupied); the first bucket with a free bit
    /// yields its lowest free id. Cost is pool size times buckets
    /// scanned, no sorted table needed.
    fn find_unused_session_id(&self) -> Option<u16> {
        const BUCKET: u32 = 64;
        let mut base = self.next_session_id & !(BUCKET as u16 - 1);
        for _ in 0..=(u16::MAX as u32 / BUCKET) {
            let mut mask: u64 = 0;
            if base == 0 {
                mask |= 1; // id 0 reserved for the unsecured session
            }
            for s in &self.sessions {
                let id = s.local_session_id as u32;
                if id >= base as u32 && id < base as u32 + BUCKET {
                    mask |= 1u64 << (id - base as u32);
                }
            }
            if mask != u64::MAX {
                let bit = (!mask).trailing_zeros() as u16;
                return Some(base + bit);
            }
            base = base.wrapping_add(BUCKET as u16);
        }
        None
    }

    /// Return the session to the pool immediately. The allocation hint
    /// is deliberately left alone.
    pub fn release(&mut self, local_session_id: u16) -> bool {
        let before = self.sessions.len();
        self.sessions
            .retain(|s| s.local_session_id != local_session_id);
        if self.sessions.len() == before {
            log::debug!("release of unknown session id {}", local_session_id);
            return false;
        }
        true
    }

    /// Lookup by local session id - linear scan over live sessions.
    pub fn get(&self, local_session_id: u16) -> Option<&SecureSession> {
        self.sessions
            .iter()
            .find(|s| s.local_session_id == local_session_id)
    }

    pub fn get_mut(&mut self, local_session_id: u16) -> Option<&mut SecureSession> {
        self.sessions
            .iter_mut()
            .find(|s| s.local_session_id == local_session_id)
    }
}

impl Default for SecureSessionTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_unique_and_nonzero() {
        let mut table = SecureSessionTable::new();
        let mut ids = HashSet::new();
        for _ in 0..SESSION_POOL_SIZE {
            let id = table.create_session(SessionType::Case).unwrap().local_session_id();
            assert_ne!(id, 0);
            assert!(ids.insert(id), "duplicate session id {}", id);
        }
    }

    #[test]
    fn pool_exhaustion_and_recovery() {
        let mut table = SecureSessionTable::new();
        let mut ids = Vec::new();
        for _ in 0..SESSION_POOL_SIZE {
            ids.push(table.create_session(SessionType::Pase).unwrap().local_session_id());
        }
        assert_eq!(
            table.create_session(SessionType::Pase).err(),
            Some(Error::NoMemory)
        );

        assert!(table.release(ids[3]));
        let id = table.create_session(SessionType::Pase).unwrap().local_session_id();
        assert_ne!(id, 0);
        // pool full again
        assert_eq!(
            table.create_session(SessionType::Pase).err(),
            Some(Error::NoMemory)
        );
    }

    #[test]
    fn churn_never_collides() {
        let mut table = SecureSessionTable::new();
        let mut live = Vec::new();
        for round in 0..200 {
            if live.len() < SESSION_POOL_SIZE && round % 3 != 0 {
                let id = table.create_session(SessionType::Case).unwrap().local_session_id();
                assert_ne!(id, 0);
                assert!(!live.contains(&id), "live id {} reallocated", id);
                live.push(id);
            } else if !live.is_empty() {
                let id = live.remove(round % live.len());
                assert!(table.release(id));
            }
        }
    }

    #[test]
    fn zero_never_allocated_at_wrap() {
        let mut table = SecureSessionTable::new();
        // hint sitting on the reserved id - scan must skip it
        table.next_session_id = 0;
        let id = table.create_session(SessionType::Case).unwrap().local_session_id();
        assert_eq!(id, 1);
    }

    #[test]
    fn lookup_by_local_id() {
        let mut table = SecureSessionTable::new();
        let id = table.create_session(SessionType::Case).unwrap().local_session_id();
        assert!(table.get(id).is_some());
        table.get_mut(id).unwrap().activate(1, 2, 0x33);
        assert_eq!(table.get(id).unwrap().peer_node_id(), 2);
        assert_eq!(table.get(id).unwrap().state(), SessionState::Active);
        assert!(!table.release(0));
    }

    #[test]
    fn encode_decode_encrypted() {
        let mut a = SecureSession::new(10, SessionType::Pase);
        let mut b = SecureSession::new(20, SessionType::Pase);
        a.activate(1, 2, 20);
        b.activate(2, 1, 10);
        let key = [1u8; 16];
        a.set_encrypt_key(&key);
        b.set_decrypt_key(&key);

        let payload = b"protocol bytes";
        let frame = a.encode_message(payload).unwrap();
        let plain = b.decode_message(&frame).unwrap();
        assert!(plain.ends_with(payload));

        // tampered frame must not decode
        let mut bad = frame.clone();
        let last = bad.len() - 1;
        bad[last] ^= 0xff;
        assert!(b.decode_message(&bad).is_err());
    }
}
