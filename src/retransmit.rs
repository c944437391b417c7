//! Fixed-capacity keyed cache with explicit payload lifetime hooks.
//!
//! Backs the message-counter retransmission and receive tables: frames
//! parked there may share their buffers with other parts of the stack,
//! so the cache notifies a [PayloadLifetime] strategy exactly once on
//! insertion and exactly once on removal (including drop of the whole
//! cache). The invariant is that the number of acquired payloads always
//! equals the number of live entries.

use crate::error::Error;

pub trait PayloadLifetime<P> {
    fn acquire(&mut self, payload: &P);
    fn release(&mut self, payload: &P);
}

/// No-op strategy for payloads that own their storage outright.
#[derive(Default)]
pub struct OwnedPayloads;

impl<P> PayloadLifetime<P> for OwnedPayloads {
    fn acquire(&mut self, _payload: &P) {}
    fn release(&mut self, _payload: &P) {}
}

pub struct Cache<K, P, L: PayloadLifetime<P>, const N: usize> {
    slots: [Option<(K, P)>; N],
    lifetime: L,
}

impl<K: Eq + Copy, P, L: PayloadLifetime<P>, const N: usize> Cache<K, P, L, N> {
    pub fn new(lifetime: L) -> Self {
        Self {
            slots: std::array::from_fn(|_| None),
            lifetime,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(|s| s.is_none())
    }

    /// Insert into the first free slot. Fails with [Error::NoMemory]
    /// when all N slots are live; the cache is left unchanged.
    pub fn add(&mut self, key: K, payload: P) -> Result<(), Error> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| s.is_none())
            .ok_or(Error::NoMemory)?;
        self.lifetime.acquire(&payload);
        *slot = Some((key, payload));
        Ok(())
    }

    /// Remove the first entry with this key and return its payload.
    pub fn remove(&mut self, key: K) -> Result<P, Error> {
        let slot = self
            .slots
            .iter_mut()
            .find(|s| matches!(s, Some((k, _)) if *k == key))
            .ok_or(Error::KeyNotFound)?;
        let (_, payload) = slot.take().unwrap();
        self.lifetime.release(&payload);
        Ok(payload)
    }

    pub fn get(&self, key: K) -> Option<&P> {
        self.slots
            .iter()
            .flatten()
            .find(|(k, _)| *k == key)
            .map(|(_, p)| p)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &P)> {
        self.slots.iter().flatten().map(|(k, p)| (k, p))
    }

    /// Remove every entry matching the predicate, in slot order,
    /// releasing each payload. Returns the removed entries.
    pub fn drain_matching(&mut self, mut pred: impl FnMut(&K) -> bool) -> Vec<(K, P)> {
        let mut out = Vec::new();
        for slot in self.slots.iter_mut() {
            if matches!(slot, Some((k, _)) if pred(k)) {
                let (k, p) = slot.take().unwrap();
                self.lifetime.release(&p);
                out.push((k, p));
            }
        }
        out
    }
}

impl<K, P, L: PayloadLifetime<P>, const N: usize> Drop for Cache<K, P, L, N> {
    fn drop(&mut self) {
        for slot in self.slots.iter_mut() {
            if let Some((_, payload)) = slot.take() {
                self.lifetime.release(&payload);
            }
        }
    }
}
