//! Two-generation message store

use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::combiner::PayloadCombiner;
use crate::codec;
use crate::error::{BspError, Result};
use crate::graph::VertexId;

/// What happened at a superstep boundary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdvanceStats {
    /// Payloads now waiting in the current generation
    pub delivered: u64,
    /// Payloads dropped because their destination does not exist
    pub dropped: u64,
}

/// Per-worker inboxes for the current and the next superstep
///
/// `send` only ever appends to the next generation and `drain` only ever
/// removes from the current one, so a payload is never visible within the
/// superstep that sent it.
pub struct MessageStore<I: VertexId> {
    current: DashMap<I, Vec<Bytes>>,
    next: DashMap<I, Vec<Bytes>>,
    combiner: Option<Arc<dyn PayloadCombiner>>,
    sent: AtomicU64,
    dropped: AtomicU64,
}

impl<I: VertexId> Default for MessageStore<I> {
    fn default() -> Self {
        Self {
            current: DashMap::new(),
            next: DashMap::new(),
            combiner: None,
            sent: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }
}

impl<I: VertexId> MessageStore<I> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Combiner applied to payloads sent from now on
    pub(crate) fn set_combiner(&mut self, combiner: Option<Arc<dyn PayloadCombiner>>) {
        self.combiner = combiner;
    }

    /// Append a payload to the destination's next-superstep inbox
    pub fn send(&self, destination: I, payload: Bytes) -> Result<()> {
        self.sent.fetch_add(1, Ordering::Relaxed);
        let mut inbox = self.next.entry(destination).or_default();
        if let Some(combiner) = &self.combiner {
            if let Some(accumulated) = inbox.first_mut() {
                return combiner.combine(accumulated, payload);
            }
        }
        inbox.push(payload);
        Ok(())
    }

    /// Append many payloads for one destination, e.g. from a peer's batch
    pub fn send_all(&self, destination: I, payloads: impl IntoIterator<Item = Bytes>) -> Result<()> {
        for payload in payloads {
            self.send(destination.clone(), payload)?;
        }
        Ok(())
    }

    /// Take the current-superstep payloads of one vertex
    pub fn drain(&self, vertex: &I) -> Vec<Bytes> {
        self.current
            .remove(vertex)
            .map(|(_, payloads)| payloads)
            .unwrap_or_default()
    }

    /// Swap generations at the superstep boundary
    ///
    /// Payloads whose destination does not exist are dropped and counted.
    /// Payloads left undrained in the current generation are dropped too.
    pub fn advance(&mut self, exists: impl Fn(&I) -> bool) -> AdvanceStats {
        let leftover: usize = self.current.iter().map(|entry| entry.value().len()).sum();
        if leftover > 0 {
            debug!(count = leftover, "Discarding undrained messages");
        }

        self.current = std::mem::take(&mut self.next);

        let mut dropped = leftover as u64;
        self.current.retain(|destination, payloads| {
            if exists(destination) {
                true
            } else {
                debug!(
                    destination = ?destination,
                    count = payloads.len(),
                    "Dropping messages to missing vertex"
                );
                dropped += payloads.len() as u64;
                false
            }
        });
        self.dropped.fetch_add(dropped, Ordering::Relaxed);

        AdvanceStats {
            delivered: self.pending_messages(),
            dropped,
        }
    }

    /// Payloads waiting to be drained
    pub fn pending_messages(&self) -> u64 {
        self.current
            .iter()
            .map(|entry| entry.value().len() as u64)
            .sum()
    }

    /// Whether `vertex` has payloads waiting
    pub fn has_messages(&self, vertex: &I) -> bool {
        self.current
            .get(vertex)
            .map(|payloads| !payloads.is_empty())
            .unwrap_or(false)
    }

    /// Payloads sent since the last call
    pub fn take_sent(&self) -> u64 {
        self.sent.swap(0, Ordering::Relaxed)
    }

    /// Payloads dropped over the store's lifetime
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Copy of the pending generation, sorted by destination
    pub fn export_pending(&self) -> Vec<(I, Vec<Bytes>)> {
        let mut pending: Vec<_> = self
            .current
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        pending.sort_by(|a, b| a.0.cmp(&b.0));
        pending
    }

    /// Remove and return pending payloads whose destination matches
    pub fn take_pending(&self, mut select: impl FnMut(&I) -> bool) -> Vec<(I, Vec<Bytes>)> {
        let keys: Vec<I> = self
            .current
            .iter()
            .filter(|entry| select(entry.key()))
            .map(|entry| entry.key().clone())
            .collect();
        let mut taken: Vec<_> = keys
            .into_iter()
            .filter_map(|key| self.current.remove(&key))
            .collect();
        taken.sort_by(|a, b| a.0.cmp(&b.0));
        taken
    }

    /// Add payloads to the pending generation, after a restore or migration
    pub fn import_pending(&self, pending: impl IntoIterator<Item = (I, Vec<Bytes>)>) {
        for (destination, payloads) in pending {
            self.current.entry(destination).or_default().extend(payloads);
        }
    }

    /// Drop both generations
    pub fn clear(&mut self) {
        self.current.clear();
        self.next.clear();
        self.sent.store(0, Ordering::Relaxed);
    }
}

/// Single-pass iterator over one vertex's messages, decoding lazily
///
/// A payload that fails to decode ends the iteration; the engine reports the
/// failure once the receive function returns.
pub struct Messages<'a, M> {
    payloads: std::vec::IntoIter<Bytes>,
    failure: &'a RefCell<Option<BspError>>,
    _marker: PhantomData<fn() -> M>,
}

impl<'a, M: DeserializeOwned> Messages<'a, M> {
    pub(crate) fn new(payloads: Vec<Bytes>, failure: &'a RefCell<Option<BspError>>) -> Self {
        Self {
            payloads: payloads.into_iter(),
            failure,
            _marker: PhantomData,
        }
    }

    /// Messages not yet consumed
    pub fn remaining(&self) -> usize {
        self.payloads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payloads.len() == 0
    }
}

impl<M: DeserializeOwned> Iterator for Messages<'_, M> {
    type Item = M;

    fn next(&mut self) -> Option<M> {
        let payload = self.payloads.next()?;
        match codec::decode(&payload) {
            Ok(message) => Some(message),
            Err(err) => {
                self.payloads = Vec::new().into_iter();
                self.failure.borrow_mut().get_or_insert(err);
                None
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.payloads.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::combiner::TypedCombiner;
    use crate::message::SumCombiner;
    use std::collections::HashSet;

    fn payload(value: u32) -> Bytes {
        codec::encode(&value).unwrap()
    }

    #[test]
    fn test_messages_visible_only_after_advance() {
        let mut store = MessageStore::<u64>::new();
        store.send(1, payload(7)).unwrap();

        assert!(store.drain(&1).is_empty());
        assert_eq!(store.pending_messages(), 0);

        let stats = store.advance(|_| true);
        assert_eq!(stats.delivered, 1);
        assert!(store.has_messages(&1));
        assert_eq!(store.drain(&1), vec![payload(7)]);
        assert!(store.drain(&1).is_empty());
    }

    #[test]
    fn test_missing_destination_dropped_and_counted() {
        let mut store = MessageStore::<u64>::new();
        store.send(1, payload(1)).unwrap();
        store.send(99, payload(2)).unwrap();
        store.send(99, payload(3)).unwrap();

        let stats = store.advance(|id| *id < 10);
        assert_eq!(stats.dropped, 2);
        assert_eq!(stats.delivered, 1);
        assert_eq!(store.dropped(), 2);
        assert_eq!(store.take_sent(), 3);
        assert_eq!(store.take_sent(), 0);
    }

    #[test]
    fn test_combiner_keeps_one_payload_per_destination() {
        let mut store = MessageStore::<u64>::new();
        store.set_combiner(Some(Arc::new(TypedCombiner::<u32>::new(Arc::new(SumCombiner)))));
        for value in 1..=4 {
            store.send(5, payload(value)).unwrap();
        }
        store.advance(|_| true);

        let drained = store.drain(&5);
        assert_eq!(drained.len(), 1);
        assert_eq!(codec::decode::<u32>(&drained[0]).unwrap(), 10);
    }

    #[test]
    fn test_concurrent_sends_lose_nothing() {
        use rayon::prelude::*;

        let mut store = MessageStore::<u64>::new();
        (0..10_000u32).into_par_iter().for_each(|i| {
            store.send(u64::from(i % 16), payload(i)).unwrap();
        });
        store.advance(|_| true);

        let mut seen = HashSet::new();
        for destination in 0..16u64 {
            for bytes in store.drain(&destination) {
                assert!(seen.insert(codec::decode::<u32>(&bytes).unwrap()));
            }
        }
        assert_eq!(seen.len(), 10_000);
    }

    #[test]
    fn test_pending_export_and_selective_take() {
        let mut store = MessageStore::<u64>::new();
        for id in [3u64, 1, 2] {
            store.send(id, payload(id as u32)).unwrap();
        }
        store.advance(|_| true);

        let exported = store.export_pending();
        assert_eq!(exported.iter().map(|(id, _)| *id).collect::<Vec<_>>(), vec![1, 2, 3]);

        let taken = store.take_pending(|id| *id >= 2);
        assert_eq!(taken.len(), 2);
        assert_eq!(store.pending_messages(), 1);

        let other = MessageStore::<u64>::new();
        other.import_pending(taken);
        assert_eq!(other.pending_messages(), 2);
    }

    #[test]
    fn test_lazy_decode_stops_on_garbage() {
        let failure = RefCell::new(None);
        let payloads = vec![payload(1), Bytes::from_static(&[1]), payload(3)];
        let decoded: Vec<u32> = Messages::new(payloads, &failure).collect();

        assert_eq!(decoded, vec![1]);
        assert!(matches!(failure.into_inner(), Some(BspError::Codec(_))));
    }
}
