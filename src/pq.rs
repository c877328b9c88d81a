//! Calendar priority queue
//!
//! Min-heap over `std::collections::BinaryHeap` keyed by
//! `(time, priority, seq)`. `seq` is assigned by the caller and only breaks
//! ties, which makes equal `(time, priority)` entries come out FIFO.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Ordering key of a queue entry.
#[derive(Clone, Copy, Debug)]
pub struct Key {
    pub time: f64,
    pub priority: i32,
    pub seq: u64,
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Natural ordering; `Slot` reverses it for the max-heap.
// total_cmp keeps float ordering deterministic (-0, NaN, etc.)
impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.time
            .total_cmp(&other.time)
            .then_with(|| self.priority.cmp(&other.priority))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

struct Slot<M> {
    key: Key,
    meta: M,
}

impl<M> PartialEq for Slot<M> {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl<M> Eq for Slot<M> {}

impl<M> PartialOrd for Slot<M> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<M> Ord for Slot<M> {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key.cmp(&other.key).reverse() // Reverse for min-heap behavior
    }
}

/// A min-priority queue of `(Key, M)` pairs.
pub struct MinPq<M> {
    heap: BinaryHeap<Slot<M>>,
}

impl<M> Default for MinPq<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M> MinPq<M> {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
        }
    }

    pub fn push(&mut self, key: Key, meta: M) {
        self.heap.push(Slot { key, meta });
    }

    /// Key of the minimum entry.
    pub fn peek_key(&self) -> Option<Key> {
        self.heap.peek().map(|s| s.key)
    }

    /// Pop the minimum entry.
    pub fn pop(&mut self) -> Option<(Key, M)> {
        self.heap.pop().map(|s| (s.key, s.meta))
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn key(time: f64, priority: i32, seq: u64) -> Key {
        Key {
            time,
            priority,
            seq,
        }
    }

    #[test]
    fn test_time_then_priority_then_seq() {
        let mut pq: MinPq<&str> = MinPq::new();

        pq.push(key(1.0, 0, 0), "late");
        pq.push(key(0.0, 1, 1), "low");
        pq.push(key(0.0, -1, 2), "high");
        pq.push(key(0.0, 1, 3), "low-second");

        let order: Vec<&str> = std::iter::from_fn(|| pq.pop().map(|(_, m)| m)).collect();
        assert_eq!(order, vec!["high", "low", "low-second", "late"]);
    }

    #[test]
    fn test_peek_key() {
        let mut pq: MinPq<u32> = MinPq::new();
        assert!(pq.peek_key().is_none());

        pq.push(key(2.5, 0, 0), 1);
        pq.push(key(0.5, 0, 1), 2);
        assert_eq!(pq.peek_key().map(|k| k.time), Some(0.5));
        assert_eq!(pq.len(), 2);
    }

    proptest! {
        #[test]
        fn prop_pop_order_is_sorted_and_fifo(
            entries in prop::collection::vec((0u8..4, -2i32..3), 0..64)
        ) {
            let mut pq = MinPq::new();
            for (seq, (t, p)) in entries.iter().enumerate() {
                pq.push(key(*t as f64, *p, seq as u64), seq);
            }

            let mut popped = Vec::new();
            while let Some((k, seq)) = pq.pop() {
                prop_assert_eq!(k.seq, seq as u64);
                popped.push(k);
            }
            prop_assert_eq!(popped.len(), entries.len());
            for w in popped.windows(2) {
                prop_assert!(w[0] < w[1]);
            }
        }
    }
}
