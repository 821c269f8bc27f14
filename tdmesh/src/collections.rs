//! Bounded FIFO keyed by identity, where a newer entry replaces the queued one.
//!
//! Used wherever only the latest state per key is worth sending: topology
//! reports waiting to be forwarded (keyed by reporting node), stream
//! management elements (keyed by stream id) and master notifications.
//!
//! The backing storage shrinks after a run of removals without additions
//! (1/16 of max capacity), so a queue that grew during a burst of network
//! churn gives its memory back once it drains.

use alloc::collections::VecDeque;
use core::hash::Hash;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use hashbrown::HashMap;

/// Raw mutex behind the structures shared with the schedule thread.
pub type SharedMutex = CriticalSectionRawMutex;

/// Calculate shrink threshold from max capacity (1/16, minimum 1).
const fn shrink_threshold(max_capacity: usize) -> u8 {
    let threshold = max_capacity / 16;
    if threshold == 0 {
        1
    } else if threshold > u8::MAX as usize {
        u8::MAX
    } else {
        threshold as u8
    }
}

/// Outcome of [`UpdatableQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// Appended at the back.
    Appended,
    /// Replaced the queued value for the same key, keeping its position.
    Replaced,
    /// Queue full; the value was dropped.
    Rejected,
}

pub struct UpdatableQueue<K, V> {
    order: VecDeque<K>,
    values: HashMap<K, V>,
    max_capacity: usize,
    removals_since_add: u8,
    shrink_threshold: u8,
}

impl<K: Copy + Eq + Hash, V> UpdatableQueue<K, V> {
    pub fn with_max_capacity(max_capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            values: HashMap::new(),
            max_capacity,
            removals_since_add: 0,
            shrink_threshold: shrink_threshold(max_capacity),
        }
    }

    pub fn enqueue(&mut self, key: K, value: V) -> Enqueued {
        if let Some(slot) = self.values.get_mut(&key) {
            *slot = value;
            return Enqueued::Replaced;
        }
        if self.order.len() >= self.max_capacity {
            return Enqueued::Rejected;
        }
        self.removals_since_add = 0;
        self.order.push_back(key);
        self.values.insert(key, value);
        Enqueued::Appended
    }

    /// Oldest entry.
    pub fn dequeue(&mut self) -> Option<(K, V)> {
        let key = self.order.pop_front()?;
        let value = self.values.remove(&key)?;
        self.removals_since_add = self.removals_since_add.saturating_add(1);
        self.maybe_shrink();
        Some((key, value))
    }

    /// Up to `limit` oldest values, in queue order.
    pub fn dequeue_up_to(&mut self, limit: usize) -> alloc::vec::Vec<V> {
        let mut out = alloc::vec::Vec::with_capacity(limit.min(self.len()));
        while out.len() < limit {
            match self.dequeue() {
                Some((_, value)) => out.push(value),
                None => break,
            }
        }
        out
    }

    pub fn peek(&self) -> Option<(&K, &V)> {
        let key = self.order.front()?;
        self.values.get(key).map(|v| (key, v))
    }

    pub fn contains(&self, key: &K) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Entries in queue order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.order
            .iter()
            .filter_map(move |k| self.values.get(k).map(|v| (k, v)))
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.values.clear();
        self.order.shrink_to_fit();
        self.values.shrink_to_fit();
        self.removals_since_add = 0;
    }

    fn maybe_shrink(&mut self) {
        if self.removals_since_add >= self.shrink_threshold {
            self.order.shrink_to_fit();
            self.values.shrink_to_fit();
            self.removals_since_add = 0;
        }
    }
}
