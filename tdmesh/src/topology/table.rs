//! Bounded table of peers heard during the uplink phase.
//!
//! Shared by predecessors, successors and mesh neighbors. Each entry keeps
//! the last RSSI, the hop the peer advertised and a count of consecutive
//! uplink slots the peer failed to fill.

use alloc::collections::BTreeMap;

use crate::types::{Hop, NodeId, Rssi};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerEntry {
    pub rssi: Rssi,
    pub hop: Hop,
    /// Consecutive rounds without a sighting.
    pub unseen: u8,
}

/// Outcome of a missed uplink slot for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unseen {
    /// Not in the table.
    Unknown,
    Counted(u8),
    Evicted,
}

#[derive(Debug, Clone)]
pub struct PeerTable {
    entries: BTreeMap<NodeId, PeerEntry>,
    capacity: usize,
}

impl PeerTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            capacity,
        }
    }

    /// Record a sighting.
    ///
    /// New peers are admitted only at or above `floor`. Known peers are
    /// refreshed regardless of signal strength. Returns true if the peer was
    /// added.
    pub fn seen(&mut self, node: NodeId, hop: Hop, rssi: Rssi, floor: Rssi) -> bool {
        if let Some(entry) = self.entries.get_mut(&node) {
            entry.rssi = rssi;
            entry.hop = hop;
            entry.unseen = 0;
            return false;
        }
        if rssi < floor || self.entries.len() >= self.capacity {
            return false;
        }
        self.entries.insert(
            node,
            PeerEntry {
                rssi,
                hop,
                unseen: 0,
            },
        );
        true
    }

    /// Count a missed slot; evict once the count exceeds `max_unseen`.
    ///
    /// A peer that misses its slot is treated as barely audible until it is
    /// heard again.
    pub fn unseen(&mut self, node: NodeId, max_unseen: u8) -> Unseen {
        let Some(entry) = self.entries.get_mut(&node) else {
            return Unseen::Unknown;
        };
        entry.unseen = entry.unseen.saturating_add(1);
        entry.rssi = Rssi::MIN;
        if entry.unseen > max_unseen {
            self.entries.remove(&node);
            return Unseen::Evicted;
        }
        Unseen::Counted(entry.unseen)
    }

    pub fn remove(&mut self, node: NodeId) -> Option<PeerEntry> {
        self.entries.remove(&node)
    }

    pub fn get(&self, node: NodeId) -> Option<&PeerEntry> {
        self.entries.get(&node)
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.entries.contains_key(&node)
    }

    /// Strongest peer accepted by `filter`; ties go to the lower id.
    pub fn strongest_where(&self, filter: impl Fn(&PeerEntry) -> bool) -> Option<NodeId> {
        let mut best: Option<(NodeId, Rssi)> = None;
        for (node, entry) in self.entries.iter().filter(|(_, e)| filter(e)) {
            if best.map_or(true, |(_, rssi)| entry.rssi > rssi) {
                best = Some((*node, entry.rssi));
            }
        }
        best.map(|(node, _)| node)
    }

    /// Peers accepted by `filter`, strongest first.
    pub fn ranked_where(&self, filter: impl Fn(&PeerEntry) -> bool) -> alloc::vec::Vec<NodeId> {
        let mut ranked: alloc::vec::Vec<(NodeId, Rssi)> = self
            .entries
            .iter()
            .filter(|(_, e)| filter(e))
            .map(|(node, e)| (*node, e.rssi))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked.into_iter().map(|(node, _)| node).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &PeerEntry)> {
        self.entries.iter().map(|(node, entry)| (*node, entry))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_applies_only_to_new_peers() {
        let mut table = PeerTable::with_capacity(4);
        assert!(!table.seen(3, 1, -95, -90));
        assert!(table.is_empty());

        assert!(table.seen(3, 1, -80, -90));
        // Weak repeat sighting still refreshes.
        assert!(!table.seen(3, 1, -97, -90));
        assert_eq!(table.get(3).map(|e| e.rssi), Some(-97));
    }

    #[test]
    fn test_eviction_after_threshold() {
        let mut table = PeerTable::with_capacity(4);
        table.seen(5, 2, -60, -90);
        assert_eq!(table.unseen(5, 2), Unseen::Counted(1));
        assert_eq!(table.unseen(5, 2), Unseen::Counted(2));
        assert_eq!(table.unseen(5, 2), Unseen::Evicted);
        assert_eq!(table.unseen(5, 2), Unseen::Unknown);
    }

    #[test]
    fn test_sighting_resets_counter() {
        let mut table = PeerTable::with_capacity(4);
        table.seen(5, 2, -60, -90);
        table.unseen(5, 1);
        table.seen(5, 2, -61, -90);
        assert_eq!(table.get(5).map(|e| e.unseen), Some(0));
        assert_eq!(table.unseen(5, 1), Unseen::Counted(1));
    }

    #[test]
    fn test_capacity_bound() {
        let mut table = PeerTable::with_capacity(2);
        table.seen(1, 1, -50, -90);
        table.seen(2, 1, -50, -90);
        assert!(!table.seen(3, 1, -40, -90));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_ranking() {
        let mut table = PeerTable::with_capacity(8);
        table.seen(1, 1, -70, -90);
        table.seen(2, 3, -40, -90);
        table.seen(3, 1, -50, -90);
        table.seen(4, 1, -50, -90);
        assert_eq!(table.strongest_where(|e| e.hop < 2), Some(3));
        assert_eq!(table.ranked_where(|e| e.hop < 2), alloc::vec![3, 4, 1]);
    }
}
