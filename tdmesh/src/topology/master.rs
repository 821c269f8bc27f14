//! Master-side network graph.
//!
//! The round thread feeds it reports and direct sightings; the schedule
//! thread takes snapshots. Every public call holds the lock for its whole
//! duration and never across a radio operation.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::vec::Vec;
use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex;

use crate::collections::SharedMutex;
use crate::config::NetworkConfig;
use crate::types::{NodeId, Rssi, TopologyMode, MASTER_ID};
use crate::wire::TopologyReport;

/// Undirected edge set over node ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologyMap {
    edges: BTreeSet<(NodeId, NodeId)>,
}

impl TopologyMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn key(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
        if a <= b {
            (a, b)
        } else {
            (b, a)
        }
    }

    /// Returns true if the edge was new. Self-loops are ignored.
    pub fn add_edge(&mut self, a: NodeId, b: NodeId) -> bool {
        a != b && self.edges.insert(Self::key(a, b))
    }

    pub fn remove_edge(&mut self, a: NodeId, b: NodeId) -> bool {
        self.edges.remove(&Self::key(a, b))
    }

    pub fn has_edge(&self, a: NodeId, b: NodeId) -> bool {
        self.edges.contains(&Self::key(a, b))
    }

    pub fn neighbors_of(&self, node: NodeId) -> impl Iterator<Item = NodeId> + '_ {
        self.edges.iter().filter_map(move |&(a, b)| {
            if a == node {
                Some(b)
            } else if b == node {
                Some(a)
            } else {
                None
            }
        })
    }

    /// Edges as `(low, high)` pairs in ascending order.
    pub fn edges(&self) -> impl Iterator<Item = (NodeId, NodeId)> + '_ {
        self.edges.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

struct Inner {
    mode: TopologyMode,
    min_rssi: Rssi,
    max_unavailable: u8,
    graph: TopologyMap,
    /// Nodes the master hears directly, with their missed-slot counters.
    unseen: BTreeMap<NodeId, u8>,
    /// Tree mode: the predecessor each node last reported.
    tree_parent: BTreeMap<NodeId, NodeId>,
    changed: bool,
}

impl Inner {
    fn drop_master_edge(&mut self, node: NodeId) {
        if self.graph.remove_edge(node, MASTER_ID) {
            self.changed = true;
        }
        if self.tree_parent.get(&node) == Some(&MASTER_ID) {
            self.tree_parent.remove(&node);
        }
    }

    fn apply_tree(&mut self, node: NodeId, predecessor: NodeId) {
        // A node without a predecessor reports itself.
        if predecessor == node {
            return;
        }
        let previous = self.tree_parent.insert(node, predecessor);
        if previous == Some(predecessor) && self.graph.has_edge(node, predecessor) {
            return;
        }
        if let Some(old) = previous {
            self.graph.remove_edge(node, old);
        }
        self.graph.add_edge(node, predecessor);
        self.changed = true;
    }

    fn apply_mesh(&mut self, node: NodeId, neighbors: &crate::wire::NeighborMask) {
        let stale: Vec<NodeId> = self
            .graph
            .neighbors_of(node)
            .filter(|&peer| peer != MASTER_ID && !neighbors.contains(peer))
            .collect();
        for peer in stale {
            self.graph.remove_edge(node, peer);
            self.changed = true;
        }
        for peer in neighbors.iter().filter(|&peer| peer != node) {
            if self.graph.add_edge(node, peer) {
                self.changed = true;
            }
        }
    }
}

/// The master's view of the whole network.
pub struct MasterTopology {
    inner: Mutex<SharedMutex, RefCell<Inner>>,
}

impl core::fmt::Debug for MasterTopology {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MasterTopology")
            .field("edges", &self.snapshot().len())
            .finish_non_exhaustive()
    }
}

impl MasterTopology {
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            inner: Mutex::new(RefCell::new(Inner {
                mode: config.topology_mode,
                min_rssi: config.min_neighbor_rssi,
                max_unavailable: config.max_rounds_unavailable,
                graph: TopologyMap::new(),
                unseen: BTreeMap::new(),
                tree_parent: BTreeMap::new(),
                changed: false,
            })),
        }
    }

    /// The master heard `node` directly.
    ///
    /// In mesh mode the first sighting above the floor creates the node's
    /// edge to the master. Any sighting of a known node resets its counter.
    pub fn sighting(&self, node: NodeId, rssi: Rssi) {
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            if let Some(counter) = inner.unseen.get_mut(&node) {
                *counter = 0;
                return;
            }
            if rssi < inner.min_rssi {
                return;
            }
            inner.unseen.insert(node, 0);
            if inner.mode == TopologyMode::Mesh && inner.graph.add_edge(node, MASTER_ID) {
                inner.changed = true;
            }
        })
    }

    /// `node` did not fill its slot. Returns true if its master edge was dropped.
    pub fn miss(&self, node: NodeId) -> bool {
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            let max_unavailable = inner.max_unavailable;
            let Some(counter) = inner.unseen.get_mut(&node) else {
                return false;
            };
            *counter = counter.saturating_add(1);
            if *counter <= max_unavailable {
                return false;
            }
            inner.unseen.remove(&node);
            inner.drop_master_edge(node);
            log::debug!("master lost direct contact with {}", node);
            true
        })
    }

    /// Fold one topology report into the graph.
    pub fn apply_report(&self, report: &TopologyReport) {
        self.inner.lock(|cell| {
            let mut inner = cell.borrow_mut();
            match report {
                TopologyReport::Tree { node, predecessor } => inner.apply_tree(*node, *predecessor),
                TopologyReport::Mesh { node, neighbors } => inner.apply_mesh(*node, neighbors),
            }
        })
    }

    pub fn apply_reports<'r>(&self, reports: impl IntoIterator<Item = &'r TopologyReport>) {
        for report in reports {
            self.apply_report(report);
        }
    }

    /// Consistent copy of the graph.
    pub fn snapshot(&self) -> TopologyMap {
        self.inner.lock(|cell| cell.borrow().graph.clone())
    }

    pub fn has_changed(&self) -> bool {
        self.inner.lock(|cell| cell.borrow().changed)
    }

    /// Return and clear the changed flag.
    pub fn take_changed(&self) -> bool {
        self.inner
            .lock(|cell| core::mem::take(&mut cell.borrow_mut().changed))
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::wire::NeighborMask;

    fn config(mode: TopologyMode) -> NetworkConfig {
        NetworkConfig::default()
            .with_topology_mode(mode)
            .with_max_rounds_unavailable(1)
    }

    #[test]
    fn test_map_is_undirected() {
        let mut map = TopologyMap::new();
        assert!(map.add_edge(3, 1));
        assert!(!map.add_edge(1, 3));
        assert!(!map.add_edge(2, 2));
        assert!(map.has_edge(1, 3));
        assert_eq!(map.edges().collect::<Vec<_>>(), vec![(1, 3)]);
        assert_eq!(map.neighbors_of(3).collect::<Vec<_>>(), vec![1]);
    }

    #[test]
    fn test_tree_report_replaces_previous_edge() {
        let graph = MasterTopology::new(&config(TopologyMode::Tree));
        graph.apply_report(&TopologyReport::Tree {
            node: 5,
            predecessor: 2,
        });
        assert!(graph.take_changed());
        graph.apply_report(&TopologyReport::Tree {
            node: 5,
            predecessor: 2,
        });
        assert!(!graph.has_changed());

        graph.apply_report(&TopologyReport::Tree {
            node: 5,
            predecessor: 3,
        });
        let map = graph.snapshot();
        assert!(map.has_edge(5, 3));
        assert!(!map.has_edge(5, 2));
        assert!(graph.take_changed());
    }

    #[test]
    fn test_tree_placeholder_ignored() {
        let graph = MasterTopology::new(&config(TopologyMode::Tree));
        graph.apply_report(&TopologyReport::Tree {
            node: 5,
            predecessor: 5,
        });
        assert!(graph.snapshot().is_empty());
        assert!(!graph.has_changed());
    }

    #[test]
    fn test_mesh_master_edge_follows_sightings() {
        let graph = MasterTopology::new(&config(TopologyMode::Mesh));
        graph.sighting(4, -95);
        assert!(graph.snapshot().is_empty());

        graph.sighting(4, -60);
        assert!(graph.snapshot().has_edge(4, MASTER_ID));
        assert!(!graph.miss(4));
        // A weak repeat sighting still resets the counter.
        graph.sighting(4, -99);
        assert!(!graph.miss(4));
        assert!(graph.miss(4));
        assert!(!graph.snapshot().has_edge(4, MASTER_ID));
        assert!(!graph.miss(4));
    }

    #[test]
    fn test_mesh_report_replaces_peer_edges_but_not_master_edge() {
        let graph = MasterTopology::new(&config(TopologyMode::Mesh));
        graph.sighting(4, -60);
        let first: NeighborMask = [2u8, 3].into_iter().collect();
        graph.apply_report(&TopologyReport::Mesh {
            node: 4,
            neighbors: first,
        });
        let second: NeighborMask = [3u8, 6].into_iter().collect();
        graph.apply_report(&TopologyReport::Mesh {
            node: 4,
            neighbors: second,
        });
        let map = graph.snapshot();
        assert!(!map.has_edge(4, 2));
        assert!(map.has_edge(4, 3));
        assert!(map.has_edge(4, 6));
        assert!(map.has_edge(4, MASTER_ID));
    }

    #[test]
    fn test_mesh_report_can_add_master_edge() {
        let graph = MasterTopology::new(&config(TopologyMode::Mesh));
        let mask: NeighborMask = [MASTER_ID, 3].into_iter().collect();
        graph.apply_report(&TopologyReport::Mesh {
            node: 4,
            neighbors: mask,
        });
        assert!(graph.snapshot().has_edge(4, MASTER_ID));
    }
}
