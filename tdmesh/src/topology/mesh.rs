//! Mesh-mode follower state.
//!
//! Every peer heard above the RSSI floor is a neighbor. Predecessors are the
//! neighbors at a lower hop, ranked by signal strength, so a hop change keeps
//! the neighbor set and only re-ranks it.

use alloc::vec::Vec;

use crate::config::NetworkConfig;
use crate::topology::table::{PeerTable, Unseen};
use crate::topology::{Sighting, TopologyTracker};
use crate::types::{Hop, NodeId, Rssi, MASTER_ID};
use crate::wire::{NeighborMask, TopologyReport};

#[derive(Debug, Clone)]
pub struct MeshTopology {
    node_id: NodeId,
    hop: Hop,
    min_rssi: Rssi,
    max_unavailable: u8,
    neighbors: PeerTable,
}

impl MeshTopology {
    pub fn new(node_id: NodeId, config: &NetworkConfig) -> Self {
        Self {
            node_id,
            hop: 0,
            min_rssi: config.min_neighbor_rssi,
            max_unavailable: config.max_rounds_unavailable,
            neighbors: PeerTable::with_capacity(config.max_nodes as usize),
        }
    }

    pub fn neighbors(&self) -> &PeerTable {
        &self.neighbors
    }

    /// Lower-hop neighbors, strongest first.
    pub fn predecessors(&self) -> Vec<NodeId> {
        let hop = self.hop;
        self.neighbors.ranked_where(|entry| entry.hop < hop)
    }

    pub fn neighbor_mask(&self) -> NeighborMask {
        let mut mask: NeighborMask = self.neighbors.iter().map(|(node, _)| node).collect();
        if self.hop == 1 {
            mask.insert(MASTER_ID);
        }
        mask
    }
}

impl TopologyTracker for MeshTopology {
    fn received_message(&mut self, s: &Sighting) {
        if self.neighbors.seen(s.sender, s.hop, s.rssi, self.min_rssi) {
            log::debug!("neighbor {} added (rssi {})", s.sender, s.rssi);
        }
    }

    fn unreceived_message(&mut self, sender: NodeId) -> bool {
        let evicted = self.neighbors.unseen(sender, self.max_unavailable) == Unseen::Evicted;
        if evicted {
            log::debug!("neighbor {} unavailable, dropped", sender);
        }
        evicted
    }

    fn change_hop(&mut self, hop: Hop) {
        self.hop = hop;
    }

    fn best_predecessor(&self) -> NodeId {
        if self.hop == 1 {
            return MASTER_ID;
        }
        let hop = self.hop;
        self.neighbors
            .strongest_where(|entry| entry.hop < hop)
            .unwrap_or(self.node_id)
    }

    fn has_predecessor(&self) -> bool {
        self.hop == 1 || (self.hop > 1 && self.best_predecessor() != self.node_id)
    }

    fn own_report(&self) -> TopologyReport {
        TopologyReport::Mesh {
            node: self.node_id,
            neighbors: self.neighbor_mask(),
        }
    }
}
