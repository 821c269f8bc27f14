//! Tree-mode follower state.

use crate::config::NetworkConfig;
use crate::topology::table::{PeerTable, Unseen};
use crate::topology::{Sighting, TopologyTracker};
use crate::types::{Hop, NodeId, Rssi, MASTER_ID};
use crate::wire::TopologyReport;

#[derive(Debug, Clone)]
pub struct TreeTopology {
    node_id: NodeId,
    hop: Hop,
    min_rssi: Rssi,
    max_unavailable: u8,
    predecessors: PeerTable,
    successors: PeerTable,
}

impl TreeTopology {
    pub fn new(node_id: NodeId, config: &NetworkConfig) -> Self {
        let capacity = config.max_nodes as usize;
        Self {
            node_id,
            hop: 0,
            min_rssi: config.min_neighbor_rssi,
            max_unavailable: config.max_rounds_unavailable,
            predecessors: PeerTable::with_capacity(capacity),
            successors: PeerTable::with_capacity(capacity),
        }
    }

    pub fn hop(&self) -> Hop {
        self.hop
    }

    pub fn predecessors(&self) -> &PeerTable {
        &self.predecessors
    }

    /// Nodes one hop further out that route through this node.
    pub fn successors(&self) -> &PeerTable {
        &self.successors
    }
}

impl TopologyTracker for TreeTopology {
    fn received_message(&mut self, s: &Sighting) {
        if self.hop == 0 {
            return;
        }
        if s.hop < self.hop {
            self.successors.remove(s.sender);
            if self.predecessors.seen(s.sender, s.hop, s.rssi, self.min_rssi) {
                log::debug!("predecessor {} added (rssi {})", s.sender, s.rssi);
            }
            return;
        }
        // A peer that moved to our depth or below no longer leads to the master.
        self.predecessors.remove(s.sender);
        if s.hop == self.hop + 1 && s.assignee == self.node_id {
            self.successors.seen(s.sender, s.hop, s.rssi, self.min_rssi);
        } else {
            self.successors.remove(s.sender);
        }
    }

    fn unreceived_message(&mut self, sender: NodeId) -> bool {
        let predecessor = self.predecessors.unseen(sender, self.max_unavailable);
        let successor = self.successors.unseen(sender, self.max_unavailable);
        let evicted = predecessor == Unseen::Evicted || successor == Unseen::Evicted;
        if evicted {
            log::debug!("peer {} unavailable, dropped", sender);
        }
        evicted
    }

    fn change_hop(&mut self, hop: Hop) {
        if hop != self.hop {
            self.hop = hop;
            self.predecessors.clear();
            self.successors.clear();
        }
    }

    fn best_predecessor(&self) -> NodeId {
        if self.hop == 1 {
            return MASTER_ID;
        }
        self.predecessors
            .strongest_where(|_| true)
            .unwrap_or(self.node_id)
    }

    fn has_predecessor(&self) -> bool {
        self.hop == 1 || (self.hop > 1 && !self.predecessors.is_empty())
    }

    fn own_report(&self) -> TopologyReport {
        TopologyReport::Tree {
            node: self.node_id,
            predecessor: self.best_predecessor(),
        }
    }
}
