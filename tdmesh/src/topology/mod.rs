//! Topology collection.
//!
//! During the uplink phase every node listens to its peers' messages. Which
//! peers it keeps depends on role and mode:
//!
//! - tree followers keep predecessors (lower hop) and successors (next hop
//!   down that chose them as assignee) and report their best predecessor
//! - mesh followers keep every neighbor above the RSSI floor and report the
//!   whole set
//! - the master keeps the network graph in a [`MasterTopology`] shared with
//!   the schedule computation

pub mod master;
pub mod mesh;
pub mod table;
pub mod tree;

pub use master::{MasterTopology, TopologyMap};
pub use mesh::MeshTopology;
pub use table::{PeerEntry, PeerTable, Unseen};
pub use tree::TreeTopology;

use crate::config::NetworkConfig;
use crate::types::{Hop, NodeId, Rssi, TopologyMode, MASTER_ID};
use crate::wire::TopologyReport;

/// An uplink message heard in its slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sighting {
    pub sender: NodeId,
    pub hop: Hop,
    pub assignee: NodeId,
    pub rssi: Rssi,
}

/// Per-node view of the neighborhood, updated once per uplink slot.
pub trait TopologyTracker {
    fn received_message(&mut self, sighting: &Sighting);

    /// The slot's owner was not heard. Returns true if it was dropped.
    fn unreceived_message(&mut self, sender: NodeId) -> bool;

    /// The node's hop changed after a flood.
    fn change_hop(&mut self, hop: Hop);

    /// Next hop toward the master; the node's own id when there is none.
    fn best_predecessor(&self) -> NodeId;

    fn has_predecessor(&self) -> bool;

    /// Report to put first in this node's uplink message.
    fn own_report(&self) -> TopologyReport;
}

/// Role- and mode-specific tracker.
#[derive(Debug)]
pub enum Topology<'a> {
    Tree(TreeTopology),
    Mesh(MeshTopology),
    Master(&'a MasterTopology),
}

impl<'a> Topology<'a> {
    pub fn follower(node_id: NodeId, config: &NetworkConfig) -> Self {
        match config.topology_mode {
            TopologyMode::Tree => Topology::Tree(TreeTopology::new(node_id, config)),
            TopologyMode::Mesh => Topology::Mesh(MeshTopology::new(node_id, config)),
        }
    }

    pub fn master(topology: &'a MasterTopology) -> Self {
        Topology::Master(topology)
    }
}

impl TopologyTracker for Topology<'_> {
    fn received_message(&mut self, sighting: &Sighting) {
        match self {
            Topology::Tree(tree) => tree.received_message(sighting),
            Topology::Mesh(mesh) => mesh.received_message(sighting),
            Topology::Master(master) => master.sighting(sighting.sender, sighting.rssi),
        }
    }

    fn unreceived_message(&mut self, sender: NodeId) -> bool {
        match self {
            Topology::Tree(tree) => tree.unreceived_message(sender),
            Topology::Mesh(mesh) => mesh.unreceived_message(sender),
            Topology::Master(master) => master.miss(sender),
        }
    }

    fn change_hop(&mut self, hop: Hop) {
        match self {
            Topology::Tree(tree) => tree.change_hop(hop),
            Topology::Mesh(mesh) => mesh.change_hop(hop),
            Topology::Master(_) => {}
        }
    }

    fn best_predecessor(&self) -> NodeId {
        match self {
            Topology::Tree(tree) => tree.best_predecessor(),
            Topology::Mesh(mesh) => mesh.best_predecessor(),
            Topology::Master(_) => MASTER_ID,
        }
    }

    fn has_predecessor(&self) -> bool {
        match self {
            Topology::Tree(tree) => tree.has_predecessor(),
            Topology::Mesh(mesh) => mesh.has_predecessor(),
            Topology::Master(_) => false,
        }
    }

    fn own_report(&self) -> TopologyReport {
        match self {
            Topology::Tree(tree) => tree.own_report(),
            Topology::Mesh(mesh) => mesh.own_report(),
            Topology::Master(_) => TopologyReport::Tree {
                node: MASTER_ID,
                predecessor: MASTER_ID,
            },
        }
    }
}
