//! Radio links between simulated nodes.

use hashbrown::HashMap;
use tdmesh::{Duration, NodeId, Rssi};

/// Properties of a radio link between two nodes.
#[derive(Debug, Clone)]
pub struct Link {
    /// Signal strength seen on both ends, in dBm.
    pub rssi: Rssi,
    /// Frame loss probability (0.0 to 1.0).
    pub loss_rate: f64,
    /// Propagation and processing delay.
    pub delay: Duration,
    /// Whether the link is currently usable.
    pub active: bool,
}

impl Default for Link {
    fn default() -> Self {
        Self {
            rssi: -60,
            loss_rate: 0.0,
            delay: Duration::ZERO,
            active: true,
        }
    }
}

impl Link {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rssi(mut self, rssi: Rssi) -> Self {
        self.rssi = rssi;
        self
    }

    pub fn with_loss_rate(mut self, rate: f64) -> Self {
        self.loss_rate = rate.clamp(0.0, 1.0);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }
}

/// Symmetric connectivity between node ids.
#[derive(Debug, Clone, Default)]
pub struct Topology {
    links: HashMap<(NodeId, NodeId), Link>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every pair of nodes in range.
    pub fn fully_connected(nodes: &[NodeId]) -> Self {
        let mut topo = Self::new();
        for (i, &a) in nodes.iter().enumerate() {
            for &b in nodes.iter().skip(i + 1) {
                topo.add_link(a, b, Link::default());
            }
        }
        topo
    }

    /// Each node hears only its list neighbors, so hop count grows along the list.
    pub fn chain(nodes: &[NodeId]) -> Self {
        let mut topo = Self::new();
        for window in nodes.windows(2) {
            topo.add_link(window[0], window[1], Link::default());
        }
        topo
    }

    /// First node is the hub.
    pub fn star(nodes: &[NodeId]) -> Self {
        let mut topo = Self::new();
        let Some((&hub, spokes)) = nodes.split_first() else {
            return topo;
        };
        for &spoke in spokes {
            topo.add_link(hub, spoke, Link::default());
        }
        topo
    }

    pub fn add_link(&mut self, a: NodeId, b: NodeId, link: Link) {
        self.links.insert(Self::canonical_pair(a, b), link);
    }

    pub fn get_link(&self, a: NodeId, b: NodeId) -> Option<&Link> {
        self.links.get(&Self::canonical_pair(a, b))
    }

    pub fn get_link_mut(&mut self, a: NodeId, b: NodeId) -> Option<&mut Link> {
        self.links.get_mut(&Self::canonical_pair(a, b))
    }

    /// Link exists and is active.
    pub fn is_connected(&self, a: NodeId, b: NodeId) -> bool {
        self.get_link(a, b).is_some_and(|link| link.active)
    }

    /// Nodes reachable from `node` over active links, ascending.
    pub fn neighbors(&self, node: NodeId) -> Vec<NodeId> {
        let mut result: Vec<NodeId> = self
            .links
            .iter()
            .filter(|(_, link)| link.active)
            .filter_map(|(&(a, b), _)| {
                if a == node {
                    Some(b)
                } else if b == node {
                    Some(a)
                } else {
                    None
                }
            })
            .collect();
        result.sort_unstable();
        result
    }

    /// Disable every link crossing between groups.
    pub fn partition(&mut self, groups: &[Vec<NodeId>]) {
        for (&(a, b), link) in self.links.iter_mut() {
            let a_group = groups.iter().position(|g| g.contains(&a));
            let b_group = groups.iter().position(|g| g.contains(&b));
            if a_group != b_group {
                link.active = false;
            }
        }
    }

    /// Re-enable all links.
    pub fn heal(&mut self) {
        for link in self.links.values_mut() {
            link.active = true;
        }
    }

    pub fn set_global_loss_rate(&mut self, rate: f64) {
        let rate = rate.clamp(0.0, 1.0);
        for link in self.links.values_mut() {
            link.loss_rate = rate;
        }
    }

    pub fn set_global_rssi(&mut self, rssi: Rssi) {
        for link in self.links.values_mut() {
            link.rssi = rssi;
        }
    }

    fn canonical_pair(a: NodeId, b: NodeId) -> (NodeId, NodeId) {
        if a < b {
            (a, b)
        } else {
            (b, a)
        }
    }
}
