//! Metrics collection for simulation analysis.

use std::collections::BTreeMap;

use tdmesh::debug::DebugEvent;
use tdmesh::{FloodOutcome, Hop, NodeId, Timestamp};

/// State of one node at the end of a round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeState {
    pub hop: Hop,
    pub synchronized: bool,
    pub outcome: Option<FloodOutcome>,
    /// Uplink assignee; `None` on the master and on nodes without one.
    pub predecessor: Option<NodeId>,
    /// Timing error of this round's sync packet, if one was received in steady state.
    pub sync_error_ns: Option<i64>,
    pub schedule_id: u32,
}

/// Network state at the end of one round.
#[derive(Debug, Clone)]
pub struct RoundSnapshot {
    pub round: u64,
    /// Global time the round started.
    pub time: Timestamp,
    pub nodes: BTreeMap<NodeId, NodeState>,
    /// Edges of the master's topology graph as `(low, high)` pairs.
    pub master_edges: Vec<(NodeId, NodeId)>,
}

impl RoundSnapshot {
    pub fn new(round: u64, time: Timestamp) -> Self {
        Self {
            round,
            time,
            nodes: BTreeMap::new(),
            master_edges: Vec::new(),
        }
    }

    pub fn record_node(&mut self, node: NodeId, state: NodeState) {
        self.nodes.insert(node, state);
    }

    /// Every powered node follows the master.
    pub fn all_synchronized(&self) -> bool {
        self.nodes.values().all(|n| n.synchronized)
    }

    pub fn synchronized_count(&self) -> usize {
        self.nodes.values().filter(|n| n.synchronized).count()
    }

    pub fn hop_of(&self, node: NodeId) -> Option<Hop> {
        self.nodes.get(&node).map(|n| n.hop)
    }

    /// Largest absolute sync error measured this round.
    pub fn max_abs_sync_error(&self) -> Option<u64> {
        self.nodes
            .values()
            .filter_map(|n| n.sync_error_ns)
            .map(i64::unsigned_abs)
            .max()
    }

    pub fn has_master_edge(&self, a: NodeId, b: NodeId) -> bool {
        let key = if a <= b { (a, b) } else { (b, a) };
        self.master_edges.contains(&key)
    }
}

/// Simulation metrics collected over time.
#[derive(Debug, Clone, Default)]
pub struct SimMetrics {
    /// Frames put on the air.
    pub frames_sent: u64,
    /// Frames lost to link loss.
    pub frames_dropped: u64,
    /// Frames that reached a powered node in range.
    pub frames_delivered: u64,
    /// One snapshot per round.
    pub snapshots: Vec<RoundSnapshot>,
    /// Debug events of every node, tagged with their round.
    pub events: Vec<(u64, NodeId, DebugEvent)>,
}

impl SimMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_snapshot(&mut self, snapshot: RoundSnapshot) {
        self.snapshots.push(snapshot);
    }

    pub fn latest_snapshot(&self) -> Option<&RoundSnapshot> {
        self.snapshots.last()
    }

    /// First round at whose end every node was synchronized.
    pub fn synchronized_by_round(&self) -> Option<u64> {
        self.snapshots
            .iter()
            .find(|s| s.all_synchronized())
            .map(|s| s.round)
    }

    /// Events emitted by `node`, in order.
    pub fn events_of(&self, node: NodeId) -> impl Iterator<Item = (u64, &DebugEvent)> + '_ {
        self.events
            .iter()
            .filter(move |(_, n, _)| *n == node)
            .map(|(round, _, event)| (*round, event))
    }

    /// Number of events matching `pred`.
    pub fn count_events(&self, pred: impl Fn(&DebugEvent) -> bool) -> usize {
        self.events.iter().filter(|(_, _, e)| pred(e)).count()
    }
}

/// Result of running a simulation.
#[derive(Debug, Clone)]
pub struct SimulationResult {
    /// Global time after the last round.
    pub end_time: Timestamp,
    pub rounds: u64,
    pub metrics: SimMetrics,
}

impl SimulationResult {
    /// Every node synchronized at the end.
    pub fn all_synchronized(&self) -> bool {
        self.metrics
            .latest_snapshot()
            .is_some_and(|s| s.all_synchronized())
    }

    /// Largest absolute sync error in the last round.
    pub fn final_max_sync_error(&self) -> Option<u64> {
        self.metrics
            .latest_snapshot()
            .and_then(|s| s.max_abs_sync_error())
    }

    /// Hop of every node at the end.
    pub fn final_hops(&self) -> BTreeMap<NodeId, Hop> {
        self.metrics
            .latest_snapshot()
            .map(|s| s.nodes.iter().map(|(&id, n)| (id, n.hop)).collect())
            .unwrap_or_default()
    }

    /// The master's graph spans every node of the last snapshot.
    pub fn converged(&self) -> bool {
        let Some(snapshot) = self.metrics.latest_snapshot() else {
            return false;
        };
        snapshot.nodes.keys().all(|&node| {
            snapshot.nodes.len() == 1
                || snapshot
                    .master_edges
                    .iter()
                    .any(|&(a, b)| a == node || b == node)
        })
    }
}
