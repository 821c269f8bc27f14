//! Schedule computation used by the simulated master.
//!
//! Each admitted stream is routed over a shortest path of the master's
//! topology graph and gets one data slot per hop, in consecutive slots, so
//! a packet crosses the whole path within one round. Streams that do not fit
//! in the remaining slots, or have no path, are left out and the driver
//! rejects them.

use std::collections::VecDeque;

use hashbrown::HashMap;
use log::warn;
use tdmesh::{
    Action, MasterStreamInfo, MasterStreamStatus, NodeId, ScheduleComputation, ScheduleElement,
    TopologyMap,
};

pub struct ShortestPathScheduler {
    slots_per_round: u16,
}

impl ShortestPathScheduler {
    pub fn new(slots_per_round: u16) -> Self {
        Self { slots_per_round }
    }
}

/// Breadth-first path from `src` to `dst`, both included.
///
/// Neighbors are visited in ascending id order, so ties resolve the same way every time.
pub fn shortest_path(graph: &TopologyMap, src: NodeId, dst: NodeId) -> Option<Vec<NodeId>> {
    if src == dst {
        return Some(vec![src]);
    }
    let mut parent: HashMap<NodeId, NodeId> = HashMap::new();
    let mut queue = VecDeque::from([src]);
    parent.insert(src, src);
    while let Some(node) = queue.pop_front() {
        let mut next: Vec<NodeId> = graph.neighbors_of(node).collect();
        next.sort_unstable();
        for peer in next {
            if parent.contains_key(&peer) {
                continue;
            }
            parent.insert(peer, node);
            if peer == dst {
                let mut path = vec![dst];
                let mut at = dst;
                while at != src {
                    at = parent[&at];
                    path.push(at);
                }
                path.reverse();
                return Some(path);
            }
            queue.push_back(peer);
        }
    }
    None
}

impl ScheduleComputation for ShortestPathScheduler {
    fn compute(&mut self, topology: &TopologyMap, streams: &[MasterStreamInfo]) -> Vec<ScheduleElement> {
        let mut elements = Vec::new();
        let mut slot: u16 = 0;
        for info in streams
            .iter()
            .filter(|s| s.id.is_stream() && s.status != MasterStreamStatus::Listen)
        {
            let Some(path) = shortest_path(topology, info.id.src, info.id.dst) else {
                warn!("no route for stream {:?}", info.id);
                continue;
            };
            let hops = path.len() - 1;
            if hops == 0 || usize::from(slot) + hops > usize::from(self.slots_per_round) {
                warn!("stream {:?} does not fit the data phase", info.id);
                continue;
            }
            for (i, pair) in path.windows(2).enumerate() {
                let send = if i == 0 {
                    Action::SendStream
                } else {
                    Action::SendBuffer
                };
                let recv = if i + 1 == hops {
                    Action::RecvStream
                } else {
                    Action::RecvBuffer
                };
                elements.push(ScheduleElement::new(pair[0], slot, send, info.id));
                elements.push(ScheduleElement::new(pair[1], slot, recv, info.id));
                slot += 1;
            }
        }
        elements
    }
}
