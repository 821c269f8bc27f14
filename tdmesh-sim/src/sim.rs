//! Round-stepped simulator for tdmesh networks.

use std::collections::{BTreeMap, BinaryHeap};

use log::{debug, info};
use tdmesh::debug::DebugEvent;
use tdmesh::uplink::slot_owner;
use tdmesh::{
    ConfigError, DefaultConfig, Encode, MasterTopology, NetworkConfig, NodeId, Packet, Rssi,
    Schedule, ScheduleComputation, ScheduleDriver, ScheduleUpdate, StreamCollection,
    StreamManagementElement, Timestamp, TopologyTracker, MASTER_ID,
};

use crate::event::{Event, ScenarioAction, ScheduledEvent, SequenceNumber};
use crate::metrics::{NodeState, RoundSnapshot, SimMetrics, SimulationResult};
use crate::node::{EventLog, SimClock, SimNode};
use crate::scheduler::ShortestPathScheduler;
use crate::topology::Topology;

/// State only the master holds: admission control, the topology graph and
/// the last computed schedule.
pub struct MasterState {
    streams: StreamCollection,
    topology: MasterTopology,
    schedule: Schedule,
}

impl MasterState {
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            streams: StreamCollection::new::<DefaultConfig>(),
            topology: MasterTopology::new(config),
            schedule: Schedule::default(),
        }
    }

    pub fn streams(&self) -> &StreamCollection {
        &self.streams
    }

    pub fn topology(&self) -> &MasterTopology {
        &self.topology
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }
}

/// Runs whole rounds of a simulated network.
///
/// The flood is event driven on a min-heap of global timestamps; the uplink
/// and data phases are stepped slot by slot. Nodes powered off keep their
/// clock so they come back with the same drift.
pub struct Simulator {
    config: NetworkConfig,
    nodes: BTreeMap<NodeId, SimNode>,
    /// Clocks of nodes that are powered off.
    powered_off: BTreeMap<NodeId, SimClock>,
    topology: Topology,
    master: MasterState,
    scheduler: Box<dyn ScheduleComputation>,
    log: EventLog,
    current_time: Timestamp,
    round: u64,
    event_queue: BinaryHeap<ScheduledEvent>,
    next_seq: u64,
    rng_state: u64,
    actions: BTreeMap<u64, Vec<ScenarioAction>>,
    metrics: SimMetrics,
}

impl Simulator {
    /// A network holding only the master, on an ideal clock.
    pub fn new(config: NetworkConfig, seed: u64) -> Result<Self, ConfigError> {
        let log = EventLog::new();
        let master = SimNode::new(MASTER_ID, config.clone(), SimClock::ideal(), &log)?;
        let scheduler = Box::new(ShortestPathScheduler::new(config.data_slots_per_round));
        Ok(Self {
            nodes: BTreeMap::from([(MASTER_ID, master)]),
            powered_off: BTreeMap::new(),
            topology: Topology::new(),
            master: MasterState::new(&config),
            scheduler,
            log,
            current_time: Timestamp::ZERO,
            round: 0,
            event_queue: BinaryHeap::new(),
            next_seq: 0,
            rng_state: seed,
            actions: BTreeMap::new(),
            metrics: SimMetrics::new(),
            config,
        })
    }

    pub fn with_topology(mut self, topology: Topology) -> Self {
        self.topology = topology;
        self
    }

    /// Replace the schedule computation run on the master.
    pub fn with_scheduler(mut self, scheduler: Box<dyn ScheduleComputation>) -> Self {
        self.scheduler = scheduler;
        self
    }

    /// Add follower `node_id` running on `clock`.
    pub fn add_node(&mut self, node_id: NodeId, clock: SimClock) -> Result<(), ConfigError> {
        let node = SimNode::new(node_id, self.config.clone(), clock, &self.log)?;
        self.nodes.insert(node_id, node);
        Ok(())
    }

    pub fn node(&self, id: NodeId) -> Option<&SimNode> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut SimNode> {
        self.nodes.get_mut(&id)
    }

    /// Ids of powered nodes, ascending.
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.nodes.keys().copied().collect()
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    pub fn current_time(&self) -> Timestamp {
        self.current_time
    }

    /// Rounds run so far.
    pub fn round(&self) -> u64 {
        self.round
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn topology_mut(&mut self) -> &mut Topology {
        &mut self.topology
    }

    pub fn master(&self) -> &MasterState {
        &self.master
    }

    pub fn metrics(&self) -> &SimMetrics {
        &self.metrics
    }

    /// Apply `action` at the start of round `round`.
    pub fn schedule_action(&mut self, round: u64, action: ScenarioAction) {
        self.actions.entry(round).or_default().push(action);
    }

    /// Hand `sme` to the node's uplink as its application would.
    pub fn submit_sme(&mut self, node: NodeId, sme: StreamManagementElement) {
        let master = &self.master;
        if let Some(sim_node) = self.nodes.get_mut(&node) {
            sim_node.with_uplink(master, |phase, _| phase.enqueue_sme(sme));
        }
    }

    pub fn run_rounds(&mut self, rounds: u64) -> SimulationResult {
        for _ in 0..rounds {
            self.run_round();
        }
        SimulationResult {
            end_time: self.current_time,
            rounds: self.round,
            metrics: self.metrics.clone(),
        }
    }

    /// Run one full round: flood, uplink slots, schedule update, data slots.
    pub fn run_round(&mut self) {
        let start = self.current_time;
        if let Some(actions) = self.actions.remove(&self.round) {
            for action in actions {
                self.execute_action(action);
            }
        }

        self.flood(start);
        self.uplink();
        self.update_schedule();
        self.data();
        for node in self.nodes.values_mut() {
            node.end_round();
        }

        self.take_snapshot(start);
        self.current_time = start + self.config.round_period;
        self.round += 1;
    }

    fn schedule(&mut self, time: Timestamp, event: Event) {
        let seq = SequenceNumber::new(self.next_seq);
        self.next_seq += 1;
        self.event_queue.push(ScheduledEvent::new(time, seq, event));
    }

    fn flood(&mut self, start: Timestamp) {
        let mut transmissions = Vec::new();
        for (&id, node) in self.nodes.iter_mut() {
            if let Some((data, at)) = node.begin_flood(start) {
                transmissions.push((id, data, at));
            }
        }
        for (from, data, at) in transmissions {
            self.schedule(at, Event::Transmit { from, data });
        }

        while let Some(event) = self.event_queue.pop() {
            match event.event {
                Event::Transmit { from, data } => {
                    self.metrics.frames_sent += 1;
                    for to in self.topology.neighbors(from) {
                        if !self.nodes.contains_key(&to) {
                            continue;
                        }
                        if let Some((rssi, delay)) = self.link_delivers(from, to) {
                            self.schedule(
                                event.time + delay,
                                Event::Delivery {
                                    to,
                                    from,
                                    data: data.clone(),
                                    rssi,
                                },
                            );
                        }
                    }
                }
                Event::Delivery { to, data, rssi, .. } => {
                    let Some(node) = self.nodes.get_mut(&to) else {
                        continue;
                    };
                    self.metrics.frames_delivered += 1;
                    if let Some((relay, at)) = node.receive_sync(&data, event.time, rssi) {
                        self.schedule(
                            at,
                            Event::Transmit {
                                from: to,
                                data: relay,
                            },
                        );
                    }
                }
            }
        }

        for node in self.nodes.values_mut() {
            node.end_flood();
        }
    }

    fn uplink(&mut self) {
        for slot in 0..self.config.uplink_slots() {
            let owner = slot_owner(&self.config, slot);
            let frame = {
                let master = &self.master;
                self.nodes
                    .get_mut(&owner)
                    .filter(|node| node.is_synchronized())
                    .and_then(|node| node.with_uplink(master, |phase, ctx| phase.outgoing(ctx, slot)))
                    .and_then(|message| message.to_packet().ok())
                    .map(|packet| packet.data().to_vec())
            };
            if frame.is_some() {
                self.metrics.frames_sent += 1;
            }

            let listeners: Vec<NodeId> = self
                .nodes
                .iter()
                .filter(|(&id, node)| id != owner && node.is_synchronized())
                .map(|(&id, _)| id)
                .collect();
            for id in listeners {
                let heard = match frame {
                    Some(_) => self.link_delivers(owner, id).map(|(rssi, _)| rssi),
                    None => None,
                };
                let master = &self.master;
                let Some(node) = self.nodes.get_mut(&id) else {
                    continue;
                };
                match (&frame, heard) {
                    (Some(bytes), Some(rssi)) => {
                        self.metrics.frames_delivered += 1;
                        node.with_uplink(master, |phase, ctx| phase.on_message(ctx, slot, bytes, rssi));
                    }
                    _ => node.with_uplink(master, |phase, ctx| phase.on_miss(ctx, slot)),
                }
            }
        }
    }

    /// One step of the master's schedule driver; a new or resent schedule
    /// reaches every node directly.
    fn update_schedule(&mut self) {
        let current = std::mem::take(&mut self.master.schedule);
        let mut driver = ScheduleDriver::resume(
            &self.master.streams,
            &self.master.topology,
            &mut *self.scheduler,
            current,
        );
        let update = driver.step();
        let current = driver.current().clone();
        self.master.schedule = current;

        let schedule = match update {
            ScheduleUpdate::Unchanged => return,
            ScheduleUpdate::New(schedule) | ScheduleUpdate::Resend(schedule) => schedule,
        };
        info!(
            "round {}: distributing schedule {} ({} elements)",
            self.round,
            schedule.id,
            schedule.elements.len()
        );
        for node in self.nodes.values_mut() {
            node.set_schedule(schedule.clone());
        }
    }

    fn data(&mut self) {
        for slot in 0..self.config.data_slots_per_round {
            let mut senders: Vec<(NodeId, Packet)> = Vec::new();
            let mut listeners: Vec<NodeId> = Vec::new();
            for (&id, node) in self.nodes.iter_mut() {
                if !node.is_synchronized() {
                    continue;
                }
                if let Some(packet) = node.data_transmit(slot) {
                    senders.push((id, packet));
                } else if node.data_listens(slot) {
                    listeners.push(id);
                }
            }
            self.metrics.frames_sent += senders.len() as u64;

            for id in listeners {
                let mut received = None;
                for (from, packet) in &senders {
                    if self.link_delivers(*from, id).is_some() {
                        received = Some(packet.clone());
                        break;
                    }
                }
                if received.is_some() {
                    self.metrics.frames_delivered += 1;
                }
                if let Some(node) = self.nodes.get_mut(&id) {
                    node.data_receive(slot, received);
                }
            }
        }
    }

    /// RSSI and delay of the link if a frame from `from` reaches `to` this time.
    fn link_delivers(&mut self, from: NodeId, to: NodeId) -> Option<(Rssi, tdmesh::Duration)> {
        let link = self.topology.get_link(from, to)?;
        if !link.active {
            return None;
        }
        let (loss_rate, rssi, delay) = (link.loss_rate, link.rssi, link.delay);
        if loss_rate > 0.0 && self.random_f64() < loss_rate {
            self.metrics.frames_dropped += 1;
            return None;
        }
        Some((rssi, delay))
    }

    fn execute_action(&mut self, action: ScenarioAction) {
        debug!("round {}: {:?}", self.round, action);
        match action {
            ScenarioAction::Partition { groups } => {
                self.topology.partition(&groups);
            }
            ScenarioAction::HealPartition => {
                self.topology.heal();
            }
            ScenarioAction::DisableLink { from, to } => {
                if let Some(link) = self.topology.get_link_mut(from, to) {
                    link.active = false;
                }
            }
            ScenarioAction::EnableLink { from, to } => {
                if let Some(link) = self.topology.get_link_mut(from, to) {
                    link.active = true;
                }
            }
            ScenarioAction::SetLossRate { from, to, rate } => {
                if let Some(link) = self.topology.get_link_mut(from, to) {
                    link.loss_rate = rate.clamp(0.0, 1.0);
                }
            }
            ScenarioAction::PowerOff { node } => {
                if node == MASTER_ID {
                    return;
                }
                if let Some(sim_node) = self.nodes.remove(&node) {
                    self.powered_off.insert(node, sim_node.clock().clone());
                }
            }
            ScenarioAction::PowerOn { node } => {
                if let Some(clock) = self.powered_off.remove(&node) {
                    if let Err(e) = self.add_node(node, clock) {
                        log::error!("node {} failed to restart: {}", node, e);
                    }
                }
            }
            ScenarioAction::SubmitSme { node, sme } => self.submit_sme(node, sme),
        }
    }

    fn take_snapshot(&mut self, start: Timestamp) {
        let events = self.log.take();
        let mut snapshot = RoundSnapshot::new(self.round, start);

        for (&id, node) in &self.nodes {
            let sync_error_ns = events.iter().rev().find_map(|(from, event)| match event {
                DebugEvent::SyncReceived { error_ns, .. } if *from == id => Some(*error_ns),
                _ => None,
            });
            let predecessor = node
                .uplink()
                .filter(|uplink| node.is_synchronized() && uplink.topology().has_predecessor())
                .map(|uplink| uplink.topology().best_predecessor());
            snapshot.record_node(
                id,
                NodeState {
                    hop: node.hop(),
                    synchronized: node.is_synchronized(),
                    outcome: node.last_outcome(),
                    predecessor,
                    sync_error_ns,
                    schedule_id: node.data().schedule_id(),
                },
            );
        }
        snapshot.master_edges = self.master.topology.snapshot().edges().collect();

        let round = self.round;
        self.metrics
            .events
            .extend(events.into_iter().map(|(node, event)| (round, node, event)));
        self.metrics.add_snapshot(snapshot);
    }

    /// Random f64 in [0, 1).
    fn random_f64(&mut self) -> f64 {
        self.rng_state = self
            .rng_state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1);
        (self.rng_state >> 11) as f64 / (1u64 << 53) as f64
    }
}
