//! Uplink phase: topology reports and stream management toward the master.
//!
//! Each round has one slot per non-master node. Slot `s` belongs to node
//! `(max_nodes - 1) - (s mod (max_nodes - 1))`, so the cycle runs from the
//! highest id down to 1 and every node owns exactly one slot per round. The
//! owner transmits its own topology report, then forwarded reports and as
//! many queued stream management elements as fit. Everyone else listens.
//!
//! A message is addressed to the sender's best predecessor (its assignee).
//! The assignee queues the payload for its own slot; the master folds it
//! into the topology graph and the stream collection.

use alloc::vec;

use log::{debug, trace, warn};

use crate::collections::{Enqueued, UpdatableQueue};
use crate::config::{MacConfig, NetworkConfig};
use crate::context::MacContext;
use crate::packet::Packet;
use crate::stream::StreamAdmitter;
use crate::topology::{MasterTopology, Sighting, Topology, TopologyTracker};
use crate::traits::{Clock, Radio, RecvError};
use crate::types::{Hop, NodeId, Rssi, StreamId, MAX_PACKET_SIZE};
use crate::wire::{Decode, Encode, StreamManagementElement, TopologyReport, UplinkMessage};

/// Owner of uplink slot `slot`.
pub fn slot_owner(config: &NetworkConfig, slot: u16) -> NodeId {
    let slots = config.uplink_slots().max(1);
    (slots - slot % slots) as NodeId
}

/// The slot `node` owns in every round, if it is a follower.
pub fn slot_of(config: &NetworkConfig, node: NodeId) -> Option<u16> {
    let slots = config.uplink_slots();
    let node = node as u16;
    (node >= 1 && node <= slots).then(|| slots - node)
}

/// Payload waiting for this node's slot.
pub struct ForwardQueues {
    reports: UpdatableQueue<NodeId, TopologyReport>,
    smes: UpdatableQueue<StreamId, StreamManagementElement>,
}

impl ForwardQueues {
    pub fn new<C: MacConfig>() -> Self {
        Self {
            reports: UpdatableQueue::with_max_capacity(C::MAX_FORWARDED_REPORTS),
            smes: UpdatableQueue::with_max_capacity(C::MAX_QUEUED_SMES),
        }
    }

    pub fn pending_reports(&self) -> usize {
        self.reports.len()
    }

    pub fn pending_smes(&self) -> usize {
        self.smes.len()
    }
}

/// Where received payload goes.
pub enum UplinkRole<'a> {
    Master {
        streams: &'a dyn StreamAdmitter,
        topology: &'a MasterTopology,
    },
    Follower(ForwardQueues),
}

pub struct UplinkPhase<'a> {
    topology: Topology<'a>,
    role: UplinkRole<'a>,
}

impl<'a> UplinkPhase<'a> {
    pub fn follower<C: MacConfig>(node_id: NodeId, config: &NetworkConfig) -> Self {
        Self {
            topology: Topology::follower(node_id, config),
            role: UplinkRole::Follower(ForwardQueues::new::<C>()),
        }
    }

    pub fn master(streams: &'a dyn StreamAdmitter, topology: &'a MasterTopology) -> Self {
        Self {
            topology: Topology::master(topology),
            role: UplinkRole::Master { streams, topology },
        }
    }

    pub fn topology(&self) -> &Topology<'a> {
        &self.topology
    }

    pub fn queues(&self) -> Option<&ForwardQueues> {
        match &self.role {
            UplinkRole::Follower(queues) => Some(queues),
            UplinkRole::Master { .. } => None,
        }
    }

    /// Track the hop chosen by the last flood.
    pub fn set_hop(&mut self, hop: Hop) {
        self.topology.change_hop(hop);
    }

    /// Submit a locally generated element.
    ///
    /// Followers queue it for their next slot; the master admits it directly.
    pub fn enqueue_sme(&mut self, sme: StreamManagementElement) -> Enqueued {
        match &mut self.role {
            UplinkRole::Follower(queues) => queues.smes.enqueue(sme.id, sme),
            UplinkRole::Master { streams, .. } => {
                streams.receive_smes(&[sme]);
                Enqueued::Appended
            }
        }
    }

    /// Message to send in `slot`, if this node owns it.
    pub fn outgoing(&mut self, ctx: &mut MacContext, slot: u16) -> Option<UplinkMessage> {
        if ctx.is_master() || slot_owner(ctx.config(), slot) != ctx.node_id() {
            return None;
        }
        let mut msg = UplinkMessage {
            hop: ctx.hop(),
            assignee: self.topology.best_predecessor(),
            reports: vec![self.topology.own_report()],
            smes: vec![],
        };
        if let (true, UplinkRole::Follower(queues)) =
            (self.topology.has_predecessor(), &mut self.role)
        {
            loop {
                let size = match queues.reports.peek() {
                    Some((_, report)) => report.encoded_size(),
                    None => break,
                };
                if msg.size_without_smes() + size > MAX_PACKET_SIZE
                    || msg.reports.len() >= u8::MAX as usize
                {
                    break;
                }
                match queues.reports.dequeue() {
                    Some((_, report)) => msg.reports.push(report),
                    None => break,
                }
            }
            msg.smes = queues.smes.dequeue_up_to(msg.sme_budget());
        }
        trace!(
            "uplink slot {}: {} reports, {} smes to {}",
            slot,
            msg.reports.len(),
            msg.smes.len(),
            msg.assignee
        );
        emit_debug!(
            ctx,
            crate::debug::DebugEvent::UplinkSent {
                slot,
                assignee: msg.assignee,
                reports: msg.reports.len(),
                smes: msg.smes.len(),
            }
        );
        Some(msg)
    }

    /// A frame arrived in `slot`. Returns true if it was a valid message from the slot's owner.
    pub fn on_message(&mut self, ctx: &mut MacContext, slot: u16, bytes: &[u8], rssi: Rssi) -> bool {
        let expected = slot_owner(ctx.config(), slot);
        let msg = match UplinkMessage::decode_from_slice(bytes) {
            Ok(msg) => msg,
            Err(err) => {
                debug!("malformed uplink in slot {}: {}", slot, err);
                self.on_miss(ctx, slot);
                return false;
            }
        };
        if msg.sender() != Some(expected) {
            debug!(
                "uplink in slot {} from {:?}, expected {}",
                slot,
                msg.sender(),
                expected
            );
            self.on_miss(ctx, slot);
            return false;
        }

        self.topology.received_message(&Sighting {
            sender: expected,
            hop: msg.hop,
            assignee: msg.assignee,
            rssi,
        });

        let forwarded = msg.assignee == ctx.node_id();
        if forwarded {
            match &mut self.role {
                UplinkRole::Master { streams, topology } => {
                    topology.apply_reports(&msg.reports);
                    if !msg.smes.is_empty() {
                        streams.receive_smes(&msg.smes);
                        emit_debug!(
                            ctx,
                            crate::debug::DebugEvent::SmesAdmitted {
                                count: msg.smes.len()
                            }
                        );
                    }
                }
                UplinkRole::Follower(queues) => {
                    for report in &msg.reports {
                        if queues.reports.enqueue(report.node(), *report) == Enqueued::Rejected {
                            warn!("report queue full, dropped report of {}", report.node());
                        }
                    }
                    for sme in &msg.smes {
                        if queues.smes.enqueue(sme.id, *sme) == Enqueued::Rejected {
                            warn!("sme queue full, dropped element for {:?}", sme.id);
                        }
                    }
                }
            }
        }
        emit_debug!(
            ctx,
            crate::debug::DebugEvent::UplinkReceived {
                from: expected,
                rssi,
                forwarded,
            }
        );
        true
    }

    /// Nothing usable was heard in `slot`.
    pub fn on_miss(&mut self, ctx: &mut MacContext, slot: u16) {
        let expected = slot_owner(ctx.config(), slot);
        if expected == ctx.node_id() {
            return;
        }
        if self.topology.unreceived_message(expected) {
            emit_debug!(
                ctx,
                crate::debug::DebugEvent::PeerEvicted { node: expected }
            );
        }
    }

    /// Run every uplink slot of the round.
    pub async fn execute<R: Radio, C: Clock>(
        &mut self,
        ctx: &mut MacContext,
        radio: &mut R,
        clock: &C,
    ) {
        let packet_time = ctx.config().packet_time;
        let wakeup_advance = ctx.config().wakeup_advance;
        for slot in 0..ctx.config().uplink_slots() {
            let start = ctx.uplink_slot_start(slot);
            if let Some(msg) = self.outgoing(ctx, slot) {
                let pkt = match msg.to_packet() {
                    Ok(pkt) => pkt,
                    Err(err) => {
                        warn!("uplink message does not fit: {}", err);
                        continue;
                    }
                };
                clock
                    .sleep_until(start.saturating_sub_duration(wakeup_advance))
                    .await;
                radio.turn_on();
                radio.send_at(pkt.data(), start).await;
                radio.turn_off();
                continue;
            }

            clock.sleep_until(ctx.wakeup_before(start)).await;
            radio.turn_on();
            let deadline = ctx.receive_deadline(start, packet_time);
            loop {
                let mut rx_pkt = Packet::new();
                match radio.recv(rx_pkt.receive_buffer(), Some(deadline)).await {
                    Ok(rx) => match rx_pkt.set_received(rx.size) {
                        Ok(()) => {
                            self.on_message(ctx, slot, rx_pkt.data(), rx.rssi);
                            break;
                        }
                        Err(err) => warn!("uplink frame dropped in slot {}: {}", slot, err),
                    },
                    Err(RecvError::Timeout) => {
                        self.on_miss(ctx, slot);
                        break;
                    }
                    Err(err) => warn!("uplink receive failed in slot {}: {}", slot, err),
                }
                if clock.now() >= deadline {
                    self.on_miss(ctx, slot);
                    break;
                }
            }
            radio.turn_off();
        }
    }
}
