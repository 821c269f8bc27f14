//! Flood events and their ordering.
//!
//! Sync packets and relays happen at precise instants within the flooding
//! phase, so the simulator orders them in a min-heap by global time. The
//! slotted uplink and data phases need no queue.

use std::cmp::Ordering;

use tdmesh::{NodeId, Rssi, StreamManagementElement, Timestamp};

/// Unique sequence number for deterministic event ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct SequenceNumber(u64);

impl SequenceNumber {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Changes applied at the start of a round.
#[derive(Debug, Clone)]
pub enum ScenarioAction {
    /// Isolate groups of nodes from each other.
    Partition { groups: Vec<Vec<NodeId>> },
    HealPartition,
    DisableLink { from: NodeId, to: NodeId },
    EnableLink { from: NodeId, to: NodeId },
    SetLossRate { from: NodeId, to: NodeId, rate: f64 },
    /// Node stops taking part in rounds.
    PowerOff { node: NodeId },
    /// Node restarts from scratch and hooks again.
    PowerOn { node: NodeId },
    /// A local application submits a stream management element.
    SubmitSme {
        node: NodeId,
        sme: StreamManagementElement,
    },
}

/// Frame on the air during the flood.
#[derive(Debug, Clone)]
pub enum Event {
    /// `from` starts transmitting.
    Transmit { from: NodeId, data: Vec<u8> },
    /// The frame reaches `to`.
    Delivery {
        to: NodeId,
        from: NodeId,
        data: Vec<u8>,
        rssi: Rssi,
    },
}

/// An event with its global time and tie-breaking sequence number.
#[derive(Debug, Clone)]
pub struct ScheduledEvent {
    pub time: Timestamp,
    pub seq: SequenceNumber,
    pub event: Event,
}

impl ScheduledEvent {
    pub fn new(time: Timestamp, seq: SequenceNumber, event: Event) -> Self {
        Self { time, seq, event }
    }
}

impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for ScheduledEvent {}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed: BinaryHeap is a max-heap.
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BinaryHeap;

    use super::*;

    fn transmit(at: Timestamp, seq: u64) -> ScheduledEvent {
        ScheduledEvent::new(
            at,
            SequenceNumber::new(seq),
            Event::Transmit {
                from: 0,
                data: vec![],
            },
        )
    }

    #[test]
    fn test_earlier_time_pops_first() {
        let mut heap = BinaryHeap::new();
        heap.push(transmit(Timestamp::from_micros(20), 1));
        heap.push(transmit(Timestamp::from_micros(5), 2));
        // Nanosecond resolution matters for relays.
        heap.push(transmit(Timestamp::from_nanos(5_001), 3));
        let order: Vec<u64> = std::iter::from_fn(|| heap.pop())
            .map(|e| e.seq.value())
            .collect();
        assert_eq!(order, vec![2, 3, 1]);
    }

    #[test]
    fn test_same_time_keeps_insertion_order() {
        let e1 = transmit(Timestamp::from_secs(1), 1);
        let e2 = transmit(Timestamp::from_secs(1), 2);
        assert!(e1 > e2);
    }
}
