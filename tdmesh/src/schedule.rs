//! Data-phase schedules and the master-side schedule driver.
//!
//! A schedule is computed outside this crate from the topology graph and the
//! admitted streams. The core only consumes it: the master diffs it against
//! the stream collection, every node replays its own elements in the data
//! phase.

use alloc::vec::Vec;

use crate::stream::{MasterStreamInfo, StreamAdmitter, StreamCollection};
use crate::topology::{MasterTopology, TopologyMap};
use crate::types::{NodeId, StreamId};

/// What a node does in one data slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Sleep,
    /// Send the stream's next packet from the application buffer.
    SendStream,
    /// Receive a packet and hand it to the stream's sink.
    RecvStream,
    /// Relay: send the packet held in the relay buffer.
    SendBuffer,
    /// Relay: receive a packet into the relay buffer.
    RecvBuffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScheduleElement {
    /// Node performing the action.
    pub node: NodeId,
    /// Data slot index within the round.
    pub slot: u16,
    pub action: Action,
    pub stream: StreamId,
}

impl ScheduleElement {
    pub const fn new(node: NodeId, slot: u16, action: Action, stream: StreamId) -> Self {
        Self {
            node,
            slot,
            action,
            stream,
        }
    }
}

/// A complete network schedule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Schedule {
    /// Increments with every recomputation.
    pub id: u32,
    pub elements: Vec<ScheduleElement>,
}

impl Schedule {
    pub fn new(id: u32, elements: Vec<ScheduleElement>) -> Self {
        Self { id, elements }
    }

    /// `node`'s elements ordered by slot.
    pub fn for_node(&self, node: NodeId) -> Vec<ScheduleElement> {
        let mut own: Vec<ScheduleElement> = self
            .elements
            .iter()
            .filter(|e| e.node == node)
            .copied()
            .collect();
        own.sort_by_key(|e| e.slot);
        own
    }

    pub fn contains_stream(&self, stream: StreamId) -> bool {
        self.elements.iter().any(|e| e.stream == stream)
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }
}

/// The external scheduling algorithm.
pub trait ScheduleComputation {
    fn compute(&mut self, topology: &TopologyMap, streams: &[MasterStreamInfo]) -> Vec<ScheduleElement>;
}

impl<T: ScheduleComputation + ?Sized> ScheduleComputation for &mut T {
    fn compute(&mut self, topology: &TopologyMap, streams: &[MasterStreamInfo]) -> Vec<ScheduleElement> {
        (**self).compute(topology, streams)
    }
}

/// Result of one [`ScheduleDriver::step`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleUpdate {
    /// Nothing changed since the last step.
    Unchanged,
    /// A fresh schedule was computed and applied to the collection.
    New(Schedule),
    /// A node asked for the current schedule again.
    Resend(Schedule),
}

/// Runs the schedule computation when streams or topology change.
///
/// Lives on the schedule thread; shares the collection and the graph with
/// the round thread through their locks.
pub struct ScheduleDriver<'a, S> {
    streams: &'a StreamCollection,
    topology: &'a MasterTopology,
    computation: S,
    current: Schedule,
}

impl<'a, S: ScheduleComputation> ScheduleDriver<'a, S> {
    pub fn new(streams: &'a StreamCollection, topology: &'a MasterTopology, computation: S) -> Self {
        Self {
            streams,
            topology,
            computation,
            current: Schedule::default(),
        }
    }

    /// Continue after `current`, e.g. when the driver is rebuilt for every step.
    pub fn resume(
        streams: &'a StreamCollection,
        topology: &'a MasterTopology,
        computation: S,
        current: Schedule,
    ) -> Self {
        Self {
            streams,
            topology,
            computation,
            current,
        }
    }

    pub fn current(&self) -> &Schedule {
        &self.current
    }

    pub fn step(&mut self) -> ScheduleUpdate {
        let flags = self.streams.take_flags();
        let topology_changed = self.topology.take_changed();

        if flags.modified || flags.added || flags.removed || topology_changed {
            let graph = self.topology.snapshot();
            // Elements admitted while computing stay ACCEPTED for the next run.
            let snapshot = self.streams.snapshot();
            let streams = snapshot.streams();
            let elements = self.computation.compute(&graph, &streams);
            let schedule = Schedule::new(self.current.id.wrapping_add(1), elements);
            let changes = snapshot.stream_changes(&schedule.elements);
            self.streams.apply_changes(&changes);
            log::debug!(
                "schedule {} computed: {} elements for {} streams",
                schedule.id,
                schedule.elements.len(),
                streams.len()
            );
            self.current = schedule;
            return ScheduleUpdate::New(self.current.clone());
        }
        if flags.resend {
            log::debug!("resending schedule {}", self.current.id);
            return ScheduleUpdate::Resend(self.current.clone());
        }
        ScheduleUpdate::Unchanged
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use super::*;
    use crate::config::{DefaultConfig, NetworkConfig};
    use crate::stream::{InfoType, MasterStreamStatus};
    use crate::types::{Direction, Period, Redundancy, StreamParameters};
    use crate::wire::{SmeType, StreamManagementElement};

    /// One direct slot per accepted or established stream.
    struct DirectSlots {
        runs: usize,
    }

    impl ScheduleComputation for DirectSlots {
        fn compute(&mut self, _: &TopologyMap, streams: &[MasterStreamInfo]) -> Vec<ScheduleElement> {
            self.runs += 1;
            let mut out = Vec::new();
            for (slot, info) in streams.iter().filter(|s| s.id.is_stream()).enumerate() {
                let slot = slot as u16;
                out.push(ScheduleElement::new(info.id.src, slot, Action::SendStream, info.id));
                out.push(ScheduleElement::new(info.id.dst, slot, Action::RecvStream, info.id));
            }
            out
        }
    }

    fn params() -> StreamParameters {
        StreamParameters::new(Redundancy::None, Period::P1, 16, Direction::Up)
    }

    #[test]
    fn test_for_node_sorted_by_slot() {
        let id = StreamId::new(1, 2, 0, 1);
        let schedule = Schedule::new(
            1,
            vec![
                ScheduleElement::new(1, 5, Action::SendStream, id),
                ScheduleElement::new(2, 5, Action::RecvStream, id),
                ScheduleElement::new(1, 2, Action::SendStream, id),
            ],
        );
        let own = schedule.for_node(1);
        assert_eq!(own.iter().map(|e| e.slot).collect::<Vec<_>>(), vec![2, 5]);
        assert!(schedule.contains_stream(id));
    }

    #[test]
    fn test_driver_computes_then_resends() {
        let config = NetworkConfig::default();
        let streams = StreamCollection::new::<DefaultConfig>();
        let topology = MasterTopology::new(&config);
        let mut driver = ScheduleDriver::new(&streams, &topology, DirectSlots { runs: 0 });

        assert_eq!(driver.step(), ScheduleUpdate::Unchanged);

        let server = StreamId::server(2, 1);
        let client = StreamId::new(1, 2, 0, 1);
        streams.receive_smes(&[
            StreamManagementElement::new(server, params(), SmeType::Listen),
            StreamManagementElement::new(client, params(), SmeType::Connect),
        ]);

        let schedule = match driver.step() {
            ScheduleUpdate::New(schedule) => schedule,
            other => panic!("expected new schedule, got {other:?}"),
        };
        assert_eq!(schedule.id, 1);
        assert_eq!(schedule.elements.len(), 2);
        assert_eq!(
            streams.streams_with_status(MasterStreamStatus::Established).len(),
            1
        );

        // CONNECT on an established stream asks for a resend.
        streams.receive_smes(&[StreamManagementElement::new(client, params(), SmeType::Connect)]);
        assert_eq!(driver.step(), ScheduleUpdate::Resend(schedule));
        assert_eq!(driver.computation.runs, 1);
        assert_eq!(driver.step(), ScheduleUpdate::Unchanged);
    }

    #[test]
    fn test_driver_recomputes_on_topology_change() {
        let config = NetworkConfig::default();
        let streams = StreamCollection::new::<DefaultConfig>();
        let topology = MasterTopology::new(&config);
        let mut driver = ScheduleDriver::new(&streams, &topology, DirectSlots { runs: 0 });

        topology.apply_report(&crate::wire::TopologyReport::Tree {
            node: 3,
            predecessor: 0,
        });
        assert!(matches!(driver.step(), ScheduleUpdate::New(_)));
        assert_eq!(driver.current().id, 1);
    }

    /// Admits a CONNECT on the live collection while computing.
    struct AdmitDuringCompute<'a> {
        streams: &'a StreamCollection,
        client: StreamId,
    }

    impl ScheduleComputation for AdmitDuringCompute<'_> {
        fn compute(&mut self, _: &TopologyMap, _: &[MasterStreamInfo]) -> Vec<ScheduleElement> {
            self.streams.receive_smes(&[StreamManagementElement::new(
                self.client,
                params(),
                SmeType::Connect,
            )]);
            Vec::new()
        }
    }

    #[test]
    fn test_stream_admitted_during_compute_stays_accepted() {
        let config = NetworkConfig::default();
        let streams = StreamCollection::new::<DefaultConfig>();
        let topology = MasterTopology::new(&config);
        let client = StreamId::new(1, 2, 0, 1);
        streams.receive_smes(&[StreamManagementElement::new(
            StreamId::server(2, 1),
            params(),
            SmeType::Listen,
        )]);
        let computation = AdmitDuringCompute {
            streams: &streams,
            client,
        };
        let mut driver = ScheduleDriver::new(&streams, &topology, computation);

        topology.apply_report(&crate::wire::TopologyReport::Tree {
            node: 1,
            predecessor: 0,
        });
        assert!(matches!(driver.step(), ScheduleUpdate::New(_)));

        assert_eq!(
            streams.streams_with_status(MasterStreamStatus::Accepted).len(),
            1
        );
        assert!(streams
            .dequeue_info(8)
            .iter()
            .all(|info| info.kind != InfoType::StreamReject));
        // The admission raised the flags, so the next step computes again.
        assert!(matches!(driver.step(), ScheduleUpdate::New(ref s) if s.id == 2));
    }

    #[test]
    fn test_resumed_driver_continues_numbering() {
        let config = NetworkConfig::default();
        let streams = StreamCollection::new::<DefaultConfig>();
        let topology = MasterTopology::new(&config);
        let mut computation = DirectSlots { runs: 0 };

        let previous = Schedule::new(41, vec![]);
        let mut driver = ScheduleDriver::resume(&streams, &topology, &mut computation, previous);
        topology.apply_report(&crate::wire::TopologyReport::Tree {
            node: 2,
            predecessor: 0,
        });
        assert!(matches!(driver.step(), ScheduleUpdate::New(ref s) if s.id == 42));
        assert_eq!(computation.runs, 1);
    }
}
