//! Data phase: replay of this node's part of the network schedule.
//!
//! Slots without an element, and elements past the end of the round, sleep.
//! A relay receives into one internal packet (`RecvBuffer`) and sends it on
//! in a later slot (`SendBuffer`).

use alloc::vec::Vec;

use log::{trace, warn};

use crate::context::MacContext;
use crate::packet::Packet;
use crate::schedule::{Action, Schedule, ScheduleElement};
use crate::traits::{Clock, Radio, RecvError, StreamBuffers};
use crate::types::NodeId;

#[derive(Debug, Default)]
pub struct DataPhase {
    schedule_id: u32,
    elements: Vec<ScheduleElement>,
    relay: Option<Packet>,
}

impl DataPhase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the active schedule with `node`'s elements of `schedule`.
    ///
    /// A packet held for relaying belongs to the old schedule and is dropped.
    pub fn set_schedule(&mut self, node: NodeId, schedule: Schedule) {
        self.elements = schedule.for_node(node);
        self.schedule_id = schedule.id;
        self.relay = None;
    }

    pub fn schedule_id(&self) -> u32 {
        self.schedule_id
    }

    /// This node's elements, ordered by slot.
    pub fn elements(&self) -> &[ScheduleElement] {
        &self.elements
    }

    pub fn element_at(&self, slot: u16) -> Option<&ScheduleElement> {
        self.elements.iter().find(|e| e.slot == slot)
    }

    pub fn holds_relay(&self) -> bool {
        self.relay.is_some()
    }

    /// Packet to transmit for a send element, if one is available.
    pub fn transmission<B: StreamBuffers>(
        &mut self,
        element: &ScheduleElement,
        buffers: &mut B,
    ) -> Option<Packet> {
        match element.action {
            Action::SendStream => buffers.outgoing(element.stream),
            Action::SendBuffer => self.relay.take(),
            Action::Sleep | Action::RecvStream | Action::RecvBuffer => None,
        }
    }

    /// Outcome of a receive element. `None` means nothing usable arrived.
    pub fn on_received<B: StreamBuffers>(
        &mut self,
        element: &ScheduleElement,
        packet: Option<Packet>,
        buffers: &mut B,
    ) {
        match element.action {
            Action::RecvStream => {
                buffers.deliver(element.stream, packet.unwrap_or_default());
            }
            Action::RecvBuffer => self.relay = packet,
            Action::Sleep | Action::SendStream | Action::SendBuffer => {}
        }
    }

    pub async fn execute<R: Radio, C: Clock, B: StreamBuffers>(
        &mut self,
        ctx: &MacContext,
        radio: &mut R,
        clock: &C,
        buffers: &mut B,
    ) {
        let slots = ctx.config().data_slots_per_round;
        let packet_time = ctx.config().packet_time;
        let wakeup_advance = ctx.config().wakeup_advance;

        for index in 0..self.elements.len() {
            let element = self.elements[index];
            if element.slot >= slots {
                trace!("element for slot {} beyond round, sleeping", element.slot);
                continue;
            }
            let start = ctx.data_slot_start(element.slot);
            match element.action {
                Action::Sleep => {}
                Action::SendStream | Action::SendBuffer => {
                    let Some(pkt) = self.transmission(&element, buffers) else {
                        trace!("nothing to send for {:?} in slot {}", element.stream, element.slot);
                        continue;
                    };
                    clock
                        .sleep_until(start.saturating_sub_duration(wakeup_advance))
                        .await;
                    radio.turn_on();
                    radio.send_at(pkt.data(), start).await;
                    radio.turn_off();
                }
                Action::RecvStream | Action::RecvBuffer => {
                    clock.sleep_until(ctx.wakeup_before(start)).await;
                    radio.turn_on();
                    let mut pkt = Packet::new();
                    let deadline = ctx.receive_deadline(start, packet_time);
                    let received = match radio.recv(pkt.receive_buffer(), Some(deadline)).await {
                        Ok(rx) => pkt.set_received(rx.size).ok().map(|()| pkt),
                        Err(RecvError::Timeout) => None,
                        Err(err) => {
                            warn!("data receive failed in slot {}: {}", element.slot, err);
                            None
                        }
                    };
                    radio.turn_off();
                    self.on_received(&element, received, buffers);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::vec;

    use embassy_futures::block_on;

    use super::*;
    use crate::config::NetworkConfig;
    use crate::sync::Synchronizable;
    use crate::time::Timestamp;
    use crate::traits::test_impls::{MockBuffers, MockClock, MockRadio};
    use crate::types::StreamId;

    const STREAM: StreamId = StreamId::new(3, 0, 1, 1);

    fn ctx(node: NodeId) -> MacContext {
        let config = NetworkConfig::default()
            .with_max_nodes(8)
            .with_data_slots(crate::time::Duration::from_millis(5), 8);
        let mut ctx = MacContext::new(node, config).unwrap();
        if let Some(sync) = ctx.sync_mut().as_follower_mut() {
            sync.initialize(Timestamp::from_secs(1));
        }
        ctx.set_hop(1);
        ctx
    }

    fn schedule() -> Schedule {
        Schedule::new(
            4,
            vec![
                ScheduleElement::new(5, 0, Action::SendStream, STREAM),
                ScheduleElement::new(3, 0, Action::RecvBuffer, STREAM),
                ScheduleElement::new(3, 2, Action::SendBuffer, STREAM),
                ScheduleElement::new(3, 1, Action::RecvStream, STREAM),
                ScheduleElement::new(3, 20, Action::RecvStream, STREAM),
            ],
        )
    }

    #[test]
    fn test_set_schedule_keeps_own_elements() {
        let mut phase = DataPhase::new();
        phase.set_schedule(3, schedule());
        assert_eq!(phase.schedule_id(), 4);
        assert_eq!(
            phase.elements().iter().map(|e| e.slot).collect::<Vec<_>>(),
            vec![0, 1, 2, 20]
        );
        assert_eq!(phase.element_at(2).unwrap().action, Action::SendBuffer);
        assert!(phase.element_at(3).is_none());
    }

    #[test]
    fn test_relay_buffer() {
        let mut phase = DataPhase::new();
        let mut buffers = MockBuffers::new();
        let recv = ScheduleElement::new(3, 0, Action::RecvBuffer, STREAM);
        let send = ScheduleElement::new(3, 2, Action::SendBuffer, STREAM);

        assert!(phase.transmission(&send, &mut buffers).is_none());
        let pkt = Packet::from_slice(&[1, 2, 3]).unwrap();
        phase.on_received(&recv, Some(pkt.clone()), &mut buffers);
        assert!(phase.holds_relay());
        assert_eq!(phase.transmission(&send, &mut buffers), Some(pkt));
        assert!(!phase.holds_relay());
    }

    #[test]
    fn test_lost_stream_packet_delivers_empty() {
        let mut phase = DataPhase::new();
        let mut buffers = MockBuffers::new();
        let recv = ScheduleElement::new(3, 1, Action::RecvStream, STREAM);
        phase.on_received(&recv, None, &mut buffers);
        let delivered = buffers.take_delivered();
        assert_eq!(delivered.len(), 1);
        assert!(delivered[0].1.is_empty());
    }

    #[test]
    fn test_execute_replays_schedule() {
        let ctx = ctx(3);
        let mut phase = DataPhase::new();
        phase.set_schedule(3, schedule());
        let mut radio = MockRadio::new();
        let mut buffers = MockBuffers::new();
        let clock = MockClock::at(Timestamp::from_secs(1));
        assert!(ctx.sync().is_synchronized());

        // slot 0 relays a frame, slot 1 loses the stream packet.
        radio.push_rx(&[9, 9], Some(Timestamp::from_secs(1)), -40);

        block_on(phase.execute(&ctx, &mut radio, &clock, &mut buffers));

        let sent = radio.take_sent();
        assert_eq!(sent, vec![(vec![9, 9], ctx.data_slot_start(2))]);
        let delivered = buffers.take_delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].0, STREAM);
        assert!(delivered[0].1.is_empty());
        // slot 20 lies beyond the 8 data slots of the round.
        assert_eq!(radio.recv_calls(), 2);
    }

    #[test]
    fn test_execute_sends_application_packet() {
        let ctx = ctx(5);
        let mut phase = DataPhase::new();
        phase.set_schedule(5, schedule());
        let mut radio = MockRadio::new();
        let mut buffers = MockBuffers::new();
        buffers.push_outgoing(STREAM, Packet::from_slice(&[7]).unwrap());
        let clock = MockClock::at(Timestamp::from_secs(1));

        block_on(phase.execute(&ctx, &mut radio, &clock, &mut buffers));
        assert_eq!(radio.take_sent(), vec![(vec![7], ctx.data_slot_start(0))]);

        // Empty application buffer: the slot stays silent.
        block_on(phase.execute(&ctx, &mut radio, &clock, &mut buffers));
        assert!(radio.take_sent().is_empty());
    }
}
