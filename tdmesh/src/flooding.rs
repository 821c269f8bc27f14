//! Flooding phase: sync packet broadcast, relay and clock correction.
//!
//! The master opens every round by transmitting a sync packet with hop 0.
//! A follower that accepts a packet at hop `h` takes hop `h + 1`, relays the
//! packet with the hop byte incremented one rebroadcast interval after it
//! arrived, and feeds the arrival time to its synchronizer.
//!
//! The phase is split into handlers (`plan`, `on_sync`, `finish`) so the
//! simulator can drive it without a radio; [`FloodingPhase::execute`] wires
//! the same handlers to a [`Radio`] and a [`Clock`].

use log::{debug, trace, warn};

use crate::context::MacContext;
use crate::sync::{MissOutcome, Synchronizable, SyncMode};
use crate::time::Timestamp;
use crate::traits::{Clock, Radio, Received, RecvError};
use crate::types::{Hop, MAX_PACKET_SIZE, SYNC_HOP_OFFSET, SYNC_PACKET_SIZE};
use crate::wire::{is_sync_packet, sync_packet, HopCheck};

/// What the node does with its radio during the flood.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloodPlan {
    /// Master: send the round's sync packet at `at`.
    Transmit {
        packet: [u8; SYNC_PACKET_SIZE],
        at: Timestamp,
    },
    /// Follower: listen from `wake` until `deadline`.
    Listen {
        wake: Timestamp,
        deadline: Option<Timestamp>,
    },
}

/// A sync packet to rebroadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relay {
    pub packet: [u8; SYNC_PACKET_SIZE],
    pub at: Timestamp,
}

/// Verdict on one received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncVerdict {
    /// Not a sync packet for this node; keep listening.
    Rejected,
    /// Accepted; relay if the flood has not reached `max_hops`.
    Accepted(Option<Relay>),
}

/// How the round's flood ended for this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FloodOutcome {
    /// Master transmitted.
    Sent,
    /// Follower hooked onto the network.
    Hooked { hop: Hop },
    /// Follower received the expected packet.
    Synchronized { hop: Hop },
    /// Expected packet not heard; still synchronized.
    Missed { missed: u8 },
    /// Miss threshold exceeded; back to hooking.
    Desynchronized,
    /// Hooking listen window ended without a usable packet.
    NotHooked,
}

impl FloodOutcome {
    /// Whether the node may take part in the rest of the round.
    pub fn is_synchronized(&self) -> bool {
        matches!(
            self,
            FloodOutcome::Sent
                | FloodOutcome::Hooked { .. }
                | FloodOutcome::Synchronized { .. }
                | FloodOutcome::Missed { .. }
        )
    }
}

#[derive(Debug, Default)]
pub struct FloodingPhase {
    accepted: Option<FloodOutcome>,
    sent: bool,
}

impl FloodingPhase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decide this round's radio activity. Starts a new round of the phase.
    pub fn plan(&mut self, ctx: &mut MacContext, now: Timestamp) -> FloodPlan {
        self.accepted = None;
        self.sent = false;

        let wakeup_advance = ctx.config().wakeup_advance;
        let hook_listen_window = ctx.config().hook_listen_window;
        let pan_id = ctx.config().pan_id;
        let was_synchronized = ctx.is_synchronized();
        let scheduled = ctx.sync().frame_start();

        if let Some(base) = ctx.sync_mut().as_master_mut() {
            let at = if was_synchronized && scheduled >= now {
                scheduled
            } else {
                now + wakeup_advance
            };
            base.set_frame_start(at);
            self.sent = true;
            trace!("master sync at {} us", at.as_micros());
            emit_debug!(ctx, crate::debug::DebugEvent::SyncSent { at });
            return FloodPlan::Transmit {
                packet: sync_packet(0, pan_id),
                at,
            };
        }

        match ctx.sync().as_follower() {
            Some(sync) if sync.mode() == SyncMode::Steady => {
                let (wake, timeout) = sync.wakeup_and_timeout(ctx.config());
                FloodPlan::Listen {
                    wake,
                    deadline: Some(timeout),
                }
            }
            _ => FloodPlan::Listen {
                wake: now,
                deadline: Some(now.saturating_add(hook_listen_window)),
            },
        }
    }

    /// Examine a received frame. Only the first accepted packet counts.
    pub fn on_sync(&mut self, ctx: &mut MacContext, bytes: &[u8], rx: &Received) -> SyncVerdict {
        if self.accepted.is_some() {
            return SyncVerdict::Rejected;
        }
        let Some(mode) = ctx.sync().as_follower().map(|sync| sync.mode()) else {
            return SyncVerdict::Rejected;
        };
        let config = ctx.config();

        let hop_check = match mode {
            SyncMode::Hooking => {
                if rx.rssi < config.min_hooking_rssi {
                    trace!("sync below hooking floor ({} dBm)", rx.rssi);
                    return SyncVerdict::Rejected;
                }
                match config.static_hop {
                    Some(hop) => HopCheck::Equals(hop - 1),
                    None => HopCheck::Any,
                }
            }
            SyncMode::Steady => HopCheck::Equals(ctx.hop().saturating_sub(1)),
        };
        let Some(timestamp) = rx.timestamp else {
            return SyncVerdict::Rejected;
        };
        if !is_sync_packet(bytes, true, config.pan_id, hop_check) {
            return SyncVerdict::Rejected;
        }

        let new_hop = bytes[SYNC_HOP_OFFSET].saturating_add(1);
        let relay_delay = config.rebroadcast_interval;
        let max_hops = config.max_hops;

        let Some(sync) = ctx.sync_mut().as_follower_mut() else {
            return SyncVerdict::Rejected;
        };
        let outcome = match mode {
            SyncMode::Hooking => {
                sync.initialize(timestamp);
                debug!("hooked at hop {} (rssi {} dBm)", new_hop, rx.rssi);
                FloodOutcome::Hooked { hop: new_hop }
            }
            SyncMode::Steady => {
                let sample = sync.received(timestamp);
                trace!(
                    "sync e={} ns u={} ns w={} us",
                    sample.error_ns,
                    sample.correction_ns,
                    sample.window.as_micros()
                );
                emit_debug!(
                    ctx,
                    crate::debug::DebugEvent::SyncReceived {
                        timestamp,
                        error_ns: sample.error_ns,
                        correction_ns: sample.correction_ns,
                        window: sample.window,
                    }
                );
                FloodOutcome::Synchronized { hop: new_hop }
            }
        };
        if matches!(outcome, FloodOutcome::Hooked { .. }) {
            emit_debug!(
                ctx,
                crate::debug::DebugEvent::Hooked {
                    timestamp,
                    hop: new_hop,
                    rssi: rx.rssi,
                }
            );
        }
        ctx.set_hop(new_hop);
        self.accepted = Some(outcome);

        if new_hop >= max_hops {
            return SyncVerdict::Accepted(None);
        }
        let mut packet = [0u8; SYNC_PACKET_SIZE];
        packet.copy_from_slice(bytes);
        packet[SYNC_HOP_OFFSET] = new_hop;
        let at = timestamp + relay_delay;
        emit_debug!(ctx, crate::debug::DebugEvent::Relayed { hop: new_hop, at });
        SyncVerdict::Accepted(Some(Relay { packet, at }))
    }

    /// Close the phase and update miss accounting.
    pub fn finish(&mut self, ctx: &mut MacContext) -> FloodOutcome {
        if self.sent {
            return FloodOutcome::Sent;
        }
        if let Some(outcome) = self.accepted.take() {
            return outcome;
        }
        let max_missed = ctx.config().max_missed_syncs;
        let Some(sync) = ctx.sync_mut().as_follower_mut() else {
            return FloodOutcome::NotHooked;
        };
        if sync.mode() == SyncMode::Hooking {
            return FloodOutcome::NotHooked;
        }
        match sync.missed(max_missed) {
            MissOutcome::Missed { missed, window } => {
                debug!("sync missed ({missed}), window {} us", window.as_micros());
                emit_debug!(ctx, crate::debug::DebugEvent::SyncMissed { missed, window });
                FloodOutcome::Missed { missed }
            }
            MissOutcome::Desynchronized => {
                warn!("lost synchronization after {} missed sync packets", max_missed);
                ctx.set_hop(0);
                emit_debug!(ctx, crate::debug::DebugEvent::Desynchronized);
                FloodOutcome::Desynchronized
            }
        }
    }

    /// Run the phase on real hardware.
    pub async fn execute<R: Radio, C: Clock>(
        &mut self,
        ctx: &mut MacContext,
        radio: &mut R,
        clock: &C,
    ) -> FloodOutcome {
        match self.plan(ctx, clock.now()) {
            FloodPlan::Transmit { packet, at } => {
                let wake = at.saturating_sub_duration(ctx.config().wakeup_advance);
                clock.sleep_until(wake).await;
                radio.turn_on();
                radio.send_at(&packet, at).await;
                radio.turn_off();
            }
            FloodPlan::Listen { wake, deadline } => {
                clock.sleep_until(wake).await;
                radio.turn_on();
                let mut buf = [0u8; MAX_PACKET_SIZE];
                loop {
                    match radio.recv(&mut buf, deadline).await {
                        Ok(rx) => match self.on_sync(ctx, &buf[..rx.size], &rx) {
                            SyncVerdict::Accepted(relay) => {
                                if let Some(relay) = relay {
                                    radio.send_at(&relay.packet, relay.at).await;
                                }
                                break;
                            }
                            SyncVerdict::Rejected => {}
                        },
                        Err(RecvError::Timeout) => break,
                        Err(err) => warn!("sync receive failed: {err}"),
                    }
                    if deadline.is_some_and(|deadline| clock.now() >= deadline) {
                        break;
                    }
                }
                radio.turn_off();
            }
        }
        self.finish(ctx)
    }
}

#[cfg(test)]
mod tests {
    use embassy_futures::block_on;

    use super::*;
    use crate::config::NetworkConfig;
    use crate::time::Duration;
    use crate::traits::test_impls::{MockClock, MockRadio};

    const PAN: u16 = 0xBABE;

    fn follower(config: NetworkConfig) -> MacContext {
        MacContext::new(4, config).unwrap()
    }

    fn rx(at: Timestamp, rssi: i16) -> Received {
        Received {
            size: SYNC_PACKET_SIZE,
            timestamp: Some(at),
            rssi,
        }
    }

    fn frame_start(ctx: &MacContext) -> (Timestamp, Timestamp) {
        let sync = ctx.sync().as_follower().unwrap();
        (sync.computed_frame_start(), sync.measured_frame_start())
    }

    #[test]
    fn test_master_sends_hop_zero() {
        let mut ctx = MacContext::new(0, NetworkConfig::default()).unwrap();
        let mut phase = FloodingPhase::new();
        let now = Timestamp::from_millis(10);
        match phase.plan(&mut ctx, now) {
            FloodPlan::Transmit { packet, at } => {
                assert_eq!(packet, sync_packet(0, PAN));
                assert_eq!(at, now + ctx.config().wakeup_advance);
            }
            other => panic!("expected transmit, got {other:?}"),
        }
        assert_eq!(phase.finish(&mut ctx), FloodOutcome::Sent);
        assert_eq!(ctx.round_start(), now + ctx.config().wakeup_advance);
    }

    #[test]
    fn test_master_keeps_period_once_started() {
        let mut ctx = MacContext::new(0, NetworkConfig::default()).unwrap();
        let mut phase = FloodingPhase::new();
        let first = match phase.plan(&mut ctx, Timestamp::from_millis(10)) {
            FloodPlan::Transmit { at, .. } => at,
            other => panic!("expected transmit, got {other:?}"),
        };
        let period = ctx.config().round_period;
        ctx.sync_mut().next(period);
        match phase.plan(&mut ctx, Timestamp::from_millis(600)) {
            FloodPlan::Transmit { at, .. } => assert_eq!(at, first + Duration::from_secs(1)),
            other => panic!("expected transmit, got {other:?}"),
        }
    }

    #[test]
    fn test_hooking_on_relayed_packet() {
        let mut ctx = follower(NetworkConfig::default());
        let mut phase = FloodingPhase::new();
        let now = Timestamp::from_millis(3);
        assert_eq!(
            phase.plan(&mut ctx, now),
            FloodPlan::Listen {
                wake: now,
                deadline: Some(now + Duration::from_secs(2))
            }
        );

        let arrival = Timestamp::from_millis(250);
        let verdict = phase.on_sync(&mut ctx, &sync_packet(1, PAN), &rx(arrival, -70));
        let expected_relay = Relay {
            packet: sync_packet(2, PAN),
            at: arrival + ctx.config().rebroadcast_interval,
        };
        assert_eq!(verdict, SyncVerdict::Accepted(Some(expected_relay)));
        assert_eq!(ctx.hop(), 2);
        assert_eq!(frame_start(&ctx), (arrival, arrival));
        assert_eq!(phase.finish(&mut ctx), FloodOutcome::Hooked { hop: 2 });
        assert!(ctx.is_synchronized());
    }

    #[test]
    fn test_hooking_rejects_weak_signal() {
        let mut ctx = follower(NetworkConfig::default().with_min_hooking_rssi(-80));
        let mut phase = FloodingPhase::new();
        phase.plan(&mut ctx, Timestamp::ZERO);
        let verdict = phase.on_sync(
            &mut ctx,
            &sync_packet(0, PAN),
            &rx(Timestamp::from_millis(1), -85),
        );
        assert_eq!(verdict, SyncVerdict::Rejected);
        assert_eq!(phase.finish(&mut ctx), FloodOutcome::NotHooked);
        assert!(!ctx.is_synchronized());
    }

    #[test]
    fn test_static_hop_filters_depth() {
        let mut ctx = follower(NetworkConfig::default().with_static_hop(Some(2)));
        let mut phase = FloodingPhase::new();
        phase.plan(&mut ctx, Timestamp::ZERO);
        let t = Timestamp::from_millis(1);
        assert_eq!(
            phase.on_sync(&mut ctx, &sync_packet(0, PAN), &rx(t, -60)),
            SyncVerdict::Rejected
        );
        assert!(matches!(
            phase.on_sync(&mut ctx, &sync_packet(1, PAN), &rx(t, -60)),
            SyncVerdict::Accepted(_)
        ));
        assert_eq!(ctx.hop(), 2);
    }

    #[test]
    fn test_missing_timestamp_rejected() {
        let mut ctx = follower(NetworkConfig::default());
        let mut phase = FloodingPhase::new();
        phase.plan(&mut ctx, Timestamp::ZERO);
        let no_ts = Received {
            size: SYNC_PACKET_SIZE,
            timestamp: None,
            rssi: -50,
        };
        assert_eq!(
            phase.on_sync(&mut ctx, &sync_packet(0, PAN), &no_ts),
            SyncVerdict::Rejected
        );
    }

    #[test]
    fn test_no_relay_at_max_hops() {
        let mut ctx = follower(NetworkConfig::default().with_max_hops(2));
        let mut phase = FloodingPhase::new();
        phase.plan(&mut ctx, Timestamp::ZERO);
        let verdict = phase.on_sync(
            &mut ctx,
            &sync_packet(1, PAN),
            &rx(Timestamp::from_millis(1), -60),
        );
        assert_eq!(verdict, SyncVerdict::Accepted(None));
        assert_eq!(ctx.hop(), 2);
    }

    #[test]
    fn test_steady_state_window_and_hop_check() {
        let config = NetworkConfig::default();
        let mut ctx = follower(config.clone());
        let mut phase = FloodingPhase::new();
        phase.plan(&mut ctx, Timestamp::ZERO);
        let first = Timestamp::from_millis(100);
        phase.on_sync(&mut ctx, &sync_packet(0, PAN), &rx(first, -60));
        phase.finish(&mut ctx);
        ctx.sync_mut().next(config.round_period);

        let expected = first + config.round_period;
        match phase.plan(&mut ctx, first + Duration::from_millis(500)) {
            FloodPlan::Listen { wake, deadline } => {
                assert_eq!(
                    wake,
                    expected - config.wakeup_advance - config.max_receiver_window
                );
                assert_eq!(
                    deadline,
                    Some(expected + config.max_receiver_window + config.sync_packet_time)
                );
            }
            other => panic!("expected listen, got {other:?}"),
        }

        // Steady state expects hop byte 0 at hop 1.
        let arrival = expected + Duration::from_micros(20);
        assert_eq!(
            phase.on_sync(&mut ctx, &sync_packet(1, PAN), &rx(arrival, -60)),
            SyncVerdict::Rejected
        );
        assert!(matches!(
            phase.on_sync(&mut ctx, &sync_packet(0, PAN), &rx(arrival, -99)),
            SyncVerdict::Accepted(Some(_))
        ));
        assert_eq!(phase.finish(&mut ctx), FloodOutcome::Synchronized { hop: 1 });
        let sync = ctx.sync().as_follower().unwrap();
        assert_eq!(sync.measured_frame_start(), arrival);
        assert_eq!(sync.clock_correction(), 40_000);
    }

    #[test]
    fn test_misses_lead_to_desync() {
        let config = NetworkConfig::default().with_max_missed_syncs(1);
        let mut ctx = follower(config.clone());
        let mut phase = FloodingPhase::new();
        phase.plan(&mut ctx, Timestamp::ZERO);
        phase.on_sync(
            &mut ctx,
            &sync_packet(0, PAN),
            &rx(Timestamp::from_millis(5), -60),
        );
        phase.finish(&mut ctx);

        ctx.sync_mut().next(config.round_period);
        phase.plan(&mut ctx, Timestamp::from_millis(500));
        assert_eq!(phase.finish(&mut ctx), FloodOutcome::Missed { missed: 1 });
        assert!(ctx.is_synchronized());

        ctx.sync_mut().next(config.round_period);
        phase.plan(&mut ctx, Timestamp::from_millis(1500));
        assert_eq!(phase.finish(&mut ctx), FloodOutcome::Desynchronized);
        assert!(!ctx.is_synchronized());
        assert_eq!(ctx.hop(), 0);
    }

    #[test]
    fn test_execute_relays_and_skips_garbage() {
        let mut ctx = follower(NetworkConfig::default());
        let mut radio = MockRadio::new();
        let clock = MockClock::at(Timestamp::from_millis(1));
        let arrival = Timestamp::from_millis(40);
        radio.push_error(RecvError::Other);
        radio.push_rx(&[1, 2, 3], Some(arrival), -40);
        radio.push_rx(&sync_packet(0, PAN), Some(arrival), -40);

        let mut phase = FloodingPhase::new();
        let outcome = block_on(phase.execute(&mut ctx, &mut radio, &clock));
        assert_eq!(outcome, FloodOutcome::Hooked { hop: 1 });

        let sent = radio.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, sync_packet(1, PAN).to_vec());
        assert_eq!(sent[0].1, arrival + ctx.config().rebroadcast_interval);
        assert!(!radio.is_on());
    }

    #[test]
    fn test_execute_master_transmits() {
        let mut ctx = MacContext::new(0, NetworkConfig::default()).unwrap();
        let mut radio = MockRadio::new();
        let clock = MockClock::at(Timestamp::from_millis(1));
        let mut phase = FloodingPhase::new();
        assert_eq!(
            block_on(phase.execute(&mut ctx, &mut radio, &clock)),
            FloodOutcome::Sent
        );
        let sent = radio.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, sync_packet(0, PAN).to_vec());
    }
}
