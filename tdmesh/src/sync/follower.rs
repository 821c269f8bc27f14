//! Follower-side synchronization state.

use crate::config::NetworkConfig;
use crate::sync::flopsync2::Flopsync2;
use crate::time::{Duration, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// Unsynchronized: listening for any plausible sync packet.
    Hooking,
    /// Synchronized: sync packets are expected inside a bounded window.
    Steady,
}

/// Result of feeding one received sync packet to the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSample {
    pub error_ns: i64,
    pub correction_ns: i64,
    pub window: Duration,
}

/// Result of a round without a sync packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissOutcome {
    /// Still synchronized; the window has been widened.
    Missed { missed: u8, window: Duration },
    /// Miss threshold exceeded; back to hooking.
    Desynchronized,
}

/// Follower clock estimate, advanced once per round.
///
/// `computed_frame_start` is the predicted arrival of the current round's
/// sync packet, `measured_frame_start` the actual one (equal to the
/// prediction when the packet was missed) and `theoretical_frame_start` the
/// uncorrected count of periods since hooking.
#[derive(Debug, Clone)]
pub struct FollowerSync {
    mode: SyncMode,
    measured_frame_start: Timestamp,
    computed_frame_start: Timestamp,
    theoretical_frame_start: Timestamp,
    clock_correction: i64,
    missed_packets: u8,
    receiver_window: Duration,
    controller: Flopsync2,
}

impl FollowerSync {
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            mode: SyncMode::Hooking,
            measured_frame_start: Timestamp::ZERO,
            computed_frame_start: Timestamp::ZERO,
            theoretical_frame_start: Timestamp::ZERO,
            clock_correction: 0,
            missed_packets: 0,
            receiver_window: config.max_receiver_window,
            controller: Flopsync2::new(config.min_receiver_window, config.max_receiver_window),
        }
    }

    pub fn mode(&self) -> SyncMode {
        self.mode
    }

    pub fn measured_frame_start(&self) -> Timestamp {
        self.measured_frame_start
    }

    pub fn computed_frame_start(&self) -> Timestamp {
        self.computed_frame_start
    }

    pub fn theoretical_frame_start(&self) -> Timestamp {
        self.theoretical_frame_start
    }

    pub fn clock_correction(&self) -> i64 {
        self.clock_correction
    }

    pub fn missed_packets(&self) -> u8 {
        self.missed_packets
    }

    pub fn receiver_window(&self) -> Duration {
        self.receiver_window
    }

    /// Drop synchronization and return to hooking.
    pub fn reset(&mut self) {
        self.mode = SyncMode::Hooking;
        self.controller.reset();
        self.clock_correction = 0;
        self.missed_packets = 0;
        self.receiver_window = self.controller.receiver_window();
    }

    /// Seed every frame start from the packet that ended hooking.
    pub fn initialize(&mut self, hook_timestamp: Timestamp) {
        self.controller.reset();
        self.mode = SyncMode::Steady;
        self.measured_frame_start = hook_timestamp;
        self.computed_frame_start = hook_timestamp;
        self.theoretical_frame_start = hook_timestamp;
        self.clock_correction = 0;
        self.missed_packets = 0;
        self.receiver_window = self.controller.receiver_window();
    }

    /// Radio wake-up instant and receive deadline for the expected sync packet.
    pub fn wakeup_and_timeout(&self, config: &NetworkConfig) -> (Timestamp, Timestamp) {
        let expected = self.computed_frame_start;
        let wake = expected.saturating_sub_duration(config.wakeup_advance + self.receiver_window);
        let timeout = expected.saturating_add(self.receiver_window + config.sync_packet_time);
        (wake, timeout)
    }

    /// A valid sync packet arrived at `timestamp`.
    pub fn received(&mut self, timestamp: Timestamp) -> SyncSample {
        self.measured_frame_start = timestamp;
        let error_ns = timestamp.signed_nanos_since(self.computed_frame_start);
        let (correction_ns, window) = self.controller.compute_correction(error_ns);
        self.clock_correction = correction_ns;
        self.receiver_window = window;
        self.missed_packets = 0;
        SyncSample {
            error_ns,
            correction_ns,
            window,
        }
    }

    /// The expected sync packet did not arrive.
    pub fn missed(&mut self, max_missed: u8) -> MissOutcome {
        self.measured_frame_start = self.computed_frame_start;
        self.missed_packets = self.missed_packets.saturating_add(1);
        if self.missed_packets > max_missed {
            self.reset();
            return MissOutcome::Desynchronized;
        }
        let (correction, window) = self.controller.lost_packet();
        self.clock_correction = correction;
        self.receiver_window = window;
        MissOutcome::Missed {
            missed: self.missed_packets,
            window,
        }
    }

    /// Move every estimate to the next round.
    pub fn next(&mut self, period: Duration) {
        if self.mode != SyncMode::Steady {
            return;
        }
        self.theoretical_frame_start += period;
        self.computed_frame_start = (self.computed_frame_start + period).offset_by(self.clock_correction);
        self.measured_frame_start = self.computed_frame_start;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> NetworkConfig {
        NetworkConfig::default().with_max_missed_syncs(2)
    }

    #[test]
    fn test_initialize_seeds_frame_starts() {
        let mut sync = FollowerSync::new(&config());
        assert_eq!(sync.mode(), SyncMode::Hooking);

        let t = Timestamp::from_millis(1234);
        sync.initialize(t);
        assert_eq!(sync.mode(), SyncMode::Steady);
        assert_eq!(sync.measured_frame_start(), t);
        assert_eq!(sync.computed_frame_start(), t);
        assert_eq!(sync.theoretical_frame_start(), t);
        assert_eq!(sync.missed_packets(), 0);
        assert_eq!(sync.receiver_window(), config().max_receiver_window);
    }

    #[test]
    fn test_wakeup_window_brackets_expected_arrival() {
        let cfg = config();
        let mut sync = FollowerSync::new(&cfg);
        sync.initialize(Timestamp::from_secs(5));
        sync.next(cfg.round_period);
        let (wake, timeout) = sync.wakeup_and_timeout(&cfg);
        let expected = Timestamp::from_secs(6);
        assert_eq!(
            expected - wake,
            cfg.wakeup_advance + cfg.max_receiver_window
        );
        assert_eq!(
            timeout - expected,
            cfg.max_receiver_window + cfg.sync_packet_time
        );
    }

    #[test]
    fn test_drift_is_tracked_across_rounds() {
        let cfg = config();
        let mut sync = FollowerSync::new(&cfg);
        let drift = Duration::from_micros(15);
        let mut arrival = Timestamp::from_secs(1);
        sync.initialize(arrival);
        for _ in 0..10 {
            sync.next(cfg.round_period);
            arrival = arrival + cfg.round_period + drift;
            sync.received(arrival);
        }
        assert_eq!(sync.clock_correction(), 15_000);
        sync.next(cfg.round_period);
        assert_eq!(
            sync.computed_frame_start(),
            arrival + cfg.round_period + drift
        );
    }

    #[test]
    fn test_desync_after_exceeding_missed_threshold() {
        let cfg = config();
        let mut sync = FollowerSync::new(&cfg);
        sync.initialize(Timestamp::from_secs(1));

        assert!(matches!(sync.missed(2), MissOutcome::Missed { missed: 1, .. }));
        assert!(matches!(sync.missed(2), MissOutcome::Missed { missed: 2, .. }));
        assert_eq!(sync.mode(), SyncMode::Steady);
        assert_eq!(sync.missed(2), MissOutcome::Desynchronized);
        assert_eq!(sync.mode(), SyncMode::Hooking);
        assert_eq!(sync.missed_packets(), 0);
    }

    #[test]
    fn test_reception_resets_miss_counter() {
        let cfg = config();
        let mut sync = FollowerSync::new(&cfg);
        sync.initialize(Timestamp::from_secs(1));
        sync.missed(2);
        sync.next(cfg.round_period);
        sync.received(sync.computed_frame_start());
        assert_eq!(sync.missed_packets(), 0);
    }

    #[test]
    fn test_next_is_noop_while_hooking() {
        let cfg = config();
        let mut sync = FollowerSync::new(&cfg);
        sync.next(cfg.round_period);
        assert_eq!(sync.computed_frame_start(), Timestamp::ZERO);
    }
}
