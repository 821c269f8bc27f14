//! Configuration.
//!
//! Two layers, mirroring how a deployment is tuned:
//!
//! - [`MacConfig`] fixes memory bounds at compile time. Use `DefaultConfig`
//!   for 256KB+ RAM, `SmallConfig` for 64KB parts.
//! - [`NetworkConfig`] holds the runtime protocol parameters every node of a
//!   network must agree on (PAN id, timing, thresholds). It is validated once
//!   when the [`MacContext`](crate::context::MacContext) is built.
//!
//! # Example
//!
//! ```
//! use tdmesh::config::NetworkConfig;
//! use tdmesh::types::TopologyMode;
//! use tdmesh::Duration;
//!
//! let config = NetworkConfig::default()
//!     .with_pan_id(0x1234)
//!     .with_max_nodes(16)
//!     .with_topology_mode(TopologyMode::Mesh)
//!     .with_round_period(Duration::from_millis(500));
//! assert!(config.validate().is_ok());
//! ```

use crate::time::Duration;
use crate::types::{Hop, Rssi, TopologyMode};

/// Compile-time memory bounds.
///
/// All bounds must be non-zero.
pub trait MacConfig {
    /// Stream management elements waiting for an uplink slot.
    const MAX_QUEUED_SMES: usize;

    /// Topology reports waiting to be forwarded.
    const MAX_FORWARDED_REPORTS: usize;

    /// Pending master notifications (server opened/closed, stream rejected).
    const MAX_INFO_ELEMENTS: usize;

    /// Entries in the master's stream collection.
    const MAX_STREAMS: usize;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConfig;

impl MacConfig for DefaultConfig {
    const MAX_QUEUED_SMES: usize = 64;
    const MAX_FORWARDED_REPORTS: usize = 64;
    const MAX_INFO_ELEMENTS: usize = 64;
    const MAX_STREAMS: usize = 256;
}

/// Bounds for constrained parts.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmallConfig;

impl MacConfig for SmallConfig {
    const MAX_QUEUED_SMES: usize = 8;
    const MAX_FORWARDED_REPORTS: usize = 16;
    const MAX_INFO_ELEMENTS: usize = 8;
    const MAX_STREAMS: usize = 32;
}

/// Transceiver parameters handed to [`Radio::configure`](crate::traits::Radio::configure).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RadioConfig {
    pub frequency_mhz: u16,
    pub tx_power_dbm: i8,
    pub crc: bool,
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            frequency_mhz: 2450,
            tx_power_dbm: 5,
            crc: true,
        }
    }
}

/// Reason a [`NetworkConfig`] was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("max_nodes must be between 2 and 256, got {0}")]
    MaxNodes(u16),
    #[error("node id {node} outside 0..{max_nodes}")]
    NodeId { node: u8, max_nodes: u16 },
    #[error("max_hops must be at least 1")]
    MaxHops,
    #[error("static hop {static_hop} outside 1..={max_hops}")]
    StaticHop { static_hop: Hop, max_hops: Hop },
    #[error("receiver window bounds are empty or inverted")]
    ReceiverWindow,
    #[error("rebroadcast interval must exceed the sync packet airtime")]
    RebroadcastInterval,
    #[error("uplink slot must exceed the packet airtime")]
    UplinkSlot,
    #[error("round of {needed_ns} ns does not fit in the {period_ns} ns round period")]
    RoundOverrun { needed_ns: u64, period_ns: u64 },
}

/// Runtime protocol parameters shared by every node of a network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Network identifier carried by every sync packet.
    pub pan_id: u16,
    /// Node ids run from 0 (master) to `max_nodes - 1`.
    pub max_nodes: u16,
    pub max_hops: Hop,
    /// Pin this node to a hop; hooking then ignores packets from other depths.
    pub static_hop: Option<Hop>,
    /// Weakest uplink sighting that creates a predecessor or neighbor.
    pub min_neighbor_rssi: Rssi,
    /// Weakest sync packet accepted while hooking.
    pub min_hooking_rssi: Rssi,
    /// Consecutive missed uplinks after which a peer is dropped.
    pub max_rounds_unavailable: u8,
    /// Consecutive missed sync packets after which a follower re-hooks.
    pub max_missed_syncs: u8,
    pub topology_mode: TopologyMode,
    /// Time between consecutive sync packets from the master.
    pub round_period: Duration,
    /// Delay between receiving a sync packet and relaying it.
    pub rebroadcast_interval: Duration,
    /// How early the radio is woken before a scheduled transmission or reception.
    pub wakeup_advance: Duration,
    /// Airtime of a full-size packet.
    pub packet_time: Duration,
    /// Airtime of a sync packet.
    pub sync_packet_time: Duration,
    pub uplink_slot: Duration,
    pub data_slot: Duration,
    pub data_slots_per_round: u16,
    pub min_receiver_window: Duration,
    pub max_receiver_window: Duration,
    /// Length of one unsynchronized listen before control returns to the round loop.
    pub hook_listen_window: Duration,
    pub radio: RadioConfig,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            pan_id: 0xBABE,
            max_nodes: 32,
            max_hops: 6,
            static_hop: None,
            min_neighbor_rssi: -90,
            min_hooking_rssi: -95,
            max_rounds_unavailable: 3,
            max_missed_syncs: 3,
            topology_mode: TopologyMode::Tree,
            round_period: Duration::from_secs(1),
            rebroadcast_interval: Duration::from_millis(1),
            wakeup_advance: Duration::from_micros(500),
            packet_time: Duration::from_micros(4256),
            sync_packet_time: Duration::from_micros(416),
            uplink_slot: Duration::from_millis(10),
            data_slot: Duration::from_millis(5),
            data_slots_per_round: 64,
            min_receiver_window: Duration::from_micros(100),
            max_receiver_window: Duration::from_millis(1),
            hook_listen_window: Duration::from_secs(2),
            radio: RadioConfig::default(),
        }
    }
}

impl NetworkConfig {
    pub fn with_pan_id(mut self, pan_id: u16) -> Self {
        self.pan_id = pan_id;
        self
    }

    pub fn with_max_nodes(mut self, max_nodes: u16) -> Self {
        self.max_nodes = max_nodes;
        self
    }

    pub fn with_max_hops(mut self, max_hops: Hop) -> Self {
        self.max_hops = max_hops;
        self
    }

    pub fn with_static_hop(mut self, hop: Option<Hop>) -> Self {
        self.static_hop = hop;
        self
    }

    pub fn with_min_neighbor_rssi(mut self, rssi: Rssi) -> Self {
        self.min_neighbor_rssi = rssi;
        self
    }

    pub fn with_min_hooking_rssi(mut self, rssi: Rssi) -> Self {
        self.min_hooking_rssi = rssi;
        self
    }

    pub fn with_max_rounds_unavailable(mut self, rounds: u8) -> Self {
        self.max_rounds_unavailable = rounds;
        self
    }

    pub fn with_max_missed_syncs(mut self, missed: u8) -> Self {
        self.max_missed_syncs = missed;
        self
    }

    pub fn with_topology_mode(mut self, mode: TopologyMode) -> Self {
        self.topology_mode = mode;
        self
    }

    pub fn with_round_period(mut self, period: Duration) -> Self {
        self.round_period = period;
        self
    }

    pub fn with_rebroadcast_interval(mut self, interval: Duration) -> Self {
        self.rebroadcast_interval = interval;
        self
    }

    pub fn with_uplink_slot(mut self, slot: Duration) -> Self {
        self.uplink_slot = slot;
        self
    }

    pub fn with_data_slots(mut self, slot: Duration, per_round: u16) -> Self {
        self.data_slot = slot;
        self.data_slots_per_round = per_round;
        self
    }

    pub fn with_receiver_window(mut self, min: Duration, max: Duration) -> Self {
        self.min_receiver_window = min;
        self.max_receiver_window = max;
        self
    }

    pub fn with_hook_listen_window(mut self, window: Duration) -> Self {
        self.hook_listen_window = window;
        self
    }

    pub fn with_radio(mut self, radio: RadioConfig) -> Self {
        self.radio = radio;
        self
    }

    /// Uplink slots in each round: one per non-master node.
    pub fn uplink_slots(&self) -> u16 {
        self.max_nodes.saturating_sub(1)
    }

    /// Time reserved for the sync flood to reach `max_hops`.
    pub fn flooding_duration(&self) -> Duration {
        self.rebroadcast_interval * self.max_hops as u64
    }

    pub fn uplink_duration(&self) -> Duration {
        self.uplink_slot * self.uplink_slots() as u64
    }

    pub fn data_duration(&self) -> Duration {
        self.data_slot * self.data_slots_per_round as u64
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(2..=256).contains(&self.max_nodes) {
            return Err(ConfigError::MaxNodes(self.max_nodes));
        }
        if self.max_hops == 0 {
            return Err(ConfigError::MaxHops);
        }
        if let Some(static_hop) = self.static_hop {
            if static_hop == 0 || static_hop > self.max_hops {
                return Err(ConfigError::StaticHop {
                    static_hop,
                    max_hops: self.max_hops,
                });
            }
        }
        if self.min_receiver_window == Duration::ZERO
            || self.min_receiver_window > self.max_receiver_window
        {
            return Err(ConfigError::ReceiverWindow);
        }
        if self.rebroadcast_interval <= self.sync_packet_time {
            return Err(ConfigError::RebroadcastInterval);
        }
        if self.uplink_slot <= self.packet_time {
            return Err(ConfigError::UplinkSlot);
        }
        let needed = self.flooding_duration() + self.uplink_duration() + self.data_duration();
        if needed > self.round_period {
            return Err(ConfigError::RoundOverrun {
                needed_ns: needed.as_nanos(),
                period_ns: self.round_period.as_nanos(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_network_config_is_valid() {
        let config = NetworkConfig::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.uplink_slots(), 31);
        assert_eq!(config.flooding_duration(), Duration::from_millis(6));
    }

    #[test]
    fn test_small_config_smaller_than_default() {
        assert!(SmallConfig::MAX_QUEUED_SMES < DefaultConfig::MAX_QUEUED_SMES);
        assert!(SmallConfig::MAX_FORWARDED_REPORTS < DefaultConfig::MAX_FORWARDED_REPORTS);
        assert!(SmallConfig::MAX_INFO_ELEMENTS < DefaultConfig::MAX_INFO_ELEMENTS);
        assert!(SmallConfig::MAX_STREAMS < DefaultConfig::MAX_STREAMS);
        assert!(SmallConfig::MAX_QUEUED_SMES > 0);
    }

    #[test]
    fn test_rejects_bad_node_count() {
        assert_eq!(
            NetworkConfig::default().with_max_nodes(1).validate(),
            Err(ConfigError::MaxNodes(1))
        );
        assert_eq!(
            NetworkConfig::default().with_max_nodes(257).validate(),
            Err(ConfigError::MaxNodes(257))
        );
    }

    #[test]
    fn test_rejects_static_hop_beyond_max() {
        let config = NetworkConfig::default()
            .with_max_hops(3)
            .with_static_hop(Some(4));
        assert_eq!(
            config.validate(),
            Err(ConfigError::StaticHop {
                static_hop: 4,
                max_hops: 3
            })
        );
        assert!(config.with_static_hop(Some(3)).validate().is_ok());
    }

    #[test]
    fn test_rejects_inverted_window() {
        let config = NetworkConfig::default()
            .with_receiver_window(Duration::from_millis(2), Duration::from_millis(1));
        assert_eq!(config.validate(), Err(ConfigError::ReceiverWindow));
    }

    #[test]
    fn test_rejects_round_overrun() {
        let config = NetworkConfig::default()
            .with_max_nodes(200)
            .with_uplink_slot(Duration::from_millis(10));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RoundOverrun { .. })
        ));
    }
}
