//! Per-node state shared by every phase.
//!
//! A [`MacContext`] is built once at startup and handed to each phase by
//! mutable reference. It holds the validated configuration, the node's
//! identity and hop, and the synchronizer all slot timing derives from.

#[cfg(feature = "debug")]
use alloc::boxed::Box;

use crate::config::{ConfigError, NetworkConfig};
#[cfg(feature = "debug")]
use crate::debug::{DebugEmitter, DebugEvent};
use crate::sync::{Synchronizable, Synchronizer};
use crate::time::{Duration, Timestamp};
use crate::types::{Hop, NodeId, Role};

pub struct MacContext {
    node_id: NodeId,
    role: Role,
    config: NetworkConfig,
    hop: Hop,
    sync: Synchronizer,
    #[cfg(feature = "debug")]
    emitter: Option<Box<dyn DebugEmitter>>,
}

impl MacContext {
    /// Validate `config` and build the context for `node_id`.
    pub fn new(node_id: NodeId, config: NetworkConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        if node_id as u16 >= config.max_nodes {
            return Err(ConfigError::NodeId {
                node: node_id,
                max_nodes: config.max_nodes,
            });
        }
        let role = Role::of(node_id);
        let sync = Synchronizer::for_role(role, &config);
        Ok(Self {
            node_id,
            role,
            config,
            hop: 0,
            sync,
            #[cfg(feature = "debug")]
            emitter: None,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_master(&self) -> bool {
        self.role == Role::Master
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// 0 for the master and for followers that have not hooked yet.
    pub fn hop(&self) -> Hop {
        self.hop
    }

    pub fn set_hop(&mut self, hop: Hop) {
        self.hop = hop;
    }

    pub fn sync(&self) -> &Synchronizer {
        &self.sync
    }

    pub fn sync_mut(&mut self) -> &mut Synchronizer {
        &mut self.sync
    }

    pub fn is_synchronized(&self) -> bool {
        self.sync.is_synchronized()
    }

    /// When the master sent this round's sync packet, in local time.
    ///
    /// A follower at hop `h` heard the packet `h - 1` relay intervals after
    /// the master sent it.
    pub fn round_start(&self) -> Timestamp {
        let frame_start = self.sync.frame_start();
        if self.is_master() || self.hop <= 1 {
            return frame_start;
        }
        let relay_delay = self.config.rebroadcast_interval * (self.hop - 1) as u64;
        frame_start.saturating_sub_duration(relay_delay)
    }

    pub fn uplink_start(&self) -> Timestamp {
        self.round_start() + self.config.flooding_duration()
    }

    pub fn uplink_slot_start(&self, slot: u16) -> Timestamp {
        self.uplink_start() + self.config.uplink_slot * slot as u64
    }

    pub fn data_start(&self) -> Timestamp {
        self.uplink_start() + self.config.uplink_duration()
    }

    pub fn data_slot_start(&self, slot: u16) -> Timestamp {
        self.data_start() + self.config.data_slot * slot as u64
    }

    /// Receive deadline for a frame expected to start at `start`.
    pub fn receive_deadline(&self, start: Timestamp, airtime: Duration) -> Timestamp {
        start.saturating_add(self.sync.receiver_window() + airtime)
    }

    /// When the radio must be woken for a frame expected at `start`.
    pub fn wakeup_before(&self, start: Timestamp) -> Timestamp {
        start.saturating_sub_duration(self.config.wakeup_advance + self.sync.receiver_window())
    }

    #[cfg(feature = "debug")]
    pub fn set_debug_emitter(&mut self, emitter: Box<dyn DebugEmitter>) {
        self.emitter = Some(emitter);
    }

    #[cfg(feature = "debug")]
    pub fn emit(&mut self, event: DebugEvent) {
        if let Some(emitter) = self.emitter.as_mut() {
            emitter.emit(self.node_id, event);
        }
    }
}

impl core::fmt::Debug for MacContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("MacContext")
            .field("node_id", &self.node_id)
            .field("hop", &self.hop)
            .field("synchronized", &self.sync.is_synchronized())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_node_outside_network() {
        let config = NetworkConfig::default().with_max_nodes(8);
        assert_eq!(
            MacContext::new(8, config.clone()).err(),
            Some(ConfigError::NodeId {
                node: 8,
                max_nodes: 8
            })
        );
        assert!(MacContext::new(7, config).is_ok());
    }

    #[test]
    fn test_rejects_invalid_config() {
        let config = NetworkConfig::default().with_max_hops(0);
        assert_eq!(MacContext::new(1, config).err(), Some(ConfigError::MaxHops));
    }

    #[test]
    fn test_follower_round_start_accounts_for_relay_delay() {
        let config = NetworkConfig::default();
        let mut ctx = MacContext::new(5, config.clone()).unwrap();
        if let Some(sync) = ctx.sync_mut().as_follower_mut() {
            sync.initialize(Timestamp::from_millis(1003));
        }
        ctx.set_hop(3);
        assert_eq!(ctx.round_start(), Timestamp::from_millis(1001));
        assert_eq!(
            ctx.uplink_start(),
            Timestamp::from_millis(1001) + config.flooding_duration()
        );
        assert_eq!(
            ctx.uplink_slot_start(2) - ctx.uplink_start(),
            config.uplink_slot * 2
        );
        assert_eq!(ctx.data_start() - ctx.uplink_start(), config.uplink_duration());
    }

    #[test]
    fn test_master_round_start_is_its_transmission() {
        let mut ctx = MacContext::new(0, NetworkConfig::default()).unwrap();
        assert!(ctx.is_master());
        if let Some(base) = ctx.sync_mut().as_master_mut() {
            base.set_frame_start(Timestamp::from_secs(4));
        }
        assert_eq!(ctx.round_start(), Timestamp::from_secs(4));
        assert_eq!(
            ctx.wakeup_before(Timestamp::from_secs(5)),
            Timestamp::from_secs(5) - ctx.config().wakeup_advance
        );
    }
}
