//! Clock synchronization.
//!
//! The master's clock defines network time; it never corrects itself. A
//! follower hooks onto the first valid sync packet it hears and from then on
//! predicts each round's arrival with the FLOPSYNC-2 controller.
//!
//! Both sides sit behind [`Synchronizable`] so the other phases compute their
//! wake-up instants without caring about the node's role.

pub mod flopsync2;
pub mod follower;

pub use flopsync2::Flopsync2;
pub use follower::{FollowerSync, MissOutcome, SyncMode, SyncSample};

use crate::config::NetworkConfig;
use crate::time::{Duration, Timestamp};
use crate::types::Role;

/// What every phase needs from the synchronizer.
pub trait Synchronizable {
    /// Whether frame starts are meaningful this round.
    fn is_synchronized(&self) -> bool;

    /// Start of the current round's flood as seen at this node.
    fn frame_start(&self) -> Timestamp;

    /// Guard time around expected receptions.
    fn receiver_window(&self) -> Duration;

    /// Advance to the next round.
    fn next(&mut self, period: Duration);
}

/// Master time base: frame starts are simply when the master transmitted.
#[derive(Debug, Clone, Default)]
pub struct MasterTimebase {
    frame_start: Timestamp,
    started: bool,
}

impl MasterTimebase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the instant of this round's sync transmission.
    pub fn set_frame_start(&mut self, at: Timestamp) {
        self.frame_start = at;
        self.started = true;
    }
}

impl Synchronizable for MasterTimebase {
    fn is_synchronized(&self) -> bool {
        self.started
    }

    fn frame_start(&self) -> Timestamp {
        self.frame_start
    }

    fn receiver_window(&self) -> Duration {
        Duration::ZERO
    }

    fn next(&mut self, period: Duration) {
        if self.started {
            self.frame_start += period;
        }
    }
}

impl Synchronizable for FollowerSync {
    fn is_synchronized(&self) -> bool {
        self.mode() == SyncMode::Steady
    }

    fn frame_start(&self) -> Timestamp {
        self.measured_frame_start()
    }

    fn receiver_window(&self) -> Duration {
        FollowerSync::receiver_window(self)
    }

    fn next(&mut self, period: Duration) {
        FollowerSync::next(self, period)
    }
}

/// Role-specific synchronizer.
#[derive(Debug, Clone)]
pub enum Synchronizer {
    Master(MasterTimebase),
    Follower(FollowerSync),
}

impl Synchronizer {
    pub fn for_role(role: Role, config: &NetworkConfig) -> Self {
        match role {
            Role::Master => Synchronizer::Master(MasterTimebase::new()),
            Role::Follower => Synchronizer::Follower(FollowerSync::new(config)),
        }
    }

    pub fn as_follower(&self) -> Option<&FollowerSync> {
        match self {
            Synchronizer::Follower(sync) => Some(sync),
            Synchronizer::Master(_) => None,
        }
    }

    pub fn as_follower_mut(&mut self) -> Option<&mut FollowerSync> {
        match self {
            Synchronizer::Follower(sync) => Some(sync),
            Synchronizer::Master(_) => None,
        }
    }

    pub fn as_master_mut(&mut self) -> Option<&mut MasterTimebase> {
        match self {
            Synchronizer::Master(base) => Some(base),
            Synchronizer::Follower(_) => None,
        }
    }
}

impl Synchronizable for Synchronizer {
    fn is_synchronized(&self) -> bool {
        match self {
            Synchronizer::Master(base) => base.is_synchronized(),
            Synchronizer::Follower(sync) => sync.is_synchronized(),
        }
    }

    fn frame_start(&self) -> Timestamp {
        match self {
            Synchronizer::Master(base) => base.frame_start(),
            Synchronizer::Follower(sync) => Synchronizable::frame_start(sync),
        }
    }

    fn receiver_window(&self) -> Duration {
        match self {
            Synchronizer::Master(base) => base.receiver_window(),
            Synchronizer::Follower(sync) => Synchronizable::receiver_window(sync),
        }
    }

    fn next(&mut self, period: Duration) {
        match self {
            Synchronizer::Master(base) => base.next(period),
            Synchronizer::Follower(sync) => Synchronizable::next(sync, period),
        }
    }
}
