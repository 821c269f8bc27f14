#![forbid(unsafe_code)]
//! tdmesh - TDMA mesh MAC coordination for low-power radio networks
//!
//! A master node defines network time and floods it hop by hop; every other
//! node follows with a FLOPSYNC-2 clock controller, reports its position in
//! the network during its uplink slot, and replays its part of the data
//! schedule. The master collects the topology and runs admission control for
//! data streams.
//!
//! This crate is `no_std` but **requires the `alloc` crate**. Bounded queues
//! and tables are heap-allocated with capacities fixed at construction, see
//! [`MacConfig`].
//!
//! # Round structure
//!
//! ```text
//! | flooding: max_hops x rebroadcast_interval | uplink: one slot per follower | data slots |
//! ```
//!
//! - The master sends a sync packet with hop 0; relays increment the hop.
//! - Uplink slots are owned in descending node-id order, one per follower.
//! - Data slots follow a schedule computed outside this crate.
//!
//! # Example
//!
//! ```
//! use embassy_futures::block_on;
//! use tdmesh::traits::test_impls::{MockBuffers, MockClock, MockRadio};
//! use tdmesh::{
//!     DefaultConfig, FloodOutcome, MacController, MacSignals, MasterTopology, NetworkConfig,
//!     StreamCollection,
//! };
//!
//! let config = NetworkConfig::default().with_max_nodes(8);
//! let signals = MacSignals::new();
//! let streams = StreamCollection::new::<DefaultConfig>();
//! let topology = MasterTopology::new(&config);
//!
//! let mut master = MacController::master(
//!     config,
//!     MockRadio::new(),
//!     MockClock::new(),
//!     MockBuffers::new(),
//!     &streams,
//!     &topology,
//!     &signals,
//! )
//! .unwrap();
//!
//! assert_eq!(block_on(master.run_round()), FloodOutcome::Sent);
//! assert!(master.context().is_synchronized());
//! ```
//!
//! # Module Structure
//!
//! - [`types`] - Node ids, stream ids, stream parameters, constants
//! - [`packet`] - Bounded packet buffer with read/write cursors
//! - [`wire`] - Sync packet, stream management element and uplink formats
//! - [`traits`] - Radio, Clock and StreamBuffers traits
//! - [`sync`] - FLOPSYNC-2 controller and follower synchronizer
//! - [`flooding`] - Sync flood and relay
//! - [`topology`] - Predecessor, neighbor and master-side topology tracking
//! - [`uplink`] - Uplink slot ownership and forwarding
//! - [`stream`] - Master stream admission control
//! - [`schedule`] - Schedule elements and the schedule driver
//! - [`data_phase`] - Schedule replay
//! - [`controller`] - Round loop
//! - [`time`] - Timestamp and Duration types
//! - [`config`] - Runtime and compile-time configuration

#![no_std]

// Prevent test/debug features from being used in release builds.
#[cfg(all(feature = "test-support", not(test), not(debug_assertions)))]
compile_error!(
    "The `test-support` feature must not be enabled in release builds. \
     It exposes scripted radio and clock mocks that never touch hardware."
);

#[cfg(all(feature = "debug", not(test), not(debug_assertions)))]
compile_error!(
    "The `debug` feature must not be enabled in release builds. \
     It adds protocol tracing overhead intended only for development and simulation."
);

extern crate alloc;

#[macro_use]
pub mod debug;

pub mod collections;
pub mod config;
pub mod context;
pub mod controller;
pub mod data_phase;
pub mod flooding;
pub mod packet;
pub mod schedule;
pub mod stream;
pub mod sync;
pub mod time;
pub mod topology;
pub mod traits;
pub mod types;
pub mod uplink;
pub mod wire;

// Re-export main types at crate root
pub use config::{ConfigError, DefaultConfig, MacConfig, NetworkConfig, RadioConfig, SmallConfig};
pub use context::MacContext;
pub use controller::{MacController, MacSignals};
pub use flooding::{FloodOutcome, FloodingPhase};
pub use packet::{Packet, PacketError};
pub use schedule::{Action, Schedule, ScheduleComputation, ScheduleDriver, ScheduleElement, ScheduleUpdate};
pub use stream::{MasterStreamInfo, MasterStreamStatus, StreamAdmitter, StreamCollection};
pub use sync::{Flopsync2, FollowerSync, Synchronizable, Synchronizer};
pub use time::{Duration, Timestamp};
pub use topology::{MasterTopology, Topology, TopologyMap, TopologyTracker};
pub use traits::{Clock, Radio, Received, RecvError, StreamBuffers};
pub use types::{
    Direction, Error, Hop, NodeId, Period, Redundancy, Rssi, StreamId, StreamParameters,
    TopologyMode,
};
pub use uplink::UplinkPhase;
pub use wire::{
    Decode, DecodeError, Encode, SmeType, StreamManagementElement, TopologyReport, UplinkMessage,
};

// Re-export constants
pub use types::{MASTER_ID, MAX_PACKET_SIZE, SYNC_PACKET_SIZE};
