//! tdmesh-sim - Round-stepped network simulator for tdmesh.
//!
//! Runs a whole TDMA mesh in one process without real-time delays: every
//! node gets its own MAC context on a drifting clock, sync floods are
//! propagated through an event queue in global time, and the uplink and
//! data phases are stepped slot by slot over a configurable radio topology.
//!
//! # Features
//!
//! - **Deterministic**: seeded link loss and clock drift, ordered events
//! - **Clock drift**: per-node frequency error and boot offset
//! - **Configurable topology**: fully connected, chain, star or custom links
//! - **Scenario actions**: partitions, link failures, power cycles, stream requests
//! - **Metrics**: per-round hop, sync error, predecessor and master graph snapshots
//!
//! # Example
//!
//! ```
//! use tdmesh_sim::ScenarioBuilder;
//!
//! let result = ScenarioBuilder::new(4)
//!     .chain_topology()
//!     .run_rounds(3)
//!     .unwrap();
//!
//! assert!(result.all_synchronized());
//! assert_eq!(result.final_hops()[&3], 3);
//! ```
//!
//! # Architecture
//!
//! Each round runs in order:
//! 1. Scenario actions scheduled for the round
//! 2. Flood: the master's sync packet and every relay, ordered by (time, sequence number)
//! 3. Uplink slots in ownership order, delivered over active links
//! 4. One step of the master's schedule driver
//! 5. Data slots of the installed schedule
//! 6. Snapshot of every node
//!
//! Phase handlers are called directly; nothing is awaited.

pub mod event;
pub mod metrics;
pub mod node;
pub mod scenario;
pub mod scheduler;
pub mod sim;
pub mod topology;

// Re-export main types
pub use event::{Event, ScenarioAction, ScheduledEvent};
pub use metrics::{NodeState, RoundSnapshot, SimMetrics, SimulationResult};
pub use node::{EventLog, SimClock, SimNode};
pub use scenario::{drifting_chain, simple_scenario, ScenarioBuilder};
pub use scheduler::ShortestPathScheduler;
pub use sim::{MasterState, Simulator};
pub use tdmesh::{Duration, NodeId, Timestamp};
pub use topology::{Link, Topology};
