//! Debug events for protocol tracing.
//!
//! With the `debug` feature, phases report structured events to the
//! [`DebugEmitter`] installed in the [`MacContext`](crate::context::MacContext).
//! The simulator uses them to follow sync and topology convergence. Without
//! the feature the [`emit_debug!`] calls compile to nothing.

use crate::time::{Duration, Timestamp};
use crate::types::{Hop, NodeId, Rssi};

/// Receives debug events from a node.
/// Implemented by test harnesses to collect/print events.
pub trait DebugEmitter: Send {
    fn emit(&mut self, node: NodeId, event: DebugEvent);
}

/// Debug events emitted by the MAC phases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugEvent {
    /// Master sent the round's sync packet.
    SyncSent { at: Timestamp },
    /// First valid sync packet while hooking.
    Hooked {
        timestamp: Timestamp,
        hop: Hop,
        rssi: Rssi,
    },
    /// Steady-state sync packet received.
    SyncReceived {
        timestamp: Timestamp,
        error_ns: i64,
        correction_ns: i64,
        window: Duration,
    },
    /// Expected sync packet did not arrive.
    SyncMissed { missed: u8, window: Duration },
    /// Too many misses; back to hooking.
    Desynchronized,
    /// Sync packet relayed with the given hop byte.
    Relayed { hop: Hop, at: Timestamp },
    /// Own uplink message sent.
    UplinkSent {
        slot: u16,
        assignee: NodeId,
        reports: usize,
        smes: usize,
    },
    /// Uplink message heard from a peer.
    UplinkReceived { from: NodeId, rssi: Rssi, forwarded: bool },
    /// Peer dropped after missing too many uplink slots.
    PeerEvicted { node: NodeId },
    /// Stream management elements handed to admission control.
    SmesAdmitted { count: usize },
}

/// Report a [`DebugEvent`] through the context's emitter.
///
/// The first argument is anything with an `emit(DebugEvent)` method, usually
/// the [`MacContext`](crate::context::MacContext).
macro_rules! emit_debug {
    ($ctx:expr, $event:expr) => {{
        #[cfg(feature = "debug")]
        {
            $ctx.emit($event);
        }
    }};
}
