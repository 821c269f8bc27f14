//! Simulated node: a MAC context and its phases on a drifting local clock.
//!
//! The simulator never awaits anything. It calls the phase handlers
//! directly (`plan`, `on_sync`, `finish`, `outgoing`, `on_message`, ...)
//! and converts between global simulation time and each node's local time.

use std::cell::{Cell, RefCell};
use std::future::{ready, Ready};
use std::sync::Arc;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::blocking_mutex::Mutex;
use tdmesh::config::DefaultConfig;
use tdmesh::data_phase::DataPhase;
use tdmesh::debug::{DebugEmitter, DebugEvent};
use tdmesh::flooding::{FloodPlan, SyncVerdict};
use tdmesh::traits::test_impls::MockBuffers;
use tdmesh::traits::{Clock, Received};
use tdmesh::{
    ConfigError, Duration, FloodOutcome, FloodingPhase, Hop, MacContext, NetworkConfig, NodeId,
    Packet, Rssi, Schedule, Synchronizable, Timestamp, UplinkPhase, MASTER_ID,
};

/// Local clock with a fixed offset and a constant frequency error.
///
/// `local = global * (1 + skew_ppm / 1e6) + offset`.
#[derive(Debug, Clone)]
pub struct SimClock {
    offset_ns: i64,
    skew_ppm: f64,
    global: Cell<Timestamp>,
}

impl SimClock {
    pub fn new(offset: Duration, skew_ppm: f64) -> Self {
        Self {
            offset_ns: offset.as_signed_nanos(),
            skew_ppm,
            global: Cell::new(Timestamp::ZERO),
        }
    }

    /// A perfect clock.
    pub fn ideal() -> Self {
        Self::new(Duration::ZERO, 0.0)
    }

    pub fn skew_ppm(&self) -> f64 {
        self.skew_ppm
    }

    pub fn offset(&self) -> Duration {
        Duration::from_nanos(self.offset_ns.max(0) as u64)
    }

    /// Move the clock to global time `time`.
    pub fn set_global(&self, time: Timestamp) {
        self.global.set(time);
    }

    pub fn to_local(&self, global: Timestamp) -> Timestamp {
        let g = global.as_nanos() as f64;
        let local = g * (1.0 + self.skew_ppm / 1e6) + self.offset_ns as f64;
        Timestamp::from_nanos(local.round().max(0.0) as u64)
    }

    pub fn to_global(&self, local: Timestamp) -> Timestamp {
        let l = local.as_nanos() as f64 - self.offset_ns as f64;
        let global = l / (1.0 + self.skew_ppm / 1e6);
        Timestamp::from_nanos(global.round().max(0.0) as u64)
    }
}

impl Default for SimClock {
    fn default() -> Self {
        Self::ideal()
    }
}

impl Clock for SimClock {
    type SleepFuture<'a> = Ready<()>;

    fn now(&self) -> Timestamp {
        self.to_local(self.global.get())
    }

    fn sleep_until(&self, _time: Timestamp) -> Self::SleepFuture<'_> {
        ready(())
    }
}

/// Debug events of every node, in emission order.
#[derive(Clone)]
pub struct EventLog {
    events: Arc<Mutex<CriticalSectionRawMutex, RefCell<Vec<(NodeId, DebugEvent)>>>>,
}

impl Default for EventLog {
    fn default() -> Self {
        Self {
            events: Arc::new(Mutex::new(RefCell::new(Vec::new()))),
        }
    }
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<(NodeId, DebugEvent)> {
        self.events
            .lock(|events| std::mem::take(&mut *events.borrow_mut()))
    }

    pub fn len(&self) -> usize {
        self.events.lock(|events| events.borrow().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl DebugEmitter for EventLog {
    fn emit(&mut self, node: NodeId, event: DebugEvent) {
        self.events
            .lock(|events| events.borrow_mut().push((node, event)));
    }
}

/// One simulated node.
pub struct SimNode {
    ctx: MacContext,
    clock: SimClock,
    flooding: FloodingPhase,
    /// `None` on the master, whose uplink handling borrows the shared master state.
    uplink: Option<UplinkPhase<'static>>,
    data: DataPhase,
    buffers: MockBuffers,
    /// Local listen window of the current flood.
    listen: Option<(Timestamp, Option<Timestamp>)>,
    last_outcome: Option<FloodOutcome>,
}

impl SimNode {
    pub fn new(
        node_id: NodeId,
        config: NetworkConfig,
        clock: SimClock,
        log: &EventLog,
    ) -> Result<Self, ConfigError> {
        let uplink =
            (node_id != MASTER_ID).then(|| UplinkPhase::follower::<DefaultConfig>(node_id, &config));
        let mut ctx = MacContext::new(node_id, config)?;
        ctx.set_debug_emitter(Box::new(log.clone()));
        Ok(Self {
            ctx,
            clock,
            flooding: FloodingPhase::new(),
            uplink,
            data: DataPhase::new(),
            buffers: MockBuffers::new(),
            listen: None,
            last_outcome: None,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.ctx.node_id()
    }

    pub fn is_master(&self) -> bool {
        self.ctx.is_master()
    }

    pub fn context(&self) -> &MacContext {
        &self.ctx
    }

    pub fn clock(&self) -> &SimClock {
        &self.clock
    }

    pub fn hop(&self) -> Hop {
        self.ctx.hop()
    }

    pub fn is_synchronized(&self) -> bool {
        self.ctx.is_synchronized()
    }

    /// How this node's last flood ended.
    pub fn last_outcome(&self) -> Option<FloodOutcome> {
        self.last_outcome
    }

    /// Follower uplink state; `None` on the master.
    pub fn uplink(&self) -> Option<&UplinkPhase<'static>> {
        self.uplink.as_ref()
    }

    pub fn data(&self) -> &DataPhase {
        &self.data
    }

    pub fn buffers_mut(&mut self) -> &mut MockBuffers {
        &mut self.buffers
    }

    pub fn set_schedule(&mut self, schedule: Schedule) {
        self.data.set_schedule(self.ctx.node_id(), schedule);
    }

    /// Run `f` on this node's uplink phase.
    ///
    /// The master has no stored phase; `master` provides the state one is built from.
    pub fn with_uplink<R>(
        &mut self,
        master: &crate::sim::MasterState,
        f: impl for<'p> FnOnce(&mut UplinkPhase<'p>, &mut MacContext) -> R,
    ) -> R {
        match &mut self.uplink {
            Some(phase) => f(phase, &mut self.ctx),
            None => {
                let mut phase = UplinkPhase::master(master.streams(), master.topology());
                f(&mut phase, &mut self.ctx)
            }
        }
    }

    /// Plan the flood at global time `now`. Returns the master's transmission in global time.
    pub fn begin_flood(&mut self, now: Timestamp) -> Option<(Vec<u8>, Timestamp)> {
        self.clock.set_global(now);
        match self.flooding.plan(&mut self.ctx, self.clock.now()) {
            FloodPlan::Transmit { packet, at } => Some((packet.to_vec(), self.clock.to_global(at))),
            FloodPlan::Listen { wake, deadline } => {
                self.listen = Some((wake, deadline));
                None
            }
        }
    }

    /// A frame reached this node at global time `at`. Returns a relay in global time.
    pub fn receive_sync(
        &mut self,
        data: &[u8],
        at: Timestamp,
        rssi: Rssi,
    ) -> Option<(Vec<u8>, Timestamp)> {
        let (wake, deadline) = self.listen?;
        let local = self.clock.to_local(at);
        if local < wake || deadline.is_some_and(|deadline| local > deadline) {
            return None;
        }
        let rx = Received {
            size: data.len(),
            timestamp: Some(local),
            rssi,
        };
        match self.flooding.on_sync(&mut self.ctx, data, &rx) {
            SyncVerdict::Rejected => None,
            SyncVerdict::Accepted(relay) => {
                self.listen = None;
                relay.map(|relay| (relay.packet.to_vec(), self.clock.to_global(relay.at)))
            }
        }
    }

    /// Close the flood and settle the node's hop.
    pub fn end_flood(&mut self) -> FloodOutcome {
        self.listen = None;
        let outcome = self.flooding.finish(&mut self.ctx);
        if let Some(uplink) = self.uplink.as_mut() {
            uplink.set_hop(self.ctx.hop());
        }
        self.last_outcome = Some(outcome);
        outcome
    }

    /// Packet this node sends in data slot `slot`, if any.
    pub fn data_transmit(&mut self, slot: u16) -> Option<Packet> {
        let element = *self.data.element_at(slot)?;
        self.data.transmission(&element, &mut self.buffers)
    }

    /// Whether this node receives in data slot `slot`.
    pub fn data_listens(&self, slot: u16) -> bool {
        self.data.element_at(slot).is_some_and(|e| {
            matches!(
                e.action,
                tdmesh::Action::RecvStream | tdmesh::Action::RecvBuffer
            )
        })
    }

    pub fn data_receive(&mut self, slot: u16, packet: Option<Packet>) {
        if let Some(element) = self.data.element_at(slot).copied() {
            self.data.on_received(&element, packet, &mut self.buffers);
        }
    }

    /// Advance the synchronizer to the next round.
    pub fn end_round(&mut self) {
        let period = self.ctx.config().round_period;
        self.ctx.sync_mut().next(period);
    }
}
