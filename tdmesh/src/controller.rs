//! Round controller.
//!
//! [`MacController`] owns one node's context, radio, clock and phases and
//! runs rounds back to back: the sync flood, then every uplink slot, then
//! the data slots. A follower that has not hooked yet only listens, one
//! bounded window per round, so a shutdown request is always noticed within
//! `hook_listen_window`.
//!
//! Applications talk to a running controller through [`MacSignals`]:
//! stream management elements go in through a channel, new schedules and
//! the shutdown request through signals.

use embassy_futures::select::{select, Either};
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use log::{debug, info};

use crate::collections::SharedMutex;
use crate::config::{ConfigError, MacConfig, NetworkConfig};
use crate::context::MacContext;
use crate::data_phase::DataPhase;
use crate::flooding::{FloodOutcome, FloodingPhase};
use crate::schedule::Schedule;
use crate::stream::StreamAdmitter;
use crate::sync::Synchronizable;
use crate::topology::MasterTopology;
use crate::traits::{Clock, Radio, StreamBuffers};
use crate::types::{NodeId, MASTER_ID};
use crate::uplink::UplinkPhase;
use crate::wire::StreamManagementElement;

/// Depth of the application SME channel.
pub const SME_REQUEST_DEPTH: usize = 16;

/// Cross-task handles of a running controller.
pub struct MacSignals {
    /// Stops [`MacController::run`] at the next await point.
    pub shutdown: Signal<SharedMutex, ()>,
    /// Schedule to install before the next round's data phase.
    pub schedules: Signal<SharedMutex, Schedule>,
    /// Locally generated stream management elements.
    pub sme_requests: Channel<SharedMutex, StreamManagementElement, SME_REQUEST_DEPTH>,
}

impl MacSignals {
    pub const fn new() -> Self {
        Self {
            shutdown: Signal::new(),
            schedules: Signal::new(),
            sme_requests: Channel::new(),
        }
    }
}

impl Default for MacSignals {
    fn default() -> Self {
        Self::new()
    }
}

pub struct MacController<'a, R, C, B> {
    ctx: MacContext,
    radio: R,
    clock: C,
    buffers: B,
    flooding: FloodingPhase,
    uplink: UplinkPhase<'a>,
    data: DataPhase,
    signals: &'a MacSignals,
    rounds: u64,
}

impl<'a, R, C, B> MacController<'a, R, C, B>
where
    R: Radio,
    C: Clock,
    B: StreamBuffers,
{
    /// Controller for follower `node_id`.
    pub fn follower<M: MacConfig>(
        node_id: NodeId,
        config: NetworkConfig,
        radio: R,
        clock: C,
        buffers: B,
        signals: &'a MacSignals,
    ) -> Result<Self, ConfigError> {
        let uplink = UplinkPhase::follower::<M>(node_id, &config);
        let ctx = MacContext::new(node_id, config)?;
        Ok(Self::with_phases(ctx, radio, clock, buffers, uplink, signals))
    }

    /// Controller for the master. Admission control and the topology graph
    /// are shared with the task running the schedule computation.
    pub fn master(
        config: NetworkConfig,
        radio: R,
        clock: C,
        buffers: B,
        streams: &'a dyn StreamAdmitter,
        topology: &'a MasterTopology,
        signals: &'a MacSignals,
    ) -> Result<Self, ConfigError> {
        let ctx = MacContext::new(MASTER_ID, config)?;
        let uplink = UplinkPhase::master(streams, topology);
        Ok(Self::with_phases(ctx, radio, clock, buffers, uplink, signals))
    }

    fn with_phases(
        ctx: MacContext,
        mut radio: R,
        clock: C,
        buffers: B,
        uplink: UplinkPhase<'a>,
        signals: &'a MacSignals,
    ) -> Self {
        radio.configure(&ctx.config().radio);
        Self {
            ctx,
            radio,
            clock,
            buffers,
            flooding: FloodingPhase::new(),
            uplink,
            data: DataPhase::new(),
            signals,
            rounds: 0,
        }
    }

    pub fn context(&self) -> &MacContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut MacContext {
        &mut self.ctx
    }

    pub fn uplink(&self) -> &UplinkPhase<'a> {
        &self.uplink
    }

    pub fn data(&self) -> &DataPhase {
        &self.data
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn buffers_mut(&mut self) -> &mut B {
        &mut self.buffers
    }

    /// Rounds run so far.
    pub fn rounds(&self) -> u64 {
        self.rounds
    }

    /// Apply pending requests from the application.
    fn drain_requests(&mut self) {
        while let Ok(sme) = self.signals.sme_requests.try_receive() {
            debug!("node {}: local sme for {:?}", self.ctx.node_id(), sme.id);
            self.uplink.enqueue_sme(sme);
        }
        if let Some(schedule) = self.signals.schedules.try_take() {
            debug!(
                "node {}: installing schedule {}",
                self.ctx.node_id(),
                schedule.id
            );
            self.data.set_schedule(self.ctx.node_id(), schedule);
        }
    }

    /// Run one round.
    pub async fn run_round(&mut self) -> FloodOutcome {
        self.drain_requests();
        let outcome = self
            .flooding
            .execute(&mut self.ctx, &mut self.radio, &self.clock)
            .await;
        self.uplink.set_hop(self.ctx.hop());

        if outcome.is_synchronized() {
            self.uplink
                .execute(&mut self.ctx, &mut self.radio, &self.clock)
                .await;
            self.data
                .execute(&self.ctx, &mut self.radio, &self.clock, &mut self.buffers)
                .await;
        }

        let period = self.ctx.config().round_period;
        self.ctx.sync_mut().next(period);
        self.rounds += 1;
        outcome
    }

    /// Run rounds until [`MacSignals::shutdown`] fires.
    pub async fn run(&mut self) {
        let signals = self.signals;
        info!("node {} starting", self.ctx.node_id());
        loop {
            match select(signals.shutdown.wait(), self.run_round()).await {
                Either::First(()) => break,
                Either::Second(_) => {}
            }
        }
        self.radio.turn_off();
        info!(
            "node {} stopped after {} rounds",
            self.ctx.node_id(),
            self.rounds
        );
    }
}
