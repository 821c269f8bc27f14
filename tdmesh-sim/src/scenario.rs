//! Scenario builder for setting up and running simulations.

use tdmesh::{
    ConfigError, Duration, NetworkConfig, NodeId, Rssi, StreamManagementElement, TopologyMode,
    MASTER_ID,
};

use crate::event::ScenarioAction;
use crate::metrics::SimulationResult;
use crate::node::SimClock;
use crate::sim::Simulator;
use crate::topology::Topology;

/// Type of topology to generate.
#[derive(Debug, Clone)]
enum TopologyType {
    FullyConnected,
    /// Each node hears only the ids next to its own.
    Chain,
    /// The master is the hub.
    Star,
    Custom(Topology),
}

/// Builder for simulation scenarios.
///
/// Node ids run from 0 (the master) to `num_nodes - 1`. The master keeps an
/// ideal clock; followers draw a drift and an offset from the seed.
pub struct ScenarioBuilder {
    num_nodes: usize,
    seed: u64,
    topology_type: TopologyType,
    config: Option<NetworkConfig>,
    topology_mode: Option<TopologyMode>,
    loss_rate: f64,
    rssi: Option<Rssi>,
    delay: Duration,
    max_skew_ppm: f64,
    /// Offsets are drawn up to this bound.
    max_offset: Duration,
    actions: Vec<(u64, ScenarioAction)>,
}

impl Default for ScenarioBuilder {
    fn default() -> Self {
        Self::new(2)
    }
}

impl ScenarioBuilder {
    /// Fully connected, ideal clocks, no loss.
    pub fn new(num_nodes: usize) -> Self {
        Self {
            num_nodes,
            seed: 42,
            topology_type: TopologyType::FullyConnected,
            config: None,
            topology_mode: None,
            loss_rate: 0.0,
            rssi: None,
            delay: Duration::ZERO,
            max_skew_ppm: 0.0,
            max_offset: Duration::ZERO,
            actions: Vec::new(),
        }
    }

    /// RNG seed for clocks and link loss.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn topology(mut self, topo: Topology) -> Self {
        self.topology_type = TopologyType::Custom(topo);
        self
    }

    pub fn fully_connected(mut self) -> Self {
        self.topology_type = TopologyType::FullyConnected;
        self
    }

    pub fn chain_topology(mut self) -> Self {
        self.topology_type = TopologyType::Chain;
        self
    }

    pub fn star_topology(mut self) -> Self {
        self.topology_type = TopologyType::Star;
        self
    }

    /// Network parameters. Without one, the defaults sized to `num_nodes` are used.
    pub fn with_config(mut self, config: NetworkConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_topology_mode(mut self, mode: TopologyMode) -> Self {
        self.topology_mode = Some(mode);
        self
    }

    pub fn with_loss_rate(mut self, rate: f64) -> Self {
        self.loss_rate = rate;
        self
    }

    pub fn with_rssi(mut self, rssi: Rssi) -> Self {
        self.rssi = Some(rssi);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Followers drift by up to `ppm` in either direction.
    pub fn with_clock_skew(mut self, ppm: f64) -> Self {
        self.max_skew_ppm = ppm.abs();
        self
    }

    /// Followers boot with a local clock offset of up to `offset`.
    pub fn with_clock_offset(mut self, offset: Duration) -> Self {
        self.max_offset = offset;
        self
    }

    pub fn action_at(mut self, round: u64, action: ScenarioAction) -> Self {
        self.actions.push((round, action));
        self
    }

    pub fn partition_at(self, round: u64, groups: Vec<Vec<NodeId>>) -> Self {
        self.action_at(round, ScenarioAction::Partition { groups })
    }

    pub fn heal_at(self, round: u64) -> Self {
        self.action_at(round, ScenarioAction::HealPartition)
    }

    pub fn disable_link_at(self, round: u64, from: NodeId, to: NodeId) -> Self {
        self.action_at(round, ScenarioAction::DisableLink { from, to })
    }

    pub fn enable_link_at(self, round: u64, from: NodeId, to: NodeId) -> Self {
        self.action_at(round, ScenarioAction::EnableLink { from, to })
    }

    pub fn power_off_at(self, round: u64, node: NodeId) -> Self {
        self.action_at(round, ScenarioAction::PowerOff { node })
    }

    pub fn power_on_at(self, round: u64, node: NodeId) -> Self {
        self.action_at(round, ScenarioAction::PowerOn { node })
    }

    pub fn submit_sme_at(self, round: u64, node: NodeId, sme: StreamManagementElement) -> Self {
        self.action_at(round, ScenarioAction::SubmitSme { node, sme })
    }

    /// Build the simulator with all nodes, links and scheduled actions.
    pub fn build(self) -> Result<Simulator, ConfigError> {
        let count = self.num_nodes.clamp(1, usize::from(NodeId::MAX) + 1);
        let ids: Vec<NodeId> = (0..count).map(|i| i as NodeId).collect();

        let mut config = self
            .config
            .unwrap_or_else(|| NetworkConfig::default().with_max_nodes(count.max(2) as u16));
        if let Some(mode) = self.topology_mode {
            config = config.with_topology_mode(mode);
        }

        let mut topo = match self.topology_type {
            TopologyType::FullyConnected => Topology::fully_connected(&ids),
            TopologyType::Chain => Topology::chain(&ids),
            TopologyType::Star => Topology::star(&ids),
            TopologyType::Custom(t) => t,
        };
        if self.loss_rate > 0.0 {
            topo.set_global_loss_rate(self.loss_rate);
        }
        if let Some(rssi) = self.rssi {
            topo.set_global_rssi(rssi);
        }
        for (i, &a) in ids.iter().enumerate() {
            for &b in &ids[i + 1..] {
                if let Some(link) = topo.get_link_mut(a, b) {
                    link.delay = self.delay;
                }
            }
        }

        let mut sim = Simulator::new(config, self.seed)?.with_topology(topo);
        let mut rng = self.seed ^ 0x9E37_79B9_7F4A_7C15;
        for &id in ids.iter().filter(|&&id| id != MASTER_ID) {
            let skew = (next_unit(&mut rng) * 2.0 - 1.0) * self.max_skew_ppm;
            let offset = (next_unit(&mut rng) * self.max_offset.as_nanos() as f64) as u64;
            sim.add_node(id, SimClock::new(Duration::from_nanos(offset), skew))?;
        }

        for (round, action) in self.actions {
            sim.schedule_action(round, action);
        }
        Ok(sim)
    }

    /// Build and run `rounds` rounds.
    pub fn run_rounds(self, rounds: u64) -> Result<SimulationResult, ConfigError> {
        let mut sim = self.build()?;
        Ok(sim.run_rounds(rounds))
    }
}

/// Convenience function to create a simple N-node fully connected scenario.
pub fn simple_scenario(num_nodes: usize) -> ScenarioBuilder {
    ScenarioBuilder::new(num_nodes).fully_connected()
}

/// Chain of `num_nodes` with drifting follower clocks, as on real crystals.
pub fn drifting_chain(num_nodes: usize, ppm: f64) -> ScenarioBuilder {
    ScenarioBuilder::new(num_nodes)
        .chain_topology()
        .with_clock_skew(ppm)
        .with_clock_offset(Duration::from_millis(500))
}

fn next_unit(state: &mut u64) -> f64 {
    *state = state
        .wrapping_mul(6364136223846793005)
        .wrapping_add(1442695040888963407);
    (*state >> 11) as f64 / (1u64 << 53) as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_builder_basic() {
        let sim = ScenarioBuilder::new(3).with_seed(123).build().unwrap();
        assert_eq!(sim.node_ids(), vec![0, 1, 2]);
        assert_eq!(sim.config().max_nodes, 3);
        assert!(sim.topology().is_connected(1, 2));
    }

    #[test]
    fn test_scenario_with_loss_and_rssi() {
        let sim = ScenarioBuilder::new(2)
            .with_loss_rate(0.5)
            .with_rssi(-85)
            .build()
            .unwrap();
        let link = sim.topology().get_link(0, 1).unwrap();
        assert_eq!(link.loss_rate, 0.5);
        assert_eq!(link.rssi, -85);
    }

    #[test]
    fn test_clock_skew_bounded_and_seeded() {
        let build = || {
            ScenarioBuilder::new(5)
                .with_seed(9)
                .with_clock_skew(40.0)
                .build()
                .unwrap()
        };
        let a = build();
        let b = build();
        for id in 1..5 {
            let skew = a.node(id).unwrap().clock().skew_ppm();
            assert!(skew.abs() <= 40.0);
            assert_eq!(skew, b.node(id).unwrap().clock().skew_ppm());
        }
        assert_eq!(a.node(MASTER_ID).unwrap().clock().skew_ppm(), 0.0);
    }

    #[test]
    fn test_scenario_partition() {
        let mut sim = ScenarioBuilder::new(4)
            .partition_at(2, vec![vec![0, 1], vec![2, 3]])
            .build()
            .unwrap();
        assert!(sim.topology().is_connected(0, 2));
        sim.run_rounds(3);
        assert!(!sim.topology().is_connected(0, 2));
        assert!(sim.topology().is_connected(2, 3));
    }

    #[test]
    fn test_oversized_network_rejected() {
        // 60 uplink slots of 10 ms plus the data phase exceed a one second round.
        let result = ScenarioBuilder::new(70).build();
        assert!(matches!(result, Err(ConfigError::RoundOverrun { .. })));
    }
}
