//! Simulation root
//!
//! Owns the road graph, the light controllers and every actor for one run,
//! and optionally the registry and client of distributed mode. Observers
//! read snapshots through the query methods; none of them holds a lock
//! beyond a single node, light or actor report.

use anyhow::{bail, ensure, Context, Result};
use log::{info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::distributed::{ClientConfig, ClientStats, LightClient, LightRegistry};

use super::agent::{Agent, AgentHandle, AgentShared, AgentSnapshot};
use super::car::Car;
use super::context::{MotionTimings, SimContext};
use super::pedestrian::Pedestrian;
use super::road_network::{NodeOccupancy, RoadGraph};
use super::traffic_light::{LightSnapshot, LightTimings, TrafficLight};
use super::truck::Truck;
use super::types::{
    ActorState, AgentId, AgentKind, AgentStatus, LightPhase, PedestrianState, VehicleState,
};

const IDLE_POLL: Duration = Duration::from_millis(20);

/// Largest grid side accepted; the grid index is allocated up front
pub const MAX_GRID_SIDE: i32 = 1000;

/// Parameters of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimConfig {
    pub cars: usize,
    pub trucks: usize,
    pub pedestrians: usize,
    pub grid_width: i32,
    pub grid_height: i32,
    pub lights: LightTimings,
    pub motion: MotionTimings,
    /// Fixed seed for reproducible start/end and light choices
    pub seed: Option<u64>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            cars: 10,
            trucks: 2,
            pedestrians: 5,
            grid_width: 15,
            grid_height: 15,
            lights: LightTimings::default(),
            motion: MotionTimings::default(),
            seed: None,
        }
    }
}

impl SimConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.grid_width >= 3 && self.grid_height >= 3,
            "Grid must be at least 3x3, got {}x{}",
            self.grid_width,
            self.grid_height
        );
        ensure!(
            self.grid_width <= MAX_GRID_SIDE && self.grid_height <= MAX_GRID_SIDE,
            "Grid may be at most {}x{}, got {}x{}",
            MAX_GRID_SIDE,
            MAX_GRID_SIDE,
            self.grid_width,
            self.grid_height
        );

        let lights = [
            ("green", self.lights.green),
            ("yellow", self.lights.yellow),
            ("red", self.lights.red),
            ("phase check interval", self.lights.check_interval),
        ];
        let motion = [
            ("vehicle step", self.motion.step),
            ("retry interval", self.motion.retry),
            ("signal poll", self.motion.signal_poll),
            ("pedestrian backoff", self.motion.pedestrian_backoff),
            ("crossing poll", self.motion.crossing_poll),
        ];
        for (name, duration) in lights.into_iter().chain(motion) {
            ensure!(!duration.is_zero(), "{} duration must be positive", name);
        }

        ensure!(
            self.lights.yellow <= self.lights.red,
            "Yellow ({:?}) may not outlast red ({:?})",
            self.lights.yellow,
            self.lights.red
        );
        Ok(())
    }
}

/// Actor population by kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AgentCounts {
    pub cars: usize,
    pub trucks: usize,
    pub pedestrians: usize,
    pub lights: usize,
}

pub struct Simulation {
    ctx: Arc<SimContext>,
    /// Every actor, started or not
    shared: Vec<Arc<AgentShared>>,
    pending: Vec<Box<dyn Agent>>,
    running: Vec<AgentHandle>,
    light_threads: Vec<JoinHandle<()>>,
    registry: Option<LightRegistry>,
    client: Option<Arc<LightClient>>,
    next_agent: usize,
}

impl Simulation {
    /// Build the grid, its lights and the configured actors
    ///
    /// Nothing runs until [`Simulation::start`].
    pub fn initialize(config: SimConfig) -> Result<Self> {
        config.validate().context("Invalid simulation config")?;

        let graph = RoadGraph::build_grid(config.grid_width, config.grid_height)
            .context("Failed to build road grid")?;
        let lights: Vec<Arc<TrafficLight>> = graph
            .controller_nodes()
            .into_iter()
            .filter_map(|(id, node)| {
                let position = graph.node(node)?.position;
                Some(Arc::new(TrafficLight::new(id, position, config.lights)))
            })
            .collect();

        let ctx = Arc::new(SimContext::new(graph, lights, config.motion));
        let mut sim = Self::from_context(ctx);

        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        let vehicles = (0..config.cars)
            .map(|_| AgentKind::Car)
            .chain((0..config.trucks).map(|_| AgentKind::Truck));
        for kind in vehicles {
            let graph = sim.ctx.graph();
            let start = graph
                .random_start_node(&mut rng)
                .context("Road grid has no intersection to start from")?;
            let end = graph.random_end_node(start, &mut rng).unwrap_or(start);
            let id = sim.next_id();
            let agent: Box<dyn Agent> = match kind {
                AgentKind::Truck => Box::new(Truck::new(id, Arc::clone(&sim.ctx), start, end)),
                _ => Box::new(Car::new(id, Arc::clone(&sim.ctx), start, end)),
            };
            sim.add_agent(agent);
        }

        for _ in 0..config.pedestrians {
            let id = sim.next_id();
            let pedestrian = Pedestrian::with_random_light(id, Arc::clone(&sim.ctx), &mut rng);
            sim.add_agent(Box::new(pedestrian));
        }

        info!(
            "Simulation initialized: {} nodes, {} lights, {} cars, {} trucks, {} pedestrians",
            sim.ctx.graph().node_count(),
            sim.ctx.light_count(),
            config.cars,
            config.trucks,
            config.pedestrians
        );
        Ok(sim)
    }

    /// A simulation over an existing context with no actors yet
    pub fn from_context(ctx: Arc<SimContext>) -> Self {
        Self {
            ctx,
            shared: Vec::new(),
            pending: Vec::new(),
            running: Vec::new(),
            light_threads: Vec::new(),
            registry: None,
            client: None,
            next_agent: 0,
        }
    }

    pub fn context(&self) -> &Arc<SimContext> {
        &self.ctx
    }

    /// Next unused actor id
    pub fn next_id(&mut self) -> AgentId {
        let id = AgentId(self.next_agent);
        self.next_agent += 1;
        id
    }

    /// Queue an actor; it starts with the next call to `start`
    pub fn add_agent(&mut self, agent: Box<dyn Agent>) {
        self.next_agent = self.next_agent.max(agent.shared().id().0 + 1);
        self.shared.push(Arc::clone(agent.shared()));
        self.pending.push(agent);
    }

    pub fn is_running(&self) -> bool {
        !self.light_threads.is_empty() || self.running.iter().any(AgentHandle::is_running)
    }

    /// Start the light controllers and every queued actor
    ///
    /// Stopped lights cannot be restarted: once [`Simulation::stop`] has run,
    /// build a fresh simulation with [`Simulation::initialize`].
    pub fn start(&mut self) -> Result<()> {
        if let Some(halted) = self.ctx.lights().iter().find(|light| !light.is_alive()) {
            bail!(
                "Light {} was stopped; initialize a new simulation to run again",
                halted.id()
            );
        }
        if self.light_threads.is_empty() {
            for light in self.ctx.lights() {
                let handle = light
                    .spawn()
                    .with_context(|| format!("Failed to start light {}", light.id()))?;
                self.light_threads.push(handle);
            }
        }

        for agent in self.pending.drain(..) {
            let handle = AgentHandle::spawn(agent).context("Failed to start actor")?;
            self.running.push(handle);
        }
        info!(
            "Simulation started: {} actors, {} lights",
            self.running.len(),
            self.light_threads.len()
        );
        Ok(())
    }

    /// Stop every actor and light, then join their threads
    pub fn stop(&mut self) {
        for handle in &self.running {
            handle.request_stop();
        }
        for light in self.ctx.lights() {
            light.stop();
        }

        let mut panicked = 0;
        for handle in &mut self.running {
            if !handle.join() {
                panicked += 1;
            }
        }
        for thread in self.light_threads.drain(..) {
            if thread.join().is_err() {
                panicked += 1;
            }
        }
        if panicked > 0 {
            warn!("{} simulation threads panicked", panicked);
        }
        info!("Simulation stopped");
    }

    /// Wait until no actor is active; `false` on timeout
    pub fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            let active = self
                .shared
                .iter()
                .any(|agent| agent.status() == AgentStatus::Active);
            if !active {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(IDLE_POLL);
        }
    }

    /// Export every light through a registry on `port` and switch actors
    /// to the remote client
    pub fn connect_distributed(&mut self, port: u16) -> Result<()> {
        if self.registry.is_some() {
            bail!("Distributed mode is already on");
        }
        let registry = LightRegistry::start(port)?;
        let bound = registry.register_all(&self.ctx.lights());

        let client = Arc::new(LightClient::new(ClientConfig::default()));
        client.configure_defaults("localhost", registry.port());
        self.ctx.set_remote(Some(Arc::clone(&client)));

        info!(
            "Distributed mode on: {} lights bound on port {}",
            bound,
            registry.port()
        );
        self.registry = Some(registry);
        self.client = Some(client);
        Ok(())
    }

    /// Back to local lights; stops the registry
    pub fn disconnect_distributed(&mut self) {
        self.ctx.set_remote(None);
        if let Some(client) = self.client.take() {
            client.close();
        }
        if let Some(registry) = self.registry.take() {
            registry.stop();
        }
        info!("Distributed mode off");
    }

    pub fn is_distributed(&self) -> bool {
        self.registry.is_some()
    }

    pub fn registry(&self) -> Option<&LightRegistry> {
        self.registry.as_ref()
    }

    pub fn distributed_statistics(&self) -> Option<ClientStats> {
        self.client.as_ref().map(|client| client.stats())
    }

    pub fn agents(&self) -> Vec<AgentSnapshot> {
        self.shared.iter().map(|agent| agent.snapshot()).collect()
    }

    pub fn agent_counts(&self) -> AgentCounts {
        let mut counts = AgentCounts {
            lights: self.ctx.light_count(),
            ..Default::default()
        };
        for agent in &self.shared {
            match agent.kind() {
                AgentKind::Car => counts.cars += 1,
                AgentKind::Truck => counts.trucks += 1,
                AgentKind::Pedestrian => counts.pedestrians += 1,
            }
        }
        counts
    }

    fn vehicle_states(&self, kind: AgentKind) -> HashMap<VehicleState, usize> {
        let mut counts = HashMap::new();
        for agent in self.shared.iter().filter(|a| a.kind() == kind) {
            if let ActorState::Vehicle(state) = agent.state() {
                *counts.entry(state).or_insert(0) += 1;
            }
        }
        counts
    }

    /// Cars by state
    pub fn vehicle_state_counts(&self) -> HashMap<VehicleState, usize> {
        self.vehicle_states(AgentKind::Car)
    }

    pub fn truck_state_counts(&self) -> HashMap<VehicleState, usize> {
        self.vehicle_states(AgentKind::Truck)
    }

    pub fn pedestrian_state_counts(&self) -> HashMap<PedestrianState, usize> {
        let mut counts = HashMap::new();
        for agent in &self.shared {
            if let ActorState::Pedestrian(state) = agent.state() {
                *counts.entry(state).or_insert(0) += 1;
            }
        }
        counts
    }

    pub fn phase_counts(&self) -> HashMap<LightPhase, usize> {
        let mut counts = HashMap::new();
        for light in self.ctx.lights() {
            *counts.entry(light.phase()).or_insert(0) += 1;
        }
        counts
    }

    pub fn occupancy(&self) -> Vec<NodeOccupancy> {
        self.ctx.graph().occupancy()
    }

    pub fn lights(&self) -> Vec<LightSnapshot> {
        self.ctx.lights().iter().map(|light| light.snapshot()).collect()
    }

    pub fn print_summary(&self) {
        let counts = self.agent_counts();
        println!("=== Traffic Simulation Summary ===");
        println!(
            "Nodes: {}, Edges: {}, Lights: {}",
            self.ctx.graph().node_count(),
            self.ctx.graph().edge_count(),
            counts.lights
        );
        println!(
            "Cars: {}, Trucks: {}, Pedestrians: {}",
            counts.cars, counts.trucks, counts.pedestrians
        );
        println!();

        println!("--- Lights ---");
        for light in self.lights() {
            println!(
                "  Light {} at {}: {:?}, crossing={}",
                light.id, light.position, light.phase, light.pedestrians_crossing
            );
        }

        println!("--- Actors ---");
        for agent in self.agents() {
            let position = agent
                .position
                .map(|p| p.to_string())
                .unwrap_or_else(|| "-".to_string());
            println!(
                "  {:?} {}: {:?} / {:?} at {}, route_remaining={}",
                agent.kind, agent.id, agent.status, agent.state, position, agent.remaining_route
            );
        }

        let occupied = self
            .occupancy()
            .iter()
            .filter(|n| n.occupant.is_some())
            .count();
        println!("--- Occupancy ---");
        println!("  {} of {} nodes occupied", occupied, self.ctx.graph().node_count());

        if let Some(stats) = self.distributed_statistics() {
            println!("--- Distributed ---");
            println!("{}", stats);
        }
    }
}

impl Drop for Simulation {
    fn drop(&mut self) {
        if self.is_running() {
            self.stop();
        }
        if self.is_distributed() {
            self.disconnect_distributed();
        }
    }
}
