//! Shared state handed to every actor thread
//!
//! The road graph, the lights and the optional remote light client are
//! owned here and passed to actors behind an `Arc`, instead of living in
//! process-wide singletons.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::distributed::LightClient;

use super::road_network::RoadGraph;
use super::stop_signal::StopSignal;
use super::traffic_light::TrafficLight;
use super::types::{ControllerId, LightPhase, NodeId, DEFAULT_VEHICLE_STEP};

/// Suspension intervals used by actors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionTimings {
    /// Time a vehicle spends on each node it enters
    pub step: Duration,
    /// Pause between attempts to take a busy node
    pub retry: Duration,
    /// Pause between green-light polls (remote mode and trucks)
    pub signal_poll: Duration,
    /// Pause after a pedestrian is denied a crossing
    pub pedestrian_backoff: Duration,
    /// How often a crossing pedestrian checks the light
    pub crossing_poll: Duration,
}

impl Default for MotionTimings {
    fn default() -> Self {
        Self {
            step: DEFAULT_VEHICLE_STEP,
            retry: Duration::from_millis(50),
            signal_poll: Duration::from_millis(100),
            pedestrian_backoff: Duration::from_millis(500),
            crossing_poll: Duration::from_millis(200),
        }
    }
}

/// Everything actors share for one run
#[derive(Debug)]
pub struct SimContext {
    graph: RoadGraph,
    lights: BTreeMap<ControllerId, Arc<TrafficLight>>,
    motion: MotionTimings,
    remote: RwLock<Option<Arc<LightClient>>>,
}

impl SimContext {
    pub fn new(graph: RoadGraph, lights: Vec<Arc<TrafficLight>>, motion: MotionTimings) -> Self {
        Self {
            graph,
            lights: lights.into_iter().map(|l| (l.id(), l)).collect(),
            motion,
            remote: RwLock::new(None),
        }
    }

    pub fn graph(&self) -> &RoadGraph {
        &self.graph
    }

    pub fn motion(&self) -> &MotionTimings {
        &self.motion
    }

    pub fn light(&self, id: ControllerId) -> Option<&Arc<TrafficLight>> {
        self.lights.get(&id)
    }

    /// Light governing a node, if any
    pub fn light_at(&self, node: NodeId) -> Option<&Arc<TrafficLight>> {
        self.graph
            .controller_at(node)
            .and_then(|id| self.lights.get(&id))
    }

    /// All lights in id order
    pub fn lights(&self) -> Vec<Arc<TrafficLight>> {
        self.lights.values().cloned().collect()
    }

    pub fn light_count(&self) -> usize {
        self.lights.len()
    }

    /// Switch actors to a remote light client, or back to local lights
    pub fn set_remote(&self, client: Option<Arc<LightClient>>) {
        *self.remote.write().unwrap_or_else(|e| e.into_inner()) = client;
    }

    /// The remote light client while distributed mode is on
    pub fn remote(&self) -> Option<Arc<LightClient>> {
        self.remote
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Phase of a light, asked remotely first and locally as the fallback
    ///
    /// A raised `cancel` skips any remote resolution still pending.
    pub fn observed_phase(&self, id: ControllerId, cancel: &StopSignal) -> Option<LightPhase> {
        if let Some(client) = self.remote() {
            if let Some(state) = client.current_state(id, cancel) {
                return Some(state.phase);
            }
        }
        self.light(id).map(|light| light.phase())
    }
}
