//! Core types for the traffic simulation
//!
//! Identifiers, grid positions and the small enums shared by the road
//! network, the light controllers and the actors.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Identifier of a node in the road graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

/// Identifier of a directed edge in the road graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EdgeId(pub usize);

/// Identifier of an actor (car, truck or pedestrian)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentId(pub usize);

/// Identifier of a traffic light controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ControllerId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node_{}", self.0)
    }
}

impl fmt::Display for AgentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ControllerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An integer position on the map grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Manhattan distance, used as the edge length between grid neighbours
    pub fn manhattan(&self, other: &Position) -> u32 {
        self.x.abs_diff(other.x) + self.y.abs_diff(other.y)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}

/// Kind of road graph node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeType {
    Intersection,
    Street,
    Crosswalk,
}

/// Phase of a traffic light
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LightPhase {
    Green,
    Yellow,
    Red,
}

impl LightPhase {
    /// The phase that follows this one (GREEN -> YELLOW -> RED -> GREEN)
    pub fn next(self) -> LightPhase {
        match self {
            LightPhase::Green => LightPhase::Yellow,
            LightPhase::Yellow => LightPhase::Red,
            LightPhase::Red => LightPhase::Green,
        }
    }
}

/// Kind of actor running in the simulation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentKind {
    Car,
    Truck,
    Pedestrian,
}

/// Coarse lifecycle status shared by every actor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentStatus {
    Active,
    Finished,
    Stopped,
}

/// Movement state of a car or truck
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VehicleState {
    Moving,
    /// Next node is occupied by another actor
    Waiting,
    /// Parked at a light that is not green
    WaitingSemaphore,
    /// Truck only: the new front node could not be taken while the rear is held
    WaitingDoubleResource,
    Finished,
}

/// Crossing state of a pedestrian
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PedestrianState {
    WaitingSemaphore,
    Crossing,
    Finished,
}

/// Per-kind actor state as reported to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActorState {
    Vehicle(VehicleState),
    Pedestrian(PedestrianState),
}

/// Default number of pedestrians allowed to cross one light at once
pub const DEFAULT_CROSSING_CAPACITY: usize = 3;

/// Default port of the light registry
pub const DEFAULT_REGISTRY_PORT: u16 = 1099;

/// Default interval at which a light checks whether its phase is due
pub const DEFAULT_PHASE_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Default time a vehicle spends on each node
pub const DEFAULT_VEHICLE_STEP: Duration = Duration::from_millis(750);
