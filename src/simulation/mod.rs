//! Thread-per-actor traffic simulation
//!
//! Cars, trucks and pedestrians each run on their own thread over a shared
//! road graph. Nodes are held exclusively; traffic lights run their own
//! phase loops and release parked actors on every transition.

mod agent;
mod car;
mod context;
mod node;
mod pedestrian;
mod road_network;
mod stop_signal;
mod traffic_light;
mod truck;
mod types;
mod world;

pub use agent::{Agent, AgentHandle, AgentShared, AgentSnapshot};
pub use car::Car;
pub use context::{MotionTimings, SimContext};
pub use node::{NodeLease, NodeLock, TrafficNode};
pub use pedestrian::Pedestrian;
pub use road_network::{NodeOccupancy, RoadGraph, TrafficEdge};
pub use stop_signal::StopSignal;
pub use traffic_light::{LightSnapshot, LightTimings, PermitPool, TrafficLight, Wakeup};
pub use truck::Truck;
pub use types::{
    ActorState, AgentId, AgentKind, AgentStatus, ControllerId, EdgeId, LightPhase, NodeId,
    NodeType, PedestrianState, Position, VehicleState, DEFAULT_CROSSING_CAPACITY,
    DEFAULT_PHASE_CHECK_INTERVAL, DEFAULT_REGISTRY_PORT, DEFAULT_VEHICLE_STEP,
};
pub use world::{AgentCounts, SimConfig, Simulation, MAX_GRID_SIDE};
