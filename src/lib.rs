//! Traffic Simulation Library
//!
//! A concurrent traffic simulation with an optional remote light authority.

pub mod distributed;
pub mod simulation;
