//! Server side of the light proxy: one per exported controller

use log::{debug, info};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::simulation::{
    AgentId, ControllerId, LightPhase, PermitPool, Position, TrafficLight,
    DEFAULT_CROSSING_CAPACITY,
};

use super::endpoint::{LightEndpoint, RemoteError};
use super::protocol::LightStateDto;

/// Wraps a local light for remote callers
///
/// Crossings granted here draw from the server's own permit pool, sized like
/// the light's, and independent of the light's local pedestrians.
#[derive(Debug)]
pub struct LightServer {
    light: Arc<TrafficLight>,
    crossing: Mutex<PermitPool>,
    /// Vehicle id -> time of its first unanswered green request
    waiting_vehicles: Mutex<HashMap<AgentId, Instant>>,
    exported: AtomicBool,
}

impl LightServer {
    pub fn new(light: Arc<TrafficLight>) -> Self {
        Self {
            light,
            crossing: Mutex::new(PermitPool::new(DEFAULT_CROSSING_CAPACITY)),
            waiting_vehicles: Mutex::new(HashMap::new()),
            exported: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> ControllerId {
        self.light.id()
    }

    pub fn light(&self) -> &Arc<TrafficLight> {
        &self.light
    }

    /// Withdraw the server; every later call fails
    pub fn unexport(&self) {
        self.exported.store(false, Ordering::SeqCst);
    }

    pub fn is_exported(&self) -> bool {
        self.exported.load(Ordering::SeqCst)
    }

    pub fn waiting_vehicles(&self) -> usize {
        self.lock_waiting().len()
    }

    pub fn crossings_in_progress(&self) -> usize {
        self.lock_crossing().in_use()
    }

    fn lock_crossing(&self) -> MutexGuard<'_, PermitPool> {
        self.crossing.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_waiting(&self) -> MutexGuard<'_, HashMap<AgentId, Instant>> {
        self.waiting_vehicles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_exported(&self) -> Result<(), RemoteError> {
        if self.is_exported() {
            Ok(())
        } else {
            Err(RemoteError::Unexported)
        }
    }
}

impl LightEndpoint for LightServer {
    fn current_state(&self) -> Result<LightStateDto, RemoteError> {
        self.ensure_exported()?;
        Ok(LightStateDto {
            phase: self.light.phase(),
            controller_id: self.light.id(),
            timestamp_ms: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0),
        })
    }

    fn request_green(&self, vehicle: AgentId) -> Result<bool, RemoteError> {
        self.ensure_exported()?;
        let mut waiting = self.lock_waiting();
        waiting.entry(vehicle).or_insert_with(Instant::now);

        if self.light.can_proceed() {
            if let Some(since) = waiting.remove(&vehicle) {
                debug!(
                    "Light server {}: cleared vehicle {} after {:?}",
                    self.id(),
                    vehicle,
                    since.elapsed()
                );
            }
            return Ok(true);
        }
        debug!("Light server {}: vehicle {} must wait", self.id(), vehicle);
        Ok(false)
    }

    fn request_crossing(&self, pedestrian: AgentId) -> Result<bool, RemoteError> {
        self.ensure_exported()?;
        if self.light.phase() != LightPhase::Red {
            return Ok(false);
        }
        let granted = self.lock_crossing().try_acquire();
        if granted {
            info!(
                "Light server {}: pedestrian {} crossing",
                self.id(),
                pedestrian
            );
        }
        Ok(granted)
    }

    fn finish_crossing(&self, pedestrian: AgentId) -> Result<(), RemoteError> {
        self.ensure_exported()?;
        if self.lock_crossing().release(true) {
            info!(
                "Light server {}: pedestrian {} finished crossing",
                self.id(),
                pedestrian
            );
        }
        Ok(())
    }

    fn position(&self) -> Result<Position, RemoteError> {
        self.ensure_exported()?;
        Ok(self.light.position())
    }

    fn is_alive(&self) -> Result<bool, RemoteError> {
        Ok(self.is_exported() && self.light.is_alive())
    }
}
