//! Traffic light controller
//!
//! Each light runs its own timed GREEN -> YELLOW -> RED cycle on a dedicated
//! thread. Vehicles park on the green rendezvous, pedestrians on the red
//! one; every transition that opens a rendezvous wakes all of its waiters.
//! Pedestrian crossings are bounded by a permit pool that is refilled when
//! the light turns red and drained when it leaves red.

use log::{debug, info};
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use super::stop_signal::StopSignal;
use super::types::{
    ControllerId, LightPhase, Position, DEFAULT_CROSSING_CAPACITY, DEFAULT_PHASE_CHECK_INTERVAL,
};

/// Phase durations and the phase-check interval of a light
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightTimings {
    pub green: Duration,
    pub yellow: Duration,
    pub red: Duration,
    /// How often the controller checks whether a phase is due; much finer
    /// than any phase so drift stays small
    pub check_interval: Duration,
}

impl LightTimings {
    pub fn new(green: Duration, yellow: Duration, red: Duration) -> Self {
        Self {
            green,
            yellow,
            red,
            check_interval: DEFAULT_PHASE_CHECK_INTERVAL,
        }
    }

    pub fn with_check_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }

    pub fn duration(&self, phase: LightPhase) -> Duration {
        match phase {
            LightPhase::Green => self.green,
            LightPhase::Yellow => self.yellow,
            LightPhase::Red => self.red,
        }
    }
}

impl Default for LightTimings {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(5),
            Duration::from_secs(2),
            Duration::from_secs(5),
        )
    }
}

/// Bounded pool of crossing permits
///
/// `in_use` counts permits handed out and not yet returned; `available`
/// never exceeds `capacity - in_use`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermitPool {
    capacity: usize,
    available: usize,
    in_use: usize,
}

impl PermitPool {
    /// A full pool
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            available: capacity,
            in_use: 0,
        }
    }

    pub fn try_acquire(&mut self) -> bool {
        if self.available == 0 {
            return false;
        }
        self.available -= 1;
        self.in_use += 1;
        true
    }

    /// Return a permit; with `reclaim` it goes back into the pool
    ///
    /// Returns `false` when nothing was handed out.
    pub fn release(&mut self, reclaim: bool) -> bool {
        if self.in_use == 0 {
            return false;
        }
        self.in_use -= 1;
        if reclaim {
            self.available = (self.available + 1).min(self.capacity - self.in_use);
        }
        true
    }

    /// Refill up to capacity, minus permits still out
    pub fn restore(&mut self) {
        self.available = self.capacity - self.in_use;
    }

    pub fn drain(&mut self) {
        self.available = 0;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.available
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }
}

/// Why a rendezvous wait returned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// The awaited phase is showing
    Proceed,
    /// The controller or the waiter was stopped
    Halted,
}

/// Point-in-time view of a light
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LightSnapshot {
    pub id: ControllerId,
    pub position: Position,
    pub phase: LightPhase,
    /// Wall-clock time of the last transition, in milliseconds since the epoch
    pub changed_at_ms: u64,
    pub pedestrians_crossing: usize,
}

#[derive(Debug)]
struct LightState {
    phase: LightPhase,
    last_change: Instant,
    changed_at_ms: u64,
    permits: PermitPool,
    stopped: bool,
}

/// A traffic light controller
#[derive(Debug)]
pub struct TrafficLight {
    id: ControllerId,
    position: Position,
    timings: LightTimings,
    state: Mutex<LightState>,
    green_light: Condvar,
    red_light: Condvar,
    halt: StopSignal,
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl TrafficLight {
    /// A light that starts on RED with a full permit pool
    pub fn new(id: ControllerId, position: Position, timings: LightTimings) -> Self {
        Self::with_initial_phase(id, position, timings, LightPhase::Red)
    }

    pub fn with_initial_phase(
        id: ControllerId,
        position: Position,
        timings: LightTimings,
        phase: LightPhase,
    ) -> Self {
        let mut permits = PermitPool::new(DEFAULT_CROSSING_CAPACITY);
        if phase != LightPhase::Red {
            permits.drain();
        }

        Self {
            id,
            position,
            timings,
            state: Mutex::new(LightState {
                phase,
                last_change: Instant::now(),
                changed_at_ms: epoch_millis(),
                permits,
                stopped: false,
            }),
            green_light: Condvar::new(),
            red_light: Condvar::new(),
            halt: StopSignal::new(),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, LightState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> ControllerId {
        self.id
    }

    pub fn position(&self) -> Position {
        self.position
    }

    pub fn timings(&self) -> LightTimings {
        self.timings
    }

    pub fn phase(&self) -> LightPhase {
        self.lock_state().phase
    }

    /// Whether vehicles may proceed right now
    pub fn can_proceed(&self) -> bool {
        self.phase() == LightPhase::Green
    }

    pub fn snapshot(&self) -> LightSnapshot {
        let state = self.lock_state();
        LightSnapshot {
            id: self.id,
            position: self.position,
            phase: state.phase,
            changed_at_ms: state.changed_at_ms,
            pedestrians_crossing: state.permits.in_use(),
        }
    }

    pub fn pedestrians_crossing(&self) -> usize {
        self.lock_state().permits.in_use()
    }

    /// How long a pedestrian needs to get across
    pub fn crossing_duration(&self) -> Duration {
        self.timings.red / 2
    }

    pub fn is_alive(&self) -> bool {
        !self.halt.is_stopped()
    }

    /// Spawn the controller's own thread
    pub fn spawn(self: &Arc<Self>) -> io::Result<JoinHandle<()>> {
        let light = Arc::clone(self);
        thread::Builder::new()
            .name(format!("light-{}", self.id))
            .spawn(move || light.run())
    }

    /// Phase loop; returns once [`TrafficLight::stop`] is called
    pub fn run(&self) {
        info!("Light {} started at {}", self.id, self.position);
        while !self.halt.is_stopped() {
            self.tick();
            if !self.halt.sleep(self.timings.check_interval) {
                break;
            }
        }
        info!("Light {} stopped", self.id);
    }

    /// Advance the phase if the current one has run its course
    pub fn tick(&self) -> Option<LightPhase> {
        let mut state = self.lock_state();
        if state.stopped {
            return None;
        }
        if state.last_change.elapsed() >= self.timings.duration(state.phase) {
            Some(self.transition(&mut state))
        } else {
            None
        }
    }

    /// Move to the next phase immediately
    pub fn advance_phase(&self) -> LightPhase {
        let mut state = self.lock_state();
        self.transition(&mut state)
    }

    fn transition(&self, state: &mut LightState) -> LightPhase {
        state.phase = state.phase.next();
        match state.phase {
            LightPhase::Yellow => {
                state.permits.drain();
            }
            LightPhase::Red => {
                state.permits.restore();
                self.red_light.notify_all();
            }
            LightPhase::Green => {
                state.permits.drain();
                self.green_light.notify_all();
            }
        }
        state.last_change = Instant::now();
        state.changed_at_ms = epoch_millis();
        info!("Light {} changed to {:?}", self.id, state.phase);
        state.phase
    }

    /// Block until the light is green
    ///
    /// The phase is checked under the state lock, so a transition to green
    /// cannot slip between the check and the wait. `cancel` is consulted at
    /// each check interval.
    pub fn wait_for_green(&self, cancel: &StopSignal) -> Wakeup {
        let mut state = self.lock_state();
        loop {
            if state.phase == LightPhase::Green {
                return Wakeup::Proceed;
            }
            if state.stopped || cancel.is_stopped() {
                return Wakeup::Halted;
            }
            debug!("Vehicle parked at light {} ({:?})", self.id, state.phase);
            state = match self
                .green_light
                .wait_timeout(state, self.timings.check_interval)
            {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Block until the light is red, then try once for a crossing permit
    ///
    /// Never waits for a permit: a full pool returns `false` and leaves the
    /// retry to the caller.
    pub fn wait_for_red_and_cross(&self, cancel: &StopSignal) -> bool {
        let mut state = self.lock_state();
        loop {
            if state.phase == LightPhase::Red {
                return state.permits.try_acquire();
            }
            if state.stopped || cancel.is_stopped() {
                return false;
            }
            state = match self
                .red_light
                .wait_timeout(state, self.timings.check_interval)
            {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Non-blocking crossing request: granted only on red with a free permit
    pub fn try_cross(&self) -> bool {
        let mut state = self.lock_state();
        state.phase == LightPhase::Red && state.permits.try_acquire()
    }

    /// Return a crossing permit
    pub fn finish_crossing(&self) {
        let mut state = self.lock_state();
        let reclaim = state.phase == LightPhase::Red;
        state.permits.release(reclaim);
    }

    /// Stop the phase loop and wake every parked actor
    pub fn stop(&self) {
        self.halt.stop();
        let mut state = self.lock_state();
        state.stopped = true;
        self.green_light.notify_all();
        self.red_light.notify_all();
    }
}
