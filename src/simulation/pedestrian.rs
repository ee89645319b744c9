//! Pedestrian actor
//!
//! A pedestrian waits at one light for red, takes a crossing permit, and
//! walks across while the light stays red. If the light leaves red before
//! the crossing is done the pedestrian steps back and waits again.

use log::{debug, info, warn};
use rand::seq::IndexedRandom;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::distributed::LightClient;

use super::agent::{Agent, AgentShared};
use super::context::SimContext;
use super::stop_signal::StopSignal;
use super::traffic_light::TrafficLight;
use super::types::{ActorState, AgentId, AgentKind, ControllerId, LightPhase, PedestrianState};

const FINISHED: ActorState = ActorState::Pedestrian(PedestrianState::Finished);

/// A granted crossing; returning it gives the permit back
struct CrossingPass {
    light: Arc<TrafficLight>,
    pedestrian: AgentId,
    remote: Option<Arc<LightClient>>,
}

impl Drop for CrossingPass {
    fn drop(&mut self) {
        match &self.remote {
            Some(client) => {
                // The permit goes back even while the pedestrian is stopping
                let returning = StopSignal::new();
                if client
                    .finish_crossing(self.light.id(), self.pedestrian, &returning)
                    .is_none()
                {
                    warn!(
                        "Pedestrian {} could not return its permit to remote light {}",
                        self.pedestrian,
                        self.light.id()
                    );
                }
            }
            None => self.light.finish_crossing(),
        }
    }
}

pub struct Pedestrian {
    shared: Arc<AgentShared>,
    ctx: Arc<SimContext>,
    light: Option<Arc<TrafficLight>>,
    pass: Option<CrossingPass>,
    state: PedestrianState,
}

impl Pedestrian {
    /// A pedestrian waiting at the given light
    ///
    /// With no light (or an unknown one) the pedestrian has nothing to
    /// cross and finishes immediately when run.
    pub fn new(id: AgentId, ctx: Arc<SimContext>, light: Option<ControllerId>) -> Self {
        let light = light.and_then(|controller| ctx.light(controller).cloned());
        let shared = Arc::new(AgentShared::new(
            id,
            AgentKind::Pedestrian,
            ActorState::Pedestrian(PedestrianState::WaitingSemaphore),
        ));
        if let Some(light) = &light {
            let position = light.position();
            shared.update(|report| {
                report.position = Some(position);
                report.destination = Some(position);
            });
        }

        Self {
            shared,
            ctx,
            light,
            pass: None,
            state: PedestrianState::WaitingSemaphore,
        }
    }

    /// A pedestrian at a uniformly chosen light
    pub fn with_random_light<R: Rng + ?Sized>(id: AgentId, ctx: Arc<SimContext>, rng: &mut R) -> Self {
        let light = ctx.lights().choose(rng).map(|light| light.id());
        Self::new(id, ctx, light)
    }

    /// The light this pedestrian waits at
    pub fn light(&self) -> Option<ControllerId> {
        self.light.as_ref().map(|light| light.id())
    }

    fn id(&self) -> AgentId {
        self.shared.id()
    }

    fn set_state(&mut self, state: PedestrianState) {
        self.state = state;
        self.shared.set_state(ActorState::Pedestrian(state));
    }

    fn sleep(&self, duration: Duration) -> bool {
        self.shared.stop_signal().sleep(duration)
    }

    /// Ask for a crossing, remotely first; `true` once a permit is held
    fn request_crossing(&mut self, light: &Arc<TrafficLight>) -> bool {
        if let Some(client) = self.ctx.remote() {
            let cancel = self.shared.stop_signal();
            match client.current_state(light.id(), cancel) {
                Some(state) if state.phase == LightPhase::Red => {
                    match client.request_crossing(light.id(), self.id(), cancel) {
                        Some(true) => {
                            self.pass = Some(CrossingPass {
                                light: Arc::clone(light),
                                pedestrian: self.id(),
                                remote: Some(client),
                            });
                            return true;
                        }
                        Some(false) => return false,
                        None => debug!(
                            "Pedestrian {} falling back to local light {}",
                            self.id(),
                            light.id()
                        ),
                    }
                }
                // Not red yet: park on the local rendezvous below
                Some(_) => {}
                None => debug!(
                    "Pedestrian {} falling back to local light {}",
                    self.id(),
                    light.id()
                ),
            }
        }

        if light.wait_for_red_and_cross(self.shared.stop_signal()) {
            self.pass = Some(CrossingPass {
                light: Arc::clone(light),
                pedestrian: self.id(),
                remote: None,
            });
            return true;
        }
        false
    }

    /// Walk across, polling the light; leaves the state at FINISHED on
    /// success and back at WAITING_SEMAPHORE if the light left red
    fn cross(&mut self, light: &Arc<TrafficLight>) {
        let duration = light.crossing_duration();
        let started = Instant::now();
        info!(
            "Pedestrian {} crossing at light {} ({:?})",
            self.id(),
            light.id(),
            duration
        );

        loop {
            let elapsed = started.elapsed();
            if elapsed >= duration {
                self.pass = None;
                self.set_state(PedestrianState::Finished);
                info!("Pedestrian {} finished crossing", self.id());
                return;
            }
            if self.ctx.observed_phase(light.id(), self.shared.stop_signal())
                != Some(LightPhase::Red)
            {
                self.pass = None;
                self.set_state(PedestrianState::WaitingSemaphore);
                info!(
                    "Pedestrian {} stepped back, light {} left red",
                    self.id(),
                    light.id()
                );
                return;
            }
            let pause = self.ctx.motion().crossing_poll.min(duration - elapsed);
            if !self.sleep(pause) {
                return;
            }
        }
    }
}

impl Agent for Pedestrian {
    fn shared(&self) -> &Arc<AgentShared> {
        &self.shared
    }

    fn run(mut self: Box<Self>) {
        let Some(light) = self.light.clone() else {
            self.set_state(PedestrianState::Finished);
            self.shared.mark_exit(FINISHED);
            return;
        };

        info!("Pedestrian {} waiting at light {}", self.id(), light.id());
        while !self.shared.is_stop_requested() {
            match self.state {
                PedestrianState::WaitingSemaphore => {
                    if self.request_crossing(&light) {
                        self.set_state(PedestrianState::Crossing);
                    } else if !self.sleep(self.ctx.motion().pedestrian_backoff) {
                        break;
                    }
                }
                PedestrianState::Crossing => self.cross(&light),
                PedestrianState::Finished => break,
            }
        }

        self.pass = None;
        self.shared.mark_exit(FINISHED);
        if self.shared.state() != FINISHED {
            info!("Pedestrian {} stopped", self.id());
        }
    }
}
