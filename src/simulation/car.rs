//! Car actor
//!
//! A car holds exactly one node at a time. It takes the next node on its
//! route before letting go of the current one, obeys the light on every
//! node it enters and never blocks other actors while a node is busy.

use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::Arc;

use crate::distributed::LightClient;

use super::agent::{Agent, AgentShared};
use super::context::SimContext;
use super::node::NodeLease;
use super::traffic_light::Wakeup;
use super::types::{ActorState, AgentId, AgentKind, ControllerId, LightPhase, NodeId, VehicleState};

const FINISHED: ActorState = ActorState::Vehicle(VehicleState::Finished);

/// A single-node vehicle
pub struct Car {
    shared: Arc<AgentShared>,
    ctx: Arc<SimContext>,
    start: NodeId,
    destination: NodeId,
    /// Nodes still to enter, start excluded
    route: VecDeque<NodeId>,
    current: Option<NodeLease>,
}

impl Car {
    /// Create a car and compute its route
    ///
    /// An unreachable destination leaves the route empty; the car then
    /// finishes as soon as it runs, without taking any node.
    pub fn new(id: AgentId, ctx: Arc<SimContext>, start: NodeId, destination: NodeId) -> Self {
        let path = ctx.graph().find_shortest_path(start, destination);
        if path.is_empty() {
            warn!("Car {} has no route from {} to {}", id, start, destination);
        }
        let route: VecDeque<NodeId> = path.into_iter().skip(1).collect();

        let shared = Arc::new(AgentShared::new(
            id,
            AgentKind::Car,
            ActorState::Vehicle(VehicleState::Moving),
        ));
        shared.update(|report| {
            report.position = ctx.graph().node(start).map(|n| n.position);
            report.destination = ctx.graph().node(destination).map(|n| n.position);
            report.remaining_route = route.len();
        });
        debug!("Car {} route calculated: {} nodes", id, route.len());

        Self {
            shared,
            ctx,
            start,
            destination,
            route,
            current: None,
        }
    }

    pub fn route(&self) -> &VecDeque<NodeId> {
        &self.route
    }

    fn id(&self) -> AgentId {
        self.shared.id()
    }

    fn set_state(&self, state: VehicleState) {
        self.shared.set_state(ActorState::Vehicle(state));
    }

    fn sleep(&self, duration: std::time::Duration) -> bool {
        self.shared.stop_signal().sleep(duration)
    }

    /// Take the start node, retrying while it is busy
    fn enter_start(&mut self) -> bool {
        let Some(node) = self.ctx.graph().node(self.start) else {
            return false;
        };
        loop {
            if let Some(lease) = node.try_lease(self.id()) {
                self.current = Some(lease);
                return true;
            }
            self.set_state(VehicleState::Waiting);
            if !self.sleep(self.ctx.motion().retry) {
                return false;
            }
        }
    }

    /// Drive along the route; returns once the destination is reached or
    /// the car is stopped
    fn drive(&mut self) {
        while !self.shared.is_stop_requested() {
            let Some(&next) = self.route.front() else {
                break;
            };
            let Some(node) = self.ctx.graph().node(next) else {
                warn!("Car {} route references missing {}", self.id(), next);
                break;
            };

            let Some(lease) = node.try_lease(self.id()) else {
                self.set_state(VehicleState::Waiting);
                debug!("Car {} waiting for {}", self.id(), next);
                if !self.sleep(self.ctx.motion().retry) {
                    break;
                }
                continue;
            };

            self.route.pop_front();
            let remaining = self.route.len();
            let position = lease.position();
            self.shared.update(|report| {
                report.position = Some(position);
                report.remaining_route = remaining;
            });
            // Replacing the lease releases the node behind us
            self.current = Some(lease);
            self.set_state(VehicleState::Moving);
            debug!("Car {} moved to {} at {}", self.id(), next, position);

            if self.obey_light(next) == Wakeup::Halted {
                break;
            }
            if !self.sleep(self.ctx.motion().step) {
                break;
            }
            if next == self.destination {
                self.set_state(VehicleState::Finished);
                info!("Car {} reached destination {}", self.id(), next);
                break;
            }
        }
    }

    fn obey_light(&self, node: NodeId) -> Wakeup {
        let Some(controller) = self.ctx.graph().controller_at(node) else {
            return Wakeup::Proceed;
        };
        if let Some(client) = self.ctx.remote() {
            if let Some(wakeup) = self.obey_remote_light(&client, controller) {
                return wakeup;
            }
            debug!(
                "Car {} falling back to local light {}",
                self.id(),
                controller
            );
        }
        self.obey_local_light(controller)
    }

    /// `None` when the remote light is unavailable
    fn obey_remote_light(&self, client: &LightClient, controller: ControllerId) -> Option<Wakeup> {
        let cancel = self.shared.stop_signal();
        let state = client.current_state(controller, cancel)?;
        if state.phase == LightPhase::Green {
            self.set_state(VehicleState::Moving);
            return Some(Wakeup::Proceed);
        }

        self.set_state(VehicleState::WaitingSemaphore);
        info!(
            "Car {} detected {:?} at remote light {}, waiting",
            self.id(),
            state.phase,
            controller
        );
        loop {
            match client.request_green(controller, self.id(), cancel)? {
                true => {
                    self.set_state(VehicleState::Moving);
                    return Some(Wakeup::Proceed);
                }
                false => {
                    if !self.sleep(self.ctx.motion().signal_poll) {
                        return Some(Wakeup::Halted);
                    }
                }
            }
        }
    }

    fn obey_local_light(&self, controller: ControllerId) -> Wakeup {
        let Some(light) = self.ctx.light(controller) else {
            return Wakeup::Proceed;
        };
        if light.can_proceed() {
            self.set_state(VehicleState::Moving);
            return Wakeup::Proceed;
        }

        self.set_state(VehicleState::WaitingSemaphore);
        info!("Car {} waiting at light {}", self.id(), controller);
        let wakeup = light.wait_for_green(self.shared.stop_signal());
        if wakeup == Wakeup::Proceed {
            self.set_state(VehicleState::Moving);
            debug!("Car {} got green at light {}", self.id(), controller);
        }
        wakeup
    }
}

impl Agent for Car {
    fn shared(&self) -> &Arc<AgentShared> {
        &self.shared
    }

    fn run(mut self: Box<Self>) {
        if self.route.is_empty() {
            self.set_state(VehicleState::Finished);
            self.shared.mark_exit(FINISHED);
            return;
        }

        info!("Car {} started at {}", self.id(), self.start);
        if self.enter_start() {
            self.drive();
        }

        self.current = None;
        self.shared.update(|report| report.position = None);
        self.shared.mark_exit(FINISHED);
        if self.shared.state() != FINISHED {
            info!("Car {} stopped", self.id());
        }
    }
}
