//! Truck actor
//!
//! A truck spans two adjacent nodes. Moving means taking the next node as
//! the new front and letting the old rear go, in that order, so the truck
//! never occupies fewer than its current cells mid-move. Before moving it
//! checks every cell of the window it would touch for a red light.

use log::{debug, info, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use super::agent::{Agent, AgentShared};
use super::context::SimContext;
use super::node::NodeLease;
use super::traffic_light::{TrafficLight, Wakeup};
use super::types::{ActorState, AgentId, AgentKind, LightPhase, NodeId, VehicleState};

const FINISHED: ActorState = ActorState::Vehicle(VehicleState::Finished);

/// A two-node vehicle
pub struct Truck {
    shared: Arc<AgentShared>,
    ctx: Arc<SimContext>,
    start: NodeId,
    destination: NodeId,
    route: VecDeque<NodeId>,
    front: Option<NodeLease>,
    rear: Option<NodeLease>,
}

impl Truck {
    pub fn new(id: AgentId, ctx: Arc<SimContext>, start: NodeId, destination: NodeId) -> Self {
        let path = ctx.graph().find_shortest_path(start, destination);
        if path.is_empty() {
            warn!("Truck {} has no route from {} to {}", id, start, destination);
        }
        let route: VecDeque<NodeId> = path.into_iter().skip(1).collect();

        let shared = Arc::new(AgentShared::new(
            id,
            AgentKind::Truck,
            ActorState::Vehicle(VehicleState::Moving),
        ));
        shared.update(|report| {
            report.position = ctx.graph().node(start).map(|n| n.position);
            report.destination = ctx.graph().node(destination).map(|n| n.position);
            report.remaining_route = route.len();
        });

        Self {
            shared,
            ctx,
            start,
            destination,
            route,
            front: None,
            rear: None,
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

    fn sleep(&self, duration: Duration) -> bool {
        self.shared.stop_signal().sleep(duration)
    }

    fn enter_start(&mut self) -> bool {
        let Some(node) = self.ctx.graph().node(self.start) else {
            return false;
        };
        loop {
            if let Some(lease) = node.try_lease(self.id()) {
                self.front = Some(lease);
                return true;
            }
            self.set_state(VehicleState::Waiting);
            if !self.sleep(self.ctx.motion().retry) {
                return false;
            }
        }
    }

    /// Whether any cell the next move touches shows red
    fn red_in_window(&self, next: NodeId) -> bool {
        let cells = [
            Some(next),
            self.front.as_ref().map(NodeLease::node),
            self.rear.as_ref().map(NodeLease::node),
        ];
        cells.into_iter().flatten().any(|node| {
            self.ctx
                .graph()
                .controller_at(node)
                .and_then(|controller| {
                    self.ctx
                        .observed_phase(controller, self.shared.stop_signal())
                })
                == Some(LightPhase::Red)
        })
    }

    fn drive(&mut self) {
        while !self.shared.is_stop_requested() {
            let Some(&next) = self.route.front() else {
                break;
            };
            let Some(node) = self.ctx.graph().node(next) else {
                warn!("Truck {} route references missing {}", self.id(), next);
                break;
            };

            if self.red_in_window(next) {
                self.set_state(VehicleState::WaitingSemaphore);
                debug!("Truck {} held by a red light before {}", self.id(), next);
                if !self.sleep(self.ctx.motion().signal_poll) {
                    break;
                }
                continue;
            }

            let Some(lease) = node.try_lease(self.id()) else {
                if self.rear.is_some() {
                    self.set_state(VehicleState::WaitingDoubleResource);
                } else {
                    self.set_state(VehicleState::Waiting);
                }
                if !self.sleep(self.ctx.motion().retry) {
                    break;
                }
                continue;
            };

            self.route.pop_front();
            let front_position = lease.position();
            // The new front is held before the old rear is dropped
            let old_front = self.front.replace(lease);
            self.rear = old_front;
            let rear_position = self.rear.as_ref().map(NodeLease::position);
            let remaining = self.route.len();
            self.shared.update(|report| {
                report.position = Some(front_position);
                report.rear = rear_position;
                report.remaining_route = remaining;
            });
            self.set_state(VehicleState::Moving);
            debug!(
                "Truck {} moved: front {}, rear {:?}",
                self.id(),
                front_position,
                rear_position
            );

            if self.obey_lights() == Wakeup::Halted {
                break;
            }
            if !self.sleep(self.ctx.motion().step) {
                break;
            }
            if next == self.destination {
                self.set_state(VehicleState::Finished);
                info!("Truck {} reached destination {}", self.id(), next);
                break;
            }
        }
    }

    /// Wait out a red on the lights under the front and the rear
    fn obey_lights(&self) -> Wakeup {
        let lights: Vec<Arc<TrafficLight>> = [self.front.as_ref(), self.rear.as_ref()]
            .into_iter()
            .flatten()
            .filter_map(|lease| self.ctx.light_at(lease.node()).cloned())
            .collect();

        let any_red = lights
            .iter()
            .any(|light| {
                self.ctx
                    .observed_phase(light.id(), self.shared.stop_signal())
                    == Some(LightPhase::Red)
            });
        if !any_red {
            return Wakeup::Proceed;
        }

        self.set_state(VehicleState::WaitingSemaphore);
        info!("Truck {} waiting for green", self.id());
        for light in &lights {
            if light.phase() == LightPhase::Red
                && light.wait_for_green(self.shared.stop_signal()) == Wakeup::Halted
            {
                return Wakeup::Halted;
            }
        }
        self.set_state(VehicleState::Moving);
        Wakeup::Proceed
    }
}

impl Agent for Truck {
    fn shared(&self) -> &Arc<AgentShared> {
        &self.shared
    }

    fn run(mut self: Box<Self>) {
        if self.route.is_empty() {
            self.set_state(VehicleState::Finished);
            self.shared.mark_exit(FINISHED);
            return;
        }

        info!("Truck {} started at {}", self.id(), self.start);
        if self.enter_start() {
            self.drive();
        }

        self.front = None;
        self.rear = None;
        self.shared.update(|report| {
            report.position = None;
            report.rear = None;
        });
        self.shared.mark_exit(FINISHED);
        if self.shared.state() != FINISHED {
            info!("Truck {} stopped", self.id());
        }
    }
}
