//! Common actor surface: start, request stop, report state
//!
//! Each actor kind keeps its own state machine and runs it on a dedicated
//! thread. What observers may see of an actor lives in [`AgentShared`],
//! updated by the actor and read through short-lived locks.

use log::error;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use super::stop_signal::StopSignal;
use super::types::{ActorState, AgentId, AgentKind, AgentStatus, Position};

/// What an actor reports about itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSnapshot {
    pub id: AgentId,
    pub kind: AgentKind,
    pub status: AgentStatus,
    pub state: ActorState,
    /// Front position for vehicles, waiting spot for pedestrians
    pub position: Option<Position>,
    /// Trucks only
    pub rear: Option<Position>,
    pub destination: Option<Position>,
    pub remaining_route: usize,
}

/// The part of an actor visible from outside its thread
#[derive(Debug)]
pub struct AgentShared {
    id: AgentId,
    kind: AgentKind,
    stop: StopSignal,
    report: Mutex<AgentSnapshot>,
}

impl AgentShared {
    pub fn new(id: AgentId, kind: AgentKind, state: ActorState) -> Self {
        Self {
            id,
            kind,
            stop: StopSignal::new(),
            report: Mutex::new(AgentSnapshot {
                id,
                kind,
                status: AgentStatus::Active,
                state,
                position: None,
                rear: None,
                destination: None,
                remaining_route: 0,
            }),
        }
    }

    fn lock_report(&self) -> MutexGuard<'_, AgentSnapshot> {
        self.report.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn id(&self) -> AgentId {
        self.id
    }

    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    pub fn stop_signal(&self) -> &StopSignal {
        &self.stop
    }

    pub fn request_stop(&self) {
        self.stop.stop();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_stopped()
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        self.lock_report().clone()
    }

    pub fn state(&self) -> ActorState {
        self.lock_report().state
    }

    pub fn status(&self) -> AgentStatus {
        self.lock_report().status
    }

    pub fn update(&self, apply: impl FnOnce(&mut AgentSnapshot)) {
        apply(&mut self.lock_report());
    }

    pub fn set_state(&self, state: ActorState) {
        self.lock_report().state = state;
    }

    /// Record the end of the run loop
    ///
    /// Actors that did not finish their journey are reported as stopped.
    pub fn mark_exit(&self, finished_state: ActorState) {
        let mut report = self.lock_report();
        if report.status != AgentStatus::Active {
            return;
        }
        if report.state == finished_state {
            report.status = AgentStatus::Finished;
        } else {
            report.status = AgentStatus::Stopped;
        }
    }
}

/// An actor's state machine
pub trait Agent: Send {
    fn shared(&self) -> &Arc<AgentShared>;

    /// Run to completion or until stopped; every held resource is released
    /// before this returns
    fn run(self: Box<Self>);
}

/// A started actor
#[derive(Debug)]
pub struct AgentHandle {
    shared: Arc<AgentShared>,
    thread: Option<JoinHandle<()>>,
}

impl AgentHandle {
    /// Start an actor on its own thread
    pub fn spawn(agent: Box<dyn Agent>) -> io::Result<Self> {
        let shared = Arc::clone(agent.shared());
        let name = format!("{:?}-{}", shared.kind(), shared.id()).to_lowercase();
        let thread = thread::Builder::new().name(name).spawn(move || agent.run())?;
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    pub fn id(&self) -> AgentId {
        self.shared.id()
    }

    pub fn kind(&self) -> AgentKind {
        self.shared.kind()
    }

    pub fn shared(&self) -> &Arc<AgentShared> {
        &self.shared
    }

    pub fn request_stop(&self) {
        self.shared.request_stop();
    }

    pub fn snapshot(&self) -> AgentSnapshot {
        self.shared.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Wait for the actor's thread; `false` if it panicked
    pub fn join(&mut self) -> bool {
        let Some(thread) = self.thread.take() else {
            return true;
        };
        match thread.join() {
            Ok(()) => true,
            Err(_) => {
                error!("{:?} {} panicked", self.shared.kind(), self.shared.id());
                self.shared.update(|report| report.status = AgentStatus::Stopped);
                false
            }
        }
    }
}
