//! Road graph nodes and their exclusive-occupancy lock
//!
//! A node is held by at most one actor at a time. Acquisition never blocks:
//! callers retry on their own schedule. A [`NodeLease`] ties a successful
//! acquisition to a value so the node is released whenever the lease drops.

use log::{debug, warn};
use std::sync::{Arc, Mutex};

use super::types::{AgentId, ControllerId, EdgeId, NodeId, NodeType, Position};

/// The occupancy lock of a single node
#[derive(Debug)]
pub struct NodeLock {
    node: NodeId,
    occupant: Mutex<Option<AgentId>>,
}

impl NodeLock {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            occupant: Mutex::new(None),
        }
    }

    /// Try to take the node for `agent`; succeeds only if the node is free
    pub fn try_acquire(&self, agent: AgentId) -> bool {
        let mut occupant = self.occupant.lock().unwrap_or_else(|e| e.into_inner());
        match *occupant {
            None => {
                *occupant = Some(agent);
                debug!("Agent {} acquired {}", agent, self.node);
                true
            }
            Some(_) => false,
        }
    }

    /// Release the node if `agent` holds it
    ///
    /// Releasing a node that is free or held by someone else is a no-op.
    /// Returns whether a hold was actually cleared.
    pub fn release(&self, agent: AgentId) -> bool {
        let mut occupant = self.occupant.lock().unwrap_or_else(|e| e.into_inner());
        match *occupant {
            Some(current) if current == agent => {
                *occupant = None;
                debug!("Agent {} released {}", agent, self.node);
                true
            }
            Some(current) => {
                warn!(
                    "Agent {} tried to release {} held by agent {}",
                    agent, self.node, current
                );
                false
            }
            None => false,
        }
    }

    pub fn occupant(&self) -> Option<AgentId> {
        *self.occupant.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// A point in the road graph
#[derive(Debug)]
pub struct TrafficNode {
    pub id: NodeId,
    pub position: Position,
    pub node_type: NodeType,
    pub outgoing: Vec<EdgeId>,
    pub incoming: Vec<EdgeId>,
    /// Light governing this node, if any
    pub controller: Option<ControllerId>,
    lock: Arc<NodeLock>,
}

impl TrafficNode {
    pub fn new(id: NodeId, position: Position, node_type: NodeType) -> Self {
        Self {
            id,
            position,
            node_type,
            outgoing: Vec::new(),
            incoming: Vec::new(),
            controller: None,
            lock: Arc::new(NodeLock::new(id)),
        }
    }

    pub fn try_acquire(&self, agent: AgentId) -> bool {
        self.lock.try_acquire(agent)
    }

    pub fn release(&self, agent: AgentId) -> bool {
        self.lock.release(agent)
    }

    pub fn occupant(&self) -> Option<AgentId> {
        self.lock.occupant()
    }

    pub fn is_occupied(&self) -> bool {
        self.occupant().is_some()
    }

    /// Acquire the node and wrap the hold in a lease
    pub fn try_lease(&self, agent: AgentId) -> Option<NodeLease> {
        if self.lock.try_acquire(agent) {
            Some(NodeLease {
                lock: Arc::clone(&self.lock),
                agent,
                position: self.position,
            })
        } else {
            None
        }
    }
}

/// An acquired node; dropping the lease releases it
#[derive(Debug)]
pub struct NodeLease {
    lock: Arc<NodeLock>,
    agent: AgentId,
    position: Position,
}

impl NodeLease {
    pub fn node(&self) -> NodeId {
        self.lock.node
    }

    pub fn position(&self) -> Position {
        self.position
    }
}

impl Drop for NodeLease {
    fn drop(&mut self) {
        self.lock.release(self.agent);
    }
}
