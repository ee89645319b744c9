//! Road graph for routing and occupancy
//!
//! Nodes carry their own occupancy lock; the directed petgraph mirror is
//! used for shortest paths and reachability. The graph is built once and
//! only node occupancy changes afterwards.

use anyhow::{bail, Context, Result};
use petgraph::algo::astar;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, EdgeRef};
use rand::seq::IndexedRandom;
use rand::Rng;

use super::node::TrafficNode;
use super::types::{AgentId, ControllerId, EdgeId, NodeId, NodeType, Position};

/// A directed, weighted connection between two nodes
#[derive(Debug, Clone)]
pub struct TrafficEdge {
    pub id: EdgeId,
    pub from: NodeId,
    pub to: NodeId,
    /// Path weight
    pub length: u32,
    pub has_sidewalk: bool,
}

/// Edge data stored in the petgraph mirror
#[derive(Debug, Clone, Copy)]
struct RoadEdge {
    edge_id: EdgeId,
    weight: u32,
}

/// Read-only view of one node's occupancy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeOccupancy {
    pub node: NodeId,
    pub position: Position,
    pub node_type: NodeType,
    pub occupant: Option<AgentId>,
}

/// The road graph plus a grid lookup index
#[derive(Debug)]
pub struct RoadGraph {
    width: i32,
    height: i32,
    nodes: Vec<TrafficNode>,
    edges: Vec<TrafficEdge>,
    /// Directed mirror for routing; node index i is `NodeId(i)`
    graph: DiGraph<NodeId, RoadEdge>,
    /// Row-major position -> node lookup
    grid: Vec<Option<NodeId>>,
}

impl RoadGraph {
    /// Create an empty graph covering a `width` x `height` grid
    pub fn new(width: i32, height: i32) -> Self {
        let cells = (width.max(0) as usize) * (height.max(0) as usize);
        Self {
            width: width.max(0),
            height: height.max(0),
            nodes: Vec::new(),
            edges: Vec::new(),
            graph: DiGraph::new(),
            grid: vec![None; cells],
        }
    }

    /// Build the standard one-way grid
    ///
    /// Intersections sit on even/even coordinates, crosswalks on odd/odd and
    /// streets everywhere else. Even intersection rows run west to east, odd
    /// rows east to west; even columns run north to south, odd columns south
    /// to north. Every intersection-to-intersection link goes through the
    /// street node between them. Lights are placed on alternating
    /// intersections, numbered in row-major order.
    pub fn build_grid(width: i32, height: i32) -> Result<Self> {
        if width < 1 || height < 1 {
            bail!("Grid dimensions must be positive, got {}x{}", width, height);
        }

        let mut map = Self::new(width, height);

        for y in 0..height {
            for x in 0..width {
                let node_type = match (x % 2 == 0, y % 2 == 0) {
                    (true, true) => NodeType::Intersection,
                    (false, false) => NodeType::Crosswalk,
                    _ => NodeType::Street,
                };
                map.add_node(Position::new(x, y), node_type)?;
            }
        }

        // Horizontal links along intersection rows
        for y in (0..height).step_by(2) {
            let eastbound = (y / 2) % 2 == 0;
            for x in (0..width - 2).step_by(2) {
                let (from, to) = if eastbound { (x, x + 2) } else { (x + 2, x) };
                map.link_through_street(Position::new(from, y), Position::new(to, y))?;
            }
        }

        // Vertical links along intersection columns
        for x in (0..width).step_by(2) {
            let southbound = (x / 2) % 2 == 0;
            for y in (0..height - 2).step_by(2) {
                let (from, to) = if southbound { (y, y + 2) } else { (y + 2, y) };
                map.link_through_street(Position::new(x, from), Position::new(x, to))?;
            }
        }

        let mut next_controller = 0;
        for y in (0..height).step_by(2) {
            for x in (0..width).step_by(2) {
                if ((x / 2) + (y / 2)) % 2 != 0 {
                    continue;
                }
                let node = map
                    .node_at(Position::new(x, y))
                    .context("Intersection missing from grid")?;
                map.attach_controller(node, ControllerId(next_controller))?;
                next_controller += 1;
            }
        }

        Ok(map)
    }

    fn link_through_street(&mut self, from: Position, to: Position) -> Result<()> {
        let middle = Position::new((from.x + to.x) / 2, (from.y + to.y) / 2);
        let from_id = self.node_at(from).context("Link start missing")?;
        let street_id = self.node_at(middle).context("Link street missing")?;
        let to_id = self.node_at(to).context("Link end missing")?;
        self.add_edge(from_id, street_id, from.manhattan(&middle))?;
        self.add_edge(street_id, to_id, middle.manhattan(&to))?;
        Ok(())
    }

    fn grid_index(&self, position: Position) -> Option<usize> {
        if position.x < 0 || position.y < 0 || position.x >= self.width || position.y >= self.height
        {
            return None;
        }
        Some((position.y * self.width + position.x) as usize)
    }

    /// Add a node at a free grid position
    pub fn add_node(&mut self, position: Position, node_type: NodeType) -> Result<NodeId> {
        let index = self
            .grid_index(position)
            .with_context(|| format!("Position {} is outside the grid", position))?;
        if let Some(existing) = self.grid[index] {
            bail!("Position {} already holds {}", position, existing);
        }

        let id = NodeId(self.nodes.len());
        self.nodes.push(TrafficNode::new(id, position, node_type));
        self.graph.add_node(id);
        self.grid[index] = Some(id);
        Ok(id)
    }

    /// Add a directed edge between two existing nodes
    pub fn add_edge(&mut self, from: NodeId, to: NodeId, length: u32) -> Result<EdgeId> {
        if from.0 >= self.nodes.len() || to.0 >= self.nodes.len() {
            bail!("Edge {} -> {} references an unknown node", from, to);
        }

        let id = EdgeId(self.edges.len());
        self.edges.push(TrafficEdge {
            id,
            from,
            to,
            length,
            has_sidewalk: true,
        });
        self.graph.add_edge(
            NodeIndex::new(from.0),
            NodeIndex::new(to.0),
            RoadEdge {
                edge_id: id,
                weight: length,
            },
        );
        self.nodes[from.0].outgoing.push(id);
        self.nodes[to.0].incoming.push(id);
        Ok(id)
    }

    /// Put a node under the control of a light
    pub fn attach_controller(&mut self, node: NodeId, controller: ControllerId) -> Result<()> {
        let node = self
            .nodes
            .get_mut(node.0)
            .with_context(|| format!("{} not found", node))?;
        node.controller = Some(controller);
        Ok(())
    }

    pub fn node(&self, id: NodeId) -> Option<&TrafficNode> {
        self.nodes.get(id.0)
    }

    pub fn nodes(&self) -> &[TrafficNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[TrafficEdge] {
        &self.edges
    }

    pub fn edge(&self, id: EdgeId) -> Option<&TrafficEdge> {
        self.edges.get(id.0)
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    /// O(1) grid lookup; `None` off the grid or on an empty cell
    pub fn node_at(&self, position: Position) -> Option<NodeId> {
        self.grid_index(position).and_then(|i| self.grid[i])
    }

    /// Finds the edge leading from one node to another
    pub fn edge_between(&self, from: NodeId, to: NodeId) -> Option<EdgeId> {
        self.graph
            .edges(NodeIndex::new(from.0))
            .find(|edge| edge.target().index() == to.0)
            .map(|edge| edge.weight().edge_id)
    }

    /// Light governing a node, if any
    pub fn controller_at(&self, node: NodeId) -> Option<ControllerId> {
        self.node(node).and_then(|n| n.controller)
    }

    /// All nodes that carry a light, paired with the light's id
    pub fn controller_nodes(&self) -> Vec<(ControllerId, NodeId)> {
        self.nodes
            .iter()
            .filter_map(|n| n.controller.map(|c| (c, n.id)))
            .collect()
    }

    /// Shortest path by edge length (Dijkstra: A* with a null heuristic)
    ///
    /// The path includes both endpoints. `[start]` when `start == end`, empty
    /// when `end` cannot be reached.
    pub fn find_shortest_path(&self, start: NodeId, end: NodeId) -> Vec<NodeId> {
        if self.node(start).is_none() || self.node(end).is_none() {
            return Vec::new();
        }
        if start == end {
            return vec![start];
        }

        let goal = NodeIndex::new(end.0);
        astar(
            &self.graph,
            NodeIndex::new(start.0),
            |node| node == goal,
            |edge| edge.weight().weight,
            |_| 0,
        )
        .map(|(_, path)| path.into_iter().map(|index| NodeId(index.index())).collect())
        .unwrap_or_default()
    }

    /// Intersections that have at least one way out
    pub fn valid_start_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.node_type == NodeType::Intersection && !n.outgoing.is_empty())
            .map(|n| n.id)
            .collect()
    }

    /// Intersections reachable from `start`, excluding `start` itself
    pub fn valid_end_nodes(&self, start: NodeId) -> Vec<NodeId> {
        if self.node(start).is_none() {
            return Vec::new();
        }

        let mut bfs = Bfs::new(&self.graph, NodeIndex::new(start.0));
        let mut reachable = Vec::new();
        while let Some(index) = bfs.next(&self.graph) {
            let id = NodeId(index.index());
            if id != start && self.nodes[id.0].node_type == NodeType::Intersection {
                reachable.push(id);
            }
        }
        reachable
    }

    pub fn random_start_node<R: Rng + ?Sized>(&self, rng: &mut R) -> Option<NodeId> {
        self.valid_start_nodes().choose(rng).copied()
    }

    pub fn random_end_node<R: Rng + ?Sized>(&self, start: NodeId, rng: &mut R) -> Option<NodeId> {
        self.valid_end_nodes(start).choose(rng).copied()
    }

    /// Nodes currently held by `agent`
    pub fn held_by(&self, agent: AgentId) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|n| n.occupant() == Some(agent))
            .map(|n| n.id)
            .collect()
    }

    /// Snapshot of every node's occupant, one short lock per node
    pub fn occupancy(&self) -> Vec<NodeOccupancy> {
        self.nodes
            .iter()
            .map(|n| NodeOccupancy {
                node: n.id,
                position: n.position,
                node_type: n.node_type,
                occupant: n.occupant(),
            })
            .collect()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
}
