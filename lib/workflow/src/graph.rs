//! Execution graph built from a workflow definition using petgraph.
//!
//! The graph is read-only once built. Topological layering is computed on
//! first use and cached; adding a node or an edge drops the cache.

use crate::definition::WorkflowDefinition;
use crate::edge::Edge;
use crate::error::GraphError;
use crate::node::{NodeDefinition, NodeId};
use petgraph::Direction;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::OnceLock;

type Layers = Vec<Vec<NodeId>>;

/// Directed acyclic graph of the nodes of one workflow.
#[derive(Debug, Default)]
pub struct ExecutionGraph {
    graph: DiGraph<NodeDefinition, Edge>,
    /// Map from NodeId to petgraph's NodeIndex for O(1) lookup.
    node_index_map: HashMap<NodeId, NodeIndex>,
    layers: OnceLock<Result<Layers, GraphError>>,
}

impl ExecutionGraph {
    /// Creates an empty graph.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a graph from the nodes and edges of a definition.
    ///
    /// # Errors
    ///
    /// Returns an error if a node ID repeats or an edge is invalid. The graph
    /// is not validated; call [`ExecutionGraph::validate`] for that.
    pub fn from_definition(definition: &WorkflowDefinition) -> Result<Self, GraphError> {
        let mut graph = Self::new();
        for node in &definition.nodes {
            graph.add_node(node.clone())?;
        }
        for edge in &definition.edges {
            graph.add_edge(edge.clone())?;
        }
        Ok(graph)
    }

    /// Adds a node.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateNode` if a node with the same ID exists.
    pub fn add_node(&mut self, node: NodeDefinition) -> Result<(), GraphError> {
        if self.node_index_map.contains_key(&node.id) {
            return Err(GraphError::DuplicateNode { node_id: node.id });
        }
        let node_id = node.id.clone();
        let index = self.graph.add_node(node);
        self.node_index_map.insert(node_id, index);
        self.layers = OnceLock::new();
        Ok(())
    }

    /// Adds an edge between two existing nodes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidEdge` if either endpoint is missing or an edge between
    /// the same source and target already exists.
    pub fn add_edge(&mut self, edge: Edge) -> Result<(), GraphError> {
        let invalid = |reason: String| GraphError::InvalidEdge {
            source: edge.source.clone(),
            target: edge.target.clone(),
            reason,
        };
        let lookup = |node_id: &NodeId| {
            self.node_index_map.get(node_id).copied().ok_or_else(|| {
                invalid(
                    GraphError::NodeNotFound {
                        node_id: node_id.clone(),
                    }
                    .to_string(),
                )
            })
        };

        let source = lookup(&edge.source)?;
        let target = lookup(&edge.target)?;

        if self.graph.find_edge(source, target).is_some() {
            return Err(invalid("edge already exists".to_string()));
        }

        self.graph.add_edge(source, target, edge);
        self.layers = OnceLock::new();
        Ok(())
    }

    /// Returns the node definition with the given ID.
    #[must_use]
    pub fn node(&self, node_id: &NodeId) -> Option<&NodeDefinition> {
        let index = self.node_index_map.get(node_id)?;
        self.graph.node_weight(*index)
    }

    /// Returns all node IDs in insertion order.
    #[must_use]
    pub fn node_ids(&self) -> Vec<NodeId> {
        self.graph.node_weights().map(|n| n.id.clone()).collect()
    }

    /// Returns all nodes in insertion order.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeDefinition> {
        self.graph.node_weights()
    }

    /// Returns the number of nodes in the graph.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Returns the number of edges in the graph.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Returns the IDs of the downstream neighbours, sorted.
    #[must_use]
    pub fn successors(&self, node_id: &NodeId) -> Vec<NodeId> {
        self.neighbours(node_id, Direction::Outgoing)
    }

    /// Returns the IDs of the upstream neighbours, sorted.
    #[must_use]
    pub fn predecessors(&self, node_id: &NodeId) -> Vec<NodeId> {
        self.neighbours(node_id, Direction::Incoming)
    }

    /// Returns the edges ending at the node, sorted by edge ID.
    #[must_use]
    pub fn incoming_edges(&self, node_id: &NodeId) -> Vec<&Edge> {
        self.edges(node_id, Direction::Incoming)
    }

    /// Returns the edges starting at the node, sorted by edge ID.
    #[must_use]
    pub fn outgoing_edges(&self, node_id: &NodeId) -> Vec<&Edge> {
        self.edges(node_id, Direction::Outgoing)
    }

    /// Number of incoming edges; zero for unknown nodes.
    #[must_use]
    pub fn in_degree(&self, node_id: &NodeId) -> usize {
        self.degree(node_id, Direction::Incoming)
    }

    /// Number of outgoing edges; zero for unknown nodes.
    #[must_use]
    pub fn out_degree(&self, node_id: &NodeId) -> usize {
        self.degree(node_id, Direction::Outgoing)
    }

    /// Nodes without incoming edges, sorted.
    #[must_use]
    pub fn start_nodes(&self) -> Vec<NodeId> {
        self.nodes_without(Direction::Incoming)
    }

    /// Nodes without outgoing edges, sorted.
    #[must_use]
    pub fn end_nodes(&self) -> Vec<NodeId> {
        self.nodes_without(Direction::Outgoing)
    }

    /// Returns true if the graph contains a directed cycle.
    #[must_use]
    pub fn has_cycle(&self) -> bool {
        self.find_cycle().is_some()
    }

    /// Groups the nodes into layers that can run in parallel.
    ///
    /// Every node of layer `n` depends only on nodes of earlier layers. Each
    /// layer is sorted by node ID.
    ///
    /// # Errors
    ///
    /// Returns `CyclicDependency` if the graph is not acyclic.
    pub fn topological_sort(&self) -> Result<&[Vec<NodeId>], GraphError> {
        self.layers
            .get_or_init(|| self.compute_layers())
            .as_deref()
            .map_err(Clone::clone)
    }

    /// Validates the graph for execution.
    ///
    /// Checks, in order: the graph has nodes, at least one node has no
    /// incoming edges, every node is reachable from a start node, and there
    /// is no cycle. A cycle that no start node leads into is reported as
    /// unreachable.
    ///
    /// # Errors
    ///
    /// Returns the first failed check as a `GraphError`.
    pub fn validate(&self) -> Result<(), GraphError> {
        if self.graph.node_count() == 0 {
            return Err(GraphError::EmptyGraph);
        }

        let start = self.start_nodes();
        if start.is_empty() {
            return Err(GraphError::MissingTriggerNode);
        }

        let mut visited: HashSet<NodeIndex> = HashSet::new();
        let mut queue: VecDeque<NodeIndex> = start
            .iter()
            .filter_map(|id| self.node_index_map.get(id).copied())
            .collect();
        while let Some(index) = queue.pop_front() {
            if !visited.insert(index) {
                continue;
            }
            queue.extend(self.graph.neighbors_directed(index, Direction::Outgoing));
        }

        if visited.len() < self.graph.node_count() {
            let mut unreachable: Vec<NodeId> = self
                .graph
                .node_indices()
                .filter(|index| !visited.contains(index))
                .map(|index| self.graph[index].id.clone())
                .collect();
            unreachable.sort();
            return Err(GraphError::DisconnectedGraph { unreachable });
        }

        if let Some(node_id) = self.find_cycle() {
            return Err(GraphError::CyclicDependency { node_id });
        }

        Ok(())
    }

    /// Returns the longest path through the graph, from a start node to an
    /// end node.
    ///
    /// Ties are broken by the smaller node ID.
    ///
    /// # Errors
    ///
    /// Returns `CyclicDependency` if the graph is not acyclic.
    pub fn longest_path(&self) -> Result<Vec<NodeId>, GraphError> {
        let layers = self.topological_sort()?;
        let mut distance: HashMap<&NodeId, usize> = HashMap::new();
        let mut parent: HashMap<&NodeId, NodeId> = HashMap::new();

        for node_id in layers.iter().flatten() {
            let best = self
                .predecessors(node_id)
                .into_iter()
                .filter_map(|pred| distance.get(&pred).map(|d| (*d, pred)))
                .max_by(|(da, a), (db, b)| da.cmp(db).then_with(|| b.cmp(a)));

            match best {
                Some((d, pred)) => {
                    distance.insert(node_id, d + 1);
                    parent.insert(node_id, pred);
                }
                None => {
                    distance.insert(node_id, 0);
                }
            }
        }

        let Some((mut current, _)) = distance
            .iter()
            .map(|(id, d)| ((*id).clone(), *d))
            .max_by(|(a, da), (b, db)| da.cmp(db).then_with(|| b.cmp(a)))
        else {
            return Ok(Vec::new());
        };

        let mut path = vec![current.clone()];
        while let Some(pred) = parent.get(&current) {
            path.push(pred.clone());
            current = pred.clone();
        }
        path.reverse();
        Ok(path)
    }

    fn neighbours(&self, node_id: &NodeId, direction: Direction) -> Vec<NodeId> {
        let Some(&index) = self.node_index_map.get(node_id) else {
            return Vec::new();
        };
        let mut ids: Vec<NodeId> = self
            .graph
            .neighbors_directed(index, direction)
            .map(|n| self.graph[n].id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    fn edges(&self, node_id: &NodeId, direction: Direction) -> Vec<&Edge> {
        let Some(&index) = self.node_index_map.get(node_id) else {
            return Vec::new();
        };
        let mut edges: Vec<&Edge> = self
            .graph
            .edges_directed(index, direction)
            .map(|e| e.weight())
            .collect();
        edges.sort_by(|a, b| a.id.cmp(&b.id));
        edges
    }

    fn degree(&self, node_id: &NodeId, direction: Direction) -> usize {
        self.node_index_map
            .get(node_id)
            .map_or(0, |&index| self.graph.edges_directed(index, direction).count())
    }

    fn nodes_without(&self, direction: Direction) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .graph
            .node_indices()
            .filter(|&index| self.graph.edges_directed(index, direction).next().is_none())
            .map(|index| self.graph[index].id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// DFS with recursion-stack marking. Returns a node on a cycle.
    fn find_cycle(&self) -> Option<NodeId> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Unvisited,
            OnStack,
            Done,
        }

        fn visit(
            graph: &DiGraph<NodeDefinition, Edge>,
            index: NodeIndex,
            marks: &mut [Mark],
        ) -> Option<NodeIndex> {
            marks[index.index()] = Mark::OnStack;
            for next in graph.neighbors_directed(index, Direction::Outgoing) {
                match marks[next.index()] {
                    Mark::OnStack => return Some(next),
                    Mark::Unvisited => {
                        if let Some(found) = visit(graph, next, marks) {
                            return Some(found);
                        }
                    }
                    Mark::Done => {}
                }
            }
            marks[index.index()] = Mark::Done;
            None
        }

        let mut marks = vec![Mark::Unvisited; self.graph.node_count()];
        let mut roots: Vec<NodeIndex> = self.graph.node_indices().collect();
        roots.sort_by(|a, b| self.graph[*a].id.cmp(&self.graph[*b].id));

        for root in roots {
            if marks[root.index()] != Mark::Unvisited {
                continue;
            }
            if let Some(found) = visit(&self.graph, root, &mut marks) {
                return Some(self.graph[found].id.clone());
            }
        }
        None
    }

    /// Kahn's algorithm, emitting one layer per round.
    fn compute_layers(&self) -> Result<Layers, GraphError> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|index| {
                let degree = self.graph.edges_directed(index, Direction::Incoming).count();
                (index, degree)
            })
            .collect();

        let mut current: Vec<NodeIndex> = in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(index, _)| *index)
            .collect();
        let mut layers = Vec::new();
        let mut placed = 0;

        while !current.is_empty() {
            let mut next = Vec::new();
            for &index in &current {
                for edge in self.graph.edges_directed(index, Direction::Outgoing) {
                    if let Some(degree) = in_degree.get_mut(&edge.target()) {
                        *degree -= 1;
                        if *degree == 0 {
                            next.push(edge.target());
                        }
                    }
                }
            }

            let mut layer: Vec<NodeId> = current
                .iter()
                .map(|index| self.graph[*index].id.clone())
                .collect();
            layer.sort();
            placed += layer.len();
            layers.push(layer);
            current = next;
        }

        if placed < self.graph.node_count() {
            let node_id = self
                .find_cycle()
                .or_else(|| {
                    in_degree
                        .iter()
                        .filter(|(_, degree)| **degree > 0)
                        .map(|(index, _)| self.graph[*index].id.clone())
                        .min()
                })
                .unwrap_or_else(|| NodeId::new(""));
            return Err(GraphError::CyclicDependency { node_id });
        }

        Ok(layers)
    }
}
