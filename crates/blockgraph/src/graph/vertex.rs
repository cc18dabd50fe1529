//! Vertex and edge records

use serde::{Deserialize, Serialize};

use super::GraphTypes;

/// Outgoing edge: target identifier plus edge value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Edge<G: GraphTypes> {
    pub target: G::Id,
    pub value: G::Edge,
}

impl<G: GraphTypes> Edge<G> {
    pub fn new(target: G::Id, value: G::Edge) -> Self {
        Self { target, value }
    }
}

/// A vertex owned by exactly one partition
///
/// Only the compute logic of the owning worker mutates a vertex. Any effect
/// on another vertex goes through messages or mutation requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Vertex<G: GraphTypes> {
    id: G::Id,
    value: G::Value,
    edges: Vec<Edge<G>>,
    halted: bool,
}

impl<G: GraphTypes> Vertex<G> {
    /// Create an active vertex without edges
    pub fn new(id: G::Id, value: G::Value) -> Self {
        Self {
            id,
            value,
            edges: Vec::new(),
            halted: false,
        }
    }

    pub fn with_edges(mut self, edges: impl IntoIterator<Item = Edge<G>>) -> Self {
        self.edges.extend(edges);
        self
    }

    pub fn id(&self) -> &G::Id {
        &self.id
    }

    pub fn value(&self) -> &G::Value {
        &self.value
    }

    pub fn value_mut(&mut self) -> &mut G::Value {
        &mut self.value
    }

    pub fn set_value(&mut self, value: G::Value) {
        self.value = value;
    }

    pub fn edges(&self) -> &[Edge<G>] {
        &self.edges
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    /// Targets of all outgoing edges
    pub fn targets(&self) -> impl Iterator<Item = &G::Id> + '_ {
        self.edges.iter().map(|edge| &edge.target)
    }

    pub fn add_edge(&mut self, edge: Edge<G>) {
        self.edges.push(edge);
    }

    /// Remove every edge pointing at `target`, returning how many were removed
    pub fn remove_edges(&mut self, target: &G::Id) -> usize {
        let before = self.edges.len();
        self.edges.retain(|edge| &edge.target != target);
        before - self.edges.len()
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn vote_to_halt(&mut self) {
        self.halted = true;
    }

    pub fn wake_up(&mut self) {
        self.halted = false;
    }
}
