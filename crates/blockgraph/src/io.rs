//! Graph input and output
//!
//! Every worker reads the input once before superstep 0 and keeps the
//! vertices the partition map assigns to it. After the last superstep each
//! worker hands its vertices to the output.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use crate::error::Result;
use crate::graph::{Edge, GraphTypes, Vertex, WorkerId};

/// Source of the initial vertex set
#[async_trait]
pub trait GraphInput<G: GraphTypes>: Send + Sync {
    async fn read_vertices(&self) -> Result<Vec<Vertex<G>>>;
}

/// Sink for the final vertex state
#[async_trait]
pub trait GraphOutput<G: GraphTypes>: Send + Sync {
    /// Called once on the master before any worker writes
    async fn prepare(&self) -> Result<()> {
        Ok(())
    }

    async fn write_partition(&self, worker: WorkerId, vertices: Vec<Vertex<G>>) -> Result<()>;
}

/// Fixed list of vertices
pub struct VecInput<G: GraphTypes> {
    vertices: Vec<Vertex<G>>,
}

impl<G: GraphTypes> VecInput<G> {
    pub fn new(vertices: Vec<Vertex<G>>) -> Self {
        Self { vertices }
    }
}

#[async_trait]
impl<G: GraphTypes> GraphInput<G> for VecInput<G> {
    async fn read_vertices(&self) -> Result<Vec<Vertex<G>>> {
        Ok(self.vertices.clone())
    }
}

/// In-memory graph usable as both input and output
///
/// Cheap to clone; clones share the same vertices. `prepare` clears the graph
/// so the output replaces the input once the job finishes.
pub struct TestGraph<G: GraphTypes> {
    vertices: Arc<RwLock<BTreeMap<G::Id, Vertex<G>>>>,
}

impl<G: GraphTypes> Clone for TestGraph<G> {
    fn clone(&self) -> Self {
        Self {
            vertices: Arc::clone(&self.vertices),
        }
    }
}

impl<G: GraphTypes> Default for TestGraph<G> {
    fn default() -> Self {
        Self {
            vertices: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }
}

impl<G: GraphTypes> TestGraph<G> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a vertex
    pub fn add_vertex(&self, id: G::Id, value: G::Value) -> &Self {
        self.vertices
            .write()
            .insert(id.clone(), Vertex::new(id, value));
        self
    }

    /// Add an edge, creating the source with a default value if needed
    pub fn add_edge(&self, source: G::Id, target: G::Id, value: G::Edge) -> &Self
    where
        G::Value: Default,
    {
        self.vertices
            .write()
            .entry(source.clone())
            .or_insert_with(|| Vertex::new(source, G::Value::default()))
            .add_edge(Edge::new(target, value));
        self
    }

    pub fn vertex(&self, id: &G::Id) -> Option<Vertex<G>> {
        self.vertices.read().get(id).cloned()
    }

    pub fn value(&self, id: &G::Id) -> Option<G::Value> {
        self.vertices.read().get(id).map(|vertex| vertex.value().clone())
    }

    pub fn num_vertices(&self) -> usize {
        self.vertices.read().len()
    }

    pub fn num_edges(&self) -> usize {
        self.vertices.read().values().map(Vertex::num_edges).sum()
    }

    /// Vertex ids in order
    pub fn ids(&self) -> Vec<G::Id> {
        self.vertices.read().keys().cloned().collect()
    }
}

#[async_trait]
impl<G: GraphTypes> GraphInput<G> for TestGraph<G> {
    async fn read_vertices(&self) -> Result<Vec<Vertex<G>>> {
        Ok(self.vertices.read().values().cloned().collect())
    }
}

#[async_trait]
impl<G: GraphTypes> GraphOutput<G> for TestGraph<G> {
    async fn prepare(&self) -> Result<()> {
        self.vertices.write().clear();
        Ok(())
    }

    async fn write_partition(&self, _worker: WorkerId, vertices: Vec<Vertex<G>>) -> Result<()> {
        let mut graph = self.vertices.write();
        for vertex in vertices {
            graph.insert(vertex.id().clone(), vertex);
        }
        Ok(())
    }
}
