//! Graph data model: vertices, partitions and topology mutations
//!
//! The engine is generic over a [`GraphTypes`] bundle naming the vertex
//! identifier, vertex value and edge value types. Use [`Types`] to build one
//! from three concrete types:
//!
//! ```
//! use blockgraph::graph::Types;
//!
//! type Graph = Types<u64, i64, ()>;
//! ```

use std::fmt::{self, Debug, Display};
use std::hash::Hash;
use std::marker::PhantomData;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub mod mutation;
pub mod partition;
pub mod vertex;

pub use mutation::{Mutation, MutationBuffer, MutationOutcome, MutationRecord};
pub use partition::{Partition, PartitionId, PartitionMap, PartitionMove, PartitionStore};
pub use vertex::{Edge, Vertex};

/// Requirements for vertex identifiers
pub trait VertexId:
    Clone + Eq + Ord + Hash + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> VertexId for T where
    T: Clone + Eq + Ord + Hash + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Requirements for vertex and edge values
pub trait GraphValue:
    Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> GraphValue for T where
    T: Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Bundle of the types a graph is made of
///
/// Implementors are zero-sized markers; the `Clone`/`Debug`/`PartialEq`
/// supertraits only exist so derived impls on generic containers apply.
pub trait GraphTypes: Clone + Copy + Debug + Default + PartialEq + Send + Sync + 'static {
    type Id: VertexId;
    type Value: GraphValue;
    type Edge: GraphValue;
}

/// Generic [`GraphTypes`] marker
pub struct Types<I, V, E>(PhantomData<fn() -> (I, V, E)>);

impl<I, V, E> Clone for Types<I, V, E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<I, V, E> Copy for Types<I, V, E> {}

impl<I, V, E> Default for Types<I, V, E> {
    fn default() -> Self {
        Types(PhantomData)
    }
}

impl<I, V, E> PartialEq for Types<I, V, E> {
    fn eq(&self, _other: &Self) -> bool {
        true
    }
}

impl<I, V, E> Debug for Types<I, V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Types")
    }
}

impl<I: VertexId, V: GraphValue, E: GraphValue> GraphTypes for Types<I, V, E> {
    type Id = I;
    type Value = V;
    type Edge = E;
}

/// Global graph size as of the last completed superstep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphTotals {
    pub vertices: u64,
    pub edges: u64,
}

impl std::ops::AddAssign for GraphTotals {
    fn add_assign(&mut self, other: Self) {
        self.vertices += other.vertices;
        self.edges += other.edges;
    }
}

/// Identifier of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub usize);

impl WorkerId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

impl From<usize> for WorkerId {
    fn from(index: usize) -> Self {
        WorkerId(index)
    }
}
