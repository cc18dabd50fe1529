//! Topology mutations
//!
//! Pieces never change the topology directly. They file [`Mutation`] requests
//! which are buffered for the rest of the superstep, routed to the worker
//! owning the affected vertex, merged with the requests of every other worker
//! and applied at the boundary in a fixed order:
//!
//! ```text
//! RemoveEdge -> RemoveVertex -> CreateVertex -> AddEdge
//! ```
//!
//! Within one kind, requests are ordered by (vertex id, target id, encoded
//! bytes). The resulting graph is therefore independent of the order in which
//! requests arrived.

use std::collections::HashMap;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{Edge, GraphTypes, PartitionMap, PartitionStore, Vertex, WorkerId};
use crate::codec;
use crate::error::{BspError, Result};

/// A requested change to the graph topology
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub enum Mutation<G: GraphTypes> {
    /// Create a vertex; fails if it already exists
    CreateVertex { id: G::Id, value: G::Value },
    /// Remove a vertex together with its outgoing edges
    RemoveVertex { id: G::Id },
    /// Add an edge to an existing vertex
    AddEdge { source: G::Id, edge: Edge<G> },
    /// Remove every edge from `source` to `target`
    RemoveEdge { source: G::Id, target: G::Id },
}

impl<G: GraphTypes> Mutation<G> {
    /// The vertex whose owner applies this mutation
    pub fn vertex(&self) -> &G::Id {
        match self {
            Mutation::CreateVertex { id, .. } | Mutation::RemoveVertex { id } => id,
            Mutation::AddEdge { source, .. } | Mutation::RemoveEdge { source, .. } => source,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Mutation::RemoveEdge { .. } => 0,
            Mutation::RemoveVertex { .. } => 1,
            Mutation::CreateVertex { .. } => 2,
            Mutation::AddEdge { .. } => 3,
        }
    }

    fn target(&self) -> Option<&G::Id> {
        match self {
            Mutation::AddEdge { edge, .. } => Some(&edge.target),
            Mutation::RemoveEdge { target, .. } => Some(target),
            _ => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Mutation::CreateVertex { .. } => "create_vertex",
            Mutation::RemoveVertex { .. } => "remove_vertex",
            Mutation::AddEdge { .. } => "add_edge",
            Mutation::RemoveEdge { .. } => "remove_edge",
        }
    }
}

/// A mutation tagged with the superstep that requested it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct MutationRecord<G: GraphTypes> {
    pub superstep: u64,
    pub mutation: Mutation<G>,
}

impl<G: GraphTypes> MutationRecord<G> {
    pub fn new(superstep: u64, mutation: Mutation<G>) -> Self {
        Self {
            superstep,
            mutation,
        }
    }
}

/// Per-worker buffer of mutation requests for the running superstep
///
/// Safe to fill from every compute thread at once.
pub struct MutationBuffer<G: GraphTypes> {
    records: Mutex<Vec<MutationRecord<G>>>,
}

impl<G: GraphTypes> Default for MutationBuffer<G> {
    fn default() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
        }
    }
}

impl<G: GraphTypes> MutationBuffer<G> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, record: MutationRecord<G>) {
        self.records.lock().push(record);
    }

    pub fn extend(&self, records: impl IntoIterator<Item = MutationRecord<G>>) {
        self.records.lock().extend(records);
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    /// Take every buffered record, grouped by the worker owning its vertex
    pub fn drain_by_owner(&self, map: &PartitionMap) -> HashMap<WorkerId, Vec<MutationRecord<G>>> {
        let records = std::mem::take(&mut *self.records.lock());
        let mut routed: HashMap<WorkerId, Vec<MutationRecord<G>>> = HashMap::new();
        for record in records {
            routed
                .entry(map.owner_of(record.mutation.vertex()))
                .or_default()
                .push(record);
        }
        routed
    }
}

/// What applying a batch of mutations did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MutationOutcome {
    pub vertices_created: u64,
    pub vertices_removed: u64,
    pub edges_added: u64,
    pub edges_removed: u64,
    pub skipped: u64,
}

impl MutationOutcome {
    pub fn applied(&self) -> u64 {
        self.vertices_created + self.vertices_removed + self.edges_added + self.edges_removed
    }
}

impl std::ops::AddAssign for MutationOutcome {
    fn add_assign(&mut self, other: Self) {
        self.vertices_created += other.vertices_created;
        self.vertices_removed += other.vertices_removed;
        self.edges_added += other.edges_added;
        self.edges_removed += other.edges_removed;
        self.skipped += other.skipped;
    }
}

/// Sort records into the fixed application order
pub fn sort_records<G: GraphTypes>(records: Vec<MutationRecord<G>>) -> Result<Vec<MutationRecord<G>>> {
    let mut keyed = records
        .into_iter()
        .map(|record| {
            let bytes: Bytes = codec::encode(&record.mutation)?;
            Ok((
                (
                    record.mutation.rank(),
                    record.mutation.vertex().clone(),
                    record.mutation.target().cloned(),
                    bytes,
                ),
                record,
            ))
        })
        .collect::<Result<Vec<_>>>()?;
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(keyed.into_iter().map(|(_, record)| record).collect())
}

/// Apply a merged batch to the partitions of one worker
///
/// Requests for vertices the worker does not own are skipped; they were
/// routed here by mistake. Duplicate creations and requests against missing
/// vertices are logged and skipped.
pub fn apply_batch<G: GraphTypes>(
    store: &mut PartitionStore<G>,
    map: &PartitionMap,
    worker: WorkerId,
    records: Vec<MutationRecord<G>>,
) -> Result<MutationOutcome> {
    let mut outcome = MutationOutcome::default();

    for record in sort_records(records)? {
        let MutationRecord {
            superstep,
            mutation,
        } = record;

        if map.owner_of(mutation.vertex()) != worker {
            warn!(
                %worker,
                superstep,
                vertex = ?mutation.vertex(),
                kind = mutation.kind(),
                "Skipping mutation routed to the wrong worker"
            );
            outcome.skipped += 1;
            continue;
        }

        let result = match mutation {
            Mutation::RemoveEdge { source, target } => match store.get_mut(map, &source) {
                Some(vertex) => {
                    outcome.edges_removed += vertex.remove_edges(&target) as u64;
                    Ok(())
                }
                None => Err(BspError::UnknownVertex {
                    vertex: format!("{source:?}"),
                }),
            },
            Mutation::RemoveVertex { id } => match store.remove(map, &id) {
                Some(_) => {
                    outcome.vertices_removed += 1;
                    Ok(())
                }
                None => Err(BspError::UnknownVertex {
                    vertex: format!("{id:?}"),
                }),
            },
            Mutation::CreateVertex { id, value } => {
                if store.contains(map, &id) {
                    Err(BspError::DuplicateVertex {
                        vertex: format!("{id:?}"),
                    })
                } else {
                    store.insert(map, Vertex::new(id, value));
                    outcome.vertices_created += 1;
                    Ok(())
                }
            }
            Mutation::AddEdge { source, edge } => match store.get_mut(map, &source) {
                Some(vertex) => {
                    vertex.add_edge(edge);
                    outcome.edges_added += 1;
                    Ok(())
                }
                None => Err(BspError::UnknownVertex {
                    vertex: format!("{source:?}"),
                }),
            },
        };

        if let Err(err) = result {
            warn!(%worker, superstep, error = %err, "Skipping mutation");
            outcome.skipped += 1;
        }
    }

    debug!(
        %worker,
        created = outcome.vertices_created,
        removed = outcome.vertices_removed,
        edges_added = outcome.edges_added,
        edges_removed = outcome.edges_removed,
        skipped = outcome.skipped,
        "Applied mutations"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Types;

    type G = Types<u64, i32, ()>;

    fn store_with(map: &PartitionMap, ids: &[u64]) -> PartitionStore<G> {
        let mut store = PartitionStore::for_worker(map, WorkerId(0));
        for id in ids {
            store.insert(map, Vertex::new(*id, 0));
        }
        store
    }

    #[test]
    fn test_remove_then_create_replaces_vertex() {
        let map = PartitionMap::new(1, 2);
        let mut store = store_with(&map, &[1]);
        store
            .get_mut(&map, &1)
            .unwrap()
            .add_edge(Edge::new(2, ()));

        // Filed in reverse order; removal still runs first
        let records = vec![
            MutationRecord::new(0, Mutation::CreateVertex { id: 1, value: 9 }),
            MutationRecord::new(0, Mutation::RemoveVertex { id: 1 }),
        ];
        let outcome = apply_batch(&mut store, &map, WorkerId(0), records).unwrap();

        assert_eq!(outcome.vertices_removed, 1);
        assert_eq!(outcome.vertices_created, 1);
        let vertex = store.get(&map, &1).unwrap();
        assert_eq!(*vertex.value(), 9);
        assert_eq!(vertex.num_edges(), 0);
    }

    #[test]
    fn test_edge_to_new_vertex_in_same_batch() {
        let map = PartitionMap::new(1, 2);
        let mut store = store_with(&map, &[]);

        let records = vec![
            MutationRecord::new(3, Mutation::AddEdge {
                source: 5,
                edge: Edge::new(6, ()),
            }),
            MutationRecord::new(3, Mutation::CreateVertex { id: 5, value: 1 }),
        ];
        let outcome = apply_batch(&mut store, &map, WorkerId(0), records).unwrap();

        assert_eq!(outcome.applied(), 2);
        assert_eq!(store.get(&map, &5).unwrap().num_edges(), 1);
    }

    #[test]
    fn test_duplicate_and_unknown_are_skipped() {
        let map = PartitionMap::new(1, 2);
        let mut store = store_with(&map, &[1]);

        let records = vec![
            MutationRecord::new(0, Mutation::CreateVertex { id: 1, value: 9 }),
            MutationRecord::new(0, Mutation::RemoveVertex { id: 7 }),
            MutationRecord::new(0, Mutation::RemoveEdge {
                source: 8,
                target: 1,
            }),
        ];
        let outcome = apply_batch(&mut store, &map, WorkerId(0), records).unwrap();

        assert_eq!(outcome.skipped, 3);
        assert_eq!(outcome.applied(), 0);
        assert_eq!(*store.get(&map, &1).unwrap().value(), 0);
    }

    #[test]
    fn test_duplicate_creates_keep_smallest_encoding() {
        let map = PartitionMap::new(1, 1);
        let mut a = store_with(&map, &[]);
        let mut b = store_with(&map, &[]);

        let first = MutationRecord::new(0, Mutation::CreateVertex { id: 4, value: 20 });
        let second = MutationRecord::new(0, Mutation::CreateVertex { id: 4, value: 10 });
        apply_batch(&mut a, &map, WorkerId(0), vec![first.clone(), second.clone()]).unwrap();
        apply_batch(&mut b, &map, WorkerId(0), vec![second, first]).unwrap();

        assert_eq!(a.get(&map, &4).unwrap().value(), b.get(&map, &4).unwrap().value());
    }

    #[test]
    fn test_buffer_routes_by_owner() {
        let map = PartitionMap::new(2, 8);
        let buffer = MutationBuffer::<G>::new();
        for id in 0..32u64 {
            buffer.push(MutationRecord::new(0, Mutation::RemoveVertex { id }));
        }
        assert_eq!(buffer.len(), 32);

        let routed = buffer.drain_by_owner(&map);
        assert!(buffer.is_empty());
        for (worker, records) in routed {
            assert!(records
                .iter()
                .all(|r| map.owner_of(r.mutation.vertex()) == worker));
        }
    }
}
