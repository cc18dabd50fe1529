//! Partitioning of vertices across workers
//!
//! Vertex identifiers hash into a fixed number of partitions with a seed-free
//! xxh3 hasher, so every process computes the same partition for an id. The
//! [`PartitionMap`] assigns each partition to exactly one worker; that
//! assignment is the only thing that changes when the graph is re-sharded,
//! and it only changes at a superstep boundary.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};
use tracing::debug;
use xxhash_rust::xxh3::Xxh3;

use super::{GraphTypes, Vertex, WorkerId};
use crate::config::RebalanceConfig;

/// Identifier of a hash partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PartitionId(pub u32);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "partition-{}", self.0)
    }
}

/// Partition of `id` among `num_partitions`
pub fn partition_of<I: Hash + ?Sized>(id: &I, num_partitions: u32) -> PartitionId {
    let mut hasher = Xxh3::new();
    id.hash(&mut hasher);
    PartitionId((hasher.finish() % u64::from(num_partitions.max(1))) as u32)
}

/// A partition moving from one worker to another
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMove {
    pub partition: PartitionId,
    pub from: WorkerId,
    pub to: WorkerId,
}

/// Versioned partition-to-worker assignment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMap {
    version: u64,
    num_workers: usize,
    assignment: Vec<WorkerId>,
    sizes: Vec<u64>,
}

impl PartitionMap {
    /// Round-robin assignment of `num_partitions` partitions to `num_workers`
    pub fn new(num_workers: usize, num_partitions: usize) -> Self {
        let num_workers = num_workers.max(1);
        let num_partitions = num_partitions.max(num_workers);
        Self {
            version: 0,
            num_workers,
            assignment: (0..num_partitions).map(|p| WorkerId(p % num_workers)).collect(),
            sizes: vec![0; num_partitions],
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn num_workers(&self) -> usize {
        self.num_workers
    }

    pub fn num_partitions(&self) -> usize {
        self.assignment.len()
    }

    pub fn partition_of<I: Hash + ?Sized>(&self, id: &I) -> PartitionId {
        partition_of(id, self.assignment.len() as u32)
    }

    /// Worker owning `id`; stable for the whole superstep
    pub fn owner_of<I: Hash + ?Sized>(&self, id: &I) -> WorkerId {
        self.owner_of_partition(self.partition_of(id))
    }

    pub fn owner_of_partition(&self, partition: PartitionId) -> WorkerId {
        self.assignment[partition.0 as usize]
    }

    /// Partitions currently assigned to `worker`
    pub fn partitions_of(&self, worker: WorkerId) -> Vec<PartitionId> {
        self.assignment
            .iter()
            .enumerate()
            .filter(|(_, owner)| **owner == worker)
            .map(|(p, _)| PartitionId(p as u32))
            .collect()
    }

    /// Last known vertex count of a partition
    pub fn size_of(&self, partition: PartitionId) -> u64 {
        self.sizes[partition.0 as usize]
    }

    /// Vertex count per worker according to the last known partition sizes
    pub fn worker_loads(&self) -> Vec<u64> {
        let mut loads = vec![0u64; self.num_workers];
        for (p, owner) in self.assignment.iter().enumerate() {
            loads[owner.0] += self.sizes[p];
        }
        loads
    }

    /// Recompute the map after a superstep's mutations were applied
    ///
    /// `sizes` holds the post-mutation vertex count of every partition as
    /// reported by its owner. The returned map carries the new sizes and, when
    /// re-balancing is enabled and the spread of worker loads exceeds the
    /// threshold, a new assignment with a bumped version. Partitions move as a
    /// whole, so no vertex can end up owned twice or not at all.
    pub fn apply_mutations(
        &self,
        sizes: &[(PartitionId, u64)],
        rebalance: &RebalanceConfig,
    ) -> PartitionMap {
        let mut next = self.clone();
        for (partition, size) in sizes {
            if let Some(slot) = next.sizes.get_mut(partition.0 as usize) {
                *slot = *size;
            }
        }

        if rebalance.enabled && next.rebalance(rebalance.imbalance_threshold) {
            next.version += 1;
            debug!(
                version = next.version,
                loads = ?next.worker_loads(),
                "Partition map re-balanced"
            );
        }
        next
    }

    fn imbalance(loads: &[u64]) -> f64 {
        let total: u64 = loads.iter().sum();
        if total == 0 {
            return 0.0;
        }
        let mean = total as f64 / loads.len() as f64;
        let max = loads.iter().copied().max().unwrap_or(0);
        let min = loads.iter().copied().min().unwrap_or(0);
        (max - min) as f64 / mean
    }

    /// Greedily move partitions from the heaviest to the lightest worker
    fn rebalance(&mut self, threshold: f64) -> bool {
        let mut moved = false;
        for _ in 0..self.assignment.len() {
            let loads = self.worker_loads();
            if Self::imbalance(&loads) <= threshold {
                break;
            }
            // Ties broken by lowest worker index so every process agrees
            let heavy = (0..loads.len())
                .max_by_key(|w| (loads[*w], std::cmp::Reverse(*w)))
                .unwrap_or(0);
            let light = (0..loads.len())
                .min_by_key(|w| (loads[*w], *w))
                .unwrap_or(0);
            let gap = loads[heavy] - loads[light];

            // Moving `size` leaves a gap of |gap - 2 * size|; take the move
            // that leaves the smallest one, among moves that narrow it
            let candidate = self
                .partitions_of(WorkerId(heavy))
                .into_iter()
                .filter(|p| {
                    let size = self.size_of(*p);
                    size > 0 && size < gap
                })
                .min_by_key(|p| ((gap as i128 - 2 * self.size_of(*p) as i128).abs(), p.0));

            match candidate {
                Some(partition) => {
                    self.assignment[partition.0 as usize] = WorkerId(light);
                    moved = true;
                }
                None => break,
            }
        }
        moved
    }

    /// Partitions whose owner differs between `previous` and `self`
    pub fn moves_from(&self, previous: &PartitionMap) -> Vec<PartitionMove> {
        self.assignment
            .iter()
            .zip(previous.assignment.iter())
            .enumerate()
            .filter(|(_, (now, before))| now != before)
            .map(|(p, (now, before))| PartitionMove {
                partition: PartitionId(p as u32),
                from: *before,
                to: *now,
            })
            .collect()
    }
}

/// Vertices of one partition
#[derive(Debug, Clone)]
pub struct Partition<G: GraphTypes> {
    id: PartitionId,
    vertices: HashMap<G::Id, Vertex<G>>,
}

impl<G: GraphTypes> Partition<G> {
    pub fn new(id: PartitionId) -> Self {
        Self {
            id,
            vertices: HashMap::new(),
        }
    }

    pub fn id(&self) -> PartitionId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.vertices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vertices.is_empty()
    }

    pub fn get(&self, id: &G::Id) -> Option<&Vertex<G>> {
        self.vertices.get(id)
    }

    pub fn get_mut(&mut self, id: &G::Id) -> Option<&mut Vertex<G>> {
        self.vertices.get_mut(id)
    }

    pub fn contains(&self, id: &G::Id) -> bool {
        self.vertices.contains_key(id)
    }

    /// Insert a vertex, returning the one it replaced
    pub fn insert(&mut self, vertex: Vertex<G>) -> Option<Vertex<G>> {
        self.vertices.insert(vertex.id().clone(), vertex)
    }

    pub fn remove(&mut self, id: &G::Id) -> Option<Vertex<G>> {
        self.vertices.remove(id)
    }

    pub fn vertices(&self) -> impl Iterator<Item = &Vertex<G>> + '_ {
        self.vertices.values()
    }

    pub(crate) fn vertices_mut(&mut self) -> &mut HashMap<G::Id, Vertex<G>> {
        &mut self.vertices
    }

    /// Vertices sorted by id
    pub fn to_sorted_vec(&self) -> Vec<Vertex<G>> {
        let mut vertices: Vec<_> = self.vertices.values().cloned().collect();
        vertices.sort_by(|a, b| a.id().cmp(b.id()));
        vertices
    }
}

/// The partitions a worker currently owns
#[derive(Debug, Clone)]
pub struct PartitionStore<G: GraphTypes> {
    partitions: BTreeMap<PartitionId, Partition<G>>,
}

impl<G: GraphTypes> Default for PartitionStore<G> {
    fn default() -> Self {
        Self {
            partitions: BTreeMap::new(),
        }
    }
}

impl<G: GraphTypes> PartitionStore<G> {
    /// Empty store holding the partitions `map` assigns to `worker`
    pub fn for_worker(map: &PartitionMap, worker: WorkerId) -> Self {
        Self {
            partitions: map
                .partitions_of(worker)
                .into_iter()
                .map(|p| (p, Partition::new(p)))
                .collect(),
        }
    }

    pub fn partition_ids(&self) -> Vec<PartitionId> {
        self.partitions.keys().copied().collect()
    }

    pub fn partition(&self, id: PartitionId) -> Option<&Partition<G>> {
        self.partitions.get(&id)
    }

    pub fn partitions(&self) -> impl Iterator<Item = &Partition<G>> + '_ {
        self.partitions.values()
    }

    pub(crate) fn partitions_mut(&mut self) -> &mut BTreeMap<PartitionId, Partition<G>> {
        &mut self.partitions
    }

    pub fn insert_partition(&mut self, partition: Partition<G>) {
        self.partitions.insert(partition.id(), partition);
    }

    pub fn remove_partition(&mut self, id: PartitionId) -> Option<Partition<G>> {
        self.partitions.remove(&id)
    }

    pub fn get(&self, map: &PartitionMap, id: &G::Id) -> Option<&Vertex<G>> {
        self.partitions.get(&map.partition_of(id))?.get(id)
    }

    pub fn get_mut(&mut self, map: &PartitionMap, id: &G::Id) -> Option<&mut Vertex<G>> {
        self.partitions.get_mut(&map.partition_of(id))?.get_mut(id)
    }

    pub fn contains(&self, map: &PartitionMap, id: &G::Id) -> bool {
        self.get(map, id).is_some()
    }

    /// Insert a vertex into its partition, creating the partition if needed
    pub fn insert(&mut self, map: &PartitionMap, vertex: Vertex<G>) -> Option<Vertex<G>> {
        let partition = map.partition_of(vertex.id());
        self.partitions
            .entry(partition)
            .or_insert_with(|| Partition::new(partition))
            .insert(vertex)
    }

    pub fn remove(&mut self, map: &PartitionMap, id: &G::Id) -> Option<Vertex<G>> {
        self.partitions.get_mut(&map.partition_of(id))?.remove(id)
    }

    pub fn num_vertices(&self) -> u64 {
        self.partitions.values().map(|p| p.len() as u64).sum()
    }

    pub fn num_edges(&self) -> u64 {
        self.vertices().map(|v| v.num_edges() as u64).sum()
    }

    pub fn num_active(&self) -> u64 {
        self.vertices().filter(|v| !v.is_halted()).count() as u64
    }

    pub fn vertices(&self) -> impl Iterator<Item = &Vertex<G>> + '_ {
        self.partitions.values().flat_map(|p| p.vertices())
    }

    /// Vertex count of every held partition
    pub fn sizes(&self) -> Vec<(PartitionId, u64)> {
        self.partitions
            .iter()
            .map(|(id, p)| (*id, p.len() as u64))
            .collect()
    }
}
