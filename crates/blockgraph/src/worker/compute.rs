//! Parallel vertex computation for one superstep

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use rayon::prelude::*;

use super::api::{VertexContext, WorkerApi};
use crate::block::ErasedPiece;
use crate::error::{BspError, Result};
use crate::graph::{
    GraphTypes, MutationBuffer, MutationRecord, PartitionMap, PartitionStore, Vertex, WorkerId,
};
use crate::message::MessageStore;

/// The pieces and shared state of one superstep on one worker
pub(crate) struct SuperstepPlan<'a, G: GraphTypes> {
    pub(crate) worker: WorkerId,
    pub(crate) superstep: u64,
    pub(crate) send: Option<&'a dyn ErasedPiece<G>>,
    pub(crate) receive: Option<&'a dyn ErasedPiece<G>>,
    pub(crate) api: WorkerApi<'a, G>,
    pub(crate) map: &'a PartitionMap,
}

/// Effects of a superstep that leave the compute phase
pub(crate) struct ComputeOutcome<G: GraphTypes> {
    /// Messages for vertices owned by other workers
    pub(crate) remote: BTreeMap<WorkerId, Vec<(G::Id, Bytes)>>,
    /// Every mutation request, grouped by owning worker
    pub(crate) mutations: BTreeMap<WorkerId, Vec<MutationRecord<G>>>,
    pub(crate) messages_sent: u64,
    pub(crate) vertices_computed: u64,
}

/// Run receive then send for every local vertex
///
/// Every vertex runs exactly once regardless of its halt state; a vertex
/// halts at the end unless one of the pieces kept it active. Messages for
/// local vertices go straight into the next generation of `store`.
pub(crate) fn compute_partitions<G: GraphTypes>(
    partitions: &mut PartitionStore<G>,
    store: &MessageStore<G::Id>,
    plan: &SuperstepPlan<'_, G>,
) -> Result<ComputeOutcome<G>> {
    let remote: Vec<Mutex<Vec<(G::Id, Bytes)>>> = (0..plan.map.num_workers())
        .map(|_| Mutex::new(Vec::new()))
        .collect();
    let mutations = MutationBuffer::new();
    let sent = AtomicU64::new(0);
    let computed = AtomicU64::new(0);

    partitions
        .partitions_mut()
        .par_iter_mut()
        .try_for_each(|(_, partition)| {
            partition
                .vertices_mut()
                .par_iter_mut()
                .try_for_each(|(_, vertex)| {
                    let ctx = compute_vertex(vertex, store, plan)?;
                    computed.fetch_add(1, Ordering::Relaxed);
                    sent.fetch_add(ctx.outbox.len() as u64, Ordering::Relaxed);

                    for (target, payload) in ctx.outbox {
                        let owner = plan.map.owner_of(&target);
                        if owner == plan.worker {
                            store.send(target, payload)?;
                        } else {
                            remote[owner.index()].lock().push((target, payload));
                        }
                    }
                    mutations.extend(
                        ctx.mutations
                            .into_iter()
                            .map(|mutation| MutationRecord::new(plan.superstep, mutation)),
                    );
                    Ok::<(), BspError>(())
                })
        })?;

    let remote = remote
        .into_iter()
        .enumerate()
        .map(|(index, messages)| (WorkerId(index), messages.into_inner()))
        .filter(|(worker, _)| *worker != plan.worker)
        .collect();

    Ok(ComputeOutcome {
        remote,
        mutations: mutations.drain_by_owner(plan.map).into_iter().collect(),
        messages_sent: sent.into_inner(),
        vertices_computed: computed.into_inner(),
    })
}

fn compute_vertex<G: GraphTypes>(
    vertex: &mut Vertex<G>,
    store: &MessageStore<G::Id>,
    plan: &SuperstepPlan<'_, G>,
) -> Result<VertexContext<G>> {
    let payloads = store.drain(vertex.id());
    if !payloads.is_empty() {
        vertex.wake_up();
    }

    let mut ctx = VertexContext::default();
    if let Some(piece) = plan.receive {
        piece.receive(vertex, payloads, plan.api, &mut ctx)?;
    }
    if let Some(piece) = plan.send {
        piece.send(vertex, plan.api, &mut ctx)?;
    }

    if ctx.keep_active {
        vertex.wake_up();
    } else {
        vertex.vote_to_halt();
    }
    Ok(ctx)
}
