//! What piece functions can do on a worker

use std::marker::PhantomData;
use std::ops::Deref;

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use crate::codec;
use crate::error::Result;
use crate::graph::{Edge, GraphTotals, GraphTypes, Mutation, Vertex, WorkerId};
use crate::reducer::{BroadcastHandle, BroadcastStore, ReduceOp, ReducerHandle, ReducerRegistry};

/// Worker-wide view shared by every vertex of a superstep
pub struct WorkerApi<'a, G: GraphTypes> {
    worker: WorkerId,
    superstep: u64,
    totals: GraphTotals,
    reducers: &'a ReducerRegistry,
    broadcasts: &'a BroadcastStore,
    _graph: PhantomData<fn() -> G>,
}

impl<G: GraphTypes> Clone for WorkerApi<'_, G> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<G: GraphTypes> Copy for WorkerApi<'_, G> {}

impl<'a, G: GraphTypes> WorkerApi<'a, G> {
    pub(crate) fn new(
        worker: WorkerId,
        superstep: u64,
        totals: GraphTotals,
        reducers: &'a ReducerRegistry,
        broadcasts: &'a BroadcastStore,
    ) -> Self {
        Self {
            worker,
            superstep,
            totals,
            reducers,
            broadcasts,
            _graph: PhantomData,
        }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.worker
    }

    pub fn superstep(&self) -> u64 {
        self.superstep
    }

    /// Vertex count as of the end of the previous superstep
    pub fn total_num_vertices(&self) -> u64 {
        self.totals.vertices
    }

    /// Edge count as of the end of the previous superstep
    pub fn total_num_edges(&self) -> u64 {
        self.totals.edges
    }

    /// Fold a value into this worker's partial of a reducer
    pub fn reduce<Op: ReduceOp>(&self, handle: ReducerHandle<Op>, input: Op::Input) -> Result<()> {
        self.reducers.reduce(handle, input)
    }

    /// Value the master broadcast in an earlier superstep
    pub fn broadcast_value<T: DeserializeOwned>(&self, handle: BroadcastHandle<T>) -> Result<T> {
        self.broadcasts.get(handle)
    }
}

/// Side effects of one vertex invocation, routed once the vertex is done
pub(crate) struct VertexContext<G: GraphTypes> {
    pub(crate) outbox: Vec<(G::Id, Bytes)>,
    pub(crate) mutations: Vec<Mutation<G>>,
    pub(crate) keep_active: bool,
}

impl<G: GraphTypes> Default for VertexContext<G> {
    fn default() -> Self {
        Self {
            outbox: Vec::new(),
            mutations: Vec::new(),
            keep_active: false,
        }
    }
}

/// Api handed to [`Piece::vertex_send`](crate::block::Piece::vertex_send)
pub struct SendApi<'a, G: GraphTypes, M> {
    api: WorkerApi<'a, G>,
    ctx: &'a mut VertexContext<G>,
    _message: PhantomData<fn(M)>,
}

impl<'a, G: GraphTypes, M> SendApi<'a, G, M> {
    pub(crate) fn new(api: WorkerApi<'a, G>, ctx: &'a mut VertexContext<G>) -> Self {
        Self {
            api,
            ctx,
            _message: PhantomData,
        }
    }

    /// Request a new vertex; applied at the end of the superstep
    pub fn add_vertex_request(&mut self, id: G::Id, value: G::Value) {
        self.ctx.mutations.push(Mutation::CreateVertex { id, value });
    }

    pub fn remove_vertex_request(&mut self, id: G::Id) {
        self.ctx.mutations.push(Mutation::RemoveVertex { id });
    }

    pub fn add_edge_request(&mut self, source: G::Id, edge: Edge<G>) {
        self.ctx.mutations.push(Mutation::AddEdge { source, edge });
    }

    /// Remove every edge from `source` to `target`
    pub fn remove_edges_request(&mut self, source: G::Id, target: G::Id) {
        self.ctx.mutations.push(Mutation::RemoveEdge { source, target });
    }

    /// Keep this vertex active past the end of the superstep
    pub fn keep_active(&mut self) {
        self.ctx.keep_active = true;
    }
}

impl<G: GraphTypes, M: Serialize> SendApi<'_, G, M> {
    /// Deliver `message` to `target` in the next superstep
    pub fn send_message(&mut self, target: G::Id, message: &M) -> Result<()> {
        let payload = codec::encode(message)?;
        self.ctx.outbox.push((target, payload));
        Ok(())
    }

    /// Send one copy of `message` along every outgoing edge of `vertex`
    pub fn send_message_to_all_edges(&mut self, vertex: &Vertex<G>, message: &M) -> Result<()> {
        self.send_message_to_multiple(vertex.targets().cloned(), message)
    }

    pub fn send_message_to_multiple(
        &mut self,
        targets: impl IntoIterator<Item = G::Id>,
        message: &M,
    ) -> Result<()> {
        let payload = codec::encode(message)?;
        self.ctx
            .outbox
            .extend(targets.into_iter().map(|target| (target, payload.clone())));
        Ok(())
    }
}

impl<'a, G: GraphTypes, M> Deref for SendApi<'a, G, M> {
    type Target = WorkerApi<'a, G>;

    fn deref(&self) -> &Self::Target {
        &self.api
    }
}

/// Api handed to [`Piece::vertex_receive`](crate::block::Piece::vertex_receive)
pub struct ReceiveApi<'a, G: GraphTypes> {
    api: WorkerApi<'a, G>,
    ctx: &'a mut VertexContext<G>,
}

impl<'a, G: GraphTypes> ReceiveApi<'a, G> {
    pub(crate) fn new(api: WorkerApi<'a, G>, ctx: &'a mut VertexContext<G>) -> Self {
        Self { api, ctx }
    }

    /// Keep this vertex active past the end of the superstep
    pub fn keep_active(&mut self) {
        self.ctx.keep_active = true;
    }
}

impl<'a, G: GraphTypes> Deref for ReceiveApi<'a, G> {
    type Target = WorkerApi<'a, G>;

    fn deref(&self) -> &Self::Target {
        &self.api
    }
}
