//! Ready-made pieces for common steps
//!
//! Each piece is built from closures so small jobs can be assembled without
//! writing a [`Piece`] impl:
//!
//! - [`ForAllVertices`]: run a function on every vertex
//! - [`ReducePiece`]: reduce one value per vertex and hand the result to the master
//! - [`SendToNeighbors`]: send along all edges, consume the messages one superstep later

use std::marker::PhantomData;
use std::sync::Arc;

use crate::block::{MasterDecision, Piece};
use crate::error::Result;
use crate::graph::{GraphTypes, GraphValue, Vertex};
use crate::master::MasterApi;
use crate::message::{MessageCombiner, Messages};
use crate::reducer::{CreateReducersApi, ReduceOp, ReducerHandle};
use crate::worker::{ReceiveApi, SendApi};

type VertexFn<G> = dyn Fn(&mut Vertex<G>) -> Result<()> + Send + Sync;

/// Applies a function to every vertex in the send half
pub struct ForAllVertices<G: GraphTypes> {
    name: String,
    apply: Box<VertexFn<G>>,
}

impl<G: GraphTypes> ForAllVertices<G> {
    pub fn new(
        name: impl Into<String>,
        apply: impl Fn(&mut Vertex<G>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            apply: Box::new(apply),
        }
    }
}

impl<G: GraphTypes> Piece<G> for ForAllVertices<G> {
    type Message = ();
    type Reducers = ();

    fn name(&self) -> &str {
        &self.name
    }

    fn register_reducers(&self, _api: &mut CreateReducersApi) {}

    fn vertex_send(&self, vertex: &mut Vertex<G>, _api: &mut SendApi<'_, G, ()>, _: &()) -> Result<()> {
        (self.apply)(vertex)
    }
}

/// Reduces one value per vertex; the master receives the global value
///
/// The consumer runs in master compute, so it can feed a
/// [`Transfer`](crate::block::Transfer) read by a later condition.
pub struct ReducePiece<G: GraphTypes, Op: ReduceOp> {
    name: String,
    op: Op,
    supplier: Box<dyn Fn(&Vertex<G>) -> Op::Input + Send + Sync>,
    consumer: Box<dyn Fn(Op::Value) + Send + Sync>,
}

impl<G: GraphTypes, Op: ReduceOp + Clone> ReducePiece<G, Op> {
    pub fn new(
        name: impl Into<String>,
        op: Op,
        supplier: impl Fn(&Vertex<G>) -> Op::Input + Send + Sync + 'static,
        consumer: impl Fn(Op::Value) + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            op,
            supplier: Box::new(supplier),
            consumer: Box::new(consumer),
        }
    }
}

impl<G: GraphTypes, Op: ReduceOp + Clone> Piece<G> for ReducePiece<G, Op> {
    type Message = ();
    type Reducers = ReducerHandle<Op>;

    fn name(&self) -> &str {
        &self.name
    }

    fn register_reducers(&self, api: &mut CreateReducersApi) -> ReducerHandle<Op> {
        api.create_local_reducer(self.op.clone())
    }

    fn vertex_send(
        &self,
        vertex: &mut Vertex<G>,
        api: &mut SendApi<'_, G, ()>,
        handle: &ReducerHandle<Op>,
    ) -> Result<()> {
        api.reduce(*handle, (self.supplier)(vertex))
    }

    fn master_compute(
        &self,
        api: &mut MasterApi<'_>,
        handle: &ReducerHandle<Op>,
    ) -> Result<MasterDecision> {
        (self.consumer)(api.reduced_value(*handle)?);
        Ok(MasterDecision::Continue)
    }
}

type Supplier<G, M> = dyn Fn(&Vertex<G>) -> Option<M> + Send + Sync;
type Consumer<G, M> = dyn Fn(&mut Vertex<G>, Vec<M>) -> Result<()> + Send + Sync;

/// Sends a message along every outgoing edge and consumes what arrives
///
/// Vertices for which the supplier returns `None` send nothing. The consumer
/// runs for every vertex, with an empty list if nothing arrived.
pub struct SendToNeighbors<G: GraphTypes, M: GraphValue> {
    name: String,
    supplier: Box<Supplier<G, M>>,
    consumer: Box<Consumer<G, M>>,
    combiner: Option<Arc<dyn MessageCombiner<M>>>,
    _message: PhantomData<fn() -> M>,
}

impl<G: GraphTypes, M: GraphValue> SendToNeighbors<G, M> {
    pub fn new(
        name: impl Into<String>,
        supplier: impl Fn(&Vertex<G>) -> Option<M> + Send + Sync + 'static,
        consumer: impl Fn(&mut Vertex<G>, Vec<M>) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            supplier: Box::new(supplier),
            consumer: Box::new(consumer),
            combiner: None,
            _message: PhantomData,
        }
    }

    /// Combine messages for the same vertex while they are buffered
    pub fn with_combiner(mut self, combiner: impl MessageCombiner<M> + 'static) -> Self {
        self.combiner = Some(Arc::new(combiner));
        self
    }
}

impl<G: GraphTypes, M: GraphValue> Piece<G> for SendToNeighbors<G, M> {
    type Message = M;
    type Reducers = ();

    fn name(&self) -> &str {
        &self.name
    }

    fn register_reducers(&self, _api: &mut CreateReducersApi) {}

    fn vertex_send(&self, vertex: &mut Vertex<G>, api: &mut SendApi<'_, G, M>, _: &()) -> Result<()> {
        match (self.supplier)(vertex) {
            Some(message) => api.send_message_to_all_edges(vertex, &message),
            None => Ok(()),
        }
    }

    fn vertex_receive(
        &self,
        vertex: &mut Vertex<G>,
        messages: Messages<'_, M>,
        _api: &mut ReceiveApi<'_, G>,
        _: &(),
    ) -> Result<()> {
        (self.consumer)(vertex, messages.collect())
    }

    fn message_combiner(&self) -> Option<Arc<dyn MessageCombiner<M>>> {
        self.combiner.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Types;
    use crate::reducer::SumReduce;

    type G = Types<u64, u64, ()>;

    #[test]
    fn test_library_pieces_keep_their_names() {
        let all = ForAllVertices::<G>::new("reset", |vertex| {
            vertex.set_value(0);
            Ok(())
        });
        let sum = ReducePiece::<G, _>::new("sum", SumReduce::<u64>::new(), |v| *v.value(), |_| {});
        let send = SendToNeighbors::<G, u64>::new("spread", |v| Some(*v.value()), |_, _| Ok(()));

        assert_eq!(Piece::<G>::name(&all), "reset");
        assert_eq!(Piece::<G>::name(&sum), "sum");
        assert_eq!(Piece::<G>::name(&send), "spread");
        assert!(send.message_combiner().is_none());
    }
}
