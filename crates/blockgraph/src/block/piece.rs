//! The unit of computation
//!
//! A [`Piece`] bundles what happens to every vertex during one send superstep
//! and the following receive superstep, plus the master-side logic that runs
//! between them. Pieces are immutable descriptors; the engine owns the
//! execution progress.

use std::any::Any;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;

use super::PieceId;
use crate::error::Result;
use crate::graph::{GraphTypes, GraphValue, Vertex};
use crate::master::MasterApi;
use crate::message::combiner::{PayloadCombiner, TypedCombiner};
use crate::message::{MessageCombiner, Messages};
use crate::reducer::registry::Registration;
use crate::reducer::CreateReducersApi;
use crate::worker::api::{ReceiveApi, SendApi, VertexContext, WorkerApi};

/// What a piece's master compute wants next
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MasterDecision {
    /// Let the enclosing block carry on
    #[default]
    Continue,
    /// Stop the whole computation once the pending receive is done
    Halt,
}

/// Computation applied to every vertex, in two overlapping halves
///
/// In superstep `s` the worker calls [`vertex_receive`](Piece::vertex_receive)
/// of the piece active at `s - 1` and then [`vertex_send`](Piece::vertex_send)
/// of the piece active at `s`. Messages sent in `vertex_send` are handed to
/// the same piece's `vertex_receive` one superstep later.
///
/// Neither half may depend on the order in which vertices are visited.
///
/// # Example
///
/// ```
/// use blockgraph::block::Piece;
/// use blockgraph::error::Result;
/// use blockgraph::graph::{Types, Vertex};
/// use blockgraph::message::Messages;
/// use blockgraph::reducer::CreateReducersApi;
/// use blockgraph::worker::{ReceiveApi, SendApi};
///
/// type G = Types<u64, u64, ()>;
///
/// /// Count incoming edges
/// struct InDegree;
///
/// impl Piece<G> for InDegree {
///     type Message = ();
///     type Reducers = ();
///
///     fn register_reducers(&self, _api: &mut CreateReducersApi) {}
///
///     fn vertex_send(&self, vertex: &mut Vertex<G>, api: &mut SendApi<'_, G, ()>, _: &()) -> Result<()> {
///         api.send_message_to_all_edges(vertex, &())
///     }
///
///     fn vertex_receive(
///         &self,
///         vertex: &mut Vertex<G>,
///         messages: Messages<'_, ()>,
///         _api: &mut ReceiveApi<'_, G>,
///         _: &(),
///     ) -> Result<()> {
///         vertex.set_value(messages.count() as u64);
///         Ok(())
///     }
/// }
/// ```
pub trait Piece<G: GraphTypes>: Send + Sync + 'static {
    /// Message type sent in `vertex_send`
    type Message: GraphValue;

    /// Handles created in `register_reducers`
    type Reducers: Send + Sync + 'static;

    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Create the reducers and broadcasts this piece uses
    fn register_reducers(&self, api: &mut CreateReducersApi) -> Self::Reducers;

    fn vertex_send(
        &self,
        vertex: &mut Vertex<G>,
        api: &mut SendApi<'_, G, Self::Message>,
        reducers: &Self::Reducers,
    ) -> Result<()> {
        let _ = (vertex, api, reducers);
        Ok(())
    }

    fn vertex_receive(
        &self,
        vertex: &mut Vertex<G>,
        messages: Messages<'_, Self::Message>,
        api: &mut ReceiveApi<'_, G>,
        reducers: &Self::Reducers,
    ) -> Result<()> {
        let _ = (vertex, messages, api, reducers);
        Ok(())
    }

    /// Runs on the master after the send superstep, with its reducers resolved
    fn master_compute(&self, api: &mut MasterApi<'_>, reducers: &Self::Reducers) -> Result<MasterDecision> {
        let _ = (api, reducers);
        Ok(MasterDecision::Continue)
    }

    /// Runs on the master after the receive superstep
    fn master_compute_after_receive(&self, api: &mut MasterApi<'_>, reducers: &Self::Reducers) -> Result<()> {
        let _ = (api, reducers);
        Ok(())
    }

    /// Combiner applied to this piece's messages while they are buffered
    fn message_combiner(&self) -> Option<Arc<dyn MessageCombiner<Self::Message>>> {
        None
    }
}

/// Object-safe view of a piece bound to its id
pub(crate) trait ErasedPiece<G: GraphTypes>: Send + Sync {
    fn name(&self) -> &str;

    /// Fresh reducer state for one registry
    fn registrations(&self, id: PieceId) -> Vec<Registration>;

    /// Compute typed handles once the id is known
    fn bind(&mut self, id: PieceId);

    fn combiner(&self) -> Option<Arc<dyn PayloadCombiner>>;

    fn send(&self, vertex: &mut Vertex<G>, api: WorkerApi<'_, G>, ctx: &mut VertexContext<G>) -> Result<()>;

    fn receive(
        &self,
        vertex: &mut Vertex<G>,
        payloads: Vec<Bytes>,
        api: WorkerApi<'_, G>,
        ctx: &mut VertexContext<G>,
    ) -> Result<()>;

    fn master_compute(&self, api: &mut MasterApi<'_>) -> Result<MasterDecision>;

    fn master_compute_after_receive(&self, api: &mut MasterApi<'_>) -> Result<()>;
}

pub(crate) struct PieceAdapter<P, G> {
    piece: P,
    reducers: Option<Box<dyn Any + Send + Sync>>,
    _graph: PhantomData<fn() -> G>,
}

impl<P, G> PieceAdapter<P, G>
where
    G: GraphTypes,
    P: Piece<G>,
{
    pub(crate) fn new(piece: P) -> Self {
        Self {
            piece,
            reducers: None,
            _graph: PhantomData,
        }
    }

    fn reducers(&self) -> Result<&P::Reducers> {
        self.reducers
            .as_ref()
            .and_then(|reducers| reducers.downcast_ref::<P::Reducers>())
            .ok_or_else(|| {
                crate::error::BspError::TerminalMismatch(format!(
                    "piece '{}' is not part of an execution graph",
                    self.piece.name()
                ))
            })
    }
}

impl<P, G> ErasedPiece<G> for PieceAdapter<P, G>
where
    G: GraphTypes,
    P: Piece<G>,
{
    fn name(&self) -> &str {
        self.piece.name()
    }

    fn registrations(&self, id: PieceId) -> Vec<Registration> {
        let mut api = CreateReducersApi::new(id);
        let _ = self.piece.register_reducers(&mut api);
        api.into_registrations()
    }

    fn bind(&mut self, id: PieceId) {
        let mut api = CreateReducersApi::new(id);
        self.reducers = Some(Box::new(self.piece.register_reducers(&mut api)));
    }

    fn combiner(&self) -> Option<Arc<dyn PayloadCombiner>> {
        self.piece
            .message_combiner()
            .map(|combiner| Arc::new(TypedCombiner::new(combiner)) as Arc<dyn PayloadCombiner>)
    }

    fn send(&self, vertex: &mut Vertex<G>, api: WorkerApi<'_, G>, ctx: &mut VertexContext<G>) -> Result<()> {
        let reducers = self.reducers()?;
        let mut send_api = SendApi::new(api, ctx);
        self.piece.vertex_send(vertex, &mut send_api, reducers)
    }

    fn receive(
        &self,
        vertex: &mut Vertex<G>,
        payloads: Vec<Bytes>,
        api: WorkerApi<'_, G>,
        ctx: &mut VertexContext<G>,
    ) -> Result<()> {
        let reducers = self.reducers()?;
        let failure = RefCell::new(None);
        let mut receive_api = ReceiveApi::new(api, ctx);
        self.piece.vertex_receive(
            vertex,
            Messages::new(payloads, &failure),
            &mut receive_api,
            reducers,
        )?;
        match failure.into_inner() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn master_compute(&self, api: &mut MasterApi<'_>) -> Result<MasterDecision> {
        let reducers = self.reducers()?;
        self.piece.master_compute(api, reducers)
    }

    fn master_compute_after_receive(&self, api: &mut MasterApi<'_>) -> Result<()> {
        let reducers = self.reducers()?;
        self.piece.master_compute_after_receive(api, reducers)
    }
}
