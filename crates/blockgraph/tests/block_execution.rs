//! End-to-end block execution on small graphs

mod common;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use blockgraph::block::{Block, MasterDecision, Piece, Transfer};
use blockgraph::error::{BspError, Result};
use blockgraph::graph::Vertex;
use blockgraph::master::MasterApi;
use blockgraph::message::{Messages, SumCombiner};
use blockgraph::pieces::{ForAllVertices, ReducePiece, SendToNeighbors};
use blockgraph::reducer::{
    BroadcastHandle, CountReduce, CreateReducersApi, MaxReduce, ReducerHandle, SumReduce,
};
use blockgraph::runner::{run_block, LocalBlockRunner};
use blockgraph::worker::{ReceiveApi, SendApi};

use common::{config, init_tracing, small_graph, values, CountIncoming, Increment, G};

#[tokio::test]
async fn test_message_sending() {
    init_tracing();
    let graph = small_graph();

    let summary = LocalBlockRunner::new(config(1))
        .run_on_graph(Block::piece(CountIncoming), &graph)
        .await
        .unwrap();

    assert_eq!(values(&graph), vec![(1, 1), (2, 2), (3, 1), (4, 0)]);
    // send in superstep 0, receive in superstep 1
    assert_eq!(summary.supersteps, 2);
    assert_eq!(summary.messages_sent, 4);
}

#[tokio::test]
async fn test_message_sending_across_workers() {
    for workers in [2, 3] {
        let graph = small_graph();
        LocalBlockRunner::new(config(workers))
            .run_on_graph(Block::piece(CountIncoming), &graph)
            .await
            .unwrap();
        assert_eq!(values(&graph), vec![(1, 1), (2, 2), (3, 1), (4, 0)]);
    }
}

/// Counts vertices with a local sum reducer, as the master sees it
struct CountVertices {
    seen: Arc<AtomicU64>,
}

impl Piece<G> for CountVertices {
    type Message = ();
    type Reducers = ReducerHandle<SumReduce<u64>>;

    fn register_reducers(&self, api: &mut CreateReducersApi) -> Self::Reducers {
        api.create_local_reducer(SumReduce::new())
    }

    fn vertex_send(
        &self,
        _vertex: &mut Vertex<G>,
        api: &mut SendApi<'_, G, ()>,
        num_vertices: &Self::Reducers,
    ) -> Result<()> {
        api.reduce(*num_vertices, 1)
    }

    fn master_compute(
        &self,
        api: &mut MasterApi<'_>,
        num_vertices: &Self::Reducers,
    ) -> Result<MasterDecision> {
        self.seen
            .store(api.reduced_value(*num_vertices)?, Ordering::SeqCst);
        Ok(MasterDecision::Continue)
    }
}

#[tokio::test]
async fn test_reducing() {
    for workers in [1, 2, 4] {
        let seen = Arc::new(AtomicU64::new(0));
        let piece = CountVertices {
            seen: Arc::clone(&seen),
        };
        LocalBlockRunner::new(config(workers))
            .run_on_graph(Block::piece(piece), &small_graph())
            .await
            .unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 4, "{workers} workers");
    }
}

#[test]
fn test_run_block_from_sync_code() {
    let graph = small_graph();
    let summary = run_block(config(2), Block::piece(CountIncoming), &graph).unwrap();
    assert_eq!(graph.value(&2), Some(2));
    assert_eq!(summary.totals.vertices, 4);
    assert_eq!(summary.totals.edges, 4);
}

#[tokio::test]
async fn test_sequence_and_repeat() {
    let graph = small_graph();
    let block = Block::sequence([
        Block::repeat(3, Block::piece(Increment)),
        Block::piece(CountIncoming),
        Block::piece(Increment),
    ]);

    let summary = LocalBlockRunner::new(config(2))
        .run_on_graph(block, &graph)
        .await
        .unwrap();

    // The count replaces the three increments; the last increment runs
    // in the superstep that receives the count
    assert_eq!(values(&graph), vec![(1, 2), (2, 3), (3, 2), (4, 1)]);
    assert_eq!(summary.supersteps, 6);
}

/// Increments every vertex and reports the largest value to a transfer
struct IncrementAndReportMax {
    max: Transfer<u64>,
}

impl Piece<G> for IncrementAndReportMax {
    type Message = ();
    type Reducers = ReducerHandle<MaxReduce<u64>>;

    fn name(&self) -> &str {
        "increment-and-report-max"
    }

    fn register_reducers(&self, api: &mut CreateReducersApi) -> Self::Reducers {
        api.create_local_reducer(MaxReduce::new())
    }

    fn vertex_send(
        &self,
        vertex: &mut Vertex<G>,
        api: &mut SendApi<'_, G, ()>,
        max: &Self::Reducers,
    ) -> Result<()> {
        *vertex.value_mut() += 1;
        api.reduce(*max, *vertex.value())
    }

    fn master_compute(&self, api: &mut MasterApi<'_>, max: &Self::Reducers) -> Result<MasterDecision> {
        self.max.set(api.reduced_value(*max)?);
        Ok(MasterDecision::Continue)
    }
}

#[tokio::test]
async fn test_repeat_until_reads_transfer() {
    let graph = small_graph();
    let max = Transfer::new();
    let condition = max.clone();
    let block = Block::repeat_until(
        10,
        move || condition.get().is_some_and(|max| max >= 5),
        Block::piece(IncrementAndReportMax { max: max.clone() }),
    );

    LocalBlockRunner::new(config(3))
        .run_on_graph(block, &graph)
        .await
        .unwrap();

    assert_eq!(max.get(), Some(5));
    assert!(values(&graph).iter().all(|(_, value)| *value == 5));
}

#[tokio::test]
async fn test_repeat_until_respects_max_iterations() {
    let graph = small_graph();
    let block = Block::repeat_until(4, || false, Block::piece(Increment));

    LocalBlockRunner::new(config(1))
        .run_on_graph(block, &graph)
        .await
        .unwrap();

    assert_eq!(values(&graph), vec![(1, 4), (2, 4), (3, 4), (4, 4)]);
}

#[tokio::test]
async fn test_if_then_else_and_branch() {
    let graph = small_graph();
    let count = Transfer::new();
    let (is_small, select) = (count.clone(), count.clone());

    let reset = ForAllVertices::<G>::new("reset", |vertex| {
        vertex.set_value(0);
        Ok(())
    });
    let record = count.clone();
    let count_piece = ReducePiece::<G, _>::new("count", CountReduce, |_| (), move |n| record.set(n));

    let block = Block::sequence([
        Block::piece(count_piece),
        Block::if_then_else(
            move || is_small.get().is_some_and(|n| n < 10),
            Block::piece(reset),
            Block::piece(Increment),
        ),
        Block::branch(
            move || select.get().map(|n| (n as usize) % 2),
            [
                Block::piece(CountIncoming),
                Block::repeat(2, Block::piece(Increment)),
            ],
        ),
    ]);

    LocalBlockRunner::new(config(2))
        .run_on_graph(block, &graph)
        .await
        .unwrap();

    // 4 vertices: reset, then branch 0 counts in-edges
    assert_eq!(count.get(), Some(4));
    assert_eq!(values(&graph), vec![(1, 1), (2, 2), (3, 1), (4, 0)]);
}

#[tokio::test]
async fn test_branch_out_of_range_is_fatal() {
    let block = Block::sequence([
        Block::piece(Increment),
        Block::branch(|| Some(7), [Block::piece(Increment)]),
    ]);

    let err = LocalBlockRunner::new(config(2))
        .run_on_graph(block, &small_graph())
        .await
        .unwrap_err();

    assert!(matches!(err, BspError::TerminalMismatch(_)), "{err}");
}

/// Halts the whole block from master compute
struct HaltImmediately;

impl Piece<G> for HaltImmediately {
    type Message = ();
    type Reducers = ();

    fn register_reducers(&self, _api: &mut CreateReducersApi) {}

    fn master_compute(&self, _api: &mut MasterApi<'_>, _: &()) -> Result<MasterDecision> {
        Ok(MasterDecision::Halt)
    }
}

#[tokio::test]
async fn test_master_halt_skips_remaining_pieces() {
    let graph = small_graph();
    let block = Block::sequence([
        Block::piece(Increment),
        Block::piece(HaltImmediately),
        Block::piece(Increment),
    ]);

    let summary = LocalBlockRunner::new(config(2))
        .run_on_graph(block, &graph)
        .await
        .unwrap();

    assert!(values(&graph).iter().all(|(_, value)| *value == 1));
    assert_eq!(summary.supersteps, 3);
}

#[tokio::test]
async fn test_max_supersteps_exceeded() {
    let block = Block::repeat(100, Block::piece(Increment));

    let err = LocalBlockRunner::new(config(1).with_max_supersteps(5))
        .run_on_graph(block, &small_graph())
        .await
        .unwrap_err();

    assert!(matches!(err, BspError::MaxSuperstepsExceeded { limit: 5 }));
}

#[tokio::test]
async fn test_combiner_merges_buffered_messages() {
    let graph = small_graph();
    let received = Arc::new(AtomicU64::new(0));
    let counter = Arc::clone(&received);

    let piece = SendToNeighbors::<G, u64>::new(
        "send-ones",
        |_| Some(1),
        move |vertex, messages| {
            counter.fetch_add(messages.len() as u64, Ordering::SeqCst);
            vertex.set_value(messages.iter().sum());
            Ok(())
        },
    )
    .with_combiner(SumCombiner);

    LocalBlockRunner::new(config(2))
        .run_on_graph(Block::piece(piece), &graph)
        .await
        .unwrap();

    assert_eq!(values(&graph), vec![(1, 1), (2, 2), (3, 1), (4, 0)]);
    // one combined message per receiving vertex
    assert_eq!(received.load(Ordering::SeqCst), 3);
}

/// Master publishes the current superstep; vertices store what they read
struct BroadcastSuperstep;

impl Piece<G> for BroadcastSuperstep {
    type Message = ();
    type Reducers = BroadcastHandle<u64>;

    fn register_reducers(&self, api: &mut CreateReducersApi) -> Self::Reducers {
        api.create_broadcast()
    }

    fn master_compute(
        &self,
        api: &mut MasterApi<'_>,
        handle: &Self::Reducers,
    ) -> Result<MasterDecision> {
        let value = api.superstep() + 100;
        api.broadcast(*handle, &value)?;
        Ok(MasterDecision::Continue)
    }

    fn vertex_receive(
        &self,
        vertex: &mut Vertex<G>,
        _messages: Messages<'_, ()>,
        api: &mut ReceiveApi<'_, G>,
        handle: &Self::Reducers,
    ) -> Result<()> {
        vertex.set_value(api.broadcast_value(*handle)?);
        Ok(())
    }
}

#[tokio::test]
async fn test_broadcast_reaches_receive() {
    let graph = small_graph();
    let block = Block::sequence([Block::piece(Increment), Block::piece(BroadcastSuperstep)]);

    LocalBlockRunner::new(config(2))
        .run_on_graph(block, &graph)
        .await
        .unwrap();

    // sent in superstep 1, published after it, read in superstep 2
    assert!(values(&graph).iter().all(|(_, value)| *value == 101));
}

/// Keeps every vertex active in receive, so the job outlives the block
struct StayAwake;

impl Piece<G> for StayAwake {
    type Message = ();
    type Reducers = ();

    fn register_reducers(&self, _api: &mut CreateReducersApi) {}

    fn vertex_receive(
        &self,
        _vertex: &mut Vertex<G>,
        _messages: Messages<'_, ()>,
        api: &mut ReceiveApi<'_, G>,
        _: &(),
    ) -> Result<()> {
        api.keep_active();
        Ok(())
    }
}

#[tokio::test]
async fn test_active_vertices_delay_termination_by_one_superstep() {
    let summary = LocalBlockRunner::new(config(2))
        .run_on_graph(Block::piece(StayAwake), &small_graph())
        .await
        .unwrap();

    assert_eq!(summary.supersteps, 3);
}

/// Fails on one vertex
struct Explode;

impl Piece<G> for Explode {
    type Message = ();
    type Reducers = ();

    fn name(&self) -> &str {
        "explode"
    }

    fn register_reducers(&self, _api: &mut CreateReducersApi) {}

    fn vertex_send(&self, vertex: &mut Vertex<G>, _api: &mut SendApi<'_, G, ()>, _: &()) -> Result<()> {
        if *vertex.id() == 3 {
            return Err(BspError::piece("explode", "vertex 3 refused"));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_piece_error_fails_the_job_without_retry() {
    let err = LocalBlockRunner::new(config(2))
        .run_on_graph(Block::piece(Explode), &small_graph())
        .await
        .unwrap_err();

    assert!(!err.is_recoverable());
    assert!(err.to_string().contains("vertex 3 refused"), "{err}");
}

#[tokio::test]
async fn test_receive_runs_for_halted_vertices_without_messages() {
    let graph = blockgraph::io::TestGraph::<G>::new();
    graph.add_vertex(1, 5).add_vertex(2, 5).add_vertex(4, 9);
    graph.add_edge(1, 2, ());

    LocalBlockRunner::new(config(2))
        .run_on_graph(Block::piece(CountIncoming), &graph)
        .await
        .unwrap();

    // Every vertex halted after the send superstep, and only 2 got a message
    assert_eq!(values(&graph), vec![(1, 0), (2, 1), (4, 0)]);
}
