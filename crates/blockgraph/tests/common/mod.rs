//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::time::Duration;

use blockgraph::block::Piece;
use blockgraph::config::{BspConfig, RetryPolicy};
use blockgraph::error::Result;
use blockgraph::graph::{Types, Vertex};
use blockgraph::io::TestGraph;
use blockgraph::message::Messages;
use blockgraph::reducer::CreateReducersApi;
use blockgraph::worker::{ReceiveApi, SendApi};

pub type G = Types<u64, u64, ()>;

/// Install a subscriber honouring `RUST_LOG`, once per test binary
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Config that fails fast and retries without noticeable delay
pub fn config(workers: usize) -> BspConfig {
    BspConfig::new(workers)
        .with_worker_threads(2)
        .with_superstep_timeout(Duration::from_secs(5))
        .with_retry(RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        })
}

/// Four vertices, 1 <-> 2 <-> 3, and 4 on its own
pub fn small_graph() -> TestGraph<G> {
    let graph = TestGraph::<G>::new();
    graph
        .add_vertex(1, 0)
        .add_vertex(2, 0)
        .add_vertex(3, 0)
        .add_vertex(4, 0);
    graph
        .add_edge(1, 2, ())
        .add_edge(2, 1, ())
        .add_edge(2, 3, ())
        .add_edge(3, 2, ());
    graph
}

/// A ring of `n` vertices where vertex `i` has value `i`
pub fn ring(n: u64) -> TestGraph<G> {
    let graph = TestGraph::<G>::new();
    for id in 0..n {
        graph.add_vertex(id, id);
    }
    for id in 0..n {
        graph.add_edge(id, (id + 1) % n, ());
    }
    graph
}

pub fn values(graph: &TestGraph<G>) -> Vec<(u64, u64)> {
    graph
        .ids()
        .into_iter()
        .filter_map(|id| graph.value(&id).map(|value| (id, value)))
        .collect()
}

/// Every vertex messages its neighbours; each vertex stores how many it got
pub struct CountIncoming;

impl Piece<G> for CountIncoming {
    type Message = bool;
    type Reducers = ();

    fn name(&self) -> &str {
        "count-incoming"
    }

    fn register_reducers(&self, _api: &mut CreateReducersApi) {}

    fn vertex_send(&self, vertex: &mut Vertex<G>, api: &mut SendApi<'_, G, bool>, _: &()) -> Result<()> {
        api.send_message_to_all_edges(vertex, &false)
    }

    fn vertex_receive(
        &self,
        vertex: &mut Vertex<G>,
        messages: Messages<'_, bool>,
        _api: &mut ReceiveApi<'_, G>,
        _: &(),
    ) -> Result<()> {
        vertex.set_value(messages.count() as u64);
        Ok(())
    }
}

/// Adds one to every vertex value
pub struct Increment;

impl Piece<G> for Increment {
    type Message = ();
    type Reducers = ();

    fn name(&self) -> &str {
        "increment"
    }

    fn register_reducers(&self, _api: &mut CreateReducersApi) {}

    fn vertex_send(&self, vertex: &mut Vertex<G>, _api: &mut SendApi<'_, G, ()>, _: &()) -> Result<()> {
        *vertex.value_mut() += 1;
        Ok(())
    }
}

/// Each vertex adds the values of its in-neighbours to its own
pub struct PropagateSum;

impl Piece<G> for PropagateSum {
    type Message = u64;
    type Reducers = ();

    fn name(&self) -> &str {
        "propagate-sum"
    }

    fn register_reducers(&self, _api: &mut CreateReducersApi) {}

    fn vertex_send(&self, vertex: &mut Vertex<G>, api: &mut SendApi<'_, G, u64>, _: &()) -> Result<()> {
        let value = *vertex.value();
        api.send_message_to_all_edges(vertex, &value)
    }

    fn vertex_receive(
        &self,
        vertex: &mut Vertex<G>,
        messages: Messages<'_, u64>,
        _api: &mut ReceiveApi<'_, G>,
        _: &(),
    ) -> Result<()> {
        let incoming: u64 = messages.sum();
        let next = (*vertex.value() + incoming) % 1_000_003;
        vertex.set_value(next);
        Ok(())
    }
}
