use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rayon::iter::{IntoParallelIterator, ParallelIterator};

use blockgraph::block::{Block, Piece};
use blockgraph::codec;
use blockgraph::config::BspConfig;
use blockgraph::error::Result;
use blockgraph::graph::{Types, Vertex};
use blockgraph::io::TestGraph;
use blockgraph::message::{MessageCombiner, MessageStore, Messages, SumCombiner};
use blockgraph::reducer::CreateReducersApi;
use blockgraph::runner::LocalBlockRunner;
use blockgraph::worker::{ReceiveApi, SendApi};

type G = Types<u64, u64, ()>;

// 1) Raw store: parallel sends into a fixed set of destinations, then a swap
fn bench_store(c: &mut Criterion) {
    let mut group = c.benchmark_group("message_store");

    for &(messages, destinations) in &[(10_000u64, 100u64), (100_000, 1_000), (100_000, 100_000)] {
        let payloads: Vec<_> = (0..messages)
            .map(|i| codec::encode(&i))
            .collect::<Result<_>>()
            .unwrap_or_default();
        group.throughput(Throughput::Elements(messages));
        group.bench_with_input(
            BenchmarkId::new("send_advance_drain", format!("{messages}x{destinations}")),
            &payloads,
            |b, payloads| {
                b.iter(|| {
                    let mut store = MessageStore::<u64>::new();
                    (0..payloads.len()).into_par_iter().for_each(|i| {
                        let _ = store.send(i as u64 % destinations, payloads[i].clone());
                    });
                    store.advance(|_| true);
                    (0..destinations).map(|id| store.drain(&id).len()).sum::<usize>()
                })
            },
        );
    }
    group.finish();
}

/// Sum of in-neighbour values, optionally combined while buffered
struct Spread {
    combine: bool,
}

impl Piece<G> for Spread {
    type Message = u64;
    type Reducers = ();

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
        vertex.set_value(messages.fold(0, u64::wrapping_add) % 1_000_003);
        Ok(())
    }

    fn message_combiner(&self) -> Option<Arc<dyn MessageCombiner<u64>>> {
        self.combine
            .then(|| Arc::new(SumCombiner) as Arc<dyn MessageCombiner<u64>>)
    }
}

fn dense_graph(n: u64, degree: u64) -> TestGraph<G> {
    let graph = TestGraph::<G>::new();
    for id in 0..n {
        graph.add_vertex(id, id);
    }
    for id in 0..n {
        for k in 1..=degree {
            graph.add_edge(id, (id * 31 + k * 17) % n, ());
        }
    }
    graph
}

// 2) Whole supersteps over the local runner, with and without a combiner
fn bench_supersteps(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("supersteps");
    group.sample_size(10);

    let graph = &dense_graph(5_000, 8);
    for combine in [false, true] {
        for workers in [1usize, 4] {
            let runner = &LocalBlockRunner::new(BspConfig::new(workers));
            group.bench_function(
                BenchmarkId::new(if combine { "combined" } else { "plain" }, workers),
                |b| {
                    b.to_async(&runtime).iter(|| async move {
                        let block = Block::repeat(3, Block::piece(Spread { combine }));
                        runner.run_on_graph(block, graph).await
                    })
                },
            );
        }
    }
    group.finish();
}

criterion_group!(benches, bench_store, bench_supersteps);
criterion_main!(benches);
