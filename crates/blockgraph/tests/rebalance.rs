//! Partition re-balancing and migration between supersteps

mod common;

use std::time::Duration;

use blockgraph::block::Block;
use blockgraph::config::{BspConfig, RebalanceConfig};
use blockgraph::graph::{PartitionMap, WorkerId};
use blockgraph::io::TestGraph;
use blockgraph::runner::LocalBlockRunner;
use blockgraph::worker::InjectedFault;

use common::{init_tracing, values, PropagateSum, G};

const WORKERS: usize = 2;
const PARTITIONS: usize = 8;
const ROUNDS: u32 = 4;

/// Ten vertices in every partition of worker 0, one in each of worker 1,
/// chained into a ring so messages cross partitions
fn skewed_graph() -> TestGraph<G> {
    let map = PartitionMap::new(WORKERS, PARTITIONS);
    let mut per_partition = vec![0usize; PARTITIONS];
    let mut ids = Vec::new();
    for id in 0u64.. {
        let partition = map.partition_of(&id);
        let wanted = if map.owner_of_partition(partition) == WorkerId(0) {
            10
        } else {
            1
        };
        if per_partition[partition.0 as usize] < wanted {
            per_partition[partition.0 as usize] += 1;
            ids.push(id);
        }
        if ids.len() == 44 {
            break;
        }
    }

    let graph = TestGraph::<G>::new();
    for id in &ids {
        graph.add_vertex(*id, id % 97);
    }
    for (index, id) in ids.iter().enumerate() {
        graph.add_edge(*id, ids[(index + 1) % ids.len()], ());
    }
    graph
}

fn job() -> Block<G> {
    Block::repeat(ROUNDS, Block::piece(PropagateSum))
}

fn base_config() -> BspConfig {
    common::config(WORKERS)
        .with_partitions(PARTITIONS)
        .with_superstep_timeout(Duration::from_secs(2))
}

fn rebalancing() -> BspConfig {
    base_config().with_rebalance(RebalanceConfig {
        enabled: true,
        imbalance_threshold: 0.25,
    })
}

async fn static_run() -> Vec<(u64, u64)> {
    let graph = skewed_graph();
    let summary = LocalBlockRunner::new(base_config())
        .run_on_graph(job(), &graph)
        .await
        .unwrap();
    assert_eq!(summary.map_version, 0);
    values(&graph)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_migrated_partitions_keep_their_vertices_and_messages() {
    init_tracing();
    let expected = static_run().await;

    let graph = skewed_graph();
    let summary = LocalBlockRunner::new(rebalancing())
        .run_on_graph(job(), &graph)
        .await
        .unwrap();

    assert!(summary.map_version > 0, "no partition was moved");
    assert_eq!(values(&graph), expected);
    assert_eq!(summary.totals.vertices, 44);
    assert_eq!(summary.totals.edges, 44);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_crash_after_migration_replays_the_moved_map() {
    let expected = static_run().await;

    let graph = skewed_graph();
    let summary = LocalBlockRunner::new(rebalancing().with_checkpoint_frequency(2))
        .with_fault(InjectedFault::CrashWorker {
            worker: WorkerId(1),
            superstep: 4,
        })
        .run_on_graph(job(), &graph)
        .await
        .unwrap();

    assert_eq!(summary.recoveries, 1);
    assert!(summary.map_version > 0);
    assert_eq!(values(&graph), expected);
}
