//! Public API surface: thread-safety and configuration entry points

mod common;

use static_assertions::assert_impl_all;

use blockgraph::block::{Block, ExecutionGraph, Transfer};
use blockgraph::config::BspConfig;
use blockgraph::error::BspError;
use blockgraph::message::MessageStore;
use blockgraph::reducer::{ReducerHandle, SumReduce};
use blockgraph::runner::LocalBlockRunner;
use blockgraph::storage::{FileStorage, MemoryStorage};

use common::{small_graph, Increment, G};

assert_impl_all!(LocalBlockRunner: Send, Sync);
assert_impl_all!(Block<G>: Send, Sync);
assert_impl_all!(ExecutionGraph<G>: Send, Sync);
assert_impl_all!(Transfer<u64>: Send, Sync, Clone);
assert_impl_all!(MessageStore<u64>: Send, Sync);
assert_impl_all!(ReducerHandle<SumReduce<u64>>: Send, Sync, Copy);
assert_impl_all!(MemoryStorage: Send, Sync);
assert_impl_all!(FileStorage: Send, Sync, Clone);
assert_impl_all!(BspError: Send, Sync, std::error::Error);

#[test]
fn test_config_from_json() {
    let config = BspConfig::from_json_str(
        r#"{
            "num_workers": 3,
            "superstep_timeout": "5s",
            "checkpoint": { "frequency": 10 },
            "retry": { "max_attempts": 1, "initial_backoff": "20ms" }
        }"#,
    )
    .unwrap();

    assert_eq!(config.num_workers, 3);
    assert_eq!(config.partitions(), 12);
    assert_eq!(config.superstep_timeout, std::time::Duration::from_secs(5));
    assert!(config.checkpoint.is_due(9));
    assert!(!config.checkpoint.is_due(10));
    assert_eq!(config.retry.max_attempts, 1);
}

#[tokio::test]
async fn test_invalid_config_is_rejected_before_start() {
    let graph = small_graph();
    let err = LocalBlockRunner::new(BspConfig::new(0))
        .run_on_graph(Block::piece(Increment), &graph)
        .await
        .unwrap_err();

    assert!(matches!(err, BspError::Config(_)), "{err}");
    assert_eq!(graph.value(&1), Some(0));
}
