//! Run a block in one process
//!
//! [`LocalBlockRunner`] wires a master and `num_workers` workers together
//! over [`LocalTransport`], each worker in its own tokio task. It is the
//! in-process counterpart of a cluster deployment and what the tests use.
//!
//! ```no_run
//! use blockgraph::block::Block;
//! use blockgraph::config::BspConfig;
//! use blockgraph::graph::Types;
//! use blockgraph::io::TestGraph;
//! use blockgraph::pieces::ForAllVertices;
//! use blockgraph::runner::LocalBlockRunner;
//!
//! type G = Types<u64, u64, ()>;
//!
//! # async fn example() -> blockgraph::error::Result<()> {
//! let graph = TestGraph::<G>::new();
//! graph.add_vertex(1, 1).add_vertex(2, 2);
//!
//! let double = ForAllVertices::<G>::new("double", |vertex| {
//!     let value = *vertex.value();
//!     vertex.set_value(value * 2);
//!     Ok(())
//! });
//! let summary = LocalBlockRunner::new(BspConfig::new(2))
//!     .run_on_graph(Block::piece(double), &graph)
//!     .await?;
//! assert_eq!(graph.value(&2), Some(4));
//! assert_eq!(summary.totals.vertices, 2);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use tracing::{error, warn};

use crate::block::{Block, ExecutionGraph};
use crate::checkpoint::CheckpointStore;
use crate::config::BspConfig;
use crate::error::Result;
use crate::graph::{GraphTypes, WorkerId};
use crate::io::{GraphInput, GraphOutput, TestGraph};
use crate::master::{MasterCoordinator, RunSummary};
use crate::storage::{DurableStorage, MemoryStorage};
use crate::transport::{LocalTransport, TaskLauncher, Transport, WorkerLauncher};
use crate::worker::{FaultPlan, InjectedFault, WorkerEngine, WorkerSetup};

/// Runs jobs with every worker in the current process
pub struct LocalBlockRunner {
    config: BspConfig,
    storage: Arc<dyn DurableStorage>,
    fault: Option<InjectedFault>,
}

impl LocalBlockRunner {
    /// Runner with in-memory checkpoint storage
    pub fn new(config: BspConfig) -> Self {
        Self {
            config,
            storage: Arc::new(MemoryStorage::new()),
            fault: None,
        }
    }

    /// Keep checkpoints somewhere else, e.g. a [`FileStorage`](crate::storage::FileStorage)
    pub fn with_storage(mut self, storage: Arc<dyn DurableStorage>) -> Self {
        self.storage = storage;
        self
    }

    /// Make one worker fail once
    pub fn with_fault(mut self, fault: InjectedFault) -> Self {
        self.fault = Some(fault);
        self
    }

    pub fn config(&self) -> &BspConfig {
        &self.config
    }

    pub async fn run<G: GraphTypes>(
        &self,
        block: Block<G>,
        input: Arc<dyn GraphInput<G>>,
        output: Arc<dyn GraphOutput<G>>,
    ) -> Result<RunSummary> {
        self.config.validate()?;
        let config = Arc::new(self.config.clone());
        let graph = Arc::new(ExecutionGraph::new(block));
        let (local, endpoints) = LocalTransport::<G>::new(config.num_workers);
        let transport: Arc<dyn Transport<G>> = local.clone();
        let checkpoints = CheckpointStore::new(Arc::clone(&self.storage), config.checkpoint.clone());

        let setup = WorkerSetup {
            config: Arc::clone(&config),
            graph: Arc::clone(&graph),
            transport: Arc::clone(&transport),
            checkpoints: checkpoints.clone(),
            input,
            output: Arc::clone(&output),
            fault: self.fault.map(|fault| Arc::new(FaultPlan::new(fault))),
        };
        let tasks = Arc::new(TaskLauncher::new(local, move |worker, inbox| {
            let setup = setup.clone();
            tokio::spawn(async move {
                let engine = match WorkerEngine::new(worker, setup, inbox) {
                    Ok(engine) => engine,
                    Err(err) => {
                        error!(%worker, error = %err, "Worker could not start");
                        return;
                    }
                };
                if let Err(err) = engine.run().await {
                    warn!(%worker, error = %err, "Worker stopped with an error");
                }
            })
        }));
        for (index, inbox) in endpoints.workers.into_iter().enumerate() {
            tasks.launch(WorkerId(index), inbox);
        }

        let launcher: Arc<dyn WorkerLauncher> = tasks.clone();
        let master = MasterCoordinator::new(
            config,
            graph,
            transport,
            launcher,
            endpoints.master,
            checkpoints,
            output,
        );
        let result = master.run().await;
        tasks.join_all().await;
        result
    }

    /// Run with `graph` as both input and output
    pub async fn run_on_graph<G: GraphTypes>(
        &self,
        block: Block<G>,
        graph: &TestGraph<G>,
    ) -> Result<RunSummary> {
        self.run(block, Arc::new(graph.clone()), Arc::new(graph.clone()))
            .await
    }
}

/// Run a block on a test graph from synchronous code
pub fn run_block<G: GraphTypes>(
    config: BspConfig,
    block: Block<G>,
    graph: &TestGraph<G>,
) -> Result<RunSummary> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(LocalBlockRunner::new(config).run_on_graph(block, graph))
}
