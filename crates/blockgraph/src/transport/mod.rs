//! Master/worker transport and worker launch
//!
//! The engine only talks to its peers through [`Transport`]. Delivery is
//! point to point; reports are idempotent because the master deduplicates
//! them by (worker, superstep, epoch). [`LocalTransport`] wires everything
//! up with in-process channels.

use async_trait::async_trait;

use crate::error::Result;
use crate::graph::{GraphTypes, WorkerId};

pub mod local;
pub mod protocol;

pub use local::{LocalEndpoints, LocalTransport, TaskLauncher};
pub use protocol::{
    DataBatch, MasterMessage, PartitionTransfer, SuperstepCommand, SuperstepReport, WorkerMessage,
    WorkerStats,
};

/// Delivery between the master and the workers
#[async_trait]
pub trait Transport<G: GraphTypes>: Send + Sync {
    fn num_workers(&self) -> usize;

    async fn send_to_worker(&self, worker: WorkerId, message: WorkerMessage<G>) -> Result<()>;

    async fn send_to_master(&self, message: MasterMessage) -> Result<()>;

    /// Send a copy of `message` to every worker
    ///
    /// Every worker is attempted even if an earlier one is unreachable; the
    /// first failure is returned.
    async fn broadcast(&self, message: WorkerMessage<G>) -> Result<()> {
        let sends = (0..self.num_workers())
            .map(|index| self.send_to_worker(WorkerId(index), message.clone()));
        futures::future::join_all(sends)
            .await
            .into_iter()
            .collect()
    }
}

/// Brings failed workers back
///
/// Process placement is outside the engine; a launcher only has to make a
/// fresh worker reachable under the same id. The worker then waits for a
/// restore message.
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    async fn restart(&self, worker: WorkerId) -> Result<()>;
}
