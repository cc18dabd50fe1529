//! Checkpoint coordination and failure recovery on the master
//!
//! ```text
//!  failure ─► backoff ─► restart failed workers ─► epoch + 1
//!                                                    │
//!        resume ◄── Restored barrier ◄── Restore(latest complete checkpoint)
//! ```
//!
//! A new epoch makes every worker drop traffic from before the failure, so
//! the replay starts from a clean slate even if old messages are still in
//! flight.

use tracing::{error, info, warn};

use super::coordinator::{JobState, MasterCoordinator};
use crate::error::{BspError, Result};
use crate::graph::{GraphTotals, GraphTypes, WorkerId};
use crate::transport::{MasterMessage, WorkerMessage};

impl<G: GraphTypes> MasterCoordinator<G> {
    /// Recover from `err`, retrying until a reload succeeds or the retry
    /// policy gives up
    pub(super) async fn recover(&mut self, mut err: BspError) -> Result<()> {
        loop {
            if !err.is_recoverable() {
                error!(error = %err, "Unrecoverable failure");
                return Err(err);
            }
            if self.recoveries >= self.config.retry.max_attempts {
                error!(attempts = self.recoveries, error = %err, "Retries exhausted");
                return Err(BspError::RetriesExhausted {
                    attempts: self.recoveries,
                    last: Box::new(err),
                });
            }
            self.recoveries += 1;
            let delay = self.config.retry.delay_for(self.recoveries);
            warn!(
                attempt = self.recoveries,
                delay = ?delay,
                error = %err,
                "Recovering"
            );
            tokio::time::sleep(delay).await;

            match self.restart(err.failed_workers()).await {
                Ok(()) => return Ok(()),
                Err(next) => err = next,
            }
        }
    }

    async fn restart(&mut self, failed: Vec<WorkerId>) -> Result<()> {
        for worker in failed {
            self.launcher.restart(worker).await?;
        }
        self.epoch += 1;

        let manifest = self.checkpoints.latest_complete().await?;
        self.job = match &manifest {
            Some(manifest) => {
                let snapshot = self.checkpoints.read_master(manifest.superstep).await?;
                JobState::restore(&self.graph, snapshot)?
            }
            None => JobState::initial(&self.config),
        };
        self.load(manifest.map(|manifest| manifest.superstep)).await
    }

    /// Reset every worker to a checkpoint, or to the graph input
    pub(super) async fn load(&mut self, checkpoint: Option<u64>) -> Result<()> {
        let epoch = self.epoch;
        self.transport
            .broadcast(WorkerMessage::Restore {
                checkpoint,
                epoch,
                map: self.job.map.clone(),
            })
            .await?;

        let loaded = self
            .gather(self.job.superstep, |message| match message {
                MasterMessage::Restored {
                    vertices, edges, ..
                } => Some(GraphTotals { vertices, edges }),
                _ => None,
            })
            .await?;
        let mut totals = GraphTotals::default();
        for worker in loaded {
            totals += worker;
        }

        if checkpoint.is_none() {
            self.job.totals = totals;
            self.job.active_vertices = totals.vertices;
            self.job.pending_messages = 0;
            self.job.send = self.job.cursor.advance(&self.graph)?;
        } else if totals != self.job.totals {
            warn!(
                restored = ?totals,
                checkpointed = ?self.job.totals,
                "Restored graph size differs from the checkpoint"
            );
        }
        info!(
            epoch,
            checkpoint = ?checkpoint,
            superstep = self.job.superstep,
            vertices = totals.vertices,
            edges = totals.edges,
            "Workers loaded"
        );
        Ok(())
    }

    /// Checkpoint the boundary after `superstep`
    ///
    /// A failed write only skips this checkpoint; a worker that stops
    /// answering is a failure like any other.
    pub(super) async fn checkpoint(&mut self, superstep: u64) -> Result<()> {
        let epoch = self.epoch;
        self.transport
            .broadcast(WorkerMessage::Checkpoint { superstep, epoch })
            .await?;
        let acks = self
            .gather(superstep, |message| match message {
                MasterMessage::CheckpointAck {
                    superstep: acked,
                    result,
                    ..
                } if acked == superstep => Some(result),
                _ => None,
            })
            .await?;

        match self.commit(superstep, acks).await {
            Ok(()) => {
                self.checkpoints_written += 1;
                if let Err(err) = self.checkpoints.prune().await {
                    warn!(superstep, error = %err, "Checkpoint pruning failed");
                }
            }
            Err(err) => {
                let err = BspError::CheckpointWriteFailure {
                    superstep,
                    message: err.to_string(),
                };
                warn!(error = %err, "Skipping checkpoint");
            }
        }
        Ok(())
    }

    async fn commit(
        &self,
        superstep: u64,
        acks: Vec<std::result::Result<String, String>>,
    ) -> Result<()> {
        let mut files = acks
            .into_iter()
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(BspError::Storage)?;
        let snapshot = self.job.snapshot(superstep)?;
        files.push(self.checkpoints.write_master(&snapshot).await?);
        self.checkpoints
            .commit(superstep, self.config.num_workers, files)
            .await?;
        Ok(())
    }
}
