//! The master superstep loop

use std::collections::BTreeSet;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::api::MasterApi;
use super::barrier::Barrier;
use crate::block::{ExecutionCursor, ExecutionGraph, MasterDecision, PieceId};
use crate::checkpoint::{CheckpointStore, MasterSnapshot};
use crate::config::BspConfig;
use crate::error::{BspError, Result};
use crate::graph::{GraphTotals, GraphTypes, MutationOutcome, PartitionMap, WorkerId};
use crate::io::GraphOutput;
use crate::reducer::{BroadcastStore, ReducerRegistry};
use crate::transport::{
    MasterMessage, SuperstepCommand, SuperstepReport, Transport, WorkerLauncher, WorkerMessage,
};

/// Outcome of a finished job
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Supersteps executed, counting each replayed superstep once
    pub supersteps: u64,
    /// Recoveries from worker failures
    pub recoveries: u32,
    /// Checkpoints committed with a manifest
    pub checkpoints: u64,
    /// Vertex and edge counts of the final graph
    pub totals: GraphTotals,
    /// Messages sent over the whole job, replays included
    pub messages_sent: u64,
    /// Version of the final partition map; zero if nothing was re-balanced
    pub map_version: u64,
}

/// Everything the master knows at a superstep boundary
pub(super) struct JobState {
    /// Next superstep to run
    pub(super) superstep: u64,
    /// Position in the block tree
    pub(super) cursor: ExecutionCursor,
    /// Piece whose send half runs in `superstep`
    pub(super) send: Option<PieceId>,
    /// Piece whose receive half runs in `superstep`
    pub(super) receive: Option<PieceId>,
    /// Set once master compute returned `Halt`
    pub(super) halting: bool,
    /// Global reducer values
    pub(super) reducers: ReducerRegistry,
    /// Values published by master compute
    pub(super) broadcasts: BroadcastStore,
    pub(super) map: PartitionMap,
    pub(super) totals: GraphTotals,
    /// Vertices that did not halt in the last superstep
    pub(super) active_vertices: u64,
    /// Messages buffered for `superstep`
    pub(super) pending_messages: u64,
    pub(super) messages_sent: u64,
}

impl JobState {
    pub(super) fn initial(config: &BspConfig) -> Self {
        Self {
            superstep: 0,
            cursor: ExecutionCursor::new(),
            send: None,
            receive: None,
            halting: false,
            reducers: ReducerRegistry::new(),
            broadcasts: BroadcastStore::new(),
            map: PartitionMap::new(config.num_workers, config.partitions()),
            totals: GraphTotals::default(),
            active_vertices: 0,
            pending_messages: 0,
            messages_sent: 0,
        }
    }

    pub(super) fn restore<G: GraphTypes>(
        graph: &ExecutionGraph<G>,
        snapshot: MasterSnapshot,
    ) -> Result<Self> {
        let mut reducers = ReducerRegistry::new();
        reducers.import_globals(snapshot.reducers)?;
        let mut broadcasts = BroadcastStore::new();
        broadcasts.replace(snapshot.broadcasts);
        Ok(Self {
            superstep: snapshot.superstep + 1,
            cursor: ExecutionCursor::restore(graph, snapshot.cursor)?,
            send: snapshot.send,
            receive: snapshot.receive,
            halting: snapshot.halting,
            reducers,
            broadcasts,
            map: snapshot.map,
            totals: snapshot.totals,
            active_vertices: snapshot.active_vertices,
            pending_messages: snapshot.pending_messages,
            messages_sent: snapshot.messages_sent,
        })
    }

    pub(super) fn snapshot(&self, superstep: u64) -> Result<MasterSnapshot> {
        Ok(MasterSnapshot {
            superstep,
            cursor: self.cursor.snapshot(),
            send: self.send,
            receive: self.receive,
            halting: self.halting,
            reducers: self.reducers.export_globals()?,
            broadcasts: self.broadcasts.entries(),
            map: self.map.clone(),
            totals: self.totals,
            active_vertices: self.active_vertices,
            pending_messages: self.pending_messages,
            messages_sent: self.messages_sent,
        })
    }

    /// No piece left to run and nothing left in flight
    fn is_terminal(&self) -> bool {
        self.send.is_none()
            && self.receive.is_none()
            && self.pending_messages == 0
            && self.active_vertices == 0
    }
}

/// Drives a job: loads the graph, runs supersteps until termination, writes
/// the output and recovers from worker failures along the way
pub struct MasterCoordinator<G: GraphTypes> {
    pub(super) config: Arc<BspConfig>,
    /// Pieces and control flow of the job
    pub(super) graph: Arc<ExecutionGraph<G>>,
    /// Delivery to the workers
    pub(super) transport: Arc<dyn Transport<G>>,
    /// Brings failed workers back
    pub(super) launcher: Arc<dyn WorkerLauncher>,
    /// Reports, acknowledgements and failures from the workers
    pub(super) inbox: UnboundedReceiver<MasterMessage>,
    pub(super) checkpoints: CheckpointStore,
    /// Receives the final vertices
    pub(super) output: Arc<dyn GraphOutput<G>>,
    /// Bumped on every restore; worker messages from older epochs are ignored
    pub(super) epoch: u64,
    /// State at the current superstep boundary
    pub(super) job: JobState,
    pub(super) recoveries: u32,
    pub(super) checkpoints_written: u64,
}

impl<G: GraphTypes> MasterCoordinator<G> {
    pub fn new(
        config: Arc<BspConfig>,
        graph: Arc<ExecutionGraph<G>>,
        transport: Arc<dyn Transport<G>>,
        launcher: Arc<dyn WorkerLauncher>,
        inbox: UnboundedReceiver<MasterMessage>,
        checkpoints: CheckpointStore,
        output: Arc<dyn GraphOutput<G>>,
    ) -> Self {
        let job = JobState::initial(&config);
        Self {
            config,
            graph,
            transport,
            launcher,
            inbox,
            checkpoints,
            output,
            epoch: 0,
            job,
            recoveries: 0,
            checkpoints_written: 0,
        }
    }

    /// Run the job to completion and shut the workers down
    pub async fn run(mut self) -> Result<RunSummary> {
        let result = self.execute().await;
        if let Err(err) = self.transport.broadcast(WorkerMessage::Shutdown).await {
            debug!(error = %err, "Some workers were already gone at shutdown");
        }
        result
    }

    async fn execute(&mut self) -> Result<RunSummary> {
        info!(
            workers = self.config.num_workers,
            partitions = self.config.partitions(),
            pieces = self.graph.num_pieces(),
            "Job starting"
        );
        if let Err(err) = self.load(None).await {
            self.recover(err).await?;
        }
        loop {
            match self.drive().await {
                Ok(()) => break,
                Err(err) => self.recover(err).await?,
            }
        }

        let summary = RunSummary {
            supersteps: self.job.superstep,
            recoveries: self.recoveries,
            checkpoints: self.checkpoints_written,
            totals: self.job.totals,
            messages_sent: self.job.messages_sent,
            map_version: self.job.map.version(),
        };
        info!(
            supersteps = summary.supersteps,
            recoveries = summary.recoveries,
            vertices = summary.totals.vertices,
            "Job finished"
        );
        Ok(summary)
    }

    /// Supersteps until termination, then the output
    async fn drive(&mut self) -> Result<()> {
        while !self.job.is_terminal() {
            if let Some(limit) = self.config.max_supersteps {
                if self.job.superstep >= limit {
                    return Err(BspError::MaxSuperstepsExceeded { limit });
                }
            }
            let superstep = self.job.superstep;
            self.superstep().await?;
            if self.config.checkpoint.is_due(superstep) {
                self.checkpoint(superstep).await?;
            }
        }
        self.write_output().await
    }

    fn piece_name(&self, piece: Option<PieceId>) -> Option<&str> {
        piece.and_then(|id| self.graph.piece_name(id).ok())
    }

    async fn superstep(&mut self) -> Result<()> {
        let superstep = self.job.superstep;
        let (send, receive) = (self.job.send, self.job.receive);
        for id in [send, receive].into_iter().flatten() {
            let registrations = self.graph.activate(id)?.registrations(id);
            self.job.reducers.register(registrations)?;
        }
        info!(
            superstep,
            epoch = self.epoch,
            send = ?self.piece_name(send),
            receive = ?self.piece_name(receive),
            "Superstep starting"
        );

        let command = SuperstepCommand {
            superstep,
            epoch: self.epoch,
            send,
            receive,
            map: self.job.map.clone(),
            broadcasts: self.job.broadcasts.entries(),
            totals: self.job.totals,
        };
        self.transport
            .broadcast(WorkerMessage::Command(command))
            .await?;

        let reports: Vec<SuperstepReport> = self
            .gather(superstep, |message| match message {
                MasterMessage::Report(report) if report.superstep == superstep => Some(report),
                _ => None,
            })
            .await?;

        let mut totals = GraphTotals::default();
        let mut active = 0;
        let mut pending = 0;
        let mut sent = 0;
        let mut dropped = 0;
        let mut mutations = MutationOutcome::default();
        let mut sizes = Vec::new();
        for report in reports {
            for (id, partial) in &report.partials {
                self.job.reducers.merge_partial(*id, partial)?;
            }
            let stats = report.stats;
            totals += GraphTotals {
                vertices: stats.vertices,
                edges: stats.edges,
            };
            active += stats.active_vertices;
            pending += stats.pending_messages;
            sent += stats.messages_sent;
            dropped += stats.dropped_messages;
            mutations += stats.mutations;
            sizes.extend(stats.partition_sizes);
        }
        self.job.reducers.resolve_all(superstep)?;
        if dropped > 0 {
            warn!(superstep, dropped, "Messages to missing vertices were dropped");
        }

        let halt = self.master_compute(superstep, totals, send, receive)?;
        if halt {
            info!(superstep, piece = ?self.piece_name(send), "Master compute halted the block");
            self.job.halting = true;
        }
        self.job.receive = send;
        self.job.send = if self.job.halting {
            None
        } else {
            self.job.cursor.advance(&self.graph)?
        };

        self.job.map = self
            .job
            .map
            .apply_mutations(&sizes, &self.config.rebalance);

        let mut live: BTreeSet<PieceId> = if self.job.halting {
            BTreeSet::new()
        } else {
            self.job.cursor.reachable_pieces(&self.graph)?
        };
        live.extend(self.job.send);
        live.extend(self.job.receive);
        self.job.reducers.retain(|piece| live.contains(&piece));
        self.job.broadcasts.retain(|piece| live.contains(&piece));

        self.job.totals = totals;
        self.job.active_vertices = active;
        self.job.pending_messages = pending;
        self.job.messages_sent += sent;
        self.job.superstep = superstep + 1;

        info!(
            superstep,
            vertices = totals.vertices,
            edges = totals.edges,
            active,
            sent,
            pending,
            mutations = mutations.applied(),
            skipped_mutations = mutations.skipped,
            map_version = self.job.map.version(),
            "Superstep finished"
        );
        Ok(())
    }

    /// Master compute of the receive piece, then of the send piece
    fn master_compute(
        &mut self,
        superstep: u64,
        totals: GraphTotals,
        send: Option<PieceId>,
        receive: Option<PieceId>,
    ) -> Result<bool> {
        let JobState {
            reducers,
            broadcasts,
            ..
        } = &mut self.job;

        if let Some(id) = receive {
            let mut api = MasterApi::new(superstep, totals, reducers, broadcasts);
            self.graph
                .activate(id)?
                .master_compute_after_receive(&mut api)?;
        }
        let decision = match send {
            Some(id) => {
                let mut api = MasterApi::new(superstep, totals, reducers, broadcasts);
                self.graph.activate(id)?.master_compute(&mut api)?
            }
            None => MasterDecision::Continue,
        };
        Ok(decision == MasterDecision::Halt)
    }

    async fn write_output(&mut self) -> Result<()> {
        self.output.prepare().await?;
        let epoch = self.epoch;
        self.transport
            .broadcast(WorkerMessage::WriteOutput { epoch })
            .await?;
        self.gather(self.job.superstep, |message| match message {
            MasterMessage::OutputWritten { .. } => Some(()),
            _ => None,
        })
        .await?;
        info!(supersteps = self.job.superstep, "Output written");
        Ok(())
    }

    /// Wait for one accepted response from every worker of this epoch
    ///
    /// A failure report from any worker aborts the wait. So does the
    /// liveness timeout, which names the workers that never answered.
    pub(super) async fn gather<T>(
        &mut self,
        superstep: u64,
        mut accept: impl FnMut(MasterMessage) -> Option<T>,
    ) -> Result<Vec<T>> {
        let mut barrier = Barrier::new(self.config.num_workers);
        let deadline = Instant::now() + self.config.superstep_timeout;

        while !barrier.is_complete() {
            let message = match tokio::time::timeout_at(deadline, self.inbox.recv()).await {
                Ok(Some(message)) => message,
                Ok(None) => return Err(BspError::Transport("master inbox closed".into())),
                Err(_) => {
                    let workers = barrier.missing();
                    warn!(superstep, missing = ?workers, "Barrier timed out");
                    return Err(BspError::WorkerTimeout { workers, superstep });
                }
            };
            if message.epoch() != self.epoch {
                debug!(epoch = message.epoch(), current = self.epoch, "Dropping stale message");
                continue;
            }
            let worker = message.worker();
            if let MasterMessage::Failed {
                message,
                recoverable,
                implicated,
                ..
            } = message
            {
                return Err(failure(worker, message, recoverable, implicated));
            }
            match accept(message) {
                Some(response) => {
                    if !barrier.arrive(worker, response) {
                        debug!(%worker, superstep, "Duplicate response ignored");
                    }
                }
                None => debug!(%worker, superstep, "Unexpected message ignored"),
            }
        }
        Ok(barrier.into_responses())
    }
}

fn failure(reporter: WorkerId, message: String, recoverable: bool, implicated: Vec<WorkerId>) -> BspError {
    let worker = implicated.first().copied().unwrap_or(reporter);
    if worker != reporter {
        warn!(%reporter, %worker, "Worker reported a failed peer");
    }
    BspError::WorkerFailed {
        worker,
        message,
        recoverable,
    }
}
