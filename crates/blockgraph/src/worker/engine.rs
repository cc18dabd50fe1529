//! The worker event loop
//!
//! ```text
//!  Command(s) ─► migrate ─► compute (rayon) ─► exchange batches ─► apply mutations
//!                                                                      │
//!        Report(s) ◄── take partials ◄── advance message store ◄───────┘
//! ```
//!
//! A worker only blocks while waiting for its next message or for peer
//! batches. A `Restore` or `Shutdown` arriving during the wait abandons the
//! superstep.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};

use super::api::WorkerApi;
use super::compute::{compute_partitions, ComputeOutcome, SuperstepPlan};
use crate::block::{ExecutionGraph, PieceId};
use crate::checkpoint::{CheckpointStore, WorkerSnapshot};
use crate::config::BspConfig;
use crate::error::{BspError, Result};
use crate::graph::mutation::apply_batch;
use crate::graph::{
    GraphTotals, GraphTypes, MutationRecord, Partition, PartitionMap, PartitionStore, WorkerId,
};
use crate::io::{GraphInput, GraphOutput};
use crate::message::MessageStore;
use crate::reducer::{BroadcastStore, ReducerRegistry};
use crate::transport::{
    DataBatch, MasterMessage, PartitionTransfer, SuperstepCommand, SuperstepReport, Transport,
    WorkerMessage, WorkerStats,
};

/// A failure to inject into a run, for recovery tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFault {
    /// The worker task exits when it receives the command for `superstep`
    CrashWorker { worker: WorkerId, superstep: u64 },
}

/// An injected fault that fires at most once across worker restarts
#[derive(Debug)]
pub struct FaultPlan {
    fault: InjectedFault,
    fired: AtomicBool,
}

impl FaultPlan {
    pub fn new(fault: InjectedFault) -> Self {
        Self {
            fault,
            fired: AtomicBool::new(false),
        }
    }

    fn fires(&self, worker: WorkerId, superstep: u64) -> bool {
        let InjectedFault::CrashWorker {
            worker: target,
            superstep: at,
        } = self.fault;
        target == worker
            && at == superstep
            && !self.fired.swap(true, Ordering::SeqCst)
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}

/// Everything needed to start, or restart, a worker
pub struct WorkerSetup<G: GraphTypes> {
    pub config: Arc<BspConfig>,
    /// Pieces of the job, shared with the master
    pub graph: Arc<ExecutionGraph<G>>,
    /// Delivery to the master and to peer workers
    pub transport: Arc<dyn Transport<G>>,
    /// Where snapshots are written and restored from
    pub checkpoints: CheckpointStore,
    /// Initial vertices; each worker keeps the ones it owns
    pub input: Arc<dyn GraphInput<G>>,
    /// Receives this worker's vertices when the job finishes
    pub output: Arc<dyn GraphOutput<G>>,
    /// Crash to inject, shared across restarts so it fires once
    pub fault: Option<Arc<FaultPlan>>,
}

impl<G: GraphTypes> Clone for WorkerSetup<G> {
    fn clone(&self) -> Self {
        Self {
            config: Arc::clone(&self.config),
            graph: Arc::clone(&self.graph),
            transport: Arc::clone(&self.transport),
            checkpoints: self.checkpoints.clone(),
            input: Arc::clone(&self.input),
            output: Arc::clone(&self.output),
            fault: self.fault.clone(),
        }
    }
}

/// Graph state owned by one worker
struct WorkerState<G: GraphTypes> {
    /// Partitions this worker owns under `map`
    partitions: PartitionStore<G>,
    /// Inboxes of the local vertices
    store: MessageStore<G::Id>,
    /// Local partials of the live reducers
    reducers: ReducerRegistry,
    /// Broadcasts of the current superstep
    broadcasts: BroadcastStore,
    map: PartitionMap,
}

impl<G: GraphTypes> WorkerState<G> {
    fn new(worker: WorkerId, map: PartitionMap) -> Self {
        Self {
            partitions: PartitionStore::for_worker(&map, worker),
            store: MessageStore::new(),
            reducers: ReducerRegistry::new(),
            broadcasts: BroadcastStore::new(),
            map,
        }
    }

    fn compute(
        &mut self,
        graph: &ExecutionGraph<G>,
        worker: WorkerId,
        command: &SuperstepCommand,
    ) -> Result<ComputeOutcome<G>> {
        let send = command.send.map(|id| graph.activate(id)).transpose()?;
        let receive = command.receive.map(|id| graph.activate(id)).transpose()?;
        let api = WorkerApi::new(
            worker,
            command.superstep,
            command.totals,
            &self.reducers,
            &self.broadcasts,
        );
        let plan = SuperstepPlan {
            worker,
            superstep: command.superstep,
            send,
            receive,
            api,
            map: &self.map,
        };
        compute_partitions(&mut self.partitions, &self.store, &plan)
    }
}

/// One worker of a BSP job
pub struct WorkerEngine<G: GraphTypes> {
    id: WorkerId,
    setup: WorkerSetup<G>,
    /// Commands from the master and batches from peers
    inbox: UnboundedReceiver<WorkerMessage<G>>,
    /// Vertex compute threads, sized by `worker_threads`
    pool: Arc<rayon::ThreadPool>,
    /// `None` until the graph is loaded or restored
    state: Option<WorkerState<G>>,
    /// Epoch of the last load or restore
    epoch: u64,
    /// Message that interrupted a superstep, handled next
    interrupt: Option<WorkerMessage<G>>,
    /// Peer traffic that arrived before it was needed
    early: VecDeque<WorkerMessage<G>>,
}

enum Exchange<G: GraphTypes> {
    Complete(Vec<DataBatch<G>>),
    Interrupted,
}

impl<G: GraphTypes> WorkerEngine<G> {
    pub fn new(
        id: WorkerId,
        setup: WorkerSetup<G>,
        inbox: UnboundedReceiver<WorkerMessage<G>>,
    ) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(setup.config.worker_threads)
            .thread_name(move |index| format!("{id}-compute-{index}"))
            .build()
            .map_err(|e| BspError::Config(format!("cannot build compute pool: {e}")))?;
        Ok(Self {
            id,
            setup,
            inbox,
            pool: Arc::new(pool),
            state: None,
            epoch: 0,
            interrupt: None,
            early: VecDeque::new(),
        })
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    fn state_mut(&mut self) -> Result<&mut WorkerState<G>> {
        self.state
            .as_mut()
            .ok_or_else(|| BspError::worker_failed(self.id, "no graph loaded"))
    }

    async fn next_message(&mut self) -> Option<WorkerMessage<G>> {
        match self.interrupt.take() {
            Some(message) => Some(message),
            None => self.inbox.recv().await,
        }
    }

    /// Process messages until shutdown, or until an injected crash
    pub async fn run(mut self) -> Result<()> {
        info!(worker = %self.id, "Worker started");

        while let Some(message) = self.next_message().await {
            match message {
                WorkerMessage::Shutdown => {
                    info!(worker = %self.id, "Worker shutting down");
                    break;
                }
                WorkerMessage::Restore {
                    checkpoint,
                    epoch,
                    map,
                } => {
                    let reply = match self.restore(checkpoint, epoch, map).await {
                        Ok((vertices, edges)) => MasterMessage::Restored {
                            worker: self.id,
                            epoch,
                            vertices,
                            edges,
                        },
                        Err(err) => self.failure(err),
                    };
                    self.setup.transport.send_to_master(reply).await?;
                }
                WorkerMessage::Command(command) => {
                    if command.epoch != self.epoch {
                        debug!(worker = %self.id, epoch = command.epoch, "Ignoring stale command");
                        continue;
                    }
                    let crashes = self
                        .setup
                        .fault
                        .as_ref()
                        .is_some_and(|plan| plan.fires(self.id, command.superstep));
                    if crashes {
                        warn!(worker = %self.id, superstep = command.superstep, "Injected crash");
                        return Ok(());
                    }

                    match self.superstep(command).await {
                        Ok(Some(report)) => {
                            self.setup
                                .transport
                                .send_to_master(MasterMessage::Report(report))
                                .await?
                        }
                        Ok(None) => {}
                        Err(err) => {
                            let failure = self.failure(err);
                            self.setup.transport.send_to_master(failure).await?;
                        }
                    }
                }
                WorkerMessage::Checkpoint { superstep, epoch } => {
                    if epoch != self.epoch {
                        continue;
                    }
                    let result = self
                        .checkpoint(superstep)
                        .await
                        .map_err(|err| err.to_string());
                    self.setup
                        .transport
                        .send_to_master(MasterMessage::CheckpointAck {
                            worker: self.id,
                            superstep,
                            epoch,
                            result,
                        })
                        .await?;
                }
                WorkerMessage::WriteOutput { epoch } => {
                    if epoch != self.epoch {
                        continue;
                    }
                    let reply = match self.write_output().await {
                        Ok(()) => MasterMessage::OutputWritten {
                            worker: self.id,
                            epoch,
                        },
                        Err(err) => self.failure(err),
                    };
                    self.setup.transport.send_to_master(reply).await?;
                }
                message @ (WorkerMessage::Data(_) | WorkerMessage::Migrate(_)) => {
                    self.keep_if_current(message);
                }
            }
        }
        Ok(())
    }

    fn failure(&self, err: BspError) -> MasterMessage {
        warn!(worker = %self.id, epoch = self.epoch, error = %err, "Worker failure");
        MasterMessage::Failed {
            worker: self.id,
            epoch: self.epoch,
            message: err.to_string(),
            recoverable: err.is_recoverable(),
            implicated: err.failed_workers(),
        }
    }

    fn keep_if_current(&mut self, message: WorkerMessage<G>) {
        let epoch = match &message {
            WorkerMessage::Data(batch) => batch.epoch,
            WorkerMessage::Migrate(transfer) => transfer.epoch,
            _ => return,
        };
        if epoch == self.epoch {
            self.early.push_back(message);
        } else {
            debug!(worker = %self.id, epoch, "Dropping peer traffic from another epoch");
        }
    }

    async fn superstep(&mut self, command: SuperstepCommand) -> Result<Option<SuperstepReport>> {
        let superstep = command.superstep;
        debug!(
            worker = %self.id,
            superstep,
            send = ?command.send,
            receive = ?command.receive,
            "Superstep starting"
        );

        if command.map.version() != self.state_mut()?.map.version() && !self.migrate(&command).await? {
            return Ok(None);
        }
        self.prepare(&command)?;

        let mut outcome = self.compute(&command).await?;

        let num_workers = command.map.num_workers();
        for index in (0..num_workers).filter(|index| *index != self.id.index()) {
            let peer = WorkerId(index);
            let batch = DataBatch {
                superstep,
                epoch: self.epoch,
                from: self.id,
                messages: outcome.remote.remove(&peer).unwrap_or_default(),
                mutations: outcome.mutations.remove(&peer).unwrap_or_default(),
            };
            self.setup
                .transport
                .send_to_worker(peer, WorkerMessage::Data(batch))
                .await?;
        }

        let batches = match self.collect_batches(superstep, num_workers - 1).await? {
            Exchange::Complete(batches) => batches,
            Exchange::Interrupted => return Ok(None),
        };

        let id = self.id;
        let epoch = self.epoch;
        let state = self.state_mut()?;
        let mut mutations: Vec<MutationRecord<G>> =
            outcome.mutations.remove(&id).unwrap_or_default();
        for batch in batches {
            for (destination, payload) in batch.messages {
                state.store.send(destination, payload)?;
            }
            mutations.extend(batch.mutations);
        }

        let applied = apply_batch(&mut state.partitions, &state.map, id, mutations)?;
        let WorkerState {
            partitions,
            store,
            map,
            reducers,
            ..
        } = state;
        let advanced = store.advance(|vertex| partitions.contains(map, vertex));

        let stats = WorkerStats {
            vertices: partitions.num_vertices(),
            edges: partitions.num_edges(),
            active_vertices: partitions.num_active(),
            messages_sent: outcome.messages_sent,
            pending_messages: advanced.delivered,
            dropped_messages: advanced.dropped,
            partition_sizes: partitions.sizes(),
            mutations: applied,
        };
        debug!(
            worker = %id,
            superstep,
            computed = outcome.vertices_computed,
            sent = stats.messages_sent,
            pending = stats.pending_messages,
            active = stats.active_vertices,
            "Superstep finished"
        );

        Ok(Some(SuperstepReport {
            worker: id,
            superstep,
            epoch,
            partials: reducers.take_partials()?,
            stats,
        }))
    }

    /// Register the superstep's pieces and adopt the master's broadcasts
    fn prepare(&mut self, command: &SuperstepCommand) -> Result<()> {
        let graph = Arc::clone(&self.setup.graph);
        let state = self.state_mut()?;
        let live = |piece: PieceId| Some(piece) == command.send || Some(piece) == command.receive;

        state.reducers.retain(live);
        for id in [command.send, command.receive].into_iter().flatten() {
            state.reducers.register(graph.activate(id)?.registrations(id))?;
        }
        state.broadcasts.replace(command.broadcasts.iter().cloned());

        let combiner = match command.send {
            Some(id) => graph.activate(id)?.combiner(),
            None => None,
        };
        state.store.set_combiner(combiner);
        state.map = command.map.clone();
        Ok(())
    }

    async fn compute(&mut self, command: &SuperstepCommand) -> Result<ComputeOutcome<G>> {
        let mut state = self
            .state
            .take()
            .ok_or_else(|| BspError::worker_failed(self.id, "no graph loaded"))?;
        let graph = Arc::clone(&self.setup.graph);
        let pool = Arc::clone(&self.pool);
        let worker = self.id;
        let command = command.clone();

        let (state, outcome) = tokio::task::spawn_blocking(move || {
            let outcome = pool.install(|| state.compute(&graph, worker, &command));
            (state, outcome)
        })
        .await
        .map_err(|e| BspError::worker_failed(worker, format!("compute task failed: {e}")))?;

        self.state = Some(state);
        outcome
    }

    async fn collect_batches(&mut self, superstep: u64, expected: usize) -> Result<Exchange<G>> {
        let mut batches: BTreeMap<WorkerId, DataBatch<G>> = BTreeMap::new();
        let mut later = VecDeque::new();

        while let Some(message) = self.early.pop_front() {
            match message {
                WorkerMessage::Data(batch) if batch.superstep == superstep => {
                    batches.insert(batch.from, batch);
                }
                other => later.push_back(other),
            }
        }
        self.early = later;

        while batches.len() < expected {
            let message = self
                .inbox
                .recv()
                .await
                .ok_or_else(|| BspError::Transport(format!("{} inbox closed", self.id)))?;
            match message {
                WorkerMessage::Data(batch)
                    if batch.epoch == self.epoch && batch.superstep == superstep =>
                {
                    if batches.insert(batch.from, batch).is_some() {
                        debug!(worker = %self.id, superstep, "Duplicate batch ignored");
                    }
                }
                message @ (WorkerMessage::Data(_) | WorkerMessage::Migrate(_)) => {
                    self.keep_if_current(message);
                }
                message @ (WorkerMessage::Restore { .. } | WorkerMessage::Shutdown) => {
                    info!(worker = %self.id, superstep, "Superstep interrupted");
                    self.interrupt = Some(message);
                    return Ok(Exchange::Interrupted);
                }
                other => {
                    warn!(worker = %self.id, superstep, message = ?other, "Unexpected message during exchange");
                }
            }
        }
        Ok(Exchange::Complete(batches.into_values().collect()))
    }

    /// Ship partitions that changed owner and wait for the incoming ones
    async fn migrate(&mut self, command: &SuperstepCommand) -> Result<bool> {
        let id = self.id;
        let epoch = self.epoch;
        let superstep = command.superstep;
        let next = &command.map;

        let state = self.state_mut()?;
        let moves = next.moves_from(&state.map);
        let mut outgoing = Vec::new();
        for partition_move in moves.iter().filter(|m| m.from == id) {
            let partition = state
                .partitions
                .remove_partition(partition_move.partition)
                .unwrap_or_else(|| Partition::new(partition_move.partition));
            let pending = state
                .store
                .take_pending(|vertex| next.partition_of(vertex) == partition_move.partition);
            outgoing.push((
                partition_move.to,
                PartitionTransfer {
                    superstep,
                    epoch,
                    partition: partition_move.partition,
                    vertices: partition.to_sorted_vec(),
                    pending,
                },
            ));
        }
        let expected = moves.iter().filter(|m| m.to == id).count();

        for (to, transfer) in outgoing {
            debug!(
                worker = %id,
                to = %to,
                partition = %transfer.partition,
                vertices = transfer.vertices.len(),
                "Migrating partition"
            );
            self.setup
                .transport
                .send_to_worker(to, WorkerMessage::Migrate(transfer))
                .await?;
        }

        let mut received = 0;
        let mut later = VecDeque::new();
        while let Some(message) = self.early.pop_front() {
            match message {
                WorkerMessage::Migrate(transfer) if transfer.superstep == superstep => {
                    self.adopt(transfer, next)?;
                    received += 1;
                }
                other => later.push_back(other),
            }
        }
        self.early = later;

        while received < expected {
            let message = self
                .inbox
                .recv()
                .await
                .ok_or_else(|| BspError::Transport(format!("{id} inbox closed")))?;
            match message {
                WorkerMessage::Migrate(transfer)
                    if transfer.epoch == epoch && transfer.superstep == superstep =>
                {
                    self.adopt(transfer, next)?;
                    received += 1;
                }
                message @ (WorkerMessage::Data(_) | WorkerMessage::Migrate(_)) => {
                    self.keep_if_current(message);
                }
                message @ (WorkerMessage::Restore { .. } | WorkerMessage::Shutdown) => {
                    self.interrupt = Some(message);
                    return Ok(false);
                }
                other => {
                    warn!(worker = %id, superstep, message = ?other, "Unexpected message during migration");
                }
            }
        }

        self.state_mut()?.map = next.clone();
        Ok(true)
    }

    fn adopt(&mut self, transfer: PartitionTransfer<G>, map: &PartitionMap) -> Result<()> {
        let state = self.state_mut()?;
        let mut partition = Partition::new(transfer.partition);
        for vertex in transfer.vertices {
            partition.insert(vertex);
        }
        debug!(partition = %transfer.partition, vertices = partition.len(), "Adopted partition");
        state.partitions.insert_partition(partition);
        state.store.import_pending(
            transfer
                .pending
                .into_iter()
                .filter(|(vertex, _)| map.partition_of(vertex) == transfer.partition),
        );
        Ok(())
    }

    async fn checkpoint(&mut self, superstep: u64) -> Result<String> {
        let id = self.id;
        let state = self.state_mut()?;
        let snapshot = WorkerSnapshot {
            superstep,
            worker: id,
            partitions: state
                .partitions
                .partitions()
                .map(|partition| (partition.id(), partition.to_sorted_vec()))
                .collect(),
            pending: state.store.export_pending(),
        };
        let key = self.setup.checkpoints.write_worker(&snapshot).await?;
        debug!(worker = %id, superstep, key = %key, "Worker checkpoint written");
        Ok(key)
    }

    /// Reset to a checkpoint, or to the graph input, under a new epoch
    async fn restore(
        &mut self,
        checkpoint: Option<u64>,
        epoch: u64,
        map: PartitionMap,
    ) -> Result<(u64, u64)> {
        self.epoch = epoch;
        self.early.clear();
        self.interrupt = None;
        self.state = None;

        let mut state = WorkerState::new(self.id, map);
        match checkpoint {
            Some(superstep) => {
                let snapshot: WorkerSnapshot<G> =
                    self.setup.checkpoints.read_worker(superstep, self.id).await?;
                for (partition_id, vertices) in snapshot.partitions {
                    let mut partition = Partition::new(partition_id);
                    for vertex in vertices {
                        partition.insert(vertex);
                    }
                    state.partitions.insert_partition(partition);
                }
                state.store.import_pending(snapshot.pending);
            }
            None => {
                for vertex in self.setup.input.read_vertices().await? {
                    if state.map.owner_of(vertex.id()) != self.id {
                        continue;
                    }
                    if let Some(previous) = state.partitions.insert(&state.map, vertex) {
                        warn!(
                            worker = %self.id,
                            vertex = ?previous.id(),
                            "Duplicate vertex in graph input, keeping the last one"
                        );
                    }
                }
            }
        }

        let totals = GraphTotals {
            vertices: state.partitions.num_vertices(),
            edges: state.partitions.num_edges(),
        };
        info!(
            worker = %self.id,
            epoch,
            checkpoint = ?checkpoint,
            vertices = totals.vertices,
            "Worker restored"
        );
        self.state = Some(state);
        Ok((totals.vertices, totals.edges))
    }

    async fn write_output(&mut self) -> Result<()> {
        let id = self.id;
        let output = Arc::clone(&self.setup.output);
        let state = self.state_mut()?;
        let partitions: Vec<_> = state
            .partitions
            .partitions()
            .map(Partition::to_sorted_vec)
            .collect();
        for vertices in partitions {
            output.write_partition(id, vertices).await?;
        }
        Ok(())
    }
}
