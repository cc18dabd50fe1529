//! Messages exchanged between the master and workers
//!
//! Every message carrying superstep results is tagged with the recovery
//! epoch. Receivers drop messages from an older epoch, so traffic from before
//! a recovery can never leak into the replay.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::block::PieceId;
use crate::graph::{
    GraphTotals, GraphTypes, MutationOutcome, MutationRecord, PartitionId, PartitionMap, Vertex,
    WorkerId,
};
use crate::reducer::{BroadcastId, ReducerId};

/// Master to worker: run one superstep
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuperstepCommand {
    pub superstep: u64,
    pub epoch: u64,
    /// Piece whose `vertex_send` runs
    pub send: Option<PieceId>,
    /// Piece whose `vertex_receive` runs
    pub receive: Option<PieceId>,
    /// Ownership for this superstep; a new version means partitions move first
    pub map: PartitionMap,
    pub broadcasts: Vec<(BroadcastId, Bytes)>,
    /// Graph totals after the previous superstep
    pub totals: GraphTotals,
}

/// Worker to worker: messages and mutations produced during a superstep
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct DataBatch<G: GraphTypes> {
    pub superstep: u64,
    pub epoch: u64,
    pub from: WorkerId,
    /// Encoded messages for vertices the receiver owns
    pub messages: Vec<(G::Id, Bytes)>,
    /// Mutation requests targeting vertices the receiver owns
    pub mutations: Vec<MutationRecord<G>>,
}

/// Worker to worker: a partition changing owner before a superstep
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct PartitionTransfer<G: GraphTypes> {
    pub superstep: u64,
    pub epoch: u64,
    pub partition: PartitionId,
    pub vertices: Vec<Vertex<G>>,
    /// Inboxes of the moved vertices for the coming superstep
    pub pending: Vec<(G::Id, Vec<Bytes>)>,
}

/// Anything a worker can receive
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(bound = "")]
pub enum WorkerMessage<G: GraphTypes> {
    Command(SuperstepCommand),
    Data(DataBatch<G>),
    Migrate(PartitionTransfer<G>),
    /// Write a snapshot of the state after `superstep`
    Checkpoint { superstep: u64, epoch: u64 },
    /// Reset to a checkpoint, or to the graph input when `checkpoint` is `None`
    Restore {
        checkpoint: Option<u64>,
        epoch: u64,
        map: PartitionMap,
    },
    /// Hand the final vertices to the graph output
    WriteOutput { epoch: u64 },
    Shutdown,
}

/// Worker statistics after a superstep boundary
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerStats {
    pub vertices: u64,
    pub edges: u64,
    pub active_vertices: u64,
    pub messages_sent: u64,
    pub pending_messages: u64,
    /// Messages addressed to vertices that do not exist
    pub dropped_messages: u64,
    /// Post-mutation size of every owned partition
    pub partition_sizes: Vec<(PartitionId, u64)>,
    pub mutations: MutationOutcome,
}

/// Worker to master: a superstep is done on this worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuperstepReport {
    pub worker: WorkerId,
    pub superstep: u64,
    pub epoch: u64,
    /// Encoded partial of every live reducer
    pub partials: Vec<(ReducerId, Bytes)>,
    pub stats: WorkerStats,
}

/// Anything the master can receive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MasterMessage {
    Report(SuperstepReport),
    CheckpointAck {
        worker: WorkerId,
        superstep: u64,
        epoch: u64,
        /// Storage key written, or why the write failed
        result: Result<String, String>,
    },
    Restored {
        worker: WorkerId,
        epoch: u64,
        vertices: u64,
        edges: u64,
    },
    OutputWritten {
        worker: WorkerId,
        epoch: u64,
    },
    Failed {
        worker: WorkerId,
        epoch: u64,
        message: String,
        recoverable: bool,
        /// Workers that caused the failure; the reporter itself when empty
        implicated: Vec<WorkerId>,
    },
}

impl MasterMessage {
    pub fn worker(&self) -> WorkerId {
        match self {
            MasterMessage::Report(report) => report.worker,
            MasterMessage::CheckpointAck { worker, .. }
            | MasterMessage::Restored { worker, .. }
            | MasterMessage::OutputWritten { worker, .. }
            | MasterMessage::Failed { worker, .. } => *worker,
        }
    }

    pub fn epoch(&self) -> u64 {
        match self {
            MasterMessage::Report(report) => report.epoch,
            MasterMessage::CheckpointAck { epoch, .. }
            | MasterMessage::Restored { epoch, .. }
            | MasterMessage::OutputWritten { epoch, .. }
            | MasterMessage::Failed { epoch, .. } => *epoch,
        }
    }
}
