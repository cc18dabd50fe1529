//! Bulk-synchronous-parallel graph engine
//!
//! A graph is split into hash partitions spread over workers. Computation
//! runs in global supersteps separated by a barrier on the master. User code
//! comes as [`Piece`]s composed into [`Block`]s. Key concepts:
//!
//! - **Piece**: a send half, a receive half one superstep later, and master
//!   compute in between
//! - **Block**: sequence, repeat, repeat-until, if and branch over pieces
//! - **Reducer**: global aggregation resolved at every barrier
//! - **Mutation**: topology change applied at the boundary in a fixed order
//! - **Checkpoint**: all-or-nothing snapshot used to replay after a failure
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────── MasterCoordinator ─────────────────────────────┐
//! │  ExecutionCursor ── ReducerRegistry ── PartitionMap ── CheckpointStore     │
//! └──────┬───────────────────────▲──────────────────────────────┬──────────────┘
//!        │ SuperstepCommand      │ SuperstepReport              │ Restore
//!        ▼                       │                              ▼
//! ┌─────────────┐  DataBatch  ┌─────────────┐  DataBatch  ┌─────────────┐
//! │  worker-0   │◄───────────►│  worker-1   │◄───────────►│  worker-2   │
//! │ partitions  │             │ partitions  │             │ partitions  │
//! │ messages    │             │ messages    │             │ messages    │
//! └─────────────┘             └─────────────┘             └─────────────┘
//! ```
//!
//! [`LocalBlockRunner`] runs all of it inside one process.

pub mod block;
pub mod checkpoint;
pub mod codec;
pub mod config;
pub mod error;
pub mod graph;
pub mod io;
pub mod master;
pub mod message;
pub mod pieces;
pub mod reducer;
pub mod runner;
pub mod storage;
pub mod transport;
pub mod worker;

// Re-exports
pub use block::{Block, ExecutionGraph, MasterDecision, Piece, PieceId, Transfer};
pub use config::{BspConfig, CheckpointConfig, RebalanceConfig, RetryPolicy};
pub use error::{BspError, Result};
pub use graph::{Edge, GraphTypes, Types, Vertex, WorkerId};
pub use io::{GraphInput, GraphOutput, TestGraph, VecInput};
pub use master::{MasterApi, RunSummary};
pub use message::{MaxCombiner, MessageCombiner, Messages, MinCombiner, SumCombiner};
pub use reducer::{
    AndReduce, BroadcastHandle, CountReduce, CreateReducersApi, MaxReduce, MinReduce, OrReduce,
    ReduceOp, ReducerHandle, SumReduce,
};
pub use runner::{run_block, LocalBlockRunner};
pub use storage::{DurableStorage, FileStorage, MemoryStorage};
pub use worker::{InjectedFault, ReceiveApi, SendApi, WorkerApi};
