//! Error types for the BSP engine
//!
//! Every fallible operation in the crate returns [`BspError`]. The variants
//! split into two families: recoverable failures (worker crashes, barrier
//! timeouts, transient storage and transport faults) which the master retries
//! through checkpoint replay, and fatal ones (malformed execution graphs,
//! reducer misuse, user piece errors) which fail the job immediately.

use thiserror::Error;

use crate::graph::WorkerId;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, BspError>;

/// Errors raised by the engine, its collaborators, or user pieces
#[derive(Debug, Error)]
pub enum BspError {
    /// Reducer or broadcast used before registration, after its piece retired,
    /// or resolved twice within one superstep
    #[error("invalid handle {handle}: {reason}")]
    InvalidHandle { handle: String, reason: String },

    /// A mutation tried to create a vertex that already exists
    #[error("vertex {vertex} already exists")]
    DuplicateVertex { vertex: String },

    /// A mutation referenced a vertex that does not exist
    #[error("vertex {vertex} does not exist")]
    UnknownVertex { vertex: String },

    /// Workers missed the barrier of a superstep within the liveness timeout
    #[error("workers {workers:?} missed the barrier of superstep {superstep}")]
    WorkerTimeout { workers: Vec<WorkerId>, superstep: u64 },

    /// A worker reported a failure or became unreachable
    #[error("worker {worker} failed: {message}")]
    WorkerFailed {
        worker: WorkerId,
        message: String,
        recoverable: bool,
    },

    /// A checkpoint write was not acknowledged
    #[error("checkpoint of superstep {superstep} failed: {message}")]
    CheckpointWriteFailure { superstep: u64, message: String },

    /// The execution graph selected a piece that is not part of it
    #[error("execution graph mismatch: {0}")]
    TerminalMismatch(String),

    /// A user piece function failed
    #[error("piece '{piece}' failed: {message}")]
    Piece {
        piece: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Encoding or decoding of a payload failed
    #[error("codec error: {0}")]
    Codec(String),

    /// The durable storage collaborator failed
    #[error("storage error: {0}")]
    Storage(String),

    /// The transport collaborator failed
    #[error("transport error: {0}")]
    Transport(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Recovery was attempted more often than the retry policy allows
    #[error("gave up after {attempts} recovery attempts")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<BspError>,
    },

    /// The job ran past the configured superstep limit
    #[error("superstep limit of {limit} exceeded")]
    MaxSuperstepsExceeded { limit: u64 },
}

impl BspError {
    /// Create an invalid handle error
    pub fn invalid_handle(handle: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        BspError::InvalidHandle {
            handle: handle.to_string(),
            reason: reason.into(),
        }
    }

    /// Create a piece error without a source
    pub fn piece(piece: impl Into<String>, message: impl Into<String>) -> Self {
        BspError::Piece {
            piece: piece.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a piece error wrapping the underlying cause
    pub fn piece_with_source(
        piece: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        BspError::Piece {
            piece: piece.into(),
            message: source.to_string(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a recoverable worker failure
    pub fn worker_failed(worker: WorkerId, message: impl Into<String>) -> Self {
        BspError::WorkerFailed {
            worker,
            message: message.into(),
            recoverable: true,
        }
    }

    /// Whether the master may retry this failure through checkpoint replay
    pub fn is_recoverable(&self) -> bool {
        match self {
            BspError::WorkerTimeout { .. }
            | BspError::Storage(_)
            | BspError::Transport(_)
            | BspError::CheckpointWriteFailure { .. } => true,
            BspError::WorkerFailed { recoverable, .. } => *recoverable,
            _ => false,
        }
    }

    /// Workers implicated by this failure, if any
    pub fn failed_workers(&self) -> Vec<WorkerId> {
        match self {
            BspError::WorkerTimeout { workers, .. } => workers.clone(),
            BspError::WorkerFailed { worker, .. } => vec![*worker],
            _ => Vec::new(),
        }
    }
}

impl From<bincode::Error> for BspError {
    fn from(err: bincode::Error) -> Self {
        BspError::Codec(err.to_string())
    }
}

impl From<serde_json::Error> for BspError {
    fn from(err: serde_json::Error) -> Self {
        BspError::Codec(err.to_string())
    }
}

impl From<serde_yaml::Error> for BspError {
    fn from(err: serde_yaml::Error) -> Self {
        BspError::Config(err.to_string())
    }
}

impl From<std::io::Error> for BspError {
    fn from(err: std::io::Error) -> Self {
        BspError::Storage(err.to_string())
    }
}
