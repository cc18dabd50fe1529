//! Worker side of a BSP job
//!
//! ```text
//! ┌──────────────────────── WorkerEngine ────────────────────────┐
//! │  PartitionStore ──► compute (rayon) ──► local MessageStore   │
//! │        ▲                  │                                  │
//! │        │                  ├──► DataBatch to peers            │
//! │  apply mutations ◄────────┴──► SuperstepReport to master     │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! User pieces only see [`SendApi`] and [`ReceiveApi`], both of which deref
//! to the read-only [`WorkerApi`].

pub mod api;
pub(crate) mod compute;
pub mod engine;

pub use api::{ReceiveApi, SendApi, WorkerApi};
pub use engine::{FaultPlan, InjectedFault, WorkerEngine, WorkerSetup};
