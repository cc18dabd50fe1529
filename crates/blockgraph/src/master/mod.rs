//! Master side of a BSP job
//!
//! ```text
//!            ┌──────────── MasterCoordinator ────────────┐
//! Command ──►│ barrier ─► resolve reducers ─► master     │
//!            │ compute ─► advance cursor ─► checkpoint   │──► next Command
//!            └───────────────────────────────────────────┘
//! ```
//!
//! The master owns the execution cursor, the global reducer values and the
//! partition map. It never touches vertices.

pub mod api;
pub mod barrier;
pub mod coordinator;
mod recovery;

pub use api::MasterApi;
pub use barrier::Barrier;
pub use coordinator::{MasterCoordinator, RunSummary};
