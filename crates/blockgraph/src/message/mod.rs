//! Message delivery between supersteps
//!
//! Every worker owns one [`MessageStore`] holding two generations of inboxes:
//!
//! ```text
//!            superstep n                  boundary            superstep n+1
//!  ┌──────────────────────────┐                       ┌──────────────────────┐
//!  │ send(dst, bytes) ──────► │ next  ── advance() ─► │ current ──► drain(v) │
//!  └──────────────────────────┘                       └──────────────────────┘
//! ```
//!
//! A payload sent during superstep `n` can only be drained in superstep
//! `n + 1`. Payloads are opaque bincode bytes until the receiving piece
//! iterates them through [`Messages`], which decodes lazily.

pub mod combiner;
pub mod store;

pub use combiner::{MaxCombiner, MessageCombiner, MinCombiner, SumCombiner};
pub use store::{AdvanceStats, MessageStore, Messages};
