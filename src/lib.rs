//! ZMCP — agent orchestration runtime.
//!
//! Accepts a high-level objective, decomposes it into sub-objectives,
//! spawns supervised worker processes, coordinates them through named
//! rooms, and drives the workflow over a typed event stream. A separate
//! crawler worker pool consumes a persistent leased job queue backed by
//! the same store and event bus.

pub mod cli;
pub mod domain;
pub mod infrastructure;
pub mod services;

pub use infrastructure::database::DatabaseConnection;
