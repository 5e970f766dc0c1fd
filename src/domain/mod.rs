//! Domain layer: entity models, repository ports, and error types.

pub mod error;
pub mod models;
pub mod ports;

pub use error::{CoreError, DatabaseError};
