//! Child process supervision.

pub mod supervisor;

pub use supervisor::{process_title, ProcessSupervisor};
