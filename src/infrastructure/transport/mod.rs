//! Event transports. The dashboard connector is a strict mirror of the
//! bus; the core never depends on its availability.

pub mod dashboard;

pub use dashboard::DashboardConnector;
