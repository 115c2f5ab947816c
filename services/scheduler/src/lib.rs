//! persys cluster workload scheduler.
//!
//! The crate ships the `persys-scheduler` binary; the library surface exists
//! for integration testing.

pub mod agent;
pub mod api;
pub mod config;
pub mod discovery;
pub mod drift;
pub mod grpc;
pub mod metrics;
pub mod mode;
pub mod model;
pub mod monitor;
pub mod node_health;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod telemetry;
