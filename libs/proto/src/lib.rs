//! Wire types for the persys scheduler.
//!
//! Two RPC surfaces live here:
//!
//! - `agent::v1`: the node-local agent API the scheduler calls outbound
//!   (apply/status/delete/list workloads, action history).
//! - `scheduler::v1`: the control-plane API operators and agents call inbound
//!   (registration, heartbeats, workload CRUD, inventory).
//!
//! Messages are plain prost structs; the tonic stubs are generated by
//! `build.rs` from a manual service description.

pub mod agent {
    pub mod v1;
}

pub mod scheduler {
    pub mod v1;
}
