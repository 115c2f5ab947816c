//! Control-plane gRPC surface (`persys.scheduler.v1.SchedulerControl`).

mod control;
pub mod convert;

pub use control::ControlService;

use tonic::Status;

use crate::store::StoreError;

/// Central store error to status mapping.
pub(crate) fn store_status(error: StoreError) -> Status {
    match &error {
        StoreError::WritesFrozen { .. } | StoreError::RetriesExhausted { .. } | StoreError::Backend(_) => {
            Status::unavailable(error.to_string())
        }
        StoreError::Serialization(_) => {
            tracing::error!(error = %error, "Corrupt record in state store");
            Status::internal("state store returned an unreadable record")
        }
    }
}
