//! The error taxonomy surfaced to callers of the reservation engine.

use hostpool_store::StoreError;
use thiserror::Error;

/// Everything that can go wrong with an engine request.
///
/// The allocator constructs the subset it can produce; `Conflict`,
/// `NotFound` and `Forbidden` belong to the CRUD surface layered on top of
/// the engine and share the taxonomy so that callers map every failure the
/// same way.
#[derive(Debug, Error)]
pub enum AllocationError {
    /// Caller-supplied values violate stated constraints.
    #[error("invalid request")]
    InvalidRequest,

    /// Fewer eligible machines than requested; carries how many were seen
    /// so the caller can retry with a smaller ask.
    #[error("not enough machines available ({available} available)")]
    NotEnoughAvailable { available: usize },

    /// Uniqueness violation on create.
    #[error("conflict")]
    Conflict,

    /// Referenced entity absent.
    #[error("not found")]
    NotFound,

    /// Non-admin attempting an admin action or touching another user's
    /// lease.
    #[error("forbidden")]
    Forbidden,

    /// The provisioner reported a non-ok outcome for a host in the batch.
    #[error("provisioner failed: {details}")]
    ProvisionerFailed { details: String },

    /// Unhandled store or internal fault.
    #[error("internal error: {0}")]
    ServerError(String),
}

impl AllocationError {
    /// Stable wire identifier for the error class.
    pub fn code(&self) -> &'static str {
        match self {
            AllocationError::InvalidRequest => "invalid_request",
            AllocationError::NotEnoughAvailable { .. } => "not_enough_available",
            AllocationError::Conflict => "conflict",
            AllocationError::NotFound => "not_found",
            AllocationError::Forbidden => "forbidden",
            AllocationError::ProvisionerFailed { .. } => "provisioner_failed",
            AllocationError::ServerError(_) => "server_error",
        }
    }
}

impl From<StoreError> for AllocationError {
    fn from(e: StoreError) -> Self {
        AllocationError::ServerError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(AllocationError::InvalidRequest.code(), "invalid_request");
        assert_eq!(
            AllocationError::NotEnoughAvailable { available: 1 }.code(),
            "not_enough_available"
        );
        assert_eq!(
            AllocationError::ProvisionerFailed {
                details: "vm-02=failed".to_string()
            }
            .code(),
            "provisioner_failed"
        );
        assert_eq!(
            AllocationError::ServerError("boom".to_string()).code(),
            "server_error"
        );
    }
}
