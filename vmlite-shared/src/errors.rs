//! Error types for vmlite.

use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout vmlite.
pub type VmliteResult<T> = Result<T, VmliteError>;

#[derive(Debug, Error)]
pub enum VmliteError {
    /// The hypervisor process failed to launch or died before the guest
    /// became reachable. `reason` carries the last captured diagnostic text.
    #[error("{vm_name} failed to start: {reason}")]
    StartFailure { vm_name: String, reason: String },

    /// A control-protocol record could not be decoded.
    #[error("protocol decode error: {0}")]
    ProtocolDecode(String),

    #[error("failed to determine IP address of {vm_name} within {timeout:?}")]
    AddressResolutionTimeout { vm_name: String, timeout: Duration },

    #[error("cannot {operation} {vm_name} while it is {state}")]
    InvalidStateTransition {
        vm_name: String,
        operation: &'static str,
        state: String,
    },

    /// Resume metadata does not match the installed hypervisor.
    #[error("cannot resume {vm_name} from its snapshot: {reason}")]
    SnapshotMismatch { vm_name: String, reason: String },

    #[error("{vm_name} did not become reachable within {timeout:?}")]
    GuestUnreachable { vm_name: String, timeout: Duration },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("engine error: {0}")]
    Engine(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl VmliteError {
    /// Whether the error came from the hypervisor process failing to come up.
    pub fn is_start_failure(&self) -> bool {
        matches!(self, VmliteError::StartFailure { .. })
    }
}
