use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use vmlite_shared::errors::VmliteError;

/// Lifecycle state of one virtual machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VmState {
    Off,
    Starting,
    Running,
    Restarting,
    DelayedShutdown,
    Suspending,
    Suspended,
    Unknown,
}

impl VmState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VmState::Off => "off",
            VmState::Starting => "starting",
            VmState::Running => "running",
            VmState::Restarting => "restarting",
            VmState::DelayedShutdown => "delayed-shutdown",
            VmState::Suspending => "suspending",
            VmState::Suspended => "suspended",
            VmState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VmState {
    type Err = VmliteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "off" => Ok(VmState::Off),
            "starting" => Ok(VmState::Starting),
            "running" => Ok(VmState::Running),
            "restarting" => Ok(VmState::Restarting),
            "delayed-shutdown" => Ok(VmState::DelayedShutdown),
            "suspending" => Ok(VmState::Suspending),
            "suspended" => Ok(VmState::Suspended),
            "unknown" => Ok(VmState::Unknown),
            other => Err(VmliteError::Internal(format!("unknown VM state: {}", other))),
        }
    }
}

/// Mutable controller status. Always accessed under the controller lock.
#[derive(Debug)]
pub(super) struct Status {
    pub(super) state: VmState,
    /// Cached guest address; cleared on restart and power-off.
    pub(super) ip: Option<Ipv4Addr>,
    /// Whether a process exit should drive the state to `off`. Cleared for
    /// intentional kills (suspend, teardown).
    pub(super) track_exit: bool,
    /// Set once `off` has been persisted for the current process, so its
    /// exit event only notifies.
    pub(super) exit_recorded: bool,
    /// Set after a resume until the snapshot has been deleted.
    pub(super) delete_memory_snapshot: bool,
    /// Last diagnostic text from the hypervisor.
    pub(super) saved_error: String,
}

impl Status {
    pub(super) fn new(state: VmState) -> Self {
        Self {
            state,
            ip: None,
            track_exit: true,
            exit_recorded: false,
            delete_memory_snapshot: false,
            saved_error: String::new(),
        }
    }
}
