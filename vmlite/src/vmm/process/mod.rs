//! Hypervisor child-process abstraction.
//!
//! ## Architecture
//!
//! - **ProcessFactory**: Builds a fresh `VmProcess` from a `ProcessSpec`
//! - **VmProcess**: Start/kill/write/wait operations on one child process
//! - **ProcessEvent**: Lifecycle and output notifications, delivered in order
//!   on a single channel taken once by the consumer
//!
//! A process handle is single-use: once it has finished it is replaced, not
//! restarted.

mod host;
mod spawn;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use vmlite_shared::VmliteResult;

pub use host::{HostProcess, HostProcessFactory};

/// Program invocation handed to a `ProcessFactory`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

/// Coarse process state, reported through `ProcessEvent::StateChanged`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    NotRunning,
    Starting,
    Running,
}

/// Abnormal conditions reported through `ProcessEvent::ErrorOccurred`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessError {
    FailedToStart(String),
    Crashed,
    WriteError(String),
    ReadError(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    NormalExit,
    CrashExit,
}

/// How the process finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitState {
    /// Exit code, absent when terminated by a signal.
    pub code: Option<i32>,
    pub status: ExitStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Started,
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    StateChanged(ProcessState),
    ErrorOccurred(ProcessError),
    Finished(ExitState),
}

/// One hypervisor child process.
///
/// All methods take `&self` so the handle can be shared between the owner
/// issuing commands and the task consuming its events.
#[async_trait::async_trait]
pub trait VmProcess: Send + Sync {
    /// Launch the process. Errors only when it could not be spawned.
    async fn start(&self) -> VmliteResult<()>;

    /// Force-terminate the process. Killing a finished process is a no-op.
    fn kill(&self);

    /// Write bytes to the process's stdin.
    async fn write(&self, data: &[u8]) -> VmliteResult<()>;

    /// Wait until the launch attempt resolves.
    ///
    /// Returns `false` when the process finished without ever reporting
    /// `Started`.
    async fn wait_for_started(&self) -> bool;

    /// Wait until the process has finished and its output is drained.
    ///
    /// Returns immediately if the process was never started.
    async fn wait_for_finished(&self);

    fn running(&self) -> bool;

    fn pid(&self) -> Option<u32>;

    /// Take the event stream. Only the first call returns `Some`.
    fn take_events(&self) -> Option<UnboundedReceiver<ProcessEvent>>;

    fn spec(&self) -> &ProcessSpec;
}

/// Creates process handles.
pub trait ProcessFactory: Send + Sync {
    fn create(&self, spec: ProcessSpec) -> VmliteResult<Arc<dyn VmProcess>>;
}
