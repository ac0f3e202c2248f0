//! Guest command channel.
//!
//! The controller only needs to know whether the guest accepts connections
//! and to hand out sessions to callers. Transport implementations (SSH or
//! otherwise) live outside this crate.

use vmlite_shared::errors::VmliteResult;

/// Result of one command run inside the guest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// An open command session to a guest.
#[async_trait::async_trait]
pub trait GuestExecSession: Send {
    async fn execute(&mut self, command: &str) -> VmliteResult<ExecOutput>;

    fn is_connected(&self) -> bool;

    /// Drop the connection without a graceful close.
    fn force_shutdown(&mut self);
}

/// Opens sessions to a guest address.
#[async_trait::async_trait]
pub trait GuestConnector: Send + Sync {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        username: &str,
    ) -> VmliteResult<Box<dyn GuestExecSession>>;
}
