//! Subprocess spawning for hypervisor processes.

use std::process::Stdio;

use tokio::process::{Child, Command};
use vmlite_shared::errors::{VmliteError, VmliteResult};

use super::ProcessSpec;

/// Spawns a subprocess with piped stdin, stdout and stderr.
///
/// stdin carries control-protocol commands, stdout carries protocol replies
/// and events, stderr carries hypervisor diagnostics.
///
/// # Arguments
/// * `spec` - Program, arguments and working directory
///
/// # Returns
/// * `Ok(Child)` - Successfully spawned subprocess with piped stdio
/// * `Err(...)` - Failed to spawn subprocess
pub(super) fn spawn_subprocess(spec: &ProcessSpec) -> VmliteResult<Child> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args);

    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }

    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    cmd.spawn().map_err(|e| {
        let err_msg = format!("Failed to spawn process {}: {}", spec.program, e);
        tracing::error!("{}", err_msg);
        VmliteError::Engine(err_msg)
    })
}
