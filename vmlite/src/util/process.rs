//! Host process helpers: liveness checks and short-lived command runs.

use std::process::{Command, Stdio};

use vmlite_shared::errors::{VmliteError, VmliteResult};

/// SIGKILL `pid`. A pid that is already gone counts as killed.
pub fn kill_process(pid: u32) -> bool {
    let Some(pid) = to_pid(pid) else {
        return false;
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    let sent = unsafe { libc::kill(pid, libc::SIGKILL) } == 0;
    sent || !signal_reaches(pid)
}

/// Whether `pid` names a live process we may signal.
pub fn is_process_alive(pid: u32) -> bool {
    to_pid(pid).is_some_and(signal_reaches)
}

/// Zero and values past `i32::MAX` address process groups, never one process.
fn to_pid(pid: u32) -> Option<i32> {
    i32::try_from(pid).ok().filter(|pid| *pid > 0)
}

fn signal_reaches(pid: i32) -> bool {
    // SAFETY: signal 0 only performs the existence and permission check.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Run a command to completion and report whether it exited successfully.
///
/// Spawn failures count as failure; output is discarded.
pub fn run_for_status(program: &str, args: &[&str]) -> bool {
    let status = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) => status.success(),
        Err(e) => {
            tracing::debug!(program, error = %e, "Failed to run host command");
            false
        }
    }
}

/// Run a command to completion and return its stdout.
///
/// A non-zero exit is an error carrying the command's stderr.
pub fn run_and_capture(program: &str, args: &[&str]) -> VmliteResult<String> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| {
            let err_msg = format!("Failed to run {}: {}", program, e);
            tracing::error!("{}", err_msg);
            VmliteError::Engine(err_msg)
        })?;

    if !output.status.success() {
        return Err(VmliteError::Engine(format!(
            "{} {} exited with {}: {}",
            program,
            args.join(" "),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
