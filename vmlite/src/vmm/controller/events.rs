//! Per-process event loop.

use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;

use super::{ControllerShared, VmState};
use crate::vmm::process::{ExitState, ProcessError, ProcessEvent, VmProcess};
use crate::vmm::qemu::qmp::{EventKind, QmpDecoder, QmpEvent, QmpMessage};

/// Consume one process's events until its stream closes.
///
/// `launch` receives the diagnostic text if the process exits while the
/// instance is still `starting`.
pub(super) async fn run(
    shared: Arc<ControllerShared>,
    process: Arc<dyn VmProcess>,
    mut events: UnboundedReceiver<ProcessEvent>,
    launch: oneshot::Sender<String>,
) {
    let mut decoder = QmpDecoder::new();
    let mut launch = Some(launch);

    while let Some(event) = events.recv().await {
        match event {
            ProcessEvent::Started => {
                tracing::info!(vm_name = %shared.vm_name, "process started");
                shared.monitor.on_resume();
            }
            ProcessEvent::Stdout(bytes) => {
                tracing::debug!(
                    vm_name = %shared.vm_name,
                    "QMP: {}",
                    String::from_utf8_lossy(&bytes).trim_end()
                );
                decoder.push(&bytes);
                if let Some(message) = decoder.next_message() {
                    on_message(&shared, process.as_ref(), message);
                }
            }
            ProcessEvent::Stderr(bytes) => {
                let text = String::from_utf8_lossy(&bytes).trim_end().to_string();
                tracing::warn!(vm_name = %shared.vm_name, "{}", text);
                shared.status.lock().saved_error = text;
            }
            ProcessEvent::StateChanged(state) => {
                tracing::info!(vm_name = %shared.vm_name, "process state changed to {:?}", state);
            }
            ProcessEvent::ErrorOccurred(error) => on_error(&shared, error),
            ProcessEvent::Finished(exit) => on_finished(&shared, exit, &mut launch).await,
        }
    }

    tracing::debug!(vm_name = %shared.vm_name, "Process event stream closed");
}

fn on_message(shared: &ControllerShared, process: &dyn VmProcess, message: QmpMessage) {
    match message {
        QmpMessage::Greeting(_) => {
            tracing::debug!(vm_name = %shared.vm_name, "QMP greeting received");
        }
        QmpMessage::Return(_) => {
            let mut status = shared.status.lock();
            if status.state == VmState::Starting {
                shared.record(&mut status, VmState::Running);
            }
        }
        QmpMessage::Error { class, desc } => {
            tracing::warn!(vm_name = %shared.vm_name, class = %class, "QMP command failed: {}", desc);
        }
        QmpMessage::Event(event) => on_event(shared, process, event),
    }
}

fn on_event(shared: &ControllerShared, process: &dyn VmProcess, event: QmpEvent) {
    match event.kind {
        EventKind::Reset => {
            let restarted = {
                let mut status = shared.status.lock();
                if status.state != VmState::Restarting {
                    shared.record(&mut status, VmState::Restarting);
                    true
                } else {
                    false
                }
            };

            if restarted {
                tracing::info!(vm_name = %shared.vm_name, "VM restarting");
                shared.monitor.on_restart(&shared.vm_name);
            }
        }
        EventKind::Powerdown => tracing::info!(vm_name = %shared.vm_name, "VM powering down"),
        EventKind::Shutdown => tracing::info!(vm_name = %shared.vm_name, "VM shut down"),
        EventKind::Stop => tracing::info!(vm_name = %shared.vm_name, "VM suspending"),
        EventKind::Resume => {
            tracing::info!(vm_name = %shared.vm_name, "VM suspended");

            let suspended = {
                let mut status = shared.status.lock();
                if matches!(status.state, VmState::Suspending | VmState::Running) {
                    // The snapshot is on disk; the kill that follows is not a crash.
                    status.track_exit = false;
                    shared.record(&mut status, VmState::Suspended);
                    true
                } else {
                    false
                }
            };

            if suspended {
                process.kill();
                shared.monitor.on_suspend();
            }
        }
        EventKind::Other(name) => {
            tracing::debug!(vm_name = %shared.vm_name, event = %name, "Ignoring QMP event");
        }
    }
}

fn on_error(shared: &ControllerShared, error: ProcessError) {
    let mut status = shared.status.lock();
    if status.track_exit && !matches!(status.state, VmState::Starting | VmState::Off) {
        tracing::error!(vm_name = %shared.vm_name, "process error occurred {:?}", error);
        shared.record(&mut status, VmState::Off);
        status.exit_recorded = true;
    } else {
        tracing::debug!(vm_name = %shared.vm_name, "process error occurred {:?}", error);
    }
}

async fn on_finished(
    shared: &ControllerShared,
    exit: ExitState,
    launch: &mut Option<oneshot::Sender<String>>,
) {
    tracing::info!(
        vm_name = %shared.vm_name,
        "process finished with exit code {:?} ({:?})",
        exit.code,
        exit.status
    );

    let (state, track_exit) = {
        let status = shared.status.lock();
        (status.state, status.track_exit)
    };

    if state == VmState::Starting {
        let captured = {
            let mut status = shared.status.lock();
            let captured = status.saved_error.clone();
            if captured.is_empty() {
                status.saved_error = format!("{}: shutdown called while starting", shared.vm_name);
            }
            captured
        };
        // The receiver falls back to its own diagnostic when nothing was captured.
        if let Some(launch) = launch.take() {
            let _ = launch.send(captured);
        }

        // Whoever observes the failure (start, liveness check or shutdown)
        // moves the state to off; only then is the exit recorded.
        let mut state_rx = shared.state_tx.subscribe();
        if state_rx.wait_for(|s| *s == VmState::Off).await.is_err() {
            return;
        }
    } else if !track_exit {
        return;
    }

    {
        let mut status = shared.status.lock();
        if !status.exit_recorded {
            shared.record(&mut status, VmState::Off);
            status.exit_recorded = true;
        }
    }
    shared.monitor.on_shutdown();
}
