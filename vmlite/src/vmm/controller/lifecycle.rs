//! User-facing lifecycle operations.

use std::sync::Arc;

use tokio::sync::oneshot;
use vmlite_shared::constants::SUSPEND_TAG;
use vmlite_shared::errors::{VmliteError, VmliteResult};

use super::{VmController, VmState, events};
use crate::vmm::qemu::{QemuProcessSpec, ResumeMetadata, qmp};

impl VmController {
    /// Boot the instance, or resume it from its suspend snapshot.
    ///
    /// Returns once the hypervisor process has started and the control
    /// channel handshake has been sent; the instance reaches `running` when
    /// the handshake is acknowledged. Starting a running instance is a no-op.
    pub async fn start(&mut self) -> VmliteResult<()> {
        let state = self.shared.state();
        match state {
            VmState::Running => {
                tracing::debug!(vm_name = %self.desc.vm_name, "Ignoring start issued while running");
                return Ok(());
            }
            VmState::Off | VmState::Suspended => {}
            other => return Err(self.shared.invalid("start", other)),
        }

        let resume = if state == VmState::Suspended {
            tracing::info!(vm_name = %self.desc.vm_name, "Resuming from a suspended state");
            Some(self.load_resume_metadata().await?)
        } else {
            let hypervisor = Arc::clone(&self.ctx.hypervisor);
            let metadata =
                tokio::task::spawn_blocking(move || ResumeMetadata::generate(hypervisor.as_ref()))
                    .await
                    .map_err(|e| {
                        VmliteError::Internal(format!("hypervisor probe task failed: {}", e))
                    })?;
            self.ctx
                .monitor
                .update_metadata(&self.desc.vm_name, &metadata)?;
            None
        };

        let (version, resume_data) = match &resume {
            Some(metadata) => (metadata.command_version(), Some(metadata.resume_data())),
            None => (QemuProcessSpec::LATEST_VERSION, None),
        };
        let spec = QemuProcessSpec::new(
            self.ctx.qemu_binary.clone(),
            self.desc.clone(),
            version,
            self.tap.name(),
            resume_data,
        )
        .build()?;

        let process = self.ctx.processes.create(spec)?;
        let events = process
            .take_events()
            .ok_or_else(|| VmliteError::Internal("process events already taken".into()))?;

        {
            let mut status = self.shared.status.lock();
            status.track_exit = true;
            status.exit_recorded = false;
            status.ip = None;
            status.saved_error.clear();
            status.delete_memory_snapshot = resume.is_some();
            self.shared.notify(&mut status, VmState::Starting);
        }

        if let Some(previous) = self.event_loop.take() {
            previous.abort();
        }
        let (launch_tx, launch_rx) = oneshot::channel();
        self.event_loop = Some(tokio::spawn(events::run(
            Arc::clone(&self.shared),
            Arc::clone(&process),
            events,
            launch_tx,
        )));
        self.process = Some(Arc::clone(&process));

        if let Err(e) = process.start().await {
            self.shared.transition(VmState::Off);
            self.join_event_loop().await;
            return Err(self.start_failure(e.to_string()));
        }

        if !process.wait_for_started().await {
            let captured = launch_rx.await.unwrap_or_default();
            self.shared.release_starting();
            self.join_event_loop().await;
            let reason = if captured.is_empty() {
                self.shared.status.lock().saved_error.clone()
            } else {
                captured
            };
            return Err(self.start_failure(reason));
        }

        if let Err(e) = process.write(&qmp::execute("qmp_capabilities")).await {
            tracing::error!(vm_name = %self.desc.vm_name, error = %e, "Failed to open control channel");
            process.kill();
            process.wait_for_finished().await;
            // A hypervisor that died on its own has usually said why on stderr.
            let captured = launch_rx.await.unwrap_or_default();
            self.shared.release_starting();
            self.join_event_loop().await;
            let reason = if captured.is_empty() {
                e.to_string()
            } else {
                captured
            };
            return Err(self.start_failure(reason));
        }

        Ok(())
    }

    /// Power the instance off.
    ///
    /// A live instance gets a graceful power-down request; anything else,
    /// or an instance whose control channel is gone, is killed. Blocks until
    /// the process has exited and its events are drained. Shutting down a
    /// suspended instance is a no-op.
    pub async fn shutdown(&mut self) -> VmliteResult<()> {
        let state = self.shared.state();
        let live = self.process.clone().filter(|p| p.running());

        let powered_down = match (state, live) {
            (VmState::Suspended, _) => {
                tracing::info!(vm_name = %self.desc.vm_name, "Ignoring shutdown issued while suspended");
                return Ok(());
            }
            (VmState::Running | VmState::DelayedShutdown | VmState::Unknown, Some(process)) => {
                match process.write(&qmp::execute("system_powerdown")).await {
                    Ok(()) => {
                        process.wait_for_finished().await;
                        true
                    }
                    Err(e) => {
                        tracing::warn!(
                            vm_name = %self.desc.vm_name,
                            error = %e,
                            "Power-down request failed, killing hypervisor"
                        );
                        false
                    }
                }
            }
            _ => false,
        };

        if !powered_down {
            if state == VmState::Starting {
                self.shared.status.lock().track_exit = false;
            }
            if let Some(process) = &self.process {
                process.kill();
                process.wait_for_finished().await;
            }
            self.shared.release_starting();
        }

        self.join_event_loop().await;
        Ok(())
    }

    /// Save the running instance to its suspend snapshot and stop it.
    ///
    /// Blocks until the hypervisor has exited. Suspending a stopped or
    /// already suspended instance only notifies the monitor.
    pub async fn suspend(&mut self) -> VmliteResult<()> {
        self.suspend_inner(true).await
    }

    /// `caller` is false for teardown, which neither reports `suspending`
    /// nor waits.
    pub(super) async fn suspend_inner(&mut self, caller: bool) -> VmliteResult<()> {
        let state = self.shared.state();
        let live = self.process.clone().filter(|p| p.running());

        match (state, live) {
            (VmState::Running | VmState::DelayedShutdown, Some(process)) => {
                if caller {
                    let mut status = self.shared.status.lock();
                    status.track_exit = false;
                    self.shared.record(&mut status, VmState::Suspending);
                }

                let command = qmp::human_command(&format!("savevm {}", SUSPEND_TAG));
                if let Err(e) = process.write(&command).await {
                    if caller {
                        let mut status = self.shared.status.lock();
                        status.track_exit = true;
                        self.shared.record(&mut status, state);
                    }
                    return Err(e);
                }

                if caller {
                    process.wait_for_finished().await;
                    self.join_event_loop().await;
                }
                Ok(())
            }
            (VmState::Off | VmState::Suspended, _) => {
                tracing::info!(
                    vm_name = %self.desc.vm_name,
                    "Ignoring suspend issued while stopped/suspended"
                );
                self.ctx.monitor.on_suspend();
                Ok(())
            }
            (other, _) => Err(self.shared.invalid("suspend", other)),
        }
    }

    /// Release the instance. Idempotent and infallible.
    ///
    /// A running instance is suspended so its state survives; anything else
    /// is shut down. The tap device is removed and the process reaped.
    pub async fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;

        self.shared.status.lock().track_exit = false;

        let result = if self.shared.state() == VmState::Running {
            self.suspend_inner(false).await
        } else {
            self.shutdown().await
        };
        if let Err(e) = result {
            tracing::warn!(vm_name = %self.desc.vm_name, error = %e, "Teardown could not stop instance cleanly");
        }

        self.tap.remove();

        if let Some(process) = &self.process {
            process.wait_for_finished().await;
        }
        self.join_event_loop().await;

        tracing::debug!(vm_name = %self.desc.vm_name, "Controller torn down");
    }

    /// Verify the hypervisor is still alive.
    ///
    /// A dead process moves the instance to `off` and yields `StartFailure`
    /// carrying the last diagnostic text.
    pub(super) fn ensure_running(&self) -> VmliteResult<()> {
        if self.process_running() {
            return Ok(());
        }

        let mut status = self.shared.status.lock();
        match status.state {
            VmState::Starting => self.shared.release_starting_locked(&mut status),
            VmState::Off | VmState::Suspended => {}
            _ => {
                self.shared.record(&mut status, VmState::Off);
                status.exit_recorded = true;
            }
        }

        Err(self.start_failure(status.saved_error.clone()))
    }

    async fn load_resume_metadata(&self) -> VmliteResult<ResumeMetadata> {
        let metadata = self.ctx.monitor.retrieve_metadata(&self.desc.vm_name)?;

        let hypervisor = Arc::clone(&self.ctx.hypervisor);
        let probed = tokio::task::spawn_blocking(move || hypervisor.supported_machines())
            .await
            .map_err(|e| VmliteError::Internal(format!("hypervisor probe task failed: {}", e)))?;

        let supported = match probed {
            Ok(machines) => Some(machines),
            Err(e) => {
                tracing::warn!(
                    vm_name = %self.desc.vm_name,
                    error = %e,
                    "Failed to list supported machines, skipping machine type check"
                );
                None
            }
        };

        if let Err(reason) = metadata.check_compatible(supported.as_deref()) {
            self.shared.transition(VmState::Off);
            return Err(VmliteError::SnapshotMismatch {
                vm_name: self.desc.vm_name.clone(),
                reason,
            });
        }

        Ok(metadata)
    }

    fn start_failure(&self, reason: String) -> VmliteError {
        VmliteError::StartFailure {
            vm_name: self.desc.vm_name.clone(),
            reason,
        }
    }
}
