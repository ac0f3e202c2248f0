//! Per-instance lifecycle controller.
//!
//! ## Architecture
//!
//! - **VmController**: user operations (start, shutdown, suspend, teardown)
//!   and address queries for one instance
//! - **Event loop**: one task per hypervisor process, consuming its
//!   `ProcessEvent` stream in order and driving the state machine
//! - **ControllerShared**: state, cached address and flags behind one lock,
//!   plus a `watch` channel signalling every state change
//!
//! Every transition except entering `starting` is reported to the status
//! monitor.

mod address;
mod events;
mod lifecycle;
mod state;


use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use vmlite_shared::constants::SUSPEND_TAG;
use vmlite_shared::errors::VmliteError;

use crate::monitor::StatusMonitor;
use crate::net::{AddressResolver, TapDevice};
use crate::portal::GuestConnector;
use crate::vmm::VmDescriptor;
use crate::vmm::process::{ProcessFactory, VmProcess};
use crate::vmm::qemu::HypervisorProbe;

pub use state::VmState;
use state::Status;

/// Collaborators and settings a controller is built with.
#[derive(Clone)]
pub struct ControllerContext {
    pub monitor: Arc<dyn StatusMonitor>,
    pub processes: Arc<dyn ProcessFactory>,
    pub resolver: Arc<dyn AddressResolver>,
    pub hypervisor: Arc<dyn HypervisorProbe>,
    pub guests: Arc<dyn GuestConnector>,
    /// Hypervisor executable handed to the process factory.
    pub qemu_binary: String,
    pub ip_timeout: Duration,
    pub ip_retry_interval: Duration,
}

/// State shared between the controller and its event loop.
pub(crate) struct ControllerShared {
    vm_name: String,
    monitor: Arc<dyn StatusMonitor>,
    status: Mutex<Status>,
    state_tx: watch::Sender<VmState>,
}

impl ControllerShared {
    fn new(vm_name: String, monitor: Arc<dyn StatusMonitor>, initial: VmState) -> Self {
        let (state_tx, _) = watch::channel(initial);
        Self {
            vm_name,
            monitor,
            status: Mutex::new(Status::new(initial)),
            state_tx,
        }
    }

    fn state(&self) -> VmState {
        self.status.lock().state
    }

    /// Change state and wake waiters without persisting.
    ///
    /// Leaving for `off` or `restarting` drops the cached guest address.
    fn notify(&self, status: &mut Status, state: VmState) {
        if matches!(state, VmState::Off | VmState::Restarting) {
            status.ip = None;
        }
        status.state = state;
        self.state_tx.send_replace(state);
    }

    /// Change state, wake waiters and persist it.
    fn record(&self, status: &mut Status, state: VmState) {
        self.notify(status, state);
        if let Err(e) = self.monitor.persist_state(&self.vm_name, state) {
            tracing::warn!(
                vm_name = %self.vm_name,
                %state,
                error = %e,
                "Failed to persist state"
            );
        }
    }

    fn transition(&self, state: VmState) {
        let mut status = self.status.lock();
        self.record(&mut status, state);
    }

    /// Move a `starting` instance to `off` without persisting.
    ///
    /// The event loop owns persisting this exit: it either waits on the
    /// state signal already, or sees the exit later with tracking enabled.
    fn release_starting(&self) {
        let mut status = self.status.lock();
        self.release_starting_locked(&mut status);
    }

    fn release_starting_locked(&self, status: &mut Status) {
        if status.state == VmState::Starting {
            status.track_exit = true;
            self.notify(status, VmState::Off);
        }
    }

    fn invalid(&self, operation: &'static str, state: VmState) -> VmliteError {
        VmliteError::InvalidStateTransition {
            vm_name: self.vm_name.clone(),
            operation,
            state: state.to_string(),
        }
    }
}

/// Lifecycle controller for one hypervisor-backed instance.
///
/// Must be finished with [`VmController::teardown`]; dropping it without
/// teardown force-kills the hypervisor.
pub struct VmController {
    desc: VmDescriptor,
    ctx: ControllerContext,
    shared: Arc<ControllerShared>,
    tap: TapDevice,
    process: Option<Arc<dyn VmProcess>>,
    event_loop: Option<JoinHandle<()>>,
    torn_down: bool,
}

impl VmController {
    /// Build a controller for `desc`, taking ownership of its tap device.
    ///
    /// The initial state is `suspended` when the boot image carries a
    /// suspend snapshot, `off` otherwise.
    pub fn new(desc: VmDescriptor, tap: TapDevice, ctx: ControllerContext) -> Self {
        let initial = match ctx.hypervisor.snapshot_tags(&desc.image_path) {
            Ok(tags) if tags.iter().any(|tag| tag == SUSPEND_TAG) => VmState::Suspended,
            Ok(_) => VmState::Off,
            Err(e) => {
                tracing::warn!(
                    vm_name = %desc.vm_name,
                    error = %e,
                    "Failed to list image snapshots, assuming off"
                );
                VmState::Off
            }
        };

        tracing::info!(
            vm_name = %desc.vm_name,
            tap = %tap.name(),
            state = %initial,
            "Created VM controller"
        );

        let shared = Arc::new(ControllerShared::new(
            desc.vm_name.clone(),
            Arc::clone(&ctx.monitor),
            initial,
        ));

        Self {
            desc,
            ctx,
            shared,
            tap,
            process: None,
            event_loop: None,
            torn_down: false,
        }
    }

    pub fn vm_name(&self) -> &str {
        &self.desc.vm_name
    }

    pub fn current_state(&self) -> VmState {
        self.shared.state()
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<VmState> {
        self.shared.state_tx.subscribe()
    }

    pub fn tap_device_name(&self) -> &str {
        self.tap.name()
    }

    /// PID of the current hypervisor process, if one is running.
    pub fn pid(&self) -> Option<u32> {
        self.process
            .as_ref()
            .filter(|p| p.running())
            .and_then(|p| p.pid())
    }

    fn process_running(&self) -> bool {
        self.process.as_ref().is_some_and(|p| p.running())
    }

    async fn join_event_loop(&mut self) {
        if let Some(handle) = self.event_loop.take()
            && let Err(e) = handle.await
            && !e.is_cancelled()
        {
            tracing::warn!(vm_name = %self.desc.vm_name, error = %e, "Event loop task failed");
        }
    }
}

impl Drop for VmController {
    fn drop(&mut self) {
        if self.torn_down {
            return;
        }

        tracing::warn!(
            vm_name = %self.desc.vm_name,
            "Controller dropped without teardown, killing hypervisor"
        );
        self.shared.status.lock().track_exit = false;
        if let Some(process) = &self.process {
            process.kill();
        }
        if let Some(handle) = self.event_loop.take() {
            handle.abort();
        }
        // TapDevice removes itself on drop.
    }
}
