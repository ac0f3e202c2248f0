//! vmlite: lifecycle control for locally hosted QEMU virtual machines.
//!
//! A [`VmController`] owns one hypervisor process. It drives the lifecycle
//! state machine from the process's QMP event stream, reports every
//! transition to a [`StatusMonitor`] and resolves the guest's address on
//! demand. [`QemuBackend`] builds controllers wired to the host.

pub mod db;
mod logging;
pub mod monitor;
pub mod net;
pub mod portal;
pub mod runtime;
pub mod settings;
pub mod util;
pub mod vmm;

#[cfg(test)]
pub(crate) mod testing;

pub use logging::init_logging_for;
pub use monitor::{MonitorEvent, PersistentMonitor, StatusMonitor};
pub use portal::{ExecOutput, GuestConnector, GuestExecSession};
pub use runtime::{QemuBackend, VmliteOptions, open_monitor};
pub use settings::Settings;
pub use vmm::{ControllerContext, VmController, VmDescriptor, VmState};

pub use vmlite_shared::{VmliteError, VmliteResult};
