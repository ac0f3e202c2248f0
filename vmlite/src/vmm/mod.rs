//! Virtual machine monitor layer.
//!
//! - `process`: hypervisor child process handle and event stream
//! - `qemu`: QMP codec, command-line builder, resume metadata, probing
//! - `controller`: per-instance lifecycle state machine

pub mod controller;
mod descriptor;
pub mod process;
pub mod qemu;

pub use controller::{ControllerContext, VmController, VmState};
pub use descriptor::VmDescriptor;
