//! Runtime configuration and the QEMU backend.

mod backend;
pub mod options;

pub use backend::{QemuBackend, open_monitor};
pub use options::VmliteOptions;
