//! QEMU-specific pieces: control protocol, command line, resume metadata
//! and host probing.

mod metadata;
mod probe;
pub mod qmp;
mod spec;

pub use metadata::ResumeMetadata;
pub use probe::{HypervisorProbe, QemuProbe};
pub use spec::{QemuProcessSpec, ResumeData};
