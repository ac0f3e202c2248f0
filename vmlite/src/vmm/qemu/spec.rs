//! Hypervisor command-line builder.
//!
//! The command line is versioned so that an instance suspended under an
//! older layout is resumed with the same device topology it was saved with.
//!
//! | Version | Cloud-init media |
//! |---------|------------------|
//! | 0 | read-only virtio drive |
//! | 1 | `-cdrom` |

use vmlite_shared::errors::{VmliteError, VmliteResult};

use crate::vmm::VmDescriptor;
use crate::vmm::process::ProcessSpec;

/// Snapshot to restore and the machine type it was taken with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeData {
    pub suspend_tag: String,
    /// Empty when the machine type was never recorded.
    pub machine_type: String,
}

/// Builds the QEMU invocation for one instance.
#[derive(Debug, Clone)]
pub struct QemuProcessSpec {
    program: String,
    desc: VmDescriptor,
    version: u32,
    tap_device_name: String,
    resume: Option<ResumeData>,
}

impl QemuProcessSpec {
    pub const LATEST_VERSION: u32 = 1;

    pub fn new(
        program: impl Into<String>,
        desc: VmDescriptor,
        version: u32,
        tap_device_name: impl Into<String>,
        resume: Option<ResumeData>,
    ) -> Self {
        Self {
            program: program.into(),
            desc,
            version,
            tap_device_name: tap_device_name.into(),
            resume,
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn arguments(&self) -> Vec<String> {
        let desc = &self.desc;
        let mut args: Vec<String> = vec![
            "--enable-kvm".into(),
            "-device".into(),
            "virtio-scsi-pci,id=scsi0".into(),
            "-drive".into(),
            format!(
                "file={},if=none,format=qcow2,discard=unmap,id=hda",
                desc.image_path.display()
            ),
            "-device".into(),
            "scsi-hd,drive=hda,bus=scsi0.0".into(),
            "-smp".into(),
            desc.num_cores.to_string(),
            "-m".into(),
            format!("{}M", desc.mem_size_mib),
            "-device".into(),
            format!("virtio-net-pci,netdev=hostnet0,id=net0,mac={}", desc.mac_addr),
            "-netdev".into(),
            format!(
                "tap,id=hostnet0,ifname={},script=no,downscript=no",
                self.tap_device_name
            ),
            "-qmp".into(),
            "stdio".into(),
            "-cpu".into(),
            "host".into(),
            "-chardev".into(),
            "null,id=char0".into(),
            "-serial".into(),
            "chardev:char0".into(),
            "-nographic".into(),
        ];

        if self.version >= 1 {
            args.push("-cdrom".into());
            args.push(desc.cloud_init_iso.display().to_string());
        } else {
            args.push("-drive".into());
            args.push(format!(
                "file={},if=virtio,format=raw,snapshot=off,read-only",
                desc.cloud_init_iso.display()
            ));
        }

        if let Some(resume) = &self.resume {
            args.push("-loadvm".into());
            args.push(resume.suspend_tag.clone());

            if !resume.machine_type.is_empty() {
                args.push("-machine".into());
                args.push(resume.machine_type.clone());
            }
        }

        args.extend(desc.extra_args.iter().cloned());
        args
    }

    /// Produce the process invocation, refusing to launch without disk media.
    pub fn build(&self) -> VmliteResult<ProcessSpec> {
        if !self.desc.image_path.exists() || !self.desc.cloud_init_iso.exists() {
            return Err(VmliteError::StartFailure {
                vm_name: self.desc.vm_name.clone(),
                reason: "cannot start VM without an image".into(),
            });
        }

        Ok(ProcessSpec {
            program: self.program.clone(),
            args: self.arguments(),
            working_dir: None,
        })
    }
}
