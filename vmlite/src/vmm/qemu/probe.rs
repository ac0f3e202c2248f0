//! Host hypervisor introspection.

use std::path::Path;

use serde_json::Value;
use vmlite_shared::errors::{VmliteError, VmliteResult};

use crate::util::{run_and_capture, run_for_status};

/// Queries about the installed hypervisor and instance images.
pub trait HypervisorProbe: Send + Sync {
    /// Default emulated machine type of the hypervisor.
    fn machine_type(&self) -> VmliteResult<String>;

    /// Version fingerprint of the hypervisor binary.
    fn version(&self) -> VmliteResult<String>;

    /// Machine types the hypervisor can emulate.
    fn supported_machines(&self) -> VmliteResult<Vec<String>>;

    /// Snapshot tags stored inside a disk image.
    fn snapshot_tags(&self, image: &Path) -> VmliteResult<Vec<String>>;
}

/// `HypervisorProbe` that shells out to `qemu-system-*` and `qemu-img`.
#[derive(Debug, Clone)]
pub struct QemuProbe {
    qemu_binary: String,
    qemu_img_binary: String,
}

impl QemuProbe {
    pub fn new(qemu_binary: impl Into<String>, qemu_img_binary: impl Into<String>) -> Self {
        Self {
            qemu_binary: qemu_binary.into(),
            qemu_img_binary: qemu_img_binary.into(),
        }
    }
}

impl HypervisorProbe for QemuProbe {
    fn machine_type(&self) -> VmliteResult<String> {
        let dump_file = tempfile::NamedTempFile::new()?;
        let dump_path = dump_file.path().to_string_lossy().into_owned();

        // The hypervisor exits non-zero after dumping; only the file matters.
        run_for_status(&self.qemu_binary, &["-nographic", "-dump-vmstate", &dump_path]);

        let contents = std::fs::read(dump_file.path())?;
        parse_vmstate_machine(&contents)
    }

    fn version(&self) -> VmliteResult<String> {
        let output = run_and_capture(&self.qemu_binary, &["--version"])?;
        output
            .lines()
            .next()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .ok_or_else(|| VmliteError::Engine(format!("{} --version printed nothing", self.qemu_binary)))
    }

    fn supported_machines(&self) -> VmliteResult<Vec<String>> {
        let output = run_and_capture(&self.qemu_binary, &["-machine", "help"])?;
        Ok(parse_machine_list(&output))
    }

    fn snapshot_tags(&self, image: &Path) -> VmliteResult<Vec<String>> {
        let image = image.to_string_lossy();
        let output = run_and_capture(&self.qemu_img_binary, &["snapshot", "-l", &image])?;
        Ok(parse_snapshot_tags(&output))
    }
}

fn parse_vmstate_machine(contents: &[u8]) -> VmliteResult<String> {
    let vmstate: Value = serde_json::from_slice(contents)?;
    vmstate
        .get("vmschkmachine")
        .and_then(|machine| machine.get("Name"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| VmliteError::Engine("vmstate dump has no machine name".into()))
}

fn parse_machine_list(output: &str) -> Vec<String> {
    output
        .lines()
        .filter(|line| !line.starts_with("Supported machines"))
        .filter_map(|line| line.split_whitespace().next())
        .map(str::to_string)
        .collect()
}

/// Parse `qemu-img snapshot -l` output into the TAG column.
fn parse_snapshot_tags(output: &str) -> Vec<String> {
    output
        .lines()
        .skip_while(|line| !line.trim_start().starts_with("ID"))
        .skip(1)
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(str::to_string)
        .collect()
}
