use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use vmlite_shared::constants::{SUSPEND_TAG, metadata_keys};

use super::probe::HypervisorProbe;
use super::spec::{QemuProcessSpec, ResumeData};

/// Opaque key/value record describing how a suspended instance was created.
///
/// Stored by the status monitor and read back on resume to rebuild a
/// compatible command line. Unknown keys are preserved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeMetadata(Map<String, Value>);

impl ResumeMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    /// Describe a fresh instance launched with the latest command line.
    ///
    /// Probe failures are logged and recorded as empty values; they never
    /// prevent a start.
    pub fn generate(probe: &dyn HypervisorProbe) -> Self {
        let machine_type = probe.machine_type().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to probe hypervisor machine type");
            String::new()
        });
        let version = probe.version().unwrap_or_else(|e| {
            tracing::warn!(error = %e, "Failed to probe hypervisor version");
            String::new()
        });

        let mut metadata = Self::new();
        metadata.insert(metadata_keys::MACHINE_TYPE, Value::String(machine_type));
        metadata.insert(metadata_keys::USE_CDROM, Value::Bool(true));
        metadata.insert(metadata_keys::HYPERVISOR_VERSION, Value::String(version));
        metadata
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.0.insert(key.into(), value);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Command-line schema version: `use_cdrom` marks version 1, anything else is 0.
    pub fn command_version(&self) -> u32 {
        match self.get(metadata_keys::USE_CDROM) {
            Some(Value::Bool(true)) => 1,
            _ => 0,
        }
    }

    /// Recorded machine type, empty when absent.
    pub fn machine_type(&self) -> String {
        self.get(metadata_keys::MACHINE_TYPE)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }

    pub fn hypervisor_version(&self) -> Option<&str> {
        self.get(metadata_keys::HYPERVISOR_VERSION)
            .and_then(Value::as_str)
    }

    pub fn resume_data(&self) -> ResumeData {
        ResumeData {
            suspend_tag: SUSPEND_TAG.to_string(),
            machine_type: self.machine_type(),
        }
    }

    /// Check the snapshot can be restored by this hypervisor.
    ///
    /// `supported_machines` is `None` when the list could not be probed, in
    /// which case the machine type is not checked. Returns the reason on
    /// mismatch.
    pub fn check_compatible(&self, supported_machines: Option<&[String]>) -> Result<(), String> {
        let version = self.command_version();
        if version > QemuProcessSpec::LATEST_VERSION {
            return Err(format!(
                "command line version {} is newer than supported {}",
                version,
                QemuProcessSpec::LATEST_VERSION
            ));
        }

        let machine_type = self.machine_type();
        if let Some(supported) = supported_machines
            && !machine_type.is_empty()
            && !supported.iter().any(|m| *m == machine_type)
        {
            return Err(format!(
                "machine type {} is not supported by the installed hypervisor",
                machine_type
            ));
        }

        Ok(())
    }
}

impl From<Map<String, Value>> for ResumeMetadata {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
