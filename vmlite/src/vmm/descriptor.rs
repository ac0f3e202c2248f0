use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Immutable description of one virtual machine, supplied at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmDescriptor {
    /// Unique instance name. Used as the persistence key.
    pub vm_name: String,
    /// MAC address of the guest NIC, used for DHCP lease lookups.
    pub mac_addr: String,
    pub ssh_username: String,
    /// Boot disk image. Also holds the suspend snapshot.
    pub image_path: PathBuf,
    pub cloud_init_iso: PathBuf,
    pub num_cores: u32,
    pub mem_size_mib: u64,
    /// Driver-specific arguments appended verbatim to the hypervisor command line.
    #[serde(default)]
    pub extra_args: Vec<String>,
}
