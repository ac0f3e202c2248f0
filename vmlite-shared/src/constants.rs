//! Constants shared across crates.

/// Snapshot tag used for suspend/resume memory snapshots inside the boot image.
pub const SUSPEND_TAG: &str = "suspend";

/// Resume metadata keys.
pub mod metadata_keys {
    /// Emulated machine type the snapshot was taken with.
    pub const MACHINE_TYPE: &str = "machine_type";
    /// Set when the instance was created with the cdrom command-line schema.
    pub const USE_CDROM: &str = "use_cdrom";
    /// Hypervisor version string at creation time.
    pub const HYPERVISOR_VERSION: &str = "hypervisor_version";
}

/// Environment variables read by the runtime.
pub mod env {
    /// Overrides the runtime home directory.
    pub const HOME: &str = "VMLITE_HOME";
    /// Driver environment variable. Not consulted by settings lookup.
    pub const DRIVER: &str = "VMLITE_VM_DRIVER";
}

/// Settings keys.
pub mod settings_keys {
    pub const DRIVER: &str = "local.driver";
    pub const PRIMARY_NAME: &str = "client.primary-name";
    pub const AUTOSTART: &str = "client.gui.autostart";
}

/// Default timing values for address resolution.
pub mod timing {
    pub const IP_TIMEOUT_SECS: u64 = 120;
    pub const IP_RETRY_INTERVAL_MS: u64 = 1000;
}

/// Port the guest exec channel listens on.
pub const SSH_PORT: u16 = 22;

/// Returned by non-blocking address queries on a miss.
pub const UNKNOWN_ADDRESS: &str = "UNKNOWN";
