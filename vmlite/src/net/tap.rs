//! Tap devices attached to the host bridge.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use vmlite_shared::errors::{VmliteError, VmliteResult};

use super::HostNetwork;
use crate::util::{run_and_capture, run_for_status};

/// `HostNetwork` implemented with the `ip` tool.
#[derive(Debug, Clone)]
pub struct IpLinkNetwork {
    bridge_name: String,
}

impl IpLinkNetwork {
    pub fn new(bridge_name: impl Into<String>) -> Self {
        Self {
            bridge_name: bridge_name.into(),
        }
    }
}

impl HostNetwork for IpLinkNetwork {
    fn create_tap(&self, name: &str) -> VmliteResult<()> {
        if run_for_status("ip", &["addr", "show", name]) {
            tracing::debug!(tap = %name, "Tap device already exists");
            return Ok(());
        }

        let map_err = |e: VmliteError| {
            VmliteError::Engine(format!("failed to create tap device {}: {}", name, e))
        };

        run_and_capture("ip", &["tuntap", "add", name, "mode", "tap"]).map_err(map_err)?;
        run_and_capture("ip", &["link", "set", name, "master", &self.bridge_name])
            .map_err(map_err)?;
        run_and_capture("ip", &["link", "set", name, "up"]).map_err(map_err)?;

        tracing::info!(tap = %name, bridge = %self.bridge_name, "Created tap device");
        Ok(())
    }

    fn remove_tap(&self, name: &str) {
        if run_for_status("ip", &["addr", "show", name]) {
            if run_for_status("ip", &["link", "delete", name]) {
                tracing::debug!(tap = %name, "Removed tap device");
            } else {
                tracing::warn!(tap = %name, "Failed to remove tap device");
            }
        }
    }
}

/// A created tap device, removed exactly once on `remove()` or drop.
pub struct TapDevice {
    name: String,
    network: Arc<dyn HostNetwork>,
    removed: AtomicBool,
}

impl TapDevice {
    pub fn create(name: impl Into<String>, network: Arc<dyn HostNetwork>) -> VmliteResult<Self> {
        let name = name.into();
        network.create_tap(&name)?;
        Ok(Self::adopt(name, network))
    }

    /// Take ownership of a device that already exists.
    pub fn adopt(name: impl Into<String>, network: Arc<dyn HostNetwork>) -> Self {
        Self {
            name: name.into(),
            network,
            removed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn remove(&self) {
        if !self.removed.swap(true, Ordering::SeqCst) {
            self.network.remove_tap(&self.name);
        }
    }
}

impl std::fmt::Debug for TapDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TapDevice")
            .field("name", &self.name)
            .field("removed", &self.removed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Drop for TapDevice {
    fn drop(&mut self) {
        self.remove();
    }
}
