//! Configuration for the runtime.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use vmlite_shared::constants::{env, timing};

/// Runtime configuration.
///
/// Every field has a default, so a partial JSON document deserializes.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct VmliteOptions {
    /// Root for the database, settings file and logs.
    pub home_dir: PathBuf,
    /// Virtualization driver. Only `qemu` has a backend.
    pub driver: String,
    pub qemu_binary: String,
    pub qemu_img_binary: String,
    /// Bridge new tap devices are attached to.
    pub bridge_name: String,
    /// dnsmasq lease file serving the bridge.
    pub leases_path: PathBuf,
    pub ip_timeout_secs: u64,
    pub ip_retry_interval_ms: u64,
}

impl Default for VmliteOptions {
    fn default() -> Self {
        Self {
            home_dir: default_home_dir(),
            driver: crate::settings::DEFAULT_DRIVER.to_string(),
            qemu_binary: format!("qemu-system-{}", std::env::consts::ARCH),
            qemu_img_binary: "qemu-img".to_string(),
            bridge_name: "vmlitebr0".to_string(),
            leases_path: PathBuf::from("/var/lib/misc/dnsmasq.leases"),
            ip_timeout_secs: timing::IP_TIMEOUT_SECS,
            ip_retry_interval_ms: timing::IP_RETRY_INTERVAL_MS,
        }
    }
}

impl VmliteOptions {
    pub fn ip_timeout(&self) -> Duration {
        Duration::from_secs(self.ip_timeout_secs)
    }

    pub fn ip_retry_interval(&self) -> Duration {
        Duration::from_millis(self.ip_retry_interval_ms)
    }

    pub fn db_path(&self) -> PathBuf {
        self.home_dir.join("db").join("vmlite.db")
    }

    pub fn settings_path(&self) -> PathBuf {
        self.home_dir.join("settings.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.home_dir.join("logs")
    }
}

fn default_home_dir() -> PathBuf {
    if let Ok(home) = std::env::var(env::HOME)
        && !home.is_empty()
    {
        return PathBuf::from(home);
    }

    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".vmlite")
}
