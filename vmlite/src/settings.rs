//! Persistent key/value settings.
//!
//! Only known keys are accepted. Values fall back to built-in defaults until
//! set, and are validated on write. The file is a flat JSON object.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use vmlite_shared::constants::settings_keys;
use vmlite_shared::errors::{VmliteError, VmliteResult};

/// Hypervisor drivers a settings file may name.
pub const SUPPORTED_DRIVERS: &[&str] = &["qemu", "libvirt"];

pub const DEFAULT_DRIVER: &str = "qemu";
const DEFAULT_PRIMARY_NAME: &str = "primary";
const DEFAULT_AUTOSTART: &str = "true";

/// Settings backed by a JSON file.
#[derive(Debug, Clone)]
pub struct Settings {
    path: PathBuf,
    defaults: BTreeMap<&'static str, &'static str>,
}

impl Settings {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let defaults = BTreeMap::from([
            (settings_keys::DRIVER, DEFAULT_DRIVER),
            (settings_keys::PRIMARY_NAME, DEFAULT_PRIMARY_NAME),
            (settings_keys::AUTOSTART, DEFAULT_AUTOSTART),
        ]);

        Self {
            path: path.into(),
            defaults,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read `key`, falling back to its default.
    pub fn get(&self, key: &str) -> VmliteResult<String> {
        let default = self.default_for(key)?;
        let stored = self.load()?;
        Ok(stored
            .get(key)
            .cloned()
            .unwrap_or_else(|| default.to_string()))
    }

    pub fn get_as<T: FromStr>(&self, key: &str) -> VmliteResult<T> {
        let value = self.get(key)?;
        value.parse().map_err(|_| {
            VmliteError::Config(format!(
                "setting {} has value {:?} of unexpected type",
                key, value
            ))
        })
    }

    /// Validate and store `value` under `key`.
    pub fn set(&self, key: &str, value: &str) -> VmliteResult<()> {
        self.default_for(key)?;
        validate(key, value)?;

        let mut stored = self.load()?;
        stored.insert(key.to_string(), value.to_string());

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&stored)?;
        std::fs::write(&self.path, json).map_err(|e| {
            VmliteError::Config(format!(
                "failed to write settings {}: {}",
                self.path.display(),
                e
            ))
        })?;

        tracing::debug!(key, value, "Updated setting");
        Ok(())
    }

    fn default_for(&self, key: &str) -> VmliteResult<&'static str> {
        self.defaults
            .get(key)
            .copied()
            .ok_or_else(|| VmliteError::Config(format!("unrecognized settings key: {}", key)))
    }

    fn load(&self) -> VmliteResult<BTreeMap<String, String>> {
        match std::fs::read_to_string(&self.path) {
            Ok(contents) if contents.trim().is_empty() => Ok(BTreeMap::new()),
            Ok(contents) => serde_json::from_str(&contents).map_err(|e| {
                VmliteError::Config(format!(
                    "settings file {} has a format error: {}",
                    self.path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(VmliteError::Config(format!(
                "cannot read settings {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

fn validate(key: &str, value: &str) -> VmliteResult<()> {
    let invalid = |reason: &str| {
        Err(VmliteError::Config(format!(
            "invalid setting {}={}: {}",
            key, value, reason
        )))
    };

    match key {
        settings_keys::DRIVER if !SUPPORTED_DRIVERS.contains(&value) => invalid("invalid driver"),
        settings_keys::PRIMARY_NAME if !valid_hostname(value) => invalid("invalid hostname"),
        settings_keys::AUTOSTART if value != "true" && value != "false" => {
            invalid("need \"true\" or \"false\"")
        }
        _ => Ok(()),
    }
}

/// RFC 1123 label: letters, digits and inner hyphens, starting with a letter.
fn valid_hostname(name: &str) -> bool {
    let bytes = name.as_bytes();
    !bytes.is_empty()
        && bytes.len() <= 63
        && bytes[0].is_ascii_alphabetic()
        && bytes[bytes.len() - 1].is_ascii_alphanumeric()
        && bytes.iter().all(|b| b.is_ascii_alphanumeric() || *b == b'-')
}
