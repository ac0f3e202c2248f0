//! Status monitor: where controllers report lifecycle transitions.
//!
//! `PersistentMonitor` follows a database-first pattern: every write goes to
//! SQLite before the in-memory cache is updated, and notifications are
//! broadcast to any subscribers after the fact.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::broadcast;
use vmlite_shared::errors::{VmliteError, VmliteResult};

use crate::db::VmStore;
use crate::vmm::VmState;
use crate::vmm::qemu::ResumeMetadata;

const EVENT_CAPACITY: usize = 64;

/// Receives lifecycle reports from controllers.
pub trait StatusMonitor: Send + Sync {
    fn persist_state(&self, name: &str, state: VmState) -> VmliteResult<()>;

    /// Metadata recorded for `name`; empty when nothing was stored.
    fn retrieve_metadata(&self, name: &str) -> VmliteResult<ResumeMetadata>;

    fn update_metadata(&self, name: &str, metadata: &ResumeMetadata) -> VmliteResult<()>;

    fn on_resume(&self);

    fn on_suspend(&self);

    fn on_shutdown(&self);

    fn on_restart(&self, name: &str);
}

/// Notifications published by `PersistentMonitor`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MonitorEvent {
    StateChanged { name: String, state: VmState },
    Resumed,
    Suspended,
    Shutdown,
    Restarted { name: String },
}

#[derive(Default)]
struct Cache {
    states: HashMap<String, VmState>,
    metadata: HashMap<String, ResumeMetadata>,
}

/// SQLite-backed `StatusMonitor` with an in-memory cache.
#[derive(Clone)]
pub struct PersistentMonitor {
    store: VmStore,
    cache: Arc<RwLock<Cache>>,
    events: broadcast::Sender<MonitorEvent>,
}

impl std::fmt::Debug for PersistentMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentMonitor").finish()
    }
}

impl PersistentMonitor {
    pub fn new(store: VmStore) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            store,
            cache: Arc::new(RwLock::new(Cache::default())),
            events,
        }
    }

    /// Load every persisted state into the cache. Returns how many were found.
    pub fn load_all(&self) -> VmliteResult<usize> {
        let states = self.store.list_states()?;
        let count = states.len();

        let mut cache = self.write_cache()?;
        for (name, state) in states {
            tracing::debug!(vm_name = %name, %state, "Recovered persisted state");
            cache.states.insert(name, state);
        }
        Ok(count)
    }

    /// Last persisted state of `name`.
    pub fn state_of(&self, name: &str) -> VmliteResult<Option<VmState>> {
        if let Some(state) = self.read_cache()?.states.get(name) {
            return Ok(Some(*state));
        }
        self.store.load_state(name)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    /// Forget a deleted instance.
    pub fn remove(&self, name: &str) -> VmliteResult<()> {
        self.store.remove(name)?;

        let mut cache = self.write_cache()?;
        cache.states.remove(name);
        cache.metadata.remove(name);
        Ok(())
    }

    fn publish(&self, event: MonitorEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn read_cache(&self) -> VmliteResult<std::sync::RwLockReadGuard<'_, Cache>> {
        self.cache
            .read()
            .map_err(|e| VmliteError::Internal(format!("monitor lock poisoned: {}", e)))
    }

    fn write_cache(&self) -> VmliteResult<std::sync::RwLockWriteGuard<'_, Cache>> {
        self.cache
            .write()
            .map_err(|e| VmliteError::Internal(format!("monitor lock poisoned: {}", e)))
    }
}

impl StatusMonitor for PersistentMonitor {
    fn persist_state(&self, name: &str, state: VmState) -> VmliteResult<()> {
        // Database-first
        self.store.save_state(name, state)?;

        let old = self.write_cache()?.states.insert(name.to_string(), state);
        tracing::debug!(vm_name = %name, old_state = ?old, new_state = %state, "Persisted state");

        self.publish(MonitorEvent::StateChanged {
            name: name.to_string(),
            state,
        });
        Ok(())
    }

    fn retrieve_metadata(&self, name: &str) -> VmliteResult<ResumeMetadata> {
        if let Some(metadata) = self.read_cache()?.metadata.get(name) {
            return Ok(metadata.clone());
        }

        let metadata = self.store.load_metadata(name)?.unwrap_or_default();
        if !metadata.is_empty() {
            self.write_cache()?
                .metadata
                .insert(name.to_string(), metadata.clone());
        }
        Ok(metadata)
    }

    fn update_metadata(&self, name: &str, metadata: &ResumeMetadata) -> VmliteResult<()> {
        // Database-first
        self.store.save_metadata(name, metadata)?;

        self.write_cache()?
            .metadata
            .insert(name.to_string(), metadata.clone());
        tracing::debug!(vm_name = %name, "Updated resume metadata");
        Ok(())
    }

    fn on_resume(&self) {
        self.publish(MonitorEvent::Resumed);
    }

    fn on_suspend(&self) {
        self.publish(MonitorEvent::Suspended);
    }

    fn on_shutdown(&self) {
        self.publish(MonitorEvent::Shutdown);
    }

    fn on_restart(&self, name: &str) {
        tracing::info!(vm_name = %name, "Instance restarting");
        self.publish(MonitorEvent::Restarted {
            name: name.to_string(),
        });
    }
}
