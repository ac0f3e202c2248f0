//! Per-instance state and metadata rows.

use chrono::Utc;
use rusqlite::OptionalExtension;
use vmlite_shared::errors::{VmliteError, VmliteResult};

use super::{Database, db_err};
use crate::vmm::VmState;
use crate::vmm::qemu::ResumeMetadata;

/// Store for persisted lifecycle states and resume metadata, keyed by VM name.
#[derive(Debug, Clone)]
pub struct VmStore {
    db: Database,
}

impl VmStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn save_state(&self, name: &str, state: VmState) -> VmliteResult<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.db.conn();
        db_err!(conn.execute(
            "INSERT INTO vm_state (name, state, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET state = excluded.state, updated_at = excluded.updated_at",
            rusqlite::params![name, state.to_string(), now],
        ))?;
        Ok(())
    }

    pub fn load_state(&self, name: &str) -> VmliteResult<Option<VmState>> {
        let conn = self.db.conn();
        let raw: Option<String> = db_err!(
            conn.query_row(
                "SELECT state FROM vm_state WHERE name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()
        )?;

        raw.map(|s| s.parse()).transpose()
    }

    /// All persisted states, ordered by name.
    pub fn list_states(&self) -> VmliteResult<Vec<(String, VmState)>> {
        let conn = self.db.conn();
        let mut stmt = db_err!(conn.prepare("SELECT name, state FROM vm_state ORDER BY name"))?;
        let rows = db_err!(stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        }))?;

        let mut states = Vec::new();
        for row in rows {
            let (name, state) = db_err!(row)?;
            states.push((name, state.parse()?));
        }
        Ok(states)
    }

    pub fn save_metadata(&self, name: &str, metadata: &ResumeMetadata) -> VmliteResult<()> {
        let json = serde_json::to_string(metadata)?;
        let now = Utc::now().to_rfc3339();
        let conn = self.db.conn();
        db_err!(conn.execute(
            "INSERT INTO vm_metadata (name, json, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET json = excluded.json, updated_at = excluded.updated_at",
            rusqlite::params![name, json, now],
        ))?;
        Ok(())
    }

    pub fn load_metadata(&self, name: &str) -> VmliteResult<Option<ResumeMetadata>> {
        let conn = self.db.conn();
        let json: Option<String> = db_err!(
            conn.query_row(
                "SELECT json FROM vm_metadata WHERE name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()
        )?;

        json.map(|j| serde_json::from_str(&j).map_err(VmliteError::from))
            .transpose()
    }

    /// Forget everything recorded for `name`. Returns whether anything existed.
    pub fn remove(&self, name: &str) -> VmliteResult<bool> {
        let conn = self.db.conn();
        let states = db_err!(conn.execute("DELETE FROM vm_state WHERE name = ?1", [name]))?;
        let metadata = db_err!(conn.execute("DELETE FROM vm_metadata WHERE name = ?1", [name]))?;
        Ok(states + metadata > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn store() -> (TempDir, VmStore) {
        let dir = TempDir::new().unwrap();
        let db = Database::open(&dir.path().join("vmlite.db")).unwrap();
        (dir, VmStore::new(db))
    }

    #[test]
    fn test_state_upsert() {
        let (_dir, store) = store();
        assert_eq!(store.load_state("primary").unwrap(), None);

        store.save_state("primary", VmState::Running).unwrap();
        store.save_state("primary", VmState::DelayedShutdown).unwrap();
        store.save_state("backup", VmState::Off).unwrap();

        assert_eq!(
            store.load_state("primary").unwrap(),
            Some(VmState::DelayedShutdown)
        );
        assert_eq!(
            store.list_states().unwrap(),
            vec![
                ("backup".to_string(), VmState::Off),
                ("primary".to_string(), VmState::DelayedShutdown),
            ]
        );
    }

    #[test]
    fn test_metadata_round_trip() {
        let (_dir, store) = store();
        let metadata: ResumeMetadata = serde_json::from_value(json!({
            "machine_type": "pc-i440fx-8.2",
            "use_cdrom": true,
        }))
        .unwrap();

        store.save_metadata("primary", &metadata).unwrap();
        assert_eq!(store.load_metadata("primary").unwrap(), Some(metadata));
        assert_eq!(store.load_metadata("other").unwrap(), None);

        assert!(store.remove("primary").unwrap());
        assert!(!store.remove("primary").unwrap());
        assert_eq!(store.load_metadata("primary").unwrap(), None);
    }
}
