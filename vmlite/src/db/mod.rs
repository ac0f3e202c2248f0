//! SQLite state database.
//!
//! Two tables keyed by instance name: `vm_state` holds the last persisted
//! lifecycle state and `vm_metadata` the resume metadata written on first
//! start.

mod schema;
mod vms;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, MutexGuard};
use rusqlite::{Connection, OptionalExtension};

use vmlite_shared::errors::{VmliteError, VmliteResult};

pub use vms::VmStore;

/// Convert rusqlite errors to `VmliteError::Database`.
macro_rules! db_err {
    ($result:expr) => {
        $result.map_err(|e| VmliteError::Database(e.to_string()))
    };
}

pub(crate) use db_err;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared connection to the state database. `VmStore` layers the queries on top.
#[derive(Clone)]
pub struct Database {
    path: Arc<PathBuf>,
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.path.display())
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Open `db_path`, creating the file, its directory and the tables as needed.
    pub fn open(db_path: &Path) -> VmliteResult<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = db_err!(Connection::open(db_path))?;
        configure(&conn)?;
        Self::init_schema(&conn)?;

        tracing::debug!(path = %db_path.display(), "Opened state database");
        Ok(Self {
            path: Arc::new(db_path.to_path_buf()),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock()
    }

    fn init_schema(conn: &Connection) -> VmliteResult<()> {
        for sql in schema::all_schemas() {
            db_err!(conn.execute_batch(sql))?;
        }

        match stored_version(conn)? {
            Some(version) if version > schema::SCHEMA_VERSION => Err(VmliteError::Database(
                format!(
                    "state database was written by a newer vmlite (schema {}, this build understands {})",
                    version,
                    schema::SCHEMA_VERSION
                ),
            )),
            Some(_) => Ok(()),
            None => {
                db_err!(conn.execute(
                    "INSERT INTO schema_version (id, version, updated_at) VALUES (1, ?1, ?2)",
                    rusqlite::params![schema::SCHEMA_VERSION, Utc::now().to_rfc3339()],
                ))?;
                tracing::info!(version = schema::SCHEMA_VERSION, "Created state database");
                Ok(())
            }
        }
    }
}

/// WAL journal; each commit is synced before it returns.
fn configure(conn: &Connection) -> VmliteResult<()> {
    let mode: String = db_err!(conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
        row.get(0)
    }))?;
    if !mode.eq_ignore_ascii_case("wal") {
        tracing::warn!(journal_mode = %mode, "State database is not in WAL mode");
    }

    db_err!(conn.pragma_update(None, "synchronous", "FULL"))?;
    db_err!(conn.pragma_update(None, "foreign_keys", true))?;
    db_err!(conn.busy_timeout(BUSY_TIMEOUT))
}

fn stored_version(conn: &Connection) -> VmliteResult<Option<i32>> {
    db_err!(
        conn.query_row("SELECT version FROM schema_version WHERE id = 1", [], |row| {
            row.get(0)
        })
        .optional()
    )
}
