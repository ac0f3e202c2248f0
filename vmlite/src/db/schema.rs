pub(super) const SCHEMA_VERSION: i32 = 1;

const SCHEMA_VERSION_TABLE: &str = "
CREATE TABLE IF NOT EXISTS schema_version (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    version INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);
";

const VM_STATE_TABLE: &str = "
CREATE TABLE IF NOT EXISTS vm_state (
    name TEXT PRIMARY KEY NOT NULL,
    state TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

const VM_METADATA_TABLE: &str = "
CREATE TABLE IF NOT EXISTS vm_metadata (
    name TEXT PRIMARY KEY NOT NULL,
    json TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

pub(super) fn all_schemas() -> [&'static str; 3] {
    [SCHEMA_VERSION_TABLE, VM_STATE_TABLE, VM_METADATA_TABLE]
}
