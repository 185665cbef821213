//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.
//! The page-side store and the worker-side store are separate database files
//! with separate migration lists.

use rusqlite::Connection;

/// Current page store schema version
pub const STORE_SCHEMA_VERSION: i32 = 1;

/// Current worker store schema version
pub const WORKER_SCHEMA_VERSION: i32 = 1;

/// Page store migrations, indexed by version number
pub const STORE_MIGRATIONS: &[&str] = &[
    // Version 1: namespaced key-value table
    r#"
    -- Keys are namespaced strings (pulse:<scope>:<name>), values are JSON text.
    -- rowid order is insertion order and is what key listings follow.
    CREATE TABLE IF NOT EXISTS kv (
        key              TEXT PRIMARY KEY,
        value            TEXT NOT NULL
    );
    "#,
];

/// Worker store migrations, indexed by version number
pub const WORKER_MIGRATIONS: &[&str] = &[
    // Version 1: users known to the worker and captured push events
    r#"
    CREATE TABLE IF NOT EXISTS push_users (
        user_id          TEXT PRIMARY KEY,
        last_active      INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_push_users_last_active ON push_users(last_active);

    CREATE TABLE IF NOT EXISTS push_events (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id          TEXT NOT NULL,
        event_type       TEXT NOT NULL,
        event            TEXT NOT NULL,
        campaign_id      INTEGER,
        timestamp        INTEGER NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_push_events_user ON push_events(user_id);
    "#,
];

/// Run all pending migrations from `migrations`
pub fn run_migrations(conn: &Connection, migrations: &[&str]) -> crate::error::Result<()> {
    let current_version: i32 = conn
        .query_row("PRAGMA user_version", [], |r| r.get(0))
        .unwrap_or(0);
    let target_version = migrations.len() as i32;

    tracing::debug!(
        current_version,
        target_version,
        "Checking database migrations"
    );

    for (i, migration) in migrations.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::debug!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute(&format!("PRAGMA user_version = {}", version), [])?;
        }
    }

    if current_version < target_version {
        tracing::debug!(
            from = current_version,
            to = target_version,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}
