//! Database repository layer
//!
//! A synchronous key-value store over SQLite. Keys are listed in insertion
//! order, which is what the event queue relies on for stable batches.

use crate::error::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

/// Database handle with a single guarded connection
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        super::schema::run_migrations(&conn, super::schema::STORE_MIGRATIONS)
    }

    // ============================================
    // Key-value operations
    // ============================================

    /// Read the raw value stored under `key`
    pub fn read(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        conn.query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()
        .map_err(Error::from)
    }

    /// Insert or overwrite `key`
    pub fn write(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO kv (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value
            "#,
            params![key, value],
        )?;
        Ok(())
    }

    /// Remove `key`; returns whether a row was deleted
    pub fn delete(&self, key: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let deleted = conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
        Ok(deleted > 0)
    }

    /// Remove every key in `keys` in one transaction; returns the number deleted
    pub fn delete_many(&self, keys: &[String]) -> Result<usize> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let mut deleted = 0;
        {
            let mut stmt = tx.prepare("DELETE FROM kv WHERE key = ?1")?;
            for key in keys {
                deleted += stmt.execute([key])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    /// List keys starting with `prefix`, in insertion order
    pub fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT key FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY rowid",
        )?;
        let keys = stmt
            .query_map([prefix], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(keys)
    }

    /// List `(key, value)` pairs whose key starts with `prefix`, in insertion order.
    ///
    /// Keys and values come from a single query so the caller sees one
    /// consistent snapshot.
    pub fn entries_with_prefix(&self, prefix: &str) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT key, value FROM kv WHERE substr(key, 1, length(?1)) = ?1 ORDER BY rowid",
        )?;
        let entries = stmt
            .query_map([prefix], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<(String, String)>>>()?;
        Ok(entries)
    }

    /// Number of stored keys
    pub fn len(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM kv", [], |r| r.get(0))?;
        Ok(count as usize)
    }

    /// Whether the store holds no keys
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Remove every key
    pub fn clear(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM kv", [])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    #[test]
    fn test_write_read_overwrite() {
        let db = test_db();
        assert_eq!(db.read("a").unwrap(), None);

        db.write("a", "1").unwrap();
        db.write("a", "2").unwrap();
        assert_eq!(db.read("a").unwrap().as_deref(), Some("2"));
        assert_eq!(db.len().unwrap(), 1);
    }

    #[test]
    fn test_prefix_listing_keeps_insertion_order() {
        let db = test_db();
        db.write("pulse:u1:events:9", "x").unwrap();
        db.write("pulse:u1:events:1", "y").unwrap();
        db.write("pulse:u2:events:5", "z").unwrap();
        db.write("pulse:u1:seqnum", "3").unwrap();

        let keys = db.keys_with_prefix("pulse:u1:events").unwrap();
        assert_eq!(keys, vec!["pulse:u1:events:9", "pulse:u1:events:1"]);

        let entries = db.entries_with_prefix("pulse:u1:events").unwrap();
        assert_eq!(entries[0].1, "x");
        assert_eq!(entries[1].1, "y");
    }

    #[test]
    fn test_prefix_is_literal() {
        let db = test_db();
        db.write("pulse:a_b:events:1", "x").unwrap();
        db.write("pulse:axb:events:1", "y").unwrap();

        // '_' would be a wildcard under LIKE
        assert_eq!(db.keys_with_prefix("pulse:a_b:").unwrap().len(), 1);
    }

    #[test]
    fn test_delete_many() {
        let db = test_db();
        db.write("k1", "1").unwrap();
        db.write("k2", "2").unwrap();
        db.write("k3", "3").unwrap();

        let deleted = db
            .delete_many(&["k1".to_string(), "k3".to_string(), "missing".to_string()])
            .unwrap();
        assert_eq!(deleted, 2);
        assert_eq!(db.keys_with_prefix("k").unwrap(), vec!["k2"]);
        assert!(db.delete("k2").unwrap());
        assert!(db.is_empty().unwrap());
    }

    #[test]
    fn test_open_on_disk_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/store.db");
        let db = Database::open(&path).unwrap();
        db.migrate().unwrap();
        db.write("k", "v").unwrap();
        drop(db);

        let reopened = Database::open(&path).unwrap();
        reopened.migrate().unwrap();
        assert_eq!(reopened.read("k").unwrap().as_deref(), Some("v"));
    }
}
