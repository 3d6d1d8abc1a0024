//! Local persistence for Mousy.
//!
//! A single SQLite table holds every locally persisted value as a JSON string
//! under a string key: the per-record shadows (`experiment_<id>`) and the two
//! queue lists (`<namespace>:sync_queue`, `<namespace>:upload_queue`).
//!
//! The database is shared as `Arc<Mutex<Database>>`. Every read-modify-write
//! of a queue happens under one lock acquisition, which makes the lock the
//! single writer for all local state.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{MousyError, MousyResult};

/// Database wrapper for SQLite operations
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Create a new database connection
    pub fn new<P: AsRef<Path>>(db_path: P) -> MousyResult<Self> {
        let conn = Connection::open(db_path)?;

        // WAL keeps readers from blocking the single writer
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        let db = Self { conn };
        db.init_database()?;
        Ok(db)
    }

    /// Create an in-memory database (for testing)
    pub fn new_in_memory() -> MousyResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init_database()?;
        Ok(db)
    }

    /// Initialize database schema
    pub fn init_database(&self) -> MousyResult<()> {
        self.conn.execute_batch(
            r#"
            -- All timestamps are Unix seconds (INTEGER)
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Get the underlying connection
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Get the raw string stored under `key`
    pub fn get_value(&self, key: &str) -> MousyResult<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Store a raw string under `key`, replacing any previous value
    pub fn set_value(&self, key: &str, value: &str) -> MousyResult<()> {
        self.conn.execute(
            "INSERT INTO kv_store (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    /// Delete `key`. Returns whether a row was removed.
    pub fn delete_value(&self, key: &str) -> MousyResult<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM kv_store WHERE key = ?", params![key])?;
        Ok(deleted > 0)
    }

    /// All keys starting with `prefix`, in key order
    pub fn keys_with_prefix(&self, prefix: &str) -> MousyResult<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key FROM kv_store WHERE substr(key, 1, ?) = ? ORDER BY key")?;
        let keys = stmt
            .query_map(params![prefix.chars().count() as i64, prefix], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(keys)
    }

    /// Decode the JSON value stored under `key`
    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> MousyResult<Option<T>> {
        match self.get_value(key)? {
            Some(raw) => {
                let value = serde_json::from_str(&raw)
                    .map_err(|e| MousyError::decode(key, e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Encode `value` as JSON and store it under `key`
    pub fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> MousyResult<()> {
        let raw = serde_json::to_string(value)?;
        self.set_value(key, &raw)
    }

    /// Close the database connection
    pub fn close(self) -> MousyResult<()> {
        self.conn
            .close()
            .map_err(|(_, e)| MousyError::Database(e))
    }
}

/// Acquire the shared database lock.
///
/// A poisoned lock is reported as a local storage failure instead of a panic.
pub fn lock_database(db: &Mutex<Database>) -> MousyResult<MutexGuard<'_, Database>> {
    db.lock()
        .map_err(|_| MousyError::database_op("database lock poisoned"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn test_create_database() {
        let db = Database::new_in_memory().unwrap();
        assert!(db.get_value("missing").unwrap().is_none());
        assert!(db.keys_with_prefix("").unwrap().is_empty());
    }

    #[test]
    fn test_set_and_replace_value() {
        let db = Database::new_in_memory().unwrap();
        db.set_value("k", "one").unwrap();
        db.set_value("k", "two").unwrap();

        assert_eq!(db.get_value("k").unwrap(), Some("two".to_string()));
        assert_eq!(db.keys_with_prefix("k").unwrap().len(), 1);
    }

    #[test]
    fn test_delete_value() {
        let db = Database::new_in_memory().unwrap();
        db.set_value("k", "v").unwrap();

        assert!(db.delete_value("k").unwrap());
        assert!(!db.delete_value("k").unwrap());
        assert!(db.get_value("k").unwrap().is_none());
    }

    #[test]
    fn test_keys_with_prefix() {
        let db = Database::new_in_memory().unwrap();
        db.set_value("experiment_b", "{}").unwrap();
        db.set_value("experiment_a", "{}").unwrap();
        db.set_value("@mousy:sync_queue", "[]").unwrap();

        let keys = db.keys_with_prefix("experiment_").unwrap();
        assert_eq!(keys, vec!["experiment_a".to_string(), "experiment_b".to_string()]);
    }

    #[test]
    fn test_prefix_is_literal() {
        let db = Database::new_in_memory().unwrap();
        db.set_value("experiment_1", "{}").unwrap();
        db.set_value("experimentX1", "{}").unwrap();

        // '_' must not act as a LIKE wildcard
        assert_eq!(db.keys_with_prefix("experiment_").unwrap().len(), 1);
    }

    #[test]
    fn test_json_helpers() {
        let db = Database::new_in_memory().unwrap();
        let sample = Sample {
            name: "plate".to_string(),
            count: 96,
        };
        db.set_json("sample", &sample).unwrap();

        let loaded: Option<Sample> = db.get_json("sample").unwrap();
        assert_eq!(loaded, Some(sample));
    }

    #[test]
    fn test_corrupt_json_is_decode_error() {
        let db = Database::new_in_memory().unwrap();
        db.set_value("sample", "{not json").unwrap();

        let result: MousyResult<Option<Sample>> = db.get_json("sample");
        assert!(matches!(result, Err(MousyError::Decode { .. })));
    }

    #[test]
    fn test_persistence_across_connections() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("mousy.db");

        {
            let db = Database::new(&path).unwrap();
            db.set_value("k", "kept").unwrap();
            db.close().unwrap();
        }

        let db = Database::new(&path).unwrap();
        assert_eq!(db.get_value("k").unwrap(), Some("kept".to_string()));
    }

    #[test]
    fn test_lock_database() {
        let db = Mutex::new(Database::new_in_memory().unwrap());
        let guard = lock_database(&db).unwrap();
        guard.set_value("k", "v").unwrap();
    }
}
