//! SQLite-backed key-value store
//!
//! 단일 `kv` 테이블에 (key, version, value JSON)을 저장합니다.
//! CAS는 `UPDATE ... WHERE version = ?` 한 문장으로 수행됩니다.

use super::kv::{KvStore, Versioned};
use crate::{Error, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Database file name inside the data directory
pub const STORE_FILE: &str = "tandem.db";

/// Durable key-value store
pub struct SqliteKvStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteKvStore {
    /// Open (or create) the store inside `data_dir`
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| Error::Storage(format!("Failed to create data directory: {}", e)))?;

        let db_path = data_dir.join(STORE_FILE);
        let conn = Connection::open(&db_path)
            .map_err(|e| Error::Storage(format!("Failed to open database: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| Error::Storage(format!("Failed to set pragmas: {}", e)))?;

        debug!(path = %db_path.display(), "Opened key-value store");
        Self::from_connection(conn)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("Failed to create in-memory database: {}", e)))?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS kv (
                key TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            "#,
        )
        .map_err(|e| Error::Storage(format!("Failed to initialize schema: {}", e)))?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Internal("Lock poisoned".to_string()))
    }

    fn current_version(conn: &Connection, key: &str) -> Result<u64> {
        let version: Option<i64> = conn
            .query_row("SELECT version FROM kv WHERE key = ?1", params![key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(version.unwrap_or(0) as u64)
    }
}

impl KvStore for SqliteKvStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn get(&self, key: &str) -> Result<Option<Versioned>> {
        let conn = self.lock()?;
        let row: Option<(i64, String)> = conn
            .query_row(
                "SELECT version, value FROM kv WHERE key = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        match row {
            Some((version, value)) => Ok(Some(Versioned {
                version: version as u64,
                value: serde_json::from_str(&value)?,
            })),
            None => Ok(None),
        }
    }

    fn put(&self, key: &str, value: serde_json::Value) -> Result<u64> {
        let conn = self.lock()?;
        let version = Self::current_version(&conn, key)? + 1;
        conn.execute(
            "INSERT INTO kv (key, version, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET version = excluded.version,
                 value = excluded.value, updated_at = datetime('now')",
            params![key, version as i64, value.to_string()],
        )?;
        Ok(version)
    }

    fn compare_and_swap(&self, key: &str, expected: u64, value: serde_json::Value) -> Result<u64> {
        let conn = self.lock()?;
        let new_version = expected + 1;

        let changed = if expected == 0 {
            conn.execute(
                "INSERT OR IGNORE INTO kv (key, version, value) VALUES (?1, 1, ?2)",
                params![key, value.to_string()],
            )?
        } else {
            conn.execute(
                "UPDATE kv SET version = ?1, value = ?2, updated_at = datetime('now')
                 WHERE key = ?3 AND version = ?4",
                params![new_version as i64, value.to_string(), key, expected as i64],
            )?
        };

        if changed == 0 {
            let actual = Self::current_version(&conn, key)?;
            return Err(Error::Conflict {
                key: key.to_string(),
                expected,
                actual,
            });
        }

        Ok(new_version)
    }

    fn delete(&self, key: &str) -> Result<bool> {
        let conn = self.lock()?;
        Ok(conn.execute("DELETE FROM kv WHERE key = ?1", params![key])? > 0)
    }

    fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT key, version, value FROM kv WHERE substr(key, 1, ?1) = ?2 ORDER BY key",
        )?;
        let rows = stmt.query_map(params![prefix.len() as i64, prefix], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (key, version, value) = row?;
            out.push((
                key,
                Versioned {
                    version: version as u64,
                    value: serde_json::from_str(&value)?,
                },
            ));
        }
        Ok(out)
    }
}
