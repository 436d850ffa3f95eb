//! SQLite-backed key/value store for ping records.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::models::*;

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Document error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("Not found")]
    NotFound,
    #[error("Connection lock poisoned")]
    Poisoned,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS ping_records (
    key        TEXT PRIMARY KEY,
    document   TEXT NOT NULL,
    updated_at TEXT NOT NULL
);
";

/// Thread-safe key/value store holding one JSON document per key.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Create a store that lives only as long as the process.
    pub fn in_memory() -> Result<Self, DbError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, DbError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    /// Upsert the document stored at `key`. Last write wins.
    pub fn put(&self, key: &str, record: &PingRecord) -> Result<(), DbError> {
        let document = serde_json::to_string(record)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO ping_records (key, document, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET
             document=excluded.document, updated_at=excluded.updated_at",
            params![key, document, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Fetch the document stored at `key`.
    pub fn get(&self, key: &str) -> Result<PingRecord, DbError> {
        let conn = self.conn()?;
        let document: Option<String> = conn
            .query_row(
                "SELECT document FROM ping_records WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        match document {
            Some(doc) => Ok(serde_json::from_str(&doc)?),
            None => Err(DbError::NotFound),
        }
    }

    /// List every key starting with `prefix` together with its document.
    ///
    /// This is a full table scan, linear in the number of stored keys.
    pub fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, PingRecord)>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT key, document FROM ping_records
             WHERE substr(key, 1, length(?1)) = ?1 ORDER BY key ASC",
        )?;

        let rows = stmt
            .query_map(params![prefix], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<SqlResult<Vec<_>>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for (key, doc) in rows {
            match serde_json::from_str(&doc) {
                Ok(record) => records.push((key, record)),
                Err(e) => tracing::warn!(key = %key, error = %e, "Skipping unreadable ping record"),
            }
        }
        Ok(records)
    }
}
