pub mod lock;
pub mod migration;
pub mod models;
pub mod schema;
pub mod tasks;
pub mod users;
pub mod versions;
pub mod workspaces;

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use anyhow::Context;
use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use rusqlite::Connection;

use crate::error::{Error, Result};

pub use lock::WorkspaceLock;
pub use tasks::TaskFilter;

/// The single relational store behind every service.
///
/// Repository methods are split by entity across the files of this module.
/// Callers must not hold the guard returned by [`Database::conn`] across an
/// `.await` or while dropping a [`WorkspaceLock`].
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create the database file, creating parent directories.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(dir) = db_path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("Failed to open database at {}", db_path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON; PRAGMA busy_timeout=5000;")?;
        migration::check_and_migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        migration::check_and_migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::internal("database connection mutex poisoned"))
    }
}

// ─── Helpers ────────────────────────────────────────────────────────────────

/// Current time in the fixed-width format used by every timestamp column.
pub fn now() -> String {
    timestamp(Utc::now())
}

pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

const ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// `<prefix><16 chars of [a-z0-9]>`, e.g. `ws-0a1b2c3d4e5f6g7h`.
pub fn random_id(prefix: &str) -> String {
    let mut rng = rand::rng();
    let suffix: String = (0..16)
        .map(|_| ID_CHARSET[rng.random_range(0..ID_CHARSET.len())] as char)
        .collect();
    format!("{}{}", prefix, suffix)
}

pub(crate) fn json_column(value: Option<String>) -> Option<serde_json::Value> {
    value.and_then(|s| serde_json::from_str(&s).ok())
}

pub(crate) fn json_or_empty(value: Option<String>) -> serde_json::Value {
    json_column(value).unwrap_or_else(|| serde_json::json!({}))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_id_shape() {
        let id = random_id("ws-");
        assert_eq!(id.len(), 19);
        assert!(id[3..]
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let a = timestamp(Utc::now());
        let b = timestamp(Utc::now() + chrono::Duration::milliseconds(3));
        assert!(a < b);
        assert_eq!(a.len(), b.len());
        assert!(parse_timestamp(&a).is_some());
    }
}
