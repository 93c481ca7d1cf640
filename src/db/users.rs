use rusqlite::{params, Connection, OptionalExtension};

use super::Database;
use crate::error::Result;

impl Database {
    pub fn upsert_user(&self, user_id: &str, username: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO users (user_id, username) VALUES (?1, ?2)
             ON CONFLICT(user_id) DO UPDATE SET username = excluded.username",
            params![user_id, username],
        )?;
        Ok(())
    }

    pub fn username(&self, user_id: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        lookup_username(&conn, user_id)
    }
}

pub(crate) fn lookup_username(conn: &Connection, user_id: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT username FROM users WHERE user_id = ?1",
            params![user_id],
            |row| row.get(0),
        )
        .optional()?)
}

/// Username, else the first 8 characters of the id followed by `...`,
/// else `System` when there is no creator.
pub(crate) fn display_name(conn: &Connection, user_id: Option<&str>) -> Result<String> {
    let Some(user_id) = user_id.filter(|id| !id.is_empty()) else {
        return Ok("System".to_string());
    };
    if let Some(name) = lookup_username(conn, user_id)? {
        return Ok(name);
    }
    let prefix: String = user_id.chars().take(8).collect();
    Ok(format!("{}...", prefix))
}
