use rusqlite::{params, Connection, OptionalExtension};

use super::models::StateVersion;
use super::users::display_name;
use super::{now, Database};
use crate::error::{Error, Result};

/// Values for a state version row about to be appended.
#[derive(Debug, Clone, Default)]
pub struct NewStateVersion<'a> {
    pub workspace_id: &'a str,
    pub content: &'a str,
    pub checksum: &'a str,
    pub lineage: &'a str,
    pub serial: i64,
    pub is_imported: bool,
    pub import_source: Option<&'a str>,
    pub is_rollback: bool,
    pub rollback_from_version: Option<i64>,
    pub description: &'a str,
    pub created_by: Option<&'a str>,
    pub task_id: Option<i64>,
}

impl Database {
    /// Highest-version row including its content.
    pub fn latest_state_version(&self, workspace_id: &str) -> Result<Option<StateVersion>> {
        let conn = self.conn()?;
        latest_version(&conn, workspace_id)
    }

    pub fn get_state_version(&self, workspace_id: &str, version: i64) -> Result<StateVersion> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {}, content FROM workspace_state_versions WHERE workspace_id = ?1 AND version = ?2",
            StateVersion::COLUMNS
        );
        let mut found = conn
            .query_row(&sql, params![workspace_id, version], with_content)
            .optional()?
            .ok_or(Error::VersionNotFound(version))?;
        found.created_by_name = Some(display_name(&conn, found.created_by.as_deref())?);
        Ok(found)
    }

    /// Versions newest first, without content.
    pub fn list_state_versions(
        &self,
        workspace_id: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<StateVersion>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM workspace_state_versions WHERE workspace_id = ?1
             ORDER BY version DESC LIMIT ?2 OFFSET ?3",
            StateVersion::COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut versions = stmt
            .query_map(
                params![workspace_id, limit.max(0), offset.max(0)],
                StateVersion::from_row,
            )?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        for version in &mut versions {
            version.created_by_name = Some(display_name(&conn, version.created_by.as_deref())?);
        }
        Ok(versions)
    }

    pub fn count_state_versions(&self, workspace_id: &str) -> Result<i64> {
        let conn = self.conn()?;
        Ok(conn.query_row(
            "SELECT COUNT(*) FROM workspace_state_versions WHERE workspace_id = ?1",
            params![workspace_id],
            |row| row.get(0),
        )?)
    }
}

pub(crate) fn latest_version(conn: &Connection, workspace_id: &str) -> Result<Option<StateVersion>> {
    let sql = format!(
        "SELECT {}, content FROM workspace_state_versions WHERE workspace_id = ?1
         ORDER BY version DESC LIMIT 1",
        StateVersion::COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![workspace_id], with_content)
        .optional()?)
}

fn with_content(row: &rusqlite::Row<'_>) -> rusqlite::Result<StateVersion> {
    let mut version = StateVersion::from_row(row)?;
    version.content = Some(row.get(15)?);
    Ok(version)
}

/// Append a version with `version = max + 1` and mirror its body into
/// `workspaces.tf_state`. Expected to run inside the caller's transaction.
pub(crate) fn insert_version(conn: &Connection, new: &NewStateVersion<'_>) -> Result<StateVersion> {
    let next: i64 = conn.query_row(
        "SELECT COALESCE(MAX(version), 0) + 1 FROM workspace_state_versions WHERE workspace_id = ?1",
        params![new.workspace_id],
        |row| row.get(0),
    )?;
    let created_at = now();
    conn.execute(
        "INSERT INTO workspace_state_versions (workspace_id, version, content, checksum, size_bytes,
            lineage, serial, is_imported, import_source, is_rollback, rollback_from_version,
            description, created_by, task_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            new.workspace_id,
            next,
            new.content,
            new.checksum,
            new.content.len() as i64,
            new.lineage,
            new.serial,
            new.is_imported,
            new.import_source,
            new.is_rollback,
            new.rollback_from_version,
            new.description,
            new.created_by,
            new.task_id,
            created_at,
        ],
    )?;
    let id = conn.last_insert_rowid();

    if let Err(e) = conn.execute(
        "UPDATE workspaces SET tf_state = ?2, updated_at = ?3 WHERE workspace_id = ?1",
        params![new.workspace_id, new.content, created_at],
    ) {
        tracing::warn!(workspace_id = %new.workspace_id, error = %e, "Failed to update workspace tf_state");
    }

    Ok(StateVersion {
        id,
        workspace_id: new.workspace_id.to_string(),
        version: next,
        content: None,
        checksum: new.checksum.to_string(),
        size_bytes: new.content.len() as i64,
        lineage: new.lineage.to_string(),
        serial: new.serial,
        is_imported: new.is_imported,
        import_source: new.import_source.map(str::to_string),
        is_rollback: new.is_rollback,
        rollback_from_version: new.rollback_from_version,
        description: new.description.to_string(),
        created_by: new.created_by.map(str::to_string),
        created_by_name: Some(display_name(conn, new.created_by)?),
        task_id: new.task_id,
        created_at,
    })
}
