use rusqlite::{params, OptionalExtension};
use serde_json::Value;

use super::models::{NewWorkspace, RemoteDataSource, Workspace, WorkspaceResource, WorkspaceState};
use super::{now, random_id, Database};
use crate::error::{Error, Result};

impl Database {
    // ─── Workspace CRUD ─────────────────────────────────────────────────────

    pub fn create_workspace(&self, new: &NewWorkspace) -> Result<Workspace> {
        if new.name.trim().is_empty() {
            return Err(Error::Validation("workspace name must not be empty".into()));
        }
        let execution_mode = match new.execution_mode.as_str() {
            "" | "local" => "local",
            "agent" => "agent",
            other => {
                return Err(Error::Validation(format!(
                    "unsupported execution mode: {}",
                    other
                )))
            }
        };
        let workspace_id = random_id("ws-");
        let now = now();
        let conn = self.conn()?;

        let exists: bool = conn
            .query_row(
                "SELECT COUNT(*) FROM workspaces WHERE name = ?1",
                params![new.name],
                |row| row.get::<_, i64>(0),
            )
            .map(|c| c > 0)?;
        if exists {
            return Err(Error::Conflict(format!(
                "workspace name already exists: {}",
                new.name
            )));
        }

        conn.execute(
            "INSERT INTO workspaces (workspace_id, name, description, execution_mode, terraform_version,
                workdir, max_retries, auto_apply, provider_config, tf_code, source_path, tags,
                system_variables, state, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 'created', ?14, ?14)",
            params![
                workspace_id,
                new.name,
                new.description,
                execution_mode,
                new.terraform_version,
                workspace_id,
                new.max_retries,
                new.auto_apply,
                new.provider_config.as_ref().map(|v| v.to_string()),
                new.tf_code.as_ref().map(|v| v.to_string()),
                new.source_path,
                new.tags.clone().unwrap_or_else(|| serde_json::json!({})).to_string(),
                new.system_variables
                    .clone()
                    .unwrap_or_else(|| serde_json::json!({}))
                    .to_string(),
                now,
            ],
        )?;
        drop(conn);

        tracing::info!(workspace_id = %workspace_id, name = %new.name, "Created workspace");
        self.get_workspace(&workspace_id)
    }

    pub fn find_workspace(&self, workspace_id: &str) -> Result<Option<Workspace>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM workspaces WHERE workspace_id = ?1",
            Workspace::COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![workspace_id], Workspace::from_row)
            .optional()?)
    }

    pub fn get_workspace(&self, workspace_id: &str) -> Result<Workspace> {
        self.find_workspace(workspace_id)?
            .ok_or_else(|| Error::not_found("workspace", workspace_id))
    }

    pub fn get_workspace_by_name(&self, name: &str) -> Result<Option<Workspace>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM workspaces WHERE name = ?1", Workspace::COLUMNS);
        Ok(conn
            .query_row(&sql, params![name], Workspace::from_row)
            .optional()?)
    }

    /// Resolve either a `ws-...` id or a workspace name.
    pub fn resolve_workspace(&self, id_or_name: &str) -> Result<Workspace> {
        if let Some(ws) = self.find_workspace(id_or_name)? {
            return Ok(ws);
        }
        self.get_workspace_by_name(id_or_name)?
            .ok_or_else(|| Error::not_found("workspace", id_or_name))
    }

    pub fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM workspaces ORDER BY name", Workspace::COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], Workspace::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Delete a workspace. Refused while any task or state version references it.
    pub fn delete_workspace(&self, workspace_id: &str) -> Result<()> {
        let conn = self.conn()?;
        let (tasks, versions): (i64, i64) = conn.query_row(
            "SELECT (SELECT COUNT(*) FROM workspace_tasks WHERE workspace_id = ?1),
                    (SELECT COUNT(*) FROM workspace_state_versions WHERE workspace_id = ?1)",
            params![workspace_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        if tasks > 0 || versions > 0 {
            return Err(Error::Conflict(format!(
                "workspace {} is still referenced by {} tasks and {} state versions",
                workspace_id, tasks, versions
            )));
        }
        let deleted = conn.execute(
            "DELETE FROM workspaces WHERE workspace_id = ?1",
            params![workspace_id],
        )?;
        if deleted == 0 {
            return Err(Error::not_found("workspace", workspace_id));
        }
        Ok(())
    }

    pub fn set_workspace_state(&self, workspace_id: &str, state: WorkspaceState) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE workspaces SET state = ?2, updated_at = ?3 WHERE workspace_id = ?1",
            params![workspace_id, state.as_str(), now()],
        )?;
        Ok(())
    }

    pub fn set_provider_config(&self, workspace_id: &str, config: Option<&Value>) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE workspaces SET provider_config = ?2, updated_at = ?3 WHERE workspace_id = ?1",
            params![workspace_id, config.map(|v| v.to_string()), now()],
        )?;
        if changed == 0 {
            return Err(Error::not_found("workspace", workspace_id));
        }
        Ok(())
    }

    pub fn set_tf_code(&self, workspace_id: &str, code: &Value) -> Result<()> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE workspaces SET tf_code = ?2, updated_at = ?3 WHERE workspace_id = ?1",
            params![workspace_id, code.to_string(), now()],
        )?;
        if changed == 0 {
            return Err(Error::not_found("workspace", workspace_id));
        }
        Ok(())
    }

    pub fn set_system_variables(&self, workspace_id: &str, vars: &Value) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE workspaces SET system_variables = ?2, updated_at = ?3 WHERE workspace_id = ?1",
            params![workspace_id, vars.to_string(), now()],
        )?;
        Ok(())
    }

    /// Denormalized copy of the latest state body.
    pub fn workspace_tf_state(&self, workspace_id: &str) -> Result<Option<String>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT tf_state FROM workspaces WHERE workspace_id = ?1",
                params![workspace_id],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten())
    }

    // ─── Advisory Lock ──────────────────────────────────────────────────────

    /// Take the workspace lock if it is free.
    pub fn lock_workspace(&self, workspace_id: &str, holder: &str, reason: &str) -> Result<()> {
        let conn = self.conn()?;
        let now = now();
        let changed = conn.execute(
            "UPDATE workspaces SET is_locked = 1, locked_by = ?2, locked_at = ?3, lock_reason = ?4,
                updated_at = ?3
             WHERE workspace_id = ?1 AND is_locked = 0",
            params![workspace_id, holder, now, reason],
        )?;
        if changed == 1 {
            tracing::debug!(workspace_id = %workspace_id, holder = %holder, reason = %reason, "Workspace locked");
            return Ok(());
        }

        let current: Option<(Option<String>, String)> = conn
            .query_row(
                "SELECT locked_by, lock_reason FROM workspaces WHERE workspace_id = ?1",
                params![workspace_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        match current {
            None => Err(Error::not_found("workspace", workspace_id)),
            Some((locked_by, reason)) => Err(Error::LockHeldByOther {
                locked_by: locked_by.unwrap_or_else(|| "unknown".to_string()),
                reason,
            }),
        }
    }

    /// Clear the lock. With `holder` set, only that holder's lock is cleared.
    pub fn unlock_workspace(&self, workspace_id: &str, holder: Option<&str>) -> Result<bool> {
        let conn = self.conn()?;
        let changed = match holder {
            Some(holder) => conn.execute(
                "UPDATE workspaces SET is_locked = 0, locked_by = NULL, locked_at = NULL,
                    lock_reason = '', updated_at = ?3
                 WHERE workspace_id = ?1 AND is_locked = 1 AND locked_by = ?2",
                params![workspace_id, holder, now()],
            )?,
            None => conn.execute(
                "UPDATE workspaces SET is_locked = 0, locked_by = NULL, locked_at = NULL,
                    lock_reason = '', updated_at = ?2
                 WHERE workspace_id = ?1 AND is_locked = 1",
                params![workspace_id, now()],
            )?,
        };
        if changed > 0 {
            tracing::debug!(workspace_id = %workspace_id, "Workspace unlocked");
        }
        Ok(changed > 0)
    }

    pub fn set_lock_reason(&self, workspace_id: &str, reason: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE workspaces SET lock_reason = ?2, updated_at = ?3
             WHERE workspace_id = ?1 AND is_locked = 1",
            params![workspace_id, reason, now()],
        )?;
        Ok(())
    }

    pub fn is_workspace_locked(&self, workspace_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let locked: Option<bool> = conn
            .query_row(
                "SELECT is_locked FROM workspaces WHERE workspace_id = ?1",
                params![workspace_id],
                |row| row.get(0),
            )
            .optional()?;
        locked.ok_or_else(|| Error::not_found("workspace", workspace_id))
    }

    // ─── Editable Resources ─────────────────────────────────────────────────

    pub fn create_workspace_resource(
        &self,
        workspace_id: &str,
        resource_name: &str,
    ) -> Result<WorkspaceResource> {
        let conn = self.conn()?;
        let now = now();
        conn.execute(
            "INSERT INTO workspace_resources (workspace_id, resource_name, current_version, is_active,
                created_at, updated_at)
             VALUES (?1, ?2, 1, 1, ?3, ?3)
             ON CONFLICT(workspace_id, resource_name) DO UPDATE SET is_active = 1, updated_at = ?3",
            params![workspace_id, resource_name, now],
        )?;
        let resource = conn.query_row(
            "SELECT id, workspace_id, resource_name, current_version, is_active
             FROM workspace_resources WHERE workspace_id = ?1 AND resource_name = ?2",
            params![workspace_id, resource_name],
            workspace_resource_from_row,
        )?;
        Ok(resource)
    }

    pub fn get_workspace_resource(&self, resource_id: i64) -> Result<WorkspaceResource> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT id, workspace_id, resource_name, current_version, is_active
             FROM workspace_resources WHERE id = ?1",
            params![resource_id],
            workspace_resource_from_row,
        )
        .optional()?
        .ok_or_else(|| Error::not_found("resource", resource_id))
    }

    /// Record a new saved revision of a resource definition.
    pub fn bump_resource_version(&self, resource_id: i64) -> Result<i64> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE workspace_resources SET current_version = current_version + 1, updated_at = ?2
             WHERE id = ?1",
            params![resource_id, now()],
        )?;
        if changed == 0 {
            return Err(Error::not_found("resource", resource_id));
        }
        Ok(conn.query_row(
            "SELECT current_version FROM workspace_resources WHERE id = ?1",
            params![resource_id],
            |row| row.get(0),
        )?)
    }

    // ─── Remote Data Declarations ───────────────────────────────────────────

    pub fn add_remote_data(
        &self,
        workspace_id: &str,
        source_workspace_id: &str,
        data_name: &str,
        description: &str,
    ) -> Result<RemoteDataSource> {
        if workspace_id == source_workspace_id {
            return Err(Error::Validation(
                "a workspace cannot read its own outputs as remote data".into(),
            ));
        }
        if data_name.trim().is_empty() {
            return Err(Error::Validation("remote data name must not be empty".into()));
        }
        self.get_workspace(source_workspace_id)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO workspace_remote_data (workspace_id, source_workspace_id, data_name,
                description, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![workspace_id, source_workspace_id, data_name, description, now()],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Error::Conflict(format!("remote data {} already declared", data_name))
            }
            other => Error::Database(other),
        })?;
        Ok(RemoteDataSource {
            id: conn.last_insert_rowid(),
            workspace_id: workspace_id.to_string(),
            source_workspace_id: source_workspace_id.to_string(),
            data_name: data_name.to_string(),
            description: description.to_string(),
        })
    }

    pub fn list_remote_data(&self, workspace_id: &str) -> Result<Vec<RemoteDataSource>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, workspace_id, source_workspace_id, data_name, description
             FROM workspace_remote_data WHERE workspace_id = ?1 ORDER BY data_name",
        )?;
        let rows = stmt
            .query_map(params![workspace_id], |row| {
                Ok(RemoteDataSource {
                    id: row.get(0)?,
                    workspace_id: row.get(1)?,
                    source_workspace_id: row.get(2)?,
                    data_name: row.get(3)?,
                    description: row.get(4)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn workspace_resource_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<WorkspaceResource> {
    Ok(WorkspaceResource {
        id: row.get(0)?,
        workspace_id: row.get(1)?,
        resource_name: row.get(2)?,
        current_version: row.get(3)?,
        is_active: row.get(4)?,
    })
}
