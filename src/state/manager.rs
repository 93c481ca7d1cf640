use std::sync::Arc;

use super::document::{checksum, StateDocument};
use crate::db::models::{import_source, StateVersion};
use crate::db::versions::{insert_version, latest_version, NewStateVersion};
use crate::db::{Database, WorkspaceLock};
use crate::error::{Error, Result};
use crate::index::ResourceIndexer;

const UPLOAD_LOCK_REASON: &str = "State upload in progress";
const ROLLBACK_LOCK_REASON: &str = "State rollback in progress";
const FORCE_UPLOAD_LOCK_REASON: &str = "Locked after force upload. Please verify state before unlocking.";

/// Append-only state history with lineage/serial validation.
pub struct StateManager {
    db: Arc<Database>,
    indexer: Option<Arc<ResourceIndexer>>,
}

impl StateManager {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db, indexer: None }
    }

    /// Re-index the workspace after every successful upload or rollback.
    pub fn with_indexer(mut self, indexer: Arc<ResourceIndexer>) -> Self {
        self.indexer = Some(indexer);
        self
    }

    // ─── Upload ─────────────────────────────────────────────────────────────

    /// Validate and append a user-supplied state.
    ///
    /// The workspace lock is held for the whole check-and-insert. A forced
    /// upload keeps the lock so an operator has to acknowledge it.
    pub fn upload_state(
        &self,
        workspace_id: &str,
        state_json: &str,
        user: Option<&str>,
        force: bool,
        description: &str,
    ) -> Result<StateVersion> {
        let doc = StateDocument::parse(state_json)?;
        let (lineage, serial) = if force {
            (doc.lineage().unwrap_or_default().to_string(), doc.serial().unwrap_or(0))
        } else {
            (doc.require_lineage()?.to_string(), doc.require_serial()?)
        };

        let lock = WorkspaceLock::acquire(&self.db, workspace_id, holder(user), UPLOAD_LOCK_REASON)?;

        let inserted = {
            let mut conn = self.db.conn()?;
            let tx = conn.transaction()?;
            let current = latest_version(&tx, workspace_id)?;
            match (&current, force) {
                (Some(current), false) => validate_successor(current, &lineage, serial)?,
                (Some(_), true) => {
                    tracing::warn!(workspace_id = %workspace_id, "Force uploading state, bypassing validation")
                }
                (None, _) => {
                    tracing::info!(workspace_id = %workspace_id, "First state upload, skipping validation")
                }
            }
            let sum = checksum(state_json.as_bytes());
            let version = insert_version(
                &tx,
                &NewStateVersion {
                    workspace_id,
                    content: state_json,
                    checksum: &sum,
                    lineage: &lineage,
                    serial,
                    is_imported: true,
                    import_source: Some(import_source::USER_UPLOAD),
                    description,
                    created_by: user,
                    ..Default::default()
                },
            )?;
            tx.commit()?;
            version
        };

        if force {
            lock.retain(FORCE_UPLOAD_LOCK_REASON)?;
        } else {
            lock.release()?;
        }

        tracing::info!(
            workspace_id = %workspace_id,
            version = inserted.version,
            serial = inserted.serial,
            size = inserted.size_bytes,
            force,
            "State uploaded"
        );
        self.reindex(workspace_id);
        Ok(inserted)
    }

    // ─── Rollback ───────────────────────────────────────────────────────────

    /// Append a copy of `target_version` as the new latest version.
    pub fn rollback_to(
        &self,
        workspace_id: &str,
        target_version: i64,
        user: Option<&str>,
        reason: &str,
        force: bool,
    ) -> Result<StateVersion> {
        let lock = WorkspaceLock::acquire(&self.db, workspace_id, holder(user), ROLLBACK_LOCK_REASON)?;

        let inserted = {
            let mut conn = self.db.conn()?;
            let tx = conn.transaction()?;
            let target = target_row(&tx, workspace_id, target_version)?;
            let current = latest_version(&tx, workspace_id)?;

            if let (Some(current), false) = (&current, force) {
                if !current.lineage.is_empty() && target.lineage != current.lineage {
                    return Err(Error::ForceRequired(format!(
                        "lineage mismatch: current is {}, target is {}. Use force=true to bypass validation",
                        current.lineage, target.lineage
                    )));
                }
                if target.serial <= current.serial {
                    return Err(Error::ForceRequired(format!(
                        "serial must be greater than current ({}), target is {}. Use force=true to bypass validation",
                        current.serial, target.serial
                    )));
                }
            }

            let serial = match &current {
                Some(current) => target.serial.max(current.serial + 1),
                None => target.serial,
            };
            let mut description = format!("Rolled back from version #{}", target_version);
            if !reason.is_empty() {
                description.push_str(": ");
                description.push_str(reason);
            }
            let content = target.content.clone().unwrap_or_default();
            let version = insert_version(
                &tx,
                &NewStateVersion {
                    workspace_id,
                    content: &content,
                    checksum: &target.checksum,
                    lineage: &target.lineage,
                    serial,
                    is_imported: true,
                    import_source: Some(import_source::ROLLBACK),
                    is_rollback: true,
                    rollback_from_version: Some(target.version),
                    description: &description,
                    created_by: user,
                    ..Default::default()
                },
            )?;
            tx.commit()?;
            version
        };
        lock.release()?;

        tracing::info!(
            workspace_id = %workspace_id,
            from_version = target_version,
            new_version = inserted.version,
            force,
            "State rolled back"
        );
        self.reindex(workspace_id);
        Ok(inserted)
    }

    // ─── Run Output ─────────────────────────────────────────────────────────

    /// Persist the state produced by a task's apply. The toolchain is
    /// authoritative, so no lineage/serial comparison happens here.
    pub fn record_run_state(
        &self,
        workspace_id: &str,
        state_json: &str,
        task_id: i64,
        user: Option<&str>,
    ) -> Result<StateVersion> {
        let doc = StateDocument::parse(state_json)?;
        let lineage = doc.require_lineage()?.to_string();
        let serial = doc.serial().unwrap_or(0);
        let description = format!("Applied by task #{}", task_id);

        let version = {
            let mut conn = self.db.conn()?;
            let tx = conn.transaction()?;
            let sum = checksum(state_json.as_bytes());
            let version = insert_version(
                &tx,
                &NewStateVersion {
                    workspace_id,
                    content: state_json,
                    checksum: &sum,
                    lineage: &lineage,
                    serial,
                    description: &description,
                    created_by: user,
                    task_id: Some(task_id),
                    ..Default::default()
                },
            )?;
            tx.commit()?;
            version
        };
        tracing::info!(
            workspace_id = %workspace_id,
            task_id,
            version = version.version,
            serial,
            "Recorded state from run"
        );
        Ok(version)
    }

    // ─── Reads ──────────────────────────────────────────────────────────────

    pub fn get_latest(&self, workspace_id: &str) -> Result<Option<StateVersion>> {
        self.db.latest_state_version(workspace_id)
    }

    pub fn get_version(&self, workspace_id: &str, version: i64) -> Result<StateVersion> {
        self.db.get_state_version(workspace_id, version)
    }

    pub fn list(&self, workspace_id: &str, limit: i64, offset: i64) -> Result<Vec<StateVersion>> {
        self.db.list_state_versions(workspace_id, limit, offset)
    }

    fn reindex(&self, workspace_id: &str) {
        let Some(indexer) = &self.indexer else {
            return;
        };
        if let Err(e) = indexer.sync(workspace_id) {
            tracing::warn!(workspace_id = %workspace_id, error = %e, "Resource indexing after state change failed");
        }
    }
}

fn holder(user: Option<&str>) -> &str {
    user.filter(|u| !u.is_empty()).unwrap_or("system")
}

fn validate_successor(current: &StateVersion, lineage: &str, serial: i64) -> Result<()> {
    if !current.lineage.is_empty() && lineage != current.lineage {
        return Err(Error::LineageMismatch {
            expected: current.lineage.clone(),
            actual: lineage.to_string(),
        });
    }
    if serial <= current.serial {
        return Err(Error::SerialNotAscending {
            current: current.serial,
            proposed: serial,
        });
    }
    Ok(())
}

fn target_row(conn: &rusqlite::Connection, workspace_id: &str, version: i64) -> Result<StateVersion> {
    use rusqlite::OptionalExtension;
    let sql = format!(
        "SELECT {}, content FROM workspace_state_versions WHERE workspace_id = ?1 AND version = ?2",
        StateVersion::COLUMNS
    );
    conn.query_row(&sql, rusqlite::params![workspace_id, version], |row| {
        let mut v = StateVersion::from_row(row)?;
        v.content = Some(row.get(15)?);
        Ok(v)
    })
    .optional()?
    .ok_or(Error::VersionNotFound(version))
}
