use std::fmt;
use std::str::FromStr;

use rusqlite::{params, params_from_iter, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::models::{task_status, ResourceChange, Task};
use super::{now, parse_timestamp, Database};
use crate::error::{Error, Result};

/// Input for a new pending task.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub workspace_id: String,
    pub task_type: String,
    pub description: String,
    pub created_by: Option<String>,
    pub max_retries: i64,
    /// Plan task whose stored plan an `apply` task executes.
    pub plan_task_id: Option<i64>,
}

/// Predefined task list filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskFilter {
    NeedsAttention,
    Errored,
    Running,
    OnHold,
    Success,
    Cancelled,
    All,
}

impl TaskFilter {
    pub const ALL_FILTERS: [TaskFilter; 7] = [
        TaskFilter::NeedsAttention,
        TaskFilter::Errored,
        TaskFilter::Running,
        TaskFilter::OnHold,
        TaskFilter::Success,
        TaskFilter::Cancelled,
        TaskFilter::All,
    ];

    /// Statuses matched by this filter; empty means no restriction.
    pub fn statuses(&self) -> &'static [&'static str] {
        match self {
            TaskFilter::NeedsAttention => &[task_status::APPLY_PENDING],
            TaskFilter::Errored => &[task_status::FAILED],
            TaskFilter::Running => &[task_status::RUNNING],
            TaskFilter::OnHold => &[task_status::PENDING, task_status::APPLY_PENDING],
            TaskFilter::Success => &[task_status::SUCCESS, task_status::APPLIED],
            TaskFilter::Cancelled => &[task_status::CANCELLED],
            TaskFilter::All => &[],
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskFilter::NeedsAttention => "needs_attention",
            TaskFilter::Errored => "errored",
            TaskFilter::Running => "running",
            TaskFilter::OnHold => "on_hold",
            TaskFilter::Success => "success",
            TaskFilter::Cancelled => "cancelled",
            TaskFilter::All => "all",
        }
    }
}

impl fmt::Display for TaskFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskFilter {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        TaskFilter::ALL_FILTERS
            .iter()
            .copied()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| Error::Validation(format!("unknown task filter: {}", s)))
    }
}

/// A task left `running` by a previous process.
#[derive(Debug, Clone)]
pub struct OrphanedTask {
    pub task_id: i64,
    pub workspace_id: String,
    /// True when the task was only re-parked at `apply_pending`.
    pub reverted: bool,
}

impl Database {
    // ─── Task CRUD ──────────────────────────────────────────────────────────

    pub fn insert_task(&self, new: &NewTask) -> Result<Task> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO workspace_tasks (workspace_id, task_type, status, stage, description,
                created_by, created_at, max_retries, plan_task_id)
             VALUES (?1, ?2, 'pending', 'pending', ?3, ?4, ?5, ?6, ?7)",
            params![
                new.workspace_id,
                new.task_type,
                new.description,
                new.created_by,
                now(),
                new.max_retries.max(0),
                new.plan_task_id,
            ],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_task(id)
    }

    pub fn find_task(&self, task_id: i64) -> Result<Option<Task>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM workspace_tasks WHERE id = ?1", Task::COLUMNS);
        Ok(conn
            .query_row(&sql, params![task_id], Task::from_row)
            .optional()?)
    }

    pub fn get_task(&self, task_id: i64) -> Result<Task> {
        self.find_task(task_id)?
            .ok_or_else(|| Error::not_found("task", task_id))
    }

    pub fn list_tasks(
        &self,
        workspace_id: Option<&str>,
        filter: TaskFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Task>> {
        let (clause, mut args) = filter_clause(workspace_id, filter);
        args.push((limit.max(0)).to_string());
        args.push((offset.max(0)).to_string());
        let sql = format!(
            "SELECT {} FROM workspace_tasks {} ORDER BY created_at DESC, id DESC
             LIMIT CAST(?{} AS INTEGER) OFFSET CAST(?{} AS INTEGER)",
            Task::COLUMNS,
            clause,
            args.len() - 1,
            args.len()
        );
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(args.iter()), Task::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Number of tasks matched by every filter.
    pub fn filter_counts(&self, workspace_id: Option<&str>) -> Result<Vec<(TaskFilter, i64)>> {
        let conn = self.conn()?;
        let mut counts = Vec::with_capacity(TaskFilter::ALL_FILTERS.len());
        for filter in TaskFilter::ALL_FILTERS {
            let (clause, args) = filter_clause(workspace_id, filter);
            let sql = format!("SELECT COUNT(*) FROM workspace_tasks {}", clause);
            let count: i64 =
                conn.query_row(&sql, params_from_iter(args.iter()), |row| row.get(0))?;
            counts.push((filter, count));
        }
        Ok(counts)
    }

    /// Pending and `apply_pending` tasks in dispatch order.
    pub fn queued_tasks(&self, workspace_id: Option<&str>) -> Result<Vec<Task>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM workspace_tasks
             WHERE status IN ('pending', 'apply_pending') AND (?1 IS NULL OR workspace_id = ?1)
             ORDER BY created_at ASC, id ASC",
            Task::COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![workspace_id], Task::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ─── Status Transitions ─────────────────────────────────────────────────

    /// CAS `from_status` → `running`; false when somebody else moved it first.
    pub fn claim_task(&self, task_id: i64, from_status: &str) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE workspace_tasks SET status = 'running', started_at = ?3, completed_at = NULL,
                error_message = NULL
             WHERE id = ?1 AND status = ?2",
            params![task_id, from_status, now()],
        )?;
        Ok(changed == 1)
    }

    pub fn set_task_stage(&self, task_id: i64, stage: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE workspace_tasks SET stage = ?2 WHERE id = ?1",
            params![task_id, stage],
        )?;
        Ok(())
    }

    pub fn set_plan_output(&self, task_id: i64, output: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE workspace_tasks SET plan_output = ?2 WHERE id = ?1",
            params![task_id, output],
        )?;
        Ok(())
    }

    pub fn set_apply_output(&self, task_id: i64, output: &str) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE workspace_tasks SET apply_output = ?2 WHERE id = ?1",
            params![task_id, output],
        )?;
        Ok(())
    }

    /// Move a running task to a terminal status, stamping completion time
    /// and duration.
    pub fn finish_task(&self, task_id: i64, status: &str, error: Option<&str>) -> Result<()> {
        let conn = self.conn()?;
        let completed_at = chrono::Utc::now();
        let started_at: Option<String> = conn
            .query_row(
                "SELECT started_at FROM workspace_tasks WHERE id = ?1",
                params![task_id],
                |row| row.get(0),
            )
            .optional()?
            .flatten();
        let duration = started_at
            .as_deref()
            .and_then(parse_timestamp)
            .map(|start| (completed_at - start).num_seconds().max(0));
        conn.execute(
            "UPDATE workspace_tasks SET status = ?2, stage = ?3, error_message = ?4,
                completed_at = ?5, duration = ?6
             WHERE id = ?1",
            params![
                task_id,
                status,
                status,
                error,
                super::timestamp(completed_at),
                duration
            ],
        )?;
        Ok(())
    }

    /// Park a planned plan_and_apply task until somebody confirms it.
    pub fn park_apply_pending(&self, task_id: i64) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE workspace_tasks SET status = 'apply_pending', stage = 'apply_pending',
                apply_confirmed_by = NULL, apply_confirmed_at = NULL
             WHERE id = ?1",
            params![task_id],
        )?;
        Ok(())
    }

    /// Put a failed attempt back in the queue on the same row.
    pub fn requeue_for_retry(&self, task_id: i64, error: &str) -> Result<i64> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE workspace_tasks SET status = 'pending', stage = 'pending', retry_count = retry_count + 1,
                error_message = ?2, started_at = NULL
             WHERE id = ?1",
            params![task_id, error],
        )?;
        Ok(conn.query_row(
            "SELECT retry_count FROM workspace_tasks WHERE id = ?1",
            params![task_id],
            |row| row.get(0),
        )?)
    }

    pub fn confirm_apply(&self, task_id: i64, user: &str) -> Result<Task> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE workspace_tasks SET apply_confirmed_by = ?2, apply_confirmed_at = ?3
             WHERE id = ?1 AND status = 'apply_pending' AND apply_confirmed_at IS NULL",
            params![task_id, user, now()],
        )?;
        drop(conn);
        if changed == 0 {
            let task = self.get_task(task_id)?;
            return Err(Error::Conflict(format!(
                "task {} is not in apply_pending status (status: {})",
                task_id, task.status
            )));
        }
        self.get_task(task_id)
    }

    /// Cancel a task that is not running. Returns false if its status moved on.
    pub fn cancel_queued_task(&self, task_id: i64, message: &str) -> Result<bool> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE workspace_tasks SET status = 'cancelled', stage = 'cancelled', error_message = ?2,
                completed_at = ?3
             WHERE id = ?1 AND status IN ('pending', 'apply_pending')",
            params![task_id, message, now()],
        )?;
        Ok(changed == 1)
    }

    /// Running tasks at startup become `failed`, or return to
    /// `apply_pending` if they only stopped while parked there.
    pub fn recover_orphaned_tasks(&self, message: &str) -> Result<Vec<OrphanedTask>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let orphans: Vec<(i64, String, String)> = {
            let mut stmt = tx.prepare(
                "SELECT id, workspace_id, stage FROM workspace_tasks WHERE status = 'running'
                 ORDER BY id",
            )?;
            let rows = stmt
                .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };
        let now = now();
        let mut recovered = Vec::with_capacity(orphans.len());
        for (task_id, workspace_id, stage) in orphans {
            let reverted = stage == task_status::APPLY_PENDING;
            if reverted {
                tx.execute(
                    "UPDATE workspace_tasks SET status = 'apply_pending' WHERE id = ?1",
                    params![task_id],
                )?;
            } else {
                tx.execute(
                    "UPDATE workspace_tasks SET status = 'failed', stage = 'failed', error_message = ?2,
                        completed_at = ?3
                     WHERE id = ?1",
                    params![task_id, message, now],
                )?;
            }
            recovered.push(OrphanedTask {
                task_id,
                workspace_id,
                reverted,
            });
        }
        tx.commit()?;
        Ok(recovered)
    }

    /// Cancel pending tasks whose description marks them as run-trigger tasks.
    pub fn cancel_pending_trigger_tasks(&self, message: &str) -> Result<usize> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE workspace_tasks SET status = 'cancelled', stage = 'cancelled', error_message = ?1,
                completed_at = ?2
             WHERE status = 'pending' AND description LIKE 'Triggered by workspace %'",
            params![message, now()],
        )?;
        Ok(changed)
    }

    // ─── Plan Artifacts ─────────────────────────────────────────────────────

    /// Store the binary plan, its JSON, hash and derived change rows.
    pub fn save_plan_artifacts(
        &self,
        task_id: i64,
        plan_data: &[u8],
        plan_json: &str,
        plan_hash: &str,
        changes: &[ResourceChange],
    ) -> Result<()> {
        let (add, change, destroy) = crate::executor::plan_parser::count_changes(changes);
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE workspace_tasks SET plan_data = ?2, plan_json = ?3, plan_hash = ?4,
                changes_add = ?5, changes_change = ?6, changes_destroy = ?7
             WHERE id = ?1",
            params![task_id, plan_data, plan_json, plan_hash, add, change, destroy],
        )?;
        tx.execute(
            "DELETE FROM task_resource_changes WHERE task_id = ?1",
            params![task_id],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO task_resource_changes (task_id, address, resource_type, resource_name,
                    module_address, action, before_json, after_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for c in changes {
                stmt.execute(params![
                    task_id,
                    c.address,
                    c.resource_type,
                    c.resource_name,
                    c.module_address,
                    c.action,
                    c.before.as_ref().map(|v| v.to_string()),
                    c.after.as_ref().map(|v| v.to_string()),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn plan_data(&self, task_id: i64) -> Result<Option<Vec<u8>>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT plan_data FROM workspace_tasks WHERE id = ?1",
                params![task_id],
                |row| row.get::<_, Option<Vec<u8>>>(0),
            )
            .optional()?
            .flatten())
    }

    pub fn resource_changes(&self, task_id: i64) -> Result<Vec<ResourceChange>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT address, resource_type, resource_name, module_address, action, before_json, after_json
             FROM task_resource_changes WHERE task_id = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![task_id], |row| {
                Ok(ResourceChange {
                    address: row.get(0)?,
                    resource_type: row.get(1)?,
                    resource_name: row.get(2)?,
                    module_address: row.get(3)?,
                    action: row.get(4)?,
                    before: super::json_column(row.get(5)?),
                    after: super::json_column(row.get(6)?),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn filter_clause(workspace_id: Option<&str>, filter: TaskFilter) -> (String, Vec<String>) {
    let mut conditions = Vec::new();
    let mut args = Vec::new();
    if let Some(ws) = workspace_id {
        args.push(ws.to_string());
        conditions.push(format!("workspace_id = ?{}", args.len()));
    }
    let statuses = filter.statuses();
    if !statuses.is_empty() {
        let mut placeholders = Vec::with_capacity(statuses.len());
        for status in statuses {
            args.push(status.to_string());
            placeholders.push(format!("?{}", args.len()));
        }
        conditions.push(format!("status IN ({})", placeholders.join(", ")));
    }
    let clause = if conditions.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", conditions.join(" AND "))
    };
    (clause, args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_parse() {
        assert_eq!("on_hold".parse::<TaskFilter>().unwrap(), TaskFilter::OnHold);
        assert!("bogus".parse::<TaskFilter>().is_err());
        assert_eq!(
            TaskFilter::Success.statuses(),
            &[task_status::SUCCESS, task_status::APPLIED]
        );
    }

    #[test]
    fn test_filter_clause_numbering() {
        let (clause, args) = filter_clause(Some("ws-1"), TaskFilter::OnHold);
        assert_eq!(clause, "WHERE workspace_id = ?1 AND status IN (?2, ?3)");
        assert_eq!(args, vec!["ws-1", "pending", "apply_pending"]);
    }
}
