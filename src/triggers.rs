use std::collections::HashMap;
use std::sync::Arc;

use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use rusqlite::{params, OptionalExtension};

use crate::db::models::{
    execution_status, task_status, task_type, RunTrigger, Task, TriggerExecution, Workspace,
};
use crate::db::tasks::NewTask;
use crate::db::{now, Database};
use crate::error::{Error, Result};
use crate::queue::CompletionHook;

/// Only trigger condition in use.
pub const APPLY_SUCCESS: &str = "apply_success";

/// Workspaces as nodes, enabled triggers as edges (source -> target).
pub type TriggerGraph = DiGraph<String, i64>;

/// Build the graph of enabled triggers.
pub fn build_graph(triggers: &[RunTrigger]) -> (TriggerGraph, HashMap<String, NodeIndex>) {
    let mut graph = DiGraph::new();
    let mut nodes: HashMap<String, NodeIndex> = HashMap::new();
    for trigger in triggers.iter().filter(|t| t.enabled) {
        let from = *nodes
            .entry(trigger.source_workspace_id.clone())
            .or_insert_with(|| graph.add_node(trigger.source_workspace_id.clone()));
        let to = *nodes
            .entry(trigger.target_workspace_id.clone())
            .or_insert_with(|| graph.add_node(trigger.target_workspace_id.clone()));
        graph.add_edge(from, to, trigger.id);
    }
    (graph, nodes)
}

/// Whether adding `source -> target` would close a cycle.
pub fn creates_cycle(triggers: &[RunTrigger], source: &str, target: &str) -> bool {
    if source == target {
        return true;
    }
    let (graph, nodes) = build_graph(triggers);
    match (nodes.get(target), nodes.get(source)) {
        (Some(&from), Some(&to)) => has_path_connecting(&graph, from, to, None),
        _ => false,
    }
}

/// Run triggers between workspaces and their per-task executions.
pub struct RunTriggerService {
    db: Arc<Database>,
}

impl RunTriggerService {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    fn all_triggers(&self) -> Result<Vec<RunTrigger>> {
        let conn = self.db.conn()?;
        let sql = format!("SELECT {} FROM run_triggers ORDER BY id", RunTrigger::COLUMNS);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], RunTrigger::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    // ─── Trigger CRUD ───────────────────────────────────────────────────────

    pub fn create_trigger(&self, source: &str, target: &str, user: Option<&str>) -> Result<RunTrigger> {
        if source == target {
            return Err(Error::Validation(
                "a workspace cannot trigger itself".into(),
            ));
        }
        self.db.get_workspace(source)?;
        self.db.get_workspace(target)?;

        let existing = self.all_triggers()?;
        if existing
            .iter()
            .any(|t| t.source_workspace_id == source && t.target_workspace_id == target)
        {
            return Err(Error::Conflict(
                "trigger already exists between these workspaces".into(),
            ));
        }
        if creates_cycle(&existing, source, target) {
            return Err(Error::Conflict(
                "creating this trigger would create a circular dependency".into(),
            ));
        }

        let conn = self.db.conn()?;
        let ts = now();
        conn.execute(
            "INSERT INTO run_triggers (source_workspace_id, target_workspace_id, enabled,
                trigger_condition, created_by, created_at, updated_at)
             VALUES (?1, ?2, 1, ?3, ?4, ?5, ?5)",
            params![source, target, APPLY_SUCCESS, user, ts],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        tracing::info!(trigger_id = id, source = %source, target = %target, "Run trigger created");
        self.get_trigger(id)
    }

    pub fn get_trigger(&self, trigger_id: i64) -> Result<RunTrigger> {
        let conn = self.db.conn()?;
        let sql = format!("SELECT {} FROM run_triggers WHERE id = ?1", RunTrigger::COLUMNS);
        conn.query_row(&sql, params![trigger_id], RunTrigger::from_row)
            .optional()?
            .ok_or_else(|| Error::not_found("run trigger", trigger_id))
    }

    /// Enable or disable a trigger. Enabling re-checks for cycles.
    pub fn update_trigger(&self, trigger_id: i64, enabled: bool) -> Result<RunTrigger> {
        let trigger = self.get_trigger(trigger_id)?;
        if enabled && !trigger.enabled {
            let others: Vec<RunTrigger> = self
                .all_triggers()?
                .into_iter()
                .filter(|t| t.id != trigger_id)
                .collect();
            if creates_cycle(
                &others,
                &trigger.source_workspace_id,
                &trigger.target_workspace_id,
            ) {
                return Err(Error::Conflict(
                    "enabling this trigger would create a circular dependency".into(),
                ));
            }
        }
        let conn = self.db.conn()?;
        conn.execute(
            "UPDATE run_triggers SET enabled = ?2, updated_at = ?3 WHERE id = ?1",
            params![trigger_id, enabled, now()],
        )?;
        drop(conn);
        self.get_trigger(trigger_id)
    }

    pub fn delete_trigger(&self, trigger_id: i64) -> Result<()> {
        let conn = self.db.conn()?;
        let changed = conn.execute("DELETE FROM run_triggers WHERE id = ?1", params![trigger_id])?;
        if changed == 0 {
            return Err(Error::not_found("run trigger", trigger_id));
        }
        tracing::info!(trigger_id, "Run trigger deleted");
        Ok(())
    }

    pub fn list_by_source(&self, workspace_id: &str) -> Result<Vec<RunTrigger>> {
        self.list_where("source_workspace_id", workspace_id)
    }

    pub fn list_by_target(&self, workspace_id: &str) -> Result<Vec<RunTrigger>> {
        self.list_where("target_workspace_id", workspace_id)
    }

    fn list_where(&self, column: &str, workspace_id: &str) -> Result<Vec<RunTrigger>> {
        let conn = self.db.conn()?;
        let sql = format!(
            "SELECT {} FROM run_triggers WHERE {} = ?1 ORDER BY id",
            RunTrigger::COLUMNS,
            column
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![workspace_id], RunTrigger::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Targets of enabled triggers from `source` that apply without confirmation.
    pub fn auto_apply_targets(&self, source: &str) -> Result<Vec<Workspace>> {
        let mut out = Vec::new();
        for trigger in self.list_by_source(source)?.into_iter().filter(|t| t.enabled) {
            if let Some(ws) = self.db.find_workspace(&trigger.target_workspace_id)? {
                if ws.auto_apply {
                    out.push(ws);
                }
            }
        }
        Ok(out)
    }

    /// Workspaces `source` could add a trigger to without a duplicate or a cycle.
    pub fn available_targets(&self, source: &str) -> Result<Vec<Workspace>> {
        let triggers = self.all_triggers()?;
        let workspaces = self.db.list_workspaces()?;
        Ok(workspaces
            .into_iter()
            .filter(|ws| {
                let target = ws.workspace_id.as_str();
                target != source
                    && !triggers
                        .iter()
                        .any(|t| t.source_workspace_id == source && t.target_workspace_id == target)
                    && !creates_cycle(&triggers, source, target)
            })
            .collect())
    }

    // ─── Executions ─────────────────────────────────────────────────────────

    pub fn list_executions(&self, task_id: i64) -> Result<Vec<TriggerExecution>> {
        let conn = self.db.conn()?;
        let sql = format!(
            "SELECT {} FROM task_trigger_executions WHERE source_task_id = ?1 ORDER BY id",
            TriggerExecution::COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params![task_id], TriggerExecution::from_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn get_execution(&self, execution_id: i64) -> Result<TriggerExecution> {
        let conn = self.db.conn()?;
        let sql = format!(
            "SELECT {} FROM task_trigger_executions WHERE id = ?1",
            TriggerExecution::COLUMNS
        );
        conn.query_row(&sql, params![execution_id], TriggerExecution::from_row)
            .optional()?
            .ok_or_else(|| Error::not_found("trigger execution", execution_id))
    }

    fn insert_execution(&self, task_id: i64, trigger_id: i64) -> Result<TriggerExecution> {
        let conn = self.db.conn()?;
        let ts = now();
        conn.execute(
            "INSERT INTO task_trigger_executions (source_task_id, run_trigger_id, status,
                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![task_id, trigger_id, execution_status::PENDING, ts],
        )?;
        let id = conn.last_insert_rowid();
        drop(conn);
        self.get_execution(id)
    }

    /// Pending execution rows for each enabled trigger of the task's
    /// workspace, so they can be reviewed while the task awaits approval.
    pub fn prepare_executions(&self, task: &Task) -> Result<Vec<TriggerExecution>> {
        let existing = self.list_executions(task.id)?;
        let mut out = existing.clone();
        for trigger in self
            .list_by_source(&task.workspace_id)?
            .into_iter()
            .filter(|t| t.enabled)
        {
            if existing.iter().any(|e| e.run_trigger_id == trigger.id) {
                continue;
            }
            out.push(self.insert_execution(task.id, trigger.id)?);
        }
        if !out.is_empty() {
            tracing::debug!(task_id = task.id, executions = out.len(), "Prepared trigger executions");
        }
        Ok(out)
    }

    /// Temporarily disable (or re-enable) one pending execution.
    pub fn toggle_execution(&self, execution_id: i64, disabled: bool, user: &str) -> Result<TriggerExecution> {
        let execution = self.get_execution(execution_id)?;
        if execution.status != execution_status::PENDING {
            return Err(Error::Conflict(format!(
                "trigger execution {} is already {}",
                execution_id, execution.status
            )));
        }
        let conn = self.db.conn()?;
        let ts = now();
        if disabled {
            conn.execute(
                "UPDATE task_trigger_executions SET temporarily_disabled = 1, disabled_by = ?2,
                    disabled_at = ?3, updated_at = ?3
                 WHERE id = ?1",
                params![execution_id, user, ts],
            )?;
        } else {
            conn.execute(
                "UPDATE task_trigger_executions SET temporarily_disabled = 0, disabled_by = NULL,
                    disabled_at = NULL, updated_at = ?2
                 WHERE id = ?1",
                params![execution_id, ts],
            )?;
        }
        drop(conn);
        self.get_execution(execution_id)
    }

    fn mark_execution(
        &self,
        execution_id: i64,
        status: &str,
        target_task_id: Option<i64>,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            "UPDATE task_trigger_executions SET status = ?2, target_task_id = ?3, error_message = ?4,
                updated_at = ?5
             WHERE id = ?1",
            params![execution_id, status, target_task_id, error, now()],
        )?;
        Ok(())
    }

    /// Create the downstream task for one trigger.
    fn create_triggered_task(&self, target_workspace_id: &str, source: &Task) -> Result<Task> {
        let workspace = self
            .db
            .find_workspace(target_workspace_id)?
            .ok_or_else(|| Error::Validation("target workspace not found".into()))?;
        if workspace.is_locked {
            return Err(Error::LockHeld("target workspace is locked".into()));
        }
        if !workspace.has_provider_config() {
            return Err(Error::Validation(
                "target workspace has no provider configuration".into(),
            ));
        }
        self.db.insert_task(&NewTask {
            workspace_id: workspace.workspace_id.clone(),
            task_type: task_type::PLAN_AND_APPLY.to_string(),
            description: format!(
                "Triggered by workspace {} (task #{})",
                source.workspace_id, source.id
            ),
            created_by: source
                .apply_confirmed_by
                .clone()
                .or_else(|| source.created_by.clone()),
            max_retries: workspace.max_retries,
            plan_task_id: None,
        })
    }

    /// Fire downstream runs after `task` applied. Returns the workspaces
    /// that received a new task.
    pub fn execute(&self, task: &Task) -> Result<Vec<String>> {
        let applied = matches!(
            task.status.as_str(),
            task_status::APPLIED | task_status::SUCCESS
        );
        let applies = matches!(
            task.task_type.as_str(),
            task_type::APPLY | task_type::PLAN_AND_APPLY
        );
        if !applied || !applies {
            return Ok(Vec::new());
        }

        let mut executions: Vec<TriggerExecution> = self
            .list_executions(task.id)?
            .into_iter()
            .filter(|e| e.status == execution_status::PENDING)
            .collect();
        if executions.is_empty() {
            executions = self.prepare_executions(task)?;
        }

        let mut targets = Vec::new();
        for execution in executions {
            if execution.status != execution_status::PENDING {
                continue;
            }
            let trigger = match self.get_trigger(execution.run_trigger_id) {
                Ok(trigger) => trigger,
                Err(e) => {
                    self.mark_execution(execution.id, execution_status::FAILED, None, Some(&e.to_string()))?;
                    continue;
                }
            };
            if execution.temporarily_disabled {
                self.mark_execution(execution.id, execution_status::SKIPPED, None, None)?;
                tracing::info!(execution_id = execution.id, "Trigger execution skipped (temporarily disabled)");
                continue;
            }
            if !trigger.enabled {
                self.mark_execution(execution.id, execution_status::SKIPPED, None, None)?;
                tracing::info!(execution_id = execution.id, "Trigger execution skipped (trigger disabled)");
                continue;
            }

            match self.create_triggered_task(&trigger.target_workspace_id, task) {
                Ok(target_task) => {
                    self.mark_execution(
                        execution.id,
                        execution_status::TRIGGERED,
                        Some(target_task.id),
                        None,
                    )?;
                    tracing::info!(
                        source_task_id = task.id,
                        target_task_id = target_task.id,
                        target_workspace_id = %trigger.target_workspace_id,
                        "Triggered downstream task"
                    );
                    targets.push(trigger.target_workspace_id);
                }
                Err(e) => {
                    let message = match &e {
                        Error::Validation(m) | Error::LockHeld(m) => m.clone(),
                        other => other.to_string(),
                    };
                    self.mark_execution(execution.id, execution_status::FAILED, None, Some(&message))?;
                    tracing::warn!(
                        source_task_id = task.id,
                        target_workspace_id = %trigger.target_workspace_id,
                        error = %message,
                        "Failed to trigger downstream task"
                    );
                }
            }
        }
        Ok(targets)
    }
}

impl CompletionHook for RunTriggerService {
    fn on_complete(&self, task: &Task) -> Vec<String> {
        let result = if task.status == task_status::APPLY_PENDING
            && task.task_type == task_type::PLAN_AND_APPLY
        {
            self.prepare_executions(task).map(|_| Vec::new())
        } else {
            self.execute(task)
        };
        result.unwrap_or_else(|e| {
            tracing::warn!(task_id = task.id, error = %e, "Run trigger processing failed");
            Vec::new()
        })
    }
}
