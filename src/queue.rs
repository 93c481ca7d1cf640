use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::QueueConfig;
use crate::db::models::{task_status, task_type, Task, WorkspaceState};
use crate::db::tasks::{NewTask, TaskFilter};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::executor::retry::redispatch_delay;
use crate::executor::{lock_holder, CANCELLED_MESSAGE};
use crate::lifecycle::LifecycleController;

pub const ORPHANED_MESSAGE: &str = "Task interrupted by server restart (orphaned)";
pub const TRIGGER_RECOVERY_MESSAGE: &str =
    "Cancelled on server restart - Run Trigger tasks are not recovered for safety";

/// Executes one claimed task.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Run a task whose row is already `running` and return the row as
    /// left by the run.
    async fn run(&self, task: Task, cancel: CancellationToken) -> Result<Task>;
}

/// Observer called after every task settles.
pub trait CompletionHook: Send + Sync {
    /// Returns workspaces that may have new work as a result.
    fn on_complete(&self, task: &Task) -> Vec<String>;
}

struct RunningTask {
    task_id: i64,
    cancel: CancellationToken,
    finished: CancellationToken,
}

/// Outcome of startup recovery.
#[derive(Debug, Default, Clone)]
pub struct RecoveryReport {
    pub failed: usize,
    pub reverted: usize,
    pub locks_released: usize,
    pub trigger_tasks_cancelled: usize,
    pub dispatched: usize,
}

// ─── Queue Manager ──────────────────────────────────────────────────────────

/// Per-workspace FIFO scheduling with a global parallelism bound.
///
/// At most one task runs per workspace. The database is authoritative for
/// what is queued; the manager only tracks what this process is running.
pub struct TaskQueueManager {
    db: Arc<Database>,
    config: QueueConfig,
    runner: Arc<dyn TaskRunner>,
    lifecycle: LifecycleController,
    hooks: RwLock<Vec<Arc<dyn CompletionHook>>>,
    running: DashMap<String, RunningTask>,
    retry_after: DashMap<i64, Instant>,
    dispatch: Mutex<()>,
    shutdown: CancellationToken,
    me: Weak<TaskQueueManager>,
}

impl TaskQueueManager {
    pub fn new(db: Arc<Database>, config: QueueConfig, runner: Arc<dyn TaskRunner>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            lifecycle: LifecycleController::new(Arc::clone(&db)),
            db,
            config,
            runner,
            hooks: RwLock::new(Vec::new()),
            running: DashMap::new(),
            retry_after: DashMap::new(),
            dispatch: Mutex::new(()),
            shutdown: CancellationToken::new(),
            me: me.clone(),
        })
    }

    pub fn add_hook(&self, hook: Arc<dyn CompletionHook>) {
        if let Ok(mut hooks) = self.hooks.write() {
            hooks.push(hook);
        }
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    /// Task currently running for `workspace_id`, if any.
    pub fn running_task(&self, workspace_id: &str) -> Option<i64> {
        self.running.get(workspace_id).map(|r| r.task_id)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    // ─── Submission ─────────────────────────────────────────────────────────

    pub fn enqueue(
        &self,
        workspace_id: &str,
        kind: &str,
        description: &str,
        user: Option<&str>,
    ) -> Result<Task> {
        self.submit(&NewTask {
            workspace_id: workspace_id.to_string(),
            task_type: kind.to_string(),
            description: description.to_string(),
            created_by: user.map(str::to_string),
            ..Default::default()
        })
    }

    /// Insert a pending task and try to start it right away.
    pub fn submit(&self, new: &NewTask) -> Result<Task> {
        if !matches!(
            new.task_type.as_str(),
            task_type::PLAN | task_type::PLAN_AND_APPLY | task_type::APPLY | task_type::DRIFT_CHECK
        ) {
            return Err(Error::Validation(format!("unknown task type: {}", new.task_type)));
        }
        let workspace = self.db.get_workspace(&new.workspace_id)?;
        let mut new = new.clone();
        if new.max_retries == 0 {
            new.max_retries = workspace.max_retries;
        }
        let task = self.db.insert_task(&new)?;
        tracing::info!(
            task_id = task.id,
            workspace_id = %task.workspace_id,
            task_type = %task.task_type,
            "Task enqueued"
        );
        self.try_dispatch(&task.workspace_id)?;
        self.db.get_task(task.id)
    }

    // ─── Dispatch ───────────────────────────────────────────────────────────

    fn dispatch_guard(&self) -> Result<MutexGuard<'_, ()>> {
        self.dispatch
            .lock()
            .map_err(|_| Error::internal("dispatch lock poisoned"))
    }

    /// Start the head task of `workspace_id` if the workspace is idle,
    /// unlocked and a slot is free. Returns the started task id.
    pub fn try_dispatch(&self, workspace_id: &str) -> Result<Option<i64>> {
        let _guard = self.dispatch_guard()?;
        if self.is_shutting_down()
            || self.running.contains_key(workspace_id)
            || self.running.len() >= self.config.max_parallel
        {
            return Ok(None);
        }
        if self.db.is_workspace_locked(workspace_id)? {
            tracing::debug!(workspace_id = %workspace_id, "Workspace locked, dispatch deferred");
            return Ok(None);
        }
        let queued = self.db.queued_tasks(Some(workspace_id))?;
        match self.ready_head(&queued) {
            Some(head) => self.start(head),
            None => Ok(None),
        }
    }

    /// Start head tasks across workspaces, oldest first, until every slot
    /// is taken.
    pub fn fill_capacity(&self) -> Result<usize> {
        let _guard = self.dispatch_guard()?;
        if self.is_shutting_down() {
            return Ok(0);
        }

        let mut by_workspace: HashMap<String, Vec<Task>> = HashMap::new();
        for task in self.db.queued_tasks(None)? {
            by_workspace
                .entry(task.workspace_id.clone())
                .or_default()
                .push(task);
        }

        let mut heads = Vec::new();
        for (workspace_id, queued) in &by_workspace {
            if self.running.contains_key(workspace_id) || self.db.is_workspace_locked(workspace_id)? {
                continue;
            }
            if let Some(head) = self.ready_head(queued) {
                heads.push(head);
            }
        }
        heads.sort_by(|a, b| (&a.created_at, a.id).cmp(&(&b.created_at, b.id)));

        let mut started = 0;
        for head in heads {
            if self.running.len() >= self.config.max_parallel {
                break;
            }
            if self.start(head)?.is_some() {
                started += 1;
            }
        }
        if started > 0 {
            tracing::debug!(started, running = self.running.len(), "Filled capacity");
        }
        Ok(started)
    }

    /// Head of a workspace's queue, or None when it has nothing runnable
    /// yet. A head still waiting out its retry delay blocks the workspace.
    fn ready_head<'a>(&self, queued: &'a [Task]) -> Option<&'a Task> {
        let head = select_head(queued)?;
        if let Some(deadline) = self.retry_after.get(&head.id).map(|d| *d) {
            if Instant::now() < deadline {
                return None;
            }
            self.retry_after.remove(&head.id);
        }
        Some(head)
    }

    /// Claim `task` and spawn its run. Callers hold the dispatch guard.
    fn start(&self, task: &Task) -> Result<Option<i64>> {
        let Some(me) = self.me.upgrade() else {
            return Ok(None);
        };
        if !self.db.claim_task(task.id, &task.status)? {
            tracing::debug!(task_id = task.id, "Task claimed elsewhere, skipping");
            return Ok(None);
        }
        let claimed = self.db.get_task(task.id)?;
        let task_id = claimed.id;
        let workspace_id = claimed.workspace_id.clone();
        let cancel = self.shutdown.child_token();
        let finished = CancellationToken::new();
        self.running.insert(
            workspace_id.clone(),
            RunningTask {
                task_id,
                cancel: cancel.clone(),
                finished,
            },
        );
        tracing::info!(
            task_id,
            workspace_id = %workspace_id,
            task_type = %claimed.task_type,
            from = %task.status,
            running = self.running.len(),
            "Task dispatched"
        );

        let runner = Arc::clone(&self.runner);
        tokio::spawn(async move {
            let settled = match runner.run(claimed, cancel).await {
                Ok(task) => task,
                Err(e) => match me.settle_after_runner_error(task_id, &e) {
                    Some(task) => task,
                    None => {
                        me.release_slot(&workspace_id, task_id);
                        return;
                    }
                },
            };
            me.on_task_complete(&settled);
        });
        Ok(Some(task_id))
    }

    /// The runner could not record its own result; fail the row if it is
    /// still marked running.
    fn settle_after_runner_error(&self, task_id: i64, err: &Error) -> Option<Task> {
        tracing::error!(task_id, error = %err, "Task runner failed");
        let result = self.db.get_task(task_id).and_then(|task| {
            if task.status == task_status::RUNNING {
                self.db
                    .finish_task(task_id, task_status::FAILED, Some(&err.to_string()))?;
                self.db.get_task(task_id)
            } else {
                Ok(task)
            }
        });
        match result {
            Ok(task) => Some(task),
            Err(e) => {
                tracing::error!(task_id, error = %e, "Failed to settle task after runner error");
                None
            }
        }
    }

    fn release_slot(&self, workspace_id: &str, task_id: i64) {
        if let Some((_, running)) = self
            .running
            .remove_if(workspace_id, |_, r| r.task_id == task_id)
        {
            running.finished.cancel();
        }
    }

    /// Bookkeeping after a task settled: free its slot, run completion
    /// hooks, then dispatch whatever became runnable.
    pub fn on_task_complete(&self, task: &Task) {
        self.release_slot(&task.workspace_id, task.id);
        tracing::info!(
            task_id = task.id,
            workspace_id = %task.workspace_id,
            status = %task.status,
            "Task settled"
        );

        if task.status == task_status::PENDING {
            let delay = redispatch_delay(task.retry_count);
            self.retry_after.insert(task.id, Instant::now() + delay);
            self.schedule_wake(task.workspace_id.clone(), delay);
        }

        let mut nudges = vec![task.workspace_id.clone()];
        let hooks = self.hooks.read().map(|h| h.clone()).unwrap_or_default();
        for hook in hooks {
            nudges.extend(hook.on_complete(task));
        }
        nudges.dedup();

        for workspace_id in nudges {
            if let Err(e) = self.try_dispatch(&workspace_id) {
                tracing::warn!(workspace_id = %workspace_id, error = %e, "Dispatch after completion failed");
            }
        }
        if let Err(e) = self.fill_capacity() {
            tracing::warn!(error = %e, "Fill capacity failed");
        }
    }

    fn schedule_wake(&self, workspace_id: String, delay: Duration) {
        let me = self.me.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Some(me) = me.upgrade() {
                        if let Err(e) = me.try_dispatch(&workspace_id) {
                            tracing::warn!(workspace_id = %workspace_id, error = %e, "Retry dispatch failed");
                        }
                    }
                }
            }
        });
    }

    // ─── Control ────────────────────────────────────────────────────────────

    /// Cancel a task. Queued tasks are cancelled in place; a running task is
    /// signalled and awaited for at most `cancel_settle`.
    pub async fn cancel(&self, task_id: i64) -> Result<Task> {
        for _ in 0..3 {
            let task = self.db.get_task(task_id)?;
            match task.status.as_str() {
                task_status::PENDING | task_status::APPLY_PENDING => {
                    if self.db.cancel_queued_task(task_id, CANCELLED_MESSAGE)? {
                        self.retry_after.remove(&task_id);
                        tracing::info!(task_id, workspace_id = %task.workspace_id, "Queued task cancelled");
                        self.try_dispatch(&task.workspace_id)?;
                        return self.db.get_task(task_id);
                    }
                }
                task_status::RUNNING => {
                    let handle = self
                        .running
                        .get(&task.workspace_id)
                        .filter(|r| r.task_id == task_id)
                        .map(|r| (r.cancel.clone(), r.finished.clone()));
                    match handle {
                        Some((cancel, finished)) => {
                            tracing::info!(task_id, "Cancelling running task");
                            cancel.cancel();
                            let settle = self.config.cancel_settle();
                            if tokio::time::timeout(settle, finished.cancelled()).await.is_err() {
                                tracing::warn!(task_id, "Task still running after cancel, it is inside a critical section");
                            }
                        }
                        None => {
                            self.db
                                .finish_task(task_id, task_status::CANCELLED, Some(CANCELLED_MESSAGE))?;
                        }
                    }
                    return self.db.get_task(task_id);
                }
                status => {
                    return Err(Error::Conflict(format!(
                        "task {} is already {}",
                        task_id, status
                    )))
                }
            }
        }
        self.db.get_task(task_id)
    }

    /// Confirm a parked plan_and_apply task so it resumes with its apply.
    pub fn confirm_apply(&self, task_id: i64, user: &str) -> Result<Task> {
        let task = self.db.get_task(task_id)?;
        if task.task_type != task_type::PLAN_AND_APPLY {
            return Err(Error::Validation(format!(
                "task {} is a {} task, only plan_and_apply tasks can be confirmed",
                task_id, task.task_type
            )));
        }
        let task = self.db.confirm_apply(task_id, user)?;
        tracing::info!(task_id, user = %user, "Apply confirmed");
        self.try_dispatch(&task.workspace_id)?;
        self.db.get_task(task_id)
    }

    /// Drop a parked plan without applying it.
    pub fn discard_plan(&self, task_id: i64, user: &str) -> Result<Task> {
        let task = self.db.get_task(task_id)?;
        if task.status != task_status::APPLY_PENDING {
            return Err(Error::Conflict(format!(
                "task {} is not in apply_pending status (status: {})",
                task_id, task.status
            )));
        }
        if !self
            .db
            .cancel_queued_task(task_id, &format!("Plan discarded by {}", user))?
        {
            return Err(Error::Conflict(format!("task {} changed status", task_id)));
        }
        tracing::info!(task_id, user = %user, "Plan discarded");
        self.try_dispatch(&task.workspace_id)?;
        self.db.get_task(task_id)
    }

    pub fn list_tasks(
        &self,
        workspace_id: Option<&str>,
        filter: TaskFilter,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Task>> {
        self.db.list_tasks(workspace_id, filter, limit, offset)
    }

    pub fn filter_counts(&self, workspace_id: Option<&str>) -> Result<Vec<(TaskFilter, i64)>> {
        self.db.filter_counts(workspace_id)
    }

    // ─── Startup / Shutdown ─────────────────────────────────────────────────

    /// Settle what a previous process left behind, then start queued work.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for orphan in self.db.recover_orphaned_tasks(ORPHANED_MESSAGE)? {
            if orphan.reverted {
                report.reverted += 1;
                tracing::info!(task_id = orphan.task_id, "Orphaned task returned to apply_pending");
            } else {
                report.failed += 1;
                tracing::warn!(task_id = orphan.task_id, workspace_id = %orphan.workspace_id, "Orphaned task marked failed");
                self.lifecycle
                    .advance(&orphan.workspace_id, WorkspaceState::Failed);
            }
            if self
                .db
                .unlock_workspace(&orphan.workspace_id, Some(&lock_holder(orphan.task_id)))?
            {
                report.locks_released += 1;
                tracing::info!(workspace_id = %orphan.workspace_id, task_id = orphan.task_id, "Released lock held by orphaned task");
            }
        }
        report.trigger_tasks_cancelled = self.db.cancel_pending_trigger_tasks(TRIGGER_RECOVERY_MESSAGE)?;
        report.dispatched = self.fill_capacity()?;
        tracing::info!(
            failed = report.failed,
            reverted = report.reverted,
            locks_released = report.locks_released,
            trigger_tasks_cancelled = report.trigger_tasks_cancelled,
            dispatched = report.dispatched,
            "Queue recovery complete"
        );
        Ok(report)
    }

    /// Periodically fill free slots so workspaces resume once unlocked.
    pub fn spawn_pending_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let me = Arc::clone(self);
        let period = self.config.pending_monitor_interval();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = me.fill_capacity() {
                            tracing::warn!(error = %e, "Pending monitor failed to fill capacity");
                        }
                    }
                }
            }
            tracing::debug!("Pending monitor stopped");
        })
    }

    /// Stop dispatching, cancel running tasks and wait for them to settle.
    /// Returns false when something was still running at the deadline.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.shutdown.cancel();
        let drained = self.wait_idle(timeout).await;
        if !drained {
            tracing::warn!(running = self.running.len(), "Shutdown deadline reached with tasks still running");
        }
        drained
    }

    /// Wait for the tasks running right now to finish. False on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let finished: Vec<CancellationToken> =
            self.running.iter().map(|r| r.finished.clone()).collect();
        if finished.is_empty() {
            return true;
        }
        tracing::info!(running = finished.len(), "Waiting for running tasks");
        let all = futures::future::join_all(finished.iter().map(|f| f.cancelled()));
        tokio::time::timeout(timeout, all).await.is_ok()
    }
}

/// First runnable task of one workspace's queue (already in dispatch order).
///
/// Unconfirmed `apply_pending` tasks stay parked and keep later tasks that
/// would apply from running; plans and drift checks pass them.
pub fn select_head(queued: &[Task]) -> Option<&Task> {
    let mut parked_apply = false;
    for task in queued {
        match task.status.as_str() {
            task_status::APPLY_PENDING if task.apply_confirmed_at.is_some() => return Some(task),
            task_status::APPLY_PENDING => parked_apply = true,
            task_status::PENDING => {
                let applies = matches!(
                    task.task_type.as_str(),
                    task_type::PLAN_AND_APPLY | task_type::APPLY
                );
                if !(parked_apply && applies) {
                    return Some(task);
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: i64, kind: &str, status: &str, confirmed: bool) -> Task {
        Task {
            id,
            workspace_id: "ws-a".into(),
            task_type: kind.into(),
            status: status.into(),
            stage: status.into(),
            description: String::new(),
            created_by: None,
            created_at: format!("2026-01-01T00:00:0{}.000000Z", id),
            started_at: None,
            completed_at: None,
            duration: None,
            retry_count: 0,
            max_retries: 0,
            error_message: None,
            plan_output: None,
            apply_output: None,
            plan_json: None,
            plan_hash: None,
            plan_task_id: None,
            changes_add: 0,
            changes_change: 0,
            changes_destroy: 0,
            apply_confirmed_by: confirmed.then(|| "alice".to_string()),
            apply_confirmed_at: confirmed.then(|| "2026-01-01T00:01:00.000000Z".to_string()),
        }
    }

    #[test]
    fn test_select_head_fifo() {
        let queued = vec![
            task(1, task_type::PLAN, task_status::PENDING, false),
            task(2, task_type::APPLY, task_status::PENDING, false),
        ];
        assert_eq!(select_head(&queued).map(|t| t.id), Some(1));
    }

    #[test]
    fn test_parked_apply_blocks_later_applies_only() {
        let queued = vec![
            task(1, task_type::PLAN_AND_APPLY, task_status::APPLY_PENDING, false),
            task(2, task_type::PLAN_AND_APPLY, task_status::PENDING, false),
            task(3, task_type::DRIFT_CHECK, task_status::PENDING, false),
        ];
        assert_eq!(select_head(&queued).map(|t| t.id), Some(3));

        let queued = vec![
            task(1, task_type::PLAN_AND_APPLY, task_status::APPLY_PENDING, false),
            task(2, task_type::APPLY, task_status::PENDING, false),
        ];
        assert!(select_head(&queued).is_none());
    }

    #[test]
    fn test_confirmed_apply_is_head() {
        let queued = vec![
            task(1, task_type::PLAN_AND_APPLY, task_status::APPLY_PENDING, true),
            task(2, task_type::PLAN, task_status::PENDING, false),
        ];
        assert_eq!(select_head(&queued).map(|t| t.id), Some(1));
    }
}
