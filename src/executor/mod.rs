pub mod logger;
pub mod plan_parser;
pub mod retry;
pub mod stream;
pub mod terraform;
pub mod workdir;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

pub use logger::{LogLevel, TaskLogger};
pub use stream::{MessageKind, OutputMessage, OutputStream, StreamRegistry};
pub use terraform::{TerraformCli, TerraformResult, Toolchain};

use crate::config::ExecutorConfig;
use crate::db::models::{task_status, task_type, StateVersion, Task, Workspace, WorkspaceState};
use crate::db::{Database, WorkspaceLock};
use crate::error::{Error, Result};
use crate::index::ResourceIndexer;
use crate::lifecycle::LifecycleController;
use crate::queue::TaskRunner;
use crate::remote_data::RemoteDataService;
use crate::signal::SignalManager;
use crate::state::document::checksum;
use crate::state::StateManager;
use crate::variables::VariableStore;
use workdir::{PreparedWorkdir, WorkdirInputs, PLAN_FILE, STATE_FILE};

pub const CANCELLED_MESSAGE: &str = "Task cancelled by user";

/// Values of `workspace_tasks.stage` while a task runs.
pub mod stage {
    pub const FETCHING: &str = "fetching";
    pub const INIT: &str = "init";
    pub const PLANNING: &str = "planning";
    pub const SAVING_PLAN: &str = "saving_plan";
    pub const APPLYING: &str = "applying";
    pub const SAVING_STATE: &str = "saving_state";
    pub const INDEXING: &str = "indexing";
}

/// What a task does, decided once from its `task_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Plan,
    PlanAndApply,
    Apply,
    DriftCheck,
}

impl TaskKind {
    pub fn parse(value: &str) -> Result<Self> {
        match value {
            task_type::PLAN => Ok(TaskKind::Plan),
            task_type::PLAN_AND_APPLY => Ok(TaskKind::PlanAndApply),
            task_type::APPLY => Ok(TaskKind::Apply),
            task_type::DRIFT_CHECK => Ok(TaskKind::DriftCheck),
            other => Err(Error::Validation(format!("unknown task type: {}", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Plan => task_type::PLAN,
            TaskKind::PlanAndApply => task_type::PLAN_AND_APPLY,
            TaskKind::Apply => task_type::APPLY,
            TaskKind::DriftCheck => task_type::DRIFT_CHECK,
        }
    }

    pub fn applies(&self) -> bool {
        matches!(self, TaskKind::PlanAndApply | TaskKind::Apply)
    }

    /// Whether a run of `task` starts with a fresh plan, as opposed to
    /// applying a plan stored earlier.
    pub fn plans_first(&self, task: &Task) -> bool {
        match self {
            TaskKind::Plan | TaskKind::DriftCheck => true,
            TaskKind::PlanAndApply => task.apply_confirmed_at.is_none(),
            TaskKind::Apply => task.plan_task_id.is_none(),
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Holder name used for the workspace lock taken during apply.
pub fn lock_holder(task_id: i64) -> String {
    format!("task:{}", task_id)
}

/// Where a successful run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Planned,
    AwaitingApproval,
    Applied,
}

/// Per-run working data.
struct Run {
    task: Task,
    kind: TaskKind,
    workspace: Workspace,
    logger: TaskLogger,
    dir: PathBuf,
    prepared: PreparedWorkdir,
    plans_first: bool,
    plan_hash: Option<String>,
    apply_offset: Option<usize>,
    initial_state: Option<String>,
}

// ─── Executor ───────────────────────────────────────────────────────────────

/// Drives one task through fetch, init, plan, apply, save_state and index.
pub struct TaskExecutor {
    db: Arc<Database>,
    config: ExecutorConfig,
    toolchain: Arc<dyn Toolchain>,
    state: Arc<StateManager>,
    indexer: Arc<ResourceIndexer>,
    variables: Arc<VariableStore>,
    remote_data: Arc<RemoteDataService>,
    lifecycle: Arc<LifecycleController>,
    signals: Arc<SignalManager>,
    streams: Arc<StreamRegistry>,
    timeout: Option<Duration>,
}

impl TaskExecutor {
    pub fn new(db: Arc<Database>, config: ExecutorConfig, toolchain: Arc<dyn Toolchain>) -> Self {
        Self {
            state: Arc::new(StateManager::new(Arc::clone(&db))),
            indexer: Arc::new(ResourceIndexer::new(Arc::clone(&db))),
            variables: Arc::new(VariableStore::new(Arc::clone(&db))),
            remote_data: Arc::new(RemoteDataService::new(Arc::clone(&db))),
            lifecycle: Arc::new(LifecycleController::new(Arc::clone(&db))),
            signals: Arc::new(SignalManager::new()),
            streams: Arc::new(StreamRegistry::new()),
            timeout: None,
            db,
            config,
            toolchain,
        }
    }

    pub fn with_indexer(mut self, indexer: Arc<ResourceIndexer>) -> Self {
        self.indexer = indexer;
        self
    }

    pub fn with_variables(mut self, variables: Arc<VariableStore>) -> Self {
        self.variables = variables;
        self
    }

    pub fn with_signals(mut self, signals: Arc<SignalManager>) -> Self {
        self.signals = signals;
        self
    }

    pub fn with_streams(mut self, streams: Arc<StreamRegistry>) -> Self {
        self.streams = streams;
        self
    }

    /// Fail runs that take longer than `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout).filter(|t| !t.is_zero());
        self
    }

    pub fn streams(&self) -> &Arc<StreamRegistry> {
        &self.streams
    }

    /// Execute a task the queue already moved to `running`, record the
    /// result on its row and return the row.
    pub async fn execute(&self, task: Task, cancel: CancellationToken) -> Result<Task> {
        let task_id = task.id;
        let kind = match TaskKind::parse(&task.task_type) {
            Ok(kind) => kind,
            Err(e) => return self.fail_early(task_id, &e),
        };
        let workspace = match self.db.get_workspace(&task.workspace_id) {
            Ok(ws) => ws,
            Err(e) => return self.fail_early(task_id, &e),
        };

        let level = LogLevel::resolve(workspace.log_level_override().as_deref(), &self.config.log_level);
        let logger = TaskLogger::new(task_id, level, Some(self.streams.get_or_create(task_id)));
        let dir = workdir::task_dir(&self.config.workdir, &workspace.workspace_id, task_id);
        let plans_first = kind.plans_first(&task);

        tracing::info!(
            task_id,
            workspace_id = %workspace.workspace_id,
            kind = %kind,
            attempt = task.retry_count + 1,
            "Executing task"
        );
        logger.info(format!(
            "Task #{} ({}) on workspace {} started",
            task_id, kind, workspace.name
        ));

        let mut run = Run {
            task,
            kind,
            workspace,
            logger,
            dir,
            prepared: PreparedWorkdir::default(),
            plans_first,
            plan_hash: None,
            apply_offset: None,
            initial_state: None,
        };

        let run_token = cancel.child_token();
        let timed_out = Arc::new(AtomicBool::new(false));
        let watchdog = self.timeout.map(|limit| {
            let token = run_token.clone();
            let flag = Arc::clone(&timed_out);
            tokio::spawn(async move {
                tokio::select! {
                    _ = token.cancelled() => {}
                    _ = tokio::time::sleep(limit) => {
                        flag.store(true, Ordering::SeqCst);
                        token.cancel();
                    }
                }
            })
        });

        let mut result = self.drive(&mut run, &run_token).await;
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }
        if let (Err(Error::Cancelled(_)), Some(limit)) = (&result, self.timeout) {
            if timed_out.load(Ordering::SeqCst) {
                result = Err(Error::Timeout(limit));
            }
        }
        self.finish(run, result).await
    }

    fn fail_early(&self, task_id: i64, err: &Error) -> Result<Task> {
        tracing::error!(task_id, error = %err, "Task could not start");
        self.db
            .finish_task(task_id, task_status::FAILED, Some(&err.to_string()))?;
        self.db.get_task(task_id)
    }

    async fn drive(&self, run: &mut Run, cancel: &CancellationToken) -> Result<Outcome> {
        self.fetch(run, cancel)?;
        self.init(run, cancel).await?;

        if run.plans_first {
            self.lifecycle
                .advance(&run.workspace.workspace_id, WorkspaceState::Planning);
            self.plan(run, cancel).await?;
            match run.kind {
                TaskKind::Plan | TaskKind::DriftCheck => return Ok(Outcome::Planned),
                TaskKind::PlanAndApply if !run.workspace.auto_apply => {
                    return Ok(Outcome::AwaitingApproval)
                }
                _ => {}
            }
        }

        self.apply(run, cancel).await?;
        Ok(Outcome::Applied)
    }

    fn begin(&self, run: &Run, stage_name: &str, marker: &str) {
        if let Err(e) = self.db.set_task_stage(run.task.id, stage_name) {
            tracing::warn!(task_id = run.task.id, error = %e, "Failed to record task stage");
        }
        run.logger.stage_begin(marker);
    }

    // ─── Fetch ──────────────────────────────────────────────────────────────

    fn fetch(&self, run: &mut Run, cancel: &CancellationToken) -> Result<()> {
        ensure_not_cancelled(cancel)?;
        self.begin(run, stage::FETCHING, "fetch");

        if let Some(config) = &run.workspace.provider_config {
            if !config.is_object() && !config.is_null() {
                return Err(Error::ProviderCredential(format!(
                    "provider_config of workspace {} must be a JSON object",
                    run.workspace.workspace_id
                )));
            }
        }

        let workspace_id = run.workspace.workspace_id.clone();
        let variables = self.variables.for_execution(&workspace_id)?;
        let remote_data =
            self.remote_data
                .render_config(&workspace_id, Some(run.task.id), &self.config.base_url)?;
        let state = self
            .db
            .latest_state_version(&workspace_id)?
            .and_then(|v| v.content);

        let prepared = workdir::prepare(
            &run.dir,
            &WorkdirInputs {
                workspace: &run.workspace,
                variables: &variables,
                remote_data: remote_data.as_ref(),
                state: state.as_deref(),
            },
        )?;

        let sensitive = variables.iter().filter(|v| v.sensitive).count();
        run.logger.info(format!(
            "Prepared {} ({} files, {} variables, {} sensitive)",
            run.dir.display(),
            prepared.files.len(),
            variables.len(),
            sensitive
        ));
        for file in &prepared.files {
            run.logger.debug(format!("  {}", file));
        }
        if remote_data.is_some() {
            run.logger.info("Rendered remote data sources");
        }
        if state.is_none() {
            run.logger.info("No previous state, starting empty");
        }

        run.prepared = prepared;
        run.initial_state = state;
        run.logger.stage_end("fetch");
        Ok(())
    }

    // ─── Init ───────────────────────────────────────────────────────────────

    async fn init(&self, run: &Run, cancel: &CancellationToken) -> Result<()> {
        self.begin(run, stage::INIT, "init");
        let args = strings(&["init", "-no-color", "-input=false", "-upgrade"]);
        let args = &args;
        retry::with_retry_if(
            self.config.init_max_retries,
            self.config.init_retry_base_ms,
            "init",
            |e: &Error| matches!(e, Error::Transient(_)),
            move || self.init_once(run, args, cancel),
        )
        .await?;
        run.logger.stage_end("init");
        Ok(())
    }

    async fn init_once(&self, run: &Run, args: &[String], cancel: &CancellationToken) -> Result<()> {
        let result = self
            .toolchain
            .run(&run.dir, args, &run.prepared.env, &run.logger, cancel)
            .await?;
        if result.success() {
            return Ok(());
        }
        let message = result.error_message();
        let all_output = format!("{}\n{}", result.stdout_lines.join("\n"), message);
        if retry::is_network_error(&all_output) {
            run.logger
                .warn(format!("Init failed with a network error: {}", message));
            return Err(Error::Transient(format!("init failed: {}", message)));
        }
        result.ensure_success("init").map(|_| ())
    }

    // ─── Plan ───────────────────────────────────────────────────────────────

    async fn plan(&self, run: &mut Run, cancel: &CancellationToken) -> Result<()> {
        self.begin(run, stage::PLANNING, "plan");
        let task_id = run.task.id;

        let mut args = strings(&["plan", &format!("-out={}", PLAN_FILE), "-no-color", "-input=false"]);
        if run.kind == TaskKind::DriftCheck {
            args.push("-refresh-only".to_string());
            args.extend(terraform::strip_target_args(&run.prepared.extra_args));
        } else {
            args.extend(run.prepared.extra_args.iter().cloned());
        }
        self.toolchain
            .run(&run.dir, &args, &run.prepared.env, &run.logger, cancel)
            .await?
            .ensure_success("plan")?;

        // The plan JSON can be large and may hold values; keep it out of the log.
        let quiet = TaskLogger::new(task_id, LogLevel::Error, None);
        let show = self
            .toolchain
            .run(
                &run.dir,
                &strings(&["show", "-json", PLAN_FILE]),
                &run.prepared.env,
                &quiet,
                cancel,
            )
            .await?
            .ensure_success("show")?;
        let plan_json = show.stdout_lines.join("\n");
        let changes = plan_parser::parse_plan_json(&plan_json)?;
        let (add, change, destroy) = plan_parser::count_changes(&changes);
        run.logger.info(format!(
            "Plan: {} to add, {} to change, {} to destroy.",
            add, change, destroy
        ));

        let plan_path = run.dir.join(PLAN_FILE);
        let plan_data = std::fs::read(&plan_path)
            .with_context(|| format!("Failed to read {}", plan_path.display()))?;
        let plan_hash = checksum(&plan_data);
        run.logger.stage_end("plan");

        self.begin(run, stage::SAVING_PLAN, "save_plan");
        let db = &self.db;
        let (data, json, hash, rows) = (&plan_data, &plan_json, &plan_hash, &changes);
        retry::with_retry(3, 500, "save_plan", move || async move {
            db.save_plan_artifacts(task_id, data, json, hash, rows)
        })
        .await?;
        run.logger.info(format!(
            "Saved plan ({} bytes, {} resource changes)",
            plan_data.len(),
            changes.len()
        ));
        run.logger.stage_end("save_plan");

        run.plan_hash = Some(plan_hash);
        Ok(())
    }

    // ─── Apply ──────────────────────────────────────────────────────────────

    /// Write the stored plan of `source_task_id` into the work tree and
    /// check it against the recorded hash.
    fn restore_plan(&self, run: &Run, source_task_id: i64) -> Result<()> {
        let source = self.db.get_task(source_task_id)?;
        if source.workspace_id != run.workspace.workspace_id {
            return Err(Error::Validation(format!(
                "task {} belongs to another workspace",
                source_task_id
            )));
        }
        let data = self.db.plan_data(source_task_id)?.ok_or_else(|| {
            Error::Validation(format!("task {} has no stored plan", source_task_id))
        })?;
        let expected = source.plan_hash.unwrap_or_default();
        let actual = checksum(&data);
        if actual != expected {
            return Err(Error::Validation(format!(
                "plan hash mismatch for task {}: expected {}, got {}",
                source_task_id, expected, actual
            )));
        }
        let plan_path = run.dir.join(PLAN_FILE);
        std::fs::write(&plan_path, &data)
            .with_context(|| format!("Failed to write {}", plan_path.display()))?;
        run.logger.info(format!(
            "Restored plan from task #{} (hash verified)",
            source_task_id
        ));
        Ok(())
    }

    async fn apply(&self, run: &mut Run, cancel: &CancellationToken) -> Result<()> {
        let task_id = run.task.id;
        let workspace_id = run.workspace.workspace_id.clone();

        if !run.plans_first {
            let source = match run.kind {
                TaskKind::Apply => run.task.plan_task_id.unwrap_or(task_id),
                _ => task_id,
            };
            self.restore_plan(run, source)?;
        }

        ensure_not_cancelled(cancel)?;
        if self.signals.is_graceful_exit() {
            return Err(Error::Cancelled(
                "shutdown in progress, apply not started".into(),
            ));
        }

        run.apply_offset = Some(run.logger.full_output().len());
        self.begin(run, stage::APPLYING, "apply");
        let lock = WorkspaceLock::acquire(
            &self.db,
            &workspace_id,
            &lock_holder(task_id),
            &format!("Apply in progress (task #{})", task_id),
        )?;
        self.lifecycle.advance_through(
            &workspace_id,
            &[
                WorkspaceState::PlanDone,
                WorkspaceState::WaitingApply,
                WorkspaceState::Applying,
            ],
        );

        let mut args = strings(&["apply", "-no-color", "-auto-approve", "-input=false"]);
        args.extend(run.prepared.extra_args.iter().cloned());
        args.push(PLAN_FILE.to_string());

        let section = self.signals.enter_critical_section("apply");
        if cancel.is_cancelled() {
            run.logger
                .warn("Cancellation requested during apply; it takes effect after apply finishes");
        }
        // Apply always runs to completion.
        let uninterruptible = CancellationToken::new();
        let applied = self
            .toolchain
            .run(&run.dir, &args, &run.prepared.env, &run.logger, &uninterruptible)
            .await
            .and_then(|r| r.ensure_success("apply"));

        if let Err(e) = applied {
            self.save_partial_state(run);
            section.exit();
            drop(lock);
            return Err(e);
        }
        run.logger.stage_end("apply");

        self.begin(run, stage::SAVING_STATE, "save_state");
        // Opened before the apply section closes so a waiting shutdown never sees a gap.
        let saving = self.signals.enter_critical_section("save_state");
        section.exit();
        let section = saving;
        match self.save_state(run) {
            Ok(version) => {
                section.exit();
                run.logger.info(format!(
                    "Saved state version {} (serial {})",
                    version.version, version.serial
                ));
                lock.release()?;
            }
            Err(e) => {
                section.exit();
                run.logger.error(format!("Failed to save state: {}", e));
                lock.retain(&format!(
                    "State save failed after apply (task #{}). Please verify state before unlocking.",
                    task_id
                ))?;
                return Err(e);
            }
        }
        run.logger.stage_end("save_state");

        self.begin(run, stage::INDEXING, "index");
        match self.indexer.sync(&workspace_id) {
            Ok(report) => run.logger.info(format!(
                "Indexed resources: {} inserted, {} updated, {} deleted",
                report.inserted, report.updated, report.deleted
            )),
            Err(e) => {
                tracing::warn!(task_id, workspace_id = %workspace_id, error = %e, "Resource indexing failed after apply");
                run.logger.warn(format!(
                    "Resource indexing failed: {}. The index refreshes on the next sync.",
                    e
                ));
            }
        }
        run.logger.stage_end("index");
        Ok(())
    }

    fn read_state_file(&self, run: &Run) -> Result<Option<String>> {
        let path = run.dir.join(STATE_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Some(content).filter(|c| !c.trim().is_empty()))
    }

    fn apply_user(run: &Run) -> Option<&str> {
        run.task
            .apply_confirmed_by
            .as_deref()
            .or(run.task.created_by.as_deref())
    }

    fn save_state(&self, run: &Run) -> Result<StateVersion> {
        let content = self
            .read_state_file(run)?
            .ok_or_else(|| Error::Validation("apply produced no state file".into()))?;
        self.state.record_run_state(
            &run.workspace.workspace_id,
            &content,
            run.task.id,
            Self::apply_user(run),
        )
    }

    /// Keep whatever a failed apply managed to create.
    fn save_partial_state(&self, run: &Run) {
        let content = match self.read_state_file(run) {
            Ok(Some(content)) => content,
            Ok(None) => return,
            Err(e) => {
                run.logger.warn(format!("Could not read partial state: {}", e));
                return;
            }
        };
        if run.initial_state.as_deref() == Some(content.as_str()) {
            return;
        }
        match self.state.record_run_state(
            &run.workspace.workspace_id,
            &content,
            run.task.id,
            Self::apply_user(run),
        ) {
            Ok(version) => run.logger.warn(format!(
                "Apply failed; saved partial state as version {}",
                version.version
            )),
            Err(e) => run
                .logger
                .error(format!("Apply failed and partial state could not be saved: {}", e)),
        }
    }

    // ─── Completion ─────────────────────────────────────────────────────────

    fn store_output(&self, run: &Run) {
        let full = run.logger.full_output();
        let task_id = run.task.id;
        let stored = if run.plans_first {
            let split = run.apply_offset.unwrap_or(full.len());
            self.db
                .set_plan_output(task_id, &full[..split])
                .and_then(|_| match run.apply_offset {
                    Some(_) => self.db.set_apply_output(task_id, &full[split..]),
                    None => Ok(()),
                })
        } else {
            self.db.set_apply_output(task_id, &full)
        };
        if let Err(e) = stored {
            tracing::warn!(task_id, error = %e, "Failed to store task output");
        }
    }

    async fn finish(&self, run: Run, result: Result<Outcome>) -> Result<Task> {
        let task_id = run.task.id;
        let workspace_id = run.workspace.workspace_id.clone();

        let summary = match result {
            Ok(Outcome::Planned) => {
                run.logger.info("Plan finished");
                self.store_output(&run);
                self.db.finish_task(task_id, task_status::SUCCESS, None)?;
                self.lifecycle.advance(&workspace_id, WorkspaceState::PlanDone);
                task_status::SUCCESS.to_string()
            }
            Ok(Outcome::AwaitingApproval) => {
                run.logger.info("Plan finished, waiting for apply confirmation");
                self.store_output(&run);
                self.db.park_apply_pending(task_id)?;
                self.lifecycle.advance_through(
                    &workspace_id,
                    &[WorkspaceState::PlanDone, WorkspaceState::WaitingApply],
                );
                task_status::APPLY_PENDING.to_string()
            }
            Ok(Outcome::Applied) => {
                run.logger.info("Apply finished");
                self.store_output(&run);
                self.db.finish_task(task_id, task_status::APPLIED, None)?;
                self.lifecycle.advance(&workspace_id, WorkspaceState::Completed);
                task_status::APPLIED.to_string()
            }
            Err(e) => {
                let cancelled = matches!(e, Error::Cancelled(_));
                let message = if cancelled {
                    CANCELLED_MESSAGE.to_string()
                } else {
                    e.to_string()
                };
                run.logger.error(&message);

                if e.is_retryable() && run.task.retry_count < run.task.max_retries {
                    run.logger.warn(format!(
                        "Transient failure, retry {}/{} scheduled",
                        run.task.retry_count + 1,
                        run.task.max_retries
                    ));
                    self.store_output(&run);
                    self.db.requeue_for_retry(task_id, &message)?;
                    tracing::warn!(task_id, error = %message, "Task requeued after transient failure");
                    task_status::PENDING.to_string()
                } else {
                    self.store_output(&run);
                    let status = if cancelled {
                        task_status::CANCELLED
                    } else {
                        task_status::FAILED
                    };
                    self.db.finish_task(task_id, status, Some(&message))?;
                    if !cancelled {
                        self.lifecycle.advance(&workspace_id, WorkspaceState::Failed);
                    }
                    tracing::error!(task_id, workspace_id = %workspace_id, error = %message, "Task {}", status);
                    status.to_string()
                }
            }
        };

        if !self.config.keep_workdir && run.dir.exists() {
            if let Err(e) = tokio::fs::remove_dir_all(&run.dir).await {
                tracing::warn!(task_id, dir = %run.dir.display(), error = %e, "Failed to remove work directory");
            }
        }
        run.logger.complete(&summary);
        tracing::info!(task_id, status = %summary, "Task execution finished");
        self.db.get_task(task_id)
    }
}

#[async_trait]
impl TaskRunner for TaskExecutor {
    async fn run(&self, task: Task, cancel: CancellationToken) -> Result<Task> {
        self.execute(task, cancel).await
    }
}

fn ensure_not_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled(CANCELLED_MESSAGE.into()));
    }
    Ok(())
}

fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}
