use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use iacore::config::QueueConfig;
use iacore::db::models::{task_status, task_type, NewWorkspace, Task};
use iacore::db::tasks::NewTask;
use iacore::db::{Database, TaskFilter};
use iacore::executor::lock_holder;
use iacore::queue::{CompletionHook, TaskQueueManager, TaskRunner};
use iacore::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// Runs until a permit is released or the task is cancelled. Unconfirmed
/// plan_and_apply tasks park at apply_pending; tasks described as "flaky"
/// are put back in the queue once.
struct GatedRunner {
    db: Arc<Database>,
    gate: Semaphore,
}

impl GatedRunner {
    fn new(db: Arc<Database>) -> Arc<Self> {
        Arc::new(Self {
            db,
            gate: Semaphore::new(0),
        })
    }

    fn release(&self, n: usize) {
        self.gate.add_permits(n);
    }
}

#[async_trait]
impl TaskRunner for GatedRunner {
    async fn run(&self, task: Task, cancel: CancellationToken) -> iacore::Result<Task> {
        tokio::select! {
            permit = self.gate.acquire() => {
                permit.map_err(|e| Error::Internal(e.to_string()))?.forget();
                if task.description == "flaky" && task.retry_count == 0 {
                    self.db.requeue_for_retry(task.id, "registry.terraform.io: connection reset")?;
                } else if task.task_type == task_type::PLAN_AND_APPLY && task.apply_confirmed_at.is_none() {
                    self.db.park_apply_pending(task.id)?;
                } else if task.task_type == task_type::PLAN_AND_APPLY {
                    self.db.finish_task(task.id, task_status::APPLIED, None)?;
                } else {
                    self.db.finish_task(task.id, task_status::SUCCESS, None)?;
                }
            }
            _ = cancel.cancelled() => {
                self.db.finish_task(task.id, task_status::CANCELLED, Some("Task cancelled by user"))?;
            }
        }
        self.db.get_task(task.id)
    }
}

#[derive(Default)]
struct RecordingHook {
    seen: Mutex<Vec<(i64, String)>>,
}

impl CompletionHook for RecordingHook {
    fn on_complete(&self, task: &Task) -> Vec<String> {
        self.seen.lock().unwrap().push((task.id, task.status.clone()));
        Vec::new()
    }
}

fn setup(max_parallel: usize) -> (Arc<Database>, Arc<GatedRunner>, Arc<TaskQueueManager>) {
    let db = Arc::new(Database::open_memory().unwrap());
    let runner = GatedRunner::new(db.clone());
    let queue = TaskQueueManager::new(
        db.clone(),
        QueueConfig {
            max_parallel,
            cancel_settle_secs: 5,
            ..Default::default()
        },
        runner.clone(),
    );
    (db, runner, queue)
}

fn workspace(db: &Database, name: &str) -> String {
    db.create_workspace(&NewWorkspace::named(name)).unwrap().workspace_id
}

async fn wait_status(db: &Database, task_id: i64, status: &str) -> Task {
    for _ in 0..300 {
        let task = db.get_task(task_id).unwrap();
        if task.status == status {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "task {} never reached {} (now {})",
        task_id,
        status,
        db.get_task(task_id).unwrap().status
    );
}

#[tokio::test]
async fn test_one_task_per_workspace_in_order() {
    let (db, runner, queue) = setup(3);
    let ws = workspace(&db, "app");

    let first = queue.enqueue(&ws, task_type::PLAN, "first", None).unwrap();
    let second = queue.enqueue(&ws, task_type::PLAN, "second", None).unwrap();
    assert_eq!(first.status, task_status::RUNNING);
    assert_eq!(second.status, task_status::PENDING);
    assert_eq!(queue.running_task(&ws), Some(first.id));

    runner.release(1);
    wait_status(&db, first.id, task_status::SUCCESS).await;
    wait_status(&db, second.id, task_status::RUNNING).await;

    runner.release(1);
    let done = wait_status(&db, second.id, task_status::SUCCESS).await;
    assert!(done.completed_at.is_some());
    assert!(done.duration.is_some());
}

#[tokio::test]
async fn test_global_parallelism_bound() {
    let (db, runner, queue) = setup(2);
    let tasks: Vec<Task> = ["a", "b", "c"]
        .iter()
        .map(|name| {
            let ws = workspace(&db, name);
            queue.enqueue(&ws, task_type::PLAN, "", None).unwrap()
        })
        .collect();

    assert_eq!(queue.running_count(), 2);
    assert_eq!(tasks[2].status, task_status::PENDING);

    runner.release(1);
    wait_status(&db, tasks[2].id, task_status::RUNNING).await;
    assert_eq!(queue.running_count(), 2);

    runner.release(2);
    for task in &tasks {
        wait_status(&db, task.id, task_status::SUCCESS).await;
    }
}

#[tokio::test]
async fn test_backlog_dispatches_oldest_first_across_workspaces() {
    let (db, runner, queue) = setup(2);
    let w = workspace(&db, "w");
    let w2 = workspace(&db, "w-prime");
    let pending = |ws: &str, description: &str| {
        db.insert_task(&NewTask {
            workspace_id: ws.to_string(),
            task_type: task_type::PLAN.to_string(),
            description: description.to_string(),
            ..Default::default()
        })
        .unwrap()
    };
    let t1 = pending(&w, "T1");
    let u1 = pending(&w2, "U1");
    let t2 = pending(&w, "T2");
    let t3 = pending(&w, "T3");

    assert_eq!(queue.fill_capacity().unwrap(), 2);
    assert_eq!(queue.running_task(&w), Some(t1.id));
    assert_eq!(queue.running_task(&w2), Some(u1.id));
    assert_eq!(db.get_task(t2.id).unwrap().status, task_status::PENDING);

    // Let both runners queue on the gate before opening it.
    tokio::time::sleep(Duration::from_millis(50)).await;
    runner.release(2);
    wait_status(&db, t1.id, task_status::SUCCESS).await;
    wait_status(&db, u1.id, task_status::SUCCESS).await;
    wait_status(&db, t2.id, task_status::RUNNING).await;
    assert_eq!(db.get_task(t3.id).unwrap().status, task_status::PENDING);

    runner.release(1);
    wait_status(&db, t2.id, task_status::SUCCESS).await;
    wait_status(&db, t3.id, task_status::RUNNING).await;
    runner.release(1);
    wait_status(&db, t3.id, task_status::SUCCESS).await;
}

#[tokio::test]
async fn test_locked_workspace_waits() {
    let (db, runner, queue) = setup(3);
    let ws = workspace(&db, "app");
    db.lock_workspace(&ws, "alice", "maintenance").unwrap();

    let task = queue.enqueue(&ws, task_type::PLAN, "", None).unwrap();
    assert_eq!(task.status, task_status::PENDING);
    assert_eq!(queue.fill_capacity().unwrap(), 0);

    db.unlock_workspace(&ws, None).unwrap();
    assert_eq!(queue.fill_capacity().unwrap(), 1);
    assert_eq!(db.get_task(task.id).unwrap().status, task_status::RUNNING);

    runner.release(1);
    wait_status(&db, task.id, task_status::SUCCESS).await;
}

#[tokio::test]
async fn test_submit_validates_type_and_workspace() {
    let (db, _runner, queue) = setup(3);
    let ws = workspace(&db, "app");
    let err = queue.enqueue(&ws, "destroy_everything", "", None).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
    let err = queue.enqueue("ws-missing", task_type::PLAN, "", None).unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[tokio::test]
async fn test_cancel_pending_and_running() {
    let (db, _runner, queue) = setup(3);
    let ws = workspace(&db, "app");
    let running = queue.enqueue(&ws, task_type::PLAN, "", None).unwrap();
    let pending = queue.enqueue(&ws, task_type::PLAN, "", None).unwrap();

    let cancelled = queue.cancel(pending.id).await.unwrap();
    assert_eq!(cancelled.status, task_status::CANCELLED);

    let cancelled = queue.cancel(running.id).await.unwrap();
    assert_eq!(cancelled.status, task_status::CANCELLED);
    assert_eq!(queue.running_count(), 0);

    let err = queue.cancel(running.id).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
}

#[tokio::test]
async fn test_plan_and_apply_waits_for_confirmation() {
    let (db, runner, queue) = setup(3);
    let ws = workspace(&db, "app");
    let task = queue.enqueue(&ws, task_type::PLAN_AND_APPLY, "", Some("alice")).unwrap();
    runner.release(1);
    wait_status(&db, task.id, task_status::APPLY_PENDING).await;
    assert_eq!(queue.running_count(), 0);

    // Later applies stay behind the parked task, plans pass it.
    let blocked = queue.enqueue(&ws, task_type::PLAN_AND_APPLY, "", None).unwrap();
    assert_eq!(blocked.status, task_status::PENDING);
    let plan = queue.enqueue(&ws, task_type::PLAN, "", None).unwrap();
    assert_eq!(plan.status, task_status::RUNNING);
    runner.release(1);
    wait_status(&db, plan.id, task_status::SUCCESS).await;
    assert_eq!(db.get_task(blocked.id).unwrap().status, task_status::PENDING);

    let err = queue.confirm_apply(plan.id, "bob").unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let confirmed = queue.confirm_apply(task.id, "bob").unwrap();
    assert_eq!(confirmed.apply_confirmed_by.as_deref(), Some("bob"));
    assert_eq!(confirmed.status, task_status::RUNNING);
    runner.release(1);
    wait_status(&db, task.id, task_status::APPLIED).await;

    // The blocked task is now the head and parks in turn.
    wait_status(&db, blocked.id, task_status::RUNNING).await;
    runner.release(1);
    wait_status(&db, blocked.id, task_status::APPLY_PENDING).await;
}

#[tokio::test]
async fn test_discard_plan() {
    let (db, runner, queue) = setup(3);
    let ws = workspace(&db, "app");
    let task = queue.enqueue(&ws, task_type::PLAN_AND_APPLY, "", None).unwrap();

    let err = queue.discard_plan(task.id, "alice").unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    runner.release(1);
    wait_status(&db, task.id, task_status::APPLY_PENDING).await;
    let discarded = queue.discard_plan(task.id, "alice").unwrap();
    assert_eq!(discarded.status, task_status::CANCELLED);
    assert_eq!(discarded.error_message.as_deref(), Some("Plan discarded by alice"));
}

#[tokio::test]
async fn test_requeued_task_waits_for_delay() {
    let (db, runner, queue) = setup(3);
    let ws = workspace(&db, "app");
    let task = queue
        .submit(&NewTask {
            workspace_id: ws.clone(),
            task_type: task_type::PLAN.to_string(),
            description: "flaky".to_string(),
            max_retries: 2,
            ..Default::default()
        })
        .unwrap();
    runner.release(1);
    let requeued = wait_status(&db, task.id, task_status::PENDING).await;
    assert_eq!(requeued.retry_count, 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(queue.running_count(), 0);
    assert_eq!(queue.fill_capacity().unwrap(), 0);
    assert_eq!(db.get_task(task.id).unwrap().status, task_status::PENDING);
}

#[tokio::test]
async fn test_completion_hooks_see_settled_tasks() {
    let (db, runner, queue) = setup(3);
    let hook = Arc::new(RecordingHook::default());
    queue.add_hook(hook.clone());
    let ws = workspace(&db, "app");

    let task = queue.enqueue(&ws, task_type::DRIFT_CHECK, "", None).unwrap();
    runner.release(1);
    wait_status(&db, task.id, task_status::SUCCESS).await;
    for _ in 0..100 {
        if !hook.seen.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(
        hook.seen.lock().unwrap().clone(),
        vec![(task.id, task_status::SUCCESS.to_string())]
    );
}

#[tokio::test]
async fn test_recover_settles_orphans() {
    let (db, _runner, queue) = setup(3);
    let ws_a = workspace(&db, "a");
    let ws_b = workspace(&db, "b");
    let ws_c = workspace(&db, "c");

    let new = |ws: &str, kind: &str, description: &str| NewTask {
        workspace_id: ws.to_string(),
        task_type: kind.to_string(),
        description: description.to_string(),
        ..Default::default()
    };

    // Killed mid-apply while holding the workspace lock.
    let orphan = db.insert_task(&new(&ws_a, task_type::APPLY, "")).unwrap();
    assert!(db.claim_task(orphan.id, task_status::PENDING).unwrap());
    db.lock_workspace(&ws_a, &lock_holder(orphan.id), "apply").unwrap();

    // Killed while re-dispatched from apply_pending.
    let parked = db.insert_task(&new(&ws_b, task_type::PLAN_AND_APPLY, "")).unwrap();
    db.park_apply_pending(parked.id).unwrap();
    assert!(db.claim_task(parked.id, task_status::APPLY_PENDING).unwrap());

    let triggered = db
        .insert_task(&new(&ws_c, task_type::PLAN_AND_APPLY, "Triggered by workspace ws-x (task #1)"))
        .unwrap();

    let report = queue.recover().unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.reverted, 1);
    assert_eq!(report.locks_released, 1);
    assert_eq!(report.trigger_tasks_cancelled, 1);
    assert_eq!(report.dispatched, 0);

    let orphan = db.get_task(orphan.id).unwrap();
    assert_eq!(orphan.status, task_status::FAILED);
    assert!(orphan.error_message.unwrap().contains("orphaned"));
    assert!(!db.is_workspace_locked(&ws_a).unwrap());
    assert_eq!(db.get_task(parked.id).unwrap().status, task_status::APPLY_PENDING);
    assert_eq!(db.get_task(triggered.id).unwrap().status, task_status::CANCELLED);

    let counts = queue.filter_counts(None).unwrap();
    let count = |f: TaskFilter| counts.iter().find(|(k, _)| *k == f).map(|(_, n)| *n).unwrap();
    assert_eq!(count(TaskFilter::NeedsAttention), 1);
    assert_eq!(count(TaskFilter::Errored), 1);
    assert_eq!(count(TaskFilter::Cancelled), 1);
    assert_eq!(count(TaskFilter::All), 3);
}

#[tokio::test]
async fn test_shutdown_cancels_running_work() {
    let (db, _runner, queue) = setup(3);
    let ws = workspace(&db, "app");
    let task = queue.enqueue(&ws, task_type::PLAN, "", None).unwrap();
    let queued = queue.enqueue(&ws, task_type::PLAN, "", None).unwrap();

    assert!(queue.shutdown(Duration::from_secs(5)).await);
    assert!(queue.is_shutting_down());
    assert_eq!(db.get_task(task.id).unwrap().status, task_status::CANCELLED);
    // Nothing new starts once shutdown began.
    assert_eq!(db.get_task(queued.id).unwrap().status, task_status::PENDING);
}
