use std::sync::Arc;

use iacore::db::models::{execution_status, task_status, task_type, NewWorkspace, Task};
use iacore::db::tasks::NewTask;
use iacore::db::Database;
use iacore::queue::CompletionHook;
use iacore::triggers::RunTriggerService;
use iacore::Error;
use serde_json::json;

fn setup() -> (Arc<Database>, RunTriggerService) {
    let db = Arc::new(Database::open_memory().unwrap());
    let service = RunTriggerService::new(db.clone());
    (db, service)
}

fn workspace(db: &Database, name: &str, with_provider: bool) -> String {
    let ws = db.create_workspace(&NewWorkspace::named(name)).unwrap();
    if with_provider {
        db.set_provider_config(
            &ws.workspace_id,
            Some(&json!({"aws": [{"region": "us-east-1"}]})),
        )
        .unwrap();
    }
    ws.workspace_id
}

/// A task of `kind` on `ws` that ended in `status`.
fn settled_task(db: &Database, ws: &str, kind: &str, status: &str) -> Task {
    let task = db
        .insert_task(&NewTask {
            workspace_id: ws.to_string(),
            task_type: kind.to_string(),
            created_by: Some("alice".to_string()),
            ..Default::default()
        })
        .unwrap();
    assert!(db.claim_task(task.id, task_status::PENDING).unwrap());
    if status == task_status::APPLY_PENDING {
        db.park_apply_pending(task.id).unwrap();
    } else {
        db.finish_task(task.id, status, None).unwrap();
    }
    db.get_task(task.id).unwrap()
}

#[test]
fn test_create_trigger_rules() {
    let (db, service) = setup();
    let a = workspace(&db, "a", true);
    let b = workspace(&db, "b", true);
    let c = workspace(&db, "c", true);

    let err = service.create_trigger(&a, &a, None).unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let ab = service.create_trigger(&a, &b, Some("alice")).unwrap();
    assert!(ab.enabled);
    assert_eq!(ab.trigger_condition, "apply_success");

    let err = service.create_trigger(&a, &b, None).unwrap_err();
    assert!(matches!(err, Error::Conflict(ref m) if m.contains("already exists")));

    service.create_trigger(&b, &c, None).unwrap();
    let err = service.create_trigger(&c, &a, None).unwrap_err();
    assert!(matches!(err, Error::Conflict(ref m) if m.contains("circular")));

    assert!(matches!(
        service.create_trigger(&a, "ws-missing", None).unwrap_err(),
        Error::NotFound { .. }
    ));
}

#[test]
fn test_enabling_rechecks_cycles() {
    let (db, service) = setup();
    let a = workspace(&db, "a", true);
    let b = workspace(&db, "b", true);

    let ab = service.create_trigger(&a, &b, None).unwrap();
    service.update_trigger(ab.id, false).unwrap();
    // With a -> b disabled, b -> a is allowed.
    let ba = service.create_trigger(&b, &a, None).unwrap();

    let err = service.update_trigger(ab.id, true).unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    service.delete_trigger(ba.id).unwrap();
    assert!(service.update_trigger(ab.id, true).unwrap().enabled);
    assert!(matches!(
        service.delete_trigger(ba.id).unwrap_err(),
        Error::NotFound { .. }
    ));
}

#[test]
fn test_listing_and_available_targets() {
    let (db, service) = setup();
    let a = workspace(&db, "a", true);
    let b = workspace(&db, "b", true);
    let c = workspace(&db, "c", true);
    service.create_trigger(&a, &b, None).unwrap();
    service.create_trigger(&b, &c, None).unwrap();

    assert_eq!(service.list_by_source(&a).unwrap().len(), 1);
    assert_eq!(service.list_by_target(&c).unwrap().len(), 1);

    let available: Vec<String> = service
        .available_targets(&c)
        .unwrap()
        .into_iter()
        .map(|w| w.workspace_id)
        .collect();
    // c -> a and c -> b would both close a cycle.
    assert!(available.is_empty());

    let available: Vec<String> = service
        .available_targets(&a)
        .unwrap()
        .into_iter()
        .map(|w| w.workspace_id)
        .collect();
    assert_eq!(available, vec![c.clone()]);
}

#[test]
fn test_execute_creates_downstream_tasks() {
    let (db, service) = setup();
    let a = workspace(&db, "a", true);
    let b = workspace(&db, "b", true);
    let no_provider = workspace(&db, "bare", false);
    let locked = workspace(&db, "locked", true);
    db.lock_workspace(&locked, "bob", "maintenance").unwrap();
    service.create_trigger(&a, &b, None).unwrap();
    service.create_trigger(&a, &no_provider, None).unwrap();
    service.create_trigger(&a, &locked, None).unwrap();

    let source = settled_task(&db, &a, task_type::PLAN_AND_APPLY, task_status::APPLIED);
    let targets = service.execute(&source).unwrap();
    assert_eq!(targets, vec![b.clone()]);

    let executions = service.list_executions(source.id).unwrap();
    assert_eq!(executions.len(), 3);
    let triggered = &executions[0];
    assert_eq!(triggered.status, execution_status::TRIGGERED);
    let downstream = db.get_task(triggered.target_task_id.unwrap()).unwrap();
    assert_eq!(downstream.workspace_id, b);
    assert_eq!(downstream.task_type, task_type::PLAN_AND_APPLY);
    assert_eq!(
        downstream.description,
        format!("Triggered by workspace {} (task #{})", a, source.id)
    );
    assert_eq!(downstream.created_by.as_deref(), Some("alice"));

    assert_eq!(executions[1].status, execution_status::FAILED);
    assert_eq!(
        executions[1].error_message.as_deref(),
        Some("target workspace has no provider configuration")
    );
    assert_eq!(executions[2].status, execution_status::FAILED);
    assert_eq!(executions[2].error_message.as_deref(), Some("target workspace is locked"));

    // Executions only fire once.
    assert!(service.execute(&source).unwrap().is_empty());
    assert_eq!(service.list_executions(source.id).unwrap().len(), 3);
}

#[test]
fn test_non_apply_tasks_fire_nothing() {
    let (db, service) = setup();
    let a = workspace(&db, "a", true);
    let b = workspace(&db, "b", true);
    service.create_trigger(&a, &b, None).unwrap();

    let plan = settled_task(&db, &a, task_type::PLAN, task_status::SUCCESS);
    assert!(service.execute(&plan).unwrap().is_empty());
    let failed = settled_task(&db, &a, task_type::PLAN_AND_APPLY, task_status::FAILED);
    assert!(service.execute(&failed).unwrap().is_empty());
    assert!(service.list_executions(failed.id).unwrap().is_empty());
}

#[test]
fn test_parked_task_prepares_reviewable_executions() {
    let (db, service) = setup();
    let a = workspace(&db, "a", true);
    let b = workspace(&db, "b", true);
    let c = workspace(&db, "c", true);
    service.create_trigger(&a, &b, None).unwrap();
    service.create_trigger(&a, &c, None).unwrap();

    let parked = settled_task(&db, &a, task_type::PLAN_AND_APPLY, task_status::APPLY_PENDING);
    assert!(service.on_complete(&parked).is_empty());
    let executions = service.list_executions(parked.id).unwrap();
    assert_eq!(executions.len(), 2);
    assert!(executions.iter().all(|e| e.status == execution_status::PENDING));

    // Preparing again does not duplicate rows.
    assert_eq!(service.prepare_executions(&parked).unwrap().len(), 2);
    assert_eq!(service.list_executions(parked.id).unwrap().len(), 2);

    let toggled = service.toggle_execution(executions[1].id, true, "alice").unwrap();
    assert!(toggled.temporarily_disabled);
    assert_eq!(toggled.disabled_by.as_deref(), Some("alice"));

    // The task is confirmed and applied.
    db.confirm_apply(parked.id, "bob").unwrap();
    assert!(db.claim_task(parked.id, task_status::APPLY_PENDING).unwrap());
    db.finish_task(parked.id, task_status::APPLIED, None).unwrap();
    let applied = db.get_task(parked.id).unwrap();

    let targets = service.on_complete(&applied);
    assert_eq!(targets, vec![b.clone()]);
    let executions = service.list_executions(parked.id).unwrap();
    assert_eq!(executions[0].status, execution_status::TRIGGERED);
    assert_eq!(executions[1].status, execution_status::SKIPPED);

    let downstream = db.get_task(executions[0].target_task_id.unwrap()).unwrap();
    assert_eq!(downstream.created_by.as_deref(), Some("bob"));

    let err = service.toggle_execution(executions[1].id, false, "alice").unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
}

#[test]
fn test_auto_apply_targets() {
    let (db, service) = setup();
    let a = workspace(&db, "a", true);
    let b = workspace(&db, "b", true);
    let mut auto = NewWorkspace::named("auto");
    auto.auto_apply = true;
    let auto = db.create_workspace(&auto).unwrap().workspace_id;
    service.create_trigger(&a, &b, None).unwrap();
    service.create_trigger(&a, &auto, None).unwrap();

    let targets: Vec<String> = service
        .auto_apply_targets(&a)
        .unwrap()
        .into_iter()
        .map(|w| w.workspace_id)
        .collect();
    assert_eq!(targets, vec![auto]);
}
