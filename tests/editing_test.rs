use std::sync::Arc;

use chrono::{Duration, Utc};
use iacore::db::models::{drift_status, takeover_status, NewWorkspace};
use iacore::db::{timestamp, Database};
use iacore::editing::EditingService;
use iacore::Error;
use rusqlite::params;
use serde_json::json;

fn setup() -> (Arc<Database>, EditingService, i64) {
    let db = Arc::new(Database::open_memory().unwrap());
    let ws = db.create_workspace(&NewWorkspace::named("app")).unwrap();
    let resource = db.create_workspace_resource(&ws.workspace_id, "aws_vpc.main").unwrap();
    db.upsert_user("u-alice", "alice").unwrap();
    db.upsert_user("u-bob", "bob").unwrap();
    let service = EditingService::new(db.clone());
    (db, service, resource.id)
}

fn backdate(db: &Database, sql: &str, seconds: i64) {
    let at = timestamp(Utc::now() - Duration::seconds(seconds));
    db.conn().unwrap().execute(sql, params![at]).unwrap();
}

#[test]
fn test_start_editing_reports_other_editors() {
    let (_db, service, rid) = setup();
    let first = service.start_editing(rid, "u-alice", "s-1").unwrap();
    assert!(first.other_editors.is_empty());
    assert!(first.drift.is_none());

    let second = service.start_editing(rid, "u-bob", "s-2").unwrap();
    assert_eq!(second.other_editors.len(), 1);
    let other = &second.other_editors[0];
    assert_eq!(other.user_name, "alice");
    assert!(!other.is_same_user);
    assert!(!other.is_current_session);

    let status = service.editing_status(rid, "u-alice", "s-1").unwrap();
    assert!(status.is_locked);
    assert_eq!(status.editors.len(), 2);
    assert_eq!(status.current_version, 1);
}

#[test]
fn test_heartbeat_requires_lock() {
    let (_db, service, rid) = setup();
    let err = service.heartbeat(rid, "u-alice", "s-1").unwrap_err();
    assert!(matches!(err, Error::NotEditing { resource_id, .. } if resource_id == rid));

    service.start_editing(rid, "u-alice", "s-1").unwrap();
    service.heartbeat(rid, "u-alice", "s-1").unwrap();
    service.end_editing(rid, "u-alice", "s-1").unwrap();
    assert!(service.heartbeat(rid, "u-alice", "s-1").is_err());
    assert!(!service.editing_status(rid, "u-alice", "s-1").unwrap().is_locked);
}

#[test]
fn test_stale_locks_are_dropped() {
    let (db, service, rid) = setup();
    service.start_editing(rid, "u-alice", "s-1").unwrap();
    backdate(&db, "UPDATE resource_locks SET last_heartbeat = ?1", 120);

    let status = service.editing_status(rid, "u-bob", "s-2").unwrap();
    assert!(!status.is_locked);

    service.start_editing(rid, "u-alice", "s-1").unwrap();
    backdate(&db, "UPDATE resource_locks SET last_heartbeat = ?1", 120);
    assert_eq!(service.cleanup_expired_locks().unwrap(), 1);
}

#[test]
fn test_draft_conflict_after_new_revision() {
    let (db, service, rid) = setup();
    service.start_editing(rid, "u-alice", "s-1").unwrap();
    let draft = service
        .save_drift(rid, "u-alice", "s-1", &json!({"cidr_block": "10.1.0.0/16"}))
        .unwrap();
    assert_eq!(draft.base_version, 1);
    assert_eq!(draft.status, drift_status::ACTIVE);

    let (_, conflict) = service.get_drift(rid, "u-alice", "s-1").unwrap().unwrap();
    assert!(!conflict);

    db.bump_resource_version(rid).unwrap();
    let (draft, conflict) = service.get_drift(rid, "u-alice", "s-1").unwrap().unwrap();
    assert!(conflict);
    assert_eq!(draft.content["cidr_block"], "10.1.0.0/16");

    // A new session of the same user sees the unfinished draft.
    let resumed = service.start_editing(rid, "u-alice", "s-9").unwrap();
    assert!(resumed.drift.is_some());
    assert!(resumed.version_conflict);

    service.delete_drift(rid, "u-alice", "s-1").unwrap();
    assert!(service.get_drift(rid, "u-alice", "s-1").unwrap().is_none());
}

#[test]
fn test_takeover_approved_moves_lock_and_draft() {
    let (_db, service, rid) = setup();
    service.start_editing(rid, "u-alice", "s-old").unwrap();
    service
        .save_drift(rid, "u-alice", "s-old", &json!({"name": "draft"}))
        .unwrap();
    service.start_editing(rid, "u-alice", "s-new").unwrap();

    let request = service
        .request_takeover(rid, "u-alice", "s-new", "s-old")
        .unwrap();
    assert!(request.is_same_user);
    assert_eq!(request.requester_name, "alice");
    assert_eq!(service.pending_requests("s-old").unwrap().len(), 1);

    let answered = service.respond_to_takeover(request.id, true).unwrap();
    assert_eq!(answered.status, takeover_status::APPROVED);

    let status = service.editing_status(rid, "u-alice", "s-new").unwrap();
    assert_eq!(status.editors.len(), 1);
    assert_eq!(status.editors[0].session_id, "s-new");

    assert!(service.get_drift(rid, "u-alice", "s-old").unwrap().is_none());
    let (moved, _) = service.get_drift(rid, "u-alice", "s-new").unwrap().unwrap();
    assert_eq!(moved.content["name"], "draft");

    let err = service.respond_to_takeover(request.id, false).unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
}

#[test]
fn test_takeover_rejected_keeps_lock() {
    let (_db, service, rid) = setup();
    service.start_editing(rid, "u-alice", "s-1").unwrap();
    service.start_editing(rid, "u-bob", "s-2").unwrap();
    let request = service.request_takeover(rid, "u-bob", "s-2", "s-1").unwrap();
    assert!(!request.is_same_user);

    let answered = service.respond_to_takeover(request.id, false).unwrap();
    assert_eq!(answered.status, takeover_status::REJECTED);
    let status = service.editing_status(rid, "u-alice", "s-1").unwrap();
    assert_eq!(status.editors.len(), 2);
}

#[test]
fn test_failed_handover_leaves_request_pending() {
    let (db, service, rid) = setup();
    service.start_editing(rid, "u-alice", "s-1").unwrap();
    service.start_editing(rid, "u-bob", "s-2").unwrap();
    let request = service.request_takeover(rid, "u-bob", "s-2", "s-1").unwrap();
    db.conn()
        .unwrap()
        .execute_batch(
            "CREATE TRIGGER reject_lock BEFORE INSERT ON resource_locks
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        )
        .unwrap();

    assert!(service.respond_to_takeover(request.id, true).is_err());
    let request = service.get_request(request.id).unwrap();
    assert_eq!(request.status, takeover_status::PENDING);
    let status = service.editing_status(rid, "u-alice", "s-1").unwrap();
    assert_eq!(status.editors.len(), 2);

    db.conn()
        .unwrap()
        .execute_batch("DROP TRIGGER reject_lock;")
        .unwrap();
    let answered = service.respond_to_takeover(request.id, true).unwrap();
    assert_eq!(answered.status, takeover_status::APPROVED);
}

#[test]
fn test_takeover_of_unknown_session() {
    let (_db, service, rid) = setup();
    let err = service
        .request_takeover(rid, "u-bob", "s-2", "s-nobody")
        .unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }));
}

#[test]
fn test_expired_request_approves_implicitly() {
    let (db, service, rid) = setup();
    service.start_editing(rid, "u-alice", "s-1").unwrap();
    let request = service.request_takeover(rid, "u-bob", "s-2", "s-1").unwrap();
    backdate(&db, "UPDATE takeover_requests SET expires_at = ?1", 5);

    assert!(service.pending_requests("s-1").unwrap().is_empty());
    let settled = service.takeover_status(request.id).unwrap();
    assert_eq!(settled.status, takeover_status::APPROVED);

    let status = service.editing_status(rid, "u-bob", "s-2").unwrap();
    assert_eq!(status.editors.len(), 1);
    assert!(status.editors[0].is_current_session);
}

#[test]
fn test_late_answer_to_expired_request() {
    let (db, service, rid) = setup();
    service.start_editing(rid, "u-alice", "s-1").unwrap();
    let request = service.request_takeover(rid, "u-bob", "s-2", "s-1").unwrap();
    backdate(&db, "UPDATE takeover_requests SET expires_at = ?1", 5);

    let err = service.respond_to_takeover(request.id, false).unwrap_err();
    assert!(matches!(err, Error::Conflict(ref msg) if msg.contains("expired")));
    assert_eq!(
        service.get_request(request.id).unwrap().status,
        takeover_status::APPROVED
    );
}

#[test]
fn test_sweep_prunes_history() {
    let (db, service, rid) = setup();
    service.start_editing(rid, "u-alice", "s-1").unwrap();
    service.request_takeover(rid, "u-bob", "s-2", "s-1").unwrap();
    backdate(&db, "UPDATE takeover_requests SET expires_at = ?1", 5);

    let sweep = service.sweep().unwrap();
    assert_eq!(sweep.requests_expired, 1);
    assert_eq!(sweep.requests_pruned, 0);

    backdate(&db, "UPDATE takeover_requests SET created_at = ?1", 8 * 24 * 3600);
    service
        .save_drift(rid, "u-alice", "s-1", &json!({"x": 1}))
        .unwrap();
    db.conn()
        .unwrap()
        .execute(
            "UPDATE resource_drifts SET status = 'expired'",
            params![],
        )
        .unwrap();
    backdate(&db, "UPDATE resource_drifts SET updated_at = ?1", 8 * 24 * 3600);

    let sweep = service.sweep().unwrap();
    assert_eq!(sweep.requests_pruned, 1);
    assert_eq!(sweep.drafts, 1);
}
