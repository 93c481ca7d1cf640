use std::sync::Arc;

use iacore::db::models::NewWorkspace;
use iacore::db::Database;
use iacore::index::{ResourceIndexer, SearchFilter, TreeNodeKind};
use iacore::state::StateManager;
use iacore::Error;
use serde_json::json;
use tempfile::TempDir;

fn setup() -> (TempDir, Arc<Database>, String) {
    let dir = TempDir::new().unwrap();
    let db = Arc::new(Database::open(&dir.path().join("iacore.db")).unwrap());
    let ws = db.create_workspace(&NewWorkspace::named("network")).unwrap();
    (dir, db, ws.workspace_id)
}

fn state_json(lineage: &str, serial: i64, vpc_id: &str) -> String {
    json!({
        "version": 4,
        "terraform_version": "1.5.7",
        "lineage": lineage,
        "serial": serial,
        "outputs": {},
        "resources": [
            {
                "mode": "managed",
                "type": "aws_vpc",
                "name": "main",
                "provider": "provider[\"registry.terraform.io/hashicorp/aws\"]",
                "instances": [{
                    "attributes": {
                        "id": vpc_id,
                        "arn": format!("arn:aws:ec2:us-east-1:123456789012:vpc/{}", vpc_id),
                        "cidr_block": "10.0.0.0/16",
                        "tags": {"Name": "main-vpc"}
                    }
                }]
            },
            {
                "mode": "managed",
                "module": "module.app",
                "type": "aws_subnet",
                "name": "private",
                "provider": "provider[\"registry.terraform.io/hashicorp/aws\"]",
                "instances": [
                    {"index_key": 0, "attributes": {"id": "subnet-aaa", "availability_zone": "us-east-1a"}},
                    {"index_key": 1, "attributes": {"id": "subnet-bbb", "availability_zone": "us-east-1b"}}
                ]
            },
            {
                "mode": "data",
                "type": "aws_ami",
                "name": "ubuntu",
                "instances": [{"attributes": {"id": "ami-123", "name": "ubuntu-jammy"}}]
            }
        ]
    })
    .to_string()
}

#[test]
fn test_first_upload_skips_validation() {
    let (_dir, db, ws) = setup();
    let manager = StateManager::new(db.clone());

    let v = manager
        .upload_state(&ws, &state_json("lin-a", 3, "vpc-1"), Some("alice"), false, "initial")
        .unwrap();
    assert_eq!(v.version, 1);
    assert_eq!(v.serial, 3);
    assert_eq!(v.lineage, "lin-a");
    assert!(v.is_imported);
    assert!(!db.is_workspace_locked(&ws).unwrap());
}

#[test]
fn test_upload_requires_lineage_and_serial() {
    let (_dir, db, ws) = setup();
    let manager = StateManager::new(db);

    let err = manager
        .upload_state(&ws, r#"{"serial": 1}"#, None, false, "")
        .unwrap_err();
    assert!(err.to_string().contains("lineage"));

    let err = manager
        .upload_state(&ws, r#"{"lineage": "x"}"#, None, false, "")
        .unwrap_err();
    assert!(err.to_string().contains("serial"));

    let err = manager.upload_state(&ws, "not json", None, false, "").unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[test]
fn test_upload_rejects_lineage_mismatch_and_stale_serial() {
    let (_dir, db, ws) = setup();
    let manager = StateManager::new(db.clone());
    manager
        .upload_state(&ws, &state_json("lin-a", 5, "vpc-1"), None, false, "")
        .unwrap();

    let err = manager
        .upload_state(&ws, &state_json("lin-b", 6, "vpc-1"), None, false, "")
        .unwrap_err();
    assert!(matches!(err, Error::LineageMismatch { .. }));

    let err = manager
        .upload_state(&ws, &state_json("lin-a", 5, "vpc-1"), None, false, "")
        .unwrap_err();
    assert!(matches!(err, Error::SerialNotAscending { current: 5, proposed: 5 }));

    // Failed validation must not leave the workspace locked.
    assert!(!db.is_workspace_locked(&ws).unwrap());
    assert_eq!(manager.list(&ws, 10, 0).unwrap().len(), 1);
}

#[test]
fn test_force_upload_keeps_lock() {
    let (_dir, db, ws) = setup();
    let manager = StateManager::new(db.clone());
    manager
        .upload_state(&ws, &state_json("lin-a", 5, "vpc-1"), None, false, "")
        .unwrap();

    let v = manager
        .upload_state(&ws, &state_json("lin-b", 1, "vpc-2"), Some("bob"), true, "forced")
        .unwrap();
    assert_eq!(v.version, 2);

    let workspace = db.get_workspace(&ws).unwrap();
    assert!(workspace.is_locked);
    assert!(workspace.lock_reason.contains("force upload"));
}

#[test]
fn test_upload_rejected_while_locked() {
    let (_dir, db, ws) = setup();
    let manager = StateManager::new(db.clone());
    db.lock_workspace(&ws, "task:9", "apply running").unwrap();

    let err = manager
        .upload_state(&ws, &state_json("lin-a", 1, "vpc-1"), Some("alice"), false, "")
        .unwrap_err();
    assert!(matches!(err, Error::LockHeldByOther { .. }));
}

#[test]
fn test_rollback_appends_new_version() {
    let (_dir, db, ws) = setup();
    let manager = StateManager::new(db.clone());
    manager
        .upload_state(&ws, &state_json("lin-a", 1, "vpc-1"), None, false, "")
        .unwrap();
    manager
        .upload_state(&ws, &state_json("lin-a", 2, "vpc-2"), None, false, "")
        .unwrap();

    // Target serial 1 is not above current serial 2.
    let err = manager.rollback_to(&ws, 1, Some("alice"), "bad deploy", false).unwrap_err();
    assert!(matches!(err, Error::ForceRequired(_)));
    assert!(!db.is_workspace_locked(&ws).unwrap());

    let restored = manager.rollback_to(&ws, 1, Some("alice"), "bad deploy", true).unwrap();
    assert_eq!(restored.version, 3);
    assert_eq!(restored.serial, 3);
    assert!(restored.is_rollback);
    assert_eq!(restored.rollback_from_version, Some(1));
    assert!(restored.description.contains("bad deploy"));

    let latest = manager.get_latest(&ws).unwrap().unwrap();
    assert_eq!(latest.version, 3);
    assert!(latest.content.unwrap().contains("vpc-1"));

    let err = manager.rollback_to(&ws, 42, None, "", true).unwrap_err();
    assert!(matches!(err, Error::VersionNotFound(42)));
}

#[test]
fn test_guard_messages_name_both_sides() {
    let (_dir, db, ws) = setup();
    let manager = StateManager::new(db);
    manager
        .upload_state(&ws, &state_json("L1", 10, "vpc-1"), None, false, "")
        .unwrap();

    let err = manager
        .upload_state(&ws, r#"{"lineage":"L2","serial":11,"resources":[]}"#, None, false, "")
        .unwrap_err();
    assert!(err.to_string().starts_with("lineage mismatch: expected L1, got L2"));

    let err = manager
        .upload_state(&ws, r#"{"lineage":"L1","serial":10,"resources":[]}"#, None, false, "")
        .unwrap_err();
    assert!(err
        .to_string()
        .starts_with("serial must be greater than current (10), got 10"));
    assert_eq!(manager.list(&ws, 10, 0).unwrap().len(), 1);
}

#[test]
fn test_force_upload_accepts_missing_lineage() {
    let (_dir, db, ws) = setup();
    let manager = StateManager::new(db);
    manager
        .upload_state(&ws, &state_json("lin-a", 5, "vpc-1"), None, false, "")
        .unwrap();

    let v = manager
        .upload_state(&ws, r#"{"serial":1,"resources":[]}"#, Some("bob"), true, "recovery")
        .unwrap();
    assert_eq!(v.version, 2);
    assert_eq!(v.serial, 1);
    assert_eq!(v.lineage, "");
}

#[test]
fn test_forced_rollback_serial_stays_monotonic() {
    let (_dir, db, ws) = setup();
    let manager = StateManager::new(db);
    for serial in 10..=14 {
        manager
            .upload_state(&ws, &state_json("lin-a", serial, "vpc-1"), None, false, "")
            .unwrap();
    }

    let restored = manager.rollback_to(&ws, 2, Some("alice"), "", true).unwrap();
    assert_eq!(restored.version, 6);
    assert_eq!(restored.serial, 15);
    assert!(restored.is_rollback);
    assert_eq!(restored.rollback_from_version, Some(2));
}

#[test]
fn test_list_is_newest_first() {
    let (_dir, db, ws) = setup();
    let manager = StateManager::new(db);
    for serial in 1..=4 {
        manager
            .upload_state(&ws, &state_json("lin-a", serial, "vpc-1"), None, false, "")
            .unwrap();
    }
    let page = manager.list(&ws, 2, 0).unwrap();
    let versions: Vec<i64> = page.iter().map(|v| v.version).collect();
    assert_eq!(versions, vec![4, 3]);
    let page = manager.list(&ws, 2, 2).unwrap();
    let versions: Vec<i64> = page.iter().map(|v| v.version).collect();
    assert_eq!(versions, vec![2, 1]);
}

// ─── Index ───────────────────────────────────────────────────────────────────

#[test]
fn test_upload_reindexes_workspace() {
    let (_dir, db, ws) = setup();
    let indexer = Arc::new(ResourceIndexer::new(db.clone()));
    let manager = StateManager::new(db.clone()).with_indexer(indexer.clone());

    manager
        .upload_state(&ws, &state_json("lin-a", 1, "vpc-1"), None, false, "")
        .unwrap();
    let resources = indexer.list_resources(&ws).unwrap();
    assert_eq!(resources.len(), 4);

    let vpc = indexer.get_resource(&ws, "aws_vpc.main").unwrap();
    assert_eq!(vpc.cloud_resource_id.as_deref(), Some("vpc-1"));
    assert_eq!(vpc.cloud_resource_name.as_deref(), Some("main-vpc"));
    assert_eq!(vpc.cloud_region.as_deref(), Some("us-east-1"));

    let subnet = indexer.get_resource(&ws, "module.app.aws_subnet.private[1]").unwrap();
    assert_eq!(subnet.module_path, "module.app");
    assert_eq!(subnet.root_module_name, "app");
}

#[test]
fn test_resync_updates_and_deletes_rows() {
    let (_dir, db, ws) = setup();
    let indexer = Arc::new(ResourceIndexer::new(db.clone()));
    let manager = StateManager::new(db.clone()).with_indexer(indexer.clone());
    manager
        .upload_state(&ws, &state_json("lin-a", 1, "vpc-1"), None, false, "")
        .unwrap();
    let before = indexer.get_resource(&ws, "aws_vpc.main").unwrap();

    let smaller = json!({
        "lineage": "lin-a",
        "serial": 2,
        "resources": [{
            "mode": "managed", "type": "aws_vpc", "name": "main",
            "instances": [{"attributes": {"id": "vpc-9"}}]
        }]
    })
    .to_string();
    manager.upload_state(&ws, &smaller, None, false, "").unwrap();

    let report = indexer.sync(&ws).unwrap();
    assert_eq!(report.inserted, 0);
    assert_eq!(report.updated, 1);

    let after = indexer.get_resource(&ws, "aws_vpc.main").unwrap();
    assert_eq!(after.id, before.id);
    assert_eq!(after.cloud_resource_id.as_deref(), Some("vpc-9"));
    assert_eq!(indexer.list_resources(&ws).unwrap().len(), 1);
    assert!(indexer.modules(&ws).unwrap().is_empty());
}

#[test]
fn test_resync_keeps_existing_embedding() {
    let (_dir, db, ws) = setup();
    let indexer = Arc::new(ResourceIndexer::new(db.clone()));
    let manager = StateManager::new(db.clone()).with_indexer(indexer.clone());
    manager
        .upload_state(&ws, &state_json("lin-a", 1, "vpc-1"), None, false, "")
        .unwrap();

    let vector: Vec<u8> = vec![0, 0, 128, 63, 0, 0, 0, 64];
    let embedded_at = "2026-01-02T03:04:05.000006Z";
    db.conn()
        .unwrap()
        .execute(
            "UPDATE resource_index SET embedding = ?1, embedding_updated_at = ?2
             WHERE workspace_id = ?3 AND terraform_address = 'aws_vpc.main'",
            rusqlite::params![vector, embedded_at, ws],
        )
        .unwrap();

    let retagged = state_json("lin-a", 2, "vpc-1").replace("main-vpc", "core-vpc");
    manager.upload_state(&ws, &retagged, None, false, "").unwrap();

    let vpc = indexer.get_resource(&ws, "aws_vpc.main").unwrap();
    assert_eq!(vpc.tags.unwrap()["Name"], "core-vpc");
    assert_eq!(vpc.embedding, Some(vector));
    assert_eq!(vpc.embedding_updated_at.as_deref(), Some(embedded_at));
}

#[test]
fn test_sync_skips_malformed_entries() {
    let (_dir, db, ws) = setup();
    let indexer = ResourceIndexer::new(db.clone());
    let manager = StateManager::new(db);
    let body = json!({
        "lineage": "lin-a",
        "serial": 1,
        "resources": [
            {"mode": "managed", "name": "no_type", "instances": []},
            {"mode": "managed", "type": "aws_vpc", "name": "ok", "instances": [{"attributes": {"id": "vpc-1"}}]}
        ]
    })
    .to_string();
    manager.upload_state(&ws, &body, None, false, "").unwrap();

    let report = indexer.sync(&ws).unwrap();
    assert_eq!(report.skipped, 1);
    assert_eq!(report.inserted, 1);
}

#[test]
fn test_sync_without_state_is_noop() {
    let (_dir, db, ws) = setup();
    let indexer = ResourceIndexer::new(db);
    let report = indexer.sync(&ws).unwrap();
    assert_eq!(report.inserted, 0);
    assert_eq!(report.modules, 0);
}

#[test]
fn test_search_ranks_exact_id_first() {
    let (_dir, db, ws) = setup();
    let indexer = Arc::new(ResourceIndexer::new(db.clone()));
    let manager = StateManager::new(db.clone()).with_indexer(indexer.clone());
    manager
        .upload_state(&ws, &state_json("lin-a", 1, "vpc-1"), None, false, "")
        .unwrap();

    let hits = indexer.search("vpc-1", &SearchFilter::default()).unwrap();
    assert!(!hits.is_empty());
    assert_eq!(hits[0].terraform_address.as_deref(), Some("aws_vpc.main"));
    assert_eq!(hits[0].match_rank, 1.0);
    assert_eq!(hits[0].workspace_name.as_deref(), Some("network"));

    // Data sources are never returned.
    assert!(indexer.search("ami-123", &SearchFilter::default()).unwrap().is_empty());

    let hits = indexer
        .search(
            "subnet",
            &SearchFilter {
                resource_type: Some("aws_subnet".into()),
                limit: Some(1),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].resource_type, "aws_subnet");

    assert!(indexer.search("   ", &SearchFilter::default()).unwrap().is_empty());
}

#[test]
fn test_external_rows_survive_resync_and_sort_after_state_rows() {
    let (_dir, db, ws) = setup();
    let indexer = Arc::new(ResourceIndexer::new(db.clone()));
    let manager = StateManager::new(db.clone()).with_indexer(indexer.clone());
    manager
        .upload_state(&ws, &state_json("lin-a", 1, "vpc-1"), None, false, "")
        .unwrap();

    let attrs = json!({"id": "vpc-1", "name": "cmdb-vpc", "region": "us-east-1"});
    let first = indexer
        .upsert_external(&ws, "cmdb", "vpc-1", "aws_vpc", &attrs)
        .unwrap();
    let again = indexer
        .upsert_external(&ws, "cmdb", "vpc-1", "aws_vpc", &attrs)
        .unwrap();
    assert_eq!(first, again);

    manager
        .upload_state(&ws, &state_json("lin-a", 2, "vpc-1"), None, false, "")
        .unwrap();

    let hits = indexer.search("vpc-1", &SearchFilter::default()).unwrap();
    let sources: Vec<&str> = hits.iter().map(|h| h.source_type.as_str()).collect();
    assert_eq!(sources, vec!["terraform", "external"]);
    assert_eq!(hits[1].cloud_resource_name.as_deref(), Some("cmdb-vpc"));
}

#[test]
fn test_resource_tree_nests_modules() {
    let (_dir, db, ws) = setup();
    let indexer = Arc::new(ResourceIndexer::new(db.clone()));
    let manager = StateManager::new(db.clone()).with_indexer(indexer.clone());
    manager
        .upload_state(&ws, &state_json("lin-a", 1, "vpc-1"), None, false, "")
        .unwrap();

    let tree = indexer.resource_tree(&ws).unwrap();
    assert_eq!(tree.len(), 2);
    assert_eq!(tree[0].kind, TreeNodeKind::Module);
    assert_eq!(tree[0].name, "app");
    assert_eq!(tree[0].resource_count, 2);
    assert_eq!(tree[0].children.len(), 2);
    assert_eq!(tree[1].kind, TreeNodeKind::Resource);
    assert_eq!(tree[1].path, "aws_vpc.main");

    assert!(indexer.resource_tree("ws-missing").is_err());
}
