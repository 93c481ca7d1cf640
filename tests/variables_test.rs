use std::sync::Arc;

use iacore::db::models::NewWorkspace;
use iacore::db::Database;
use iacore::remote_data::{RemoteDataService, TOKEN_MAX_USES};
use iacore::state::StateManager;
use iacore::variables::{Encryptor, NewVariable, VariableChanges, VariableStore, MASKED_VALUE};
use iacore::Error;
use serde_json::json;

/// Reversible stand-in for a real cipher.
struct ReverseEncryptor;

impl Encryptor for ReverseEncryptor {
    fn encrypt(&self, plain: &str) -> iacore::Result<String> {
        Ok(format!("enc:{}", plain.chars().rev().collect::<String>()))
    }

    fn decrypt(&self, blob: &str) -> iacore::Result<String> {
        let body = blob
            .strip_prefix("enc:")
            .ok_or_else(|| Error::Validation("not encrypted".into()))?;
        Ok(body.chars().rev().collect())
    }
}

fn setup() -> (Arc<Database>, String) {
    let db = Arc::new(Database::open_memory().unwrap());
    let ws = db.create_workspace(&NewWorkspace::named("app")).unwrap();
    (db, ws.workspace_id)
}

#[test]
fn test_create_and_list() {
    let (db, ws) = setup();
    let store = VariableStore::new(db);
    let region = store.create(&ws, &NewVariable::terraform("region", "us-east-1")).unwrap();
    assert_eq!(region.version, 1);
    assert!(region.variable_id.starts_with("var-"));
    store
        .create(&ws, &NewVariable::environment("TF_LOG", "debug"))
        .unwrap();

    let all = store.list(&ws, None).unwrap();
    let keys: Vec<&str> = all.iter().map(|v| v.key.as_str()).collect();
    assert_eq!(keys, vec!["TF_LOG", "region"]);
    assert_eq!(store.list(&ws, Some("environment")).unwrap().len(), 1);
}

#[test]
fn test_duplicate_key_per_type_conflicts() {
    let (db, ws) = setup();
    let store = VariableStore::new(db);
    store.create(&ws, &NewVariable::terraform("region", "a")).unwrap();
    let err = store
        .create(&ws, &NewVariable::terraform("region", "b"))
        .unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));

    // Same key as an environment variable is a different slot.
    store
        .create(&ws, &NewVariable::environment("region", "b"))
        .unwrap();
}

#[test]
fn test_key_validation() {
    let (db, ws) = setup();
    let store = VariableStore::new(db);
    assert!(matches!(
        store.create(&ws, &NewVariable::terraform("", "x")).unwrap_err(),
        Error::Validation(_)
    ));
    assert!(matches!(
        store.create(&ws, &NewVariable::terraform("bad key", "x")).unwrap_err(),
        Error::Validation(_)
    ));
    assert!(matches!(
        store.create("ws-missing", &NewVariable::terraform("k", "x")).unwrap_err(),
        Error::NotFound { .. }
    ));
}

#[test]
fn test_update_appends_version_with_optimistic_check() {
    let (db, ws) = setup();
    let store = VariableStore::new(db);
    let var = store.create(&ws, &NewVariable::terraform("size", "small")).unwrap();

    let updated = store
        .update(
            &var.variable_id,
            1,
            &VariableChanges {
                value: Some("large".into()),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(updated.version, 2);
    assert_eq!(updated.value, "large");

    let err = store
        .update(
            &var.variable_id,
            1,
            &VariableChanges {
                value: Some("medium".into()),
                ..Default::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, Error::VersionConflict { current: 2, expected: 1 }));

    let history = store.versions(&var.variable_id).unwrap();
    let values: Vec<&str> = history.iter().map(|v| v.value.as_str()).collect();
    assert_eq!(values, vec!["small", "large"]);
}

#[test]
fn test_sensitive_values_masked_and_encrypted() {
    let (db, ws) = setup();
    let store = VariableStore::with_encryptor(db, Arc::new(ReverseEncryptor));
    let secret = store
        .create(&ws, &NewVariable::terraform("db_password", "hunter2").sensitive())
        .unwrap();
    assert_eq!(secret.value, MASKED_VALUE);
    assert_eq!(store.get(&secret.variable_id).unwrap().value, MASKED_VALUE);

    let exec = store.for_execution(&ws).unwrap();
    assert_eq!(exec.len(), 1);
    assert_eq!(exec[0].value, "hunter2");
    assert!(exec[0].sensitive);

    let err = store
        .update(
            &secret.variable_id,
            1,
            &VariableChanges {
                sensitive: Some(false),
                ..Default::default()
            },
        )
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

#[test]
fn test_delete_frees_key() {
    let (db, ws) = setup();
    let store = VariableStore::new(db);
    let var = store.create(&ws, &NewVariable::terraform("region", "a")).unwrap();
    store.delete(&var.variable_id).unwrap();

    assert!(store.list(&ws, None).unwrap().is_empty());
    assert!(matches!(store.get(&var.variable_id).unwrap_err(), Error::NotFound { .. }));
    assert!(store.delete(&var.variable_id).is_err());

    let history = store.versions(&var.variable_id).unwrap();
    assert!(history.iter().all(|v| v.is_deleted));

    let again = store.create(&ws, &NewVariable::terraform("region", "b")).unwrap();
    assert_ne!(again.variable_id, var.variable_id);
    assert!(again.version > history.last().unwrap().version);
}

// ─── Remote Data ─────────────────────────────────────────────────────────────

fn with_outputs(db: &Arc<Database>) -> String {
    let source = db.create_workspace(&NewWorkspace::named("network")).unwrap();
    let state = json!({
        "lineage": "lin-net",
        "serial": 1,
        "outputs": {"vpc_id": {"value": "vpc-123", "type": "string"}},
        "resources": []
    })
    .to_string();
    StateManager::new(db.clone())
        .upload_state(&source.workspace_id, &state, None, false, "")
        .unwrap();
    source.workspace_id
}

#[test]
fn test_token_consumption_limits() {
    let (db, ws) = setup();
    let source = with_outputs(&db);
    let service = RemoteDataService::new(db);
    let token = service.issue(&ws, &source, Some(7)).unwrap();
    assert_eq!(token.max_uses, TOKEN_MAX_USES);

    let err = service.consume(&token.token, &ws).unwrap_err();
    assert!(err.to_string().contains("not issued for this workspace"));
    assert!(service.consume("bogus", &source).is_err());

    for _ in 0..TOKEN_MAX_USES {
        let outputs = service.consume(&token.token, &source).unwrap();
        assert_eq!(outputs["vpc_id"]["value"], "vpc-123");
    }
    let err = service.consume(&token.token, &source).unwrap_err();
    assert!(err.to_string().contains("exceeded max uses"));

    assert_eq!(service.cleanup().unwrap(), 1);
}

#[test]
fn test_render_config_issues_token_per_source() {
    let (db, ws) = setup();
    let source = with_outputs(&db);
    let service = RemoteDataService::new(db.clone());
    assert!(service.render_config(&ws, None, "http://localhost:8080").unwrap().is_none());

    db.add_remote_data(&ws, &source, "net-outputs", "").unwrap();
    assert!(matches!(
        db.add_remote_data(&ws, &ws, "self", "").unwrap_err(),
        Error::Validation(_)
    ));

    let config = service
        .render_config(&ws, Some(3), "http://localhost:8080/")
        .unwrap()
        .unwrap();
    let block = &config["data"]["http"]["remote_net_outputs"][0];
    assert_eq!(
        block["url"],
        format!("http://localhost:8080/api/v1/workspaces/{}/state-outputs/full", source)
    );
    let header = block["request_headers"]["Authorization"].as_str().unwrap();
    let token = header.strip_prefix("Bearer ").unwrap();
    assert!(service.consume(token, &source).is_ok());
    assert_eq!(
        config["locals"]["net-outputs"],
        "${jsondecode(data.http.remote_net_outputs.response_body).outputs}"
    );
}
