use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use iacore::config::EmbeddingWorkerConfig;
use iacore::db::models::NewWorkspace;
use iacore::db::{timestamp, Database};
use iacore::embedding::provider::decode_vector;
use iacore::embedding::{EmbeddingProvider, EmbeddingWorker};
use iacore::index::ResourceIndexer;
use iacore::state::StateManager;
use iacore::Error;
use rusqlite::params;
use serde_json::json;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
struct FakeProvider {
    batch: bool,
    /// Return one vector too few from `embed_batch`.
    short_batches: bool,
    fail: bool,
    single_calls: AtomicUsize,
    batch_calls: AtomicUsize,
}

#[async_trait]
impl EmbeddingProvider for FakeProvider {
    fn model(&self) -> &str {
        "fake-model"
    }

    fn supports_batch(&self) -> bool {
        self.batch
    }

    fn batch_size(&self) -> usize {
        10
    }

    async fn embed(&self, text: &str) -> iacore::Result<Vec<f32>> {
        self.single_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Error::External {
                service: "embedding".into(),
                status: Some(503),
                message: "unavailable".into(),
            });
        }
        Ok(vec![text.len() as f32, 1.0])
    }

    async fn embed_batch(&self, texts: &[String]) -> iacore::Result<Vec<Vec<f32>>> {
        self.batch_calls.fetch_add(1, Ordering::SeqCst);
        let mut vectors: Vec<Vec<f32>> = texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect();
        if self.short_batches {
            vectors.pop();
        }
        Ok(vectors)
    }
}

fn config() -> EmbeddingWorkerConfig {
    EmbeddingWorkerConfig {
        batch_interval_secs: 0,
        tick_millis: 20,
        max_retries: 2,
        ..Default::default()
    }
}

/// A workspace with four indexed resources waiting for vectors.
fn indexed_workspace(db: &Arc<Database>) -> (ResourceIndexer, String) {
    let ws = db.create_workspace(&NewWorkspace::named("network")).unwrap();
    let state = json!({
        "lineage": "lin-a",
        "serial": 1,
        "resources": [
            {
                "mode": "managed",
                "type": "aws_vpc",
                "name": "main",
                "instances": [{"attributes": {"id": "vpc-1", "tags": {"Name": "main-vpc"}}}]
            },
            {
                "mode": "managed",
                "module": "module.app",
                "type": "aws_subnet",
                "name": "private",
                "instances": [
                    {"index_key": 0, "attributes": {"id": "subnet-a"}},
                    {"index_key": 1, "attributes": {"id": "subnet-b"}}
                ]
            },
            {
                "mode": "managed",
                "type": "aws_s3_bucket",
                "name": "logs",
                "instances": [{"attributes": {"id": "logs-bucket"}}]
            }
        ]
    })
    .to_string();
    StateManager::new(db.clone())
        .upload_state(&ws.workspace_id, &state, None, false, "")
        .unwrap();
    let indexer = ResourceIndexer::new(db.clone());
    let report = indexer.sync(&ws.workspace_id).unwrap();
    assert_eq!(report.embedding_tasks, 4);
    (indexer, ws.workspace_id)
}

#[tokio::test]
async fn test_no_provider_is_a_noop() {
    let db = Arc::new(Database::open_memory().unwrap());
    let (_indexer, ws) = indexed_workspace(&db);
    let worker = EmbeddingWorker::new(db, config());

    let n = worker.process_pending(&CancellationToken::new()).await.unwrap();
    assert_eq!(n, 0);
    assert_eq!(worker.status(&ws).unwrap().pending, 4);

    worker
        .set_provider(Some(Arc::new(FakeProvider::default())))
        .unwrap();
    let n = worker.process_pending(&CancellationToken::new()).await.unwrap();
    assert_eq!(n, 4);
}

#[tokio::test]
async fn test_batch_embedding_stores_vectors() {
    let db = Arc::new(Database::open_memory().unwrap());
    let (indexer, ws) = indexed_workspace(&db);
    let provider = Arc::new(FakeProvider {
        batch: true,
        ..Default::default()
    });
    let worker = EmbeddingWorker::new(db, config()).with_provider(provider.clone());

    let n = worker.process_pending(&CancellationToken::new()).await.unwrap();
    assert_eq!(n, 4);
    assert_eq!(provider.batch_calls.load(Ordering::SeqCst), 1);
    assert_eq!(provider.single_calls.load(Ordering::SeqCst), 0);

    let status = worker.status(&ws).unwrap();
    assert_eq!(status.with_embedding, 4);
    assert_eq!(status.completed, 4);
    assert_eq!(status.pending, 0);
    assert!((status.progress - 100.0).abs() < f64::EPSILON);

    let vpc = indexer.get_resource(&ws, "aws_vpc.main").unwrap();
    assert_eq!(vpc.embedding_model.as_deref(), Some("fake-model"));
    let text = vpc.embedding_text.unwrap();
    let vector = decode_vector(&vpc.embedding.unwrap());
    assert_eq!(vector, vec![text.len() as f32, 1.0]);
}

#[tokio::test]
async fn test_short_batch_falls_back_to_sequential() {
    let db = Arc::new(Database::open_memory().unwrap());
    let (_indexer, ws) = indexed_workspace(&db);
    let provider = Arc::new(FakeProvider {
        batch: true,
        short_batches: true,
        ..Default::default()
    });
    let worker = EmbeddingWorker::new(db, config()).with_provider(provider.clone());

    assert_eq!(worker.process_pending(&CancellationToken::new()).await.unwrap(), 4);
    assert_eq!(provider.single_calls.load(Ordering::SeqCst), 4);
    assert_eq!(worker.status(&ws).unwrap().with_embedding, 4);
}

#[tokio::test]
async fn test_failures_retry_until_exhausted() {
    let db = Arc::new(Database::open_memory().unwrap());
    let (_indexer, ws) = indexed_workspace(&db);
    let provider = Arc::new(FakeProvider {
        fail: true,
        ..Default::default()
    });
    let worker = EmbeddingWorker::new(db.clone(), config()).with_provider(provider.clone());

    assert_eq!(worker.process_pending(&CancellationToken::new()).await.unwrap(), 0);
    // Each task is attempted max_retries times, then left alone.
    assert_eq!(provider.single_calls.load(Ordering::SeqCst), 8);
    let status = worker.status(&ws).unwrap();
    assert_eq!(status.failed, 4);
    assert_eq!(status.with_embedding, 0);

    let message: String = db
        .conn()
        .unwrap()
        .query_row("SELECT error_message FROM embedding_tasks LIMIT 1", [], |row| row.get(0))
        .unwrap();
    assert!(message.contains("unavailable"));
}

#[tokio::test]
async fn test_storage_error_releases_claimed_tasks() {
    let db = Arc::new(Database::open_memory().unwrap());
    let (_indexer, ws) = indexed_workspace(&db);
    let provider = Arc::new(FakeProvider {
        batch: true,
        ..Default::default()
    });
    let worker = EmbeddingWorker::new(db.clone(), config()).with_provider(provider);
    db.conn()
        .unwrap()
        .execute_batch(
            "CREATE TRIGGER reject_bucket_vector BEFORE UPDATE OF embedding ON resource_index
             WHEN NEW.resource_type = 'aws_s3_bucket'
             BEGIN SELECT RAISE(ABORT, 'disk full'); END;",
        )
        .unwrap();

    assert!(worker.process_pending(&CancellationToken::new()).await.is_err());
    let status = worker.status(&ws).unwrap();
    assert_eq!(status.processing, 0);
    assert!(status.pending >= 1);
    assert_eq!(status.pending + status.completed, 4);

    db.conn()
        .unwrap()
        .execute_batch("DROP TRIGGER reject_bucket_vector;")
        .unwrap();
    let n = worker.process_pending(&CancellationToken::new()).await.unwrap();
    assert_eq!(n as i64, status.pending);
    assert_eq!(worker.status(&ws).unwrap().with_embedding, 4);
}

#[tokio::test]
async fn test_rebuild_requeues_workspace() {
    let db = Arc::new(Database::open_memory().unwrap());
    let (_indexer, ws) = indexed_workspace(&db);
    let worker = EmbeddingWorker::new(db, config()).with_provider(Arc::new(FakeProvider::default()));
    worker.process_pending(&CancellationToken::new()).await.unwrap();

    assert_eq!(worker.enqueue_missing(Some(&ws)).unwrap(), 0);
    assert_eq!(worker.rebuild(&ws).unwrap(), 4);
    let status = worker.status(&ws).unwrap();
    assert_eq!(status.with_embedding, 0);
    assert_eq!(status.pending, 4);
    assert_eq!(status.completed, 0);
}

#[test]
fn test_recover_and_cleanup() {
    let db = Arc::new(Database::open_memory().unwrap());
    let (_indexer, ws) = indexed_workspace(&db);
    let worker = EmbeddingWorker::new(db.clone(), config());

    db.conn()
        .unwrap()
        .execute("UPDATE embedding_tasks SET status = 'processing' WHERE id IN (SELECT id FROM embedding_tasks LIMIT 2)", [])
        .unwrap();
    assert_eq!(worker.recover_processing().unwrap(), 2);
    assert_eq!(worker.status(&ws).unwrap().pending, 4);

    let old = timestamp(Utc::now() - chrono::Duration::days(4));
    db.conn()
        .unwrap()
        .execute("UPDATE embedding_tasks SET created_at = ?1", params![old])
        .unwrap();
    assert_eq!(worker.cleanup_expired().unwrap(), 4);
    assert_eq!(worker.status(&ws).unwrap().pending, 0);
}

#[tokio::test]
async fn test_worker_wakes_on_notify() {
    let db = Arc::new(Database::open_memory().unwrap());
    let ws = db.create_workspace(&NewWorkspace::named("app")).unwrap().workspace_id;
    let worker = Arc::new(
        EmbeddingWorker::new(db.clone(), config()).with_provider(Arc::new(FakeProvider::default())),
    );
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(worker.clone().run(cancel.clone()));

    let indexer = ResourceIndexer::new(db.clone()).with_embedding_notify(worker.notify_handle());
    let state = json!({
        "lineage": "lin-b",
        "serial": 1,
        "resources": [{
            "mode": "managed",
            "type": "aws_iam_role",
            "name": "deploy",
            "instances": [{"attributes": {"id": "deploy"}}]
        }]
    })
    .to_string();
    StateManager::new(db.clone())
        .upload_state(&ws, &state, None, false, "")
        .unwrap();
    indexer.sync(&ws).unwrap();

    let mut embedded = 0;
    for _ in 0..200 {
        embedded = worker.status(&ws).unwrap().with_embedding;
        if embedded == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(embedded, 1);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
}
