use std::sync::{Arc, RwLock};

use chrono::Utc;
use rusqlite::{params, OptionalExtension, ToSql};
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::provider::{encode_vector, EmbeddingProvider};
use super::text::build_embedding_text;
use crate::config::EmbeddingWorkerConfig;
use crate::db::models::{embedding_status, IndexedResource};
use crate::db::{now, timestamp, Database};
use crate::error::{Error, Result};

/// Embedding progress of one workspace.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EmbeddingStatus {
    pub workspace_id: String,
    pub total_resources: i64,
    pub with_embedding: i64,
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    /// Pending tasks that exhausted their retries.
    pub failed: i64,
    pub progress: f64,
}

#[derive(Debug, Clone, Copy)]
struct ClaimedTask {
    id: i64,
    resource_id: i64,
}

/// Resource ready to embed, with the text it will be embedded from.
struct WorkItem {
    task_id: i64,
    resource_id: i64,
    text: String,
}

/// Background worker that fills the vector columns of `resource_index`.
pub struct EmbeddingWorker {
    db: Arc<Database>,
    config: EmbeddingWorkerConfig,
    provider: RwLock<Option<Arc<dyn EmbeddingProvider>>>,
    notify: Arc<Notify>,
}

impl EmbeddingWorker {
    pub fn new(db: Arc<Database>, config: EmbeddingWorkerConfig) -> Self {
        Self {
            db,
            config,
            provider: RwLock::new(None),
            notify: Arc::new(Notify::new()),
        }
    }

    pub fn with_provider(self, provider: Arc<dyn EmbeddingProvider>) -> Self {
        if let Ok(mut slot) = self.provider.write() {
            *slot = Some(provider);
        }
        self
    }

    /// Replace (or clear) the provider at runtime.
    pub fn set_provider(&self, provider: Option<Arc<dyn EmbeddingProvider>>) -> Result<()> {
        let mut slot = self
            .provider
            .write()
            .map_err(|_| Error::internal("embedding provider lock poisoned"))?;
        *slot = provider;
        drop(slot);
        self.notify.notify_one();
        Ok(())
    }

    fn provider(&self) -> Option<Arc<dyn EmbeddingProvider>> {
        self.provider.read().ok().and_then(|p| p.clone())
    }

    /// Handle the indexer uses to wake the worker after queueing tasks.
    pub fn notify_handle(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Run until `cancel` fires.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        match self.recover_processing() {
            Ok(0) => {}
            Ok(n) => info!(count = n, "Recovered interrupted embedding tasks"),
            Err(e) => warn!(error = %e, "Failed to recover embedding tasks"),
        }

        let mut tick = tokio::time::interval(self.config.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup = tokio::time::interval(self.config.cleanup_interval());
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("Embedding worker started");
        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                _ = cleanup.tick() => {
                    match self.cleanup_expired() {
                        Ok(0) => {}
                        Ok(n) => info!(count = n, "Removed expired embedding tasks"),
                        Err(e) => warn!(error = %e, "Embedding task cleanup failed"),
                    }
                }

                _ = tick.tick() => self.drain(&cancel).await,

                _ = self.notify.notified() => self.drain(&cancel).await,
            }
        }
        info!("Embedding worker stopped");
    }

    async fn drain(&self, cancel: &CancellationToken) {
        if let Err(e) = self.process_pending(cancel).await {
            warn!(error = %e, "Embedding batch failed");
        }
    }

    /// Reset tasks left `processing` by a previous run.
    pub fn recover_processing(&self) -> Result<usize> {
        let conn = self.db.conn()?;
        let n = conn.execute(
            "UPDATE embedding_tasks SET status = ?1, updated_at = ?2 WHERE status = ?3",
            params![
                embedding_status::PENDING,
                now(),
                embedding_status::PROCESSING
            ],
        )?;
        Ok(n)
    }

    /// Drop stale unfinished tasks and old completed ones.
    pub fn cleanup_expired(&self) -> Result<usize> {
        let expire_cutoff = timestamp(Utc::now() - chrono::Duration::days(self.config.expire_days));
        let completed_cutoff = timestamp(
            Utc::now() - chrono::Duration::days(self.config.completed_retention_days),
        );
        let conn = self.db.conn()?;
        let expired = conn.execute(
            "DELETE FROM embedding_tasks WHERE status IN (?1, ?2) AND created_at < ?3",
            params![
                embedding_status::PENDING,
                embedding_status::PROCESSING,
                expire_cutoff
            ],
        )?;
        let completed = conn.execute(
            "DELETE FROM embedding_tasks WHERE status = ?1 AND completed_at < ?2",
            params![embedding_status::COMPLETED, completed_cutoff],
        )?;
        Ok(expired + completed)
    }

    fn effective_batch_size(&self, provider: &dyn EmbeddingProvider) -> usize {
        let size = if provider.supports_batch() {
            self.config.batch_size.min(provider.batch_size())
        } else {
            self.config.batch_size
        };
        size.max(1)
    }

    /// Process pending tasks batch by batch until none remain.
    /// Returns the number of resources embedded.
    pub async fn process_pending(&self, cancel: &CancellationToken) -> Result<usize> {
        let Some(provider) = self.provider() else {
            return Ok(0);
        };
        let batch_size = self.effective_batch_size(provider.as_ref());
        let mut embedded = 0;

        loop {
            if cancel.is_cancelled() {
                break;
            }
            let claimed = self.claim_batch(batch_size)?;
            if claimed.is_empty() {
                break;
            }
            debug!(count = claimed.len(), "Processing embedding batch");

            let result = match self.load_items(&claimed) {
                Ok(items) => self.process_batch(provider.as_ref(), items).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(n) => embedded += n,
                Err(e) => {
                    if let Err(reset) = self.release_claimed(&claimed) {
                        warn!(error = %reset, "Failed to release claimed embedding tasks");
                    }
                    return Err(e);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.batch_interval()) => {}
            }
        }
        Ok(embedded)
    }

    fn claim_batch(&self, limit: usize) -> Result<Vec<ClaimedTask>> {
        let cutoff = timestamp(Utc::now() - chrono::Duration::days(self.config.expire_days));
        let conn = self.db.conn()?;
        let candidates = {
            let mut stmt = conn.prepare(
                "SELECT id, resource_id FROM embedding_tasks
                 WHERE status = ?1 AND retry_count < ?2 AND created_at > ?3
                 ORDER BY created_at, id LIMIT ?4",
            )?;
            let rows = stmt
                .query_map(
                    params![
                        embedding_status::PENDING,
                        self.config.max_retries,
                        cutoff,
                        limit as i64
                    ],
                    |row| {
                        Ok(ClaimedTask {
                            id: row.get(0)?,
                            resource_id: row.get(1)?,
                        })
                    },
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        let ts = now();
        let mut claimed = Vec::with_capacity(candidates.len());
        for task in candidates {
            let n = conn.execute(
                "UPDATE embedding_tasks SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
                params![
                    embedding_status::PROCESSING,
                    ts,
                    task.id,
                    embedding_status::PENDING
                ],
            )?;
            if n == 1 {
                claimed.push(task);
            }
        }
        Ok(claimed)
    }

    /// Put claimed tasks that are still `processing` back to `pending`.
    fn release_claimed(&self, claimed: &[ClaimedTask]) -> Result<usize> {
        let conn = self.db.conn()?;
        let ts = now();
        let mut released = 0;
        for task in claimed {
            released += conn.execute(
                "UPDATE embedding_tasks SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
                params![
                    embedding_status::PENDING,
                    ts,
                    task.id,
                    embedding_status::PROCESSING
                ],
            )?;
        }
        if released > 0 {
            debug!(count = released, "Released unfinished embedding tasks");
        }
        Ok(released)
    }

    /// Resolve each task's resource; tasks whose resource vanished are deleted.
    fn load_items(&self, claimed: &[ClaimedTask]) -> Result<Vec<WorkItem>> {
        let conn = self.db.conn()?;
        let sql = format!(
            "SELECT {} FROM resource_index WHERE id = ?1",
            IndexedResource::COLUMNS
        );
        let mut items = Vec::with_capacity(claimed.len());
        for task in claimed {
            let resource = conn
                .query_row(&sql, params![task.resource_id], IndexedResource::from_row)
                .optional()?;
            match resource {
                Some(r) => {
                    let text = r
                        .embedding_text
                        .clone()
                        .filter(|t| !t.is_empty())
                        .unwrap_or_else(|| build_embedding_text(&r));
                    items.push(WorkItem {
                        task_id: task.id,
                        resource_id: r.id,
                        text,
                    });
                }
                None => {
                    conn.execute("DELETE FROM embedding_tasks WHERE id = ?1", params![task.id])?;
                    debug!(task_id = task.id, "Dropped embedding task for deleted resource");
                }
            }
        }
        Ok(items)
    }

    async fn process_batch(
        &self,
        provider: &dyn EmbeddingProvider,
        items: Vec<WorkItem>,
    ) -> Result<usize> {
        if items.is_empty() {
            return Ok(0);
        }
        if provider.supports_batch() && items.len() > 1 {
            let texts: Vec<String> = items.iter().map(|i| i.text.clone()).collect();
            match provider.embed_batch(&texts).await {
                Ok(vectors) if vectors.len() == items.len() => {
                    let mut stored = 0;
                    for (item, vector) in items.iter().zip(vectors) {
                        self.store_vector(item, &vector, provider.model())?;
                        stored += 1;
                    }
                    info!(count = stored, "Embedded batch");
                    return Ok(stored);
                }
                Ok(vectors) => warn!(
                    expected = items.len(),
                    got = vectors.len(),
                    "Batch embedding size mismatch, falling back to sequential"
                ),
                Err(e) => warn!(error = %e, "Batch embedding failed, falling back to sequential"),
            }
        }
        self.process_sequentially(provider, &items).await
    }

    async fn process_sequentially(
        &self,
        provider: &dyn EmbeddingProvider,
        items: &[WorkItem],
    ) -> Result<usize> {
        let mut stored = 0;
        for item in items {
            match provider.embed(&item.text).await {
                Ok(vector) => {
                    self.store_vector(item, &vector, provider.model())?;
                    stored += 1;
                }
                Err(e) => {
                    warn!(resource_id = item.resource_id, error = %e, "Embedding failed");
                    self.mark_failed(item.task_id, &e.to_string())?;
                }
            }
        }
        debug!(stored, total = items.len(), "Sequential embedding finished");
        Ok(stored)
    }

    fn store_vector(&self, item: &WorkItem, vector: &[f32], model: &str) -> Result<()> {
        let ts = now();
        let mut conn = self.db.conn()?;
        let tx = conn.transaction()?;
        let updated = tx.execute(
            "UPDATE resource_index SET embedding = ?1, embedding_text = ?2, embedding_model = ?3,
                embedding_updated_at = ?4 WHERE id = ?5",
            params![encode_vector(vector), item.text, model, ts, item.resource_id],
        )?;
        if updated == 0 {
            tx.execute(
                "DELETE FROM embedding_tasks WHERE id = ?1",
                params![item.task_id],
            )?;
        } else {
            tx.execute(
                "UPDATE embedding_tasks SET status = ?1, completed_at = ?2, updated_at = ?2,
                    error_message = NULL WHERE id = ?3",
                params![embedding_status::COMPLETED, ts, item.task_id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    fn mark_failed(&self, task_id: i64, message: &str) -> Result<()> {
        let conn = self.db.conn()?;
        conn.execute(
            "UPDATE embedding_tasks SET status = ?1, retry_count = retry_count + 1,
                error_message = ?2, updated_at = ?3 WHERE id = ?4",
            params![embedding_status::PENDING, message, now(), task_id],
        )?;
        Ok(())
    }

    /// Queue a task for every row lacking a vector, optionally scoped to one workspace.
    pub fn enqueue_missing(&self, workspace_id: Option<&str>) -> Result<usize> {
        let n = {
            let conn = self.db.conn()?;
            conn.execute(
                "INSERT INTO embedding_tasks (resource_id, workspace_id, status, retry_count, created_at, updated_at)
                 SELECT id, workspace_id, ?1, 0, ?2, ?2 FROM resource_index
                 WHERE embedding IS NULL AND (?3 IS NULL OR workspace_id = ?3)
                 ON CONFLICT(resource_id) DO NOTHING",
                params![embedding_status::PENDING, now(), workspace_id],
            )?
        };
        if n > 0 {
            self.notify.notify_one();
        }
        info!(workspace_id = ?workspace_id, queued = n, "Queued missing embeddings");
        Ok(n)
    }

    /// Clear every vector of a workspace and queue it again from scratch.
    pub fn rebuild(&self, workspace_id: &str) -> Result<usize> {
        {
            let mut conn = self.db.conn()?;
            let tx = conn.transaction()?;
            tx.execute(
                "UPDATE resource_index SET embedding = NULL, embedding_updated_at = NULL,
                    last_synced_at = ?2 WHERE workspace_id = ?1",
                params![workspace_id, now()],
            )?;
            tx.execute(
                "DELETE FROM embedding_tasks WHERE workspace_id = ?1",
                params![workspace_id],
            )?;
            tx.commit()?;
        }
        self.enqueue_missing(Some(workspace_id))
    }

    pub fn status(&self, workspace_id: &str) -> Result<EmbeddingStatus> {
        let conn = self.db.conn()?;
        let count = |sql: &str, p: &[&dyn ToSql]| -> Result<i64> {
            Ok(conn.query_row(sql, p, |row| row.get(0))?)
        };

        let total_resources = count(
            "SELECT COUNT(*) FROM resource_index WHERE workspace_id = ?1",
            params![workspace_id],
        )?;
        let with_embedding = count(
            "SELECT COUNT(*) FROM resource_index WHERE workspace_id = ?1 AND embedding IS NOT NULL",
            params![workspace_id],
        )?;
        let by_status = "SELECT COUNT(*) FROM embedding_tasks WHERE workspace_id = ?1 AND status = ?2";
        let pending = count(by_status, params![workspace_id, embedding_status::PENDING])?;
        let processing = count(by_status, params![workspace_id, embedding_status::PROCESSING])?;
        let completed = count(by_status, params![workspace_id, embedding_status::COMPLETED])?;
        let failed = count(
            "SELECT COUNT(*) FROM embedding_tasks
             WHERE workspace_id = ?1 AND status = ?2 AND retry_count >= ?3",
            params![
                workspace_id,
                embedding_status::PENDING,
                self.config.max_retries
            ],
        )?;

        let progress = if total_resources > 0 {
            with_embedding as f64 / total_resources as f64 * 100.0
        } else {
            0.0
        };
        Ok(EmbeddingStatus {
            workspace_id: workspace_id.to_string(),
            total_resources,
            with_embedding,
            pending,
            processing,
            completed,
            failed,
            progress,
        })
    }
}
