use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::db::Database;
use crate::editing::EditingService;
use crate::embedding::{EmbeddingWorker, HttpEmbeddingProvider};
use crate::error::Result;
use crate::executor::{StreamRegistry, TaskExecutor, TerraformCli, Toolchain};
use crate::index::ResourceIndexer;
use crate::lifecycle::LifecycleController;
use crate::queue::{RecoveryReport, TaskQueueManager};
use crate::remote_data::RemoteDataService;
use crate::signal::SignalManager;
use crate::state::StateManager;
use crate::sweeper::Sweeper;
use crate::triggers::RunTriggerService;
use crate::variables::VariableStore;

/// Every long-lived service, built once and shared as `Arc`s.
pub struct Runtime {
    pub config: Config,
    pub db: Arc<Database>,
    pub signals: Arc<SignalManager>,
    pub streams: Arc<StreamRegistry>,
    pub indexer: Arc<ResourceIndexer>,
    pub state: Arc<StateManager>,
    pub embedding: Arc<EmbeddingWorker>,
    pub variables: Arc<VariableStore>,
    pub remote_data: Arc<RemoteDataService>,
    pub lifecycle: Arc<LifecycleController>,
    pub triggers: Arc<RunTriggerService>,
    pub editing: Arc<EditingService>,
    pub executor: Arc<TaskExecutor>,
    pub queue: Arc<TaskQueueManager>,
    pub sweeper: Arc<Sweeper>,
    background: CancellationToken,
}

impl Runtime {
    /// Wire the services around the configured terraform binary.
    pub fn new(db: Arc<Database>, config: Config) -> Result<Self> {
        let toolchain = Arc::new(TerraformCli::new(
            config.executor.terraform_binary.clone(),
            config.executor.plugin_cache_dir.clone(),
        ));
        Self::with_toolchain(db, config, toolchain)
    }

    pub fn with_toolchain(db: Arc<Database>, config: Config, toolchain: Arc<dyn Toolchain>) -> Result<Self> {
        let signals = Arc::new(SignalManager::new());
        let streams = Arc::new(StreamRegistry::new());

        let mut embedding = EmbeddingWorker::new(Arc::clone(&db), config.embedding.clone());
        if let Some(provider) = &config.embedding_provider {
            embedding = embedding.with_provider(Arc::new(HttpEmbeddingProvider::new(provider)?));
        }
        let embedding = Arc::new(embedding);

        let indexer = Arc::new(
            ResourceIndexer::new(Arc::clone(&db)).with_embedding_notify(embedding.notify_handle()),
        );
        let state = Arc::new(StateManager::new(Arc::clone(&db)).with_indexer(Arc::clone(&indexer)));
        let variables = Arc::new(VariableStore::new(Arc::clone(&db)));
        let remote_data = Arc::new(RemoteDataService::new(Arc::clone(&db)));
        let lifecycle = Arc::new(LifecycleController::new(Arc::clone(&db)));
        let triggers = Arc::new(RunTriggerService::new(Arc::clone(&db)));
        let editing = Arc::new(EditingService::new(Arc::clone(&db)));

        let executor = Arc::new(
            TaskExecutor::new(Arc::clone(&db), config.executor.clone(), toolchain)
                .with_indexer(Arc::clone(&indexer))
                .with_variables(Arc::clone(&variables))
                .with_signals(Arc::clone(&signals))
                .with_streams(Arc::clone(&streams))
                .with_timeout(config.queue.task_timeout()),
        );
        let queue = TaskQueueManager::new(Arc::clone(&db), config.queue.clone(), executor.clone());
        queue.add_hook(triggers.clone());

        let sweeper = Arc::new(
            Sweeper::new(config.sweeper.clone(), Arc::clone(&editing), Arc::clone(&remote_data))
                .with_streams(Arc::clone(&streams)),
        );

        Ok(Self {
            config,
            db,
            signals,
            streams,
            indexer,
            state,
            embedding,
            variables,
            remote_data,
            lifecycle,
            triggers,
            editing,
            executor,
            queue,
            sweeper,
            background: CancellationToken::new(),
        })
    }

    /// Recover the queue and start the background loops.
    pub fn start(&self) -> Result<(RecoveryReport, Vec<JoinHandle<()>>)> {
        let report = self.queue.recover()?;
        let handles = vec![
            self.queue.spawn_pending_monitor(),
            tokio::spawn(Arc::clone(&self.embedding).run(self.background.clone())),
            tokio::spawn(Arc::clone(&self.sweeper).run(self.background.clone())),
        ];
        tracing::info!(
            max_parallel = self.config.queue.max_parallel,
            "Runtime started"
        );
        Ok((report, handles))
    }

    /// Stop dispatching, let running work settle, then stop the loops.
    ///
    /// `timeout` bounds interruptible work only. Open critical sections
    /// (apply, state saving) are always waited out, then the tasks that
    /// owned them get another `timeout` to record their result.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.signals.request_shutdown();
        let mut drained = self.queue.shutdown(timeout).await;
        if self.signals.is_critical_section() {
            tracing::warn!(sections = ?self.signals.open_sections(), "Waiting for critical sections before exit");
            self.signals.wait_until_sections_closed().await;
            drained = self.queue.wait_idle(timeout).await;
        }
        self.background.cancel();
        self.streams.prune_closed(Duration::ZERO);
        tracing::info!(drained, "Runtime stopped");
        drained
    }

    /// Run until SIGINT/SIGTERM.
    pub async fn serve(&self, shutdown_timeout: Duration) -> Result<()> {
        let (_, handles) = self.start()?;
        let listener = tokio::spawn(Arc::clone(&self.signals).listen());
        self.signals.shutdown_token().cancelled().await;
        self.shutdown(shutdown_timeout).await;
        listener.abort();
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }
}
