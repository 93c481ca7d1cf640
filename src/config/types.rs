use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

// ─── Top-Level Config ───────────────────────────────────────────────────────

/// Root configuration for a runtime instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub queue: QueueConfig,
    pub executor: ExecutorConfig,
    pub embedding: EmbeddingWorkerConfig,
    pub embedding_provider: Option<EmbeddingProviderConfig>,
    pub sweeper: SweeperConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".iacore/iacore.db"),
        }
    }
}

// ─── Queue ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Upper bound on tasks running at the same time across all workspaces.
    pub max_parallel: usize,
    /// How often pending tasks are re-examined (locked workspaces, free slots).
    pub pending_monitor_secs: u64,
    /// Hard limit on a single task execution.
    pub task_timeout_secs: u64,
    /// How long `cancel` waits for a running task to settle.
    pub cancel_settle_secs: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_parallel: 3,
            pending_monitor_secs: 10,
            task_timeout_secs: 60 * 60,
            cancel_settle_secs: 30,
        }
    }
}

impl QueueConfig {
    pub fn pending_monitor_interval(&self) -> Duration {
        Duration::from_secs(self.pending_monitor_secs.max(1))
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn cancel_settle(&self) -> Duration {
        Duration::from_secs(self.cancel_settle_secs)
    }
}

// ─── Executor ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Root under which `<workspace_id>/<task_id>` work trees are created.
    pub workdir: PathBuf,
    pub terraform_binary: String,
    pub plugin_cache_dir: Option<PathBuf>,
    /// Process-wide default for task log verbosity.
    pub log_level: String,
    /// Base URL used in rendered remote data sources.
    pub base_url: String,
    /// Keep work trees after a task finishes (debugging aid).
    pub keep_workdir: bool,
    pub init_max_retries: u32,
    pub init_retry_base_ms: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            workdir: PathBuf::from(".iacore/work"),
            terraform_binary: "terraform".to_string(),
            plugin_cache_dir: None,
            log_level: "info".to_string(),
            base_url: "http://localhost:8080".to_string(),
            keep_workdir: false,
            init_max_retries: 3,
            init_retry_base_ms: 2_000,
        }
    }
}

// ─── Embedding ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingWorkerConfig {
    pub batch_size: usize,
    pub batch_interval_secs: u64,
    pub tick_millis: u64,
    pub max_retries: i64,
    pub expire_days: i64,
    pub completed_retention_days: i64,
    pub cleanup_interval_secs: u64,
}

impl Default for EmbeddingWorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            batch_interval_secs: 2,
            tick_millis: 1_000,
            max_retries: 3,
            expire_days: 3,
            completed_retention_days: 7,
            cleanup_interval_secs: 24 * 60 * 60,
        }
    }
}

impl EmbeddingWorkerConfig {
    pub fn batch_interval(&self) -> Duration {
        Duration::from_secs(self.batch_interval_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_millis.max(10))
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs.max(1))
    }
}

/// Connection settings for an OpenAI-compatible embeddings endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingProviderConfig {
    pub endpoint: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub model: String,
    #[serde(default)]
    pub batch_enabled: bool,
    #[serde(default = "default_provider_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

fn default_provider_batch_size() -> usize {
    50
}

fn default_provider_timeout() -> u64 {
    30
}

// ─── Sweeper ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub lock_sweep_secs: u64,
    pub token_sweep_secs: u64,
    pub draft_sweep_secs: u64,
    /// How long a finished task's output stays available to late subscribers.
    pub stream_retention_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            lock_sweep_secs: 30,
            token_sweep_secs: 5 * 60,
            draft_sweep_secs: 60 * 60,
            stream_retention_secs: 10 * 60,
        }
    }
}
