pub mod loader;
pub mod types;

pub use loader::{load, ConfigError};
pub use types::{
    Config, DatabaseConfig, EmbeddingProviderConfig, EmbeddingWorkerConfig, ExecutorConfig,
    QueueConfig, SweeperConfig,
};
