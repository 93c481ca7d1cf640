use std::path::{Path, PathBuf};

use super::types::{Config, EmbeddingProviderConfig};

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("invalid value for {var}: {value}")]
    InvalidValue { var: &'static str, value: String },
}

/// Load configuration from an optional YAML file, then apply environment overrides.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let mut config = match path {
        Some(path) if path.exists() => parse_file(path)?,
        Some(path) => {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            Config::default()
        }
        None => Config::default(),
    };
    apply_env(&mut config, |key| std::env::var(key).ok())?;
    Ok(config)
}

/// Parse a YAML config file. Missing sections fall back to defaults.
pub fn parse_file(path: &Path) -> Result<Config, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

pub fn parse_str(content: &str) -> Result<Config, serde_yaml::Error> {
    if content.trim().is_empty() {
        return Ok(Config::default());
    }
    serde_yaml::from_str(content)
}

/// Overlay environment variables on top of `config`.
pub fn apply_env<F>(config: &mut Config, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(path) = lookup("IACORE_DATABASE") {
        config.database.path = PathBuf::from(path);
    }
    if let Some(dir) = lookup("IACORE_WORKDIR") {
        config.executor.workdir = PathBuf::from(dir);
    }
    if let Some(value) = lookup("IACORE_MAX_PARALLEL") {
        config.queue.max_parallel = match value.parse::<usize>() {
            Ok(n) if n > 0 => n,
            _ => {
                return Err(ConfigError::InvalidValue {
                    var: "IACORE_MAX_PARALLEL",
                    value,
                })
            }
        };
    }
    if let Some(value) = lookup("IACORE_TASK_TIMEOUT_SECS") {
        config.queue.task_timeout_secs =
            value.parse().map_err(|_| ConfigError::InvalidValue {
                var: "IACORE_TASK_TIMEOUT_SECS",
                value,
            })?;
    }
    if let Some(binary) = lookup("IACORE_TERRAFORM_BIN") {
        config.executor.terraform_binary = binary;
    }
    if let Some(dir) = lookup("IACORE_PLUGIN_CACHE_DIR") {
        config.executor.plugin_cache_dir = Some(PathBuf::from(dir));
    }
    if let Some(url) = lookup("IACORE_BASE_URL") {
        config.executor.base_url = url.trim_end_matches('/').to_string();
    }
    if let Some(level) = lookup("TF_LOG") {
        if !level.trim().is_empty() {
            config.executor.log_level = level.trim().to_lowercase();
        }
    }

    if let Some(endpoint) = lookup("IACORE_EMBEDDING_ENDPOINT") {
        let model = lookup("IACORE_EMBEDDING_MODEL")
            .or_else(|| config.embedding_provider.as_ref().map(|p| p.model.clone()))
            .unwrap_or_else(|| "text-embedding-3-small".to_string());
        let provider = config
            .embedding_provider
            .get_or_insert_with(|| EmbeddingProviderConfig {
                endpoint: endpoint.clone(),
                api_key: None,
                model: model.clone(),
                batch_enabled: false,
                batch_size: 50,
                timeout_secs: 30,
            });
        provider.endpoint = endpoint;
        provider.model = model;
    }
    if let Some(key) = lookup("IACORE_EMBEDDING_API_KEY") {
        if let Some(provider) = config.embedding_provider.as_mut() {
            provider.api_key = Some(key);
        }
    }

    Ok(())
}
