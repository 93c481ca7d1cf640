use iacore::config::{load, ConfigError};
use tempfile::TempDir;

#[test]
fn test_load_yaml_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("iacore.yaml");
    std::fs::write(
        &path,
        r#"
database:
  path: /var/lib/iacore/core.db
queue:
  max_parallel: 8
  cancel_settle_secs: 2
executor:
  terraform_binary: tofu
  keep_workdir: true
embedding:
  batch_size: 25
embedding_provider:
  endpoint: http://embed.local/v1
  model: text-embedding-3-small
"#,
    )
    .unwrap();

    let config = load(Some(&path)).unwrap();
    assert_eq!(config.database.path.to_str(), Some("/var/lib/iacore/core.db"));
    assert_eq!(config.queue.max_parallel, 8);
    assert_eq!(config.queue.cancel_settle_secs, 2);
    assert_eq!(config.executor.terraform_binary, "tofu");
    assert!(config.executor.keep_workdir);
    assert_eq!(config.embedding.batch_size, 25);
    // Unset sections keep their defaults.
    assert_eq!(config.embedding.max_retries, 3);
    let provider = config.embedding_provider.unwrap();
    assert_eq!(provider.model, "text-embedding-3-small");
}

#[test]
fn test_missing_file_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let config = load(Some(&dir.path().join("absent.yaml"))).unwrap();
    assert_eq!(config.executor.terraform_binary, "terraform");
    assert!(!config.executor.keep_workdir);
}

#[test]
fn test_malformed_file_reports_path() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("broken.yaml");
    std::fs::write(&path, "queue: [not, a, map").unwrap();

    let err = load(Some(&path)).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }));
    assert!(err.to_string().contains("broken.yaml"));
}
