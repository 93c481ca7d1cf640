use std::path::{Path, PathBuf};

use anyhow::Context;
use serde_json::{json, Map, Value};

use crate::db::models::{value_format, variable_type, Workspace};
use crate::error::{Error, Result};
use crate::variables::ExecutionVariable;

pub const MAIN_FILE: &str = "main.tf.json";
pub const PROVIDER_FILE: &str = "provider.tf.json";
pub const VARIABLES_FILE: &str = "variables.tf.json";
pub const TFVARS_FILE: &str = "terraform.tfvars.json";
pub const REMOTE_DATA_FILE: &str = "remote_data.tf.json";
pub const STATE_FILE: &str = "terraform.tfstate";
pub const PLAN_FILE: &str = "plan.out";

/// Files copied out of a directory source.
const SOURCE_PATTERNS: &[&str] = &["*.tf", "*.tf.json", "*.tfvars"];

/// Everything a run needs besides the files on disk.
#[derive(Debug, Default)]
pub struct PreparedWorkdir {
    pub dir: PathBuf,
    pub env: Vec<(String, String)>,
    /// Extra CLI arguments taken from `TF_CLI_ARGS`.
    pub extra_args: Vec<String>,
    pub files: Vec<String>,
}

/// Inputs for [`prepare`], already loaded from the database.
pub struct WorkdirInputs<'a> {
    pub workspace: &'a Workspace,
    pub variables: &'a [ExecutionVariable],
    pub remote_data: Option<&'a Value>,
    pub state: Option<&'a str>,
}

/// `<root>/<workspace_id>/<task_id>`.
pub fn task_dir(root: &Path, workspace_id: &str, task_id: i64) -> PathBuf {
    root.join(workspace_id).join(task_id.to_string())
}

/// Lay out the working tree for one run. The directory is recreated empty.
pub fn prepare(dir: &Path, inputs: &WorkdirInputs<'_>) -> Result<PreparedWorkdir> {
    if dir.exists() {
        std::fs::remove_dir_all(dir)
            .with_context(|| format!("Failed to clear {}", dir.display()))?;
    }
    std::fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;

    let mut files = materialize_source(inputs.workspace, dir)?;

    if let Some(provider) = &inputs.workspace.provider_config {
        write_json(dir, PROVIDER_FILE, &clean_provider_config(provider))?;
        files.push(PROVIDER_FILE.to_string());
    }

    let (declarations, values) = render_variables(inputs.variables);
    if let Some(declarations) = declarations {
        write_json(dir, VARIABLES_FILE, &declarations)?;
        write_json(dir, TFVARS_FILE, &values)?;
        files.push(VARIABLES_FILE.to_string());
        files.push(TFVARS_FILE.to_string());
    }

    if let Some(remote) = inputs.remote_data {
        write_json(dir, REMOTE_DATA_FILE, remote)?;
        files.push(REMOTE_DATA_FILE.to_string());
    }

    if let Some(state) = inputs.state {
        std::fs::write(dir.join(STATE_FILE), state)
            .with_context(|| format!("Failed to write {}", STATE_FILE))?;
        files.push(STATE_FILE.to_string());
    }

    let (env, extra_args) =
        build_environment(inputs.variables, inputs.workspace.provider_config.as_ref());

    Ok(PreparedWorkdir {
        dir: dir.to_path_buf(),
        env,
        extra_args,
        files,
    })
}

// ─── Source ─────────────────────────────────────────────────────────────────

/// Write the workspace's configuration into `dir`; returns the files created.
pub fn materialize_source(workspace: &Workspace, dir: &Path) -> Result<Vec<String>> {
    if let Some(code) = workspace.tf_code.as_ref().filter(|c| !is_empty_json(c)) {
        write_json(dir, MAIN_FILE, code)?;
        return Ok(vec![MAIN_FILE.to_string()]);
    }

    let Some(source) = workspace.source_path.as_deref().filter(|s| !s.is_empty()) else {
        return Err(Error::Validation(format!(
            "workspace {} has no configuration source",
            workspace.workspace_id
        )));
    };
    let source = Path::new(source);
    let name = source.to_string_lossy().to_lowercase();

    let files = if source.is_dir() {
        copy_directory_source(source, dir)?
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        extract_tarball(source, dir)?
    } else if name.ends_with(".zip") {
        extract_zip(source, dir)?
    } else {
        return Err(Error::Validation(format!(
            "unsupported source {}: expected a directory, .tar.gz, .tgz or .zip",
            source.display()
        )));
    };
    tracing::debug!(source = %source.display(), files = files.len(), "Materialized source");
    Ok(files)
}

fn copy_directory_source(source: &Path, dir: &Path) -> Result<Vec<String>> {
    let mut copied = Vec::new();
    for pattern in SOURCE_PATTERNS {
        let pattern = source.join(pattern);
        let entries = glob::glob(&pattern.to_string_lossy())
            .map_err(|e| Error::Validation(format!("invalid source path: {}", e)))?;
        for entry in entries.flatten() {
            let Some(file_name) = entry.file_name() else {
                continue;
            };
            let file_name = file_name.to_string_lossy().to_string();
            if copied.contains(&file_name) {
                continue;
            }
            std::fs::copy(&entry, dir.join(&file_name))
                .with_context(|| format!("Failed to copy {}", entry.display()))?;
            copied.push(file_name);
        }
    }
    if copied.is_empty() {
        return Err(Error::Validation(format!(
            "no configuration files found in {}",
            source.display()
        )));
    }
    Ok(copied)
}

fn extract_tarball(archive_path: &Path, dir: &Path) -> Result<Vec<String>> {
    let file = std::fs::File::open(archive_path)
        .with_context(|| format!("Failed to open {}", archive_path.display()))?;
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(file));
    let mut extracted = Vec::new();
    for entry in archive
        .entries()
        .with_context(|| format!("Failed to read {}", archive_path.display()))?
    {
        let mut entry = entry.context("Corrupt tar entry")?;
        // unpack_in refuses paths escaping `dir`
        if entry.unpack_in(dir).context("Failed to unpack tar entry")? {
            extracted.push(entry.path().context("Bad tar path")?.to_string_lossy().to_string());
        }
    }
    Ok(extracted)
}

fn extract_zip(archive_path: &Path, dir: &Path) -> Result<Vec<String>> {
    let file = std::fs::File::open(archive_path)
        .with_context(|| format!("Failed to open {}", archive_path.display()))?;
    let mut archive = zip::ZipArchive::new(file).context("Failed to read zip archive")?;
    let mut extracted = Vec::new();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).context("Corrupt zip entry")?;
        let Some(relative) = entry.enclosed_name() else {
            tracing::warn!(name = entry.name(), "Skipping zip entry outside the archive root");
            continue;
        };
        let out_path = dir.join(&relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }
        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut outfile = std::fs::File::create(&out_path)
            .with_context(|| format!("Failed to create {}", out_path.display()))?;
        std::io::copy(&mut entry, &mut outfile)?;
        extracted.push(relative.to_string_lossy().to_string());
    }
    Ok(extracted)
}

// ─── Generated files ────────────────────────────────────────────────────────

/// Provider configuration with an empty `terraform` block removed.
pub fn clean_provider_config(config: &Value) -> Value {
    let mut cleaned = config.clone();
    if let Some(map) = cleaned.as_object_mut() {
        let drop_terraform = map.get("terraform").map(is_empty_json).unwrap_or(false);
        if drop_terraform {
            map.remove("terraform");
        }
    }
    cleaned
}

/// `variables.tf.json` and `terraform.tfvars.json` bodies for the
/// terraform-type variables; `(None, {})` when there are none.
pub fn render_variables(variables: &[ExecutionVariable]) -> (Option<Value>, Value) {
    let mut declarations = Map::new();
    let mut values = Map::new();
    for var in variables
        .iter()
        .filter(|v| v.variable_type == variable_type::TERRAFORM)
    {
        let mut decl = Map::new();
        decl.insert("type".into(), Value::String("string".into()));
        if !var.description.is_empty() {
            decl.insert("description".into(), Value::String(var.description.clone()));
        }
        if var.sensitive {
            decl.insert("sensitive".into(), Value::Bool(true));
        }
        if var.value_format == value_format::HCL && hcl_literal(&var.value).is_some() {
            // structured values need a looser type than string
            decl.insert("type".into(), Value::String("any".into()));
        }
        declarations.insert(var.key.clone(), Value::Object(decl));
        values.insert(var.key.clone(), tfvar_value(var));
    }
    if declarations.is_empty() {
        return (None, json!({}));
    }
    (
        Some(json!({ "variable": declarations })),
        Value::Object(values),
    )
}

/// Value written to the tfvars file. `hcl` values that are JSON literals
/// (objects, lists, booleans, numbers) are written as such; everything
/// else is a string.
pub fn tfvar_value(var: &ExecutionVariable) -> Value {
    if var.value_format == value_format::HCL {
        if let Some(literal) = hcl_literal(&var.value) {
            return literal;
        }
    }
    Value::String(var.value.clone())
}

fn hcl_literal(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    let looks_literal = trimmed.starts_with('{')
        || trimmed.starts_with('[')
        || trimmed == "true"
        || trimmed == "false"
        || trimmed.parse::<f64>().is_ok();
    if !looks_literal {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

/// Process environment and extra CLI arguments for the toolchain.
///
/// `TF_CLI_ARGS` is split on whitespace instead of being exported. The AWS
/// region of the first `aws` provider block fills `AWS_REGION` and
/// `AWS_DEFAULT_REGION` unless the user set them.
pub fn build_environment(
    variables: &[ExecutionVariable],
    provider_config: Option<&Value>,
) -> (Vec<(String, String)>, Vec<String>) {
    let mut env: Vec<(String, String)> = Vec::new();
    let mut extra_args = Vec::new();

    for var in variables
        .iter()
        .filter(|v| v.variable_type == variable_type::ENVIRONMENT)
    {
        if var.key == "TF_CLI_ARGS" {
            extra_args.extend(var.value.split_whitespace().map(str::to_string));
            continue;
        }
        env.push((var.key.clone(), var.value.clone()));
    }

    if let Some(region) = provider_config.and_then(aws_region) {
        for key in ["AWS_REGION", "AWS_DEFAULT_REGION"] {
            if !env.iter().any(|(k, _)| k == key) {
                env.push((key.to_string(), region.clone()));
            }
        }
    }

    (env, extra_args)
}

fn aws_region(provider_config: &Value) -> Option<String> {
    let aws = provider_config
        .get("provider")
        .and_then(|p| p.get("aws"))
        .or_else(|| provider_config.get("aws"))?;
    let block = match aws {
        Value::Array(blocks) => blocks.first()?,
        other => other,
    };
    block
        .get("region")
        .and_then(|r| r.as_str())
        .filter(|r| !r.is_empty())
        .map(str::to_string)
}

pub fn write_json(dir: &Path, file_name: &str, value: &Value) -> Result<()> {
    let body = serde_json::to_string_pretty(value)?;
    let path = dir.join(file_name);
    std::fs::write(&path, body).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

fn is_empty_json(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}
