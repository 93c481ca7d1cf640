use std::path::{Path, PathBuf};
use std::process::Stdio;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::logger::TaskLogger;
use super::plan_parser;
use crate::error::{Error, Result};

/// Environment every toolchain invocation runs with.
pub const BASE_ENV: &[(&str, &str)] = &[
    ("TF_IN_AUTOMATION", "true"),
    ("TF_INPUT", "false"),
    ("TF_REGISTRY_CLIENT_TIMEOUT", "60"),
];

/// Lines of stderr kept in a toolchain error.
pub const ERROR_TAIL_LINES: usize = 20;

/// Result of a toolchain command execution.
#[derive(Debug, Default)]
pub struct TerraformResult {
    pub exit_code: i32,
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
}

impl TerraformResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Extract a human-readable error message from the result.
    pub fn error_message(&self) -> String {
        // JSON diagnostics first
        let json_errors = plan_parser::extract_errors(&self.stdout_lines);
        if !json_errors.is_empty() {
            return json_errors.join("; ");
        }

        let start = self.stderr_lines.len().saturating_sub(ERROR_TAIL_LINES);
        let stderr = self.stderr_lines[start..].join("\n");
        if !stderr.trim().is_empty() {
            return stderr;
        }

        // Plain stdout for non-JSON error output
        let meaningful: Vec<&String> = self
            .stdout_lines
            .iter()
            .filter(|l| !l.trim().is_empty())
            .collect();
        if !meaningful.is_empty() {
            return meaningful
                .iter()
                .rev()
                .take(5)
                .rev()
                .map(|s| s.as_str())
                .collect::<Vec<_>>()
                .join("\n");
        }

        format!("exit code {}", self.exit_code)
    }

    /// `Toolchain` error for a non-zero exit, otherwise the result itself.
    pub fn ensure_success(self, phase: &str) -> Result<Self> {
        if self.success() {
            return Ok(self);
        }
        Err(Error::Toolchain {
            phase: phase.to_string(),
            exit_code: self.exit_code,
            output_tail: self.error_message(),
        })
    }
}

/// The IaC command line the executor drives.
#[async_trait]
pub trait Toolchain: Send + Sync {
    /// Run one command in `dir`, streaming each output line through `logger`.
    ///
    /// Cancelling `cancel` kills the process and yields `Error::Cancelled`.
    async fn run(
        &self,
        dir: &Path,
        args: &[String],
        env: &[(String, String)],
        logger: &TaskLogger,
        cancel: &CancellationToken,
    ) -> Result<TerraformResult>;
}

/// Spawns the configured terraform/tofu binary.
pub struct TerraformCli {
    binary: String,
    plugin_cache_dir: Option<PathBuf>,
}

impl TerraformCli {
    pub fn new(binary: impl Into<String>, plugin_cache_dir: Option<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            plugin_cache_dir,
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }
}

#[async_trait]
impl Toolchain for TerraformCli {
    async fn run(
        &self,
        dir: &Path,
        args: &[String],
        env: &[(String, String)],
        logger: &TaskLogger,
        cancel: &CancellationToken,
    ) -> Result<TerraformResult> {
        tracing::info!(binary = %self.binary, args = ?args, dir = %dir.display(), "Running terraform");

        let mut cmd = Command::new(&self.binary);
        cmd.args(args)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in BASE_ENV {
            cmd.env(key, value);
        }
        if let Some(cache) = &self.plugin_cache_dir {
            std::fs::create_dir_all(cache)
                .with_context(|| format!("Failed to create plugin cache {}", cache.display()))?;
            cmd.env("TF_PLUGIN_CACHE_DIR", cache);
        }
        for (key, value) in env {
            cmd.env(key, value);
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("Failed to spawn {} in {}", self.binary, dir.display()))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::internal("child stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::internal("child stderr was not captured"))?;

        let mut stdout_stream = BufReader::new(stdout).lines();
        let mut stderr_stream = BufReader::new(stderr).lines();
        let mut result = TerraformResult::default();
        let mut stdout_open = true;
        let mut stderr_open = true;

        while stdout_open || stderr_open {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    tracing::warn!(dir = %dir.display(), "Terraform command killed on cancellation");
                    return Err(Error::Cancelled("toolchain command cancelled".into()));
                }
                line = stdout_stream.next_line(), if stdout_open => match line {
                    Ok(Some(line)) => {
                        logger.raw(&line);
                        result.stdout_lines.push(line);
                    }
                    _ => stdout_open = false,
                },
                line = stderr_stream.next_line(), if stderr_open => match line {
                    Ok(Some(line)) => {
                        logger.raw_error(&line);
                        result.stderr_lines.push(line);
                    }
                    _ => stderr_open = false,
                },
            }
        }

        let status = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(Error::Cancelled("toolchain command cancelled".into()));
            }
            status = child.wait() => status?,
        };
        result.exit_code = status.code().unwrap_or(-1);

        tracing::info!(exit_code = result.exit_code, "Terraform command completed");
        Ok(result)
    }
}

/// Remove `-target` arguments in every spelling the CLI accepts.
pub fn strip_target_args(args: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    let mut skip_next = false;
    for arg in args {
        if skip_next {
            skip_next = false;
            continue;
        }
        if arg == "-target" || arg == "--target" {
            skip_next = true;
            continue;
        }
        if arg.starts_with("-target=") || arg.starts_with("--target=") {
            continue;
        }
        out.push(arg.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_error_message_preference() {
        let result = TerraformResult {
            exit_code: 1,
            stdout_lines: strings(&["a", "", "b", "c", "d", "e", "f"]),
            stderr_lines: vec![],
        };
        assert_eq!(result.error_message(), "b\nc\nd\ne\nf");

        let result = TerraformResult {
            exit_code: 1,
            stdout_lines: strings(&["ignored"]),
            stderr_lines: strings(&["Error: boom"]),
        };
        assert_eq!(result.error_message(), "Error: boom");

        let result = TerraformResult {
            exit_code: 3,
            ..Default::default()
        };
        assert_eq!(result.error_message(), "exit code 3");
    }

    #[test]
    fn test_error_message_keeps_stderr_tail() {
        let stderr: Vec<String> = (1..=50).map(|n| format!("stderr {}", n)).collect();
        let result = TerraformResult {
            exit_code: 1,
            stdout_lines: vec![],
            stderr_lines: stderr,
        };
        let message = result.error_message();
        let lines: Vec<&str> = message.lines().collect();
        assert_eq!(lines.len(), ERROR_TAIL_LINES);
        assert_eq!(lines[0], "stderr 31");
        assert_eq!(lines[ERROR_TAIL_LINES - 1], "stderr 50");
    }

    #[test]
    fn test_ensure_success_maps_to_toolchain_error() {
        let result = TerraformResult {
            exit_code: 1,
            stdout_lines: vec![],
            stderr_lines: strings(&["Error: Invalid reference"]),
        };
        let err = result.ensure_success("plan").unwrap_err();
        assert_eq!(
            err.to_string(),
            "plan failed with exit code 1: Error: Invalid reference"
        );
    }

    #[test]
    fn test_strip_target_args() {
        let args = strings(&[
            "-target=aws_vpc.a",
            "-parallelism=5",
            "--target",
            "aws_vpc.b",
            "-target",
            "aws_vpc.c",
            "--target=aws_vpc.d",
            "-lock=false",
        ]);
        assert_eq!(strip_target_args(&args), strings(&["-parallelism=5", "-lock=false"]));
    }
}
