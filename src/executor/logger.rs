use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;

use super::stream::{MessageKind, OutputMessage, OutputStream};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Parse a level name; anything unknown is `Info`.
    pub fn parse(level: &str) -> Self {
        match level.trim().to_ascii_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }

    /// Workspace override first, then the process default.
    pub fn resolve(workspace_override: Option<&str>, default: &str) -> Self {
        match workspace_override.filter(|l| !l.trim().is_empty()) {
            Some(level) => LogLevel::parse(level),
            None => LogLevel::parse(default),
        }
    }

    fn tag(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Per-task output log.
///
/// Every line goes to the task's [`OutputStream`] (if any) and into the full
/// text that is later stored on the task row. Toolchain output passes
/// through [`TaskLogger::raw`] unmodified; everything else is prefixed with
/// `[HH:MM:SS.mmm] [LEVEL]` and filtered by the configured level.
pub struct TaskLogger {
    task_id: i64,
    level: LogLevel,
    stream: Option<Arc<OutputStream>>,
    full_output: Mutex<String>,
    line_num: AtomicU64,
}

impl TaskLogger {
    pub fn new(task_id: i64, level: LogLevel, stream: Option<Arc<OutputStream>>) -> Self {
        Self {
            task_id,
            level,
            stream,
            full_output: Mutex::new(String::new()),
            line_num: AtomicU64::new(0),
        }
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn trace(&self, msg: impl AsRef<str>) {
        self.log(LogLevel::Trace, msg.as_ref());
    }

    pub fn debug(&self, msg: impl AsRef<str>) {
        self.log(LogLevel::Debug, msg.as_ref());
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        self.log(LogLevel::Info, msg.as_ref());
    }

    pub fn warn(&self, msg: impl AsRef<str>) {
        self.log(LogLevel::Warn, msg.as_ref());
    }

    pub fn error(&self, msg: impl AsRef<str>) {
        self.log(LogLevel::Error, msg.as_ref());
    }

    fn log(&self, level: LogLevel, msg: &str) {
        if level < self.level {
            return;
        }
        let line = format!("[{}] [{}] {}", Utc::now().format("%H:%M:%S%.3f"), level, msg);
        let kind = if level == LogLevel::Error {
            MessageKind::Error
        } else {
            MessageKind::Output
        };
        tracing::debug!(task_id = self.task_id, "{}", line);
        self.emit(kind, line, None, None);
    }

    /// Toolchain stdout, unmodified and untraced.
    pub fn raw(&self, line: &str) {
        self.emit(MessageKind::Output, line.to_string(), None, None);
    }

    /// Toolchain stderr, unmodified and untraced.
    pub fn raw_error(&self, line: &str) {
        self.emit(MessageKind::Error, line.to_string(), None, None);
    }

    pub fn stage_begin(&self, stage: &str) {
        self.stage_marker(stage, "BEGIN", "begin");
    }

    pub fn stage_end(&self, stage: &str) {
        self.stage_marker(stage, "END", "end");
    }

    fn stage_marker(&self, stage: &str, word: &str, status: &str) {
        let line = format!(
            "========== {} {} at {} ==========",
            stage.to_ascii_uppercase(),
            word,
            Utc::now().format("%Y-%m-%d %H:%M:%S%.3f")
        );
        tracing::debug!(task_id = self.task_id, "{}", line);
        self.emit(
            MessageKind::StageMarker,
            line,
            Some(stage.to_string()),
            Some(status.to_string()),
        );
    }

    fn emit(&self, kind: MessageKind, line: String, stage: Option<String>, status: Option<String>) {
        let line_num = self.line_num.fetch_add(1, Ordering::Relaxed) + 1;
        if let Ok(mut full) = self.full_output.lock() {
            full.push_str(&line);
            full.push('\n');
        }
        if let Some(stream) = &self.stream {
            stream.publish(OutputMessage {
                kind,
                line,
                timestamp: crate::db::now(),
                line_num,
                stage,
                status,
            });
        }
    }

    /// Everything logged so far.
    pub fn full_output(&self) -> String {
        self.full_output
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Close the attached stream with a final summary line.
    pub fn complete(&self, summary: &str) {
        if let Some(stream) = &self.stream {
            stream.close(summary, self.line_num.load(Ordering::Relaxed) + 1);
        }
    }
}
