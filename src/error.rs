use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the orchestration core.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    // ─── Validation ─────────────────────────────────────────────────────────
    #[error("{0}")]
    Validation(String),

    #[error("lineage mismatch: expected {expected}, got {actual}. Use force=true to bypass validation")]
    LineageMismatch { expected: String, actual: String },

    #[error("serial must be greater than current ({current}), got {proposed}. Use force=true to bypass validation")]
    SerialNotAscending { current: i64, proposed: i64 },

    #[error("{0}")]
    ForceRequired(String),

    #[error("illegal workspace transition from {from} to {to}")]
    IllegalTransition { from: String, to: String },

    #[error("provider credentials unavailable: {0}")]
    ProviderCredential(String),

    // ─── Conflict ───────────────────────────────────────────────────────────
    #[error("{0}")]
    Conflict(String),

    #[error("version conflict: current version is {current}, expected {expected}")]
    VersionConflict { current: i64, expected: i64 },

    // ─── Not found ──────────────────────────────────────────────────────────
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("target version {0} not found")]
    VersionNotFound(i64),

    #[error("no active editing session for resource {resource_id} (session {session_id})")]
    NotEditing { resource_id: i64, session_id: String },

    // ─── Locks ──────────────────────────────────────────────────────────────
    #[error("workspace is already locked by {locked_by}: {reason}")]
    LockHeldByOther { locked_by: String, reason: String },

    #[error("{0}")]
    LockHeld(String),

    // ─── Execution ──────────────────────────────────────────────────────────
    #[error("{phase} failed with exit code {exit_code}: {output_tail}")]
    Toolchain {
        phase: String,
        exit_code: i32,
        output_tail: String,
    },

    #[error("{service} call failed{}: {message}", .status.map(|s| format!(" (status {s})")).unwrap_or_default())]
    External {
        service: String,
        status: Option<u16>,
        message: String,
    },

    #[error("{0}")]
    Cancelled(String),

    #[error("operation timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("transient failure: {0}")]
    Transient(String),

    // ─── Infrastructure ─────────────────────────────────────────────────────
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type using the core [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Stable, machine-readable classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    LockHeld,
    Toolchain,
    External,
    Cancelled,
    Transient,
    Internal,
}

impl ErrorKind {
    pub fn tag(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::LockHeld => "lock_held",
            ErrorKind::Toolchain => "toolchain",
            ErrorKind::External => "external",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Transient => "transient",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation(_)
            | Error::LineageMismatch { .. }
            | Error::SerialNotAscending { .. }
            | Error::ForceRequired(_)
            | Error::IllegalTransition { .. }
            | Error::ProviderCredential(_) => ErrorKind::Validation,
            Error::Conflict(_) | Error::VersionConflict { .. } => ErrorKind::Conflict,
            Error::NotFound { .. } | Error::VersionNotFound(_) | Error::NotEditing { .. } => {
                ErrorKind::NotFound
            }
            Error::LockHeldByOther { .. } | Error::LockHeld(_) => ErrorKind::LockHeld,
            Error::Toolchain { .. } => ErrorKind::Toolchain,
            Error::External { .. } => ErrorKind::External,
            Error::Cancelled(_) | Error::Timeout(_) => ErrorKind::Cancelled,
            Error::Transient(_) => ErrorKind::Transient,
            Error::Database(_) | Error::Json(_) | Error::Io(_) | Error::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Only transient failures are eligible for an automatic retry.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }

    pub fn not_found(entity: &'static str, id: impl std::fmt::Display) -> Self {
        Error::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub(crate) fn internal(err: impl std::fmt::Display) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<Error>() {
            Ok(inner) => inner,
            Err(other) => Error::Internal(format!("{:#}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_are_stable() {
        assert_eq!(Error::Validation("x".into()).kind().tag(), "validation");
        assert_eq!(
            Error::Conflict("creating this trigger would create a circular dependency".into())
                .kind()
                .tag(),
            "conflict"
        );
        assert_eq!(Error::VersionNotFound(3).kind(), ErrorKind::NotFound);
        assert_eq!(Error::Timeout(Duration::from_secs(5)).kind(), ErrorKind::Cancelled);
        assert_eq!(
            Error::LockHeldByOther {
                locked_by: "alice".into(),
                reason: "r".into()
            }
            .kind(),
            ErrorKind::LockHeld
        );
    }

    #[test]
    fn test_serial_message_is_actionable() {
        let err = Error::SerialNotAscending {
            current: 42,
            proposed: 39,
        };
        assert_eq!(
            err.to_string(),
            "serial must be greater than current (42), got 39. Use force=true to bypass validation"
        );
    }

    #[test]
    fn test_external_message_includes_status() {
        let err = Error::External {
            service: "embedding".into(),
            status: Some(429),
            message: "rate limited".into(),
        };
        assert_eq!(err.to_string(), "embedding call failed (status 429): rate limited");
        assert!(!err.is_retryable());
        assert!(Error::Transient("reset".into()).is_retryable());
    }

    #[test]
    fn test_anyhow_roundtrip_keeps_core_error() {
        let wrapped: anyhow::Error = Error::VersionNotFound(7).into();
        let back: Error = wrapped.into();
        assert!(matches!(back, Error::VersionNotFound(7)));
    }
}
