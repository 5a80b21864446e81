//! Runtime error type shared by every control-plane component.
//!
//! Kinds map one-to-one onto the user-visible surface: validation,
//! conflict, not-found, denied (approval/quota), transient storage
//! failures, internal. Transient errors are the only ones callers may
//! retry; conflicts always surface unchanged.

use rusqlite::ErrorCode;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("not found: {0}")]
    NotFound(String),
    /// Admission denial with a machine-readable reason code
    /// (e.g. `approval_required`, `quota_exhausted`).
    #[error("denied ({reason}): {message}")]
    Denied { reason: &'static str, message: String },
    #[error("transient storage error: {0}")]
    Transient(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl RuntimeError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::Conflict(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn denied(reason: &'static str, message: impl Into<String>) -> Self {
        Self::Denied {
            reason,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Classify a sqlite driver error: lock contention is retryable, the
/// rest is a bug or corrupt state.
pub(crate) fn map_sqlite_err(context: &str, err: rusqlite::Error) -> RuntimeError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
            ) =>
        {
            RuntimeError::Transient(format!("{context}: {err}"))
        }
        _ => RuntimeError::Internal(format!("{context}: {err}")),
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;
