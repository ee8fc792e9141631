use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::AttemptState;

/// Errors reported by an attempt store implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("attempt {0} not found")]
    NotFound(String),

    /// The expected version was stale; carries the authoritative state.
    #[error("version mismatch, store is at version {}", .0.version)]
    VersionMismatch(Box<AttemptState>),

    #[error("attempt {0} is no longer in progress")]
    AttemptClosed(String),

    #[error("attempt store unavailable: {0}")]
    Unavailable(String),
}

impl From<mongodb::error::Error> for StoreError {
    fn from(err: mongodb::error::Error) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Error taxonomy of the synchronization core.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SyncError {
    /// Unknown attempt id. Never retried.
    #[error("attempt {0} not found")]
    NotFound(String),

    /// Stale expected version. Routed to conflict resolution, never retried blindly.
    #[error("version conflict, store is at version {actual}")]
    VersionConflict { actual: i64 },

    /// Backend failure with no semantic meaning. Retried with backoff.
    #[error("transient backend failure: {0}")]
    Transient(String),

    /// Breaker is open; the backend was not contacted.
    #[error("circuit open for {operation}, retry after {}ms", .retry_after.as_millis())]
    CircuitOpen {
        operation: String,
        retry_after: Duration,
    },

    #[error("invalid change event: {0}")]
    Validation(String),

    #[error("attempt {0} is no longer in progress")]
    AttemptClosed(String),

    /// The save after resolution conflicted again.
    #[error("conflict still unresolved after retry, store is at version {version}")]
    UnresolvedConflict { version: i64 },
}

impl SyncError {
    pub fn kind(&self) -> SyncErrorKind {
        match self {
            SyncError::NotFound(_) => SyncErrorKind::NotFound,
            SyncError::VersionConflict { .. } => SyncErrorKind::VersionConflict,
            SyncError::Transient(_) => SyncErrorKind::Transient,
            SyncError::CircuitOpen { .. } => SyncErrorKind::CircuitOpen,
            SyncError::Validation(_) => SyncErrorKind::Validation,
            SyncError::AttemptClosed(_) => SyncErrorKind::AttemptClosed,
            SyncError::UnresolvedConflict { .. } => SyncErrorKind::UnresolvedConflict,
        }
    }

    /// Only transient failures are worth repeating.
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }

    /// Whether the error says anything about backend health.
    pub fn counts_against_breaker(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }
}

impl From<StoreError> for SyncError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => SyncError::NotFound(id),
            StoreError::VersionMismatch(latest) => SyncError::VersionConflict {
                actual: latest.version,
            },
            StoreError::AttemptClosed(id) => SyncError::AttemptClosed(id),
            StoreError::Unavailable(msg) => SyncError::Transient(msg),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SyncErrorKind {
    NotFound,
    VersionConflict,
    Transient,
    CircuitOpen,
    Validation,
    AttemptClosed,
    UnresolvedConflict,
}

/// Serializable form of [`SyncError`] embedded in results.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncFailure {
    pub kind: SyncErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl From<&SyncError> for SyncFailure {
    fn from(err: &SyncError) -> Self {
        let retry_after_ms = match err {
            SyncError::CircuitOpen { retry_after, .. } => Some(retry_after.as_millis() as u64),
            _ => None,
        };
        Self {
            kind: err.kind(),
            message: err.to_string(),
            retry_after_ms,
        }
    }
}
