use serde::{Deserialize, Serialize};

use super::attempt::AttemptState;
use super::change::IncomingChanges;
use crate::error::SyncFailure;

/// How a detected conflict is settled before the single bounded retry.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStrategy {
    /// Local value wins for touched question ids, server keeps the rest.
    #[default]
    Merge,
    /// Local batch is written unconditionally.
    Local,
    /// Local values for conflicting question ids are discarded.
    Server,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::Merge => "merge",
            ConflictStrategy::Local => "local",
            ConflictStrategy::Server => "server",
        }
    }
}

/// Resolution applied to one conflicting question id.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    KeptLocal,
    KeptServer,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncConflict {
    pub question_id: String,
    pub local_value: serde_json::Value,
    pub server_value: serde_json::Value,
    pub resolution: Resolution,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AutoSaveConfig {
    pub batch_size: usize,
    /// Attempts per batch for transient failures (1 = no retry).
    pub max_retries: usize,
    pub conflict_strategy: ConflictStrategy,
}

impl Default for AutoSaveConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            max_retries: 3,
            conflict_strategy: ConflictStrategy::Merge,
        }
    }
}

/// Result of an auto-save or synchronize call.
///
/// `success` is false whenever anything failed, but `version` always reports
/// the last version this call knows to be persisted, so callers can resume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResult {
    pub success: bool,
    pub version: i64,
    #[serde(default)]
    pub conflicts: Vec<SyncConflict>,
    pub applied_changes: usize,
    /// Events dropped by validation.
    #[serde(default)]
    pub rejected_changes: usize,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub queued: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SyncFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<AttemptState>,
}

impl SyncResult {
    pub fn succeeded(version: i64) -> Self {
        Self {
            success: true,
            version,
            conflicts: Vec::new(),
            applied_changes: 0,
            rejected_changes: 0,
            queued: false,
            error: None,
            state: None,
        }
    }

    pub fn failed(version: i64, error: SyncFailure) -> Self {
        Self {
            success: false,
            error: Some(error),
            ..Self::succeeded(version)
        }
    }

    /// Changes were appended to a connection buffer that another call is
    /// already flushing.
    pub fn queued(version: i64) -> Self {
        Self {
            queued: true,
            ..Self::succeeded(version)
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AutoSaveRequest {
    #[serde(default)]
    pub changes: IncomingChanges,
    pub connection_id: Option<String>,
    /// Version the client's changes were made against. Connections track
    /// their own; without one the attempt's current version is assumed.
    pub expected_version: Option<i64>,
    pub batch_size: Option<usize>,
    pub max_retries: Option<usize>,
    pub conflict_strategy: Option<ConflictStrategy>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SynchronizeRequest {
    pub local_version: i64,
    #[serde(default)]
    pub changes: IncomingChanges,
    pub connection_id: Option<String>,
    pub conflict_strategy: Option<ConflictStrategy>,
}
