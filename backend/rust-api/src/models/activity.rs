use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    AutoSave,
    ConflictResolved,
    Synchronize,
    ForcedSync,
    Submitted,
    ConnectionOpened,
    ConnectionClosed,
    ConnectionExpired,
}

/// Append-only activity record for an attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActivityEvent {
    pub attempt_id: String,
    pub kind: ActivityKind,
    pub connection_id: Option<String>,
    #[serde(default)]
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl ActivityEvent {
    pub fn new(attempt_id: impl Into<String>, kind: ActivityKind) -> Self {
        Self {
            attempt_id: attempt_id.into(),
            kind,
            connection_id: None,
            details: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_connection(mut self, connection_id: impl Into<String>) -> Self {
        self.connection_id = Some(connection_id.into());
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}
