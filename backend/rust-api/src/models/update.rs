use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::attempt::ScoreSummary;

/// Events pushed to subscribers of an attempt.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UpdateEvent {
    StateSaved(StateSaved),
    ConflictResolved(ConflictResolved),
    ForcedSync(ForcedSync),
    Submitted(Submitted),
    Heartbeat(Heartbeat),
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct StateSaved {
    pub attempt_id: String,
    pub version: i64,
    pub connection_id: Option<String>,
    pub question_ids: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ConflictResolved {
    pub attempt_id: String,
    pub version: i64,
    pub question_ids: Vec<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ForcedSync {
    pub attempt_id: String,
    pub version: i64,
    pub dropped_changes: usize,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Submitted {
    pub attempt_id: String,
    pub score: ScoreSummary,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Heartbeat {
    pub attempt_id: String,
    pub timestamp: DateTime<Utc>,
}

impl UpdateEvent {
    pub fn to_sse_data(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            UpdateEvent::StateSaved(_) => "state-saved",
            UpdateEvent::ConflictResolved(_) => "conflict-resolved",
            UpdateEvent::ForcedSync(_) => "forced-sync",
            UpdateEvent::Submitted(_) => "submitted",
            UpdateEvent::Heartbeat(_) => "heartbeat",
        }
    }

    pub fn heartbeat(attempt_id: impl Into<String>) -> Self {
        UpdateEvent::Heartbeat(Heartbeat {
            attempt_id: attempt_id.into(),
            timestamp: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_payload_is_tagged() {
        let event = UpdateEvent::heartbeat("a1");
        assert_eq!(event.event_name(), "heartbeat");
        let data: serde_json::Value = serde_json::from_str(&event.to_sse_data()).unwrap();
        assert_eq!(data["type"], "heartbeat");
        assert_eq!(data["attempt_id"], "a1");
    }
}
