use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Aggregate view returned by `stats()`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncStats {
    pub active_connections: usize,
    pub active_attempts: usize,
    pub total_sync_operations: u64,
    pub conflict_resolutions: u64,
    pub auto_save_operations: u64,
    pub average_latency_ms: f64,
    pub last_sync_time: Option<DateTime<Utc>>,
}

/// Counters kept for a single attempt.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AttemptSyncStats {
    pub attempt_id: String,
    pub sync_operations: u64,
    pub auto_save_operations: u64,
    pub conflict_resolutions: u64,
    pub failed_operations: u64,
    pub last_sync_time: Option<DateTime<Utc>>,
}
