use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Instant;

use super::change::ChangeEvent;

/// Bookkeeping for one logical client connection (tab or device).
///
/// Registry state is a hint only; losing it costs batching efficiency,
/// never correctness.
#[derive(Debug, Clone)]
pub struct ConnectionSession {
    pub attempt_id: String,
    pub connection_id: String,
    pub last_activity: Instant,
    pub opened_at: DateTime<Utc>,
    pub pending_changes: VecDeque<ChangeEvent>,
    pub sync_in_progress: bool,
    /// Last version this connection saw persisted.
    pub known_version: i64,
    /// Bumped on every reopen so stale idle watchers exit.
    pub generation: u64,
}

impl ConnectionSession {
    pub fn new(
        attempt_id: impl Into<String>,
        connection_id: impl Into<String>,
        known_version: i64,
        generation: u64,
    ) -> Self {
        Self {
            attempt_id: attempt_id.into(),
            connection_id: connection_id.into(),
            last_activity: Instant::now(),
            opened_at: Utc::now(),
            pending_changes: VecDeque::new(),
            sync_in_progress: false,
            known_version,
            generation,
        }
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectionStats {
    pub active_connections: usize,
    pub active_attempts: usize,
}

#[derive(Debug, Deserialize)]
pub struct OpenConnectionRequest {
    pub connection_id: String,
}
