use chrono::{DateTime, TimeZone, Utc};
use moka::future::Cache;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::metrics::record_sync_operation;
use crate::models::{AttemptSyncStats, ConnectionStats, SyncStats};

const LATENCY_WINDOW: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOperation {
    AutoSave,
    Synchronize,
    ForcedSync,
}

impl SyncOperation {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncOperation::AutoSave => "auto_save",
            SyncOperation::Synchronize => "synchronize",
            SyncOperation::ForcedSync => "force_sync",
        }
    }
}

/// Aggregate and per-attempt sync counters.
///
/// Counters only ever increment; the latency window keeps the last
/// [`LATENCY_WINDOW`] samples. Per-attempt counters are dropped once the
/// attempt has seen no operation for the idle window.
pub struct SyncStatsRecorder {
    total_sync_operations: AtomicU64,
    conflict_resolutions: AtomicU64,
    auto_save_operations: AtomicU64,
    // unix millis, 0 = never
    last_sync_millis: AtomicI64,
    latencies_ms: Mutex<VecDeque<f64>>,
    per_attempt: Cache<String, Arc<Mutex<AttemptSyncStats>>>,
}

impl SyncStatsRecorder {
    pub fn new(attempt_idle: Duration) -> Self {
        Self {
            total_sync_operations: AtomicU64::new(0),
            conflict_resolutions: AtomicU64::new(0),
            auto_save_operations: AtomicU64::new(0),
            last_sync_millis: AtomicI64::new(0),
            latencies_ms: Mutex::new(VecDeque::with_capacity(LATENCY_WINDOW)),
            per_attempt: Cache::builder().time_to_idle(attempt_idle).build(),
        }
    }

    pub async fn record(
        &self,
        attempt_id: &str,
        operation: SyncOperation,
        latency: Duration,
        success: bool,
        conflicts: usize,
    ) {
        record_sync_operation(operation.as_str(), success);

        let now = Utc::now();
        self.total_sync_operations.fetch_add(1, Ordering::Relaxed);
        self.conflict_resolutions
            .fetch_add(conflicts as u64, Ordering::Relaxed);
        if operation == SyncOperation::AutoSave {
            self.auto_save_operations.fetch_add(1, Ordering::Relaxed);
        }
        if success {
            self.last_sync_millis
                .fetch_max(now.timestamp_millis(), Ordering::Relaxed);
        }
        self.push_latency(latency.as_secs_f64() * 1000.0);

        let slot = self
            .per_attempt
            .get_with(attempt_id.to_string(), async {
                Arc::new(Mutex::new(AttemptSyncStats {
                    attempt_id: attempt_id.to_string(),
                    ..Default::default()
                }))
            })
            .await;
        let Ok(mut entry) = slot.lock() else {
            tracing::error!("Stats lock for attempt {} poisoned, sample dropped", attempt_id);
            return;
        };
        entry.sync_operations += 1;
        entry.conflict_resolutions += conflicts as u64;
        if operation == SyncOperation::AutoSave {
            entry.auto_save_operations += 1;
        }
        if success {
            entry.last_sync_time = Some(now);
        } else {
            entry.failed_operations += 1;
        }
    }

    pub fn snapshot(&self, connections: ConnectionStats) -> SyncStats {
        SyncStats {
            active_connections: connections.active_connections,
            active_attempts: connections.active_attempts,
            total_sync_operations: self.total_sync_operations.load(Ordering::Relaxed),
            conflict_resolutions: self.conflict_resolutions.load(Ordering::Relaxed),
            auto_save_operations: self.auto_save_operations.load(Ordering::Relaxed),
            average_latency_ms: self.average_latency_ms(),
            last_sync_time: self.last_sync_time(),
        }
    }

    pub async fn attempt_stats(&self, attempt_id: &str) -> Option<AttemptSyncStats> {
        let slot = self.per_attempt.get(attempt_id).await?;
        let stats = slot.lock().ok()?.clone();
        Some(stats)
    }

    fn push_latency(&self, latency_ms: f64) {
        match self.latencies_ms.lock() {
            Ok(mut window) => {
                if window.len() == LATENCY_WINDOW {
                    window.pop_front();
                }
                window.push_back(latency_ms);
            }
            Err(_) => tracing::error!("Latency window lock poisoned, sample dropped"),
        }
    }

    fn average_latency_ms(&self) -> f64 {
        match self.latencies_ms.lock() {
            Ok(window) if !window.is_empty() => window.iter().sum::<f64>() / window.len() as f64,
            _ => 0.0,
        }
    }

    fn last_sync_time(&self) -> Option<DateTime<Utc>> {
        match self.last_sync_millis.load(Ordering::Relaxed) {
            0 => None,
            millis => Utc.timestamp_millis_opt(millis).single(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> SyncStatsRecorder {
        SyncStatsRecorder::new(Duration::from_secs(60))
    }

    #[tokio::test]
    async fn aggregates_and_per_attempt_counters() {
        let stats = recorder();
        stats.record("a1", SyncOperation::AutoSave, Duration::from_millis(10), true, 0).await;
        stats.record("a1", SyncOperation::Synchronize, Duration::from_millis(30), true, 2).await;
        stats.record("a2", SyncOperation::AutoSave, Duration::from_millis(20), false, 0).await;

        let snapshot = stats.snapshot(ConnectionStats {
            active_connections: 3,
            active_attempts: 2,
        });
        assert_eq!(snapshot.total_sync_operations, 3);
        assert_eq!(snapshot.auto_save_operations, 2);
        assert_eq!(snapshot.conflict_resolutions, 2);
        assert_eq!(snapshot.active_connections, 3);
        assert!((snapshot.average_latency_ms - 20.0).abs() < 0.5);
        assert!(snapshot.last_sync_time.is_some());

        let a1 = stats.attempt_stats("a1").await.unwrap();
        assert_eq!(a1.sync_operations, 2);
        assert_eq!(a1.conflict_resolutions, 2);
        let a2 = stats.attempt_stats("a2").await.unwrap();
        assert_eq!(a2.failed_operations, 1);
        assert!(a2.last_sync_time.is_none());
    }

    #[tokio::test]
    async fn latency_window_is_bounded() {
        let stats = recorder();
        for _ in 0..LATENCY_WINDOW {
            stats.record("a1", SyncOperation::AutoSave, Duration::from_millis(1000), true, 0).await;
        }
        for _ in 0..LATENCY_WINDOW {
            stats.record("a1", SyncOperation::AutoSave, Duration::from_millis(10), true, 0).await;
        }
        assert!((stats.average_latency_ms() - 10.0).abs() < 0.5);
    }

    #[tokio::test]
    async fn idle_attempts_are_dropped_but_aggregates_stay() {
        let stats = SyncStatsRecorder::new(Duration::from_millis(50));
        stats.record("a1", SyncOperation::AutoSave, Duration::from_millis(5), true, 1).await;
        assert!(stats.attempt_stats("a1").await.is_some());

        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(stats.attempt_stats("a1").await.is_none());
        let snapshot = stats.snapshot(ConnectionStats::default());
        assert_eq!(snapshot.total_sync_operations, 1);
        assert_eq!(snapshot.conflict_resolutions, 1);
    }

    #[test]
    fn empty_recorder_reports_nothing() {
        let snapshot = recorder().snapshot(ConnectionStats::default());
        assert_eq!(snapshot.total_sync_operations, 0);
        assert_eq!(snapshot.average_latency_ms, 0.0);
        assert!(snapshot.last_sync_time.is_none());
    }
}
