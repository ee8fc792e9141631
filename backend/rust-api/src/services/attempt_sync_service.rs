use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

use super::activity_log::{ActivityRecorder, ActivitySink};
use super::attempt_store::AttemptStore;
use super::auto_save_engine::{AutoSaveEngine, BatchRun};
use super::cache_invalidation::CacheInvalidator;
use super::connection_registry::ConnectionRegistry;
use super::persistence_gateway::PersistenceGateway;
use super::stats_service::{SyncOperation, SyncStatsRecorder};
use super::sync_coordinator::SyncCoordinator;
use super::update_hub::UpdateHub;
use crate::config::SyncSettings;
use crate::error::{SyncError, SyncFailure};
use crate::metrics::INVALID_CHANGES_TOTAL;
use crate::models::update::{ConflictResolved, ForcedSync, StateSaved, Submitted};
use crate::models::{
    ActivityEvent, ActivityKind, AttemptState, AttemptSyncStats, AutoSaveConfig, AutoSaveRequest,
    ChangeEvent, ScoreSummary, SyncConflict, SyncResult, SyncStats, SynchronizeRequest,
    UpdateEvent,
};

#[derive(Debug, Clone, Serialize)]
pub struct DependencyHealth {
    pub name: &'static str,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub store: DependencyHealth,
    pub cache: DependencyHealth,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.store.healthy && self.cache.healthy
    }
}

/// Caller-facing API of the sync core.
///
/// Every mutating call runs on its own task so that bookkeeping (stats,
/// activity, push events) lands even if the caller stops waiting.
#[derive(Clone)]
pub struct AttemptSyncService {
    gateway: PersistenceGateway,
    registry: Arc<ConnectionRegistry>,
    engine: AutoSaveEngine,
    coordinator: SyncCoordinator,
    stats: Arc<SyncStatsRecorder>,
    activity: ActivityRecorder,
    updates: Arc<UpdateHub>,
    defaults: AutoSaveConfig,
    heartbeat: Duration,
}

impl AttemptSyncService {
    pub fn new(
        store: Arc<dyn AttemptStore>,
        invalidator: Arc<dyn CacheInvalidator>,
        sink: Arc<dyn ActivitySink>,
        settings: &SyncSettings,
    ) -> Self {
        let gateway = PersistenceGateway::new(store, invalidator, settings.gateway_config());
        let activity = ActivityRecorder::new(sink);
        let registry = Arc::new(ConnectionRegistry::new(
            settings.connection_idle(),
            activity.clone(),
        ));
        let defaults = settings.auto_save_defaults();

        Self {
            engine: AutoSaveEngine::new(gateway.clone()),
            coordinator: SyncCoordinator::new(gateway.clone(), registry.clone(), defaults.max_retries),
            gateway,
            registry,
            stats: Arc::new(SyncStatsRecorder::new(settings.stats_idle())),
            activity,
            updates: Arc::new(UpdateHub::new()),
            defaults,
            heartbeat: settings.heartbeat(),
        }
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.heartbeat
    }

    pub async fn get_state(&self, attempt_id: &str) -> Result<AttemptState, SyncError> {
        self.gateway.get_state(attempt_id).await
    }

    /// Registers the connection and returns one authoritative read to seed it.
    pub async fn open_connection(
        &self,
        attempt_id: &str,
        connection_id: &str,
    ) -> Result<AttemptState, SyncError> {
        let state = self.gateway.get_fresh_state(attempt_id).await?;
        self.registry.open(attempt_id, connection_id, state.version);
        Ok(state)
    }

    pub fn close_connection(&self, attempt_id: &str, connection_id: &str) -> bool {
        self.registry.close(attempt_id, connection_id).is_some()
    }

    /// Marks the connection active; false if it is not registered.
    pub fn touch_connection(&self, attempt_id: &str, connection_id: &str) -> bool {
        self.registry.touch(attempt_id, connection_id)
    }

    pub fn auto_save_config(&self, request: &AutoSaveRequest) -> AutoSaveConfig {
        AutoSaveConfig {
            batch_size: request.batch_size.unwrap_or(self.defaults.batch_size).max(1),
            max_retries: request.max_retries.unwrap_or(self.defaults.max_retries).max(1),
            conflict_strategy: request
                .conflict_strategy
                .unwrap_or(self.defaults.conflict_strategy),
        }
    }

    pub async fn auto_save(&self, attempt_id: &str, request: AutoSaveRequest) -> SyncResult {
        let config = self.auto_save_config(&request);
        let malformed = drop_malformed(attempt_id, &request.changes.malformed);
        let changes = request.changes.events;
        let expected_version = request.expected_version;

        let mut result = match request.connection_id {
            Some(connection_id) => {
                self.auto_save_connection(attempt_id, &connection_id, changes, expected_version, config)
                    .await
            }
            None => {
                let service = self.clone();
                let attempt_id = attempt_id.to_string();
                self.join(async move {
                    let started = Instant::now();
                    let run = service
                        .engine
                        .run(&attempt_id, changes, expected_version, config)
                        .await;
                    if !run.unsent.is_empty() {
                        tracing::warn!(
                            "Auto-save for attempt {} left {} changes unsent; caller must resend from v{}",
                            attempt_id,
                            run.unsent.len(),
                            run.result.version
                        );
                    }
                    service.record_run(&attempt_id, None, &run, started).await;
                    run.result
                })
                .await
            }
        };
        result.rejected_changes += malformed;
        result
    }

    /// Buffers `changes` on the connection and flushes the buffer unless a
    /// flush is already running, in which case the changes ride along with
    /// it and the call returns `queued`.
    ///
    /// Every flush expects the version this connection last saw, so a write
    /// made meanwhile by another client surfaces as a conflict.
    pub async fn auto_save_connection(
        &self,
        attempt_id: &str,
        connection_id: &str,
        changes: Vec<ChangeEvent>,
        expected_version: Option<i64>,
        config: AutoSaveConfig,
    ) -> SyncResult {
        if !self.registry.contains(attempt_id, connection_id) {
            match self.gateway.get_state(attempt_id).await {
                Ok(state) => {
                    let seed = expected_version.unwrap_or(state.version);
                    self.registry.ensure(attempt_id, connection_id, seed);
                }
                Err(e) => {
                    return SyncResult::failed(
                        expected_version.unwrap_or_default(),
                        SyncFailure::from(&e),
                    )
                }
            }
        }

        self.registry.enqueue(attempt_id, connection_id, changes);
        if !self.registry.try_begin_sync(attempt_id, connection_id) {
            let version = self
                .registry
                .known_version(attempt_id, connection_id)
                .unwrap_or_default();
            tracing::debug!(
                "Flush in progress for {} on attempt {}, changes queued",
                connection_id,
                attempt_id
            );
            return SyncResult::queued(version);
        }

        let service = self.clone();
        let attempt_id = attempt_id.to_string();
        let connection_id = connection_id.to_string();
        self.join(async move {
            service
                .drain_connection(&attempt_id, &connection_id, config)
                .await
        })
        .await
    }

    async fn drain_connection(
        &self,
        attempt_id: &str,
        connection_id: &str,
        config: AutoSaveConfig,
    ) -> SyncResult {
        let started = Instant::now();
        let mut total: Option<BatchRun> = None;

        loop {
            // 1. Take everything buffered so far, in arrival order
            let pending = self.registry.take_pending(attempt_id, connection_id);
            if pending.is_empty() {
                if self.registry.finish_sync(attempt_id, connection_id) {
                    break;
                }
                continue;
            }

            // 2. Save against the version this connection last saw
            let expected = self.registry.known_version(attempt_id, connection_id);
            let mut run = self.engine.run(attempt_id, pending, expected, config).await;
            if run.result.success || run.batches_saved > 0 {
                self.registry
                    .record_version(attempt_id, connection_id, run.result.version);
            }
            // 3. On failure put the unsent tail back and release the flag
            let failed = !run.result.success;
            if failed {
                let unsent = std::mem::take(&mut run.unsent);
                self.registry.requeue_front(attempt_id, connection_id, unsent);
                self.registry.abort_sync(attempt_id, connection_id);
            }

            match total.as_mut() {
                Some(acc) => acc.absorb(run),
                None => total = Some(run),
            }
            if failed {
                break;
            }
        }

        match total {
            Some(run) => {
                self.record_run(attempt_id, Some(connection_id), &run, started)
                    .await;
                run.result
            }
            None => SyncResult::succeeded(
                self.registry
                    .known_version(attempt_id, connection_id)
                    .unwrap_or_default(),
            ),
        }
    }

    /// Reconciles a client's version and changes. With a `connection_id`
    /// that connection is advanced to the resulting version.
    pub async fn synchronize(&self, attempt_id: &str, request: SynchronizeRequest) -> SyncResult {
        let strategy = request
            .conflict_strategy
            .unwrap_or(self.defaults.conflict_strategy);
        let malformed = drop_malformed(attempt_id, &request.changes.malformed);
        let SynchronizeRequest {
            local_version,
            changes,
            connection_id,
            ..
        } = request;
        let service = self.clone();
        let attempt_id = attempt_id.to_string();

        self.join(async move {
            let started = Instant::now();
            let mut result = service
                .coordinator
                .synchronize(&attempt_id, local_version, changes.events, strategy)
                .await;
            result.rejected_changes += malformed;

            if let Some(connection_id) = connection_id.as_deref().filter(|_| result.success) {
                service
                    .registry
                    .record_version(&attempt_id, connection_id, result.version);
            }
            service
                .stats
                .record(
                    &attempt_id,
                    SyncOperation::Synchronize,
                    started.elapsed(),
                    result.success,
                    result.conflicts.len(),
                )
                .await;
            service.activity.record(
                ActivityEvent::new(attempt_id.as_str(), ActivityKind::Synchronize).with_details(
                    json!({
                        "success": result.success,
                        "local_version": local_version,
                        "version": result.version,
                        "applied_changes": result.applied_changes,
                        "rejected_changes": result.rejected_changes,
                        "conflicts": result.conflicts.len(),
                        "strategy": strategy.as_str(),
                    }),
                ),
            );
            if result.success && result.applied_changes > 0 {
                service.publish_saved(&attempt_id, connection_id.as_deref(), result.version, Vec::new());
            }
            if !result.conflicts.is_empty() {
                service.publish_conflicts(&attempt_id, result.version, &result.conflicts);
            }
            result
        })
        .await
    }

    pub async fn force_sync(&self, attempt_id: &str) -> Result<AttemptState, SyncError> {
        let started = Instant::now();
        let outcome = self.coordinator.force_sync(attempt_id).await;
        self.stats
            .record(
                attempt_id,
                SyncOperation::ForcedSync,
                started.elapsed(),
                outcome.is_ok(),
                0,
            )
            .await;
        let outcome = outcome?;

        self.activity.record(
            ActivityEvent::new(attempt_id, ActivityKind::ForcedSync).with_details(json!({
                "version": outcome.state.version,
                "dropped_changes": outcome.dropped_changes,
            })),
        );
        self.updates.publish(
            attempt_id,
            UpdateEvent::ForcedSync(ForcedSync {
                attempt_id: attempt_id.to_string(),
                version: outcome.state.version,
                dropped_changes: outcome.dropped_changes,
                timestamp: Utc::now(),
            }),
        );
        Ok(outcome.state)
    }

    pub async fn submit(&self, attempt_id: &str) -> Result<ScoreSummary, SyncError> {
        let score = self.gateway.submit(attempt_id).await?;
        tracing::info!(
            "Attempt {} submitted: {}/{} correct",
            attempt_id,
            score.correct_count,
            score.total_questions
        );

        self.activity.record(
            ActivityEvent::new(attempt_id, ActivityKind::Submitted).with_details(json!({
                "total_questions": score.total_questions,
                "correct_count": score.correct_count,
                "score_percentage": score.score_percentage,
            })),
        );
        self.updates.publish(
            attempt_id,
            UpdateEvent::Submitted(Submitted {
                attempt_id: attempt_id.to_string(),
                score: score.clone(),
                timestamp: Utc::now(),
            }),
        );
        Ok(score)
    }

    pub fn subscribe(&self, attempt_id: &str) -> broadcast::Receiver<UpdateEvent> {
        self.updates.subscribe(attempt_id)
    }

    pub fn stats(&self) -> SyncStats {
        self.stats.snapshot(self.registry.stats())
    }

    pub async fn attempt_stats(&self, attempt_id: &str) -> AttemptSyncStats {
        self.stats
            .attempt_stats(attempt_id)
            .await
            .unwrap_or_else(|| AttemptSyncStats {
                attempt_id: attempt_id.to_string(),
                ..Default::default()
            })
    }

    pub async fn health(&self) -> HealthReport {
        let store = match tokio::time::timeout(Duration::from_secs(1), self.gateway.store_health()).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some("timeout after 1s".to_string()),
        };
        let cache = match tokio::time::timeout(Duration::from_millis(500), self.gateway.cache_health()).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(format!("{:#}", e)),
            Err(_) => Some("timeout after 500ms".to_string()),
        };

        HealthReport {
            store: DependencyHealth {
                name: self.gateway.store_name(),
                healthy: store.is_none(),
                error: store,
            },
            cache: DependencyHealth {
                name: self.gateway.invalidator_name(),
                healthy: cache.is_none(),
                error: cache,
            },
        }
    }

    /// Runs `fut` to completion on its own task.
    async fn join<F>(&self, fut: F) -> SyncResult
    where
        F: std::future::Future<Output = SyncResult> + Send + 'static,
    {
        match tokio::spawn(fut).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!("Sync task failed: {}", e);
                SyncResult::failed(
                    0,
                    SyncFailure::from(&SyncError::Transient(format!("sync task failed: {}", e))),
                )
            }
        }
    }

    async fn record_run(
        &self,
        attempt_id: &str,
        connection_id: Option<&str>,
        run: &BatchRun,
        started: Instant,
    ) {
        let result = &run.result;
        self.stats
            .record(
                attempt_id,
                SyncOperation::AutoSave,
                started.elapsed(),
                result.success,
                result.conflicts.len(),
            )
            .await;

        let mut event = ActivityEvent::new(attempt_id, ActivityKind::AutoSave).with_details(json!({
            "success": result.success,
            "version": result.version,
            "applied_changes": result.applied_changes,
            "rejected_changes": result.rejected_changes,
            "batches": run.batches_saved,
            "unsent_changes": run.unsent.len(),
            "ephemeral": run.ephemeral_question_ids,
            "error": result.error.as_ref().map(|e| e.message.clone()),
        }));
        if let Some(connection_id) = connection_id {
            event = event.with_connection(connection_id);
        }
        let mut events = vec![event];

        if !run.conflicts().is_empty() {
            events.push(
                ActivityEvent::new(attempt_id, ActivityKind::ConflictResolved).with_details(json!({
                    "version": result.version,
                    "conflicts": run.conflicts(),
                })),
            );
            self.publish_conflicts(attempt_id, result.version, run.conflicts());
        }
        self.activity.record_all(attempt_id.to_string(), events);

        if run.batches_saved > 0 {
            self.publish_saved(
                attempt_id,
                connection_id,
                result.version,
                run.saved_question_ids.clone(),
            );
        }
    }

    fn publish_saved(
        &self,
        attempt_id: &str,
        connection_id: Option<&str>,
        version: i64,
        question_ids: Vec<String>,
    ) {
        self.updates.publish(
            attempt_id,
            UpdateEvent::StateSaved(StateSaved {
                attempt_id: attempt_id.to_string(),
                version,
                connection_id: connection_id.map(str::to_string),
                question_ids,
                timestamp: Utc::now(),
            }),
        );
    }

    fn publish_conflicts(&self, attempt_id: &str, version: i64, conflicts: &[SyncConflict]) {
        self.updates.publish(
            attempt_id,
            UpdateEvent::ConflictResolved(ConflictResolved {
                attempt_id: attempt_id.to_string(),
                version,
                question_ids: conflicts.iter().map(|c| c.question_id.clone()).collect(),
                timestamp: Utc::now(),
            }),
        );
    }
}

/// Logs and counts change events that did not decode; returns how many.
fn drop_malformed(attempt_id: &str, malformed: &[String]) -> usize {
    for message in malformed {
        INVALID_CHANGES_TOTAL.with_label_values(&["malformed"]).inc();
        tracing::warn!("Dropping malformed change for attempt {}: {}", attempt_id, message);
    }
    malformed.len()
}
