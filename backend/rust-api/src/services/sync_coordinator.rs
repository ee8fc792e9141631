use std::sync::Arc;

use super::auto_save_engine::Batch;
use super::conflict_resolver::ConflictResolver;
use super::connection_registry::ConnectionRegistry;
use super::persistence_gateway::PersistenceGateway;
use crate::error::{SyncError, SyncFailure};
use crate::models::{AttemptState, ChangeEvent, ConflictStrategy, SaveOutcome, SyncResult};

#[derive(Debug, Clone)]
pub struct ForceSyncOutcome {
    pub state: AttemptState,
    pub dropped_changes: usize,
}

/// On-demand reconciliation of a client's version and local changes.
#[derive(Clone)]
pub struct SyncCoordinator {
    gateway: PersistenceGateway,
    registry: Arc<ConnectionRegistry>,
    max_attempts: usize,
}

impl SyncCoordinator {
    pub fn new(gateway: PersistenceGateway, registry: Arc<ConnectionRegistry>, max_attempts: usize) -> Self {
        Self {
            gateway,
            registry,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Reconciles `local_version` plus `changes` against the authoritative
    /// state in one pass. All changes form a single batch.
    ///
    /// Same version and nothing to write is a no-op success. A stale client
    /// with nothing to write just receives the current state.
    pub async fn synchronize(
        &self,
        attempt_id: &str,
        local_version: i64,
        changes: Vec<ChangeEvent>,
        strategy: ConflictStrategy,
    ) -> SyncResult {
        match self
            .try_synchronize(attempt_id, local_version, &changes, strategy)
            .await
        {
            Ok(result) => result,
            Err((version, e)) => {
                tracing::warn!("Synchronize failed for attempt {}: {}", attempt_id, e);
                SyncResult::failed(version, SyncFailure::from(&e))
            }
        }
    }

    async fn try_synchronize(
        &self,
        attempt_id: &str,
        local_version: i64,
        changes: &[ChangeEvent],
        strategy: ConflictStrategy,
    ) -> Result<SyncResult, (i64, SyncError)> {
        let server = self
            .gateway
            .get_fresh_state(attempt_id)
            .await
            .map_err(|e| (local_version, e))?;

        let batch = Batch::from_events(attempt_id, changes);
        let mut result = SyncResult::succeeded(server.version);
        result.rejected_changes = batch.rejected;

        if !batch.has_writes() {
            if local_version == server.version {
                tracing::debug!("Attempt {} already in sync at v{}", attempt_id, server.version);
            }
            result.state = Some(server);
            return Ok(result);
        }
        if !server.is_in_progress() {
            return Err((
                server.version,
                SyncError::AttemptClosed(attempt_id.to_string()),
            ));
        }

        let detected = ConflictResolver::detect(local_version, &batch.answers, &server);
        let resolved = ConflictResolver::resolve(strategy, &batch.answers, &detected);
        let applied = resolved.answers.len() + batch.auto_save_data.len();

        let (version, applied, conflicts) = match self
            .gateway
            .save(
                attempt_id,
                resolved.answers.clone(),
                batch.auto_save_data.clone(),
                server.version,
                self.max_attempts,
            )
            .await
            .map_err(|e| (server.version, e))?
        {
            SaveOutcome::Saved { new_version } => (new_version, applied, resolved.conflicts),
            SaveOutcome::Conflict { latest } => {
                let retried = ConflictResolver::resolve_and_retry(
                    &self.gateway,
                    attempt_id,
                    local_version,
                    &batch.answers,
                    &batch.auto_save_data,
                    &latest,
                    strategy,
                    self.max_attempts,
                )
                .await
                .map_err(|e| (latest.version, e))?;
                (retried.version, retried.applied, retried.conflicts)
            }
        };

        tracing::info!(
            "Synchronized attempt {}: client v{} -> v{} ({} applied, {} conflicts)",
            attempt_id,
            local_version,
            version,
            applied,
            conflicts.len()
        );

        result.version = version;
        result.applied_changes = applied;
        result.conflicts = conflicts;
        result.state = self.gateway.get_state(attempt_id).await.ok();
        Ok(result)
    }

    /// Drops every connection's unsent changes for the attempt and reseeds
    /// all of them from a fresh authoritative read.
    pub async fn force_sync(&self, attempt_id: &str) -> Result<ForceSyncOutcome, SyncError> {
        let dropped_changes = self.registry.drop_pending_for_attempt(attempt_id);
        if dropped_changes > 0 {
            tracing::warn!(
                "Force sync on attempt {} discarded {} unsent changes",
                attempt_id,
                dropped_changes
            );
        }

        self.gateway.invalidate(attempt_id).await;
        let state = self.gateway.get_fresh_state(attempt_id).await?;
        self.registry.reseed_attempt(attempt_id, state.version);

        tracing::info!("Force sync reseeded attempt {} at v{}", attempt_id, state.version);
        Ok(ForceSyncOutcome {
            state,
            dropped_changes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncErrorKind;
    use crate::models::AnswerMap;
    use crate::services::activity_log::{ActivityRecorder, InMemoryActivitySink};
    use crate::services::attempt_store::AttemptStore;
    use crate::services::cache_invalidation::NoopCacheInvalidator;
    use crate::services::persistence_gateway::GatewayConfig;
    use crate::services::test_support::{answers, FlakyStore};
    use serde_json::json;
    use std::time::Duration;

    fn coordinator(store: Arc<FlakyStore>) -> (SyncCoordinator, Arc<ConnectionRegistry>) {
        let gateway = PersistenceGateway::new(
            store,
            Arc::new(NoopCacheInvalidator),
            GatewayConfig::default(),
        );
        let registry = Arc::new(ConnectionRegistry::new(
            Duration::from_secs(60),
            ActivityRecorder::new(Arc::new(InMemoryActivitySink::new())),
        ));
        (SyncCoordinator::new(gateway, registry.clone(), 3), registry)
    }

    async fn seed(store: &FlakyStore, pairs: &[(&str, serde_json::Value)], expected: i64) {
        store
            .inner
            .save_attempt("a1", &answers(pairs), &AnswerMap::new(), expected)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn in_sync_without_changes_is_a_no_op() {
        let store = Arc::new(FlakyStore::with_attempt("a1"));
        seed(&store, &[("q1", json!("A"))], 1).await;
        let (coordinator, _) = coordinator(store.clone());

        let result = coordinator
            .synchronize("a1", 2, Vec::new(), ConflictStrategy::Merge)
            .await;

        assert!(result.success);
        assert_eq!(result.version, 2);
        assert_eq!(result.applied_changes, 0);
        assert_eq!(store.save_calls(), 0);
        assert_eq!(store.snapshot("a1").version, 2);
    }

    #[tokio::test]
    async fn stale_client_changes_are_merged() {
        let store = Arc::new(FlakyStore::with_attempt("a1"));
        seed(&store, &[("q1", json!("A")), ("q2", json!("B"))], 1).await;
        let (coordinator, _) = coordinator(store.clone());

        let result = coordinator
            .synchronize(
                "a1",
                1,
                vec![ChangeEvent::answer("q1", json!("C"))],
                ConflictStrategy::Merge,
            )
            .await;

        assert!(result.success);
        assert_eq!(result.version, 3);
        assert_eq!(result.conflicts.len(), 1);
        assert_eq!(result.conflicts[0].question_id, "q1");
        let state = result.state.unwrap();
        assert_eq!(state.answers, answers(&[("q1", json!("C")), ("q2", json!("B"))]));
    }

    #[tokio::test]
    async fn stale_client_without_changes_gets_current_state() {
        let store = Arc::new(FlakyStore::with_attempt("a1"));
        seed(&store, &[("q1", json!("A"))], 1).await;
        let (coordinator, _) = coordinator(store.clone());

        let result = coordinator
            .synchronize("a1", 1, Vec::new(), ConflictStrategy::Merge)
            .await;

        assert!(result.success);
        assert_eq!(result.version, 2);
        assert_eq!(result.state.unwrap().answers["q1"], json!("A"));
        assert_eq!(store.save_calls(), 0);
    }

    #[tokio::test]
    async fn transient_failure_reports_failure() {
        let store = Arc::new(FlakyStore::with_attempt("a1"));
        store.fail_next_saves(usize::MAX);
        let (coordinator, _) = coordinator(store.clone());

        let result = coordinator
            .synchronize(
                "a1",
                1,
                vec![ChangeEvent::answer("q1", json!("A"))],
                ConflictStrategy::Merge,
            )
            .await;

        assert!(!result.success);
        assert_eq!(result.version, 1);
        assert_eq!(result.error.unwrap().kind, SyncErrorKind::Transient);
    }

    #[tokio::test]
    async fn force_sync_drops_pending_and_reseeds() {
        let store = Arc::new(FlakyStore::with_attempt("a1"));
        let (coordinator, registry) = coordinator(store.clone());
        registry.open("a1", "tab-1", 1);
        registry.open("a1", "tab-2", 1);
        registry.enqueue("a1", "tab-1", vec![ChangeEvent::answer("q1", json!("X"))]);
        registry.enqueue("a1", "tab-2", vec![ChangeEvent::answer("q2", json!("Y"))]);
        seed(&store, &[("q1", json!("A"))], 1).await;

        let outcome = coordinator.force_sync("a1").await.unwrap();

        assert_eq!(outcome.dropped_changes, 2);
        assert_eq!(outcome.state.version, 2);
        assert_eq!(registry.pending_len("a1", "tab-1"), 0);
        assert_eq!(registry.known_version("a1", "tab-2"), Some(2));
    }

    #[tokio::test]
    async fn force_sync_unknown_attempt_is_not_found() {
        let store = Arc::new(FlakyStore::with_attempt("a1"));
        let (coordinator, _) = coordinator(store);
        let err = coordinator.force_sync("missing").await.unwrap_err();
        assert!(matches!(err, SyncError::NotFound(_)));
    }
}
