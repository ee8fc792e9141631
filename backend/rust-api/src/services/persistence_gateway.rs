use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

use super::attempt_store::AttemptStore;
use super::cache_invalidation::CacheInvalidator;
use crate::error::{StoreError, SyncError};
use crate::metrics::{record_cache_hit, record_cache_miss, track_backend_operation};
use crate::models::{AnswerMap, AttemptState, SaveOutcome, ScoreSummary};
use crate::utils::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerRegistry};
use crate::utils::retry::{retry_async_when, RetryConfig};

pub const READ_OPERATION: &str = "read";
pub const SAVE_OPERATION: &str = "save";
pub const SUBMIT_OPERATION: &str = "submit";

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub cache_ttl: Duration,
    pub cache_capacity: u64,
    pub breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(30),
            cache_capacity: 10_000,
            breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

/// Resilient front for the attempt store.
///
/// Reads go through a short-lived per-attempt cache. Every store call runs
/// under the circuit breaker for `operation:attempt_id`. Saves retry only
/// transient failures; a version mismatch comes back as
/// [`SaveOutcome::Conflict`] for the caller to resolve.
#[derive(Clone)]
pub struct PersistenceGateway {
    store: Arc<dyn AttemptStore>,
    invalidator: Arc<dyn CacheInvalidator>,
    cache: Cache<String, AttemptState>,
    breakers: Arc<CircuitBreakerRegistry>,
    retry: RetryConfig,
}

impl PersistenceGateway {
    pub fn new(
        store: Arc<dyn AttemptStore>,
        invalidator: Arc<dyn CacheInvalidator>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            store,
            invalidator,
            cache: Cache::builder()
                .max_capacity(config.cache_capacity)
                .time_to_live(config.cache_ttl)
                .build(),
            breakers: Arc::new(CircuitBreakerRegistry::new(config.breaker)),
            retry: config.retry,
        }
    }

    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Cached read, falling back to the store on a miss.
    pub async fn get_state(&self, attempt_id: &str) -> Result<AttemptState, SyncError> {
        // Try cache first
        if let Some(state) = self.cache.get(&state_cache_key(attempt_id)).await {
            record_cache_hit();
            tracing::debug!("Read cache hit for attempt {}", attempt_id);
            return Ok(state);
        }
        record_cache_miss();

        // Fallback to the store
        self.get_fresh_state(attempt_id).await
    }

    /// Authoritative read that bypasses and then refreshes the cache.
    pub async fn get_fresh_state(&self, attempt_id: &str) -> Result<AttemptState, SyncError> {
        let state = self
            .breakers
            .call(READ_OPERATION, attempt_id, || async {
                track_backend_operation(READ_OPERATION, self.store.get_attempt_state(attempt_id))
                    .await
                    .map_err(SyncError::from)
            })
            .await?;

        self.cache
            .insert(state_cache_key(attempt_id), state.clone())
            .await;
        Ok(state)
    }

    /// Version-checked save with up to `max_attempts` tries on transient
    /// failure.
    ///
    /// The save runs on its own task: once dispatched it completes (and its
    /// bookkeeping lands) even if the caller stops waiting.
    pub async fn save(
        &self,
        attempt_id: &str,
        answers: AnswerMap,
        auto_save_data: AnswerMap,
        expected_version: i64,
        max_attempts: usize,
    ) -> Result<SaveOutcome, SyncError> {
        let gateway = self.clone();
        let attempt_id = attempt_id.to_string();

        tokio::spawn(async move {
            gateway
                .save_with_retry(
                    &attempt_id,
                    &answers,
                    &auto_save_data,
                    expected_version,
                    max_attempts,
                )
                .await
        })
        .await
        .map_err(|e| SyncError::Transient(format!("save task failed: {}", e)))?
    }

    async fn save_with_retry(
        &self,
        attempt_id: &str,
        answers: &AnswerMap,
        auto_save_data: &AnswerMap,
        expected_version: i64,
        max_attempts: usize,
    ) -> Result<SaveOutcome, SyncError> {
        let retry = self.retry.with_max_attempts(max_attempts);
        let outcome = retry_async_when(retry, SyncError::is_transient, || {
            self.save_once(attempt_id, answers, auto_save_data, expected_version)
        })
        .await;

        match &outcome {
            Ok(SaveOutcome::Saved { new_version }) => {
                tracing::debug!(
                    "Saved attempt {} v{} -> v{} ({} answers, {} scratch)",
                    attempt_id,
                    expected_version,
                    new_version,
                    answers.len(),
                    auto_save_data.len()
                );
                self.invalidate(attempt_id).await;
            }
            Ok(SaveOutcome::Conflict { latest }) => {
                tracing::info!(
                    "Version conflict on attempt {}: expected v{}, store at v{}",
                    attempt_id,
                    expected_version,
                    latest.version
                );
                self.cache
                    .insert(state_cache_key(attempt_id), latest.as_ref().clone())
                    .await;
            }
            Err(e) => {
                tracing::warn!("Save failed for attempt {}: {}", attempt_id, e);
            }
        }
        outcome
    }

    async fn save_once(
        &self,
        attempt_id: &str,
        answers: &AnswerMap,
        auto_save_data: &AnswerMap,
        expected_version: i64,
    ) -> Result<SaveOutcome, SyncError> {
        self.breakers
            .call(SAVE_OPERATION, attempt_id, || async {
                let saved = track_backend_operation(
                    SAVE_OPERATION,
                    self.store
                        .save_attempt(attempt_id, answers, auto_save_data, expected_version),
                )
                .await;

                match saved {
                    Ok(new_version) => Ok(SaveOutcome::Saved { new_version }),
                    Err(StoreError::VersionMismatch(latest)) => Ok(SaveOutcome::Conflict { latest }),
                    Err(e) => Err(SyncError::from(e)),
                }
            })
            .await
    }

    /// Final submission. Not retried: a lost response must not grade twice.
    pub async fn submit(&self, attempt_id: &str) -> Result<ScoreSummary, SyncError> {
        let score = self
            .breakers
            .call(SUBMIT_OPERATION, attempt_id, || async {
                track_backend_operation(SUBMIT_OPERATION, self.store.submit_attempt(attempt_id))
                    .await
                    .map_err(SyncError::from)
            })
            .await?;

        self.invalidate(attempt_id).await;
        self.breakers.forget_scope(attempt_id);
        Ok(score)
    }

    /// Drops this attempt from the local cache and asks the external cache
    /// tier to do the same. External failures are logged, never returned.
    pub async fn invalidate(&self, attempt_id: &str) {
        self.cache.invalidate(&state_cache_key(attempt_id)).await;

        let pattern = invalidation_pattern(attempt_id);
        if let Err(e) = self.invalidator.invalidate(&pattern).await {
            tracing::warn!(
                "Cache invalidation via {} failed for {}: {:#}",
                self.invalidator.name(),
                pattern,
                e
            );
        }
    }

    pub async fn store_health(&self) -> Result<(), StoreError> {
        self.store.ping().await
    }

    pub async fn cache_health(&self) -> anyhow::Result<()> {
        self.invalidator.health().await
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    pub fn invalidator_name(&self) -> &'static str {
        self.invalidator.name()
    }
}

fn state_cache_key(attempt_id: &str) -> String {
    format!("attempt:{}:state", attempt_id)
}

fn invalidation_pattern(attempt_id: &str) -> String {
    format!("attempt:{}:*", attempt_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::cache_invalidation::NoopCacheInvalidator;
    use crate::services::test_support::{answers, FlakyStore};
    use crate::utils::circuit_breaker::BreakerState;
    use serde_json::json;

    fn gateway(store: Arc<FlakyStore>, threshold: u32, cooldown: Duration) -> PersistenceGateway {
        PersistenceGateway::new(
            store,
            Arc::new(NoopCacheInvalidator),
            GatewayConfig {
                cache_ttl: Duration::from_secs(30),
                cache_capacity: 100,
                breaker: CircuitBreakerConfig {
                    failure_threshold: threshold,
                    cooldown,
                },
                retry: RetryConfig {
                    max_attempts: 3,
                    base_backoff: Duration::from_millis(1),
                    max_backoff: Duration::from_millis(5),
                    jitter_max: None,
                },
            },
        )
    }

    #[tokio::test]
    async fn reads_are_cached_until_a_save_invalidates() {
        let store = Arc::new(FlakyStore::with_attempt("a1"));
        let gw = gateway(store.clone(), 5, Duration::from_secs(60));

        gw.get_state("a1").await.unwrap();
        gw.get_state("a1").await.unwrap();
        assert_eq!(store.read_calls(), 1);

        gw.save("a1", answers(&[("q1", json!("A"))]), AnswerMap::new(), 1, 3)
            .await
            .unwrap();

        let state = gw.get_state("a1").await.unwrap();
        assert_eq!(store.read_calls(), 2);
        assert_eq!(state.version, 2);
    }

    #[tokio::test]
    async fn transient_save_failures_are_retried() {
        let store = Arc::new(FlakyStore::with_attempt("a1"));
        store.fail_next_saves(2);
        let gw = gateway(store.clone(), 5, Duration::from_secs(60));

        let outcome = gw
            .save("a1", answers(&[("q1", json!("A"))]), AnswerMap::new(), 1, 3)
            .await
            .unwrap();

        assert!(matches!(outcome, SaveOutcome::Saved { new_version: 2 }));
        assert_eq!(store.save_calls(), 3);
    }

    #[tokio::test]
    async fn transient_failures_surface_after_max_attempts() {
        let store = Arc::new(FlakyStore::with_attempt("a1"));
        store.fail_next_saves(10);
        let gw = gateway(store.clone(), 50, Duration::from_secs(60));

        let err = gw
            .save("a1", answers(&[("q1", json!("A"))]), AnswerMap::new(), 1, 2)
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(store.save_calls(), 2);
    }

    #[tokio::test]
    async fn conflicts_are_not_retried() {
        let store = Arc::new(FlakyStore::with_attempt("a1"));
        let gw = gateway(store.clone(), 5, Duration::from_secs(60));
        gw.save("a1", answers(&[("q1", json!("A"))]), AnswerMap::new(), 1, 3)
            .await
            .unwrap();

        let outcome = gw
            .save("a1", answers(&[("q1", json!("B"))]), AnswerMap::new(), 1, 3)
            .await
            .unwrap();

        match outcome {
            SaveOutcome::Conflict { latest } => {
                assert_eq!(latest.version, 2);
                assert_eq!(latest.answers["q1"], json!("A"));
            }
            other => panic!("expected conflict, got {:?}", other),
        }
        assert_eq!(store.save_calls(), 2);
    }

    #[tokio::test]
    async fn not_found_is_surfaced_without_retry() {
        let store = Arc::new(FlakyStore::with_attempt("a1"));
        let gw = gateway(store.clone(), 5, Duration::from_secs(60));

        let err = gw
            .save("missing", AnswerMap::new(), AnswerMap::new(), 1, 3)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::NotFound(_)));
        assert_eq!(store.save_calls(), 1);
    }

    #[tokio::test]
    async fn open_circuit_fails_fast_without_backend_calls() {
        let store = Arc::new(FlakyStore::with_attempt("a1"));
        store.fail_everything(true);
        let gw = gateway(store.clone(), 5, Duration::from_millis(80));

        for _ in 0..5 {
            let err = gw
                .save("a1", AnswerMap::new(), AnswerMap::new(), 1, 1)
                .await
                .unwrap_err();
            assert!(err.is_transient());
        }
        assert_eq!(store.save_calls(), 5);
        assert_eq!(gw.breakers().state(SAVE_OPERATION, "a1"), BreakerState::Open);

        for _ in 0..3 {
            let err = gw
                .save("a1", AnswerMap::new(), AnswerMap::new(), 1, 1)
                .await
                .unwrap_err();
            assert!(matches!(err, SyncError::CircuitOpen { .. }));
        }
        assert_eq!(store.save_calls(), 5);

        tokio::time::sleep(Duration::from_millis(120)).await;
        store.fail_everything(false);

        let outcome = gw
            .save("a1", AnswerMap::new(), AnswerMap::new(), 1, 1)
            .await
            .unwrap();
        assert!(matches!(outcome, SaveOutcome::Saved { .. }));
        assert_eq!(store.save_calls(), 6);
        assert_eq!(
            gw.breakers().state(SAVE_OPERATION, "a1"),
            BreakerState::Closed
        );
    }

    #[tokio::test]
    async fn circuit_open_is_not_retried() {
        let store = Arc::new(FlakyStore::with_attempt("a1"));
        store.fail_everything(true);
        let gw = gateway(store.clone(), 2, Duration::from_secs(60));

        let err = gw
            .save("a1", AnswerMap::new(), AnswerMap::new(), 1, 5)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::CircuitOpen { .. }));
        assert_eq!(store.save_calls(), 2);
    }
}
