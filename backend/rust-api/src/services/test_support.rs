use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::attempt_store::AttemptStore;
use super::memory_store::InMemoryAttemptStore;
use crate::error::StoreError;
use crate::models::{AnswerMap, AttemptState, ScoreSummary};

pub(crate) fn answers(pairs: &[(&str, serde_json::Value)]) -> AnswerMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// In-memory store with injectable transient failures.
#[derive(Debug, Default)]
pub(crate) struct FlakyStore {
    pub inner: InMemoryAttemptStore,
    failing_saves: AtomicUsize,
    fail_everything: AtomicBool,
    attempted_saves: AtomicUsize,
    // saves with this index or later fail; 0 = disabled
    fail_from: AtomicUsize,
}

impl FlakyStore {
    pub fn with_attempt(attempt_id: &str) -> Self {
        let store = Self::default();
        store
            .inner
            .insert_attempt(AttemptState::new(attempt_id, "exam-1", "student-1"));
        store
    }

    pub fn fail_next_saves(&self, n: usize) {
        self.failing_saves.store(n, Ordering::SeqCst);
    }

    /// Lets the first `n` saves through, then fails every later one.
    pub fn fail_saves_from(&self, n: usize) {
        self.fail_from.store(n + 1, Ordering::SeqCst);
    }

    pub fn fail_everything(&self, on: bool) {
        self.fail_everything.store(on, Ordering::SeqCst);
    }

    /// Save calls that reached the store, failed or not.
    pub fn save_calls(&self) -> usize {
        self.attempted_saves.load(Ordering::SeqCst)
    }

    pub fn read_calls(&self) -> usize {
        self.inner.read_calls()
    }

    pub fn snapshot(&self, attempt_id: &str) -> AttemptState {
        self.inner
            .snapshot(attempt_id)
            .expect("attempt seeded in test store")
    }

    fn should_fail(&self, index: usize) -> bool {
        if self.fail_everything.load(Ordering::SeqCst) {
            return true;
        }
        let fail_from = self.fail_from.load(Ordering::SeqCst);
        if fail_from > 0 && index + 1 >= fail_from {
            return true;
        }
        self.failing_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl AttemptStore for FlakyStore {
    async fn get_attempt_state(&self, attempt_id: &str) -> Result<AttemptState, StoreError> {
        if self.fail_everything.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected read failure".into()));
        }
        self.inner.get_attempt_state(attempt_id).await
    }

    async fn save_attempt(
        &self,
        attempt_id: &str,
        answers: &AnswerMap,
        auto_save_data: &AnswerMap,
        expected_version: i64,
    ) -> Result<i64, StoreError> {
        let index = self.attempted_saves.fetch_add(1, Ordering::SeqCst);
        if self.should_fail(index) {
            return Err(StoreError::Unavailable("injected save failure".into()));
        }
        self.inner
            .save_attempt(attempt_id, answers, auto_save_data, expected_version)
            .await
    }

    async fn submit_attempt(&self, attempt_id: &str) -> Result<ScoreSummary, StoreError> {
        if self.fail_everything.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected submit failure".into()));
        }
        self.inner.submit_attempt(attempt_id).await
    }

    fn name(&self) -> &'static str {
        "flaky"
    }
}
