use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::attempt_store::AttemptStore;
use crate::error::StoreError;
use crate::models::{AnswerMap, AttemptState, CompletionStatus, ScoreSummary};

/// In-process attempt store for local runs and tests.
///
/// Each save holds the attempt's map entry for the whole compare-and-swap,
/// so concurrent writers are serialized per attempt.
#[derive(Debug, Default)]
pub struct InMemoryAttemptStore {
    attempts: DashMap<String, AttemptState>,
    answer_keys: DashMap<String, AnswerMap>,
    save_calls: AtomicUsize,
    read_calls: AtomicUsize,
}

impl InMemoryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_attempt(&self, state: AttemptState) {
        self.attempts.insert(state.attempt_id.clone(), state);
    }

    pub fn insert_answer_key(&self, exam_id: impl Into<String>, answers: AnswerMap) {
        self.answer_keys.insert(exam_id.into(), answers);
    }

    pub fn snapshot(&self, attempt_id: &str) -> Option<AttemptState> {
        self.attempts.get(attempt_id).map(|s| s.value().clone())
    }

    pub fn save_calls(&self) -> usize {
        self.save_calls.load(Ordering::SeqCst)
    }

    pub fn read_calls(&self) -> usize {
        self.read_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AttemptStore for InMemoryAttemptStore {
    async fn get_attempt_state(&self, attempt_id: &str) -> Result<AttemptState, StoreError> {
        self.read_calls.fetch_add(1, Ordering::SeqCst);
        self.snapshot(attempt_id)
            .ok_or_else(|| StoreError::NotFound(attempt_id.to_string()))
    }

    async fn save_attempt(
        &self,
        attempt_id: &str,
        answers: &AnswerMap,
        auto_save_data: &AnswerMap,
        expected_version: i64,
    ) -> Result<i64, StoreError> {
        self.save_calls.fetch_add(1, Ordering::SeqCst);
        let mut entry = self
            .attempts
            .get_mut(attempt_id)
            .ok_or_else(|| StoreError::NotFound(attempt_id.to_string()))?;
        let state = entry.value_mut();

        if !state.is_in_progress() {
            return Err(StoreError::AttemptClosed(attempt_id.to_string()));
        }
        if state.version != expected_version {
            return Err(StoreError::VersionMismatch(Box::new(state.clone())));
        }

        for (question_id, value) in answers {
            state.answers.insert(question_id.clone(), value.clone());
        }
        for (question_id, value) in auto_save_data {
            state.auto_save_data.insert(question_id.clone(), value.clone());
        }
        state.version += 1;
        state.updated_at = Utc::now();
        Ok(state.version)
    }

    async fn submit_attempt(&self, attempt_id: &str) -> Result<ScoreSummary, StoreError> {
        let mut entry = self
            .attempts
            .get_mut(attempt_id)
            .ok_or_else(|| StoreError::NotFound(attempt_id.to_string()))?;
        let state = entry.value_mut();
        if !state.is_in_progress() {
            return Err(StoreError::AttemptClosed(attempt_id.to_string()));
        }

        let answer_key = self
            .answer_keys
            .get(&state.exam_id)
            .map(|k| k.value().clone())
            .unwrap_or_default();
        let score = ScoreSummary::grade(&answer_key, &state.answers);

        let now = Utc::now();
        state.completion_status = CompletionStatus::Submitted;
        state.submitted_at = Some(now);
        state.updated_at = now;
        Ok(score)
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn answers(pairs: &[(&str, serde_json::Value)]) -> AnswerMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn save_advances_version_by_one_and_merges_keys() {
        let store = InMemoryAttemptStore::new();
        let mut state = AttemptState::new("a1", "exam", "s1");
        state.answers = answers(&[("q1", json!("A"))]);
        store.insert_attempt(state);

        let v = store
            .save_attempt("a1", &answers(&[("q2", json!("B"))]), &AnswerMap::new(), 1)
            .await
            .unwrap();
        assert_eq!(v, 2);

        let saved = store.snapshot("a1").unwrap();
        assert_eq!(saved.answers, answers(&[("q1", json!("A")), ("q2", json!("B"))]));
    }

    #[tokio::test]
    async fn stale_save_is_rejected_with_current_state() {
        let store = InMemoryAttemptStore::new();
        store.insert_attempt(AttemptState::new("a1", "exam", "s1"));
        store
            .save_attempt("a1", &answers(&[("q1", json!("A"))]), &AnswerMap::new(), 1)
            .await
            .unwrap();

        let err = store
            .save_attempt("a1", &answers(&[("q1", json!("Z"))]), &AnswerMap::new(), 1)
            .await
            .unwrap_err();
        match err {
            StoreError::VersionMismatch(latest) => {
                assert_eq!(latest.version, 2);
                assert_eq!(latest.answers["q1"], json!("A"));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert_eq!(store.snapshot("a1").unwrap().answers["q1"], json!("A"));
    }

    #[tokio::test]
    async fn submitted_attempts_reject_saves() {
        let store = InMemoryAttemptStore::new();
        store.insert_attempt(AttemptState::new("a1", "exam", "s1"));
        store.insert_answer_key("exam", answers(&[("q1", json!("A"))]));

        let score = store.submit_attempt("a1").await.unwrap();
        assert_eq!(score.total_questions, 1);
        assert_eq!(score.correct_count, 0);

        let err = store
            .save_attempt("a1", &answers(&[("q1", json!("A"))]), &AnswerMap::new(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AttemptClosed(_)));
        assert!(matches!(
            store.submit_attempt("a1").await,
            Err(StoreError::AttemptClosed(_))
        ));
    }
}
