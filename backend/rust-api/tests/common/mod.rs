#![allow(dead_code)]

use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Router,
};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tower::ServiceExt;

use attempt_sync_api::{
    config::Config,
    create_router,
    error::StoreError,
    models::{AnswerMap, AttemptState, ScoreSummary},
    services::{
        activity_log::InMemoryActivitySink, attempt_store::AttemptStore,
        cache_invalidation::NoopCacheInvalidator, memory_store::InMemoryAttemptStore, AppState,
    },
};

pub const EXAM_ID: &str = "exam-1";

/// In-memory store whose saves can be switched into an outage.
#[derive(Debug, Default)]
pub struct OutageStore {
    pub inner: InMemoryAttemptStore,
    saves_down: AtomicBool,
    save_attempts: AtomicUsize,
}

impl OutageStore {
    pub fn set_saves_down(&self, down: bool) {
        self.saves_down.store(down, Ordering::SeqCst);
    }

    /// Saves that reached the store, failed or not.
    pub fn save_attempts(&self) -> usize {
        self.save_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AttemptStore for OutageStore {
    async fn get_attempt_state(&self, attempt_id: &str) -> Result<AttemptState, StoreError> {
        self.inner.get_attempt_state(attempt_id).await
    }

    async fn save_attempt(
        &self,
        attempt_id: &str,
        answers: &AnswerMap,
        auto_save_data: &AnswerMap,
        expected_version: i64,
    ) -> Result<i64, StoreError> {
        self.save_attempts.fetch_add(1, Ordering::SeqCst);
        if self.saves_down.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection reset".into()));
        }
        self.inner
            .save_attempt(attempt_id, answers, auto_save_data, expected_version)
            .await
    }

    async fn submit_attempt(&self, attempt_id: &str) -> Result<ScoreSummary, StoreError> {
        self.inner.submit_attempt(attempt_id).await
    }

    fn name(&self) -> &'static str {
        "outage"
    }
}

pub struct TestApp {
    pub router: Router,
    pub store: Arc<OutageStore>,
    pub activity: Arc<InMemoryActivitySink>,
    pub state: Arc<AppState>,
}

impl TestApp {
    pub fn seed_attempt(&self, attempt_id: &str) -> AttemptState {
        let state = AttemptState::new(attempt_id, EXAM_ID, "student-1");
        self.store.inner.insert_attempt(state.clone());
        state
    }

    pub fn stored(&self, attempt_id: &str) -> AttemptState {
        self.store
            .inner
            .snapshot(attempt_id)
            .expect("attempt should exist in the store")
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(
            Request::builder()
                .method("GET")
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    pub async fn post(&self, uri: &str, body: Value) -> (StatusCode, Value) {
        self.send(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
    }

    pub async fn post_empty(&self, uri: &str) -> (StatusCode, Value) {
        self.send(
            Request::builder()
                .method("POST")
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
    }

    pub async fn delete(&self, uri: &str) -> StatusCode {
        let response = self
            .router
            .clone()
            .oneshot(
                Request::builder()
                    .method("DELETE")
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        response.status()
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap_or(Value::Null)
        };
        (status, json)
    }
}

pub fn create_test_app() -> TestApp {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();

    let store = Arc::new(OutageStore::default());
    let answer_key: AnswerMap = [("q1", "A"), ("q2", "B"), ("q3", "C")]
        .into_iter()
        .map(|(k, v)| (k.to_string(), Value::from(v)))
        .collect();
    store.inner.insert_answer_key(EXAM_ID, answer_key);

    let activity = Arc::new(InMemoryActivitySink::new());
    let state = Arc::new(AppState::with_components(
        Config::in_memory(),
        store.clone(),
        Arc::new(NoopCacheInvalidator),
        activity.clone(),
    ));

    TestApp {
        router: create_router(state.clone()),
        store,
        activity,
        state,
    }
}

/// Lets spawned bookkeeping (activity, stats) land before asserting on it.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
}
