use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use mongodb::bson::{to_bson, Bson};
use mongodb::Database;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::metrics::ACTIVITY_LOG_FAILURES_TOTAL;
use crate::models::{ActivityEvent, ActivityKind};
use crate::utils::time::bson_datetime_as_chrono;

const ACTIVITY_COLLECTION: &str = "attempt_activity";

/// Best-effort, append-only activity log.
#[async_trait]
pub trait ActivitySink: Send + Sync {
    async fn append(&self, attempt_id: &str, events: Vec<ActivityEvent>) -> anyhow::Result<()>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Serialize, Deserialize)]
struct ActivityDocument {
    attempt_id: String,
    kind: ActivityKind,
    connection_id: Option<String>,
    details: Bson,
    #[serde(with = "bson_datetime_as_chrono")]
    created_at: DateTime<Utc>,
}

pub struct MongoActivitySink {
    mongo: Database,
}

impl MongoActivitySink {
    pub fn new(mongo: Database) -> Self {
        Self { mongo }
    }
}

#[async_trait]
impl ActivitySink for MongoActivitySink {
    async fn append(&self, attempt_id: &str, events: Vec<ActivityEvent>) -> anyhow::Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        let docs = events
            .into_iter()
            .map(|event| -> anyhow::Result<ActivityDocument> {
                Ok(ActivityDocument {
                    attempt_id: attempt_id.to_string(),
                    kind: event.kind,
                    connection_id: event.connection_id,
                    details: to_bson(&event.details)?,
                    created_at: event.timestamp,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        self.mongo
            .collection::<ActivityDocument>(ACTIVITY_COLLECTION)
            .insert_many(docs)
            .await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mongodb"
    }
}

#[derive(Debug, Default)]
pub struct InMemoryActivitySink {
    events: DashMap<String, Vec<ActivityEvent>>,
}

impl InMemoryActivitySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events_for(&self, attempt_id: &str) -> Vec<ActivityEvent> {
        self.events
            .get(attempt_id)
            .map(|e| e.value().clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ActivitySink for InMemoryActivitySink {
    async fn append(&self, attempt_id: &str, events: Vec<ActivityEvent>) -> anyhow::Result<()> {
        self.events
            .entry(attempt_id.to_string())
            .or_default()
            .extend(events);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Fire-and-forget front for an [`ActivitySink`].
///
/// Appends run on a spawned task; failures are logged and counted, never
/// returned to the caller.
#[derive(Clone)]
pub struct ActivityRecorder {
    sink: Arc<dyn ActivitySink>,
}

impl ActivityRecorder {
    pub fn new(sink: Arc<dyn ActivitySink>) -> Self {
        Self { sink }
    }

    pub fn record(&self, event: ActivityEvent) {
        let attempt_id = event.attempt_id.clone();
        self.record_all(attempt_id, vec![event]);
    }

    pub fn record_all(&self, attempt_id: String, events: Vec<ActivityEvent>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                "No runtime available, dropping {} activity events for {}",
                events.len(),
                attempt_id
            );
            return;
        };

        let sink = self.sink.clone();
        runtime.spawn(async move {
            if let Err(e) = sink.append(&attempt_id, events).await {
                ACTIVITY_LOG_FAILURES_TOTAL
                    .with_label_values(&[sink.name()])
                    .inc();
                tracing::error!("Activity log append failed for {}: {:#}", attempt_id, e);
            }
        });
    }
}
