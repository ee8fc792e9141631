use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mongodb::bson::{doc, to_bson, Document};
use mongodb::options::{FindOneAndUpdateOptions, ReturnDocument};
use mongodb::{Collection, Database};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::models::{AnswerMap, AttemptState, CompletionStatus, ScoreSummary};
use crate::utils::time::{bson_datetime_as_chrono, chrono_to_bson, optional_bson_datetime_as_chrono};

const ATTEMPTS_COLLECTION: &str = "attempts";
const ANSWER_KEYS_COLLECTION: &str = "exam_answer_keys";

/// Authoritative, version-checked attempt persistence.
///
/// `save_attempt` must compare `expected_version` and apply the write in a
/// single atomic step. A save merges the given question ids into the stored
/// maps; ids not mentioned keep their stored values.
#[async_trait]
pub trait AttemptStore: Send + Sync {
    async fn get_attempt_state(&self, attempt_id: &str) -> Result<AttemptState, StoreError>;

    /// Returns the new version, or `VersionMismatch` with the current state.
    async fn save_attempt(
        &self,
        attempt_id: &str,
        answers: &AnswerMap,
        auto_save_data: &AnswerMap,
        expected_version: i64,
    ) -> Result<i64, StoreError>;

    async fn submit_attempt(&self, attempt_id: &str) -> Result<ScoreSummary, StoreError>;

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct AttemptDocument {
    #[serde(rename = "_id")]
    id: String,
    exam_id: String,
    student_id: String,
    #[serde(default)]
    answers: AnswerMap,
    #[serde(default)]
    auto_save_data: AnswerMap,
    version: i64,
    completion_status: CompletionStatus,
    #[serde(default, with = "optional_bson_datetime_as_chrono")]
    submitted_at: Option<DateTime<Utc>>,
    #[serde(with = "bson_datetime_as_chrono")]
    created_at: DateTime<Utc>,
    #[serde(with = "bson_datetime_as_chrono")]
    updated_at: DateTime<Utc>,
}

impl From<AttemptDocument> for AttemptState {
    fn from(doc: AttemptDocument) -> Self {
        AttemptState {
            attempt_id: doc.id,
            exam_id: doc.exam_id,
            student_id: doc.student_id,
            answers: doc.answers,
            auto_save_data: doc.auto_save_data,
            version: doc.version,
            completion_status: doc.completion_status,
            submitted_at: doc.submitted_at,
            created_at: doc.created_at,
            updated_at: doc.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct AnswerKeyDocument {
    #[serde(default)]
    answers: AnswerMap,
}

/// MongoDB-backed store. The version check is the filter of a single
/// `findOneAndUpdate`, which makes it a compare-and-swap.
pub struct MongoAttemptStore {
    mongo: Database,
}

impl MongoAttemptStore {
    pub fn new(mongo: Database) -> Self {
        Self { mongo }
    }

    fn attempts(&self) -> Collection<AttemptDocument> {
        self.mongo.collection(ATTEMPTS_COLLECTION)
    }

    fn field_updates(prefix: &str, values: &AnswerMap, set: &mut Document) -> Result<(), StoreError> {
        for (question_id, value) in values {
            let encoded = to_bson(value).map_err(|e| {
                StoreError::Unavailable(format!("failed to encode value for {}: {}", question_id, e))
            })?;
            set.insert(format!("{}.{}", prefix, question_id), encoded);
        }
        Ok(())
    }
}

#[async_trait]
impl AttemptStore for MongoAttemptStore {
    async fn get_attempt_state(&self, attempt_id: &str) -> Result<AttemptState, StoreError> {
        self.attempts()
            .find_one(doc! { "_id": attempt_id })
            .await?
            .map(AttemptState::from)
            .ok_or_else(|| StoreError::NotFound(attempt_id.to_string()))
    }

    async fn save_attempt(
        &self,
        attempt_id: &str,
        answers: &AnswerMap,
        auto_save_data: &AnswerMap,
        expected_version: i64,
    ) -> Result<i64, StoreError> {
        let mut set = doc! { "updated_at": chrono_to_bson(Utc::now()) };
        Self::field_updates("answers", answers, &mut set)?;
        Self::field_updates("auto_save_data", auto_save_data, &mut set)?;

        let filter = doc! {
            "_id": attempt_id,
            "version": expected_version,
            "completion_status": CompletionStatus::InProgress.as_str(),
        };
        let update = doc! {
            "$set": set,
            "$inc": { "version": 1_i64 },
        };

        let updated = self
            .attempts()
            .find_one_and_update(filter, update)
            .with_options(
                FindOneAndUpdateOptions::builder()
                    .return_document(ReturnDocument::After)
                    .build(),
            )
            .await?;

        if let Some(doc) = updated {
            return Ok(doc.version);
        }

        // The filter missed: unknown id, closed attempt or stale version.
        let current = self.get_attempt_state(attempt_id).await?;
        if !current.is_in_progress() {
            return Err(StoreError::AttemptClosed(attempt_id.to_string()));
        }
        Err(StoreError::VersionMismatch(Box::new(current)))
    }

    async fn submit_attempt(&self, attempt_id: &str) -> Result<ScoreSummary, StoreError> {
        let state = self.get_attempt_state(attempt_id).await?;
        if !state.is_in_progress() {
            return Err(StoreError::AttemptClosed(attempt_id.to_string()));
        }

        let answer_key = self
            .mongo
            .collection::<AnswerKeyDocument>(ANSWER_KEYS_COLLECTION)
            .find_one(doc! { "_id": &state.exam_id })
            .await?
            .map(|key| key.answers)
            .unwrap_or_default();
        let score = ScoreSummary::grade(&answer_key, &state.answers);

        let now = chrono_to_bson(Utc::now());
        let score_bson = to_bson(&score)
            .map_err(|e| StoreError::Unavailable(format!("failed to encode score: {}", e)))?;
        let result = self
            .attempts()
            .update_one(
                doc! {
                    "_id": attempt_id,
                    "completion_status": CompletionStatus::InProgress.as_str(),
                },
                doc! {
                    "$set": {
                        "completion_status": CompletionStatus::Submitted.as_str(),
                        "submitted_at": now,
                        "updated_at": now,
                        "score": score_bson,
                    }
                },
            )
            .await?;

        if result.matched_count == 0 {
            return Err(StoreError::AttemptClosed(attempt_id.to_string()));
        }

        tracing::info!(
            "Attempt submitted: {} ({}/{} correct)",
            attempt_id,
            score.correct_count,
            score.total_questions
        );
        Ok(score)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.mongo.run_command(doc! { "ping": 1 }).await?;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "mongodb"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::{from_document, Bson, DateTime as BsonDateTime};
    use serde_json::json;

    #[test]
    fn attempt_document_maps_to_state() {
        let now = BsonDateTime::now();
        let raw = doc! {
            "_id": "a1",
            "exam_id": "exam-1",
            "student_id": "s1",
            "answers": { "q1": "A" },
            "version": 4_i64,
            "completion_status": "in_progress",
            "submitted_at": null,
            "created_at": now,
            "updated_at": now,
        };

        let state = AttemptState::from(from_document::<AttemptDocument>(raw).unwrap());
        assert_eq!(state.attempt_id, "a1");
        assert_eq!(state.version, 4);
        assert_eq!(state.answers["q1"], json!("A"));
        assert!(state.auto_save_data.is_empty());
        assert!(state.submitted_at.is_none());
        assert!(state.is_in_progress());
    }

    #[test]
    fn field_updates_use_dotted_paths() {
        let mut set = Document::new();
        let values: AnswerMap = [("q7".to_string(), json!({"choice": 2}))].into_iter().collect();

        MongoAttemptStore::field_updates("answers", &values, &mut set).unwrap();

        let nested = set.get_document("answers.q7").unwrap();
        let choice = match nested.get("choice") {
            Some(Bson::Int32(v)) => i64::from(*v),
            Some(Bson::Int64(v)) => *v,
            other => panic!("unexpected choice value: {:?}", other),
        };
        assert_eq!(choice, 2);
    }
}
