use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-question values keyed by question id.
pub type AnswerMap = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompletionStatus {
    InProgress,
    Submitted,
    Abandoned,
    Invalid,
}

impl CompletionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionStatus::InProgress => "in_progress",
            CompletionStatus::Submitted => "submitted",
            CompletionStatus::Abandoned => "abandoned",
            CompletionStatus::Invalid => "invalid",
        }
    }
}

/// Authoritative attempt state as owned by the attempt store.
///
/// Anything held by this crate is a transient copy and may be stale; the
/// store's version check is what decides whether a write lands.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttemptState {
    pub attempt_id: String,
    pub exam_id: String,
    pub student_id: String,
    #[serde(default)]
    pub answers: AnswerMap,
    #[serde(default)]
    pub auto_save_data: AnswerMap,
    pub version: i64,
    pub completion_status: CompletionStatus,
    pub submitted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AttemptState {
    /// Fresh in-progress attempt at version 1.
    pub fn new(
        attempt_id: impl Into<String>,
        exam_id: impl Into<String>,
        student_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            attempt_id: attempt_id.into(),
            exam_id: exam_id.into(),
            student_id: student_id.into(),
            answers: AnswerMap::new(),
            auto_save_data: AnswerMap::new(),
            version: 1,
            completion_status: CompletionStatus::InProgress,
            submitted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.completion_status == CompletionStatus::InProgress
    }
}

/// Outcome of a version-checked save as seen by callers of the gateway.
#[derive(Debug, Clone)]
pub enum SaveOutcome {
    Saved { new_version: i64 },
    Conflict { latest: Box<AttemptState> },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScoreSummary {
    pub total_questions: u32,
    pub correct_count: u32,
    pub score_percentage: f64,
}

impl ScoreSummary {
    /// Scores `answers` against an answer key. Questions missing from the
    /// answer set count as incorrect.
    pub fn grade(answer_key: &AnswerMap, answers: &AnswerMap) -> Self {
        let total_questions = answer_key.len() as u32;
        let correct_count = answer_key
            .iter()
            .filter(|(question_id, expected)| answers.get(*question_id) == Some(*expected))
            .count() as u32;
        let score_percentage = if total_questions == 0 {
            0.0
        } else {
            (correct_count as f64 / total_questions as f64) * 100.0
        };

        Self {
            total_questions,
            correct_count,
            score_percentage,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_attempt_starts_at_version_one() {
        let state = AttemptState::new("a1", "exam", "student");
        assert_eq!(state.version, 1);
        assert!(state.is_in_progress());
        assert!(state.answers.is_empty());
    }

    #[test]
    fn grade_counts_missing_answers_as_incorrect() {
        let key: AnswerMap = [("q1", json!("A")), ("q2", json!("B")), ("q3", json!(3))]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let answers: AnswerMap = [("q1", json!("A")), ("q3", json!(4))]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();

        let summary = ScoreSummary::grade(&key, &answers);
        assert_eq!(summary.total_questions, 3);
        assert_eq!(summary.correct_count, 1);
        assert!((summary.score_percentage - 33.333).abs() < 0.01);
    }

    #[test]
    fn grade_empty_key_is_zero() {
        let summary = ScoreSummary::grade(&AnswerMap::new(), &AnswerMap::new());
        assert_eq!(summary.score_percentage, 0.0);
    }
}
