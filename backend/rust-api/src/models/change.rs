use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use validator::{Validate, ValidationError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Answer,
    AutoSave,
    Navigation,
    Activity,
}

impl ChangeKind {
    /// Whether events of this kind are written into the attempt state.
    pub fn is_persisted(&self) -> bool {
        matches!(self, ChangeKind::Answer | ChangeKind::AutoSave)
    }
}

/// A single client-side edit. Ephemeral: discarded once persisted or superseded.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
pub struct ChangeEvent {
    #[validate(
        length(min = 1, max = 128, message = "question_id must be between 1 and 128 characters"),
        custom(function = "validate_question_id")
    )]
    pub question_id: String,

    #[serde(default)]
    pub value: serde_json::Value,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    pub kind: ChangeKind,
}

impl ChangeEvent {
    pub fn new(
        question_id: impl Into<String>,
        value: serde_json::Value,
        kind: ChangeKind,
    ) -> Self {
        Self {
            question_id: question_id.into(),
            value,
            timestamp: Utc::now(),
            kind,
        }
    }

    pub fn answer(question_id: impl Into<String>, value: serde_json::Value) -> Self {
        Self::new(question_id, value, ChangeKind::Answer)
    }

    pub fn auto_save(question_id: impl Into<String>, value: serde_json::Value) -> Self {
        Self::new(question_id, value, ChangeKind::AutoSave)
    }
}

/// Change events decoded element by element.
///
/// An element that does not decode as a [`ChangeEvent`] is kept aside as a
/// message instead of failing the whole request body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IncomingChanges {
    pub events: Vec<ChangeEvent>,
    pub malformed: Vec<String>,
}

impl IncomingChanges {
    pub fn len(&self) -> usize {
        self.events.len() + self.malformed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Vec<ChangeEvent>> for IncomingChanges {
    fn from(events: Vec<ChangeEvent>) -> Self {
        Self {
            events,
            malformed: Vec::new(),
        }
    }
}

impl<'de> Deserialize<'de> for IncomingChanges {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Vec::<serde_json::Value>::deserialize(deserializer)?;
        let mut changes = IncomingChanges::default();
        for (index, value) in raw.into_iter().enumerate() {
            match serde_json::from_value::<ChangeEvent>(value) {
                Ok(event) => changes.events.push(event),
                Err(e) => changes.malformed.push(format!("changes[{}]: {}", index, e)),
            }
        }
        Ok(changes)
    }
}

// Question ids become document field paths in the store.
fn validate_question_id(question_id: &str) -> Result<(), ValidationError> {
    if question_id.starts_with('$') || question_id.contains('.') {
        let mut err = ValidationError::new("question_id_path");
        err.message = Some("question_id must not contain '.' or start with '$'".into());
        return Err(err);
    }
    if question_id.chars().any(|c| c.is_control()) {
        return Err(ValidationError::new("question_id_control_chars"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accepts_plain_question_ids() {
        assert!(ChangeEvent::answer("q-17", json!("B")).validate().is_ok());
    }

    #[test]
    fn rejects_empty_and_path_like_ids() {
        assert!(ChangeEvent::answer("", json!("B")).validate().is_err());
        assert!(ChangeEvent::answer("answers.q1", json!("B")).validate().is_err());
        assert!(ChangeEvent::answer("$set", json!("B")).validate().is_err());
    }

    #[test]
    fn malformed_elements_are_set_aside() {
        let changes: IncomingChanges = serde_json::from_value(json!([
            {"question_id": "q1", "value": "A", "kind": "bogus"},
            {"value": "B", "kind": "answer"},
            {"question_id": "q2", "value": "C", "kind": "answer"}
        ]))
        .unwrap();

        assert_eq!(changes.events.len(), 1);
        assert_eq!(changes.events[0].question_id, "q2");
        assert_eq!(changes.malformed.len(), 2);
        assert!(changes.malformed[0].starts_with("changes[0]"));
        assert!(changes.malformed[1].starts_with("changes[1]"));
        assert_eq!(changes.len(), 3);
    }

    #[test]
    fn deserializes_without_timestamp() {
        let event: ChangeEvent =
            serde_json::from_value(json!({"question_id": "q1", "value": "A", "kind": "auto_save"}))
                .unwrap();
        assert_eq!(event.kind, ChangeKind::AutoSave);
        assert!(event.kind.is_persisted());
        assert!(!ChangeKind::Navigation.is_persisted());
    }
}
