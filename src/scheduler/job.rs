//! Work item and result envelope definitions for the scheduler.
//!
//! This module defines the values that flow through a run:
//!
//! - `RecordId`: the identifier used for deduplication across runs
//! - `WorkItem`: one pending unit of work loaded from the dataset
//! - `ResultEnvelope`: what a worker produced for one item
//! - `PoolMessage`: the tagged value carried by the result channel

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Unique identifier of a work item and of the record persisted for it.
///
/// Datasets use either integer or string ids. Integers order numerically and
/// sort before strings, which order lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Int(i64),
    Text(String),
}

impl Ord for RecordId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (RecordId::Int(a), RecordId::Int(b)) => a.cmp(b),
            (RecordId::Text(a), RecordId::Text(b)) => a.cmp(b),
            (RecordId::Int(_), RecordId::Text(_)) => Ordering::Less,
            (RecordId::Text(_), RecordId::Int(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for RecordId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Int(id) => write!(f, "{}", id),
            RecordId::Text(id) => write!(f, "{}", id),
        }
    }
}

impl From<i64> for RecordId {
    fn from(id: i64) -> Self {
        RecordId::Int(id)
    }
}

impl From<i32> for RecordId {
    fn from(id: i32) -> Self {
        RecordId::Int(i64::from(id))
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        RecordId::Text(id.to_string())
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        RecordId::Text(id)
    }
}

/// One pending unit of work: a mandatory id plus arbitrary payload fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    /// Identifier used for deduplication and resume.
    pub id: RecordId,
    /// Remaining dataset fields, kept verbatim.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl WorkItem {
    /// Creates an item with no payload fields.
    pub fn new(id: impl Into<RecordId>) -> Self {
        Self {
            id: id.into(),
            fields: Map::new(),
        }
    }

    /// Adds a payload field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Returns a payload field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Returns a payload field if it is a string.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }
}

/// Why a worker gave up on an item for good.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EnvelopeError {
    /// The endpoint refused the prompt on content-policy grounds.
    ContentPolicy { message: String },
    /// The item used up its attempt budget.
    AttemptsExhausted { attempts: u32, last_error: String },
}

impl fmt::Display for EnvelopeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnvelopeError::ContentPolicy { message } => {
                write!(f, "content policy violation: {}", message)
            }
            EnvelopeError::AttemptsExhausted {
                attempts,
                last_error,
            } => write!(f, "gave up after {} attempts: {}", attempts, last_error),
        }
    }
}

/// Output of one worker for one item.
///
/// Carries either the raw model output or the reason the item was
/// permanently skipped, never both.
#[derive(Debug, Clone)]
pub struct ResultEnvelope {
    /// The item that was processed.
    pub item: WorkItem,
    /// Request context: the rendered prompt sent to the endpoint.
    pub prompt: String,
    /// Raw model output, present on success.
    pub response: Option<String>,
    /// Terminal classification, present when the item was skipped.
    pub error: Option<EnvelopeError>,
    /// Index of the worker that produced this envelope.
    pub worker_id: usize,
    /// When the worker finished with the item.
    pub finished_at: DateTime<Utc>,
}

impl ResultEnvelope {
    /// Creates an envelope for a successful response.
    pub fn completed(
        item: WorkItem,
        prompt: impl Into<String>,
        response: impl Into<String>,
        worker_id: usize,
    ) -> Self {
        Self {
            item,
            prompt: prompt.into(),
            response: Some(response.into()),
            error: None,
            worker_id,
            finished_at: Utc::now(),
        }
    }

    /// Creates an envelope for an item that will not be retried.
    pub fn skipped(
        item: WorkItem,
        prompt: impl Into<String>,
        error: EnvelopeError,
        worker_id: usize,
    ) -> Self {
        Self {
            item,
            prompt: prompt.into(),
            response: None,
            error: Some(error),
            worker_id,
            finished_at: Utc::now(),
        }
    }

    /// Returns whether the envelope carries a model response.
    pub fn is_success(&self) -> bool {
        self.response.is_some() && self.error.is_none()
    }
}

/// Value carried by the result channel.
///
/// `Done` is a distinct variant, so a producer's termination signal can never
/// be confused with a real payload.
#[derive(Debug, Clone)]
pub enum PoolMessage {
    Payload(ResultEnvelope),
    Done { worker_id: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_id_ordering() {
        let mut ids = vec![
            RecordId::from("b"),
            RecordId::from(10),
            RecordId::from("a"),
            RecordId::from(2),
            RecordId::from(-1),
        ];
        ids.sort();

        assert_eq!(
            ids,
            vec![
                RecordId::Int(-1),
                RecordId::Int(2),
                RecordId::Int(10),
                RecordId::Text("a".to_string()),
                RecordId::Text("b".to_string()),
            ]
        );
    }

    #[test]
    fn test_record_id_untagged_serde() {
        let id: RecordId = serde_json::from_str("7").expect("integer id");
        assert_eq!(id, RecordId::Int(7));

        let id: RecordId = serde_json::from_str("\"q-7\"").expect("string id");
        assert_eq!(id, RecordId::Text("q-7".to_string()));

        assert_eq!(serde_json::to_string(&RecordId::Int(7)).unwrap(), "7");
        assert!(serde_json::from_str::<RecordId>("[1]").is_err());
    }

    #[test]
    fn test_work_item_flattens_fields() {
        let item: WorkItem =
            serde_json::from_str(r#"{"id":1,"extra":{"k":true},"query":"hi"}"#).unwrap();

        assert_eq!(item.id, RecordId::Int(1));
        assert_eq!(item.get_str("query"), Some("hi"));
        assert!(!item.fields.contains_key("id"));

        let json = serde_json::to_string(&item).unwrap();
        assert_eq!(json, r#"{"id":1,"extra":{"k":true},"query":"hi"}"#);
    }

    #[test]
    fn test_work_item_requires_id() {
        let result = serde_json::from_str::<WorkItem>(r#"{"query":"hi"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_envelope_constructors() {
        let item = WorkItem::new(3).with_field("query", "hello");

        let ok = ResultEnvelope::completed(item.clone(), "hello", "world", 0);
        assert!(ok.is_success());
        assert_eq!(ok.response.as_deref(), Some("world"));

        let skipped = ResultEnvelope::skipped(
            item,
            "hello",
            EnvelopeError::ContentPolicy {
                message: "flagged".to_string(),
            },
            1,
        );
        assert!(!skipped.is_success());
        assert_eq!(skipped.worker_id, 1);
        assert!(skipped
            .error
            .as_ref()
            .map(|e| e.to_string().contains("flagged"))
            .unwrap_or(false));
    }
}
