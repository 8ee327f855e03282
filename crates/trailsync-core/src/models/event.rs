//! Queued and failed event models

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Stable identifier of a queued statement.
///
/// Producers may supply their own id (usually the statement id) so that
/// retried enqueue calls collapse into one entry. Generated ids are UUID v7.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Create a new unique event ID using UUID v7
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Get the string representation of this ID
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::generate()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EventId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidInput("event id must not be empty".into()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl From<&str> for EventId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for EventId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Scheduling band of a queued event. Decides order, not content urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// All priorities in dequeue order
    pub const ALL: [Self; 3] = [Self::High, Self::Normal, Self::Low];

    /// Sort rank: lower ranks are dequeued first and evicted last
    pub const fn rank(self) -> i64 {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }

    /// Inverse of [`Priority::rank`]
    pub fn from_rank(rank: i64) -> Result<Self> {
        match rank {
            0 => Ok(Self::High),
            1 => Ok(Self::Normal),
            2 => Ok(Self::Low),
            other => Err(Error::InvalidInput(format!("unknown priority rank {other}"))),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::High => "high",
            Self::Normal => "normal",
            Self::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "normal" => Ok(Self::Normal),
            "low" => Ok(Self::Low),
            other => Err(Error::InvalidInput(format!(
                "invalid priority '{other}' (expected high, normal or low)"
            ))),
        }
    }
}

/// Producer-side input for an enqueue call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    /// Caller-supplied id; generated when absent
    #[serde(default)]
    pub id: Option<EventId>,
    /// Opaque statement body
    pub payload: Value,
    /// Optional tenant/organisation scope
    #[serde(default)]
    pub partition_key: Option<String>,
}

impl NewEvent {
    /// Wrap a payload, taking the id from the payload's `id` field when present
    #[must_use]
    pub fn new(payload: Value) -> Self {
        let id = payload
            .get("id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(EventId::from);
        Self {
            id,
            payload,
            partition_key: None,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<EventId>) -> Self {
        self.id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_partition(mut self, partition_key: impl Into<String>) -> Self {
        self.partition_key = Some(partition_key.into());
        self
    }
}

/// One pending statement waiting for delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedEvent {
    /// Unique identifier and dedupe key
    pub id: EventId,
    /// Opaque statement body
    pub payload: Value,
    /// Original enqueue time (Unix ms); drives FIFO order within a band
    pub queued_at: i64,
    /// Failed send attempts so far
    pub attempts: u32,
    /// Time of the last failed attempt (Unix ms)
    pub last_attempt_at: Option<i64>,
    /// Error message of the last failed attempt
    pub last_error: Option<String>,
    /// Scheduling band
    pub priority: Priority,
    /// Optional tenant/organisation scope
    pub partition_key: Option<String>,
}

impl QueuedEvent {
    /// Build a fresh queue entry from producer input
    #[must_use]
    pub fn from_new(event: NewEvent, priority: Priority, queued_at: i64) -> Self {
        Self {
            id: event.id.unwrap_or_default(),
            payload: event.payload,
            queued_at,
            attempts: 0,
            last_attempt_at: None,
            last_error: None,
            priority,
            partition_key: event.partition_key,
        }
    }

    /// Dequeue ordering key: priority band, then age, then id
    pub fn order_key(&self) -> (i64, i64, &str) {
        (self.priority.rank(), self.queued_at, self.id.as_str())
    }
}

/// A queued event that exhausted its retry budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedEvent {
    #[serde(flatten)]
    pub event: QueuedEvent,
    /// Time of promotion to the dead-letter table (Unix ms)
    pub failed_at: i64,
    /// Whether an operator has looked at it
    pub reviewed: bool,
}

impl FailedEvent {
    #[must_use]
    pub const fn from_exhausted(event: QueuedEvent, failed_at: i64) -> Self {
        Self {
            event,
            failed_at,
            reviewed: false,
        }
    }

    pub const fn id(&self) -> &EventId {
        &self.event.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_event_id_unique() {
        let id1 = EventId::generate();
        let id2 = EventId::generate();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_event_id_parse_rejects_blank() {
        assert!("  ".parse::<EventId>().is_err());
        assert_eq!("  abc ".parse::<EventId>().unwrap().as_str(), "abc");
    }

    #[test]
    fn test_priority_rank_round_trip() {
        for priority in Priority::ALL {
            assert_eq!(Priority::from_rank(priority.rank()).unwrap(), priority);
        }
        assert!(Priority::from_rank(7).is_err());
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert!("urgent".parse::<Priority>().is_err());
    }

    #[test]
    fn test_new_event_takes_statement_id() {
        let event = NewEvent::new(json!({"id": "stmt-1", "verb": {"id": "completed"}}));
        assert_eq!(event.id, Some(EventId::from("stmt-1")));

        let anonymous = NewEvent::new(json!({"verb": {"id": "completed"}}));
        assert_eq!(anonymous.id, None);
    }

    #[test]
    fn test_failed_event_serializes_flat() {
        let queued = QueuedEvent::from_new(
            NewEvent::new(json!({"n": 1})).with_id("a"),
            Priority::Low,
            10,
        );
        let failed = FailedEvent::from_exhausted(queued, 20);
        let value = serde_json::to_value(&failed).unwrap();
        assert_eq!(value["id"], "a");
        assert_eq!(value["priority"], "low");
        assert_eq!(value["failed_at"], 20);
        assert_eq!(value["reviewed"], false);
    }
}
