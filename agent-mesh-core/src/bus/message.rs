//! Message types for the bus

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

/// Delivery priority; lower numeric value is more urgent
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Priority {
    High = 0,
    #[default]
    Normal = 1,
    Low = 2,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One communication event between two participants
///
/// Fields are read-only once the message has been built; the `with_*`
/// builders consume the value so they can only be used while constructing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    from: String,
    to: String,
    message_type: String,
    content: Value,
    priority: Priority,
    correlation_id: Option<String>,
    timestamp: DateTime<Utc>,
    metadata: HashMap<String, Value>,
}

impl Message {
    /// Create a new message with NORMAL priority stamped with the current time
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        message_type: impl Into<String>,
        content: impl Into<Value>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            message_type: message_type.into(),
            content: content.into(),
            priority: Priority::default(),
            correlation_id: None,
            timestamp: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the correlation id linking a request to its reply
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Override the creation timestamp
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Add metadata to the message
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn sender(&self) -> &str {
        &self.from
    }

    pub fn recipient(&self) -> &str {
        &self.to
    }

    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn content(&self) -> &Value {
        &self.content
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn metadata(&self) -> &HashMap<String, Value> {
        &self.metadata
    }

    /// Consume the message and return its payload
    pub fn into_content(self) -> Value {
        self.content
    }

    /// Queue placement order: priority first, then creation time
    pub fn queue_cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| self.timestamp.cmp(&other.timestamp))
    }

    /// Copy of this message addressed to a different recipient
    pub(crate) fn readdressed(&self, to: &str) -> Self {
        Self {
            to: to.to_string(),
            ..self.clone()
        }
    }
}

/// Lightweight projection of a sent message kept in the bus history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub from: String,
    pub to: String,
    pub message_type: String,
    pub priority: Priority,
    pub correlation_id: Option<String>,
}

impl From<&Message> for HistoryEntry {
    fn from(message: &Message) -> Self {
        Self {
            timestamp: message.timestamp,
            from: message.from.clone(),
            to: message.to.clone(),
            message_type: message.message_type.clone(),
            priority: message.priority,
            correlation_id: message.correlation_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_defaults() {
        let msg = Message::new("a", "b", "ping", serde_json::json!({"n": 1}));
        assert_eq!(msg.priority(), Priority::Normal);
        assert!(msg.correlation_id().is_none());
        assert!(msg.metadata().is_empty());
        assert_eq!(msg.content()["n"], 1);
    }

    #[test]
    fn test_priority_order() {
        assert!(Priority::High < Priority::Normal);
        assert!(Priority::Normal < Priority::Low);
        assert_eq!(Priority::High as u8, 0);
        assert_eq!(serde_json::to_string(&Priority::Low).unwrap(), "\"low\"");
    }

    #[test]
    fn test_queue_cmp_priority_then_timestamp() {
        let t0 = Utc::now();
        let early_low = Message::new("a", "b", "t", Value::Null)
            .with_priority(Priority::Low)
            .with_timestamp(t0);
        let late_high = Message::new("a", "b", "t", Value::Null)
            .with_priority(Priority::High)
            .with_timestamp(t0 + Duration::seconds(5));
        let late_low = early_low.clone().with_timestamp(t0 + Duration::seconds(1));

        assert_eq!(late_high.queue_cmp(&early_low), Ordering::Less);
        assert_eq!(early_low.queue_cmp(&late_low), Ordering::Less);
        assert_eq!(early_low.queue_cmp(&early_low), Ordering::Equal);
    }

    #[test]
    fn test_readdressed_only_changes_recipient() {
        let original = Message::new("a", "b", "news", "hello")
            .with_correlation_id("c-1")
            .with_metadata("k", "v");
        let copy = original.readdressed("c");

        assert_eq!(copy.recipient(), "c");
        assert_eq!(copy.sender(), original.sender());
        assert_eq!(copy.content(), original.content());
        assert_eq!(copy.timestamp(), original.timestamp());
        assert_eq!(copy.correlation_id(), Some("c-1"));
        assert_eq!(copy.metadata(), original.metadata());
    }

    #[test]
    fn test_history_entry_projection() {
        let msg = Message::new("a", "b", "ping", "x").with_priority(Priority::High);
        let entry = HistoryEntry::from(&msg);
        assert_eq!(entry.from, "a");
        assert_eq!(entry.to, "b");
        assert_eq!(entry.message_type, "ping");
        assert_eq!(entry.priority, Priority::High);
        assert_eq!(entry.timestamp, msg.timestamp());
    }
}
