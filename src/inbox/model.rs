//! Inbox data model — queued inbound messages and their lifecycle status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Waiting for the consumer.
    Pending,
    /// Taken by the consumer; at most one message is in this state.
    Processing,
    /// Handled and delivered.
    Done,
    /// Handling failed; `error` holds the reason.
    Failed,
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Optional threading references carried from the transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Threading {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

/// One inbound request waiting in (or finished with) the inbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    pub id: String,
    /// Chat the response goes back to.
    pub destination: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Local file paths of attachments that came with the message.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub threading: Threading,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl QueuedMessage {
    /// Create a new pending message.
    pub fn new(destination: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            destination: destination.into(),
            text: text.into(),
            timestamp: Utc::now(),
            status: MessageStatus::Pending,
            error: None,
            attachments: Vec::new(),
            threading: Threading::default(),
            completed_at: None,
        }
    }

    /// Builder: attach local files.
    pub fn with_attachments(mut self, attachments: Vec<String>) -> Self {
        self.attachments = attachments;
        self
    }

    /// Builder: set threading references.
    pub fn with_threading(mut self, threading: Threading) -> Self {
        self.threading = threading;
        self
    }

    /// When the message reached a terminal state (falls back to enqueue time).
    pub fn settled_at(&self) -> DateTime<Utc> {
        self.completed_at.unwrap_or(self.timestamp)
    }
}

/// Per-status counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub processing: usize,
    pub done: usize,
    pub failed: usize,
}

impl QueueStats {
    pub fn total(&self) -> usize {
        self.pending + self.processing + self.done + self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_message_is_pending() {
        let msg = QueuedMessage::new("42", "hello");
        assert_eq!(msg.status, MessageStatus::Pending);
        assert!(msg.error.is_none());
        assert!(msg.attachments.is_empty());
        assert_eq!(msg.settled_at(), msg.timestamp);
    }

    #[test]
    fn serializes_camel_case_and_skips_empty() {
        let msg = QueuedMessage::new("42", "hello").with_threading(Threading {
            thread_id: Some("t1".into()),
            reply_to: None,
        });
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["status"], "pending");
        assert_eq!(json["threading"]["threadId"], "t1");
        assert!(json.get("attachments").is_none());
        assert!(json.get("completedAt").is_none());
    }
}
