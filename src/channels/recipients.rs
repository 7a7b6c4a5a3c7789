//! Where unsolicited messages (heartbeat output) go.
//!
//! Priority: explicit configuration, the chat most recently active in this
//! process, the chat of the most recently stored conversation (persisted, so
//! it survives restarts), then the first registered recipient.

use std::path::PathBuf;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::persist;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LastConversation {
    chat_id: String,
    at: DateTime<Utc>,
}

/// Tracks known chats and resolves a default destination.
pub struct RecipientDirectory {
    last_active: RwLock<Option<String>>,
    /// File holding the last conversation's chat.
    conversation_path: PathBuf,
    registered: Vec<String>,
}

impl RecipientDirectory {
    pub fn new(conversation_path: impl Into<PathBuf>, registered: Vec<String>) -> Self {
        Self {
            last_active: RwLock::new(None),
            conversation_path: conversation_path.into(),
            registered,
        }
    }

    /// Note that `chat_id` just talked to us.
    pub fn record_active(&self, chat_id: &str) {
        if let Ok(mut last) = self.last_active.write() {
            *last = Some(chat_id.to_string());
        }
    }

    /// Persist `chat_id` as the chat of the latest stored conversation.
    pub async fn record_conversation(&self, chat_id: &str) {
        let record = LastConversation {
            chat_id: chat_id.to_string(),
            at: Utc::now(),
        };
        if let Err(e) = persist::write_json_atomic(&self.conversation_path, &record).await {
            tracing::warn!(
                path = %self.conversation_path.display(),
                "Failed to record last conversation: {}", e
            );
        }
    }

    pub fn last_active(&self) -> Option<String> {
        self.last_active.read().ok().and_then(|l| l.clone())
    }

    pub fn registered(&self) -> &[String] {
        &self.registered
    }

    /// First resolvable destination in priority order.
    pub async fn resolve(&self, explicit: Option<&str>) -> Option<String> {
        if let Some(dest) = explicit.map(str::trim).filter(|d| !d.is_empty()) {
            return Some(dest.to_string());
        }
        if let Some(dest) = self.last_active() {
            return Some(dest);
        }
        match persist::read_json::<LastConversation>(&self.conversation_path).await {
            Ok(Some(last)) => return Some(last.chat_id),
            Ok(None) => {}
            Err(e) => tracing::debug!("Last conversation unreadable: {}", e),
        }
        self.registered.first().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn directory(dir: &TempDir, registered: &[&str]) -> RecipientDirectory {
        RecipientDirectory::new(
            dir.path().join("last_conversation.json"),
            registered.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[tokio::test]
    async fn explicit_wins() {
        let dir = TempDir::new().unwrap();
        let recipients = directory(&dir, &["first"]);
        recipients.record_active("active");
        assert_eq!(
            recipients.resolve(Some("configured")).await.as_deref(),
            Some("configured")
        );
    }

    #[tokio::test]
    async fn falls_through_in_priority_order() {
        let dir = TempDir::new().unwrap();
        let recipients = directory(&dir, &["first", "second"]);
        assert_eq!(recipients.resolve(Some("  ")).await.as_deref(), Some("first"));

        recipients.record_conversation("stored").await;
        assert_eq!(recipients.resolve(None).await.as_deref(), Some("stored"));

        recipients.record_active("active");
        assert_eq!(recipients.resolve(None).await.as_deref(), Some("active"));
    }

    #[tokio::test]
    async fn stored_conversation_survives_restart() {
        let dir = TempDir::new().unwrap();
        directory(&dir, &[]).record_conversation("earlier").await;
        let fresh = directory(&dir, &[]);
        assert_eq!(fresh.resolve(None).await.as_deref(), Some("earlier"));
    }

    #[tokio::test]
    async fn nothing_known_resolves_to_none() {
        let dir = TempDir::new().unwrap();
        assert_eq!(directory(&dir, &[]).resolve(None).await, None);
    }
}
