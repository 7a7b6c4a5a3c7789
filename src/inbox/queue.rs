//! Persistent inbox — durable FIFO of inbound messages with a single consumer.
//!
//! The whole record list lives in memory and is rewritten to disk (temp file +
//! rename) after every mutation. A failed write is logged and swallowed so the
//! consumer keeps running; the in-memory list stays authoritative.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::model::{MessageStatus, QueueStats, QueuedMessage, Threading};
use crate::error::QueueError;
use crate::persist;

/// How long finished messages are kept after completion.
pub const DONE_RETENTION: Duration = Duration::from_secs(3600);

/// Durable single-consumer inbox.
pub struct PersistentQueue {
    path: PathBuf,
    messages: Mutex<Vec<QueuedMessage>>,
}

impl PersistentQueue {
    /// Open the queue stored at `path`, applying startup recovery.
    ///
    /// Done records older than [`DONE_RETENTION`] are dropped and any record
    /// left `processing` by a previous process is reset to `pending`.
    pub async fn open(path: impl Into<PathBuf>) -> Arc<Self> {
        Self::open_with_retention(path, DONE_RETENTION).await
    }

    pub async fn open_with_retention(path: impl Into<PathBuf>, retention: Duration) -> Arc<Self> {
        let path = path.into();
        let mut messages: Vec<QueuedMessage> = match persist::read_json(&path).await {
            Ok(Some(messages)) => messages,
            Ok(None) => Vec::new(),
            Err(e) => {
                warn!(path = %path.display(), "Queue file unreadable, starting empty: {}", e);
                Vec::new()
            }
        };

        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::hours(1));
        let before = messages.len();
        messages.retain(|m| !(m.status == MessageStatus::Done && m.settled_at() < cutoff));
        let dropped = before - messages.len();

        let mut reset = 0;
        for msg in messages.iter_mut() {
            if msg.status == MessageStatus::Processing {
                msg.status = MessageStatus::Pending;
                reset += 1;
            }
        }

        if dropped > 0 || reset > 0 {
            info!(dropped, reset, "Recovered inbox queue");
        }

        let queue = Arc::new(Self {
            path,
            messages: Mutex::new(messages),
        });
        if dropped > 0 || reset > 0 {
            let messages = queue.messages.lock().await;
            queue.persist(&messages).await;
        }
        queue
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a pending message and persist it. Returns the new message id.
    pub async fn add(
        &self,
        destination: &str,
        text: &str,
        attachments: Option<Vec<String>>,
        threading: Option<Threading>,
    ) -> String {
        let msg = QueuedMessage::new(destination, text)
            .with_attachments(attachments.unwrap_or_default())
            .with_threading(threading.unwrap_or_default());
        let id = msg.id.clone();

        let mut messages = self.messages.lock().await;
        messages.push(msg);
        self.persist(&messages).await;

        debug!(message_id = %id, destination, "Message enqueued");
        id
    }

    /// Take the oldest pending message, flipping it to `processing`.
    pub async fn take(&self) -> Option<QueuedMessage> {
        let mut messages = self.messages.lock().await;
        let msg = messages
            .iter_mut()
            .find(|m| m.status == MessageStatus::Pending)?;
        msg.status = MessageStatus::Processing;
        let taken = msg.clone();
        self.persist(&messages).await;
        Some(taken)
    }

    /// Mark a message done.
    pub async fn complete(&self, id: &str) -> Result<(), QueueError> {
        self.settle(id, MessageStatus::Done, None).await
    }

    /// Mark a message failed with a reason.
    pub async fn fail(&self, id: &str, error: &str) -> Result<(), QueueError> {
        self.settle(id, MessageStatus::Failed, Some(error.to_string()))
            .await
    }

    async fn settle(
        &self,
        id: &str,
        status: MessageStatus,
        error: Option<String>,
    ) -> Result<(), QueueError> {
        let mut messages = self.messages.lock().await;
        let msg = messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| QueueError::NotFound { id: id.to_string() })?;
        msg.status = status;
        msg.error = error;
        msg.completed_at = Some(Utc::now());
        self.persist(&messages).await;
        Ok(())
    }

    /// Look up a message by id.
    pub async fn get(&self, id: &str) -> Option<QueuedMessage> {
        self.messages
            .lock()
            .await
            .iter()
            .find(|m| m.id == id)
            .cloned()
    }

    /// Count records per status.
    pub async fn stats(&self) -> QueueStats {
        let messages = self.messages.lock().await;
        let mut stats = QueueStats::default();
        for msg in messages.iter() {
            match msg.status {
                MessageStatus::Pending => stats.pending += 1,
                MessageStatus::Processing => stats.processing += 1,
                MessageStatus::Done => stats.done += 1,
                MessageStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    async fn persist(&self, messages: &[QueuedMessage]) {
        if let Err(e) = persist::write_json_atomic(&self.path, messages).await {
            let err = QueueError::Persist {
                path: self.path.display().to_string(),
                reason: e.to_string(),
            };
            warn!("{}", err);
        }
    }
}
