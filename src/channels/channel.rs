//! Delivery collaborator interface.

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ChannelError;

/// A message received from a transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingMessage {
    pub id: Uuid,
    /// Name of the channel it arrived on.
    pub channel: String,
    pub user_id: String,
    /// Chat the reply goes back to.
    pub chat_id: String,
    pub content: String,
    /// Local paths of downloaded attachments.
    pub attachments: Vec<String>,
    pub thread_id: Option<String>,
    pub reply_to: Option<String>,
    pub received_at: DateTime<Utc>,
}

impl IncomingMessage {
    /// A message whose reply goes back to the sender's own chat.
    pub fn new(
        channel: impl Into<String>,
        user_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let user_id = user_id.into();
        Self {
            id: Uuid::new_v4(),
            channel: channel.into(),
            chat_id: user_id.clone(),
            user_id,
            content: content.into(),
            attachments: Vec::new(),
            thread_id: None,
            reply_to: None,
            received_at: Utc::now(),
        }
    }

    pub fn with_chat(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = chat_id.into();
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<String>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_thread(mut self, thread_id: Option<String>, reply_to: Option<String>) -> Self {
        self.thread_id = thread_id;
        self.reply_to = reply_to;
        self
    }
}

/// A message to deliver.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingResponse {
    pub content: String,
    pub thread_id: Option<String>,
    pub reply_to: Option<String>,
    /// Where the message came from (`source`: inbox, job, heartbeat).
    pub metadata: serde_json::Value,
}

impl OutgoingResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            thread_id: None,
            reply_to: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn in_thread(mut self, thread_id: Option<String>, reply_to: Option<String>) -> Self {
        self.thread_id = thread_id;
        self.reply_to = reply_to;
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Inbound messages from a started channel.
pub type MessageStream = Pin<Box<dyn Stream<Item = IncomingMessage> + Send>>;

/// A chat transport.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Begin receiving messages.
    async fn start(&self) -> Result<MessageStream, ChannelError>;

    /// Deliver a complete message to `destination`.
    async fn send(&self, destination: &str, response: OutgoingResponse)
    -> Result<(), ChannelError>;

    /// Whether partial text should be pushed as it is generated.
    fn supports_streaming(&self) -> bool {
        false
    }

    /// Deliver one piece of partial text.
    async fn send_chunk(&self, _destination: &str, _chunk: &str) -> Result<(), ChannelError> {
        Ok(())
    }

    /// Close a streamed reply. `streamed` is everything already sent through
    /// [`Channel::send_chunk`]; the final response may extend it.
    async fn finish_stream(
        &self,
        destination: &str,
        _streamed: &str,
        response: OutgoingResponse,
    ) -> Result<(), ChannelError> {
        self.send(destination, response).await
    }

    /// Show a "working on it" indicator, where the transport has one.
    async fn send_typing(&self, _destination: &str) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}
