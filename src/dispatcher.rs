//! Inbox consumer.
//!
//! One loop takes messages from the persistent queue one at a time, runs the
//! agent for each (streaming when both the channel and the configuration
//! allow it), and hands the reply to the channel. A second task feeds the
//! queue from the channel's inbound stream.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::agent::types::truncate_diagnostic;
use crate::agent::{AgentBackend, InvocationResult, InvokeOptions};
use crate::channels::{Channel, OutgoingResponse, RecipientDirectory};
use crate::error::AgentError;
use crate::inbox::{PersistentQueue, QueuedMessage, Threading};

/// Failure notices are cut to this many bytes.
const NOTICE_LIMIT: usize = 500;

const SUMMARIZE_PROMPT: &str = "You used tools but did not write a reply. \
     Briefly tell the user what you did and what came of it.";

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub poll_interval: Duration,
    pub agent_timeout: Duration,
    pub streaming: bool,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            agent_timeout: Duration::from_secs(600),
            streaming: true,
        }
    }
}

pub struct Dispatcher {
    queue: Arc<PersistentQueue>,
    agent: Arc<dyn AgentBackend>,
    channel: Arc<dyn Channel>,
    recipients: Arc<RecipientDirectory>,
    config: DispatcherConfig,
    /// Cancels the invocation in flight. Separate from the stop signal so
    /// shutdown can let current work finish first.
    abort: CancellationToken,
    busy: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<PersistentQueue>,
        agent: Arc<dyn AgentBackend>,
        channel: Arc<dyn Channel>,
        recipients: Arc<RecipientDirectory>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            queue,
            agent,
            channel,
            recipients,
            config,
            abort: CancellationToken::new(),
            busy: AtomicBool::new(false),
        }
    }

    /// Token that cancels whatever invocation is running.
    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    /// Whether a message is being processed right now.
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Consume the queue until `stop` fires. The message in hand when `stop`
    /// fires is finished first.
    pub async fn run(&self, stop: CancellationToken) {
        tracing::info!(channel = %self.channel.name(), "Dispatcher listening");
        loop {
            if stop.is_cancelled() {
                break;
            }
            if !self.process_next().await {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }
        tracing::info!("Dispatcher stopped");
    }

    /// Process the oldest pending message, if any. Returns whether one was
    /// processed.
    pub async fn process_next(&self) -> bool {
        let Some(msg) = self.queue.take().await else {
            return false;
        };
        self.busy.store(true, Ordering::SeqCst);
        self.process(msg).await;
        self.busy.store(false, Ordering::SeqCst);
        true
    }

    async fn process(&self, msg: QueuedMessage) {
        tracing::debug!(message_id = %msg.id, destination = %msg.destination, "Processing message");
        if let Err(e) = self.channel.send_typing(&msg.destination).await {
            tracing::debug!("Typing indicator failed: {}", e);
        }

        let prompt = message_prompt(&msg);
        let streaming = self.config.streaming && self.channel.supports_streaming();
        let outcome = if streaming {
            self.invoke_streaming(&msg, &prompt).await
        } else {
            self.invoke_batch(&prompt).await.map(|result| (result, String::new()))
        };

        match outcome {
            Ok((result, _)) if result.is_error => {
                let reason = format!("agent reported an error: {}", result.text);
                self.fail(&msg, &reason, notice("returned an error", &result.text))
                    .await;
            }
            Ok((result, streamed)) => self.deliver(&msg, result, streamed).await,
            Err(e) => {
                let reason = e.to_string();
                self.fail(&msg, &reason, notice(e.category(), &reason)).await;
            }
        }
    }

    fn options(&self) -> InvokeOptions {
        InvokeOptions::new(self.config.agent_timeout).with_cancel(self.abort.child_token())
    }

    async fn invoke_batch(&self, prompt: &str) -> Result<InvocationResult, AgentError> {
        self.agent.invoke(prompt, self.options()).await
    }

    /// Run a streaming invocation, relaying chunks to the channel while the
    /// agent is still producing them. Returns the result and everything that
    /// was relayed.
    async fn invoke_streaming(
        &self,
        msg: &QueuedMessage,
        prompt: &str,
    ) -> Result<(InvocationResult, String), AgentError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let options = self.options();

        let invoke = async move {
            let mut forward = |chunk: &str| {
                let _ = tx.send(chunk.to_string());
            };
            self.agent
                .invoke_streaming(prompt, options, &mut forward)
                .await
        };

        let relay = async {
            let mut streamed = String::new();
            while let Some(chunk) = rx.recv().await {
                if let Err(e) = self.channel.send_chunk(&msg.destination, &chunk).await {
                    tracing::warn!(message_id = %msg.id, "Failed to relay chunk: {}", e);
                }
                streamed.push_str(&chunk);
            }
            streamed
        };

        let (result, streamed) = tokio::join!(invoke, relay);
        Ok((result?, streamed))
    }

    async fn deliver(&self, msg: &QueuedMessage, mut result: InvocationResult, streamed: String) {
        if result.recovered {
            tracing::info!(message_id = %msg.id, "Reply recovered from transcript after timeout");
        }

        if result.is_silent_tool_use() {
            result.text = self.summarize_tool_use(msg, &result).await;
        }

        let response = OutgoingResponse::text(result.text.trim_end())
            .in_thread(
                msg.threading.thread_id.clone(),
                msg.threading.reply_to.clone(),
            )
            .with_metadata(serde_json::json!({
                "source": "inbox",
                "message_id": msg.id,
                "cost_usd": result.cost_usd,
                "timed_out": result.timed_out,
            }));

        let sent = if !streamed.is_empty() {
            self.channel
                .finish_stream(&msg.destination, &streamed, response)
                .await
        } else if response.content.trim().is_empty() {
            tracing::info!(message_id = %msg.id, "Agent produced no reply");
            Ok(())
        } else {
            self.channel.send(&msg.destination, response).await
        };

        match sent {
            Ok(()) => {
                if let Err(e) = self.queue.complete(&msg.id).await {
                    tracing::error!(message_id = %msg.id, "Failed to complete message: {}", e);
                }
                self.recipients.record_active(&msg.destination);
                self.recipients.record_conversation(&msg.destination).await;
                tracing::info!(
                    message_id = %msg.id,
                    duration_ms = result.duration.as_millis() as u64,
                    tool_uses = result.tool_uses.len(),
                    "Message answered"
                );
            }
            Err(e) => {
                tracing::error!(message_id = %msg.id, "Failed to deliver reply: {}", e);
                if let Err(e) = self.queue.fail(&msg.id, &format!("delivery failed: {e}")).await {
                    tracing::error!(message_id = %msg.id, "Failed to mark message failed: {}", e);
                }
            }
        }
    }

    /// Ask the agent, in the same session, to put its tool activity into words.
    async fn summarize_tool_use(&self, msg: &QueuedMessage, result: &InvocationResult) -> String {
        let tools: Vec<&str> = result.tool_uses.iter().map(|t| t.name.as_str()).collect();
        let Some(session) = result.session.clone() else {
            tracing::debug!(message_id = %msg.id, "Silent tool use without a session, nothing to resume");
            return String::new();
        };
        tracing::info!(message_id = %msg.id, tools = ?tools, "Tool use without reply, asking for a summary");

        let options = self.options().with_resume(session);
        match self.agent.invoke(SUMMARIZE_PROMPT, options).await {
            Ok(summary) if !summary.is_error => summary.text,
            Ok(summary) => {
                tracing::warn!(message_id = %msg.id, "Summary request errored: {}", summary.text);
                String::new()
            }
            Err(e) => {
                tracing::warn!(message_id = %msg.id, "Summary request failed: {}", e);
                String::new()
            }
        }
    }

    async fn fail(&self, msg: &QueuedMessage, reason: &str, notice: String) {
        tracing::warn!(message_id = %msg.id, "Message failed: {}", reason);
        if let Err(e) = self.queue.fail(&msg.id, reason).await {
            tracing::error!(message_id = %msg.id, "Failed to mark message failed: {}", e);
        }
        let response = OutgoingResponse::text(notice)
            .in_thread(
                msg.threading.thread_id.clone(),
                msg.threading.reply_to.clone(),
            )
            .with_metadata(serde_json::json!({ "source": "inbox", "error": true }));
        if let Err(e) = self.channel.send(&msg.destination, response).await {
            tracing::error!(message_id = %msg.id, "Failed to send failure notice: {}", e);
        }
    }
}

fn notice(category: &str, detail: &str) -> String {
    format!(
        "Sorry, the agent {}: {}",
        category,
        truncate_diagnostic(detail, NOTICE_LIMIT)
    )
}

fn message_prompt(msg: &QueuedMessage) -> String {
    if msg.attachments.is_empty() {
        return msg.text.clone();
    }
    format!(
        "{}\n\n[Attachments: {}]",
        msg.text,
        msg.attachments.join(", ")
    )
}

/// Spawn the dispatcher loop.
pub fn spawn_dispatcher(dispatcher: Arc<Dispatcher>, stop: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move { dispatcher.run(stop).await })
}

/// Feed the queue from the channel's inbound stream until it ends or `stop`
/// fires.
pub async fn spawn_ingest(
    channel: Arc<dyn Channel>,
    queue: Arc<PersistentQueue>,
    recipients: Arc<RecipientDirectory>,
    stop: CancellationToken,
) -> Result<JoinHandle<()>, crate::error::ChannelError> {
    let mut messages = channel.start().await?;
    tracing::info!(channel = %channel.name(), "Channel started");

    Ok(tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                _ = stop.cancelled() => break,
                msg = messages.next() => match msg {
                    Some(msg) => msg,
                    None => {
                        tracing::info!("Channel stream ended");
                        break;
                    }
                },
            };
            recipients.record_active(&msg.chat_id);
            let threading = Threading {
                thread_id: msg.thread_id,
                reply_to: msg.reply_to,
            };
            queue
                .add(
                    &msg.chat_id,
                    &msg.content,
                    Some(msg.attachments),
                    Some(threading),
                )
                .await;
        }
    }))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::agent::{SessionHandle, ToolUseEntry};
    use crate::inbox::MessageStatus;
    use crate::testing::{RecordingChannel, StubAgent};
    use tempfile::TempDir;

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        queue: Arc<PersistentQueue>,
        agent: Arc<StubAgent>,
        channel: Arc<RecordingChannel>,
        recipients: Arc<RecipientDirectory>,
        _dir: TempDir,
    }

    async fn harness(agent: StubAgent, channel: RecordingChannel, streaming: bool) -> Harness {
        let dir = TempDir::new().unwrap();
        let queue = PersistentQueue::open(dir.path().join("queue.json")).await;
        let agent = Arc::new(agent);
        let channel = Arc::new(channel);
        let recipients = Arc::new(RecipientDirectory::new(
            dir.path().join("last_conversation.json"),
            Vec::new(),
        ));
        let dispatcher = Arc::new(Dispatcher::new(
            queue.clone(),
            agent.clone(),
            channel.clone(),
            recipients.clone(),
            DispatcherConfig {
                poll_interval: Duration::from_millis(10),
                agent_timeout: Duration::from_secs(5),
                streaming,
            },
        ));
        Harness {
            dispatcher,
            queue,
            agent,
            channel,
            recipients,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn batch_reply_is_delivered_and_completed() {
        let h = harness(StubAgent::new().reply_text("Hi there"), RecordingChannel::new(), true).await;
        let id = h.queue.add("chat-1", "hello", None, None).await;

        assert!(h.dispatcher.process_next().await);
        assert!(!h.dispatcher.process_next().await);

        assert_eq!(h.agent.streamed_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.agent.prompts.lock().unwrap()[0], "hello");
        assert_eq!(
            h.channel.contents(),
            vec![("chat-1".to_string(), "Hi there".to_string())]
        );
        assert_eq!(h.channel.typing.load(Ordering::SeqCst), 1);
        assert_eq!(h.queue.get(&id).await.unwrap().status, MessageStatus::Done);
        assert_eq!(h.recipients.last_active().as_deref(), Some("chat-1"));
    }

    #[tokio::test]
    async fn streaming_channel_gets_chunks() {
        let h = harness(
            StubAgent::new().reply_text("streamed words"),
            RecordingChannel::streaming(),
            true,
        )
        .await;
        h.queue.add("chat-1", "hello", None, None).await;
        h.dispatcher.process_next().await;

        assert_eq!(h.agent.streamed_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            *h.channel.chunks.lock().unwrap(),
            vec![("chat-1".to_string(), "streamed words".to_string())]
        );
        assert_eq!(h.channel.contents()[0].1, "streamed words");
    }

    #[tokio::test]
    async fn streaming_disabled_by_config() {
        let h = harness(StubAgent::new(), RecordingChannel::streaming(), false).await;
        h.queue.add("chat-1", "hello", None, None).await;
        h.dispatcher.process_next().await;
        assert_eq!(h.agent.streamed_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invocation_error_fails_message_with_notice() {
        let agent = StubAgent::new().reply(Err(AgentError::NonZeroExit {
            code: Some(2),
            diagnostic: "x".repeat(2000),
        }));
        let h = harness(agent, RecordingChannel::new(), false).await;
        let id = h.queue.add("chat-1", "hello", None, None).await;
        h.dispatcher.process_next().await;

        let msg = h.queue.get(&id).await.unwrap();
        assert_eq!(msg.status, MessageStatus::Failed);
        assert!(msg.error.unwrap().contains("code"));

        let sent = h.channel.contents();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.starts_with("Sorry, the agent failed: "));
        assert!(sent[0].1.len() < 600);

        // no automatic retry
        assert!(!h.dispatcher.process_next().await);
        assert_eq!(h.agent.calls(), 1);
    }

    #[tokio::test]
    async fn silent_tool_use_triggers_summary_in_same_session() {
        let silent = InvocationResult {
            text: String::new(),
            session: Some(SessionHandle::new("sess-1")),
            tool_uses: vec![ToolUseEntry {
                name: "write_file".into(),
                input: serde_json::json!({"path": "notes.md"}),
            }],
            ..Default::default()
        };
        let agent = StubAgent::new()
            .reply(Ok(silent))
            .reply_text("I saved your notes to notes.md.");
        let h = harness(agent, RecordingChannel::new(), false).await;
        h.queue.add("chat-1", "save this", None, None).await;
        h.dispatcher.process_next().await;

        assert_eq!(h.agent.calls(), 2);
        let options = h.agent.options.lock().unwrap();
        assert_eq!(options[1].resume.as_ref().map(|s| s.as_str()), Some("sess-1"));
        assert_eq!(h.channel.contents()[0].1, "I saved your notes to notes.md.");
    }

    #[tokio::test]
    async fn attachments_and_threading_are_carried() {
        let h = harness(StubAgent::new(), RecordingChannel::new(), false).await;
        h.queue
            .add(
                "chat-1",
                "what is this?",
                Some(vec!["/tmp/photo.jpg".into()]),
                Some(Threading {
                    thread_id: Some("t-1".into()),
                    reply_to: None,
                }),
            )
            .await;
        h.dispatcher.process_next().await;

        assert!(h.agent.prompts.lock().unwrap()[0].ends_with("[Attachments: /tmp/photo.jpg]"));
        let sent = h.channel.sent.lock().unwrap();
        assert_eq!(sent[0].1.thread_id.as_deref(), Some("t-1"));
    }

    #[tokio::test]
    async fn messages_are_processed_in_order_one_at_a_time() {
        let agent = StubAgent::new().with_delay(Duration::from_millis(10));
        let h = harness(agent, RecordingChannel::new(), false).await;
        for text in ["one", "two", "three"] {
            h.queue.add("chat-1", text, None, None).await;
        }

        let stop = CancellationToken::new();
        let handle = spawn_dispatcher(h.dispatcher.clone(), stop.clone());
        for _ in 0..100 {
            if h.queue.stats().await.done == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        stop.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(*h.agent.prompts.lock().unwrap(), vec!["one", "two", "three"]);
        assert_eq!(h.agent.max_in_flight.load(Ordering::SeqCst), 1);
    }
}
