//! Stub collaborators shared by unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;

use crate::agent::{AgentBackend, InvocationResult, InvokeOptions};
use crate::channels::{Channel, MessageStream, OutgoingResponse};
use crate::error::{AgentError, ChannelError};

/// Reply a delayed [`StubAgent`] gives when its invocation is cancelled.
pub(crate) const INTERRUPTED: &str = "interrupted";

/// Scripted agent: pops one reply per call, defaulting to "ok". A cancelled
/// delayed call returns [`INTERRUPTED`], as a cancelled stream returns what
/// it has so far.
#[derive(Default)]
pub(crate) struct StubAgent {
    replies: Mutex<VecDeque<Result<InvocationResult, AgentError>>>,
    pub prompts: Mutex<Vec<String>>,
    pub options: Mutex<Vec<InvokeOptions>>,
    pub streamed_calls: AtomicUsize,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    delay: Duration,
}

impl StubAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn reply_text(self, text: &str) -> Self {
        self.reply(Ok(InvocationResult {
            text: text.to_string(),
            ..Default::default()
        }))
    }

    pub fn reply(self, reply: Result<InvocationResult, AgentError>) -> Self {
        self.replies.lock().unwrap().push_back(reply);
        self
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }

    async fn next(
        &self,
        prompt: &str,
        options: InvokeOptions,
    ) -> Result<InvocationResult, AgentError> {
        let cancel = options.cancel.clone();
        self.prompts.lock().unwrap().push(prompt.to_string());
        self.options.lock().unwrap().push(options);

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            let cancelled = async {
                match &cancel {
                    Some(token) => token.cancelled().await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = cancelled => {
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                    return Ok(InvocationResult {
                        text: INTERRUPTED.to_string(),
                        ..Default::default()
                    });
                }
            }
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let reply = self.replies.lock().unwrap().pop_front();
        reply.unwrap_or_else(|| {
            Ok(InvocationResult {
                text: "ok".to_string(),
                ..Default::default()
            })
        })
    }
}

#[async_trait]
impl AgentBackend for StubAgent {
    async fn invoke(
        &self,
        prompt: &str,
        options: InvokeOptions,
    ) -> Result<InvocationResult, AgentError> {
        self.next(prompt, options).await
    }

    async fn invoke_streaming(
        &self,
        prompt: &str,
        options: InvokeOptions,
        on_chunk: &mut (dyn for<'c> FnMut(&'c str) + Send),
    ) -> Result<InvocationResult, AgentError> {
        self.streamed_calls.fetch_add(1, Ordering::SeqCst);
        let result = self.next(prompt, options).await?;
        if !result.text.is_empty() && !result.timed_out {
            on_chunk(&result.text);
        }
        Ok(result)
    }
}

/// Channel that records everything sent through it.
#[derive(Default)]
pub(crate) struct RecordingChannel {
    pub sent: Mutex<Vec<(String, OutgoingResponse)>>,
    pub chunks: Mutex<Vec<(String, String)>>,
    pub typing: AtomicUsize,
    streaming: bool,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn streaming() -> Self {
        Self {
            streaming: true,
            ..Self::default()
        }
    }

    pub fn contents(&self) -> Vec<(String, String)> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|(dest, r)| (dest.clone(), r.content.clone()))
            .collect()
    }
}

#[async_trait]
impl Channel for RecordingChannel {
    fn name(&self) -> &str {
        "recording"
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        Ok(Box::pin(futures::stream::empty()))
    }

    async fn send(
        &self,
        destination: &str,
        response: OutgoingResponse,
    ) -> Result<(), ChannelError> {
        self.sent
            .lock()
            .unwrap()
            .push((destination.to_string(), response));
        Ok(())
    }

    fn supports_streaming(&self) -> bool {
        self.streaming
    }

    async fn send_chunk(&self, destination: &str, chunk: &str) -> Result<(), ChannelError> {
        self.chunks
            .lock()
            .unwrap()
            .push((destination.to_string(), chunk.to_string()));
        Ok(())
    }

    async fn send_typing(&self, _destination: &str) -> Result<(), ChannelError> {
        self.typing.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
