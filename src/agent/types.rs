//! Invocation types shared by the batch and streaming paths.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::AgentError;

/// Opaque agent conversation id, returned by one invocation and passed back
/// through [`InvokeOptions::resume`] to continue that conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionHandle(String);

impl SessionHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-invocation options.
#[derive(Debug, Clone)]
pub struct InvokeOptions {
    pub timeout: Duration,
    /// Overrides the configured model.
    pub model: Option<String>,
    /// Appended to the composed system prompt.
    pub extra_instructions: Option<String>,
    pub resume: Option<SessionHandle>,
    /// Streaming only: cancel kills the process and returns what accumulated.
    pub cancel: Option<CancellationToken>,
}

impl InvokeOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            model: None,
            extra_instructions: None,
            resume: None,
            cancel: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.extra_instructions = Some(instructions.into());
        self
    }

    pub fn with_resume(mut self, session: SessionHandle) -> Self {
        self.resume = Some(session);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// A tool call the agent made while generating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolUseEntry {
    pub name: String,
    pub input: serde_json::Value,
}

/// Outcome of one agent invocation.
#[derive(Debug, Clone, Default)]
pub struct InvocationResult {
    pub text: String,
    pub cost_usd: Option<Decimal>,
    pub session: Option<SessionHandle>,
    pub duration: Duration,
    /// The agent itself reported an error in its terminal record.
    pub is_error: bool,
    /// Text came from the transcript after a forced kill.
    pub recovered: bool,
    pub timed_out: bool,
    /// Streaming only.
    pub tool_uses: Vec<ToolUseEntry>,
}

impl InvocationResult {
    /// Tools ran but the agent produced nothing to show for it.
    pub fn is_silent_tool_use(&self) -> bool {
        self.text.trim().is_empty() && !self.tool_uses.is_empty()
    }
}

/// Something that can run the agent. Implemented by the process-backed
/// invoker; tests substitute stubs.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Run to completion and return the terminal result.
    async fn invoke(
        &self,
        prompt: &str,
        options: InvokeOptions,
    ) -> Result<InvocationResult, AgentError>;

    /// Run with incremental output; every text delta goes to `on_chunk` as
    /// it arrives.
    async fn invoke_streaming(
        &self,
        prompt: &str,
        options: InvokeOptions,
        on_chunk: &mut (dyn for<'c> FnMut(&'c str) + Send),
    ) -> Result<InvocationResult, AgentError>;
}

/// Cut `s` to at most `max` bytes on a char boundary.
pub fn truncate_diagnostic(s: &str, max: usize) -> String {
    let s = s.trim();
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundary() {
        let s = "ééééé";
        let out = truncate_diagnostic(s, 3);
        assert_eq!(out, "é...");
        assert_eq!(truncate_diagnostic("  short \n", 500), "short");
    }

    #[test]
    fn silent_tool_use_detection() {
        let mut result = InvocationResult {
            text: "  \n".into(),
            ..Default::default()
        };
        assert!(!result.is_silent_tool_use());
        result.tool_uses.push(ToolUseEntry {
            name: "Write".into(),
            input: serde_json::json!({"path": "notes.md"}),
        });
        assert!(result.is_silent_tool_use());
        result.text = "Saved.".into();
        assert!(!result.is_silent_tool_use());
    }

    #[test]
    fn session_handle_is_transparent() {
        let handle = SessionHandle::new("abc-123");
        assert_eq!(serde_json::to_value(&handle).unwrap(), "abc-123");
        assert_eq!(handle.to_string(), "abc-123");
    }
}
