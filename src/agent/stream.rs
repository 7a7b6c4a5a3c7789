//! Streaming invocation over the agent's line-delimited JSON event stream.
//!
//! Recognized shapes, each optionally wrapped as
//! `{"type":"stream_event","event":{...}}`:
//! - `content_block_delta` with a `text_delta` or `input_json_delta`
//! - `content_block_start` opening a `tool_use` block, `content_block_stop`
//! - `message_start`, which separates the text of consecutive messages
//! - `assistant` messages embedding complete `tool_use` blocks
//! - the terminal `result` record
//!
//! Both tool-use shapes feed the same list; neither is deduplicated against
//! the other.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;

use super::batch::{DIAGNOSTIC_LIMIT, TerminalRecord, read_all};
use super::process::{KILL_GRACE, terminate};
use super::types::{InvocationResult, SessionHandle, ToolUseEntry, truncate_diagnostic};
use crate::error::AgentError;

/// One decoded line of the event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    MessageStart,
    TextDelta(String),
    ToolUseStart { index: u64, name: String },
    ToolInputDelta { index: u64, partial_json: String },
    BlockStop { index: u64 },
    AssistantToolUses(Vec<ToolUseEntry>),
    Result(TerminalRecord),
}

impl StreamEvent {
    /// Decode a line; `None` for blank lines, bad JSON and shapes we ignore.
    pub fn parse(line: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(line.trim()).ok()?;
        let event = if value.get("type").and_then(Value::as_str) == Some("stream_event") {
            value.get("event")?
        } else {
            &value
        };
        let index = || event.get("index").and_then(Value::as_u64).unwrap_or(0);

        match event.get("type").and_then(Value::as_str)? {
            "content_block_delta" => {
                let delta = event.get("delta")?;
                match delta.get("type").and_then(Value::as_str)? {
                    "text_delta" => Some(StreamEvent::TextDelta(
                        delta.get("text")?.as_str()?.to_string(),
                    )),
                    "input_json_delta" => Some(StreamEvent::ToolInputDelta {
                        index: index(),
                        partial_json: delta.get("partial_json")?.as_str()?.to_string(),
                    }),
                    _ => None,
                }
            }
            "content_block_start" => {
                let block = event.get("content_block")?;
                if block.get("type").and_then(Value::as_str) != Some("tool_use") {
                    return None;
                }
                Some(StreamEvent::ToolUseStart {
                    index: index(),
                    name: block.get("name")?.as_str()?.to_string(),
                })
            }
            "content_block_stop" => Some(StreamEvent::BlockStop { index: index() }),
            "message_start" => Some(StreamEvent::MessageStart),
            "assistant" => {
                let blocks = event.get("message")?.get("content")?.as_array()?;
                let uses: Vec<ToolUseEntry> = blocks
                    .iter()
                    .filter(|b| b.get("type").and_then(Value::as_str) == Some("tool_use"))
                    .filter_map(|b| {
                        Some(ToolUseEntry {
                            name: b.get("name")?.as_str()?.to_string(),
                            input: b.get("input").cloned().unwrap_or(Value::Null),
                        })
                    })
                    .collect();
                (!uses.is_empty()).then_some(StreamEvent::AssistantToolUses(uses))
            }
            "result" => TerminalRecord::from_value(event).map(StreamEvent::Result),
            _ => None,
        }
    }
}

#[derive(Debug)]
struct OpenToolUse {
    name: String,
    input: String,
}

/// Paragraph break between the text of two assistant messages.
const MESSAGE_SEPARATOR: &str = "\n\n";

/// Running aggregates of one stream.
#[derive(Debug, Default)]
pub struct StreamAccumulator {
    text: String,
    new_message: bool,
    tool_uses: Vec<ToolUseEntry>,
    open: BTreeMap<u64, OpenToolUse>,
    terminal: Option<TerminalRecord>,
}

impl StreamAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one event in. Text deltas are forwarded to `on_chunk` before
    /// returning.
    pub fn apply(
        &mut self,
        event: StreamEvent,
        on_chunk: &mut (dyn for<'c> FnMut(&'c str) + Send),
    ) {
        match event {
            StreamEvent::MessageStart => self.new_message = !self.text.is_empty(),
            StreamEvent::TextDelta(text) => {
                if text.is_empty() {
                    return;
                }
                if std::mem::take(&mut self.new_message) {
                    let chunk = format!("{MESSAGE_SEPARATOR}{text}");
                    on_chunk(&chunk);
                    self.text.push_str(&chunk);
                } else {
                    on_chunk(&text);
                    self.text.push_str(&text);
                }
            }
            StreamEvent::ToolUseStart { index, name } => {
                self.open.insert(
                    index,
                    OpenToolUse {
                        name,
                        input: String::new(),
                    },
                );
            }
            StreamEvent::ToolInputDelta {
                index,
                partial_json,
            } => {
                if let Some(open) = self.open.get_mut(&index) {
                    open.input.push_str(&partial_json);
                }
            }
            StreamEvent::BlockStop { index } => {
                if let Some(open) = self.open.remove(&index) {
                    self.tool_uses.push(close_tool_use(open));
                }
            }
            StreamEvent::AssistantToolUses(uses) => self.tool_uses.extend(uses),
            StreamEvent::Result(record) => self.terminal = Some(record),
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn tool_uses(&self) -> &[ToolUseEntry] {
        &self.tool_uses
    }

    /// Close any blocks still open and build the result.
    pub fn finish(mut self, duration: Duration) -> InvocationResult {
        let open = std::mem::take(&mut self.open);
        self.tool_uses
            .extend(open.into_values().map(close_tool_use));

        let mut result = InvocationResult {
            duration,
            tool_uses: self.tool_uses,
            ..Default::default()
        };
        match self.terminal {
            Some(record) => {
                result.text = if self.text.is_empty() {
                    record.result
                } else {
                    self.text
                };
                result.cost_usd = record.cost_usd;
                result.session = record.session_id.map(SessionHandle::new);
                result.is_error = record.is_error;
            }
            None => result.text = self.text,
        }
        result
    }
}

fn close_tool_use(open: OpenToolUse) -> ToolUseEntry {
    let input = if open.input.trim().is_empty() {
        Value::Object(Default::default())
    } else {
        serde_json::from_str(&open.input)
            .unwrap_or_else(|_| serde_json::json!({ "raw": open.input }))
    };
    ToolUseEntry {
        name: open.name,
        input,
    }
}

/// Notice appended to partial text when the deadline hits.
pub fn timeout_notice(timeout: Duration) -> String {
    format!("\n\n[Response timed out after {} seconds]", timeout.as_secs())
}

enum StreamEnd {
    Eof,
    TimedOut,
    Cancelled,
}

/// Drive `child`'s event stream to completion, timeout, or cancellation.
///
/// Timeout is not an error: the text streamed so far comes back with
/// [`timeout_notice`] appended and `timed_out` set. Cancellation kills the
/// process and returns what accumulated with `timed_out` unset.
pub async fn run(
    mut child: Child,
    timeout: Duration,
    cancel: Option<&CancellationToken>,
    on_chunk: &mut (dyn for<'c> FnMut(&'c str) + Send),
) -> Result<InvocationResult, AgentError> {
    let started = Instant::now();
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AgentError::MalformedResponse {
            reason: "agent stdout was not captured".to_string(),
        })?;
    let exited = CancellationToken::new();
    let err_task = tokio::spawn(read_all(child.stderr.take(), exited.clone()));

    let mut lines = BufReader::new(stdout).lines();
    let mut acc = StreamAccumulator::new();

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let cancelled = async {
        match cancel {
            Some(token) => token.cancelled().await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(cancelled);

    let end = loop {
        tokio::select! {
            biased;
            _ = &mut cancelled => break StreamEnd::Cancelled,
            _ = &mut deadline => break StreamEnd::TimedOut,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(event) = StreamEvent::parse(&line) {
                        acc.apply(event, on_chunk);
                    }
                }
                Ok(None) => break StreamEnd::Eof,
                Err(e) => {
                    tracing::warn!("Agent stream read failed: {}", e);
                    break StreamEnd::Eof;
                }
            },
        }
    };

    match end {
        StreamEnd::Cancelled => {
            tracing::info!("Streaming invocation cancelled, killing agent");
            if let Err(e) = child.kill().await {
                tracing::warn!("Failed to kill agent: {}", e);
            }
            err_task.abort();
            Ok(acc.finish(started.elapsed()))
        }
        StreamEnd::TimedOut => {
            tracing::warn!(?timeout, chars = acc.text().len(), "Streaming agent timed out");
            terminate(&mut child, KILL_GRACE).await;
            err_task.abort();
            let mut result = acc.finish(started.elapsed());
            result.text.push_str(&timeout_notice(timeout));
            result.timed_out = true;
            Ok(result)
        }
        StreamEnd::Eof => {
            let status = match tokio::time::timeout(KILL_GRACE, child.wait()).await {
                Ok(status) => Some(status?),
                Err(_) => {
                    tracing::warn!("Agent closed its output but did not exit");
                    terminate(&mut child, KILL_GRACE).await;
                    None
                }
            };
            exited.cancel();
            let stderr = err_task.await.unwrap_or_default();
            let saw_terminal = acc.terminal.is_some();
            let result = acc.finish(started.elapsed());

            if saw_terminal {
                return Ok(result);
            }
            if let Some(status) = status
                && !status.success()
            {
                return Err(AgentError::NonZeroExit {
                    code: status.code(),
                    diagnostic: truncate_diagnostic(&stderr, DIAGNOSTIC_LIMIT),
                });
            }
            if result.text.is_empty() && result.tool_uses.is_empty() {
                return Err(AgentError::MalformedResponse {
                    reason: "stream ended without a result record".to_string(),
                });
            }
            tracing::warn!("Stream ended without a result record, using accumulated text");
            Ok(result)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply_all(lines: &[&str]) -> (StreamAccumulator, Vec<String>) {
        let mut acc = StreamAccumulator::new();
        let mut chunks = Vec::new();
        let mut sink = |c: &str| chunks.push(c.to_string());
        for line in lines {
            if let Some(event) = StreamEvent::parse(line) {
                acc.apply(event, &mut sink);
            }
        }
        (acc, chunks)
    }

    #[test]
    fn parses_wrapped_and_bare_text_deltas() {
        let wrapped = r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}}"#;
        let bare = r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}"#;
        assert_eq!(
            StreamEvent::parse(wrapped),
            Some(StreamEvent::TextDelta("Hi".into()))
        );
        assert_eq!(StreamEvent::parse(wrapped), StreamEvent::parse(bare));
    }

    #[test]
    fn ignores_unknown_and_broken_lines() {
        assert_eq!(StreamEvent::parse(""), None);
        assert_eq!(StreamEvent::parse("{oops"), None);
        assert_eq!(StreamEvent::parse(r#"{"type":"system","subtype":"init"}"#), None);
        assert_eq!(
            StreamEvent::parse(
                r#"{"type":"content_block_start","index":0,"content_block":{"type":"text","text":""}}"#
            ),
            None
        );
    }

    #[test]
    fn text_chunks_forwarded_in_order() {
        let (acc, chunks) = apply_all(&[
            r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"Working"}}"#,
            r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":" on it"}}"#,
        ]);
        assert_eq!(chunks, vec!["Working", " on it"]);
        assert_eq!(acc.text(), "Working on it");
    }

    #[test]
    fn consecutive_messages_are_separated() {
        let (acc, chunks) = apply_all(&[
            r#"{"type":"stream_event","event":{"type":"message_start","message":{"id":"m1"}}}"#,
            r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"Let me check."}}"#,
            r#"{"type":"stream_event","event":{"type":"message_start","message":{"id":"m2"}}}"#,
            r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"Done."}}"#,
        ]);
        assert_eq!(acc.text(), "Let me check.\n\nDone.");
        assert_eq!(chunks, vec!["Let me check.", "\n\nDone."]);
    }

    #[test]
    fn message_without_text_adds_no_separator() {
        let (acc, _) = apply_all(&[
            r#"{"type":"message_start","message":{}}"#,
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","name":"Read"}}"#,
            r#"{"type":"content_block_stop","index":0}"#,
            r#"{"type":"message_start","message":{}}"#,
            r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"Read it."}}"#,
        ]);
        assert_eq!(acc.text(), "Read it.");
    }

    #[test]
    fn tool_fragments_become_one_parsed_entry() {
        let (acc, _) = apply_all(&[
            r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","name":"Write","input":{}}}"#,
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"path\":"}}"#,
            r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"\"a.md\"}"}}"#,
            r#"{"type":"content_block_stop","index":1}"#,
        ]);
        assert_eq!(
            acc.tool_uses(),
            &[ToolUseEntry {
                name: "Write".into(),
                input: serde_json::json!({"path": "a.md"})
            }]
        );
    }

    #[test]
    fn unparseable_fragments_fall_back_to_raw() {
        let (acc, _) = apply_all(&[
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","name":"Bash"}}"#,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{\"cmd\": \"ls"}}"#,
            r#"{"type":"content_block_stop","index":0}"#,
        ]);
        assert_eq!(acc.tool_uses()[0].input, serde_json::json!({"raw": "{\"cmd\": \"ls"}));
    }

    #[test]
    fn both_tool_shapes_are_kept() {
        let (acc, _) = apply_all(&[
            r#"{"type":"content_block_start","index":0,"content_block":{"type":"tool_use","name":"Read"}}"#,
            r#"{"type":"content_block_stop","index":0}"#,
            r#"{"type":"assistant","message":{"content":[{"type":"text","text":"x"},{"type":"tool_use","name":"Read","input":{"file":"a"}}]}}"#,
        ]);
        let names: Vec<_> = acc.tool_uses().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["Read", "Read"]);
        assert_eq!(acc.tool_uses()[0].input, serde_json::json!({}));
        assert_eq!(acc.tool_uses()[1].input, serde_json::json!({"file": "a"}));
    }

    #[test]
    fn finish_uses_terminal_record() {
        let (acc, _) = apply_all(&[
            r#"{"type":"content_block_delta","delta":{"type":"text_delta","text":"streamed"}}"#,
            r#"{"type":"result","result":"final","cost_usd":0.2,"total_cost_usd":0.3,"session_id":"s9","is_error":false}"#,
        ]);
        let result = acc.finish(Duration::from_secs(1));
        assert_eq!(result.text, "streamed");
        assert_eq!(result.cost_usd.unwrap().to_string(), "0.3");
        assert_eq!(result.session.unwrap().as_str(), "s9");
    }

    #[test]
    fn finish_falls_back_to_result_text_and_flushes_open_tools() {
        let (acc, _) = apply_all(&[
            r#"{"type":"content_block_start","index":2,"content_block":{"type":"tool_use","name":"Edit"}}"#,
            r#"{"type":"content_block_delta","index":2,"delta":{"type":"input_json_delta","partial_json":"{\"a\":1}"}}"#,
            r#"{"type":"result","result":"from record"}"#,
        ]);
        let result = acc.finish(Duration::ZERO);
        assert_eq!(result.text, "from record");
        assert_eq!(result.tool_uses.len(), 1);
        assert_eq!(result.tool_uses[0].input, serde_json::json!({"a": 1}));
    }

    #[test]
    fn notice_format() {
        assert_eq!(
            timeout_notice(Duration::from_secs(600)),
            "\n\n[Response timed out after 600 seconds]"
        );
    }
}
