//! Batch invocation: run the agent to exit, then parse its one terminal record.

use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;

use super::process::{KILL_GRACE, terminate};
use super::types::{InvocationResult, SessionHandle, truncate_diagnostic};
use crate::error::AgentError;

/// Diagnostic output carried in errors is cut to this many bytes.
pub const DIAGNOSTIC_LIMIT: usize = 500;

/// The agent's final `result` record.
#[derive(Debug, Clone, PartialEq)]
pub struct TerminalRecord {
    pub result: String,
    pub cost_usd: Option<Decimal>,
    pub session_id: Option<String>,
    pub is_error: bool,
}

impl TerminalRecord {
    /// Read a terminal record out of a parsed JSON value.
    ///
    /// `total_cost_usd` wins over the older `cost_usd` when both are present.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let tagged_result = obj.get("type").and_then(Value::as_str) == Some("result");
        if !tagged_result && !obj.contains_key("result") {
            return None;
        }

        let is_error = obj.get("is_error").and_then(Value::as_bool).unwrap_or(false);
        let result = match obj.get("result").and_then(Value::as_str) {
            Some(text) => text.to_string(),
            None if is_error => obj
                .get("error")
                .and_then(Value::as_str)
                .or_else(|| obj.get("subtype").and_then(Value::as_str))
                .unwrap_or_default()
                .to_string(),
            None => return None,
        };

        let cost_usd = obj
            .get("total_cost_usd")
            .and_then(parse_cost)
            .or_else(|| obj.get("cost_usd").and_then(parse_cost));

        Some(Self {
            result,
            cost_usd,
            session_id: obj
                .get("session_id")
                .and_then(Value::as_str)
                .map(str::to_string),
            is_error,
        })
    }

    pub fn into_result(self, duration: Duration) -> InvocationResult {
        InvocationResult {
            text: self.result,
            cost_usd: self.cost_usd,
            session: self.session_id.map(SessionHandle::new),
            duration,
            is_error: self.is_error,
            ..Default::default()
        }
    }
}

fn parse_cost(value: &Value) -> Option<Decimal> {
    let raw = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => return None,
    };
    Decimal::from_str(&raw)
        .or_else(|_| Decimal::from_scientific(&raw))
        .ok()
}

/// Find the terminal record in batch stdout: the whole output as one
/// document, else the last line that holds one.
pub fn parse_terminal_record(stdout: &str) -> Result<TerminalRecord, AgentError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(AgentError::MalformedResponse {
            reason: "agent produced no output".to_string(),
        });
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed)
        && let Some(record) = TerminalRecord::from_value(&value)
    {
        return Ok(record);
    }

    trimmed
        .lines()
        .rev()
        .filter_map(|line| serde_json::from_str::<Value>(line.trim()).ok())
        .find_map(|value| TerminalRecord::from_value(&value))
        .ok_or_else(|| AgentError::MalformedResponse {
            reason: format!(
                "no result record in agent output: {}",
                truncate_diagnostic(trimmed, DIAGNOSTIC_LIMIT)
            ),
        })
}

/// Read `reader` to EOF. Once `exited` fires the pipe gets [`KILL_GRACE`]
/// to drain; a grandchild holding it open past that is abandoned and what
/// was read so far is returned.
pub(crate) async fn read_all<R: AsyncRead + Unpin>(
    reader: Option<R>,
    exited: CancellationToken,
) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let drain_deadline = async {
        exited.cancelled().await;
        tokio::time::sleep(KILL_GRACE).await;
    };
    tokio::pin!(drain_deadline);

    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        tokio::select! {
            read = reader.read(&mut chunk) => match read {
                Ok(0) => break,
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(e) => {
                    tracing::debug!("Agent output read failed: {}", e);
                    break;
                }
            },
            _ = &mut drain_deadline => {
                tracing::warn!("Agent output still open after exit, abandoning it");
                break;
            }
        }
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Wait for `child` to exit within `timeout` and parse its output.
///
/// On timeout the child is terminated (SIGTERM, then SIGKILL after
/// [`KILL_GRACE`]) and [`AgentError::Timeout`] is returned.
pub async fn run(mut child: Child, timeout: Duration) -> Result<TerminalRecord, AgentError> {
    let exited = CancellationToken::new();
    let out_task = tokio::spawn(read_all(child.stdout.take(), exited.clone()));
    let err_task = tokio::spawn(read_all(child.stderr.take(), exited.clone()));

    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => {
            exited.cancel();
            status?
        }
        Err(_) => {
            tracing::warn!(?timeout, "Agent timed out, terminating");
            terminate(&mut child, KILL_GRACE).await;
            out_task.abort();
            err_task.abort();
            return Err(AgentError::Timeout { timeout });
        }
    };

    let stdout = out_task.await.unwrap_or_default();
    let stderr = err_task.await.unwrap_or_default();

    match parse_terminal_record(&stdout) {
        Ok(record) => Ok(record),
        Err(_) if !status.success() => {
            let diagnostic = if stderr.trim().is_empty() {
                &stdout
            } else {
                &stderr
            };
            Err(AgentError::NonZeroExit {
                code: status.code(),
                diagnostic: truncate_diagnostic(diagnostic, DIAGNOSTIC_LIMIT),
            })
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::agent::process::spawn_agent;
    use rust_decimal_macros::dec;

    fn sh(script: &str) -> Child {
        spawn_agent("/bin/sh", &["-c".to_string(), script.to_string()], Path::new("/")).unwrap()
    }

    #[tokio::test]
    async fn inherited_output_pipe_does_not_hold_the_result() {
        let record = r#"{"type":"result","result":"done","is_error":false}"#;
        let child = sh(&format!("echo '{record}'\nsleep 30 &\nexit 0"));

        let started = std::time::Instant::now();
        let record = run(child, Duration::from_secs(20)).await.unwrap();
        assert_eq!(record.result, "done");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn prefers_total_cost() {
        let value = serde_json::json!({
            "type": "result",
            "result": "hi",
            "cost_usd": 0.5,
            "total_cost_usd": 0.0125,
            "session_id": "s1",
            "is_error": false
        });
        let record = TerminalRecord::from_value(&value).unwrap();
        assert_eq!(record.cost_usd, Some(dec!(0.0125)));
        assert_eq!(record.session_id.as_deref(), Some("s1"));
        assert!(!record.is_error);
    }

    #[test]
    fn falls_back_to_legacy_cost() {
        let value = serde_json::json!({"result": "hi", "cost_usd": 0.25});
        let record = TerminalRecord::from_value(&value).unwrap();
        assert_eq!(record.cost_usd, Some(dec!(0.25)));
    }

    #[test]
    fn error_record_without_result_text() {
        let value = serde_json::json!({"type": "result", "subtype": "error_max_turns", "is_error": true});
        let record = TerminalRecord::from_value(&value).unwrap();
        assert!(record.is_error);
        assert_eq!(record.result, "error_max_turns");
    }

    #[test]
    fn non_result_objects_are_ignored() {
        assert!(TerminalRecord::from_value(&serde_json::json!({"type": "system"})).is_none());
        assert!(TerminalRecord::from_value(&serde_json::json!(["result"])).is_none());
    }

    #[test]
    fn parse_finds_record_after_log_lines() {
        let stdout = "warming up\n{\"type\":\"system\"}\n{\"type\":\"result\",\"result\":\"done\"}\n";
        assert_eq!(parse_terminal_record(stdout).unwrap().result, "done");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(
            parse_terminal_record("segfault"),
            Err(AgentError::MalformedResponse { .. })
        ));
        assert!(matches!(
            parse_terminal_record("  "),
            Err(AgentError::MalformedResponse { .. })
        ));
    }

    #[tokio::test]
    async fn run_parses_clean_exit() {
        let child = sh(r#"echo '{"result":"hello","session_id":"abc","total_cost_usd":0.01}'"#);
        let record = run(child, Duration::from_secs(5)).await.unwrap();
        assert_eq!(record.result, "hello");
        let result = record.into_result(Duration::from_millis(3));
        assert_eq!(result.session.unwrap().as_str(), "abc");
    }

    #[tokio::test]
    async fn run_reports_nonzero_exit_with_truncated_stderr() {
        let child = sh("i=0; while [ $i -lt 200 ]; do printf 'oops '; i=$((i+1)); done >&2; exit 3");
        let err = run(child, Duration::from_secs(5)).await.unwrap_err();
        match err {
            AgentError::NonZeroExit { code, diagnostic } => {
                assert_eq!(code, Some(3));
                assert!(diagnostic.len() <= DIAGNOSTIC_LIMIT + 3);
                assert!(diagnostic.starts_with("oops"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn run_malformed_on_clean_exit_without_record() {
        let child = sh("echo not json");
        assert!(matches!(
            run(child, Duration::from_secs(5)).await,
            Err(AgentError::MalformedResponse { .. })
        ));
    }

    #[tokio::test]
    async fn run_times_out() {
        let child = sh("sleep 30");
        let started = std::time::Instant::now();
        let err = run(child, Duration::from_millis(200)).await.unwrap_err();
        assert!(matches!(err, AgentError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
