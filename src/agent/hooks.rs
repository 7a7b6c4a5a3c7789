//! Agent lifecycle hooks.
//!
//! Two halves: the files handed to every spawn (`--mcp-config` tool
//! configuration and the `--settings` blob registering our hook commands),
//! generated once on first use; and the handlers the agent calls back into
//! via `agent-relay hook <event>` with a JSON payload on stdin.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use serde_json::{Value, json};
use tokio::sync::OnceCell;

use super::recovery::last_assistant_turn;
use super::types::truncate_diagnostic;
use crate::error::{AgentError, WorkspaceError};
use crate::persist;
use crate::workspace::Workspace;

/// Daily-log context handed to a new session is capped to its tail.
const SESSION_CONTEXT_LIMIT: usize = 8_000;
const EXCERPT_LIMIT: usize = 300;

/// Lifecycle points the agent reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum HookEvent {
    SessionStart,
    PreCompact,
    SessionEnd,
}

impl HookEvent {
    /// Event name in the agent's settings file.
    pub fn settings_key(self) -> &'static str {
        match self {
            HookEvent::SessionStart => "SessionStart",
            HookEvent::PreCompact => "PreCompact",
            HookEvent::SessionEnd => "SessionEnd",
        }
    }

    pub fn all() -> [HookEvent; 3] {
        [
            HookEvent::SessionStart,
            HookEvent::PreCompact,
            HookEvent::SessionEnd,
        ]
    }
}

impl fmt::Display for HookEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookEvent::SessionStart => write!(f, "session-start"),
            HookEvent::PreCompact => write!(f, "pre-compact"),
            HookEvent::SessionEnd => write!(f, "session-end"),
        }
    }
}

/// Payload the agent writes to the hook's stdin.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HookPayload {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub transcript_path: Option<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub hook_event_name: Option<String>,
    /// pre-compact: `manual` or `auto`.
    #[serde(default)]
    pub trigger: Option<String>,
    /// session-end: why the session ended.
    #[serde(default)]
    pub reason: Option<String>,
}

/// Paths of the generated per-spawn config files.
#[derive(Debug, Clone)]
pub struct GeneratedFiles {
    pub mcp_config: PathBuf,
    pub settings: PathBuf,
}

/// Lazily writes the tool configuration and hook settings files.
pub struct HookFiles {
    dir: PathBuf,
    hook_program: String,
    /// Extra tool servers merged into the generated config, if present.
    servers_file: Option<PathBuf>,
    files: OnceCell<GeneratedFiles>,
}

impl HookFiles {
    /// `hook_program` is the command the agent runs for callbacks, normally
    /// this binary's own path.
    pub fn new(dir: impl Into<PathBuf>, hook_program: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            hook_program: hook_program.into(),
            servers_file: None,
            files: OnceCell::new(),
        }
    }

    pub fn with_servers_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.servers_file = Some(path.into());
        self
    }

    /// Generate the files on first call; later calls return the same paths.
    pub async fn get(&self) -> Result<&GeneratedFiles, AgentError> {
        self.files
            .get_or_try_init(|| async {
                let servers = self.load_servers().await;
                let mcp_config = self.dir.join("mcp.json");
                persist::write_json_atomic(&mcp_config, &json!({ "mcpServers": servers }))
                    .await?;

                let settings = self.dir.join("settings.json");
                persist::write_json_atomic(&settings, &self.settings_value()).await?;

                tracing::debug!(dir = %self.dir.display(), "Generated agent config files");
                Ok(GeneratedFiles {
                    mcp_config,
                    settings,
                })
            })
            .await
    }

    /// Settings blob registering one command hook per lifecycle event.
    pub fn settings_value(&self) -> Value {
        let mut hooks = serde_json::Map::new();
        for event in HookEvent::all() {
            hooks.insert(
                event.settings_key().to_string(),
                json!([{
                    "hooks": [{
                        "type": "command",
                        "command": format!("{} hook {}", shell_quote(&self.hook_program), event),
                    }]
                }]),
            );
        }
        json!({ "hooks": hooks })
    }

    async fn load_servers(&self) -> Value {
        let Some(path) = &self.servers_file else {
            return json!({});
        };
        match persist::read_json::<Value>(path).await {
            Ok(Some(Value::Object(servers))) => Value::Object(servers),
            Ok(Some(_)) => {
                tracing::warn!(path = %path.display(), "Tool server file is not an object, ignoring");
                json!({})
            }
            Ok(None) => json!({}),
            Err(e) => {
                tracing::warn!(path = %path.display(), "Could not read tool server file: {}", e);
                json!({})
            }
        }
    }
}

fn shell_quote(s: &str) -> String {
    if s.chars()
        .all(|c| c.is_ascii_alphanumeric() || "/._-".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', r"'\''"))
    }
}

/// Handle one hook callback. Returns the JSON to print on stdout, if any.
pub async fn handle_hook(
    event: HookEvent,
    payload: &HookPayload,
    workspace: &Workspace,
) -> Result<Option<Value>, WorkspaceError> {
    let session = payload.session_id.as_deref().unwrap_or("unknown");
    tracing::info!(%event, session, "Hook invoked");

    match event {
        HookEvent::SessionStart => {
            let log = workspace.read_daily_log().await?;
            let log = log.trim();
            if log.is_empty() {
                return Ok(None);
            }
            Ok(Some(json!({
                "hookSpecificOutput": {
                    "hookEventName": event.settings_key(),
                    "additionalContext": format!("Today's log so far:\n\n{}", tail(log, SESSION_CONTEXT_LIMIT)),
                }
            })))
        }
        HookEvent::PreCompact => {
            let trigger = payload.trigger.as_deref().unwrap_or("auto");
            let mut entry = format!("Context compacted ({trigger}) in session {session}.");
            if let Some(excerpt) = last_reply_excerpt(payload).await {
                entry.push_str(&format!("\nLast reply: {excerpt}"));
            }
            workspace.append_daily_log(&entry).await?;
            Ok(None)
        }
        HookEvent::SessionEnd => {
            let reason = payload.reason.as_deref().unwrap_or("other");
            let mut entry = format!("Session {session} ended ({reason}).");
            if let Some(excerpt) = last_reply_excerpt(payload).await {
                entry.push_str(&format!("\nLast reply: {excerpt}"));
            }
            workspace.append_daily_log(&entry).await?;
            Ok(None)
        }
    }
}

async fn last_reply_excerpt(payload: &HookPayload) -> Option<String> {
    let path = Path::new(payload.transcript_path.as_deref()?);
    let transcript = tokio::fs::read_to_string(path).await.ok()?;
    let text = last_assistant_turn(&transcript)?;
    Some(truncate_diagnostic(&text.replace('\n', " "), EXCERPT_LIMIT))
}

fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) {
        start += 1;
    }
    &s[start..]
}
