//! Recover an answer from the agent's own session transcript.
//!
//! The agent appends every turn to `<home>/projects/<encoded cwd>/<session>.jsonl`
//! as it goes, so when we have to kill it after a timeout the text it had
//! already produced is usually on disk.

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde_json::Value;
use tokio::fs;

/// Appended to recovered text so the reader knows where it came from.
pub const RECOVERY_MARKER: &str = "\n\n[Recovered from session log after timeout]";

/// File mtimes come from a coarser clock than `SystemTime::now`.
const MTIME_SLACK: Duration = Duration::from_secs(1);

/// Locates and reads agent transcripts under the agent's home directory.
#[derive(Debug, Clone)]
pub struct TimeoutRecovery {
    agent_home: PathBuf,
}

impl TimeoutRecovery {
    pub fn new(agent_home: impl Into<PathBuf>) -> Self {
        Self {
            agent_home: agent_home.into(),
        }
    }

    /// Directory holding transcripts for sessions started in `cwd`.
    pub fn project_dir(&self, cwd: &Path) -> PathBuf {
        self.agent_home.join("projects").join(encode_cwd(cwd))
    }

    /// Text of the last agent turn in the newest transcript for `cwd`
    /// modified at or after `since`, with [`RECOVERY_MARKER`] appended.
    pub async fn recover(&self, cwd: &Path, since: SystemTime) -> Option<String> {
        let dir = self.project_dir(cwd);
        let path = newest_transcript(&dir, since).await?;
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!(path = %path.display(), "Could not read transcript: {}", e);
                return None;
            }
        };

        let text = last_assistant_turn(&content)?;
        tracing::info!(
            path = %path.display(),
            chars = text.len(),
            "Recovered response from transcript"
        );
        Some(format!("{text}{RECOVERY_MARKER}"))
    }
}

/// The agent's directory naming: every non-alphanumeric char becomes `-`.
pub fn encode_cwd(cwd: &Path) -> String {
    cwd.to_string_lossy()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

async fn newest_transcript(dir: &Path, since: SystemTime) -> Option<PathBuf> {
    let mut entries = fs::read_dir(dir).await.ok()?;
    let mut newest: Option<(SystemTime, PathBuf)> = None;

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("jsonl") {
            continue;
        }
        let Ok(modified) = entry.metadata().await.and_then(|m| m.modified()) else {
            continue;
        };
        if modified + MTIME_SLACK < since {
            continue;
        }
        if newest.as_ref().is_none_or(|(t, _)| modified > *t) {
            newest = Some((modified, path));
        }
    }

    newest.map(|(_, path)| path)
}

/// Join the text blocks of the last assistant message in a transcript.
///
/// A single message is often written as several lines sharing one
/// `message.id`, one content block each; all of them are collected.
pub fn last_assistant_turn(transcript: &str) -> Option<String> {
    let mut current_id: Option<String> = None;
    let mut texts: Vec<String> = Vec::new();

    for line in transcript.lines() {
        let Ok(entry) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if entry.get("type").and_then(Value::as_str) != Some("assistant") {
            continue;
        }
        let Some(message) = entry.get("message") else {
            continue;
        };

        let id = message
            .get("id")
            .and_then(Value::as_str)
            .or_else(|| entry.get("uuid").and_then(Value::as_str))
            .map(str::to_string);
        if id != current_id {
            current_id = id;
            texts.clear();
        }

        let Some(blocks) = message.get("content").and_then(Value::as_array) else {
            continue;
        };
        texts.extend(
            blocks
                .iter()
                .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|b| b.get("text").and_then(Value::as_str))
                .map(str::to_string),
        );
    }

    let joined = texts.join("\n").trim().to_string();
    (!joined.is_empty()).then_some(joined)
}
