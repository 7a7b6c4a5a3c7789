//! File-backed workspace the agent runs in.
//!
//! The workspace is a directory on disk containing:
//! - Identity files: AGENTS.md, SOUL.md, USER.md, IDENTITY.md
//! - HEARTBEAT.md: the note list the heartbeat reviews
//! - Daily logs: memory/YYYY-MM-DD.md, written by the lifecycle hooks
//!
//! It is also the agent's working directory, which is what ties a spawn to
//! its transcript directory.

use std::path::{Path, PathBuf};

use chrono::{NaiveDate, Utc};
use tokio::fs;

use crate::error::WorkspaceError;

/// Well-known workspace file paths.
pub mod paths {
    pub const AGENTS: &str = "AGENTS.md";
    pub const SOUL: &str = "SOUL.md";
    pub const USER: &str = "USER.md";
    pub const IDENTITY: &str = "IDENTITY.md";
    pub const HEARTBEAT: &str = "HEARTBEAT.md";
    pub const DAILY_DIR: &str = "memory";
}

/// Identity files loaded into the system prompt.
const IDENTITY_FILES: &[&str] = &[
    paths::AGENTS,
    paths::SOUL,
    paths::USER,
    paths::IDENTITY,
];

/// One item of the heartbeat note list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatNote {
    pub text: String,
    pub done: bool,
}

/// File-backed workspace.
pub struct Workspace {
    base_path: PathBuf,
}

impl Workspace {
    /// Create a new workspace rooted at `base_path`.
    pub fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    pub fn root(&self) -> &Path {
        &self.base_path
    }

    /// Resolve a relative workspace path to an absolute path.
    pub fn resolve_path(&self, relative: &str) -> PathBuf {
        self.base_path.join(relative)
    }

    /// Ensure the workspace directory structure exists.
    pub async fn ensure_dirs(&self) -> Result<(), WorkspaceError> {
        fs::create_dir_all(&self.base_path).await?;
        fs::create_dir_all(self.base_path.join(paths::DAILY_DIR)).await?;
        Ok(())
    }

    /// Read a file from the workspace.
    pub async fn read(&self, path: &str) -> Result<String, WorkspaceError> {
        match fs::read_to_string(self.resolve_path(path)).await {
            Ok(content) => Ok(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(WorkspaceError::FileNotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write (overwrite) a file in the workspace.
    pub async fn write(&self, path: &str, content: &str) -> Result<(), WorkspaceError> {
        let full_path = self.resolve_path(path);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&full_path, content).await?;
        Ok(())
    }

    /// Append content to a file in the workspace (creates if missing).
    pub async fn append(&self, path: &str, content: &str) -> Result<(), WorkspaceError> {
        let existing = match self.read(path).await {
            Ok(existing) => existing,
            Err(WorkspaceError::FileNotFound(_)) => String::new(),
            Err(e) => return Err(e),
        };
        let new_content = if existing.is_empty() {
            content.to_string()
        } else {
            format!("{}\n{}", existing.trim_end(), content)
        };
        self.write(path, &new_content).await
    }

    /// Relative path of the daily log for `date`.
    pub fn daily_log_path(date: NaiveDate) -> String {
        format!("{}/{}.md", paths::DAILY_DIR, date.format("%Y-%m-%d"))
    }

    /// Append a timestamped entry to today's daily log.
    pub async fn append_daily_log(&self, content: &str) -> Result<(), WorkspaceError> {
        let now = Utc::now();
        let path = Self::daily_log_path(now.date_naive());
        let entry = format!("\n## {}\n\n{}", now.format("%H:%M UTC"), content);
        self.append(&path, &entry).await
    }

    /// Today's daily log, empty if nothing was logged yet.
    pub async fn read_daily_log(&self) -> Result<String, WorkspaceError> {
        match self.read(&Self::daily_log_path(Utc::now().date_naive())).await {
            Ok(content) => Ok(content),
            Err(WorkspaceError::FileNotFound(_)) => Ok(String::new()),
            Err(e) => Err(e),
        }
    }

    /// Raw HEARTBEAT.md, empty if missing.
    pub async fn heartbeat_file(&self) -> Result<String, WorkspaceError> {
        match self.read(paths::HEARTBEAT).await {
            Ok(content) => Ok(content),
            Err(WorkspaceError::FileNotFound(_)) => Ok(String::new()),
            Err(e) => Err(e),
        }
    }

    /// Checklist items of HEARTBEAT.md (`- [ ] ...` / `- [x] ...`).
    pub async fn heartbeat_notes(&self) -> Result<Vec<HeartbeatNote>, WorkspaceError> {
        Ok(parse_notes(&self.heartbeat_file().await?))
    }

    /// Load and concatenate identity files for the system prompt.
    pub async fn system_prompt(&self) -> Result<String, WorkspaceError> {
        let mut parts = Vec::new();
        for &file in IDENTITY_FILES {
            if let Ok(content) = self.read(file).await
                && !content.trim().is_empty()
            {
                parts.push(format!("# {}\n\n{}", file, content));
            }
        }
        Ok(parts.join("\n\n---\n\n"))
    }
}

fn parse_notes(content: &str) -> Vec<HeartbeatNote> {
    content
        .lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let rest = line
                .strip_prefix("- ")
                .or_else(|| line.strip_prefix("* "))?;
            let (done, text) = if let Some(text) = rest.strip_prefix("[ ]") {
                (false, text)
            } else if let Some(text) = rest
                .strip_prefix("[x]")
                .or_else(|| rest.strip_prefix("[X]"))
            {
                (true, text)
            } else {
                return None;
            };
            Some(HeartbeatNote {
                text: text.trim().to_string(),
                done,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn test_workspace() -> (Workspace, TempDir) {
        let dir = TempDir::new().unwrap();
        let ws = Workspace::new(dir.path().to_path_buf());
        ws.ensure_dirs().await.unwrap();
        (ws, dir)
    }

    #[tokio::test]
    async fn read_write_roundtrip() {
        let (ws, _dir) = test_workspace().await;
        ws.write("test.md", "hello world").await.unwrap();
        assert_eq!(ws.read("test.md").await.unwrap(), "hello world");
    }

    #[tokio::test]
    async fn read_nonexistent_is_not_found() {
        let (ws, _dir) = test_workspace().await;
        assert!(matches!(
            ws.read("nope.md").await,
            Err(WorkspaceError::FileNotFound(_))
        ));
    }

    #[tokio::test]
    async fn append_creates_and_appends() {
        let (ws, _dir) = test_workspace().await;
        ws.append("log.md", "first").await.unwrap();
        ws.append("log.md", "second").await.unwrap();
        assert_eq!(ws.read("log.md").await.unwrap(), "first\nsecond");
    }

    #[tokio::test]
    async fn system_prompt_loads_identity_files() {
        let (ws, _dir) = test_workspace().await;
        ws.write(paths::SOUL, "I am a test agent").await.unwrap();
        ws.write(paths::USER, "User: TestUser").await.unwrap();

        let prompt = ws.system_prompt().await.unwrap();
        assert!(prompt.contains("# SOUL.md\n\nI am a test agent"));
        assert!(prompt.contains("User: TestUser"));
    }

    #[tokio::test]
    async fn system_prompt_empty_when_no_files() {
        let (ws, _dir) = test_workspace().await;
        assert!(ws.system_prompt().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn daily_log_roundtrip() {
        let (ws, _dir) = test_workspace().await;
        assert!(ws.read_daily_log().await.unwrap().is_empty());
        ws.append_daily_log("Did a thing").await.unwrap();
        let content = ws.read_daily_log().await.unwrap();
        assert!(content.contains("Did a thing"));
        assert!(content.contains(" UTC"));
    }

    #[tokio::test]
    async fn heartbeat_notes_parse_checklist() {
        let (ws, _dir) = test_workspace().await;
        ws.write(
            paths::HEARTBEAT,
            "# Heartbeat\n\n- [x] water plants\n- [ ] call mom\n  * [X] nested done\nplain line\n- bullet without box\n",
        )
        .await
        .unwrap();

        let notes = ws.heartbeat_notes().await.unwrap();
        assert_eq!(
            notes,
            vec![
                HeartbeatNote {
                    text: "water plants".into(),
                    done: true
                },
                HeartbeatNote {
                    text: "call mom".into(),
                    done: false
                },
                HeartbeatNote {
                    text: "nested done".into(),
                    done: true
                },
            ]
        );
    }

    #[tokio::test]
    async fn missing_heartbeat_file_has_no_notes() {
        let (ws, _dir) = test_workspace().await;
        assert!(ws.heartbeat_notes().await.unwrap().is_empty());
    }
}
