//! Heartbeat: a periodic self-review of the workspace note list.
//!
//! Every interval the agent is shown `HEARTBEAT.md` and asked whether anything
//! needs the user's attention. It answers `HEARTBEAT_OK` when nothing does;
//! that answer is swallowed, anything else is delivered.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentBackend, InvokeOptions};
use crate::channels::{Channel, OutgoingResponse, RecipientDirectory};
use crate::config::HeartbeatSettings;
use crate::workspace::{HeartbeatNote, Workspace};

/// The "nothing to report" reply.
pub const HEARTBEAT_OK: &str = "HEARTBEAT_OK";

/// What a single tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// A previous tick was still running.
    Busy,
    /// Settings say the heartbeat is off; the loop stops.
    Disabled,
    /// No destination could be resolved.
    NoRecipient,
    /// Agent replied with the sentinel or nothing at all.
    Suppressed,
    Delivered { destination: String },
    Failed(String),
}

pub struct HeartbeatLoop {
    workspace: Arc<Workspace>,
    agent: Arc<dyn AgentBackend>,
    channel: Arc<dyn Channel>,
    recipients: Arc<RecipientDirectory>,
    settings_path: PathBuf,
    interval: Duration,
    timeout: Duration,
    busy: AtomicBool,
}

/// Clears the busy flag when a tick ends, however it ends.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl HeartbeatLoop {
    pub fn new(
        workspace: Arc<Workspace>,
        agent: Arc<dyn AgentBackend>,
        channel: Arc<dyn Channel>,
        recipients: Arc<RecipientDirectory>,
        settings_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            workspace,
            agent,
            channel,
            recipients,
            settings_path: settings_path.into(),
            interval: Duration::from_secs(1800),
            timeout: Duration::from_secs(600),
            busy: AtomicBool::new(false),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn tick(&self) -> TickOutcome {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Heartbeat still running, skipping tick");
            return TickOutcome::Busy;
        }
        let _busy = BusyGuard(&self.busy);

        let settings = match HeartbeatSettings::load(&self.settings_path).await {
            Ok(settings) => settings,
            Err(e) => {
                tracing::warn!("Heartbeat settings unreadable, skipping tick: {}", e);
                return TickOutcome::Failed(e.to_string());
            }
        };
        if !settings.enabled {
            return TickOutcome::Disabled;
        }

        let Some(destination) = self.recipients.resolve(settings.destination.as_deref()).await
        else {
            tracing::debug!("Heartbeat has no recipient, skipping");
            return TickOutcome::NoRecipient;
        };

        let notes = match self.workspace.heartbeat_notes().await {
            Ok(notes) => notes,
            Err(e) => {
                tracing::warn!("Failed to read heartbeat notes: {}", e);
                Vec::new()
            }
        };

        let options = InvokeOptions::new(self.timeout);
        let reply = match self.agent.invoke(&heartbeat_prompt(&notes), options).await {
            Ok(result) if result.is_error => {
                tracing::warn!("Heartbeat agent reported an error: {}", result.text);
                return TickOutcome::Failed(result.text);
            }
            Ok(result) => result.text,
            Err(e) => {
                tracing::warn!("Heartbeat invocation failed: {}", e);
                return TickOutcome::Failed(e.to_string());
            }
        };

        if is_suppressed(&reply) {
            tracing::debug!("Heartbeat: nothing to report");
            return TickOutcome::Suppressed;
        }

        let response = OutgoingResponse::text(reply.trim())
            .with_metadata(serde_json::json!({ "source": "heartbeat" }));
        match self.channel.send(&destination, response).await {
            Ok(()) => {
                tracing::info!(destination = %destination, "Heartbeat delivered");
                TickOutcome::Delivered { destination }
            }
            Err(e) => {
                tracing::error!(destination = %destination, "Failed to deliver heartbeat: {}", e);
                TickOutcome::Failed(e.to_string())
            }
        }
    }
}

/// Spawn the heartbeat loop. It stops on `cancel` or when a tick finds the
/// heartbeat disabled.
pub fn spawn_heartbeat(heartbeat: Arc<HeartbeatLoop>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat.interval);
        // A tick that lands during a running heartbeat is dropped, not replayed
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if heartbeat.tick().await == TickOutcome::Disabled {
                        tracing::info!("Heartbeat disabled, stopping loop");
                        break;
                    }
                }
            }
        }
    })
}

fn is_suppressed(reply: &str) -> bool {
    let reply = reply.trim();
    reply.is_empty() || reply == HEARTBEAT_OK
}

fn heartbeat_prompt(notes: &[HeartbeatNote]) -> String {
    let mut prompt = String::from(
        "[Heartbeat]\n\
         This is a periodic check-in; the user did not send a message. Review the \
         notes below and anything else you are tracking. If something needs the \
         user's attention now, write the message to send them. Otherwise reply \
         with exactly ",
    );
    prompt.push_str(HEARTBEAT_OK);
    prompt.push_str(" and nothing else.\n\nNotes:\n");

    if notes.is_empty() {
        prompt.push_str("(none)\n");
    }
    for note in notes {
        let mark = if note.done { "x" } else { " " };
        prompt.push_str(&format!("- [{}] {}\n", mark, note.text));
    }
    prompt
}
