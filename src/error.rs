//! Error types for agent-relay.

use std::time::Duration;

/// Top-level error type for the daemon.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Agent error: {0}")]
    Agent(#[from] AgentError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Job error: {0}")]
    Job(#[from] JobError),

    #[error("Schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    #[error("Channel error: {0}")]
    Channel(#[from] ChannelError),

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of a single external agent invocation.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Failed to spawn agent process {program}: {reason}")]
    Spawn { program: String, reason: String },

    #[error("Agent timed out after {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Agent exited with code {code:?}: {diagnostic}")]
    NonZeroExit {
        code: Option<i32>,
        diagnostic: String,
    },

    #[error("Malformed agent response: {reason}")]
    MalformedResponse { reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl AgentError {
    /// Short category label used in user-facing failure notices.
    pub fn category(&self) -> &'static str {
        match self {
            AgentError::Spawn { .. } => "could not start",
            AgentError::Timeout { .. } => "timed out",
            AgentError::NonZeroExit { .. } => "failed",
            AgentError::MalformedResponse { .. } => "returned an unreadable response",
            AgentError::Io(_) => "hit an I/O error",
        }
    }
}

/// Inbox queue errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Message {id} not found")]
    NotFound { id: String },

    #[error("Persist failed for {path}: {reason}")]
    Persist { path: String, reason: String },
}

/// Scheduled job errors.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("Job {id} not found")]
    NotFound { id: String },

    #[error("Job store error at {path}: {reason}")]
    Store { path: String, reason: String },

    #[error("Invalid schedule for job {id}: {source}")]
    InvalidSchedule {
        id: String,
        #[source]
        source: ScheduleError,
    },
}

/// Schedule parsing and evaluation errors.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCron { expr: String, reason: String },

    #[error("Unknown timezone: {0}")]
    UnknownTimezone(String),

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),

    #[error("Could not understand schedule: {0}")]
    Unrecognized(String),

    #[error("Time is in the past: {0}")]
    InPast(String),
}

/// Channel-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to send response on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Unknown destination on channel {name}: {destination}")]
    UnknownDestination { name: String, destination: String },
}

/// Workspace errors.
#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("File not found: {0}")]
    FileNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
