//! Scheduled job records.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::schedule::{CronSchedule, next_run_at};
use crate::error::ScheduleError;

/// Outcome of the most recent execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Ok,
    Failed,
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Ok => write!(f, "ok"),
            JobStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(JobStatus::Ok),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// A persisted scheduled job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronJob {
    pub id: String,
    pub name: String,
    pub schedule: CronSchedule,
    /// Prompt handed to the agent when the job fires.
    pub instruction: String,
    /// Chat the result is delivered to.
    pub destination: String,
    pub created_at: DateTime<Utc>,
    /// `None` means no future run (disarmed).
    pub next_run_at_ms: Option<i64>,
    #[serde(default)]
    pub last_run_at_ms: Option<i64>,
    #[serde(default)]
    pub last_status: Option<JobStatus>,
    #[serde(default)]
    pub last_error: Option<String>,
    #[serde(default)]
    pub last_duration_ms: Option<u64>,
    pub enabled: bool,
    /// Human-readable form of the schedule, shown back to the user.
    #[serde(default)]
    pub schedule_text: String,
}

impl CronJob {
    /// Create an enabled job armed for its first run after `now_ms`.
    pub fn new(
        name: impl Into<String>,
        schedule: CronSchedule,
        instruction: impl Into<String>,
        destination: impl Into<String>,
        schedule_text: impl Into<String>,
        now_ms: i64,
    ) -> Result<Self, ScheduleError> {
        schedule.validate()?;
        let next_run_at_ms = next_run_at(&schedule, now_ms);
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            schedule,
            instruction: instruction.into(),
            destination: destination.into(),
            created_at: Utc::now(),
            next_run_at_ms,
            last_run_at_ms: None,
            last_status: None,
            last_error: None,
            last_duration_ms: None,
            enabled: true,
            schedule_text: schedule_text.into(),
        })
    }

    /// Enabled and armed for a time at or before `now_ms`.
    pub fn is_due(&self, now_ms: i64) -> bool {
        self.enabled && self.next_run_at_ms.is_some_and(|next| next <= now_ms)
    }

    /// Arm for the next slot strictly after `after_ms`.
    pub fn rearm_after(&mut self, after_ms: i64) {
        self.next_run_at_ms = next_run_at(&self.schedule, after_ms.saturating_add(1));
    }

    /// Disarm and disable.
    pub fn retire(&mut self) {
        self.next_run_at_ms = None;
        self.enabled = false;
    }

    /// Record an execution and move to the next state.
    ///
    /// One-shot jobs retire regardless of outcome. Recurring jobs rearm past
    /// both `now_ms` and the slot that just ran, so a run finishing exactly on
    /// a boundary never fires the same slot twice.
    pub fn apply_run(&mut self, result: &ExecutionResult, now_ms: i64) {
        self.last_run_at_ms = Some(now_ms);
        self.last_duration_ms = Some(result.duration.as_millis() as u64);
        if result.success {
            self.last_status = Some(JobStatus::Ok);
            self.last_error = None;
        } else {
            self.last_status = Some(JobStatus::Failed);
            self.last_error = Some(result.text.clone());
        }

        if self.schedule.is_one_shot() {
            self.retire();
        } else {
            let ran_slot = self.next_run_at_ms.unwrap_or(now_ms);
            self.rearm_after(now_ms.max(ran_slot));
        }
    }

    /// The prompt sent to the agent for this job.
    pub fn prompt(&self) -> String {
        format!(
            "[Scheduled job: {}]\n\
             This task was scheduled earlier and is running unattended; nobody is \
             waiting in the chat. Do the work and reply with what should be \
             delivered to the user.\n\n{}",
            self.name, self.instruction
        )
    }
}

/// Result of one job execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub success: bool,
    /// Agent output on success, error description on failure.
    pub text: String,
    pub duration: Duration,
}

impl ExecutionResult {
    pub fn ok(text: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: true,
            text: text.into(),
            duration,
        }
    }

    pub fn failed(error: impl Into<String>, duration: Duration) -> Self {
        Self {
            success: false,
            text: error.into(),
            duration,
        }
    }
}

/// Fields an explicit update may change. `None` leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub name: Option<String>,
    pub schedule: Option<CronSchedule>,
    pub schedule_text: Option<String>,
    pub instruction: Option<String>,
    pub enabled: Option<bool>,
}

impl JobUpdate {
    /// Apply to `job`, re-arming when the schedule or enabled flag changes.
    pub fn apply(self, job: &mut CronJob, now_ms: i64) -> Result<(), ScheduleError> {
        if let Some(schedule) = &self.schedule {
            schedule.validate()?;
        }

        let mut rearm = false;
        if let Some(name) = self.name {
            job.name = name;
        }
        if let Some(instruction) = self.instruction {
            job.instruction = instruction;
        }
        if let Some(text) = self.schedule_text {
            job.schedule_text = text;
        }
        if let Some(schedule) = self.schedule {
            job.schedule = schedule;
            rearm = true;
        }
        if let Some(enabled) = self.enabled {
            rearm |= enabled && !job.enabled;
            job.enabled = enabled;
        }

        if rearm {
            job.next_run_at_ms = next_run_at(&job.schedule, now_ms);
        }
        Ok(())
    }
}
