//! Scheduled jobs: schedules, natural-language parsing, persistence and the
//! scheduler loop.

pub mod job;
pub mod parser;
pub mod schedule;
pub mod scheduler;
pub mod store;

pub use job::{CronJob, ExecutionResult, JobStatus, JobUpdate};
pub use parser::{ParsedSchedule, ScheduleParser};
pub use schedule::{CronSchedule, next_run_at};
pub use scheduler::{JobScheduler, RecoveryReport, SchedulerConfig, spawn_scheduler};
pub use store::JobStore;

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
