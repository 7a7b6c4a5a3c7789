//! Job scheduler.
//!
//! Runs on a fixed tick. Each tick scans the store for due jobs, enqueues the
//! ones not already waiting or running, and, if no job is executing, drains
//! the queue one job at a time. A failed run is retried once after a delay;
//! the final outcome is recorded on the job and delivered to its
//! destination. Nothing here ever fails the process.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::job::{CronJob, ExecutionResult};
use super::store::JobStore;
use super::now_ms;
use crate::agent::types::truncate_diagnostic;
use crate::agent::{AgentBackend, InvokeOptions};
use crate::channels::{Channel, OutgoingResponse};

/// Failure notices are cut to this many bytes.
const NOTICE_LIMIT: usize = 500;

/// Scheduler timing.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick: Duration,
    pub retry_delay: Duration,
    /// Jobs overdue by at most this much at startup still run once.
    pub recovery_window: Duration,
    pub agent_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(30),
            retry_delay: Duration::from_secs(60),
            recovery_window: Duration::from_secs(2 * 3600),
            agent_timeout: Duration::from_secs(600),
        }
    }
}

/// What startup recovery did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub enqueued: usize,
    pub rearmed: usize,
    pub expired: usize,
}

pub struct JobScheduler {
    store: Arc<JobStore>,
    agent: Arc<dyn AgentBackend>,
    channel: Arc<dyn Channel>,
    config: SchedulerConfig,
    pending: Mutex<VecDeque<String>>,
    executing: Mutex<Option<String>>,
    /// Held while draining; `try_lock` failing means a drain is in progress.
    drain: tokio::sync::Mutex<()>,
}

impl JobScheduler {
    pub fn new(
        store: Arc<JobStore>,
        agent: Arc<dyn AgentBackend>,
        channel: Arc<dyn Channel>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            store,
            agent,
            channel,
            config,
            pending: Mutex::new(VecDeque::new()),
            executing: Mutex::new(None),
            drain: tokio::sync::Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    /// Number of jobs waiting to execute.
    pub fn pending(&self) -> usize {
        self.pending.lock().map(|p| p.len()).unwrap_or(0)
    }

    /// Queue `id` unless it is already waiting or running.
    fn enqueue(&self, id: &str) -> bool {
        let executing = self.executing.lock().ok().and_then(|e| e.clone());
        if executing.as_deref() == Some(id) {
            return false;
        }
        let Ok(mut pending) = self.pending.lock() else {
            return false;
        };
        if pending.iter().any(|p| p == id) {
            return false;
        }
        pending.push_back(id.to_string());
        true
    }

    fn dequeue(&self) -> Option<String> {
        let next = self.pending.lock().ok()?.pop_front()?;
        if let Ok(mut executing) = self.executing.lock() {
            *executing = Some(next.clone());
        }
        Some(next)
    }

    fn clear_executing(&self) {
        if let Ok(mut executing) = self.executing.lock() {
            *executing = None;
        }
    }

    /// Enqueue every due job. Returns how many were newly queued.
    pub async fn enqueue_due(&self, now_ms: i64) -> usize {
        let due = self.store.due(now_ms).await;
        let queued = due.iter().filter(|job| self.enqueue(&job.id)).count();
        if queued > 0 {
            tracing::debug!(queued, "Enqueued due jobs");
        }
        queued
    }

    /// One scheduler tick: enqueue due jobs, then drain if idle.
    pub async fn tick(&self) {
        self.enqueue_due(now_ms()).await;
        self.drain().await;
    }

    /// Run queued jobs one at a time until the queue is empty. Returns
    /// immediately if another drain is in progress.
    pub async fn drain(&self) -> usize {
        let Ok(_draining) = self.drain.try_lock() else {
            return 0;
        };
        let mut ran = 0;
        while let Some(id) = self.dequeue() {
            self.run_job(&id).await;
            self.clear_executing();
            ran += 1;
        }
        ran
    }

    /// Startup pass over overdue jobs.
    ///
    /// Overdue within the recovery window: enqueued once. Beyond it: skipped,
    /// recurring jobs rearmed to their next future slot, one-shots retired.
    pub async fn recover_missed(&self, now_ms: i64) -> RecoveryReport {
        let window_ms = i64::try_from(self.config.recovery_window.as_millis()).unwrap_or(i64::MAX);
        let mut report = RecoveryReport::default();
        let mut recover = Vec::new();

        let result = self
            .store
            .mutate_all(|job| {
                let Some(next) = job.next_run_at_ms.filter(|_| job.enabled) else {
                    return false;
                };
                if next > now_ms {
                    return false;
                }
                if now_ms - next <= window_ms {
                    recover.push(job.id.clone());
                    return false;
                }
                tracing::info!(
                    job_id = %job.id,
                    name = %job.name,
                    overdue_ms = now_ms - next,
                    "Skipping job missed beyond the recovery window"
                );
                if job.schedule.is_one_shot() {
                    job.retire();
                    report.expired += 1;
                } else {
                    job.rearm_after(now_ms);
                    report.rearmed += 1;
                }
                true
            })
            .await;
        if let Err(e) = result {
            tracing::error!("Failed to persist missed-job recovery: {}", e);
        }

        report.enqueued = recover.iter().filter(|id| self.enqueue(id)).count();
        if report != RecoveryReport::default() {
            tracing::info!(
                enqueued = report.enqueued,
                rearmed = report.rearmed,
                expired = report.expired,
                "Recovered missed jobs"
            );
        }
        report
    }

    async fn run_job(&self, id: &str) {
        let Some(job) = self.store.get(id).await else {
            tracing::debug!(job_id = %id, "Queued job no longer exists");
            return;
        };
        if !job.enabled {
            tracing::debug!(job_id = %id, "Queued job was disabled");
            return;
        }

        tracing::info!(job_id = %job.id, name = %job.name, "Running job");
        let result = self.execute_with_retry(&job).await;

        match self.store.record_run(&job.id, &result, now_ms()).await {
            Ok(updated) => tracing::info!(
                job_id = %job.id,
                success = result.success,
                duration_ms = result.duration.as_millis() as u64,
                next_run_at_ms = ?updated.next_run_at_ms,
                "Job finished"
            ),
            Err(e) => tracing::error!(job_id = %job.id, "Failed to record job run: {}", e),
        }

        self.report(&job, &result).await;
    }

    async fn execute_with_retry(&self, job: &CronJob) -> ExecutionResult {
        let started = Instant::now();
        let first = self.execute(job).await;
        if first.success {
            return first;
        }

        tracing::warn!(
            job_id = %job.id,
            retry_in = ?self.config.retry_delay,
            "Job failed, retrying once: {}", first.text
        );
        tokio::time::sleep(self.config.retry_delay).await;

        let mut second = self.execute(job).await;
        second.duration = started.elapsed();
        second
    }

    async fn execute(&self, job: &CronJob) -> ExecutionResult {
        let started = Instant::now();
        let options = InvokeOptions::new(self.config.agent_timeout);
        match self.agent.invoke(&job.prompt(), options).await {
            Ok(result) if result.is_error => ExecutionResult::failed(
                format!("agent reported an error: {}", result.text),
                started.elapsed(),
            ),
            Ok(result) => ExecutionResult::ok(result.text, started.elapsed()),
            Err(e) => {
                ExecutionResult::failed(format!("agent {}: {}", e.category(), e), started.elapsed())
            }
        }
    }

    async fn report(&self, job: &CronJob, result: &ExecutionResult) {
        let content = if result.success {
            if result.text.trim().is_empty() {
                return;
            }
            result.text.clone()
        } else {
            format!(
                "Scheduled job \"{}\" failed: {}",
                job.name,
                truncate_diagnostic(&result.text, NOTICE_LIMIT)
            )
        };

        let response = OutgoingResponse::text(content).with_metadata(serde_json::json!({
            "source": "job",
            "job_id": job.id,
            "job_name": job.name,
            "success": result.success,
        }));
        if let Err(e) = self.channel.send(&job.destination, response).await {
            tracing::error!(job_id = %job.id, "Failed to deliver job result: {}", e);
        }
    }
}

/// Spawn the scheduler loop: startup recovery, then a tick every
/// `config.tick` until `cancel` fires.
pub fn spawn_scheduler(scheduler: Arc<JobScheduler>, cancel: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        scheduler.recover_missed(now_ms()).await;

        let mut ticker = tokio::time::interval(scheduler.config.tick);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => scheduler.tick().await,
            }
        }
        tracing::debug!("Job scheduler stopped");
    })
}
