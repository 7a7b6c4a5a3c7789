//! Daemon context: every long-lived component, built once at startup and
//! passed explicitly.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::agent::hooks::HookFiles;
use crate::agent::process::KILL_GRACE;
use crate::agent::{AgentBackend, AgentInvoker, ProcessSupervisor, TimeoutRecovery};
use crate::channels::cli::CLI_CHAT;
use crate::channels::{Channel, CliChannel, RecipientDirectory};
use crate::config::DaemonConfig;
use crate::cron::schedule::resolve_tz;
use crate::cron::{JobScheduler, JobStore, ScheduleParser, spawn_scheduler};
use crate::dispatcher::{Dispatcher, DispatcherConfig, spawn_dispatcher, spawn_ingest};
use crate::error::{ConfigError, Error};
use crate::heartbeat::{HeartbeatLoop, spawn_heartbeat};
use crate::inbox::PersistentQueue;
use crate::workspace::Workspace;

pub struct DaemonContext {
    pub config: DaemonConfig,
    pub workspace: Arc<Workspace>,
    pub queue: Arc<PersistentQueue>,
    pub jobs: Arc<JobStore>,
    pub parser: ScheduleParser,
    pub supervisor: Arc<ProcessSupervisor>,
    pub agent: Arc<dyn AgentBackend>,
    pub channel: Arc<dyn Channel>,
    pub recipients: Arc<RecipientDirectory>,
}

impl DaemonContext {
    /// Open persisted state and wire components together.
    ///
    /// `hook_program` is the command the agent calls back for lifecycle
    /// hooks, normally this binary.
    pub async fn build(config: DaemonConfig, hook_program: &str) -> Result<Self, Error> {
        tokio::fs::create_dir_all(&config.data_dir)
            .await
            .map_err(ConfigError::Io)?;

        let workspace = Workspace::new(config.workspace.clone());
        workspace.ensure_dirs().await?;
        // The agent keys transcripts by its resolved cwd
        let root = tokio::fs::canonicalize(&config.workspace)
            .await
            .map_err(ConfigError::Io)?;
        let workspace = Arc::new(Workspace::new(root));

        let queue = PersistentQueue::open(config.queue_path()).await;
        let jobs = JobStore::open(config.jobs_path()).await?;
        let parser = ScheduleParser::new(resolve_tz(Some(config.cron_tz.as_str()))?);

        let hooks = Arc::new(
            HookFiles::new(config.generated_dir(), hook_program)
                .with_servers_file(config.data_dir.join("mcp-servers.json")),
        );
        let supervisor = ProcessSupervisor::new();
        let invoker = AgentInvoker::new(
            config.agent_bin.clone(),
            workspace.clone(),
            hooks,
            supervisor.clone(),
            TimeoutRecovery::new(config.agent_home.clone()),
        )
        .with_default_model(config.agent_model.clone());

        let registered = if config.recipients.is_empty() {
            vec![CLI_CHAT.to_string()]
        } else {
            config.recipients.clone()
        };
        let recipients = Arc::new(RecipientDirectory::new(
            config.last_conversation_path(),
            registered,
        ));

        let stats = queue.stats().await;
        tracing::info!(
            data_dir = %config.data_dir.display(),
            workspace = %workspace.root().display(),
            pending = stats.pending,
            jobs = jobs.list().await.len(),
            "Daemon context ready"
        );

        Ok(Self {
            config,
            workspace,
            queue,
            jobs,
            parser,
            supervisor,
            agent: Arc::new(invoker),
            channel: Arc::new(CliChannel::new()),
            recipients,
        })
    }

    /// Replace the process-backed agent.
    pub fn with_agent(mut self, agent: Arc<dyn AgentBackend>) -> Self {
        self.agent = agent;
        self
    }

    /// Replace the CLI channel.
    pub fn with_channel(mut self, channel: Arc<dyn Channel>) -> Self {
        self.channel = channel;
        self
    }

    /// Run every loop until `shutdown` fires, then stop them in order: stop
    /// taking new work, wait up to the shutdown timeout for the message in
    /// hand, cancel what is left, reap agent processes.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), Error> {
        let stop = shutdown.child_token();

        let dispatcher = Arc::new(Dispatcher::new(
            self.queue.clone(),
            self.agent.clone(),
            self.channel.clone(),
            self.recipients.clone(),
            DispatcherConfig {
                poll_interval: self.config.queue_poll,
                agent_timeout: self.config.agent_timeout,
                streaming: self.config.streaming,
            },
        ));
        let abort = dispatcher.abort_token();

        let ingest = spawn_ingest(
            self.channel.clone(),
            self.queue.clone(),
            self.recipients.clone(),
            stop.clone(),
        )
        .await?;
        let mut consumer = spawn_dispatcher(dispatcher.clone(), stop.clone());

        let scheduler = Arc::new(JobScheduler::new(
            self.jobs.clone(),
            self.agent.clone(),
            self.channel.clone(),
            self.config.scheduler(),
        ));
        let scheduler_handle = spawn_scheduler(scheduler, stop.clone());

        let heartbeat = Arc::new(
            HeartbeatLoop::new(
                self.workspace.clone(),
                self.agent.clone(),
                self.channel.clone(),
                self.recipients.clone(),
                self.config.heartbeat_settings_path(),
            )
            .with_interval(self.config.heartbeat_interval)
            .with_timeout(self.config.agent_timeout),
        );
        let heartbeat_handle = spawn_heartbeat(heartbeat, stop.clone());

        tracing::info!("Daemon running");
        stop.cancelled().await;
        tracing::info!("Shutting down...");

        ingest.abort();
        let deadline = Instant::now() + self.config.shutdown_timeout;
        if tokio::time::timeout(self.config.shutdown_timeout, &mut consumer)
            .await
            .is_err()
        {
            tracing::warn!(
                busy = dispatcher.is_busy(),
                "In-flight message did not finish in time, cancelling"
            );
            abort.cancel();
            let _ = tokio::time::timeout(KILL_GRACE + Duration::from_secs(1), consumer).await;
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        for handle in [scheduler_handle, heartbeat_handle] {
            if tokio::time::timeout(remaining, handle).await.is_err() {
                tracing::warn!("Background loop still busy at shutdown");
            }
        }

        self.supervisor.reap_all(KILL_GRACE).await;
        self.channel.shutdown().await?;

        let stats = self.queue.stats().await;
        tracing::info!(
            pending = stats.pending,
            failed = stats.failed,
            "Daemon stopped"
        );
        Ok(())
    }
}
