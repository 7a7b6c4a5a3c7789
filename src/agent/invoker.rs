//! The process-backed [`AgentBackend`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Instant, SystemTime};

use async_trait::async_trait;

use super::hooks::HookFiles;
use super::process::{ProcessSupervisor, spawn_agent};
use super::prompt::{compose_system_prompt, wrap_user_prompt};
use super::recovery::TimeoutRecovery;
use super::types::{AgentBackend, InvocationResult, InvokeOptions};
use super::{batch, stream};
use crate::error::AgentError;
use crate::workspace::Workspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    Json,
    StreamJson,
}

/// Spawns the agent CLI once per invocation.
pub struct AgentInvoker {
    program: String,
    /// Working directory of every spawn; also keys the transcript directory.
    workdir: PathBuf,
    default_model: Option<String>,
    workspace: Arc<Workspace>,
    hooks: Arc<HookFiles>,
    supervisor: Arc<ProcessSupervisor>,
    recovery: TimeoutRecovery,
}

impl AgentInvoker {
    pub fn new(
        program: impl Into<String>,
        workspace: Arc<Workspace>,
        hooks: Arc<HookFiles>,
        supervisor: Arc<ProcessSupervisor>,
        recovery: TimeoutRecovery,
    ) -> Self {
        Self {
            program: program.into(),
            workdir: workspace.root().to_path_buf(),
            default_model: None,
            workspace,
            hooks,
            supervisor,
            recovery,
        }
    }

    pub fn with_default_model(mut self, model: Option<String>) -> Self {
        self.default_model = model;
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    async fn build_args(
        &self,
        prompt: &str,
        options: &InvokeOptions,
        mode: OutputMode,
    ) -> Result<Vec<String>, AgentError> {
        let files = self.hooks.get().await?;
        let system = compose_system_prompt(&self.workspace, options.extra_instructions.as_deref())
            .await;

        let mut args = vec![
            "--dangerously-skip-permissions".to_string(),
            "-p".to_string(),
            wrap_user_prompt(prompt),
            "--output-format".to_string(),
        ];
        match mode {
            OutputMode::Json => args.push("json".to_string()),
            OutputMode::StreamJson => args.extend([
                "stream-json".to_string(),
                "--verbose".to_string(),
                "--include-partial-messages".to_string(),
            ]),
        }
        args.extend([
            "--append-system-prompt".to_string(),
            system,
            "--mcp-config".to_string(),
            files.mcp_config.display().to_string(),
            "--settings".to_string(),
            files.settings.display().to_string(),
        ]);
        if let Some(model) = options.model.as_ref().or(self.default_model.as_ref()) {
            args.extend(["--model".to_string(), model.clone()]);
        }
        if let Some(session) = &options.resume {
            args.extend(["--resume".to_string(), session.to_string()]);
        }
        Ok(args)
    }

    fn log_done(mode: &str, result: &InvocationResult) {
        tracing::info!(
            mode,
            duration_ms = result.duration.as_millis() as u64,
            cost_usd = ?result.cost_usd,
            chars = result.text.len(),
            tool_uses = result.tool_uses.len(),
            timed_out = result.timed_out,
            recovered = result.recovered,
            "Agent invocation finished"
        );
    }
}

#[async_trait]
impl AgentBackend for AgentInvoker {
    async fn invoke(
        &self,
        prompt: &str,
        options: InvokeOptions,
    ) -> Result<InvocationResult, AgentError> {
        let args = self.build_args(prompt, &options, OutputMode::Json).await?;
        let spawned_at = SystemTime::now();
        let started = Instant::now();

        tracing::info!(mode = "batch", resume = options.resume.is_some(), "Invoking agent");
        let child = spawn_agent(&self.program, &args, &self.workdir)?;
        let _guard = self.supervisor.register(&child, "batch");

        let result = match batch::run(child, options.timeout).await {
            Ok(record) => record.into_result(started.elapsed()),
            Err(AgentError::Timeout { timeout }) => {
                match self.recovery.recover(&self.workdir, spawned_at).await {
                    Some(text) => InvocationResult {
                        text,
                        duration: started.elapsed(),
                        recovered: true,
                        timed_out: true,
                        ..Default::default()
                    },
                    None => {
                        tracing::warn!(?timeout, "No transcript to recover from");
                        return Err(AgentError::Timeout { timeout });
                    }
                }
            }
            Err(e) => return Err(e),
        };

        Self::log_done("batch", &result);
        Ok(result)
    }

    async fn invoke_streaming(
        &self,
        prompt: &str,
        options: InvokeOptions,
        on_chunk: &mut (dyn for<'c> FnMut(&'c str) + Send),
    ) -> Result<InvocationResult, AgentError> {
        let args = self
            .build_args(prompt, &options, OutputMode::StreamJson)
            .await?;

        tracing::info!(mode = "stream", resume = options.resume.is_some(), "Invoking agent");
        let child = spawn_agent(&self.program, &args, &self.workdir)?;
        let _guard = self.supervisor.register(&child, "stream");

        let result = stream::run(child, options.timeout, options.cancel.as_ref(), on_chunk).await?;
        Self::log_done("stream", &result);
        Ok(result)
    }
}
