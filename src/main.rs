use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use agent_relay::agent::hooks::{HookEvent, HookPayload, handle_hook};
use agent_relay::config::DaemonConfig;
use agent_relay::context::DaemonContext;
use agent_relay::workspace::Workspace;

#[derive(Parser)]
#[command(name = "agent-relay", version, about = "Relay chat messages and scheduled jobs to an external agent")]
struct Cli {
    /// Data directory (queue, jobs, logs, settings).
    #[arg(long, global = true, env = "RELAY_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Agent workspace directory.
    #[arg(long, global = true, env = "RELAY_WORKSPACE")]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon (default).
    Run,
    /// Handle an agent lifecycle hook; payload on stdin, response on stdout.
    Hook {
        #[arg(value_enum)]
        event: HookEvent,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let data_dir = cli.data_dir.clone();
    let workspace = cli.workspace.clone();
    let config = DaemonConfig::from_lookup(|key| match key {
        "RELAY_DATA_DIR" => data_dir.as_ref().map(|p| p.display().to_string()),
        "RELAY_WORKSPACE" => workspace.as_ref().map(|p| p.display().to_string()),
        _ => std::env::var(key).ok(),
    })
    .context("invalid configuration")?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let _guard = init_tracing(&config, true);
            run(config).await
        }
        Command::Hook { event } => {
            let _guard = init_tracing(&config, false);
            hook(config, event).await
        }
    }
}

/// Log to a daily file under `<data>/logs`, and to stderr unless stdout and
/// stderr belong to a hook protocol exchange.
fn init_tracing(config: &DaemonConfig, stderr: bool) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match std::fs::create_dir_all(config.logs_dir()) {
        Ok(()) => {
            let appender = tracing_appender::rolling::daily(config.logs_dir(), "agent-relay.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        Err(e) => {
            eprintln!("warning: cannot create log directory: {e}");
            (None, None)
        }
    };

    let stderr_layer = stderr.then(|| {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
    });

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();
    guard
}

async fn run(config: DaemonConfig) -> anyhow::Result<()> {
    let hook_program = std::env::current_exe()
        .context("cannot locate own executable for hook callbacks")?
        .display()
        .to_string();

    eprintln!("agent-relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Data: {}", config.data_dir.display());
    eprintln!("   Workspace: {}", config.workspace.display());
    eprintln!("   Agent: {}", config.agent_bin);
    eprintln!("   Type a message and press Enter. Ctrl+C to exit.\n");

    let context = DaemonContext::build(config, &hook_program)
        .await
        .context("failed to start")?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        signal.cancel();
    });

    context.run(shutdown).await?;
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        if let Ok(mut term) = signal(SignalKind::terminate()) {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Ctrl+C received"),
                _ = term.recv() => tracing::info!("SIGTERM received"),
            }
            return;
        }
    }
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("Ctrl+C received");
}

/// Hooks never fail the agent: problems are logged and the hook exits
/// cleanly with no output.
async fn hook(config: DaemonConfig, event: HookEvent) -> anyhow::Result<()> {
    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("failed to read hook payload")?;

    let payload: HookPayload = if input.trim().is_empty() {
        HookPayload::default()
    } else {
        match serde_json::from_str(&input) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(%event, "Malformed hook payload: {}", e);
                HookPayload::default()
            }
        }
    };

    let workspace = Workspace::new(config.workspace);
    match handle_hook(event, &payload, &workspace).await {
        Ok(Some(output)) => println!("{output}"),
        Ok(None) => {}
        Err(e) => tracing::error!(%event, "Hook failed: {}", e),
    }
    Ok(())
}
