//! Child process lifecycle: spawn, graceful-then-forceful termination, and a
//! supervisor table so shutdown can reap every agent still running.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::process::{Child, Command};
use uuid::Uuid;

use crate::error::AgentError;

/// Grace period between SIGTERM and SIGKILL.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// Spawn `program` with piped stdout/stderr in `cwd`.
///
/// The child is killed if its handle is dropped, so a cancelled invocation
/// future never leaks a process.
pub fn spawn_agent(program: &str, args: &[String], cwd: &Path) -> Result<Child, AgentError> {
    Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| AgentError::Spawn {
            program: program.to_string(),
            reason: e.to_string(),
        })
}

/// Ask the child to stop, escalating to a forced kill after `grace`.
pub async fn terminate(child: &mut Child, grace: Duration) {
    let Some(pid) = child.id() else {
        // Already reaped.
        return;
    };

    if send_signal(pid, libc::SIGTERM) {
        tracing::debug!(pid, "Sent SIGTERM to agent process");
        match tokio::time::timeout(grace, child.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(pid, ?status, "Agent process exited after SIGTERM");
                return;
            }
            Ok(Err(e)) => tracing::warn!(pid, "Waiting for agent process failed: {}", e),
            Err(_) => tracing::warn!(pid, "Agent ignored SIGTERM, killing"),
        }
    }

    if let Err(e) = child.kill().await {
        tracing::warn!(pid, "Failed to kill agent process: {}", e);
    }
}

fn send_signal(pid: u32, signal: libc::c_int) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: kill(2) has no memory-safety preconditions; a stale pid only
    // yields ESRCH.
    unsafe { libc::kill(pid, signal) == 0 }
}

fn is_alive(pid: u32) -> bool {
    send_signal(pid, 0)
}

#[derive(Debug, Clone)]
struct TrackedProcess {
    pid: u32,
    label: String,
}

/// Table of running agent processes keyed by invocation id.
#[derive(Debug, Default)]
pub struct ProcessSupervisor {
    children: Mutex<HashMap<Uuid, TrackedProcess>>,
}

impl ProcessSupervisor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Track `child` until the returned guard drops.
    pub fn register(self: &Arc<Self>, child: &Child, label: &str) -> ProcessGuard {
        let id = Uuid::new_v4();
        if let Some(pid) = child.id()
            && let Ok(mut children) = self.children.lock()
        {
            children.insert(
                id,
                TrackedProcess {
                    pid,
                    label: label.to_string(),
                },
            );
        }
        ProcessGuard {
            supervisor: Arc::clone(self),
            id,
        }
    }

    /// Number of tracked processes.
    pub fn running(&self) -> usize {
        self.children.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Terminate every tracked process: SIGTERM all, wait up to `grace`,
    /// then SIGKILL whatever is left.
    pub async fn reap_all(&self, grace: Duration) {
        let tracked: Vec<TrackedProcess> = match self.children.lock() {
            Ok(mut children) => children.drain().map(|(_, p)| p).collect(),
            Err(_) => return,
        };
        if tracked.is_empty() {
            return;
        }

        tracing::info!(count = tracked.len(), "Reaping agent processes");
        for p in &tracked {
            tracing::debug!(pid = p.pid, label = %p.label, "Terminating");
            send_signal(p.pid, libc::SIGTERM);
        }

        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline && tracked.iter().any(|p| is_alive(p.pid)) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        for p in tracked.iter().filter(|p| is_alive(p.pid)) {
            tracing::warn!(pid = p.pid, label = %p.label, "Force-killing agent process");
            send_signal(p.pid, libc::SIGKILL);
        }
    }

    fn release(&self, id: &Uuid) {
        if let Ok(mut children) = self.children.lock() {
            children.remove(id);
        }
    }
}

/// Removes its process from the supervisor table on drop.
pub struct ProcessGuard {
    supervisor: Arc<ProcessSupervisor>,
    id: Uuid,
}

impl Drop for ProcessGuard {
    fn drop(&mut self) {
        self.supervisor.release(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Child {
        spawn_agent("/bin/sh", &["-c".to_string(), script.to_string()], Path::new("/")).unwrap()
    }

    #[tokio::test]
    async fn spawn_missing_program_is_spawn_error() {
        let err = spawn_agent("/definitely/not/here", &[], Path::new("/")).unwrap_err();
        assert!(matches!(err, AgentError::Spawn { .. }));
    }

    #[tokio::test]
    async fn terminate_stops_cooperative_child() {
        let mut child = sh("sleep 30");
        let started = std::time::Instant::now();
        terminate(&mut child, Duration::from_secs(5)).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(child.try_wait().unwrap().is_some());
    }

    #[tokio::test]
    async fn terminate_escalates_when_sigterm_ignored() {
        let mut child = sh("trap '' TERM; sleep 30");
        // Give the shell time to install the trap.
        tokio::time::sleep(Duration::from_millis(200)).await;
        terminate(&mut child, Duration::from_millis(300)).await;
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }

    #[tokio::test]
    async fn guard_drop_releases_entry() {
        let supervisor = ProcessSupervisor::new();
        let mut child = sh("sleep 30");
        {
            let _guard = supervisor.register(&child, "test");
            assert_eq!(supervisor.running(), 1);
        }
        assert_eq!(supervisor.running(), 0);
        child.kill().await.unwrap();
    }

    #[tokio::test]
    async fn reap_all_terminates_tracked_children() {
        let supervisor = ProcessSupervisor::new();
        let mut child = sh("sleep 30");
        let _guard = supervisor.register(&child, "reap");

        supervisor.reap_all(Duration::from_secs(2)).await;
        assert_eq!(supervisor.running(), 0);
        let status = tokio::time::timeout(Duration::from_secs(2), child.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(!status.success());
    }
}
