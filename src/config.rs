//! Configuration types.
//!
//! Daemon settings come from `RELAY_*` environment variables. Heartbeat
//! settings live in a small JSON file re-read on every heartbeat tick so they
//! can be changed without a restart.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cron::SchedulerConfig;
use crate::error::ConfigError;
use crate::persist;

/// Daemon configuration.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Root of all persisted state: queue, jobs, logs, settings.
    pub data_dir: PathBuf,
    /// Agent working directory holding identity files and notes.
    pub workspace: PathBuf,
    /// Agent executable.
    pub agent_bin: String,
    /// Agent home, where it keeps per-project session transcripts.
    pub agent_home: PathBuf,
    pub agent_model: Option<String>,
    pub agent_timeout: Duration,
    /// Use streaming invocation when the channel supports it.
    pub streaming: bool,
    pub queue_poll: Duration,
    pub cron_tick: Duration,
    pub cron_retry_delay: Duration,
    pub cron_recovery_window: Duration,
    /// Default timezone for parsed schedules.
    pub cron_tz: String,
    pub heartbeat_interval: Duration,
    /// Registered recipients, in priority order.
    pub recipients: Vec<String>,
    pub shutdown_timeout: Duration,
}

impl DaemonConfig {
    /// Build config from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let data_dir = var("RELAY_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| home_dir().join(".agent-relay"));
        let workspace = var("RELAY_WORKSPACE")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("workspace"));
        let agent_home = var("RELAY_AGENT_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| home_dir().join(".claude"));

        let cron_tz = var("RELAY_CRON_TZ").unwrap_or_else(|| "UTC".to_string());
        if cron_tz.parse::<chrono_tz::Tz>().is_err() {
            return Err(ConfigError::InvalidValue {
                key: "RELAY_CRON_TZ".into(),
                message: format!("unknown timezone '{cron_tz}'"),
            });
        }

        let recipients = var("RELAY_RECIPIENTS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            agent_bin: var("RELAY_AGENT_BIN").unwrap_or_else(|| "claude".to_string()),
            agent_model: var("RELAY_AGENT_MODEL"),
            agent_timeout: secs(&var, "RELAY_AGENT_TIMEOUT_SECS", 600)?,
            streaming: parsed(&var, "RELAY_STREAMING", true, parse_bool)?,
            queue_poll: Duration::from_millis(parsed(
                &var,
                "RELAY_QUEUE_POLL_MS",
                500,
                u64::from_str,
            )?),
            cron_tick: secs(&var, "RELAY_CRON_TICK_SECS", 30)?,
            cron_retry_delay: secs(&var, "RELAY_CRON_RETRY_DELAY_SECS", 60)?,
            cron_recovery_window: secs(&var, "RELAY_CRON_RECOVERY_WINDOW_SECS", 7200)?,
            cron_tz,
            heartbeat_interval: secs(&var, "RELAY_HEARTBEAT_INTERVAL_SECS", 1800)?,
            recipients,
            shutdown_timeout: secs(&var, "RELAY_SHUTDOWN_TIMEOUT_SECS", 30)?,
            data_dir,
            workspace,
            agent_home,
        })
    }

    pub fn queue_path(&self) -> PathBuf {
        self.data_dir.join("queue.json")
    }

    pub fn jobs_path(&self) -> PathBuf {
        self.data_dir.join("cron").join("jobs.json")
    }

    pub fn heartbeat_settings_path(&self) -> PathBuf {
        self.data_dir.join("heartbeat.json")
    }

    pub fn last_conversation_path(&self) -> PathBuf {
        self.data_dir.join("last_conversation.json")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Generated agent config files (tool servers, hook settings).
    pub fn generated_dir(&self) -> PathBuf {
        self.data_dir.join("generated")
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick: self.cron_tick,
            retry_delay: self.cron_retry_delay,
            recovery_window: self.cron_recovery_window,
            agent_timeout: self.agent_timeout,
        }
    }
}

fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn parsed<T, E: std::fmt::Display>(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
    parse: impl Fn(&str) -> Result<T, E>,
) -> Result<T, ConfigError> {
    match var(key) {
        None => Ok(default),
        Some(raw) => parse(raw.trim()).map_err(|e| ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("'{raw}': {e}"),
        }),
    }
}

fn secs(
    var: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
) -> Result<Duration, ConfigError> {
    let value = parsed(var, key, default, u64::from_str)?;
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "must be greater than zero".into(),
        });
    }
    Ok(Duration::from_secs(value))
}

fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err("expected true or false".to_string()),
    }
}

/// Heartbeat settings file (`<data>/heartbeat.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    pub enabled: bool,
    /// Explicit destination; otherwise resolved from recent activity.
    pub destination: Option<String>,
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            destination: None,
        }
    }
}

impl HeartbeatSettings {
    /// Load settings, defaulting when the file does not exist.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        match persist::read_json::<Self>(path).await {
            Ok(settings) => Ok(settings.unwrap_or_default()),
            Err(e) if e.kind() == std::io::ErrorKind::InvalidData => Err(
                ConfigError::ParseError(format!("{}: {}", path.display(), e)),
            ),
            Err(e) => Err(ConfigError::Io(e)),
        }
    }

    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        persist::write_json_atomic(path, self).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use tempfile::TempDir;

    fn config(vars: &[(&str, &str)]) -> Result<DaemonConfig, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DaemonConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let config = config(&[("RELAY_DATA_DIR", "/srv/relay")]).unwrap();
        assert_eq!(config.workspace, PathBuf::from("/srv/relay/workspace"));
        assert_eq!(config.agent_bin, "claude");
        assert_eq!(config.agent_model, None);
        assert_eq!(config.agent_timeout, Duration::from_secs(600));
        assert!(config.streaming);
        assert_eq!(config.queue_poll, Duration::from_millis(500));
        assert_eq!(config.cron_recovery_window, Duration::from_secs(7200));
        assert_eq!(config.cron_tz, "UTC");
        assert!(config.recipients.is_empty());
        assert_eq!(config.jobs_path(), PathBuf::from("/srv/relay/cron/jobs.json"));
    }

    #[test]
    fn overrides() {
        let config = config(&[
            ("RELAY_DATA_DIR", "/srv/relay"),
            ("RELAY_WORKSPACE", "/home/me/agent"),
            ("RELAY_AGENT_MODEL", "opus"),
            ("RELAY_STREAMING", "off"),
            ("RELAY_CRON_TZ", "Europe/Berlin"),
            ("RELAY_RECIPIENTS", " 123, ,456 "),
            ("RELAY_AGENT_TIMEOUT_SECS", "90"),
        ])
        .unwrap();
        assert_eq!(config.workspace, PathBuf::from("/home/me/agent"));
        assert_eq!(config.agent_model.as_deref(), Some("opus"));
        assert!(!config.streaming);
        assert_eq!(config.cron_tz, "Europe/Berlin");
        assert_eq!(config.recipients, vec!["123", "456"]);
        assert_eq!(config.scheduler().agent_timeout, Duration::from_secs(90));
    }

    #[test]
    fn invalid_values_are_rejected() {
        for (key, value) in [
            ("RELAY_AGENT_TIMEOUT_SECS", "soon"),
            ("RELAY_CRON_TICK_SECS", "0"),
            ("RELAY_STREAMING", "maybe"),
            ("RELAY_CRON_TZ", "Mars/Olympus"),
        ] {
            let err = config(&[(key, value)]).unwrap_err();
            assert!(
                matches!(&err, ConfigError::InvalidValue { key: k, .. } if k == key),
                "{key}: {err}"
            );
        }
    }

    #[tokio::test]
    async fn heartbeat_settings_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("heartbeat.json");
        assert_eq!(
            HeartbeatSettings::load(&path).await.unwrap(),
            HeartbeatSettings::default()
        );

        std::fs::write(&path, r#"{"destination": "42"}"#).unwrap();
        let settings = HeartbeatSettings::load(&path).await.unwrap();
        assert!(settings.enabled);
        assert_eq!(settings.destination.as_deref(), Some("42"));

        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            HeartbeatSettings::load(&path).await,
            Err(ConfigError::ParseError(_))
        ));
    }
}
