// Configuration structs

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::connection::{RemoteTarget, RetryPolicy};
use crate::errors::{OrchestratorError, OrchestratorResult};
use crate::job::StrategyKind;

/// Top-level configuration for the orchestrator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Strategy used for new jobs (`TRAINING_MODE`)
    pub training_mode: StrategyKind,

    /// Local tree pushed to the remote workspace before a remote run, and
    /// the working directory root for local runs
    pub local_workspace: PathBuf,

    /// Where job records and local run directories live
    pub state_dir: PathBuf,

    pub ssh: SshSettings,
    pub connection: ConnectionSettings,
    pub sync: SyncSettings,
    pub launch: LaunchSettings,
    pub logs: LogSettings,
    pub local: LocalSettings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            training_mode: StrategyKind::Local,
            local_workspace: PathBuf::from("."),
            state_dir: default_state_dir(),
            ssh: SshSettings::default(),
            connection: ConnectionSettings::default(),
            sync: SyncSettings::default(),
            launch: LaunchSettings::default(),
            logs: LogSettings::default(),
            local: LocalSettings::default(),
        }
    }
}

impl OrchestratorConfig {
    /// Reject values no strategy could work with
    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.training_mode == StrategyKind::Remote {
            self.ssh.target()?;
        }
        if self.logs.chunk_size == 0 {
            return Err(OrchestratorError::InvalidConfig(
                "logs.chunk_size must be positive".to_string(),
            ));
        }
        if self.connection.connect_timeout_secs == 0 {
            return Err(OrchestratorError::InvalidConfig(
                "connection.connect_timeout_secs must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Default state directory: ~/.remote-trainer
pub fn default_state_dir() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(".remote-trainer"))
        .unwrap_or_else(|| PathBuf::from(".remote-trainer"))
}

/// SSH target settings (`SSH_*` environment keys)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub key_filename: Option<PathBuf>,
    pub remote_workspace: String,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            hostname: String::new(),
            port: 22,
            username: "root".to_string(),
            key_filename: None,
            remote_workspace: "/root/workspace".to_string(),
        }
    }
}

impl SshSettings {
    pub fn is_configured(&self) -> bool {
        !self.hostname.trim().is_empty()
    }

    /// Build the remote target, failing if the host or key is missing
    pub fn target(&self) -> OrchestratorResult<RemoteTarget> {
        if !self.is_configured() {
            return Err(OrchestratorError::InvalidConfig(
                "SSH_HOSTNAME is not set".to_string(),
            ));
        }
        let key = self.key_filename.clone().ok_or_else(|| {
            OrchestratorError::InvalidConfig("SSH_KEY_FILENAME is not set".to_string())
        })?;
        Ok(
            RemoteTarget::new(&self.hostname, &self.username, key, &self.remote_workspace)
                .with_port(self.port),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    pub connect_timeout_secs: u64,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub liveness_interval_secs: u64,
    /// Bound on a single remote request once connected
    pub operation_timeout_secs: u64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 15,
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 10_000,
            liveness_interval_secs: 30,
            operation_timeout_secs: 60,
        }
    }
}

impl ConnectionSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_secs(self.liveness_interval_secs.max(1))
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.backoff_base_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms.max(self.backoff_base_ms)),
            ..RetryPolicy::default()
        }
    }
}

/// Whether unchanged files are skipped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPolicy {
    Incremental,
    Full,
}

/// How an existing remote file is compared with its local source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeDetection {
    SizeMtime,
    /// SHA-256 when the tree has at most `checksum_max_files` files
    Checksum,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub policy: SyncPolicy,
    pub change_detection: ChangeDetection,
    pub checksum_max_files: usize,
    /// Glob patterns matched against paths relative to the workspace root
    pub excludes: Vec<String>,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            policy: SyncPolicy::Incremental,
            change_detection: ChangeDetection::SizeMtime,
            checksum_max_files: 200,
            excludes: default_excludes(),
        }
    }
}

pub fn default_excludes() -> Vec<String> {
    [
        ".git",
        ".hg",
        ".svn",
        "__pycache__",
        "*.pyc",
        ".venv",
        "node_modules",
        "target",
        ".DS_Store",
        ".*.partial",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchSettings {
    /// How long to wait for the pid sentinel
    pub sentinel_timeout_secs: u64,
    pub sentinel_poll_ms: u64,
    /// How long `cancel` waits for the job to exit after SIGTERM
    pub cancel_wait_secs: u64,
    /// Follow SIGTERM with SIGKILL when the job outlives `cancel_wait_secs`
    pub kill_escalation: bool,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            sentinel_timeout_secs: 30,
            sentinel_poll_ms: 250,
            cancel_wait_secs: 10,
            kill_escalation: false,
        }
    }
}

impl LaunchSettings {
    pub fn sentinel_timeout(&self) -> Duration {
        Duration::from_secs(self.sentinel_timeout_secs)
    }

    pub fn sentinel_poll(&self) -> Duration {
        Duration::from_millis(self.sentinel_poll_ms.max(10))
    }

    pub fn cancel_wait(&self) -> Duration {
        Duration::from_secs(self.cancel_wait_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub poll_interval_ms: u64,
    /// Silence required after the job ends before the stream closes
    pub quiet_period_ms: u64,
    pub chunk_size: usize,
    pub read_retries: u32,
    pub retry_base_ms: u64,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 500,
            quiet_period_ms: 2_000,
            chunk_size: 64 * 1024,
            read_retries: 5,
            retry_base_ms: 500,
        }
    }
}

impl LogSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn quiet_period(&self) -> Duration {
        Duration::from_millis(self.quiet_period_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.read_retries, Duration::from_millis(self.retry_base_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSettings {
    /// Wait between SIGTERM and SIGKILL when cancelling a local job
    pub cancel_grace_secs: u64,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            cancel_grace_secs: 10,
        }
    }
}

impl LocalSettings {
    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }
}
