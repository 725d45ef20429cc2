// Remote execution strategy
//
// Connection manager + file synchronizer + remote supervisor behind the
// common strategy interface.

use async_trait::async_trait;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use super::{release_handle, ExecutionStrategy};
use crate::config::{LogSettings, SshSettings};
use crate::connection::{remote_join, shell_quote, ConnectionManager, RemoteTarget};
use crate::errors::{OrchestratorError, OrchestratorResult};
use crate::job::{JobHandle, JobRecord, JobRegistry, JobSpec, JobStatus, StrategyKind};
use crate::logs::{self, LogCursor, LogStream, RemoteLogSource};
use crate::supervisor::{working_directory, RemoteSupervisor};
use crate::sync::{download_tree, FileSynchronizer, SyncResult};

/// Outcome of a connectivity check
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionReport {
    pub connected: bool,
    pub host: String,
    #[serde(with = "millis")]
    pub latency: Option<Duration>,
    pub error: Option<String>,
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }
}

/// Result of one environment setup command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupOutcome {
    pub command: String,
    pub exit_code: i32,
    pub stderr: String,
}

impl SetupOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Setup commands for a fresh GPU host
pub fn default_setup_commands(target: &RemoteTarget) -> Vec<String> {
    vec![
        "pip install transformers torch peft datasets accelerate".to_string(),
        format!("mkdir -p {}", shell_quote(&target.remote_workspace_path)),
        format!(
            "mkdir -p {}",
            shell_quote(&remote_join(&target.remote_workspace_path, "models"))
        ),
    ]
}

pub struct RemoteStrategy {
    ssh: SshSettings,
    local_workspace: PathBuf,
    connections: Arc<ConnectionManager>,
    synchronizer: FileSynchronizer,
    supervisor: Arc<RemoteSupervisor>,
    registry: JobRegistry,
    log_settings: LogSettings,
}

impl RemoteStrategy {
    pub fn new(
        ssh: SshSettings,
        local_workspace: PathBuf,
        supervisor: Arc<RemoteSupervisor>,
        synchronizer: FileSynchronizer,
        registry: JobRegistry,
        log_settings: LogSettings,
    ) -> Self {
        Self {
            ssh,
            local_workspace,
            connections: supervisor.connections().clone(),
            synchronizer,
            supervisor,
            registry,
            log_settings,
        }
    }

    /// The configured target; fails when SSH settings are incomplete
    pub fn target(&self) -> OrchestratorResult<RemoteTarget> {
        self.ssh.target()
    }

    pub fn supervisor(&self) -> &Arc<RemoteSupervisor> {
        &self.supervisor
    }

    /// Push the local workspace to the target without launching anything
    pub async fn sync_workspace(&self) -> OrchestratorResult<SyncResult> {
        let target = self.target()?;
        let session = self.connections.acquire(&target).await?;
        self.synchronizer
            .sync(&self.local_workspace, session.as_ref(), &target.remote_workspace_path)
            .await
    }

    /// Pull the job's `models/` directory into `local_dir`
    pub async fn download_artifacts(&self, handle: &JobHandle, local_dir: &Path) -> OrchestratorResult<SyncResult> {
        let target = handle
            .target()
            .ok_or_else(|| OrchestratorError::UnknownJob(handle.job_id().to_string()))?;
        let session = self.connections.acquire(target).await?;

        let models = remote_join(&working_directory(target, handle.spec()), "models");
        match session.stat(&models).await {
            Ok(Some(stat)) if stat.is_dir => {}
            Ok(_) => {
                return Err(OrchestratorError::Sync {
                    path: models,
                    reason: "no models directory on the remote host".to_string(),
                })
            }
            Err(e) => {
                self.connections.report_failure(&session, &e);
                return Err(e.for_target(target));
            }
        }

        let result = download_tree(session.as_ref(), &models, local_dir).await?;
        info!(job_id = %handle.job_id(), files = result.files_changed, local_dir = %local_dir.display(), "Artifacts downloaded");
        Ok(result)
    }

    /// Run setup commands in order. Failures are logged and reported per
    /// command; later commands still run.
    pub async fn prepare_environment(&self, commands: &[String]) -> OrchestratorResult<Vec<SetupOutcome>> {
        let target = self.target()?;
        let mut outcomes = Vec::with_capacity(commands.len());
        for command in commands {
            let session = self.connections.acquire(&target).await?;
            info!(target = %target, command = %command, "Running setup command");
            let outcome = match session.exec(command).await {
                Ok(output) => SetupOutcome {
                    command: command.clone(),
                    exit_code: output.exit_code,
                    stderr: output.stderr.trim().to_string(),
                },
                Err(e) => {
                    self.connections.report_failure(&session, &e);
                    SetupOutcome {
                        command: command.clone(),
                        exit_code: -1,
                        stderr: e.to_string(),
                    }
                }
            };
            if !outcome.succeeded() {
                warn!(target = %target, command = %command, exit_code = outcome.exit_code, stderr = %outcome.stderr, "Setup command failed");
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Connect (or reuse the pooled session) and run the liveness check
    pub async fn check_connection(&self) -> ConnectionReport {
        let host = self.ssh.hostname.clone();
        let target = match self.target() {
            Ok(target) => target,
            Err(e) => return ConnectionReport::failed(host, e),
        };

        let started = Instant::now();
        let session = match self.connections.acquire(&target).await {
            Ok(session) => session,
            Err(e) => return ConnectionReport::failed(host, e),
        };
        match session.ping().await {
            Ok(()) => ConnectionReport {
                connected: true,
                host,
                latency: Some(started.elapsed()),
                error: None,
            },
            Err(e) => {
                self.connections.report_failure(&session, &e);
                ConnectionReport::failed(host, e.for_target(&target))
            }
        }
    }
}

impl ConnectionReport {
    fn failed(host: String, error: OrchestratorError) -> Self {
        Self {
            connected: false,
            host,
            latency: None,
            error: Some(error.to_string()),
        }
    }
}

#[async_trait]
impl ExecutionStrategy for RemoteStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Remote
    }

    /// Connect, push the workspace, then launch. Connection and sync errors
    /// surface here and no handle is created.
    async fn start(&self, spec: JobSpec) -> OrchestratorResult<JobHandle> {
        spec.validate()?;
        let target = self.target()?;
        let session = self.connections.acquire(&target).await?;

        let synced = self
            .synchronizer
            .sync(&self.local_workspace, session.as_ref(), &target.remote_workspace_path)
            .await?;
        info!(target = %target, files = synced.files_changed, bytes = synced.bytes_transferred, "Workspace ready");

        let handle = self.supervisor.launch(&session, &spec).await?;
        self.registry.save_quietly(&handle);
        Ok(handle)
    }

    async fn status(&self, handle: &JobHandle) -> JobStatus {
        let was_terminal = handle.state().is_terminal();
        let status = self.supervisor.poll(handle).await;
        if !was_terminal && status.is_terminal() {
            self.registry.save_quietly(handle);
        }
        status
    }

    fn logs(&self, handle: &JobHandle, cursor: LogCursor) -> LogStream {
        let source = RemoteLogSource::new(self.supervisor.clone(), handle.clone());
        logs::stream(Arc::new(source), cursor, &self.log_settings)
    }

    async fn tail(&self, handle: &JobHandle, lines: usize) -> OrchestratorResult<Vec<String>> {
        self.supervisor.tail(handle, lines).await
    }

    async fn cancel(&self, handle: &JobHandle) -> OrchestratorResult<()> {
        let was_terminal = handle.state().is_terminal();
        self.supervisor.cancel(handle).await?;
        if !was_terminal {
            self.registry.save_quietly(handle);
        }
        Ok(())
    }

    async fn release(&self, handle: JobHandle) -> OrchestratorResult<()> {
        self.status(&handle).await;
        release_handle(&self.registry, &handle)
    }

    fn attach(&self, record: JobRecord) -> JobHandle {
        record.into_handle()
    }
}
