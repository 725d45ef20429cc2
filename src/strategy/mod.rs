// Execution strategies
//
// Local and remote execution behind one job-control interface, and the
// orchestrator that picks between them from configuration.

mod local;
mod remote;

pub use local::LocalStrategy;
pub use remote::{default_setup_commands, ConnectionReport, RemoteStrategy, SetupOutcome};

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

use crate::config::OrchestratorConfig;
use crate::connection::{ConnectionManager, Connector, SshConnector};
use crate::errors::{OrchestratorError, OrchestratorResult};
use crate::job::{JobHandle, JobId, JobRecord, JobRegistry, JobSpec, JobStatus, StrategyKind};
use crate::logs::{LogCursor, LogStream};
use crate::supervisor::RemoteSupervisor;
use crate::sync::FileSynchronizer;

/// Uniform job control across execution strategies
///
/// Both implementations drive handles through the same state machine.
/// `status` never fails: a remote host that cannot be asked yields
/// `JobStatus::Unknown`, which the local strategy never reports.
#[async_trait]
pub trait ExecutionStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Launch `spec`; the returned handle is already `Running`
    async fn start(&self, spec: JobSpec) -> OrchestratorResult<JobHandle>;

    async fn status(&self, handle: &JobHandle) -> JobStatus;

    /// Follow the job log from `cursor`
    fn logs(&self, handle: &JobHandle, cursor: LogCursor) -> LogStream;

    /// Last `lines` lines of the job log
    async fn tail(&self, handle: &JobHandle, lines: usize) -> OrchestratorResult<Vec<String>>;

    /// Stop the job. Cancelling a finished job is a logged no-op.
    async fn cancel(&self, handle: &JobHandle) -> OrchestratorResult<()>;

    /// Forget a finished job
    async fn release(&self, handle: JobHandle) -> OrchestratorResult<()>;

    /// Rebuild a handle for a job started by another process
    fn attach(&self, record: JobRecord) -> JobHandle;
}

/// Drop the registry record of a terminal job
pub(crate) fn release_handle(registry: &JobRegistry, handle: &JobHandle) -> OrchestratorResult<()> {
    let state = handle.state();
    if !state.is_terminal() {
        return Err(OrchestratorError::InvalidState {
            job_id: handle.job_id().to_string(),
            state: state.name().to_string(),
            reason: "only finished jobs can be released; cancel it first".to_string(),
        });
    }
    match registry.remove(handle.job_id()) {
        Ok(()) | Err(OrchestratorError::UnknownJob(_)) => {}
        Err(e) => return Err(e),
    }
    info!(job_id = %handle.job_id(), state = %state, "Job released");
    Ok(())
}

/// Entry point for callers: owns the strategies, the connection pool and
/// the job registry
pub struct Orchestrator {
    config: OrchestratorConfig,
    registry: JobRegistry,
    connections: Arc<ConnectionManager>,
    local: Arc<LocalStrategy>,
    remote: Arc<RemoteStrategy>,
    /// Handles issued by this process, so attach returns the live one
    live: DashMap<JobId, JobHandle>,
}

impl Orchestrator {
    /// Orchestrator that reaches remote targets over SSH
    pub fn new(config: OrchestratorConfig) -> OrchestratorResult<Self> {
        let connector = SshConnector::new(
            config.connection.liveness_interval(),
            config.connection.operation_timeout(),
        );
        Self::with_connector(config, Arc::new(connector))
    }

    pub fn with_connector(config: OrchestratorConfig, connector: Arc<dyn Connector>) -> OrchestratorResult<Self> {
        config.validate()?;

        let registry = JobRegistry::new(&config.state_dir);
        let connections = Arc::new(ConnectionManager::new(
            connector,
            config.connection.connect_timeout(),
            config.connection.retry_policy(),
        ));
        let supervisor = Arc::new(RemoteSupervisor::new(connections.clone(), config.launch.clone()));
        let remote = RemoteStrategy::new(
            config.ssh.clone(),
            config.local_workspace.clone(),
            supervisor,
            FileSynchronizer::new(config.sync.clone())?,
            registry.clone(),
            config.logs.clone(),
        );
        let local = LocalStrategy::new(
            config.local_workspace.clone(),
            &config.state_dir,
            registry.clone(),
            config.local.clone(),
            config.logs.clone(),
        );

        info!(mode = %config.training_mode, state_dir = %config.state_dir.display(), "Orchestrator ready");
        Ok(Self {
            config,
            registry,
            connections,
            local: Arc::new(local),
            remote: Arc::new(remote),
            live: DashMap::new(),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Strategy used for new jobs
    pub fn mode(&self) -> StrategyKind {
        self.config.training_mode
    }

    pub fn strategy(&self, kind: StrategyKind) -> Arc<dyn ExecutionStrategy> {
        match kind {
            StrategyKind::Local => self.local.clone(),
            StrategyKind::Remote => self.remote.clone(),
        }
    }

    pub fn remote(&self) -> &Arc<RemoteStrategy> {
        &self.remote
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Start `spec` with the configured strategy
    pub async fn start(&self, spec: JobSpec) -> OrchestratorResult<JobHandle> {
        self.start_with(self.mode(), spec).await
    }

    /// Start `spec` with an explicit strategy
    pub async fn start_with(&self, kind: StrategyKind, spec: JobSpec) -> OrchestratorResult<JobHandle> {
        let handle = self.strategy(kind).start(spec).await?;
        info!(job_id = %handle.job_id(), strategy = %kind, pid = handle.pid(), "Job started");
        self.live.insert(handle.job_id(), handle.clone());
        Ok(handle)
    }

    pub async fn status(&self, handle: &JobHandle) -> JobStatus {
        self.strategy(handle.kind()).status(handle).await
    }

    pub fn logs(&self, handle: &JobHandle, cursor: LogCursor) -> LogStream {
        self.strategy(handle.kind()).logs(handle, cursor)
    }

    pub async fn tail(&self, handle: &JobHandle, lines: usize) -> OrchestratorResult<Vec<String>> {
        self.strategy(handle.kind()).tail(handle, lines).await
    }

    pub async fn cancel(&self, handle: &JobHandle) -> OrchestratorResult<()> {
        self.strategy(handle.kind()).cancel(handle).await
    }

    pub async fn release(&self, handle: JobHandle) -> OrchestratorResult<()> {
        let job_id = handle.job_id();
        self.strategy(handle.kind()).release(handle).await?;
        self.live.remove(&job_id);
        Ok(())
    }

    /// Handle for `job_id`: the live one if this process started it,
    /// otherwise rebuilt from the registry
    pub fn attach(&self, job_id: JobId) -> OrchestratorResult<JobHandle> {
        if let Some(handle) = self.live.get(&job_id) {
            return Ok(handle.clone());
        }
        let record = self.registry.load(job_id)?;
        let handle = self.strategy(record.kind).attach(record);
        self.live.insert(job_id, handle.clone());
        Ok(handle)
    }

    /// Recorded jobs, newest first
    pub fn jobs(&self) -> OrchestratorResult<Vec<JobRecord>> {
        self.registry.list()
    }

    /// Start the periodic session liveness check
    pub fn spawn_liveness(&self) {
        self.connections
            .spawn_liveness(self.config.connection.liveness_interval());
    }

    pub fn shutdown(&self) {
        self.connections.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::LoopbackConnector;
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> OrchestratorConfig {
        let workspace = dir.path().join("workspace");
        std::fs::create_dir_all(&workspace).unwrap();
        OrchestratorConfig {
            local_workspace: workspace,
            state_dir: dir.path().join("state"),
            ..OrchestratorConfig::default()
        }
    }

    #[tokio::test]
    async fn test_remote_mode_requires_ssh_settings() {
        let dir = TempDir::new().unwrap();
        let mut config = config(&dir);
        config.training_mode = StrategyKind::Remote;
        let result = Orchestrator::with_connector(config, Arc::new(LoopbackConnector::new()));
        assert!(matches!(result, Err(OrchestratorError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_attach_returns_live_handle_then_registry_copy() {
        let dir = TempDir::new().unwrap();
        let orchestrator = Orchestrator::with_connector(config(&dir), Arc::new(LoopbackConnector::new())).unwrap();
        assert_eq!(orchestrator.mode(), StrategyKind::Local);

        let handle = orchestrator.start(JobSpec::new("exit 0")).await.unwrap();
        let attached = orchestrator.attach(handle.job_id()).unwrap();
        assert_eq!(attached.job_id(), handle.job_id());
        assert_eq!(attached.kind(), StrategyKind::Local);

        let fresh = Orchestrator::with_connector(config(&dir), Arc::new(LoopbackConnector::new())).unwrap();
        let restored = fresh.attach(handle.job_id()).unwrap();
        assert_eq!(restored.pid(), handle.pid());
        assert_eq!(fresh.jobs().unwrap().len(), 1);

        assert!(matches!(
            fresh.attach(JobId::new()),
            Err(OrchestratorError::UnknownJob(_))
        ));
    }
}
