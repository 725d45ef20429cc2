// Remote process supervisor
// Launches detached jobs on a remote host and tracks them through the pid
// sentinel and exit files, independently of any one SSH session

mod wrapper;

pub use wrapper::{
    cancel_command, inner_script, launch_command, parse_status, parse_signalled, status_command,
    tail_command, RunLayout,
};

use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::LaunchSettings;
use crate::connection::{remote_join, ConnectionManager, RangeRead, RemoteSession, RemoteTarget, TransportError};
use crate::errors::{OrchestratorError, OrchestratorResult};
use crate::job::{JobHandle, JobId, JobSpec, JobState, JobStatus, StrategyKind};

/// Directory the job command runs in: the job's working directory,
/// relative to the remote workspace unless absolute
pub fn working_directory(target: &RemoteTarget, spec: &JobSpec) -> String {
    match &spec.working_directory {
        Some(dir) if dir.starts_with('/') => dir.clone(),
        Some(dir) => remote_join(&target.remote_workspace_path, dir),
        None => target.remote_workspace_path.clone(),
    }
}

pub struct RemoteSupervisor {
    connections: Arc<ConnectionManager>,
    settings: LaunchSettings,
}

impl RemoteSupervisor {
    pub fn new(connections: Arc<ConnectionManager>, settings: LaunchSettings) -> Self {
        Self {
            connections,
            settings,
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    /// Start `spec` detached on the session's host.
    ///
    /// Returns a `Running` handle once the wrapper's pid sentinel appears.
    /// Never retried: a failed launch may still have started the command.
    pub async fn launch(&self, session: &Arc<dyn RemoteSession>, spec: &JobSpec) -> OrchestratorResult<JobHandle> {
        let target = session.target().clone();
        let job_id = JobId::new();
        let layout = RunLayout::new(&target.remote_workspace_path, job_id);
        let handle = JobHandle::launching(
            job_id,
            StrategyKind::Remote,
            spec.clone(),
            layout.run_dir().to_string(),
            Some(target.clone()),
        );

        self.launch_into(session, &handle, &layout, spec).await?;
        Ok(handle)
    }

    /// Drive `handle` from `Launching` to `Running`, or to `LaunchFailed`
    async fn launch_into(
        &self,
        session: &Arc<dyn RemoteSession>,
        handle: &JobHandle,
        layout: &RunLayout,
        spec: &JobSpec,
    ) -> OrchestratorResult<()> {
        let job_id = handle.job_id();
        let target = session.target();
        match self.start_wrapper(session, layout, spec).await {
            Ok(pid) => {
                handle.mark_running(pid);
                info!(job_id = %job_id, target = %target, pid, run_dir = layout.run_dir(), "Remote job running");
                Ok(())
            }
            Err(err) => {
                handle.transition(JobState::LaunchFailed {
                    reason: err.to_string(),
                });
                warn!(job_id = %job_id, target = %target, error = %err, state = %handle.state(), "Remote launch failed");
                Err(err)
            }
        }
    }

    async fn start_wrapper(
        &self,
        session: &Arc<dyn RemoteSession>,
        layout: &RunLayout,
        spec: &JobSpec,
    ) -> OrchestratorResult<u32> {
        let target = session.target().clone();
        let fail = |e: TransportError| self.fail(session, &target, e);

        session.create_dir_all(layout.run_dir()).await.map_err(fail)?;

        let job_json = serde_json::to_vec_pretty(spec)?;
        let job_json_tmp = format!("{}.tmp", layout.job_json());
        session.write_file(&job_json_tmp, &job_json).await.map_err(fail)?;
        session.rename(&job_json_tmp, &layout.job_json()).await.map_err(fail)?;

        let workdir = working_directory(&target, spec);
        let command = launch_command(layout, &workdir, &spec.environment(), &spec.command);
        let output = session.exec(&command).await.map_err(fail)?;
        if !output.success() {
            return Err(OrchestratorError::Launch(format!(
                "launch wrapper exited with {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }

        self.wait_for_sentinel(session, layout).await
    }

    /// Poll for the pid sentinel with sleeps until the launch timeout
    async fn wait_for_sentinel(&self, session: &Arc<dyn RemoteSession>, layout: &RunLayout) -> OrchestratorResult<u32> {
        let deadline = Instant::now() + self.settings.sentinel_timeout();
        let pid_path = layout.pid();
        loop {
            match session.read_at(&pid_path, 0, 32).await {
                Ok(RangeRead { data, .. }) => {
                    if let Some(pid) = String::from_utf8_lossy(&data)
                        .trim()
                        .parse::<u32>()
                        .ok()
                        .filter(|pid| *pid > 0)
                    {
                        return Ok(pid);
                    }
                }
                Err(TransportError::NotFound(_)) => {}
                Err(e) => {
                    debug!(path = %pid_path, error = %e, "Sentinel read failed");
                    if e.kills_session() {
                        self.connections.report_failure(session, &e);
                        return Err(OrchestratorError::Launch(format!(
                            "lost connection while waiting for pid sentinel: {}",
                            e
                        )));
                    }
                }
            }

            if Instant::now() >= deadline {
                return Err(OrchestratorError::Launch(format!(
                    "pid sentinel {} did not appear within {:?}",
                    pid_path,
                    self.settings.sentinel_timeout()
                )));
            }
            tokio::time::sleep(self.settings.sentinel_poll()).await;
        }
    }

    /// Current status. Transport trouble yields `Unknown`; terminal states
    /// are returned without contacting the host.
    pub async fn poll(&self, handle: &JobHandle) -> JobStatus {
        if handle.state().is_terminal() {
            return handle.status();
        }
        let Some(target) = handle.target() else {
            return JobStatus::Unknown;
        };

        let session = match self.connections.acquire(target).await {
            Ok(session) => session,
            Err(e) => {
                warn!(job_id = %handle.job_id(), target = %target, error = %e, "Status unavailable");
                return JobStatus::Unknown;
            }
        };

        let layout = RunLayout::from_run_dir(handle.run_dir());
        let output = match session.exec(&status_command(&layout)).await {
            Ok(output) => output,
            Err(e) => {
                self.connections.report_failure(&session, &e);
                warn!(job_id = %handle.job_id(), error = %e, "Status check failed");
                return JobStatus::Unknown;
            }
        };

        let Some(mut report) = parse_status(&output.stdout) else {
            warn!(job_id = %handle.job_id(), run_dir = handle.run_dir(), "Pid sentinel missing on host");
            return JobStatus::Unknown;
        };
        report.cancel_requested |= handle.cancel_requested();

        let next = report.resolve();
        if next.is_terminal() && handle.transition(next.clone()) {
            info!(job_id = %handle.job_id(), state = %next, "Remote job finished");
        }
        handle.status()
    }

    /// Signal the job's process group. Already-finished jobs are left alone.
    pub async fn cancel(&self, handle: &JobHandle) -> OrchestratorResult<()> {
        if handle.state().is_terminal() {
            info!(job_id = %handle.job_id(), state = %handle.state(), "Cancel ignored: job already finished");
            return Ok(());
        }
        let target = handle
            .target()
            .ok_or_else(|| OrchestratorError::UnknownJob(handle.job_id().to_string()))?;

        handle.mark_cancel_requested();
        self.send_signal(handle, target, "TERM").await?;

        if self.wait_terminal(handle).await {
            return Ok(());
        }
        if self.settings.kill_escalation {
            warn!(job_id = %handle.job_id(), "Job ignored SIGTERM, sending SIGKILL");
            self.send_signal(handle, target, "KILL").await?;
            self.wait_terminal(handle).await;
        }
        Ok(())
    }

    async fn send_signal(&self, handle: &JobHandle, target: &RemoteTarget, signal: &str) -> OrchestratorResult<()> {
        let session = self.connections.acquire(target).await?;
        let layout = RunLayout::from_run_dir(handle.run_dir());
        let output = session
            .exec(&cancel_command(&layout, signal))
            .await
            .map_err(|e| self.fail(&session, target, e))?;

        if parse_signalled(&output.stdout) {
            info!(job_id = %handle.job_id(), signal, pid = handle.pid(), "Signalled remote job");
        } else {
            debug!(job_id = %handle.job_id(), signal, "Remote job had already exited");
        }
        Ok(())
    }

    /// Poll until terminal or the cancel wait runs out
    async fn wait_terminal(&self, handle: &JobHandle) -> bool {
        let deadline = Instant::now() + self.settings.cancel_wait();
        loop {
            if self.poll(handle).await.is_terminal() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(self.settings.sentinel_poll()).await;
        }
    }

    /// Read part of the job log. A log that does not exist yet reads as empty.
    pub async fn read_log(&self, handle: &JobHandle, offset: u64, max_len: usize) -> OrchestratorResult<RangeRead> {
        let target = handle
            .target()
            .ok_or_else(|| OrchestratorError::UnknownJob(handle.job_id().to_string()))?;
        let session = self.connections.acquire(target).await?;
        match session.read_at(&handle.log_path(), offset, max_len).await {
            Ok(read) => Ok(read),
            Err(TransportError::NotFound(_)) => Ok(RangeRead::default()),
            Err(e) => Err(self.fail(&session, target, e)),
        }
    }

    /// Last `lines` lines of the job log
    pub async fn tail(&self, handle: &JobHandle, lines: usize) -> OrchestratorResult<Vec<String>> {
        let target = handle
            .target()
            .ok_or_else(|| OrchestratorError::UnknownJob(handle.job_id().to_string()))?;
        let session = self.connections.acquire(target).await?;
        let layout = RunLayout::from_run_dir(handle.run_dir());
        let output = session
            .exec(&tail_command(&layout, lines))
            .await
            .map_err(|e| self.fail(&session, target, e))?;
        Ok(output.stdout.lines().map(str::to_string).collect())
    }

    fn fail(&self, session: &Arc<dyn RemoteSession>, target: &RemoteTarget, err: TransportError) -> OrchestratorError {
        self.connections.report_failure(session, &err);
        err.for_target(target)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{
        CommandOutput, Connector, LoopbackConnector, RemoteDirEntry, RemoteFileStat, RetryPolicy,
    };
    use async_trait::async_trait;
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    /// A host where the wrapper starts but its pid file never becomes visible
    struct NoSentinel(Arc<dyn RemoteSession>);

    #[async_trait]
    impl RemoteSession for NoSentinel {
        fn target(&self) -> &RemoteTarget {
            self.0.target()
        }
        fn is_alive(&self) -> bool {
            self.0.is_alive()
        }
        fn mark_dead(&self) {
            self.0.mark_dead()
        }
        async fn exec(&self, command: &str) -> Result<CommandOutput, TransportError> {
            self.0.exec(command).await
        }
        async fn stat(&self, path: &str) -> Result<Option<RemoteFileStat>, TransportError> {
            self.0.stat(path).await
        }
        async fn create_dir_all(&self, path: &str) -> Result<(), TransportError> {
            self.0.create_dir_all(path).await
        }
        async fn upload(&self, local: &Path, remote: &str, mtime: Option<u64>) -> Result<u64, TransportError> {
            self.0.upload(local, remote, mtime).await
        }
        async fn write_file(&self, remote: &str, contents: &[u8]) -> Result<(), TransportError> {
            self.0.write_file(remote, contents).await
        }
        async fn rename(&self, from: &str, to: &str) -> Result<(), TransportError> {
            self.0.rename(from, to).await
        }
        async fn read_at(&self, path: &str, offset: u64, max_len: usize) -> Result<RangeRead, TransportError> {
            if path.ends_with("/pid") {
                return Err(TransportError::NotFound(path.to_string()));
            }
            self.0.read_at(path, offset, max_len).await
        }
        async fn list_dir(&self, path: &str) -> Result<Vec<RemoteDirEntry>, TransportError> {
            self.0.list_dir(path).await
        }
        async fn download(&self, remote: &str, local: &Path) -> Result<u64, TransportError> {
            self.0.download(remote, local).await
        }
    }

    fn supervisor(connector: &LoopbackConnector) -> RemoteSupervisor {
        let connections = Arc::new(ConnectionManager::new(
            Arc::new(connector.clone()),
            Duration::from_secs(2),
            RetryPolicy::new(0, Duration::from_millis(5)),
        ));
        RemoteSupervisor::new(
            connections,
            LaunchSettings {
                sentinel_timeout_secs: 1,
                sentinel_poll_ms: 20,
                ..LaunchSettings::default()
            },
        )
    }

    async fn session(connector: &LoopbackConnector, dir: &TempDir) -> Arc<dyn RemoteSession> {
        let target = RemoteTarget::new("localhost", "trainer", "/k", dir.path().display().to_string());
        connector.connect(&target, Duration::from_secs(1)).await.unwrap()
    }

    #[tokio::test]
    async fn test_missing_sentinel_times_out_as_launch_failure() {
        let dir = TempDir::new().unwrap();
        let connector = LoopbackConnector::new();
        let supervisor = supervisor(&connector);
        let session: Arc<dyn RemoteSession> = Arc::new(NoSentinel(session(&connector, &dir).await));

        let spec = JobSpec::new("true");
        let layout = RunLayout::new(&session.target().remote_workspace_path, JobId::new());
        let handle = JobHandle::launching(
            JobId::new(),
            StrategyKind::Remote,
            spec.clone(),
            layout.run_dir().to_string(),
            Some(session.target().clone()),
        );

        let started = Instant::now();
        let err = supervisor.launch_into(&session, &handle, &layout, &spec).await.unwrap_err();
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert!(matches!(err, OrchestratorError::Launch(ref reason) if reason.contains("did not appear")));
        assert!(matches!(handle.state(), JobState::LaunchFailed { .. }));
        assert_eq!(handle.status(), JobStatus::Failed(None));
        assert_eq!(handle.history().len(), 2);
    }

    #[tokio::test]
    async fn test_launch_reaches_running_with_sentinel_pid() {
        let dir = TempDir::new().unwrap();
        let connector = LoopbackConnector::new();
        let supervisor = supervisor(&connector);
        let session = session(&connector, &dir).await;

        let handle = supervisor.launch(&session, &JobSpec::new("true")).await.unwrap();
        assert_eq!(handle.state(), JobState::Running);
        assert!(handle.pid() > 0);
    }
}
