// Local execution strategy
//
// Runs the job command as a direct child process in its own process group,
// with stdout and stderr appended to the run directory's training.log.

use async_trait::async_trait;
use dashmap::DashSet;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{release_handle, ExecutionStrategy};
use crate::config::{LocalSettings, LogSettings};
use crate::errors::{OrchestratorError, OrchestratorResult};
use crate::job::{JobHandle, JobId, JobRecord, JobRegistry, JobSpec, JobState, JobStatus, ProcessReport, StrategyKind};
use crate::logs::{self, LocalLogSource, LogCursor, LogStream};
use crate::process::{
    is_same_process, process_start_time, read_number, signal_group, write_atomic, GroupSignal,
};
use crate::supervisor::{inner_script, RunLayout};

const EXIT_FILE: &str = "exit_code";
const CANCEL_MARKER: &str = "cancel_requested";
const CANCEL_POLL: Duration = Duration::from_millis(100);

struct LocalInner {
    workspace: PathBuf,
    runs_dir: PathBuf,
    registry: JobRegistry,
    settings: LocalSettings,
    log_settings: LogSettings,
    /// Jobs whose child this process spawned and is waiting on
    owned: DashSet<JobId>,
}

/// Direct-subprocess strategy. Cheap to clone.
#[derive(Clone)]
pub struct LocalStrategy {
    inner: Arc<LocalInner>,
}

impl LocalStrategy {
    pub fn new(
        workspace: PathBuf,
        state_dir: &Path,
        registry: JobRegistry,
        settings: LocalSettings,
        log_settings: LogSettings,
    ) -> Self {
        Self {
            inner: Arc::new(LocalInner {
                workspace,
                runs_dir: state_dir.join("runs"),
                registry,
                settings,
                log_settings,
                owned: DashSet::new(),
            }),
        }
    }

    fn working_directory(&self, spec: &JobSpec) -> PathBuf {
        match &spec.working_directory {
            Some(dir) => self.inner.workspace.join(dir),
            None => self.inner.workspace.clone(),
        }
    }

    async fn spawn(&self, handle: &JobHandle, run_dir: &Path) -> OrchestratorResult<()> {
        let spec = handle.spec();
        tokio::fs::create_dir_all(run_dir).await?;
        write_atomic(&run_dir.join("job.json"), &serde_json::to_vec_pretty(spec)?)?;

        let log = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(run_dir.join("training.log"))?;

        // Same wrapper as remote jobs: the exit file is written even when
        // this process is gone by the time the command ends
        let layout = RunLayout::from_run_dir(run_dir.display().to_string());
        let workdir = self.working_directory(spec).display().to_string();
        let script = inner_script(&layout, &workdir, &spec.environment(), &spec.command);

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log));
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| OrchestratorError::Launch(format!("failed to spawn `{}`: {}", spec.command, e)))?;
        let pid = child
            .id()
            .ok_or_else(|| OrchestratorError::Launch("child exited before its pid was observed".to_string()))?;

        handle.set_pid_start(process_start_time(pid));
        handle.mark_running(pid);
        self.inner.owned.insert(handle.job_id());
        self.inner.registry.save_quietly(handle);
        info!(job_id = %handle.job_id(), pid, run_dir = %run_dir.display(), "Local job running");

        let strategy = self.clone();
        let handle = handle.clone();
        let run_dir = run_dir.to_path_buf();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => strategy.finish(&handle, &run_dir, status),
                Err(e) => {
                    warn!(job_id = %handle.job_id(), error = %e, "Failed to wait for local job");
                    handle.transition(JobState::Failed { exit_code: None });
                    strategy.inner.registry.save_quietly(&handle);
                }
            }
            strategy.inner.owned.remove(&handle.job_id());
        });
        Ok(())
    }

    /// Move the handle to its terminal state. The wrapper's exit file wins
    /// over the wait status, which only sees the wrapper itself.
    fn finish(&self, handle: &JobHandle, run_dir: &Path, status: ExitStatus) {
        let code = match read_number::<i32>(&run_dir.join(EXIT_FILE)) {
            Ok(Some(code)) => code,
            _ => exit_code(status),
        };
        let next = ProcessReport {
            exit_code: Some(code),
            alive: false,
            cancel_requested: handle.cancel_requested(),
        }
        .resolve();
        if handle.transition(next.clone()) {
            info!(job_id = %handle.job_id(), state = %next, "Local job finished");
        }
        self.inner.registry.save_quietly(handle);
    }

    /// Status of a job this process did not spawn, from the files its run
    /// directory holds
    fn observe(handle: &JobHandle) -> ProcessReport {
        observe_run_dir(Path::new(handle.run_dir()), handle.cancel_requested(), || {
            Self::owns_pid(handle)
        })
    }

    /// Whether the recorded pid still belongs to the job's wrapper
    fn owns_pid(handle: &JobHandle) -> bool {
        is_same_process(handle.pid(), handle.pid_start())
    }

    /// Signal the job's process group unless its pid now belongs to
    /// something else. Returns whether anything was signalled.
    fn signal_job(&self, handle: &JobHandle, signal: GroupSignal) -> OrchestratorResult<bool> {
        if !Self::owns_pid(handle) {
            debug!(job_id = %handle.job_id(), pid = handle.pid(), "Job process is gone, not signalling");
            return Ok(false);
        }
        Ok(signal_group(handle.pid(), signal)?)
    }

    async fn wait_terminal(&self, handle: &JobHandle, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        loop {
            if self.status(handle).await.is_terminal() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(CANCEL_POLL).await;
        }
    }
}

#[async_trait]
impl ExecutionStrategy for LocalStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Local
    }

    async fn start(&self, spec: JobSpec) -> OrchestratorResult<JobHandle> {
        spec.validate()?;
        let job_id = JobId::new();
        let run_dir = self.inner.runs_dir.join(job_id.to_string());
        let handle = JobHandle::launching(
            job_id,
            StrategyKind::Local,
            spec,
            run_dir.display().to_string(),
            None,
        );

        if let Err(err) = self.spawn(&handle, &run_dir).await {
            handle.transition(JobState::LaunchFailed {
                reason: err.to_string(),
            });
            warn!(job_id = %job_id, error = %err, "Local launch failed");
            return Err(err);
        }
        Ok(handle)
    }

    async fn status(&self, handle: &JobHandle) -> JobStatus {
        if handle.state().is_terminal() || self.inner.owned.contains(&handle.job_id()) {
            return handle.status();
        }

        let next = Self::observe(handle).resolve();
        if next.is_terminal() && handle.transition(next.clone()) {
            info!(job_id = %handle.job_id(), state = %next, "Attached local job finished");
            self.inner.registry.save_quietly(handle);
        }
        handle.status()
    }

    fn logs(&self, handle: &JobHandle, cursor: LogCursor) -> LogStream {
        let watched = handle.clone();
        let strategy = self.clone();
        let source = LocalLogSource::new(handle.log_path(), move || {
            watched.state().is_terminal()
                || (!strategy.inner.owned.contains(&watched.job_id())
                    && Self::observe(&watched).resolve().is_terminal())
        });
        logs::stream(Arc::new(source), cursor, &self.inner.log_settings)
    }

    async fn tail(&self, handle: &JobHandle, lines: usize) -> OrchestratorResult<Vec<String>> {
        let text = match tokio::fs::read(handle.log_path()).await {
            Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let all: Vec<&str> = text.lines().collect();
        let skip = all.len().saturating_sub(lines);
        Ok(all[skip..].iter().map(|line| line.to_string()).collect())
    }

    async fn cancel(&self, handle: &JobHandle) -> OrchestratorResult<()> {
        if self.status(handle).await.is_terminal() {
            info!(job_id = %handle.job_id(), state = %handle.state(), "Cancel ignored: job already finished");
            return Ok(());
        }

        handle.mark_cancel_requested();
        let run_dir = Path::new(handle.run_dir());
        if let Err(e) = write_atomic(&run_dir.join(CANCEL_MARKER), b"") {
            debug!(job_id = %handle.job_id(), error = %e, "Could not write cancel marker");
        }

        if !self.signal_job(handle, GroupSignal::Terminate)? {
            debug!(job_id = %handle.job_id(), pid = handle.pid(), "Local job had already exited");
        }
        if self.wait_terminal(handle, self.inner.settings.cancel_grace()).await {
            return Ok(());
        }

        warn!(job_id = %handle.job_id(), pid = handle.pid(), "Job ignored SIGTERM, sending SIGKILL");
        self.signal_job(handle, GroupSignal::Kill)?;
        self.wait_terminal(handle, self.inner.settings.cancel_grace()).await;
        Ok(())
    }

    async fn release(&self, handle: JobHandle) -> OrchestratorResult<()> {
        self.status(&handle).await;
        release_handle(&self.inner.registry, &handle)
    }

    fn attach(&self, record: JobRecord) -> JobHandle {
        record.into_handle()
    }
}

/// Liveness is sampled before the exit file is read: the wrapper writes the
/// file before exiting, so a process seen dead always has its code on disk.
fn observe_run_dir(
    run_dir: &Path,
    cancel_requested: bool,
    is_alive: impl FnOnce() -> bool,
) -> ProcessReport {
    let alive = is_alive();
    ProcessReport {
        exit_code: read_number(&run_dir.join(EXIT_FILE)).ok().flatten(),
        alive,
        cancel_requested: cancel_requested || run_dir.join(CANCEL_MARKER).exists(),
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}
