// Job handle and lifecycle state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use uuid::Uuid;

use super::spec::JobSpec;
use crate::connection::RemoteTarget;
use crate::errors::OrchestratorError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for JobId {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(JobId)
            .map_err(|_| OrchestratorError::UnknownJob(s.to_string()))
    }
}

/// Which execution strategy owns a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Local,
    Remote,
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyKind::Local => f.write_str("local"),
            StrategyKind::Remote => f.write_str("remote"),
        }
    }
}

impl FromStr for StrategyKind {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "local" => Ok(StrategyKind::Local),
            "remote" => Ok(StrategyKind::Remote),
            other => Err(OrchestratorError::InvalidConfig(format!(
                "TRAINING_MODE must be 'local' or 'remote', got '{}'",
                other
            ))),
        }
    }
}

/// Internal lifecycle state.
///
/// `Launching -> Running -> {Succeeded | Failed | Cancelled}` and
/// `Launching -> LaunchFailed`. Terminal states never change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobState {
    Launching,
    Running,
    Succeeded,
    Failed { exit_code: Option<i32> },
    Cancelled,
    LaunchFailed { reason: String },
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobState::Launching | JobState::Running)
    }

    pub fn can_transition_to(&self, next: &JobState) -> bool {
        match self {
            JobState::Launching => {
                matches!(next, JobState::Running | JobState::LaunchFailed { .. })
            }
            JobState::Running => matches!(
                next,
                JobState::Succeeded | JobState::Failed { .. } | JobState::Cancelled
            ),
            _ => false,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            JobState::Launching => "launching",
            JobState::Running => "running",
            JobState::Succeeded => "succeeded",
            JobState::Failed { .. } => "failed",
            JobState::Cancelled => "cancelled",
            JobState::LaunchFailed { .. } => "launch_failed",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Failed {
                exit_code: Some(code),
            } => write!(f, "failed (exit {})", code),
            JobState::LaunchFailed { reason } => write!(f, "launch failed: {}", reason),
            other => f.write_str(other.name()),
        }
    }
}

/// Status reported to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "exit_code", rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Succeeded,
    Failed(Option<i32>),
    Cancelled,
    /// The remote host could not be asked; not an error
    Unknown,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed(_) | JobStatus::Cancelled
        )
    }
}

impl From<&JobState> for JobStatus {
    fn from(state: &JobState) -> Self {
        match state {
            JobState::Running => JobStatus::Running,
            JobState::Succeeded => JobStatus::Succeeded,
            JobState::Failed { exit_code } => JobStatus::Failed(*exit_code),
            JobState::Cancelled => JobStatus::Cancelled,
            JobState::LaunchFailed { .. } => JobStatus::Failed(None),
            JobState::Launching => JobStatus::Unknown,
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Running => f.write_str("running"),
            JobStatus::Succeeded => f.write_str("succeeded"),
            JobStatus::Failed(Some(code)) => write!(f, "failed (exit {})", code),
            JobStatus::Failed(None) => f.write_str("failed"),
            JobStatus::Cancelled => f.write_str("cancelled"),
            JobStatus::Unknown => f.write_str("unknown"),
        }
    }
}

/// What a status check saw for a launched process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessReport {
    /// Contents of the exit file, once written
    pub exit_code: Option<i32>,
    pub alive: bool,
    pub cancel_requested: bool,
}

impl ProcessReport {
    /// State implied by the report. An exit file wins over liveness.
    pub fn resolve(&self) -> JobState {
        match self.exit_code {
            Some(0) => JobState::Succeeded,
            Some(_) if self.cancel_requested => JobState::Cancelled,
            Some(code) => JobState::Failed {
                exit_code: Some(code),
            },
            None if self.alive => JobState::Running,
            None if self.cancel_requested => JobState::Cancelled,
            None => JobState::Failed { exit_code: None },
        }
    }
}

struct HandleInner {
    job_id: JobId,
    kind: StrategyKind,
    /// 0 until the launch sentinel is observed
    pid: AtomicU32,
    /// Start time of `pid` in clock ticks, 0 when unknown
    pid_start: AtomicU64,
    started_at: DateTime<Utc>,
    spec: JobSpec,
    /// Run directory: local path or remote path depending on `kind`
    run_dir: String,
    target: Option<RemoteTarget>,
    state: watch::Sender<JobState>,
    history: Mutex<Vec<JobState>>,
    cancel_requested: AtomicBool,
}

/// Caller-facing reference to a launched job. Cheap to clone.
#[derive(Clone)]
pub struct JobHandle {
    inner: Arc<HandleInner>,
}

impl JobHandle {
    /// A handle in `Launching`; strategies record the pid and move it to
    /// `Running` once the process is observed
    pub(crate) fn launching(
        job_id: JobId,
        kind: StrategyKind,
        spec: JobSpec,
        run_dir: String,
        target: Option<RemoteTarget>,
    ) -> Self {
        Self::with_history(
            job_id,
            kind,
            0,
            Utc::now(),
            spec,
            run_dir,
            target,
            vec![JobState::Launching],
        )
    }

    /// Rebuild a handle for a job launched earlier, in its last recorded state
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn restored(
        job_id: JobId,
        kind: StrategyKind,
        pid: u32,
        started_at: DateTime<Utc>,
        spec: JobSpec,
        run_dir: String,
        target: Option<RemoteTarget>,
        state: JobState,
    ) -> Self {
        let mut history = vec![JobState::Launching];
        if state != JobState::Launching {
            if !matches!(state, JobState::LaunchFailed { .. }) {
                history.push(JobState::Running);
            }
            if state != JobState::Running {
                history.push(state);
            }
        }
        Self::with_history(job_id, kind, pid, started_at, spec, run_dir, target, history)
    }

    #[allow(clippy::too_many_arguments)]
    fn with_history(
        job_id: JobId,
        kind: StrategyKind,
        pid: u32,
        started_at: DateTime<Utc>,
        spec: JobSpec,
        run_dir: String,
        target: Option<RemoteTarget>,
        history: Vec<JobState>,
    ) -> Self {
        let current = history.last().cloned().unwrap_or(JobState::Launching);
        let (state, _) = watch::channel(current);
        Self {
            inner: Arc::new(HandleInner {
                job_id,
                kind,
                pid: AtomicU32::new(pid),
                pid_start: AtomicU64::new(0),
                started_at,
                spec,
                run_dir,
                target,
                state,
                history: Mutex::new(history),
                cancel_requested: AtomicBool::new(false),
            }),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.inner.job_id
    }

    pub fn kind(&self) -> StrategyKind {
        self.inner.kind
    }

    /// Process id of the wrapper (local child or remote session leader);
    /// 0 while launching
    pub fn pid(&self) -> u32 {
        self.inner.pid.load(Ordering::SeqCst)
    }

    /// Start time of the local process `pid` referred to when it was recorded
    pub fn pid_start(&self) -> Option<u64> {
        match self.inner.pid_start.load(Ordering::SeqCst) {
            0 => None,
            ticks => Some(ticks),
        }
    }

    pub(crate) fn set_pid_start(&self, ticks: Option<u64>) {
        self.inner.pid_start.store(ticks.unwrap_or(0), Ordering::SeqCst);
    }

    /// Record the observed pid and enter `Running`
    pub(crate) fn mark_running(&self, pid: u32) -> bool {
        self.inner.pid.store(pid, Ordering::SeqCst);
        self.transition(JobState::Running)
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.inner.started_at
    }

    pub fn spec(&self) -> &JobSpec {
        &self.inner.spec
    }

    pub fn run_dir(&self) -> &str {
        &self.inner.run_dir
    }

    /// Host the job runs on, for remote jobs
    pub fn target(&self) -> Option<&RemoteTarget> {
        self.inner.target.as_ref()
    }

    /// Path of `training.log` (remote path for remote jobs)
    pub fn log_path(&self) -> String {
        match self.inner.kind {
            StrategyKind::Remote => format!("{}/training.log", self.inner.run_dir),
            StrategyKind::Local => PathBuf::from(&self.inner.run_dir)
                .join("training.log")
                .display()
                .to_string(),
        }
    }

    pub fn state(&self) -> JobState {
        self.inner.state.borrow().clone()
    }

    pub fn status(&self) -> JobStatus {
        JobStatus::from(&self.state())
    }

    /// Every state this handle has been in, oldest first
    pub fn history(&self) -> Vec<JobState> {
        self.inner
            .history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.inner.state.subscribe()
    }

    /// Apply a transition if the state machine allows it. Returns whether the
    /// state changed.
    pub(crate) fn transition(&self, next: JobState) -> bool {
        let mut history = self.inner.history.lock().unwrap_or_else(|e| e.into_inner());
        let allowed = history
            .last()
            .map(|current| current.can_transition_to(&next))
            .unwrap_or(false);
        if !allowed {
            return false;
        }
        history.push(next.clone());
        self.inner.state.send_replace(next);
        true
    }

    pub(crate) fn mark_cancel_requested(&self) {
        self.inner.cancel_requested.store(true, Ordering::SeqCst);
    }

    pub fn cancel_requested(&self) -> bool {
        self.inner.cancel_requested.load(Ordering::SeqCst)
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("job_id", &self.inner.job_id)
            .field("kind", &self.inner.kind)
            .field("pid", &self.pid())
            .field("state", &self.state())
            .finish()
    }
}
