// Job registry
// Persists one JSON record per started job under <state_dir>/jobs/

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use super::handle::{JobHandle, JobId, JobState, StrategyKind};
use super::spec::JobSpec;
use crate::connection::RemoteTarget;
use crate::errors::{OrchestratorError, OrchestratorResult};
use crate::process::write_atomic;

/// Everything needed to re-attach to a job from a fresh process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub kind: StrategyKind,
    pub pid: u32,
    /// Start time of a local `pid`, so a recycled pid is not mistaken for the job
    #[serde(default)]
    pub pid_start: Option<u64>,
    pub started_at: DateTime<Utc>,
    pub run_dir: String,
    #[serde(default)]
    pub target: Option<RemoteTarget>,
    pub spec: JobSpec,
    pub state: JobState,
}

impl JobRecord {
    pub fn from_handle(handle: &JobHandle) -> Self {
        Self {
            job_id: handle.job_id(),
            kind: handle.kind(),
            pid: handle.pid(),
            pid_start: handle.pid_start(),
            started_at: handle.started_at(),
            run_dir: handle.run_dir().to_string(),
            target: handle.target().cloned(),
            spec: handle.spec().clone(),
            state: handle.state(),
        }
    }

    pub fn into_handle(self) -> JobHandle {
        let pid_start = self.pid_start;
        let handle = JobHandle::restored(
            self.job_id,
            self.kind,
            self.pid,
            self.started_at,
            self.spec,
            self.run_dir,
            self.target,
            self.state,
        );
        handle.set_pid_start(pid_start);
        handle
    }
}

/// Directory of job records
#[derive(Debug, Clone)]
pub struct JobRegistry {
    dir: PathBuf,
}

impl JobRegistry {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            dir: state_dir.join("jobs"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn record_path(&self, job_id: JobId) -> PathBuf {
        self.dir.join(format!("{}.json", job_id))
    }

    /// Write (or overwrite) the record for `handle`
    pub fn save(&self, handle: &JobHandle) -> OrchestratorResult<()> {
        fs::create_dir_all(&self.dir)?;
        let record = JobRecord::from_handle(handle);
        let json = serde_json::to_vec_pretty(&record)?;
        write_atomic(&self.record_path(record.job_id), &json)?;
        debug!(job_id = %record.job_id, state = %record.state, "Job record saved");
        Ok(())
    }

    /// Save, logging instead of failing; used on status updates where the
    /// in-memory handle stays authoritative
    pub fn save_quietly(&self, handle: &JobHandle) {
        if let Err(e) = self.save(handle) {
            warn!(job_id = %handle.job_id(), error = %e, "Failed to persist job record");
        }
    }

    pub fn load(&self, job_id: JobId) -> OrchestratorResult<JobRecord> {
        let path = self.record_path(job_id);
        let contents = match fs::read(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(OrchestratorError::UnknownJob(job_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&contents)?)
    }

    pub fn remove(&self, job_id: JobId) -> OrchestratorResult<()> {
        match fs::remove_file(self.record_path(job_id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(OrchestratorError::UnknownJob(job_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// All readable records, newest first. Unparseable files are skipped.
    pub fn list(&self) -> OrchestratorResult<Vec<JobRecord>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match fs::read(&path)
                .map_err(OrchestratorError::from)
                .and_then(|bytes| serde_json::from_slice::<JobRecord>(&bytes).map_err(Into::into))
            {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable job record"),
            }
        }
        records.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn running_handle() -> JobHandle {
        let handle = JobHandle::launching(
            JobId::new(),
            StrategyKind::Remote,
            JobSpec::new("python train.py"),
            "/root/workspace/.jobs/x".to_string(),
            Some(RemoteTarget::new("gpu-1", "root", "/k", "/root/workspace")),
        );
        handle.set_pid_start(Some(987_654));
        handle.mark_running(4242);
        handle
    }

    #[test]
    fn test_save_load_and_attach() {
        let dir = TempDir::new().unwrap();
        let registry = JobRegistry::new(dir.path());
        let handle = running_handle();
        registry.save(&handle).unwrap();

        let record = registry.load(handle.job_id()).unwrap();
        assert_eq!(record.pid, 4242);
        assert_eq!(record.pid_start, Some(987_654));
        assert_eq!(record.state, JobState::Running);

        let restored = record.into_handle();
        assert_eq!(restored.job_id(), handle.job_id());
        assert_eq!(restored.pid_start(), Some(987_654));
        assert_eq!(restored.state(), JobState::Running);
        assert_eq!(restored.target().unwrap().host, "gpu-1");
    }

    #[test]
    fn test_record_without_start_time_still_loads() {
        let handle = running_handle();
        let mut json = serde_json::to_value(JobRecord::from_handle(&handle)).unwrap();
        json.as_object_mut().unwrap().remove("pid_start");
        let record: JobRecord = serde_json::from_value(json).unwrap();
        assert_eq!(record.pid_start, None);
        assert_eq!(record.into_handle().pid_start(), None);
    }

    #[test]
    fn test_remove_and_unknown_job() {
        let dir = TempDir::new().unwrap();
        let registry = JobRegistry::new(dir.path());
        let handle = running_handle();
        registry.save(&handle).unwrap();
        registry.remove(handle.job_id()).unwrap();

        assert!(matches!(
            registry.load(handle.job_id()),
            Err(OrchestratorError::UnknownJob(_))
        ));
        assert!(registry.list().unwrap().is_empty());
    }

    #[test]
    fn test_list_skips_garbage() {
        let dir = TempDir::new().unwrap();
        let registry = JobRegistry::new(dir.path());
        registry.save(&running_handle()).unwrap();
        std::fs::write(registry.dir().join("broken.json"), b"{not json").unwrap();
        assert_eq!(registry.list().unwrap().len(), 1);
    }
}
