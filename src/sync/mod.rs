// File synchronizer
// Mirrors a local workspace to the remote workspace path, and pulls remote
// trees back for artifact download

mod scan;

pub use scan::{scan_workspace, sha256_file, ExcludeSet, LocalFile};

use regex::Regex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::{ChangeDetection, SyncPolicy, SyncSettings};
use crate::connection::{
    partial_name, remote_join, remote_parent, shell_quote, RemoteFileStat, RemoteSession,
    TransportError,
};
use crate::errors::{OrchestratorError, OrchestratorResult};

/// Outcome of one sync (or download) pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncResult {
    pub bytes_transferred: u64,
    pub files_changed: usize,
    pub files_scanned: usize,
}

/// Pushes workspace trees over a session
#[derive(Debug, Clone)]
pub struct FileSynchronizer {
    settings: SyncSettings,
    excludes: ExcludeSet,
}

impl FileSynchronizer {
    pub fn new(settings: SyncSettings) -> OrchestratorResult<Self> {
        let excludes = ExcludeSet::new(&settings.excludes)?;
        Ok(Self { settings, excludes })
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    /// Mirror `local_dir` into `remote_dir`.
    ///
    /// Files are written to `.<name>.partial` beside their destination and
    /// renamed into place, so re-running after a failure is safe. Remote
    /// files that no longer exist locally are left alone.
    pub async fn sync(
        &self,
        local_dir: &Path,
        session: &dyn RemoteSession,
        remote_dir: &str,
    ) -> OrchestratorResult<SyncResult> {
        let root = local_dir.to_path_buf();
        let excludes = self.excludes.clone();
        let files = tokio::task::spawn_blocking(move || scan_workspace(&root, &excludes))
            .await
            .map_err(|e| OrchestratorError::Sync {
                path: local_dir.display().to_string(),
                reason: format!("scan task failed: {}", e),
            })??;

        session
            .create_dir_all(remote_dir)
            .await
            .map_err(|e| sync_error(remote_dir, e))?;

        let changed = match self.settings.policy {
            SyncPolicy::Full => files.iter().collect::<Vec<_>>(),
            SyncPolicy::Incremental => self.changed_files(&files, session, remote_dir).await?,
        };

        let mut result = SyncResult {
            files_scanned: files.len(),
            ..SyncResult::default()
        };
        let mut ensured: HashSet<String> = HashSet::new();
        ensured.insert(remote_dir.trim_end_matches('/').to_string());

        for file in changed {
            let dest = remote_join(remote_dir, &file.relative);
            let parent = remote_parent(&dest).unwrap_or(remote_dir).to_string();
            if ensured.insert(parent.clone()) {
                session
                    .create_dir_all(&parent)
                    .await
                    .map_err(|e| sync_error(&file.relative, e))?;
            }

            let partial = partial_name(&dest);
            let written = session
                .upload(&file.path, &partial, file.mtime)
                .await
                .map_err(|e| sync_error(&file.relative, e))?;
            session
                .rename(&partial, &dest)
                .await
                .map_err(|e| sync_error(&file.relative, e))?;

            debug!(path = %file.relative, bytes = written, "Uploaded");
            result.bytes_transferred += written;
            result.files_changed += 1;
        }

        info!(
            target = %session.target(),
            remote_dir = remote_dir,
            files_scanned = result.files_scanned,
            files_changed = result.files_changed,
            bytes = result.bytes_transferred,
            "Workspace synced"
        );
        Ok(result)
    }

    async fn changed_files<'a>(
        &self,
        files: &'a [LocalFile],
        session: &dyn RemoteSession,
        remote_dir: &str,
    ) -> OrchestratorResult<Vec<&'a LocalFile>> {
        let remote = remote_stats(files, session, remote_dir).await?;

        let use_checksum = self.settings.change_detection == ChangeDetection::Checksum
            && files.len() <= self.settings.checksum_max_files;

        if !use_checksum {
            return Ok(files
                .iter()
                .filter(|file| match remote.get(&file.relative) {
                    Some(stat) => stat.size != file.size || stat.mtime != file.mtime,
                    None => true,
                })
                .collect());
        }

        // Same size is a precondition for identical content; hash only those
        let candidates: Vec<&LocalFile> = files
            .iter()
            .filter(|file| {
                remote
                    .get(&file.relative)
                    .map(|stat| stat.size == file.size)
                    .unwrap_or(false)
            })
            .collect();
        let remote_hashes = remote_sha256(&candidates, session, remote_dir).await?;

        let mut changed = Vec::new();
        for file in files {
            let unchanged = match remote_hashes.get(&file.relative) {
                Some(remote_hash) => {
                    let path = file.path.clone();
                    let local_hash = tokio::task::spawn_blocking(move || sha256_file(&path))
                        .await
                        .map_err(|e| OrchestratorError::Sync {
                            path: file.relative.clone(),
                            reason: e.to_string(),
                        })?
                        .map_err(|e| OrchestratorError::Sync {
                            path: file.relative.clone(),
                            reason: e.to_string(),
                        })?;
                    &local_hash == remote_hash
                }
                None => false,
            };
            if !unchanged {
                changed.push(file);
            }
        }
        Ok(changed)
    }
}

/// Stat every file by listing each remote directory once
async fn remote_stats(
    files: &[LocalFile],
    session: &dyn RemoteSession,
    remote_dir: &str,
) -> OrchestratorResult<HashMap<String, RemoteFileStat>> {
    let dirs: BTreeSet<String> = files
        .iter()
        .map(|file| match file.relative.rsplit_once('/') {
            Some((dir, _)) => dir.to_string(),
            None => String::new(),
        })
        .collect();

    let mut stats = HashMap::new();
    for dir in dirs {
        let remote_path = remote_join(remote_dir, &dir);
        let entries = match session.list_dir(&remote_path).await {
            Ok(entries) => entries,
            Err(TransportError::NotFound(_)) => continue,
            Err(e) => return Err(sync_error(&remote_path, e)),
        };
        for entry in entries {
            if entry.stat.is_dir {
                continue;
            }
            let relative = if dir.is_empty() {
                entry.name
            } else {
                format!("{}/{}", dir, entry.name)
            };
            stats.insert(relative, entry.stat);
        }
    }
    Ok(stats)
}

/// Hash remote files in one command; files that cannot be hashed are absent
async fn remote_sha256(
    files: &[&LocalFile],
    session: &dyn RemoteSession,
    remote_dir: &str,
) -> OrchestratorResult<HashMap<String, String>> {
    if files.is_empty() {
        return Ok(HashMap::new());
    }

    let args: Vec<String> = files.iter().map(|f| shell_quote(&f.relative)).collect();
    let command = format!(
        "cd {} && sha256sum -- {} 2>/dev/null",
        shell_quote(remote_dir),
        args.join(" ")
    );
    let output = session
        .exec(&command)
        .await
        .map_err(|e| sync_error(remote_dir, e))?;
    Ok(parse_sha256_lines(&output.stdout))
}

fn parse_sha256_lines(stdout: &str) -> HashMap<String, String> {
    let Ok(re) = Regex::new(r"^\\?([a-fA-F0-9]{64}) [ *](.+)$") else {
        return HashMap::new();
    };
    stdout
        .lines()
        .filter_map(|line| {
            let caps = re.captures(line)?;
            Some((caps[2].to_string(), caps[1].to_lowercase()))
        })
        .collect()
}

/// Copy a remote directory tree into `local_dir`, recursively
pub async fn download_tree(
    session: &dyn RemoteSession,
    remote_dir: &str,
    local_dir: &Path,
) -> OrchestratorResult<SyncResult> {
    let mut result = SyncResult::default();
    let mut pending: Vec<(String, PathBuf)> = vec![(remote_dir.to_string(), local_dir.to_path_buf())];

    while let Some((remote, local)) = pending.pop() {
        tokio::fs::create_dir_all(&local).await?;
        let entries = session
            .list_dir(&remote)
            .await
            .map_err(|e| sync_error(&remote, e))?;
        for entry in entries {
            let remote_path = remote_join(&remote, &entry.name);
            let local_path = local.join(&entry.name);
            if entry.stat.is_dir {
                pending.push((remote_path, local_path));
                continue;
            }
            result.files_scanned += 1;
            let written = session
                .download(&remote_path, &local_path)
                .await
                .map_err(|e| sync_error(&remote_path, e))?;
            result.bytes_transferred += written;
            result.files_changed += 1;
        }
    }

    info!(
        remote_dir = remote_dir,
        local_dir = %local_dir.display(),
        files = result.files_changed,
        bytes = result.bytes_transferred,
        "Downloaded remote tree"
    );
    Ok(result)
}

fn sync_error(path: &str, err: TransportError) -> OrchestratorError {
    OrchestratorError::Sync {
        path: path.to_string(),
        reason: err.to_string(),
    }
}
