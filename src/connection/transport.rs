// Transport abstraction shared by the SSH and loopback sessions
//
// Every operation is a short request on its own logical channel, so jobs
// sharing one session never hold the transport for longer than one call.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::target::RemoteTarget;
use crate::errors::OrchestratorError;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("authentication rejected: {0}")]
    Auth(String),

    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("no such file: {0}")]
    NotFound(String),

    /// The session died; the pool will rebuild it on next acquire
    #[error("session closed: {0}")]
    Closed(String),

    #[error("{0}")]
    Io(String),
}

impl TransportError {
    /// Map into the caller-facing taxonomy, naming the target involved
    pub fn for_target(self, target: &RemoteTarget) -> OrchestratorError {
        match self {
            TransportError::Auth(reason) => OrchestratorError::Auth {
                target: target.label(),
                reason,
            },
            TransportError::Unreachable(reason) => OrchestratorError::Unreachable {
                target: target.label(),
                reason,
            },
            TransportError::Timeout(after) => OrchestratorError::Timeout {
                target: target.label(),
                after,
            },
            other => OrchestratorError::Transport(format!("{}: {}", target.label(), other)),
        }
    }

    /// Whether the failure means the session itself is no longer usable
    pub fn kills_session(&self) -> bool {
        matches!(
            self,
            TransportError::Closed(_) | TransportError::Unreachable(_) | TransportError::Timeout(_)
        )
    }
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => TransportError::NotFound(err.to_string()),
            std::io::ErrorKind::TimedOut => TransportError::Timeout(Duration::ZERO),
            std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted => TransportError::Closed(err.to_string()),
            _ => TransportError::Io(err.to_string()),
        }
    }
}

/// Output of one remote command
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Subset of remote file metadata the synchronizer needs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteFileStat {
    pub size: u64,
    /// Seconds since the Unix epoch
    pub mtime: Option<u64>,
    pub is_dir: bool,
}

/// A directory entry returned by `list_dir`
#[derive(Debug, Clone)]
pub struct RemoteDirEntry {
    pub name: String,
    pub stat: RemoteFileStat,
}

/// Bytes read from `offset`, plus the file length observed at read time
#[derive(Debug, Clone, Default)]
pub struct RangeRead {
    pub data: Vec<u8>,
    pub file_len: u64,
}

/// One authenticated transport to a remote target
#[async_trait]
pub trait RemoteSession: Send + Sync {
    fn target(&self) -> &RemoteTarget;

    /// Whether the session is still believed usable
    fn is_alive(&self) -> bool;

    /// Mark the session dead; the pool drops it on next acquire
    fn mark_dead(&self);

    /// Operations currently running on the session
    fn in_flight(&self) -> usize {
        0
    }

    /// Run a shell command and collect its output
    async fn exec(&self, command: &str) -> Result<CommandOutput, TransportError>;

    /// Stat a remote path; `Ok(None)` when it does not exist
    async fn stat(&self, path: &str) -> Result<Option<RemoteFileStat>, TransportError>;

    /// Create `path` and every missing parent
    async fn create_dir_all(&self, path: &str) -> Result<(), TransportError>;

    /// Copy a local file to `remote`, setting its mtime when given. Returns bytes written.
    async fn upload(
        &self,
        local: &Path,
        remote: &str,
        mtime: Option<u64>,
    ) -> Result<u64, TransportError>;

    /// Write an in-memory buffer to `remote`
    async fn write_file(&self, remote: &str, contents: &[u8]) -> Result<(), TransportError>;

    /// Rename, replacing any existing destination
    async fn rename(&self, from: &str, to: &str) -> Result<(), TransportError>;

    /// Read up to `max_len` bytes starting at `offset`
    async fn read_at(
        &self,
        path: &str,
        offset: u64,
        max_len: usize,
    ) -> Result<RangeRead, TransportError>;

    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteDirEntry>, TransportError>;

    /// Copy a remote file to `local`. Returns bytes written.
    async fn download(&self, remote: &str, local: &Path) -> Result<u64, TransportError>;

    /// Lightweight no-op used for liveness checks
    async fn ping(&self) -> Result<(), TransportError> {
        let output = self.exec("true").await?;
        if output.success() {
            Ok(())
        } else {
            Err(TransportError::Io(format!(
                "liveness check exited with {}",
                output.exit_code
            )))
        }
    }
}

/// Opens new sessions for the connection manager
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        target: &RemoteTarget,
        timeout: Duration,
    ) -> Result<Arc<dyn RemoteSession>, TransportError>;
}

/// Counts an operation as in flight until dropped
pub(crate) struct InFlight<'a>(&'a AtomicUsize);

impl<'a> InFlight<'a> {
    pub(crate) fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Hidden sibling a remote upload is written to before the rename
pub fn partial_name(dest: &str) -> String {
    match dest.rsplit_once('/') {
        Some((dir, name)) => format!("{}/.{}.partial", dir, name),
        None => format!(".{}.partial", dest),
    }
}

/// Local counterpart of `partial_name`, used by downloads
pub fn local_partial_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}.partial", name))
}

/// Quote a value for a POSIX shell
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

/// Join remote path segments with `/`, regardless of the local platform
pub fn remote_join(base: &str, relative: &str) -> String {
    let base = base.trim_end_matches('/');
    let relative = relative.trim_start_matches('/');
    if relative.is_empty() {
        base.to_string()
    } else if base.is_empty() {
        format!("/{}", relative)
    } else {
        format!("{}/{}", base, relative)
    }
}

/// Parent directory of a remote path
pub fn remote_parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => Some("/"),
        Some(idx) => Some(&trimmed[..idx]),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), "'it'\\''s'");
    }

    #[test]
    fn test_remote_join() {
        assert_eq!(remote_join("/root/workspace/", "data/train.jsonl"), "/root/workspace/data/train.jsonl");
        assert_eq!(remote_join("/root/workspace", ""), "/root/workspace");
        assert_eq!(remote_join("/", "x"), "/x");
    }

    #[test]
    fn test_remote_parent() {
        assert_eq!(remote_parent("/root/workspace/a.txt"), Some("/root/workspace"));
        assert_eq!(remote_parent("/a"), Some("/"));
        assert_eq!(remote_parent("a"), None);
    }

    #[test]
    fn test_partial_name_is_deterministic_sibling() {
        assert_eq!(partial_name("/w/data/a.jsonl"), "/w/data/.a.jsonl.partial");
        assert_eq!(partial_name("a"), ".a.partial");
    }

    #[test]
    fn test_local_partial_paths_do_not_collide() {
        // Same stem, different extensions: model.bin and model.json download side by side
        let bin = local_partial_path(Path::new("/out/model.bin"));
        let json = local_partial_path(Path::new("/out/model.json"));
        assert_eq!(bin, Path::new("/out/.model.bin.partial"));
        assert_eq!(json, Path::new("/out/.model.json.partial"));
        assert_ne!(bin, json);
    }

    #[test]
    fn test_in_flight_guard_counts_until_drop() {
        let counter = AtomicUsize::new(0);
        {
            let _a = InFlight::enter(&counter);
            let _b = InFlight::enter(&counter);
            assert_eq!(counter.load(Ordering::SeqCst), 2);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_closed_session_maps_to_transport_error() {
        let target = RemoteTarget::new("gpu-1", "root", "/k", "/w");
        let err = TransportError::Closed("eof".to_string()).for_target(&target);
        assert!(err.is_retryable());
        let err = TransportError::Auth("denied".to_string()).for_target(&target);
        assert!(err.is_fatal());
    }
}
