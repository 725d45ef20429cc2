// Loopback transport
//
// Speaks the session protocol against the local machine: commands run under
// `sh -c` and remote paths are local absolute paths. Used for dry runs and
// for exercising the remote strategy without an SSH host. Reachability can
// be toggled to simulate dropped connections, and connects and pings can be
// slowed down to simulate a congested link.

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::process::Command;

use super::target::RemoteTarget;
use super::transport::{
    local_partial_path, CommandOutput, Connector, InFlight, RangeRead, RemoteDirEntry,
    RemoteFileStat, RemoteSession, TransportError,
};

#[derive(Debug, Default)]
struct LoopbackState {
    unreachable: AtomicBool,
    reject_auth: AtomicBool,
    attempts: AtomicUsize,
    connects: AtomicUsize,
    connect_delay_ms: AtomicU64,
    ping_delay_ms: AtomicU64,
}

impl LoopbackState {
    fn delay(slot: &AtomicU64) -> Duration {
        Duration::from_millis(slot.load(Ordering::SeqCst))
    }
}

/// Connector whose sessions operate on the local machine
#[derive(Debug, Clone, Default)]
pub struct LoopbackConnector {
    state: Arc<LoopbackState>,
}

impl LoopbackConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the network going away (or coming back). Live sessions fail
    /// their next operation while unreachable.
    pub fn set_reachable(&self, reachable: bool) {
        self.state.unreachable.store(!reachable, Ordering::SeqCst);
    }

    pub fn set_reject_auth(&self, reject: bool) {
        self.state.reject_auth.store(reject, Ordering::SeqCst);
    }

    /// Delay every connection attempt before it succeeds or fails
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state
            .connect_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Delay liveness pings on every session
    pub fn set_ping_delay(&self, delay: Duration) {
        self.state
            .ping_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Connection attempts, successful or not
    pub fn connect_attempts(&self) -> usize {
        self.state.attempts.load(Ordering::SeqCst)
    }

    /// Sessions successfully opened
    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(
        &self,
        target: &RemoteTarget,
        _timeout: Duration,
    ) -> Result<Arc<dyn RemoteSession>, TransportError> {
        self.state.attempts.fetch_add(1, Ordering::SeqCst);
        let delay = LoopbackState::delay(&self.state.connect_delay_ms);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.state.unreachable.load(Ordering::SeqCst) {
            return Err(TransportError::Unreachable(format!(
                "{}: connection refused",
                target.host
            )));
        }
        if self.state.reject_auth.load(Ordering::SeqCst) {
            return Err(TransportError::Auth(format!(
                "publickey rejected for {}",
                target.username
            )));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(LoopbackSession {
            target: target.clone(),
            state: self.state.clone(),
            alive: AtomicBool::new(true),
            in_flight: AtomicUsize::new(0),
        }))
    }
}

struct LoopbackSession {
    target: RemoteTarget,
    state: Arc<LoopbackState>,
    alive: AtomicBool,
    in_flight: AtomicUsize,
}

impl LoopbackSession {
    fn check(&self) -> Result<(), TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::Closed("session is closed".to_string()));
        }
        if self.state.unreachable.load(Ordering::SeqCst) {
            self.mark_dead();
            return Err(TransportError::Closed("connection reset by peer".to_string()));
        }
        Ok(())
    }
}

fn stat_of(metadata: &std::fs::Metadata) -> RemoteFileStat {
    RemoteFileStat {
        size: metadata.len(),
        mtime: metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs()),
        is_dir: metadata.is_dir(),
    }
}

#[async_trait]
impl RemoteSession for LoopbackSession {
    fn target(&self) -> &RemoteTarget {
        &self.target
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn mark_dead(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput, TransportError> {
        self.check()?;
        let _busy = InFlight::enter(&self.in_flight);
        let output = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(std::process::Stdio::null())
            .output()
            .await?;
        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn stat(&self, path: &str) -> Result<Option<RemoteFileStat>, TransportError> {
        self.check()?;
        match tokio::fs::metadata(path).await {
            Ok(metadata) => Ok(Some(stat_of(&metadata))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_dir_all(&self, path: &str) -> Result<(), TransportError> {
        self.check()?;
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn upload(
        &self,
        local: &Path,
        remote: &str,
        mtime: Option<u64>,
    ) -> Result<u64, TransportError> {
        self.check()?;
        let _busy = InFlight::enter(&self.in_flight);
        let written = tokio::fs::copy(local, remote).await?;
        if let Some(secs) = mtime {
            let remote = remote.to_string();
            tokio::task::spawn_blocking(move || -> std::io::Result<()> {
                let file = std::fs::File::options().write(true).open(&remote)?;
                file.set_modified(UNIX_EPOCH + Duration::from_secs(secs))
            })
            .await
            .map_err(|e| TransportError::Io(e.to_string()))??;
        }
        Ok(written)
    }

    async fn write_file(&self, remote: &str, contents: &[u8]) -> Result<(), TransportError> {
        self.check()?;
        tokio::fs::write(remote, contents).await?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), TransportError> {
        self.check()?;
        tokio::fs::rename(from, to).await?;
        Ok(())
    }

    async fn read_at(
        &self,
        path: &str,
        offset: u64,
        max_len: usize,
    ) -> Result<RangeRead, TransportError> {
        self.check()?;
        let mut file = tokio::fs::File::open(path).await?;
        let file_len = file.metadata().await?.len();
        if offset >= file_len {
            return Ok(RangeRead {
                data: Vec::new(),
                file_len,
            });
        }
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut data = Vec::with_capacity(max_len.min((file_len - offset) as usize));
        file.take(max_len as u64).read_to_end(&mut data).await?;
        Ok(RangeRead { data, file_len })
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteDirEntry>, TransportError> {
        self.check()?;
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(path).await?;
        while let Some(entry) = dir.next_entry().await? {
            let metadata = entry.metadata().await?;
            entries.push(RemoteDirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                stat: stat_of(&metadata),
            });
        }
        Ok(entries)
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<u64, TransportError> {
        self.check()?;
        let _busy = InFlight::enter(&self.in_flight);
        let partial = local_partial_path(local);
        let written = tokio::fs::copy(remote, &partial).await?;
        tokio::fs::rename(&partial, local).await?;
        Ok(written)
    }

    async fn ping(&self) -> Result<(), TransportError> {
        let delay = LoopbackState::delay(&self.state.ping_delay_ms);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let output = self.exec("true").await?;
        if output.success() {
            Ok(())
        } else {
            Err(TransportError::Io(format!("true exited with {}", output.exit_code)))
        }
    }
}
