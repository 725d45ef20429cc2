// SSH transport backed by libssh2
//
// The session runs in non-blocking mode and every call retries libssh2's
// EAGAIN with a short sleep, so ssh2's internal session lock is held for
// one libssh2 call at a time. Channels of concurrent operations interleave
// on the one transport instead of queueing behind each other.

use async_trait::async_trait;
use ssh2::{ErrorCode, FileStat, OpenFlags, OpenType, Session};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use super::target::RemoteTarget;
use super::transport::{
    local_partial_path, shell_quote, CommandOutput, Connector, InFlight, RangeRead,
    RemoteDirEntry, RemoteFileStat, RemoteSession, TransportError,
};

// libssh2 status codes that matter for classification
const LIBSSH2_ERROR_SOCKET_SEND: i32 = -7;
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;
const LIBSSH2_ERROR_SOCKET_DISCONNECT: i32 = -13;
const LIBSSH2_ERROR_FILE: i32 = -16;
const LIBSSH2_ERROR_AUTHENTICATION_FAILED: i32 = -18;
const LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED: i32 = -19;
const LIBSSH2_ERROR_SOCKET_TIMEOUT: i32 = -30;
const LIBSSH2_ERROR_EAGAIN: i32 = -37;
const LIBSSH2_ERROR_SOCKET_RECV: i32 = -43;
const LIBSSH2_FX_NO_SUCH_FILE: i32 = 2;

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const COPY_CHUNK: usize = 32 * 1024;

fn map_ssh_error(err: ssh2::Error) -> TransportError {
    match err.code() {
        ErrorCode::SFTP(LIBSSH2_FX_NO_SUCH_FILE) => TransportError::NotFound(err.to_string()),
        ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT) | ErrorCode::Session(LIBSSH2_ERROR_SOCKET_TIMEOUT) => {
            TransportError::Timeout(Duration::ZERO)
        }
        ErrorCode::Session(LIBSSH2_ERROR_SOCKET_SEND)
        | ErrorCode::Session(LIBSSH2_ERROR_SOCKET_RECV)
        | ErrorCode::Session(LIBSSH2_ERROR_SOCKET_DISCONNECT) => {
            TransportError::Closed(err.to_string())
        }
        ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED)
        | ErrorCode::Session(LIBSSH2_ERROR_PUBLICKEY_UNVERIFIED)
        | ErrorCode::Session(LIBSSH2_ERROR_FILE) => TransportError::Auth(err.to_string()),
        _ => TransportError::Io(err.to_string()),
    }
}

/// Opens libssh2 sessions with public-key authentication
#[derive(Debug, Clone)]
pub struct SshConnector {
    keepalive_interval: Duration,
    operation_timeout: Duration,
}

impl SshConnector {
    pub fn new(keepalive_interval: Duration, operation_timeout: Duration) -> Self {
        Self {
            keepalive_interval,
            operation_timeout,
        }
    }
}

impl Default for SshConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), Duration::from_secs(60))
    }
}

#[async_trait]
impl Connector for SshConnector {
    async fn connect(
        &self,
        target: &RemoteTarget,
        timeout: Duration,
    ) -> Result<Arc<dyn RemoteSession>, TransportError> {
        let owned = target.clone();
        let keepalive = self.keepalive_interval;
        let operation_timeout = self.operation_timeout;

        let session =
            tokio::task::spawn_blocking(move || connect_session(&owned, timeout, keepalive))
                .await
                .map_err(|e| TransportError::Io(format!("connect task failed: {}", e)))??;

        Ok(Arc::new(SshSession {
            target: target.clone(),
            driver: Driver {
                session,
                alive: Arc::new(AtomicBool::new(true)),
                step_timeout: operation_timeout,
                keepalive,
            },
            in_flight: AtomicUsize::new(0),
        }))
    }
}

fn connect_session(
    target: &RemoteTarget,
    timeout: Duration,
    keepalive: Duration,
) -> Result<Session, TransportError> {
    let addrs: Vec<_> = (target.host.as_str(), target.port)
        .to_socket_addrs()
        .map_err(|e| TransportError::Unreachable(format!("cannot resolve {}: {}", target.host, e)))?
        .collect();

    let mut last_err = TransportError::Unreachable(format!("no addresses for {}", target.host));
    let mut stream = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(tcp) => {
                stream = Some(tcp);
                break;
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                last_err = TransportError::Timeout(timeout);
            }
            Err(e) => {
                last_err = TransportError::Unreachable(format!("{}: {}", addr, e));
            }
        }
    }
    let tcp = stream.ok_or(last_err)?;

    let mut session = Session::new().map_err(map_ssh_error)?;
    session.set_tcp_stream(tcp);
    session.set_timeout(timeout.as_millis().min(u32::MAX as u128) as u32);
    session.handshake().map_err(|e| match map_ssh_error(e) {
        TransportError::Timeout(_) => TransportError::Timeout(timeout),
        other => TransportError::Unreachable(format!("handshake failed: {}", other)),
    })?;

    session
        .userauth_pubkey_file(&target.username, None, &target.identity_file_path, None)
        .map_err(|e| TransportError::Auth(e.to_string()))?;
    if !session.authenticated() {
        return Err(TransportError::Auth("server did not accept the key".to_string()));
    }

    session.set_keepalive(false, keepalive.as_secs().max(1) as u32);
    session.set_blocking(false);
    debug!(target = %target, "SSH handshake and authentication complete");
    Ok(session)
}

/// Drives non-blocking libssh2 calls to completion
#[derive(Clone)]
struct Driver {
    session: Session,
    alive: Arc<AtomicBool>,
    /// Longest a single call may keep returning EAGAIN
    step_timeout: Duration,
    keepalive: Duration,
}

impl Driver {
    fn check_alive(&self) -> Result<(), TransportError> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Closed("session is closed".to_string()))
        }
    }

    fn wait(&self, started: Instant) -> Result<(), TransportError> {
        self.check_alive()?;
        if started.elapsed() >= self.step_timeout {
            return Err(TransportError::Timeout(self.step_timeout));
        }
        std::thread::sleep(POLL_INTERVAL);
        Ok(())
    }

    /// Repeat `op` while libssh2 reports EAGAIN
    fn retry<T>(&self, mut op: impl FnMut() -> Result<T, ssh2::Error>) -> Result<T, TransportError> {
        let started = Instant::now();
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.code() == ErrorCode::Session(LIBSSH2_ERROR_EAGAIN) => self.wait(started)?,
                Err(e) => return Err(map_ssh_error(e)),
            }
        }
    }

    /// `retry` for the `Read`/`Write` impls, which report EAGAIN as `WouldBlock`
    fn retry_io<T>(&self, mut op: impl FnMut() -> io::Result<T>) -> Result<T, TransportError> {
        let started = Instant::now();
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.wait(started)?,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn write_all(&self, dest: &mut impl Write, mut data: &[u8]) -> Result<(), TransportError> {
        while !data.is_empty() {
            let n = self.retry_io(|| dest.write(data))?;
            if n == 0 {
                return Err(TransportError::Closed("remote side stopped accepting data".to_string()));
            }
            data = &data[n..];
        }
        Ok(())
    }

    /// Run `command` on its own channel, reading stdout and stderr as they
    /// arrive so neither window can stall the other. There is no overall
    /// bound: long commands run until they exit or the session dies.
    fn exec(&self, command: &str) -> Result<CommandOutput, TransportError> {
        let mut channel = self.retry(|| self.session.channel_session())?;
        self.retry(|| channel.exec(command))?;
        let mut errors = channel.stderr();

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut buf = vec![0u8; COPY_CHUNK];
        let mut last_keepalive = Instant::now();
        loop {
            let mut progressed = drain(&mut channel, &mut buf, &mut stdout)?;
            progressed |= drain(&mut errors, &mut buf, &mut stderr)?;
            if channel.eof() {
                break;
            }
            if !progressed {
                self.check_alive()?;
                if last_keepalive.elapsed() >= self.keepalive {
                    self.retry(|| self.session.keepalive_send())?;
                    last_keepalive = Instant::now();
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        }
        drain(&mut channel, &mut buf, &mut stdout)?;
        drain(&mut errors, &mut buf, &mut stderr)?;

        self.retry(|| channel.wait_close())?;
        let exit_code = self.retry(|| channel.exit_status())?;
        Ok(CommandOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }
}

/// Read whatever is buffered on `stream` without blocking
fn drain(stream: &mut impl Read, buf: &mut [u8], out: &mut Vec<u8>) -> Result<bool, TransportError> {
    let mut progressed = false;
    loop {
        match stream.read(buf) {
            Ok(0) => return Ok(progressed),
            Ok(n) => {
                out.extend_from_slice(&buf[..n]);
                progressed = true;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(progressed),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
}

struct SshSession {
    target: RemoteTarget,
    driver: Driver,
    in_flight: AtomicUsize,
}

impl SshSession {
    /// Run one operation on the blocking pool
    async fn blocking<T, F>(&self, op: F) -> Result<T, TransportError>
    where
        F: FnOnce(&Driver) -> Result<T, TransportError> + Send + 'static,
        T: Send + 'static,
    {
        self.driver.check_alive()?;
        let _busy = InFlight::enter(&self.in_flight);
        let driver = self.driver.clone();
        let result = tokio::task::spawn_blocking(move || op(&driver))
            .await
            .map_err(|e| TransportError::Io(format!("ssh task failed: {}", e)))?;

        if let Err(err) = &result {
            if err.kills_session() {
                self.mark_dead();
            }
        }
        result
    }
}

fn file_stat(stat: &FileStat) -> RemoteFileStat {
    RemoteFileStat {
        size: stat.size.unwrap_or(0),
        mtime: stat.mtime,
        is_dir: stat.is_dir(),
    }
}

#[async_trait]
impl RemoteSession for SshSession {
    fn target(&self) -> &RemoteTarget {
        &self.target
    }

    fn is_alive(&self) -> bool {
        self.driver.alive.load(Ordering::SeqCst)
    }

    fn mark_dead(&self) {
        self.driver.alive.store(false, Ordering::SeqCst);
    }

    fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    async fn exec(&self, command: &str) -> Result<CommandOutput, TransportError> {
        let command = command.to_string();
        self.blocking(move |ssh| ssh.exec(&command)).await
    }

    async fn stat(&self, path: &str) -> Result<Option<RemoteFileStat>, TransportError> {
        let path = PathBuf::from(path);
        self.blocking(move |ssh| {
            let sftp = ssh.retry(|| ssh.session.sftp())?;
            match ssh.retry(|| sftp.stat(&path)) {
                Ok(stat) => Ok(Some(file_stat(&stat))),
                Err(TransportError::NotFound(_)) => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await
    }

    async fn create_dir_all(&self, path: &str) -> Result<(), TransportError> {
        let output = self.exec(&format!("mkdir -p {}", shell_quote(path))).await?;
        if output.success() {
            Ok(())
        } else {
            Err(TransportError::Io(format!(
                "mkdir -p {} failed: {}",
                path,
                output.stderr.trim()
            )))
        }
    }

    async fn upload(
        &self,
        local: &Path,
        remote: &str,
        mtime: Option<u64>,
    ) -> Result<u64, TransportError> {
        let local = local.to_path_buf();
        let remote = PathBuf::from(remote);
        self.blocking(move |ssh| {
            let sftp = ssh.retry(|| ssh.session.sftp())?;
            let mut source = std::fs::File::open(&local)?;
            let mut dest = ssh.retry(|| {
                sftp.open_mode(
                    &remote,
                    OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                    0o644,
                    OpenType::File,
                )
            })?;

            let mut buf = vec![0u8; COPY_CHUNK];
            let mut written = 0u64;
            loop {
                let n = source.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                ssh.write_all(&mut dest, &buf[..n])?;
                written += n as u64;
            }
            ssh.retry(|| dest.close())?;

            if let Some(mtime) = mtime {
                let stat = FileStat {
                    size: None,
                    uid: None,
                    gid: None,
                    perm: None,
                    atime: Some(mtime),
                    mtime: Some(mtime),
                };
                ssh.retry(|| sftp.setstat(&remote, stat.clone()))?;
            }
            Ok(written)
        })
        .await
    }

    async fn write_file(&self, remote: &str, contents: &[u8]) -> Result<(), TransportError> {
        let remote = PathBuf::from(remote);
        let contents = contents.to_vec();
        self.blocking(move |ssh| {
            let sftp = ssh.retry(|| ssh.session.sftp())?;
            let mut dest = ssh.retry(|| {
                sftp.open_mode(
                    &remote,
                    OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                    0o644,
                    OpenType::File,
                )
            })?;
            ssh.write_all(&mut dest, &contents)?;
            ssh.retry(|| dest.close())
        })
        .await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), TransportError> {
        // SFTP v3 rename refuses to overwrite on OpenSSH; mv is atomic on one filesystem
        let output = self
            .exec(&format!("mv -f {} {}", shell_quote(from), shell_quote(to)))
            .await?;
        if output.success() {
            Ok(())
        } else {
            Err(TransportError::Io(format!(
                "rename {} -> {} failed: {}",
                from,
                to,
                output.stderr.trim()
            )))
        }
    }

    async fn read_at(
        &self,
        path: &str,
        offset: u64,
        max_len: usize,
    ) -> Result<RangeRead, TransportError> {
        let path = PathBuf::from(path);
        self.blocking(move |ssh| {
            let sftp = ssh.retry(|| ssh.session.sftp())?;
            let mut file = ssh.retry(|| sftp.open(&path))?;
            let file_len = ssh.retry(|| file.stat())?.size.unwrap_or(0);
            if offset >= file_len {
                return Ok(RangeRead {
                    data: Vec::new(),
                    file_len,
                });
            }
            file.seek(SeekFrom::Start(offset))?;

            let mut data = Vec::with_capacity(max_len.min((file_len - offset) as usize));
            let mut buf = vec![0u8; COPY_CHUNK];
            while data.len() < max_len {
                let want = (max_len - data.len()).min(buf.len());
                let n = ssh.retry_io(|| file.read(&mut buf[..want]))?;
                if n == 0 {
                    break;
                }
                data.extend_from_slice(&buf[..n]);
            }
            Ok(RangeRead { data, file_len })
        })
        .await
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<RemoteDirEntry>, TransportError> {
        let dir = PathBuf::from(path);
        self.blocking(move |ssh| {
            let sftp = ssh.retry(|| ssh.session.sftp())?;
            let entries = ssh.retry(|| sftp.readdir(&dir))?;
            Ok(entries
                .into_iter()
                .filter_map(|(path, stat)| {
                    let name = path.file_name()?.to_string_lossy().into_owned();
                    if name == "." || name == ".." {
                        return None;
                    }
                    Some(RemoteDirEntry {
                        name,
                        stat: file_stat(&stat),
                    })
                })
                .collect())
        })
        .await
    }

    async fn download(&self, remote: &str, local: &Path) -> Result<u64, TransportError> {
        let remote = PathBuf::from(remote);
        let local = local.to_path_buf();
        self.blocking(move |ssh| {
            let sftp = ssh.retry(|| ssh.session.sftp())?;
            let mut source = ssh.retry(|| sftp.open(&remote))?;
            let partial = local_partial_path(&local);
            let mut dest = std::fs::File::create(&partial)?;

            let mut buf = vec![0u8; COPY_CHUNK];
            let mut written = 0u64;
            loop {
                let n = ssh.retry_io(|| source.read(&mut buf))?;
                if n == 0 {
                    break;
                }
                dest.write_all(&buf[..n])?;
                written += n as u64;
            }
            drop(dest);
            std::fs::rename(&partial, &local)?;
            Ok(written)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Yields its chunks, then reports `WouldBlock` like a quiet channel
    struct Trickle(Vec<&'static [u8]>);

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.0.is_empty() {
                return Err(io::ErrorKind::WouldBlock.into());
            }
            let chunk = self.0.remove(0);
            buf[..chunk.len()].copy_from_slice(chunk);
            Ok(chunk.len())
        }
    }

    #[test]
    fn test_drain_stops_at_would_block() {
        let mut stream = Trickle(vec![b"epoch 1\n", b"epoch 2\n"]);
        let mut buf = vec![0u8; 64];
        let mut out = Vec::new();
        assert!(drain(&mut stream, &mut buf, &mut out).unwrap());
        assert_eq!(out, b"epoch 1\nepoch 2\n");

        // Nothing buffered: returns instead of waiting
        assert!(!drain(&mut stream, &mut buf, &mut out).unwrap());
    }

    #[test]
    fn test_drain_reads_both_streams_without_waiting_for_eof() {
        // A chatty stderr must not wait behind an open stdout
        let mut stdout = Trickle(vec![b"step"]);
        let mut stderr = Trickle(vec![b"warning: a\n"; 8]);
        let mut buf = vec![0u8; 64];
        let (mut out, mut err) = (Vec::new(), Vec::new());
        drain(&mut stdout, &mut buf, &mut out).unwrap();
        drain(&mut stderr, &mut buf, &mut err).unwrap();
        assert_eq!(out, b"step");
        assert_eq!(err.len(), 8 * b"warning: a\n".len());
    }

    #[test]
    fn test_map_ssh_error_classification() {
        let missing = ssh2::Error::new(ErrorCode::SFTP(LIBSSH2_FX_NO_SUCH_FILE), "no such file");
        assert!(matches!(map_ssh_error(missing), TransportError::NotFound(_)));

        let dropped = ssh2::Error::new(ErrorCode::Session(LIBSSH2_ERROR_SOCKET_RECV), "recv");
        let err = map_ssh_error(dropped);
        assert!(matches!(err, TransportError::Closed(_)));
        assert!(err.kills_session());

        let auth = ssh2::Error::new(
            ErrorCode::Session(LIBSSH2_ERROR_AUTHENTICATION_FAILED),
            "auth",
        );
        assert!(matches!(map_ssh_error(auth), TransportError::Auth(_)));
    }
}
