// Log sources: where the streamer reads bytes from

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::errors::OrchestratorResult;
use crate::job::JobHandle;
use crate::supervisor::RemoteSupervisor;

/// Bytes from the requested offset and the file length seen at read time
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogChunk {
    pub data: Vec<u8>,
    pub file_len: u64,
}

#[async_trait]
pub trait LogSource: Send + Sync {
    /// Read up to `max_len` bytes at `offset`. A missing file reads as empty.
    async fn read_from(&self, offset: u64, max_len: usize) -> OrchestratorResult<LogChunk>;

    /// Whether the job writing the log has reached a terminal state
    async fn is_finished(&self) -> bool;
}

/// Log file on this machine; `finished` decides when the writer is done
pub struct LocalLogSource<F> {
    path: PathBuf,
    finished: F,
}

impl<F> LocalLogSource<F>
where
    F: Fn() -> bool + Send + Sync,
{
    pub fn new(path: impl Into<PathBuf>, finished: F) -> Self {
        Self {
            path: path.into(),
            finished,
        }
    }
}

#[async_trait]
impl<F> LogSource for LocalLogSource<F>
where
    F: Fn() -> bool + Send + Sync,
{
    async fn read_from(&self, offset: u64, max_len: usize) -> OrchestratorResult<LogChunk> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(LogChunk::default()),
            Err(e) => return Err(e.into()),
        };
        let file_len = file.metadata().await?.len();
        if offset >= file_len {
            return Ok(LogChunk {
                data: Vec::new(),
                file_len,
            });
        }
        file.seek(std::io::SeekFrom::Start(offset)).await?;
        let mut data = Vec::new();
        file.take(max_len as u64).read_to_end(&mut data).await?;
        Ok(LogChunk { data, file_len })
    }

    async fn is_finished(&self) -> bool {
        (self.finished)()
    }
}

/// `training.log` on the job's remote host, read in ranges over the pooled session
pub struct RemoteLogSource {
    supervisor: Arc<RemoteSupervisor>,
    handle: JobHandle,
}

impl RemoteLogSource {
    pub fn new(supervisor: Arc<RemoteSupervisor>, handle: JobHandle) -> Self {
        Self { supervisor, handle }
    }
}

#[async_trait]
impl LogSource for RemoteLogSource {
    async fn read_from(&self, offset: u64, max_len: usize) -> OrchestratorResult<LogChunk> {
        let read = self.supervisor.read_log(&self.handle, offset, max_len).await?;
        Ok(LogChunk {
            data: read.data,
            file_len: read.file_len,
        })
    }

    async fn is_finished(&self) -> bool {
        self.supervisor.poll(&self.handle).await.is_terminal()
    }
}
