// Log streamer
// Follows a job's log as it grows and hands out complete lines, each tagged
// with the cursor to resume from after it

mod cursor;
mod source;

pub use cursor::{LogCursor, LogEvent, LogLine};
pub use source::{LocalLogSource, LogChunk, LogSource, RemoteLogSource};

use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::LogSettings;
use crate::errors::{OrchestratorError, OrchestratorResult};
use crate::job::JobId;

const CHANNEL_CAPACITY: usize = 256;

/// Longest run of bytes held back waiting for a line terminator before it
/// is handed out as a line of its own
const MAX_PENDING: usize = 64 * 1024;

/// Stream of log events for one job.
///
/// Ends when the job has finished and the log has been quiet for the
/// configured period, after a `Gap`, or after an error. Dropping it stops
/// the background reader.
pub struct LogStream {
    rx: mpsc::Receiver<OrchestratorResult<LogEvent>>,
    task: JoinHandle<()>,
}

impl Stream for LogStream {
    type Item = OrchestratorResult<LogEvent>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for LogStream {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Start following `source` from `cursor`
pub fn stream(source: Arc<dyn LogSource>, cursor: LogCursor, settings: &LogSettings) -> LogStream {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    let task = tokio::spawn(follow(source, cursor.resume(), settings.clone(), tx));
    LogStream { rx, task }
}

type EventSender = mpsc::Sender<OrchestratorResult<LogEvent>>;

async fn follow(source: Arc<dyn LogSource>, start: LogCursor, settings: LogSettings, tx: EventSender) {
    let job_id = start.job_id;
    let policy = settings.retry_policy();
    let chunk_size = settings.chunk_size.max(1);

    // Delivered position and bytes read past it that do not end a line yet
    let mut offset = start.offset;
    let mut pending: Vec<u8> = Vec::new();
    let mut retries = 0u32;
    let mut finished_since: Option<Instant> = None;

    loop {
        let read_offset = offset + pending.len() as u64;
        let chunk = match source.read_from(read_offset, chunk_size).await {
            Ok(chunk) => chunk,
            Err(e) if e.is_retryable() && policy.allows(retries) => {
                retries += 1;
                let delay = policy.delay_for(retries);
                debug!(job_id = %job_id, offset, retry = retries, delay = ?delay, error = %e, "Log read failed, retrying");
                tokio::time::sleep(delay).await;
                continue;
            }
            Err(e) if e.is_retryable() => {
                warn!(job_id = %job_id, offset, error = %e, "Log read kept failing, ending stream");
                let mut cursor = LogCursor::at(job_id, offset);
                cursor.stale = true;
                let _ = tx.send(Ok(LogEvent::Gap(cursor))).await;
                return;
            }
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };
        retries = 0;

        if chunk.file_len < read_offset {
            warn!(job_id = %job_id, offset = read_offset, file_len = chunk.file_len, "Log shrank below cursor");
            let _ = tx
                .send(Err(OrchestratorError::LogCorruption {
                    job_id: job_id.to_string(),
                    offset: read_offset,
                    file_len: chunk.file_len,
                }))
                .await;
            return;
        }

        if !chunk.data.is_empty() {
            let full = chunk.data.len() >= chunk_size;
            pending.extend_from_slice(&chunk.data);
            while let Some(end) = line_end(&pending) {
                let raw: Vec<u8> = pending.drain(..end).collect();
                offset += raw.len() as u64;
                if !emit(&tx, job_id, offset, &raw).await {
                    return;
                }
            }
            finished_since = None;
            if full {
                continue;
            }
        } else if let Some(since) = finished_since {
            if since.elapsed() >= settings.quiet_period() {
                if !pending.is_empty() {
                    offset += pending.len() as u64;
                    let _ = emit(&tx, job_id, offset, &pending).await;
                }
                debug!(job_id = %job_id, offset, "Log stream complete");
                return;
            }
        } else if source.is_finished().await {
            finished_since = Some(Instant::now());
        }

        tokio::time::sleep(settings.poll_interval()).await;
    }
}

/// Length of the first complete line in `pending`, terminator included.
///
/// `\n`, `\r\n` and a bare `\r` all end a line, so progress bars that only
/// rewrite the current line still produce events. A `\r` at the very end is
/// held until the next byte shows whether a `\n` follows.
fn line_end(pending: &[u8]) -> Option<usize> {
    match pending.iter().position(|b| *b == b'\n' || *b == b'\r') {
        Some(pos) if pending[pos] == b'\n' => Some(pos + 1),
        Some(pos) => match pending.get(pos + 1) {
            Some(b'\n') => Some(pos + 2),
            Some(_) => Some(pos + 1),
            None if pending.len() >= MAX_PENDING => Some(pending.len()),
            None => None,
        },
        None if pending.len() >= MAX_PENDING => Some(pending.len()),
        None => None,
    }
}

/// Send one line; false once the receiver is gone
async fn emit(tx: &EventSender, job_id: JobId, offset: u64, raw: &[u8]) -> bool {
    let mut bytes = raw;
    if let Some(rest) = bytes.strip_suffix(b"\n") {
        bytes = rest;
    }
    if let Some(rest) = bytes.strip_suffix(b"\r") {
        bytes = rest;
    }
    let line = LogLine {
        text: String::from_utf8_lossy(bytes).into_owned(),
        cursor: LogCursor::at(job_id, offset),
    };
    tx.send(Ok(LogEvent::Line(line))).await.is_ok()
}
