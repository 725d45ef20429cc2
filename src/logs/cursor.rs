// Log positions and stream events

use serde::{Deserialize, Serialize};

use crate::job::JobId;

/// Byte position in a job's log. Resuming from a cursor continues with the
/// byte right after the last delivered line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogCursor {
    pub job_id: JobId,
    pub offset: u64,
    /// Set when the stream ended on a transport failure; lines after
    /// `offset` were not delivered
    pub stale: bool,
}

impl LogCursor {
    pub fn start(job_id: JobId) -> Self {
        Self::at(job_id, 0)
    }

    pub fn at(job_id: JobId, offset: u64) -> Self {
        Self {
            job_id,
            offset,
            stale: false,
        }
    }

    /// Same position, usable for a fresh stream
    pub fn resume(&self) -> Self {
        Self::at(self.job_id, self.offset)
    }
}

/// One complete log line, without its terminator
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub text: String,
    /// Position just past this line's newline
    pub cursor: LogCursor,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    Line(LogLine),
    /// The stream gave up after repeated transport failures. Restart from
    /// the cursor to recover the gap.
    Gap(LogCursor),
}
