// Error taxonomy for the orchestration core
//
// Library code returns `OrchestratorError`; the binary wraps these in anyhow
// and uses the suggestion helpers below to print actionable messages.

use std::fmt;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

/// Result alias used throughout the library
pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Credentials rejected, or the identity file is unusable (missing, world-readable)
    #[error("authentication failed for {target}: {reason}")]
    Auth { target: String, reason: String },

    /// Network or DNS failure while reaching the target
    #[error("{target} is unreachable: {reason}")]
    Unreachable { target: String, reason: String },

    /// Handshake or remote request exceeded its bound
    #[error("timed out after {after:?} talking to {target}")]
    Timeout { target: String, after: Duration },

    /// Workspace mirroring failed at `path`
    #[error("sync failed at {path}: {reason}")]
    Sync { path: String, reason: String },

    /// The launch wrapper never produced its pid sentinel
    #[error("launch failed: {0}")]
    Launch(String),

    /// The log file is shorter than the resume offset (rotated or truncated)
    #[error("log for job {job_id} was rotated: resume offset {offset} exceeds file length {file_len}")]
    LogCorruption {
        job_id: String,
        offset: u64,
        file_len: u64,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("unknown job: {0}")]
    UnknownJob(String),

    /// Job is not in a state that allows the requested operation
    #[error("job {job_id} is {state}: {reason}")]
    InvalidState {
        job_id: String,
        state: String,
        reason: String,
    },

    /// Transient transport failure after the session was established
    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl OrchestratorError {
    /// Whether a bounded retry loop may try again
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Unreachable { .. }
                | OrchestratorError::Timeout { .. }
                | OrchestratorError::Transport(_)
        )
    }

    /// Conditions that are reported once and never retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OrchestratorError::Auth { .. } | OrchestratorError::InvalidConfig(_)
        )
    }
}

/// Format an identity-file permission problem with a fix
pub fn key_permission_error(path: &Path, mode: u32) -> String {
    format!(
        "Identity file {} has permissions {:o}; it must be readable by its owner only\n\n\
        \x1b[1;32mTry:\x1b[0m\n\
        \x1b[36mchmod 600 {}\x1b[0m",
        path.display(),
        mode & 0o777,
        path.display()
    )
}

/// Format an unreachable-host error with the usual suspects
pub fn unreachable_host_error(host: &str) -> String {
    format!(
        "Could not reach {}\n\n\
        \x1b[1;33mPossible causes:\x1b[0m\n\
        • SSH_HOSTNAME or SSH_PORT is wrong\n\
        • The GPU instance is powered off\n\
        • A firewall blocks the SSH port\n\n\
        \x1b[1;32mTry:\x1b[0m\n\
        1. Check connectivity:\n\
           \x1b[36mremote-trainer check\x1b[0m\n\n\
        2. Connect manually:\n\
           \x1b[36mssh -i $SSH_KEY_FILENAME $SSH_USERNAME@{}\x1b[0m",
        host, host
    )
}

/// Wrap a generic error with a suggestion
pub fn wrap_error_with_suggestion(error: impl fmt::Display, suggestion: &str) -> String {
    format!("{}\n\n\x1b[1;33mSuggestion:\x1b[0m {}", error, suggestion)
}

/// Pick a user-facing hint for an orchestrator error, if one applies
pub fn suggestion_for(error: &OrchestratorError) -> Option<String> {
    match error {
        OrchestratorError::Unreachable { target, .. } => Some(unreachable_host_error(target)),
        OrchestratorError::Auth { .. } => Some(wrap_error_with_suggestion(
            error,
            "Check SSH_USERNAME and SSH_KEY_FILENAME, and that the public key is in the remote authorized_keys",
        )),
        OrchestratorError::Timeout { .. } => Some(wrap_error_with_suggestion(
            error,
            "Raise [connection] connect_timeout_secs in ~/.remote-trainer/config.toml",
        )),
        OrchestratorError::LogCorruption { .. } => Some(wrap_error_with_suggestion(
            error,
            "Re-run `remote-trainer logs <job> --offset 0` to read the rotated log from the start",
        )),
        _ => None,
    }
}
