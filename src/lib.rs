// remote-trainer - Remote training orchestrator
// Library exports

pub mod config;
pub mod connection; // SSH session pool
pub mod errors;
pub mod job; // Job specs, handles, registry
pub mod logs; // Log streaming with resumable cursors
pub mod process; // Local process helpers
pub mod strategy; // Local/remote execution strategies
pub mod supervisor; // Detached remote process supervision
pub mod sync; // Workspace mirroring

pub use errors::{OrchestratorError, OrchestratorResult};
pub use job::{JobHandle, JobId, JobSpec, JobState, JobStatus, StrategyKind, TrainingParams};
pub use logs::{LogCursor, LogEvent, LogLine, LogStream};
pub use strategy::{ExecutionStrategy, Orchestrator};
