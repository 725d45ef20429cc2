// Job model: specs, handles, lifecycle state, persistence

mod handle;
mod registry;
mod spec;

pub use handle::{JobHandle, JobId, JobState, JobStatus, ProcessReport, StrategyKind};
pub use registry::{JobRecord, JobRegistry};
pub use spec::{JobSpec, ResourceHints, TrainingParams, MAX_BATCH_SIZE, MAX_EPOCHS};
