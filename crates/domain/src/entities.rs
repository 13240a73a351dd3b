mod job_def;
mod job_run;
mod job_task;
mod stats;

pub use job_def::{JobDef, JobTimeouts, Schedule, TIMEOUT_LONG};
pub use job_run::{CancellationReason, JobRun, RunState};
pub use job_task::{JobTask, TaskAttempt, TaskState};
pub use stats::JobRunStats;
