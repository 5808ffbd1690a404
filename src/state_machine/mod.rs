mod job;
mod plan;
mod records;
mod state;

pub use job::{AuditRecord, Job, JobType, NewJob, StageSummary};
pub use plan::{DecompositionPlan, SubTask};
pub(crate) use plan::has_cycle;
pub use records::{QueueStatus, RemediationAttempt, StageExecution, SubJobQueueEntry};
pub use state::{EntryStatus, JobStatus, RemediationStatus, StageStatus};
