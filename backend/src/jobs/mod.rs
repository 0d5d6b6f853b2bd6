// Background jobs: scheduled rollups and raw event cleanup

pub mod rollups;
pub mod scheduler;

pub use rollups::{RollupJob, RollupOutcome};
pub use scheduler::{JobConfig, JobError, JobExecutionLog, JobResult, JobScheduler, JobStatus};
