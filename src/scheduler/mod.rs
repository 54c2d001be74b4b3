//! Job model, selection and the shared running-jobs record.

pub mod filter;
pub mod job;
pub mod phases;
pub mod running;

pub use filter::{filter_jobs, JobSelection};
pub use job::{
    FileListLookup, Invocation, Job, JobReport, JobRunMetadata, JobTiming, ReportUrl, RunResult,
    APP_PHASE,
};
pub use phases::PhaseGroupedJobs;
pub use running::{RunningJobGuard, RunningJobs, RunningSnapshot};
