pub mod group;
pub mod job;
pub mod worker;

pub use group::{GroupKey, GroupStatus, JobGroup};
pub use job::{Job, JobPriority, JobSpec, JobStatus, TargetClass};
pub use worker::{Worker, WorkerStatus};
