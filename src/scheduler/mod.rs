//! Scheduling engine: grouping, dispatch ordering, worker matching, retries.
//!
//! - [`GroupResolver`]: maps a job to its open group, creating one atomically
//! - [`queue`]: priority-then-arrival ordering of jobs inside a group
//! - [`Scheduler`]: the periodic tick that closes groups onto idle workers
//! - [`RetryController`]: exponential backoff for failed jobs
//!
//! None of these hold state across ticks; the store is the source of truth.

pub mod assigner;
pub mod queue;
pub mod resolver;
pub mod retry;

pub use assigner::Scheduler;
pub use resolver::{GroupResolver, Placement};
pub use retry::RetryController;
