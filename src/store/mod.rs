//! Storage abstraction for jobs, groups, and workers.
//!
//! The store is the single source of truth: the scheduler, retry sweep, and
//! health monitor all go through it and keep no state between ticks. Two
//! backends implement the same contract:
//!
//! - [`MemoryStore`]: process-lifetime maps behind a `tokio::sync::RwLock`,
//!   used when no persistent backend is reachable at startup
//! - [`RedisStore`]: JSON records plus index sets in Redis, durable across
//!   restarts and visible to other processes
//!
//! Mutations are atomic per entity only. There is no cross-entity
//! transaction: a job's `group_id` may become visible before the group's
//! membership list catches up, and callers tolerate that.

pub mod memory;
pub mod redis;

use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::Result;
use crate::model::{
    GroupKey, GroupStatus, Job, JobGroup, JobStatus, TargetClass, Worker, WorkerStatus,
};

pub use memory::MemoryStore;
pub use redis::RedisStore;

/// Filters for `list_jobs`. All fields are conjunctive; `None` matches all.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub org_id: Option<String>,
    pub status: Option<JobStatus>,
    pub app_version_id: Option<String>,
}

impl JobFilter {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        if let Some(ref org) = self.org_id {
            if &job.spec.org_id != org {
                return false;
            }
        }
        if let Some(status) = self.status {
            if job.status != status {
                return false;
            }
        }
        if let Some(ref build) = self.app_version_id {
            if &job.spec.app_version_id != build {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct GroupFilter {
    pub org_id: Option<String>,
    pub status: Option<GroupStatus>,
}

impl GroupFilter {
    pub fn status(status: GroupStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn matches(&self, group: &JobGroup) -> bool {
        if let Some(ref org) = self.org_id {
            if &group.key.org_id != org {
                return false;
            }
        }
        if let Some(status) = self.status {
            if group.status != status {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkerFilter {
    pub status: Option<WorkerStatus>,
    pub target: Option<TargetClass>,
}

impl WorkerFilter {
    pub fn matches(&self, worker: &Worker) -> bool {
        if let Some(status) = self.status {
            if worker.status != status {
                return false;
            }
        }
        if let Some(target) = self.target {
            if !worker.can_serve(target) {
                return false;
            }
        }
        true
    }
}

/// Keyed storage for the three entity types.
///
/// `find_or_create_group` and `try_assign_worker` are the two operations that
/// need an atomicity guard: group creation must not race into duplicates, and
/// a worker must never hold two groups. Everything else is an independently
/// atomic single-record read or write.
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn put_job(&self, job: &Job) -> Result<()>;
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>>;
    async fn update_job(&self, job: &Job) -> Result<()>;
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    async fn get_group(&self, id: Uuid) -> Result<Option<JobGroup>>;
    /// Updates the record and keeps the per-key open marker in sync: the
    /// marker is released when the group leaves `Open` and re-established
    /// (if vacant) when a reclaim reopens it.
    async fn update_group(&self, group: &JobGroup) -> Result<()>;
    async fn list_groups(&self, filter: &GroupFilter) -> Result<Vec<JobGroup>>;
    /// Returns the open group for `key`, creating one atomically if none
    /// exists. Two concurrent calls with the same new key observe the same
    /// group.
    async fn find_or_create_group(&self, key: &GroupKey) -> Result<JobGroup>;
    /// Appends a member in place so concurrent submitters never overwrite
    /// each other's membership writes.
    async fn add_job_to_group(&self, group_id: Uuid, job_id: Uuid) -> Result<()>;
    /// Drops a member, used when a retried job is regrouped.
    async fn remove_job_from_group(&self, group_id: Uuid, job_id: Uuid) -> Result<()>;

    async fn put_worker(&self, worker: &Worker) -> Result<()>;
    async fn get_worker(&self, id: Uuid) -> Result<Option<Worker>>;
    async fn update_worker(&self, worker: &Worker) -> Result<()>;
    async fn list_workers(&self, filter: &WorkerFilter) -> Result<Vec<Worker>>;
    /// Compare-and-set claim: succeeds only if the worker currently holds no
    /// assignment, and records `group_id` as its assignment.
    async fn try_assign_worker(&self, worker_id: Uuid, group_id: Uuid) -> Result<bool>;

    fn backend_name(&self) -> &'static str;
}

/// Selects the storage backend once at startup.
///
/// A configured but unreachable Redis is a degradation, not a fatal error:
/// the process runs on the volatile store for this run and says so in the
/// logs. There is no live failover later.
pub async fn select_backend(config: &StoreConfig) -> Arc<dyn JobStore> {
    if let Some(url) = &config.redis_url {
        match RedisStore::connect(url).await {
            Ok(store) => {
                tracing::info!(url = %url, "Connected to Redis store");
                return Arc::new(store);
            }
            Err(e) => {
                tracing::warn!(
                    url = %url,
                    error = %e,
                    "Redis unreachable, falling back to in-memory store for this run"
                );
            }
        }
    }
    Arc::new(MemoryStore::new())
}
