//! Volatile in-process backend. All state lives behind one `RwLock`, which
//! also makes `find_or_create_group` and `try_assign_worker` trivially
//! linearizable.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::model::{GroupKey, GroupStatus, Job, JobGroup, JobStatus, Worker};
use crate::store::{GroupFilter, JobFilter, JobStore, WorkerFilter};

#[derive(Default)]
struct Inner {
    jobs: HashMap<Uuid, Job>,
    groups: HashMap<Uuid, JobGroup>,
    workers: HashMap<Uuid, Worker>,
    /// Grouping key -> id of the one open group for that key.
    open_groups: HashMap<GroupKey, Uuid>,
    // Secondary indices so list filters do not scan the whole table.
    jobs_by_org: HashMap<String, HashSet<Uuid>>,
    jobs_by_build: HashMap<String, HashSet<Uuid>>,
    jobs_by_status: HashMap<JobStatus, HashSet<Uuid>>,
    groups_by_status: HashMap<GroupStatus, HashSet<Uuid>>,
}

impl Inner {
    fn index_job(&mut self, job: &Job) {
        self.jobs_by_org
            .entry(job.spec.org_id.clone())
            .or_default()
            .insert(job.id);
        self.jobs_by_build
            .entry(job.spec.app_version_id.clone())
            .or_default()
            .insert(job.id);
        self.jobs_by_status
            .entry(job.status)
            .or_default()
            .insert(job.id);
    }

    fn unindex_job_status(&mut self, status: JobStatus, id: Uuid) {
        if let Some(ids) = self.jobs_by_status.get_mut(&status) {
            ids.remove(&id);
        }
    }

    fn sync_group_marker(&mut self, old_status: Option<GroupStatus>, group: &JobGroup) {
        if let Some(status) = old_status {
            if let Some(ids) = self.groups_by_status.get_mut(&status) {
                ids.remove(&group.id);
            }
        }
        self.groups_by_status
            .entry(group.status)
            .or_default()
            .insert(group.id);

        if group.is_open() {
            self.open_groups.entry(group.key.clone()).or_insert(group.id);
        } else if self.open_groups.get(&group.key) == Some(&group.id) {
            self.open_groups.remove(&group.key);
        }
    }
}

pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn put_job(&self, job: &Job) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.index_job(job);
        inner.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        Ok(self.inner.read().await.jobs.get(&id).cloned())
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(old) = inner.jobs.get(&job.id).map(|j| j.status) {
            if old != job.status {
                inner.unindex_job_status(old, job.id);
            }
        }
        inner.index_job(job);
        inner.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let inner = self.inner.read().await;
        // Narrow by the most selective index available, then apply the rest
        // of the filter in memory.
        let candidates: Vec<Uuid> = if let Some(status) = filter.status {
            inner
                .jobs_by_status
                .get(&status)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default()
        } else if let Some(ref org) = filter.org_id {
            inner
                .jobs_by_org
                .get(org)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default()
        } else if let Some(ref build) = filter.app_version_id {
            inner
                .jobs_by_build
                .get(build)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default()
        } else {
            inner.jobs.keys().copied().collect()
        };

        let mut jobs: Vec<Job> = candidates
            .into_iter()
            .filter_map(|id| inner.jobs.get(&id))
            .filter(|j| filter.matches(j))
            .cloned()
            .collect();
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn get_group(&self, id: Uuid) -> Result<Option<JobGroup>> {
        Ok(self.inner.read().await.groups.get(&id).cloned())
    }

    async fn update_group(&self, group: &JobGroup) -> Result<()> {
        let mut inner = self.inner.write().await;
        let old_status = inner.groups.get(&group.id).map(|g| g.status);
        inner.sync_group_marker(old_status, group);
        inner.groups.insert(group.id, group.clone());
        Ok(())
    }

    async fn list_groups(&self, filter: &GroupFilter) -> Result<Vec<JobGroup>> {
        let inner = self.inner.read().await;
        let candidates: Vec<Uuid> = if let Some(status) = filter.status {
            inner
                .groups_by_status
                .get(&status)
                .map(|s| s.iter().copied().collect())
                .unwrap_or_default()
        } else {
            inner.groups.keys().copied().collect()
        };

        let mut groups: Vec<JobGroup> = candidates
            .into_iter()
            .filter_map(|id| inner.groups.get(&id))
            .filter(|g| filter.matches(g))
            .cloned()
            .collect();
        groups.sort_by_key(|g| g.created_at);
        Ok(groups)
    }

    async fn find_or_create_group(&self, key: &GroupKey) -> Result<JobGroup> {
        let mut inner = self.inner.write().await;
        if let Some(id) = inner.open_groups.get(key).copied() {
            if let Some(group) = inner.groups.get(&id) {
                if group.is_open() {
                    return Ok(group.clone());
                }
            }
            // Marker pointed at a group that already closed; drop it and
            // create a fresh one below.
            inner.open_groups.remove(key);
        }

        let group = JobGroup::new(key.clone());
        inner.open_groups.insert(key.clone(), group.id);
        inner
            .groups_by_status
            .entry(group.status)
            .or_default()
            .insert(group.id);
        inner.groups.insert(group.id, group.clone());
        tracing::info!(group_id = %group.id, key = %key, "Created new job group");
        Ok(group)
    }

    async fn add_job_to_group(&self, group_id: Uuid, job_id: Uuid) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.groups.get_mut(&group_id) {
            Some(group) => {
                if !group.jobs.contains(&job_id) {
                    group.jobs.push(job_id);
                }
                Ok(())
            }
            None => Err(OrchestratorError::GroupNotFound(group_id)),
        }
    }

    async fn remove_job_from_group(&self, group_id: Uuid, job_id: Uuid) -> Result<()> {
        let mut inner = self.inner.write().await;
        if let Some(group) = inner.groups.get_mut(&group_id) {
            group.jobs.retain(|id| *id != job_id);
        }
        Ok(())
    }

    async fn put_worker(&self, worker: &Worker) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.workers.insert(worker.id, worker.clone());
        Ok(())
    }

    async fn get_worker(&self, id: Uuid) -> Result<Option<Worker>> {
        Ok(self.inner.read().await.workers.get(&id).cloned())
    }

    async fn update_worker(&self, worker: &Worker) -> Result<()> {
        let mut inner = self.inner.write().await;
        inner.workers.insert(worker.id, worker.clone());
        Ok(())
    }

    async fn list_workers(&self, filter: &WorkerFilter) -> Result<Vec<Worker>> {
        let inner = self.inner.read().await;
        let mut workers: Vec<Worker> = inner
            .workers
            .values()
            .filter(|w| filter.matches(w))
            .cloned()
            .collect();
        workers.sort_by_key(|w| w.registered_at);
        Ok(workers)
    }

    async fn try_assign_worker(&self, worker_id: Uuid, group_id: Uuid) -> Result<bool> {
        let mut inner = self.inner.write().await;
        match inner.workers.get_mut(&worker_id) {
            Some(worker) if worker.is_idle() => {
                worker.current_group = Some(group_id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
