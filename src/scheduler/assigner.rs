//! The scheduling tick: matches open groups to eligible idle workers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::Result;
use crate::model::{GroupStatus, Job, JobGroup, JobStatus, Worker, WorkerStatus};
use crate::scheduler::queue;
use crate::store::{GroupFilter, JobStore, WorkerFilter};

pub struct Scheduler {
    store: Arc<dyn JobStore>,
}

impl Scheduler {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// One scheduling pass. Scans open groups with at least one queued
    /// member, most urgent group first, and closes each onto a worker when
    /// one is eligible. Groups that cannot be placed are simply left for the
    /// next tick. Returns the number of assignments made.
    pub async fn tick(&self) -> Result<usize> {
        let open = self
            .store
            .list_groups(&GroupFilter::status(GroupStatus::Open))
            .await?;

        let mut ready: Vec<(JobGroup, Vec<Job>)> = Vec::new();
        for group in open {
            let queued = self.queued_members(&group).await?;
            if !queued.is_empty() {
                ready.push((group, queued));
            }
        }
        ready.sort_by(|a, b| queue::group_priority(&b.1).cmp(&queue::group_priority(&a.1)));

        let mut assigned = 0;
        for (group, queued) in ready {
            if self.try_place(group, queued).await? {
                assigned += 1;
            }
        }
        Ok(assigned)
    }

    async fn queued_members(&self, group: &JobGroup) -> Result<Vec<Job>> {
        let mut queued = Vec::new();
        for job_id in &group.jobs {
            if let Some(job) = self.store.get_job(*job_id).await? {
                if job.status == JobStatus::Queued {
                    queued.push(job);
                }
            }
        }
        Ok(queued)
    }

    /// Closes `group` onto one eligible worker and dispatches its queued
    /// jobs, as a single logical step guarded by the worker-claim CAS. No
    /// eligible worker is a waiting condition, not an error.
    async fn try_place(&self, mut group: JobGroup, mut queued: Vec<Job>) -> Result<bool> {
        let candidates = self
            .store
            .list_workers(&WorkerFilter {
                status: Some(WorkerStatus::Active),
                target: Some(group.key.target),
            })
            .await?;

        let mut idle: Vec<Worker> = candidates.into_iter().filter(|w| w.is_idle()).collect();
        if idle.is_empty() {
            tracing::debug!(
                group_id = %group.id,
                target = %group.key.target,
                "No eligible worker, group stays queued"
            );
            return Ok(false);
        }
        // Least-recently-used first; a worker that never ran anything sorts
        // ahead of all others.
        idle.sort_by_key(|w| {
            w.last_assignment_done
                .unwrap_or(DateTime::<Utc>::MIN_UTC)
        });

        for worker in idle {
            if !self.store.try_assign_worker(worker.id, group.id).await? {
                // Lost the claim to a concurrent assignment; try the next.
                continue;
            }
            if self.dispatch(&mut group, &mut queued, worker.id).await? > 0 {
                return Ok(true);
            }
            // Everything queued at scan time settled under us; give the
            // claim back and leave the group open.
            self.release_claim(worker.id, group.id).await?;
            return Ok(false);
        }
        Ok(false)
    }

    /// Closes the group and releases its queued members to the worker.
    /// Each member is re-read from the store first: a cancel or a late
    /// report landing since the scan means that member no longer ships, and
    /// its stored record must not be overwritten. Returns the number of
    /// jobs actually dispatched; zero means the group was left untouched.
    async fn dispatch(
        &self,
        group: &mut JobGroup,
        queued: &mut Vec<Job>,
        worker_id: Uuid,
    ) -> Result<usize> {
        let mut confirmed = Vec::with_capacity(queued.len());
        for job in queued.drain(..) {
            match self.store.get_job(job.id).await? {
                Some(current) if current.status == JobStatus::Queued => confirmed.push(current),
                Some(current) => {
                    tracing::debug!(
                        job_id = %current.id,
                        status = %current.status,
                        "Member changed since scan, not dispatching it"
                    );
                }
                None => {}
            }
        }
        if confirmed.is_empty() {
            return Ok(0);
        }

        group.status = GroupStatus::Assigned;
        group.assigned_worker = Some(worker_id);
        self.store.update_group(group).await?;

        queue::dispatch_order(&mut confirmed);
        let now = Utc::now();
        for job in confirmed.iter_mut() {
            job.status = JobStatus::Running;
            job.worker_id = Some(worker_id);
            job.started_at = Some(now);
            job.touch();
            self.store.update_job(job).await?;
        }

        tracing::info!(
            group_id = %group.id,
            worker_id = %worker_id,
            jobs = confirmed.len(),
            key = %group.key,
            "Assigned group to worker"
        );
        Ok(confirmed.len())
    }

    async fn release_claim(&self, worker_id: Uuid, group_id: Uuid) -> Result<()> {
        if let Some(mut worker) = self.store.get_worker(worker_id).await? {
            if worker.current_group == Some(group_id) {
                worker.current_group = None;
                self.store.update_worker(&worker).await?;
            }
        }
        Ok(())
    }
}
