//! Liveness sweep and crash recovery.
//!
//! A worker that stops heartbeating goes stale first, then offline. Going
//! offline reclaims its assignment: every non-terminal job of its group is
//! reset to queued with the worker id cleared, and the group reopens so the
//! scheduler can place it elsewhere on the next tick. The sweep is
//! idempotent: once the assignment is cleared there is nothing left to
//! reclaim.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::error::Result;
use crate::model::{GroupStatus, JobStatus, Worker, WorkerStatus};
use crate::store::{JobStore, WorkerFilter};

pub struct HealthMonitor {
    store: Arc<dyn JobStore>,
    stale_after: chrono::Duration,
    offline_after: chrono::Duration,
}

impl HealthMonitor {
    pub fn new(store: Arc<dyn JobStore>, stale_after: Duration, offline_after: Duration) -> Self {
        Self {
            store,
            stale_after: chrono::Duration::from_std(stale_after)
                .unwrap_or_else(|_| chrono::Duration::max_value()),
            offline_after: chrono::Duration::from_std(offline_after)
                .unwrap_or_else(|_| chrono::Duration::max_value()),
        }
    }

    /// One bounded pass over all workers. Returns the number of workers
    /// newly marked offline.
    pub async fn sweep(&self) -> Result<usize> {
        let workers = self.store.list_workers(&WorkerFilter::default()).await?;
        let now = Utc::now();

        let mut marked_offline = 0;
        for mut worker in workers {
            let age = worker.heartbeat_age(now);
            if age > self.offline_after {
                if worker.status != WorkerStatus::Offline || worker.current_group.is_some() {
                    tracing::warn!(
                        worker_id = %worker.id,
                        silence_secs = age.num_seconds(),
                        "Worker missed offline threshold, reclaiming its work"
                    );
                    worker.status = WorkerStatus::Offline;
                    self.reclaim(&mut worker).await?;
                    self.store.update_worker(&worker).await?;
                    marked_offline += 1;
                }
            } else if age > self.stale_after && worker.status == WorkerStatus::Active {
                tracing::warn!(
                    worker_id = %worker.id,
                    silence_secs = age.num_seconds(),
                    "Worker heartbeat overdue, marking stale"
                );
                worker.status = WorkerStatus::Stale;
                self.store.update_worker(&worker).await?;
            }
        }
        Ok(marked_offline)
    }

    /// Frees the worker's assignment and puts its in-flight jobs back in the
    /// queue. Guarded by `current_group`: a second sweep finds nothing to do.
    async fn reclaim(&self, worker: &mut Worker) -> Result<()> {
        let Some(group_id) = worker.current_group.take() else {
            return Ok(());
        };

        let Some(mut group) = self.store.get_group(group_id).await? else {
            return Ok(());
        };

        let mut reclaimed = 0;
        for job_id in group.jobs.clone() {
            let Some(mut job) = self.store.get_job(job_id).await? else {
                continue;
            };
            if matches!(job.status, JobStatus::Queued | JobStatus::Running) {
                job.status = JobStatus::Queued;
                job.worker_id = None;
                job.started_at = None;
                job.touch();
                self.store.update_job(&job).await?;
                reclaimed += 1;
            }
        }

        group.status = GroupStatus::Open;
        group.assigned_worker = None;
        self.store.update_group(&group).await?;

        tracing::info!(
            worker_id = %worker.id,
            group_id = %group_id,
            jobs = reclaimed,
            "Reclaimed group from dead worker"
        );
        Ok(())
    }
}
