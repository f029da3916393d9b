//! Maps an incoming or retried job to its group.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::Result;
use crate::model::{GroupKey, Job, JobStatus};
use crate::store::JobStore;

/// How [`GroupResolver::enqueue`] placed a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// The job joined (or rejoined) the open group for its key.
    Queued,
    /// The job left a closed group for a fresh one under the same key. The
    /// vacated group may now be finished and wants re-settling.
    Regrouped { vacated: Uuid },
    /// The stored record settled between the caller's scan and here;
    /// nothing was queued.
    Skipped,
}

pub struct GroupResolver {
    store: Arc<dyn JobStore>,
}

impl GroupResolver {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Places `job` in the open group for its grouping key, creating the
    /// group if none exists, and moves the job to `Queued`.
    ///
    /// Also used to re-queue a retried job: if its original group is still
    /// open it simply rejoins, otherwise it lands in a fresh group under the
    /// same key and is dropped from the old group's membership.
    pub async fn enqueue(&self, job: &mut Job) -> Result<Placement> {
        let key = GroupKey {
            org_id: job.spec.org_id.clone(),
            app_version_id: job.spec.app_version_id.clone(),
            target: job.spec.target,
        };

        let group = self.store.find_or_create_group(&key).await?;

        // The stored record wins over the caller's snapshot: a cancel that
        // landed since the scan must not be queued back to life.
        match self.store.get_job(job.id).await? {
            Some(stored) if stored.is_settled() => {
                tracing::debug!(
                    job_id = %job.id,
                    status = %stored.status,
                    "Job settled since scan, leaving it alone"
                );
                return Ok(Placement::Skipped);
            }
            Some(_) => {}
            None => return Ok(Placement::Skipped),
        }

        let placement = match job.group_id {
            Some(previous) if previous == group.id => {
                tracing::info!(job_id = %job.id, group_id = %group.id, "Job rejoined its group");
                Placement::Queued
            }
            Some(previous) => {
                self.store.remove_job_from_group(previous, job.id).await?;
                self.store.add_job_to_group(group.id, job.id).await?;
                tracing::info!(
                    job_id = %job.id,
                    from = %previous,
                    to = %group.id,
                    "Job regrouped after its original group closed"
                );
                Placement::Regrouped { vacated: previous }
            }
            None => {
                self.store.add_job_to_group(group.id, job.id).await?;
                tracing::info!(job_id = %job.id, group_id = %group.id, "Job added to group");
                Placement::Queued
            }
        };

        job.group_id = Some(group.id);
        job.worker_id = None;
        job.status = JobStatus::Queued;
        job.next_attempt_at = None;
        job.touch();
        self.store.update_job(job).await?;

        Ok(placement)
    }
}
