//! Wires the store, resolver, scheduler, retry controller, and health
//! monitor together, and exposes the operations the external HTTP/CLI layer
//! and the workers consume.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::model::{
    GroupStatus, Job, JobGroup, JobSpec, JobStatus, TargetClass, Worker, WorkerStatus,
};
use crate::scheduler::{GroupResolver, RetryController, Scheduler};
use crate::store::{JobFilter, JobStore, WorkerFilter};
use crate::worker::{HealthMonitor, WorkerRegistry};

/// Point-in-time counters, mainly for operator dashboards.
#[derive(Debug, Serialize)]
pub struct QueueStats {
    pub total_jobs: usize,
    pub pending: usize,
    pub queued: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total_groups: usize,
    pub total_workers: usize,
    pub idle_workers: usize,
    pub busy_workers: usize,
}

pub struct Orchestrator {
    store: Arc<dyn JobStore>,
    config: OrchestratorConfig,
    resolver: GroupResolver,
    scheduler: Scheduler,
    retry: RetryController,
    registry: WorkerRegistry,
    health: HealthMonitor,
}

impl Orchestrator {
    pub fn new(store: Arc<dyn JobStore>, config: OrchestratorConfig) -> Self {
        Self {
            resolver: GroupResolver::new(store.clone()),
            scheduler: Scheduler::new(store.clone()),
            retry: RetryController::new(store.clone(), config.backoff.clone()),
            registry: WorkerRegistry::new(store.clone()),
            health: HealthMonitor::new(
                store.clone(),
                config.worker_stale_after,
                config.worker_offline_after,
            ),
            store,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    // ------------------------------------------------------------------
    // Submission-side operations
    // ------------------------------------------------------------------

    /// Creates a job from `spec` and places it in its group. The job is
    /// briefly visible as pending before the grouping write lands; callers
    /// get it back already queued.
    pub async fn submit(&self, spec: JobSpec) -> Result<Job> {
        let mut job = Job::new(spec, self.config.default_max_retries);
        self.store.put_job(&job).await?;
        self.resolver.enqueue(&mut job).await?;
        tracing::info!(
            job_id = %job.id,
            org_id = %job.spec.org_id,
            app_version_id = %job.spec.app_version_id,
            target = %job.spec.target,
            priority = %job.spec.priority,
            "Job submitted"
        );
        Ok(job)
    }

    pub async fn job(&self, id: Uuid) -> Result<Job> {
        self.store
            .get_job(id)
            .await?
            .ok_or(OrchestratorError::JobNotFound(id))
    }

    pub async fn group(&self, id: Uuid) -> Result<JobGroup> {
        self.store
            .get_group(id)
            .await?
            .ok_or(OrchestratorError::GroupNotFound(id))
    }

    pub async fn worker(&self, id: Uuid) -> Result<Worker> {
        self.store
            .get_worker(id)
            .await?
            .ok_or(OrchestratorError::WorkerNotFound(id))
    }

    pub async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.store.list_jobs(filter).await
    }

    /// Cancels a job. From pending or queued this removes it from any future
    /// scheduling; while running it is advisory only (the external execution
    /// cannot be stopped, but further status reports are ignored); a job
    /// waiting out a retry backoff is dropped from future sweeps.
    pub async fn cancel_job(&self, id: Uuid) -> Result<Job> {
        let mut job = self.job(id).await?;
        if job.is_settled() {
            return Err(OrchestratorError::InvalidTransition {
                from: job.status,
                to: JobStatus::Cancelled,
            });
        }

        job.status = JobStatus::Cancelled;
        job.next_attempt_at = None;
        job.completed_at = Some(Utc::now());
        job.touch();
        self.store.update_job(&job).await?;
        tracing::info!(job_id = %job.id, "Job cancelled");

        if let Some(group_id) = job.group_id {
            self.settle_group(group_id).await?;
        }
        Ok(job)
    }

    // ------------------------------------------------------------------
    // Worker-side operations
    // ------------------------------------------------------------------

    pub async fn register_worker(
        &self,
        name: String,
        capabilities: HashSet<TargetClass>,
    ) -> Result<Worker> {
        self.registry.register(name, capabilities).await
    }

    pub async fn heartbeat(&self, worker_id: Uuid) -> Result<()> {
        self.registry.heartbeat(worker_id).await
    }

    /// Applies a worker's per-job status report.
    ///
    /// Workers may only report execution outcomes: running, completed, or
    /// failed. Queue movements (requeue on reclaim, cancellation) belong to
    /// the orchestrator's own passes and are rejected here even when the
    /// status machine would otherwise allow them.
    ///
    /// Idempotent: repeating a report with the job's current status is a
    /// no-op, and reports against a cancelled job are ignored rather than
    /// rejected. A failure report runs through the retry controller before
    /// it sticks.
    pub async fn report(
        &self,
        job_id: Uuid,
        status: JobStatus,
        result: Option<serde_json::Value>,
        error_message: Option<String>,
    ) -> Result<Job> {
        let mut job = self.job(job_id).await?;

        if !matches!(
            status,
            JobStatus::Running | JobStatus::Completed | JobStatus::Failed
        ) {
            return Err(OrchestratorError::InvalidTransition {
                from: job.status,
                to: status,
            });
        }
        if job.status == JobStatus::Cancelled || job.status == status {
            return Ok(job);
        }
        if !job.status.can_transition_to(status) {
            return Err(OrchestratorError::InvalidTransition {
                from: job.status,
                to: status,
            });
        }

        let now = Utc::now();
        match status {
            JobStatus::Running => {
                job.started_at.get_or_insert(now);
            }
            JobStatus::Completed => {
                job.result = result;
                job.completed_at = Some(now);
            }
            JobStatus::Failed => {
                job.result = result;
                job.error_message = error_message;
                if !self.retry.note_failure(&mut job) {
                    job.completed_at = Some(now);
                    tracing::warn!(
                        job_id = %job.id,
                        retries = job.retry_count,
                        "Job failed terminally, retries exhausted"
                    );
                }
            }
            _ => {}
        }
        job.status = status;
        job.touch();
        self.store.update_job(&job).await?;

        if let Some(group_id) = job.group_id {
            self.settle_group(group_id).await?;
        }
        Ok(job)
    }

    /// Recomputes a group's derived status and, once every member is
    /// settled, frees its worker for the next assignment.
    async fn settle_group(&self, group_id: Uuid) -> Result<()> {
        let Some(mut group) = self.store.get_group(group_id).await? else {
            return Ok(());
        };
        if matches!(group.status, GroupStatus::Completed | GroupStatus::Failed) {
            return Ok(());
        }

        let mut members = Vec::with_capacity(group.jobs.len());
        for job_id in &group.jobs {
            if let Some(job) = self.store.get_job(*job_id).await? {
                members.push(job);
            }
        }

        // The worker is done with this group once nothing is left queued or
        // running on it. Members merely waiting out a retry backoff will be
        // regrouped by the retry sweep, not re-dispatched here.
        let still_active = members.iter().any(|j| {
            matches!(
                j.status,
                JobStatus::Pending | JobStatus::Queued | JobStatus::Running
            )
        });
        if still_active {
            return Ok(());
        }

        let derived = group.derived_status(&members);
        if matches!(derived, GroupStatus::Completed | GroupStatus::Failed) {
            group.status = derived;
            self.store.update_group(&group).await?;
            tracing::info!(group_id = %group.id, status = %derived, "Group finished");
        }

        if let Some(worker_id) = group.assigned_worker {
            if let Some(mut worker) = self.store.get_worker(worker_id).await? {
                if worker.current_group == Some(group.id) {
                    worker.current_group = None;
                    worker.last_assignment_done = Some(Utc::now());
                    self.store.update_worker(&worker).await?;
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Background passes (also callable directly, which the tests do)
    // ------------------------------------------------------------------

    /// One scheduling pass; see [`Scheduler::tick`].
    pub async fn tick(&self) -> Result<usize> {
        self.scheduler.tick().await
    }

    /// Re-queues failed jobs whose backoff has elapsed.
    pub async fn retry_sweep(&self) -> Result<usize> {
        let report = self.retry.sweep(&self.resolver).await?;
        // A regrouped job may have been the last live member of its old
        // group; that group is finished now.
        for group_id in &report.vacated_groups {
            self.settle_group(*group_id).await?;
        }
        Ok(report.requeued)
    }

    /// Worker liveness pass plus the runtime limit on running jobs.
    pub async fn health_sweep(&self) -> Result<()> {
        self.health.sweep().await?;
        self.fail_timed_out_jobs().await
    }

    /// Fails running jobs that exceeded the configured wall-clock limit.
    /// Goes through the normal failure path, so such jobs still get their
    /// retries.
    async fn fail_timed_out_jobs(&self) -> Result<()> {
        let timeout = chrono::Duration::from_std(self.config.job_timeout)
            .unwrap_or_else(|_| chrono::Duration::max_value());
        let running = self
            .store
            .list_jobs(&JobFilter::status(JobStatus::Running))
            .await?;
        let now = Utc::now();

        for job in running {
            let Some(started) = job.started_at else {
                continue;
            };
            if now - started <= timeout {
                continue;
            }
            tracing::warn!(
                job_id = %job.id,
                running_secs = (now - started).num_seconds(),
                "Job exceeded execution timeout, failing it"
            );
            self.report(
                job.id,
                JobStatus::Failed,
                None,
                Some("Job execution timeout".to_string()),
            )
            .await?;
        }
        Ok(())
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        let jobs = self.store.list_jobs(&JobFilter::default()).await?;
        let groups = self
            .store
            .list_groups(&crate::store::GroupFilter::default())
            .await?;
        let workers = self.store.list_workers(&WorkerFilter::default()).await?;

        let count = |status: JobStatus| jobs.iter().filter(|j| j.status == status).count();
        let idle = workers
            .iter()
            .filter(|w| w.status == WorkerStatus::Active && w.current_group.is_none())
            .count();
        let busy = workers.iter().filter(|w| w.current_group.is_some()).count();

        Ok(QueueStats {
            total_jobs: jobs.len(),
            pending: count(JobStatus::Pending),
            queued: count(JobStatus::Queued),
            running: count(JobStatus::Running),
            completed: count(JobStatus::Completed),
            failed: count(JobStatus::Failed),
            cancelled: count(JobStatus::Cancelled),
            total_groups: groups.len(),
            total_workers: workers.len(),
            idle_workers: idle,
            busy_workers: busy,
        })
    }

    /// Spawns the scheduling tick, retry sweep, and health sweep as
    /// independent periodic tasks. Each stops when `token` is cancelled; a
    /// failed pass is logged and retried on the next interval.
    pub fn spawn_background_loops(self: Arc<Self>, token: CancellationToken) {
        let orchestrator = self.clone();
        let tick_token = token.clone();
        let mut tick_interval = tokio::time::interval(self.config.schedule_interval);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tick_token.cancelled() => break,
                    _ = tick_interval.tick() => {
                        if let Err(e) = orchestrator.tick().await {
                            tracing::error!(error = %e, "Scheduling tick failed");
                        }
                    }
                }
            }
        });

        let orchestrator = self.clone();
        let retry_token = token.clone();
        let mut retry_interval = tokio::time::interval(self.config.retry_sweep_interval);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = retry_token.cancelled() => break,
                    _ = retry_interval.tick() => {
                        if let Err(e) = orchestrator.retry_sweep().await {
                            tracing::error!(error = %e, "Retry sweep failed");
                        }
                    }
                }
            }
        });

        let orchestrator = self.clone();
        let health_token = token;
        let mut health_interval = tokio::time::interval(self.config.health_sweep_interval);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = health_token.cancelled() => break,
                    _ = health_interval.tick() => {
                        if let Err(e) = orchestrator.health_sweep().await {
                            tracing::error!(error = %e, "Health sweep failed");
                        }
                    }
                }
            }
        });
    }
}
