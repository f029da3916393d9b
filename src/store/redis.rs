//! Redis-backed persistent store.
//!
//! Records are JSON strings under `job:{id}` / `group:{id}` / `worker:{id}`.
//! Index sets (`idx:jobs:org:{org}`, `idx:jobs:build:{build}`,
//! `idx:jobs:status:{status}`, `idx:groups:status:{status}`) are written in a
//! pipeline with the primary record. Index writes are best effort: a failed
//! index update after a successful record write is a recoverable
//! inconsistency, not a reason to abort.
//!
//! Two small marker keys carry the atomicity guards: `open:{key}` (SET NX)
//! maps a grouping key to its one open group, and `assign:{worker}` (SET NX)
//! makes the worker-claim a compare-and-set. Job status changes are published
//! on `testmux:events` so other processes can watch in real time.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::model::{GroupKey, Job, JobGroup, JobStatus, Worker};
use crate::store::{GroupFilter, JobFilter, JobStore, WorkerFilter};

const EVENTS_CHANNEL: &str = "testmux:events";

pub struct RedisStore {
    conn: ConnectionManager,
}

fn job_key(id: Uuid) -> String {
    format!("job:{id}")
}

fn group_key_record(id: Uuid) -> String {
    format!("group:{id}")
}

fn worker_key(id: Uuid) -> String {
    format!("worker:{id}")
}

fn open_marker(key: &GroupKey) -> String {
    format!("open:{}:{}:{}", key.org_id, key.app_version_id, key.target)
}

fn assign_marker(worker_id: Uuid) -> String {
    format!("assign:{worker_id}")
}

fn job_status_idx(status: JobStatus) -> String {
    format!("idx:jobs:status:{status}")
}

impl RedisStore {
    /// Connects and verifies the server with a PING. Failure here is what
    /// triggers the startup fallback to the in-memory store.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let mut conn = client.get_connection_manager().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(Self { conn })
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.conn();
        let raw: Option<String> = conn.get(key).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn fetch_jobs(&self, ids: Vec<String>, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.fetch_json::<Job>(&format!("job:{id}")).await? {
                if filter.matches(&job) {
                    jobs.push(job);
                }
            }
        }
        jobs.sort_by_key(|j| j.created_at);
        Ok(jobs)
    }

    async fn publish_job_event(&self, job: &Job) {
        let payload = serde_json::json!({
            "job_id": job.id,
            "status": job.status,
            "group_id": job.group_id,
            "worker_id": job.worker_id,
        })
        .to_string();
        let mut conn = self.conn();
        // Observability only; a lost event never affects correctness.
        if let Err(e) = conn.publish::<_, _, ()>(EVENTS_CHANNEL, payload).await {
            tracing::debug!(job_id = %job.id, error = %e, "Failed to publish job event");
        }
    }
}

#[async_trait]
impl JobStore for RedisStore {
    async fn put_job(&self, job: &Job) -> Result<()> {
        let json = serde_json::to_string(job)?;
        let mut conn = self.conn();
        redis::pipe()
            .set(job_key(job.id), json)
            .sadd("jobs", job.id.to_string())
            .sadd(
                format!("idx:jobs:org:{}", job.spec.org_id),
                job.id.to_string(),
            )
            .sadd(
                format!("idx:jobs:build:{}", job.spec.app_version_id),
                job.id.to_string(),
            )
            .sadd(job_status_idx(job.status), job.id.to_string())
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        self.fetch_json(&job_key(id)).await
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        let old_status = self.get_job(job.id).await?.map(|j| j.status);
        let json = serde_json::to_string(job)?;
        let mut conn = self.conn();

        let mut pipe = redis::pipe();
        pipe.set(job_key(job.id), json);
        if let Some(old) = old_status {
            if old != job.status {
                pipe.srem(job_status_idx(old), job.id.to_string());
                pipe.sadd(job_status_idx(job.status), job.id.to_string());
            }
        }
        pipe.query_async::<()>(&mut conn).await?;

        if old_status != Some(job.status) {
            self.publish_job_event(job).await;
        }
        Ok(())
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let mut conn = self.conn();
        // Narrow by the most selective index, finish filtering in memory.
        let ids: Vec<String> = if let Some(status) = filter.status {
            conn.smembers(job_status_idx(status)).await?
        } else if let Some(ref org) = filter.org_id {
            conn.smembers(format!("idx:jobs:org:{org}")).await?
        } else if let Some(ref build) = filter.app_version_id {
            conn.smembers(format!("idx:jobs:build:{build}")).await?
        } else {
            conn.smembers("jobs").await?
        };
        self.fetch_jobs(ids, filter).await
    }

    async fn get_group(&self, id: Uuid) -> Result<Option<JobGroup>> {
        self.fetch_json(&group_key_record(id)).await
    }

    async fn update_group(&self, group: &JobGroup) -> Result<()> {
        let old_status = self.get_group(group.id).await?.map(|g| g.status);
        let json = serde_json::to_string(group)?;
        let mut conn = self.conn();

        let mut pipe = redis::pipe();
        pipe.set(group_key_record(group.id), json);
        if let Some(old) = old_status {
            if old != group.status {
                pipe.srem(format!("idx:groups:status:{old}"), group.id.to_string());
                pipe.sadd(
                    format!("idx:groups:status:{}", group.status),
                    group.id.to_string(),
                );
            }
        }
        pipe.query_async::<()>(&mut conn).await?;

        let marker = open_marker(&group.key);
        if group.is_open() {
            let _: bool = conn.set_nx(marker, group.id.to_string()).await?;
        } else {
            let current: Option<String> = conn.get(&marker).await?;
            if current.as_deref() == Some(&group.id.to_string()) {
                let _: () = conn.del(marker).await?;
            }
        }
        Ok(())
    }

    async fn list_groups(&self, filter: &GroupFilter) -> Result<Vec<JobGroup>> {
        let mut conn = self.conn();
        let ids: Vec<String> = if let Some(status) = filter.status {
            conn.smembers(format!("idx:groups:status:{status}")).await?
        } else {
            conn.smembers("groups").await?
        };

        let mut groups = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(group) = self.fetch_json::<JobGroup>(&format!("group:{id}")).await? {
                if filter.matches(&group) {
                    groups.push(group);
                }
            }
        }
        groups.sort_by_key(|g| g.created_at);
        Ok(groups)
    }

    async fn find_or_create_group(&self, key: &GroupKey) -> Result<JobGroup> {
        let marker = open_marker(key);
        let mut conn = self.conn();

        // SET NX decides the race; the loser reads the winner's group id.
        for _ in 0..3 {
            let existing: Option<String> = conn.get(&marker).await?;
            if let Some(id_str) = existing {
                if let Ok(id) = id_str.parse::<Uuid>() {
                    if let Some(group) = self.get_group(id).await? {
                        if group.is_open() {
                            return Ok(group);
                        }
                    }
                }
                // Marker points at a group that already closed.
                let _: () = conn.del(&marker).await?;
            }

            let group = JobGroup::new(key.clone());
            let claimed: bool = conn.set_nx(&marker, group.id.to_string()).await?;
            if claimed {
                let json = serde_json::to_string(&group)?;
                redis::pipe()
                    .set(group_key_record(group.id), json)
                    .sadd("groups", group.id.to_string())
                    .sadd(
                        format!("idx:groups:status:{}", group.status),
                        group.id.to_string(),
                    )
                    .query_async::<()>(&mut conn)
                    .await?;
                tracing::info!(group_id = %group.id, key = %key, "Created new job group");
                return Ok(group);
            }
        }
        Err(OrchestratorError::Backend(format!(
            "gave up creating group for key {key} under contention"
        )))
    }

    async fn add_job_to_group(&self, group_id: Uuid, job_id: Uuid) -> Result<()> {
        // Read-modify-write of the record. Fine under a single scheduling
        // authority; multi-process deployments serialize submissions through
        // the open-group marker before reaching here.
        let mut group = self
            .get_group(group_id)
            .await?
            .ok_or(OrchestratorError::GroupNotFound(group_id))?;
        if !group.jobs.contains(&job_id) {
            group.jobs.push(job_id);
            self.update_group(&group).await?;
        }
        Ok(())
    }

    async fn remove_job_from_group(&self, group_id: Uuid, job_id: Uuid) -> Result<()> {
        if let Some(mut group) = self.get_group(group_id).await? {
            if group.jobs.contains(&job_id) {
                group.jobs.retain(|id| *id != job_id);
                self.update_group(&group).await?;
            }
        }
        Ok(())
    }

    async fn put_worker(&self, worker: &Worker) -> Result<()> {
        let json = serde_json::to_string(worker)?;
        let mut conn = self.conn();
        redis::pipe()
            .set(worker_key(worker.id), json)
            .sadd("workers", worker.id.to_string())
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn get_worker(&self, id: Uuid) -> Result<Option<Worker>> {
        self.fetch_json(&worker_key(id)).await
    }

    async fn update_worker(&self, worker: &Worker) -> Result<()> {
        let json = serde_json::to_string(worker)?;
        let mut conn = self.conn();
        let _: () = conn.set(worker_key(worker.id), json).await?;

        // Keep the claim marker in line with the record.
        match worker.current_group {
            Some(group_id) => {
                let _: () = conn
                    .set(assign_marker(worker.id), group_id.to_string())
                    .await?;
            }
            None => {
                let _: () = conn.del(assign_marker(worker.id)).await?;
            }
        }
        Ok(())
    }

    async fn list_workers(&self, filter: &WorkerFilter) -> Result<Vec<Worker>> {
        let mut conn = self.conn();
        let ids: Vec<String> = conn.smembers("workers").await?;
        let mut workers = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(worker) = self.fetch_json::<Worker>(&format!("worker:{id}")).await? {
                if filter.matches(&worker) {
                    workers.push(worker);
                }
            }
        }
        workers.sort_by_key(|w| w.registered_at);
        Ok(workers)
    }

    async fn try_assign_worker(&self, worker_id: Uuid, group_id: Uuid) -> Result<bool> {
        let mut conn = self.conn();
        let claimed: bool = conn
            .set_nx(assign_marker(worker_id), group_id.to_string())
            .await?;
        if !claimed {
            return Ok(false);
        }

        match self.get_worker(worker_id).await? {
            Some(mut worker) => {
                worker.current_group = Some(group_id);
                let json = serde_json::to_string(&worker)?;
                let _: () = conn.set(worker_key(worker.id), json).await?;
                Ok(true)
            }
            None => {
                let _: () = conn.del(assign_marker(worker_id)).await?;
                Ok(false)
            }
        }
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
