use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::job::{Job, TargetClass};

/// The tuple that decides which batch a job lands in. Jobs sharing a key
/// share one app install on the worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupKey {
    pub org_id: String,
    pub app_version_id: String,
    pub target: TargetClass,
}

impl std::fmt::Display for GroupKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.org_id, self.app_version_id, self.target)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupStatus {
    /// Accepting new members.
    Open,
    /// Closed onto a worker; membership is frozen.
    Assigned,
    Completed,
    Failed,
}

impl std::fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GroupStatus::Open => write!(f, "open"),
            GroupStatus::Assigned => write!(f, "assigned"),
            GroupStatus::Completed => write!(f, "completed"),
            GroupStatus::Failed => write!(f, "failed"),
        }
    }
}

/// A batch of jobs sharing a grouping key, dispatched to one worker as a unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobGroup {
    pub id: Uuid,
    pub key: GroupKey,
    /// Member job ids in arrival order. Dispatch order is computed from the
    /// member jobs themselves, never stored.
    pub jobs: Vec<Uuid>,
    pub status: GroupStatus,
    pub assigned_worker: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl JobGroup {
    pub fn new(key: GroupKey) -> Self {
        Self {
            id: Uuid::new_v4(),
            key,
            jobs: Vec::new(),
            status: GroupStatus::Open,
            assigned_worker: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_open(&self) -> bool {
        self.status == GroupStatus::Open
    }

    /// Derived status over the member jobs: Completed once every member
    /// settled without a terminal failure, Failed if any member failed for
    /// good, otherwise whatever scheduling phase the group is in. A closed
    /// group whose membership drained away (retries regrouped elsewhere)
    /// counts as Completed.
    pub fn derived_status(&self, members: &[Job]) -> GroupStatus {
        if members.is_empty() {
            return if self.is_open() {
                GroupStatus::Open
            } else {
                GroupStatus::Completed
            };
        }
        if members
            .iter()
            .any(|j| j.status == crate::model::job::JobStatus::Failed && j.is_settled())
        {
            return GroupStatus::Failed;
        }
        if members.iter().all(|j| j.is_settled()) {
            return GroupStatus::Completed;
        }
        self.status
    }
}
