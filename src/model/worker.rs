use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::job::TargetClass;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    Active,
    /// Missed heartbeats past the stale threshold; still holds its assignment.
    Stale,
    /// Presumed dead; its assignment has been reclaimed.
    Offline,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerStatus::Active => write!(f, "active"),
            WorkerStatus::Stale => write!(f, "stale"),
            WorkerStatus::Offline => write!(f, "offline"),
        }
    }
}

/// A registered execution agent. The orchestrator never runs tests itself;
/// it only tracks what each agent can serve and whether it is alive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: Uuid,
    pub name: String,
    pub capabilities: HashSet<TargetClass>,
    pub status: WorkerStatus,
    /// At most one group at a time.
    pub current_group: Option<Uuid>,
    pub last_heartbeat: DateTime<Utc>,
    /// When this worker last finished an assignment; the scheduler prefers
    /// the oldest value when breaking eligibility ties.
    pub last_assignment_done: Option<DateTime<Utc>>,
    pub registered_at: DateTime<Utc>,
}

impl Worker {
    pub fn new(name: String, capabilities: HashSet<TargetClass>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name,
            capabilities,
            status: WorkerStatus::Active,
            current_group: None,
            last_heartbeat: now,
            last_assignment_done: None,
            registered_at: now,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == WorkerStatus::Active && self.current_group.is_none()
    }

    pub fn can_serve(&self, target: TargetClass) -> bool {
        self.capabilities.contains(&target)
    }

    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_heartbeat
    }
}
