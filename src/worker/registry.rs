use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::model::{TargetClass, Worker, WorkerStatus};
use crate::store::JobStore;

pub struct WorkerRegistry {
    store: Arc<dyn JobStore>,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self { store }
    }

    /// Registers a new worker as active and idle.
    pub async fn register(
        &self,
        name: String,
        capabilities: HashSet<TargetClass>,
    ) -> Result<Worker> {
        let worker = Worker::new(name, capabilities);
        self.store.put_worker(&worker).await?;
        tracing::info!(
            worker_id = %worker.id,
            name = %worker.name,
            capabilities = ?worker.capabilities,
            "Worker registered"
        );
        Ok(worker)
    }

    /// Refreshes a worker's liveness timestamp. Unknown ids are an error;
    /// a worker that went stale or offline without losing its record comes
    /// back active, provided any reclaimed assignment is already gone.
    pub async fn heartbeat(&self, worker_id: Uuid) -> Result<()> {
        let mut worker = self
            .store
            .get_worker(worker_id)
            .await?
            .ok_or(OrchestratorError::WorkerNotFound(worker_id))?;

        worker.last_heartbeat = Utc::now();
        if worker.status != WorkerStatus::Active {
            tracing::info!(
                worker_id = %worker.id,
                was = %worker.status,
                "Worker heartbeat resumed, marking active"
            );
            worker.status = WorkerStatus::Active;
        }
        self.store.update_worker(&worker).await?;
        Ok(())
    }
}
