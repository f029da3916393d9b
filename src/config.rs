use std::time::Duration;

/// Exponential backoff parameters for retried jobs.
///
/// Delay for attempt `n` is `base * 2^n`, capped at `max`. Jitter adds up to
/// 25% of the computed delay so retries from a batch of failures do not all
/// land on the same scheduler tick.
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    pub base: Duration,
    pub max: Duration,
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(10),
            max: Duration::from_secs(300),
            jitter: true,
        }
    }
}

/// Storage backend selection. When `redis_url` is set the orchestrator tries
/// the persistent backend at startup and falls back to the in-memory store if
/// it is unreachable. There is no failover after startup.
#[derive(Debug, Clone, Default)]
pub struct StoreConfig {
    pub redis_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How often the scheduling loop matches open groups to idle workers.
    pub schedule_interval: Duration,
    /// How often due retries are moved back into the queue.
    pub retry_sweep_interval: Duration,
    /// How often worker liveness is evaluated.
    pub health_sweep_interval: Duration,
    /// Heartbeat silence after which a worker is marked stale.
    pub worker_stale_after: Duration,
    /// Heartbeat silence after which a worker is marked offline and its
    /// assignment reclaimed.
    pub worker_offline_after: Duration,
    /// Wall-clock limit for a single running job before it is failed.
    pub job_timeout: Duration,
    pub default_max_retries: u32,
    pub backoff: BackoffConfig,
    pub store: StoreConfig,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            schedule_interval: Duration::from_secs(5),
            retry_sweep_interval: Duration::from_secs(5),
            health_sweep_interval: Duration::from_secs(10),
            worker_stale_after: Duration::from_secs(120),
            worker_offline_after: Duration::from_secs(300),
            job_timeout: Duration::from_secs(30 * 60),
            default_max_retries: 3,
            backoff: BackoffConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl OrchestratorConfig {
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.store.redis_url = Some(url.into());
        self
    }
}
