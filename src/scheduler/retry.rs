//! Retry decisions and exponential backoff for failed jobs.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;

use uuid::Uuid;

use crate::config::BackoffConfig;
use crate::error::Result;
use crate::model::{Job, JobStatus};
use crate::scheduler::resolver::{GroupResolver, Placement};
use crate::store::{JobFilter, JobStore};

/// Delay before retry attempt `retry_count`: `base * 2^retry_count`, capped
/// at `max`, plus up to 25% jitter when enabled.
pub fn backoff_delay(config: &BackoffConfig, retry_count: u32) -> Duration {
    let factor = 2u32.checked_pow(retry_count).unwrap_or(u32::MAX);
    let delay = config.base.saturating_mul(factor).min(config.max);
    if config.jitter && !delay.is_zero() {
        let jitter_ms = rand::thread_rng().gen_range(0..=delay.as_millis() as u64 / 4);
        delay + Duration::from_millis(jitter_ms)
    } else {
        delay
    }
}

pub struct RetryController {
    store: Arc<dyn JobStore>,
    config: BackoffConfig,
}

impl RetryController {
    pub fn new(store: Arc<dyn JobStore>, config: BackoffConfig) -> Self {
        Self { store, config }
    }

    /// Records a failure on `job` and decides whether it gets another run.
    ///
    /// Returns true if a retry was granted: the retry count is bumped and a
    /// next-attempt time stamped, after which the job waits for the retry
    /// sweep. Returns false once retries are exhausted; the job is then
    /// terminally failed.
    pub fn note_failure(&self, job: &mut Job) -> bool {
        if job.retry_count >= job.max_retries {
            job.next_attempt_at = None;
            return false;
        }
        job.retry_count += 1;
        let delay = backoff_delay(&self.config, job.retry_count);
        let due = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        job.next_attempt_at = Some(due);
        tracing::info!(
            job_id = %job.id,
            attempt = job.retry_count,
            max_retries = job.max_retries,
            delay_secs = delay.as_secs(),
            "Scheduled job retry"
        );
        true
    }

    /// Moves failed jobs whose backoff has elapsed back into the queue. The
    /// resolver puts each back into its original group if that group is
    /// still open, or regroups it under the same key.
    pub async fn sweep(&self, resolver: &GroupResolver) -> Result<SweepReport> {
        let failed = self
            .store
            .list_jobs(&JobFilter::status(JobStatus::Failed))
            .await?;

        let now = Utc::now();
        let mut report = SweepReport::default();
        for mut job in failed {
            let due = match job.next_attempt_at {
                Some(due) if due <= now => due,
                _ => continue,
            };
            tracing::debug!(job_id = %job.id, due = %due, "Retry due, re-queueing job");
            match resolver.enqueue(&mut job).await? {
                Placement::Queued => report.requeued += 1,
                Placement::Regrouped { vacated } => {
                    report.requeued += 1;
                    report.vacated_groups.push(vacated);
                }
                Placement::Skipped => {}
            }
        }
        Ok(report)
    }
}

/// Outcome of one retry sweep.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub requeued: usize,
    /// Closed groups a retried job moved out of. A vacated group may have no
    /// live member left and needs its status re-settled.
    pub vacated_groups: Vec<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(base_secs: u64, max_secs: u64) -> BackoffConfig {
        BackoffConfig {
            base: Duration::from_secs(base_secs),
            max: Duration::from_secs(max_secs),
            jitter: false,
        }
    }

    #[test]
    fn doubles_per_attempt() {
        let cfg = config(10, 300);
        assert_eq!(backoff_delay(&cfg, 0), Duration::from_secs(10));
        assert_eq!(backoff_delay(&cfg, 1), Duration::from_secs(20));
        assert_eq!(backoff_delay(&cfg, 2), Duration::from_secs(40));
        assert_eq!(backoff_delay(&cfg, 3), Duration::from_secs(80));
    }

    #[test]
    fn caps_at_max() {
        let cfg = config(10, 60);
        assert_eq!(backoff_delay(&cfg, 5), Duration::from_secs(60));
        assert_eq!(backoff_delay(&cfg, 31), Duration::from_secs(60));
        // Exponent overflow saturates rather than wrapping.
        assert_eq!(backoff_delay(&cfg, 200), Duration::from_secs(60));
    }

    #[test]
    fn jitter_stays_within_a_quarter() {
        let cfg = BackoffConfig {
            base: Duration::from_secs(40),
            max: Duration::from_secs(300),
            jitter: true,
        };
        for _ in 0..50 {
            let d = backoff_delay(&cfg, 0);
            assert!(d >= Duration::from_secs(40));
            assert!(d <= Duration::from_secs(50));
        }
    }
}
