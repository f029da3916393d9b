//! Retry/backoff behavior, report idempotence, and cancellation.


use std::sync::Arc;

use testmux::error::OrchestratorError;
use testmux::model::{GroupStatus, JobStatus, TargetClass};
use test_harness::{
    register_worker, spec, test_orchestrator, test_orchestrator_on, CancelPoint, CancellingStore,
};

/// Runs the job through one fail cycle: tick (assign), report failure.
async fn fail_once(orchestrator: &testmux::orchestrator::Orchestrator, job_id: uuid::Uuid) {
    orchestrator.tick().await.unwrap();
    assert_eq!(
        orchestrator.job(job_id).await.unwrap().status,
        JobStatus::Running
    );
    orchestrator
        .report(job_id, JobStatus::Failed, None, Some("boom".into()))
        .await
        .unwrap();
}

#[tokio::test]
async fn exactly_max_retries_never_more() {
    let orchestrator = test_orchestrator_with_max_retries(2);
    register_worker(&orchestrator, "agent-1", &[TargetClass::Emulator]).await;

    let job = orchestrator
        .submit(spec("acme", "v1", TargetClass::Emulator))
        .await
        .unwrap();
    assert_eq!(job.max_retries, 2);

    // First run fails; retry 1 granted.
    fail_once(&orchestrator, job.id).await;
    let after_first = orchestrator.job(job.id).await.unwrap();
    assert_eq!(after_first.status, JobStatus::Failed);
    assert_eq!(after_first.retry_count, 1);
    assert!(after_first.next_attempt_at.is_some());

    // Backoff is zero in tests, so the sweep re-queues immediately.
    assert_eq!(orchestrator.retry_sweep().await.unwrap(), 1);
    assert_eq!(
        orchestrator.job(job.id).await.unwrap().status,
        JobStatus::Queued
    );

    // Second run fails; retry 2 granted.
    fail_once(&orchestrator, job.id).await;
    assert_eq!(orchestrator.job(job.id).await.unwrap().retry_count, 2);
    assert_eq!(orchestrator.retry_sweep().await.unwrap(), 1);

    // Third run fails; retries exhausted, terminally failed.
    fail_once(&orchestrator, job.id).await;
    let terminal = orchestrator.job(job.id).await.unwrap();
    assert_eq!(terminal.status, JobStatus::Failed);
    assert_eq!(terminal.retry_count, 2);
    assert!(terminal.next_attempt_at.is_none());
    assert!(terminal.completed_at.is_some());

    // Nothing left for the sweep.
    assert_eq!(orchestrator.retry_sweep().await.unwrap(), 0);
}

fn test_orchestrator_with_max_retries(
    max_retries: u32,
) -> std::sync::Arc<testmux::orchestrator::Orchestrator> {
    test_harness::test_orchestrator_with(|cfg| cfg.default_max_retries = max_retries)
}

#[tokio::test]
async fn retried_job_regroups_when_original_group_closed() {
    let orchestrator = test_orchestrator();
    register_worker(&orchestrator, "agent-1", &[TargetClass::Emulator]).await;

    let job = orchestrator
        .submit(spec("acme", "v1", TargetClass::Emulator))
        .await
        .unwrap();
    let original_group = job.group_id.unwrap();

    fail_once(&orchestrator, job.id).await;
    // The original group closed when it was assigned, so the retry lands in
    // a fresh group under the same key.
    orchestrator.retry_sweep().await.unwrap();

    let retried = orchestrator.job(job.id).await.unwrap();
    assert_eq!(retried.status, JobStatus::Queued);
    assert_ne!(retried.group_id, Some(original_group));

    let old = orchestrator.group(original_group).await.unwrap();
    assert!(!old.jobs.contains(&job.id));
    // Nothing live is left behind: the drained group is finished, not a
    // zombie that status queries keep reporting as assigned.
    assert_eq!(old.status, GroupStatus::Completed);
    let new = orchestrator.group(retried.group_id.unwrap()).await.unwrap();
    assert_eq!(new.key, old.key);
    assert!(new.jobs.contains(&job.id));
}

#[tokio::test]
async fn vacated_group_with_completed_members_settles() {
    let orchestrator = test_orchestrator();
    register_worker(&orchestrator, "agent-1", &[TargetClass::Emulator]).await;

    let done = orchestrator
        .submit(spec("acme", "v1", TargetClass::Emulator))
        .await
        .unwrap();
    let flaky = orchestrator
        .submit(spec("acme", "v1", TargetClass::Emulator))
        .await
        .unwrap();
    orchestrator.tick().await.unwrap();

    orchestrator
        .report(done.id, JobStatus::Completed, None, None)
        .await
        .unwrap();
    orchestrator
        .report(flaky.id, JobStatus::Failed, None, Some("boom".into()))
        .await
        .unwrap();

    // The retried job moves to a fresh group; its old group now holds only
    // the completed member and must settle.
    assert_eq!(orchestrator.retry_sweep().await.unwrap(), 1);

    let retried = orchestrator.job(flaky.id).await.unwrap();
    assert_eq!(retried.status, JobStatus::Queued);
    assert_ne!(retried.group_id, done.group_id);

    let old = orchestrator.group(done.group_id.unwrap()).await.unwrap();
    assert_eq!(old.status, GroupStatus::Completed);
    assert_eq!(old.jobs, vec![done.id]);
}

#[tokio::test]
async fn cancel_racing_retry_sweep_is_not_requeued() {
    let store = Arc::new(CancellingStore::new(CancelPoint::OnGrouping));
    let orchestrator = test_orchestrator_on(store.clone());
    register_worker(&orchestrator, "agent-1", &[TargetClass::Emulator]).await;

    let job = orchestrator
        .submit(spec("acme", "v1", TargetClass::Emulator))
        .await
        .unwrap();
    fail_once(&orchestrator, job.id).await;

    // The cancel lands inside the sweep, after it scanned the failed jobs
    // but before this one is re-queued.
    store.arm(job.id);
    assert_eq!(orchestrator.retry_sweep().await.unwrap(), 0);

    let cancelled = orchestrator.job(job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert_eq!(cancelled.group_id, job.group_id);
    assert!(cancelled.next_attempt_at.is_none());

    // Still nothing on later sweeps.
    assert_eq!(orchestrator.retry_sweep().await.unwrap(), 0);
}

#[tokio::test]
async fn identical_report_twice_is_a_noop() {
    let orchestrator = test_orchestrator();
    register_worker(&orchestrator, "agent-1", &[TargetClass::Emulator]).await;

    let job = orchestrator
        .submit(spec("acme", "v1", TargetClass::Emulator))
        .await
        .unwrap();
    orchestrator.tick().await.unwrap();

    let payload = serde_json::json!({"passed": 12, "failed": 0});
    let first = orchestrator
        .report(job.id, JobStatus::Completed, Some(payload.clone()), None)
        .await
        .unwrap();
    let second = orchestrator
        .report(job.id, JobStatus::Completed, Some(payload), None)
        .await
        .unwrap();

    assert_eq!(first.status, second.status);
    assert_eq!(first.result, second.result);
    assert_eq!(first.completed_at, second.completed_at);
    assert_eq!(first.updated_at, second.updated_at);
}

#[tokio::test]
async fn duplicate_failure_report_does_not_double_count_retries() {
    let orchestrator = test_orchestrator();
    register_worker(&orchestrator, "agent-1", &[TargetClass::Emulator]).await;

    let job = orchestrator
        .submit(spec("acme", "v1", TargetClass::Emulator))
        .await
        .unwrap();
    fail_once(&orchestrator, job.id).await;

    // The worker resends the same failure.
    orchestrator
        .report(job.id, JobStatus::Failed, None, Some("boom".into()))
        .await
        .unwrap();
    assert_eq!(orchestrator.job(job.id).await.unwrap().retry_count, 1);
}

#[tokio::test]
async fn invalid_transition_is_rejected() {
    let orchestrator = test_orchestrator();

    let job = orchestrator
        .submit(spec("acme", "v1", TargetClass::Emulator))
        .await
        .unwrap();
    // Queued job cannot jump straight to Completed.
    let err = orchestrator
        .report(job.id, JobStatus::Completed, None, None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::InvalidTransition {
            from: JobStatus::Queued,
            to: JobStatus::Completed
        }
    ));
}

#[tokio::test]
async fn worker_cannot_report_queue_movements() {
    let orchestrator = test_orchestrator();
    register_worker(&orchestrator, "agent-1", &[TargetClass::Emulator]).await;

    let job = orchestrator
        .submit(spec("acme", "v1", TargetClass::Emulator))
        .await
        .unwrap();
    orchestrator.tick().await.unwrap();

    // Requeueing belongs to reclaim, cancellation to the operator; a worker
    // reporting either is rejected even though the status machine itself
    // allows the moves.
    for bogus in [JobStatus::Queued, JobStatus::Cancelled, JobStatus::Pending] {
        let err = orchestrator
            .report(job.id, bogus, None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
    }

    // The job is untouched and the worker can still finish it.
    let running = orchestrator.job(job.id).await.unwrap();
    assert_eq!(running.status, JobStatus::Running);
    assert!(running.worker_id.is_some());
    orchestrator
        .report(job.id, JobStatus::Completed, None, None)
        .await
        .unwrap();
}

#[tokio::test]
async fn report_on_unknown_job_is_not_found() {
    let orchestrator = test_orchestrator();
    let err = orchestrator
        .report(uuid::Uuid::new_v4(), JobStatus::Running, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::JobNotFound(_)));
}

#[tokio::test]
async fn cancel_removes_job_awaiting_retry_from_future_sweeps() {
    let orchestrator = test_orchestrator();
    register_worker(&orchestrator, "agent-1", &[TargetClass::Emulator]).await;

    let job = orchestrator
        .submit(spec("acme", "v1", TargetClass::Emulator))
        .await
        .unwrap();
    fail_once(&orchestrator, job.id).await;
    assert!(orchestrator
        .job(job.id)
        .await
        .unwrap()
        .next_attempt_at
        .is_some());

    let cancelled = orchestrator.cancel_job(job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.next_attempt_at.is_none());

    assert_eq!(orchestrator.retry_sweep().await.unwrap(), 0);
    assert_eq!(
        orchestrator.job(job.id).await.unwrap().status,
        JobStatus::Cancelled
    );
}

#[tokio::test]
async fn cancelling_running_job_ignores_late_reports() {
    let orchestrator = test_orchestrator();
    register_worker(&orchestrator, "agent-1", &[TargetClass::Emulator]).await;

    let job = orchestrator
        .submit(spec("acme", "v1", TargetClass::Emulator))
        .await
        .unwrap();
    orchestrator.tick().await.unwrap();

    orchestrator.cancel_job(job.id).await.unwrap();

    // The worker finishes anyway; its report no longer counts.
    let after = orchestrator
        .report(job.id, JobStatus::Completed, None, None)
        .await
        .unwrap();
    assert_eq!(after.status, JobStatus::Cancelled);
}

#[tokio::test]
async fn cancel_of_terminal_job_is_rejected() {
    let orchestrator = test_orchestrator();
    register_worker(&orchestrator, "agent-1", &[TargetClass::Emulator]).await;

    let job = orchestrator
        .submit(spec("acme", "v1", TargetClass::Emulator))
        .await
        .unwrap();
    orchestrator.tick().await.unwrap();
    orchestrator
        .report(job.id, JobStatus::Completed, None, None)
        .await
        .unwrap();

    let err = orchestrator.cancel_job(job.id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
}
