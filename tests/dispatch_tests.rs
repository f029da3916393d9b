//! Scheduling-loop behavior: dispatch order, capability matching, LRU
//! tie-breaking, and capacity starvation staying visible as queued jobs.


use std::sync::Arc;

use testmux::model::{GroupStatus, JobPriority, JobStatus, TargetClass};
use test_harness::{
    register_worker, spec, spec_with_priority, test_orchestrator, test_orchestrator_on,
    CancelPoint, CancellingStore,
};

#[tokio::test]
async fn dispatch_order_is_priority_then_arrival() {
    let orchestrator = test_orchestrator();
    register_worker(&orchestrator, "agent-1", &[TargetClass::Emulator]).await;

    // Submitted in reverse priority order.
    let low = orchestrator
        .submit(spec_with_priority(
            "acme",
            "v1",
            TargetClass::Emulator,
            JobPriority::Low,
        ))
        .await
        .unwrap();
    let normal = orchestrator
        .submit(spec_with_priority(
            "acme",
            "v1",
            TargetClass::Emulator,
            JobPriority::Normal,
        ))
        .await
        .unwrap();
    let high = orchestrator
        .submit(spec_with_priority(
            "acme",
            "v1",
            TargetClass::Emulator,
            JobPriority::High,
        ))
        .await
        .unwrap();
    let urgent = orchestrator
        .submit(spec_with_priority(
            "acme",
            "v1",
            TargetClass::Emulator,
            JobPriority::Urgent,
        ))
        .await
        .unwrap();

    assert_eq!(orchestrator.tick().await.unwrap(), 1);

    // All four went to the same worker. Dispatch writes each job in release
    // order, so updated_at must be monotonic urgent -> high -> normal -> low.
    let jobs: Vec<_> = fetch_jobs(&orchestrator, &[urgent.id, high.id, normal.id, low.id]).await;
    for job in &jobs {
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.worker_id.is_some());
    }
    assert!(jobs[0].updated_at <= jobs[1].updated_at);
    assert!(jobs[1].updated_at <= jobs[2].updated_at);
    assert!(jobs[2].updated_at <= jobs[3].updated_at);
}

async fn fetch_jobs(
    orchestrator: &testmux::orchestrator::Orchestrator,
    ids: &[uuid::Uuid],
) -> Vec<testmux::model::Job> {
    let mut jobs = Vec::new();
    for id in ids {
        jobs.push(orchestrator.job(*id).await.unwrap());
    }
    jobs
}

#[tokio::test]
async fn job_waits_with_no_capable_worker_then_assigns() {
    let orchestrator = test_orchestrator();
    register_worker(&orchestrator, "emu-agent", &[TargetClass::Emulator]).await;

    let job = orchestrator
        .submit(spec("acme", "v1", TargetClass::Device))
        .await
        .unwrap();

    // No device-capable worker: not an error, the job just stays queued with
    // no worker id.
    assert_eq!(orchestrator.tick().await.unwrap(), 0);
    let waiting = orchestrator.job(job.id).await.unwrap();
    assert_eq!(waiting.status, JobStatus::Queued);
    assert!(waiting.worker_id.is_none());

    // Registering a capable worker resolves it on the next tick.
    let device_worker =
        register_worker(&orchestrator, "dev-agent", &[TargetClass::Device]).await;
    assert_eq!(orchestrator.tick().await.unwrap(), 1);
    let running = orchestrator.job(job.id).await.unwrap();
    assert_eq!(running.status, JobStatus::Running);
    assert_eq!(running.worker_id, Some(device_worker.id));
}

#[tokio::test]
async fn worker_holds_at_most_one_group() {
    let orchestrator = test_orchestrator();
    let worker = register_worker(&orchestrator, "agent-1", &[TargetClass::Emulator]).await;

    orchestrator
        .submit(spec("acme", "v1", TargetClass::Emulator))
        .await
        .unwrap();
    assert_eq!(orchestrator.tick().await.unwrap(), 1);

    // A second group for a different build has to wait for the same worker.
    let second = orchestrator
        .submit(spec("acme", "v2", TargetClass::Emulator))
        .await
        .unwrap();
    assert_eq!(orchestrator.tick().await.unwrap(), 0);
    assert_eq!(
        orchestrator.job(second.id).await.unwrap().status,
        JobStatus::Queued
    );

    let held = orchestrator.worker(worker.id).await.unwrap();
    assert!(held.current_group.is_some());
}

#[tokio::test]
async fn finished_group_frees_worker_for_next_assignment() {
    let orchestrator = test_orchestrator();
    let worker = register_worker(&orchestrator, "agent-1", &[TargetClass::Emulator]).await;

    let first = orchestrator
        .submit(spec("acme", "v1", TargetClass::Emulator))
        .await
        .unwrap();
    orchestrator.tick().await.unwrap();
    orchestrator
        .report(first.id, JobStatus::Completed, None, None)
        .await
        .unwrap();

    let freed = orchestrator.worker(worker.id).await.unwrap();
    assert!(freed.current_group.is_none());
    assert!(freed.last_assignment_done.is_some());

    let second = orchestrator
        .submit(spec("acme", "v2", TargetClass::Emulator))
        .await
        .unwrap();
    assert_eq!(orchestrator.tick().await.unwrap(), 1);
    assert_eq!(
        orchestrator.job(second.id).await.unwrap().worker_id,
        Some(worker.id)
    );
}

#[tokio::test]
async fn cancel_racing_assignment_is_not_resurrected() {
    let store = Arc::new(CancellingStore::new(CancelPoint::OnAssign));
    let orchestrator = test_orchestrator_on(store.clone());
    let worker = register_worker(&orchestrator, "agent-1", &[TargetClass::Emulator]).await;

    let job = orchestrator
        .submit(spec("acme", "v1", TargetClass::Emulator))
        .await
        .unwrap();

    // The cancel lands inside the tick, after the queue scan but before
    // dispatch. The stale scan snapshot must not flip it back to running.
    store.arm(job.id);
    assert_eq!(orchestrator.tick().await.unwrap(), 0);

    let cancelled = orchestrator.job(job.id).await.unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);
    assert!(cancelled.worker_id.is_none());

    // The group stayed open and the claim was handed back.
    let group = orchestrator.group(job.group_id.unwrap()).await.unwrap();
    assert_eq!(group.status, GroupStatus::Open);
    assert!(orchestrator
        .worker(worker.id)
        .await
        .unwrap()
        .current_group
        .is_none());

    // The freed worker still takes real work.
    let next = orchestrator
        .submit(spec("acme", "v2", TargetClass::Emulator))
        .await
        .unwrap();
    assert_eq!(orchestrator.tick().await.unwrap(), 1);
    assert_eq!(
        orchestrator.job(next.id).await.unwrap().status,
        JobStatus::Running
    );
}

#[tokio::test]
async fn ties_prefer_least_recently_used_worker() {
    let orchestrator = test_orchestrator();
    let first = register_worker(&orchestrator, "agent-1", &[TargetClass::Emulator]).await;
    let second = register_worker(&orchestrator, "agent-2", &[TargetClass::Emulator]).await;

    // agent-1 completes an assignment, so its "last done" is newest.
    let warmup = orchestrator
        .submit(spec("acme", "v0", TargetClass::Emulator))
        .await
        .unwrap();
    orchestrator.tick().await.unwrap();
    let assigned_to = orchestrator.job(warmup.id).await.unwrap().worker_id.unwrap();
    orchestrator
        .report(warmup.id, JobStatus::Completed, None, None)
        .await
        .unwrap();

    // Next group should go to the worker that has never run anything.
    let job = orchestrator
        .submit(spec("acme", "v1", TargetClass::Emulator))
        .await
        .unwrap();
    orchestrator.tick().await.unwrap();
    let chosen = orchestrator.job(job.id).await.unwrap().worker_id.unwrap();
    let never_used = if assigned_to == first.id {
        second.id
    } else {
        first.id
    };
    assert_eq!(chosen, never_used);
}
