//! Ordering of jobs inside a group.
//!
//! Priority decides release order to the worker, never membership: a job's
//! group is fixed by its grouping key alone.

use std::cmp::Reverse;

use crate::model::{Job, JobPriority};

/// Sorts jobs into dispatch order: urgent first, low last, FIFO by
/// submission time within the same priority.
pub fn dispatch_order(jobs: &mut [Job]) {
    jobs.sort_by_key(|j| (Reverse(j.spec.priority), j.created_at));
}

/// The scheduling weight of a whole group: its most urgent member.
pub fn group_priority(jobs: &[Job]) -> JobPriority {
    jobs.iter()
        .map(|j| j.spec.priority)
        .max()
        .unwrap_or(JobPriority::Low)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobSpec, TargetClass};
    use chrono::Duration;

    fn job(priority: JobPriority, offset_secs: i64) -> Job {
        let mut j = Job::new(
            JobSpec {
                org_id: "acme".into(),
                app_version_id: "v1".into(),
                test_path: format!("tests/{priority}_{offset_secs}.spec"),
                target: TargetClass::Emulator,
                priority,
                metadata: Default::default(),
            },
            3,
        );
        j.created_at += Duration::seconds(offset_secs);
        j
    }

    #[test]
    fn orders_by_priority_then_arrival() {
        // Submitted in reverse priority order.
        let mut jobs = vec![
            job(JobPriority::Low, 0),
            job(JobPriority::Normal, 1),
            job(JobPriority::High, 2),
            job(JobPriority::Urgent, 3),
        ];
        dispatch_order(&mut jobs);
        let got: Vec<JobPriority> = jobs.iter().map(|j| j.spec.priority).collect();
        assert_eq!(
            got,
            vec![
                JobPriority::Urgent,
                JobPriority::High,
                JobPriority::Normal,
                JobPriority::Low
            ]
        );
    }

    #[test]
    fn fifo_within_same_priority() {
        let first = job(JobPriority::Normal, 0);
        let second = job(JobPriority::Normal, 5);
        let first_path = first.spec.test_path.clone();
        let mut jobs = vec![second, first];
        dispatch_order(&mut jobs);
        assert_eq!(jobs[0].spec.test_path, first_path);
    }

    #[test]
    fn group_priority_is_max_member() {
        let jobs = vec![job(JobPriority::Low, 0), job(JobPriority::High, 1)];
        assert_eq!(group_priority(&jobs), JobPriority::High);
        assert_eq!(group_priority(&[]), JobPriority::Low);
    }
}
