//! Pending job queue
//!
//! A plain vector: the queue is small (one entry per account and target
//! pair) and is scanned in full every tick anyway.

use chrono::{DateTime, Utc};

use crate::models::Job;

#[derive(Debug, Clone, Default)]
pub struct JobQueue {
    jobs: Vec<Job>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a job unless one with the same name is already queued
    pub fn push(&mut self, job: Job) -> bool {
        if self.contains_name(&job.name) {
            tracing::debug!(job = %job.name, "Duplicate job ignored");
            return false;
        }
        self.jobs.push(job);
        true
    }

    /// Re-insert a job taken out by [`drain_ready`](Self::drain_ready)
    pub fn requeue(&mut self, job: Job) {
        self.jobs.push(job);
    }

    pub fn contains_name(&self, name: &str) -> bool {
        self.jobs.iter().any(|j| j.name == name)
    }

    /// Remove every job due at `now`, in scheduling order
    pub fn drain_ready(&mut self, now: DateTime<Utc>) -> Vec<Job> {
        let (mut ready, waiting): (Vec<Job>, Vec<Job>) =
            std::mem::take(&mut self.jobs).into_iter().partition(|j| j.is_ready(now));
        self.jobs = waiting;
        ready.sort_by(|a, b| a.schedule_cmp(b));
        ready
    }

    /// Earliest `next_run` in the queue
    pub fn next_wake(&self) -> Option<DateTime<Utc>> {
        self.jobs.iter().map(|j| j.next_run).min()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Copy of the queue in scheduling order
    pub fn snapshot(&self) -> Vec<Job> {
        let mut jobs = self.jobs.clone();
        jobs.sort_by(|a, b| a.schedule_cmp(b));
        jobs
    }

    pub fn iter(&self) -> impl Iterator<Item = &Job> {
        self.jobs.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AccountProfile;
    use chrono::Duration;
    use proptest::prelude::*;

    fn base() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn job(name: &str, priority: i32, offset_secs: i64) -> Job {
        Job::new(name, AccountProfile::new("alice"), "siteA", "claim")
            .with_priority(priority)
            .with_next_run(base() + Duration::seconds(offset_secs))
    }

    #[test]
    fn test_push_dedups_by_name() {
        let mut queue = JobQueue::new();
        assert!(queue.push(job("a", 0, 0)));
        assert!(!queue.push(job("a", 5, 10)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_drain_ready_orders_and_keeps_future() {
        let mut queue = JobQueue::new();
        queue.push(job("late-low", 2, -10));
        queue.push(job("future", 0, 60));
        queue.push(job("early-high", 1, -5));
        queue.push(job("earlier-high", 1, -20));

        let ready = queue.drain_ready(base());
        let names: Vec<_> = ready.iter().map(|j| j.name.as_str()).collect();
        assert_eq!(names, vec!["earlier-high", "early-high", "late-low"]);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_wake(), Some(base() + Duration::seconds(60)));
    }

    #[test]
    fn test_empty_queue_has_no_wake() {
        assert_eq!(JobQueue::new().next_wake(), None);
    }

    proptest! {
        #[test]
        fn prop_drain_ready_is_sorted(entries in prop::collection::vec((-5i32..5, -100i64..100), 0..40)) {
            let mut queue = JobQueue::new();
            for (i, (priority, offset)) in entries.iter().enumerate() {
                queue.push(job(&format!("j{i}"), *priority, *offset));
            }
            let total = queue.len();

            let ready = queue.drain_ready(base());
            for pair in ready.windows(2) {
                prop_assert!(pair[0].schedule_cmp(&pair[1]) != std::cmp::Ordering::Greater);
            }
            prop_assert!(ready.iter().all(|j| j.next_run <= base()));
            prop_assert!(queue.iter().all(|j| j.next_run > base()));
            prop_assert_eq!(ready.len() + queue.len(), total);
        }
    }
}
