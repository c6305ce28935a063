//! Execution workers and their heartbeats.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::{ProjectId, TagSet, WorkerId};

/// Which projects a worker takes jobs from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerScope {
    /// Shared by every project.
    Instance,
    /// Dedicated to the listed projects.
    Projects(BTreeSet<ProjectId>),
}

impl WorkerScope {
    pub fn serves(&self, project_id: &ProjectId) -> bool {
        match self {
            WorkerScope::Instance => true,
            WorkerScope::Projects(projects) => projects.contains(project_id),
        }
    }
}

/// A worker check-in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub worker_id: WorkerId,
    pub tags: TagSet,
    /// Maximum number of jobs the worker runs at once.
    pub capacity: u32,
    pub contact_time: DateTime<Utc>,
    pub scope: WorkerScope,
    /// Whether a tagged worker also picks up jobs without tags.
    pub run_untagged: bool,
}

impl Heartbeat {
    pub fn new(
        worker_id: WorkerId,
        tags: TagSet,
        capacity: u32,
        contact_time: DateTime<Utc>,
    ) -> Self {
        Self {
            worker_id,
            tags,
            capacity,
            contact_time,
            scope: WorkerScope::Instance,
            run_untagged: true,
        }
    }

    pub fn with_scope(mut self, scope: WorkerScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn with_run_untagged(mut self, run_untagged: bool) -> Self {
        self.run_untagged = run_untagged;
        self
    }
}

/// Registry view of a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub tags: TagSet,
    pub capacity: u32,
    /// Jobs currently claimed by this worker and not yet finished.
    pub running: u32,
    pub last_contact: DateTime<Utc>,
    /// Last successful claim. `None` for workers that never ran a job.
    pub last_claimed_at: Option<DateTime<Utc>>,
    pub scope: WorkerScope,
    pub run_untagged: bool,
}

impl Worker {
    pub fn from_heartbeat(heartbeat: Heartbeat) -> Self {
        Self {
            id: heartbeat.worker_id,
            tags: heartbeat.tags,
            capacity: heartbeat.capacity,
            running: 0,
            last_contact: heartbeat.contact_time,
            last_claimed_at: None,
            scope: heartbeat.scope,
            run_untagged: heartbeat.run_untagged,
        }
    }

    /// Apply a later heartbeat, keeping claim bookkeeping intact.
    pub fn apply_heartbeat(&mut self, heartbeat: Heartbeat) {
        self.tags = heartbeat.tags;
        self.capacity = heartbeat.capacity;
        self.scope = heartbeat.scope;
        self.run_untagged = heartbeat.run_untagged;
        // Heartbeats may arrive out of order.
        if heartbeat.contact_time > self.last_contact {
            self.last_contact = heartbeat.contact_time;
        }
    }

    pub fn remaining_capacity(&self) -> u32 {
        self.capacity.saturating_sub(self.running)
    }

    pub fn is_fresh(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        now - self.last_contact <= stale_after
    }

    pub fn is_available(&self, now: DateTime<Utc>, stale_after: Duration) -> bool {
        self.remaining_capacity() > 0 && self.is_fresh(now, stale_after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn heartbeat(capacity: u32, at: DateTime<Utc>) -> Heartbeat {
        Heartbeat::new(WorkerId::new(), TagSet::new(), capacity, at)
    }

    #[test]
    fn test_heartbeat_keeps_running_count() {
        let now = Utc::now();
        let mut worker = Worker::from_heartbeat(heartbeat(2, now));
        worker.running = 1;

        let mut later = heartbeat(3, now + Duration::seconds(5));
        later.worker_id = worker.id;
        worker.apply_heartbeat(later);

        assert_eq!(worker.running, 1);
        assert_eq!(worker.remaining_capacity(), 2);
        assert_eq!(worker.last_contact, now + Duration::seconds(5));
    }

    #[test]
    fn test_out_of_order_heartbeat_does_not_rewind_contact() {
        let now = Utc::now();
        let mut worker = Worker::from_heartbeat(heartbeat(1, now));
        worker.apply_heartbeat(heartbeat(1, now - Duration::minutes(10)));
        assert_eq!(worker.last_contact, now);
    }

    #[test]
    fn test_availability() {
        let now = Utc::now();
        let worker = Worker::from_heartbeat(heartbeat(1, now - Duration::minutes(2)));

        assert!(worker.is_available(now, Duration::minutes(5)));
        assert!(!worker.is_available(now, Duration::minutes(1)));

        let saturated = Worker {
            running: 1,
            ..worker
        };
        assert!(!saturated.is_available(now, Duration::minutes(5)));
    }

    #[test]
    fn test_scope() {
        let project = ProjectId::new();
        let other = ProjectId::new();
        let scope = WorkerScope::Projects([project].into_iter().collect());

        assert!(scope.serves(&project));
        assert!(!scope.serves(&other));
        assert!(WorkerScope::Instance.serves(&other));
    }
}
