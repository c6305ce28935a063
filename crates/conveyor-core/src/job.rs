//! Job lifecycle states and transitions.
//!
//! ```text
//! created -> pending -> running -> { success, failed, canceled }
//!            pending -> canceled
//! ```
//!
//! A job is queued if and only if it is `pending`; every edge that enters
//! or leaves `pending` therefore carries a [`QueueEffect`].

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::{JobId, ProjectId, TagSet, WorkerId};

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[display("created")]
    Created,
    #[display("pending")]
    Pending,
    #[display("running")]
    Running,
    #[display("success")]
    Success,
    #[display("failed")]
    Failed,
    #[display("canceled")]
    Canceled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Success | JobState::Failed | JobState::Canceled
        )
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, JobState::Pending)
    }
}

/// Side effect a transition has on the pending queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum QueueEffect {
    #[display("enqueue")]
    Enqueue,
    #[display("dequeue-claimed")]
    DequeueClaimed,
    #[display("dequeue-unclaimed")]
    DequeueUnclaimed,
    #[display("none")]
    None,
}

/// A requested edge in the job lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: JobState,
    pub to: JobState,
}

impl Transition {
    pub fn new(from: JobState, to: JobState) -> Self {
        Self { from, to }
    }

    /// Whether this edge belongs to the lifecycle graph.
    pub fn is_allowed(&self) -> bool {
        use JobState::*;
        matches!(
            (self.from, self.to),
            (Created, Pending)
                | (Pending, Running)
                | (Pending, Canceled)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Canceled)
        )
    }

    /// Only a worker claim may move a job out of the queue into `running`.
    pub fn requires_claim(&self) -> bool {
        self.from == JobState::Pending && self.to == JobState::Running
    }

    pub fn queue_effect(&self) -> QueueEffect {
        match (self.from, self.to) {
            (JobState::Pending, JobState::Running) => QueueEffect::DequeueClaimed,
            (JobState::Pending, _) => QueueEffect::DequeueUnclaimed,
            (_, JobState::Pending) => QueueEffect::Enqueue,
            _ => QueueEffect::None,
        }
    }

    pub fn enters_pending(&self) -> bool {
        self.to == JobState::Pending && self.from != JobState::Pending
    }

    pub fn leaves_pending(&self) -> bool {
        self.from == JobState::Pending && self.to != JobState::Pending
    }
}

/// What the job-authoring system hands over when it registers a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub id: JobId,
    pub project_id: ProjectId,
    /// Capabilities a worker must have to run the job.
    pub tags: TagSet,
}

impl JobSpec {
    pub fn new(id: JobId, project_id: ProjectId, tags: TagSet) -> Self {
        Self {
            id,
            project_id,
            tags,
        }
    }
}

/// The slice of a job the dispatch core tracks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub project_id: ProjectId,
    pub tags: TagSet,
    pub state: JobState,
    /// Set while the job is pending.
    pub enqueued_at: Option<DateTime<Utc>>,
    /// Worker holding the job while it is running.
    pub claimed_by: Option<WorkerId>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(spec: JobSpec, now: DateTime<Utc>) -> Self {
        Self {
            id: spec.id,
            project_id: spec.project_id,
            tags: spec.tags,
            state: JobState::Created,
            enqueued_at: None,
            claimed_by: None,
            updated_at: now,
        }
    }
}
