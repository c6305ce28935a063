//! Job state machine.
//!
//! Single source of truth for whether a job is waiting to run. Each job has
//! its own lock; a transition and its queue push/pop happen while holding
//! it, as does a worker claim. Concurrent requests for the same job
//! therefore serialize and the loser sees a state mismatch.

use chrono::{DateTime, Utc};
use conveyor_core::{
    Clock, Error, Job, JobId, JobSpec, JobState, QueueEffect, Result, Transition,
    TransitionRejection, WorkerId,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info};

use crate::metrics::{PopKind, QueueMetrics};
use crate::queue::{QueueStore, QueueToken};
use crate::registry::{ClaimAttempt, ClaimConflict, WorkerRegistry};

/// Applies the queue side of a transition.
///
/// Callers must hold the job's lock.
pub struct QueueEffects {
    queue: Arc<dyn QueueStore>,
    metrics: Arc<dyn QueueMetrics>,
}

impl QueueEffects {
    pub fn new(queue: Arc<dyn QueueStore>, metrics: Arc<dyn QueueMetrics>) -> Self {
        Self { queue, metrics }
    }

    /// Add the queue entry for a job entering pending.
    pub async fn push(
        &self,
        job: &Job,
        transition: Transition,
        now: DateTime<Utc>,
    ) -> Result<QueueToken> {
        if !transition.enters_pending() {
            return Err(Error::InvalidQueueTransition {
                from: transition.from,
                to: transition.to,
            });
        }

        match self
            .queue
            .push(job.id, job.project_id, job.tags.clone(), now)
            .await
        {
            Ok(token) => {
                self.metrics.increment_queue_push();
                Ok(token)
            }
            Err(Error::DuplicateEntry(job_id)) => {
                error!(job_id = %job_id, state = %job.state, "Job is already queued");
                self.metrics.increment_duplicate_entry();
                Err(Error::DuplicateEntry(job_id))
            }
            Err(e) => Err(e),
        }
    }

    /// Remove the queue entry for a job leaving pending.
    pub async fn pop(&self, job: &Job, transition: Transition, kind: PopKind) -> Result<bool> {
        if !transition.leaves_pending() {
            return Err(Error::InvalidQueueTransition {
                from: transition.from,
                to: transition.to,
            });
        }

        let removed = self.queue.pop(job.id).await?;
        if removed {
            self.metrics.increment_queue_pop(kind);
        } else {
            error!(job_id = %job.id, to = %transition.to, "Pending job had no queue entry");
            self.metrics.increment_consistency_violation();
        }
        Ok(removed)
    }
}

/// What an applied transition did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOutcome {
    pub job_id: JobId,
    pub transition: Transition,
    pub effect: QueueEffect,
    /// Set when the transition enqueued the job.
    pub token: Option<QueueToken>,
}

/// Result of trying to claim a job for one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed {
        worker_id: WorkerId,
        claimed_at: DateTime<Utc>,
    },
    /// The job left the queue before this claim got to it.
    NotQueued,
    /// The worker could not take the job; try the next one.
    Conflict(ClaimConflict),
}

pub struct JobStateMachine {
    jobs: RwLock<HashMap<JobId, Arc<Mutex<Job>>>>,
    queue: Arc<dyn QueueStore>,
    effects: QueueEffects,
    registry: Arc<WorkerRegistry>,
    clock: Arc<dyn Clock>,
}

impl JobStateMachine {
    pub fn new(
        queue: Arc<dyn QueueStore>,
        registry: Arc<WorkerRegistry>,
        metrics: Arc<dyn QueueMetrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            effects: QueueEffects::new(queue.clone(), metrics),
            queue,
            registry,
            clock,
        }
    }

    /// Start tracking a job in the `created` state.
    pub async fn register_job(&self, spec: JobSpec) -> Result<Job> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&spec.id) {
            return Err(Error::DuplicateJob(spec.id));
        }
        let job = Job::new(spec, self.clock.now());
        jobs.insert(job.id, Arc::new(Mutex::new(job.clone())));
        Ok(job)
    }

    pub async fn job(&self, job_id: JobId) -> Option<Job> {
        let handle = self.handle(job_id).await?;
        let job = handle.lock().await;
        Some(job.clone())
    }

    pub async fn job_ids(&self) -> Vec<JobId> {
        self.jobs.read().await.keys().copied().collect()
    }

    /// Validate and apply a transition together with its queue effect.
    ///
    /// `pending -> running` is refused here; it only happens through
    /// [`claim`](Self::claim).
    pub async fn request_transition(
        &self,
        job_id: JobId,
        from: JobState,
        to: JobState,
    ) -> Result<TransitionOutcome> {
        let transition = Transition::new(from, to);
        let reject = |reason| Error::InvalidTransition {
            job_id,
            from,
            to,
            reason,
        };

        if !transition.is_allowed() {
            return Err(reject(TransitionRejection::EdgeNotAllowed));
        }
        if transition.requires_claim() {
            return Err(reject(TransitionRejection::RequiresClaim));
        }

        let handle = self.handle(job_id).await.ok_or(Error::JobNotFound(job_id))?;
        let mut job = handle.lock().await;
        if job.state != from {
            return Err(reject(TransitionRejection::StateMismatch { actual: job.state }));
        }

        let now = self.clock.now();
        let effect = transition.queue_effect();
        let mut token = None;
        match effect {
            QueueEffect::Enqueue => {
                // On failure the job keeps its current state.
                token = Some(self.effects.push(&job, transition, now).await?);
                job.enqueued_at = Some(now);
            }
            QueueEffect::DequeueUnclaimed => {
                self.effects.pop(&job, transition, PopKind::Unclaimed).await?;
                job.enqueued_at = None;
            }
            QueueEffect::DequeueClaimed | QueueEffect::None => {}
        }

        if to.is_terminal() {
            if let Some(worker_id) = job.claimed_by.take() {
                self.registry.release(&worker_id).await;
            }
        }

        job.state = to;
        job.updated_at = now;
        debug!(job_id = %job_id, %from, %to, %effect, "Transition applied");

        Ok(TransitionOutcome {
            job_id,
            transition,
            effect,
            token,
        })
    }

    /// Hand a queued job to `worker_id`.
    ///
    /// Under the job's lock: re-check that the job is pending and still
    /// queued, take a capacity slot on the worker, pop the entry and move
    /// the job to `running`. Any failure after the slot was taken gives it
    /// back.
    pub async fn claim(&self, job_id: JobId, worker_id: WorkerId) -> Result<ClaimOutcome> {
        let Some(handle) = self.handle(job_id).await else {
            return Ok(ClaimOutcome::NotQueued);
        };

        let mut job = handle.lock().await;
        if job.state != JobState::Pending || !self.queue.contains(job_id).await? {
            return Ok(ClaimOutcome::NotQueued);
        }

        if let ClaimAttempt::Conflict(conflict) = self.registry.try_claim(&worker_id).await {
            return Ok(ClaimOutcome::Conflict(conflict));
        }

        let transition = Transition::new(JobState::Pending, JobState::Running);
        match self.effects.pop(&job, transition, PopKind::Claimed).await {
            Ok(true) => {}
            Ok(false) => {
                self.registry.release(&worker_id).await;
                return Ok(ClaimOutcome::NotQueued);
            }
            Err(e) => {
                self.registry.release(&worker_id).await;
                return Err(e);
            }
        }

        let now = self.clock.now();
        job.state = JobState::Running;
        job.claimed_by = Some(worker_id);
        job.enqueued_at = None;
        job.updated_at = now;
        info!(job_id = %job_id, worker_id = %worker_id, "Job claimed");

        Ok(ClaimOutcome::Claimed {
            worker_id,
            claimed_at: now,
        })
    }

    /// Check one job against the queue under its lock.
    ///
    /// Returns `Some(true)` for a pending job without an entry,
    /// `Some(false)` for a non-pending job with one, `None` when consistent.
    pub(crate) async fn audit(&self, job_id: JobId) -> Result<Option<bool>> {
        let Some(handle) = self.handle(job_id).await else {
            return Ok(None);
        };
        let job = handle.lock().await;
        let queued = self.queue.contains(job_id).await?;
        Ok(match (job.state.is_pending(), queued) {
            (true, false) => Some(true),
            (false, true) => Some(false),
            _ => None,
        })
    }

    async fn handle(&self, job_id: JobId) -> Option<Arc<Mutex<Job>>> {
        self.jobs.read().await.get(&job_id).cloned()
    }
}
