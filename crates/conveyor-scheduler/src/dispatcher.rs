//! Tick protocol.
//!
//! One tick takes a queued job, ranks the eligible workers and offers the
//! job to each in turn until one claim sticks. Lost races are resolved here
//! and never surface as errors.

use chrono::{DateTime, Utc};
use conveyor_core::{Clock, JobId, Result, Worker, WorkerId};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info};

use crate::jobs::{ClaimOutcome, JobStateMachine};
use crate::matcher::{MatchPolicy, match_workers};
use crate::metrics::QueueMetrics;
use crate::queue::{QueueEntry, QueueStore};
use crate::registry::WorkerRegistry;

/// A job handed to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Claim {
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub claimed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DispatchResult {
    Claimed(Claim),
    /// Every candidate was saturated, stale or lost the race. The entry
    /// stays queued for a later tick.
    NoEligibleWorker,
    /// The entry is gone: claimed elsewhere or canceled.
    AlreadyClaimed,
}

impl DispatchResult {
    pub fn is_claimed(&self) -> bool {
        matches!(self, DispatchResult::Claimed(_))
    }

    pub fn claim(&self) -> Option<&Claim> {
        match self {
            DispatchResult::Claimed(claim) => Some(claim),
            _ => None,
        }
    }
}

#[derive(Clone)]
pub struct Dispatcher {
    jobs: Arc<JobStateMachine>,
    queue: Arc<dyn QueueStore>,
    registry: Arc<WorkerRegistry>,
    metrics: Arc<dyn QueueMetrics>,
    clock: Arc<dyn Clock>,
    untagged_workers_accept_untagged_only: bool,
}

impl Dispatcher {
    pub fn new(
        jobs: Arc<JobStateMachine>,
        queue: Arc<dyn QueueStore>,
        registry: Arc<WorkerRegistry>,
        metrics: Arc<dyn QueueMetrics>,
        clock: Arc<dyn Clock>,
        untagged_workers_accept_untagged_only: bool,
    ) -> Self {
        Self {
            jobs,
            queue,
            registry,
            metrics,
            clock,
            untagged_workers_accept_untagged_only,
        }
    }

    /// Tick a job by id. A job without a queue entry is a no-op.
    pub async fn tick(&self, job_id: JobId) -> Result<DispatchResult> {
        match self.queue.get(job_id).await? {
            Some(entry) => self.tick_entry(&entry).await,
            None => {
                debug!(job_id = %job_id, "Tick for job that is not queued");
                Ok(DispatchResult::AlreadyClaimed)
            }
        }
    }

    /// Tick an entry read from the queue, possibly from a stale snapshot.
    pub async fn tick_entry(&self, entry: &QueueEntry) -> Result<DispatchResult> {
        let ranked = self.rank(entry).await;
        if ranked.is_empty() {
            debug!(job_id = %entry.job_id, tags = %entry.tags, "No eligible worker");
            return Ok(DispatchResult::NoEligibleWorker);
        }
        self.offer(entry, ranked).await
    }

    /// Tick queued entries `worker_id` could run until it has no spare
    /// capacity or the queue is exhausted. Returns the number of claims.
    ///
    /// Each entry still goes through the full tick, so a longer-idle worker
    /// may win it instead.
    pub async fn tick_for_worker(&self, worker_id: &WorkerId, batch_size: usize) -> Result<usize> {
        let mut claimed = 0;
        let mut cursor = None;
        loop {
            let batch = self.queue.scan_batch(batch_size, cursor).await?;
            for entry in &batch.entries {
                let Some(worker) = self.registry.get(worker_id).await else {
                    return Ok(claimed);
                };
                let policy = self.policy();
                if !worker.is_available(policy.now, policy.stale_after) {
                    return Ok(claimed);
                }
                if match_workers(entry, [worker], &policy).is_empty() {
                    continue;
                }
                if self.tick_entry(entry).await?.is_claimed() {
                    claimed += 1;
                }
            }
            match batch.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(claimed),
            }
        }
    }

    fn policy(&self) -> MatchPolicy {
        MatchPolicy {
            now: self.clock.now(),
            stale_after: self.registry.stale_after(),
            untagged_workers_accept_untagged_only: self.untagged_workers_accept_untagged_only,
        }
    }

    async fn rank(&self, entry: &QueueEntry) -> Vec<Worker> {
        let candidates = self.registry.available_workers(&entry.project_id).await;
        match_workers(entry, candidates, &self.policy())
    }

    /// Offer the entry to each worker in order until one claim sticks.
    ///
    /// `ranked` is a snapshot; a worker that filled up since is skipped.
    async fn offer(&self, entry: &QueueEntry, ranked: Vec<Worker>) -> Result<DispatchResult> {
        for worker in ranked {
            self.metrics.increment_worker_tick(&worker.id);

            match self.jobs.claim(entry.job_id, worker.id).await? {
                ClaimOutcome::Claimed {
                    worker_id,
                    claimed_at,
                } => {
                    info!(
                        job_id = %entry.job_id,
                        worker_id = %worker_id,
                        project_id = %entry.project_id,
                        "Dispatched job"
                    );
                    return Ok(DispatchResult::Claimed(Claim {
                        job_id: entry.job_id,
                        worker_id,
                        claimed_at,
                    }));
                }
                ClaimOutcome::NotQueued => {
                    debug!(job_id = %entry.job_id, "Entry left the queue during tick");
                    return Ok(DispatchResult::AlreadyClaimed);
                }
                ClaimOutcome::Conflict(conflict) => {
                    debug!(
                        job_id = %entry.job_id,
                        worker_id = %worker.id,
                        ?conflict,
                        "Claim lost, trying next worker"
                    );
                }
            }
        }

        Ok(DispatchResult::NoEligibleWorker)
    }
}
