//! Matching queued jobs to workers.
//!
//! [`match_workers`] is pure: given an entry and a set of candidate workers
//! it returns the eligible ones in the order they should be offered the job.
//! Workers that went longest without a claim come first so load spreads
//! across the fleet; ties fall back to worker id so results are stable.

use chrono::{DateTime, Duration, Utc};
use conveyor_core::{TagSet, Worker};

use crate::queue::QueueEntry;

/// Inputs to eligibility besides the entry and the worker.
#[derive(Debug, Clone, Copy)]
pub struct MatchPolicy {
    pub now: DateTime<Utc>,
    pub stale_after: Duration,
    /// When false, workers without tags accept any job.
    pub untagged_workers_accept_untagged_only: bool,
}

/// Rank the workers eligible to run `entry`.
pub fn match_workers(
    entry: &QueueEntry,
    candidates: impl IntoIterator<Item = Worker>,
    policy: &MatchPolicy,
) -> Vec<Worker> {
    let mut eligible: Vec<Worker> = candidates
        .into_iter()
        .filter(|worker| is_eligible(entry, worker, policy))
        .collect();

    eligible.sort_by(|a, b| {
        a.last_claimed_at
            .cmp(&b.last_claimed_at)
            .then_with(|| a.id.cmp(&b.id))
    });
    eligible
}

fn is_eligible(entry: &QueueEntry, worker: &Worker, policy: &MatchPolicy) -> bool {
    worker.scope.serves(&entry.project_id)
        && worker.is_available(policy.now, policy.stale_after)
        && accepts_tags(&entry.tags, worker, policy)
}

fn accepts_tags(required: &TagSet, worker: &Worker, policy: &MatchPolicy) -> bool {
    if worker.tags.is_empty() {
        return required.is_empty() || !policy.untagged_workers_accept_untagged_only;
    }
    if required.is_empty() {
        return worker.run_untagged;
    }
    required.is_subset_of(&worker.tags)
}
