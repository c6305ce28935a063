//! Pending queue and worker dispatch for Conveyor.
//!
//! Tracks which jobs wait to run, keeps the queue in lockstep with the job
//! state machine, and hands queued jobs to eligible workers with at most one
//! successful claim per job.
//!
//! There is no global lock: every job has its own mutex which scopes the
//! "transition + queue push/pop" and "claim" units, and every worker has its
//! own mutex guarding its capacity. Locks are always taken job first, then
//! worker.

pub mod dispatcher;
pub mod engine;
pub mod jobs;
pub mod lease;
pub mod matcher;
pub mod metrics;
pub mod queue;
pub mod registry;
pub mod sweep;

pub use dispatcher::{Claim, DispatchResult, Dispatcher};
pub use engine::{ConsistencyReport, DispatchEngine, DispatchEngineBuilder, TransitionReport};
pub use jobs::{ClaimOutcome, JobStateMachine, QueueEffects, TransitionOutcome};
pub use lease::{InMemoryLeaseStore, LeaseStore, LeaseToken};
pub use matcher::{MatchPolicy, match_workers};
pub use metrics::{
    ChannelMetrics, InMemoryMetrics, LogMetrics, MetricEvent, MetricsSnapshot, NoopMetrics,
    PopKind, QueueMetrics,
};
pub use queue::{InMemoryQueue, QueueBatch, QueueCursor, QueueEntry, QueueStore, QueueToken};
pub use registry::{ClaimAttempt, ClaimConflict, WorkerRegistry};
pub use sweep::{
    SWEEP_LEASE_KEY, SweepProgress, SweepReport, SweepSettings, SweepStatus, Sweeper,
};

/// Convert a configured duration for comparisons against chrono timestamps.
pub(crate) fn chrono_duration(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::TimeDelta::MAX)
}
