//! Error types for Conveyor.

use derive_more::Display;
use thiserror::Error;

use crate::{JobId, JobState};

/// Why a transition request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum TransitionRejection {
    /// The caller's `from` state no longer matches the recorded state.
    #[display("job is currently {actual}")]
    StateMismatch { actual: JobState },

    /// The edge is not part of the job lifecycle.
    #[display("edge not allowed")]
    EdgeNotAllowed,

    /// `pending -> running` only happens through a worker claim.
    #[display("edge requires a worker claim")]
    RequiresClaim,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid transition for job {job_id}: {from} -> {to} ({reason})")]
    InvalidTransition {
        job_id: JobId,
        from: JobState,
        to: JobState,
        reason: TransitionRejection,
    },

    #[error("invalid queue transition: {from} -> {to}")]
    InvalidQueueTransition { from: JobState, to: JobState },

    #[error("duplicate queue entry for job {0}")]
    DuplicateEntry(JobId),

    #[error("duplicate job: {0}")]
    DuplicateJob(JobId),

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("lease already taken: {key}")]
    LeaseTaken { key: String },

    #[error("lease timeout for {key} runs past the representable time range")]
    LeaseOutOfRange { key: String },
}

impl Error {
    /// Errors the caller should treat as "skip this cycle" rather than failure.
    pub fn is_lease_taken(&self) -> bool {
        matches!(self, Error::LeaseTaken { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
