//! Core domain types for the Conveyor CI job queue.
//!
//! This crate contains:
//! - Resource identifiers (jobs, projects, workers)
//! - The job lifecycle state machine and queue effects
//! - Capability tag sets
//! - Worker registration records
//! - A clock abstraction for deterministic time
//! - Error types shared by every Conveyor crate

pub mod clock;
pub mod error;
pub mod id;
pub mod job;
pub mod tags;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result, TransitionRejection};
pub use id::{JobId, ProjectId, WorkerId};
pub use job::{Job, JobSpec, JobState, QueueEffect, Transition};
pub use tags::TagSet;
pub use worker::{Heartbeat, Worker, WorkerScope};
