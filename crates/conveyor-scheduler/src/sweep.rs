//! Periodic sweep over the pending queue.
//!
//! A sweep pages through the queue and ticks every entry still present,
//! recovering jobs whose event tick was missed or found no worker. Each
//! pass holds a lease so overlapping passes never duplicate work, and
//! checkpoints its cursor after every batch so a pass that is cut short
//! (batch cap, crash, lease expiry) is picked up where it stopped.

use chrono::{DateTime, Utc};
use conveyor_config::DispatchConfig;
use conveyor_core::{Clock, Result};
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::chrono_duration;
use crate::dispatcher::{DispatchResult, Dispatcher};
use crate::lease::{LeaseStore, LeaseToken};
use crate::metrics::QueueMetrics;
use crate::queue::{QueueCursor, QueueEntry, QueueStore};
use crate::registry::WorkerRegistry;

/// Lease key guarding sweep passes.
pub const SWEEP_LEASE_KEY: &str = "dispatch-sweep";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepSettings {
    pub interval: Duration,
    pub batch_size: usize,
    pub concurrency: usize,
    pub max_batches: Option<usize>,
    pub lease_timeout: Duration,
}

impl From<&DispatchConfig> for SweepSettings {
    fn from(config: &DispatchConfig) -> Self {
        Self {
            interval: config.sweep_interval,
            batch_size: config.sweep_batch_size,
            concurrency: config.sweep_concurrency,
            max_batches: config.sweep_max_batches,
            lease_timeout: config.lease_timeout,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepStatus {
    /// No pass has run yet.
    Idle,
    /// A pass is running, or its holder went away mid-pass.
    Ongoing,
    /// A pass stopped early; the next one resumes from its cursor.
    Unfinished,
    Completed,
}

/// Checkpoint shared between passes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweepProgress {
    /// Last entry fully handled by the current pass.
    pub cursor: Option<QueueCursor>,
    pub status: SweepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for SweepProgress {
    fn default() -> Self {
        Self {
            cursor: None,
            status: SweepStatus::Idle,
            started_at: None,
            updated_at: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub batches: usize,
    pub ticked: usize,
    pub claimed: usize,
    pub no_eligible: usize,
    pub already_claimed: usize,
    pub errors: usize,
    /// The pass continued an earlier one instead of starting at the head.
    pub resumed: bool,
    /// The pass reached the end of the queue.
    pub completed: bool,
}

impl SweepReport {
    fn record(&mut self, outcome: Result<DispatchResult>) {
        self.ticked += 1;
        match outcome {
            Ok(DispatchResult::Claimed(_)) => self.claimed += 1,
            Ok(DispatchResult::NoEligibleWorker) => self.no_eligible += 1,
            Ok(DispatchResult::AlreadyClaimed) => self.already_claimed += 1,
            Err(e) => {
                error!(error = %e, "Tick failed during sweep");
                self.errors += 1;
            }
        }
    }
}

#[derive(Clone)]
pub struct Sweeper {
    dispatcher: Dispatcher,
    queue: Arc<dyn QueueStore>,
    registry: Arc<WorkerRegistry>,
    metrics: Arc<dyn QueueMetrics>,
    leases: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    settings: SweepSettings,
    progress: Arc<Mutex<SweepProgress>>,
}

impl Sweeper {
    pub fn new(
        dispatcher: Dispatcher,
        queue: Arc<dyn QueueStore>,
        registry: Arc<WorkerRegistry>,
        metrics: Arc<dyn QueueMetrics>,
        leases: Arc<dyn LeaseStore>,
        clock: Arc<dyn Clock>,
        settings: SweepSettings,
    ) -> Self {
        Self {
            dispatcher,
            queue,
            registry,
            metrics,
            leases,
            clock,
            settings,
            progress: Arc::new(Mutex::new(SweepProgress::default())),
        }
    }

    pub fn settings(&self) -> &SweepSettings {
        &self.settings
    }

    pub async fn progress(&self) -> SweepProgress {
        self.progress.lock().await.clone()
    }

    /// Run one pass under the sweep lease.
    ///
    /// Fails with `LeaseTaken` when another pass holds the lease.
    pub async fn run_once(&self) -> Result<SweepReport> {
        let lease = self
            .leases
            .try_obtain(
                SWEEP_LEASE_KEY,
                chrono_duration(self.settings.lease_timeout),
                self.clock.now(),
            )
            .await?;

        let result = self.sweep().await;
        self.release(&lease).await;

        let report = result?;
        info!(
            batches = report.batches,
            ticked = report.ticked,
            claimed = report.claimed,
            no_eligible = report.no_eligible,
            already_claimed = report.already_claimed,
            errors = report.errors,
            resumed = report.resumed,
            completed = report.completed,
            "Sweep finished"
        );
        Ok(report)
    }

    /// Run passes every `interval` until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.settings.interval, "Sweep loop started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Sweep loop stopped");
                    break;
                }
                _ = interval.tick() => {
                    match self.run_once().await {
                        Ok(_) => {}
                        Err(e) if e.is_lease_taken() => {
                            debug!("Sweep lease held elsewhere, skipping cycle");
                        }
                        Err(e) => error!(error = %e, "Sweep failed"),
                    }
                }
            }
        }
    }

    async fn sweep(&self) -> Result<SweepReport> {
        self.metrics
            .observe_active_workers(self.registry.active_count().await);

        let (mut cursor, resumed) = self.begin().await;
        let mut report = SweepReport {
            resumed,
            ..Default::default()
        };

        loop {
            if let Some(max) = self.settings.max_batches {
                if report.batches >= max {
                    self.checkpoint(cursor, SweepStatus::Unfinished).await;
                    debug!(batches = report.batches, "Sweep reached batch cap");
                    break;
                }
            }

            let batch = self
                .queue
                .scan_batch(self.settings.batch_size, cursor)
                .await?;
            self.tick_batch(batch.entries, &mut report).await;
            report.batches += 1;

            match batch.next_cursor {
                Some(next) => {
                    cursor = Some(next);
                    self.checkpoint(cursor, SweepStatus::Ongoing).await;
                }
                None => {
                    self.checkpoint(None, SweepStatus::Completed).await;
                    report.completed = true;
                    break;
                }
            }
        }

        Ok(report)
    }

    /// Decide where this pass starts and mark it ongoing.
    async fn begin(&self) -> (Option<QueueCursor>, bool) {
        let now = self.clock.now();
        let mut progress = self.progress.lock().await;

        let resumed = match progress.status {
            SweepStatus::Ongoing => {
                warn!(
                    cursor = ?progress.cursor,
                    started_at = ?progress.started_at,
                    "Previous sweep never finished, resuming from its checkpoint"
                );
                true
            }
            SweepStatus::Unfinished => true,
            SweepStatus::Idle | SweepStatus::Completed => false,
        };

        if resumed {
            info!(cursor = ?progress.cursor, "Resuming unfinished sweep");
        } else {
            progress.cursor = None;
            progress.started_at = Some(now);
        }
        progress.status = SweepStatus::Ongoing;
        progress.updated_at = Some(now);

        (progress.cursor, resumed)
    }

    async fn checkpoint(&self, cursor: Option<QueueCursor>, status: SweepStatus) {
        let mut progress = self.progress.lock().await;
        progress.cursor = cursor;
        progress.status = status;
        progress.updated_at = Some(self.clock.now());
    }

    async fn tick_batch(&self, entries: Vec<QueueEntry>, report: &mut SweepReport) {
        let outcomes: Vec<Result<DispatchResult>> = stream::iter(entries)
            .map(|entry| {
                let dispatcher = self.dispatcher.clone();
                async move { dispatcher.tick_entry(&entry).await }
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect()
            .await;

        for outcome in outcomes {
            report.record(outcome);
        }
    }

    async fn release(&self, lease: &LeaseToken) {
        if !self.leases.release(lease).await {
            warn!(
                key = %lease.key,
                expires_at = %lease.expires_at,
                "Sweep lease expired before release"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobStateMachine;
    use crate::lease::InMemoryLeaseStore;
    use crate::metrics::InMemoryMetrics;
    use crate::queue::InMemoryQueue;
    use conveyor_core::{
        Heartbeat, JobId, JobSpec, JobState, ManualClock, ProjectId, TagSet, WorkerId,
    };

    struct Fixture {
        sweeper: Sweeper,
        jobs: Arc<JobStateMachine>,
        registry: Arc<WorkerRegistry>,
        leases: Arc<InMemoryLeaseStore>,
        metrics: Arc<InMemoryMetrics>,
        clock: Arc<ManualClock>,
    }

    fn settings(batch_size: usize, max_batches: Option<usize>) -> SweepSettings {
        SweepSettings {
            interval: Duration::from_secs(60),
            batch_size,
            concurrency: 2,
            max_batches,
            lease_timeout: Duration::from_secs(600),
        }
    }

    fn fixture(settings: SweepSettings) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let queue = Arc::new(InMemoryQueue::new());
        let metrics = Arc::new(InMemoryMetrics::new());
        let leases = Arc::new(InMemoryLeaseStore::new());
        let registry = Arc::new(WorkerRegistry::new(
            chrono::Duration::minutes(5),
            clock.clone(),
        ));
        let jobs = Arc::new(JobStateMachine::new(
            queue.clone(),
            registry.clone(),
            metrics.clone(),
            clock.clone(),
        ));
        let dispatcher = Dispatcher::new(
            jobs.clone(),
            queue.clone(),
            registry.clone(),
            metrics.clone(),
            clock.clone(),
            true,
        );
        let sweeper = Sweeper::new(
            dispatcher,
            queue,
            registry.clone(),
            metrics.clone(),
            leases.clone(),
            clock.clone(),
            settings,
        );
        Fixture {
            sweeper,
            jobs,
            registry,
            leases,
            metrics,
            clock,
        }
    }

    async fn pending_jobs(f: &Fixture, count: usize) -> Vec<JobId> {
        let mut ids = Vec::new();
        for _ in 0..count {
            let spec = JobSpec::new(JobId::new(), ProjectId::new(), TagSet::new());
            let job_id = f.jobs.register_job(spec).await.unwrap().id;
            f.jobs
                .request_transition(job_id, JobState::Created, JobState::Pending)
                .await
                .unwrap();
            ids.push(job_id);
        }
        ids
    }

    async fn worker(f: &Fixture, capacity: u32) -> WorkerId {
        let hb = Heartbeat::new(WorkerId::new(), TagSet::new(), capacity, f.clock.now());
        f.registry.register_or_update(hb).await.id
    }

    #[tokio::test]
    async fn test_sweep_claims_queued_jobs() {
        let f = fixture(settings(2, None));
        pending_jobs(&f, 5).await;
        worker(&f, 3).await;

        let report = f.sweeper.run_once().await.unwrap();

        assert_eq!(report.batches, 3);
        assert_eq!(report.ticked, 5);
        assert_eq!(report.claimed, 3);
        assert_eq!(report.no_eligible, 2);
        assert!(report.completed);
        assert!(!report.resumed);
        assert_eq!(f.sweeper.progress().await.status, SweepStatus::Completed);
        assert_eq!(f.metrics.snapshot().active_workers, 1);
    }

    #[tokio::test]
    async fn test_repeat_sweep_claims_nothing_new() {
        let f = fixture(settings(10, None));
        pending_jobs(&f, 3).await;
        worker(&f, 1).await;

        let first = f.sweeper.run_once().await.unwrap();
        let second = f.sweeper.run_once().await.unwrap();

        assert_eq!(first.claimed, 1);
        assert_eq!(second.claimed, 0);
        assert_eq!(f.metrics.snapshot().queue_pop_claimed, 1);
    }

    #[tokio::test]
    async fn test_batch_cap_leaves_sweep_unfinished() {
        let f = fixture(settings(2, Some(1)));
        pending_jobs(&f, 5).await;

        let first = f.sweeper.run_once().await.unwrap();
        assert_eq!(first.ticked, 2);
        assert!(!first.completed);
        let progress = f.sweeper.progress().await;
        assert_eq!(progress.status, SweepStatus::Unfinished);
        assert!(progress.cursor.is_some());

        let second = f.sweeper.run_once().await.unwrap();
        assert!(second.resumed);
        assert_eq!(second.ticked, 2);

        let third = f.sweeper.run_once().await.unwrap();
        assert_eq!(third.ticked, 1);
        assert!(third.completed);

        let fourth = f.sweeper.run_once().await.unwrap();
        assert!(!fourth.resumed);
        assert_eq!(fourth.ticked, 2);
    }

    #[tokio::test]
    async fn test_abandoned_sweep_is_resumed() {
        let f = fixture(settings(2, None));
        pending_jobs(&f, 4).await;
        let first_page = f
            .sweeper
            .queue
            .scan_batch(2, None)
            .await
            .unwrap()
            .next_cursor;

        // A holder that checkpointed one batch and then vanished.
        *f.sweeper.progress.lock().await = SweepProgress {
            cursor: first_page,
            status: SweepStatus::Ongoing,
            started_at: Some(f.clock.now()),
            updated_at: Some(f.clock.now()),
        };

        let report = f.sweeper.run_once().await.unwrap();
        assert!(report.resumed);
        assert_eq!(report.ticked, 2);
        assert!(report.completed);
    }

    #[tokio::test]
    async fn test_held_lease_skips_pass() {
        let f = fixture(settings(10, None));
        pending_jobs(&f, 1).await;
        worker(&f, 1).await;

        let held = f
            .leases
            .try_obtain(SWEEP_LEASE_KEY, chrono::Duration::minutes(10), f.clock.now())
            .await
            .unwrap();

        let err = f.sweeper.run_once().await.unwrap_err();
        assert!(err.is_lease_taken());
        assert_eq!(f.metrics.snapshot().queue_pop_claimed, 0);

        f.leases.release(&held).await;
        assert_eq!(f.sweeper.run_once().await.unwrap().claimed, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let f = fixture(settings(10, None));
        let shutdown = CancellationToken::new();

        let sweeper = f.sweeper.clone();
        let token = shutdown.clone();
        let handle = tokio::spawn(async move { sweeper.run(token).await });

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
