//! Dispatch engine facade.
//!
//! Wires the job table, queue, registry, dispatcher and sweeper together
//! behind the operations the surrounding service calls.

use conveyor_config::{DispatchConfig, DispatchMode};
use conveyor_core::{
    Clock, Error, Heartbeat, Job, JobId, JobSpec, JobState, ProjectId, QueueEffect, Result,
    SystemClock, Worker, WorkerId,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::chrono_duration;
use crate::dispatcher::{DispatchResult, Dispatcher};
use crate::jobs::{JobStateMachine, TransitionOutcome};
use crate::lease::{InMemoryLeaseStore, LeaseStore};
use crate::metrics::{NoopMetrics, QueueMetrics};
use crate::queue::{InMemoryQueue, QueueStore};
use crate::registry::WorkerRegistry;
use crate::sweep::{SweepReport, SweepSettings, Sweeper};

/// Answer to a lifecycle event from the job-authoring system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransitionReport {
    pub applied: bool,
    /// Why the transition was refused.
    pub reason: Option<String>,
    pub effect: QueueEffect,
    /// Outcome of the inline tick, when one ran.
    pub dispatch: Option<DispatchResult>,
}

/// Result of auditing jobs against queue entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsistencyReport {
    pub pending_without_entry: Vec<JobId>,
    /// Entries whose job is not pending, or not known at all.
    pub entries_without_pending: Vec<JobId>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.pending_without_entry.is_empty() && self.entries_without_pending.is_empty()
    }
}

pub struct DispatchEngineBuilder {
    config: DispatchConfig,
    metrics: Option<Arc<dyn QueueMetrics>>,
    clock: Option<Arc<dyn Clock>>,
    queue: Option<Arc<dyn QueueStore>>,
    leases: Option<Arc<dyn LeaseStore>>,
}

impl DispatchEngineBuilder {
    pub fn metrics(mut self, metrics: Arc<dyn QueueMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn queue(mut self, queue: Arc<dyn QueueStore>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn leases(mut self, leases: Arc<dyn LeaseStore>) -> Self {
        self.leases = Some(leases);
        self
    }

    pub fn build(self) -> DispatchEngine {
        let config = self.config;
        let metrics = self.metrics.unwrap_or_else(|| Arc::new(NoopMetrics));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let queue = self
            .queue
            .unwrap_or_else(|| Arc::new(InMemoryQueue::new()));
        let leases = self
            .leases
            .unwrap_or_else(|| Arc::new(InMemoryLeaseStore::new()));

        let registry = Arc::new(WorkerRegistry::new(
            chrono_duration(config.stale_worker_threshold),
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
            config.untagged_workers_accept_untagged_only,
        );
        let sweeper = Sweeper::new(
            dispatcher.clone(),
            queue.clone(),
            registry.clone(),
            metrics,
            leases,
            clock,
            SweepSettings::from(&config),
        );

        DispatchEngine {
            config,
            jobs,
            queue,
            registry,
            dispatcher,
            sweeper,
        }
    }
}

pub struct DispatchEngine {
    config: DispatchConfig,
    jobs: Arc<JobStateMachine>,
    queue: Arc<dyn QueueStore>,
    registry: Arc<WorkerRegistry>,
    dispatcher: Dispatcher,
    sweeper: Sweeper,
}

impl DispatchEngine {
    /// In-memory stores, no metrics, system clock.
    pub fn new(config: DispatchConfig) -> Self {
        Self::builder(config).build()
    }

    pub fn builder(config: DispatchConfig) -> DispatchEngineBuilder {
        DispatchEngineBuilder {
            config,
            metrics: None,
            clock: None,
            queue: None,
            leases: None,
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn mode(&self) -> DispatchMode {
        self.config.dispatch_mode
    }

    pub async fn register_job(&self, spec: JobSpec) -> Result<Job> {
        self.jobs.register_job(spec).await
    }

    pub async fn job(&self, job_id: JobId) -> Option<Job> {
        self.jobs.job(job_id).await
    }

    /// Apply a transition and its queue effect, ticking inline in event mode.
    pub async fn request_transition(
        &self,
        job_id: JobId,
        from: JobState,
        to: JobState,
    ) -> Result<(TransitionOutcome, Option<DispatchResult>)> {
        let outcome = self.jobs.request_transition(job_id, from, to).await?;
        let dispatch = self.dispatch_after(&outcome).await;
        Ok((outcome, dispatch))
    }

    /// Lifecycle event entry point. Refusals come back in the report
    /// rather than as errors.
    pub async fn on_transition(
        &self,
        job_id: JobId,
        from: JobState,
        to: JobState,
    ) -> TransitionReport {
        match self.request_transition(job_id, from, to).await {
            Ok((outcome, dispatch)) => TransitionReport {
                applied: true,
                reason: None,
                effect: outcome.effect,
                dispatch,
            },
            Err(e) => {
                debug!(job_id = %job_id, %from, %to, error = %e, "Transition refused");
                TransitionReport {
                    applied: false,
                    reason: Some(e.to_string()),
                    effect: QueueEffect::None,
                    dispatch: None,
                }
            }
        }
    }

    /// Heartbeat feed.
    ///
    /// When the mode ticks on enqueue, queued entries the worker can take
    /// are ticked right away so a job that found no worker on enqueue does
    /// not wait for a sweep that may never run.
    pub async fn register_or_update(&self, heartbeat: Heartbeat) -> Worker {
        let worker = self.registry.register_or_update(heartbeat).await;
        if !self.config.dispatch_mode.ticks_on_enqueue() {
            return worker;
        }

        match self
            .dispatcher
            .tick_for_worker(&worker.id, self.config.sweep_batch_size)
            .await
        {
            Ok(0) => worker,
            Ok(claimed) => {
                debug!(worker_id = %worker.id, claimed, "Heartbeat dispatched queued jobs");
                self.registry.get(&worker.id).await.unwrap_or(worker)
            }
            Err(e) => {
                error!(worker_id = %worker.id, error = %e, "Heartbeat tick failed");
                worker
            }
        }
    }

    pub async fn worker(&self, worker_id: &WorkerId) -> Option<Worker> {
        self.registry.get(worker_id).await
    }

    pub async fn workers(&self) -> Vec<Worker> {
        self.registry.all().await
    }

    /// Put a job in the queue, registering it first if it is new.
    ///
    /// Equivalent to a `created -> pending` transition; a job already past
    /// `created` is refused with `InvalidTransition`.
    /// A job that is already registered keeps its stored project and tags.
    pub async fn enqueue(&self, spec: JobSpec) -> Result<Option<DispatchResult>> {
        let job_id = spec.id;
        let (project_id, tags) = (spec.project_id, spec.tags.clone());
        match self.jobs.register_job(spec).await {
            Ok(_) => {}
            Err(Error::DuplicateJob(_)) => {
                if let Some(stored) = self.jobs.job(job_id).await {
                    if stored.project_id != project_id || stored.tags != tags {
                        debug!(
                            job_id = %job_id,
                            stored_tags = %stored.tags,
                            requested_tags = %tags,
                            "Enqueue keeps the registered project and tags"
                        );
                    }
                }
            }
            Err(e) => return Err(e),
        }

        let (_, dispatch) = self
            .request_transition(job_id, JobState::Created, JobState::Pending)
            .await?;
        Ok(dispatch)
    }

    /// Take a pending job out of the queue by canceling it.
    pub async fn dequeue(&self, job_id: JobId) -> Result<TransitionOutcome> {
        self.jobs
            .request_transition(job_id, JobState::Pending, JobState::Canceled)
            .await
    }

    pub async fn tick(&self, job_id: JobId) -> Result<DispatchResult> {
        self.dispatcher.tick(job_id).await
    }

    pub fn sweeper(&self) -> &Sweeper {
        &self.sweeper
    }

    pub async fn sweep_once(&self) -> Result<SweepReport> {
        self.sweeper.run_once().await
    }

    /// Start the periodic sweep when the mode includes it.
    pub fn spawn_sweep_loop(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        if !self.config.dispatch_mode.runs_sweep() {
            return None;
        }
        let sweeper = self.sweeper.clone();
        Some(tokio::spawn(async move { sweeper.run(shutdown).await }))
    }

    pub async fn queue_len(&self) -> Result<usize> {
        self.queue.len().await
    }

    pub async fn queue_counts_by_project(&self) -> Result<HashMap<ProjectId, usize>> {
        self.queue.counts_by_project().await
    }

    /// Audit every job against the queue.
    pub async fn verify_consistency(&self) -> Result<ConsistencyReport> {
        let mut report = ConsistencyReport::default();

        for job_id in self.jobs.job_ids().await {
            match self.jobs.audit(job_id).await? {
                Some(true) => report.pending_without_entry.push(job_id),
                Some(false) => report.entries_without_pending.push(job_id),
                None => {}
            }
        }

        let mut cursor = None;
        loop {
            let batch = self
                .queue
                .scan_batch(self.config.sweep_batch_size, cursor)
                .await?;
            for entry in &batch.entries {
                if self.jobs.job(entry.job_id).await.is_none() {
                    report.entries_without_pending.push(entry.job_id);
                }
            }
            match batch.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        if report.is_consistent() {
            info!("Queue consistent with job states");
        } else {
            error!(
                pending_without_entry = report.pending_without_entry.len(),
                entries_without_pending = report.entries_without_pending.len(),
                "Queue out of sync with job states"
            );
        }
        Ok(report)
    }

    async fn dispatch_after(&self, outcome: &TransitionOutcome) -> Option<DispatchResult> {
        if outcome.effect != QueueEffect::Enqueue || !self.config.dispatch_mode.ticks_on_enqueue()
        {
            return None;
        }
        match self.dispatcher.tick(outcome.job_id).await {
            Ok(result) => Some(result),
            Err(e) => {
                error!(job_id = %outcome.job_id, error = %e, "Inline tick failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::InMemoryMetrics;
    use conveyor_core::{ManualClock, TagSet};

    fn engine(mode: DispatchMode) -> (DispatchEngine, Arc<ManualClock>, Arc<InMemoryMetrics>) {
        let clock = Arc::new(ManualClock::default());
        let metrics = Arc::new(InMemoryMetrics::new());
        let config = DispatchConfig {
            dispatch_mode: mode,
            ..Default::default()
        };
        let engine = DispatchEngine::builder(config)
            .clock(clock.clone())
            .metrics(metrics.clone())
            .build();
        (engine, clock, metrics)
    }

    fn spec(tags: &[&str]) -> JobSpec {
        JobSpec::new(
            JobId::new(),
            ProjectId::new(),
            tags.iter().copied().collect(),
        )
    }

    async fn add_worker(engine: &DispatchEngine, clock: &ManualClock) -> WorkerId {
        let hb = Heartbeat::new(WorkerId::new(), TagSet::new(), 1, clock.now());
        engine.register_or_update(hb).await.id
    }

    #[tokio::test]
    async fn test_event_mode_ticks_on_enqueue() {
        let (engine, clock, _) = engine(DispatchMode::Event);
        let worker_id = add_worker(&engine, &clock).await;
        let job = engine.register_job(spec(&[])).await.unwrap();

        let report = engine
            .on_transition(job.id, JobState::Created, JobState::Pending)
            .await;

        assert!(report.applied);
        assert_eq!(report.effect, QueueEffect::Enqueue);
        let claim = report.dispatch.and_then(|d| d.claim().copied()).unwrap();
        assert_eq!(claim.worker_id, worker_id);
        assert_eq!(engine.queue_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sweep_mode_defers_to_sweep() {
        let (engine, clock, _) = engine(DispatchMode::Sweep);
        add_worker(&engine, &clock).await;

        let dispatch = engine.enqueue(spec(&[])).await.unwrap();
        assert!(dispatch.is_none());
        assert_eq!(engine.queue_len().await.unwrap(), 1);

        let report = engine.sweep_once().await.unwrap();
        assert_eq!(report.claimed, 1);
        assert_eq!(engine.queue_len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_refused_transition_is_reported() {
        let (engine, _, _) = engine(DispatchMode::Both);
        let job = engine.register_job(spec(&[])).await.unwrap();

        let report = engine
            .on_transition(job.id, JobState::Running, JobState::Success)
            .await;

        assert!(!report.applied);
        assert!(report.reason.unwrap().contains("job is currently created"));
        assert_eq!(report.effect, QueueEffect::None);
    }

    #[tokio::test]
    async fn test_enqueue_twice_is_refused() {
        let (engine, _, _) = engine(DispatchMode::Both);
        let job = spec(&[]);

        engine.enqueue(job.clone()).await.unwrap();
        let err = engine.enqueue(job).await.unwrap_err();

        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert_eq!(engine.queue_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dequeue_cancels_pending_job() {
        let (engine, _, metrics) = engine(DispatchMode::Both);
        let job = spec(&[]);
        let job_id = job.id;
        engine.enqueue(job).await.unwrap();

        let outcome = engine.dequeue(job_id).await.unwrap();

        assert_eq!(outcome.effect, QueueEffect::DequeueUnclaimed);
        assert_eq!(engine.job(job_id).await.unwrap().state, JobState::Canceled);
        assert_eq!(engine.queue_len().await.unwrap(), 0);
        assert_eq!(metrics.snapshot().queue_pop_unclaimed, 1);
    }

    #[tokio::test]
    async fn test_sweep_loop_only_in_sweep_modes() {
        let (event_engine, _, _) = engine(DispatchMode::Event);
        assert!(
            event_engine
                .spawn_sweep_loop(CancellationToken::new())
                .is_none()
        );

        let (sweep_engine, _, _) = engine(DispatchMode::Both);
        let shutdown = CancellationToken::new();
        let handle = sweep_engine.spawn_sweep_loop(shutdown.clone()).unwrap();
        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_verify_consistency_flags_orphans() {
        let queue = Arc::new(InMemoryQueue::new());
        let engine = DispatchEngine::builder(DispatchConfig::default())
            .queue(queue.clone())
            .build();

        let healthy = spec(&[]);
        engine.enqueue(healthy).await.unwrap();
        assert!(engine.verify_consistency().await.unwrap().is_consistent());

        // A pending job whose entry vanished, and an entry nobody owns.
        let broken = spec(&[]);
        let broken_id = broken.id;
        engine.enqueue(broken).await.unwrap();
        queue.pop(broken_id).await.unwrap();
        let stray = JobId::new();
        queue
            .push(stray, ProjectId::new(), TagSet::new(), chrono::Utc::now())
            .await
            .unwrap();

        let report = engine.verify_consistency().await.unwrap();
        assert_eq!(report.pending_without_entry, vec![broken_id]);
        assert_eq!(report.entries_without_pending, vec![stray]);
    }

    #[tokio::test]
    async fn test_heartbeat_dispatches_waiting_jobs_in_event_mode() {
        let (engine, clock, _) = engine(DispatchMode::Event);
        for _ in 0..2 {
            assert_eq!(
                engine.enqueue(spec(&["docker"])).await.unwrap(),
                Some(DispatchResult::NoEligibleWorker)
            );
        }

        // A worker that cannot run the jobs changes nothing.
        add_worker(&engine, &clock).await;
        assert_eq!(engine.queue_len().await.unwrap(), 2);

        let docker: TagSet = ["docker"].into_iter().collect();
        let hb = Heartbeat::new(WorkerId::new(), docker, 1, clock.now());
        let worker = engine.register_or_update(hb).await;

        assert_eq!(worker.running, 1);
        assert_eq!(engine.queue_len().await.unwrap(), 1);
        assert!(engine.spawn_sweep_loop(CancellationToken::new()).is_none());
    }

    #[tokio::test]
    async fn test_sweep_mode_heartbeat_leaves_queue_alone() {
        let (engine, clock, _) = engine(DispatchMode::Sweep);
        engine.enqueue(spec(&[])).await.unwrap();

        let worker_id = add_worker(&engine, &clock).await;

        assert_eq!(engine.queue_len().await.unwrap(), 1);
        assert_eq!(engine.worker(&worker_id).await.unwrap().running, 0);
    }

    #[tokio::test]
    async fn test_unrepresentable_lease_fails_sweep() {
        let config = DispatchConfig {
            lease_timeout: std::time::Duration::MAX,
            ..Default::default()
        };
        let engine = DispatchEngine::new(config);
        engine.enqueue(spec(&[])).await.unwrap();

        let err = engine.sweep_once().await.unwrap_err();

        assert!(matches!(err, Error::LeaseOutOfRange { .. }));
        assert_eq!(engine.queue_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_keeps_registered_tags() {
        let (engine, _, _) = engine(DispatchMode::Sweep);
        let registered = engine.register_job(spec(&["docker"])).await.unwrap();
        let resent = JobSpec::new(
            registered.id,
            registered.project_id,
            ["gpu"].into_iter().collect(),
        );

        engine.enqueue(resent).await.unwrap();

        let job = engine.job(registered.id).await.unwrap();
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.tags, registered.tags);
    }
}
