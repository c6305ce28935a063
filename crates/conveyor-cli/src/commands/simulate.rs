//! In-memory dispatch simulation.

use anyhow::{Context, Result};
use conveyor_config::{DispatchConfig, load_dispatch_config};
use conveyor_core::{
    Clock, Heartbeat, JobId, JobSpec, JobState, ProjectId, SystemClock, TagSet, WorkerId,
};
use conveyor_scheduler::{DispatchEngine, InMemoryMetrics};
use std::sync::Arc;
use tracing::info;

pub struct SimulateOptions {
    pub workers: usize,
    pub capacity: u32,
    pub jobs: usize,
    pub tags: Vec<String>,
    pub rounds: usize,
}

/// Register workers, enqueue jobs and sweep until the queue drains.
///
/// Jobs claimed in a round finish before the next round starts.
pub async fn run(config_path: Option<&str>, options: SimulateOptions) -> Result<()> {
    let config = match config_path {
        Some(path) => load_dispatch_config(path)
            .with_context(|| format!("Failed to load config file: {}", path))?,
        None => DispatchConfig::default(),
    };
    info!(mode = ?config.dispatch_mode, "Starting simulation");

    let metrics = Arc::new(InMemoryMetrics::new());
    let engine = DispatchEngine::builder(config).metrics(metrics.clone()).build();
    let clock = SystemClock;
    let tags: TagSet = options.tags.iter().cloned().collect();

    for _ in 0..options.workers {
        let heartbeat =
            Heartbeat::new(WorkerId::new(), tags.clone(), options.capacity, clock.now());
        engine.register_or_update(heartbeat).await;
    }

    let project_id = ProjectId::new();
    let mut job_ids = Vec::with_capacity(options.jobs);
    for _ in 0..options.jobs {
        let spec = JobSpec::new(JobId::new(), project_id, tags.clone());
        job_ids.push(spec.id);
        engine.enqueue(spec).await.context("Failed to enqueue job")?;
    }

    println!("Workers: {} (capacity {})", options.workers, options.capacity);
    println!("Jobs: {} (tags {})", options.jobs, tags);
    println!("Queued after enqueue: {}", engine.queue_len().await?);

    for round in 1..=options.rounds {
        let report = engine.sweep_once().await.context("Sweep failed")?;
        let finished = finish_running(&engine, &job_ids).await;
        let waiting = engine.queue_len().await?;
        println!(
            "Round {}: {} claimed, {} finished, {} waiting",
            round, report.claimed, finished, waiting
        );
        if waiting == 0 {
            break;
        }
    }

    let consistency = engine.verify_consistency().await?;
    if !consistency.is_consistent() {
        anyhow::bail!("Queue out of sync with job states: {:?}", consistency);
    }

    println!("{}", serde_json::to_string_pretty(&metrics.snapshot())?);
    Ok(())
}

async fn finish_running(engine: &DispatchEngine, job_ids: &[JobId]) -> usize {
    let mut finished = 0;
    for job_id in job_ids {
        let running = matches!(
            engine.job(*job_id).await.map(|job| job.state),
            Some(JobState::Running)
        );
        if running
            && engine
                .on_transition(*job_id, JobState::Running, JobState::Success)
                .await
                .applied
        {
            finished += 1;
        }
    }
    finished
}
