//! Worker registry.
//!
//! The live set of workers known to the dispatcher, fed by heartbeats.
//! Workers are never removed here; a worker that stops checking in simply
//! drops out of [`WorkerRegistry::available_workers`] once it is stale.

use chrono::Duration;
use conveyor_core::{Clock, Heartbeat, ProjectId, Worker, WorkerId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Why a claim against a worker was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimConflict {
    UnknownWorker,
    Stale,
    NoCapacity,
}

/// Result of [`WorkerRegistry::try_claim`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimAttempt {
    Claimed,
    Conflict(ClaimConflict),
}

pub struct WorkerRegistry {
    workers: RwLock<HashMap<WorkerId, Arc<Mutex<Worker>>>>,
    stale_after: Duration,
    clock: Arc<dyn Clock>,
}

impl WorkerRegistry {
    pub fn new(stale_after: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            workers: RwLock::new(HashMap::new()),
            stale_after,
            clock,
        }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// Record a heartbeat, registering the worker on first contact.
    pub async fn register_or_update(&self, heartbeat: Heartbeat) -> Worker {
        let worker_id = heartbeat.worker_id;

        if let Some(handle) = self.handle(&worker_id).await {
            let mut worker = handle.lock().await;
            worker.apply_heartbeat(heartbeat);
            return worker.clone();
        }

        let mut workers = self.workers.write().await;
        // Another heartbeat may have registered it while we waited for the write lock.
        if let Some(handle) = workers.get(&worker_id) {
            let mut worker = handle.lock().await;
            worker.apply_heartbeat(heartbeat);
            return worker.clone();
        }

        let worker = Worker::from_heartbeat(heartbeat);
        info!(
            worker_id = %worker_id,
            tags = %worker.tags,
            capacity = worker.capacity,
            "Worker registered"
        );
        workers.insert(worker_id, Arc::new(Mutex::new(worker.clone())));
        worker
    }

    pub async fn get(&self, worker_id: &WorkerId) -> Option<Worker> {
        let handle = self.handle(worker_id).await?;
        let worker = handle.lock().await;
        Some(worker.clone())
    }

    /// Workers that can take a job for `project_id` right now: in scope,
    /// with spare capacity and recent contact.
    ///
    /// The result is a snapshot; claims re-validate before committing.
    pub async fn available_workers(&self, project_id: &ProjectId) -> Vec<Worker> {
        let now = self.clock.now();
        let mut available = Vec::new();
        for handle in self.handles().await {
            let worker = handle.lock().await;
            if worker.scope.serves(project_id) && worker.is_available(now, self.stale_after) {
                available.push(worker.clone());
            }
        }
        available
    }

    /// Number of workers with recent contact, regardless of spare capacity.
    pub async fn active_count(&self) -> usize {
        let now = self.clock.now();
        let mut count = 0;
        for handle in self.handles().await {
            if handle.lock().await.is_fresh(now, self.stale_after) {
                count += 1;
            }
        }
        count
    }

    pub async fn all(&self) -> Vec<Worker> {
        let mut workers = Vec::new();
        for handle in self.handles().await {
            workers.push(handle.lock().await.clone());
        }
        workers
    }

    /// Take one capacity slot on the worker if it is still fresh and has room.
    pub async fn try_claim(&self, worker_id: &WorkerId) -> ClaimAttempt {
        let Some(handle) = self.handle(worker_id).await else {
            return ClaimAttempt::Conflict(ClaimConflict::UnknownWorker);
        };

        let now = self.clock.now();
        let mut worker = handle.lock().await;
        if !worker.is_fresh(now, self.stale_after) {
            return ClaimAttempt::Conflict(ClaimConflict::Stale);
        }
        if worker.remaining_capacity() == 0 {
            return ClaimAttempt::Conflict(ClaimConflict::NoCapacity);
        }

        worker.running += 1;
        worker.last_claimed_at = Some(now);
        ClaimAttempt::Claimed
    }

    /// Give back a capacity slot taken by [`try_claim`](Self::try_claim).
    pub async fn release(&self, worker_id: &WorkerId) -> bool {
        let Some(handle) = self.handle(worker_id).await else {
            debug!(worker_id = %worker_id, "Release for unknown worker ignored");
            return false;
        };

        let mut worker = handle.lock().await;
        if worker.running == 0 {
            debug!(worker_id = %worker_id, "Release with no running jobs ignored");
            return false;
        }
        worker.running -= 1;
        true
    }

    async fn handle(&self, worker_id: &WorkerId) -> Option<Arc<Mutex<Worker>>> {
        self.workers.read().await.get(worker_id).cloned()
    }

    async fn handles(&self) -> Vec<Arc<Mutex<Worker>>> {
        self.workers.read().await.values().cloned().collect()
    }
}
