//! Queue metrics sink.
//!
//! The dispatch path only ever writes to a [`QueueMetrics`] sink. Methods
//! return nothing and must not block, so a slow or broken exporter can never
//! hold up or fail a claim.

use conveyor_core::WorkerId;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

/// Why an entry left the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PopKind {
    /// A worker claimed the job.
    Claimed,
    /// The job left pending without running (e.g. canceled).
    Unclaimed,
}

/// Write-only metrics consumed by the dispatcher.
pub trait QueueMetrics: Send + Sync {
    fn increment_queue_push(&self);

    fn increment_queue_pop(&self, kind: PopKind);

    /// Gauge of workers with recent contact, sampled once per sweep.
    fn observe_active_workers(&self, count: usize);

    /// A worker was offered a job.
    fn increment_worker_tick(&self, worker_id: &WorkerId);

    fn increment_duplicate_entry(&self);

    fn increment_consistency_violation(&self);
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl QueueMetrics for NoopMetrics {
    fn increment_queue_push(&self) {}
    fn increment_queue_pop(&self, _kind: PopKind) {}
    fn observe_active_workers(&self, _count: usize) {}
    fn increment_worker_tick(&self, _worker_id: &WorkerId) {}
    fn increment_duplicate_entry(&self) {}
    fn increment_consistency_violation(&self) {}
}

/// Emits each metric as a `tracing` debug event.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMetrics;

impl QueueMetrics for LogMetrics {
    fn increment_queue_push(&self) {
        debug!(metric = "queue_push", "Metric");
    }

    fn increment_queue_pop(&self, kind: PopKind) {
        debug!(metric = "queue_pop", ?kind, "Metric");
    }

    fn observe_active_workers(&self, count: usize) {
        debug!(metric = "active_workers", count, "Metric");
    }

    fn increment_worker_tick(&self, worker_id: &WorkerId) {
        debug!(metric = "worker_tick", worker_id = %worker_id, "Metric");
    }

    fn increment_duplicate_entry(&self) {
        debug!(metric = "duplicate_entry", "Metric");
    }

    fn increment_consistency_violation(&self) {
        debug!(metric = "consistency_violation", "Metric");
    }
}

/// Point-in-time copy of [`InMemoryMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub queue_push: u64,
    pub queue_pop_claimed: u64,
    pub queue_pop_unclaimed: u64,
    pub active_workers: u64,
    pub duplicate_entries: u64,
    pub consistency_violations: u64,
    pub worker_ticks: HashMap<WorkerId, u64>,
}

impl MetricsSnapshot {
    pub fn total_worker_ticks(&self) -> u64 {
        self.worker_ticks.values().sum()
    }
}

/// Counters kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    queue_push: AtomicU64,
    queue_pop_claimed: AtomicU64,
    queue_pop_unclaimed: AtomicU64,
    active_workers: AtomicU64,
    duplicate_entries: AtomicU64,
    consistency_violations: AtomicU64,
    worker_ticks: Mutex<HashMap<WorkerId, u64>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            queue_push: self.queue_push.load(Ordering::Relaxed),
            queue_pop_claimed: self.queue_pop_claimed.load(Ordering::Relaxed),
            queue_pop_unclaimed: self.queue_pop_unclaimed.load(Ordering::Relaxed),
            active_workers: self.active_workers.load(Ordering::Relaxed),
            duplicate_entries: self.duplicate_entries.load(Ordering::Relaxed),
            consistency_violations: self.consistency_violations.load(Ordering::Relaxed),
            worker_ticks: self
                .worker_ticks
                .lock()
                .map(|ticks| ticks.clone())
                .unwrap_or_else(|e| e.into_inner().clone()),
        }
    }
}

impl QueueMetrics for InMemoryMetrics {
    fn increment_queue_push(&self) {
        self.queue_push.fetch_add(1, Ordering::Relaxed);
    }

    fn increment_queue_pop(&self, kind: PopKind) {
        match kind {
            PopKind::Claimed => self.queue_pop_claimed.fetch_add(1, Ordering::Relaxed),
            PopKind::Unclaimed => self.queue_pop_unclaimed.fetch_add(1, Ordering::Relaxed),
        };
    }

    fn observe_active_workers(&self, count: usize) {
        self.active_workers.store(count as u64, Ordering::Relaxed);
    }

    fn increment_worker_tick(&self, worker_id: &WorkerId) {
        let mut ticks = self.worker_ticks.lock().unwrap_or_else(|e| e.into_inner());
        *ticks.entry(*worker_id).or_insert(0) += 1;
    }

    fn increment_duplicate_entry(&self) {
        self.duplicate_entries.fetch_add(1, Ordering::Relaxed);
    }

    fn increment_consistency_violation(&self) {
        self.consistency_violations.fetch_add(1, Ordering::Relaxed);
    }
}

/// A single metric update on the metrics stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "metric", rename_all = "snake_case")]
pub enum MetricEvent {
    QueuePush,
    QueuePop { kind: PopKind },
    ActiveWorkers { count: usize },
    WorkerTick { worker_id: WorkerId },
    DuplicateEntry,
    ConsistencyViolation,
}

/// Forwards metric events to an exporter over a bounded channel.
///
/// Events are dropped when the channel is full or closed.
#[derive(Debug, Clone)]
pub struct ChannelMetrics {
    tx: mpsc::Sender<MetricEvent>,
}

impl ChannelMetrics {
    /// A `buffer` of zero is treated as one.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<MetricEvent>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }

    fn emit(&self, event: MetricEvent) {
        let _ = self.tx.try_send(event);
    }
}

impl QueueMetrics for ChannelMetrics {
    fn increment_queue_push(&self) {
        self.emit(MetricEvent::QueuePush);
    }

    fn increment_queue_pop(&self, kind: PopKind) {
        self.emit(MetricEvent::QueuePop { kind });
    }

    fn observe_active_workers(&self, count: usize) {
        self.emit(MetricEvent::ActiveWorkers { count });
    }

    fn increment_worker_tick(&self, worker_id: &WorkerId) {
        self.emit(MetricEvent::WorkerTick {
            worker_id: *worker_id,
        });
    }

    fn increment_duplicate_entry(&self) {
        self.emit(MetricEvent::DuplicateEntry);
    }

    fn increment_consistency_violation(&self) {
        self.emit(MetricEvent::ConsistencyViolation);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_counters() {
        let metrics = InMemoryMetrics::new();
        let worker = WorkerId::new();

        metrics.increment_queue_push();
        metrics.increment_queue_push();
        metrics.increment_queue_pop(PopKind::Claimed);
        metrics.increment_queue_pop(PopKind::Unclaimed);
        metrics.increment_worker_tick(&worker);
        metrics.increment_worker_tick(&worker);
        metrics.observe_active_workers(3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.queue_push, 2);
        assert_eq!(snapshot.queue_pop_claimed, 1);
        assert_eq!(snapshot.queue_pop_unclaimed, 1);
        assert_eq!(snapshot.active_workers, 3);
        assert_eq!(snapshot.worker_ticks[&worker], 2);
        assert_eq!(snapshot.total_worker_ticks(), 2);
    }

    #[tokio::test]
    async fn test_channel_drops_when_full() {
        let (metrics, mut rx) = ChannelMetrics::new(1);

        metrics.increment_queue_push();
        // Buffer is full; this must neither block nor panic.
        metrics.increment_duplicate_entry();

        assert_eq!(rx.recv().await, Some(MetricEvent::QueuePush));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_zero_buffer_holds_one_event() {
        let (metrics, mut rx) = ChannelMetrics::new(0);

        metrics.observe_active_workers(2);
        metrics.increment_queue_push();

        assert_eq!(rx.recv().await, Some(MetricEvent::ActiveWorkers { count: 2 }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_metric_event_json_shape() {
        let json = serde_json::to_value(MetricEvent::QueuePop {
            kind: PopKind::Claimed,
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "metric": "queue_pop", "kind": "claimed" })
        );
    }

    #[tokio::test]
    async fn test_channel_survives_closed_receiver() {
        let (metrics, rx) = ChannelMetrics::new(4);
        drop(rx);
        metrics.increment_queue_pop(PopKind::Claimed);
    }
}
