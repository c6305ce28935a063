//! Pending queue store.
//!
//! One entry per pending job, keyed by job id. Entries are ordered by a
//! store-assigned sequence number rather than wall-clock time, so paging
//! with a cursor never skips or repeats an entry even while new jobs are
//! pushed concurrently.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::{Error, JobId, ProjectId, Result, TagSet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use tokio::sync::Mutex;

/// Position in the queue's sequence order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QueueCursor(pub u64);

/// Marks a job as waiting to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub job_id: JobId,
    pub project_id: ProjectId,
    /// Tags a worker must offer to take this job.
    pub tags: TagSet,
    pub enqueued_at: DateTime<Utc>,
    pub sequence: u64,
}

impl QueueEntry {
    pub fn cursor(&self) -> QueueCursor {
        QueueCursor(self.sequence)
    }
}

/// Returned by a successful push.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueToken {
    pub job_id: JobId,
    pub sequence: u64,
}

/// One page of a queue scan.
#[derive(Debug, Clone, Default)]
pub struct QueueBatch {
    pub entries: Vec<QueueEntry>,
    /// Where the next page starts; `None` once the end of the queue was reached.
    pub next_cursor: Option<QueueCursor>,
}

/// Storage for pending queue entries.
///
/// Implementations must enforce at most one entry per job id.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Add an entry. Fails with [`Error::DuplicateEntry`] if the job is already queued.
    async fn push(
        &self,
        job_id: JobId,
        project_id: ProjectId,
        tags: TagSet,
        enqueued_at: DateTime<Utc>,
    ) -> Result<QueueToken>;

    /// Remove an entry. Returns false when there was nothing to remove.
    async fn pop(&self, job_id: JobId) -> Result<bool>;

    async fn get(&self, job_id: JobId) -> Result<Option<QueueEntry>>;

    async fn contains(&self, job_id: JobId) -> Result<bool> {
        Ok(self.get(job_id).await?.is_some())
    }

    /// Up to `limit` entries in sequence order, strictly after `cursor`.
    async fn scan_batch(&self, limit: usize, cursor: Option<QueueCursor>) -> Result<QueueBatch>;

    async fn len(&self) -> Result<usize>;

    async fn counts_by_project(&self) -> Result<HashMap<ProjectId, usize>>;
}

#[derive(Debug, Default)]
struct QueueState {
    entries: HashMap<JobId, QueueEntry>,
    order: BTreeMap<u64, JobId>,
    next_sequence: u64,
}

/// Queue store kept in process memory.
#[derive(Debug, Default)]
pub struct InMemoryQueue {
    state: Mutex<QueueState>,
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl QueueStore for InMemoryQueue {
    async fn push(
        &self,
        job_id: JobId,
        project_id: ProjectId,
        tags: TagSet,
        enqueued_at: DateTime<Utc>,
    ) -> Result<QueueToken> {
        let mut state = self.state.lock().await;
        if state.entries.contains_key(&job_id) {
            return Err(Error::DuplicateEntry(job_id));
        }

        state.next_sequence += 1;
        let sequence = state.next_sequence;
        state.order.insert(sequence, job_id);
        state.entries.insert(
            job_id,
            QueueEntry {
                job_id,
                project_id,
                tags,
                enqueued_at,
                sequence,
            },
        );

        Ok(QueueToken { job_id, sequence })
    }

    async fn pop(&self, job_id: JobId) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.entries.remove(&job_id) {
            Some(entry) => {
                state.order.remove(&entry.sequence);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get(&self, job_id: JobId) -> Result<Option<QueueEntry>> {
        Ok(self.state.lock().await.entries.get(&job_id).cloned())
    }

    async fn scan_batch(&self, limit: usize, cursor: Option<QueueCursor>) -> Result<QueueBatch> {
        let state = self.state.lock().await;
        let start = match cursor {
            Some(QueueCursor(sequence)) => Bound::Excluded(sequence),
            None => Bound::Unbounded,
        };

        let mut range = state.order.range((start, Bound::Unbounded));
        let entries: Vec<QueueEntry> = range
            .by_ref()
            .take(limit)
            .filter_map(|(_, job_id)| state.entries.get(job_id).cloned())
            .collect();
        let more = range.next().is_some();

        let next_cursor = match entries.last() {
            Some(last) if more => Some(last.cursor()),
            _ => None,
        };

        Ok(QueueBatch {
            entries,
            next_cursor,
        })
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.state.lock().await.entries.len())
    }

    async fn counts_by_project(&self) -> Result<HashMap<ProjectId, usize>> {
        let state = self.state.lock().await;
        let mut counts = HashMap::new();
        for entry in state.entries.values() {
            *counts.entry(entry.project_id).or_insert(0) += 1;
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn push(queue: &InMemoryQueue, project: ProjectId) -> JobId {
        let job_id = JobId::new();
        queue
            .push(job_id, project, TagSet::new(), Utc::now())
            .await
            .unwrap();
        job_id
    }

    #[tokio::test]
    async fn test_push_rejects_duplicates() {
        let queue = InMemoryQueue::new();
        let project = ProjectId::new();
        let job_id = push(&queue, project).await;

        let result = queue
            .push(job_id, project, TagSet::new(), Utc::now())
            .await;
        assert!(matches!(result, Err(Error::DuplicateEntry(id)) if id == job_id));
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_pop_is_a_noop_when_absent() {
        let queue = InMemoryQueue::new();
        let job_id = push(&queue, ProjectId::new()).await;

        assert!(queue.pop(job_id).await.unwrap());
        assert!(!queue.pop(job_id).await.unwrap());
        assert!(!queue.contains(job_id).await.unwrap());
    }

    #[tokio::test]
    async fn test_sequences_are_monotonic() {
        let queue = InMemoryQueue::new();
        let project = ProjectId::new();
        let first = queue
            .push(JobId::new(), project, TagSet::new(), Utc::now())
            .await
            .unwrap();
        let second = queue
            .push(JobId::new(), project, TagSet::new(), Utc::now())
            .await
            .unwrap();
        assert!(second.sequence > first.sequence);
    }

    #[tokio::test]
    async fn test_scan_pages_in_order() {
        let queue = InMemoryQueue::new();
        let project = ProjectId::new();
        let mut pushed = Vec::new();
        for _ in 0..5 {
            pushed.push(push(&queue, project).await);
        }

        let first = queue.scan_batch(2, None).await.unwrap();
        assert_eq!(first.entries.len(), 2);
        assert!(first.next_cursor.is_some());

        let second = queue.scan_batch(2, first.next_cursor).await.unwrap();
        let third = queue.scan_batch(2, second.next_cursor).await.unwrap();
        assert_eq!(third.entries.len(), 1);
        assert!(third.next_cursor.is_none());

        let seen: Vec<JobId> = first
            .entries
            .iter()
            .chain(&second.entries)
            .chain(&third.entries)
            .map(|e| e.job_id)
            .collect();
        assert_eq!(seen, pushed);
    }

    #[tokio::test]
    async fn test_scan_resumes_after_concurrent_changes() {
        let queue = InMemoryQueue::new();
        let project = ProjectId::new();
        let a = push(&queue, project).await;
        let b = push(&queue, project).await;
        let c = push(&queue, project).await;

        let first = queue.scan_batch(2, None).await.unwrap();
        assert_eq!(
            first.entries.iter().map(|e| e.job_id).collect::<Vec<_>>(),
            vec![a, b]
        );

        // Removing a scanned entry and appending a new one must not shift the cursor.
        queue.pop(a).await.unwrap();
        let d = push(&queue, project).await;

        let rest = queue.scan_batch(10, first.next_cursor).await.unwrap();
        assert_eq!(
            rest.entries.iter().map(|e| e.job_id).collect::<Vec<_>>(),
            vec![c, d]
        );
        assert!(rest.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_exact_page_reports_end() {
        let queue = InMemoryQueue::new();
        push(&queue, ProjectId::new()).await;
        push(&queue, ProjectId::new()).await;

        let batch = queue.scan_batch(2, None).await.unwrap();
        assert_eq!(batch.entries.len(), 2);
        assert!(batch.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_counts_by_project() {
        let queue = InMemoryQueue::new();
        let alpha = ProjectId::new();
        let beta = ProjectId::new();
        push(&queue, alpha).await;
        push(&queue, alpha).await;
        push(&queue, beta).await;

        let counts = queue.counts_by_project().await.unwrap();
        assert_eq!(counts[&alpha], 2);
        assert_eq!(counts[&beta], 1);
    }
}
