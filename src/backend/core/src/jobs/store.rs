//! Job status persistence.
//!
//! Jobs hand a [`JobStatusSnapshot`] to the store when they finish. Storing is
//! fire-and-forget from the job's point of view: failures are logged and never
//! change the job's outcome.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::log::{LogTail, MemoryLogTail};
use super::request::JobId;
use super::status::JobStatusSnapshot;
use crate::error::Result;

/// Backend holding finished job statuses and their log tails.
#[async_trait]
pub trait JobStatusStore: Send + Sync + std::fmt::Debug {
    /// Log tail for a job that will be persisted under `id`.
    fn create_log_tail(&self, id: &JobId, serialize: bool) -> Arc<dyn LogTail>;

    /// Persist a status snapshot, replacing any previous one for the same id.
    async fn store(&self, snapshot: JobStatusSnapshot) -> Result<()>;

    /// Load the last stored snapshot for `id`.
    async fn load(&self, id: &JobId) -> Result<Option<JobStatusSnapshot>>;

    /// Number of stored statuses.
    async fn len(&self) -> Result<usize>;

    async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }
}

#[derive(Debug)]
struct StoredStatus {
    seq: u64,
    snapshot: JobStatusSnapshot,
}

/// Bounded in-memory store; the oldest entries are evicted first.
#[derive(Debug)]
pub struct InMemoryJobStatusStore {
    statuses: DashMap<JobId, StoredStatus>,
    tails: DashMap<JobId, Arc<MemoryLogTail>>,
    capacity: usize,
    seq: AtomicU64,
}

impl InMemoryJobStatusStore {
    pub const DEFAULT_CAPACITY: usize = 1000;

    pub fn new(capacity: usize) -> Self {
        Self {
            statuses: DashMap::new(),
            tails: DashMap::new(),
            capacity: capacity.max(1),
            seq: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Log tail previously handed out for `id`, if it is still retained.
    pub fn log_tail(&self, id: &JobId) -> Option<Arc<MemoryLogTail>> {
        self.tails.get(id).map(|t| t.value().clone())
    }

    fn evict_oldest(&self) {
        while self.statuses.len() > self.capacity {
            let oldest = self
                .statuses
                .iter()
                .min_by_key(|entry| entry.value().seq)
                .map(|entry| entry.key().clone());

            match oldest {
                Some(id) => {
                    self.statuses.remove(&id);
                    self.tails.remove(&id);
                    tracing::trace!(job_id = %id, "Evicted job status");
                }
                None => break,
            }
        }
    }
}

impl Default for InMemoryJobStatusStore {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

#[async_trait]
impl JobStatusStore for InMemoryJobStatusStore {
    fn create_log_tail(&self, id: &JobId, serialize: bool) -> Arc<dyn LogTail> {
        let tail = Arc::new(MemoryLogTail::default());
        if serialize {
            self.tails.insert(id.clone(), tail.clone());
        }
        tail
    }

    async fn store(&self, snapshot: JobStatusSnapshot) -> Result<()> {
        let Some(id) = snapshot.id.clone() else {
            return Ok(());
        };

        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.statuses.insert(id, StoredStatus { seq, snapshot });
        self.evict_oldest();
        Ok(())
    }

    async fn load(&self, id: &JobId) -> Result<Option<JobStatusSnapshot>> {
        Ok(self.statuses.get(id).map(|s| s.snapshot.clone()))
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.statuses.len())
    }
}
