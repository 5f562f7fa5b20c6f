//! Worker pools backing the job executor.
//!
//! A `WorkerPool` bounds how many jobs run at once using a tokio
//! [`Semaphore`]. The executor owns one shared pool for ungrouped jobs and one
//! lazily created pool per group path; group pools remember when they last
//! went idle so the executor can tear them down after their keep-alive.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use super::initializer::GroupedJobInitializer;

/// Configuration for a worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Maximum number of concurrent workers
    pub max_workers: usize,
    /// Idle time after which the pool may be torn down (`None` = never)
    pub keep_alive: Option<Duration>,
    /// Name for this pool (for logging)
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 16,
            keep_alive: None,
            name: "free".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
            ..Default::default()
        }
    }

    /// Pool for one group, sized by its initializer.
    pub fn for_group(name: impl Into<String>, initializer: &GroupedJobInitializer) -> Self {
        Self {
            max_workers: initializer.pool_size(),
            keep_alive: Some(initializer.keep_alive()),
            name: name.into(),
        }
    }

    /// Create with a specific name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
}

/// Internal statistics tracking.
#[derive(Debug, Default)]
struct PoolStats {
    /// Tasks handed to the pool
    submitted: AtomicU64,
    /// Tasks that ran to the end
    completed: AtomicU64,
    /// Submitted and not yet completed (waiting or running)
    in_flight: AtomicUsize,
    /// Currently holding a permit
    running: AtomicUsize,
    /// Peak concurrent workers
    peak_running: AtomicUsize,
}

/// Semaphore-bounded task pool.
#[derive(Debug)]
pub struct WorkerPool {
    config: WorkerPoolConfig,
    semaphore: Arc<Semaphore>,
    stats: Arc<PoolStats>,
    /// When the pool last became idle
    idle_since: Arc<Mutex<Instant>>,
}

impl WorkerPool {
    pub fn new(config: WorkerPoolConfig) -> Self {
        let max_workers = config.max_workers.max(1);
        tracing::debug!(
            pool_name = %config.name,
            max_workers,
            keep_alive_ms = config.keep_alive.map(|k| k.as_millis() as u64),
            "Worker pool created"
        );

        Self {
            semaphore: Arc::new(Semaphore::new(max_workers)),
            config: WorkerPoolConfig { max_workers, ..config },
            stats: Arc::new(PoolStats::default()),
            idle_since: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Get the pool name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Get maximum worker count.
    pub fn max_workers(&self) -> usize {
        self.config.max_workers
    }

    pub fn keep_alive(&self) -> Option<Duration> {
        self.config.keep_alive
    }

    /// Get current number of workers holding a permit.
    pub fn active_workers(&self) -> usize {
        self.stats.running.load(Ordering::Acquire)
    }

    /// Tasks submitted and not yet completed.
    pub fn in_flight(&self) -> usize {
        self.stats.in_flight.load(Ordering::Acquire)
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight() == 0
    }

    /// Idle long enough to be torn down.
    pub fn is_expired(&self) -> bool {
        match self.config.keep_alive {
            Some(keep_alive) => self.is_idle() && self.idle_since.lock().elapsed() >= keep_alive,
            None => false,
        }
    }

    /// Run `task` once a worker is free.
    ///
    /// The task starts on its own tokio task; the returned handle completes
    /// when it does.
    pub fn spawn<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.stats.submitted.fetch_add(1, Ordering::Relaxed);
        self.stats.in_flight.fetch_add(1, Ordering::AcqRel);

        let semaphore = self.semaphore.clone();
        let stats = self.stats.clone();
        let idle_since = self.idle_since.clone();
        let pool_name = self.config.name.clone();

        tokio::spawn(async move {
            let _done = InFlight { stats: &stats, idle_since: &idle_since };

            let start = Instant::now();
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    tracing::error!(pool_name = %pool_name, "Worker pool closed");
                    return;
                }
            };

            let running = stats.running.fetch_add(1, Ordering::AcqRel) + 1;
            stats.peak_running.fetch_max(running, Ordering::Relaxed);
            tracing::trace!(
                pool_name = %pool_name,
                wait_time_ms = start.elapsed().as_millis() as u64,
                "Worker permit acquired"
            );

            task.await;

            stats.running.fetch_sub(1, Ordering::AcqRel);
            stats.completed.fetch_add(1, Ordering::Relaxed);
        })
    }

    /// Get pool statistics.
    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            name: self.config.name.clone(),
            max_workers: self.config.max_workers,
            active_workers: self.active_workers(),
            in_flight: self.in_flight(),
            submitted: self.stats.submitted.load(Ordering::Relaxed),
            completed: self.stats.completed.load(Ordering::Relaxed),
            peak_concurrent: self.stats.peak_running.load(Ordering::Relaxed),
        }
    }
}

/// Marks a submitted task as finished on every exit path.
struct InFlight<'a> {
    stats: &'a PoolStats,
    idle_since: &'a Mutex<Instant>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut idle_since = self.idle_since.lock();
        if self.stats.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            *idle_since = Instant::now();
        }
    }
}

/// Statistics for a worker pool.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolStats {
    /// Pool name
    pub name: String,
    /// Maximum workers configured
    pub max_workers: usize,
    /// Currently active workers
    pub active_workers: usize,
    /// Submitted and not yet completed
    pub in_flight: usize,
    /// Total tasks submitted
    pub submitted: u64,
    /// Tasks that ran to the end
    pub completed: u64,
    /// Peak concurrent workers observed
    pub peak_concurrent: usize,
}

impl WorkerPoolStats {
    /// Calculate utilization as a percentage.
    pub fn utilization(&self) -> f64 {
        (self.active_workers as f64 / self.max_workers as f64) * 100.0
    }
}
