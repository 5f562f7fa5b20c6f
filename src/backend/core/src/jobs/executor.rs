//! Grouped-exclusion job scheduler.
//!
//! The executor accepts jobs and decides when they run:
//!
//! - **Ungrouped jobs** go straight to the shared free pool.
//! - **Grouped jobs** start on their group's pool unless their path conflicts
//!   (prefix or equal) with a running grouped job or with a grouped job still
//!   waiting in the queue. Otherwise they wait in one FIFO queue that is
//!   rescanned every time a job completes.
//!
//! All scheduling state lives behind one mutex that is never held across an
//! await point.

use metrics::gauge;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::sync::Notify;

use super::context::PropertyContextStore;
use super::events::ObservationManager;
use super::group::JobGroupPath;
use super::initializer::GroupedJobInitializerManager;
use super::job::{Job, JobHandler, JobServices};
use super::registry::JobRegistry;
use super::request::{JobId, Request};
use super::status::JobState;
use super::store::InMemoryJobStatusStore;
use super::worker::{WorkerPool, WorkerPoolConfig, WorkerPoolStats};
use crate::config::ExecutorConfig;
use crate::error::{ApexError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Scheduler State
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Default)]
struct SchedulerState {
    /// Non-finished jobs by id
    live: HashMap<JobId, Job>,
    /// Scheduled on a pool and not completed yet
    active: Vec<Job>,
    /// Grouped jobs waiting for a conflicting job to finish
    queue: VecDeque<Job>,
    pools: HashMap<JobGroupPath, Arc<WorkerPool>>,
    shutdown: bool,
}

impl SchedulerState {
    fn conflicts_with_active(&self, path: &JobGroupPath) -> bool {
        self.active
            .iter()
            .filter_map(Job::group_path)
            .any(|running| running.conflicts(path))
    }

    fn conflicts_with_queued(&self, path: &JobGroupPath) -> bool {
        self.queue
            .iter()
            .filter_map(Job::group_path)
            .any(|queued| queued.conflicts(path))
    }

    /// Move every queued job that may start now into `active`, in FIFO order.
    ///
    /// An entry is skipped if it conflicts with an active job or with an
    /// earlier entry that stays queued.
    fn take_startable(&mut self) -> Vec<Job> {
        let mut started = Vec::new();
        let mut blocked: Vec<JobGroupPath> = Vec::new();
        let mut remaining = VecDeque::with_capacity(self.queue.len());

        while let Some(job) = self.queue.pop_front() {
            let Some(path) = job.group_path().cloned() else {
                self.active.push(job.clone());
                started.push(job);
                continue;
            };

            if self.conflicts_with_active(&path) || blocked.iter().any(|b| b.conflicts(&path)) {
                blocked.push(path);
                remaining.push_back(job);
            } else {
                self.active.push(job.clone());
                started.push(job);
            }
        }

        self.queue = remaining;
        started
    }

    fn pool_for(&mut self, path: &JobGroupPath, initializers: &GroupedJobInitializerManager) -> Arc<WorkerPool> {
        self.pools
            .entry(path.clone())
            .or_insert_with(|| {
                let initializer = initializers.get_grouped_job_initializer(path);
                let name = format!("group:{}", path);
                Arc::new(WorkerPool::new(WorkerPoolConfig::for_group(name, &initializer)))
            })
            .clone()
    }

    fn reap_idle_pools(&mut self) -> usize {
        let before = self.pools.len();
        self.pools.retain(|path, pool| {
            let expired = pool.is_expired();
            if expired {
                tracing::debug!(group = %path, "Tearing down idle group pool");
            }
            !expired
        });
        before - self.pools.len()
    }

    fn is_idle(&self) -> bool {
        self.active.is_empty() && self.queue.is_empty()
    }

    fn record_gauges(&self) {
        gauge!("apex_jobs_active").set(self.active.len() as f64);
        gauge!("apex_jobs_queued").set(self.queue.len() as f64);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Executor
// ═══════════════════════════════════════════════════════════════════════════════

struct ExecutorInner {
    registry: Arc<JobRegistry>,
    services: JobServices,
    initializers: Arc<GroupedJobInitializerManager>,
    free_pool: WorkerPool,
    state: Mutex<SchedulerState>,
    idle: Notify,
}

/// Accepts jobs and runs them under the grouped-exclusion rules.
///
/// Cheap to clone; clones share the same scheduler. Must be used from within
/// a tokio runtime.
#[derive(Clone)]
pub struct JobExecutor {
    inner: Arc<ExecutorInner>,
}

/// Non-owning executor handle kept by scheduled jobs.
#[derive(Clone, Debug)]
pub struct WeakJobExecutor {
    inner: Weak<ExecutorInner>,
}

impl WeakJobExecutor {
    pub fn upgrade(&self) -> Option<JobExecutor> {
        self.inner.upgrade().map(|inner| JobExecutor { inner })
    }
}

impl fmt::Debug for ExecutorInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("JobExecutor")
            .field("active", &state.active.len())
            .field("queued", &state.queue.len())
            .field("group_pools", &state.pools.len())
            .field("shutdown", &state.shutdown)
            .finish()
    }
}

impl fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.inner, f)
    }
}

impl JobExecutor {
    /// Executor with default configuration.
    pub fn new(registry: Arc<JobRegistry>) -> Self {
        Self::from_config(&ExecutorConfig::default(), registry)
    }

    /// Executor with in-memory collaborators sized from `config`.
    pub fn from_config(config: &ExecutorConfig, registry: Arc<JobRegistry>) -> Self {
        let services = JobServices {
            observation: Arc::new(ObservationManager::default()),
            store: Arc::new(InMemoryJobStatusStore::new(config.job_status_cache_size)),
            context_store: Arc::new(PropertyContextStore),
        };
        Self::with_services(config, registry, services)
    }

    pub fn with_services(config: &ExecutorConfig, registry: Arc<JobRegistry>, services: JobServices) -> Self {
        tracing::info!(
            free_pool_size = config.free_pool_size,
            grouped_pool_size = config.grouped_pool_size,
            configured_groups = config.groups.len(),
            "Job executor created"
        );

        Self {
            inner: Arc::new(ExecutorInner {
                registry,
                services,
                initializers: Arc::new(GroupedJobInitializerManager::from_config(config)),
                free_pool: WorkerPool::new(WorkerPoolConfig::new(config.free_pool_size).with_name("free")),
                state: Mutex::new(SchedulerState::default()),
                idle: Notify::new(),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.inner.registry
    }

    pub fn services(&self) -> &JobServices {
        &self.inner.services
    }

    pub fn observation(&self) -> &Arc<ObservationManager> {
        &self.inner.services.observation
    }

    pub fn initializers(&self) -> &Arc<GroupedJobInitializerManager> {
        &self.inner.initializers
    }

    pub fn downgrade(&self) -> WeakJobExecutor {
        WeakJobExecutor {
            inner: Arc::downgrade(&self.inner),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Submission
    // ─────────────────────────────────────────────────────────────────────────

    /// Build a job of `job_type` from the registry and schedule it.
    pub fn execute(&self, job_type: &str, request: Request) -> Result<Job> {
        self.ensure_accepting()?;
        let handler = self.inner.registry.create(job_type)?;
        self.execute_handler(handler, request)
    }

    /// Build a job around `handler` and schedule it.
    pub fn execute_handler(&self, handler: Arc<dyn JobHandler>, request: Request) -> Result<Job> {
        self.ensure_accepting()?;
        let job = Job::initialize(handler, request, self.inner.services.clone())?;
        self.execute_job(job)
    }

    /// Schedule an already initialized job.
    pub fn execute_job(&self, job: Job) -> Result<Job> {
        let mut state = self.inner.state.lock();
        if state.shutdown {
            return Err(ApexError::executor_shutdown());
        }
        if job.is_started() {
            return Err(ApexError::invalid_state_transition(job.status().state(), JobState::Running));
        }

        let live_id = job.id().filter(|id| !id.is_empty()).cloned();
        if let Some(id) = &live_id {
            if let Some(existing) = state.live.get(id) {
                if !existing.status().is_finished() {
                    return Err(ApexError::job_already_exists(id));
                }
            }
        }
        if !job.attach_executor(self.downgrade()) {
            return Err(ApexError::invalid_state_transition(job.status().state(), JobState::Running));
        }
        if let Some(id) = live_id {
            state.live.insert(id, job.clone());
        }

        state.reap_idle_pools();
        match job.group_path() {
            Some(path) if state.conflicts_with_active(path) || state.conflicts_with_queued(path) => {
                tracing::debug!(
                    job_id = %job.status().display_id(),
                    job_type = %job.job_type(),
                    group = %path,
                    position = state.queue.len(),
                    "Grouped job queued behind a conflicting job"
                );
                state.queue.push_back(job.clone());
            }
            _ => {
                state.active.push(job.clone());
                self.launch(&mut state, job.clone());
            }
        }
        state.record_gauges();

        Ok(job)
    }

    fn ensure_accepting(&self) -> Result<()> {
        if self.inner.state.lock().shutdown {
            Err(ApexError::executor_shutdown())
        } else {
            Ok(())
        }
    }

    fn launch(&self, state: &mut SchedulerState, job: Job) {
        let executor = self.clone();
        let task_job = job.clone();
        let task = async move {
            if let Err(error) = task_job.run_scheduled().await {
                tracing::warn!(
                    job_id = %task_job.status().display_id(),
                    job_type = %task_job.job_type(),
                    error = %error,
                    "Job could not be started"
                );
            }
            executor.job_completed(&task_job);
        };

        match job.group_path() {
            Some(path) => {
                let pool = state.pool_for(path, &self.inner.initializers);
                tracing::debug!(
                    job_id = %job.status().display_id(),
                    group = %path,
                    pool = pool.name(),
                    "Starting grouped job"
                );
                pool.spawn(task);
            }
            None => {
                self.inner.free_pool.spawn(task);
            }
        }
    }

    fn job_completed(&self, job: &Job) {
        let mut state = self.inner.state.lock();
        state.active.retain(|j| !j.same_job(job));
        if let Some(id) = job.id() {
            if state.live.get(id).is_some_and(|j| j.same_job(job)) {
                state.live.remove(id);
            }
        }

        for next in state.take_startable() {
            tracing::debug!(
                job_id = %next.status().display_id(),
                job_type = %next.job_type(),
                "Dequeued grouped job"
            );
            self.launch(&mut state, next);
        }
        state.reap_idle_pools();
        state.record_gauges();

        if state.is_idle() {
            self.inner.idle.notify_waiters();
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lookup
    // ─────────────────────────────────────────────────────────────────────────

    /// Live (non-finished) job registered under `id`.
    pub fn get_job(&self, id: &JobId) -> Option<Job> {
        self.inner
            .state
            .lock()
            .live
            .get(id)
            .filter(|job| !job.status().is_finished())
            .cloned()
    }

    /// Job currently occupying exactly `path`.
    pub fn get_current_job(&self, path: &JobGroupPath) -> Option<Job> {
        self.inner
            .state
            .lock()
            .active
            .iter()
            .find(|job| job.group_path() == Some(path))
            .cloned()
    }

    /// Jobs handed to a pool and not completed yet. Ungrouped jobs may still
    /// be waiting for a free worker.
    pub fn running_jobs(&self) -> Vec<Job> {
        self.inner.state.lock().active.clone()
    }

    /// Grouped jobs waiting for a conflicting job, in start order.
    pub fn queued_jobs(&self) -> Vec<Job> {
        self.inner.state.lock().queue.iter().cloned().collect()
    }

    /// Request cooperative cancellation of a live job.
    pub fn cancel(&self, id: &JobId) -> Result<()> {
        let job = self.get_job(id).ok_or_else(|| ApexError::job_not_found(id))?;
        job.cancel();
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Pools & lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    pub fn group_pool_count(&self) -> usize {
        self.inner.state.lock().pools.len()
    }

    /// Tear down group pools idle for longer than their keep-alive.
    pub fn reap_idle_groups(&self) -> usize {
        self.inner.state.lock().reap_idle_pools()
    }

    /// Free pool first, then group pools.
    pub fn pool_stats(&self) -> Vec<WorkerPoolStats> {
        let state = self.inner.state.lock();
        std::iter::once(self.inner.free_pool.stats())
            .chain(state.pools.values().map(|p| p.stats()))
            .collect()
    }

    /// Stop accepting jobs. Scheduled and queued jobs still run.
    pub fn shutdown(&self) {
        let mut state = self.inner.state.lock();
        if !state.shutdown {
            state.shutdown = true;
            tracing::info!(
                active = state.active.len(),
                queued = state.queue.len(),
                "Job executor shutting down"
            );
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.state.lock().shutdown
    }

    /// Wait until no job is scheduled or queued.
    pub async fn join_all(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.inner.state.lock().is_idle() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::jobs::job::JobContext;
    use crate::jobs::status::JobResult;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Sleeper {
        group: Option<Vec<&'static str>>,
        millis: u64,
    }

    #[async_trait]
    impl JobHandler for Sleeper {
        fn job_type(&self) -> &str {
            "sleeper"
        }

        fn group_path(&self, _request: &Request) -> Option<JobGroupPath> {
            self.group.clone().map(JobGroupPath::from)
        }

        async fn run_internal(&self, _ctx: &JobContext) -> JobResult {
            tokio::time::sleep(Duration::from_millis(self.millis)).await;
            Ok(())
        }
    }

    fn sleeper(group: Option<Vec<&'static str>>, millis: u64) -> Arc<dyn JobHandler> {
        Arc::new(Sleeper { group, millis })
    }

    fn executor() -> JobExecutor {
        JobExecutor::new(Arc::new(JobRegistry::new()))
    }

    #[test]
    fn test_take_startable_respects_queue_order() {
        let services = JobServices::default();
        let job = |group: Vec<&'static str>| {
            Job::initialize(sleeper(Some(group), 0), Request::new(), services.clone()).unwrap()
        };

        let mut state = SchedulerState::default();
        state.queue.push_back(job(vec!["g"]));
        state.queue.push_back(job(vec!["g", "x"]));
        state.queue.push_back(job(vec!["h"]));

        let started = state.take_startable();
        let paths: Vec<_> = started
            .iter()
            .map(|j| j.group_path().unwrap().to_string())
            .collect();
        assert_eq!(paths, vec!["g", "h"]);
        assert_eq!(state.queue.len(), 1);
        assert_eq!(state.active.len(), 2);
    }

    #[tokio::test]
    async fn test_unknown_job_type() {
        let error = executor().execute("missing", Request::new()).unwrap_err();
        assert_eq!(error.code(), ErrorCode::JobTypeNotFound);
    }

    #[tokio::test]
    async fn test_rejects_after_shutdown() {
        let executor = executor();
        executor.shutdown();
        assert!(executor.is_shutdown());

        let error = executor
            .execute_handler(sleeper(None, 0), Request::new())
            .unwrap_err();
        assert_eq!(error.code(), ErrorCode::ExecutorShutdown);
    }

    #[tokio::test]
    async fn test_job_cannot_be_scheduled_twice() {
        let executor = executor();
        let job = Job::initialize(sleeper(None, 0), Request::new(), executor.services().clone()).unwrap();

        executor.execute_job(job.clone()).unwrap();
        let error = executor.execute_job(job.clone()).unwrap_err();
        assert_eq!(error.code(), ErrorCode::InvalidStateTransition);

        job.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_cancel_unknown_job() {
        let error = executor().cancel(&JobId::new(["nope"])).unwrap_err();
        assert_eq!(error.code(), ErrorCode::JobNotFound);
    }

    #[tokio::test]
    async fn test_join_all_waits_for_queue() {
        let executor = executor();
        let a = executor.execute_handler(sleeper(Some(vec!["g"]), 20), Request::new()).unwrap();
        let b = executor.execute_handler(sleeper(Some(vec!["g"]), 0), Request::new()).unwrap();
        assert_eq!(executor.queued_jobs().len(), 1);

        executor.join_all().await;
        assert!(a.status().is_finished());
        assert!(b.status().is_finished());
        assert!(executor.running_jobs().is_empty());
    }
}
