//! Job definitions and the execution lifecycle.
//!
//! This module provides:
//!
//! - **JobHandler**: the payload trait concrete job types implement
//! - **JobContext**: what a payload sees while it runs
//! - **Job**: the runtime handle that drives a handler through its lifecycle
//!
//! A job is first initialized (request prepared, status created, parent
//! recorded) and then run exactly once:
//!
//! ```text
//! run ─► context scope ─► RUNNING ─► started ─► payload ─► finishing
//!                                                              │
//!            finished ◄─ persist (async) ◄─ FINISHED ◄─ end date
//! ```

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use metrics::counter;
use parking_lot::Mutex;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;

use super::context::{current_job_status, with_current_job, ContextStore, ExecutionContext, PropertyContextStore};
use super::events::{JobEvent, ObservationManager};
use super::executor::{JobExecutor, WeakJobExecutor};
use super::group::JobGroupPath;
use super::log::{LogLevel, LogTail, MemoryLogTail};
use super::request::{JobId, Request};
use super::status::{JobError, JobResult, JobState, JobStatus, Question};
use super::store::{InMemoryJobStatusStore, JobStatusStore};
use crate::error::{ApexError, ErrorCode, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Handler
// ═══════════════════════════════════════════════════════════════════════════════

/// The trait all job payloads implement.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    /// Job type name, used for registry lookup and logging.
    fn job_type(&self) -> &str;

    /// Serialization group for `request`; `None` runs the job ungrouped.
    fn group_path(&self, _request: &Request) -> Option<JobGroupPath> {
        None
    }

    /// Adapt an incoming request to what this job expects.
    ///
    /// An error here aborts job construction.
    fn prepare_request(&self, request: Request) -> Result<Request> {
        Ok(request)
    }

    /// Execute the job. Errors and panics are captured on the job status.
    async fn run_internal(&self, ctx: &JobContext) -> JobResult;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Services
// ═══════════════════════════════════════════════════════════════════════════════

/// Collaborators shared by every job of an executor.
#[derive(Clone, Debug)]
pub struct JobServices {
    pub observation: Arc<ObservationManager>,
    pub store: Arc<dyn JobStatusStore>,
    pub context_store: Arc<dyn ContextStore>,
}

impl Default for JobServices {
    fn default() -> Self {
        Self {
            observation: Arc::new(ObservationManager::default()),
            store: Arc::new(InMemoryJobStatusStore::default()),
            context_store: Arc::new(PropertyContextStore),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job
// ═══════════════════════════════════════════════════════════════════════════════

struct JobInner {
    handler: Arc<dyn JobHandler>,
    status: Arc<JobStatus>,
    group_path: Option<JobGroupPath>,
    services: JobServices,
    started: AtomicBool,
    executor: Mutex<Option<WeakJobExecutor>>,
}

/// Handle to one job instance. Clones refer to the same job.
#[derive(Clone)]
pub struct Job {
    inner: Arc<JobInner>,
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("job_type", &self.job_type())
            .field("id", &self.id())
            .field("group_path", &self.inner.group_path)
            .field("state", &self.inner.status.state())
            .finish()
    }
}

impl Job {
    /// Bind `request` to `handler` and create the job's status.
    ///
    /// If another job is running on the caller's chain, it becomes the parent.
    pub fn initialize(handler: Arc<dyn JobHandler>, request: Request, services: JobServices) -> Result<Job> {
        let job_type = handler.job_type().to_string();
        let request = handler.prepare_request(request).map_err(|e| match e.code() {
            ErrorCode::RequestConversionFailed | ErrorCode::InvalidRequest => e,
            _ => ApexError::request_conversion_failed(&job_type, e.to_string()),
        })?;

        let parent = current_job_status();
        let group_path = handler.group_path(&request);
        let log = Self::select_log_tail(&request, parent.as_ref(), &services);

        let status = JobStatus::new(
            job_type,
            Arc::new(request),
            parent.as_ref(),
            log,
            services.observation.clone(),
        );

        tracing::debug!(
            job_id = %status.display_id(),
            job_type = %status.job_type(),
            group = ?group_path.as_ref().map(ToString::to_string),
            sub_job = status.is_sub_job(),
            "Job initialized"
        );

        Ok(Job {
            inner: Arc::new(JobInner {
                handler,
                status,
                group_path,
                services,
                started: AtomicBool::new(false),
                executor: Mutex::new(None),
            }),
        })
    }

    /// Initialize and run in one go.
    pub async fn start(handler: Arc<dyn JobHandler>, request: Request, services: JobServices) -> Result<Job> {
        let job = Self::initialize(handler, request, services)?;
        job.run().await?;
        Ok(job)
    }

    fn select_log_tail(
        request: &Request,
        parent: Option<&Arc<JobStatus>>,
        services: &JobServices,
    ) -> Arc<dyn LogTail> {
        let sub_job = parent.is_some();
        let isolated = request.status_log_isolated().unwrap_or(!sub_job);
        let serialized = request.status_serialized().unwrap_or(!sub_job);

        match (parent, isolated, request.id()) {
            (Some(parent), false, _) => parent.log_tail().clone(),
            (_, _, Some(id)) if serialized => services.store.create_log_tail(id, serialized),
            _ => Arc::new(MemoryLogTail::default()),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn job_type(&self) -> &str {
        self.inner.status.job_type()
    }

    pub fn id(&self) -> Option<&JobId> {
        self.inner.status.request().id()
    }

    pub fn request(&self) -> &Request {
        self.inner.status.request()
    }

    pub fn status(&self) -> &Arc<JobStatus> {
        &self.inner.status
    }

    /// Group path; `None` for ungrouped jobs.
    pub fn group_path(&self) -> Option<&JobGroupPath> {
        self.inner.group_path.as_ref()
    }

    pub fn services(&self) -> &JobServices {
        &self.inner.services
    }

    /// Whether `run()` was already called.
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::Acquire)
    }

    /// Executor that scheduled this job, if it is still alive.
    pub fn executor(&self) -> Option<JobExecutor> {
        self.inner.executor.lock().as_ref().and_then(WeakJobExecutor::upgrade)
    }

    /// Returns `false` if the job was already handed to an executor or started.
    pub(crate) fn attach_executor(&self, executor: WeakJobExecutor) -> bool {
        let mut slot = self.inner.executor.lock();
        if slot.is_some() || self.is_started() {
            return false;
        }
        *slot = Some(executor);
        true
    }

    pub fn same_job(&self, other: &Job) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Run the job to completion.
    ///
    /// Payload failures end up on the status. Only setup failures (a second
    /// call, a job owned by an executor, a context snapshot that cannot be
    /// restored) are returned.
    pub async fn run(&self) -> Result<()> {
        {
            let executor = self.inner.executor.lock();
            if executor.is_some() {
                return Err(ApexError::invalid_state_transition(self.status().state(), JobState::Running)
                    .with_context("reason", "job is scheduled by an executor"));
            }
            self.claim_run()?;
        }
        self.run_claimed().await
    }

    /// Entry point for the executor that owns this job.
    pub(crate) async fn run_scheduled(&self) -> Result<()> {
        self.claim_run()?;
        self.run_claimed().await
    }

    fn claim_run(&self) -> Result<()> {
        if self.inner.started.swap(true, Ordering::AcqRel) {
            Err(ApexError::invalid_state_transition(self.status().state(), JobState::Running))
        } else {
            Ok(())
        }
    }

    async fn run_claimed(&self) -> Result<()> {
        let status = self.status();

        let snapshot = status.request().context_snapshot();
        if snapshot.is_none() && ExecutionContext::current().is_some() {
            tracing::trace!(job_id = %status.display_id(), "Reusing execution context");
            self.run_in_context().await;
            return Ok(());
        }

        let context = Arc::new(ExecutionContext::new());
        let context_store = &self.inner.services.context_store;
        context_store.initialize(&context);
        if let Some(snapshot) = snapshot {
            if let Err(error) = context_store.restore(&context, snapshot) {
                error.log();
                // release anyone already joining
                status.interrupt();
                return Err(error);
            }
        }

        context.scope(self.run_in_context()).await;
        Ok(())
    }

    async fn run_in_context(&self) {
        let status = self.status().clone();
        let span = tracing::info_span!(
            "job",
            job_id = %status.display_id(),
            job_type = %status.job_type(),
        );
        with_current_job(status, self.run_as_current())
            .instrument(span)
            .await;
    }

    /// Lifecycle body; runs with this job as the current job.
    async fn run_as_current(&self) {
        let status = self.status().clone();
        if let Err(error) = status.set_state(JobState::Running) {
            error.log();
        }
        let _ = status.set_start_date(Utc::now());

        counter!("apex_jobs_started_total", "job_type" => status.job_type().to_string()).increment(1);
        tracing::info!(
            job_id = %status.display_id(),
            job_type = %status.job_type(),
            sub_job = status.is_sub_job(),
            "Job started"
        );
        status.observation().notify(JobEvent::Started { status: status.clone() });

        let ctx = JobContext { job: self.clone() };
        let outcome = AssertUnwindSafe(self.inner.handler.run_internal(&ctx))
            .catch_unwind()
            .await;

        let error = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(error)) => Some(error),
            Err(panic) => Some(JobError::from_panic(panic.as_ref())),
        };
        self.job_finished(error);
    }

    fn job_finished(&self, error: Option<JobError>) {
        let status = self.status();
        if let Some(error) = &error {
            let _ = status.set_error(error.clone());
        }

        status.observation().notify(JobEvent::Finishing {
            status: status.clone(),
            error: error.clone(),
        });

        let _ = status.set_end_date(Utc::now());
        status.progress().complete();
        if !status.mark_finished() {
            return;
        }

        let outcome = match &error {
            None => "succeeded",
            Some(e) if e.is_canceled() => "canceled",
            Some(_) => "failed",
        };
        counter!(
            "apex_jobs_finished_total",
            "job_type" => status.job_type().to_string(),
            "outcome" => outcome
        )
        .increment(1);

        let duration_ms = match (status.start_date(), status.end_date()) {
            (Some(start), Some(end)) => (end - start).num_milliseconds(),
            _ => 0,
        };
        match &error {
            None => tracing::info!(
                job_id = %status.display_id(),
                job_type = %status.job_type(),
                duration_ms,
                "Job finished"
            ),
            Some(e) => tracing::warn!(
                job_id = %status.display_id(),
                job_type = %status.job_type(),
                duration_ms,
                error = %e,
                "Job failed"
            ),
        }

        if status.request().id().is_some() && status.is_serialized() {
            let store = self.inner.services.store.clone();
            let snapshot = status.snapshot();
            tokio::spawn(async move {
                let id = snapshot.id.clone();
                if let Err(error) = store.store(snapshot).await {
                    tracing::warn!(
                        job_id = ?id.map(|id| id.to_string()),
                        error = %error,
                        "Failed to persist job status"
                    );
                }
            });
        }

        status.observation().notify(JobEvent::Finished {
            status: status.clone(),
            error,
        });
    }

    /// Wait until the job is FINISHED.
    pub async fn join(&self) -> Result<()> {
        self.status().wait_finished().await
    }

    /// Wait at most `timeout`; returns whether the job finished.
    pub async fn join_timeout(&self, timeout: Duration) -> Result<bool> {
        self.status().wait_finished_timeout(timeout).await
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.status().cancel();
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Context passed to a payload while it runs.
pub struct JobContext {
    job: Job,
}

impl JobContext {
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn job_id(&self) -> Option<&JobId> {
        self.job.id()
    }

    pub fn job_type(&self) -> &str {
        self.job.job_type()
    }

    pub fn request(&self) -> &Request {
        self.job.request()
    }

    pub fn status(&self) -> &Arc<JobStatus> {
        self.job.status()
    }

    /// Check if cancellation has been requested.
    pub fn is_canceled(&self) -> bool {
        self.status().is_canceled()
    }

    pub fn set_cancelable(&self, cancelable: bool) {
        self.status().set_cancelable(cancelable);
    }

    /// Shortcut for payloads that honor cancellation.
    pub fn check_canceled(&self) -> JobResult {
        if self.is_canceled() {
            Err(JobError::canceled())
        } else {
            Ok(())
        }
    }

    /// Report progress.
    pub fn report_progress(&self, percent: u8, message: Option<String>) {
        self.status().set_progress(percent, message);
    }

    /// Log a message associated with this job.
    pub fn log_info(&self, message: &str) {
        self.status().log(LogLevel::Info, message);
    }

    /// Log a warning associated with this job.
    pub fn log_warn(&self, message: &str) {
        self.status().log(LogLevel::Warn, message);
    }

    /// Log an error associated with this job.
    pub fn log_error(&self, message: &str) {
        self.status().log(LogLevel::Error, message);
    }

    pub async fn ask(&self, question: Question) -> Result<()> {
        self.status().ask(question).await
    }

    pub async fn ask_timeout(&self, question: Question, timeout: Duration) -> Result<bool> {
        self.status().ask_timeout(question, timeout).await
    }

    /// Executor that scheduled this job, for submitting sub-jobs.
    pub fn executor(&self) -> Option<JobExecutor> {
        self.job.executor()
    }

    /// Run a sub-job inline on this call chain and wait for it.
    pub async fn run_sub_job(&self, handler: Arc<dyn JobHandler>, request: Request) -> Result<Job> {
        Job::start(handler, request, self.job.services().clone()).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
