//! Job status: lifecycle state machine and the ask/answer protocol.
//!
//! A [`JobStatus`] is created together with its job and is mutated only by
//! that job while it runs (and by whoever answers its questions). Once the
//! state reaches [`JobState::Finished`] it is frozen and only read.
//!
//! Sub-job statuses keep a weak back-reference to their parent. Questions
//! asked on a sub-job are forwarded up to the root ancestor, which is the
//! only status that publishes the question and actually waits.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use metrics::counter;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::events::{JobEvent, ObservationManager};
use super::log::{LogEntry, LogLevel, LogTail, MemoryLogTail};
use super::progress::{JobProgress, ProgressUpdate};
use super::request::{JobId, Request};
use crate::error::{ApexError, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Job State
// ═══════════════════════════════════════════════════════════════════════════════

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Created, not started yet
    None,
    /// Executing its payload
    Running,
    /// Blocked on a question
    Waiting,
    /// Done (terminal)
    Finished,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished)
    }

    /// NONE -> RUNNING -> (WAITING <-> RUNNING)* -> FINISHED
    pub fn can_transition_to(&self, next: JobState) -> bool {
        matches!(
            (self, next),
            (Self::None, Self::Running)
                | (Self::Running, Self::Waiting)
                | (Self::Waiting, Self::Running)
                | (Self::Running, Self::Finished)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Running => write!(f, "running"),
            Self::Waiting => write!(f, "waiting"),
            Self::Finished => write!(f, "finished"),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Error
// ═══════════════════════════════════════════════════════════════════════════════

/// Failure captured from a job payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    /// Error message
    pub message: String,
    /// Optional error code
    pub code: Option<String>,
    /// Additional context
    pub context: Option<serde_json::Value>,
}

impl JobError {
    pub const PANIC_CODE: &'static str = "panic";
    pub const CANCELED_CODE: &'static str = "canceled";

    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
            context: None,
        }
    }

    /// Failure marking a payload that stopped because it was canceled.
    pub fn canceled() -> Self {
        Self::new("Job was canceled").with_code(Self::CANCELED_CODE)
    }

    /// Build an error from a caught panic payload.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "job panicked".to_string()
        };
        Self::new(message).with_code(Self::PANIC_CODE)
    }

    /// Add an error code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Add context.
    pub fn with_context(mut self, context: impl Serialize) -> Self {
        self.context = serde_json::to_value(context).ok();
        self
    }

    pub fn is_canceled(&self) -> bool {
        self.code.as_deref() == Some(Self::CANCELED_CODE)
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(code) = &self.code {
            write!(f, " (code: {})", code)?;
        }
        Ok(())
    }
}

impl std::error::Error for JobError {}

impl From<ApexError> for JobError {
    fn from(error: ApexError) -> Self {
        Self {
            message: error.user_message().to_string(),
            code: Some(error.code().to_string()),
            context: None,
        }
    }
}

/// Result type for job payloads.
pub type JobResult = std::result::Result<(), JobError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Question
// ═══════════════════════════════════════════════════════════════════════════════

/// A question a running job asks, together with the slot its answer goes into.
///
/// Clones share the answer slot, so the asking payload sees what the answering
/// side wrote.
#[derive(Debug, Clone)]
pub struct Question {
    kind: String,
    payload: serde_json::Value,
    answer: Arc<Mutex<Option<serde_json::Value>>>,
}

impl Question {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            answer: Arc::new(Mutex::new(None)),
        }
    }

    /// Question type, used by observers to decide whether they can answer it.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn set_answer(&self, answer: serde_json::Value) {
        *self.answer.lock() = Some(answer);
    }

    pub fn answer(&self) -> Option<serde_json::Value> {
        self.answer.lock().clone()
    }

    /// True when both handles refer to the same question.
    pub fn same_as(&self, other: &Question) -> bool {
        Arc::ptr_eq(&self.answer, &other.answer)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Status Snapshot
// ═══════════════════════════════════════════════════════════════════════════════

/// Serializable copy of a status, handed to the status store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStatusSnapshot {
    pub id: Option<JobId>,
    pub job_type: String,
    pub state: JobState,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub error: Option<JobError>,
    pub canceled: bool,
    pub progress: ProgressUpdate,
    pub log: Vec<LogEntry>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Status
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct Timeline {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct QuestionSlot {
    question: Option<Question>,
    deadline: Option<Instant>,
    /// Bumped on every answer; waiters compare against the value they saw.
    answers: u64,
}

/// Observable, mutable lifecycle state of a job.
pub struct JobStatus {
    me: Weak<JobStatus>,
    job_type: String,
    request: Arc<Request>,
    parent: Option<Weak<JobStatus>>,
    state: watch::Sender<JobState>,
    error: RwLock<Option<JobError>>,
    timeline: RwLock<Timeline>,
    cancelable: AtomicBool,
    canceled: AtomicBool,
    question: Mutex<QuestionSlot>,
    answered: Notify,
    /// One outstanding question per root at a time.
    ask_lock: tokio::sync::Mutex<()>,
    interrupt: CancellationToken,
    progress: JobProgress,
    log: Arc<dyn LogTail>,
    observation: Arc<ObservationManager>,
}

impl fmt::Debug for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobStatus")
            .field("job_type", &self.job_type)
            .field("id", &self.request.id())
            .field("state", &self.state())
            .field("sub_job", &self.is_sub_job())
            .field("canceled", &self.is_canceled())
            .field("error", &*self.error.read())
            .finish()
    }
}

impl JobStatus {
    /// Create a status.
    ///
    /// `parent` is the status of the job running on the caller's chain, if any.
    pub fn new(
        job_type: impl Into<String>,
        request: Arc<Request>,
        parent: Option<&Arc<JobStatus>>,
        log: Arc<dyn LogTail>,
        observation: Arc<ObservationManager>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(JobState::None);
        let job_type = job_type.into();
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            job_type,
            request,
            parent: parent.map(Arc::downgrade),
            state,
            error: RwLock::new(None),
            timeline: RwLock::new(Timeline::default()),
            cancelable: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            question: Mutex::new(QuestionSlot::default()),
            answered: Notify::new(),
            ask_lock: tokio::sync::Mutex::new(()),
            interrupt: CancellationToken::new(),
            progress: JobProgress::new(),
            log,
            observation,
        })
    }

    /// Top-level status with its own log tail and observation manager.
    pub fn standalone(job_type: impl Into<String>, request: Request) -> Arc<Self> {
        Self::new(
            job_type,
            Arc::new(request),
            None,
            Arc::new(MemoryLogTail::default()),
            Arc::new(ObservationManager::default()),
        )
    }

    fn emit(&self, event: impl FnOnce(Arc<JobStatus>) -> JobEvent) {
        if let Some(me) = self.me.upgrade() {
            self.observation.notify(event(me));
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Identity
    // ─────────────────────────────────────────────────────────────────────────

    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn request_arc(&self) -> Arc<Request> {
        self.request.clone()
    }

    /// Display form of the job id, `-` for anonymous jobs.
    pub fn display_id(&self) -> String {
        self.request
            .id()
            .map(ToString::to_string)
            .unwrap_or_else(|| "-".to_string())
    }

    /// Parent status, if this is a sub-job and the parent is still alive.
    pub fn parent_status(&self) -> Option<Arc<JobStatus>> {
        self.parent.as_ref().and_then(Weak::upgrade)
    }

    /// Whether this job was started from another running job.
    pub fn is_sub_job(&self) -> bool {
        self.parent.is_some()
    }

    /// Log isolation: request override, else true for top-level jobs only.
    pub fn is_isolated(&self) -> bool {
        self.request
            .status_log_isolated()
            .unwrap_or(!self.is_sub_job())
    }

    /// Persistence: request override, else true for top-level jobs only.
    pub fn is_serialized(&self) -> bool {
        self.request.status_serialized().unwrap_or(!self.is_sub_job())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // State
    // ─────────────────────────────────────────────────────────────────────────

    pub fn state(&self) -> JobState {
        *self.state.borrow()
    }

    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn set_state(&self, next: JobState) -> Result<()> {
        let mut from = JobState::None;
        let changed = self.state.send_if_modified(|state| {
            from = *state;
            if state.can_transition_to(next) {
                *state = next;
                true
            } else {
                false
            }
        });

        if changed {
            tracing::debug!(
                job_id = %self.display_id(),
                job_type = %self.job_type,
                from = %from,
                to = %next,
                "Job state changed"
            );
            Ok(())
        } else {
            Err(ApexError::invalid_state_transition(from, next))
        }
    }

    /// Freeze the status. Returns `false` if it was already FINISHED.
    pub(crate) fn mark_finished(&self) -> bool {
        let mut from = JobState::None;
        let changed = self.state.send_if_modified(|state| {
            from = *state;
            if state.is_terminal() {
                false
            } else {
                *state = JobState::Finished;
                true
            }
        });
        if changed && from != JobState::Running {
            tracing::warn!(
                job_id = %self.display_id(),
                from = %from,
                "Job finished from an unexpected state"
            );
        }
        changed
    }

    fn ensure_mutable(&self, what: &str) -> Result<()> {
        if self.is_finished() {
            Err(ApexError::invalid_state_transition(JobState::Finished, what))
        } else {
            Ok(())
        }
    }

    pub fn start_date(&self) -> Option<DateTime<Utc>> {
        self.timeline.read().start
    }

    pub fn set_start_date(&self, date: DateTime<Utc>) -> Result<()> {
        self.ensure_mutable("start_date")?;
        self.timeline.write().start = Some(date);
        Ok(())
    }

    pub fn end_date(&self) -> Option<DateTime<Utc>> {
        self.timeline.read().end
    }

    pub fn set_end_date(&self, date: DateTime<Utc>) -> Result<()> {
        self.ensure_mutable("end_date")?;
        self.timeline.write().end = Some(date);
        Ok(())
    }

    pub fn error(&self) -> Option<JobError> {
        self.error.read().clone()
    }

    pub fn set_error(&self, error: JobError) -> Result<()> {
        self.ensure_mutable("error")?;
        *self.error.write() = Some(error);
        Ok(())
    }

    /// Finished without a captured error.
    pub fn succeeded(&self) -> bool {
        self.is_finished() && self.error.read().is_none()
    }

    /// Finished with a captured error.
    pub fn failed(&self) -> bool {
        self.is_finished() && self.error.read().is_some()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Cancellation
    // ─────────────────────────────────────────────────────────────────────────

    pub fn is_cancelable(&self) -> bool {
        self.cancelable.load(Ordering::Acquire)
    }

    /// Advertise whether canceling this job is meaningful.
    pub fn set_cancelable(&self, cancelable: bool) {
        self.cancelable.store(cancelable, Ordering::Release);
    }

    /// Request cooperative cancellation. Idempotent; never interrupts waits.
    pub fn cancel(&self) {
        if !self.canceled.swap(true, Ordering::AcqRel) {
            tracing::info!(
                job_id = %self.display_id(),
                job_type = %self.job_type,
                cancelable = self.is_cancelable(),
                "Job cancellation requested"
            );
        }
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }

    /// Interrupt every `ask` and `join` blocked on this status.
    pub fn interrupt(&self) {
        self.interrupt.cancel();
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupt.is_cancelled()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Waiting for completion
    // ─────────────────────────────────────────────────────────────────────────

    /// Wait until the state is FINISHED.
    pub async fn wait_finished(&self) -> Result<()> {
        let mut rx = self.state.subscribe();
        tokio::select! {
            biased;
            result = rx.wait_for(|s| s.is_terminal()) => {
                result.map(|_| ()).map_err(|_| ApexError::internal("job status dropped"))
            }
            _ = self.interrupt.cancelled() => {
                if self.is_finished() {
                    Ok(())
                } else {
                    Err(ApexError::interrupted("job completion"))
                }
            }
        }
    }

    /// Wait until FINISHED or the timeout elapses; returns whether it finished.
    pub async fn wait_finished_timeout(&self, timeout: Duration) -> Result<bool> {
        match tokio::time::timeout(timeout, self.wait_finished()).await {
            Ok(result) => result.map(|_| true),
            Err(_) => Ok(self.is_finished()),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Questions
    // ─────────────────────────────────────────────────────────────────────────

    /// Parent to forward questions to: alive and not finished.
    fn question_target(&self) -> Option<Arc<JobStatus>> {
        self.parent_status().filter(|p| !p.is_finished())
    }

    /// Ask a question and wait until it is answered.
    pub async fn ask(&self, question: Question) -> Result<()> {
        self.ask_inner(question, None).await.map(|_| ())
    }

    /// Ask a question and wait at most `timeout`.
    ///
    /// Returns `false` on timeout; the question then stays visible until
    /// [`answered`](Self::answered) is called.
    pub async fn ask_timeout(&self, question: Question, timeout: Duration) -> Result<bool> {
        self.ask_inner(question, Some(timeout)).await
    }

    fn ask_inner(&self, question: Question, timeout: Option<Duration>) -> BoxFuture<'_, Result<bool>> {
        Box::pin(async move {
            if let Some(parent) = self.question_target() {
                tracing::debug!(
                    job_id = %self.display_id(),
                    parent_id = %parent.display_id(),
                    "Forwarding question to parent job"
                );
                return parent.ask_inner(question, timeout).await;
            }
            self.wait_for_answer(question, timeout).await
        })
    }

    async fn wait_for_answer(&self, question: Question, timeout: Option<Duration>) -> Result<bool> {
        let _turn = tokio::select! {
            guard = self.ask_lock.lock() => guard,
            _ = self.interrupt.cancelled() => return Err(ApexError::interrupted("question slot")),
        };

        let previous = self.state();
        if previous != JobState::Running {
            return Err(ApexError::invalid_state_transition(previous, JobState::Waiting));
        }

        // A timeout past the clock's range waits without a deadline.
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        self.set_state(JobState::Waiting)?;
        let seen = {
            let mut slot = self.question.lock();
            slot.question = Some(question.clone());
            slot.deadline = deadline;
            slot.answers
        };
        let _restore = WaitingGuard { status: self };

        counter!("apex_job_questions_total", "kind" => question.kind().to_string()).increment(1);
        tracing::info!(
            job_id = %self.display_id(),
            job_type = %self.job_type,
            question = question.kind(),
            timeout_ms = timeout.map(|t| t.as_millis() as u64),
            "Job is waiting for an answer"
        );
        self.emit(|status| JobEvent::QuestionAsked { status, question });

        loop {
            let notified = self.answered.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.question.lock().answers != seen {
                return Ok(true);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = self.interrupt.cancelled() => {
                    return Err(ApexError::interrupted("an answer"));
                }
                _ = sleep_until(deadline) => {
                    return Ok(self.question.lock().answers != seen);
                }
            }
        }
    }

    /// Mark the pending question as answered and release its waiter.
    pub fn answered(&self) {
        if let Some(parent) = self.question_target() {
            parent.answered();
            return;
        }

        let question = {
            let mut slot = self.question.lock();
            let question = slot.question.take();
            if question.is_some() {
                slot.answers += 1;
            }
            question
        };

        if let Some(question) = question {
            self.answered.notify_waiters();
            tracing::debug!(
                job_id = %self.display_id(),
                question = question.kind(),
                "Job question answered"
            );
            self.emit(|status| JobEvent::QuestionAnswered { status, question });
        }
    }

    /// Store `answer` on the pending question, then release the waiter.
    ///
    /// Returns `false` if no question was pending.
    pub fn answer(&self, answer: serde_json::Value) -> bool {
        match self.question() {
            Some(question) => {
                question.set_answer(answer);
                self.answered();
                true
            }
            None => false,
        }
    }

    /// The pending question, looked up at the root ancestor.
    pub fn question(&self) -> Option<Question> {
        match self.question_target() {
            Some(parent) => parent.question(),
            None => self.question.lock().question.clone(),
        }
    }

    /// Remaining budget of a timed question; `None` when no deadline applies.
    pub fn question_time_left(&self) -> Option<Duration> {
        match self.question_target() {
            Some(parent) => parent.question_time_left(),
            None => self
                .question
                .lock()
                .deadline
                .map(|d| d.saturating_duration_since(Instant::now())),
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Progress & log
    // ─────────────────────────────────────────────────────────────────────────

    pub fn progress(&self) -> &JobProgress {
        &self.progress
    }

    /// Record progress and notify observers.
    pub fn set_progress(&self, percent: u8, message: Option<String>) {
        let update = self.progress.update(percent, message);
        self.emit(|status| JobEvent::Progress {
            status,
            percent: update.percent,
            message: update.message,
        });
    }

    pub fn log_tail(&self) -> &Arc<dyn LogTail> {
        &self.log
    }

    /// Append a line to the job log and mirror it to tracing.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        let id = self.display_id();
        match level {
            LogLevel::Debug => tracing::debug!(job_id = %id, job_type = %self.job_type, "{}", message),
            LogLevel::Info => tracing::info!(job_id = %id, job_type = %self.job_type, "{}", message),
            LogLevel::Warn => tracing::warn!(job_id = %id, job_type = %self.job_type, "{}", message),
            LogLevel::Error => tracing::error!(job_id = %id, job_type = %self.job_type, "{}", message),
        }
        self.log.append(LogEntry::new(level, message));
    }

    pub(crate) fn observation(&self) -> &Arc<ObservationManager> {
        &self.observation
    }

    /// Serializable copy for persistence.
    pub fn snapshot(&self) -> JobStatusSnapshot {
        let timeline = self.timeline.read();
        JobStatusSnapshot {
            id: self.request.id().cloned(),
            job_type: self.job_type.clone(),
            state: self.state(),
            start_date: timeline.start,
            end_date: timeline.end,
            error: self.error(),
            canceled: self.is_canceled(),
            progress: self.progress.current(),
            log: self.log.entries(),
        }
    }
}

/// Puts the status back to its pre-question state on every exit path,
/// including a dropped `ask` future.
struct WaitingGuard<'a> {
    status: &'a JobStatus,
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.status.question.lock().deadline = None;
        if self.status.state() == JobState::Waiting {
            let _ = self.status.set_state(JobState::Running);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn running(job_type: &str) -> Arc<JobStatus> {
        let status = JobStatus::standalone(job_type, Request::new());
        status.set_state(JobState::Running).unwrap();
        status
    }

    fn sub_status(parent: &Arc<JobStatus>, request: Request) -> Arc<JobStatus> {
        let status = JobStatus::new(
            "sub",
            Arc::new(request),
            Some(parent),
            parent.log_tail().clone(),
            parent.observation().clone(),
        );
        status.set_state(JobState::Running).unwrap();
        status
    }

    #[test]
    fn test_state_transitions() {
        assert!(JobState::None.can_transition_to(JobState::Running));
        assert!(JobState::Running.can_transition_to(JobState::Waiting));
        assert!(JobState::Waiting.can_transition_to(JobState::Running));
        assert!(JobState::Running.can_transition_to(JobState::Finished));
        assert!(!JobState::Finished.can_transition_to(JobState::Running));
        assert!(!JobState::None.can_transition_to(JobState::Finished));
    }

    #[test]
    fn test_finished_status_is_frozen() {
        let status = running("install");
        status.set_state(JobState::Finished).unwrap();

        assert!(status.set_state(JobState::Running).is_err());
        assert!(status.set_start_date(Utc::now()).is_err());
        assert!(status.set_error(JobError::new("late")).is_err());
        assert!(status.error().is_none());
        assert!(status.succeeded());
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let status = running("scan");
        assert!(!status.is_canceled());
        status.cancel();
        status.cancel();
        assert!(status.is_canceled());
        assert!(!status.is_interrupted());
    }

    #[test]
    fn test_isolation_defaults() {
        let root = running("root");
        assert!(root.is_isolated());
        assert!(root.is_serialized());

        let child = sub_status(&root, Request::new());
        assert!(child.is_sub_job());
        assert!(!child.is_isolated());
        assert!(!child.is_serialized());

        let overridden = sub_status(
            &root,
            Request::builder()
                .status_log_isolated(true)
                .status_serialized(true)
                .build(),
        );
        assert!(overridden.is_isolated());
        assert!(overridden.is_serialized());
    }

    #[test]
    fn test_parent_is_weak() {
        let root = running("root");
        let child = sub_status(&root, Request::new());
        assert!(child.parent_status().is_some());

        drop(root);
        assert!(child.parent_status().is_none());
        assert!(child.is_sub_job());
    }

    #[tokio::test]
    async fn test_ask_is_released_by_answer() {
        let status = running("install");
        let asker = status.clone();
        let handle = tokio::spawn(async move {
            let question = Question::new("confirm", serde_json::json!("confirm?"));
            asker.ask(question.clone()).await.unwrap();
            (asker.state(), question.answer())
        });

        while status.question().is_none() {
            tokio::task::yield_now().await;
        }
        assert_eq!(status.state(), JobState::Waiting);
        assert!(status.answer(serde_json::json!(true)));

        let (state, answer) = handle.await.unwrap();
        assert_eq!(state, JobState::Running);
        assert_eq!(answer, Some(serde_json::json!(true)));
        assert!(status.question().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_ask_keeps_question_visible() {
        let status = running("install");
        let answered = status
            .ask_timeout(Question::new("confirm", serde_json::Value::Null), Duration::from_millis(100))
            .await
            .unwrap();

        assert!(!answered);
        assert_eq!(status.state(), JobState::Running);
        assert!(status.question().is_some());
        assert_eq!(status.question_time_left(), None);

        status.answered();
        assert!(status.question().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_question_time_left_counts_down() {
        let status = running("install");
        let asker = status.clone();
        let handle = tokio::spawn(async move {
            asker
                .ask_timeout(Question::new("confirm", serde_json::Value::Null), Duration::from_secs(10))
                .await
        });

        while status.question().is_none() {
            tokio::task::yield_now().await;
        }
        tokio::time::advance(Duration::from_secs(4)).await;
        let left = status.question_time_left().unwrap();
        assert!(left <= Duration::from_secs(6));

        status.answered();
        assert!(handle.await.unwrap().unwrap());
    }

    #[tokio::test]
    async fn test_interrupt_releases_ask() {
        let status = running("install");
        let asker = status.clone();
        let handle = tokio::spawn(async move {
            asker.ask(Question::new("confirm", serde_json::Value::Null)).await
        });

        while status.question().is_none() {
            tokio::task::yield_now().await;
        }
        status.interrupt();

        let error = handle.await.unwrap().unwrap_err();
        assert_eq!(error.code(), crate::error::ErrorCode::Interrupted);
        assert_eq!(status.state(), JobState::Running);
    }

    #[tokio::test]
    async fn test_cancel_does_not_release_ask() {
        let status = running("install");
        status.cancel();
        let answered = status
            .ask_timeout(Question::new("confirm", serde_json::Value::Null), Duration::from_millis(20))
            .await
            .unwrap();
        assert!(!answered);
    }

    #[tokio::test]
    async fn test_sub_job_question_goes_to_root() {
        let root = running("root");
        let child = sub_status(&root, Request::new());

        let asker = child.clone();
        let handle = tokio::spawn(async move {
            asker.ask(Question::new("confirm", serde_json::Value::Null)).await
        });

        while root.question().is_none() {
            tokio::task::yield_now().await;
        }
        assert_eq!(root.state(), JobState::Waiting);
        assert_eq!(child.state(), JobState::Running);
        assert!(child.question().is_some());

        // answering through the sub-job reaches the root waiter
        child.answered();
        handle.await.unwrap().unwrap();
        assert!(root.question().is_none());
        assert_eq!(root.state(), JobState::Running);
    }

    #[tokio::test]
    async fn test_ask_requires_running_state() {
        let status = JobStatus::standalone("idle", Request::new());
        let error = status
            .ask(Question::new("confirm", serde_json::Value::Null))
            .await
            .unwrap_err();

        assert_eq!(error.code(), crate::error::ErrorCode::InvalidStateTransition);
        assert_eq!(status.state(), JobState::None);
        assert!(status.question().is_none());

        status.set_state(JobState::Running).unwrap();
        status.set_state(JobState::Finished).unwrap();
        assert!(status
            .ask_timeout(Question::new("confirm", serde_json::Value::Null), Duration::from_millis(1))
            .await
            .is_err());
        assert_eq!(status.state(), JobState::Finished);
    }

    #[tokio::test]
    async fn test_unbounded_timeout_waits_for_answer() {
        let status = running("install");
        let asker = status.clone();
        let handle = tokio::spawn(async move {
            asker
                .ask_timeout(Question::new("confirm", serde_json::Value::Null), Duration::MAX)
                .await
        });

        while status.question().is_none() {
            tokio::task::yield_now().await;
        }
        assert_eq!(status.state(), JobState::Waiting);
        assert_eq!(status.question_time_left(), None);

        status.answered();
        assert!(handle.await.unwrap().unwrap());
        assert_eq!(status.state(), JobState::Running);
    }

    #[tokio::test]
    async fn test_wait_finished_returns_immediately_when_done() {
        let status = running("scan");
        status.set_state(JobState::Finished).unwrap();
        assert!(status
            .wait_finished_timeout(Duration::from_millis(1))
            .await
            .unwrap());
    }

    #[test]
    fn test_job_error_from_panic() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        let error = JobError::from_panic(payload.as_ref());
        assert_eq!(error.message, "boom");
        assert_eq!(error.code.as_deref(), Some(JobError::PANIC_CODE));
    }

    #[test]
    fn test_snapshot() {
        let status = JobStatus::standalone(
            "scan",
            Request::builder().id(vec!["scan", "1"]).build(),
        );
        status.set_state(JobState::Running).unwrap();
        status.log(LogLevel::Info, "started scanning");
        status.set_progress(50, None);

        let snapshot = status.snapshot();
        assert_eq!(snapshot.id, Some(JobId::new(["scan", "1"])));
        assert_eq!(snapshot.state, JobState::Running);
        assert_eq!(snapshot.progress.percent, 50);
        assert_eq!(snapshot.log.len(), 1);
    }
}
