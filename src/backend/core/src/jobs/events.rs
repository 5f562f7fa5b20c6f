//! Job lifecycle notifications.
//!
//! The [`ObservationManager`] delivers every [`JobEvent`] twice: first to
//! synchronous [`JobObserver`]s on the emitting task (an observer may answer a
//! question right there, in which case the asking job never blocks), then to
//! async subscribers through a broadcast channel.

use parking_lot::RwLock;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::request::JobId;
use super::status::{JobError, JobStatus, Question};

/// Events emitted while jobs run.
#[derive(Debug, Clone)]
pub enum JobEvent {
    /// The job entered RUNNING
    Started { status: Arc<JobStatus> },
    /// The job is about to be frozen; last chance to react
    Finishing {
        status: Arc<JobStatus>,
        error: Option<JobError>,
    },
    /// The job reached FINISHED
    Finished {
        status: Arc<JobStatus>,
        error: Option<JobError>,
    },
    /// The job reported progress
    Progress {
        status: Arc<JobStatus>,
        percent: u8,
        message: Option<String>,
    },
    /// A question is pending on the (root) status
    QuestionAsked {
        status: Arc<JobStatus>,
        question: Question,
    },
    /// The pending question was answered
    QuestionAnswered {
        status: Arc<JobStatus>,
        question: Question,
    },
}

impl JobEvent {
    /// Status of the job the event is about.
    pub fn status(&self) -> &Arc<JobStatus> {
        match self {
            Self::Started { status }
            | Self::Finishing { status, .. }
            | Self::Finished { status, .. }
            | Self::Progress { status, .. }
            | Self::QuestionAsked { status, .. }
            | Self::QuestionAnswered { status, .. } => status,
        }
    }

    pub fn job_id(&self) -> Option<&JobId> {
        self.status().request().id()
    }

    /// Short event name, used for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Started { .. } => "started",
            Self::Finishing { .. } => "finishing",
            Self::Finished { .. } => "finished",
            Self::Progress { .. } => "progress",
            Self::QuestionAsked { .. } => "question_asked",
            Self::QuestionAnswered { .. } => "question_answered",
        }
    }
}

/// Synchronous event listener.
pub trait JobObserver: Send + Sync {
    fn on_event(&self, event: &JobEvent);
}

impl<F> JobObserver for F
where
    F: Fn(&JobEvent) + Send + Sync,
{
    fn on_event(&self, event: &JobEvent) {
        self(event)
    }
}

/// Fire-and-forget notification sink shared by every job of an executor.
pub struct ObservationManager {
    observers: RwLock<Vec<Arc<dyn JobObserver>>>,
    sender: broadcast::Sender<JobEvent>,
}

impl fmt::Debug for ObservationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservationManager")
            .field("observers", &self.observers.read().len())
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for ObservationManager {
    fn default() -> Self {
        Self::new(Self::DEFAULT_BUFFER)
    }
}

impl ObservationManager {
    pub const DEFAULT_BUFFER: usize = 1024;

    /// Create a manager whose broadcast channel keeps `buffer` events.
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self {
            observers: RwLock::new(Vec::new()),
            sender,
        }
    }

    /// Register a synchronous observer.
    pub fn add_observer(&self, observer: Arc<dyn JobObserver>) {
        self.observers.write().push(observer);
    }

    /// Remove a previously registered observer (compared by pointer).
    pub fn remove_observer(&self, observer: &Arc<dyn JobObserver>) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|o| !Arc::ptr_eq(o, observer));
        observers.len() != before
    }

    /// Subscribe to the async event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.sender.subscribe()
    }

    /// Deliver an event. Never fails; observer panics are logged and swallowed.
    pub fn notify(&self, event: JobEvent) {
        // Snapshot so observers can (un)register while being notified.
        let observers = self.observers.read().clone();
        for observer in observers {
            if catch_unwind(AssertUnwindSafe(|| observer.on_event(&event))).is_err() {
                tracing::warn!(
                    event = event.kind(),
                    job_id = ?event.job_id().map(ToString::to_string),
                    "Job observer panicked"
                );
            }
        }

        tracing::trace!(event = event.kind(), "Job event emitted");
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::request::Request;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn status() -> Arc<JobStatus> {
        JobStatus::standalone("test", Request::new())
    }

    #[test]
    fn test_observers_receive_events() {
        let manager = ObservationManager::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        manager.add_observer(Arc::new(move |_: &JobEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        manager.notify(JobEvent::Started { status: status() });
        manager.notify(JobEvent::Finished { status: status(), error: None });

        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_observer_is_isolated() {
        let manager = ObservationManager::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        manager.add_observer(Arc::new(|_: &JobEvent| panic!("observer bug")));
        manager.add_observer(Arc::new(move |_: &JobEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        manager.notify(JobEvent::Started { status: status() });
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_remove_observer() {
        let manager = ObservationManager::default();
        let observer: Arc<dyn JobObserver> = Arc::new(|_: &JobEvent| {});
        manager.add_observer(observer.clone());
        assert!(manager.remove_observer(&observer));
        assert!(!manager.remove_observer(&observer));
    }

    #[tokio::test]
    async fn test_broadcast_subscribers() {
        let manager = ObservationManager::default();
        let mut rx = manager.subscribe();

        manager.notify(JobEvent::Started { status: status() });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind(), "started");
    }
}
