//! Job orchestration engine.
//!
//! This module runs long operations as trackable jobs:
//!
//! - **Request / Job**: what to run and the handle driving it through its lifecycle
//! - **JobStatus**: state machine, ask/answer protocol, progress and log tail
//! - **JobExecutor**: grouped-exclusion scheduler over per-group worker pools
//! - **GroupedJobInitializerManager**: per-group pool policy with ancestor fallback
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                             Job Executor                                     │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐    ┌─────────────┐  │
//! │  │  Registry   │    │    Job      │    │  Conflict   │    │ Free pool / │  │
//! │  │ (type ->    │───▶│ initialize  │───▶│  check +    │───▶│ group pools │  │
//! │  │  factory)   │    │             │    │ FIFO queue  │    │             │  │
//! │  └─────────────┘    └─────────────┘    └─────────────┘    └─────────────┘  │
//! │                            │                                     │         │
//! │                            ▼                                     ▼         │
//! │  ┌─────────────────────────────────────────────────────────────────────┐  │
//! │  │   JobStatus: NONE → RUNNING ⇄ WAITING → FINISHED                    │  │
//! │  │   events → ObservationManager     snapshot → JobStatusStore         │  │
//! │  └─────────────────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```rust,ignore
//! use apex_jobs::jobs::{JobContext, JobExecutor, JobGroupPath, JobHandler, JobRegistry, JobResult, Request};
//!
//! #[derive(Default)]
//! struct InstallJob;
//!
//! #[async_trait]
//! impl JobHandler for InstallJob {
//!     fn job_type(&self) -> &str { "install" }
//!
//!     fn group_path(&self, request: &Request) -> Option<JobGroupPath> {
//!         let target: String = request.property("target").ok()??;
//!         Some(JobGroupPath::new(["install", target.as_str()]))
//!     }
//!
//!     async fn run_internal(&self, ctx: &JobContext) -> JobResult {
//!         ctx.log_info("installing");
//!         Ok(())
//!     }
//! }
//!
//! let registry = Arc::new(JobRegistry::new());
//! registry.register::<InstallJob>();
//!
//! let executor = JobExecutor::new(registry);
//! let job = executor.execute("install", Request::builder().property("target", "app").build())?;
//! job.join().await?;
//! ```

pub mod context;
pub mod events;
pub mod executor;
pub mod group;
pub mod initializer;
pub mod job;
pub mod log;
pub mod progress;
pub mod registry;
pub mod request;
pub mod status;
pub mod store;
pub mod worker;

pub use context::{current_job_status, ContextStore, ExecutionContext, PropertyContextStore};
pub use events::{JobEvent, JobObserver, ObservationManager};
pub use executor::{JobExecutor, WeakJobExecutor};
pub use group::JobGroupPath;
pub use initializer::{GroupedJobInitializer, GroupedJobInitializerManager};
pub use job::{Job, JobContext, JobHandler, JobServices};
pub use log::{LogEntry, LogLevel, LogTail, MemoryLogTail};
pub use progress::{JobProgress, ProgressUpdate};
pub use registry::{JobFactory, JobRegistry};
pub use request::{JobId, Request, RequestBuilder};
pub use status::{JobError, JobResult, JobState, JobStatus, JobStatusSnapshot, Question};
pub use store::{InMemoryJobStatusStore, JobStatusStore};
pub use worker::{WorkerPool, WorkerPoolConfig, WorkerPoolStats};
