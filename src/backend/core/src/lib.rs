#![allow(clippy::result_large_err)]
//! # Apex Jobs
//!
//! In-process asynchronous job orchestration.
//!
//! ## Architecture
//!
//! - **Jobs**: lifecycle state machine, sub-job tracking and the interactive ask/answer protocol
//! - **Executor**: grouped-exclusion scheduler; jobs whose group paths conflict never run together
//! - **Observation**: synchronous observers and a broadcast stream of job events
//! - **Telemetry**: structured logging with JSON/pretty/compact output

pub mod config;
pub mod error;
pub mod jobs;
pub mod telemetry;

pub use error::{ApexError, Result, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{Config, ExecutorConfig, GroupConfig};
    pub use crate::error::{ApexError, Result, ErrorCode, ErrorContext, ErrorDetails, ErrorSeverity};
    pub use crate::jobs::{
        Job, JobContext, JobError, JobEvent, JobExecutor, JobGroupPath, JobHandler, JobId,
        JobObserver, JobRegistry, JobResult, JobState, JobStatus, Question, Request,
    };
}
