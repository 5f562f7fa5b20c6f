//! Telemetry: structured logging.
//!
//! Jobs log through `tracing` with `job_id`/`job_type` fields and run inside a
//! `job` span; counters are emitted through the `metrics` facade and picked
//! up by whatever recorder the host installs.
//!
//! # Example
//!
//! ```rust,no_run
//! use apex_jobs::telemetry::{init_logging, LoggingConfig};
//!
//! init_logging(&LoggingConfig::default()).expect("Failed to initialize logging");
//! ```

pub mod logging;

pub use logging::{init_logging, LogFormat, LoggingConfig};
