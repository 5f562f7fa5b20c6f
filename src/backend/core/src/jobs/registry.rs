//! Job type registry.
//!
//! Maps a job type name to a factory building its handler. Executors resolve
//! `execute(job_type, request)` calls through it.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::job::JobHandler;
use crate::error::{ApexError, Result};

/// Builds a fresh handler for one job.
pub type JobFactory = Arc<dyn Fn() -> Arc<dyn JobHandler> + Send + Sync>;

#[derive(Default)]
pub struct JobRegistry {
    factories: RwLock<HashMap<String, JobFactory>>,
}

impl fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRegistry")
            .field("job_types", &self.job_types())
            .finish()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler type under the name it reports.
    pub fn register<H>(&self)
    where
        H: JobHandler + Default,
    {
        let job_type = H::default().job_type().to_string();
        self.register_factory(job_type, || Arc::new(H::default()) as Arc<dyn JobHandler>);
    }

    /// Register a factory under an explicit name. Replaces any previous one.
    pub fn register_factory<F>(&self, job_type: impl Into<String>, factory: F)
    where
        F: Fn() -> Arc<dyn JobHandler> + Send + Sync + 'static,
    {
        let job_type = job_type.into();
        tracing::debug!(job_type = %job_type, "Registered job type");
        self.factories.write().insert(job_type, Arc::new(factory));
    }

    /// Build a handler for `job_type`.
    pub fn create(&self, job_type: &str) -> Result<Arc<dyn JobHandler>> {
        let factory = self
            .factories
            .read()
            .get(job_type)
            .cloned()
            .ok_or_else(|| ApexError::job_type_not_found(job_type))?;
        Ok(factory())
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.factories.read().contains_key(job_type)
    }

    /// Registered names, sorted.
    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<_> = self.factories.read().keys().cloned().collect();
        types.sort();
        types
    }
}
