//! Task-local execution state for running jobs.
//!
//! Two values travel with a job's call chain:
//!
//! - the **current job**: the status of the job whose payload is executing.
//!   Nested scopes form a stack; leaving a scope pops it on every exit path.
//! - the **execution context**: a property bag shared by everything running
//!   on behalf of a job, restorable from a request snapshot.

use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use super::status::JobStatus;
use crate::error::{ApexError, Result};

tokio::task_local! {
    static CURRENT_JOB: Arc<JobStatus>;
    static EXECUTION_CONTEXT: Arc<ExecutionContext>;
}

// ═══════════════════════════════════════════════════════════════════════════════
// Current Job
// ═══════════════════════════════════════════════════════════════════════════════

/// Status of the job running on this call chain, if any.
pub fn current_job_status() -> Option<Arc<JobStatus>> {
    CURRENT_JOB.try_with(Arc::clone).ok()
}

/// Run `future` with `status` pushed as the current job.
pub(crate) async fn with_current_job<F: Future>(status: Arc<JobStatus>, future: F) -> F::Output {
    CURRENT_JOB.scope(status, future).await
}

// ═══════════════════════════════════════════════════════════════════════════════
// Execution Context
// ═══════════════════════════════════════════════════════════════════════════════

/// Property bag carried across a job's call chain.
#[derive(Default)]
pub struct ExecutionContext {
    values: RwLock<Map<String, Value>>,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("keys", &self.values.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// The context of the current call chain, if one was established.
    pub fn current() -> Option<Arc<ExecutionContext>> {
        EXECUTION_CONTEXT.try_with(Arc::clone).ok()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.values.read().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.values.write().insert(key.into(), value)
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.values.write().remove(key)
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }

    /// Copy of the current values, suitable for a request's context property.
    pub fn snapshot(&self) -> Value {
        Value::Object(self.values.read().clone())
    }

    /// Run `future` with this context installed; the previous one comes back
    /// when the future completes or is dropped.
    pub async fn scope<F: Future>(self: Arc<Self>, future: F) -> F::Output {
        EXECUTION_CONTEXT.scope(self, future).await
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Context Store
// ═══════════════════════════════════════════════════════════════════════════════

/// Initializes fresh contexts and restores snapshots into them.
pub trait ContextStore: Send + Sync + fmt::Debug {
    /// Prepare a freshly created context.
    fn initialize(&self, _context: &ExecutionContext) {}

    /// Load `snapshot` into `context`. Errors abort the job before it runs.
    fn restore(&self, context: &ExecutionContext, snapshot: &Value) -> Result<()>;
}

/// Restores JSON object snapshots key by key.
#[derive(Debug, Default, Clone)]
pub struct PropertyContextStore;

impl ContextStore for PropertyContextStore {
    fn restore(&self, context: &ExecutionContext, snapshot: &Value) -> Result<()> {
        let entries = snapshot.as_object().ok_or_else(|| {
            ApexError::context_restore_failed(format!(
                "context snapshot must be an object, got {}",
                value_kind(snapshot)
            ))
        })?;

        for (key, value) in entries {
            context.set(key.clone(), value.clone());
        }
        tracing::debug!(keys = entries.len(), "Execution context restored");
        Ok(())
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::jobs::request::Request;
    use serde_json::json;

    #[tokio::test]
    async fn test_current_job_nests() {
        assert!(current_job_status().is_none());

        let outer = JobStatus::standalone("outer", Request::new());
        let inner = JobStatus::standalone("inner", Request::new());

        with_current_job(outer.clone(), async {
            assert_eq!(current_job_status().unwrap().job_type(), "outer");
            with_current_job(inner.clone(), async {
                assert_eq!(current_job_status().unwrap().job_type(), "inner");
            })
            .await;
            assert_eq!(current_job_status().unwrap().job_type(), "outer");
        })
        .await;

        assert!(current_job_status().is_none());
    }

    #[tokio::test]
    async fn test_context_scope() {
        assert!(ExecutionContext::current().is_none());

        let context = Arc::new(ExecutionContext::new());
        context.set("tenant", json!("acme"));

        context
            .scope(async {
                let current = ExecutionContext::current().unwrap();
                assert_eq!(current.get("tenant"), Some(json!("acme")));
            })
            .await;

        assert!(ExecutionContext::current().is_none());
    }

    #[test]
    fn test_restore_object_snapshot() {
        let context = ExecutionContext::new();
        PropertyContextStore
            .restore(&context, &json!({"user": "admin", "depth": 2}))
            .unwrap();

        assert_eq!(context.len(), 2);
        assert_eq!(context.get("depth"), Some(json!(2)));
        assert_eq!(context.snapshot(), json!({"user": "admin", "depth": 2}));
    }

    #[test]
    fn test_restore_rejects_non_object() {
        let context = ExecutionContext::new();
        let error = PropertyContextStore
            .restore(&context, &json!(["not", "an", "object"]))
            .unwrap_err();

        assert_eq!(error.code(), ErrorCode::ContextRestoreFailed);
        assert!(context.is_empty());
    }
}
