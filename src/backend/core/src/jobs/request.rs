//! Job identifiers and requests.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{ApexError, ErrorCode, Result};

// ═══════════════════════════════════════════════════════════════════════════════
// Job Identification
// ═══════════════════════════════════════════════════════════════════════════════

/// Unique key of a job instance, made of ordered string segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Vec<String>);

impl JobId {
    /// Create an id from its segments.
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// The id segments, in order.
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Return a new id with one more segment.
    pub fn child(&self, segment: impl Into<String>) -> Self {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("/"))
    }
}

impl FromStr for JobId {
    type Err = ApexError;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(ApexError::new(ErrorCode::InvalidRequest, "Job id cannot be empty"));
        }
        Ok(Self::new(s.split('/')))
    }
}

impl<S: Into<String>> From<Vec<S>> for JobId {
    fn from(segments: Vec<S>) -> Self {
        Self::new(segments)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Request
// ═══════════════════════════════════════════════════════════════════════════════

/// Description of a job invocation.
///
/// A request is built by the caller and handed over to the executor; once the
/// job owning it starts, it is only ever read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    /// Job id (fire-and-forget jobs may omit it)
    id: Option<JobId>,
    /// Arbitrary typed properties
    #[serde(default)]
    properties: HashMap<String, serde_json::Value>,
    /// Whether the job should log verbosely
    verbose: bool,
    /// Whether the request came from a remote caller
    remote: bool,
    /// Whether the job may ask questions
    interactive: bool,
    /// Log isolation override (`None` inherits the default)
    status_log_isolated: Option<bool>,
    /// Status persistence override (`None` inherits the default)
    status_serialized: Option<bool>,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            id: None,
            properties: HashMap::new(),
            verbose: true,
            remote: false,
            interactive: false,
            status_log_isolated: None,
            status_serialized: None,
        }
    }
}

impl Request {
    /// Reserved property holding a serialized execution context snapshot.
    pub const CONTEXT_KEY: &'static str = "context";

    pub fn new() -> Self {
        Self::default()
    }

    /// Start building a request.
    pub fn builder() -> RequestBuilder {
        RequestBuilder::default()
    }

    pub fn id(&self) -> Option<&JobId> {
        self.id.as_ref()
    }

    pub fn properties(&self) -> &HashMap<String, serde_json::Value> {
        &self.properties
    }

    /// Raw property value.
    pub fn property_value(&self, key: &str) -> Option<&serde_json::Value> {
        self.properties.get(key)
    }

    /// Typed property value.
    ///
    /// Returns `Ok(None)` when the key is absent and an error when the stored
    /// value does not deserialize into `T`.
    pub fn property<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.properties.get(key) {
            Some(value) => serde_json::from_value(value.clone())
                .map(Some)
                .map_err(|e| {
                    ApexError::invalid_request(format!("Invalid value for property {}", key))
                        .with_source(e)
                }),
            None => Ok(None),
        }
    }

    pub fn contains_property(&self, key: &str) -> bool {
        self.properties.contains_key(key)
    }

    /// Serialized execution context to restore before the job runs.
    pub fn context_snapshot(&self) -> Option<&serde_json::Value> {
        self.properties.get(Self::CONTEXT_KEY)
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn is_remote(&self) -> bool {
        self.remote
    }

    pub fn is_interactive(&self) -> bool {
        self.interactive
    }

    pub fn status_log_isolated(&self) -> Option<bool> {
        self.status_log_isolated
    }

    pub fn status_serialized(&self) -> Option<bool> {
        self.status_serialized
    }

    /// Turn the request back into a builder, e.g. to fill in defaults.
    pub fn to_builder(&self) -> RequestBuilder {
        RequestBuilder {
            request: self.clone(),
        }
    }
}

/// Fluent builder for [`Request`].
#[derive(Debug, Clone, Default)]
pub struct RequestBuilder {
    request: Request,
}

impl RequestBuilder {
    pub fn id(mut self, id: impl Into<JobId>) -> Self {
        self.request.id = Some(id.into());
        self
    }

    /// Set a property. Values that fail to serialize are skipped with a warning.
    pub fn property(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        let key = key.into();
        match serde_json::to_value(value) {
            Ok(v) => {
                self.request.properties.insert(key, v);
            }
            Err(e) => {
                tracing::warn!(property = %key, error = %e, "Skipping unserializable request property");
            }
        }
        self
    }

    /// Attach an execution context snapshot.
    pub fn context(self, snapshot: serde_json::Value) -> Self {
        self.property(Request::CONTEXT_KEY, snapshot)
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.request.verbose = verbose;
        self
    }

    pub fn remote(mut self, remote: bool) -> Self {
        self.request.remote = remote;
        self
    }

    pub fn interactive(mut self, interactive: bool) -> Self {
        self.request.interactive = interactive;
        self
    }

    pub fn status_log_isolated(mut self, isolated: impl Into<Option<bool>>) -> Self {
        self.request.status_log_isolated = isolated.into();
        self
    }

    pub fn status_serialized(mut self, serialized: impl Into<Option<bool>>) -> Self {
        self.request.status_serialized = serialized.into();
        self
    }

    pub fn build(self) -> Request {
        self.request
    }
}
