//! Request-scoped context.
//!
//! Every event store, cache and task queue call takes a [`Context`] so the
//! request id travels with the work into logs. There is no ambient or global
//! request state.

use tracing::Span;
use ulid::Ulid;

/// Explicit per-request handle threaded through collaborator calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Context {
    request_id: String,
    origin: String,
}

impl Context {
    /// Creates a context with a freshly generated request id.
    ///
    /// `origin` names the entry point (e.g. `ingest`, `refresh`, `reconcile`).
    #[must_use]
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            request_id: Ulid::new().to_string(),
            origin: origin.into(),
        }
    }

    /// Replaces the generated request id with one supplied by the caller.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Returns the request id for correlation.
    #[must_use]
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Returns the entry point that created this context.
    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Creates a span for an operation performed on behalf of this context.
    #[must_use]
    pub fn span(&self, operation: &str) -> Span {
        crate::observability::request_span(operation, &self.origin, &self.request_id)
    }
}
