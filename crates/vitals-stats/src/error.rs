//! Error types for vitals-stats operations.

use http::StatusCode;
use thiserror::Error;

/// Result type alias for stats operations.
pub type Result<T> = std::result::Result<T, StatsError>;

/// Errors that can occur while populating, reconciling or ingesting.
#[derive(Debug, Error)]
pub enum StatsError {
    /// Malformed or missing identifier.
    #[error("validation error: {reason}")]
    Validation {
        /// What was wrong with the input.
        reason: String,
    },

    /// The referenced project does not exist.
    #[error("unknown project: {id}")]
    UnknownProject {
        /// The project id that was looked up.
        id: String,
    },

    /// Event store operation failed.
    #[error("store error: {0}")]
    Store(#[source] vitals_core::Error),

    /// Cache operation failed for a reason other than a miss.
    #[error("cache error: {0}")]
    Cache(#[source] vitals_core::Error),

    /// One or more reconciliation work items failed.
    #[error("{errors} reconciliation item(s) failed; first error: {first_error}")]
    Batch {
        /// The first failure observed, as the representative cause.
        first_error: String,
        /// Total number of failed items.
        errors: u64,
    },

    /// Serialization/deserialization failed.
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of the serialization failure.
        message: String,
    },

    /// A background task failed to complete.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the failure.
        message: String,
    },
}

impl StatsError {
    /// Creates a validation error.
    #[must_use]
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<vitals_core::Error> for StatsError {
    fn from(err: vitals_core::Error) -> Self {
        use vitals_core::Error as CoreError;
        match err {
            CoreError::InvalidId { message } => Self::Validation { reason: message },
            CoreError::InvalidInput(reason) => Self::Validation { reason },
            CoreError::Serialization { message } => Self::Serialization { message },
            cache @ CoreError::Cache { .. } => Self::Cache(cache),
            other => Self::Store(other),
        }
    }
}

impl From<serde_json::Error> for StatsError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

/// Ingestion failure as reported back to the webhook sender.
#[derive(Debug, Error)]
pub enum IngestError {
    /// The request was malformed.
    #[error("bad request: {reason}")]
    BadRequest {
        /// What was wrong with the request.
        reason: String,
    },

    /// No project with that id exists.
    #[error("unknown project: {id}")]
    UnknownProject {
        /// The requested project id.
        id: String,
    },

    /// Persisting the event failed; the sender should retry.
    #[error("internal error: {cause}")]
    Internal {
        /// The underlying failure.
        cause: String,
    },
}

impl IngestError {
    /// Returns the HTTP status class for this error.
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::BadRequest { .. } | Self::UnknownProject { .. } => StatusCode::BAD_REQUEST,
            Self::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns a stable machine-readable code.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => "BAD_REQUEST",
            Self::UnknownProject { .. } => "UNKNOWN_PROJECT",
            Self::Internal { .. } => "INTERNAL",
        }
    }
}

impl From<StatsError> for IngestError {
    fn from(err: StatsError) -> Self {
        match err {
            StatsError::Validation { reason } => Self::BadRequest { reason },
            StatsError::UnknownProject { id } => Self::UnknownProject { id },
            other => Self::Internal {
                cause: other.to_string(),
            },
        }
    }
}
