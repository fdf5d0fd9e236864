//! Scheduler error types.

use std::time::Duration;

use berth_core::NamingError;
use thiserror::Error;

/// Classification of a failed remote API call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// The addressed resource does not exist.
    NotFound,
    /// The addressed service does not exist.
    ServiceNotFound,
    /// The addressed service exists but is draining or inactive.
    ServiceNotActive,
    /// The addressed stack does not exist.
    StackNotFound,
    Throttled,
    /// The request was rejected as invalid.
    Validation,
    /// The request never reached the backend, or the response was lost.
    Transport,
    Other,
}

/// Error returned by a remote cluster, stack, instance or runtime API.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind:?}: {message}")]
pub struct ApiError {
    pub kind: ApiErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: ApiErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::NotFound, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Validation, message)
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::new(ApiErrorKind::Transport, message)
    }

    /// The service is gone or going; removal treats this as success.
    pub fn is_service_gone(&self) -> bool {
        matches!(
            self.kind,
            ApiErrorKind::ServiceNotFound | ApiErrorKind::ServiceNotActive
        )
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// Errors that can occur during scheduling operations.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("{resource} not found: {name}")]
    NotFound { resource: &'static str, name: String },

    /// The stack exists but has not published the requested output yet.
    #[error("stack {stack} is still being created; output {output} is not available")]
    StackNotReady { stack: String, output: String },

    #[error("{operation} failed for {target}: {source}")]
    Backend {
        operation: &'static str,
        target: String,
        #[source]
        source: ApiError,
    },

    #[error("{operation} failed for {item}: {reason}")]
    PartialBatchFailure {
        operation: &'static str,
        item: String,
        reason: String,
    },

    #[error("expected exactly one container for task {task}, found {found}")]
    AmbiguousContainer { task: String, found: usize },

    #[error("failed to stop task {task}: {source}")]
    Cleanup {
        task: String,
        #[source]
        source: Box<SchedulerError>,
    },

    #[error("{operation} cancelled")]
    Cancelled { operation: &'static str },

    #[error("{operation} timed out after {}s", after.as_secs())]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("invalid name: {0}")]
    InvalidName(#[from] NamingError),

    #[error("failed to {action} job {job}: {source}")]
    Job {
        action: &'static str,
        job: String,
        #[source]
        source: Box<SchedulerError>,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("state store error: {0}")]
    State(#[from] berth_state::StateError),
}

impl SchedulerError {
    pub fn backend(operation: &'static str, target: impl Into<String>, source: ApiError) -> Self {
        SchedulerError::Backend {
            operation,
            target: target.into(),
            source,
        }
    }

    pub fn not_found(resource: &'static str, name: impl Into<String>) -> Self {
        SchedulerError::NotFound {
            resource,
            name: name.into(),
        }
    }

    /// Kind of the underlying API error, if this is a backend failure.
    pub fn api_kind(&self) -> Option<ApiErrorKind> {
        match self {
            SchedulerError::Backend { source, .. } => Some(source.kind),
            _ => None,
        }
    }

    pub fn is_service_gone(&self) -> bool {
        matches!(self, SchedulerError::Backend { source, .. } if source.is_service_gone())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, SchedulerError::NotFound { .. })
    }

    /// Errors that resolve on their own if the caller retries later.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SchedulerError::StackNotReady { .. } | SchedulerError::Timeout { .. }
        ) || self.api_kind() == Some(ApiErrorKind::Throttled)
    }
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
