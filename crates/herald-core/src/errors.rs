use std::time::Duration;

/// Errors from the destination (thread/message) API.
/// Classifies errors as permanent (don't retry), retryable, or operational.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DestinationError {
    // Permanent
    #[error("message thread not found")]
    ThreadNotFound,
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // Retryable
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),

    // Operational
    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

impl DestinationError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Server { .. } | Self::Network(_) | Self::Timeout(_)
        )
    }

    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Self::ThreadNotFound | Self::Forbidden(_) | Self::InvalidRequest(_)
        )
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        if let Self::RateLimited { retry_after } = self {
            *retry_after
        } else {
            None
        }
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::ThreadNotFound => "thread_not_found",
            Self::Forbidden(_) => "forbidden",
            Self::InvalidRequest(_) => "invalid_request",
            Self::RateLimited { .. } => "rate_limited",
            Self::Server { .. } => "server_error",
            Self::Network(_) => "network_error",
            Self::Timeout(_) => "timeout",
        }
    }

    /// Classify an HTTP status plus the API's error description.
    pub fn from_status(status: u16, description: String) -> Self {
        if is_thread_missing(&description) {
            return Self::ThreadNotFound;
        }
        match status {
            401 | 403 => Self::Forbidden(description),
            429 => Self::RateLimited { retry_after: None },
            400 | 404 => Self::InvalidRequest(description),
            500..=599 => Self::Server {
                status,
                body: description,
            },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {description}")),
        }
    }
}

/// Whether a destination error description means the thread is gone.
pub fn is_thread_missing(description: &str) -> bool {
    let lower = description.to_lowercase();
    lower.contains("thread not found")
        || lower.contains("topic_deleted")
        || lower.contains("topic not found")
        || lower.contains("topic_id_invalid")
}

/// Errors from the source (registry / pull) API.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    Server { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

impl SourceError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. } | Self::Server { .. } | Self::Network(_) | Self::Timeout(_)
        )
    }

    /// Whether the failure means the caller lacks read access.
    pub fn is_access_denied(&self) -> bool {
        matches!(self, Self::Unauthorized(_) | Self::NotFound(_))
    }

    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::Unauthorized(body),
            404 => Self::NotFound(body),
            429 => Self::RateLimited { retry_after: None },
            500..=599 => Self::Server { status, body },
            _ => Self::Malformed(format!("unexpected status {status}: {body}")),
        }
    }
}

/// Failure of a single access probe. Always recovered as a negative check.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(Duration),
    #[error("probe failed: {0}")]
    Failure(String),
}

impl From<SourceError> for ProbeError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::Timeout(d) => Self::Timeout(d),
            other => Self::Failure(other.to_string()),
        }
    }
}

/// The durable copy of engine state could not be written or read.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("persistence error: {0}")]
pub struct PersistenceError(pub String);

impl PersistenceError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}
