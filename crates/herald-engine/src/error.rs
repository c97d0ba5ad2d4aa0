use herald_core::{DestinationError, PersistenceError, SourceError, SourceName};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("topic creation failed for {source_name}: {error}")]
    CreationFailed {
        source_name: SourceName,
        error: DestinationError,
    },

    #[error("destination error: {0}")]
    Destination(#[from] DestinationError),

    #[error("source error: {0}")]
    Source(#[from] SourceError),

    #[error("delivery to {source_name} failed after {attempts} attempts: {error}")]
    DeliveryFailed {
        source_name: SourceName,
        attempts: u32,
        error: DestinationError,
    },

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Persistence(_) => "persistence",
            Self::CreationFailed { .. } => "creation_failed",
            Self::Destination(e) => e.error_kind(),
            Self::Source(_) => "source",
            Self::DeliveryFailed { .. } => "delivery_failed",
            Self::Internal(_) => "internal",
        }
    }
}
