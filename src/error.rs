use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Transient delivery error: {0}")]
    Transient(String),

    #[error("Permanent delivery error: {0}")]
    Permanent(String),

    #[error("Unknown source type: {0}")]
    UnknownSourceType(String),

    #[error("Classifier unavailable: {0}")]
    ClassifierUnavailable(String),

    #[error("Pipeline is shutting down")]
    PipelineShuttingDown,

    #[error("Fallback store error: {0}")]
    FallbackStore(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] Box<bincode::ErrorKind>),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Operation timeout")]
    Timeout,
}

impl From<crate::bus::PublishError> for PipelineError {
    fn from(err: crate::bus::PublishError) -> Self {
        match err {
            crate::bus::PublishError::Transient(msg) => PipelineError::Transient(msg),
            crate::bus::PublishError::Permanent(msg) => PipelineError::Permanent(msg),
        }
    }
}

impl From<tokio::time::error::Elapsed> for PipelineError {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        PipelineError::Timeout
    }
}

impl PipelineError {
    /// Fallback persistence failures remove the only safety net against data loss.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::FallbackStore(_)
                | PipelineError::Io(_)
                | PipelineError::Serialization(_)
        )
    }
}
