use surge_core::{ConfigError, CoreError};
use thiserror::Error;

/// Errors that stop a run from starting or its report from being written.
///
/// Failures of individual steps are not errors; they are recorded as
/// failed outcomes and never leave the virtual user that hit them.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The run definition is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A schedule, threshold or template could not be built.
    #[error(transparent)]
    Definition(#[from] CoreError),

    /// The HTTP client could not be constructed.
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Writing a report or metrics file failed.
    #[error("report I/O error: {0}")]
    Report(#[from] std::io::Error),

    /// A report could not be serialized.
    #[error("report serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A background task panicked.
    #[error("task failed: {0}")]
    Join(String),
}

impl From<tokio::task::JoinError> for EngineError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Join(err.to_string())
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
