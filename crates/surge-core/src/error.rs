use thiserror::Error;

/// Canonical error type for run definitions (schedules, thresholds, templates).
#[derive(Debug, Error)]
pub enum CoreError {
    /// A stage or schedule violates its invariants.
    #[error("invalid stage: {message}")]
    InvalidStage {
        /// Human-readable explanation of the violation.
        message: String,
    },

    /// A threshold expression could not be parsed or is not applicable.
    #[error("invalid threshold `{expression}`: {message}")]
    InvalidThreshold {
        /// The offending expression as written in the configuration.
        expression: String,
        /// Why it was rejected.
        message: String,
    },

    /// A request template references an unknown placeholder or is malformed.
    #[error("invalid template `{template}`: {message}")]
    InvalidTemplate {
        /// The template text.
        template: String,
        /// Why it was rejected.
        message: String,
    },

    /// I/O error occurred while reading or writing run artefacts.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error occurred.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Validation error for input data.
    #[error("validation error: {0}")]
    ValidationError(String),
}

impl CoreError {
    /// Creates an `InvalidStage` variant.
    #[must_use]
    pub fn invalid_stage(message: impl Into<String>) -> Self {
        Self::InvalidStage {
            message: message.into(),
        }
    }

    /// Creates an `InvalidThreshold` variant.
    #[must_use]
    pub fn invalid_threshold(expression: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidThreshold {
            expression: expression.into(),
            message: message.into(),
        }
    }

    /// Creates an `InvalidTemplate` variant.
    #[must_use]
    pub fn invalid_template(template: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidTemplate {
            template: template.into(),
            message: message.into(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

/// Convenient result alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
