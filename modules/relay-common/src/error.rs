use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Persistence error for {path}: {message}")]
    Persistence { path: String, message: String },

    #[error("Unknown target: {0}")]
    UnknownTarget(String),

    #[error("Target already configured: {0}")]
    DuplicateTarget(String),

    #[error("A polling attempt is already in progress for target {0}")]
    AttemptInProgress(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RelayError {
    pub fn persistence(path: &std::path::Path, err: impl std::fmt::Display) -> Self {
        RelayError::Persistence {
            path: path.display().to_string(),
            message: err.to_string(),
        }
    }
}
