//! Error types for UR control session operations

use thiserror::Error;

pub type Result<T> = std::result::Result<T, URError>;

#[derive(Error, Debug)]
pub enum URError {
    /// Socket level failure. A reconnect has already been attempted when this is returned.
    #[error("Transient I/O failure: {0}")]
    TransientIo(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("RTDE protocol error: {0}")]
    Protocol(String),

    #[error("Recipe rejected by controller: {0}")]
    RecipeRejected(String),

    #[error("Unknown field: {0}")]
    UnknownField(String),

    #[error("Type mismatch for field {field}: expected {expected}, got {actual}")]
    TypeMismatch {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("Safety stop must be recovered before submitting a new program")]
    RecoveryRequired,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl URError {
    /// Whether the failure is worth retrying at the socket level
    pub fn is_transient(&self) -> bool {
        matches!(self, URError::TransientIo(_) | URError::Timeout(_) | URError::Io(_))
    }
}
