//! Error types for deepmatrix

use thiserror::Error;

/// Result type for deepmatrix operations
pub type Result<T> = std::result::Result<T, MatrixError>;

#[derive(Error, Debug)]
pub enum MatrixError {
    #[error("Dimension mismatch in {operation}: expected {expected}, got {actual}")]
    DimensionMismatch {
        operation: &'static str,
        expected: String,
        actual: String,
    },

    #[error("Invalid network: {0}")]
    InvalidNetwork(String),

    #[error("Invalid view: {0}")]
    InvalidView(String),

    #[error("Precondition violated: {0}")]
    Precondition(String),

    #[error("Device error: {0}")]
    Device(String),

    #[error("Format error: {0}")]
    Format(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Image(#[from] image::ImageError),
}

impl MatrixError {
    pub(crate) fn mismatch(
        operation: &'static str,
        expected: impl std::fmt::Debug,
        actual: impl std::fmt::Debug,
    ) -> Self {
        MatrixError::DimensionMismatch {
            operation,
            expected: format!("{:?}", expected),
            actual: format!("{:?}", actual),
        }
    }
}
