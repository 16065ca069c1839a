//! Error types for gecal

use thiserror::Error;

/// gecal error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    /// Invalid input or configuration
    #[error("Validation error: {0}")]
    Validation(String),

    /// Numerical failure (singular system, non-finite objective, ...)
    #[error("Computation error: {0}")]
    Computation(String),

    /// Not enough points/peaks to constrain the requested fit
    #[error("Insufficient data: {0}")]
    InsufficientData(String),

    /// Every fit attempt for a model failed
    #[error("Fit failed: {0}")]
    FitFailed(String),

    /// Two fit attempts could not be ranked against each other
    #[error("Ambiguous fit: {0}")]
    AmbiguousFit(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
