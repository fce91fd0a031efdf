//! Unified error type for the geolink pipeline.
//!
//! Stage and library code uses `anyhow` internally; `GeolinkError` gives API
//! boundaries (the CLI, the stage runner) a stable set of error kinds so that
//! configuration mistakes fail fast and storage faults stay distinguishable
//! from parse problems.

use thiserror::Error;

/// Error kinds the pipeline distinguishes at its boundaries.
#[derive(Error, Debug)]
pub enum GeolinkError {
    /// I/O errors (file access, directory creation, rename)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Parsing/deserialization errors
    #[error("Parse error: {0}")]
    Parse(String),

    /// Data validation errors
    #[error("Validation error: {0}")]
    Validation(String),

    /// Configuration errors (missing event, unknown stage, bad interval)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A pipeline stage failed; carries the stage name and cause
    #[error("Stage '{stage}' failed: {message}")]
    Stage { stage: String, message: String },

    /// Storage-layer errors (partitioned store read/write)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Generic errors (for wrapping external errors)
    #[error("{0}")]
    Other(String),
}

/// Convenience alias for Results using GeolinkError.
pub type GeolinkResult<T> = Result<T, GeolinkError>;

impl From<anyhow::Error> for GeolinkError {
    fn from(err: anyhow::Error) -> Self {
        GeolinkError::Other(err.to_string())
    }
}

impl From<serde_json::Error> for GeolinkError {
    fn from(err: serde_json::Error) -> Self {
        GeolinkError::Parse(err.to_string())
    }
}

impl From<String> for GeolinkError {
    fn from(s: String) -> Self {
        GeolinkError::Other(s)
    }
}

impl From<&str> for GeolinkError {
    fn from(s: &str) -> Self {
        GeolinkError::Other(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_error_names_the_stage() {
        let err = GeolinkError::Stage {
            stage: "standard".into(),
            message: "no raw store".into(),
        };
        let text = err.to_string();
        assert!(text.contains("standard"));
        assert!(text.contains("no raw store"));
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: GeolinkError = io.into();
        assert!(matches!(err, GeolinkError::Io(_)));
    }
}
