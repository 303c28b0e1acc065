//! Match pattern error types

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PatternError {
    #[error("Missing scheme separator in pattern: {0}")]
    MissingScheme(String),

    #[error("Unsupported scheme in pattern: {0}")]
    InvalidScheme(String),

    #[error("Invalid host in pattern: {0}")]
    InvalidHost(String),

    #[error("Missing path in pattern: {0}")]
    MissingPath(String),
}
