//! Core error types
//!
//! Nothing on the bus is process-fatal: the router logs these and degrades
//! to a no-op or null reply. `kind()` groups variants into the categories
//! the router uses to pick a log level.

use thiserror::Error;

use extbus_session::{ContextId, SessionError};
use extbus_storage::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    Blacklisted,
    InvalidArgument,
    BackendFailure,
    StaleTarget,
    Timeout,
    Internal,
}

#[derive(Error, Debug)]
pub enum BusError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("URL {url} matches blacklist pattern {pattern}")]
    Blacklisted { url: String, pattern: String },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Backend failure: {0}")]
    BackendFailure(String),

    #[error("Context {0} is no longer reachable")]
    StaleTarget(ContextId),

    #[error("Timed out waiting for {0}")]
    Timeout(String),

    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Message bus is not running")]
    NotRunning,

    #[error("Message bus is already running")]
    AlreadyRunning,
}

impl BusError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BusError::NotFound(_) => ErrorKind::NotFound,
            BusError::Session(SessionError::NotFound(_))
            | BusError::Session(SessionError::ExtensionNotFound { .. }) => ErrorKind::NotFound,
            BusError::Blacklisted { .. } => ErrorKind::Blacklisted,
            BusError::InvalidArgument(_) | BusError::Serialization(_) => {
                ErrorKind::InvalidArgument
            }
            BusError::BackendFailure(_) | BusError::Storage(_) | BusError::Io(_) => {
                ErrorKind::BackendFailure
            }
            BusError::StaleTarget(_) => ErrorKind::StaleTarget,
            BusError::Timeout(_) => ErrorKind::Timeout,
            _ => ErrorKind::Internal,
        }
    }

    /// Log at the level matching the error category
    pub fn report(&self, operation: &str) {
        match self.kind() {
            ErrorKind::NotFound | ErrorKind::Blacklisted | ErrorKind::StaleTarget => {
                tracing::debug!(operation, error = %self, "Request dropped")
            }
            ErrorKind::InvalidArgument | ErrorKind::Timeout => {
                tracing::warn!(operation, error = %self, "Request rejected")
            }
            ErrorKind::BackendFailure | ErrorKind::Internal => {
                tracing::error!(operation, error = %self, "Request failed")
            }
        }
    }
}
