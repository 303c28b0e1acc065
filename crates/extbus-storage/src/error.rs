//! Storage error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown storage area: {0}")]
    InvalidArea(String),

    #[error("Storage backend unavailable: {0}")]
    Unavailable(String),
}
