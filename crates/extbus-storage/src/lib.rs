//! Extension Storage Backend
//!
//! SQLite-based key/value persistence for extension storage areas
//! (`local`, `sync`, `session`, `managed`). Values are stored as
//! JSON-encoded blobs; callers decode them on the way out.

mod area;
mod backend;
mod database;
mod error;
mod migrations;

pub use area::StorageArea;
pub use backend::{MemoryBackend, SqliteBackend, StorageBackend, StorageScope, StoredValue};
pub use database::Database;
pub use error::StorageError;

pub type Result<T> = std::result::Result<T, StorageError>;
