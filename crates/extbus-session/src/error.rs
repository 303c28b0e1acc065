//! Session error types

use thiserror::Error;

use crate::SessionId;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),

    #[error("Session already exists: {0}")]
    AlreadyExists(SessionId),

    #[error("Extension {extension_id} not found in session {session_id}")]
    ExtensionNotFound {
        session_id: SessionId,
        extension_id: String,
    },

    #[error("Extension {0} is already loaded")]
    DuplicateExtension(String),

    #[error("Extension id cannot be empty")]
    EmptyExtensionId,
}
