//! Session Registry
//!
//! Process-wide map of sessions owned by the coordinating process. Every
//! component reaches session state through a shared handle to this registry;
//! there are no ambient globals.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use extbus_privacy::Blacklist;

use crate::error::SessionError;
use crate::extension::{ExtensionDescriptor, ExtensionRuntime};
use crate::session::Session;
use crate::{ContextId, Result, SessionId, WindowId};

#[derive(Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<SessionId, Session>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session
    pub fn start_session(&self, id: SessionId, blacklist: Blacklist) -> Result<()> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(&id) {
            return Err(SessionError::AlreadyExists(id));
        }

        sessions.insert(id, Session::new(id, blacklist));

        tracing::info!(session_id = id, "Started session");

        Ok(())
    }

    /// Tear a session down, returning its final state
    pub fn end_session(&self, id: SessionId) -> Result<Session> {
        let session = self
            .sessions
            .write()
            .remove(&id)
            .ok_or(SessionError::NotFound(id))?;

        tracing::info!(
            session_id = id,
            extension_count = session.extension_count(),
            "Ended session"
        );

        Ok(session)
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.read().contains_key(&id)
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn with_session<F, T>(&self, id: SessionId, f: F) -> Result<T>
    where
        F: FnOnce(&Session) -> T,
    {
        let sessions = self.sessions.read();
        let session = sessions.get(&id).ok_or(SessionError::NotFound(id))?;
        Ok(f(session))
    }

    pub fn with_session_mut<F, T>(&self, id: SessionId, f: F) -> Result<T>
    where
        F: FnOnce(&mut Session) -> T,
    {
        let mut sessions = self.sessions.write();
        let session = sessions.get_mut(&id).ok_or(SessionError::NotFound(id))?;
        Ok(f(session))
    }

    /// Load an extension into a session
    pub fn load_extension(&self, session_id: SessionId, extension: ExtensionRuntime) -> Result<()> {
        if extension.id.trim().is_empty() {
            return Err(SessionError::EmptyExtensionId);
        }

        self.with_session_mut(session_id, |session| {
            if session.extensions.contains_key(&extension.id) {
                return Err(SessionError::DuplicateExtension(extension.id.clone()));
            }

            tracing::info!(
                session_id,
                extension_id = %extension.id,
                name = %extension.manifest.name,
                "Loaded extension"
            );

            session.extensions.insert(extension.id.clone(), extension);
            Ok(())
        })?
    }

    pub fn unload_extension(
        &self,
        session_id: SessionId,
        extension_id: &str,
    ) -> Result<ExtensionRuntime> {
        let removed = self
            .with_session_mut(session_id, |session| session.extensions.remove(extension_id))?
            .ok_or_else(|| SessionError::ExtensionNotFound {
                session_id,
                extension_id: extension_id.to_string(),
            })?;

        tracing::info!(session_id, extension_id = %extension_id, "Unloaded extension");

        Ok(removed)
    }

    /// Resolve an extension by id within one session
    pub fn extension(&self, session_id: SessionId, extension_id: &str) -> Result<ExtensionRuntime> {
        self.with_session(session_id, |session| session.extension(extension_id).cloned())?
            .ok_or_else(|| SessionError::ExtensionNotFound {
                session_id,
                extension_id: extension_id.to_string(),
            })
    }

    pub fn with_extension_mut<F, T>(
        &self,
        session_id: SessionId,
        extension_id: &str,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(&mut ExtensionRuntime) -> T,
    {
        self.with_session_mut(session_id, |session| {
            session.extension_mut(extension_id).map(f)
        })?
        .ok_or_else(|| SessionError::ExtensionNotFound {
            session_id,
            extension_id: extension_id.to_string(),
        })
    }

    pub fn extensions(&self, session_id: SessionId) -> Result<Vec<ExtensionRuntime>> {
        self.with_session(session_id, |session| {
            session.extensions.values().cloned().collect()
        })
    }

    /// Descriptors keyed by extension id
    pub fn descriptors(
        &self,
        session_id: SessionId,
        include_content_scripts: bool,
    ) -> Result<Vec<(String, ExtensionDescriptor)>> {
        self.with_session(session_id, |session| {
            session
                .extensions
                .values()
                .map(|ext| (ext.id.clone(), ext.descriptor(include_content_scripts)))
                .collect()
        })
    }

    pub fn blacklist(&self, session_id: SessionId) -> Result<Blacklist> {
        self.with_session(session_id, |session| session.blacklist.clone())
    }

    pub fn set_blacklist(&self, session_id: SessionId, blacklist: Blacklist) -> Result<()> {
        self.with_session_mut(session_id, |session| session.blacklist = blacklist)
    }

    pub fn set_background(
        &self,
        session_id: SessionId,
        extension_id: &str,
        context: Option<ContextId>,
    ) -> Result<()> {
        self.with_extension_mut(session_id, extension_id, |ext| ext.background = context)
    }

    /// Clear every background handle pointing at `context`
    pub fn release_background(&self, session_id: SessionId, context: ContextId) -> Result<()> {
        self.with_session_mut(session_id, |session| {
            for ext in session.extensions.values_mut() {
                if ext.background == Some(context) {
                    ext.background = None;
                    tracing::debug!(
                        session_id,
                        extension_id = %ext.id,
                        context = %context,
                        "Background context released"
                    );
                }
            }
        })
    }

    pub fn last_focused_window(&self, session_id: SessionId) -> Result<Option<WindowId>> {
        self.with_session(session_id, |session| session.last_focused_window)
    }

    pub fn set_last_focused_window(
        &self,
        session_id: SessionId,
        window: Option<WindowId>,
    ) -> Result<()> {
        self.with_session_mut(session_id, |session| session.last_focused_window = window)
    }
}

impl Clone for SessionRegistry {
    fn clone(&self) -> Self {
        Self {
            sessions: Arc::clone(&self.sessions),
        }
    }
}
