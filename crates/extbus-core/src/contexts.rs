//! Live execution contexts
//!
//! Tracks every attached context (background page, tab, popup) together
//! with the outbox the router pushes [`ContextEvent`]s into. A context whose
//! receiver has been dropped is treated as destroyed: sends to it fail with
//! `StaleTarget` and broadcasts skip it.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use extbus_session::{ContextId, SessionId, TabDescriptor, TabId, WindowId};

use crate::error::BusError;
use crate::protocol::ContextEvent;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ContextKind {
    BackgroundPage,
    Tab,
    Popup,
}

/// Registration data for a context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextInfo {
    pub kind: ContextKind,
    /// Owning extension for background pages and popups
    pub extension_id: Option<String>,
    pub tab_id: Option<TabId>,
    pub window_id: Option<WindowId>,
    pub url: String,
    pub title: String,
}

impl ContextInfo {
    pub fn background(extension_id: &str) -> Self {
        Self {
            kind: ContextKind::BackgroundPage,
            extension_id: Some(extension_id.to_string()),
            tab_id: None,
            window_id: None,
            url: format!("chrome-extension://{}/_generated_background_page.html", extension_id),
            title: String::new(),
        }
    }

    pub fn tab(tab_id: TabId, window_id: WindowId, url: &str) -> Self {
        Self {
            kind: ContextKind::Tab,
            extension_id: None,
            tab_id: Some(tab_id),
            window_id: Some(window_id),
            url: url.to_string(),
            title: String::new(),
        }
    }

    pub fn popup(extension_id: &str, window_id: WindowId, url: &str) -> Self {
        Self {
            kind: ContextKind::Popup,
            extension_id: Some(extension_id.to_string()),
            tab_id: None,
            window_id: Some(window_id),
            url: url.to_string(),
            title: String::new(),
        }
    }

    pub fn with_title(mut self, title: &str) -> Self {
        self.title = title.to_string();
        self
    }
}

struct LiveContext {
    info: ContextInfo,
    outbox: mpsc::UnboundedSender<ContextEvent>,
}

#[derive(Default)]
struct Table {
    /// Ordered by id, which is attach order
    sessions: HashMap<SessionId, BTreeMap<ContextId, LiveContext>>,
    owners: HashMap<ContextId, SessionId>,
}

#[derive(Default)]
pub struct ContextTable {
    table: Arc<RwLock<Table>>,
    next_id: Arc<AtomicU64>,
}

impl ContextTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a context and hand back its id and inbox
    pub fn attach(
        &self,
        session_id: SessionId,
        info: ContextInfo,
    ) -> (ContextId, mpsc::UnboundedReceiver<ContextEvent>) {
        let id = ContextId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        let (outbox, inbox) = mpsc::unbounded_channel();

        tracing::debug!(
            session_id,
            context = %id,
            kind = ?info.kind,
            url = %info.url,
            "Context attached"
        );

        let mut table = self.table.write();
        table
            .sessions
            .entry(session_id)
            .or_default()
            .insert(id, LiveContext { info, outbox });
        table.owners.insert(id, session_id);

        (id, inbox)
    }

    pub fn detach(&self, id: ContextId) -> Option<(SessionId, ContextInfo)> {
        let mut table = self.table.write();
        let session_id = table.owners.remove(&id)?;
        let live = table.sessions.get_mut(&session_id)?.remove(&id)?;

        tracing::debug!(session_id, context = %id, "Context detached");

        Some((session_id, live.info))
    }

    /// Drop every context of a session, closing their inboxes
    pub fn drop_session(&self, session_id: SessionId) -> usize {
        let mut table = self.table.write();
        let removed = table.sessions.remove(&session_id).unwrap_or_default();
        for id in removed.keys() {
            table.owners.remove(id);
        }
        removed.len()
    }

    pub fn session_of(&self, id: ContextId) -> Option<SessionId> {
        self.table.read().owners.get(&id).copied()
    }

    pub fn info(&self, id: ContextId) -> Option<ContextInfo> {
        let table = self.table.read();
        let session_id = table.owners.get(&id)?;
        table
            .sessions
            .get(session_id)?
            .get(&id)
            .map(|live| live.info.clone())
    }

    pub fn is_alive(&self, id: ContextId) -> bool {
        let table = self.table.read();
        table
            .owners
            .get(&id)
            .and_then(|session_id| table.sessions.get(session_id))
            .and_then(|contexts| contexts.get(&id))
            .map(|live| !live.outbox.is_closed())
            .unwrap_or(false)
    }

    /// Context ids of a session in attach order
    pub fn ids(&self, session_id: SessionId) -> Vec<ContextId> {
        self.table
            .read()
            .sessions
            .get(&session_id)
            .map(|contexts| contexts.keys().copied().collect())
            .unwrap_or_default()
    }

    pub fn update_url(&self, id: ContextId, url: &str, title: Option<&str>) -> Result<()> {
        let mut table = self.table.write();
        let session_id = *table.owners.get(&id).ok_or(BusError::StaleTarget(id))?;
        let live = table
            .sessions
            .get_mut(&session_id)
            .and_then(|contexts| contexts.get_mut(&id))
            .ok_or(BusError::StaleTarget(id))?;

        live.info.url = url.to_string();
        if let Some(title) = title {
            live.info.title = title.to_string();
        }
        Ok(())
    }

    /// Push one event to one context
    pub fn send(&self, id: ContextId, event: ContextEvent) -> Result<()> {
        let table = self.table.read();
        let live = table
            .owners
            .get(&id)
            .and_then(|session_id| table.sessions.get(session_id))
            .and_then(|contexts| contexts.get(&id))
            .ok_or(BusError::StaleTarget(id))?;

        live.outbox.send(event).map_err(|_| BusError::StaleTarget(id))
    }

    /// Push an event to every live context of a session except `except`.
    /// Returns the number of contexts reached.
    pub fn broadcast(
        &self,
        session_id: SessionId,
        except: Option<ContextId>,
        event: &ContextEvent,
    ) -> usize {
        let table = self.table.read();
        let Some(contexts) = table.sessions.get(&session_id) else {
            return 0;
        };

        contexts
            .iter()
            .filter(|(id, _)| Some(**id) != except)
            .filter(|(_, live)| live.outbox.send(event.clone()).is_ok())
            .count()
    }

    /// The context currently hosting `tab_id`
    pub fn tab_context(&self, session_id: SessionId, tab_id: TabId) -> Option<ContextId> {
        self.table.read().sessions.get(&session_id).and_then(|contexts| {
            contexts
                .iter()
                .find(|(_, live)| live.info.tab_id == Some(tab_id))
                .map(|(id, _)| *id)
        })
    }

    /// Tab descriptor for a tab context, `None` for other kinds
    pub fn tab_descriptor(&self, id: ContextId) -> Option<TabDescriptor> {
        let table = self.table.read();
        let contexts = table.sessions.get(table.owners.get(&id)?)?;

        let tab = tab_entries(contexts, None)
            .find(|(ctx, _)| *ctx == id)
            .map(|(_, tab)| tab);
        tab
    }

    /// Descriptors of every tab context in a session. `focused_window`
    /// marks tabs of that window as current.
    pub fn tabs(&self, session_id: SessionId, focused_window: Option<WindowId>) -> Vec<TabDescriptor> {
        let table = self.table.read();
        let Some(contexts) = table.sessions.get(&session_id) else {
            return Vec::new();
        };

        tab_entries(contexts, focused_window).map(|(_, tab)| tab).collect()
    }
}

impl Clone for ContextTable {
    fn clone(&self) -> Self {
        Self {
            table: Arc::clone(&self.table),
            next_id: Arc::clone(&self.next_id),
        }
    }
}

/// Tab contexts in attach order with their descriptors; `index` counts
/// per window.
fn tab_entries(
    contexts: &BTreeMap<ContextId, LiveContext>,
    focused_window: Option<WindowId>,
) -> impl Iterator<Item = (ContextId, TabDescriptor)> + '_ {
    let mut per_window: HashMap<WindowId, usize> = HashMap::new();
    contexts
        .iter()
        .filter(|(_, live)| live.info.kind == ContextKind::Tab)
        .filter_map(move |(id, live)| {
            let tab_id = live.info.tab_id?;
            let window_id = live.info.window_id.unwrap_or_default();
            let index = per_window.entry(window_id).or_insert(0);

            let mut tab = TabDescriptor::new(tab_id, window_id, live.info.url.clone());
            tab.title = live.info.title.clone();
            tab.index = *index;
            tab.current_window = focused_window.map_or(true, |w| w == window_id);
            tab.last_focused_window = tab.current_window;
            *index += 1;
            Some((*id, tab))
        })
}
