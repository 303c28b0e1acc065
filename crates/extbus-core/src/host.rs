//! Host browser hooks
//!
//! Operations that need the embedding browser's UI (creating tabs, injecting
//! into a page, drawing a badge, reloading a page) go through
//! [`HostDelegate`]. [`HeadlessHost`] is a UI-less implementation that
//! records every call.

use parking_lot::Mutex;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};

use extbus_session::{ContextId, SessionId, TabDescriptor, TabId, TabStatus, WindowId};

use crate::protocol::{BadgeTextDetails, CreateProperties};
use crate::Result;

pub trait HostDelegate: Send + Sync + 'static {
    fn create_tab(
        &self,
        session_id: SessionId,
        window_id: WindowId,
        properties: &CreateProperties,
    ) -> Result<TabDescriptor>;

    fn insert_css(&self, session_id: SessionId, tab_id: TabId, css: &str) -> Result<()>;

    /// Run `code` in the tab and return its completion value
    fn execute_script(&self, session_id: SessionId, tab_id: TabId, code: &str) -> Result<Value>;

    fn set_badge_text(&self, session_id: SessionId, extension_id: &str, details: &BadgeTextDetails);

    fn reload(&self, session_id: SessionId, context: ContextId);
}

#[derive(Debug, Clone, PartialEq)]
pub enum HostCall {
    CreateTab {
        session_id: SessionId,
        window_id: WindowId,
        url: String,
    },
    InsertCss {
        tab_id: TabId,
        css: String,
    },
    ExecuteScript {
        tab_id: TabId,
        code: String,
    },
    BadgeText {
        extension_id: String,
        text: String,
    },
    Reload(ContextId),
}

#[derive(Default)]
pub struct HeadlessHost {
    next_tab_id: AtomicU64,
    calls: Mutex<Vec<HostCall>>,
}

impl HeadlessHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<HostCall> {
        self.calls.lock().clone()
    }

    fn record(&self, call: HostCall) {
        tracing::trace!(?call, "Host call");
        self.calls.lock().push(call);
    }
}

impl HostDelegate for HeadlessHost {
    fn create_tab(
        &self,
        session_id: SessionId,
        window_id: WindowId,
        properties: &CreateProperties,
    ) -> Result<TabDescriptor> {
        let url = properties
            .url
            .clone()
            .unwrap_or_else(|| "about:blank".to_string());
        let id = 1_000 + self.next_tab_id.fetch_add(1, Ordering::SeqCst);

        self.record(HostCall::CreateTab {
            session_id,
            window_id,
            url: url.clone(),
        });

        let mut tab = TabDescriptor::new(id, window_id, url);
        tab.active = properties.active.unwrap_or(true);
        tab.pinned = properties.pinned.unwrap_or(false);
        tab.index = properties.index.unwrap_or(0);
        tab.status = TabStatus::Loading;
        Ok(tab)
    }

    fn insert_css(&self, _session_id: SessionId, tab_id: TabId, css: &str) -> Result<()> {
        self.record(HostCall::InsertCss {
            tab_id,
            css: css.to_string(),
        });
        Ok(())
    }

    fn execute_script(&self, _session_id: SessionId, tab_id: TabId, code: &str) -> Result<Value> {
        self.record(HostCall::ExecuteScript {
            tab_id,
            code: code.to_string(),
        });
        Ok(Value::Null)
    }

    fn set_badge_text(&self, _session_id: SessionId, extension_id: &str, details: &BadgeTextDetails) {
        self.record(HostCall::BadgeText {
            extension_id: extension_id.to_string(),
            text: details.text.clone(),
        });
    }

    fn reload(&self, _session_id: SessionId, context: ContextId) {
        self.record(HostCall::Reload(context));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_headless_create_tab() {
        let host = HeadlessHost::new();
        let tab = host
            .create_tab(
                1,
                4,
                &CreateProperties {
                    url: Some("https://example.com/".to_string()),
                    active: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(tab.window_id, 4);
        assert!(!tab.active);
        assert_eq!(tab.status, TabStatus::Loading);

        let next = host.create_tab(1, 4, &CreateProperties::default()).unwrap();
        assert_ne!(tab.id, next.id);
        assert_eq!(next.url, "about:blank");
        assert_eq!(host.calls().len(), 2);
    }
}
