//! Session data structure

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

use extbus_privacy::Blacklist;

use crate::extension::ExtensionRuntime;
use crate::{SessionId, WindowId};

#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    /// Loaded extensions keyed by extension id
    pub extensions: BTreeMap<String, ExtensionRuntime>,
    pub blacklist: Blacklist,
    /// Window new tabs open in when a background context creates one
    pub last_focused_window: Option<WindowId>,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(id: SessionId, blacklist: Blacklist) -> Self {
        Self {
            id,
            extensions: BTreeMap::new(),
            blacklist,
            last_focused_window: None,
            created_at: Utc::now(),
        }
    }

    pub fn extension(&self, extension_id: &str) -> Option<&ExtensionRuntime> {
        self.extensions.get(extension_id)
    }

    pub fn extension_mut(&mut self, extension_id: &str) -> Option<&mut ExtensionRuntime> {
        self.extensions.get_mut(extension_id)
    }

    pub fn extension_count(&self) -> usize {
        self.extensions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_session() {
        let session = Session::new(1, Blacklist::from_patterns(["*://ads.example/*"]));
        assert_eq!(session.id, 1);
        assert_eq!(session.extension_count(), 0);
        assert!(session.blacklist.is_blacklisted("https://ads.example/"));
        assert!(session.last_focused_window.is_none());
    }
}
