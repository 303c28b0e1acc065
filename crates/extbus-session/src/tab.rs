//! Tab and sender descriptors
//!
//! The shapes execution contexts see for tabs (`tabs.query`, `tabs.create`)
//! and for the origin of a message (`runtime.onMessage` sender).

use serde::{Deserialize, Serialize};

use crate::{TabId, WindowId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TabStatus {
    Loading,
    #[default]
    Complete,
}

impl TabStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TabStatus::Loading => "loading",
            TabStatus::Complete => "complete",
        }
    }
}

impl std::fmt::Display for TabStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TabStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "loading" => Ok(TabStatus::Loading),
            "complete" => Ok(TabStatus::Complete),
            _ => Err(format!("Unknown tab status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabDescriptor {
    pub id: TabId,
    pub window_id: WindowId,
    #[serde(default)]
    pub index: usize,
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub fav_icon_url: Option<String>,
    #[serde(default)]
    pub status: TabStatus,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub highlighted: bool,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub incognito: bool,
    #[serde(default)]
    pub last_focused_window: bool,
    #[serde(default)]
    pub current_window: bool,
}

impl TabDescriptor {
    pub fn new(id: TabId, window_id: WindowId, url: String) -> Self {
        Self {
            id,
            window_id,
            url,
            ..Default::default()
        }
    }

    /// Display title, falling back to the URL
    pub fn display_title(&self) -> &str {
        if self.title.is_empty() {
            &self.url
        } else {
            &self.title
        }
    }
}

/// Origin of a runtime message or port connection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderDescriptor {
    /// Extension id of the sending context
    pub id: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub tab: Option<TabDescriptor>,
    #[serde(default)]
    pub frame_id: Option<i64>,
}
