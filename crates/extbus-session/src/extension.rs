//! Loaded extension state
//!
//! One `ExtensionRuntime` per extension per session. Created on load,
//! dropped on unload. The background handle is `None` for extensions that
//! declare no background page, or while that page is not running.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::ContextId;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentScript {
    #[serde(default)]
    pub matches: Vec<String>,
    #[serde(default)]
    pub exclude_matches: Vec<String>,
    #[serde(default)]
    pub js: Vec<String>,
    #[serde(default)]
    pub css: Vec<String>,
    #[serde(default)]
    pub run_at: Option<String>,
    #[serde(default)]
    pub all_frames: bool,
}

/// The parts of a manifest the bus needs to answer lookups
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestSummary {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default_locale: Option<String>,
    #[serde(default)]
    pub content_scripts: Vec<ContentScript>,
}

/// A named timer owned by an extension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alarm {
    pub name: String,
    /// Milliseconds since the Unix epoch
    pub scheduled_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_in_minutes: Option<f64>,
}

/// What an execution context is told about an extension.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionDescriptor {
    pub id: String,
    pub name: String,
    pub version: String,
    pub path: PathBuf,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub default_locale: Option<String>,
    pub has_background: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_scripts: Option<Vec<ContentScript>>,
}

#[derive(Debug, Clone)]
pub struct ExtensionRuntime {
    pub id: String,
    /// Directory the extension was loaded from
    pub path: PathBuf,
    pub manifest: ManifestSummary,
    pub background: Option<ContextId>,
    /// Ordered by creation
    pub alarms: Vec<Alarm>,
    pub loaded_at: DateTime<Utc>,
}

impl ExtensionRuntime {
    pub fn new(id: String, path: PathBuf, manifest: ManifestSummary) -> Self {
        Self {
            id,
            path,
            manifest,
            background: None,
            alarms: Vec::new(),
            loaded_at: Utc::now(),
        }
    }

    /// Descriptor handed to contexts. Page contexts get the variant without
    /// content-script details.
    pub fn descriptor(&self, include_content_scripts: bool) -> ExtensionDescriptor {
        ExtensionDescriptor {
            id: self.id.clone(),
            name: self.manifest.name.clone(),
            version: self.manifest.version.clone(),
            path: self.path.clone(),
            description: self.manifest.description.clone(),
            default_locale: self.manifest.default_locale.clone(),
            has_background: self.background.is_some(),
            content_scripts: include_content_scripts.then(|| self.manifest.content_scripts.clone()),
        }
    }

    pub fn find_alarm(&self, name: &str) -> Option<&Alarm> {
        self.alarms.iter().find(|a| a.name == name)
    }

    pub fn find_alarm_mut(&mut self, name: &str) -> Option<&mut Alarm> {
        self.alarms.iter_mut().find(|a| a.name == name)
    }

    /// Names are unique per extension; a duplicate leaves the list untouched.
    pub fn add_alarm(&mut self, alarm: Alarm) -> bool {
        if self.find_alarm(&alarm.name).is_some() {
            return false;
        }
        self.alarms.push(alarm);
        true
    }

    pub fn remove_alarm(&mut self, name: &str) -> Option<Alarm> {
        let index = self.alarms.iter().position(|a| a.name == name)?;
        Some(self.alarms.remove(index))
    }

    pub fn clear_alarms(&mut self) -> Vec<Alarm> {
        std::mem::take(&mut self.alarms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> ExtensionRuntime {
        ExtensionRuntime::new(
            "ext-a".to_string(),
            PathBuf::from("/extensions/ext-a"),
            ManifestSummary {
                name: "Sample".to_string(),
                version: "1.0".to_string(),
                content_scripts: vec![ContentScript {
                    matches: vec!["<all_urls>".to_string()],
                    js: vec!["content.js".to_string()],
                    ..Default::default()
                }],
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_alarm_names_unique() {
        let mut ext = runtime();

        assert!(ext.add_alarm(Alarm {
            name: "refresh".to_string(),
            scheduled_time: 1000.0,
            period_in_minutes: None,
        }));
        assert!(!ext.add_alarm(Alarm {
            name: "refresh".to_string(),
            scheduled_time: 5000.0,
            period_in_minutes: Some(5.0),
        }));

        assert_eq!(ext.alarms.len(), 1);
        assert_eq!(ext.find_alarm("refresh").unwrap().scheduled_time, 1000.0);

        assert!(ext.remove_alarm("refresh").is_some());
        assert!(ext.remove_alarm("refresh").is_none());
    }

    #[test]
    fn test_descriptor_variants() {
        let ext = runtime();

        let full = ext.descriptor(true);
        assert_eq!(full.content_scripts.as_ref().map(|s| s.len()), Some(1));

        let stripped = ext.descriptor(false);
        assert!(stripped.content_scripts.is_none());

        let json = serde_json::to_value(&stripped).unwrap();
        assert!(json.get("contentScripts").is_none());
        assert_eq!(json["hasBackground"], false);
    }
}
