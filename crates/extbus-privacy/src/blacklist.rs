//! Session URL blacklist
//!
//! An ordered list of match patterns. Pages matching any entry receive no
//! content scripts and reject `insertCSS`/`executeScript`.

use serde::{Deserialize, Serialize};

use crate::pattern::MatchPattern;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Blacklist {
    patterns: Vec<MatchPattern>,
}

impl Blacklist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from raw pattern strings, skipping entries that don't parse.
    pub fn from_patterns<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut blacklist = Self::new();
        for pattern in patterns {
            blacklist.add(pattern.as_ref());
        }
        blacklist
    }

    /// Returns false when the pattern is invalid or already present.
    pub fn add(&mut self, pattern: &str) -> bool {
        match MatchPattern::parse(pattern) {
            Ok(parsed) => {
                if self.patterns.iter().any(|p| p == &parsed) {
                    return false;
                }
                self.patterns.push(parsed);
                true
            }
            Err(e) => {
                tracing::warn!(pattern = %pattern, error = %e, "Ignoring invalid blacklist pattern");
                false
            }
        }
    }

    pub fn remove(&mut self, pattern: &str) {
        self.patterns.retain(|p| p.as_str() != pattern.trim());
    }

    /// First pattern matching `url`, if any
    pub fn find_match(&self, url: &str) -> Option<&MatchPattern> {
        self.patterns.iter().find(|p| p.matches(url))
    }

    pub fn is_blacklisted(&self, url: &str) -> bool {
        self.find_match(url).is_some()
    }

    /// Patterns in insertion order
    pub fn patterns(&self) -> Vec<String> {
        self.patterns.iter().map(|p| p.as_str().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blacklist_matching() {
        let blacklist = Blacklist::from_patterns(["*://ads.example/*", "https://*.tracker.com/*"]);

        assert!(blacklist.is_blacklisted("https://ads.example/slot"));
        assert!(blacklist.is_blacklisted("https://px.tracker.com/a.gif"));
        assert!(!blacklist.is_blacklisted("https://example.com/"));
        assert_eq!(
            blacklist.find_match("http://ads.example/x").map(|p| p.as_str()),
            Some("*://ads.example/*")
        );
    }

    #[test]
    fn test_order_and_dedup() {
        let mut blacklist = Blacklist::new();
        assert!(blacklist.add("*://b.example/*"));
        assert!(blacklist.add("*://a.example/*"));
        assert!(!blacklist.add("*://b.example/*"));
        assert!(!blacklist.add("not-a-pattern"));

        assert_eq!(blacklist.patterns(), vec!["*://b.example/*", "*://a.example/*"]);

        blacklist.remove("*://b.example/*");
        assert_eq!(blacklist.len(), 1);
    }
}
