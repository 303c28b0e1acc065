//! Cookies API and change fan-out
//!
//! The cookie jar itself belongs to the host browser and is reached through
//! [`CookieStore`]. [`CookieFanout`] keeps, per session, the ordered list of
//! contexts subscribed to `cookies.onChanged` and pushes every change to a
//! snapshot of that list.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use url::Url;

use extbus_session::{ContextId, SessionId};

use crate::contexts::ContextTable;
use crate::error::BusError;
use crate::protocol::ContextEvent;
use crate::Result;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    #[serde(default)]
    pub host_only: bool,
    pub path: String,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub http_only: bool,
    /// True when the cookie has no expiration date
    #[serde(default)]
    pub session: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration_date: Option<f64>,
}

/// Filter for `getAll`/`remove`, and the cookie to write for `set`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CookieDetails {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub secure: Option<bool>,
    #[serde(default)]
    pub http_only: Option<bool>,
    #[serde(default)]
    pub expiration_date: Option<f64>,
}

impl CookieDetails {
    pub fn for_url(url: &str) -> Self {
        Self {
            url: Some(url.to_string()),
            ..Default::default()
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_value(mut self, value: &str) -> Self {
        self.value = Some(value.to_string());
        self
    }

    /// Narrow a set/remove request to the single cookie it addresses
    pub fn lookup_filter(&self) -> Self {
        Self {
            url: self.url.clone(),
            name: self.name.clone(),
            ..Default::default()
        }
    }

    pub fn matches(&self, cookie: &Cookie) -> bool {
        if let Some(name) = &self.name {
            if &cookie.name != name {
                return false;
            }
        }
        if let Some(domain) = &self.domain {
            if !domain_matches(&cookie.domain, domain.trim_start_matches('.')) {
                return false;
            }
        }
        if let Some(path) = &self.path {
            if &cookie.path != path {
                return false;
            }
        }
        if let Some(secure) = self.secure {
            if cookie.secure != secure {
                return false;
            }
        }
        if let Some(url) = &self.url {
            let Ok(url) = Url::parse(url) else {
                return false;
            };
            let host = url.host_str().unwrap_or_default();
            if !domain_matches(&cookie.domain, host) && !domain_matches(host, &cookie.domain) {
                return false;
            }
            if !url.path().starts_with(&cookie.path) {
                return false;
            }
            if cookie.secure && url.scheme() != "https" {
                return false;
            }
        }
        true
    }
}

fn domain_matches(host: &str, domain: &str) -> bool {
    let domain = domain.trim_start_matches('.');
    host == domain || host.ends_with(&format!(".{}", domain))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeCause {
    Explicit,
    Overwrite,
    Expired,
    Evicted,
    ExpiredOverwrite,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CookieChange {
    pub cookie: Cookie,
    pub cause: ChangeCause,
    pub removed: bool,
}

/// Host-side cookie jar of one session
pub trait CookieStore: Send + Sync + 'static {
    fn get(&self, filter: &CookieDetails) -> Result<Vec<Cookie>>;

    fn set(&self, details: &CookieDetails) -> Result<()>;

    fn remove(&self, url: &str, name: &str) -> Result<()>;

    /// Change feed, if the store publishes one
    fn changes(&self) -> Option<broadcast::Receiver<CookieChange>>;
}

/// In-process cookie jar with a change feed
pub struct MemoryCookieStore {
    cookies: Arc<RwLock<Vec<Cookie>>>,
    changes: broadcast::Sender<CookieChange>,
}

impl MemoryCookieStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            cookies: Arc::new(RwLock::new(Vec::new())),
            changes,
        }
    }

    fn publish(&self, change: CookieChange) {
        // No receivers is fine
        let _ = self.changes.send(change);
    }
}

impl Default for MemoryCookieStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CookieStore for MemoryCookieStore {
    fn get(&self, filter: &CookieDetails) -> Result<Vec<Cookie>> {
        Ok(self
            .cookies
            .read()
            .iter()
            .filter(|cookie| filter.matches(cookie))
            .cloned()
            .collect())
    }

    fn set(&self, details: &CookieDetails) -> Result<()> {
        let url = details
            .url
            .as_deref()
            .ok_or_else(|| BusError::InvalidArgument("cookie url is required".to_string()))?;
        let url = Url::parse(url).map_err(|e| BusError::InvalidArgument(e.to_string()))?;
        let host = url
            .host_str()
            .ok_or_else(|| BusError::InvalidArgument(format!("no host in {}", url)))?;

        let cookie = Cookie {
            name: details.name.clone().unwrap_or_default(),
            value: details.value.clone().unwrap_or_default(),
            domain: details
                .domain
                .clone()
                .unwrap_or_else(|| host.to_string()),
            host_only: details.domain.is_none(),
            path: details.path.clone().unwrap_or_else(|| "/".to_string()),
            secure: details.secure.unwrap_or(false),
            http_only: details.http_only.unwrap_or(false),
            session: details.expiration_date.is_none(),
            expiration_date: details.expiration_date,
        };

        let replaced = {
            let mut cookies = self.cookies.write();
            let existing = cookies.iter().position(|c| {
                c.name == cookie.name && c.domain == cookie.domain && c.path == cookie.path
            });
            let replaced = existing.map(|index| cookies.remove(index));
            cookies.push(cookie.clone());
            replaced
        };

        if let Some(old) = replaced {
            self.publish(CookieChange {
                cookie: old,
                cause: ChangeCause::Overwrite,
                removed: true,
            });
        }
        self.publish(CookieChange {
            cookie,
            cause: ChangeCause::Explicit,
            removed: false,
        });
        Ok(())
    }

    fn remove(&self, url: &str, name: &str) -> Result<()> {
        let filter = CookieDetails::for_url(url).named(name);
        let removed: Vec<Cookie> = {
            let mut cookies = self.cookies.write();
            let (gone, kept): (Vec<Cookie>, Vec<Cookie>) =
                cookies.drain(..).partition(|c| filter.matches(c));
            *cookies = kept;
            gone
        };

        for cookie in removed {
            self.publish(CookieChange {
                cookie,
                cause: ChangeCause::Explicit,
                removed: true,
            });
        }
        Ok(())
    }

    fn changes(&self) -> Option<broadcast::Receiver<CookieChange>> {
        Some(self.changes.subscribe())
    }
}

/// Per-session `cookies.onChanged` subscriber lists
#[derive(Default)]
pub struct CookieFanout {
    subscribers: Arc<RwLock<HashMap<SessionId, Vec<(u64, ContextId)>>>>,
}

impl CookieFanout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `subscriber_id`. Re-registering keeps the original position.
    pub fn subscribe(&self, session_id: SessionId, subscriber_id: u64, context: ContextId) {
        let mut subscribers = self.subscribers.write();
        let list = subscribers.entry(session_id).or_default();

        match list.iter_mut().find(|(id, _)| *id == subscriber_id) {
            Some(entry) => entry.1 = context,
            None => list.push((subscriber_id, context)),
        }

        tracing::debug!(session_id, subscriber_id, context = %context, "Cookie listener added");
    }

    pub fn unsubscribe(&self, session_id: SessionId, subscriber_id: u64) -> bool {
        let mut subscribers = self.subscribers.write();
        let Some(list) = subscribers.get_mut(&session_id) else {
            return false;
        };

        let before = list.len();
        list.retain(|(id, _)| *id != subscriber_id);
        before != list.len()
    }

    pub fn subscribers(&self, session_id: SessionId) -> Vec<(u64, ContextId)> {
        self.subscribers
            .read()
            .get(&session_id)
            .cloned()
            .unwrap_or_default()
    }

    /// Deliver a change to every subscriber, in registration order.
    /// Destroyed subscribers are skipped.
    pub fn notify(&self, contexts: &ContextTable, session_id: SessionId, change: &CookieChange) -> usize {
        let snapshot = self.subscribers(session_id);
        let mut delivered = 0;

        for (subscriber_id, context) in snapshot {
            match contexts.send(context, ContextEvent::CookieChanged(change.clone())) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::debug!(session_id, subscriber_id, error = %e, "Skipping cookie listener")
                }
            }
        }

        delivered
    }

    pub fn drop_session(&self, session_id: SessionId) {
        self.subscribers.write().remove(&session_id);
    }
}

impl Clone for CookieFanout {
    fn clone(&self) -> Self {
        Self {
            subscribers: Arc::clone(&self.subscribers),
        }
    }
}
