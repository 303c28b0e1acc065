//! Long-lived message ports
//!
//! `runtime.connect` opens a port to an extension's background page.
//! Port traffic is delivered by broadcast: every live context of the session
//! except the sender receives the message, and the context side drops
//! messages for ports it does not hold.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use extbus_session::{ContextId, SenderDescriptor, SessionId, SessionRegistry, TabDescriptor};

use crate::contexts::ContextTable;
use crate::protocol::{ConnectRequest, ContextEvent, PortDescriptor};
use crate::Result;

#[derive(Debug, Clone)]
pub struct PortRecord {
    pub port_id: String,
    pub name: Option<String>,
    pub extension_id: String,
    /// Context that called `runtime.connect`
    pub opener: ContextId,
    pub sender: SenderDescriptor,
    pub created_at: DateTime<Utc>,
}

/// Result of a `connect` call
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectOutcome {
    /// The background page was told about the port
    Delivered(String),
    /// The opener is the background page itself
    Suppressed(String),
    /// The extension has no running background page
    NoBackground(String),
}

impl ConnectOutcome {
    pub fn port_id(&self) -> &str {
        match self {
            ConnectOutcome::Delivered(id)
            | ConnectOutcome::Suppressed(id)
            | ConnectOutcome::NoBackground(id) => id,
        }
    }
}

#[derive(Default)]
pub struct PortManager {
    ports: Arc<RwLock<HashMap<SessionId, HashMap<String, PortRecord>>>>,
}

impl PortManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a port from `opener` to the background page of the requested
    /// extension. The port id is returned synchronously.
    pub fn connect(
        &self,
        registry: &SessionRegistry,
        contexts: &ContextTable,
        session_id: SessionId,
        opener: ContextId,
        request: ConnectRequest,
    ) -> Result<ConnectOutcome> {
        let extension = registry.extension(session_id, &request.extension_id)?;
        let port_id = Uuid::new_v4().simple().to_string();

        let record = PortRecord {
            port_id: port_id.clone(),
            name: request.name.clone(),
            extension_id: extension.id.clone(),
            opener,
            sender: request.sender.clone(),
            created_at: Utc::now(),
        };
        self.ports
            .write()
            .entry(session_id)
            .or_default()
            .insert(port_id.clone(), record);

        let Some(background) = extension.background else {
            tracing::debug!(
                session_id,
                extension_id = %extension.id,
                port_id = %port_id,
                "No background page to connect to"
            );
            return Ok(ConnectOutcome::NoBackground(port_id));
        };

        if background == opener {
            tracing::debug!(session_id, port_id = %port_id, "Background connecting to itself");
            return Ok(ConnectOutcome::Suppressed(port_id));
        }

        let event = ContextEvent::RuntimeConnect {
            port: PortDescriptor {
                port_id: port_id.clone(),
                name: request.name,
                sender: request.sender,
            },
        };
        if let Err(e) = contexts.send(background, event) {
            tracing::debug!(session_id, port_id = %port_id, error = %e, "Background page unreachable");
            return Ok(ConnectOutcome::NoBackground(port_id));
        }

        tracing::debug!(
            session_id,
            extension_id = %extension.id,
            port_id = %port_id,
            opener = %opener,
            "Port opened"
        );

        Ok(ConnectOutcome::Delivered(port_id))
    }

    /// Deliver a port message to every live context but the sender.
    /// Unknown port ids are still broadcast; the receiving side filters.
    pub fn post_message(
        &self,
        contexts: &ContextTable,
        session_id: SessionId,
        sender: ContextId,
        port_id: &str,
        message: Value,
        tab: Option<TabDescriptor>,
    ) -> usize {
        let event = ContextEvent::PortMessage {
            port_id: port_id.to_string(),
            message,
            tab,
        };
        let reached = contexts.broadcast(session_id, Some(sender), &event);

        tracing::trace!(session_id, port_id, reached, "Port message posted");

        reached
    }

    /// Close a port from either end and tell everyone else
    pub fn disconnect(
        &self,
        contexts: &ContextTable,
        session_id: SessionId,
        sender: ContextId,
        port_id: &str,
    ) -> Option<PortRecord> {
        let removed = self
            .ports
            .write()
            .get_mut(&session_id)
            .and_then(|ports| ports.remove(port_id));

        contexts.broadcast(
            session_id,
            Some(sender),
            &ContextEvent::PortDisconnect {
                port_id: port_id.to_string(),
            },
        );

        removed
    }

    /// Forget ports opened by a context that went away
    pub fn drop_context(&self, session_id: SessionId, context: ContextId) -> Vec<String> {
        let mut ports = self.ports.write();
        let Some(session_ports) = ports.get_mut(&session_id) else {
            return Vec::new();
        };

        let gone: Vec<String> = session_ports
            .values()
            .filter(|record| record.opener == context)
            .map(|record| record.port_id.clone())
            .collect();
        for port_id in &gone {
            session_ports.remove(port_id);
        }
        gone
    }

    pub fn drop_session(&self, session_id: SessionId) {
        self.ports.write().remove(&session_id);
    }

    pub fn get(&self, session_id: SessionId, port_id: &str) -> Option<PortRecord> {
        self.ports
            .read()
            .get(&session_id)
            .and_then(|ports| ports.get(port_id).cloned())
    }

    pub fn count(&self, session_id: SessionId) -> usize {
        self.ports
            .read()
            .get(&session_id)
            .map(|ports| ports.len())
            .unwrap_or(0)
    }
}

impl Clone for PortManager {
    fn clone(&self) -> Self {
        Self {
            ports: Arc::clone(&self.ports),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contexts::ContextInfo;
    use extbus_privacy::Blacklist;
    use extbus_session::{ExtensionRuntime, ManifestSummary};
    use serde_json::json;
    use std::path::PathBuf;

    fn setup() -> (SessionRegistry, ContextTable) {
        let registry = SessionRegistry::new();
        registry.start_session(1, Blacklist::new()).unwrap();
        registry
            .load_extension(
                1,
                ExtensionRuntime::new(
                    "ext-a".to_string(),
                    PathBuf::from("/extensions/ext-a"),
                    ManifestSummary {
                        name: "A".to_string(),
                        version: "1.0".to_string(),
                        ..Default::default()
                    },
                ),
            )
            .unwrap();
        (registry, ContextTable::new())
    }

    fn request() -> ConnectRequest {
        ConnectRequest {
            extension_id: "ext-a".to_string(),
            name: Some("channel".to_string()),
            sender: SenderDescriptor {
                id: "ext-a".to_string(),
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_connect_notifies_background() {
        let (registry, contexts) = setup();
        let manager = PortManager::new();
        let (bg, mut bg_rx) = contexts.attach(1, ContextInfo::background("ext-a"));
        registry.set_background(1, "ext-a", Some(bg)).unwrap();
        let (tab, _tab_rx) = contexts.attach(1, ContextInfo::tab(5, 1, "https://a.test/"));

        let outcome = manager
            .connect(&registry, &contexts, 1, tab, request())
            .unwrap();

        assert!(matches!(outcome, ConnectOutcome::Delivered(_)));
        match bg_rx.try_recv().unwrap() {
            ContextEvent::RuntimeConnect { port } => {
                assert_eq!(port.port_id, outcome.port_id());
                assert_eq!(port.name.as_deref(), Some("channel"));
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(manager.count(1), 1);
    }

    #[test]
    fn test_background_self_connect_is_suppressed() {
        let (registry, contexts) = setup();
        let manager = PortManager::new();
        let (bg, mut bg_rx) = contexts.attach(1, ContextInfo::background("ext-a"));
        registry.set_background(1, "ext-a", Some(bg)).unwrap();

        let outcome = manager.connect(&registry, &contexts, 1, bg, request()).unwrap();

        assert!(matches!(outcome, ConnectOutcome::Suppressed(_)));
        assert!(bg_rx.try_recv().is_err());
    }

    #[test]
    fn test_connect_unknown_extension() {
        let (registry, contexts) = setup();
        let manager = PortManager::new();
        let mut req = request();
        req.extension_id = "missing".to_string();

        assert!(manager
            .connect(&registry, &contexts, 1, ContextId(99), req)
            .is_err());
        assert_eq!(manager.count(1), 0);
    }

    #[test]
    fn test_post_message_reaches_everyone_but_sender() {
        let (_registry, contexts) = setup();
        let manager = PortManager::new();
        let (a, mut rx_a) = contexts.attach(1, ContextInfo::background("ext-a"));
        let (_b, mut rx_b) = contexts.attach(1, ContextInfo::tab(5, 1, "https://a.test/"));
        let (_c, mut rx_c) = contexts.attach(1, ContextInfo::tab(6, 1, "https://b.test/"));

        let reached = manager.post_message(&contexts, 1, a, "p1", json!({"n": 1}), None);

        assert_eq!(reached, 2);
        assert!(rx_a.try_recv().is_err());
        for rx in [&mut rx_b, &mut rx_c] {
            match rx.try_recv().unwrap() {
                ContextEvent::PortMessage { port_id, message, .. } => {
                    assert_eq!(port_id, "p1");
                    assert_eq!(message, json!({"n": 1}));
                }
                other => panic!("unexpected event: {:?}", other),
            }
        }
    }

    #[test]
    fn test_disconnect_and_drop_context() {
        let (registry, contexts) = setup();
        let manager = PortManager::new();
        let (tab, _tab_rx) = contexts.attach(1, ContextInfo::tab(5, 1, "https://a.test/"));
        let (other, mut other_rx) = contexts.attach(1, ContextInfo::tab(6, 1, "https://b.test/"));

        let first = manager.connect(&registry, &contexts, 1, tab, request()).unwrap();
        let second = manager.connect(&registry, &contexts, 1, tab, request()).unwrap();
        manager.connect(&registry, &contexts, 1, other, request()).unwrap();

        assert!(manager.disconnect(&contexts, 1, tab, first.port_id()).is_some());
        assert!(matches!(
            other_rx.try_recv(),
            Ok(ContextEvent::PortDisconnect { port_id }) if port_id == first.port_id()
        ));

        assert_eq!(manager.drop_context(1, tab), vec![second.port_id().to_string()]);
        assert_eq!(manager.count(1), 1);
    }
}
