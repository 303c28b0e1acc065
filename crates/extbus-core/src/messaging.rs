//! One-shot runtime messaging
//!
//! `runtime.sendMessage` goes to the extension's background page,
//! `tabs.sendMessage` to the context hosting a tab. The receiver answers via
//! `sendResponse`, which comes back as a relay request addressed to the
//! original sender on a per-message response channel.

use serde_json::Value;

use extbus_session::{ContextId, SenderDescriptor, SessionId, SessionRegistry};

use crate::contexts::ContextTable;
use crate::error::BusError;
use crate::protocol::{ContextEvent, RelayRequest, SendMessageRequest, TabsSendMessageRequest};
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered(ContextId),
    /// Sender and receiver are the same context
    Suppressed,
    /// Nobody to deliver to
    NoReceiver,
}

#[derive(Clone)]
pub struct Messenger {
    registry: SessionRegistry,
    contexts: ContextTable,
}

impl Messenger {
    pub fn new(registry: SessionRegistry, contexts: ContextTable) -> Self {
        Self { registry, contexts }
    }

    pub fn send_message(
        &self,
        session_id: SessionId,
        sender: ContextId,
        request: SendMessageRequest,
    ) -> Result<Delivery> {
        let extension = self.registry.extension(session_id, &request.extension_id)?;

        let Some(background) = extension.background else {
            tracing::debug!(
                session_id,
                extension_id = %extension.id,
                "No background page to receive message"
            );
            return Ok(Delivery::NoReceiver);
        };

        if background == sender {
            tracing::debug!(session_id, extension_id = %extension.id, "Dropping self-addressed message");
            return Ok(Delivery::Suppressed);
        }

        let event = ContextEvent::RuntimeMessage {
            port_id: request.port_id,
            sender: self.describe_sender(sender, request.sender),
            message: request.message,
            reply_to: sender,
        };
        self.contexts.send(background, event)?;

        Ok(Delivery::Delivered(background))
    }

    pub fn tabs_send_message(
        &self,
        session_id: SessionId,
        sender: ContextId,
        request: TabsSendMessageRequest,
    ) -> Result<Delivery> {
        let Some(target) = self.contexts.tab_context(session_id, request.tab_id) else {
            tracing::debug!(session_id, tab_id = request.tab_id, "No context for tab");
            return Ok(Delivery::NoReceiver);
        };

        let event = ContextEvent::TabsMessage {
            port_id: request.port_id,
            sender: self.describe_sender(sender, request.sender),
            message: request.message,
            reply_to: sender,
        };
        self.contexts.send(target, event)?;

        Ok(Delivery::Delivered(target))
    }

    /// Forward a `sendResponse` answer to the context that asked
    pub fn relay(&self, session_id: SessionId, request: RelayRequest) -> Result<()> {
        if self.contexts.session_of(request.target) != Some(session_id) {
            return Err(BusError::NotFound(format!(
                "context {} in session {}",
                request.target, session_id
            )));
        }

        self.contexts.send(
            request.target,
            ContextEvent::Response {
                channel: request.channel,
                payload: request.message,
            },
        )
    }

    /// Fill in what the sender left out from what the router knows about it
    pub(crate) fn describe_sender(&self, context: ContextId, mut sender: SenderDescriptor) -> SenderDescriptor {
        if let Some(info) = self.contexts.info(context) {
            if sender.id.is_empty() {
                sender.id = info.extension_id.clone().unwrap_or_default();
            }
            if sender.url.is_none() {
                sender.url = Some(info.url);
            }
        }
        if sender.tab.is_none() {
            sender.tab = self.contexts.tab_descriptor(context);
        }
        sender
    }
}

/// Build the relay payload a receiver sends for `sendResponse`
pub fn relay_payload(target: ContextId, channel: &str, message: Value) -> RelayRequest {
    RelayRequest {
        target,
        channel: channel.to_string(),
        message,
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

    fn setup() -> (Messenger, SessionRegistry, ContextTable) {
        let registry = SessionRegistry::new();
        registry.start_session(1, Blacklist::new()).unwrap();
        registry.start_session(2, Blacklist::new()).unwrap();
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
        let contexts = ContextTable::new();
        (
            Messenger::new(registry.clone(), contexts.clone()),
            registry,
            contexts,
        )
    }

    fn message(port_id: &str) -> SendMessageRequest {
        SendMessageRequest {
            extension_id: "ext-a".to_string(),
            port_id: port_id.to_string(),
            sender: SenderDescriptor::default(),
            message: json!({"ping": true}),
        }
    }

    #[test]
    fn test_send_message_to_background() {
        let (messenger, registry, contexts) = setup();
        let (bg, mut bg_rx) = contexts.attach(1, ContextInfo::background("ext-a"));
        registry.set_background(1, "ext-a", Some(bg)).unwrap();
        let (tab, _tab_rx) = contexts.attach(1, ContextInfo::tab(3, 1, "https://a.test/page"));

        let delivery = messenger.send_message(1, tab, message("p1")).unwrap();
        assert_eq!(delivery, Delivery::Delivered(bg));

        match bg_rx.try_recv().unwrap() {
            ContextEvent::RuntimeMessage {
                port_id,
                sender,
                message,
                reply_to,
            } => {
                assert_eq!(port_id, "p1");
                assert_eq!(reply_to, tab);
                assert_eq!(message, json!({"ping": true}));
                assert_eq!(sender.url.as_deref(), Some("https://a.test/page"));
                assert_eq!(sender.tab.map(|t| t.id), Some(3));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_background_self_message_is_suppressed() {
        let (messenger, registry, contexts) = setup();
        let (bg, mut bg_rx) = contexts.attach(1, ContextInfo::background("ext-a"));
        registry.set_background(1, "ext-a", Some(bg)).unwrap();

        assert_eq!(
            messenger.send_message(1, bg, message("p1")).unwrap(),
            Delivery::Suppressed
        );
        assert!(bg_rx.try_recv().is_err());
    }

    #[test]
    fn test_send_message_without_background() {
        let (messenger, _registry, contexts) = setup();
        let (tab, _rx) = contexts.attach(1, ContextInfo::tab(3, 1, "https://a.test/"));

        assert_eq!(
            messenger.send_message(1, tab, message("p1")).unwrap(),
            Delivery::NoReceiver
        );
    }

    #[test]
    fn test_tabs_send_message() {
        let (messenger, _registry, contexts) = setup();
        let (bg, _bg_rx) = contexts.attach(1, ContextInfo::background("ext-a"));
        let (tab, mut tab_rx) = contexts.attach(1, ContextInfo::tab(3, 1, "https://a.test/"));

        let request = TabsSendMessageRequest {
            tab_id: 3,
            port_id: "p2".to_string(),
            sender: SenderDescriptor::default(),
            message: json!("hello"),
        };
        assert_eq!(
            messenger.tabs_send_message(1, bg, request).unwrap(),
            Delivery::Delivered(tab)
        );
        assert!(matches!(
            tab_rx.try_recv(),
            Ok(ContextEvent::TabsMessage { reply_to, .. }) if reply_to == bg
        ));
    }

    #[test]
    fn test_relay_stays_within_session() {
        let (messenger, _registry, contexts) = setup();
        let (tab, mut tab_rx) = contexts.attach(1, ContextInfo::tab(3, 1, "https://a.test/"));
        let (foreign, _foreign_rx) = contexts.attach(2, ContextInfo::tab(4, 1, "https://b.test/"));

        messenger
            .relay(1, relay_payload(tab, "api-runtime-sendMessage-response-p1", json!(1)))
            .unwrap();
        assert!(matches!(
            tab_rx.try_recv(),
            Ok(ContextEvent::Response { channel, payload })
                if channel == "api-runtime-sendMessage-response-p1" && payload == json!(1)
        ));

        let err = messenger
            .relay(1, relay_payload(foreign, "x", Value::Null))
            .unwrap_err();
        assert!(matches!(err, BusError::NotFound(_)));
    }
}
