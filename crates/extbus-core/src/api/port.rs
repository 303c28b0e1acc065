//! Context-side port handle

use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use extbus_session::{SenderDescriptor, TabDescriptor};

use crate::api::client::BusClient;
use crate::api::event::Event;
use crate::channel::Operation;
use crate::error::BusError;
use crate::Result;

/// A message received on a port
#[derive(Debug, Clone, PartialEq)]
pub struct PortMessage {
    pub message: Value,
    pub tab: Option<TabDescriptor>,
}

struct PortInner {
    id: String,
    name: Option<String>,
    sender: Option<SenderDescriptor>,
    client: BusClient,
    connected: AtomicBool,
    on_message: Event<PortMessage>,
    on_disconnect: Event<()>,
}

#[derive(Clone)]
pub struct Port {
    inner: Arc<PortInner>,
}

impl Port {
    pub(crate) fn new(
        id: String,
        name: Option<String>,
        sender: Option<SenderDescriptor>,
        client: BusClient,
    ) -> Self {
        Self {
            inner: Arc::new(PortInner {
                id,
                name,
                sender,
                client,
                connected: AtomicBool::new(true),
                on_message: Event::new(),
                on_disconnect: Event::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// The opener, as seen by the background page
    pub fn sender(&self) -> Option<&SenderDescriptor> {
        self.inner.sender.as_ref()
    }

    pub fn on_message(&self) -> &Event<PortMessage> {
        &self.inner.on_message
    }

    pub fn on_disconnect(&self) -> &Event<()> {
        &self.inner.on_disconnect
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn post_message(&self, message: Value) -> Result<()> {
        self.post(message, None)
    }

    pub fn post_message_with_tab(&self, message: Value, tab: TabDescriptor) -> Result<()> {
        self.post(message, Some(tab))
    }

    fn post(&self, message: Value, tab: Option<TabDescriptor>) -> Result<()> {
        if !self.is_connected() {
            return Err(BusError::InvalidArgument(format!(
                "port {} is disconnected",
                self.inner.id
            )));
        }

        self.inner.client.send(
            Operation::PortPostMessage,
            json!({ "portId": self.inner.id, "message": message, "tab": tab }),
        )
    }

    /// Close the port. The other end gets `onDisconnect`; this end does not.
    pub fn disconnect(&self) -> Result<()> {
        if !self.inner.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner
            .client
            .send(Operation::PortDisconnect, json!({ "portId": self.inner.id }))
    }

    pub(crate) fn deliver(&self, message: PortMessage) {
        if self.is_connected() {
            self.inner.on_message.emit(&message);
        }
    }

    pub(crate) fn remote_disconnected(&self) {
        if self.inner.connected.swap(false, Ordering::SeqCst) {
            self.inner.on_disconnect.emit(&());
        }
    }
}

impl std::fmt::Debug for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Port")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use extbus_session::ContextId;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::sync::mpsc;

    #[test]
    fn test_post_and_disconnect() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = BusClient::new(1, ContextId(2), tx, Duration::from_secs(1));
        let port = Port::new("p1".to_string(), Some("chan".to_string()), None, client);

        port.post_message(json!({"n": 1})).unwrap();
        let inbound = rx.try_recv().unwrap();
        assert_eq!(inbound.channel, "api-port-postMessage-1");
        assert_eq!(inbound.payload["portId"], "p1");
        assert_eq!(inbound.payload["message"], json!({"n": 1}));

        port.disconnect().unwrap();
        port.disconnect().unwrap();
        assert_eq!(rx.try_recv().unwrap().channel, "api-port-disconnect-1");
        assert!(rx.try_recv().is_err());
        assert!(port.post_message(json!(2)).is_err());
    }

    #[test]
    fn test_remote_disconnect_fires_once() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = BusClient::new(1, ContextId(2), tx, Duration::from_secs(1));
        let port = Port::new("p1".to_string(), None, None, client);
        let count = Arc::new(Mutex::new(0));
        let seen = Arc::clone(&count);
        port.on_disconnect().add_listener(move |_| *seen.lock() += 1);

        port.remote_disconnected();
        port.remote_disconnected();
        port.deliver(PortMessage {
            message: json!(1),
            tab: None,
        });

        assert_eq!(*count.lock(), 1);
        assert!(!port.is_connected());
    }
}
