//! Context-side connection to the router

use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use extbus_session::{ContextId, SessionId};

use crate::channel::Operation;
use crate::error::BusError;
use crate::protocol::Inbound;
use crate::Result;

/// Sends inbound messages on behalf of one context and matches correlated
/// responses to their waiters.
#[derive(Clone)]
pub struct BusClient {
    session_id: SessionId,
    context_id: ContextId,
    outbound: mpsc::UnboundedSender<Inbound>,
    waiters: Arc<Mutex<HashMap<String, oneshot::Sender<Value>>>>,
    timeout: Duration,
}

impl BusClient {
    pub fn new(
        session_id: SessionId,
        context_id: ContextId,
        outbound: mpsc::UnboundedSender<Inbound>,
        timeout: Duration,
    ) -> Self {
        Self {
            session_id,
            context_id,
            outbound,
            waiters: Arc::new(Mutex::new(HashMap::new())),
            timeout,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn context_id(&self) -> ContextId {
        self.context_id
    }

    /// Fire and forget
    pub fn send(&self, operation: Operation, payload: Value) -> Result<()> {
        self.send_on(operation.channel(self.session_id), payload)
    }

    pub fn send_on(&self, channel: String, payload: Value) -> Result<()> {
        self.outbound
            .send(Inbound {
                channel,
                sender: self.context_id,
                payload,
                reply: None,
            })
            .map_err(|_| BusError::NotRunning)
    }

    /// Send and wait for the router's direct reply
    pub async fn call(&self, operation: Operation, payload: Value) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.outbound
            .send(Inbound {
                channel: operation.channel(self.session_id),
                sender: self.context_id,
                payload,
                reply: Some(tx),
            })
            .map_err(|_| BusError::NotRunning)?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            // Router dropped the reply without answering
            Ok(Err(_)) => Ok(Value::Null),
            Err(_) => Err(BusError::Timeout(operation.prefix().to_string())),
        }
    }

    /// Send and wait for a response pushed on `response_channel`
    pub async fn request(
        &self,
        operation: Operation,
        payload: Value,
        response_channel: String,
    ) -> Result<Value> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(response_channel.clone(), tx);

        if let Err(e) = self.send(operation, payload) {
            self.waiters.lock().remove(&response_channel);
            return Err(e);
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Ok(Value::Null),
            Err(_) => {
                self.waiters.lock().remove(&response_channel);
                Err(BusError::Timeout(response_channel))
            }
        }
    }

    /// Hand a pushed response to its waiter. False if nobody is waiting.
    pub fn resolve(&self, channel: &str, payload: Value) -> bool {
        match self.waiters.lock().remove(channel) {
            Some(tx) => tx.send(payload).is_ok(),
            None => false,
        }
    }

    pub fn waiting(&self) -> usize {
        self.waiters.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client(timeout: Duration) -> (BusClient, mpsc::UnboundedReceiver<Inbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (BusClient::new(3, ContextId(9), tx, timeout), rx)
    }

    #[tokio::test]
    async fn test_call_gets_reply() {
        let (client, mut rx) = client(Duration::from_secs(5));

        tokio::spawn(async move {
            let inbound = rx.recv().await.unwrap();
            assert_eq!(inbound.channel, "get-blacklist-3");
            assert_eq!(inbound.sender, ContextId(9));
            inbound.reply.unwrap().send(json!(["*://ads.test/*"])).unwrap();
        });

        let value = client.call(Operation::GetBlacklist, Value::Null).await.unwrap();
        assert_eq!(value, json!(["*://ads.test/*"]));
    }

    #[tokio::test]
    async fn test_request_resolved_by_channel() {
        let (client, mut rx) = client(Duration::from_secs(5));
        let resolver = client.clone();

        tokio::spawn(async move {
            let inbound = rx.recv().await.unwrap();
            assert!(inbound.reply.is_none());
            assert!(resolver.resolve("api-storage-operation-1", json!({"ok": {}})));
        });

        let value = client
            .request(
                Operation::StorageOperation,
                json!({}),
                "api-storage-operation-1".to_string(),
            )
            .await
            .unwrap();
        assert_eq!(value, json!({"ok": {}}));
        assert_eq!(client.waiting(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_timeout_clears_waiter() {
        let (client, _rx) = client(Duration::from_millis(50));

        let err = client
            .request(Operation::TabsSendMessage, json!({}), "never".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, BusError::Timeout(_)));
        assert_eq!(client.waiting(), 0);
        assert!(!client.resolve("never", Value::Null));
    }

    #[tokio::test]
    async fn test_send_after_router_gone() {
        let (client, rx) = client(Duration::from_secs(1));
        drop(rx);
        assert!(matches!(
            client.send(Operation::GetExtensions, Value::Null),
            Err(BusError::NotRunning)
        ));
    }
}
