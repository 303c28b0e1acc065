//! Context-side extension API
//!
//! What an extension page or content script programs against: `runtime`,
//! `tabs`, `storage`, `alarms`, `cookies` and `browserAction`, expressed as
//! messages to the router. [`ExtensionApi::run`] pumps the context's inbox
//! and turns pushed events into listener calls, responses into resolved
//! calls, and snapshot requests into pruned snapshots of the global scope.

mod client;
mod event;
mod port;

pub use client::BusClient;
pub use event::{Event, ListenerId};
pub use port::{Port, PortMessage};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use extbus_session::{Alarm, ContextId, ExtensionDescriptor, SenderDescriptor, TabDescriptor, TabId};
use extbus_storage::StorageArea;

use crate::channel::{
    message_response_channel, snapshot_channel, storage_response_channel,
    tabs_create_response_channel, Operation,
};
use crate::cookies::{Cookie, CookieChange, CookieDetails};
use crate::messaging::relay_payload;
use crate::protocol::{
    AlarmCreateInfo, BadgeTextDetails, ContextEvent, CreateProperties, InjectDetails,
};
use crate::router::{ContextEndpoint, MessageRouter};
use crate::snapshot::{PruneOptions, ScopeGraph};
use crate::storage::StorageReply;
use crate::Result;

/// Answers a received message at most once
struct Responder {
    client: BusClient,
    target: ContextId,
    channel: String,
    sent: AtomicBool,
}

/// A `runtime.onMessage` delivery
pub struct MessageEvent {
    pub message: Value,
    pub sender: SenderDescriptor,
    responder: Responder,
}

impl MessageEvent {
    /// Send the answer back to the caller. Only the first call is delivered.
    pub fn send_response(&self, response: Value) -> bool {
        let responder = &self.responder;
        if responder.sent.swap(true, Ordering::SeqCst) {
            return false;
        }

        let relay = relay_payload(responder.target, &responder.channel, response);
        match serde_json::to_value(relay) {
            Ok(payload) => responder
                .client
                .send(Operation::SendToContext, payload)
                .is_ok(),
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode response");
                false
            }
        }
    }
}

/// A `send-to-all-extensions` delivery
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastEvent {
    pub channel: String,
    pub args: Vec<Value>,
}

type ScopeProvider = Arc<dyn Fn() -> ScopeGraph + Send + Sync>;

struct ApiInner {
    client: BusClient,
    extension: ExtensionDescriptor,
    url: String,
    ports: RwLock<HashMap<String, Port>>,
    on_connect: Event<Port>,
    on_message: Event<MessageEvent>,
    on_alarm: Event<Alarm>,
    on_cookie_changed: Event<CookieChange>,
    on_broadcast: Event<BroadcastEvent>,
    scope: RwLock<Option<ScopeProvider>>,
    prune: PruneOptions,
}

#[derive(Clone)]
pub struct ExtensionApi {
    inner: Arc<ApiInner>,
}

impl ExtensionApi {
    pub fn new(client: BusClient, extension: ExtensionDescriptor, url: String) -> Self {
        Self {
            inner: Arc::new(ApiInner {
                client,
                extension,
                url,
                ports: RwLock::new(HashMap::new()),
                on_connect: Event::new(),
                on_message: Event::new(),
                on_alarm: Event::new(),
                on_cookie_changed: Event::new(),
                on_broadcast: Event::new(),
                scope: RwLock::new(None),
                prune: PruneOptions::default(),
            }),
        }
    }

    /// Build the API for an attached context acting on behalf of
    /// `extension_id`. Returns the API and the inbox to pump.
    pub fn for_endpoint(
        router: &MessageRouter,
        endpoint: ContextEndpoint,
        extension_id: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ContextEvent>)> {
        let extension = router
            .resolve_extension(endpoint.session_id, extension_id)?
            .descriptor(true);
        let client = BusClient::new(
            endpoint.session_id,
            endpoint.id,
            endpoint.outbound,
            router.config().response_timeout(),
        );

        Ok((Self::new(client, extension, endpoint.info.url), endpoint.inbox))
    }

    pub fn client(&self) -> &BusClient {
        &self.inner.client
    }

    pub fn extension(&self) -> &ExtensionDescriptor {
        &self.inner.extension
    }

    /// Provide the global scope handed out by `runtime.getBackgroundPage`
    pub fn set_global_scope<F>(&self, provider: F)
    where
        F: Fn() -> ScopeGraph + Send + Sync + 'static,
    {
        *self.inner.scope.write() = Some(Arc::new(provider));
    }

    // ==================== Event pump ====================

    /// Pump the inbox until the router drops it
    pub async fn run(self, mut inbox: mpsc::UnboundedReceiver<ContextEvent>) {
        while let Some(event) = inbox.recv().await {
            self.deliver(event);
        }
        tracing::debug!(context = %self.inner.client.context_id(), "Inbox closed");
    }

    pub fn spawn(&self, inbox: mpsc::UnboundedReceiver<ContextEvent>) -> JoinHandle<()> {
        tokio::spawn(self.clone().run(inbox))
    }

    pub fn deliver(&self, event: ContextEvent) {
        let inner = &self.inner;
        match event {
            ContextEvent::RuntimeConnect { port } => {
                let handle = Port::new(
                    port.port_id.clone(),
                    port.name,
                    Some(port.sender),
                    inner.client.clone(),
                );
                inner.ports.write().insert(port.port_id, handle.clone());
                inner.on_connect.emit(&handle);
            }
            ContextEvent::RuntimeMessage {
                port_id,
                sender,
                message,
                reply_to,
            } => self.emit_message(Operation::RuntimeSendMessage, port_id, sender, message, reply_to),
            ContextEvent::TabsMessage {
                port_id,
                sender,
                message,
                reply_to,
            } => self.emit_message(Operation::TabsSendMessage, port_id, sender, message, reply_to),
            ContextEvent::PortMessage {
                port_id,
                message,
                tab,
            } => {
                // Broadcast delivery: not ours unless we hold the port
                let port = inner.ports.read().get(&port_id).cloned();
                if let Some(port) = port {
                    port.deliver(PortMessage { message, tab });
                }
            }
            ContextEvent::PortDisconnect { port_id } => {
                let port = inner.ports.write().remove(&port_id);
                if let Some(port) = port {
                    port.remote_disconnected();
                }
            }
            ContextEvent::Alarm(alarm) => {
                inner.on_alarm.emit(&alarm);
            }
            ContextEvent::CookieChanged(change) => {
                inner.on_cookie_changed.emit(&change);
            }
            ContextEvent::Response { channel, payload } => {
                if !inner.client.resolve(&channel, payload) {
                    tracing::debug!(channel = %channel, "Response without waiter");
                }
            }
            ContextEvent::SnapshotRequest { correlation_id } => {
                let provider = inner.scope.read().clone();
                let graph = provider.map(|provide| provide()).unwrap_or_default();
                let snapshot = graph.prune(inner.prune);
                if let Err(e) = inner.client.send_on(snapshot_channel(&correlation_id), snapshot) {
                    e.report("runtime.getBackgroundPage");
                }
            }
            ContextEvent::Broadcast { channel, args } => {
                inner.on_broadcast.emit(&BroadcastEvent { channel, args });
            }
        }
    }

    fn emit_message(
        &self,
        operation: Operation,
        port_id: String,
        sender: SenderDescriptor,
        message: Value,
        reply_to: ContextId,
    ) {
        let event = MessageEvent {
            message,
            sender,
            responder: Responder {
                client: self.inner.client.clone(),
                target: reply_to,
                channel: message_response_channel(operation, &port_id),
                sent: AtomicBool::new(false),
            },
        };
        self.inner.on_message.emit(&event);
    }

    // ==================== Events ====================

    pub fn on_connect(&self) -> &Event<Port> {
        &self.inner.on_connect
    }

    pub fn on_message(&self) -> &Event<MessageEvent> {
        &self.inner.on_message
    }

    pub fn on_alarm(&self) -> &Event<Alarm> {
        &self.inner.on_alarm
    }

    pub fn on_broadcast(&self) -> &Event<BroadcastEvent> {
        &self.inner.on_broadcast
    }

    // ==================== runtime ====================

    pub fn id(&self) -> &str {
        &self.inner.extension.id
    }

    pub fn get_url(&self, path: &str) -> String {
        format!(
            "chrome-extension://{}/{}",
            self.inner.extension.id,
            path.trim_start_matches('/')
        )
    }

    fn sender(&self) -> SenderDescriptor {
        SenderDescriptor {
            id: self.inner.extension.id.clone(),
            url: Some(self.inner.url.clone()),
            tab: None,
            frame_id: None,
        }
    }

    /// Open a port to this extension's background page
    pub async fn connect(&self, name: Option<&str>) -> Result<Port> {
        self.connect_to(&self.inner.extension.id, name).await
    }

    pub async fn connect_to(&self, extension_id: &str, name: Option<&str>) -> Result<Port> {
        let reply = self
            .inner
            .client
            .call(
                Operation::RuntimeConnect,
                json!({ "extensionId": extension_id, "name": name, "sender": self.sender() }),
            )
            .await?;

        let port_id: String = decode(reply)?;
        let port = Port::new(
            port_id.clone(),
            name.map(str::to_string),
            None,
            self.inner.client.clone(),
        );
        self.inner.ports.write().insert(port_id, port.clone());
        Ok(port)
    }

    /// `runtime.sendMessage` to this extension; resolves with the answer
    pub async fn send_message(&self, message: Value) -> Result<Value> {
        self.send_message_to(&self.inner.extension.id, message).await
    }

    pub async fn send_message_to(&self, extension_id: &str, message: Value) -> Result<Value> {
        let port_id = Uuid::new_v4().simple().to_string();
        let channel = message_response_channel(Operation::RuntimeSendMessage, &port_id);

        self.inner
            .client
            .request(
                Operation::RuntimeSendMessage,
                json!({
                    "extensionId": extension_id,
                    "portId": port_id,
                    "sender": self.sender(),
                    "message": message,
                }),
                channel,
            )
            .await
    }

    pub async fn get_background_page(&self) -> Result<Value> {
        self.inner
            .client
            .call(Operation::RuntimeGetBackgroundPage, json!(self.inner.extension.id))
            .await
    }

    pub fn reload(&self) -> Result<()> {
        self.inner
            .client
            .send(Operation::RuntimeReload, json!(self.inner.extension.id))
    }

    // ==================== extensions ====================

    pub async fn get_extension(&self, extension_id: &str) -> Result<Option<ExtensionDescriptor>> {
        decode(
            self.inner
                .client
                .call(Operation::GetExtension, json!(extension_id))
                .await?,
        )
    }

    pub async fn get_extensions(&self) -> Result<BTreeMap<String, ExtensionDescriptor>> {
        decode(self.inner.client.call(Operation::GetExtensions, Value::Null).await?)
    }

    pub async fn get_blacklist(&self) -> Result<Vec<String>> {
        decode(self.inner.client.call(Operation::GetBlacklist, Value::Null).await?)
    }

    pub fn send_to_all_extensions(&self, channel: &str, args: Vec<Value>) -> Result<()> {
        self.inner.client.send(
            Operation::SendToAllExtensions,
            json!({ "channel": channel, "args": args }),
        )
    }

    // ==================== tabs ====================

    pub async fn tabs_query(&self) -> Result<Vec<TabDescriptor>> {
        decode(self.inner.client.call(Operation::TabsQuery, Value::Null).await?)
    }

    pub async fn tabs_get_current(&self) -> Result<Option<TabDescriptor>> {
        decode(self.inner.client.call(Operation::CurrentTab, Value::Null).await?)
    }

    pub async fn tabs_create(&self, properties: CreateProperties) -> Result<Option<TabDescriptor>> {
        let response_id = Uuid::new_v4().simple().to_string();
        let channel = tabs_create_response_channel(&response_id);

        let reply = self
            .inner
            .client
            .request(
                Operation::TabsCreate,
                json!({ "responseId": response_id, "createProperties": properties }),
                channel,
            )
            .await?;
        decode(reply)
    }

    pub async fn tabs_insert_css(&self, tab_id: TabId, details: InjectDetails) -> Result<()> {
        self.inner
            .client
            .call(Operation::TabsInsertCss, self.inject_payload(tab_id, details))
            .await?;
        Ok(())
    }

    pub async fn tabs_execute_script(&self, tab_id: TabId, details: InjectDetails) -> Result<Value> {
        self.inner
            .client
            .call(Operation::TabsExecuteScript, self.inject_payload(tab_id, details))
            .await
    }

    fn inject_payload(&self, tab_id: TabId, details: InjectDetails) -> Value {
        json!({ "extensionId": self.inner.extension.id, "tabId": tab_id, "details": details })
    }

    pub async fn tabs_send_message(&self, tab_id: TabId, message: Value) -> Result<Value> {
        let port_id = Uuid::new_v4().simple().to_string();
        let channel = message_response_channel(Operation::TabsSendMessage, &port_id);

        self.inner
            .client
            .request(
                Operation::TabsSendMessage,
                json!({
                    "tabId": tab_id,
                    "portId": port_id,
                    "sender": self.sender(),
                    "message": message,
                }),
                channel,
            )
            .await
    }

    // ==================== storage ====================

    pub fn storage(&self, area: StorageArea) -> StorageAreaApi<'_> {
        StorageAreaApi { api: self, area }
    }

    // ==================== alarms ====================

    fn alarm_call(&self, kind: &str, name: Option<&str>, info: Option<AlarmCreateInfo>) -> Value {
        json!({
            "extensionId": self.inner.extension.id,
            "type": kind,
            "name": name,
            "info": info,
        })
    }

    pub async fn alarms_create(&self, name: &str, info: AlarmCreateInfo) -> Result<()> {
        self.inner
            .client
            .call(
                Operation::AlarmsOperation,
                self.alarm_call("create", Some(name), Some(info)),
            )
            .await?;
        Ok(())
    }

    pub async fn alarms_get(&self, name: &str) -> Result<Option<Alarm>> {
        decode(
            self.inner
                .client
                .call(Operation::AlarmsOperation, self.alarm_call("get", Some(name), None))
                .await?,
        )
    }

    pub async fn alarms_get_all(&self) -> Result<Vec<Alarm>> {
        let reply = self
            .inner
            .client
            .call(Operation::AlarmsOperation, self.alarm_call("getAll", None, None))
            .await?;
        if reply.is_null() {
            return Ok(Vec::new());
        }
        decode(reply)
    }

    pub async fn alarms_clear(&self, name: &str) -> Result<bool> {
        let reply = self
            .inner
            .client
            .call(Operation::AlarmsOperation, self.alarm_call("clear", Some(name), None))
            .await?;
        Ok(reply.as_bool().unwrap_or(false))
    }

    pub async fn alarms_clear_all(&self) -> Result<bool> {
        let reply = self
            .inner
            .client
            .call(Operation::AlarmsOperation, self.alarm_call("clearAll", None, None))
            .await?;
        Ok(reply.as_bool().unwrap_or(false))
    }

    // ==================== cookies ====================

    pub async fn cookies_get_all(&self, details: CookieDetails) -> Result<Vec<Cookie>> {
        let reply = self
            .inner
            .client
            .call(Operation::CookiesGetAll, serde_json::to_value(details)?)
            .await?;
        if reply.is_null() {
            return Ok(Vec::new());
        }
        decode(reply)
    }

    pub async fn cookies_set(&self, details: CookieDetails) -> Result<Option<Cookie>> {
        decode(
            self.inner
                .client
                .call(Operation::CookiesSet, serde_json::to_value(details)?)
                .await?,
        )
    }

    pub async fn cookies_remove(&self, details: CookieDetails) -> Result<Option<Cookie>> {
        decode(
            self.inner
                .client
                .call(Operation::CookiesRemove, serde_json::to_value(details)?)
                .await?,
        )
    }

    fn cookie_listener_payload(&self) -> Value {
        json!({
            "scope": "cookies",
            "name": "onChanged",
            "id": self.inner.client.context_id().0,
        })
    }

    /// `cookies.onChanged.addListener`. The context subscribes with the
    /// router when its first listener is added.
    pub fn add_cookie_listener<F>(&self, listener: F) -> Result<ListenerId>
    where
        F: Fn(&CookieChange) + Send + Sync + 'static,
    {
        let first = !self.inner.on_cookie_changed.has_listeners();
        let id = self.inner.on_cookie_changed.add_listener(listener);
        if first {
            self.inner
                .client
                .send(Operation::AddListener, self.cookie_listener_payload())?;
        }
        Ok(id)
    }

    /// `cookies.onChanged.removeListener`. The last removal unsubscribes.
    pub fn remove_cookie_listener(&self, id: ListenerId) -> Result<bool> {
        if !self.inner.on_cookie_changed.remove_listener(id) {
            return Ok(false);
        }
        if !self.inner.on_cookie_changed.has_listeners() {
            self.inner
                .client
                .send(Operation::RemoveListener, self.cookie_listener_payload())?;
        }
        Ok(true)
    }

    // ==================== browserAction ====================

    pub fn set_badge_text(&self, details: BadgeTextDetails) -> Result<()> {
        self.inner.client.send(
            Operation::SetBadgeText,
            json!({ "extensionId": self.inner.extension.id, "details": details }),
        )
    }
}

/// `storage.<area>` for one extension
pub struct StorageAreaApi<'a> {
    api: &'a ExtensionApi,
    area: StorageArea,
}

impl StorageAreaApi<'_> {
    async fn operation(&self, kind: &str, arg: Value) -> Result<Value> {
        let id = Uuid::new_v4().simple().to_string();
        let channel = storage_response_channel(&id);
        let reply = self
            .api
            .inner
            .client
            .request(
                Operation::StorageOperation,
                json!({
                    "id": id,
                    "extensionId": self.api.inner.extension.id,
                    "area": self.area,
                    "type": kind,
                    "arg": arg,
                }),
                channel,
            )
            .await?;

        decode::<StorageReply>(reply)?.into_result()
    }

    /// `keys` may be null, a key, a list of keys or an object of defaults
    pub async fn get(&self, keys: Value) -> Result<Map<String, Value>> {
        match self.operation("get", keys).await? {
            Value::Object(items) => Ok(items),
            _ => Ok(Map::new()),
        }
    }

    pub async fn set(&self, items: Map<String, Value>) -> Result<()> {
        self.operation("set", Value::Object(items)).await?;
        Ok(())
    }

    pub async fn remove(&self, keys: Value) -> Result<()> {
        self.operation("remove", keys).await?;
        Ok(())
    }

    pub async fn clear(&self) -> Result<()> {
        self.operation("clear", Value::Null).await?;
        Ok(())
    }
}

fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    Ok(serde_json::from_value(value)?)
}
