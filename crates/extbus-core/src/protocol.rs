//! Wire model between execution contexts and the router.
//!
//! Contexts send [`Inbound`] envelopes carrying a channel name and a JSON
//! payload. The router validates the payload into a [`Request`] before
//! touching any state. Everything flowing the other way is a
//! [`ContextEvent`] pushed into the context's outbox.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::oneshot;

use extbus_session::{Alarm, ContextId, SenderDescriptor, TabDescriptor, TabId, WindowId};
use extbus_storage::StorageArea;

use crate::channel::{
    port_disconnect_channel, port_message_channel, snapshot_channel, ChannelName, ChannelScope,
    Operation,
};
use crate::cookies::{CookieChange, CookieDetails};
use crate::error::BusError;
use crate::Result;

/// One message from a context to the router
#[derive(Debug)]
pub struct Inbound {
    pub channel: String,
    pub sender: ContextId,
    pub payload: Value,
    /// Present for request/response style calls
    pub reply: Option<oneshot::Sender<Value>>,
}

/// Reply slot of an inbound call. Dropping it unsent resolves the caller
/// with `null`.
#[derive(Debug, Default)]
pub struct Reply(Option<oneshot::Sender<Value>>);

impl Reply {
    pub fn new(sender: Option<oneshot::Sender<Value>>) -> Self {
        Self(sender)
    }

    pub fn send(mut self, value: Value) {
        if let Some(tx) = self.0.take() {
            // Caller may have gone away; nothing to do then
            let _ = tx.send(value);
        }
    }

    pub fn send_json<T: Serialize>(self, value: &T) {
        match serde_json::to_value(value) {
            Ok(value) => self.send(value),
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode reply");
                self.send(Value::Null);
            }
        }
    }
}

/// Request ids arrive as numbers or strings depending on the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    Number(u64),
    Text(String),
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::Text(s) => write!(f, "{}", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequest {
    pub extension_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub sender: SenderDescriptor,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub extension_id: String,
    pub port_id: String,
    #[serde(default)]
    pub sender: SenderDescriptor,
    #[serde(default)]
    pub message: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabsSendMessageRequest {
    pub tab_id: TabId,
    pub port_id: String,
    #[serde(default)]
    pub sender: SenderDescriptor,
    #[serde(default)]
    pub message: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMessageRequest {
    pub port_id: String,
    #[serde(default)]
    pub message: Value,
    #[serde(default)]
    pub tab: Option<TabDescriptor>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortDisconnectRequest {
    pub port_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageOperationKind {
    Get,
    Set,
    Remove,
    Clear,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageRequest {
    pub id: RequestId,
    pub extension_id: String,
    pub area: StorageArea,
    #[serde(rename = "type")]
    pub kind: StorageOperationKind,
    #[serde(default)]
    pub arg: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AlarmOperationKind {
    Create,
    Get,
    GetAll,
    Clear,
    ClearAll,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmCreateInfo {
    /// Absolute fire time, milliseconds since the Unix epoch
    #[serde(default)]
    pub when: Option<f64>,
    #[serde(default)]
    pub delay_in_minutes: Option<f64>,
    #[serde(default)]
    pub period_in_minutes: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlarmRequest {
    pub extension_id: String,
    #[serde(rename = "type")]
    pub kind: AlarmOperationKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub info: Option<AlarmCreateInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProperties {
    #[serde(default)]
    pub window_id: Option<WindowId>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
    #[serde(default)]
    pub index: Option<usize>,
    #[serde(default)]
    pub pinned: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TabsCreateRequest {
    pub response_id: RequestId,
    #[serde(default)]
    pub create_properties: CreateProperties,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectDetails {
    #[serde(default)]
    pub code: Option<String>,
    /// Path relative to the extension directory
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InjectRequest {
    pub extension_id: String,
    pub tab_id: TabId,
    #[serde(default)]
    pub details: InjectDetails,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BadgeTextDetails {
    pub text: String,
    #[serde(default)]
    pub tab_id: Option<TabId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BadgeTextRequest {
    pub extension_id: String,
    pub details: BadgeTextDetails,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerRequest {
    pub scope: String,
    pub name: String,
    pub id: u64,
}

impl ListenerRequest {
    pub fn is_cookie_change(&self) -> bool {
        self.scope == "cookies" && self.name == "onChanged"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastRequest {
    pub channel: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

/// Relay of a `sendResponse` answer to the context that asked
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayRequest {
    pub target: ContextId,
    pub channel: String,
    #[serde(default)]
    pub message: Value,
}

/// A validated inbound message
#[derive(Debug, Clone)]
pub enum Request {
    GetExtension { extension_id: String },
    GetExtensions,
    GetExtensionsContent,
    GetBlacklist,
    CurrentTab,
    TabsQuery,
    TabsCreate(TabsCreateRequest),
    TabsInsertCss(InjectRequest),
    TabsExecuteScript(InjectRequest),
    TabsSendMessage(TabsSendMessageRequest),
    RuntimeReload { extension_id: String },
    RuntimeConnect(ConnectRequest),
    RuntimeSendMessage(SendMessageRequest),
    RuntimeGetBackgroundPage { extension_id: String },
    PortPostMessage(PostMessageRequest),
    PortDisconnect(PortDisconnectRequest),
    StorageOperation(StorageRequest),
    AlarmsOperation(AlarmRequest),
    SetBadgeText(BadgeTextRequest),
    CookiesGetAll(CookieDetails),
    CookiesSet(CookieDetails),
    CookiesRemove(CookieDetails),
    AddListener(ListenerRequest),
    RemoveListener(ListenerRequest),
    SendToAllExtensions(BroadcastRequest),
    SendToContext(RelayRequest),
    WindowObject { correlation_id: String, snapshot: Value },
}

impl Request {
    pub fn parse(name: &ChannelName, payload: Value) -> Result<Self> {
        let request = match name.operation {
            Operation::GetExtension => Request::GetExtension {
                extension_id: extension_id_of(&payload)?,
            },
            Operation::GetExtensions => Request::GetExtensions,
            Operation::GetExtensionsContent => Request::GetExtensionsContent,
            Operation::GetBlacklist => Request::GetBlacklist,
            Operation::CurrentTab => Request::CurrentTab,
            Operation::TabsQuery => Request::TabsQuery,
            Operation::TabsCreate => Request::TabsCreate(serde_json::from_value(payload)?),
            Operation::TabsInsertCss => Request::TabsInsertCss(serde_json::from_value(payload)?),
            Operation::TabsExecuteScript => {
                Request::TabsExecuteScript(serde_json::from_value(payload)?)
            }
            Operation::TabsSendMessage => {
                Request::TabsSendMessage(serde_json::from_value(payload)?)
            }
            Operation::RuntimeReload => Request::RuntimeReload {
                extension_id: extension_id_of(&payload)?,
            },
            Operation::RuntimeConnect => Request::RuntimeConnect(serde_json::from_value(payload)?),
            Operation::RuntimeSendMessage => {
                Request::RuntimeSendMessage(serde_json::from_value(payload)?)
            }
            Operation::RuntimeGetBackgroundPage => Request::RuntimeGetBackgroundPage {
                extension_id: extension_id_of(&payload)?,
            },
            Operation::PortPostMessage => {
                Request::PortPostMessage(serde_json::from_value(payload)?)
            }
            Operation::PortDisconnect => Request::PortDisconnect(serde_json::from_value(payload)?),
            Operation::StorageOperation => {
                Request::StorageOperation(serde_json::from_value(payload)?)
            }
            Operation::AlarmsOperation => {
                Request::AlarmsOperation(serde_json::from_value(payload)?)
            }
            Operation::SetBadgeText => Request::SetBadgeText(serde_json::from_value(payload)?),
            Operation::CookiesGetAll => Request::CookiesGetAll(details_of(payload)?),
            Operation::CookiesSet => Request::CookiesSet(details_of(payload)?),
            Operation::CookiesRemove => Request::CookiesRemove(details_of(payload)?),
            Operation::AddListener => Request::AddListener(serde_json::from_value(payload)?),
            Operation::RemoveListener => Request::RemoveListener(serde_json::from_value(payload)?),
            Operation::SendToAllExtensions => {
                Request::SendToAllExtensions(serde_json::from_value(payload)?)
            }
            Operation::SendToContext => Request::SendToContext(serde_json::from_value(payload)?),
            Operation::WindowObject => match &name.scope {
                ChannelScope::Correlation(id) => Request::WindowObject {
                    correlation_id: id.clone(),
                    snapshot: payload,
                },
                ChannelScope::Session(_) => {
                    return Err(BusError::InvalidArgument(
                        "snapshot reply without correlation id".to_string(),
                    ))
                }
            },
        };
        Ok(request)
    }
}

/// Accept either a bare id string or `{ "extensionId": ... }`
fn extension_id_of(payload: &Value) -> Result<String> {
    let id = match payload {
        Value::String(id) => Some(id.as_str()),
        Value::Object(map) => map.get("extensionId").and_then(Value::as_str),
        _ => None,
    };
    match id {
        Some(id) if !id.is_empty() => Ok(id.to_string()),
        _ => Err(BusError::InvalidArgument(format!(
            "expected an extension id, got {}",
            payload
        ))),
    }
}

fn details_of(payload: Value) -> Result<CookieDetails> {
    if payload.is_null() {
        return Ok(CookieDetails::default());
    }
    Ok(serde_json::from_value(payload)?)
}

/// Port handed to the background page on `runtime.onConnect`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortDescriptor {
    pub port_id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub sender: SenderDescriptor,
}

/// Everything the router pushes into a context
#[derive(Debug, Clone)]
pub enum ContextEvent {
    RuntimeConnect {
        port: PortDescriptor,
    },
    RuntimeMessage {
        port_id: String,
        sender: SenderDescriptor,
        message: Value,
        reply_to: ContextId,
    },
    TabsMessage {
        port_id: String,
        sender: SenderDescriptor,
        message: Value,
        reply_to: ContextId,
    },
    PortMessage {
        port_id: String,
        message: Value,
        tab: Option<TabDescriptor>,
    },
    PortDisconnect {
        port_id: String,
    },
    Alarm(Alarm),
    CookieChanged(CookieChange),
    /// Correlated reply delivered on a named response channel
    Response {
        channel: String,
        payload: Value,
    },
    SnapshotRequest {
        correlation_id: String,
    },
    Broadcast {
        channel: String,
        args: Vec<Value>,
    },
}

impl ContextEvent {
    /// Channel name the event is known by on the context side
    pub fn channel(&self) -> String {
        match self {
            ContextEvent::RuntimeConnect { .. } => "api-runtime-connect".to_string(),
            ContextEvent::RuntimeMessage { .. } => "api-runtime-sendMessage".to_string(),
            ContextEvent::TabsMessage { .. } => "api-tabs-sendMessage".to_string(),
            ContextEvent::PortMessage { port_id, .. } => port_message_channel(port_id),
            ContextEvent::PortDisconnect { port_id } => port_disconnect_channel(port_id),
            ContextEvent::Alarm(_) => "api-emit-event-alarms-onAlarm".to_string(),
            ContextEvent::CookieChanged(_) => "api-emit-event-cookies-onChanged".to_string(),
            ContextEvent::Response { channel, .. } => channel.clone(),
            ContextEvent::SnapshotRequest { correlation_id } => snapshot_channel(correlation_id),
            ContextEvent::Broadcast { channel, .. } => channel.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(channel: &str, payload: Value) -> Result<Request> {
        Request::parse(&ChannelName::parse(channel).unwrap(), payload)
    }

    #[test]
    fn test_parse_storage_request() {
        let request = parse(
            "api-storage-operation-1",
            json!({"id": 4, "extensionId": "ext-a", "area": "local", "type": "get", "arg": ["k"]}),
        )
        .unwrap();

        match request {
            Request::StorageOperation(req) => {
                assert_eq!(req.id.to_string(), "4");
                assert_eq!(req.area, StorageArea::Local);
                assert_eq!(req.kind, StorageOperationKind::Get);
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_parse_extension_id_forms() {
        assert!(matches!(
            parse("get-extension-1", json!("ext-a")).unwrap(),
            Request::GetExtension { extension_id } if extension_id == "ext-a"
        ));
        assert!(matches!(
            parse("api-runtime-reload-1", json!({"extensionId": "ext-b"})).unwrap(),
            Request::RuntimeReload { extension_id } if extension_id == "ext-b"
        ));
        assert!(parse("get-extension-1", json!(42)).is_err());
    }

    #[test]
    fn test_invalid_payload_is_rejected() {
        let err = parse("api-alarms-operation-1", json!({"type": "snooze"})).unwrap_err();
        assert!(matches!(err, BusError::Serialization(_)));
    }

    #[test]
    fn test_window_object_carries_snapshot() {
        let request = parse("get-window-object-abc", json!({"x": 1})).unwrap();
        match request {
            Request::WindowObject {
                correlation_id,
                snapshot,
            } => {
                assert_eq!(correlation_id, "abc");
                assert_eq!(snapshot, json!({"x": 1}));
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn test_reply_dropped_resolves_receiver() {
        let (tx, rx) = oneshot::channel();
        drop(Reply::new(Some(tx)));
        assert!(rx.blocking_recv().is_err());
    }
}
