//! Channel names
//!
//! Every inbound message arrives on a named channel of the form
//! `<operation>-<scope>`. For session-scoped operations the scope is the
//! numeric session id. Background snapshot replies use a one-off
//! correlation id instead.

use extbus_session::SessionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    GetExtension,
    GetExtensions,
    GetExtensionsContent,
    GetBlacklist,
    CurrentTab,
    TabsQuery,
    TabsCreate,
    TabsInsertCss,
    TabsExecuteScript,
    TabsSendMessage,
    RuntimeReload,
    RuntimeConnect,
    RuntimeSendMessage,
    RuntimeGetBackgroundPage,
    PortPostMessage,
    PortDisconnect,
    StorageOperation,
    AlarmsOperation,
    SetBadgeText,
    CookiesGetAll,
    CookiesSet,
    CookiesRemove,
    AddListener,
    RemoveListener,
    SendToAllExtensions,
    SendToContext,
    WindowObject,
}

impl Operation {
    pub const ALL: [Operation; 27] = [
        Operation::GetExtension,
        Operation::GetExtensions,
        Operation::GetExtensionsContent,
        Operation::GetBlacklist,
        Operation::CurrentTab,
        Operation::TabsQuery,
        Operation::TabsCreate,
        Operation::TabsInsertCss,
        Operation::TabsExecuteScript,
        Operation::TabsSendMessage,
        Operation::RuntimeReload,
        Operation::RuntimeConnect,
        Operation::RuntimeSendMessage,
        Operation::RuntimeGetBackgroundPage,
        Operation::PortPostMessage,
        Operation::PortDisconnect,
        Operation::StorageOperation,
        Operation::AlarmsOperation,
        Operation::SetBadgeText,
        Operation::CookiesGetAll,
        Operation::CookiesSet,
        Operation::CookiesRemove,
        Operation::AddListener,
        Operation::RemoveListener,
        Operation::SendToAllExtensions,
        Operation::SendToContext,
        Operation::WindowObject,
    ];

    pub fn prefix(&self) -> &'static str {
        match self {
            Operation::GetExtension => "get-extension",
            Operation::GetExtensions => "get-extensions",
            Operation::GetExtensionsContent => "get-extensions-content",
            Operation::GetBlacklist => "get-blacklist",
            Operation::CurrentTab => "current-webcontents-to-tab",
            Operation::TabsQuery => "api-tabs-query",
            Operation::TabsCreate => "api-tabs-create",
            Operation::TabsInsertCss => "api-tabs-insertCSS",
            Operation::TabsExecuteScript => "api-tabs-executeScript",
            Operation::TabsSendMessage => "api-tabs-sendMessage",
            Operation::RuntimeReload => "api-runtime-reload",
            Operation::RuntimeConnect => "api-runtime-connect",
            Operation::RuntimeSendMessage => "api-runtime-sendMessage",
            Operation::RuntimeGetBackgroundPage => "api-runtime-getBackgroundPage",
            Operation::PortPostMessage => "api-port-postMessage",
            Operation::PortDisconnect => "api-port-disconnect",
            Operation::StorageOperation => "api-storage-operation",
            Operation::AlarmsOperation => "api-alarms-operation",
            Operation::SetBadgeText => "api-browserAction-setBadgeText",
            Operation::CookiesGetAll => "api-cookies-getAll",
            Operation::CookiesSet => "api-cookies-set",
            Operation::CookiesRemove => "api-cookies-remove",
            Operation::AddListener => "api-addListener",
            Operation::RemoveListener => "api-removeListener",
            Operation::SendToAllExtensions => "send-to-all-extensions",
            Operation::SendToContext => "send-msg-webcontents",
            Operation::WindowObject => "get-window-object",
        }
    }

    pub fn from_prefix(prefix: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|op| op.prefix() == prefix)
    }

    /// Whether the channel suffix is a correlation id rather than a session id
    pub fn is_correlated(&self) -> bool {
        matches!(self, Operation::WindowObject)
    }

    /// Channel name for this operation in `session_id`
    pub fn channel(&self, session_id: SessionId) -> String {
        format!("{}-{}", self.prefix(), session_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelScope {
    Session(SessionId),
    Correlation(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelName {
    pub operation: Operation,
    pub scope: ChannelScope,
}

impl ChannelName {
    /// Split a channel name into operation and scope. Unknown operations
    /// and malformed session suffixes yield `None`.
    pub fn parse(name: &str) -> Option<Self> {
        let (prefix, suffix) = name.rsplit_once('-')?;
        let operation = Operation::from_prefix(prefix)?;

        let scope = if operation.is_correlated() {
            if suffix.is_empty() {
                return None;
            }
            ChannelScope::Correlation(suffix.to_string())
        } else {
            ChannelScope::Session(suffix.parse().ok()?)
        };

        Some(Self { operation, scope })
    }
}

impl std::fmt::Display for ChannelName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.scope {
            ChannelScope::Session(id) => write!(f, "{}-{}", self.operation.prefix(), id),
            ChannelScope::Correlation(id) => write!(f, "{}-{}", self.operation.prefix(), id),
        }
    }
}

/// Channel a `runtime.sendMessage` / `tabs.sendMessage` answer is delivered on
pub fn message_response_channel(operation: Operation, port_id: &str) -> String {
    format!("{}-response-{}", operation.prefix(), port_id)
}

/// Channel a storage reply is delivered on
pub fn storage_response_channel(request_id: &str) -> String {
    format!("{}-{}", Operation::StorageOperation.prefix(), request_id)
}

/// Channel a `tabs.create` reply is delivered on
pub fn tabs_create_response_channel(response_id: &str) -> String {
    format!("{}-{}", Operation::TabsCreate.prefix(), response_id)
}

/// Channel a background page answers a snapshot request on
pub fn snapshot_channel(correlation_id: &str) -> String {
    format!("{}-{}", Operation::WindowObject.prefix(), correlation_id)
}

pub fn port_message_channel(port_id: &str) -> String {
    format!("{}-{}", Operation::PortPostMessage.prefix(), port_id)
}

pub fn port_disconnect_channel(port_id: &str) -> String {
    format!("{}-{}", Operation::PortDisconnect.prefix(), port_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_session_channels() {
        let name = ChannelName::parse("api-tabs-create-3").unwrap();
        assert_eq!(name.operation, Operation::TabsCreate);
        assert_eq!(name.scope, ChannelScope::Session(3));

        let name = ChannelName::parse("get-extensions-content-12").unwrap();
        assert_eq!(name.operation, Operation::GetExtensionsContent);

        let name = ChannelName::parse("get-extensions-12").unwrap();
        assert_eq!(name.operation, Operation::GetExtensions);

        let name = ChannelName::parse("get-extension-0").unwrap();
        assert_eq!(name.operation, Operation::GetExtension);
    }

    #[test]
    fn test_parse_correlated_channel() {
        let name = ChannelName::parse("get-window-object-a1b2c3").unwrap();
        assert_eq!(name.operation, Operation::WindowObject);
        assert_eq!(name.scope, ChannelScope::Correlation("a1b2c3".to_string()));
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert!(ChannelName::parse("api-tabs-frobnicate-1").is_none());
        assert!(ChannelName::parse("api-tabs-query-x").is_none());
        assert!(ChannelName::parse("nodash").is_none());
    }

    #[test]
    fn test_channel_roundtrip() {
        for op in Operation::ALL.iter().filter(|op| !op.is_correlated()) {
            let parsed = ChannelName::parse(&op.channel(7)).unwrap();
            assert_eq!(parsed.operation, *op);
            assert_eq!(parsed.to_string(), op.channel(7));
        }
    }

    #[test]
    fn test_response_channels() {
        assert_eq!(
            message_response_channel(Operation::RuntimeSendMessage, "p1"),
            "api-runtime-sendMessage-response-p1"
        );
        assert_eq!(storage_response_channel("9"), "api-storage-operation-9");
        assert_eq!(snapshot_channel("abc"), "get-window-object-abc");
    }
}
