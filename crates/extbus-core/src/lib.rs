//! Extension Bus Core
//!
//! Cross-process message bus behind a browser's extension APIs. The host
//! process owns all extension state; background pages, tabs and popups are
//! execution contexts that talk to it over named channels.
//!
//! - [`MessageRouter`] validates and dispatches every inbound message
//! - Ports, one-shot messages, storage, alarms and cookie events are
//!   handled by dedicated components the router owns
//! - [`api::ExtensionApi`] is what a context programs against

mod alarms;
pub mod api;
mod channel;
mod config;
mod contexts;
mod cookies;
mod error;
mod host;
mod messaging;
mod ports;
mod protocol;
mod router;
mod snapshot;
mod storage;

pub use alarms::AlarmScheduler;
pub use channel::{ChannelName, ChannelScope, Operation};
pub use config::BusConfig;
pub use contexts::{ContextInfo, ContextKind, ContextTable};
pub use cookies::{
    ChangeCause, Cookie, CookieChange, CookieDetails, CookieFanout, CookieStore,
    MemoryCookieStore,
};
pub use error::{BusError, ErrorKind};
pub use host::{HeadlessHost, HostCall, HostDelegate};
pub use messaging::{Delivery, Messenger};
pub use ports::{ConnectOutcome, PortManager, PortRecord};
pub use protocol::{
    AlarmCreateInfo, BadgeTextDetails, ContextEvent, CreateProperties, Inbound, InjectDetails,
    PortDescriptor, Request,
};
pub use router::{ContextEndpoint, MessageRouter};
pub use snapshot::{BackgroundSerializer, NodeId, PruneOptions, ScopeGraph, ScopeNode, PRUNED};
pub use storage::{KeyQuery, StorageProxy, StorageReply};

pub use extbus_privacy::{Blacklist, MatchPattern};
pub use extbus_session::{
    Alarm, ContextId, ExtensionDescriptor, ExtensionRuntime, ManifestSummary, SenderDescriptor,
    SessionId, SessionRegistry, TabDescriptor, TabId, WindowId,
};
pub use extbus_storage::{MemoryBackend, SqliteBackend, StorageArea, StorageBackend, StorageScope};

pub type Result<T> = std::result::Result<T, BusError>;

/// Initialize logging. `RUST_LOG` wins over `default_filter`.
pub fn init_logging(default_filter: &str) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    fmt().with_env_filter(filter).with_target(true).init();
}
