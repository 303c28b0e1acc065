//! Extension Bus Session Registry
//!
//! Ground truth for the coordinating process:
//! - A Session is one isolated browsing profile with its own extensions,
//!   blacklist and focused window
//! - Each loaded extension is an `ExtensionRuntime` holding its background
//!   context handle and alarm records
//! - Execution contexts only ever see descriptors derived from this state

mod error;
mod extension;
mod registry;
mod session;
mod tab;

pub use error::SessionError;
pub use extension::{
    Alarm, ContentScript, ExtensionDescriptor, ExtensionRuntime, ManifestSummary,
};
pub use registry::SessionRegistry;
pub use session::Session;
pub use tab::{SenderDescriptor, TabDescriptor, TabStatus};

pub type Result<T> = std::result::Result<T, SessionError>;

/// Numeric identifier of a browsing profile
pub type SessionId = u32;

pub type TabId = u64;

pub type WindowId = u64;

/// Host-side handle of one execution context (background page, tab, popup).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct ContextId(pub u64);

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
