//! Extension Bus Privacy
//!
//! URL match patterns (`<scheme>://<host><path>`, `<all_urls>`) and the
//! per-session blacklist built from them. Script and style injection is
//! skipped for any page whose URL matches a blacklist entry.

mod blacklist;
mod error;
mod pattern;

pub use blacklist::Blacklist;
pub use error::PatternError;
pub use pattern::MatchPattern;

pub type Result<T> = std::result::Result<T, PatternError>;
