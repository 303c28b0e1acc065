//! URL match patterns
//!
//! Grammar: `<all_urls>` or `<scheme>://<host><path>` where
//! - scheme is `*` (http, https, ws, wss) or one concrete scheme,
//! - host is `*`, `*.<domain>` (domain and its subdomains) or an exact host,
//! - path is a glob where `*` matches any run of characters, tested
//!   against the URL path plus its query string.

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::PatternError;
use crate::Result;

const ALL_URLS: &str = "<all_urls>";

/// Schemes a concrete pattern may name
const SUPPORTED_SCHEMES: &[&str] = &[
    "http",
    "https",
    "ws",
    "wss",
    "file",
    "ftp",
    "urn",
    "chrome-extension",
];

/// Schemes covered by a `*` scheme
const WILDCARD_SCHEMES: &[&str] = &["http", "https", "ws", "wss"];

/// Schemes covered by `<all_urls>`
const ALL_URL_SCHEMES: &[&str] = &["http", "https", "ws", "wss", "file", "ftp"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum SchemeMatch {
    Wildcard,
    Exact(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum HostMatch {
    Any,
    Exact(String),
    /// `*.example.com` matches `example.com` and every subdomain
    Subdomains(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum PatternKind {
    AllUrls,
    Parts {
        scheme: SchemeMatch,
        host: HostMatch,
        path: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MatchPattern {
    raw: String,
    kind: PatternKind,
}

impl MatchPattern {
    pub fn parse(pattern: &str) -> Result<Self> {
        let raw = pattern.trim().to_string();

        if raw == ALL_URLS {
            return Ok(Self {
                raw,
                kind: PatternKind::AllUrls,
            });
        }

        let (scheme, rest) = raw
            .split_once("://")
            .ok_or_else(|| PatternError::MissingScheme(raw.clone()))?;

        let scheme = match scheme {
            "*" => SchemeMatch::Wildcard,
            s if SUPPORTED_SCHEMES.contains(&s.to_lowercase().as_str()) => {
                SchemeMatch::Exact(s.to_lowercase())
            }
            _ => return Err(PatternError::InvalidScheme(raw.clone())),
        };

        let slash = rest
            .find('/')
            .ok_or_else(|| PatternError::MissingPath(raw.clone()))?;
        let (host, path) = rest.split_at(slash);

        let host = if host == "*" {
            HostMatch::Any
        } else if let Some(domain) = host.strip_prefix("*.") {
            if domain.is_empty() || domain.contains('*') {
                return Err(PatternError::InvalidHost(raw.clone()));
            }
            HostMatch::Subdomains(domain.to_lowercase())
        } else if host.contains('*') {
            return Err(PatternError::InvalidHost(raw.clone()));
        } else if host.is_empty() && scheme != SchemeMatch::Exact("file".to_string()) {
            return Err(PatternError::InvalidHost(raw.clone()));
        } else {
            HostMatch::Exact(host.to_lowercase())
        };

        let path = path.to_string();

        Ok(Self {
            raw,
            kind: PatternKind::Parts { scheme, host, path },
        })
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Unparseable URLs never match.
    pub fn matches(&self, url: &str) -> bool {
        match Url::parse(url) {
            Ok(parsed) => self.matches_url(&parsed),
            Err(_) => false,
        }
    }

    pub fn matches_url(&self, url: &Url) -> bool {
        match &self.kind {
            PatternKind::AllUrls => ALL_URL_SCHEMES.contains(&url.scheme()),
            PatternKind::Parts { scheme, host, path } => {
                let scheme_ok = match scheme {
                    SchemeMatch::Wildcard => WILDCARD_SCHEMES.contains(&url.scheme()),
                    SchemeMatch::Exact(s) => s == url.scheme(),
                };
                if !scheme_ok {
                    return false;
                }

                let url_host = url.host_str().unwrap_or("").to_lowercase();
                let host_ok = match host {
                    HostMatch::Any => true,
                    HostMatch::Exact(h) => *h == url_host,
                    HostMatch::Subdomains(domain) => {
                        url_host == *domain || url_host.ends_with(&format!(".{domain}"))
                    }
                };
                if !host_ok {
                    return false;
                }

                let target = match url.query() {
                    Some(query) => format!("{}?{}", url.path(), query),
                    None => url.path().to_string(),
                };
                glob_match(path, &target)
            }
        }
    }
}

/// `*`-only glob matching with single-star backtracking.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p = pattern.as_bytes();
    let t = text.as_bytes();

    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<usize> = None;
    let mut resume = 0;

    while ti < t.len() {
        if pi < p.len() && p[pi] == b'*' {
            star = Some(pi);
            pi += 1;
            resume = ti;
        } else if pi < p.len() && p[pi] == t[ti] {
            pi += 1;
            ti += 1;
        } else if let Some(star_pos) = star {
            pi = star_pos + 1;
            resume += 1;
            ti = resume;
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == b'*' {
        pi += 1;
    }

    pi == p.len()
}

impl std::str::FromStr for MatchPattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for MatchPattern {
    type Error = PatternError;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<MatchPattern> for String {
    fn from(pattern: MatchPattern) -> Self {
        pattern.raw
    }
}

impl std::fmt::Display for MatchPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.raw)
    }
}
