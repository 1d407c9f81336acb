#![no_std]

//! Portico Common Types
//!
//! Resource identity, event kinds and the host/path matching rules shared by
//! the reconciler (which builds routes) and the proxy (which matches them).
//! Kept free of runtime dependencies so both sides agree on one definition.

extern crate alloc;

use alloc::string::{String, ToString};
use alloc::format;
use core::fmt;

/// Maximum hostname length (DNS-1123 subdomain)
pub const MAX_HOSTNAME_LEN: usize = 253;

/// Maximum length of a single DNS label
pub const MAX_LABEL_LEN: usize = 63;

/// Identity of a namespaced routing-intent resource (`namespace/name`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ResourceKey {
    pub namespace: String,
    pub name: String,
}

impl ResourceKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// Parse a `namespace/name` key. A bare `name` is cluster-scoped
    /// (empty namespace). Returns None for empty names or extra separators.
    pub fn parse(key: &str) -> Option<Self> {
        let mut parts = key.split('/');
        let first = parts.next()?;
        match (parts.next(), parts.next()) {
            (None, _) if !first.is_empty() => Some(Self::new("", first)),
            (Some(name), None) if !name.is_empty() => Some(Self::new(first, name)),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

/// Kind of change observed on a routing-intent resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum EventKind {
    Add,
    Update,
    Delete,
}

impl EventKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            EventKind::Add => "add",
            EventKind::Update => "update",
            EventKind::Delete => "delete",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a rule path is compared against the request path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PathMatch {
    /// Request path must equal the rule path
    Exact,
    /// Element-wise prefix: `/api` matches `/api` and `/api/x`, not `/apix`
    Prefix,
}

/// Specificity class of a route host, most specific first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HostKind {
    Exact,
    Wildcard,
    /// Rule without a host: matches every request host
    Any,
}

impl HostKind {
    pub fn of(host: &str) -> Self {
        if host.is_empty() {
            HostKind::Any
        } else if host.split('.').any(|label| label == "*") {
            HostKind::Wildcard
        } else {
            HostKind::Exact
        }
    }
}

/// Normalize a Host header or SNI value for table lookups
///
/// Lowercases, strips a `:port` suffix (IPv6 literals keep their brackets)
/// and drops a trailing root dot.
pub fn normalize_host(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_port = if trimmed.starts_with('[') {
        match trimmed.find(']') {
            Some(end) => &trimmed[..=end],
            None => trimmed,
        }
    } else {
        match trimmed.rsplit_once(':') {
            Some((host, port)) if port.bytes().all(|b| b.is_ascii_digit()) => host,
            _ => trimmed,
        }
    };
    without_port.trim_end_matches('.').to_ascii_lowercase()
}

/// Match a route host pattern against a normalized request host
///
/// A `*` label matches exactly one non-empty label, so `*.example.com`
/// matches `a.example.com` but neither `example.com` nor `a.b.example.com`.
/// An empty pattern matches any host.
pub fn host_matches(pattern: &str, host: &str) -> bool {
    if pattern.is_empty() {
        return true;
    }
    let mut pattern_labels = pattern.split('.');
    let mut host_labels = host.split('.');
    loop {
        match (pattern_labels.next(), host_labels.next()) {
            (None, None) => return true,
            (Some("*"), Some(label)) if !label.is_empty() => continue,
            (Some(expected), Some(label)) if expected == label => continue,
            _ => return false,
        }
    }
}

/// Match a rule path against the request path
pub fn path_matches(kind: PathMatch, rule_path: &str, request_path: &str) -> bool {
    match kind {
        PathMatch::Exact => rule_path == request_path,
        PathMatch::Prefix => {
            let prefix = rule_path.trim_end_matches('/');
            if prefix.is_empty() {
                return true;
            }
            match request_path.strip_prefix(prefix) {
                Some(rest) => rest.is_empty() || rest.starts_with('/'),
                None => false,
            }
        }
    }
}

/// Length used to order routes longest-prefix-first
pub fn path_specificity(rule_path: &str) -> usize {
    let trimmed = rule_path.trim_end_matches('/');
    if trimmed.is_empty() {
        0
    } else {
        trimmed.len()
    }
}

/// Validate a rule path
///
/// Rules:
/// - Must start with "/"
/// - Must not contain "//"
/// - Must not contain whitespace or control characters
pub fn validate_path(path: &str) -> Result<(), String> {
    if path.is_empty() {
        return Err("Path cannot be empty".to_string());
    }

    if !path.starts_with('/') {
        return Err(format!("Path '{}' must start with '/'", path));
    }

    if path.contains("//") {
        return Err(format!("Path '{}' cannot contain double slashes", path));
    }

    if path.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(format!("Path '{}' contains whitespace or control characters", path));
    }

    Ok(())
}

/// Validate a rule host according to DNS-1123 subdomain rules
///
/// Rules:
/// - Lowercase alphanumeric characters, hyphens, and dots only
/// - Labels must not start or end with hyphen, at most 63 characters
/// - May start with a single wildcard label "*."
/// - Max length 253 characters
pub fn validate_hostname(hostname: &str) -> Result<(), String> {
    if hostname.is_empty() {
        return Err("Hostname cannot be empty".to_string());
    }

    if hostname.len() > MAX_HOSTNAME_LEN {
        return Err(format!("Hostname '{}' exceeds 253 characters", hostname));
    }

    let hostname_to_check = hostname.strip_prefix("*.").unwrap_or(hostname);

    if hostname_to_check.is_empty() {
        return Err("Hostname cannot be just '*.'".to_string());
    }

    for label in hostname_to_check.split('.') {
        if label.is_empty() {
            return Err(format!("Hostname '{}' contains an empty label", hostname));
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(format!("Hostname label '{}' exceeds 63 characters", label));
        }
        if label.starts_with('-') {
            return Err(format!("Hostname label '{}' cannot start with '-'", label));
        }
        if label.ends_with('-') {
            return Err(format!("Hostname label '{}' cannot end with '-'", label));
        }
        for c in label.chars() {
            if !c.is_ascii_lowercase() && !c.is_ascii_digit() && c != '-' {
                return Err(format!(
                    "Hostname '{}' contains invalid character '{}' (must be lowercase alphanumeric or hyphen)",
                    hostname, c
                ));
            }
        }
    }

    Ok(())
}
