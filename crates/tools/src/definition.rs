//! Canonical tool names and match patterns.
//!
//! A canonical name is `service:method` or `service/subsvc:method`.
//! Patterns come in three shapes: exact names, `*` suffix wildcards
//! (`system:*`, `sys*`), and service-only patterns (`system/exec`) that
//! match every method of the service.

use agently_domain::error::{Error, Result};

/// A parsed canonical tool name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ToolName {
    pub service: String,
    pub method: String,
}

impl ToolName {
    pub fn parse(raw: &str) -> Result<Self> {
        let (service, method) = raw
            .split_once(':')
            .ok_or_else(|| Error::Validation(format!("tool name `{raw}` is missing `:`")))?;
        if service.is_empty() || method.is_empty() {
            return Err(Error::Validation(format!("malformed tool name `{raw}`")));
        }
        Ok(Self {
            service: service.to_string(),
            method: method.to_string(),
        })
    }

    pub fn canonical(&self) -> String {
        format!("{}:{}", self.service, self.method)
    }
}

impl std::fmt::Display for ToolName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.service, self.method)
    }
}

/// Normalize a loose name to canonical form. Accepts `service.method` and
/// `service/method` spellings from older agent definitions, but only when
/// the name has no canonical separator already.
pub fn canonical_name(raw: &str) -> String {
    if raw.contains(':') {
        return raw.to_string();
    }
    if let Some((service, method)) = raw.rsplit_once('.') {
        return format!("{service}:{method}");
    }
    raw.to_string()
}

/// Whether `name` matches `pattern`.
pub fn matches_pattern(name: &str, pattern: &str) -> bool {
    if pattern == name {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return name.starts_with(prefix);
    }
    // Service-only pattern: no method part means any method matches.
    if !pattern.contains(':') {
        if let Some((service, _)) = name.split_once(':') {
            return service == pattern;
        }
    }
    false
}
