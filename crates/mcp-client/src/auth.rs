//! Cookie jars for downstream MCP servers.
//!
//! One shared jar per user, persisted at
//! `<stateRoot>/mcp/bff/<user>/cookies.json`. Legacy per-server jars at
//! `<stateRoot>/mcp/<server>/<user>/cookies.json` can be warmed into the
//! shared jar. Cookies attach only to HTTPS requests whose host matches
//! the jar entry (authority matching).

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;

/// host → cookie name → value.
type CookieMap = HashMap<String, HashMap<String, String>>;

pub struct CookieJar {
    path: PathBuf,
    cookies: RwLock<CookieMap>,
}

impl CookieJar {
    /// Shared per-user jar path.
    pub fn shared_path(state_root: &Path, user: &str) -> PathBuf {
        state_root.join("mcp").join("bff").join(user).join("cookies.json")
    }

    /// Legacy per-server jar path.
    pub fn legacy_path(state_root: &Path, server: &str, user: &str) -> PathBuf {
        state_root.join("mcp").join(server).join(user).join("cookies.json")
    }

    /// Load a jar from disk; a missing file yields an empty jar.
    pub fn load(path: PathBuf) -> Self {
        let cookies = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<CookieMap>(&raw).ok())
            .unwrap_or_default();
        Self {
            path,
            cookies: RwLock::new(cookies),
        }
    }

    /// Store a cookie and persist the jar.
    pub fn set(&self, host: &str, name: &str, value: &str) {
        {
            let mut cookies = self.cookies.write();
            cookies
                .entry(host.to_string())
                .or_default()
                .insert(name.to_string(), value.to_string());
        }
        self.save();
    }

    /// Absorb `Set-Cookie` header values for a host. Attributes after the
    /// first `name=value` pair are ignored.
    pub fn absorb_set_cookie(&self, host: &str, header_values: &[String]) {
        if header_values.is_empty() {
            return;
        }
        {
            let mut cookies = self.cookies.write();
            let entry = cookies.entry(host.to_string()).or_default();
            for raw in header_values {
                let pair = raw.split(';').next().unwrap_or_default();
                if let Some((name, value)) = pair.split_once('=') {
                    entry.insert(name.trim().to_string(), value.trim().to_string());
                }
            }
        }
        self.save();
    }

    /// The `Cookie` header value for a host, if any cookies are stored.
    pub fn header_for(&self, host: &str) -> Option<String> {
        let cookies = self.cookies.read();
        let entry = cookies.get(host)?;
        if entry.is_empty() {
            return None;
        }
        let mut pairs: Vec<String> = entry.iter().map(|(n, v)| format!("{n}={v}")).collect();
        pairs.sort();
        Some(pairs.join("; "))
    }

    /// Merge another jar's cookies into this one (existing values win).
    pub fn warm_from(&self, legacy: &CookieJar) {
        {
            let other = legacy.cookies.read();
            let mut cookies = self.cookies.write();
            for (host, entries) in other.iter() {
                let target = cookies.entry(host.clone()).or_default();
                for (name, value) in entries {
                    target.entry(name.clone()).or_insert_with(|| value.clone());
                }
            }
        }
        self.save();
    }

    fn save(&self) {
        let snapshot = self.cookies.read().clone();
        if let Some(parent) = self.path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                tracing::warn!(error = %e, path = %self.path.display(), "cannot create jar dir");
                return;
            }
        }
        match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => {
                if let Err(e) = std::fs::write(&self.path, json) {
                    tracing::warn!(error = %e, path = %self.path.display(), "cookie jar write failed");
                }
            }
            Err(e) => tracing::warn!(error = %e, "cookie jar serialization failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_header_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let jar = CookieJar::load(dir.path().join("cookies.json"));
        jar.set("mcp.example.com", "session", "abc");
        jar.set("mcp.example.com", "csrf", "xyz");

        assert_eq!(
            jar.header_for("mcp.example.com").as_deref(),
            Some("csrf=xyz; session=abc")
        );
        assert!(jar.header_for("other.example.com").is_none());
    }

    #[test]
    fn persists_across_loads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.json");
        CookieJar::load(path.clone()).set("host-a", "k", "v");

        let reloaded = CookieJar::load(path);
        assert_eq!(reloaded.header_for("host-a").as_deref(), Some("k=v"));
    }

    #[test]
    fn absorb_set_cookie_strips_attributes() {
        let dir = tempfile::tempdir().unwrap();
        let jar = CookieJar::load(dir.path().join("cookies.json"));
        jar.absorb_set_cookie(
            "api.example.com",
            &["sid=s1; Path=/; HttpOnly; Secure".to_string()],
        );
        assert_eq!(jar.header_for("api.example.com").as_deref(), Some("sid=s1"));
    }

    #[test]
    fn warm_from_keeps_existing_values() {
        let dir = tempfile::tempdir().unwrap();
        let shared = CookieJar::load(dir.path().join("shared.json"));
        shared.set("host", "sid", "fresh");

        let legacy = CookieJar::load(dir.path().join("legacy.json"));
        legacy.set("host", "sid", "stale");
        legacy.set("host", "extra", "kept");

        shared.warm_from(&legacy);
        let header = shared.header_for("host").unwrap();
        assert!(header.contains("sid=fresh"));
        assert!(header.contains("extra=kept"));
    }

    #[test]
    fn jar_paths_follow_state_layout() {
        let root = Path::new("/var/agently/state");
        assert_eq!(
            CookieJar::shared_path(root, "alice"),
            PathBuf::from("/var/agently/state/mcp/bff/alice/cookies.json")
        );
        assert_eq!(
            CookieJar::legacy_path(root, "search", "alice"),
            PathBuf::from("/var/agently/state/mcp/search/alice/cookies.json")
        );
    }
}
