//! Per-(user, conversation, server) client lifecycle.
//!
//! Lookup is lazy: the first use of a key constructs the client (handshake
//! included); construction is coalesced through a per-key `OnceCell` so a
//! key never gets two underlying sessions. Every lookup touches the entry;
//! a background reaper running at `ttl/2` evicts entries idle longer than
//! the ttl and closes their transports.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use uuid::Uuid;

use agently_domain::error::Result;

use crate::auth::CookieJar;
use crate::client::McpClient;
use crate::config::McpServerConfig;
use crate::transport::ServerRequestHandler;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Key and entry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub user: String,
    pub conversation_id: Uuid,
    pub server: String,
}

struct Entry {
    cell: Arc<OnceCell<Arc<McpClient>>>,
    last_used: Instant,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Manager
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct McpClientManager {
    entries: Mutex<HashMap<ClientKey, Entry>>,
    jars: Mutex<HashMap<String, Arc<CookieJar>>>,
    state_root: PathBuf,
    ttl: Duration,
    /// Warm legacy per-server jars into the shared per-user jar.
    anonymous_scope: bool,
}

impl McpClientManager {
    pub fn new(state_root: PathBuf, ttl: Duration, anonymous_scope: bool) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            jars: Mutex::new(HashMap::new()),
            state_root,
            ttl,
            anonymous_scope,
        }
    }

    /// Get the live client for a key, constructing it on first use.
    /// Construction for the same key is coalesced; concurrent callers
    /// share the single session being built.
    pub async fn get_or_create(
        &self,
        key: ClientKey,
        config: &McpServerConfig,
        bearer: Option<String>,
        handler: Option<Arc<dyn ServerRequestHandler>>,
    ) -> Result<Arc<McpClient>> {
        let cell = {
            let mut entries = self.entries.lock();
            let entry = entries.entry(key.clone()).or_insert_with(|| Entry {
                cell: Arc::new(OnceCell::new()),
                last_used: Instant::now(),
            });
            entry.last_used = Instant::now();
            entry.cell.clone()
        };

        let jar = self.jar_for(&key.user, &key.server);
        let client = cell
            .get_or_try_init(|| async {
                McpClient::connect(config, Some(jar), bearer, handler)
                    .await
                    .map(Arc::new)
            })
            .await?;
        Ok(client.clone())
    }

    /// The shared per-user cookie jar, created (and optionally warmed from
    /// the legacy per-server jar) on first use.
    fn jar_for(&self, user: &str, server: &str) -> Arc<CookieJar> {
        let mut jars = self.jars.lock();
        if let Some(jar) = jars.get(user) {
            return jar.clone();
        }
        let jar = Arc::new(CookieJar::load(CookieJar::shared_path(
            &self.state_root,
            user,
        )));
        if self.anonymous_scope {
            let legacy_path = CookieJar::legacy_path(&self.state_root, server, user);
            if legacy_path.exists() {
                jar.warm_from(&CookieJar::load(legacy_path));
            }
        }
        jars.insert(user.to_string(), jar.clone());
        jar
    }

    /// Number of live entries (for introspection).
    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Evict entries idle longer than the ttl, closing their transports.
    /// Returns the number of evicted entries.
    pub async fn reap_idle(&self) -> usize {
        let expired: Vec<(ClientKey, Arc<OnceCell<Arc<McpClient>>>)> = {
            let mut entries = self.entries.lock();
            let dead: Vec<ClientKey> = entries
                .iter()
                .filter(|(_, e)| e.last_used.elapsed() > self.ttl)
                .map(|(k, _)| k.clone())
                .collect();
            dead.into_iter()
                .filter_map(|k| entries.remove(&k).map(|e| (k, e.cell)))
                .collect()
        };

        let count = expired.len();
        for (key, cell) in expired {
            if let Some(client) = cell.get() {
                tracing::info!(
                    user = %key.user,
                    conversation = %key.conversation_id,
                    server = %key.server,
                    "reaping idle MCP client"
                );
                client.shutdown().await;
            }
        }
        count
    }

    /// Spawn the background reaper. Runs until the manager is dropped by
    /// every other holder.
    pub fn spawn_reaper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let period = self.ttl / 2;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(period.max(Duration::from_secs(1)));
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tick.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let reaped = manager.reap_idle().await;
                if reaped > 0 {
                    tracing::debug!(reaped, "MCP client reaper pass");
                }
            }
        })
    }

    /// Close everything (server shutdown path).
    pub async fn shutdown_all(&self) {
        let cells: Vec<Arc<OnceCell<Arc<McpClient>>>> = {
            let mut entries = self.entries.lock();
            entries.drain().map(|(_, e)| e.cell).collect()
        };
        for cell in cells {
            if let Some(client) = cell.get() {
                client.shutdown().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(ttl: Duration) -> McpClientManager {
        let dir = tempfile::tempdir().unwrap();
        McpClientManager::new(dir.path().to_path_buf(), ttl, false)
    }

    #[test]
    fn jar_is_shared_per_user() {
        let manager = manager(Duration::from_secs(60));
        let a = manager.jar_for("alice", "server-1");
        let b = manager.jar_for("alice", "server-2");
        assert!(Arc::ptr_eq(&a, &b));

        let c = manager.jar_for("bob", "server-1");
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn reap_removes_idle_uninitialized_entries() {
        let manager = manager(Duration::from_millis(10));
        {
            let mut entries = manager.entries.lock();
            entries.insert(
                ClientKey {
                    user: "alice".into(),
                    conversation_id: Uuid::new_v4(),
                    server: "s".into(),
                },
                Entry {
                    cell: Arc::new(OnceCell::new()),
                    last_used: Instant::now() - Duration::from_secs(1),
                },
            );
        }
        assert_eq!(manager.entry_count(), 1);
        assert_eq!(manager.reap_idle().await, 1);
        assert_eq!(manager.entry_count(), 0);
    }

    #[tokio::test]
    async fn fresh_entries_survive_reaping() {
        let manager = manager(Duration::from_secs(60));
        {
            let mut entries = manager.entries.lock();
            entries.insert(
                ClientKey {
                    user: "alice".into(),
                    conversation_id: Uuid::new_v4(),
                    server: "s".into(),
                },
                Entry {
                    cell: Arc::new(OnceCell::new()),
                    last_used: Instant::now(),
                },
            );
        }
        assert_eq!(manager.reap_idle().await, 0);
        assert_eq!(manager.entry_count(), 1);
    }
}
