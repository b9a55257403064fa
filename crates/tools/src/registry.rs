//! The unified tool catalogue.
//!
//! Three sources feed the registry: virtual agent tools, internal
//! services, and remote MCP tools. All of them register a
//! [`ToolHandler`]; the source tag is kept for capability checks and
//! timeout floors. The registry is read-mostly after startup; remote MCP
//! definitions are merged in per conversation by the gateway proxy.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use uuid::Uuid;

use agently_domain::chat::ToolDefinition;
use agently_domain::error::{Error, Result};
use agently_domain::model::ElicitationOutcome;

use crate::convert::enrich_schema;
use crate::definition::matches_pattern;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execution context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Raises an elicitation toward the user and waits for the outcome.
/// Implemented by the gateway; tools reach it through [`ToolContext`].
#[async_trait]
pub trait Elicitor: Send + Sync {
    /// Raise an elicitation. Tool-originated elicitations carry the
    /// server's numeric JSON-RPC id so resolution can address either
    /// identifier; `url` routes the user through an out-of-band flow.
    async fn elicit_keyed(
        &self,
        message: Option<String>,
        requested_schema: Value,
        rpc_id: Option<i64>,
        url: Option<String>,
    ) -> Result<ElicitationOutcome>;

    async fn elicit(
        &self,
        message: Option<String>,
        requested_schema: Value,
    ) -> Result<ElicitationOutcome> {
        self.elicit_keyed(message, requested_schema, None, None).await
    }
}

/// Per-invocation context handed to tool handlers.
#[derive(Clone)]
pub struct ToolContext {
    pub conversation_id: Uuid,
    pub turn_id: Uuid,
    pub user_subject: String,
    /// Caller-supplied timeout override.
    pub timeout: Option<Duration>,
    /// Bearer token resolved from the originating request, reusable only
    /// toward HTTPS downstreams.
    pub bearer: Option<String>,
    /// Elicitation channel, when the surrounding turn supports one.
    pub elicitor: Option<Arc<dyn Elicitor>>,
}

impl ToolContext {
    pub fn new(conversation_id: Uuid, turn_id: Uuid, user_subject: impl Into<String>) -> Self {
        Self {
            conversation_id,
            turn_id,
            user_subject: user_subject.into(),
            timeout: None,
            bearer: None,
            elicitor: None,
        }
    }

    /// Raise an elicitation, erroring when the surrounding surface has no
    /// way to reach the user.
    pub async fn elicit(
        &self,
        message: Option<String>,
        requested_schema: Value,
    ) -> Result<ElicitationOutcome> {
        match &self.elicitor {
            Some(elicitor) => elicitor.elicit(message, requested_schema).await,
            None => Err(Error::Elicitation(
                "no elicitation channel available in this context".into(),
            )),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Handler and output
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// What a tool produced. Serialization rules: strings verbatim, bytes as
/// UTF-8, anything else as JSON.
#[derive(Debug, Clone)]
pub enum ToolOutput {
    Text(String),
    Bytes(Vec<u8>),
    Json(Value),
}

impl ToolOutput {
    pub fn serialize(&self) -> String {
        match self {
            ToolOutput::Text(s) => s.clone(),
            ToolOutput::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            ToolOutput::Json(Value::String(s)) => s.clone(),
            ToolOutput::Json(v) => v.to_string(),
        }
    }
}

/// Common invoke capability across all tool sources.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn invoke(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutput>;
}

/// Where a tool came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolSourceKind {
    VirtualAgent,
    Internal,
    RemoteMcp,
}

#[derive(Clone)]
pub struct ToolEntry {
    pub definition: ToolDefinition,
    pub source: ToolSourceKind,
    pub handler: Arc<dyn ToolHandler>,
    /// Static per-tool timeout declared at registration.
    pub timeout: Option<Duration>,
    /// Whether concurrent execution with other tools is safe.
    pub parallel_safe: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Registry
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Floor defaults for well-known services.
const VIRTUAL_AGENT_FLOOR: Duration = Duration::from_secs(5 * 60);
const AGENT_RUNNER_FLOOR: Duration = Duration::from_secs(30 * 60);

#[derive(Default)]
pub struct ToolRegistry {
    entries: RwLock<BTreeMap<String, ToolEntry>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a tool under its canonical name.
    pub fn register(&self, entry: ToolEntry) {
        let name = entry.definition.name.clone();
        self.entries.write().insert(name, entry);
    }

    pub fn unregister(&self, name: &str) -> bool {
        self.entries.write().remove(name).is_some()
    }

    pub fn get(&self, name: &str) -> Option<ToolEntry> {
        self.entries.read().get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Deterministic catalogue: sorted by canonical name. With `enrich`,
    /// object/array properties gain empty defaults for UI consumers.
    pub fn list(&self, enrich: bool) -> Vec<ToolDefinition> {
        self.entries
            .read()
            .values()
            .map(|entry| {
                let mut def = entry.definition.clone();
                if enrich {
                    enrich_schema(&mut def.input_schema);
                }
                def
            })
            .collect()
    }

    /// Catalogue entries matching a pattern (exact, `*` suffix, or
    /// service-only).
    pub fn matching(&self, pattern: &str) -> Vec<ToolDefinition> {
        self.entries
            .read()
            .values()
            .filter(|entry| matches_pattern(&entry.definition.name, pattern))
            .map(|entry| entry.definition.clone())
            .collect()
    }

    /// Whether every named tool is safe to run concurrently.
    pub fn all_parallel_safe(&self, names: &[&str]) -> bool {
        let entries = self.entries.read();
        names.iter().all(|name| {
            entries
                .get(*name)
                .map(|entry| entry.parallel_safe)
                .unwrap_or(false)
        })
    }

    /// Effective timeout: caller override, then the tool's static
    /// timeout, then the well-known service floor, then the default.
    pub fn resolve_timeout(
        &self,
        name: &str,
        caller_override: Option<Duration>,
        default: Duration,
    ) -> Duration {
        if let Some(explicit) = caller_override {
            return explicit;
        }
        let entry = self.get(name);
        if let Some(static_timeout) = entry.as_ref().and_then(|e| e.timeout) {
            return static_timeout;
        }
        if name == "agent:run" {
            return AGENT_RUNNER_FLOOR.max(default);
        }
        if entry.map(|e| e.source) == Some(ToolSourceKind::VirtualAgent) {
            return VIRTUAL_AGENT_FLOOR.max(default);
        }
        default
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct StaticHandler(&'static str);

    #[async_trait]
    impl ToolHandler for StaticHandler {
        async fn invoke(&self, _ctx: &ToolContext, _args: Value) -> Result<ToolOutput> {
            Ok(ToolOutput::Text(self.0.to_string()))
        }
    }

    fn entry(name: &str, source: ToolSourceKind) -> ToolEntry {
        ToolEntry {
            definition: ToolDefinition {
                name: name.to_string(),
                description: format!("{name} tool"),
                input_schema: json!({ "type": "object", "properties": { "ctx": { "type": "object" } } }),
                output_schema: None,
                tags: Vec::new(),
            },
            source,
            handler: Arc::new(StaticHandler("ok")),
            timeout: None,
            parallel_safe: source != ToolSourceKind::VirtualAgent,
        }
    }

    #[test]
    fn list_is_sorted_and_deterministic() {
        let registry = ToolRegistry::new();
        registry.register(entry("zeta:last", ToolSourceKind::Internal));
        registry.register(entry("alpha:first", ToolSourceKind::Internal));
        registry.register(entry("math:add", ToolSourceKind::Internal));

        let names: Vec<String> = registry.list(false).into_iter().map(|d| d.name).collect();
        assert_eq!(names, vec!["alpha:first", "math:add", "zeta:last"]);
    }

    #[test]
    fn enriched_list_injects_container_defaults() {
        let registry = ToolRegistry::new();
        registry.register(entry("math:add", ToolSourceKind::Internal));

        let plain = registry.list(false);
        assert!(plain[0].input_schema["properties"]["ctx"].get("default").is_none());

        let enriched = registry.list(true);
        assert_eq!(enriched[0].input_schema["properties"]["ctx"]["default"], json!({}));
    }

    #[test]
    fn matching_patterns() {
        let registry = ToolRegistry::new();
        registry.register(entry("system/exec:run", ToolSourceKind::Internal));
        registry.register(entry("system/exec:kill", ToolSourceKind::Internal));
        registry.register(entry("math:add", ToolSourceKind::Internal));

        assert_eq!(registry.matching("math:add").len(), 1);
        assert_eq!(registry.matching("system/exec").len(), 2);
        assert_eq!(registry.matching("system*").len(), 2);
        assert!(registry.matching("web:fetch").is_empty());
    }

    #[test]
    fn parallel_capability_requires_every_tool() {
        let registry = ToolRegistry::new();
        registry.register(entry("math:add", ToolSourceKind::Internal));
        registry.register(entry("agent:helper", ToolSourceKind::VirtualAgent));

        assert!(registry.all_parallel_safe(&["math:add"]));
        assert!(!registry.all_parallel_safe(&["math:add", "agent:helper"]));
        assert!(!registry.all_parallel_safe(&["math:add", "missing:tool"]));
    }

    #[test]
    fn timeout_resolution_order() {
        let registry = ToolRegistry::new();
        let mut slow = entry("slow:tool", ToolSourceKind::Internal);
        slow.timeout = Some(Duration::from_secs(42));
        registry.register(slow);
        registry.register(entry("agent:helper", ToolSourceKind::VirtualAgent));
        registry.register(entry("agent:run", ToolSourceKind::Internal));

        let default = Duration::from_secs(300);
        assert_eq!(
            registry.resolve_timeout("slow:tool", None, default),
            Duration::from_secs(42)
        );
        assert_eq!(
            registry.resolve_timeout("slow:tool", Some(Duration::from_secs(5)), default),
            Duration::from_secs(5)
        );
        assert_eq!(
            registry.resolve_timeout("agent:helper", None, default),
            Duration::from_secs(300)
        );
        assert_eq!(
            registry.resolve_timeout("agent:run", None, default),
            Duration::from_secs(30 * 60)
        );
        assert_eq!(registry.resolve_timeout("math:add", None, default), default);
    }

    #[tokio::test]
    async fn context_without_elicitor_errors() {
        let ctx = ToolContext::new(Uuid::new_v4(), Uuid::new_v4(), "alice");
        let err = ctx.elicit(None, json!({"type": "object"})).await.unwrap_err();
        assert!(matches!(err, Error::Elicitation(_)));
    }

    #[test]
    fn output_serialization_rules() {
        assert_eq!(ToolOutput::Text("as-is".into()).serialize(), "as-is");
        assert_eq!(ToolOutput::Bytes(b"raw".to_vec()).serialize(), "raw");
        assert_eq!(ToolOutput::Json(json!("quoted")).serialize(), "quoted");
        assert_eq!(ToolOutput::Json(json!({"n": 5})).serialize(), r#"{"n":5}"#);
    }
}
