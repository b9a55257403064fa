//! Workspace repository: YAML definition documents on disk.
//!
//! Each kind (`agent|model|workflow|mcp|oauth`) owns one directory under
//! the workspace root; a definition is `<root>/<kind>/<name>.yaml`. The
//! gateway reads agents and MCP servers through the typed loaders; the
//! workspace HTTP API does raw document CRUD.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use agently_domain::error::{Error, Result};
use agently_mcp_client::McpServerConfig;

use crate::runtime::policy::ToolPolicy;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Kinds
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkspaceKind {
    Agent,
    Model,
    Workflow,
    Mcp,
    Oauth,
}

impl WorkspaceKind {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "agent" => Self::Agent,
            "model" => Self::Model,
            "workflow" => Self::Workflow,
            "mcp" => Self::Mcp,
            "oauth" => Self::Oauth,
            _ => return None,
        })
    }

    pub fn dir(self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Model => "model",
            Self::Workflow => "workflow",
            Self::Mcp => "mcp",
            Self::Oauth => "oauth",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Typed definitions
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An agent definition document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefinition {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub system_prompt: String,
    /// Model spec (`provider/model`).
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub parallel_tool_calls: bool,
    #[serde(default)]
    pub tools: ToolPolicy,
    /// MCP servers this agent may reach (by workspace name).
    #[serde(default)]
    pub mcp_servers: Vec<String>,
    /// Knowledge files spliced into the system prompt (workspace-relative,
    /// capped by `default.match.maxFiles`).
    #[serde(default)]
    pub knowledge: Vec<String>,
    /// Whether this agent is also exposed as a callable `agent:<name>`
    /// tool to other agents.
    #[serde(default)]
    pub callable: bool,
}

impl AgentDefinition {
    /// The built-in fallback agent used when a request names none.
    pub fn fallback() -> Self {
        Self {
            name: "default".into(),
            description: Some("General-purpose assistant".into()),
            system_prompt: "You are Agently, a helpful assistant. Use the available tools \
                            when they help you answer."
                .into(),
            model: None,
            parallel_tool_calls: false,
            tools: ToolPolicy::default(),
            mcp_servers: Vec::new(),
            knowledge: Vec::new(),
            callable: false,
        }
    }
}

/// A model definition document (maps a friendly name to a provider spec).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelDefinition {
    pub name: String,
    /// `provider/model` spec handed to the provider registry.
    pub spec: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct WorkspaceStore {
    root: PathBuf,
}

impl WorkspaceStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn document_path(&self, kind: WorkspaceKind, name: &str) -> Result<PathBuf> {
        // Names are basenames; reject traversal.
        if name.is_empty() || name.contains('/') || name.contains("..") {
            return Err(Error::Validation(format!("invalid document name `{name}`")));
        }
        Ok(self.root.join(kind.dir()).join(format!("{name}.yaml")))
    }

    /// Raw YAML document, if present.
    pub fn get(&self, kind: WorkspaceKind, name: &str) -> Result<Option<String>> {
        let path = self.document_path(kind, name)?;
        match std::fs::read_to_string(&path) {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Write (create or replace) a document. The body must parse as YAML.
    pub fn put(&self, kind: WorkspaceKind, name: &str, body: &str) -> Result<()> {
        serde_yaml::from_str::<serde_yaml::Value>(body)
            .map_err(|e| Error::Validation(format!("not valid YAML: {e}")))?;
        let path = self.document_path(kind, name)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(Error::Io)?;
        }
        std::fs::write(&path, body).map_err(Error::Io)
    }

    pub fn delete(&self, kind: WorkspaceKind, name: &str) -> Result<bool> {
        let path = self.document_path(kind, name)?;
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Basenames of all documents of a kind, sorted.
    pub fn list(&self, kind: WorkspaceKind) -> Result<Vec<String>> {
        let dir = self.root.join(kind.dir());
        let mut names = Vec::new();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(Error::Io(e)),
        };
        for entry in entries {
            let entry = entry.map_err(Error::Io)?;
            let file_name = entry.file_name();
            let file_name = file_name.to_string_lossy();
            if let Some(base) = file_name.strip_suffix(".yaml") {
                names.push(base.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    // ── Typed loaders ─────────────────────────────────────────────────

    /// Load an agent by name; `None` resolves to the built-in fallback.
    pub fn load_agent(&self, name: Option<&str>) -> Result<AgentDefinition> {
        let Some(name) = name else {
            return match self.get(WorkspaceKind::Agent, "default")? {
                Some(raw) => parse_yaml(&raw, "agent/default"),
                None => Ok(AgentDefinition::fallback()),
            };
        };
        let raw = self
            .get(WorkspaceKind::Agent, name)?
            .ok_or_else(|| Error::Config(format!("agent `{name}` not found in workspace")))?;
        parse_yaml(&raw, &format!("agent/{name}"))
    }

    /// All agents declared callable (exposed as virtual tools).
    pub fn callable_agents(&self) -> Result<Vec<AgentDefinition>> {
        let mut agents = Vec::new();
        for name in self.list(WorkspaceKind::Agent)? {
            if let Some(raw) = self.get(WorkspaceKind::Agent, &name)? {
                match parse_yaml::<AgentDefinition>(&raw, &format!("agent/{name}")) {
                    Ok(agent) if agent.callable => agents.push(agent),
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(agent = %name, error = %e, "skipping malformed agent")
                    }
                }
            }
        }
        Ok(agents)
    }

    pub fn load_model(&self, name: &str) -> Result<ModelDefinition> {
        let raw = self
            .get(WorkspaceKind::Model, name)?
            .ok_or_else(|| Error::Config(format!("model `{name}` not found in workspace")))?;
        parse_yaml(&raw, &format!("model/{name}"))
    }

    pub fn load_mcp_server(&self, name: &str) -> Result<McpServerConfig> {
        let raw = self
            .get(WorkspaceKind::Mcp, name)?
            .ok_or_else(|| Error::Config(format!("mcp server `{name}` not found in workspace")))?;
        parse_yaml(&raw, &format!("mcp/{name}"))
    }

    /// Read knowledge files for an agent, capped at `max_files`.
    pub fn read_knowledge(&self, agent: &AgentDefinition, max_files: usize) -> Vec<(String, String)> {
        agent
            .knowledge
            .iter()
            .take(max_files)
            .filter_map(|rel| {
                if rel.contains("..") {
                    tracing::warn!(file = %rel, "skipping knowledge path with traversal");
                    return None;
                }
                let path = self.root.join(rel);
                match std::fs::read_to_string(&path) {
                    Ok(content) => Some((rel.clone(), content)),
                    Err(e) => {
                        tracing::warn!(file = %rel, error = %e, "knowledge file unreadable");
                        None
                    }
                }
            })
            .collect()
    }
}

fn parse_yaml<T: serde::de::DeserializeOwned>(raw: &str, what: &str) -> Result<T> {
    serde_yaml::from_str(raw).map_err(|e| Error::Config(format!("{what}: {e}")))
}
