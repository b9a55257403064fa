//! Configuration tree, loaded from a TOML file plus `AGENTLY_*` env
//! overrides.
//!
//! Paths inside `[default]` may reference `${workspaceRoot}`, which is
//! substituted with the resolved workspace root at load time.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sections
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn default_tool_call_timeout_sec() -> u64 {
    300
}
fn default_elicitation_timeout_sec() -> u64 {
    120
}
fn default_match_max_files() -> usize {
    5
}
fn default_runtime_root() -> String {
    "${workspaceRoot}/runtime".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultSection {
    /// Base for runtime state; `${workspaceRoot}` resolves to the
    /// workspace root.
    #[serde(default = "default_runtime_root")]
    pub runtime_root: String,
    /// Cookies, jars, scheduler state. Defaults to `<runtimeRoot>/state`.
    #[serde(default)]
    pub state_path: Option<String>,
    /// SQLite file. Defaults to `<statePath>/db/agently.db`.
    #[serde(default)]
    pub db_path: Option<String>,
    /// Per-tool call timeout floor in seconds.
    #[serde(default = "default_tool_call_timeout_sec")]
    pub tool_call_timeout_sec: u64,
    /// Default elicitation timeout in seconds.
    #[serde(default = "default_elicitation_timeout_sec")]
    pub elicitation_timeout_sec: u64,
    #[serde(default, rename = "match")]
    pub match_options: MatchSection,
}

impl Default for DefaultSection {
    fn default() -> Self {
        Self {
            runtime_root: default_runtime_root(),
            state_path: None,
            db_path: None,
            tool_call_timeout_sec: default_tool_call_timeout_sec(),
            elicitation_timeout_sec: default_elicitation_timeout_sec(),
            match_options: MatchSection::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchSection {
    /// Resource-match cap for knowledge attachment.
    #[serde(default = "default_match_max_files")]
    pub max_files: usize,
}

impl Default for MatchSection {
    fn default() -> Self {
        Self {
            max_files: default_match_max_files(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    4100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_scheduler_interval_sec() -> u64 {
    30
}
fn default_lease_ttl_sec() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_scheduler_interval_sec")]
    pub interval_sec: u64,
    #[serde(default = "default_lease_ttl_sec")]
    pub lease_ttl_sec: u64,
    /// Lease owner id; auto-generated when absent.
    #[serde(default)]
    pub owner: Option<String>,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_sec: default_scheduler_interval_sec(),
            lease_ttl_sec: default_lease_ttl_sec(),
            owner: None,
        }
    }
}

fn default_max_rounds() -> u32 {
    8
}
fn default_tool_output_limit() -> usize {
    16 * 1024
}
fn default_turn_timeout_sec() -> u64 {
    600
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorSection {
    /// Maximum LLM rounds per turn.
    #[serde(default = "default_max_rounds")]
    pub max_rounds: u32,
    /// Tool output size above which the result moves into a payload and
    /// an overflow wrapper is emitted instead.
    #[serde(default = "default_tool_output_limit")]
    pub tool_output_limit: usize,
    /// Hard deadline for one turn.
    #[serde(default = "default_turn_timeout_sec")]
    pub turn_timeout_sec: u64,
}

impl Default for OrchestratorSection {
    fn default() -> Self {
        Self {
            max_rounds: default_max_rounds(),
            tool_output_limit: default_tool_output_limit(),
            turn_timeout_sec: default_turn_timeout_sec(),
        }
    }
}

fn default_mcp_client_ttl_sec() -> u64 {
    15 * 60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpSection {
    /// Idle TTL for per-conversation MCP clients.
    #[serde(default = "default_mcp_client_ttl_sec")]
    pub client_ttl_sec: u64,
    /// Warm legacy per-server cookie jars into the shared per-user jar.
    #[serde(default)]
    pub anonymous_scope: bool,
}

impl Default for McpSection {
    fn default() -> Self {
        Self {
            client_ttl_sec: default_mcp_client_ttl_sec(),
            anonymous_scope: false,
        }
    }
}

fn default_redact_keys() -> Vec<String> {
    ["authorization", "api_key", "apikey", "password", "secret", "token"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedactSection {
    /// Keys whose values are replaced by a sentinel before persistence.
    #[serde(default = "default_redact_keys")]
    pub keys: Vec<String>,
}

impl Default for RedactSection {
    fn default() -> Self {
        Self {
            keys: default_redact_keys(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Workspace root holding agent/model/mcp/oauth definition files.
    /// Defaults to the directory the config file lives in.
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
    #[serde(default)]
    pub default: DefaultSection,
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub orchestrator: OrchestratorSection,
    #[serde(default)]
    pub mcp: McpSection,
    #[serde(default)]
    pub redact: RedactSection,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Config {
    /// Parse a TOML file, resolve `${workspaceRoot}`, and apply
    /// `AGENTLY_*` env overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(Error::Io)?;
        let mut config: Config =
            toml::from_str(&raw).map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        if config.workspace_root.is_none() {
            config.workspace_root = path.parent().map(Path::to_path_buf);
        }
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply `AGENTLY_REDACT_KEYS` and `AGENTLY_SCHEDULER_*` overrides.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(keys) = std::env::var("AGENTLY_REDACT_KEYS") {
            let extra: Vec<String> = keys
                .split(',')
                .map(|k| k.trim().to_ascii_lowercase())
                .filter(|k| !k.is_empty())
                .collect();
            for key in extra {
                if !self.redact.keys.contains(&key) {
                    self.redact.keys.push(key);
                }
            }
        }
        if let Ok(v) = std::env::var("AGENTLY_SCHEDULER_ENABLED") {
            self.scheduler.enabled = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("AGENTLY_SCHEDULER_INTERVAL_SEC") {
            if let Ok(n) = v.parse() {
                self.scheduler.interval_sec = n;
            }
        }
        if let Ok(v) = std::env::var("AGENTLY_SCHEDULER_LEASE_TTL_SEC") {
            if let Ok(n) = v.parse() {
                self.scheduler.lease_ttl_sec = n;
            }
        }
        if let Ok(v) = std::env::var("AGENTLY_SCHEDULER_OWNER") {
            if !v.is_empty() {
                self.scheduler.owner = Some(v);
            }
        }
    }

    /// The resolved workspace root (current dir when unset).
    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_root
            .clone()
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Runtime root with `${workspaceRoot}` substituted.
    pub fn runtime_root(&self) -> PathBuf {
        let root = self.workspace_root();
        let resolved = self
            .default
            .runtime_root
            .replace("${workspaceRoot}", &root.to_string_lossy());
        PathBuf::from(resolved)
    }

    /// State path: explicit, or `<runtimeRoot>/state`.
    pub fn state_path(&self) -> PathBuf {
        match &self.default.state_path {
            Some(p) => PathBuf::from(
                p.replace("${workspaceRoot}", &self.workspace_root().to_string_lossy()),
            ),
            None => self.runtime_root().join("state"),
        }
    }

    /// SQLite path: explicit, or `<statePath>/db/agently.db`.
    pub fn db_path(&self) -> PathBuf {
        match &self.default.db_path {
            Some(p) => PathBuf::from(
                p.replace("${workspaceRoot}", &self.workspace_root().to_string_lossy()),
            ),
            None => self.state_path().join("db").join("agently.db"),
        }
    }

    /// Static validation; errors are fatal at startup.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        if self.default.tool_call_timeout_sec == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "default.tool_call_timeout_sec must be > 0".into(),
            });
        }
        if self.default.elicitation_timeout_sec == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "default.elicitation_timeout_sec must be > 0".into(),
            });
        }
        if self.scheduler.enabled && self.scheduler.lease_ttl_sec < 3 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "scheduler.lease_ttl_sec must allow renewal at ttl/3".into(),
            });
        }
        if self.orchestrator.max_rounds == 0 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Error,
                message: "orchestrator.max_rounds must be > 0".into(),
            });
        }
        if self.orchestrator.tool_output_limit < 1024 {
            issues.push(ConfigIssue {
                severity: ConfigSeverity::Warning,
                message: "orchestrator.tool_output_limit below 1 KiB will wrap most tool output"
                    .into(),
            });
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.default.tool_call_timeout_sec, 300);
        assert_eq!(config.default.elicitation_timeout_sec, 120);
        assert_eq!(config.default.match_options.max_files, 5);
        assert_eq!(config.scheduler.interval_sec, 30);
        assert_eq!(config.scheduler.lease_ttl_sec, 60);
        assert_eq!(config.mcp.client_ttl_sec, 900);
    }

    #[test]
    fn workspace_root_substitution() {
        let mut config = Config::default();
        config.workspace_root = Some(PathBuf::from("/srv/agently"));
        assert_eq!(config.runtime_root(), PathBuf::from("/srv/agently/runtime"));
        assert_eq!(
            config.db_path(),
            PathBuf::from("/srv/agently/runtime/state/db/agently.db")
        );
    }

    #[test]
    fn explicit_paths_win() {
        let mut config = Config::default();
        config.workspace_root = Some(PathBuf::from("/srv/agently"));
        config.default.state_path = Some("${workspaceRoot}/var".into());
        config.default.db_path = Some("/tmp/custom.db".into());
        assert_eq!(config.state_path(), PathBuf::from("/srv/agently/var"));
        assert_eq!(config.db_path(), PathBuf::from("/tmp/custom.db"));
    }

    #[test]
    fn load_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agently.toml");
        std::fs::write(
            &path,
            r#"
[default]
tool_call_timeout_sec = 60

[server]
port = 9000

[scheduler]
enabled = true
"#,
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.default.tool_call_timeout_sec, 60);
        assert_eq!(config.server.port, 9000);
        assert!(config.scheduler.enabled);
        // workspace_root defaults to the config file's directory
        assert_eq!(config.workspace_root(), dir.path());
    }

    #[test]
    fn validation_flags_zero_timeouts() {
        let mut config = Config::default();
        config.default.tool_call_timeout_sec = 0;
        let issues = config.validate();
        assert!(issues
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error
                && i.message.contains("tool_call_timeout_sec")));
    }
}
