//! MCP server configuration, parsed from workspace `mcp/*.yaml` documents.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpTransportKind {
    /// Child process speaking newline-delimited JSON-RPC over stdio.
    Stdio,
    /// HTTP endpoint with server-sent event responses.
    Sse,
    /// HTTP streaming endpoint (request/response JSON-RPC over POST).
    Streaming,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpServerConfig {
    pub name: String,
    pub transport: McpTransportKind,
    /// Endpoint for `sse`/`streaming` transports.
    #[serde(default)]
    pub url: Option<String>,
    /// Command for the `stdio` transport.
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub auth: Option<McpAuthConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpAuthConfig {
    /// Environment variable holding a bearer token for this server.
    /// Tokens only attach when the server URL is HTTPS.
    #[serde(default)]
    pub bearer_env: Option<String>,
}

impl McpServerConfig {
    /// Whether the configured endpoint is HTTPS. Credentials (cookies,
    /// bearer tokens) are only attached when this holds.
    pub fn is_https(&self) -> bool {
        self.url
            .as_deref()
            .map(|u| u.starts_with("https://"))
            .unwrap_or(false)
    }

    /// Resolve the bearer token from the configured env var, if any.
    pub fn resolve_bearer(&self) -> Option<String> {
        let var = self.auth.as_ref()?.bearer_env.as_deref()?;
        std::env::var(var).ok().filter(|v| !v.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_yaml_stdio_config() {
        let raw = r#"
name: filesystem
transport: stdio
command: mcp-fs
args: ["--root", "/srv"]
env:
  LOG_LEVEL: debug
"#;
        let config: McpServerConfig = serde_yaml::from_str(raw).unwrap();
        assert_eq!(config.name, "filesystem");
        assert_eq!(config.transport, McpTransportKind::Stdio);
        assert_eq!(config.command.as_deref(), Some("mcp-fs"));
        assert_eq!(config.args.len(), 2);
    }

    #[test]
    fn https_detection() {
        let raw = r#"
name: search
transport: streaming
url: https://mcp.example.com/rpc
"#;
        let config: McpServerConfig = serde_yaml::from_str(raw).unwrap();
        assert!(config.is_https());

        let raw_http = r#"
name: local
transport: streaming
url: http://127.0.0.1:9000/rpc
"#;
        let config: McpServerConfig = serde_yaml::from_str(raw_http).unwrap();
        assert!(!config.is_https());
    }
}
