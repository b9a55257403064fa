//! One connected MCP server: handshake, tool discovery, tool calls.

use std::sync::Arc;

use serde_json::Value;

use agently_domain::error::{Error, Result};

use crate::auth::CookieJar;
use crate::config::{McpServerConfig, McpTransportKind};
use crate::protocol::{self, McpToolDef, ToolCallResult, ToolsListResult};
use crate::transport::{HttpTransport, McpTransport, ServerRequestHandler, StdioTransport};

/// A live connection to one MCP server.
pub struct McpClient {
    server_name: String,
    tools: Vec<McpToolDef>,
    transport: Box<dyn McpTransport>,
}

impl McpClient {
    /// Connect: build the transport, run the `initialize` handshake, and
    /// discover tools. `bearer_override` carries a token resolved from the
    /// originating request; it wins over the configured source.
    pub async fn connect(
        config: &McpServerConfig,
        jar: Option<Arc<CookieJar>>,
        bearer_override: Option<String>,
        handler: Option<Arc<dyn ServerRequestHandler>>,
    ) -> Result<Self> {
        let transport: Box<dyn McpTransport> = match config.transport {
            McpTransportKind::Stdio => Box::new(
                StdioTransport::spawn(config, handler).map_err(Error::from)?,
            ),
            McpTransportKind::Sse | McpTransportKind::Streaming => {
                let url = config.url.clone().ok_or_else(|| {
                    Error::Config(format!("mcp server {} has no url", config.name))
                })?;
                // Credentials only travel over HTTPS.
                let bearer = config
                    .is_https()
                    .then(|| bearer_override.or_else(|| config.resolve_bearer()))
                    .flatten();
                Box::new(HttpTransport::new(url, jar, bearer).map_err(Error::from)?)
            }
        };

        let init_params = serde_json::to_value(protocol::initialize_params())?;
        let resp = transport
            .send_request("initialize", Some(init_params))
            .await
            .map_err(Error::from)?;
        if let Err(e) = resp.into_result() {
            return Err(Error::Transport(format!(
                "initialize failed for {}: {e}",
                config.name
            )));
        }
        transport
            .send_notification("notifications/initialized")
            .await
            .map_err(Error::from)?;

        let tools_resp = transport
            .send_request("tools/list", None)
            .await
            .map_err(Error::from)?;
        let tools = match tools_resp.into_result() {
            Ok(value) => serde_json::from_value::<ToolsListResult>(value)
                .map(|r| r.tools)
                .unwrap_or_else(|e| {
                    tracing::warn!(server = %config.name, error = %e, "bad tools/list result");
                    Vec::new()
                }),
            Err(e) => {
                tracing::warn!(server = %config.name, error = %e, "tools/list failed");
                Vec::new()
            }
        };

        tracing::info!(server = %config.name, tool_count = tools.len(), "MCP server connected");

        Ok(Self {
            server_name: config.name.clone(),
            tools,
            transport,
        })
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn tools(&self) -> &[McpToolDef] {
        &self.tools
    }

    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    /// Invoke `tools/call` for a tool this server advertises.
    pub async fn call_tool(&self, tool_name: &str, arguments: Value) -> Result<ToolCallResult> {
        if !self.transport.is_alive() {
            return Err(Error::Transport(format!(
                "MCP server {} is down",
                self.server_name
            )));
        }

        let params = serde_json::json!({
            "name": tool_name,
            "arguments": arguments,
        });
        let resp = self
            .transport
            .send_request("tools/call", Some(params))
            .await
            .map_err(Error::from)?;

        let value = resp.into_result().map_err(|e| Error::Tool {
            tool: tool_name.to_string(),
            message: e.to_string(),
        })?;
        serde_json::from_value(value).map_err(Error::Json)
    }

    pub async fn shutdown(&self) {
        tracing::debug!(server = %self.server_name, "shutting down MCP client");
        self.transport.shutdown().await;
    }
}
