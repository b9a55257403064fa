//! MCP transport layer.
//!
//! - **Stdio**: spawn a child process, newline-delimited JSON-RPC over
//!   stdin/stdout.
//! - **Http**: JSON-RPC frames POSTed to an endpoint (covers the `sse`
//!   and `streaming` server kinds).
//!
//! Servers may send requests back to the client mid-call (elicitation);
//! the stdio read loop dispatches those to the installed
//! [`ServerRequestHandler`] and writes the handler's answer back before
//! resuming the wait for the original response.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::Mutex;

use crate::auth::CookieJar;
use crate::config::McpServerConfig;
use crate::protocol::{JsonRpcError, JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

/// Maximum non-JSON stdout lines to skip before declaring the server broken.
const MAX_SKIP_LINES: usize = 1000;

/// Default single request/response deadline.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Handles a server-initiated request (e.g. `elicitation/create`).
#[async_trait]
pub trait ServerRequestHandler: Send + Sync {
    async fn handle(
        &self,
        id: i64,
        method: &str,
        params: Option<Value>,
    ) -> Result<Value, JsonRpcError>;
}

/// Trait for MCP server transports.
#[async_trait]
pub trait McpTransport: Send + Sync {
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError>;

    async fn send_notification(&self, method: &str) -> Result<(), TransportError>;

    fn is_alive(&self) -> bool;

    async fn shutdown(&self);
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("MCP server process has exited")]
    ProcessExited,

    #[error("timeout waiting for response")]
    Timeout,

    #[error("transport misconfigured: {0}")]
    Misconfigured(String),
}

impl From<TransportError> for agently_domain::error::Error {
    fn from(e: TransportError) -> Self {
        agently_domain::error::Error::Transport(e.to_string())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stdio transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Stdio transport: one child process, one JSON-RPC line per message.
/// `request_lock` serializes whole request/response cycles so concurrent
/// callers never read each other's responses.
pub struct StdioTransport {
    stdin: Mutex<ChildStdin>,
    stdout: Mutex<BufReader<ChildStdout>>,
    child: Mutex<Child>,
    request_lock: Mutex<()>,
    next_id: AtomicI64,
    alive: AtomicBool,
    handler: Option<Arc<dyn ServerRequestHandler>>,
}

impl StdioTransport {
    pub fn spawn(
        config: &McpServerConfig,
        handler: Option<Arc<dyn ServerRequestHandler>>,
    ) -> Result<Self, TransportError> {
        let command = config.command.as_deref().ok_or_else(|| {
            TransportError::Misconfigured(format!("server {} has no command", config.name))
        })?;

        let mut cmd = tokio::process::Command::new(command);
        cmd.args(&config.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null());
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        let mut child = cmd.spawn().map_err(TransportError::Io)?;
        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdin",
            ))
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "failed to capture child stdout",
            ))
        })?;

        Ok(Self {
            stdin: Mutex::new(stdin),
            stdout: Mutex::new(BufReader::new(stdout)),
            child: Mutex::new(child),
            request_lock: Mutex::new(()),
            next_id: AtomicI64::new(1),
            alive: AtomicBool::new(true),
            handler,
        })
    }

    fn next_request_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    async fn write_line(&self, json: &str) -> Result<(), TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessExited);
        }
        let mut stdin = self.stdin.lock().await;
        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Read the next JSON line, skipping log noise on stdout.
    async fn read_line(&self) -> Result<String, TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ProcessExited);
        }
        let mut stdout = self.stdout.lock().await;
        let mut skipped = 0usize;
        loop {
            let mut line = String::new();
            let bytes_read = stdout.read_line(&mut line).await?;
            if bytes_read == 0 {
                self.alive.store(false, Ordering::SeqCst);
                return Err(TransportError::ProcessExited);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            if trimmed.starts_with('{') {
                return Ok(trimmed.to_string());
            }
            skipped += 1;
            if skipped >= MAX_SKIP_LINES {
                self.alive.store(false, Ordering::SeqCst);
                return Err(TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "MCP server produced too many non-JSON lines on stdout",
                )));
            }
            tracing::debug!(line = %trimmed, "skipping non-JSON stdout line");
        }
    }

    /// Answer a server-initiated request through the installed handler.
    async fn answer_server_request(&self, request: JsonRpcRequest) -> Result<(), TransportError> {
        let response = match &self.handler {
            Some(handler) => {
                match handler
                    .handle(request.id, &request.method, request.params)
                    .await
                {
                    Ok(result) => JsonRpcResponse::success(request.id, result),
                    Err(error) => JsonRpcResponse {
                        jsonrpc: "2.0".into(),
                        id: request.id,
                        result: None,
                        error: Some(error),
                    },
                }
            }
            None => JsonRpcResponse {
                jsonrpc: "2.0".into(),
                id: request.id,
                result: None,
                error: Some(JsonRpcError {
                    code: -32601,
                    message: format!("client cannot handle {}", request.method),
                    data: None,
                }),
            },
        };
        self.write_line(&serde_json::to_string(&response)?).await
    }
}

#[async_trait]
impl McpTransport for StdioTransport {
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        let _guard = self.request_lock.lock().await;

        let id = self.next_request_id();
        let req = JsonRpcRequest::new(id, method, params);
        tracing::debug!(id, method, "sending MCP request");
        self.write_line(&serde_json::to_string(&req)?).await?;

        let result = tokio::time::timeout(REQUEST_TIMEOUT, async {
            loop {
                let line = self.read_line().await?;

                // Server-initiated request (elicitation) interleaved with
                // our pending response: answer it and keep waiting.
                if let Ok(server_req) = serde_json::from_str::<JsonRpcRequest>(&line) {
                    self.answer_server_request(server_req).await?;
                    continue;
                }

                if let Ok(resp) = serde_json::from_str::<JsonRpcResponse>(&line) {
                    if resp.id == id {
                        return Ok(resp);
                    }
                    tracing::debug!(expected = id, got = resp.id, "response id mismatch, skipping");
                    continue;
                }

                // Notification or unknown frame.
                tracing::debug!(line = %line, "skipping non-matching MCP frame");
            }
        })
        .await;

        match result {
            Ok(inner) => inner,
            Err(_) => Err(TransportError::Timeout),
        }
    }

    async fn send_notification(&self, method: &str) -> Result<(), TransportError> {
        let notification = JsonRpcNotification::new(method);
        self.write_line(&serde_json::to_string(&notification)?).await
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let mut child = self.child.lock().await;
        {
            let mut stdin = self.stdin.lock().await;
            if let Err(e) = stdin.shutdown().await {
                tracing::debug!(error = %e, "error closing MCP server stdin");
            }
        }
        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(Ok(status)) => tracing::debug!(?status, "MCP server process exited"),
            Ok(Err(e)) => tracing::warn!(error = %e, "error waiting for MCP server process"),
            Err(_) => {
                tracing::warn!("MCP server did not exit within timeout, killing");
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "failed to kill MCP server process");
                }
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// HTTP transport
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// JSON-RPC over HTTP POST. Cookies from the per-user jar and the bearer
/// token attach only when the endpoint is HTTPS (authority matching);
/// `Set-Cookie` response headers are absorbed back into the jar.
pub struct HttpTransport {
    url: String,
    host: String,
    https: bool,
    client: reqwest::Client,
    jar: Option<Arc<CookieJar>>,
    bearer: Option<String>,
    next_id: AtomicI64,
}

impl HttpTransport {
    pub fn new(
        url: String,
        jar: Option<Arc<CookieJar>>,
        bearer: Option<String>,
    ) -> Result<Self, TransportError> {
        let https = url.starts_with("https://");
        let host = url
            .split("://")
            .nth(1)
            .and_then(|rest| rest.split('/').next())
            .map(str::to_string)
            .ok_or_else(|| TransportError::Misconfigured(format!("bad url: {url}")))?;
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Ok(Self {
            url,
            host,
            https,
            client,
            jar,
            bearer,
            next_id: AtomicI64::new(1),
        })
    }

    async fn post(&self, body: String) -> Result<reqwest::Response, TransportError> {
        let mut req = self
            .client
            .post(&self.url)
            .header("content-type", "application/json")
            .body(body);

        if self.https {
            if let Some(header) = self.jar.as_ref().and_then(|jar| jar.header_for(&self.host)) {
                req = req.header("cookie", header);
            }
            if let Some(token) = &self.bearer {
                req = req.header("authorization", format!("Bearer {token}"));
            }
        }

        let resp = req
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        if let Some(jar) = &self.jar {
            let set_cookies: Vec<String> = resp
                .headers()
                .get_all("set-cookie")
                .iter()
                .filter_map(|v| v.to_str().ok().map(str::to_string))
                .collect();
            if self.https && !set_cookies.is_empty() {
                jar.absorb_set_cookie(&self.host, &set_cookies);
            }
        }

        Ok(resp)
    }
}

#[async_trait]
impl McpTransport for HttpTransport {
    async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<JsonRpcResponse, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let req = JsonRpcRequest::new(id, method, params);
        let resp = self.post(serde_json::to_string(&req)?).await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(TransportError::Http(format!(
                "{} returned {status}",
                self.url
            )));
        }
        let body = resp
            .text()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn send_notification(&self, method: &str) -> Result<(), TransportError> {
        let notification = JsonRpcNotification::new(method);
        self.post(serde_json::to_string(&notification)?).await?;
        Ok(())
    }

    fn is_alive(&self) -> bool {
        true
    }

    async fn shutdown(&self) {}
}
