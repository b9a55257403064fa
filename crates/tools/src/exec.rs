//! `system:exec` — run a shell command and return its output.

use std::collections::HashMap;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::process::Command;

use agently_domain::error::{Error, Result};

use crate::registry::{ToolContext, ToolHandler, ToolOutput};

#[derive(Debug, Deserialize)]
pub struct ExecRequest {
    pub command: String,
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub timeout_sec: Option<u64>,
    /// Populated by the argument converter from the process environment
    /// when absent, so commands inherit `PATH`, `HOME`, etc.
    #[serde(default, rename = "Env")]
    pub env: Option<HashMap<String, String>>,
}

/// Input schema for the catalogue.
pub fn input_schema() -> Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "command": { "type": "string", "description": "Shell command to execute" },
            "workdir": { "type": "string", "description": "Working directory" },
            "timeout_sec": { "type": "integer", "description": "Hard timeout in seconds" },
            "Env": { "type": "object", "description": "Environment variables" }
        },
        "required": ["command"]
    })
}

pub struct ExecHandler {
    default_timeout: Duration,
}

impl ExecHandler {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }
}

#[async_trait]
impl ToolHandler for ExecHandler {
    async fn invoke(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutput> {
        let req: ExecRequest = serde_json::from_value(args).map_err(|e| Error::Tool {
            tool: "system:exec".into(),
            message: format!("bad arguments: {e}"),
        })?;

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&req.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(workdir) = &req.workdir {
            cmd.current_dir(workdir);
        }
        if let Some(env) = &req.env {
            cmd.env_clear();
            cmd.envs(env);
        }

        let timeout = ctx
            .timeout
            .or(req.timeout_sec.map(Duration::from_secs))
            .unwrap_or(self.default_timeout);

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| Error::Timeout(format!("system:exec after {}s", timeout.as_secs())))?
            .map_err(Error::Io)?;

        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(stderr.trim_end());
        }

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            return Err(Error::Tool {
                tool: "system:exec".into(),
                message: format!("exit code {code}: {}", text.trim()),
            });
        }

        Ok(ToolOutput::Text(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn ctx() -> ToolContext {
        ToolContext::new(Uuid::new_v4(), Uuid::new_v4(), "tester")
    }

    #[tokio::test]
    async fn runs_command_and_captures_stdout() {
        let handler = ExecHandler::new(Duration::from_secs(10));
        let out = handler
            .invoke(&ctx(), serde_json::json!({ "command": "echo hello" }))
            .await
            .unwrap();
        assert_eq!(out.serialize().trim(), "hello");
    }

    #[tokio::test]
    async fn env_map_is_applied() {
        let handler = ExecHandler::new(Duration::from_secs(10));
        let out = handler
            .invoke(
                &ctx(),
                serde_json::json!({
                    "command": "printf \"$GREETING\"",
                    "Env": { "GREETING": "from-env", "PATH": std::env::var("PATH").unwrap_or_default() }
                }),
            )
            .await
            .unwrap();
        assert_eq!(out.serialize(), "from-env");
    }

    #[tokio::test]
    async fn nonzero_exit_is_a_tool_error() {
        let handler = ExecHandler::new(Duration::from_secs(10));
        let err = handler
            .invoke(&ctx(), serde_json::json!({ "command": "exit 3" }))
            .await
            .unwrap_err();
        match err {
            Error::Tool { message, .. } => assert!(message.contains("exit code 3")),
            other => panic!("expected tool error, got {other}"),
        }
    }

    #[tokio::test]
    async fn timeout_kills_long_commands() {
        let handler = ExecHandler::new(Duration::from_millis(100));
        let err = handler
            .invoke(&ctx(), serde_json::json!({ "command": "sleep 5" }))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }
}
