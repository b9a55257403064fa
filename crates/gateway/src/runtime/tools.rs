//! Tool proxy: catalogue assembly and guarded execution.
//!
//! Registration happens at startup (built-in services, virtual agent
//! tools) and lazily per conversation (remote MCP tools, discovered when
//! an agent that lists the server first runs). Execution canonicalizes
//! the name, consults the policy, converts arguments, applies the
//! resolved timeout and retry budget, records the tool call, and
//! publishes `tool_op` events around the invocation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use agently_domain::error::{Error, Result};
use agently_domain::model::{ElicitationOutcome, ToolCallRecord, ToolCallStatus};
use agently_mcp_client::protocol::{ElicitationCreateParams, JsonRpcError};
use agently_mcp_client::{ClientKey, McpServerConfig, ServerRequestHandler};
use agently_tools::convert::convert_args;
use agently_tools::exec::{self, ExecHandler};
use agently_domain::chat::ToolDefinition;
use agently_tools::{
    canonical_name, Elicitor, ToolContext, ToolHandler, ToolOutput, ToolSourceKind,
};

use crate::runtime::events::EventKind;
use crate::runtime::policy::{PolicyDecision, ToolPolicy};
use crate::state::AppState;
use crate::workspace::AgentDefinition;

/// Transport-error retry budget per tool call.
const MAX_TOOL_RETRIES: u32 = 2;

/// Base backoff between retries (doubles per attempt).
const RETRY_BACKOFF: Duration = Duration::from_millis(250);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Built-in services
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `internal:message-show` — read a stored message's payload by range,
/// the continuation half of the overflow wrapper.
struct MessageShowHandler {
    state: AppState,
}

#[async_trait]
impl ToolHandler for MessageShowHandler {
    async fn invoke(&self, _ctx: &ToolContext, args: Value) -> Result<ToolOutput> {
        let message_id = args
            .get("messageId")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| Error::Validation("messageId (UUID) is required".into()))?;
        let offset = args.get("offset").and_then(Value::as_u64).unwrap_or(0) as usize;
        let length = args
            .get("length")
            .and_then(Value::as_u64)
            .unwrap_or(self.state.config.orchestrator.tool_output_limit as u64)
            as usize;

        let message = self
            .state
            .store
            .get_message(message_id)?
            .ok_or_else(|| Error::Validation(format!("message {message_id} not found")))?;

        let bytes = match &message.payload_id {
            Some(payload_id) => {
                self.state
                    .store
                    .read_payload(payload_id)?
                    .map(|(_, bytes)| bytes)
                    .unwrap_or_default()
            }
            None => message.content.clone().unwrap_or_default().into_bytes(),
        };

        let end = (offset + length).min(bytes.len());
        let slice = if offset >= bytes.len() {
            Vec::new()
        } else {
            bytes[offset..end].to_vec()
        };
        Ok(ToolOutput::Bytes(slice))
    }
}

/// `user:ask` — let the agent request structured data from the user.
struct UserAskHandler;

#[async_trait]
impl ToolHandler for UserAskHandler {
    async fn invoke(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutput> {
        let message = args
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string);
        let schema = args
            .get("schema")
            .cloned()
            .ok_or_else(|| Error::Validation("schema is required".into()))?;

        let outcome = ctx.elicit(message, schema).await?;
        Ok(match outcome {
            ElicitationOutcome::Accept { payload } => ToolOutput::Json(payload),
            ElicitationOutcome::Decline { reason } => ToolOutput::Json(json!({
                "declined": true,
                "reason": reason,
            })),
            ElicitationOutcome::Timeout => ToolOutput::Json(json!({
                "declined": true,
                "reason": "timeout",
            })),
        })
    }
}

/// Register the built-in internal services.
pub fn register_builtins(state: &AppState) {
    let exec_timeout = Duration::from_secs(state.config.default.tool_call_timeout_sec);
    state.registry.register(agently_tools::registry::ToolEntry {
        definition: ToolDefinition {
            name: "system:exec".into(),
            description: "Run a shell command and return its output.".into(),
            input_schema: exec::input_schema(),
            output_schema: None,
            tags: vec!["system".into()],
        },
        source: ToolSourceKind::Internal,
        handler: Arc::new(ExecHandler::new(exec_timeout)),
        timeout: None,
        parallel_safe: true,
    });

    state.registry.register(agently_tools::registry::ToolEntry {
        definition: ToolDefinition {
            name: "internal:message-show".into(),
            description: "Show a stored message payload by byte range. Use the nextRange \
                          hint from an overflow wrapper to continue reading."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "messageId": { "type": "string", "description": "Message UUID" },
                    "offset": { "type": "integer", "description": "Byte offset to start from" },
                    "length": { "type": "integer", "description": "Bytes to return" }
                },
                "required": ["messageId"]
            }),
            output_schema: None,
            tags: vec!["internal".into()],
        },
        source: ToolSourceKind::Internal,
        handler: Arc::new(MessageShowHandler {
            state: state.clone(),
        }),
        timeout: None,
        parallel_safe: true,
    });

    state.registry.register(agently_tools::registry::ToolEntry {
        definition: ToolDefinition {
            name: "user:ask".into(),
            description: "Ask the user for structured data. Suspends the turn until the \
                          user answers, declines, or the prompt times out."
                .into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "message": { "type": "string", "description": "Prompt shown to the user" },
                    "schema": {
                        "type": "object",
                        "description": "JSON schema (type=object) of the requested data"
                    }
                },
                "required": ["schema"]
            }),
            output_schema: None,
            tags: vec!["user".into()],
        },
        source: ToolSourceKind::Internal,
        handler: Arc::new(UserAskHandler),
        timeout: None,
        // Elicitation suspends the turn; never run concurrently.
        parallel_safe: false,
    });
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Virtual agent tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// `agent:<name>` — run another agent in a linked child conversation and
/// return its final answer.
struct VirtualAgentHandler {
    state: AppState,
    agent_name: String,
}

#[async_trait]
impl ToolHandler for VirtualAgentHandler {
    async fn invoke(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutput> {
        let objective = args
            .get("objective")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::Validation("objective is required".into()))?;
        let context = args
            .get("context")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();

        let child = self
            .state
            .store
            .create_conversation(&ctx.user_subject, Some(ctx.conversation_id))?;

        let (turn_id, _message_id) = crate::runtime::turn::post_message(
            &self.state,
            crate::runtime::turn::PostMessageRequest {
                conversation_id: child.id,
                content: objective.to_string(),
                agent: Some(self.agent_name.clone()),
                model: None,
                context,
                attachments: Vec::new(),
                user_subject: ctx.user_subject.clone(),
                bearer: ctx.bearer.clone(),
            },
        )
        .await?;

        let wait = ctx.timeout.unwrap_or(Duration::from_secs(5 * 60));
        let turn = crate::runtime::turn::wait_for_turn(&self.state, child.id, turn_id, wait).await?;

        let answer = crate::runtime::turn::final_assistant_text(&self.state, child.id, turn_id)?;
        match turn.status {
            agently_domain::model::TurnStatus::Succeeded => Ok(ToolOutput::Text(answer)),
            status => Err(Error::Tool {
                tool: format!("agent:{}", self.agent_name),
                message: format!(
                    "child turn ended {}: {}",
                    status.as_str(),
                    turn.error.unwrap_or_default()
                ),
            }),
        }
    }
}

/// Expose every callable workspace agent as an `agent:<name>` tool.
pub fn register_virtual_agents(state: &AppState) -> Result<()> {
    for agent in state.workspace.callable_agents()? {
        let name = format!("agent:{}", agent.name);
        state.registry.register(agently_tools::registry::ToolEntry {
            definition: ToolDefinition {
                name: name.clone(),
                description: agent
                    .description
                    .clone()
                    .unwrap_or_else(|| format!("Delegate a task to the {} agent.", agent.name)),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "objective": { "type": "string", "description": "Task for the agent" },
                        "context": { "type": "object", "description": "Extra context variables" }
                    },
                    "required": ["objective"]
                }),
                output_schema: None,
                tags: vec!["agent".into()],
            },
            source: ToolSourceKind::VirtualAgent,
            handler: Arc::new(VirtualAgentHandler {
                state: state.clone(),
                agent_name: agent.name.clone(),
            }),
            timeout: None,
            parallel_safe: false,
        });
    }
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Remote MCP tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-(server, conversation) bridge for server-initiated requests. The
/// live elicitor slot is refreshed at every tool invocation so the
/// bridge always raises elicitations on the current turn.
pub struct McpRequestBridge {
    conversation_id: Uuid,
    elicitor: RwLock<Option<Arc<dyn Elicitor>>>,
}

impl McpRequestBridge {
    fn new(conversation_id: Uuid) -> Self {
        Self {
            conversation_id,
            elicitor: RwLock::new(None),
        }
    }

    fn set_elicitor(&self, elicitor: Option<Arc<dyn Elicitor>>) {
        *self.elicitor.write() = elicitor;
    }
}

#[async_trait]
impl ServerRequestHandler for McpRequestBridge {
    async fn handle(
        &self,
        id: i64,
        method: &str,
        params: Option<Value>,
    ) -> std::result::Result<Value, JsonRpcError> {
        if method != "elicitation/create" {
            return Err(JsonRpcError {
                code: -32601,
                message: format!("client does not handle {method}"),
                data: None,
            });
        }
        let params: ElicitationCreateParams = params
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| JsonRpcError {
                code: -32602,
                message: format!("bad elicitation params: {e}"),
                data: None,
            })?
            .ok_or_else(|| JsonRpcError {
                code: -32602,
                message: "elicitation params required".into(),
                data: None,
            })?;

        let elicitor = self.elicitor.read().clone().ok_or_else(|| JsonRpcError {
            code: -32000,
            message: format!(
                "no active turn on conversation {} to elicit through",
                self.conversation_id
            ),
            data: None,
        })?;

        let outcome = elicitor
            .elicit_keyed(params.message, params.requested_schema, Some(id), params.url)
            .await
            .map_err(|e| JsonRpcError {
                code: -32000,
                message: e.to_string(),
                data: None,
            })?;

        Ok(match outcome {
            ElicitationOutcome::Accept { payload } => {
                json!({ "action": "accept", "content": payload })
            }
            ElicitationOutcome::Decline { reason } => {
                json!({ "action": "decline", "reason": reason })
            }
            ElicitationOutcome::Timeout => json!({ "action": "cancel", "reason": "timeout" }),
        })
    }
}

/// Bridges keyed by (server, conversation), shared by all remote tool
/// handlers of a server.
#[derive(Default)]
pub struct RemoteBridges {
    map: Mutex<HashMap<(String, Uuid), Arc<McpRequestBridge>>>,
}

impl RemoteBridges {
    pub fn new() -> Self {
        Self::default()
    }

    fn bridge(&self, server: &str, conversation_id: Uuid) -> Arc<McpRequestBridge> {
        self.map
            .lock()
            .entry((server.to_string(), conversation_id))
            .or_insert_with(|| Arc::new(McpRequestBridge::new(conversation_id)))
            .clone()
    }
}

/// One remote tool behind the per-conversation MCP client.
struct McpToolHandler {
    state: AppState,
    config: McpServerConfig,
    tool: String,
}

#[async_trait]
impl ToolHandler for McpToolHandler {
    async fn invoke(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutput> {
        let bridge = self
            .state
            .remote_bridges
            .bridge(&self.config.name, ctx.conversation_id);
        bridge.set_elicitor(ctx.elicitor.clone());

        let key = ClientKey {
            user: ctx.user_subject.clone(),
            conversation_id: ctx.conversation_id,
            server: self.config.name.clone(),
        };
        let client = self
            .state
            .mcp
            .get_or_create(
                key,
                &self.config,
                ctx.bearer.clone(),
                Some(bridge as Arc<dyn ServerRequestHandler>),
            )
            .await?;

        let result = client.call_tool(&self.tool, args).await?;
        if result.is_error {
            return Err(Error::Tool {
                tool: format!("mcp/{}:{}", self.config.name, self.tool),
                message: result.text(),
            });
        }
        Ok(ToolOutput::Text(result.text()))
    }
}

/// Discover and register the remote tools of every MCP server an agent
/// lists. Connecting is lazy and cached by the client manager; tools are
/// named `mcp/<server>:<tool>`.
pub async fn refresh_remote_tools(
    state: &AppState,
    user: &str,
    conversation_id: Uuid,
    agent: &AgentDefinition,
    bearer: Option<String>,
) {
    for server_name in &agent.mcp_servers {
        let config = match state.workspace.load_mcp_server(server_name) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!(server = %server_name, error = %e, "mcp server config unavailable");
                continue;
            }
        };
        let bridge = state.remote_bridges.bridge(server_name, conversation_id);
        let key = ClientKey {
            user: user.to_string(),
            conversation_id,
            server: server_name.clone(),
        };
        let client = match state
            .mcp
            .get_or_create(
                key,
                &config,
                bearer.clone(),
                Some(bridge as Arc<dyn ServerRequestHandler>),
            )
            .await
        {
            Ok(client) => client,
            Err(e) => {
                tracing::warn!(server = %server_name, error = %e, "mcp server unreachable");
                continue;
            }
        };
        for tool in client.tools() {
            let name = format!("mcp/{}:{}", server_name, tool.name);
            if state.registry.get(&name).is_some() {
                continue;
            }
            state.registry.register(agently_tools::registry::ToolEntry {
                definition: ToolDefinition {
                    name,
                    description: tool.description.clone(),
                    input_schema: tool.input_schema.clone(),
                    output_schema: None,
                    tags: vec!["mcp".into(), server_name.clone()],
                },
                source: ToolSourceKind::RemoteMcp,
                handler: Arc::new(McpToolHandler {
                    state: state.clone(),
                    config: config.clone(),
                    tool: tool.name.clone(),
                }),
                timeout: None,
                parallel_safe: true,
            });
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Catalogue
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tool definitions an agent is allowed to see.
pub fn catalogue_for_agent(state: &AppState, policy: &ToolPolicy) -> Vec<ToolDefinition> {
    state
        .registry
        .list(false)
        .into_iter()
        .filter(|def| policy.exposes(&def.name))
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Execution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn hash_args(args: &Value) -> String {
    hex::encode(Sha256::digest(args.to_string().as_bytes()))
}

/// Execute one tool call end to end. Returns `(serialized result,
/// is_error)` — errors are fed back to the model, never thrown past the
/// round loop.
pub async fn execute_tool(
    state: &AppState,
    ctx: &ToolContext,
    policy: &ToolPolicy,
    name: &str,
    raw_args: Value,
    deadline: Option<tokio::time::Instant>,
) -> (String, bool) {
    let canonical = canonical_name(name);

    // ── Policy ────────────────────────────────────────────────────
    match policy.evaluate(&canonical) {
        PolicyDecision::Allow => {}
        PolicyDecision::Deny { reason } => {
            record_denied(state, ctx, &canonical, &raw_args, &reason);
            return (
                json!({ "declined": true, "reason": reason }).to_string(),
                true,
            );
        }
        PolicyDecision::Ask => {
            let approval = ctx
                .elicit(
                    Some(format!("Approve execution of {canonical}?")),
                    json!({
                        "type": "object",
                        "properties": {
                            "approve": { "type": "boolean" },
                            "reason": { "type": "string" }
                        },
                        "required": ["approve"]
                    }),
                )
                .await;
            let approved = matches!(
                &approval,
                Ok(ElicitationOutcome::Accept { payload })
                    if payload.get("approve").and_then(Value::as_bool) == Some(true)
            );
            if !approved {
                let reason = match approval {
                    Ok(ElicitationOutcome::Decline { reason }) => {
                        reason.unwrap_or_else(|| "declined by user".into())
                    }
                    Ok(ElicitationOutcome::Timeout) => "approval timed out".into(),
                    Ok(_) => "not approved".into(),
                    Err(e) => format!("approval unavailable: {e}"),
                };
                record_denied(state, ctx, &canonical, &raw_args, &reason);
                return (
                    json!({ "declined": true, "reason": reason }).to_string(),
                    true,
                );
            }
        }
    }

    // ── Lookup and argument conversion ────────────────────────────
    let Some(entry) = state.registry.get(&canonical) else {
        return (format!("unknown tool: {canonical}"), true);
    };
    let args = convert_args(&entry.definition.input_schema, raw_args);
    let arg_hash = hash_args(&args);

    // ── Record + start event ──────────────────────────────────────
    let record = ToolCallRecord {
        id: Uuid::new_v4(),
        turn_id: ctx.turn_id,
        tool_name: canonical.clone(),
        arg_hash: arg_hash.clone(),
        input_payload_id: None,
        output_payload_id: None,
        status: ToolCallStatus::Running,
        started_at: chrono::Utc::now(),
        ended_at: None,
        retries: 0,
        error: None,
    };
    let record_id = record.id;
    if let Err(e) = state.store.insert_tool_call(&record) {
        tracing::warn!(tool = %canonical, error = %e, "tool call record insert failed");
    }
    state.hub.publish(
        ctx.conversation_id,
        ctx.turn_id,
        None,
        EventKind::ToolOp,
        json!({
            "op": "start",
            "call_id": record_id,
            "name": canonical,
            "arg_hash": arg_hash,
        }),
    );

    // ── Timeout resolution: request override, tool floor, turn
    //    deadline — the minimum wins. ─────────────────────────────
    let mut timeout = state.registry.resolve_timeout(
        &canonical,
        ctx.timeout,
        Duration::from_secs(state.config.default.tool_call_timeout_sec),
    );
    if let Some(deadline) = deadline {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        timeout = timeout.min(remaining);
    }

    // ── Invoke with retry budget ──────────────────────────────────
    let started = std::time::Instant::now();
    let mut retries = 0u32;
    let outcome = loop {
        let attempt = tokio::time::timeout(timeout, entry.handler.invoke(ctx, args.clone())).await;
        let result = match attempt {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(format!(
                "{canonical} after {}s",
                timeout.as_secs()
            ))),
        };
        match result {
            Ok(output) => break Ok(output),
            Err(e) if e.is_retryable() && retries < MAX_TOOL_RETRIES => {
                retries += 1;
                let backoff = RETRY_BACKOFF * 2u32.pow(retries - 1);
                tracing::warn!(tool = %canonical, retries, error = %e, "retrying tool call");
                tokio::time::sleep(backoff).await;
            }
            Err(e) => break Err(e),
        }
    };
    let duration_ms = started.elapsed().as_millis() as u64;

    // ── Finish record + event ─────────────────────────────────────
    match outcome {
        Ok(output) => {
            let text = output.serialize();
            if let Err(e) =
                state
                    .store
                    .finish_tool_call(record_id, ToolCallStatus::Succeeded, None, retries, None)
            {
                tracing::warn!(tool = %canonical, error = %e, "tool call record update failed");
            }
            state.hub.publish(
                ctx.conversation_id,
                ctx.turn_id,
                None,
                EventKind::ToolOp,
                json!({
                    "op": "finish",
                    "call_id": record_id,
                    "name": canonical,
                    "arg_hash": arg_hash,
                    "duration_ms": duration_ms,
                    "output_bytes": text.len(),
                }),
            );
            (text, false)
        }
        Err(e) => {
            let message = e.to_string();
            if let Err(e) = state.store.finish_tool_call(
                record_id,
                ToolCallStatus::Failed,
                None,
                retries,
                Some(&message),
            ) {
                tracing::warn!(tool = %canonical, error = %e, "tool call record update failed");
            }
            state.hub.publish(
                ctx.conversation_id,
                ctx.turn_id,
                None,
                EventKind::ToolOp,
                json!({
                    "op": "error",
                    "call_id": record_id,
                    "name": canonical,
                    "arg_hash": arg_hash,
                    "duration_ms": duration_ms,
                    "error": message,
                }),
            );
            (message, true)
        }
    }
}

fn record_denied(state: &AppState, ctx: &ToolContext, name: &str, args: &Value, reason: &str) {
    let record = ToolCallRecord {
        id: Uuid::new_v4(),
        turn_id: ctx.turn_id,
        tool_name: name.to_string(),
        arg_hash: hash_args(args),
        input_payload_id: None,
        output_payload_id: None,
        status: ToolCallStatus::Denied,
        started_at: chrono::Utc::now(),
        ended_at: Some(chrono::Utc::now()),
        retries: 0,
        error: Some(reason.to_string()),
    };
    if let Err(e) = state.store.insert_tool_call(&record) {
        tracing::warn!(tool = %name, error = %e, "denied tool record insert failed");
    }
    state.hub.publish(
        ctx.conversation_id,
        ctx.turn_id,
        None,
        EventKind::ToolOp,
        json!({
            "op": "error",
            "call_id": record.id,
            "name": name,
            "denied": true,
            "error": reason,
        }),
    );
}
