//! Turn orchestration.
//!
//! [`post_message`] validates the request, atomically creates the queued
//! turn plus its user message, and spawns the round loop; the ids return
//! to the caller immediately and progress streams through the event hub.
//!
//! A turn is a bounded loop over rounds: materialize the prompt from the
//! store, stream one LLM call into an interim assistant message, then
//! either finalize (no tool calls) or execute the planned calls and go
//! around again. Cancellation and the turn deadline are checked at every
//! suspension point; elicitations park the turn in `waiting_elicitation`
//! until the user answers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tokio::time::Instant;
use tracing::Instrument;
use uuid::Uuid;

use agently_domain::chat::{ChatMessage, ToolCall};
use agently_domain::error::{Error, Result};
use agently_domain::model::{
    Elicitation, ElicitationOutcome, ElicitationStatus, MessageRole, TurnStatus,
};
use agently_domain::stream::{StreamEvent, Usage};
use agently_providers::ChatRequest;
use agently_store::NewMessage;
use agently_tools::{Elicitor, ToolContext};

use crate::runtime::cancel::CancelToken;
use crate::runtime::elicitation::ElicitKey;
use crate::runtime::events::EventKind;
use crate::runtime::policy::ToolPolicy;
use crate::runtime::{tools, transition_turn, truncate_str};
use crate::state::AppState;
use crate::workspace::AgentDefinition;

/// Window within which an identical final assistant text is treated as a
/// provider-retry echo and suppressed from streaming.
const DUPLICATE_WINDOW: Duration = Duration::from_secs(5);

/// How long the orchestrator waits for cooperative shutdown after a
/// cancellation signal.
pub const CANCEL_GRACE: Duration = Duration::from_secs(5);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Request shape
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct Attachment {
    pub name: String,
    pub media_type: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct PostMessageRequest {
    pub conversation_id: Uuid,
    pub content: String,
    /// Workspace agent name; `None` uses the default agent.
    pub agent: Option<String>,
    /// Model spec override (workspace model name or `provider/model`).
    pub model: Option<String>,
    /// Caller context merged into the prompt as template variables.
    pub context: Map<String, Value>,
    pub attachments: Vec<Attachment>,
    pub user_subject: String,
    /// Bearer token from the originating request, reusable toward HTTPS
    /// downstreams only (authority matching).
    pub bearer: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// post_message
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Accept a user turn. Returns `(turn_id, message_id)` immediately; the
/// round loop runs on its own task under the conversation permit.
pub async fn post_message(state: &AppState, req: PostMessageRequest) -> Result<(Uuid, Uuid)> {
    let agent = state.workspace.load_agent(req.agent.as_deref())?;

    // Model resolution: explicit override, workspace model document, or
    // the agent's own spec.
    let model_spec = match &req.model {
        Some(name) => Some(
            state
                .workspace
                .load_model(name)
                .map(|m| m.spec)
                .unwrap_or_else(|_| name.clone()),
        ),
        None => agent.model.clone(),
    };

    let policy_snapshot = agent.tools.snapshot();
    let (turn, message) = state.store.post_user_message(
        req.conversation_id,
        &req.content,
        Some(&agent.name),
        model_spec.as_deref(),
        Some(&policy_snapshot),
    )?;

    // Attachments become content-addressed payloads referenced from the
    // transcript.
    for attachment in &req.attachments {
        let payload_id = state
            .store
            .write_payload(&attachment.bytes, &attachment.media_type)?;
        state.store.append_message(NewMessage {
            id: None,
            turn_id: turn.id,
            conversation_id: req.conversation_id,
            role: MessageRole::User,
            interim: false,
            content: Some(format!(
                "[attachment {} ({}) payload:{payload_id}]",
                attachment.name, attachment.media_type
            )),
            payload_id: Some(payload_id),
            tool_name: None,
            tool_call_id: None,
            elicitation_id: None,
            parent_id: Some(message.id),
        })?;
    }

    state.hub.publish(
        req.conversation_id,
        turn.id,
        Some(message.id),
        EventKind::Control,
        json!({ "status": "queued", "event": "turn.created" }),
    );

    let turn_id = turn.id;
    let message_id = message.id;
    let state = state.clone();
    let span = tracing::info_span!(
        "turn",
        turn_id = %turn_id,
        conversation_id = %req.conversation_id,
    );
    tokio::spawn(
        async move {
            run_turn(state, req, agent, model_spec, turn_id).await;
        }
        .instrument(span),
    );

    Ok((turn_id, message_id))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The spawned turn task
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn run_turn(
    state: AppState,
    req: PostMessageRequest,
    agent: AgentDefinition,
    model_spec: Option<String>,
    turn_id: Uuid,
) {
    let conversation_id = req.conversation_id;
    let _permit = state.locks.acquire(conversation_id).await;
    let cancel = state.cancel.register(conversation_id);
    let deadline = Instant::now() + Duration::from_secs(state.config.orchestrator.turn_timeout_sec);

    let result = run_rounds(&state, &req, &agent, model_spec, turn_id, &cancel, deadline).await;

    state.cancel.remove(conversation_id);

    if let Err(e) = result {
        let (status, message) = match &e {
            Error::Canceled => (TurnStatus::Canceled, "canceled".to_string()),
            Error::Timeout(_) => (TurnStatus::Failed, "timeout".to_string()),
            other => (TurnStatus::Failed, other.to_string()),
        };
        tracing::warn!(error = %message, "turn ended abnormally");
        if let Err(e) = transition_turn(&state, turn_id, conversation_id, status, Some(&message)) {
            tracing::warn!(error = %e, "failed to record turn failure");
        }
    }
}

/// A streamed round's outcome.
struct RoundOutput {
    message_id: Uuid,
    text: String,
    tool_calls: Vec<ToolCall>,
    usage: Option<Usage>,
}

#[allow(clippy::too_many_arguments)]
async fn run_rounds(
    state: &AppState,
    req: &PostMessageRequest,
    agent: &AgentDefinition,
    model_spec: Option<String>,
    turn_id: Uuid,
    cancel: &CancelToken,
    deadline: Instant,
) -> Result<()> {
    let conversation_id = req.conversation_id;
    transition_turn(state, turn_id, conversation_id, TurnStatus::Running, None)?;

    // Remote MCP tools for this agent join the catalogue before round 1.
    tools::refresh_remote_tools(
        state,
        &req.user_subject,
        conversation_id,
        agent,
        req.bearer.clone(),
    )
    .await;

    let elicitor: Arc<TurnElicitor> = Arc::new(TurnElicitor {
        state: state.clone(),
        conversation_id,
        turn_id,
        gate: tokio::sync::Mutex::new(()),
    });
    let (provider, model_name) = state.providers.resolve(model_spec.as_deref())?;
    let policy = &agent.tools;

    let mut total_usage = Usage::default();
    let mut last_final: Option<(String, std::time::Instant)> = None;

    for round in 0..state.config.orchestrator.max_rounds {
        if cancel.is_cancelled() {
            return Err(Error::Canceled);
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout("turn deadline".into()));
        }
        tracing::debug!(round, "round start");

        let round_output = stream_round(
            state,
            req,
            agent,
            &provider,
            model_name.clone(),
            turn_id,
            cancel,
            deadline,
        )
        .await?;

        if let Some(usage) = &round_output.usage {
            total_usage.add(usage);
        }

        // ── Final answer: no tool calls ───────────────────────────
        if round_output.tool_calls.is_empty() {
            state.store.finalize_message(round_output.message_id)?;

            let fingerprint = hex::encode(Sha256::digest(round_output.text.as_bytes()));
            let duplicate = last_final
                .as_ref()
                .map(|(prior, at)| *prior == fingerprint && at.elapsed() < DUPLICATE_WINDOW)
                .unwrap_or(false);
            if duplicate {
                tracing::debug!("suppressing duplicate final assistant content");
            } else {
                state.hub.publish(
                    conversation_id,
                    turn_id,
                    Some(round_output.message_id),
                    EventKind::Text,
                    json!({ "text": round_output.text, "interim": false }),
                );
            }

            let turn = state.store.set_turn_status(turn_id, TurnStatus::Succeeded, None)?;
            state.hub.publish(
                conversation_id,
                turn_id,
                Some(round_output.message_id),
                EventKind::Control,
                json!({
                    "status": turn.status.as_str(),
                    "usage": total_usage,
                }),
            );
            return Ok(());
        }

        // ── Tool rounds ───────────────────────────────────────────
        state.store.finalize_message(round_output.message_id)?;
        if !round_output.text.is_empty() {
            let fingerprint = hex::encode(Sha256::digest(round_output.text.as_bytes()));
            last_final = Some((fingerprint, std::time::Instant::now()));
            state.hub.publish(
                conversation_id,
                turn_id,
                Some(round_output.message_id),
                EventKind::Text,
                json!({ "text": round_output.text, "interim": false }),
            );
        }

        execute_plan(
            state,
            req,
            agent,
            policy,
            turn_id,
            &elicitor,
            &round_output.tool_calls,
            cancel,
            deadline,
        )
        .await?;
    }

    Err(Error::Other(format!(
        "round limit reached ({})",
        state.config.orchestrator.max_rounds
    )))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// One LLM round
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[allow(clippy::too_many_arguments)]
async fn stream_round(
    state: &AppState,
    req: &PostMessageRequest,
    agent: &AgentDefinition,
    provider: &Arc<dyn agently_providers::LlmProvider>,
    model_name: Option<String>,
    turn_id: Uuid,
    cancel: &CancelToken,
    deadline: Instant,
) -> Result<RoundOutput> {
    let conversation_id = req.conversation_id;
    let messages = build_prompt(state, req, agent)?;
    let tool_defs = tools::catalogue_for_agent(state, &agent.tools);

    // The interim assistant message this round streams into.
    let interim = state.store.append_message(NewMessage {
        id: None,
        turn_id,
        conversation_id,
        role: MessageRole::Assistant,
        interim: true,
        content: Some(String::new()),
        payload_id: None,
        tool_name: None,
        tool_call_id: None,
        elicitation_id: None,
        parent_id: None,
    })?;

    let chat_req = ChatRequest {
        messages,
        tools: tool_defs,
        temperature: Some(0.2),
        max_tokens: None,
        model: model_name,
    };

    let llm_span = tracing::info_span!(
        "llm.call",
        provider = provider.provider_id(),
        model = chat_req.model.as_deref().unwrap_or("default"),
    );

    // Transient transport errors opening the stream retry with backoff.
    let mut stream = {
        let mut attempt = 0u32;
        loop {
            match provider
                .chat_stream(chat_req.clone())
                .instrument(llm_span.clone())
                .await
            {
                Ok(stream) => break stream,
                Err(e) if e.is_retryable() && attempt < 2 => {
                    attempt += 1;
                    tracing::warn!(error = %e, attempt, "LLM stream open failed, retrying");
                    tokio::time::sleep(Duration::from_millis(250) * 2u32.pow(attempt - 1)).await;
                }
                Err(Error::Transport(t)) => {
                    let _ = state.store.finalize_message(interim.id);
                    return Err(Error::Provider {
                        provider: provider.provider_id().to_string(),
                        message: t,
                    });
                }
                Err(other) => {
                    let _ = state.store.finalize_message(interim.id);
                    return Err(other);
                }
            }
        }
    };

    let mut text = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::new();
    let mut usage: Option<Usage> = None;
    // call_id -> (tool_name, partial argument json)
    let mut assembly: std::collections::HashMap<String, (String, String)> =
        std::collections::HashMap::new();

    loop {
        if cancel.is_cancelled() {
            // Partial content stays in the transcript, marked final.
            let _ = state.store.finalize_message(interim.id);
            return Err(Error::Canceled);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            let _ = state.store.finalize_message(interim.id);
            return Err(Error::Timeout("turn deadline during stream".into()));
        }

        let event = match tokio::time::timeout(remaining, stream.next()).await {
            Ok(Some(Ok(event))) => event,
            Ok(Some(Err(e))) => {
                let _ = state.store.finalize_message(interim.id);
                return Err(e);
            }
            Ok(None) => break,
            Err(_) => {
                let _ = state.store.finalize_message(interim.id);
                return Err(Error::Timeout("turn deadline during stream".into()));
            }
        };

        match event {
            StreamEvent::Token { text: chunk } => {
                text.push_str(&chunk);
                state.store.update_interim(interim.id, &text)?;
                state.hub.publish(
                    conversation_id,
                    turn_id,
                    Some(interim.id),
                    EventKind::Text,
                    json!({ "text": text, "interim": true }),
                );
            }
            StreamEvent::ToolCallStarted { call_id, tool_name } => {
                assembly.insert(call_id, (tool_name, String::new()));
            }
            StreamEvent::ToolCallDelta { call_id, delta } => {
                if let Some((_, args)) = assembly.get_mut(&call_id) {
                    args.push_str(&delta);
                }
            }
            StreamEvent::ToolCallFinished {
                call_id,
                tool_name,
                arguments,
            } => {
                assembly.remove(&call_id);
                tool_calls.push(ToolCall {
                    call_id,
                    tool_name,
                    arguments,
                });
            }
            StreamEvent::Done { usage: u, .. } => {
                usage = u;
            }
            StreamEvent::Error { message } => {
                let _ = state.store.finalize_message(interim.id);
                return Err(Error::Provider {
                    provider: provider.provider_id().to_string(),
                    message,
                });
            }
        }
    }

    // Some providers only emit start/delta pairs; assemble the leftovers.
    for (call_id, (tool_name, args)) in assembly.drain() {
        let arguments = if args.trim().is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::from_str(&args).unwrap_or_else(|e| {
                tracing::warn!(call_id = %call_id, error = %e, "tool arguments are not valid JSON");
                Value::Object(Map::new())
            })
        };
        tool_calls.push(ToolCall {
            call_id,
            tool_name,
            arguments,
        });
    }

    Ok(RoundOutput {
        message_id: interim.id,
        text,
        tool_calls,
        usage,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Plan execution
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[allow(clippy::too_many_arguments)]
async fn execute_plan(
    state: &AppState,
    req: &PostMessageRequest,
    agent: &AgentDefinition,
    policy: &ToolPolicy,
    turn_id: Uuid,
    elicitor: &Arc<TurnElicitor>,
    plan: &[ToolCall],
    cancel: &CancelToken,
    deadline: Instant,
) -> Result<()> {
    let conversation_id = req.conversation_id;
    let make_ctx = || {
        let mut ctx = ToolContext::new(conversation_id, turn_id, req.user_subject.clone());
        ctx.elicitor = Some(elicitor.clone() as Arc<dyn Elicitor>);
        ctx.bearer = req.bearer.clone();
        ctx
    };

    let names: Vec<&str> = plan.iter().map(|tc| tc.tool_name.as_str()).collect();
    let parallel = agent.parallel_tool_calls && state.registry.all_parallel_safe(&names);

    // Tools get CANCEL_GRACE to wind down after a cancellation signal;
    // after that the turn is abandoned as canceled.
    let cancel_then_grace = async {
        while !cancel.is_cancelled() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        tokio::time::sleep(CANCEL_GRACE).await;
    };

    let run_all = async {
        if parallel {
            let futures: Vec<_> = plan
                .iter()
                .map(|tc| {
                    let ctx = make_ctx();
                    let span = tracing::info_span!("tool.call", tool = %tc.tool_name);
                    async move {
                        tools::execute_tool(
                            state,
                            &ctx,
                            policy,
                            &tc.tool_name,
                            tc.arguments.clone(),
                            Some(deadline),
                        )
                        .await
                    }
                    .instrument(span)
                })
                .collect();
            Ok(futures_util::future::join_all(futures).await)
        } else {
            let mut results = Vec::with_capacity(plan.len());
            for tc in plan {
                if cancel.is_cancelled() {
                    return Err(Error::Canceled);
                }
                let ctx = make_ctx();
                let span = tracing::info_span!("tool.call", tool = %tc.tool_name);
                let result = tools::execute_tool(
                    state,
                    &ctx,
                    policy,
                    &tc.tool_name,
                    tc.arguments.clone(),
                    Some(deadline),
                )
                .instrument(span)
                .await;
                results.push(result);
            }
            Ok(results)
        }
    };

    let results: Vec<(String, bool)> = tokio::select! {
        results = run_all => results?,
        _ = cancel_then_grace => return Err(Error::Canceled),
    };

    // Append tool-result messages in plan order; oversized results move
    // into a payload behind a YAML overflow wrapper.
    let limit = state.config.orchestrator.tool_output_limit;
    for (tc, (content, _is_error)) in plan.iter().zip(results) {
        if content.len() > limit {
            append_overflowed_tool_message(state, conversation_id, turn_id, tc, &content, limit)?;
        } else {
            state.store.append_message(NewMessage {
                id: None,
                turn_id,
                conversation_id,
                role: MessageRole::Tool,
                interim: false,
                content: Some(content),
                payload_id: None,
                tool_name: Some(tc.tool_name.clone()),
                tool_call_id: Some(tc.call_id.clone()),
                elicitation_id: None,
                parent_id: None,
            })?;
        }
    }
    Ok(())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OverflowWrapper {
    overflow: bool,
    message_id: Uuid,
    returned: usize,
    remaining: usize,
    next_range: String,
    hint: &'static str,
}

fn append_overflowed_tool_message(
    state: &AppState,
    conversation_id: Uuid,
    turn_id: Uuid,
    tc: &ToolCall,
    content: &str,
    limit: usize,
) -> Result<()> {
    let payload_id = state.store.write_payload(content.as_bytes(), "text/plain")?;
    let message_id = Uuid::new_v4();
    let total = content.len();
    let wrapper = OverflowWrapper {
        overflow: true,
        message_id,
        returned: 0,
        remaining: total,
        next_range: format!("0..{}", limit.min(total)),
        hint: "call internal:message-show with messageId, offset and length to read the content",
    };
    let wrapper_yaml = serde_yaml::to_string(&wrapper)
        .map_err(|e| Error::Other(format!("overflow wrapper: {e}")))?;

    state.store.append_message(NewMessage {
        id: Some(message_id),
        turn_id,
        conversation_id,
        role: MessageRole::Tool,
        interim: false,
        content: Some(wrapper_yaml),
        payload_id: Some(payload_id),
        tool_name: Some(tc.tool_name.clone()),
        tool_call_id: Some(tc.call_id.clone()),
        elicitation_id: None,
        parent_id: None,
    })?;
    tracing::debug!(
        tool = %tc.tool_name,
        total,
        limit,
        "tool result overflowed into payload"
    );
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Prompt materialization
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn build_prompt(
    state: &AppState,
    req: &PostMessageRequest,
    agent: &AgentDefinition,
) -> Result<Vec<ChatMessage>> {
    let mut system = agent.system_prompt.clone();

    let knowledge = state
        .workspace
        .read_knowledge(agent, state.config.default.match_options.max_files);
    for (name, content) in knowledge {
        system.push_str(&format!("\n\n## Knowledge: {name}\n{content}"));
    }

    if !req.context.is_empty() {
        let rendered = serde_json::to_string_pretty(&req.context)?;
        system.push_str(&format!("\n\nContext:\n{rendered}"));
    }

    let mut messages = vec![ChatMessage::system(&system)];
    for m in state.store.get_messages(req.conversation_id, 0)? {
        // In-flight interim content never enters the prompt.
        if m.interim {
            continue;
        }
        match m.role {
            MessageRole::User => {
                if let Some(content) = &m.content {
                    messages.push(ChatMessage::user(content));
                }
            }
            MessageRole::Assistant => {
                if let Some(content) = &m.content {
                    if !content.is_empty() {
                        messages.push(ChatMessage::assistant(content));
                    }
                }
            }
            MessageRole::Tool => {
                let call_id = m.tool_call_id.clone().unwrap_or_default();
                let content = m.content.clone().unwrap_or_default();
                messages.push(ChatMessage::tool_result(call_id, content));
            }
            MessageRole::System => {}
        }
    }
    Ok(messages)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TurnElicitor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The turn-scoped elicitation channel: persists the row, installs the
/// waiter(s), parks the turn in `waiting_elicitation`, and resumes it on
/// resolution. Elicitations serialize through the internal gate even
/// when the surrounding plan runs tools in parallel.
pub struct TurnElicitor {
    state: AppState,
    conversation_id: Uuid,
    turn_id: Uuid,
    gate: tokio::sync::Mutex<()>,
}

#[async_trait]
impl Elicitor for TurnElicitor {
    async fn elicit_keyed(
        &self,
        message: Option<String>,
        requested_schema: Value,
        rpc_id: Option<i64>,
        url: Option<String>,
    ) -> Result<ElicitationOutcome> {
        let _gate = self.gate.lock().await;
        let state = &self.state;

        let elicitation = Elicitation {
            id: Uuid::new_v4(),
            conversation_id: self.conversation_id,
            turn_id: self.turn_id,
            requested_schema: requested_schema.clone(),
            message: message.clone(),
            url,
            status: ElicitationStatus::Pending,
            created_at: Utc::now(),
            resolved_at: None,
            payload: None,
            decline_reason: None,
        };
        state.store.insert_elicitation(&elicitation)?;

        let uuid_key = ElicitKey::Id(elicitation.id);
        let mut rx_uuid = state.elicitations.register(self.conversation_id, uuid_key);
        let mut rx_rpc = rpc_id.map(|id| {
            state
                .elicitations
                .register(self.conversation_id, ElicitKey::Rpc(id))
        });

        // Park the turn. The transition may be a no-op when a previous
        // elicitation in the same plan already parked it.
        let _ = transition_turn(
            state,
            self.turn_id,
            self.conversation_id,
            TurnStatus::WaitingElicitation,
            None,
        );
        state.hub.publish(
            self.conversation_id,
            self.turn_id,
            None,
            EventKind::Elicitation,
            json!({ "phase": "pending", "elicitation": elicitation }),
        );

        let timeout = Duration::from_secs(state.config.default.elicitation_timeout_sec);
        let outcome = tokio::time::timeout(timeout, async {
            match rx_rpc.as_mut() {
                Some(rx_rpc) => tokio::select! {
                    outcome = rx_uuid.recv() => outcome,
                    outcome = rx_rpc.recv() => outcome,
                },
                None => rx_uuid.recv().await,
            }
        })
        .await;

        // Remove whichever keys were not consumed by delivery.
        state.elicitations.remove(self.conversation_id, uuid_key);
        if let Some(id) = rpc_id {
            state
                .elicitations
                .remove(self.conversation_id, ElicitKey::Rpc(id));
        }

        let outcome = match outcome {
            Ok(Some(outcome)) => outcome,
            Ok(None) => ElicitationOutcome::Decline {
                reason: Some("waiter replaced".into()),
            },
            Err(_) => {
                // Auto-decline on timeout.
                let timeout_outcome = ElicitationOutcome::Timeout;
                if let Err(e) = state
                    .store
                    .resolve_elicitation(elicitation.id, &timeout_outcome)
                {
                    tracing::warn!(error = %e, "elicitation timeout record failed");
                }
                state.hub.publish(
                    self.conversation_id,
                    self.turn_id,
                    None,
                    EventKind::Elicitation,
                    json!({
                        "phase": "resolved",
                        "id": elicitation.id,
                        "status": "timeout",
                    }),
                );
                timeout_outcome
            }
        };

        // Resume the turn unless it went terminal (cancellation) while
        // parked.
        let _ = transition_turn(
            state,
            self.turn_id,
            self.conversation_id,
            TurnStatus::Running,
            None,
        );

        tracing::debug!(
            elicitation_id = %elicitation.id,
            preview = %truncate_str(&format!("{outcome:?}"), 80),
            "elicitation resolved"
        );
        Ok(outcome)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Waiting helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Block until a turn reaches a terminal status. Used by virtual agent
/// tools, the scheduler, and the CLI.
pub async fn wait_for_turn(
    state: &AppState,
    conversation_id: Uuid,
    turn_id: Uuid,
    timeout: Duration,
) -> Result<agently_domain::model::Turn> {
    let deadline = Instant::now() + timeout;
    let mut since = 0u64;
    loop {
        let turn = state
            .store
            .get_turn(turn_id)?
            .ok_or_else(|| Error::Validation(format!("turn {turn_id} does not exist")))?;
        if turn.status.is_terminal() {
            return Ok(turn);
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::Timeout(format!("turn {turn_id} did not finish")));
        }
        let (_events, new_since) = state
            .hub
            .poll(
                conversation_id,
                since,
                Some(&[EventKind::Control]),
                remaining.min(Duration::from_secs(1)),
            )
            .await;
        since = new_since;
    }
}

/// The final (non-interim) assistant text of a turn.
pub fn final_assistant_text(
    state: &AppState,
    conversation_id: Uuid,
    turn_id: Uuid,
) -> Result<String> {
    let messages = state.store.get_messages(conversation_id, 0)?;
    Ok(messages
        .iter()
        .rev()
        .find(|m| m.turn_id == turn_id && m.role == MessageRole::Assistant && !m.interim)
        .and_then(|m| m.content.clone())
        .unwrap_or_default())
}
