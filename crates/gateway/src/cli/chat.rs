//! `agently chat` — interactive REPL.
//!
//! Sends each line as a user turn and streams the response inline. When
//! a turn raises an elicitation, the REPL prompts for each required
//! property in declaration order, validates the assembled payload
//! against the requested schema, and resumes the turn.

use std::sync::Arc;

use serde_json::{json, Map, Value};
use uuid::Uuid;

use agently_domain::config::Config;
use agently_domain::error::{Error, Result};
use agently_domain::model::{Elicitation, ElicitationOutcome};
use agently_providers::ProviderRegistry;

use crate::api::elicitations::{resolve_and_deliver, validate_payload};
use crate::bootstrap;
use crate::runtime::events::{EventEnvelope, EventKind};
use crate::runtime::turn::{self, PostMessageRequest};
use crate::state::AppState;

const CLI_USER: &str = "local";

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry point
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn chat(
    config: Arc<Config>,
    conversation: Option<Uuid>,
    mut agent: Option<String>,
    mut model: Option<String>,
) -> anyhow::Result<()> {
    let state = bootstrap::build_app_state(config, ProviderRegistry::new())?;
    bootstrap::spawn_background_tasks(&state);

    let mut conversation_id = match conversation {
        Some(id) => {
            if state.store.get_conversation(id)?.is_none() {
                anyhow::bail!("conversation {id} does not exist");
            }
            id
        }
        None => state.store.create_conversation(CLI_USER, None)?.id,
    };

    let history_path = dirs::home_dir()
        .unwrap_or_default()
        .join(".agently")
        .join("chat_history.txt");
    if let Some(parent) = history_path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let mut rl = rustyline::DefaultEditor::new()?;
    let _ = rl.load_history(&history_path);

    eprintln!("Agently interactive chat");
    eprintln!("Conversation: {conversation_id}  |  /help for commands, Ctrl+D to exit");
    eprintln!();

    loop {
        match rl.readline("you> ") {
            Ok(line) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                rl.add_history_entry(&line).ok();

                if let Some(command) = trimmed.strip_prefix('/') {
                    if handle_slash_command(
                        command,
                        &state,
                        &mut conversation_id,
                        &mut agent,
                        &mut model,
                    )? {
                        break;
                    }
                    continue;
                }

                if let Err(e) =
                    send_message(&state, conversation_id, &agent, &model, trimmed).await
                {
                    eprintln!("\x1B[31merror: {e}\x1B[0m");
                }
            }
            Err(rustyline::error::ReadlineError::Interrupted) => {
                eprintln!("(Ctrl+D or /exit to quit)");
                continue;
            }
            Err(rustyline::error::ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("\x1B[31mreadline error: {e}\x1B[0m");
                break;
            }
        }
    }

    let _ = rl.save_history(&history_path);
    Ok(())
}

/// Returns true when the REPL should exit.
fn handle_slash_command(
    command: &str,
    state: &AppState,
    conversation_id: &mut Uuid,
    agent: &mut Option<String>,
    model: &mut Option<String>,
) -> Result<bool> {
    let mut parts = command.split_whitespace();
    match parts.next().unwrap_or_default() {
        "exit" | "quit" => return Ok(true),
        "new" => {
            *conversation_id = state.store.create_conversation(CLI_USER, None)?.id;
            eprintln!("new conversation: {conversation_id}");
        }
        "agent" => {
            *agent = parts.next().map(str::to_string);
            eprintln!("agent: {}", agent.as_deref().unwrap_or("default"));
        }
        "model" => {
            *model = parts.next().map(str::to_string);
            eprintln!("model: {}", model.as_deref().unwrap_or("default"));
        }
        "help" => {
            eprintln!("/new          start a fresh conversation");
            eprintln!("/agent NAME   switch workspace agent");
            eprintln!("/model SPEC   override the model");
            eprintln!("/exit         quit");
        }
        other => eprintln!("unknown command: /{other}"),
    }
    Ok(false)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// One turn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn send_message(
    state: &AppState,
    conversation_id: Uuid,
    agent: &Option<String>,
    model: &Option<String>,
    content: &str,
) -> Result<()> {
    let since = state.hub.head_cursor(conversation_id);
    let (turn_id, _message_id) = turn::post_message(
        state,
        PostMessageRequest {
            conversation_id,
            content: content.to_string(),
            agent: agent.clone(),
            model: model.clone(),
            context: Map::new(),
            attachments: Vec::new(),
            user_subject: CLI_USER.to_string(),
            bearer: None,
        },
    )
    .await?;

    let (backlog, mut rx) = state.hub.subscribe(conversation_id, since);
    let mut printed = 0usize;
    let mut last_cursor = since;
    for envelope in backlog {
        last_cursor = last_cursor.max(envelope.cursor);
        if render_event(state, turn_id, &envelope, &mut printed).await? {
            return Ok(());
        }
    }
    loop {
        match rx.recv().await {
            Ok(envelope) => {
                last_cursor = last_cursor.max(envelope.cursor);
                if render_event(state, turn_id, &envelope, &mut printed).await? {
                    return Ok(());
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                // Recover the gap from the replay ring.
                for envelope in state.hub.replay(conversation_id, last_cursor) {
                    last_cursor = last_cursor.max(envelope.cursor);
                    if render_event(state, turn_id, &envelope, &mut printed).await? {
                        return Ok(());
                    }
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}

/// Render one event; returns true when the turn reached a terminal
/// status.
async fn render_event(
    state: &AppState,
    turn_id: Uuid,
    envelope: &EventEnvelope,
    printed: &mut usize,
) -> Result<bool> {
    if envelope.turn_id != turn_id {
        return Ok(false);
    }
    match envelope.kind {
        EventKind::Text => {
            let text = envelope
                .payload
                .get("text")
                .and_then(Value::as_str)
                .unwrap_or_default();
            if text.len() > *printed {
                print!("{}", &text[*printed..]);
                use std::io::Write;
                std::io::stdout().flush().ok();
                *printed = text.len();
            }
            let interim = envelope
                .payload
                .get("interim")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if !interim {
                println!();
            }
        }
        EventKind::ToolOp => {
            let name = envelope
                .payload
                .get("name")
                .and_then(Value::as_str)
                .unwrap_or("?");
            let op = envelope
                .payload
                .get("op")
                .and_then(Value::as_str)
                .unwrap_or("?");
            eprintln!("\x1B[2m[tool {name} {op}]\x1B[0m");
        }
        EventKind::Elicitation => {
            if envelope.payload.get("phase").and_then(Value::as_str) == Some("pending") {
                if let Some(raw) = envelope.payload.get("elicitation") {
                    let elicitation: Elicitation = serde_json::from_value(raw.clone())?;
                    prompt_elicitation(state, elicitation).await?;
                }
            }
        }
        EventKind::Control => {
            let status = envelope
                .payload
                .get("status")
                .and_then(Value::as_str)
                .unwrap_or_default();
            match status {
                "succeeded" => return Ok(true),
                "failed" | "canceled" => {
                    let error = envelope
                        .payload
                        .get("error")
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    eprintln!("\x1B[31m[turn {status}: {error}]\x1B[0m");
                    return Ok(true);
                }
                _ => {}
            }
        }
    }
    Ok(false)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inline elicitation awaiter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Prompt for each required property in declaration order, validate the
/// assembled payload, and resolve the elicitation. Typing `!decline
/// [reason]` at any prompt declines the whole request.
async fn prompt_elicitation(state: &AppState, elicitation: Elicitation) -> Result<()> {
    if let Some(url) = &elicitation.url {
        eprintln!("complete this step in your browser: {url}");
        eprintln!("(the turn resumes when the external flow calls back)");
        return Ok(());
    }
    if let Some(message) = &elicitation.message {
        eprintln!("\x1B[33m{message}\x1B[0m");
    }

    let schema = elicitation.requested_schema.clone();
    let empty = Map::new();
    let properties = schema
        .get("properties")
        .and_then(Value::as_object)
        .unwrap_or(&empty);
    let required: Vec<String> = schema
        .get("required")
        .and_then(Value::as_array)
        .map(|names| {
            names
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_else(|| properties.keys().cloned().collect());

    let mut payload = Map::new();
    for name in &required {
        let prop = properties.get(name).cloned().unwrap_or_else(|| json!({}));
        let type_name = prop
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("string")
            .to_string();
        let value = loop {
            let line = read_line_blocking(format!("{name} ({type_name})> ")).await?;
            let trimmed = line.trim();
            if let Some(reason) = trimmed.strip_prefix("!decline") {
                let reason = reason.trim();
                let outcome = ElicitationOutcome::Decline {
                    reason: (!reason.is_empty()).then(|| reason.to_string()),
                };
                resolve_and_deliver(state, &elicitation, outcome)?;
                return Ok(());
            }
            match coerce_input(&type_name, trimmed) {
                Some(value) => break value,
                None => eprintln!("expected a {type_name}, try again"),
            }
        };
        payload.insert(name.clone(), value);
    }

    let payload = Value::Object(payload);
    if let Err(e) = validate_payload(&schema, &payload) {
        eprintln!("\x1B[31manswer rejected: {e}\x1B[0m");
        resolve_and_deliver(
            state,
            &elicitation,
            ElicitationOutcome::Decline {
                reason: Some(e.to_string()),
            },
        )?;
        return Ok(());
    }
    resolve_and_deliver(state, &elicitation, ElicitationOutcome::Accept { payload })?;
    Ok(())
}

fn coerce_input(type_name: &str, raw: &str) -> Option<Value> {
    match type_name {
        "integer" => raw.parse::<i64>().ok().map(Value::from),
        "number" => raw.parse::<f64>().ok().and_then(|n| {
            serde_json::Number::from_f64(n).map(Value::Number)
        }),
        "boolean" => match raw {
            "true" | "yes" | "y" => Some(Value::Bool(true)),
            "false" | "no" | "n" => Some(Value::Bool(false)),
            _ => None,
        },
        _ => (!raw.is_empty()).then(|| Value::String(raw.to_string())),
    }
}

async fn read_line_blocking(prompt: String) -> Result<String> {
    tokio::task::spawn_blocking(move || {
        use std::io::Write;
        eprint!("{prompt}");
        std::io::stderr().flush().ok();
        let mut line = String::new();
        std::io::stdin()
            .read_line(&mut line)
            .map(|_| line)
            .map_err(Error::Io)
    })
    .await
    .map_err(|e| Error::Other(format!("stdin task failed: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coerce_input_by_declared_type() {
        assert_eq!(coerce_input("integer", "42"), Some(json!(42)));
        assert_eq!(coerce_input("boolean", "yes"), Some(json!(true)));
        assert_eq!(coerce_input("string", "Paris"), Some(json!("Paris")));
        assert_eq!(coerce_input("integer", "abc"), None);
        assert_eq!(coerce_input("string", ""), None);
    }
}
