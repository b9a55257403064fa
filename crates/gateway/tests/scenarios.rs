//! End-to-end scenarios driven through the public runtime surface with
//! scripted providers: post a message, observe events, inspect the
//! store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use agently_domain::config::Config;
use agently_domain::error::Result;
use agently_domain::model::{
    ElicitationOutcome, MessageRole, Schedule, Trigger, TurnStatus,
};
use agently_providers::scripted::{EchoProvider, ScriptedProvider};
use agently_providers::{LlmProvider, ProviderRegistry};
use agently_tools::registry::ToolEntry;
use agently_tools::{ToolContext, ToolHandler, ToolOutput, ToolSourceKind};

use agently_gateway::api::elicitations::resolve_and_deliver;
use agently_gateway::bootstrap;
use agently_gateway::runtime::events::EventKind;
use agently_gateway::runtime::scheduler::Watchdog;
use agently_gateway::runtime::turn::{self, PostMessageRequest};
use agently_gateway::state::AppState;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn test_state(provider: Arc<dyn LlmProvider>) -> (tempfile::TempDir, AppState) {
    let dir = tempfile::tempdir().unwrap();
    let mut config = Config::default();
    config.workspace_root = Some(dir.path().to_path_buf());
    config.default.elicitation_timeout_sec = 5;
    config.orchestrator.turn_timeout_sec = 30;

    let mut providers = ProviderRegistry::new();
    providers.register(provider);

    let state = bootstrap::build_app_state(Arc::new(config), providers).unwrap();
    (dir, state)
}

async fn post(state: &AppState, conversation_id: Uuid, content: &str) -> (Uuid, Uuid) {
    turn::post_message(
        state,
        PostMessageRequest {
            conversation_id,
            content: content.to_string(),
            agent: None,
            model: None,
            context: Map::new(),
            attachments: Vec::new(),
            user_subject: "tester".to_string(),
            bearer: None,
        },
    )
    .await
    .unwrap()
}

async fn wait_for_status(state: &AppState, turn_id: Uuid, status: TurnStatus) {
    for _ in 0..200 {
        let turn = state.store.get_turn(turn_id).unwrap().unwrap();
        if turn.status == status {
            return;
        }
        assert!(
            !turn.status.is_terminal() || status.is_terminal(),
            "turn went terminal ({:?}) while waiting for {:?} ({:?})",
            turn.status,
            status,
            turn.error,
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("turn {turn_id} never reached {status:?}");
}

struct MathAdd;

#[async_trait]
impl ToolHandler for MathAdd {
    async fn invoke(&self, _ctx: &ToolContext, args: Value) -> Result<ToolOutput> {
        let a = args.get("a").and_then(Value::as_i64).unwrap_or(0);
        let b = args.get("b").and_then(Value::as_i64).unwrap_or(0);
        Ok(ToolOutput::Text((a + b).to_string()))
    }
}

fn register_math_add(state: &AppState) {
    state.registry.register(ToolEntry {
        definition: agently_domain::chat::ToolDefinition {
            name: "math:add".into(),
            description: "Add two integers.".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "a": { "type": "integer" },
                    "b": { "type": "integer" }
                },
                "required": ["a", "b"]
            }),
            output_schema: None,
            tags: Vec::new(),
        },
        source: ToolSourceKind::Internal,
        handler: Arc::new(MathAdd),
        timeout: None,
        parallel_safe: true,
    });
}

/// A weather tool that needs `{city}` and elicits it when missing.
struct WeatherLookup;

#[async_trait]
impl ToolHandler for WeatherLookup {
    async fn invoke(&self, ctx: &ToolContext, args: Value) -> Result<ToolOutput> {
        let city = match args.get("city").and_then(Value::as_str) {
            Some(city) => city.to_string(),
            None => {
                let outcome = ctx
                    .elicit(
                        Some("Which city?".into()),
                        json!({
                            "type": "object",
                            "properties": { "city": { "type": "string" } },
                            "required": ["city"]
                        }),
                    )
                    .await?;
                match outcome {
                    ElicitationOutcome::Accept { payload } => payload
                        .get("city")
                        .and_then(Value::as_str)
                        .unwrap_or("unknown")
                        .to_string(),
                    ElicitationOutcome::Decline { reason } => {
                        return Ok(ToolOutput::Json(json!({
                            "declined": true,
                            "reason": reason,
                        })))
                    }
                    ElicitationOutcome::Timeout => {
                        return Ok(ToolOutput::Json(json!({
                            "declined": true,
                            "reason": "timeout",
                        })))
                    }
                }
            }
        };
        Ok(ToolOutput::Text(format!("sunny in {city}")))
    }
}

fn register_weather(state: &AppState) {
    state.registry.register(ToolEntry {
        definition: agently_domain::chat::ToolDefinition {
            name: "geo:weather".into(),
            description: "Weather for a city.".into(),
            input_schema: json!({
                "type": "object",
                "properties": { "city": { "type": "string" } }
            }),
            output_schema: None,
            tags: Vec::new(),
        },
        source: ToolSourceKind::Internal,
        handler: Arc::new(WeatherLookup),
        timeout: None,
        parallel_safe: false,
    });
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 1: simple chat
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn simple_chat_reaches_succeeded() {
    let provider = Arc::new(ScriptedProvider::new(vec![ScriptedProvider::text_round(
        "Hello there!",
    )]));
    let (_dir, state) = test_state(provider);
    let conv = state.store.create_conversation("tester", None).unwrap();

    let (turn_id, _message_id) = post(&state, conv.id, "hello").await;
    let turn = turn::wait_for_turn(&state, conv.id, turn_id, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(turn.status, TurnStatus::Succeeded);

    let messages = state.store.get_messages(conv.id, 0).unwrap();
    let roles: Vec<MessageRole> = messages.iter().map(|m| m.role).collect();
    assert_eq!(roles, vec![MessageRole::User, MessageRole::Assistant]);

    let assistant = &messages[1];
    assert!(!assistant.interim);
    assert_eq!(assistant.content.as_deref(), Some("Hello there!"));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 2: tool round trip
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn tool_round_trip_math_add() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedProvider::tool_round("c1", "math:add", json!({ "a": 2, "b": 3 })),
        ScriptedProvider::text_round("The answer is 5."),
    ]));
    let (_dir, state) = test_state(provider);
    register_math_add(&state);
    let conv = state.store.create_conversation("tester", None).unwrap();

    let (turn_id, _) = post(&state, conv.id, "add 2 and 3").await;
    let turn = turn::wait_for_turn(&state, conv.id, turn_id, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(turn.status, TurnStatus::Succeeded);

    // Exactly one tool_op start for math:add.
    let events = state.hub.replay(conv.id, 0);
    let starts: Vec<_> = events
        .iter()
        .filter(|e| {
            e.kind == EventKind::ToolOp
                && e.payload.get("op").and_then(Value::as_str) == Some("start")
                && e.payload.get("name").and_then(Value::as_str) == Some("math:add")
        })
        .collect();
    assert_eq!(starts.len(), 1);

    // The tool message holds the result, created after the start event.
    let messages = state.store.get_messages(conv.id, 0).unwrap();
    let tool_message = messages
        .iter()
        .find(|m| m.role == MessageRole::Tool)
        .expect("tool message");
    assert_eq!(tool_message.content.as_deref(), Some("5"));
    assert!(tool_message.created_at >= starts[0].created_at);

    let final_text = turn::final_assistant_text(&state, conv.id, turn_id).unwrap();
    assert!(final_text.contains('5'));

    // The tool call record finished successfully.
    let records = state.store.list_tool_calls(turn_id).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].tool_name, "math:add");
    assert_eq!(
        records[0].status,
        agently_domain::model::ToolCallStatus::Succeeded
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 3: elicitation loop (accept)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn elicitation_accept_resumes_turn() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedProvider::tool_round("c1", "geo:weather", json!({})),
        ScriptedProvider::text_round("It is sunny in Paris."),
    ]));
    let (_dir, state) = test_state(provider);
    register_weather(&state);
    let conv = state.store.create_conversation("tester", None).unwrap();

    let (turn_id, _) = post(&state, conv.id, "what's the weather?").await;
    wait_for_status(&state, turn_id, TurnStatus::WaitingElicitation).await;

    let pending = state.store.list_pending_elicitations(conv.id).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].requested_schema["required"][0], "city");

    let resolved = resolve_and_deliver(
        &state,
        &pending[0],
        ElicitationOutcome::Accept {
            payload: json!({ "city": "Paris" }),
        },
    )
    .unwrap();
    assert_eq!(
        resolved.status,
        agently_domain::model::ElicitationStatus::Accepted
    );

    let turn = turn::wait_for_turn(&state, conv.id, turn_id, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(turn.status, TurnStatus::Succeeded);

    let messages = state.store.get_messages(conv.id, 0).unwrap();
    let tool_message = messages.iter().find(|m| m.role == MessageRole::Tool).unwrap();
    assert_eq!(tool_message.content.as_deref(), Some("sunny in Paris"));

    assert!(state.store.list_pending_elicitations(conv.id).unwrap().is_empty());
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 4: elicitation decline
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn elicitation_decline_still_succeeds() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedProvider::tool_round("c1", "geo:weather", json!({})),
        ScriptedProvider::text_round("Understood, I won't look up the weather."),
    ]));
    let (_dir, state) = test_state(provider);
    register_weather(&state);
    let conv = state.store.create_conversation("tester", None).unwrap();

    let (turn_id, _) = post(&state, conv.id, "what's the weather?").await;
    wait_for_status(&state, turn_id, TurnStatus::WaitingElicitation).await;

    let pending = state.store.list_pending_elicitations(conv.id).unwrap();
    resolve_and_deliver(
        &state,
        &pending[0],
        ElicitationOutcome::Decline {
            reason: Some("no".into()),
        },
    )
    .unwrap();

    let turn = turn::wait_for_turn(&state, conv.id, turn_id, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(turn.status, TurnStatus::Succeeded);

    // The tool fed a structured decline back to the model.
    let messages = state.store.get_messages(conv.id, 0).unwrap();
    let tool_message = messages.iter().find(|m| m.role == MessageRole::Tool).unwrap();
    let decline: Value = serde_json::from_str(tool_message.content.as_deref().unwrap()).unwrap();
    assert_eq!(decline["declined"], true);
    assert_eq!(decline["reason"], "no");

    // Replayed resolution is a no-op that reports the stored outcome.
    let replay = resolve_and_deliver(
        &state,
        &pending[0],
        ElicitationOutcome::Accept {
            payload: json!({ "city": "Berlin" }),
        },
    )
    .unwrap();
    assert_eq!(
        replay.status,
        agently_domain::model::ElicitationStatus::Declined
    );
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 5: concurrent conversations
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn thirty_two_concurrent_conversations() {
    let (_dir, state) = test_state(Arc::new(EchoProvider::new()));

    let mut handles = Vec::new();
    for i in 0..32 {
        let state = state.clone();
        handles.push(tokio::spawn(async move {
            let conv = state.store.create_conversation("tester", None).unwrap();
            let (turn_id, _) = post(&state, conv.id, &format!("hello {i}")).await;
            let turn = turn::wait_for_turn(&state, conv.id, turn_id, Duration::from_secs(20))
                .await
                .unwrap();
            (conv.id, turn.status)
        }));
    }

    for handle in handles {
        let (conv_id, status) = handle.await.unwrap();
        assert_eq!(status, TurnStatus::Succeeded);

        // Per-conversation event stream stays ordered.
        let events = state.hub.replay(conv_id, 0);
        assert!(!events.is_empty());
        let cursors: Vec<u64> = events.iter().map(|e| e.cursor).collect();
        let mut sorted = cursors.clone();
        sorted.sort_unstable();
        assert_eq!(cursors, sorted);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 6: scheduler lease across two workers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn scheduler_lease_admits_exactly_one_worker() {
    let (_dir, state) = test_state(Arc::new(EchoProvider::new()));

    let schedule = Schedule {
        id: Uuid::new_v4(),
        name: "ping".into(),
        conversation_id: None,
        agent_id: None,
        model_id: None,
        content: "scheduled hello".into(),
        user_subject: "tester".into(),
        trigger: Trigger::At { at: chrono::Utc::now() },
        next_due_at: chrono::Utc::now() - chrono::Duration::seconds(1),
        lease_owner: None,
        lease_expires_at: None,
        last_status: None,
        enabled: true,
    };
    state.store.upsert_schedule(&schedule).unwrap();

    let worker_a = Watchdog::new(state.clone());
    let worker_b = Watchdog::new(state.clone());
    assert_ne!(worker_a.owner(), worker_b.owner());

    // First worker claims the row; the second observes lease contention.
    worker_a.tick().await.unwrap();
    let contended = state
        .store
        .claim_due_schedules(
            worker_b.owner(),
            chrono::Duration::seconds(60),
            chrono::Utc::now(),
            10,
        )
        .unwrap();
    assert!(contended.is_empty(), "second worker must not steal the lease");
    worker_b.tick().await.unwrap();

    // Exactly one run happens and the one-shot schedule retires.
    for _ in 0..200 {
        let row = state.store.get_schedule(schedule.id).unwrap().unwrap();
        if row.last_status.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    let row = state.store.get_schedule(schedule.id).unwrap().unwrap();
    assert_eq!(row.last_status.as_deref(), Some("succeeded"));
    assert!(!row.enabled);
    assert!(row.lease_owner.is_none());

    // One conversation, one turn, driven through the same pipeline.
    let conversations = state.store.list_conversations(Some("tester")).unwrap();
    assert_eq!(conversations.len(), 1);
    let turns = state.store.list_turns(conversations[0].id).unwrap();
    assert_eq!(turns.len(), 1);
    assert_eq!(turns[0].status, TurnStatus::Succeeded);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Overflow wrapper
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct BigOutput;

#[async_trait]
impl ToolHandler for BigOutput {
    async fn invoke(&self, _ctx: &ToolContext, _args: Value) -> Result<ToolOutput> {
        Ok(ToolOutput::Text("x".repeat(64 * 1024)))
    }
}

#[tokio::test]
async fn oversized_tool_output_becomes_payload_with_wrapper() {
    let provider = Arc::new(ScriptedProvider::new(vec![
        ScriptedProvider::tool_round("c1", "dump:all", json!({})),
        ScriptedProvider::text_round("done"),
    ]));
    let (_dir, state) = test_state(provider);
    state.registry.register(ToolEntry {
        definition: agently_domain::chat::ToolDefinition {
            name: "dump:all".into(),
            description: "Dump a large blob.".into(),
            input_schema: json!({ "type": "object", "properties": {} }),
            output_schema: None,
            tags: Vec::new(),
        },
        source: ToolSourceKind::Internal,
        handler: Arc::new(BigOutput),
        timeout: None,
        parallel_safe: true,
    });
    let conv = state.store.create_conversation("tester", None).unwrap();

    let (turn_id, _) = post(&state, conv.id, "dump everything").await;
    let turn = turn::wait_for_turn(&state, conv.id, turn_id, Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(turn.status, TurnStatus::Succeeded);

    let messages = state.store.get_messages(conv.id, 0).unwrap();
    let tool_message = messages.iter().find(|m| m.role == MessageRole::Tool).unwrap();

    // The transcript carries the YAML wrapper, not the blob.
    let wrapper = tool_message.content.as_deref().unwrap();
    assert!(wrapper.contains("overflow: true"));
    assert!(wrapper.contains("messageId:"));
    assert!(wrapper.contains("nextRange:"));
    assert!(wrapper.len() < 1024);

    // The full content is payload-addressed and byte-exact.
    let payload_id = tool_message.payload_id.as_deref().unwrap();
    let (meta, bytes) = state.store.read_payload(payload_id).unwrap().unwrap();
    assert_eq!(meta.size, 64 * 1024);
    assert_eq!(bytes.len(), 64 * 1024);
    assert!(bytes.iter().all(|&b| b == b'x'));
}
