//! Conversation endpoints: create/list, post a message, read the
//! transcript, cancel the running turn.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::api::{api_error, domain_error, user_subject};
use crate::runtime::turn::{self, Attachment, PostMessageRequest};
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct CreateConversationRequest {
    #[serde(default)]
    pub parent: Option<Uuid>,
}

pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<CreateConversationRequest>>,
) -> impl IntoResponse {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    match state
        .store
        .create_conversation(&user_subject(&headers), req.parent)
    {
        Ok(conversation) => Json(json!({ "id": conversation.id })).into_response(),
        Err(e) => domain_error(e),
    }
}

pub async fn list(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    match state.store.list_conversations(Some(&user_subject(&headers))) {
        Ok(conversations) => Json(conversations).into_response(),
        Err(e) => domain_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct AttachmentBody {
    pub name: String,
    #[serde(default = "default_media_type")]
    pub media_type: String,
    pub text: String,
}

fn default_media_type() -> String {
    "text/plain".to_string()
}

/// Bearer token from the request, reused toward HTTPS downstreams only.
fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

#[derive(Debug, Deserialize)]
pub struct PostMessageBody {
    pub content: String,
    #[serde(default)]
    pub agent: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub context: Map<String, Value>,
    #[serde(default)]
    pub attachments: Vec<AttachmentBody>,
}

pub async fn post_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    Json(body): Json<PostMessageBody>,
) -> impl IntoResponse {
    if body.content.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "content must not be empty");
    }

    let req = PostMessageRequest {
        conversation_id: id,
        content: body.content,
        agent: body.agent,
        model: body.model,
        context: body.context,
        attachments: body
            .attachments
            .into_iter()
            .map(|a| Attachment {
                name: a.name,
                media_type: a.media_type,
                bytes: a.text.into_bytes(),
            })
            .collect(),
        user_subject: user_subject(&headers),
        bearer: bearer_token(&headers),
    };

    match turn::post_message(&state, req).await {
        Ok((turn_id, message_id)) => {
            Json(json!({ "id": message_id, "turnId": turn_id })).into_response()
        }
        Err(e) => domain_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct TranscriptQuery {
    #[serde(default)]
    pub since: i64,
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<TranscriptQuery>,
) -> impl IntoResponse {
    if let Ok(None) = state.store.get_conversation(id) {
        return api_error(StatusCode::NOT_FOUND, format!("conversation {id} not found"));
    }
    let messages = match state.store.get_messages(id, query.since) {
        Ok(messages) => messages,
        Err(e) => return domain_error(e),
    };
    let turns = match state.store.list_turns(id) {
        Ok(turns) => turns,
        Err(e) => return domain_error(e),
    };
    let since = messages.last().map(|m| m.seq).unwrap_or(query.since);
    Json(json!({
        "messages": messages,
        "turns": turns,
        "since": since,
    }))
    .into_response()
}

pub async fn cancel(State(state): State<AppState>, Path(id): Path<Uuid>) -> impl IntoResponse {
    let canceled = state.cancel.cancel(id);
    Json(json!({ "canceled": canceled }))
}
