//! Event streaming: long-lived SSE and the bounded short-poll.
//!
//! SSE framing is one `data:` JSON object per event terminated by a
//! blank line. A subscriber that falls behind the broadcast queue gets a
//! `lagged` marker, then the gap is recovered from the replay ring so
//! no control events are lost.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use futures_util::stream::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::runtime::events::{EventEnvelope, EventKind};
use crate::state::AppState;

/// Poll window bound.
const POLL_BOUND: Duration = Duration::from_secs(1);

#[derive(Debug, Default, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub since: u64,
    /// Comma-separated kinds: `text,tool_op,control,elicitation`.
    #[serde(default)]
    pub types: Option<String>,
}

fn parse_kinds(raw: Option<&str>) -> Option<Vec<EventKind>> {
    let raw = raw?;
    let kinds: Vec<EventKind> = raw
        .split(',')
        .filter_map(|s| EventKind::parse(s.trim()))
        .collect();
    (!kinds.is_empty()).then_some(kinds)
}

fn wants(kinds: &Option<Vec<EventKind>>, envelope: &EventEnvelope) -> bool {
    kinds
        .as_ref()
        .map(|ks| ks.contains(&envelope.kind))
        .unwrap_or(true)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /conversations/:id/stream
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn sse(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<StreamQuery>,
) -> impl IntoResponse {
    let kinds = parse_kinds(query.types.as_deref());
    let stream = make_sse_stream(state, id, query.since, kinds);
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn make_sse_stream(
    state: AppState,
    conversation_id: Uuid,
    since: u64,
    kinds: Option<Vec<EventKind>>,
) -> impl Stream<Item = Result<Event, std::convert::Infallible>> {
    async_stream::stream! {
        let (backlog, mut rx) = state.hub.subscribe(conversation_id, since);
        let mut last_cursor = since;
        let mut last_turn_id = Uuid::nil();

        for envelope in backlog {
            last_cursor = last_cursor.max(envelope.cursor);
            last_turn_id = envelope.turn_id;
            if wants(&kinds, &envelope) {
                yield Ok(sse_event(&envelope));
            }
        }

        loop {
            match rx.recv().await {
                Ok(envelope) => {
                    last_cursor = last_cursor.max(envelope.cursor);
                    last_turn_id = envelope.turn_id;
                    if wants(&kinds, &envelope) {
                        yield Ok(sse_event(&envelope));
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "SSE subscriber lagged, recovering from ring");
                    let marker = state.hub.lagged_marker(
                        conversation_id,
                        last_turn_id,
                        skipped,
                        last_cursor,
                    );
                    yield Ok(sse_event(&marker));
                    for envelope in state.hub.replay(conversation_id, last_cursor) {
                        last_cursor = last_cursor.max(envelope.cursor);
                        last_turn_id = envelope.turn_id;
                        if wants(&kinds, &envelope) {
                            yield Ok(sse_event(&envelope));
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

fn sse_event(envelope: &EventEnvelope) -> Event {
    Event::default().data(serde_json::to_string(envelope).unwrap_or_default())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GET /conversations/:id/poll
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub async fn poll(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<StreamQuery>,
) -> impl IntoResponse {
    let kinds = parse_kinds(query.types.as_deref());
    let (events, since) = state
        .hub
        .poll(id, query.since, kinds.as_deref(), POLL_BOUND)
        .await;
    axum::Json(json!({ "events": events, "since": since }))
}
