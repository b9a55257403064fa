//! Conversation-scoped event hub.
//!
//! Every turn artifact (interim text, tool operations, status
//! transitions, elicitations) is published here and fans out over two
//! surfaces: a long-lived SSE stream and a short-poll endpoint. Events
//! carry a per-conversation monotonic cursor; late subscribers replay
//! from any cursor out of an in-memory ring (256 events per
//! conversation — the backfill bound is count-based) and page older
//! history from the store.
//!
//! Fan-out uses one broadcast channel per conversation. A subscriber
//! that falls behind gets a `lagged` marker and can recover the gap from
//! the ring via its last seen cursor, so control events are never lost
//! to backpressure.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Events retained per conversation for replay.
const RING_CAPACITY: usize = 256;

/// Per-subscriber broadcast queue bound.
const SUBSCRIBER_CAPACITY: usize = 128;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Interim and final assistant deltas.
    Text,
    /// Tool operation start/finish/error.
    ToolOp,
    /// Turn status transitions.
    Control,
    /// Elicitation pending/resolved.
    Elicitation,
}

impl EventKind {
    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "text" => Self::Text,
            "tool_op" => Self::ToolOp,
            "control" => Self::Control,
            "elicitation" => Self::Elicitation,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    /// Monotonic per-conversation cursor, usable for resume.
    pub cursor: u64,
    pub conversation_id: Uuid,
    pub turn_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
    pub kind: EventKind,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Hub
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Channel {
    ring: VecDeque<EventEnvelope>,
    next_cursor: u64,
    tx: broadcast::Sender<EventEnvelope>,
}

impl Channel {
    fn new() -> Self {
        Self {
            ring: VecDeque::with_capacity(RING_CAPACITY),
            next_cursor: 1,
            tx: broadcast::channel(SUBSCRIBER_CAPACITY).0,
        }
    }
}

#[derive(Default)]
pub struct EventHub {
    channels: RwLock<HashMap<Uuid, Arc<Mutex<Channel>>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn channel(&self, conversation_id: Uuid) -> Arc<Mutex<Channel>> {
        if let Some(channel) = self.channels.read().get(&conversation_id) {
            return channel.clone();
        }
        self.channels
            .write()
            .entry(conversation_id)
            .or_insert_with(|| Arc::new(Mutex::new(Channel::new())))
            .clone()
    }

    /// Publish an event; assigns the cursor and fans out.
    pub fn publish(
        &self,
        conversation_id: Uuid,
        turn_id: Uuid,
        message_id: Option<Uuid>,
        kind: EventKind,
        payload: Value,
    ) -> EventEnvelope {
        let channel = self.channel(conversation_id);
        let mut channel = channel.lock();
        let envelope = EventEnvelope {
            cursor: channel.next_cursor,
            conversation_id,
            turn_id,
            message_id,
            kind,
            payload,
            created_at: Utc::now(),
        };
        channel.next_cursor += 1;
        if channel.ring.len() == RING_CAPACITY {
            channel.ring.pop_front();
        }
        channel.ring.push_back(envelope.clone());
        let _ = channel.tx.send(envelope.clone());
        envelope
    }

    /// The newest assigned cursor (0 when nothing was published yet).
    pub fn head_cursor(&self, conversation_id: Uuid) -> u64 {
        self.channels
            .read()
            .get(&conversation_id)
            .map(|c| c.lock().next_cursor - 1)
            .unwrap_or(0)
    }

    /// Events with cursor strictly greater than `since`, in order.
    pub fn replay(&self, conversation_id: Uuid, since: u64) -> Vec<EventEnvelope> {
        self.channels
            .read()
            .get(&conversation_id)
            .map(|channel| {
                channel
                    .lock()
                    .ring
                    .iter()
                    .filter(|e| e.cursor > since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Replay from `since` plus a live receiver, atomically against the
    /// channel so no event falls between the two.
    pub fn subscribe(
        &self,
        conversation_id: Uuid,
        since: u64,
    ) -> (Vec<EventEnvelope>, broadcast::Receiver<EventEnvelope>) {
        let channel = self.channel(conversation_id);
        let channel = channel.lock();
        let backlog = channel
            .ring
            .iter()
            .filter(|e| e.cursor > since)
            .cloned()
            .collect();
        (backlog, channel.tx.subscribe())
    }

    /// Poll semantics: the set of events with cursor in `(since, head]`,
    /// filtered by kinds; waits up to `max_wait` for the first match when
    /// the window is empty. Returns `(events, new_since)`.
    pub async fn poll(
        &self,
        conversation_id: Uuid,
        since: u64,
        kinds: Option<&[EventKind]>,
        max_wait: std::time::Duration,
    ) -> (Vec<EventEnvelope>, u64) {
        let matches =
            |e: &EventEnvelope| kinds.map(|ks| ks.contains(&e.kind)).unwrap_or(true);

        let (backlog, mut rx) = self.subscribe(conversation_id, since);
        let mut new_since = since.max(backlog.last().map(|e| e.cursor).unwrap_or(since));
        let mut events: Vec<EventEnvelope> = backlog.into_iter().filter(|e| matches(e)).collect();
        if !events.is_empty() {
            return (events, new_since);
        }

        let deadline = tokio::time::Instant::now() + max_wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Ok(envelope)) => {
                    new_since = new_since.max(envelope.cursor);
                    if matches(&envelope) {
                        events.push(envelope);
                        break;
                    }
                }
                Ok(Err(broadcast::error::RecvError::Lagged(_))) => {
                    // Recover the gap from the ring.
                    let recovered = self.replay(conversation_id, new_since);
                    new_since = new_since
                        .max(recovered.last().map(|e| e.cursor).unwrap_or(new_since));
                    events.extend(recovered.into_iter().filter(|e| matches(e)));
                    if !events.is_empty() {
                        break;
                    }
                }
                Ok(Err(broadcast::error::RecvError::Closed)) | Err(_) => break,
            }
        }
        (events, new_since)
    }

    /// A synthetic `control` marker telling a lagged subscriber to
    /// resync: `skipped` is how many events the subscriber's queue
    /// dropped, `resume` the cursor to replay from.
    pub fn lagged_marker(
        &self,
        conversation_id: Uuid,
        turn_id: Uuid,
        skipped: u64,
        resume: u64,
    ) -> EventEnvelope {
        EventEnvelope {
            cursor: self.head_cursor(conversation_id),
            conversation_id,
            turn_id,
            message_id: None,
            kind: EventKind::Control,
            payload: serde_json::json!({
                "lagged": true,
                "skipped": skipped,
                "resume": resume,
            }),
            created_at: Utc::now(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn publish_n(hub: &EventHub, conv: Uuid, turn: Uuid, n: usize) {
        for i in 0..n {
            hub.publish(conv, turn, None, EventKind::Text, json!({ "i": i }));
        }
    }

    #[test]
    fn cursors_are_monotonic_per_conversation() {
        let hub = EventHub::new();
        let conv_a = Uuid::new_v4();
        let conv_b = Uuid::new_v4();
        let turn = Uuid::new_v4();

        let a1 = hub.publish(conv_a, turn, None, EventKind::Text, json!({}));
        let b1 = hub.publish(conv_b, turn, None, EventKind::Text, json!({}));
        let a2 = hub.publish(conv_a, turn, None, EventKind::Control, json!({}));

        assert_eq!(a1.cursor, 1);
        assert_eq!(b1.cursor, 1);
        assert_eq!(a2.cursor, 2);
        assert_eq!(hub.head_cursor(conv_a), 2);
    }

    #[test]
    fn replay_returns_exactly_the_window_after_the_cursor() {
        let hub = EventHub::new();
        let conv = Uuid::new_v4();
        let turn = Uuid::new_v4();
        publish_n(&hub, conv, turn, 5);

        let window = hub.replay(conv, 2);
        let cursors: Vec<u64> = window.iter().map(|e| e.cursor).collect();
        assert_eq!(cursors, vec![3, 4, 5]);

        assert!(hub.replay(conv, 5).is_empty());
        assert_eq!(hub.replay(conv, 0).len(), 5);
    }

    #[test]
    fn ring_is_bounded() {
        let hub = EventHub::new();
        let conv = Uuid::new_v4();
        let turn = Uuid::new_v4();
        publish_n(&hub, conv, turn, RING_CAPACITY + 10);

        let all = hub.replay(conv, 0);
        assert_eq!(all.len(), RING_CAPACITY);
        // Oldest events fell off; cursors still end at the head.
        assert_eq!(all.last().unwrap().cursor, (RING_CAPACITY + 10) as u64);
    }

    #[tokio::test]
    async fn subscribe_has_no_gap_between_backlog_and_live() {
        let hub = Arc::new(EventHub::new());
        let conv = Uuid::new_v4();
        let turn = Uuid::new_v4();
        publish_n(&hub, conv, turn, 3);

        let (backlog, mut rx) = hub.subscribe(conv, 0);
        assert_eq!(backlog.len(), 3);

        hub.publish(conv, turn, None, EventKind::Control, json!({ "status": "running" }));
        let live = rx.recv().await.unwrap();
        assert_eq!(live.cursor, 4);
    }

    #[tokio::test]
    async fn poll_returns_backlog_immediately() {
        let hub = EventHub::new();
        let conv = Uuid::new_v4();
        let turn = Uuid::new_v4();
        publish_n(&hub, conv, turn, 4);

        let (events, since) = hub
            .poll(conv, 1, None, std::time::Duration::from_millis(10))
            .await;
        assert_eq!(events.len(), 3);
        assert_eq!(since, 4);
    }

    #[tokio::test]
    async fn poll_filters_by_kind_and_advances_cursor_past_mismatches() {
        let hub = EventHub::new();
        let conv = Uuid::new_v4();
        let turn = Uuid::new_v4();
        hub.publish(conv, turn, None, EventKind::Text, json!({}));
        hub.publish(conv, turn, None, EventKind::Control, json!({}));

        let (events, since) = hub
            .poll(
                conv,
                0,
                Some(&[EventKind::Control]),
                std::time::Duration::from_millis(10),
            )
            .await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::Control);
        assert_eq!(since, 2);
    }

    #[tokio::test]
    async fn poll_waits_for_a_live_event() {
        let hub = Arc::new(EventHub::new());
        let conv = Uuid::new_v4();
        let turn = Uuid::new_v4();

        let waiter = {
            let hub = hub.clone();
            tokio::spawn(async move {
                hub.poll(conv, 0, None, std::time::Duration::from_secs(1)).await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        hub.publish(conv, turn, None, EventKind::Text, json!({ "late": true }));

        let (events, since) = waiter.await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(since, 1);
    }

    #[test]
    fn lagged_marker_carries_skipped_and_resume() {
        let hub = EventHub::new();
        let conv = Uuid::new_v4();
        let turn = Uuid::new_v4();
        publish_n(&hub, conv, turn, 3);

        let marker = hub.lagged_marker(conv, turn, 2, 1);
        assert_eq!(marker.kind, EventKind::Control);
        assert_eq!(marker.cursor, 3);
        assert_eq!(marker.payload["lagged"], true);
        assert_eq!(marker.payload["skipped"], 2);
        assert_eq!(marker.payload["resume"], 1);
    }

    #[test]
    fn event_kind_parsing() {
        assert_eq!(EventKind::parse("tool_op"), Some(EventKind::ToolOp));
        assert_eq!(EventKind::parse("nope"), None);
    }
}
