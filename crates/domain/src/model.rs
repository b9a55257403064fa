//! Persisted data model: conversations, turns, messages, payloads, tool
//! call records, elicitations, and schedules.
//!
//! Ownership is tree-shaped and expressed through identifier references:
//! a conversation owns its turns, a turn owns its messages and tool call
//! records. Payloads are a shared content-addressed pool.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Conversation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A conversation: identity plus metadata. Created by the first posted
/// message and never mutated except to link child conversations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Parent conversation when this one was spawned by a virtual agent
    /// tool (linked agent chains).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    /// Owning user subject.
    pub user_subject: String,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
    WaitingElicitation,
}

impl TurnStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    /// Legal transitions of the turn state machine:
    /// `queued → running → (waiting-elicitation ↔ running)* →
    /// {succeeded | failed | canceled}`. Terminal states accept nothing.
    pub fn can_transition_to(self, next: TurnStatus) -> bool {
        use TurnStatus::*;
        match self {
            Queued => matches!(next, Running | Failed | Canceled),
            Running => matches!(
                next,
                WaitingElicitation | Succeeded | Failed | Canceled
            ),
            WaitingElicitation => matches!(next, Running | Failed | Canceled),
            Succeeded | Failed | Canceled => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::WaitingElicitation => "waiting_elicitation",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => Self::Queued,
            "running" => Self::Running,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            "canceled" => Self::Canceled,
            "waiting_elicitation" => Self::WaitingElicitation,
            _ => return None,
        })
    }
}

/// One user intent and its processing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: Uuid,
    pub conversation_id: Uuid,
    /// The user message that started this turn.
    pub started_by: Uuid,
    pub status: TurnStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    /// Redacted snapshot of the policy the turn ran under.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy: Option<Value>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Message
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::Tool => "tool",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "system" => Self::System,
            "user" => Self::User,
            "assistant" => Self::Assistant,
            "tool" => Self::Tool,
            _ => return None,
        })
    }
}

/// An ordered entry in a turn's transcript.
///
/// A streaming assistant message is updated in place until `interim`
/// flips to false, after which it is frozen. `seq` is assigned by the
/// store and totally orders messages within a conversation; it doubles
/// as the transcript cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: Uuid,
    pub turn_id: Uuid,
    pub conversation_id: Uuid,
    pub role: MessageRole,
    pub interim: bool,
    /// Inline text content. Large content lives in a payload instead.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elicitation_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    /// Store-assigned monotonic sequence within the conversation.
    pub seq: i64,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Payload
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Metadata for a content-addressed payload. The identifier is the hex
/// SHA-256 of the bytes; payloads are immutable once written.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PayloadMeta {
    pub id: String,
    pub media_type: String,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_uri: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool call record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Running,
    Succeeded,
    Failed,
    Denied,
}

impl ToolCallStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Denied => "denied",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "running" => Self::Running,
            "succeeded" => Self::Succeeded,
            "failed" => Self::Failed,
            "denied" => Self::Denied,
            _ => return None,
        })
    }
}

/// One tool invocation inside a turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: Uuid,
    pub turn_id: Uuid,
    /// Canonical `service:method` name.
    pub tool_name: String,
    /// SHA-256 of the canonical JSON arguments.
    pub arg_hash: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_payload_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_payload_id: Option<String>,
    pub status: ToolCallStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Elicitation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElicitationStatus {
    Pending,
    Accepted,
    Declined,
    Timeout,
}

impl ElicitationStatus {
    pub fn is_resolved(self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
            Self::Timeout => "timeout",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "pending" => Self::Pending,
            "accepted" => Self::Accepted,
            "declined" => Self::Declined,
            "timeout" => Self::Timeout,
            _ => return None,
        })
    }
}

/// A pending structured prompt addressed to the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Elicitation {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub turn_id: Uuid,
    /// JSON-schema subset: `type: object` with typed `properties` and a
    /// `required` list.
    pub requested_schema: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Out-of-band URL; when set, resolution arrives via callback from
    /// that flow rather than an inline payload.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub status: ElicitationStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decline_reason: Option<String>,
}

/// The outcome delivered to an elicitation waiter.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ElicitationOutcome {
    Accept { payload: Value },
    Decline { reason: Option<String> },
    Timeout,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Schedule
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// When a schedule fires: once at an instant, or repeatedly at a fixed
/// interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Trigger {
    At { at: DateTime<Utc> },
    Every { interval_sec: u64 },
}

/// A future or recurring turn. Execution rights are taken via a DB lease
/// (`lease_owner` + `lease_expires_at`); expiry lets another worker
/// retake the row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub name: String,
    /// Conversation template.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    pub content: String,
    pub user_subject: String,
    pub trigger: Trigger,
    pub next_due_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_status: Option<String>,
    pub enabled: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_turn_statuses() {
        assert!(TurnStatus::Succeeded.is_terminal());
        assert!(TurnStatus::Failed.is_terminal());
        assert!(TurnStatus::Canceled.is_terminal());
        assert!(!TurnStatus::Queued.is_terminal());
        assert!(!TurnStatus::Running.is_terminal());
        assert!(!TurnStatus::WaitingElicitation.is_terminal());
    }

    #[test]
    fn legal_transitions() {
        use TurnStatus::*;
        assert!(Queued.can_transition_to(Running));
        assert!(Running.can_transition_to(WaitingElicitation));
        assert!(WaitingElicitation.can_transition_to(Running));
        assert!(Running.can_transition_to(Succeeded));
        assert!(WaitingElicitation.can_transition_to(Failed));
    }

    #[test]
    fn illegal_transitions() {
        use TurnStatus::*;
        assert!(!Queued.can_transition_to(Succeeded));
        assert!(!Queued.can_transition_to(WaitingElicitation));
        assert!(!Succeeded.can_transition_to(Running));
        assert!(!Failed.can_transition_to(Queued));
        assert!(!Canceled.can_transition_to(Canceled));
        assert!(!WaitingElicitation.can_transition_to(Succeeded));
    }

    #[test]
    fn status_round_trips_through_strings() {
        for s in [
            TurnStatus::Queued,
            TurnStatus::Running,
            TurnStatus::Succeeded,
            TurnStatus::Failed,
            TurnStatus::Canceled,
            TurnStatus::WaitingElicitation,
        ] {
            assert_eq!(TurnStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(TurnStatus::parse("resumed"), None);
    }

    #[test]
    fn elicitation_resolution() {
        assert!(!ElicitationStatus::Pending.is_resolved());
        assert!(ElicitationStatus::Accepted.is_resolved());
        assert!(ElicitationStatus::Timeout.is_resolved());
    }
}
