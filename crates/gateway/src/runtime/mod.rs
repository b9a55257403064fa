//! The conversation runtime — turn orchestration, tool proxying,
//! elicitation routing, event fan-out, and the scheduler watchdog.
//!
//! Entry point: [`turn::post_message`] accepts a user turn and returns
//! its ids immediately; all further progress is observable through
//! [`events::EventHub`].

pub mod cancel;
pub mod elicitation;
pub mod events;
pub mod locks;
pub mod policy;
pub mod scheduler;
pub mod tools;
pub mod turn;

use serde_json::json;
use uuid::Uuid;

use agently_domain::error::Result;
use agently_domain::model::{Turn, TurnStatus};

use crate::state::AppState;
use events::EventKind;

/// Apply a turn transition and publish the matching `control` event.
/// The success path in `turn` publishes its own control event so it can
/// attach usage totals; everything else goes through here.
pub(crate) fn transition_turn(
    state: &AppState,
    turn_id: Uuid,
    conversation_id: Uuid,
    status: TurnStatus,
    error: Option<&str>,
) -> Result<Turn> {
    let turn = state.store.set_turn_status(turn_id, status, error)?;
    state.hub.publish(
        conversation_id,
        turn_id,
        None,
        EventKind::Control,
        json!({
            "status": status.as_str(),
            "error": error,
        }),
    );
    Ok(turn)
}

/// Unicode-safe prefix truncation for previews and logs.
pub(crate) fn truncate_str(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_str_respects_char_boundaries() {
        assert_eq!(truncate_str("hello", 10), "hello");
        assert_eq!(truncate_str("hello world", 5), "hello...");
        // 2-byte é: truncating inside it backs up to the boundary.
        assert_eq!(truncate_str("h\u{00e9}llo", 2), "h...");
    }
}
