//! Per-conversation cancellation tokens.
//!
//! The active turn of a conversation registers a token; cancellation is
//! checked at every suspension point (before each LLM call, during
//! streaming, before each tool). `POST /conversations/{id}/cancel` flips
//! the token.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

#[derive(Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[derive(Default)]
pub struct CancelMap {
    tokens: Mutex<HashMap<Uuid, CancelToken>>,
}

impl CancelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a token for a conversation's active turn.
    pub fn register(&self, conversation_id: Uuid) -> CancelToken {
        let token = CancelToken::new();
        self.tokens.lock().insert(conversation_id, token.clone());
        token
    }

    /// Cancel the running turn. Returns true when a token was found.
    pub fn cancel(&self, conversation_id: Uuid) -> bool {
        match self.tokens.lock().get(&conversation_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Remove the token when the turn completes.
    pub fn remove(&self, conversation_id: Uuid) {
        self.tokens.lock().remove(&conversation_id);
    }

    pub fn is_running(&self, conversation_id: Uuid) -> bool {
        self.tokens.lock().contains_key(&conversation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_flips_registered_token() {
        let map = CancelMap::new();
        let conv = Uuid::new_v4();
        let token = map.register(conv);
        assert!(!token.is_cancelled());

        assert!(map.cancel(conv));
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_unknown_conversation_is_false() {
        let map = CancelMap::new();
        assert!(!map.cancel(Uuid::new_v4()));
    }

    #[test]
    fn remove_clears_running_state() {
        let map = CancelMap::new();
        let conv = Uuid::new_v4();
        map.register(conv);
        assert!(map.is_running(conv));
        map.remove(conv);
        assert!(!map.is_running(conv));
    }
}
