//! Elicitation waiter router.
//!
//! Maps `(conversation, key)` to single-buffered waiter channels, where
//! the key is either a numeric JSON-RPC id (tool-originated, from an MCP
//! server) or a UUID (assistant-originated or surfaced over HTTP).
//! Delivery removes the waiter; re-delivery of an already-delivered key
//! reports success without blocking.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

use agently_domain::model::ElicitationOutcome;

/// Remembered delivered keys (for idempotent re-delivery).
const DELIVERED_CAPACITY: usize = 1024;

/// Waiter key: tool-originated numeric JSON-RPC id or UUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ElicitKey {
    Rpc(i64),
    Id(Uuid),
}

type FullKey = (Uuid, ElicitKey);

#[derive(Default)]
struct RouterState {
    waiters: HashMap<FullKey, mpsc::Sender<ElicitationOutcome>>,
    delivered: HashSet<FullKey>,
    delivered_order: VecDeque<FullKey>,
}

#[derive(Default)]
pub struct ElicitationRouter {
    state: Mutex<RouterState>,
}

impl ElicitationRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a single-buffered waiter. A duplicate registration for the
    /// same key replaces the prior one (whose receiver then sees a closed
    /// channel).
    pub fn register(&self, conversation_id: Uuid, key: ElicitKey) -> mpsc::Receiver<ElicitationOutcome> {
        let (tx, rx) = mpsc::channel(1);
        let mut state = self.state.lock();
        state.waiters.insert((conversation_id, key), tx);
        rx
    }

    /// Non-destructive lookup.
    pub fn resolve(&self, conversation_id: Uuid, key: ElicitKey) -> bool {
        self.state.lock().waiters.contains_key(&(conversation_id, key))
    }

    /// Deliver an outcome and remove the waiter. Returns true when a
    /// waiter was notified, or when this key was already delivered
    /// (idempotent, never blocks, never re-delivers).
    pub fn deliver(&self, conversation_id: Uuid, key: ElicitKey, outcome: ElicitationOutcome) -> bool {
        let full_key = (conversation_id, key);
        let mut state = self.state.lock();

        if let Some(tx) = state.waiters.remove(&full_key) {
            // Single-buffered: the channel has capacity 1 and exactly one
            // send ever happens, so try_send cannot fail on a live waiter.
            let _ = tx.try_send(outcome);
            state.delivered.insert(full_key);
            state.delivered_order.push_back(full_key);
            if state.delivered_order.len() > DELIVERED_CAPACITY {
                if let Some(old) = state.delivered_order.pop_front() {
                    state.delivered.remove(&old);
                }
            }
            return true;
        }

        state.delivered.contains(&full_key)
    }

    /// Cancel a waiter without delivering.
    pub fn remove(&self, conversation_id: Uuid, key: ElicitKey) {
        self.state.lock().waiters.remove(&(conversation_id, key));
    }

    /// Number of installed waiters (introspection).
    pub fn waiter_count(&self) -> usize {
        self.state.lock().waiters.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn accept() -> ElicitationOutcome {
        ElicitationOutcome::Accept {
            payload: json!({ "city": "Paris" }),
        }
    }

    #[tokio::test]
    async fn deliver_notifies_exactly_one_waiter() {
        let router = ElicitationRouter::new();
        let conv = Uuid::new_v4();
        let key = ElicitKey::Id(Uuid::new_v4());

        let mut rx = router.register(conv, key);
        assert!(router.resolve(conv, key));

        assert!(router.deliver(conv, key, accept()));
        let outcome = rx.recv().await.unwrap();
        assert!(matches!(outcome, ElicitationOutcome::Accept { .. }));

        // Waiter is gone and the channel is closed.
        assert!(!router.resolve(conv, key));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn redelivery_is_idempotent_and_non_blocking() {
        let router = ElicitationRouter::new();
        let conv = Uuid::new_v4();
        let key = ElicitKey::Id(Uuid::new_v4());

        let mut rx = router.register(conv, key);
        assert!(router.deliver(conv, key, accept()));
        assert!(router.deliver(
            conv,
            key,
            ElicitationOutcome::Decline { reason: None }
        ));

        // Only the first outcome arrived.
        let first = rx.recv().await.unwrap();
        assert!(matches!(first, ElicitationOutcome::Accept { .. }));
        assert!(rx.recv().await.is_none());
    }

    #[test]
    fn deliver_without_waiter_is_false() {
        let router = ElicitationRouter::new();
        assert!(!router.deliver(
            Uuid::new_v4(),
            ElicitKey::Rpc(7),
            ElicitationOutcome::Timeout
        ));
    }

    #[tokio::test]
    async fn duplicate_registration_replaces_prior_waiter() {
        let router = ElicitationRouter::new();
        let conv = Uuid::new_v4();
        let key = ElicitKey::Rpc(42);

        let mut first = router.register(conv, key);
        let mut second = router.register(conv, key);

        // The first waiter's sender was dropped by the replacement.
        assert!(first.recv().await.is_none());

        router.deliver(conv, key, accept());
        assert!(second.recv().await.is_some());
    }

    #[test]
    fn remove_cancels_without_delivering() {
        let router = ElicitationRouter::new();
        let conv = Uuid::new_v4();
        let key = ElicitKey::Id(Uuid::new_v4());

        let _rx = router.register(conv, key);
        router.remove(conv, key);
        assert!(!router.resolve(conv, key));
        // Not marked delivered: a later deliver reports false.
        assert!(!router.deliver(conv, key, ElicitationOutcome::Timeout));
    }

    #[test]
    fn keys_are_scoped_by_conversation() {
        let router = ElicitationRouter::new();
        let key = ElicitKey::Rpc(1);
        let conv_a = Uuid::new_v4();
        let conv_b = Uuid::new_v4();

        let _rx = router.register(conv_a, key);
        assert!(router.resolve(conv_a, key));
        assert!(!router.resolve(conv_b, key));
    }
}
