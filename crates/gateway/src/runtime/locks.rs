//! Per-conversation turn serialization.
//!
//! Each conversation maps to a `Semaphore(1)`; holding the permit means
//! owning the conversation's one active turn. Other conversations
//! progress in parallel.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

pub struct ConversationLockMap {
    locks: Mutex<HashMap<Uuid, Arc<Semaphore>>>,
}

impl Default for ConversationLockMap {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationLockMap {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the turn permit for a conversation, waiting until the
    /// current turn (if any) finishes. The permit auto-releases on drop.
    pub async fn acquire(&self, conversation_id: Uuid) -> OwnedSemaphorePermit {
        let sem = {
            let mut locks = self.locks.lock();
            locks
                .entry(conversation_id)
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        // The semaphore is never closed, so acquisition cannot fail.
        sem.acquire_owned().await.unwrap_or_else(|_| unreachable!())
    }

    /// Try to take the permit without waiting.
    pub fn try_acquire(&self, conversation_id: Uuid) -> Option<OwnedSemaphorePermit> {
        let sem = {
            let mut locks = self.locks.lock();
            locks
                .entry(conversation_id)
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        sem.try_acquire_owned().ok()
    }

    pub fn conversation_count(&self) -> usize {
        self.locks.lock().len()
    }

    /// Drop locks for conversations without a held permit.
    pub fn prune_idle(&self) {
        self.locks.lock().retain(|_, sem| sem.available_permits() == 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn different_conversations_run_concurrently() {
        let map = ConversationLockMap::new();
        let p1 = map.acquire(Uuid::new_v4()).await;
        let p2 = map.acquire(Uuid::new_v4()).await;
        assert_eq!(map.conversation_count(), 2);
        drop(p1);
        drop(p2);
    }

    #[tokio::test]
    async fn same_conversation_waits_for_release() {
        let map = Arc::new(ConversationLockMap::new());
        let conv = Uuid::new_v4();
        let permit = map.acquire(conv).await;
        assert!(map.try_acquire(conv).is_none());

        let map2 = map.clone();
        let waiter = tokio::spawn(async move {
            let _p = map2.acquire(conv).await;
            7
        });

        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        drop(permit);
        assert_eq!(waiter.await.unwrap(), 7);
    }

    #[tokio::test]
    async fn prune_keeps_held_locks() {
        let map = ConversationLockMap::new();
        let held = Uuid::new_v4();
        let permit = map.acquire(held).await;
        let _ = map.acquire(Uuid::new_v4()).await; // dropped immediately

        map.prune_idle();
        assert_eq!(map.conversation_count(), 1);
        drop(permit);
    }
}
