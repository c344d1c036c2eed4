// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Requests waiting for their reply, keyed by correlation id.

use crate::envelope::ReplyEnvelope;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::sync::oneshot;

type Slots = HashMap<String, oneshot::Sender<ReplyEnvelope>>;

fn lock(slots: &Mutex<Slots>) -> MutexGuard<'_, Slots> {
    match slots.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Shared table of in-flight requests of one client handle.
#[derive(Clone, Default)]
pub(crate) struct PendingRequests {
    slots: Arc<Mutex<Slots>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a slot for `correlation_id`.
    ///
    /// The slot lives as long as the returned guard; dropping the guard
    /// removes it whether or not a reply arrived.
    pub fn register(&self, correlation_id: &str) -> (PendingSlot, oneshot::Receiver<ReplyEnvelope>) {
        let (tx, rx) = oneshot::channel();
        lock(&self.slots).insert(correlation_id.to_owned(), tx);

        (
            PendingSlot {
                correlation_id: correlation_id.to_owned(),
                slots: self.slots.clone(),
            },
            rx,
        )
    }

    /// Delivers a reply. Returns false when nobody waits for it anymore.
    pub fn complete(&self, correlation_id: &str, reply: ReplyEnvelope) -> bool {
        let Some(tx) = lock(&self.slots).remove(correlation_id) else {
            return false;
        };

        tx.send(reply).is_ok()
    }

    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    /// Drops every slot, failing the waiters.
    pub fn clear(&self) {
        lock(&self.slots).clear();
    }
}

/// Removes its slot from the table when dropped.
pub(crate) struct PendingSlot {
    correlation_id: String,
    slots: Arc<Mutex<Slots>>,
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        lock(&self.slots).remove(&self.correlation_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn delivers_to_the_matching_slot() {
        let pending = PendingRequests::new();
        let (_a, rx_a) = pending.register("a");
        let (_b, rx_b) = pending.register("b");
        assert_eq!(pending.len(), 2);

        assert!(pending.complete("b", ReplyEnvelope::success(json!("for b"))));
        assert!(pending.complete("a", ReplyEnvelope::success(json!("for a"))));

        assert_eq!(rx_a.await.unwrap().response, Some(json!("for a")));
        assert_eq!(rx_b.await.unwrap().response, Some(json!("for b")));
        assert_eq!(pending.len(), 0);
    }

    #[test]
    fn dropping_the_guard_frees_the_slot() {
        let pending = PendingRequests::new();
        let (slot, _rx) = pending.register("a");
        assert_eq!(pending.len(), 1);

        drop(slot);

        assert_eq!(pending.len(), 0);
        assert!(!pending.complete("a", ReplyEnvelope::success(json!(null))));
    }

    #[test]
    fn unknown_ids_are_ignored() {
        let pending = PendingRequests::new();
        assert!(!pending.complete("missing", ReplyEnvelope::failure("late")));
    }

    #[tokio::test]
    async fn clear_fails_the_waiters() {
        let pending = PendingRequests::new();
        let (_slot, rx) = pending.register("a");

        pending.clear();

        assert!(rx.await.is_err());
    }
}
