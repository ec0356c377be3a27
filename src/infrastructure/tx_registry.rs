//! In-memory side of preview transactions.
//!
//! A preview transaction is dual-owned: the primary store holds the
//! authoritative record, this registry holds the live backend session. Only
//! the registry may drive terminal transitions; the supervisor drains the
//! deadline heap to time out overdue previews.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

use crate::infrastructure::backends::BackendSession;

/// Live state pinned to one preview transaction. The session mutex
/// serializes commit/rollback/timeout; `try_lock` failure surfaces as a busy
/// transaction rather than queueing a second terminal operation.
pub struct TxSlot {
    pub approval_id: Uuid,
    pub query_id: Uuid,
    pub reviewer_id: Uuid,
    pub data_source_id: Uuid,
    pub deadline: DateTime<Utc>,
    pub affected_rows: u64,
    session: AsyncMutex<Option<Box<dyn BackendSession>>>,
}

impl TxSlot {
    pub fn new(
        approval_id: Uuid,
        query_id: Uuid,
        reviewer_id: Uuid,
        data_source_id: Uuid,
        deadline: DateTime<Utc>,
        affected_rows: u64,
        session: Box<dyn BackendSession>,
    ) -> Self {
        Self {
            approval_id,
            query_id,
            reviewer_id,
            data_source_id,
            deadline,
            affected_rows,
            session: AsyncMutex::new(Some(session)),
        }
    }

    /// Takes exclusive ownership of the live session for a terminal
    /// transition. `Err` means another operation holds the handle right now;
    /// `Ok(None)` means a terminal transition already consumed it.
    pub fn take_session(&self) -> Result<Option<Box<dyn BackendSession>>, SessionBusy> {
        match self.session.try_lock() {
            Ok(mut guard) => Ok(guard.take()),
            Err(_) => Err(SessionBusy),
        }
    }
}

#[derive(Debug)]
pub struct SessionBusy;

/// Process-wide registry of active preview transactions plus a min-heap of
/// deadlines for the supervisor.
pub struct TransactionRegistry {
    slots: DashMap<Uuid, Arc<TxSlot>>,
    deadlines: Mutex<BinaryHeap<Reverse<(DateTime<Utc>, Uuid)>>>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self {
            slots: DashMap::new(),
            deadlines: Mutex::new(BinaryHeap::new()),
        }
    }

    pub fn insert(&self, transaction_id: Uuid, slot: TxSlot) {
        let deadline = slot.deadline;
        self.slots.insert(transaction_id, Arc::new(slot));
        self.deadlines.lock().push(Reverse((deadline, transaction_id)));
    }

    /// Clones out the slot so no map guard is held across awaits.
    pub fn get(&self, transaction_id: Uuid) -> Option<Arc<TxSlot>> {
        self.slots
            .get(&transaction_id)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, transaction_id: Uuid) {
        self.slots.remove(&transaction_id);
    }

    pub fn active_count(&self) -> usize {
        self.slots.len()
    }

    /// Pops every transaction whose deadline has passed. Entries whose slot
    /// was already removed (committed or rolled back first) are skipped; the
    /// heap entry is the only thing left of them.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<Uuid> {
        let mut heap = self.deadlines.lock();
        let mut due = Vec::new();
        while let Some(Reverse((deadline, transaction_id))) = heap.peek().copied() {
            if deadline > now {
                break;
            }
            heap.pop();
            if self.slots.contains_key(&transaction_id) {
                due.push(transaction_id);
            }
        }
        due
    }

    /// Re-queues a transaction the supervisor could not finish this tick
    /// (busy handle); it is retried on the next scan.
    pub fn requeue(&self, transaction_id: Uuid, deadline: DateTime<Utc>) {
        self.deadlines.lock().push(Reverse((deadline, transaction_id)));
    }
}

impl Default for TransactionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::backends::{BackendError, BackendSession};
    use async_trait::async_trait;
    use chrono::Duration;

    struct NoopSession;

    #[async_trait]
    impl BackendSession for NoopSession {
        async fn execute_write(&mut self, _sql: &str) -> Result<u64, BackendError> {
            Ok(0)
        }
        async fn commit(self: Box<Self>) -> Result<(), BackendError> {
            Ok(())
        }
        async fn rollback(self: Box<Self>) -> Result<(), BackendError> {
            Ok(())
        }
    }

    fn slot_with_deadline(deadline: DateTime<Utc>) -> TxSlot {
        TxSlot::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            Uuid::new_v4(),
            deadline,
            1,
            Box::new(NoopSession),
        )
    }

    #[test]
    fn due_returns_only_expired_live_transactions() {
        let registry = TransactionRegistry::new();
        let now = Utc::now();

        let expired = Uuid::new_v4();
        let fresh = Uuid::new_v4();
        registry.insert(expired, slot_with_deadline(now - Duration::seconds(5)));
        registry.insert(fresh, slot_with_deadline(now + Duration::seconds(300)));

        assert_eq!(registry.due(now), vec![expired]);
        // popped entries are not reported twice
        assert!(registry.due(now).is_empty());
    }

    #[test]
    fn due_skips_transactions_already_removed() {
        let registry = TransactionRegistry::new();
        let now = Utc::now();

        let finished = Uuid::new_v4();
        registry.insert(finished, slot_with_deadline(now - Duration::seconds(5)));
        registry.remove(finished);

        assert!(registry.due(now).is_empty());
    }

    #[test]
    fn session_can_be_taken_exactly_once() {
        let slot = slot_with_deadline(Utc::now());
        assert!(slot.take_session().unwrap().is_some());
        assert!(slot.take_session().unwrap().is_none());
    }
}
