//! Append-only sync event ledger.
//!
//! The ledger is the durable source of truth for "what changed": one event
//! row per (action, data, recipient) tuple, keyed by a strictly increasing
//! id assigned at append time. The in-process bus only fans events out;
//! anything missed while disconnected is recovered from here.

use std::collections::BTreeMap;
use std::sync::Mutex;

use thiserror::Error;

use crate::core::{EventAction, EventId, Row, SyncEvent};

/// Contract required of any backing event store.
///
/// `append` must be atomic with respect to id assignment: ids are strictly
/// increasing and unique within the owning collection (gaps are fine). A
/// caller pairing a primary write with an event append is expected to couple
/// the two transactionally; this crate does not provide that atomicity.
pub trait EventLedger: Send + Sync {
    /// Durably record one event for one recipient and assign its id.
    fn append(
        &self,
        action: EventAction,
        data: Row,
        user_id: &str,
    ) -> Result<SyncEvent, LedgerError>;

    /// All events visible to `user_id` with id > `after` (all, if `None`),
    /// in ascending id order.
    fn list_since(
        &self,
        user_id: &str,
        after: Option<EventId>,
    ) -> Result<Vec<SyncEvent>, LedgerError>;
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger lock poisoned")]
    LockPoisoned,
    #[error("ledger backend error: {reason}")]
    Backend { reason: String },
}

/// In-memory reference ledger used by the local transport and tests.
#[derive(Debug, Default)]
pub struct MemoryLedger {
    inner: Mutex<LedgerState>,
}

#[derive(Debug, Default)]
struct LedgerState {
    next_id: u64,
    events: BTreeMap<EventId, SyncEvent>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> Result<usize, LedgerError> {
        let state = self.inner.lock().map_err(|_| LedgerError::LockPoisoned)?;
        Ok(state.events.len())
    }

    pub fn is_empty(&self) -> Result<bool, LedgerError> {
        Ok(self.len()? == 0)
    }
}

impl EventLedger for MemoryLedger {
    fn append(
        &self,
        action: EventAction,
        data: Row,
        user_id: &str,
    ) -> Result<SyncEvent, LedgerError> {
        let mut state = self.inner.lock().map_err(|_| LedgerError::LockPoisoned)?;
        state.next_id += 1;
        let id = EventId::from_u64(state.next_id).ok_or(LedgerError::Backend {
            reason: "event id counter wrapped".to_string(),
        })?;
        let event = SyncEvent {
            id,
            action,
            data,
            user_id: user_id.to_string(),
        };
        state.events.insert(id, event.clone());
        Ok(event)
    }

    fn list_since(
        &self,
        user_id: &str,
        after: Option<EventId>,
    ) -> Result<Vec<SyncEvent>, LedgerError> {
        let state = self.inner.lock().map_err(|_| LedgerError::LockPoisoned)?;
        let floor = after.map(|id| id.get()).unwrap_or(0);
        Ok(state
            .events
            .values()
            .filter(|event| event.id.get() > floor && event.user_id == user_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(id: i64) -> Row {
        json!({"id": id}).as_object().expect("object row").clone()
    }

    #[test]
    fn append_assigns_strictly_increasing_ids() {
        let ledger = MemoryLedger::new();
        let a = ledger.append(EventAction::Insert, row(1), "u1").unwrap();
        let b = ledger.append(EventAction::Update, row(1), "u1").unwrap();
        let c = ledger.append(EventAction::Insert, row(2), "u2").unwrap();

        assert!(a.id < b.id);
        assert!(b.id < c.id);
    }

    #[test]
    fn list_since_filters_by_recipient_and_cursor() {
        let ledger = MemoryLedger::new();
        let a = ledger.append(EventAction::Insert, row(1), "u1").unwrap();
        ledger.append(EventAction::Insert, row(2), "u2").unwrap();
        let c = ledger.append(EventAction::Update, row(1), "u1").unwrap();

        let all = ledger.list_since("u1", None).unwrap();
        assert_eq!(
            all.iter().map(|e| e.id).collect::<Vec<_>>(),
            vec![a.id, c.id]
        );

        let resumed = ledger.list_since("u1", Some(a.id)).unwrap();
        assert_eq!(resumed.iter().map(|e| e.id).collect::<Vec<_>>(), vec![c.id]);
    }

    #[test]
    fn list_since_past_end_is_empty() {
        let ledger = MemoryLedger::new();
        let a = ledger.append(EventAction::Insert, row(1), "u1").unwrap();
        assert!(ledger.list_since("u1", Some(a.id)).unwrap().is_empty());
    }
}
