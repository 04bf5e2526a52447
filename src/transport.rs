//! Transport boundary and the in-process reference implementation.
//!
//! The transport collaborator is where durability lives: it records the
//! primary write, appends the matching ledger events (one per recipient) and
//! publishes them to the bus. `LocalServer` is the reference backing used by
//! tests and single-process setups; real deployments implement [`Transport`]
//! over their own wire protocol.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use thiserror::Error;

use crate::bus::{BusError, EventBus, EventSubscription};
use crate::core::{EventAction, EventId, Row, RowId, SyncEvent};
use crate::ledger::{EventLedger, LedgerError, MemoryLedger};

/// Server acknowledgement of one write: the authoritative row as stored,
/// plus the id of the echo event the caller can await on the gate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WriteReceipt {
    pub item: Row,
    pub event_id: EventId,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("row {id} not found")]
    NotFound { id: RowId },
    #[error("row {id} already exists")]
    Conflict { id: RowId },
    #[error("invalid row: {reason}")]
    InvalidRow { reason: String },
    #[error("transport backend error: {reason}")]
    Backend { reason: String },
}

impl From<LedgerError> for TransportError {
    fn from(e: LedgerError) -> Self {
        TransportError::Backend {
            reason: e.to_string(),
        }
    }
}

impl From<BusError> for TransportError {
    fn from(e: BusError) -> Self {
        TransportError::Backend {
            reason: e.to_string(),
        }
    }
}

/// Required shape of the transport collaborator, per synced collection and
/// authenticated user.
pub trait Transport: Send + Sync {
    /// Full authoritative snapshot of the rows visible to this user.
    fn list(&self) -> Result<Vec<Row>, TransportError>;

    /// Durably create a row (the server assigns an id when absent) and fan
    /// out one insert event per recipient.
    fn create(&self, row: Row) -> Result<WriteReceipt, TransportError>;

    /// Merge `changes` into the stored row and fan out update events.
    fn update(&self, id: &RowId, changes: Row) -> Result<WriteReceipt, TransportError>;

    /// Remove the stored row and fan out delete events carrying it.
    fn delete(&self, id: &RowId) -> Result<WriteReceipt, TransportError>;

    /// Open the server-push channel: live-only when `after` is absent,
    /// resuming with catch-up past `after` when given.
    fn subscribe(&self, after: Option<EventId>) -> Result<EventSubscription, TransportError>;
}

/// Shared in-process backing: authoritative row store, event ledger and bus.
#[derive(Clone, Default)]
pub struct LocalServer {
    state: Arc<Mutex<ServerState>>,
    ledger: Arc<MemoryLedger>,
    bus: EventBus,
}

#[derive(Default)]
struct ServerState {
    rows: BTreeMap<RowId, StoredRow>,
    next_row_id: i64,
}

struct StoredRow {
    owner: String,
    row: Row,
}

impl StoredRow {
    fn visible_to(&self, user_id: &str) -> bool {
        self.owner == user_id || self.shared_with().iter().any(|u| u == user_id)
    }

    /// Users granted access via the row's `shared_with` string array.
    fn shared_with(&self) -> Vec<String> {
        match self.row.get("shared_with") {
            Some(Value::Array(users)) => users
                .iter()
                .filter_map(|u| u.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Originating user first, then owner and everyone retaining or newly
    /// granted access; each becomes a separate ledger event.
    fn recipients(&self, originator: &str) -> Vec<String> {
        let mut recipients = vec![originator.to_string()];
        if self.owner != originator {
            recipients.push(self.owner.clone());
        }
        for user in self.shared_with() {
            if !recipients.contains(&user) {
                recipients.push(user);
            }
        }
        recipients
    }
}

impl LocalServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ledger(&self) -> Arc<MemoryLedger> {
        Arc::clone(&self.ledger)
    }

    pub fn bus(&self) -> EventBus {
        self.bus.clone()
    }

    /// The transport handle for one authenticated user.
    pub fn transport_for(&self, user_id: &str) -> LocalTransport {
        LocalTransport {
            server: self.clone(),
            user_id: user_id.to_string(),
        }
    }

    /// Append one event per recipient and publish each; returns the echo
    /// event id for `originator`.
    fn fan_out(
        &self,
        action: EventAction,
        row: &Row,
        recipients: &[String],
        originator: &str,
    ) -> Result<EventId, TransportError> {
        let mut echo = None;
        for recipient in recipients {
            let event: SyncEvent = self.ledger.append(action, row.clone(), recipient)?;
            self.bus.publish(&event)?;
            if recipient == originator {
                echo = Some(event.id);
            }
        }
        echo.ok_or_else(|| TransportError::Backend {
            reason: format!("originator {originator} missing from recipient set"),
        })
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, ServerState>, TransportError> {
        self.state.lock().map_err(|_| TransportError::Backend {
            reason: "server state lock poisoned".to_string(),
        })
    }
}

/// Per-user transport over a [`LocalServer`].
#[derive(Clone)]
pub struct LocalTransport {
    server: LocalServer,
    user_id: String,
}

impl LocalTransport {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }
}

impl Transport for LocalTransport {
    fn list(&self) -> Result<Vec<Row>, TransportError> {
        let state = self.server.lock_state()?;
        Ok(state
            .rows
            .values()
            .filter(|stored| stored.visible_to(&self.user_id))
            .map(|stored| stored.row.clone())
            .collect())
    }

    fn create(&self, mut row: Row) -> Result<WriteReceipt, TransportError> {
        let mut state = self.server.lock_state()?;

        let id = match row.get("id") {
            Some(value) => RowId::from_value(value).map_err(|e| TransportError::InvalidRow {
                reason: e.to_string(),
            })?,
            None => {
                state.next_row_id += 1;
                let id = RowId::Int(state.next_row_id);
                row.insert("id".to_string(), id.to_value());
                id
            }
        };
        if state.rows.contains_key(&id) {
            return Err(TransportError::Conflict { id });
        }

        let stored = StoredRow {
            owner: self.user_id.clone(),
            row: row.clone(),
        };
        let recipients = stored.recipients(&self.user_id);
        state.rows.insert(id, stored);

        // Fan out while holding the state lock so concurrent writers cannot
        // interleave their events between ours.
        let event_id =
            self.server
                .fan_out(EventAction::Insert, &row, &recipients, &self.user_id)?;
        Ok(WriteReceipt {
            item: row,
            event_id,
        })
    }

    fn update(&self, id: &RowId, changes: Row) -> Result<WriteReceipt, TransportError> {
        let mut state = self.server.lock_state()?;

        let stored = state
            .rows
            .get_mut(id)
            .filter(|stored| stored.visible_to(&self.user_id))
            .ok_or_else(|| TransportError::NotFound { id: id.clone() })?;

        for (key, value) in changes {
            if key == "id" {
                continue;
            }
            stored.row.insert(key, value);
        }
        let row = stored.row.clone();
        let recipients = stored.recipients(&self.user_id);

        let event_id =
            self.server
                .fan_out(EventAction::Update, &row, &recipients, &self.user_id)?;
        Ok(WriteReceipt {
            item: row,
            event_id,
        })
    }

    fn delete(&self, id: &RowId) -> Result<WriteReceipt, TransportError> {
        let mut state = self.server.lock_state()?;

        let visible = state
            .rows
            .get(id)
            .map(|stored| stored.visible_to(&self.user_id))
            .unwrap_or(false);
        if !visible {
            return Err(TransportError::NotFound { id: id.clone() });
        }
        let stored = state
            .rows
            .remove(id)
            .ok_or_else(|| TransportError::NotFound { id: id.clone() })?;

        let recipients = stored.recipients(&self.user_id);
        let event_id = self.server.fan_out(
            EventAction::Delete,
            &stored.row,
            &recipients,
            &self.user_id,
        )?;
        Ok(WriteReceipt {
            item: stored.row,
            event_id,
        })
    }

    fn subscribe(&self, after: Option<EventId>) -> Result<EventSubscription, TransportError> {
        let ledger = self.server.ledger();
        Ok(self.server.bus.subscribe(&*ledger, &self.user_id, after)?)
    }
}
