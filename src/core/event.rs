//! Sync events and wire-envelope normalization.
//!
//! Events are assigned their id at ledger append time, never by a client.
//! Ids are strictly increasing within a ledger: an event's id is both its
//! position in replay order and its deduplication key. One write fans out to
//! several recipients, each materialized as a separate event row with its
//! own id.

use std::fmt;
use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::row::{Row, RowError, RowId};

/// Ledger-assigned event id, strictly increasing within one collection.
#[repr(transparent)]
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EventId(NonZeroU64);

impl EventId {
    pub fn new(raw: NonZeroU64) -> Self {
        Self(raw)
    }

    pub fn from_u64(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How an event's row payload is applied to the view.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventAction {
    Insert,
    Update,
    Delete,
}

impl EventAction {
    pub fn as_str(self) -> &'static str {
        match self {
            EventAction::Insert => "insert",
            EventAction::Update => "update",
            EventAction::Delete => "delete",
        }
    }
}

/// One ledger event: a row change scoped to a single recipient.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncEvent {
    pub id: EventId,
    pub action: EventAction,
    pub data: Row,
    pub user_id: String,
}

impl SyncEvent {
    pub fn row_id(&self) -> Result<RowId, RowError> {
        RowId::of(&self.data)
    }
}

/// Event body as it crosses the push channel, without its id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEventBody {
    pub action: EventAction,
    pub data: Row,
    pub user_id: String,
}

/// The two accepted push-channel envelope shapes.
///
/// Servers normally send a tagged object `{"id": n, "data": {..}}`; some
/// transports flatten it to a positional pair `[n, {..}]`. Both are decoded
/// here, once, before any engine logic sees the event.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireEnvelope {
    Tagged { id: u64, data: WireEventBody },
    Pair(u64, WireEventBody),
}

#[derive(Debug, Error)]
pub enum EventDecodeError {
    #[error("unrecognized event envelope: {0}")]
    Envelope(#[from] serde_json::Error),
    #[error("event id must be a positive integer, got {raw}")]
    InvalidId { raw: u64 },
}

/// Normalize a push-channel envelope into a [`SyncEvent`].
pub fn decode_wire_event(value: Value) -> Result<SyncEvent, EventDecodeError> {
    let envelope: WireEnvelope = serde_json::from_value(value)?;
    let (raw_id, body) = match envelope {
        WireEnvelope::Tagged { id, data } => (id, data),
        WireEnvelope::Pair(id, data) => (id, data),
    };
    let id = EventId::from_u64(raw_id).ok_or(EventDecodeError::InvalidId { raw: raw_id })?;
    Ok(SyncEvent {
        id,
        action: body.action,
        data: body.data,
        user_id: body.user_id,
    })
}

/// Encode an event into the tagged push-channel envelope.
pub fn encode_wire_event(event: &SyncEvent) -> Value {
    serde_json::json!({
        "id": event.id.get(),
        "data": {
            "action": event.action,
            "data": event.data,
            "userId": event.user_id,
        },
    })
}

pub fn decode_wire_event_bytes(bytes: &[u8]) -> Result<SyncEvent, EventDecodeError> {
    let value: Value = serde_json::from_slice(bytes)?;
    decode_wire_event(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_tagged_envelope() {
        let event = decode_wire_event(json!({
            "id": 3,
            "data": {"action": "insert", "data": {"id": 7, "title": "x"}, "userId": "u1"},
        }))
        .expect("decode tagged");

        assert_eq!(event.id.get(), 3);
        assert_eq!(event.action, EventAction::Insert);
        assert_eq!(event.user_id, "u1");
        assert_eq!(event.row_id().unwrap(), RowId::Int(7));
    }

    #[test]
    fn decodes_positional_pair_envelope() {
        let event = decode_wire_event(json!([
            5,
            {"action": "delete", "data": {"id": "k"}, "userId": "u2"},
        ]))
        .expect("decode pair");

        assert_eq!(event.id.get(), 5);
        assert_eq!(event.action, EventAction::Delete);
        assert_eq!(event.row_id().unwrap(), RowId::Str("k".to_string()));
    }

    #[test]
    fn rejects_unrecognized_envelope() {
        let err = decode_wire_event(json!({"event": "nope"})).unwrap_err();
        assert!(matches!(err, EventDecodeError::Envelope(_)));
    }

    #[test]
    fn rejects_zero_event_id() {
        let err = decode_wire_event(json!([
            0,
            {"action": "insert", "data": {"id": 1}, "userId": "u1"},
        ]))
        .unwrap_err();
        assert!(matches!(err, EventDecodeError::InvalidId { raw: 0 }));
    }

    #[test]
    fn encode_produces_the_tagged_envelope() {
        let event = SyncEvent {
            id: EventId::from_u64(3).unwrap(),
            action: EventAction::Insert,
            data: json!({"id": 7, "title": "x"}).as_object().unwrap().clone(),
            user_id: "u1".to_string(),
        };
        let frame = encode_wire_event(&event);
        assert_eq!(frame["id"], 3);
        assert_eq!(frame["data"]["userId"], "u1");
        assert_eq!(decode_wire_event(frame).expect("decode"), event);
    }

    #[test]
    fn sync_event_round_trips_camel_case() {
        let event = SyncEvent {
            id: EventId::from_u64(1).unwrap(),
            action: EventAction::Update,
            data: json!({"id": 1, "title": "a"}).as_object().unwrap().clone(),
            user_id: "u1".to_string(),
        };
        let encoded = serde_json::to_value(&event).expect("encode");
        assert_eq!(encoded["userId"], "u1");
        let decoded: SyncEvent = serde_json::from_value(encoded).expect("decode");
        assert_eq!(decoded, event);
    }
}
