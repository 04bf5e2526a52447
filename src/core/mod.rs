//! Core domain types for tether.
//!
//! Module hierarchy follows type dependency order:
//! - row: RowId, Row, RowSet (Layer 0)
//! - event: EventId, EventAction, SyncEvent, wire envelope (Layer 1)
//! - apply: event application into the row view (Layer 2)

pub mod apply;
pub mod event;
pub mod row;

pub use apply::{ApplyError, ApplyOutcome, RowUpdateMode, apply_event};
pub use event::{
    EventAction, EventDecodeError, EventId, SyncEvent, decode_wire_event, decode_wire_event_bytes,
    encode_wire_event,
};
pub use row::{Row, RowError, RowId, RowSet};
