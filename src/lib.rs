#![forbid(unsafe_code)]

//! tether: a synchronization bridge between a server-authoritative data set
//! and a client-side reactive row collection.
//!
//! One sync session reconciles an initial bulk snapshot, a live event
//! subscription, and an optimistic local write path into a single ordered
//! view. The live subscription opens before the snapshot request, events
//! arriving mid-snapshot are buffered and replayed exactly once after the
//! snapshot commits, and local writes can block until their server-confirmed
//! echo event has been observed.

pub mod bus;
pub mod cache;
pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod gate;
pub mod ledger;
pub mod telemetry;
pub mod transport;

pub use error::Error;
pub type Result<T> = std::result::Result<T, Error>;

// Re-export the working surface at the crate root for convenience.
pub use crate::bus::{BusError, CancelToken, EventBus, EventSubscription};
pub use crate::cache::{
    CacheError, CacheStore, CachedSnapshot, FileCacheStore, JsonSerializer, MemoryCacheStore,
    Serializer, WarmStartCache,
};
pub use crate::config::{CollectionConfig, ConfigError, LogLevel, LoggingConfig};
pub use crate::core::{
    ApplyError, ApplyOutcome, EventAction, EventDecodeError, EventId, Row, RowError, RowId,
    RowSet, RowUpdateMode, SyncEvent, apply_event, decode_wire_event, decode_wire_event_bytes,
    encode_wire_event,
};
pub use crate::engine::{SyncError, SyncHandle, SyncPhase, SyncSession};
pub use crate::gate::{AckGate, GateError};
pub use crate::ledger::{EventLedger, LedgerError, MemoryLedger};
pub use crate::transport::{
    LocalServer, LocalTransport, Transport, TransportError, WriteReceipt,
};
