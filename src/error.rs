use thiserror::Error;

use crate::bus::BusError;
use crate::cache::CacheError;
use crate::config::ConfigError;
use crate::core::{ApplyError, EventDecodeError};
use crate::engine::SyncError;
use crate::gate::GateError;
use crate::ledger::LedgerError;
use crate::transport::TransportError;

/// Crate-level convenience error.
///
/// Not a "god error": it is a thin wrapper over the per-component errors.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Decode(#[from] EventDecodeError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
