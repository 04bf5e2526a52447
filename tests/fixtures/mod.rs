//! Shared harness for sync session tests.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use crossbeam::channel::{Receiver, Sender};
use serde_json::Value;
use tether::engine::{SyncHandle, SyncSession};
use tether::{
    CollectionConfig, EventId, EventSubscription, LocalServer, Row, RowId, Transport,
    TransportError, WarmStartCache, WriteReceipt,
};

pub fn row(value: Value) -> Row {
    value.as_object().expect("object row").clone()
}

pub fn start(
    server: &LocalServer,
    user: &str,
    cache: Option<WarmStartCache>,
) -> SyncHandle {
    let transport = Arc::new(server.transport_for(user));
    SyncSession::start(CollectionConfig::new("todos"), transport, cache).expect("start session")
}

/// Transport wrapper that freezes the snapshot contents at construction time
/// and holds the `list` call until released, so tests can publish events into
/// the bootstrap window deterministically.
pub struct ScriptedSnapshot {
    inner: tether::LocalTransport,
    snapshot: Mutex<Vec<Row>>,
    release_rx: Receiver<()>,
}

impl ScriptedSnapshot {
    /// Captures the server's current rows for `user` as the snapshot.
    pub fn hold(server: &LocalServer, user: &str) -> (Arc<Self>, Sender<()>) {
        let inner = server.transport_for(user);
        let snapshot = inner.list().expect("capture snapshot");
        let (release, release_rx) = crossbeam::channel::bounded(1);
        (
            Arc::new(Self {
                inner,
                snapshot: Mutex::new(snapshot),
                release_rx,
            }),
            release,
        )
    }
}

impl Transport for ScriptedSnapshot {
    fn list(&self) -> Result<Vec<Row>, TransportError> {
        self.release_rx.recv().map_err(|_| TransportError::Backend {
            reason: "snapshot release dropped".to_string(),
        })?;
        Ok(self.snapshot.lock().expect("snapshot lock").clone())
    }

    fn create(&self, row: Row) -> Result<WriteReceipt, TransportError> {
        self.inner.create(row)
    }

    fn update(&self, id: &RowId, changes: Row) -> Result<WriteReceipt, TransportError> {
        self.inner.update(id, changes)
    }

    fn delete(&self, id: &RowId) -> Result<WriteReceipt, TransportError> {
        self.inner.delete(id)
    }

    fn subscribe(&self, after: Option<EventId>) -> Result<EventSubscription, TransportError> {
        self.inner.subscribe(after)
    }
}

/// Transport wrapper whose snapshot always fails; everything else passes
/// through.
pub struct FailingSnapshot {
    inner: tether::LocalTransport,
}

impl FailingSnapshot {
    pub fn new(server: &LocalServer, user: &str) -> Arc<Self> {
        Arc::new(Self {
            inner: server.transport_for(user),
        })
    }
}

impl Transport for FailingSnapshot {
    fn list(&self) -> Result<Vec<Row>, TransportError> {
        Err(TransportError::Backend {
            reason: "snapshot endpoint down".to_string(),
        })
    }

    fn create(&self, row: Row) -> Result<WriteReceipt, TransportError> {
        self.inner.create(row)
    }

    fn update(&self, id: &RowId, changes: Row) -> Result<WriteReceipt, TransportError> {
        self.inner.update(id, changes)
    }

    fn delete(&self, id: &RowId) -> Result<WriteReceipt, TransportError> {
        self.inner.delete(id)
    }

    fn subscribe(&self, after: Option<EventId>) -> Result<EventSubscription, TransportError> {
        self.inner.subscribe(after)
    }
}
