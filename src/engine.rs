//! The sync reconciliation state machine.
//!
//! Owns the transition from "no local data" to steady-state live sync. The
//! bootstrap ordering is the system's primary correctness invariant: the
//! live subscription opens *before* the snapshot request, so any event
//! appended during the snapshot window is captured by the subscription and
//! replayed after the snapshot commits. Nothing published after
//! subscription-open can be lost.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::bus::{BusError, CancelToken, EventSubscription};
use crate::cache::WarmStartCache;
use crate::config::CollectionConfig;
use crate::core::{Row, RowId, RowSet, RowUpdateMode, SyncEvent, apply_event};
use crate::gate::{AckGate, GateError};
use crate::transport::{Transport, TransportError};

/// Engine state. `Bootstrapping` covers subscription-open through buffer
/// replay; `Live` is terminal until session teardown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncPhase {
    Bootstrapping,
    Live,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SyncError {
    #[error("subscription open failed: {0}")]
    Subscribe(TransportError),
    #[error("snapshot fetch failed: {0}")]
    Snapshot(TransportError),
    #[error("write failed: {0}")]
    Write(#[from] TransportError),
    #[error(transparent)]
    Gate(#[from] GateError),
    #[error("sync session terminated before readiness")]
    SessionClosed,
    #[error("sync session state poisoned")]
    Poisoned,
}

/// One sync session: a subscription lifetime for one collection and user.
pub struct SyncSession;

impl SyncSession {
    /// Open the live subscription, then hand bootstrap and live apply to a
    /// background pump thread. Returns immediately; callers block on
    /// [`SyncHandle::wait_ready`] for first paint.
    pub fn start(
        config: CollectionConfig,
        transport: Arc<dyn Transport>,
        cache: Option<WarmStartCache>,
    ) -> Result<SyncHandle, SyncError> {
        let session_id = Uuid::new_v4();
        let subscription = transport.subscribe(None).map_err(SyncError::Subscribe)?;
        let cancel = subscription.cancel_token();

        let view = Arc::new(Mutex::new(RowSet::new()));
        let phase = Arc::new(Mutex::new(SyncPhase::Bootstrapping));
        let gate = AckGate::new();
        let (ready_tx, ready_rx) = crossbeam::channel::bounded(1);

        let cache = if config.cache_enabled { cache } else { None };
        let pump = Pump {
            session_id,
            collection: config.name.clone(),
            mode: config.row_update_mode,
            transport: Arc::clone(&transport),
            subscription,
            view: Arc::clone(&view),
            phase: Arc::clone(&phase),
            gate: gate.clone(),
            cache,
        };

        let builder = thread::Builder::new().name(format!("tether-sync-{}", config.name));
        let join = builder
            .spawn(move || pump.run(ready_tx))
            .map_err(|e| SyncError::Subscribe(TransportError::Backend {
                reason: format!("failed to spawn sync pump: {e}"),
            }))?;

        Ok(SyncHandle {
            session_id,
            view,
            phase,
            gate,
            transport,
            cancel,
            ready: Mutex::new(ReadyState {
                rx: Some(ready_rx),
                outcome: None,
            }),
            pump: Mutex::new(Some(join)),
        })
    }
}

/// Handle to a running session: the committed view, the write path and
/// teardown. Dropping the handle cancels the subscription.
pub struct SyncHandle {
    session_id: Uuid,
    view: Arc<Mutex<RowSet>>,
    phase: Arc<Mutex<SyncPhase>>,
    gate: AckGate,
    transport: Arc<dyn Transport>,
    cancel: CancelToken,
    ready: Mutex<ReadyState>,
    pump: Mutex<Option<thread::JoinHandle<()>>>,
}

struct ReadyState {
    rx: Option<crossbeam::channel::Receiver<Result<(), SyncError>>>,
    outcome: Option<Result<(), SyncError>>,
}

impl SyncHandle {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Block until readiness is signaled. Readiness fires exactly once,
    /// success or failure, so callers never hang waiting on first paint; a
    /// snapshot failure surfaces here while the view stays usable (possibly
    /// empty) and the subscription stays open.
    pub fn wait_ready(&self) -> Result<(), SyncError> {
        let mut ready = self.ready.lock().map_err(|_| SyncError::Poisoned)?;
        if let Some(outcome) = &ready.outcome {
            return outcome.clone();
        }
        let rx = ready.rx.take().ok_or(SyncError::SessionClosed)?;
        let outcome = rx.recv().unwrap_or(Err(SyncError::SessionClosed));
        ready.outcome = Some(outcome.clone());
        outcome
    }

    pub fn phase(&self) -> SyncPhase {
        self.phase
            .lock()
            .map(|phase| *phase)
            .unwrap_or(SyncPhase::Bootstrapping)
    }

    /// Clone out the committed rows in id order.
    pub fn rows(&self) -> Vec<Row> {
        self.view
            .lock()
            .map(|view| view.rows())
            .unwrap_or_default()
    }

    pub fn get(&self, id: &RowId) -> Option<Row> {
        self.view.lock().ok().and_then(|view| view.get(id).cloned())
    }

    pub fn gate(&self) -> AckGate {
        self.gate.clone()
    }

    /// Create a row and block until its echo event is observed by this
    /// session, so the returned write is reflected in [`rows`](Self::rows).
    pub fn create(&self, row: Row) -> Result<Row, SyncError> {
        let receipt = self.transport.create(row)?;
        self.gate.await_event_id(receipt.event_id)?;
        Ok(receipt.item)
    }

    pub fn update(&self, id: &RowId, changes: Row) -> Result<Row, SyncError> {
        let receipt = self.transport.update(id, changes)?;
        self.gate.await_event_id(receipt.event_id)?;
        Ok(receipt.item)
    }

    pub fn delete(&self, id: &RowId) -> Result<Row, SyncError> {
        let receipt = self.transport.delete(id)?;
        self.gate.await_event_id(receipt.event_id)?;
        Ok(receipt.item)
    }

    /// Bounded-wait write, for callers racing their own timeout against the
    /// echo (the unbounded calls wait forever on a dead subscription).
    pub fn create_timeout(&self, row: Row, timeout: Duration) -> Result<Option<Row>, SyncError> {
        let receipt = self.transport.create(row)?;
        let observed = self.gate.await_event_id_timeout(receipt.event_id, timeout)?;
        Ok(observed.then_some(receipt.item))
    }

    /// Cancel the subscription and join the pump. No further events are
    /// applied afterwards; outstanding gate waiters are left pending.
    pub fn shutdown(&self) {
        self.cancel.cancel();
        let join = self.pump.lock().ok().and_then(|mut pump| pump.take());
        if let Some(join) = join {
            let _ = join.join();
        }
    }
}

impl Drop for SyncHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

struct Pump {
    session_id: Uuid,
    collection: String,
    mode: RowUpdateMode,
    transport: Arc<dyn Transport>,
    subscription: EventSubscription,
    view: Arc<Mutex<RowSet>>,
    phase: Arc<Mutex<SyncPhase>>,
    gate: AckGate,
    cache: Option<WarmStartCache>,
}

impl Pump {
    fn run(mut self, ready_tx: crossbeam::channel::Sender<Result<(), SyncError>>) {
        tracing::debug!(
            session = %self.session_id,
            collection = %self.collection,
            "sync session bootstrapping"
        );

        // 1. Warm start: provisional rows so the view is non-empty before
        //    the network snapshot lands. Best effort, never fatal.
        let warm_ids = self.install_warm_start();

        // 2. Authoritative snapshot. Events arriving meanwhile queue in the
        //    already-open subscription.
        let ready = match self.transport.list() {
            Ok(rows) => {
                self.install_snapshot(rows, &warm_ids);
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    session = %self.session_id,
                    collection = %self.collection,
                    "snapshot fetch failed: {e}"
                );
                Err(SyncError::Snapshot(e))
            }
        };
        // Readiness is signaled exactly once, success or failure.
        let _ = ready_tx.send(ready);

        // 3. Go live and replay the bootstrap-window buffer in capture
        //    order. Ids at or before the snapshot watermark re-apply
        //    idempotently.
        self.set_phase(SyncPhase::Live);
        match self.subscription.drain_pending() {
            Ok(buffered) => {
                if !buffered.is_empty() {
                    tracing::debug!(
                        session = %self.session_id,
                        collection = %self.collection,
                        events = buffered.len(),
                        "replaying buffered events"
                    );
                }
                for event in buffered {
                    self.apply(event);
                }
            }
            Err(BusError::Cancelled) => {
                tracing::debug!(session = %self.session_id, "sync session cancelled");
                return;
            }
            Err(e) => {
                tracing::warn!(session = %self.session_id, "buffer drain stopped: {e}");
                return;
            }
        }

        // 4. Steady state: apply each live event as it arrives.
        loop {
            match self.subscription.recv() {
                Ok(event) => self.apply(event),
                Err(BusError::Cancelled) => {
                    tracing::debug!(session = %self.session_id, "sync session cancelled");
                    return;
                }
                Err(e) => {
                    tracing::warn!(session = %self.session_id, "subscription degraded: {e}");
                    return;
                }
            }
        }
    }

    /// Apply one event atomically (one view-lock acquisition), then record
    /// its id for the gate. Events already observed this session are
    /// skipped; at-least-once delivery across resume boundaries is made
    /// idempotent here.
    fn apply(&self, event: SyncEvent) {
        match self.gate.is_observed(event.id) {
            Ok(true) => {
                tracing::debug!(event = %event.id, "duplicate event skipped");
                return;
            }
            Ok(false) => {}
            Err(e) => {
                tracing::error!(event = %event.id, "gate unavailable: {e}");
                return;
            }
        }

        let applied = {
            let Ok(mut view) = self.view.lock() else {
                tracing::error!(event = %event.id, "view lock poisoned, event dropped");
                return;
            };
            apply_event(&mut view, &event, self.mode)
        };
        match applied {
            Ok(outcome) => {
                tracing::debug!(
                    event = %event.id,
                    row = %outcome.row_id,
                    action = event.action.as_str(),
                    changed = outcome.changed,
                    "event applied"
                );
            }
            Err(e) => {
                tracing::error!(event = %event.id, "event apply failed: {e}");
                return;
            }
        }

        if let Err(e) = self.gate.record(event.id) {
            tracing::error!(event = %event.id, "gate record failed: {e}");
        }
        self.mirror_view();
    }

    /// Provisional insert-batch from the warm-start cache. Returns the ids
    /// installed so the snapshot can retract the whole batch.
    fn install_warm_start(&self) -> Vec<RowId> {
        let Some(cache) = &self.cache else {
            return Vec::new();
        };
        let Some(snapshot) = cache.load(&self.collection) else {
            return Vec::new();
        };

        let Ok(mut view) = self.view.lock() else {
            return Vec::new();
        };
        let mut warm_ids = Vec::new();
        for row in snapshot.rows {
            match RowId::of(&row) {
                Ok(id) => {
                    view.insert_at(id.clone(), row);
                    warm_ids.push(id);
                }
                Err(e) => {
                    tracing::debug!(collection = %self.collection, "warm row skipped: {e}");
                }
            }
        }
        tracing::debug!(
            collection = %self.collection,
            rows = warm_ids.len(),
            "warm start installed"
        );
        warm_ids
    }

    /// Retract the entire warm-start batch and install the authoritative
    /// set, as one unit under the view lock: no intermediate state is
    /// observable.
    fn install_snapshot(&self, rows: Vec<Row>, warm_ids: &[RowId]) {
        let installed = {
            let Ok(mut view) = self.view.lock() else {
                tracing::error!(collection = %self.collection, "view lock poisoned");
                return;
            };
            for id in warm_ids {
                view.remove(id);
            }
            let mut installed = 0usize;
            for row in rows {
                match view.insert(row) {
                    Ok(_) => installed += 1,
                    Err(e) => {
                        tracing::warn!(collection = %self.collection, "snapshot row skipped: {e}");
                    }
                }
            }
            installed
        };
        tracing::debug!(
            session = %self.session_id,
            collection = %self.collection,
            rows = installed,
            "snapshot installed"
        );
        self.mirror_view();
    }

    /// Overwrite the warm-start cache with the current committed rows.
    fn mirror_view(&self) {
        let Some(cache) = &self.cache else {
            return;
        };
        let rows = match self.view.lock() {
            Ok(view) => view.rows(),
            Err(_) => return,
        };
        cache.store(&self.collection, rows);
    }

    fn set_phase(&self, next: SyncPhase) {
        if let Ok(mut phase) = self.phase.lock() {
            *phase = next;
        }
    }
}
