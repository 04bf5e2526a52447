//! Write-acknowledgement gate over the observed-id set.
//!
//! A write-initiator blocks here until its write's echo event has been
//! applied by the reconciliation engine, so a caller never treats a write as
//! complete before the live view reflects it. The observed-id set is owned
//! by one engine session and rebuilt each session; the ledger stays the
//! durable record.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender};
use thiserror::Error;

use crate::core::EventId;

#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum GateError {
    #[error("gate lock poisoned")]
    LockPoisoned,
    #[error("gate torn down while waiting")]
    Closed,
}

/// Observed-id set plus waiter registry. Cheap to clone; all clones share
/// one underlying set.
#[derive(Clone, Default)]
pub struct AckGate {
    inner: Arc<Mutex<GateState>>,
}

#[derive(Default)]
struct GateState {
    observed: HashSet<EventId>,
    next_waiter: u64,
    waiters: Vec<Waiter>,
}

/// Single-fire release channel: removed from the registry the moment it is
/// notified, so duplicate observations cannot double-notify.
struct Waiter {
    key: u64,
    id: EventId,
    release: Sender<()>,
}

impl AckGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_observed(&self, id: EventId) -> Result<bool, GateError> {
        let state = self.lock_state()?;
        Ok(state.observed.contains(&id))
    }

    pub fn observed_count(&self) -> Result<usize, GateError> {
        let state = self.lock_state()?;
        Ok(state.observed.len())
    }

    /// Record `id` as observed and release every waiter registered for it.
    /// Returns whether the id was newly observed.
    pub fn record(&self, id: EventId) -> Result<bool, GateError> {
        let released = {
            let mut state = self.lock_state()?;
            if !state.observed.insert(id) {
                return Ok(false);
            }
            let mut released = Vec::new();
            state.waiters.retain(|waiter| {
                if waiter.id == id {
                    released.push(waiter.release.clone());
                    false
                } else {
                    true
                }
            });
            released
        };
        for release in released {
            let _ = release.try_send(());
        }
        Ok(true)
    }

    /// Block until `id` is observed. Resolves immediately if it already is.
    ///
    /// No timeout is imposed: if the awaited id never arrives (for example a
    /// dropped connection), this waits forever. Callers wanting a bounded
    /// wait use [`await_event_id_timeout`](Self::await_event_id_timeout).
    pub fn await_event_id(&self, id: EventId) -> Result<bool, GateError> {
        let Some((_, release_rx)) = self.register(id)? else {
            return Ok(true);
        };
        release_rx.recv().map_err(|_| GateError::Closed)?;
        Ok(true)
    }

    /// Bounded-wait variant: `Ok(false)` when `timeout` elapses first.
    pub fn await_event_id_timeout(
        &self,
        id: EventId,
        timeout: Duration,
    ) -> Result<bool, GateError> {
        let Some((key, release_rx)) = self.register(id)? else {
            return Ok(true);
        };
        match release_rx.recv_timeout(timeout) {
            Ok(()) => Ok(true),
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                self.deregister(key)?;
                Ok(false)
            }
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => Err(GateError::Closed),
        }
    }

    /// Register a waiter for `id`, or `None` if already observed.
    fn register(&self, id: EventId) -> Result<Option<(u64, Receiver<()>)>, GateError> {
        let mut state = self.lock_state()?;
        if state.observed.contains(&id) {
            return Ok(None);
        }
        let (release, release_rx) = crossbeam::channel::bounded(1);
        let key = state.next_waiter;
        state.next_waiter = state.next_waiter.saturating_add(1);
        state.waiters.push(Waiter { key, id, release });
        Ok(Some((key, release_rx)))
    }

    fn deregister(&self, key: u64) -> Result<(), GateError> {
        let mut state = self.lock_state()?;
        state.waiters.retain(|waiter| waiter.key != key);
        Ok(())
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, GateState>, GateError> {
        self.inner.lock().map_err(|_| GateError::LockPoisoned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn id(raw: u64) -> EventId {
        EventId::from_u64(raw).expect("nonzero id")
    }

    #[test]
    fn resolves_immediately_when_already_observed() {
        let gate = AckGate::new();
        gate.record(id(42)).expect("record");
        assert!(gate.await_event_id(id(42)).expect("await"));
    }

    #[test]
    fn blocks_until_recorded() {
        let gate = AckGate::new();
        let waiter_gate = gate.clone();
        let waiter = thread::spawn(move || waiter_gate.await_event_id(id(7)));

        // Give the waiter a moment to register before releasing it.
        thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished());

        gate.record(id(7)).expect("record");
        assert!(waiter.join().expect("join").expect("await"));
    }

    #[test]
    fn duplicate_record_is_not_newly_observed() {
        let gate = AckGate::new();
        assert!(gate.record(id(1)).expect("first"));
        assert!(!gate.record(id(1)).expect("second"));
    }

    #[test]
    fn timeout_elapses_and_deregisters() {
        let gate = AckGate::new();
        let resolved = gate
            .await_event_id_timeout(id(9), Duration::from_millis(10))
            .expect("await");
        assert!(!resolved);

        // A later record finds no stale waiter to notify.
        assert!(gate.record(id(9)).expect("record"));
    }

    #[test]
    fn releases_every_waiter_for_the_same_id() {
        let gate = AckGate::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let g = gate.clone();
                thread::spawn(move || g.await_event_id(id(5)))
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        gate.record(id(5)).expect("record");
        for waiter in waiters {
            assert!(waiter.join().expect("join").expect("await"));
        }
    }
}
