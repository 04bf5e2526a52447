//! Per-recipient event fan-out and resumable subscriptions.
//!
//! The bus is process-wide and partitions strictly by recipient user id: a
//! published event reaches exactly the live subscribers registered for its
//! `user_id`, in publish order. The live channel carries raw push-channel
//! envelopes; each subscription normalizes its frames before anything
//! downstream sees them. The bus never persists anything — an event with no
//! listener is simply dropped here, durability is the ledger's job.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, TryRecvError};
use crossbeam::select;
use serde_json::Value;
use thiserror::Error;

use crate::core::{EventDecodeError, EventId, SyncEvent, decode_wire_event, encode_wire_event};
use crate::ledger::{EventLedger, LedgerError};

/// First-class cancellation handle for one subscription.
///
/// Cancelling sets a shared flag (checked by the bus on publish) and wakes
/// any receiver blocked on the subscription so delivery stops promptly.
#[derive(Clone, Debug)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    wake: Sender<()>,
}

impl CancelToken {
    fn new() -> (Self, Receiver<()>) {
        let (wake, wake_rx) = crossbeam::channel::bounded(1);
        let token = Self {
            flag: Arc::new(AtomicBool::new(false)),
            wake,
        };
        (token, wake_rx)
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
        let _ = self.wake.try_send(());
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// A lazy, cancellable, resumable event sequence for one recipient.
///
/// Yields the ledger catch-up prefix first, then live publishes, in strictly
/// increasing id order. `cursor()` is the resumption point: a new
/// subscription opened with it continues where this one stopped.
pub struct EventSubscription {
    catch_up: std::collections::VecDeque<SyncEvent>,
    receiver: Receiver<Value>,
    wake_rx: Receiver<()>,
    cancel: CancelToken,
    cursor: Option<EventId>,
}

impl EventSubscription {
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Last delivered event id, if any.
    pub fn cursor(&self) -> Option<EventId> {
        self.cursor
    }

    /// Block until the next event, cancellation, or bus teardown.
    pub fn recv(&mut self) -> Result<SyncEvent, BusError> {
        loop {
            if let Some(event) = self.next_catch_up() {
                return Ok(event);
            }
            if self.cancel.is_cancelled() {
                return Err(BusError::Cancelled);
            }
            let step = select! {
                recv(self.receiver) -> msg => msg.map_err(|_| BusError::Disconnected),
                recv(self.wake_rx) -> _ => Err(BusError::Cancelled),
            };
            if let Some(event) = self.deliver(step?)? {
                return Ok(event);
            }
        }
    }

    /// Like [`recv`](Self::recv) but gives up after `timeout`, returning
    /// `Ok(None)`.
    pub fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<SyncEvent>, BusError> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(event) = self.next_catch_up() {
                return Ok(Some(event));
            }
            if self.cancel.is_cancelled() {
                return Err(BusError::Cancelled);
            }
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            let step = select! {
                recv(self.receiver) -> msg => match msg {
                    Ok(frame) => Ok(Some(frame)),
                    Err(_) => Err(BusError::Disconnected),
                },
                recv(self.wake_rx) -> _ => Err(BusError::Cancelled),
                default(remaining) => Ok(None),
            };
            match step? {
                Some(frame) => {
                    if let Some(event) = self.deliver(frame)? {
                        return Ok(Some(event));
                    }
                }
                None => return Ok(None),
            }
        }
    }

    pub fn try_recv(&mut self) -> Result<Option<SyncEvent>, BusError> {
        loop {
            if let Some(event) = self.next_catch_up() {
                return Ok(Some(event));
            }
            if self.cancel.is_cancelled() {
                return Err(BusError::Cancelled);
            }
            let step = self.receiver.try_recv();
            match step {
                Ok(frame) => {
                    if let Some(event) = self.deliver(frame)? {
                        return Ok(Some(event));
                    }
                }
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Disconnected) => return Err(BusError::Disconnected),
            }
        }
    }

    /// Drain everything already received without blocking, in capture order.
    pub fn drain_pending(&mut self) -> Result<Vec<SyncEvent>, BusError> {
        let mut drained = Vec::new();
        while let Some(event) = self.try_recv()? {
            drained.push(event);
        }
        Ok(drained)
    }

    fn next_catch_up(&mut self) -> Option<SyncEvent> {
        let event = self.catch_up.pop_front()?;
        self.cursor = Some(event.id);
        Some(event)
    }

    /// Normalize one push-channel frame, then suppress duplicates from the
    /// uncoordinated catch-up/live window: a live event already covered by
    /// the cursor has been delivered via the catch-up prefix.
    fn deliver(&mut self, frame: Value) -> Result<Option<SyncEvent>, BusError> {
        let event = decode_wire_event(frame)?;
        if let Some(cursor) = self.cursor {
            if event.id <= cursor {
                return Ok(None);
            }
        }
        self.cursor = Some(event.id);
        Ok(Some(event))
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus lock poisoned")]
    LockPoisoned,
    #[error("subscription cancelled")]
    Cancelled,
    #[error("bus dropped while subscription was open")]
    Disconnected,
    #[error(transparent)]
    Decode(#[from] EventDecodeError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// In-process publish/subscribe multiplexer, shared across sessions.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<BusState>>,
}

#[derive(Default)]
struct BusState {
    next_subscriber_id: u64,
    subscribers: BTreeMap<u64, SubscriberState>,
}

struct SubscriberState {
    user_id: String,
    sender: Sender<Value>,
    cancelled: Arc<AtomicBool>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hand `event` to every live subscriber registered for its recipient,
    /// encoded as a tagged push-channel envelope.
    pub fn publish(&self, event: &SyncEvent) -> Result<usize, BusError> {
        self.publish_frame(&event.user_id, encode_wire_event(event))
    }

    /// Hand one raw envelope frame to `recipient`'s live subscribers; the
    /// subscription normalizes it on receipt, so either envelope shape
    /// works. Returns the delivery count; cancelled and disconnected
    /// subscribers are pruned.
    pub fn publish_frame(&self, recipient: &str, frame: Value) -> Result<usize, BusError> {
        let mut state = self.lock_state()?;
        let mut delivered = 0;
        let mut gone = Vec::new();
        for (id, subscriber) in &state.subscribers {
            if subscriber.user_id != recipient {
                continue;
            }
            if subscriber.cancelled.load(Ordering::Acquire) {
                gone.push(*id);
                continue;
            }
            match subscriber.sender.send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(_) => gone.push(*id),
            }
        }
        for id in gone {
            state.subscribers.remove(&id);
        }
        Ok(delivered)
    }

    /// Open a resumable subscription for `user_id`.
    ///
    /// With an explicit `after` cursor the ledger is read for the events
    /// missed since that point; without one the subscription is live-only —
    /// history belongs to the snapshot, not the push channel. The live
    /// sender is registered before the catch-up read, so no event appended
    /// after this call can be lost: it lands in the catch-up prefix, the
    /// live channel, or both (the subscription dedups the overlap by id).
    pub fn subscribe(
        &self,
        ledger: &dyn EventLedger,
        user_id: &str,
        after: Option<EventId>,
    ) -> Result<EventSubscription, BusError> {
        let (sender, receiver) = crossbeam::channel::unbounded();
        let (cancel, wake_rx) = CancelToken::new();
        {
            let mut state = self.lock_state()?;
            let id = state.next_subscriber_id;
            state.next_subscriber_id = state.next_subscriber_id.saturating_add(1);
            state.subscribers.insert(
                id,
                SubscriberState {
                    user_id: user_id.to_string(),
                    sender,
                    cancelled: Arc::clone(&cancel.flag),
                },
            );
        }

        let catch_up = match after {
            Some(after) => ledger.list_since(user_id, Some(after))?,
            None => Vec::new(),
        };
        let cursor = catch_up.last().map(|event| event.id).or(after);

        Ok(EventSubscription {
            catch_up: catch_up.into(),
            receiver,
            wake_rx,
            cancel,
            cursor,
        })
    }

    pub fn subscriber_count(&self) -> Result<usize, BusError> {
        let state = self.lock_state()?;
        Ok(state.subscribers.len())
    }

    fn lock_state(&self) -> Result<std::sync::MutexGuard<'_, BusState>, BusError> {
        self.inner.lock().map_err(|_| BusError::LockPoisoned)
    }
}
