//! Outbound in-flight window of a session.
//!
//! Every QoS 1 and QoS 2 delivery occupies one slot, keyed by packet id,
//! until the client acknowledges it. When the window is full, offers are
//! rejected and the caller's drain continuation is parked until a slot frees.

use beacon_protocol::{Frame, PacketId, QoS};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Callback run once an in-flight entry completes or a slot frees up.
pub type Continuation = Box<dyn FnOnce() + Send + 'static>;

/// Outcome of offering a delivery to the window.
#[derive(Debug)]
pub enum Offered {
    /// A slot was reserved; the frame must be sent to the client.
    Accepted(PacketId, Frame),
    /// The window is full. The drain continuation was parked.
    Rejected,
    /// The delivery was cancelled or the session is closed.
    Stale,
}

/// Acknowledgment step received from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckKind {
    PubAck,
    PubRec,
    PubComp,
}

/// What an acknowledgment did to the window.
pub enum Acked {
    /// The entry is done. Run the completion, then the waiters.
    Released {
        completion: Option<Continuation>,
        waiters: Vec<Continuation>,
    },
    /// A QoS 2 entry moved on to awaiting PUBCOMP; answer with PUBREL.
    Release,
    /// No matching entry for that packet id and step.
    Unknown,
}

impl fmt::Debug for Acked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Acked::Released { waiters, .. } => f
                .debug_struct("Released")
                .field("waiters", &waiters.len())
                .finish(),
            Acked::Release => f.write_str("Release"),
            Acked::Unknown => f.write_str("Unknown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    AwaitPubAck,
    AwaitPubRec,
    AwaitPubComp,
}

struct Entry {
    stage: Stage,
    on_complete: Option<Continuation>,
}

/// Packet id allocator over `1..=65535`.
#[derive(Debug, Clone)]
pub(crate) struct PacketIds {
    next: PacketId,
}

impl PacketIds {
    pub(crate) fn new() -> Self {
        Self { next: 1 }
    }

    /// Next id that is not zero and not rejected by `in_use`.
    ///
    /// The caller guarantees at least one id is free.
    pub(crate) fn allocate(&mut self, in_use: impl Fn(PacketId) -> bool) -> PacketId {
        loop {
            let id = self.next;
            self.next = self.next.checked_add(1).unwrap_or(1);
            if id != 0 && !in_use(id) {
                return id;
            }
        }
    }
}

struct State {
    entries: HashMap<PacketId, Entry>,
    waiters: Vec<Continuation>,
    ids: PacketIds,
    closed: bool,
}

/// Bounded window of unacknowledged outbound deliveries.
pub struct InflightQueue {
    window: usize,
    state: Mutex<State>,
}

impl InflightQueue {
    /// Create a window holding at most `window` deliveries (1..=65535).
    #[must_use]
    pub fn new(window: usize) -> Self {
        Self {
            window: window.clamp(1, usize::from(PacketId::MAX)),
            state: Mutex::new(State {
                entries: HashMap::new(),
                waiters: Vec::new(),
                ids: PacketIds::new(),
                closed: false,
            }),
        }
    }

    /// Maximum number of unacknowledged deliveries.
    #[must_use]
    pub fn window(&self) -> usize {
        self.window
    }

    /// Number of unacknowledged deliveries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    /// Whether nothing is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the queue was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Offer a delivery.
    ///
    /// `live` is checked under the window lock; `build` runs under the same
    /// lock with the reserved packet id, so whatever it commits is atomic
    /// with acceptance and with [`InflightQueue::revoke`].
    pub fn offer(
        &self,
        live: &AtomicBool,
        qos: QoS,
        build: impl FnOnce(PacketId) -> Frame,
        on_complete: Continuation,
        on_drain: Continuation,
    ) -> Offered {
        let mut state = self.lock();
        if state.closed || !live.load(Ordering::SeqCst) {
            return Offered::Stale;
        }
        if state.entries.len() >= self.window {
            state.waiters.push(on_drain);
            return Offered::Rejected;
        }

        let State { entries, ids, .. } = &mut *state;
        let packet_id = ids.allocate(|id| entries.contains_key(&id));
        let stage = if qos == QoS::ExactlyOnce {
            Stage::AwaitPubRec
        } else {
            Stage::AwaitPubAck
        };
        entries.insert(
            packet_id,
            Entry {
                stage,
                on_complete: Some(on_complete),
            },
        );
        let frame = build(packet_id);
        Offered::Accepted(packet_id, frame)
    }

    /// Check `live` under the window lock without reserving a slot.
    ///
    /// Used by QoS 0 sends so they are ordered with [`InflightQueue::revoke`].
    #[must_use]
    pub fn admits(&self, live: &AtomicBool) -> bool {
        let state = self.lock();
        !state.closed && live.load(Ordering::SeqCst)
    }

    /// Clear `flag` under the window lock.
    ///
    /// Once this returns, no offer observing `flag` can be accepted.
    pub fn revoke(&self, flag: &AtomicBool) {
        let _state = self.lock();
        flag.store(false, Ordering::SeqCst);
    }

    /// Apply an acknowledgment from the client.
    pub fn acknowledge(&self, packet_id: PacketId, kind: AckKind) -> Acked {
        let mut state = self.lock();
        let Some(stage) = state.entries.get(&packet_id).map(|entry| entry.stage) else {
            return Acked::Unknown;
        };

        match (kind, stage) {
            (AckKind::PubAck, Stage::AwaitPubAck) | (AckKind::PubComp, Stage::AwaitPubComp) => {
                let completion = state
                    .entries
                    .remove(&packet_id)
                    .and_then(|mut entry| entry.on_complete.take());
                let waiters = std::mem::take(&mut state.waiters);
                Acked::Released {
                    completion,
                    waiters,
                }
            }
            (AckKind::PubRec, Stage::AwaitPubRec | Stage::AwaitPubComp) => {
                if let Some(entry) = state.entries.get_mut(&packet_id) {
                    entry.stage = Stage::AwaitPubComp;
                }
                Acked::Release
            }
            _ => Acked::Unknown,
        }
    }

    /// Close the window, dropping all entries and parked continuations.
    ///
    /// Returns the number of deliveries that were still in flight.
    pub fn close(&self) -> usize {
        let (entries, waiters) = {
            let mut state = self.lock();
            state.closed = true;
            (
                std::mem::take(&mut state.entries),
                std::mem::take(&mut state.waiters),
            )
        };
        let dropped = entries.len();
        drop(entries);
        drop(waiters);
        dropped
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for InflightQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InflightQueue")
            .field("window", &self.window)
            .field("len", &self.len())
            .finish()
    }
}
