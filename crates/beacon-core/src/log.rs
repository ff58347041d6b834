//! Bounded, offset-indexed message log.
//!
//! Every topic owns one log. The broker only depends on the [`MessageLog`]
//! contract; [`MemoryLog`] is the default ring-buffer implementation.

use crate::message::{Offset, StoredMessage};
use beacon_protocol::QoS;
use bytes::Bytes;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Default number of messages kept per topic.
pub const DEFAULT_LOG_CAPACITY: usize = 64;

/// Result of reading an offset from a log.
#[derive(Debug, Clone)]
pub enum LogRead {
    /// The message at the requested offset.
    Ready(Arc<StoredMessage>),
    /// Nothing has been published at this offset yet.
    Pending,
    /// The offset was evicted; `oldest` is the first offset still readable.
    Evicted { oldest: Offset },
}

/// Storage contract for a topic's messages.
///
/// Implementations must be safe for one appending writer and many
/// concurrent readers.
pub trait MessageLog: Send + Sync + fmt::Debug {
    /// Append a message, assigning the next offset and evicting the oldest
    /// entry if the log is full.
    fn append(&self, topic: &Arc<str>, qos: QoS, retain: bool, payload: Bytes)
        -> Arc<StoredMessage>;

    /// Read the message at `offset`, telling pending and evicted apart.
    fn read(&self, offset: Offset) -> LogRead;

    /// Get the message at `offset`, or `None` if it is pending or evicted.
    fn get(&self, offset: Offset) -> Option<Arc<StoredMessage>> {
        match self.read(offset) {
            LogRead::Ready(message) => Some(message),
            LogRead::Pending | LogRead::Evicted { .. } => None,
        }
    }

    /// Discard every stored message. The offset counter is kept.
    fn clear(&self);

    /// Offset the next append will receive.
    fn next_offset(&self) -> Offset;

    /// First offset still readable (equals `next_offset` when empty).
    fn oldest_offset(&self) -> Offset;

    /// Number of messages currently stored.
    fn len(&self) -> usize;

    /// Whether the log holds no messages.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of messages kept.
    fn capacity(&self) -> usize;
}

/// Builds the log for a newly created topic.
pub type LogFactory = Arc<dyn Fn(&str) -> Box<dyn MessageLog> + Send + Sync>;

/// A factory producing [`MemoryLog`]s of the given capacity.
#[must_use]
pub fn memory_log_factory(capacity: usize) -> LogFactory {
    Arc::new(move |_topic: &str| Box::new(MemoryLog::with_capacity(capacity)) as Box<dyn MessageLog>)
}

#[derive(Debug)]
struct Ring {
    slots: Vec<Option<Arc<StoredMessage>>>,
    next: Offset,
    oldest: Offset,
}

/// In-memory circular log.
#[derive(Debug)]
pub struct MemoryLog {
    capacity: usize,
    ring: RwLock<Ring>,
}

impl MemoryLog {
    /// Create a log with the default capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_LOG_CAPACITY)
    }

    /// Create a log with a specific capacity (at least one).
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            ring: RwLock::new(Ring {
                slots: vec![None; capacity],
                next: 0,
                oldest: 0,
            }),
        }
    }

    fn slot(&self, offset: Offset) -> usize {
        (offset % self.capacity as u64) as usize
    }
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageLog for MemoryLog {
    fn append(
        &self,
        topic: &Arc<str>,
        qos: QoS,
        retain: bool,
        payload: Bytes,
    ) -> Arc<StoredMessage> {
        let mut ring = self.ring.write().unwrap_or_else(PoisonError::into_inner);
        let offset = ring.next;
        let message = Arc::new(StoredMessage::new(
            offset,
            Arc::clone(topic),
            qos,
            retain,
            payload,
        ));

        let slot = self.slot(offset);
        ring.slots[slot] = Some(Arc::clone(&message));
        ring.next = offset + 1;
        if ring.next - ring.oldest > self.capacity as u64 {
            ring.oldest = ring.next - self.capacity as u64;
        }

        message
    }

    fn read(&self, offset: Offset) -> LogRead {
        let ring = self.ring.read().unwrap_or_else(PoisonError::into_inner);
        if offset >= ring.next {
            return LogRead::Pending;
        }
        if offset < ring.oldest {
            return LogRead::Evicted {
                oldest: ring.oldest,
            };
        }
        match &ring.slots[self.slot(offset)] {
            Some(message) if message.offset == offset => LogRead::Ready(Arc::clone(message)),
            _ => LogRead::Evicted {
                oldest: ring.oldest,
            },
        }
    }

    fn clear(&self) {
        let mut ring = self.ring.write().unwrap_or_else(PoisonError::into_inner);
        ring.slots.iter_mut().for_each(|slot| *slot = None);
        ring.oldest = ring.next;
    }

    fn next_offset(&self) -> Offset {
        self.ring.read().unwrap_or_else(PoisonError::into_inner).next
    }

    fn oldest_offset(&self) -> Offset {
        self.ring.read().unwrap_or_else(PoisonError::into_inner).oldest
    }

    fn len(&self) -> usize {
        let ring = self.ring.read().unwrap_or_else(PoisonError::into_inner);
        (ring.next - ring.oldest) as usize
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}
