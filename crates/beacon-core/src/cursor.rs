//! Per-subscriber delivery cursors.
//!
//! A cursor is one subscriber's read position on one topic. Deliveries at
//! QoS 0 are sent immediately and the cursor moves on. Acknowledged
//! deliveries hold the cursor's single-flight guard until the client
//! acknowledges, so at most one message per cursor is unacknowledged and
//! offsets reach the client strictly in order.
//!
//! A cursor never recurses into itself: when an acknowledgment arrives it
//! registers with its topic again and the next pass sends the next message.

use crate::inflight::Continuation;
use crate::log::LogRead;
use crate::message::{Offset, StoredMessage};
use crate::metrics;
use crate::relation::{SubscriberKey, SubscriptionRelation};
use crate::scheduler::{DeliveryError, DeliveryTask};
use crate::session::{Dispatch, Offer, Session};
use crate::topic::Topic;
use beacon_protocol::{Frame, PacketId, QoS};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{trace, warn};

/// Read the next available message at `offset`, fast-forwarding past
/// evicted entries.
pub(crate) fn read_forward(
    topic: &Topic,
    offset: &AtomicU64,
    skipped: &AtomicU64,
    reader: &dyn fmt::Display,
) -> Option<Arc<StoredMessage>> {
    loop {
        let at = offset.load(Ordering::SeqCst);
        match topic.log().read(at) {
            LogRead::Ready(message) => return Some(message),
            LogRead::Pending => return None,
            LogRead::Evicted { oldest } => {
                let gap = oldest.saturating_sub(at);
                if offset
                    .compare_exchange(at, oldest, Ordering::SeqCst, Ordering::SeqCst)
                    .is_ok()
                {
                    skipped.fetch_add(gap, Ordering::SeqCst);
                    metrics::record_skipped(gap);
                    warn!(
                        topic = %topic.name(),
                        reader = %reader,
                        from = at,
                        to = oldest,
                        "Reader fell behind the log, skipping evicted messages"
                    );
                }
            }
        }
    }
}

enum Next {
    Retained(Arc<StoredMessage>),
    Log(Arc<StoredMessage>),
}

impl Next {
    fn message(&self) -> &Arc<StoredMessage> {
        match self {
            Next::Retained(message) | Next::Log(message) => message,
        }
    }

    fn frame(&self, qos: QoS, packet_id: Option<PacketId>) -> Frame {
        let frame = self.message().to_frame(qos, packet_id);
        match self {
            Next::Retained(_) => frame.retained(true),
            Next::Log(_) => frame,
        }
    }
}

/// A subscriber's position on a topic.
pub struct Cursor {
    key: SubscriberKey,
    qos: QoS,
    topic: Weak<Topic>,
    session: Weak<Session>,
    relation: Weak<SubscriptionRelation>,
    next_offset: AtomicU64,
    retained: Mutex<Option<Arc<StoredMessage>>>,
    enabled: AtomicBool,
    in_flight: AtomicBool,
    queued: AtomicBool,
    skipped: AtomicU64,
    delivered: AtomicU64,
}

impl Cursor {
    /// Create a cursor at the topic's tail.
    ///
    /// If the topic has a retained message it is delivered first.
    pub(crate) fn new(
        key: SubscriberKey,
        qos: QoS,
        topic: &Topic,
        session: &Arc<Session>,
        relation: Weak<SubscriptionRelation>,
    ) -> Arc<Self> {
        let start = topic.log().next_offset();
        let retained = topic.retained().filter(|message| message.offset < start);
        Arc::new(Self {
            key,
            qos,
            topic: topic.handle(),
            session: Arc::downgrade(session),
            relation,
            next_offset: AtomicU64::new(start),
            retained: Mutex::new(retained),
            enabled: AtomicBool::new(true),
            in_flight: AtomicBool::new(false),
            queued: AtomicBool::new(false),
            skipped: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
        })
    }

    /// Get the subscription key.
    #[must_use]
    pub fn key(&self) -> &SubscriberKey {
        &self.key
    }

    /// Get the subscription QoS.
    #[must_use]
    pub fn qos(&self) -> QoS {
        self.qos
    }

    /// Whether deliveries wait for an acknowledgment.
    #[must_use]
    pub fn is_acknowledged(&self) -> bool {
        self.qos.is_acknowledged()
    }

    /// Offset of the next message to deliver.
    #[must_use]
    pub fn next_offset(&self) -> Offset {
        self.next_offset.load(Ordering::SeqCst)
    }

    /// Messages skipped because they were evicted before delivery.
    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::SeqCst)
    }

    /// Messages handed to the session.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    /// Whether the cursor may still deliver.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Whether a delivery is unacknowledged or in progress.
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub(crate) fn relation(&self) -> Weak<SubscriptionRelation> {
        self.relation.clone()
    }

    /// Stop all further deliveries.
    ///
    /// Takes the session's in-flight lock, so no offer that started before
    /// this call can be accepted after it returns.
    pub(crate) fn disable(&self) {
        match self.session.upgrade() {
            Some(session) => session.revoke(&self.enabled),
            None => self.enabled.store(false, Ordering::SeqCst),
        }
    }

    /// Register with the topic for the next pass, once.
    pub(crate) fn arm(self: &Arc<Self>, topic: &Topic) {
        if !self.is_enabled() {
            return;
        }
        if self
            .queued
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            topic.register(Arc::clone(self) as Arc<dyn DeliveryTask>);
        }
    }

    fn resume(self: &Arc<Self>) {
        if !self.is_enabled() {
            return;
        }
        self.in_flight.store(false, Ordering::SeqCst);
        if let Some(topic) = self.topic.upgrade() {
            self.arm(&topic);
            topic.notify();
        }
    }

    fn continuation(self: &Arc<Self>) -> Continuation {
        let cursor = Arc::downgrade(self);
        Box::new(move || {
            if let Some(cursor) = cursor.upgrade() {
                cursor.resume();
            }
        })
    }

    fn next(&self, topic: &Topic) -> Option<Next> {
        let mut captured = self.retained.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(message) = captured.as_ref() {
            // Only send the captured state while it is still the retained one.
            let current = topic.retained();
            if current.is_some_and(|current| current.offset == message.offset) {
                return Some(Next::Retained(Arc::clone(message)));
            }
            trace!(
                subscriber = %self.key,
                offset = message.offset,
                "Dropping stale retained message"
            );
            *captured = None;
        }
        drop(captured);
        read_forward(topic, &self.next_offset, &self.skipped, &self.key).map(Next::Log)
    }

    fn has_next(&self, topic: &Topic) -> bool {
        self.retained
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
            || !matches!(topic.log().read(self.next_offset()), LogRead::Pending)
    }

    fn commit(&self, next: &Next) {
        match next {
            Next::Retained(_) => {
                *self.retained.lock().unwrap_or_else(PoisonError::into_inner) = None;
            }
            Next::Log(message) => {
                self.next_offset.store(message.offset + 1, Ordering::SeqCst);
            }
        }
        self.delivered.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        self.in_flight.store(false, Ordering::SeqCst);
    }
}

impl DeliveryTask for Cursor {
    fn deliver(self: Arc<Self>, topic: &Topic) -> Result<(), DeliveryError> {
        self.queued.store(false, Ordering::SeqCst);
        if !self.is_enabled() {
            return Ok(());
        }
        let Some(session) = self.session.upgrade() else {
            self.enabled.store(false, Ordering::SeqCst);
            return Err(DeliveryError::SessionGone(self.key.to_string()));
        };
        if !session.is_connected() {
            trace!(subscriber = %self.key, "Session not connected, skipping delivery");
            return Ok(());
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        loop {
            let Some(next) = self.next(topic) else {
                self.release();
                self.arm(topic);
                if self.has_next(topic) {
                    topic.notify();
                }
                return Ok(());
            };

            let qos = self.qos.min(next.message().qos);
            if !qos.is_acknowledged() {
                match session.send(&self.enabled, next.frame(qos, None)) {
                    Dispatch::Sent => {
                        self.commit(&next);
                        continue;
                    }
                    Dispatch::Stale => {
                        self.release();
                        return Ok(());
                    }
                    Dispatch::Closed => {
                        self.release();
                        return Err(DeliveryError::OutboundClosed(self.key.to_string()));
                    }
                }
            }

            let offer = session.offer(
                &self.enabled,
                qos,
                |packet_id| {
                    self.commit(&next);
                    next.frame(qos, Some(packet_id))
                },
                self.continuation(),
                self.continuation(),
            );
            match offer {
                Offer::Accepted(packet_id) => {
                    trace!(
                        subscriber = %self.key,
                        offset = next.message().offset,
                        packet_id,
                        "Awaiting acknowledgment"
                    );
                    return Ok(());
                }
                Offer::Rejected => return Ok(()),
                Offer::Stale => {
                    self.release();
                    return Ok(());
                }
            }
        }
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("key", &self.key)
            .field("qos", &self.qos)
            .field("next_offset", &self.next_offset())
            .field("enabled", &self.is_enabled())
            .field("in_flight", &self.is_in_flight())
            .field("skipped", &self.skipped())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemoryLog;
    use crate::scheduler::InlineExecutor;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    struct Fixture {
        topic: Arc<Topic>,
        session: Arc<Session>,
        rx: mpsc::UnboundedReceiver<Frame>,
    }

    fn fixture(capacity: usize, window: usize) -> Fixture {
        let topic = Topic::new(
            "sensors/1/temp",
            Box::new(MemoryLog::with_capacity(capacity)),
            Arc::new(InlineExecutor),
        );
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Session::new("client-1", window, tx);
        Fixture { topic, session, rx }
    }

    fn attach(fixture: &Fixture, qos: QoS) -> Arc<Cursor> {
        let cursor = Cursor::new(
            SubscriberKey::new("client-1", "sensors/1/temp"),
            qos,
            &fixture.topic,
            &fixture.session,
            Weak::new(),
        );
        fixture.topic.attach_cursor(Arc::clone(&cursor));
        cursor.arm(&fixture.topic);
        fixture.topic.notify();
        cursor
    }

    fn publish(fixture: &Fixture, qos: QoS, payload: &'static [u8]) {
        fixture
            .topic
            .publish(qos, false, Bytes::from_static(payload));
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<Frame> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn payloads(frames: &[Frame]) -> Vec<Bytes> {
        frames
            .iter()
            .filter_map(|frame| match frame {
                Frame::Publish { payload, .. } => Some(payload.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_at_most_once_sends_everything() {
        let mut fixture = fixture(16, 4);
        let cursor = attach(&fixture, QoS::AtMostOnce);

        publish(&fixture, QoS::AtLeastOnce, b"1");
        publish(&fixture, QoS::AtLeastOnce, b"2");
        publish(&fixture, QoS::AtLeastOnce, b"3");

        let frames = drain(&mut fixture.rx);
        assert_eq!(payloads(&frames), vec!["1", "2", "3"]);
        assert!(frames.iter().all(|f| f.packet_id().is_none()));
        assert_eq!(cursor.next_offset(), 3);
        assert!(!cursor.is_in_flight());
    }

    #[test]
    fn test_at_least_once_keeps_one_unacknowledged() {
        let mut fixture = fixture(16, 8);
        let cursor = attach(&fixture, QoS::AtLeastOnce);

        publish(&fixture, QoS::AtLeastOnce, b"1");
        publish(&fixture, QoS::AtLeastOnce, b"2");
        publish(&fixture, QoS::AtLeastOnce, b"3");

        let mut seen = Vec::new();
        for _ in 0..3 {
            let frames = drain(&mut fixture.rx);
            assert_eq!(frames.len(), 1, "exactly one unacknowledged message");
            assert!(cursor.is_in_flight());
            let packet_id = frames[0].packet_id().unwrap();
            seen.extend(payloads(&frames));
            assert!(fixture.session.on_puback(packet_id));
        }

        assert_eq!(seen, vec!["1", "2", "3"]);
        assert!(drain(&mut fixture.rx).is_empty());
        assert!(!cursor.is_in_flight());
        assert_eq!(cursor.delivered(), 3);
    }

    #[test]
    fn test_effective_qos_is_minimum() {
        let mut fixture = fixture(16, 8);
        attach(&fixture, QoS::ExactlyOnce);

        publish(&fixture, QoS::AtMostOnce, b"a");
        let frames = drain(&mut fixture.rx);
        assert!(matches!(
            frames[..],
            [Frame::Publish {
                qos: QoS::AtMostOnce,
                packet_id: None,
                ..
            }]
        ));
    }

    #[test]
    fn test_disabled_cursor_sends_nothing() {
        let mut fixture = fixture(16, 8);
        let cursor = attach(&fixture, QoS::AtLeastOnce);

        publish(&fixture, QoS::AtLeastOnce, b"1");
        let first = drain(&mut fixture.rx);
        assert_eq!(first.len(), 1);

        cursor.disable();
        publish(&fixture, QoS::AtLeastOnce, b"2");
        fixture.session.on_puback(first[0].packet_id().unwrap());
        publish(&fixture, QoS::AtLeastOnce, b"3");

        assert!(drain(&mut fixture.rx).is_empty());
    }

    #[test]
    fn test_evicted_offsets_are_skipped() {
        let mut fixture = fixture(4, 8);
        let cursor = attach(&fixture, QoS::AtLeastOnce);

        for payload in [b"0", b"1", b"2", b"3", b"4", b"5"] {
            publish(&fixture, QoS::AtLeastOnce, payload);
        }

        let first = drain(&mut fixture.rx);
        assert_eq!(payloads(&first), vec!["0"]);
        assert_eq!(fixture.topic.log().oldest_offset(), 2);

        fixture.session.on_puback(first[0].packet_id().unwrap());
        let second = drain(&mut fixture.rx);
        assert_eq!(payloads(&second), vec!["2"]);
        assert_eq!(cursor.skipped(), 1);
    }

    #[test]
    fn test_new_cursor_starts_at_tail() {
        let mut fixture = fixture(4, 8);
        for payload in [b"0", b"1", b"2", b"3", b"4", b"5"] {
            publish(&fixture, QoS::AtLeastOnce, payload);
        }

        let cursor = attach(&fixture, QoS::AtMostOnce);
        assert_eq!(cursor.next_offset(), 6);
        assert!(drain(&mut fixture.rx).is_empty());

        publish(&fixture, QoS::AtLeastOnce, b"6");
        assert_eq!(payloads(&drain(&mut fixture.rx)), vec!["6"]);
    }

    #[test]
    fn test_retained_message_comes_first() {
        let mut fixture = fixture(8, 8);
        fixture
            .topic
            .publish(QoS::AtLeastOnce, true, Bytes::from_static(b"state"));
        publish(&fixture, QoS::AtLeastOnce, b"later");

        let cursor = attach(&fixture, QoS::AtMostOnce);
        let frames = drain(&mut fixture.rx);
        assert_eq!(payloads(&frames), vec!["state"]);
        assert!(matches!(frames[0], Frame::Publish { retain: true, .. }));

        publish(&fixture, QoS::AtLeastOnce, b"next");
        let frames = drain(&mut fixture.rx);
        assert_eq!(payloads(&frames), vec!["next"]);
        assert!(matches!(frames[0], Frame::Publish { retain: false, .. }));
        assert_eq!(cursor.next_offset(), 3);
    }

    #[test]
    fn test_cleared_retained_message_is_not_sent() {
        let mut fixture = fixture(16, 1);
        let other = Cursor::new(
            SubscriberKey::new("client-1", "sensors/+/temp"),
            QoS::AtLeastOnce,
            &fixture.topic,
            &fixture.session,
            Weak::new(),
        );
        fixture.topic.attach_cursor(Arc::clone(&other));
        other.arm(&fixture.topic);

        // other fills the window, so the late cursor waits with its capture.
        publish(&fixture, QoS::AtLeastOnce, b"x");
        fixture
            .topic
            .publish(QoS::AtLeastOnce, true, Bytes::from_static(b"old-state"));
        let late = attach(&fixture, QoS::AtLeastOnce);
        fixture.topic.publish(QoS::AtLeastOnce, true, Bytes::new());
        assert!(fixture.topic.retained().is_none());

        let mut seen = drain(&mut fixture.rx);
        let mut acked = 0;
        while acked < seen.len() {
            fixture.session.on_puback(seen[acked].packet_id().unwrap());
            acked += 1;
            seen.extend(drain(&mut fixture.rx));
        }

        assert!(!seen
            .iter()
            .any(|frame| matches!(frame, Frame::Publish { retain: true, .. })));
        assert_eq!(late.delivered(), 1);
        assert_eq!(late.next_offset(), 3);
        assert_eq!(other.delivered(), 3);
    }

    #[test]
    fn test_replaced_retained_message_sends_current_state() {
        let mut fixture = fixture(16, 4);
        fixture
            .topic
            .publish(QoS::AtLeastOnce, true, Bytes::from_static(b"v1"));
        let late = attach(&fixture, QoS::AtMostOnce);
        assert_eq!(payloads(&drain(&mut fixture.rx)), vec!["v1"]);

        // A capture that is replaced before it goes out is dropped.
        let stale = Cursor::new(
            SubscriberKey::new("client-1", "sensors/#"),
            QoS::AtMostOnce,
            &fixture.topic,
            &fixture.session,
            Weak::new(),
        );
        fixture
            .topic
            .publish(QoS::AtMostOnce, true, Bytes::from_static(b"v2"));
        fixture.topic.attach_cursor(Arc::clone(&stale));
        stale.arm(&fixture.topic);
        fixture.topic.notify();

        let frames = drain(&mut fixture.rx);
        assert!(!frames
            .iter()
            .any(|frame| matches!(frame, Frame::Publish { retain: true, .. })));
        assert_eq!(payloads(&frames), vec!["v2", "v2"]);
        assert_eq!(late.delivered(), 2);
        assert_eq!(stale.delivered(), 1);
        assert_eq!(stale.next_offset(), 2);
    }

    #[test]
    fn test_disconnected_session_is_skipped() {
        let fixture = fixture(16, 4);
        let cursor = attach(&fixture, QoS::AtLeastOnce);
        let Fixture { topic, session, rx } = fixture;
        drop(rx);
        assert!(!session.is_connected());

        topic.publish(QoS::AtLeastOnce, false, Bytes::from_static(b"lost"));
        assert!(Arc::clone(&cursor).deliver(&topic).is_ok());
        assert!(cursor.is_enabled());
        assert!(!cursor.is_in_flight());
        assert_eq!(cursor.next_offset(), 0);
        assert_eq!(cursor.delivered(), 0);
    }

    #[test]
    fn test_full_window_defers_until_drain() {
        let mut fixture = fixture(16, 1);
        let one = attach(&fixture, QoS::AtLeastOnce);
        let other = Cursor::new(
            SubscriberKey::new("client-1", "sensors/+/temp"),
            QoS::AtLeastOnce,
            &fixture.topic,
            &fixture.session,
            Weak::new(),
        );
        fixture.topic.attach_cursor(Arc::clone(&other));
        other.arm(&fixture.topic);

        publish(&fixture, QoS::AtLeastOnce, b"x");
        let frames = drain(&mut fixture.rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(one.delivered() + other.delivered(), 1);

        fixture.session.on_puback(frames[0].packet_id().unwrap());
        let frames = drain(&mut fixture.rx);
        assert_eq!(frames.len(), 1);
        assert_eq!(one.delivered(), 1);
        assert_eq!(other.delivered(), 1);
    }

    #[test]
    fn test_dropped_session_reports_error() {
        let fixture = fixture(16, 4);
        let cursor = attach(&fixture, QoS::AtLeastOnce);
        let topic = Arc::clone(&fixture.topic);
        drop(fixture);

        let result = Arc::clone(&cursor).deliver(&topic);
        assert!(matches!(result, Err(DeliveryError::SessionGone(_))));
        assert!(!cursor.is_enabled());
    }
}
