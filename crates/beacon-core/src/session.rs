//! Delivery-facing state of a client session.
//!
//! A session owns the outbound frame channel read by the wire layer, the
//! in-flight window for acknowledged deliveries, the inbound QoS 2 staging
//! area and the set of active subscriptions.

use crate::inflight::{AckKind, Acked, Continuation, InflightQueue, Offered};
use crate::metrics;
use crate::relation::SubscriptionRelation;
use beacon_protocol::{Frame, PacketId, QoS};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Outcome of offering an acknowledged delivery to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Sent with this packet id; the slot is held until acknowledged.
    Accepted(PacketId),
    /// The in-flight window is full.
    Rejected,
    /// The delivery was cancelled or the session is closed.
    Stale,
}

/// Outcome of a fire-and-forget send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Handed to the outbound channel.
    Sent,
    /// The delivery was cancelled or the session is closed.
    Stale,
    /// The wire layer dropped the receiving end.
    Closed,
}

/// An inbound QoS 2 publish waiting for PUBREL.
#[derive(Debug, Clone)]
pub struct StagedPublish {
    pub topic: Arc<str>,
    pub qos: QoS,
    pub retain: bool,
    pub payload: Bytes,
}

/// A client session.
pub struct Session {
    client_id: Arc<str>,
    outbound: mpsc::UnboundedSender<Frame>,
    inflight: InflightQueue,
    inbound: DashMap<PacketId, StagedPublish>,
    subscriptions: Mutex<HashMap<String, Arc<SubscriptionRelation>>>,
    closed: AtomicBool,
}

impl Session {
    /// Create a session writing outbound frames to `outbound`.
    #[must_use]
    pub fn new(
        client_id: impl Into<Arc<str>>,
        window: usize,
        outbound: mpsc::UnboundedSender<Frame>,
    ) -> Arc<Self> {
        Arc::new(Self {
            client_id: client_id.into(),
            outbound,
            inflight: InflightQueue::new(window),
            inbound: DashMap::new(),
            subscriptions: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    /// Get the client identifier.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub(crate) fn client_id_arc(&self) -> Arc<str> {
        Arc::clone(&self.client_id)
    }

    /// Whether deliveries can currently reach the client.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.is_closed() && !self.outbound.is_closed()
    }

    /// Whether the session was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of unacknowledged outbound deliveries.
    #[must_use]
    pub fn inflight_len(&self) -> usize {
        self.inflight.len()
    }

    /// Size of the in-flight window.
    #[must_use]
    pub fn window(&self) -> usize {
        self.inflight.window()
    }

    /// Filters this session is subscribed to.
    #[must_use]
    pub fn subscriptions(&self) -> Vec<String> {
        self.lock_subscriptions().keys().cloned().collect()
    }

    /// Get the relation installed for `filter`.
    #[must_use]
    pub fn subscription(&self, filter: &str) -> Option<Arc<SubscriptionRelation>> {
        self.lock_subscriptions().get(filter).cloned()
    }

    pub(crate) fn lock_subscriptions(
        &self,
    ) -> MutexGuard<'_, HashMap<String, Arc<SubscriptionRelation>>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Offer an acknowledged delivery.
    ///
    /// `build` runs inside the in-flight lock once a packet id is reserved.
    pub(crate) fn offer(
        &self,
        live: &AtomicBool,
        qos: QoS,
        build: impl FnOnce(PacketId) -> Frame,
        on_complete: Continuation,
        on_drain: Continuation,
    ) -> Offer {
        match self.inflight.offer(live, qos, build, on_complete, on_drain) {
            Offered::Accepted(packet_id, frame) => {
                trace!(client = %self.client_id, packet_id, "Sending publish");
                if self.outbound.send(frame).is_err() {
                    debug!(client = %self.client_id, "Outbound channel closed");
                } else {
                    metrics::record_delivery(qos.into());
                }
                Offer::Accepted(packet_id)
            }
            Offered::Rejected => {
                trace!(client = %self.client_id, "In-flight window full");
                metrics::record_backpressure();
                Offer::Rejected
            }
            Offered::Stale => Offer::Stale,
        }
    }

    /// Send a QoS 0 delivery if `live` still holds.
    pub(crate) fn send(&self, live: &AtomicBool, frame: Frame) -> Dispatch {
        if !self.inflight.admits(live) {
            return Dispatch::Stale;
        }
        match self.outbound.send(frame) {
            Ok(()) => {
                metrics::record_delivery(0);
                Dispatch::Sent
            }
            Err(_) => Dispatch::Closed,
        }
    }

    /// Write a control frame (acknowledgments and responses).
    ///
    /// Returns `false` if the outbound channel is closed.
    pub fn write(&self, frame: Frame) -> bool {
        self.outbound.send(frame).is_ok()
    }

    /// Clear a cursor or member flag so no later offer can pass it.
    pub(crate) fn revoke(&self, flag: &AtomicBool) {
        self.inflight.revoke(flag);
    }

    /// Handle PUBACK. Returns `true` if it released an in-flight delivery.
    pub fn on_puback(&self, packet_id: PacketId) -> bool {
        self.acknowledge(packet_id, AckKind::PubAck)
    }

    /// Handle PUBREC, answering with PUBREL.
    pub fn on_pubrec(&self, packet_id: PacketId) -> bool {
        self.acknowledge(packet_id, AckKind::PubRec)
    }

    /// Handle PUBCOMP. Returns `true` if it released an in-flight delivery.
    pub fn on_pubcomp(&self, packet_id: PacketId) -> bool {
        self.acknowledge(packet_id, AckKind::PubComp)
    }

    fn acknowledge(&self, packet_id: PacketId, kind: AckKind) -> bool {
        match self.inflight.acknowledge(packet_id, kind) {
            Acked::Released {
                completion,
                waiters,
            } => {
                trace!(client = %self.client_id, packet_id, ?kind, "Delivery acknowledged");
                if let Some(completion) = completion {
                    completion();
                }
                for waiter in waiters {
                    waiter();
                }
                true
            }
            Acked::Release => {
                self.write(Frame::pubrel(packet_id));
                true
            }
            Acked::Unknown => {
                debug!(client = %self.client_id, packet_id, ?kind, "Unexpected acknowledgment");
                false
            }
        }
    }

    /// Stage an inbound QoS 2 publish.
    ///
    /// Returns `false` if the packet id is already staged (a duplicate).
    pub(crate) fn stage_inbound(&self, packet_id: PacketId, publish: StagedPublish) -> bool {
        match self.inbound.entry(packet_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(publish);
                true
            }
        }
    }

    /// Take the staged publish released by PUBREL.
    pub(crate) fn release_inbound(&self, packet_id: PacketId) -> Option<StagedPublish> {
        self.inbound.remove(&packet_id).map(|(_, publish)| publish)
    }

    /// Number of inbound QoS 2 publishes awaiting PUBREL.
    #[must_use]
    pub fn staged_len(&self) -> usize {
        self.inbound.len()
    }

    /// Mark the session closed and drop its in-flight state.
    ///
    /// Returns `false` if it was already closed.
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let dropped = self.inflight.close();
        self.inbound.clear();
        debug!(client = %self.client_id, dropped, "Session closed");
        true
    }

    pub(crate) fn take_subscriptions(&self) -> Vec<Arc<SubscriptionRelation>> {
        self.lock_subscriptions()
            .drain()
            .map(|(_, relation)| relation)
            .collect()
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("client_id", &self.client_id)
            .field("inflight", &self.inflight)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(window: usize) -> (Arc<Session>, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Session::new("client-1", window, tx), rx)
    }

    fn noop() -> Continuation {
        Box::new(|| {})
    }

    #[test]
    fn test_offer_sends_frame() {
        let (session, mut rx) = session(4);
        let live = AtomicBool::new(true);

        let offer = session.offer(
            &live,
            QoS::AtLeastOnce,
            |id| Frame::publish_with_id(id, "a/b", QoS::AtLeastOnce, b"x".to_vec()),
            noop(),
            noop(),
        );

        assert_eq!(offer, Offer::Accepted(1));
        assert_eq!(rx.try_recv().unwrap().packet_id(), Some(1));
        assert_eq!(session.inflight_len(), 1);
        assert!(session.on_puback(1));
        assert_eq!(session.inflight_len(), 0);
        assert!(!session.on_puback(1));
    }

    #[test]
    fn test_pubrec_answers_pubrel() {
        let (session, mut rx) = session(4);
        let live = AtomicBool::new(true);
        session.offer(
            &live,
            QoS::ExactlyOnce,
            |id| Frame::publish_with_id(id, "a", QoS::ExactlyOnce, b"x".to_vec()),
            noop(),
            noop(),
        );
        let _ = rx.try_recv();

        assert!(session.on_pubrec(1));
        assert_eq!(rx.try_recv().unwrap(), Frame::pubrel(1));
        assert!(session.on_pubcomp(1));
        assert_eq!(session.inflight_len(), 0);
    }

    #[test]
    fn test_send_respects_revoked_flag() {
        let (session, mut rx) = session(4);
        let live = AtomicBool::new(true);

        let frame = Frame::publish("a", QoS::AtMostOnce, b"x".to_vec());
        assert_eq!(session.send(&live, frame.clone()), Dispatch::Sent);
        session.revoke(&live);
        assert_eq!(session.send(&live, frame), Dispatch::Stale);

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_send_reports_dropped_receiver() {
        let (session, rx) = session(4);
        drop(rx);
        let live = AtomicBool::new(true);

        assert!(!session.is_connected());
        assert_eq!(
            session.send(&live, Frame::publish("a", QoS::AtMostOnce, Bytes::new())),
            Dispatch::Closed
        );
    }

    #[test]
    fn test_inbound_staging_deduplicates() {
        let (session, _rx) = session(4);
        let staged = StagedPublish {
            topic: "a".into(),
            qos: QoS::ExactlyOnce,
            retain: false,
            payload: Bytes::from_static(b"x"),
        };

        assert!(session.stage_inbound(5, staged.clone()));
        assert!(!session.stage_inbound(5, staged));
        assert_eq!(session.staged_len(), 1);
        assert!(session.release_inbound(5).is_some());
        assert!(session.release_inbound(5).is_none());
    }

    #[test]
    fn test_close_is_idempotent() {
        let (session, _rx) = session(4);
        assert!(session.close());
        assert!(!session.close());
        assert!(session.is_closed());
        assert!(!session.is_connected());
    }
}
