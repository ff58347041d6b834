//! Shared subscription groups.
//!
//! All sessions subscribed with the same `$share/{group}/{filter}` form one
//! group per matching topic. The group keeps a single read position and
//! hands every message to exactly one member, chosen by the configured
//! [`SharePolicy`].

use crate::config::SharePolicy;
use crate::cursor::read_forward;
use crate::inflight::Continuation;
use crate::log::LogRead;
use crate::message::{Offset, StoredMessage};
use crate::relation::{SubscriberKey, SubscriptionRelation};
use crate::scheduler::{DeliveryError, DeliveryTask};
use crate::session::{Dispatch, Offer, Session};
use crate::topic::Topic;
use beacon_protocol::QoS;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tracing::trace;

/// One session's membership in a shared group.
pub struct SharedMember {
    key: SubscriberKey,
    qos: QoS,
    session: Weak<Session>,
    relation: Weak<SubscriptionRelation>,
    enabled: AtomicBool,
    busy: AtomicBool,
    delivered: AtomicU64,
}

impl SharedMember {
    pub(crate) fn new(
        key: SubscriberKey,
        qos: QoS,
        session: &Arc<Session>,
        relation: Weak<SubscriptionRelation>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            qos,
            session: Arc::downgrade(session),
            relation,
            enabled: AtomicBool::new(true),
            busy: AtomicBool::new(false),
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

    /// Whether the member may still receive messages.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Whether the member holds an unacknowledged message from this group.
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Messages this member received from the group.
    #[must_use]
    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::SeqCst)
    }

    pub(crate) fn relation(&self) -> Weak<SubscriptionRelation> {
        self.relation.clone()
    }

    pub(crate) fn disable(&self) {
        match self.session.upgrade() {
            Some(session) => session.revoke(&self.enabled),
            None => self.enabled.store(false, Ordering::SeqCst),
        }
    }
}

impl fmt::Debug for SharedMember {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedMember")
            .field("key", &self.key)
            .field("enabled", &self.is_enabled())
            .field("busy", &self.is_busy())
            .finish()
    }
}

enum Pump {
    Drained,
    Blocked,
    Empty,
}

/// A shared subscription on one topic.
pub struct SharedGroup {
    name: Arc<str>,
    topic: Weak<Topic>,
    policy: SharePolicy,
    members: RwLock<Vec<Arc<SharedMember>>>,
    next_offset: AtomicU64,
    rotation: AtomicUsize,
    enabled: AtomicBool,
    in_flight: AtomicBool,
    queued: AtomicBool,
    skipped: AtomicU64,
}

impl SharedGroup {
    pub(crate) fn new(name: &str, topic: &Topic, policy: SharePolicy) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            topic: topic.handle(),
            policy,
            members: RwLock::new(Vec::new()),
            next_offset: AtomicU64::new(topic.log().next_offset()),
            rotation: AtomicUsize::new(0),
            enabled: AtomicBool::new(true),
            in_flight: AtomicBool::new(false),
            queued: AtomicBool::new(false),
            skipped: AtomicU64::new(0),
        })
    }

    /// Get the full `$share/{group}/{filter}` name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_arc(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    /// Get the selection policy.
    #[must_use]
    pub fn policy(&self) -> SharePolicy {
        self.policy
    }

    /// Offset of the next message the group will hand out.
    #[must_use]
    pub fn next_offset(&self) -> Offset {
        self.next_offset.load(Ordering::SeqCst)
    }

    /// Messages skipped because they were evicted before delivery.
    #[must_use]
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::SeqCst)
    }

    /// Snapshot of the current members.
    #[must_use]
    pub fn members(&self) -> Vec<Arc<SharedMember>> {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of members.
    #[must_use]
    pub fn len(&self) -> usize {
        self.members
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Whether the group has no members.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn join(&self, member: Arc<SharedMember>) {
        trace!(group = %self.name, member = %member.key(), "Member joined");
        self.members
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(member);
    }

    pub(crate) fn leave(&self, member: &Arc<SharedMember>) -> bool {
        let mut members = self.members.write().unwrap_or_else(PoisonError::into_inner);
        let before = members.len();
        members.retain(|current| !Arc::ptr_eq(current, member));
        before != members.len()
    }

    pub(crate) fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub(crate) fn arm(self: &Arc<Self>, topic: &Topic) {
        if !self.enabled.load(Ordering::SeqCst) {
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
        if !self.enabled.load(Ordering::SeqCst) {
            return;
        }
        if let Some(topic) = self.topic.upgrade() {
            self.arm(&topic);
            topic.notify();
        }
    }

    fn continuation(self: &Arc<Self>) -> Continuation {
        let group = Arc::downgrade(self);
        Box::new(move || {
            if let Some(group) = group.upgrade() {
                group.resume();
            }
        })
    }

    fn member_completion(self: &Arc<Self>, member: &Arc<SharedMember>) -> Continuation {
        let group = Arc::downgrade(self);
        let member = Arc::downgrade(member);
        Box::new(move || {
            if let Some(member) = member.upgrade() {
                member.busy.store(false, Ordering::SeqCst);
            }
            if let Some(group) = group.upgrade() {
                group.resume();
            }
        })
    }

    /// Member indices in the order they should be tried.
    fn candidates(&self, members: &[Arc<SharedMember>]) -> Vec<usize> {
        let count = members.len();
        let start = self.rotation.load(Ordering::SeqCst) % count;
        let mut order: Vec<usize> = (0..count).map(|i| (start + i) % count).collect();
        if self.policy == SharePolicy::LeastInflight {
            order.sort_by_key(|&index| {
                members[index]
                    .session
                    .upgrade()
                    .map_or(usize::MAX, |session| session.inflight_len())
            });
        }
        order
    }

    fn dispatch(
        self: &Arc<Self>,
        members: &[Arc<SharedMember>],
        message: &Arc<StoredMessage>,
    ) -> bool {
        for index in self.candidates(members) {
            let member = &members[index];
            if !member.is_enabled() || member.is_busy() {
                continue;
            }
            let Some(session) = member.session.upgrade() else {
                continue;
            };
            if !session.is_connected() {
                continue;
            }

            let qos = member.qos.min(message.qos);
            let sent = if qos.is_acknowledged() {
                let offer = session.offer(
                    &member.enabled,
                    qos,
                    |packet_id| {
                        member.busy.store(true, Ordering::SeqCst);
                        self.next_offset.store(message.offset + 1, Ordering::SeqCst);
                        message.to_frame(qos, Some(packet_id))
                    },
                    self.member_completion(member),
                    self.continuation(),
                );
                matches!(offer, Offer::Accepted(_))
            } else {
                match session.send(&member.enabled, message.to_frame(qos, None)) {
                    Dispatch::Sent => {
                        self.next_offset.store(message.offset + 1, Ordering::SeqCst);
                        true
                    }
                    Dispatch::Stale | Dispatch::Closed => false,
                }
            };

            if sent {
                member.delivered.fetch_add(1, Ordering::SeqCst);
                self.rotation.store(index + 1, Ordering::SeqCst);
                trace!(
                    group = %self.name,
                    member = %member.key(),
                    offset = message.offset,
                    "Shared delivery"
                );
                return true;
            }
        }
        false
    }

    fn pump(self: &Arc<Self>, topic: &Topic) -> Pump {
        loop {
            let members = self.members();
            if members.is_empty() {
                return Pump::Empty;
            }
            let Some(message) = read_forward(topic, &self.next_offset, &self.skipped, &self.name)
            else {
                return Pump::Drained;
            };
            if !self.dispatch(&members, &message) {
                return Pump::Blocked;
            }
        }
    }
}

impl DeliveryTask for SharedGroup {
    fn deliver(self: Arc<Self>, topic: &Topic) -> Result<(), DeliveryError> {
        self.queued.store(false, Ordering::SeqCst);
        if !self.enabled.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Ok(());
        }

        let outcome = self.pump(topic);
        self.in_flight.store(false, Ordering::SeqCst);

        match outcome {
            Pump::Drained => {
                self.arm(topic);
                if !matches!(topic.log().read(self.next_offset()), LogRead::Pending) {
                    topic.notify();
                }
            }
            // Members resume the group from their completion or drain callbacks.
            Pump::Blocked => {}
            Pump::Empty => {}
        }
        Ok(())
    }
}

impl fmt::Debug for SharedGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedGroup")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("members", &self.len())
            .field("next_offset", &self.next_offset())
            .finish()
    }
}
