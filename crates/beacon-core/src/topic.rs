//! Topics: a message log plus the subscribers reading from it.
//!
//! A topic owns its log, its retained message, a default group of private
//! cursors and any number of shared groups. Publishing appends to the log
//! and notifies the topic's push scheduler; the scheduler's pass runs every
//! delivery task that registered interest.

use crate::config::SharePolicy;
use crate::cursor::Cursor;
use crate::group::{SharedGroup, SharedMember};
use crate::log::MessageLog;
use crate::message::StoredMessage;
use crate::relation::{Binding, SubscriberKey, SubscriptionRelation};
use crate::scheduler::{DeliveryTask, Executor, PushScheduler};
use beacon_protocol::QoS;
use bytes::Bytes;
use dashmap::DashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tracing::{debug, trace};

/// A concrete topic.
pub struct Topic {
    name: Arc<str>,
    log: Box<dyn MessageLog>,
    retained: RwLock<Option<Arc<StoredMessage>>>,
    subscribers: DashMap<SubscriberKey, Arc<Cursor>>,
    shared: DashMap<Arc<str>, Arc<SharedGroup>>,
    policy: SharePolicy,
    scheduler: PushScheduler,
    this: Weak<Topic>,
}

impl Topic {
    /// Create a topic with the default shared-subscription policy.
    #[must_use]
    pub fn new(name: &str, log: Box<dyn MessageLog>, executor: Arc<dyn Executor>) -> Arc<Self> {
        Self::with_policy(name, log, executor, SharePolicy::default())
    }

    /// Create a topic whose shared groups use `policy`.
    #[must_use]
    pub fn with_policy(
        name: &str,
        log: Box<dyn MessageLog>,
        executor: Arc<dyn Executor>,
        policy: SharePolicy,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            name: name.into(),
            log,
            retained: RwLock::new(None),
            subscribers: DashMap::new(),
            shared: DashMap::new(),
            policy,
            scheduler: PushScheduler::new(executor),
            this: this.clone(),
        })
    }

    /// Get the topic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_arc(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    /// Get the topic's log.
    #[must_use]
    pub fn log(&self) -> &dyn MessageLog {
        &*self.log
    }

    /// Append a message and wake the subscribers.
    ///
    /// A retained publish replaces the retained message; a retained publish
    /// with an empty payload clears it.
    pub fn publish(&self, qos: QoS, retain: bool, payload: Bytes) -> Arc<StoredMessage> {
        let message = self.log.append(&self.name, qos, retain, payload);
        if retain {
            self.retain(&message);
        }
        trace!(topic = %self.name, offset = message.offset, "Appended message");
        self.notify();
        message
    }

    fn retain(&self, message: &Arc<StoredMessage>) {
        let mut retained = self.retained.write().unwrap_or_else(PoisonError::into_inner);
        if retained
            .as_ref()
            .is_some_and(|current| current.offset > message.offset)
        {
            return;
        }
        *retained = if message.payload.is_empty() {
            None
        } else {
            Some(Arc::clone(message))
        };
    }

    /// Get the retained message, if any.
    #[must_use]
    pub fn retained(&self) -> Option<Arc<StoredMessage>> {
        self.retained
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Discard the log contents and the retained message.
    pub fn clear(&self) {
        self.log.clear();
        *self.retained.write().unwrap_or_else(PoisonError::into_inner) = None;
        debug!(topic = %self.name, "Topic cleared");
    }

    /// Wake the scheduler.
    ///
    /// Starts a pass unless one is already queued or running, in which case
    /// that pass will go around again.
    pub fn notify(&self) {
        if !self.scheduler.acquire() {
            return;
        }
        let topic = self.this.clone();
        self.scheduler.submit(Box::new(move || {
            if let Some(topic) = topic.upgrade() {
                topic.run_pass();
            }
        }));
    }

    fn run_pass(&self) {
        if self.scheduler.drain(self) {
            self.notify();
        }
    }

    pub(crate) fn register(&self, task: Arc<dyn DeliveryTask>) {
        self.scheduler.register(task);
    }

    /// Whether a pass is queued or running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.scheduler.is_running()
    }

    /// Whether the topic still accepts passes.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.scheduler.is_enabled()
    }

    /// Number of delivery tasks waiting for the next pass.
    #[must_use]
    pub fn pending_tasks(&self) -> usize {
        self.scheduler.pending()
    }

    pub(crate) fn disable(&self) {
        self.scheduler.disable();
    }

    /// Number of private subscribers plus shared-group members.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len() + self.shared.iter().map(|group| group.len()).sum::<usize>()
    }

    /// Number of shared groups.
    #[must_use]
    pub fn shared_group_count(&self) -> usize {
        self.shared.len()
    }

    /// Get a subscriber's private cursor.
    #[must_use]
    pub fn cursor(&self, key: &SubscriberKey) -> Option<Arc<Cursor>> {
        self.subscribers.get(key).map(|cursor| Arc::clone(cursor.value()))
    }

    /// Get a shared group by its full `$share/...` filter.
    #[must_use]
    pub fn shared_group(&self, name: &str) -> Option<Arc<SharedGroup>> {
        self.shared.get(name).map(|group| Arc::clone(group.value()))
    }

    pub(crate) fn attach_cursor(&self, cursor: Arc<Cursor>) {
        if let Some(previous) = self.subscribers.insert(cursor.key().clone(), cursor) {
            previous.disable();
        }
    }

    pub(crate) fn detach_cursor(&self, cursor: &Arc<Cursor>) -> bool {
        self.subscribers
            .remove_if(cursor.key(), |_, current| Arc::ptr_eq(current, cursor))
            .is_some()
    }

    /// Add `member` to the named shared group, creating the group if needed.
    pub(crate) fn join_shared(&self, name: &str, member: Arc<SharedMember>) {
        let group = {
            let entry = self.shared.entry(Arc::from(name)).or_insert_with(|| {
                debug!(topic = %self.name, group = %name, "Creating shared group");
                SharedGroup::new(name, self, self.policy)
            });
            entry.join(member);
            Arc::clone(entry.value())
        };
        group.arm(self);
        self.notify();
    }

    /// Remove `member` from the named group, dropping the group once empty.
    pub(crate) fn leave_shared(&self, name: &str, member: &Arc<SharedMember>) {
        let empty = match self.shared.get(name) {
            Some(group) => {
                group.leave(member);
                group.is_empty()
            }
            None => return,
        };
        if !empty {
            return;
        }
        if let Some((_, group)) = self.shared.remove_if(name, |_, group| group.is_empty()) {
            group.disable();
            debug!(topic = %self.name, group = %name, "Removed empty shared group");
        }
    }

    /// Every binding on this topic with the relation that owns it.
    pub(crate) fn bindings(&self) -> Vec<(Weak<SubscriptionRelation>, Binding)> {
        let mut bindings: Vec<_> = self
            .subscribers
            .iter()
            .map(|cursor| (cursor.relation(), Binding::Cursor(Arc::clone(cursor.value()))))
            .collect();
        for group in &self.shared {
            for member in group.members() {
                bindings.push((
                    member.relation(),
                    Binding::Shared {
                        group: group.name_arc(),
                        member,
                    },
                ));
            }
        }
        bindings
    }

    pub(crate) fn handle(&self) -> Weak<Topic> {
        self.this.clone()
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("log_len", &self.log.len())
            .field("subscribers", &self.subscribers.len())
            .field("shared_groups", &self.shared.len())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}
