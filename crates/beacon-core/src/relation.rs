//! Bindings between a session's subscription and the topics it matches.
//!
//! An exact filter binds at most one topic; a wildcard filter binds every
//! matching topic, growing as topics are created and shrinking as they are
//! removed. Each binding is either a private cursor on the topic or a
//! membership in one of the topic's shared groups.

use crate::cursor::Cursor;
use crate::group::SharedMember;
use crate::session::Session;
use crate::token::TopicToken;
use crate::topic::Topic;
use beacon_protocol::QoS;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use thiserror::Error;
use tracing::debug;

/// Identifies one subscription: a client and the filter it subscribed with.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriberKey {
    client_id: Arc<str>,
    filter: Arc<str>,
}

impl SubscriberKey {
    /// Create a key.
    #[must_use]
    pub fn new(client_id: impl Into<Arc<str>>, filter: impl Into<Arc<str>>) -> Self {
        Self {
            client_id: client_id.into(),
            filter: filter.into(),
        }
    }

    /// Get the client identifier.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Get the filter as subscribed.
    #[must_use]
    pub fn filter(&self) -> &str {
        &self.filter
    }
}

impl fmt::Display for SubscriberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.client_id, self.filter)
    }
}

/// Relation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelationError {
    /// The relation already has a binding for this topic.
    #[error("Subscription {filter} is already bound to topic {topic}")]
    AlreadyBound { filter: String, topic: String },

    /// An exact subscription was asked to drop a topic it is not bound to.
    #[error("Subscription {filter} is bound to {bound:?}, not {topic}")]
    TopicMismatch {
        filter: String,
        bound: Option<String>,
        topic: String,
    },

    /// A wildcard subscription has no binding for this topic.
    #[error("Subscription {filter} is not bound to topic {topic}")]
    NotBound { filter: String, topic: String },
}

/// How a subscription receives messages from one topic.
#[derive(Debug, Clone)]
pub enum Binding {
    /// A private cursor in the topic's default group.
    Cursor(Arc<Cursor>),
    /// Membership in a shared group of the topic.
    Shared {
        group: Arc<str>,
        member: Arc<SharedMember>,
    },
}

impl Binding {
    /// Install the binding on its topic and schedule a first delivery.
    pub(crate) fn install(&self, topic: &Topic) {
        match self {
            Binding::Cursor(cursor) => {
                topic.attach_cursor(Arc::clone(cursor));
                cursor.arm(topic);
                topic.notify();
            }
            Binding::Shared { group, member } => {
                topic.join_shared(group, Arc::clone(member));
            }
        }
    }

    /// Disable the binding and remove it from its topic. Idempotent.
    pub(crate) fn detach(&self, topic: &Topic) {
        match self {
            Binding::Cursor(cursor) => {
                cursor.disable();
                topic.detach_cursor(cursor);
            }
            Binding::Shared { group, member } => {
                member.disable();
                topic.leave_shared(group, member);
            }
        }
    }

    /// Get the cursor, for private bindings.
    #[must_use]
    pub fn cursor(&self) -> Option<&Arc<Cursor>> {
        match self {
            Binding::Cursor(cursor) => Some(cursor),
            Binding::Shared { .. } => None,
        }
    }
}

type Bound = (Arc<Topic>, Binding);

enum Bindings {
    Specific(Mutex<Option<Bound>>),
    Wildcard(DashMap<Arc<str>, Bound>),
}

/// One session's subscription to one filter.
pub struct SubscriptionRelation {
    key: SubscriberKey,
    token: TopicToken,
    qos: QoS,
    session: Weak<Session>,
    active: AtomicBool,
    bindings: Bindings,
}

impl SubscriptionRelation {
    /// Create a relation for `session`.
    ///
    /// Wildcard filters get the multi-topic variant.
    #[must_use]
    pub fn new(session: &Arc<Session>, token: TopicToken, qos: QoS) -> Arc<Self> {
        let bindings = if token.is_wildcard() {
            Bindings::Wildcard(DashMap::new())
        } else {
            Bindings::Specific(Mutex::new(None))
        };
        Arc::new(Self {
            key: SubscriberKey::new(session.client_id_arc(), token.as_str()),
            token,
            qos,
            session: Arc::downgrade(session),
            active: AtomicBool::new(true),
            bindings,
        })
    }

    /// Get the subscription key.
    #[must_use]
    pub fn key(&self) -> &SubscriberKey {
        &self.key
    }

    /// Get the parsed filter.
    #[must_use]
    pub fn token(&self) -> &TopicToken {
        &self.token
    }

    /// Get the granted QoS.
    #[must_use]
    pub fn qos(&self) -> QoS {
        self.qos
    }

    /// Get the owning session, if it still exists.
    #[must_use]
    pub fn session(&self) -> Option<Arc<Session>> {
        self.session.upgrade()
    }

    /// Whether this relation may bind to several topics.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        matches!(self.bindings, Bindings::Wildcard(_))
    }

    /// Whether the relation is still installed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Record a binding for `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`RelationError::AlreadyBound`] if the relation already holds
    /// a binding for this topic, or (for an exact filter) for any topic.
    pub fn register(&self, topic: &Arc<Topic>, binding: Binding) -> Result<(), RelationError> {
        let already_bound = || RelationError::AlreadyBound {
            filter: self.token.to_string(),
            topic: topic.name().to_string(),
        };

        match &self.bindings {
            Bindings::Specific(slot) => {
                let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
                if slot.is_some() {
                    return Err(already_bound());
                }
                *slot = Some((Arc::clone(topic), binding));
            }
            Bindings::Wildcard(map) => match map.entry(topic.name_arc()) {
                Entry::Occupied(_) => return Err(already_bound()),
                Entry::Vacant(entry) => {
                    entry.insert((Arc::clone(topic), binding));
                }
            },
        }
        Ok(())
    }

    /// Remove and return the binding for `topic`.
    ///
    /// # Errors
    ///
    /// Returns [`RelationError::TopicMismatch`] if an exact relation is bound
    /// elsewhere (or nowhere), and [`RelationError::NotBound`] if a wildcard
    /// relation has no binding for the topic.
    pub fn deregister(&self, topic: &Topic) -> Result<Binding, RelationError> {
        match &self.bindings {
            Bindings::Specific(slot) => {
                let mut slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
                let bound = slot.as_ref().map(|(bound, _)| bound.name().to_string());
                if bound.as_deref() != Some(topic.name()) {
                    return Err(RelationError::TopicMismatch {
                        filter: self.token.to_string(),
                        bound,
                        topic: topic.name().to_string(),
                    });
                }
                slot.take()
                    .map(|(_, binding)| binding)
                    .ok_or_else(|| RelationError::NotBound {
                        filter: self.token.to_string(),
                        topic: topic.name().to_string(),
                    })
            }
            Bindings::Wildcard(map) => map
                .remove(topic.name())
                .map(|(_, (_, binding))| binding)
                .ok_or_else(|| RelationError::NotBound {
                    filter: self.token.to_string(),
                    topic: topic.name().to_string(),
                }),
        }
    }

    /// Visit every current binding.
    ///
    /// `f` must not register or deregister on this relation.
    pub fn for_each(&self, mut f: impl FnMut(&Arc<Topic>, &Binding)) {
        match &self.bindings {
            Bindings::Specific(slot) => {
                let slot = slot.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some((topic, binding)) = slot.as_ref() {
                    f(topic, binding);
                }
            }
            Bindings::Wildcard(map) => {
                for entry in map {
                    let (topic, binding) = entry.value();
                    f(topic, binding);
                }
            }
        }
    }

    /// Number of topics currently bound.
    #[must_use]
    pub fn binding_count(&self) -> usize {
        match &self.bindings {
            Bindings::Specific(slot) => {
                usize::from(slot.lock().unwrap_or_else(PoisonError::into_inner).is_some())
            }
            Bindings::Wildcard(map) => map.len(),
        }
    }

    /// Get the private cursor bound on `topic`, if any.
    #[must_use]
    pub fn cursor(&self, topic: &str) -> Option<Arc<Cursor>> {
        let mut found = None;
        self.for_each(|bound, binding| {
            if bound.name() == topic {
                found = binding.cursor().cloned();
            }
        });
        found
    }

    /// Deactivate the relation and detach every binding.
    pub(crate) fn close(&self) {
        self.active.store(false, Ordering::SeqCst);

        let drained: Vec<Bound> = match &self.bindings {
            Bindings::Specific(slot) => slot
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
                .into_iter()
                .collect(),
            Bindings::Wildcard(map) => {
                let names: Vec<Arc<str>> = map.iter().map(|entry| Arc::clone(entry.key())).collect();
                names
                    .iter()
                    .filter_map(|name| map.remove(name).map(|(_, bound)| bound))
                    .collect()
            }
        };

        for (topic, binding) in &drained {
            binding.detach(topic);
        }
        debug!(subscription = %self.key, topics = drained.len(), "Subscription closed");
    }
}

impl fmt::Debug for SubscriptionRelation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRelation")
            .field("key", &self.key)
            .field("qos", &self.qos)
            .field("active", &self.is_active())
            .field("bindings", &self.binding_count())
            .finish()
    }
}
