//! The broker: registry of topics, sessions and wildcard subscriptions.
//!
//! The broker is the entry point for the wire layer. It turns decoded
//! frames into subscriptions and publishes, creates topics on demand and
//! binds every matching subscription to a topic when it appears.

use crate::config::BrokerConfig;
use crate::cursor::Cursor;
use crate::group::SharedMember;
use crate::log::{memory_log_factory, LogFactory};
use crate::message::Offset;
use crate::metrics;
use crate::relation::{Binding, SubscriberKey, SubscriptionRelation};
use crate::scheduler::Executor;
use crate::session::{Session, StagedPublish};
use crate::token::{TopicError, TopicToken};
use crate::topic::Topic;
use beacon_protocol::{Frame, FrameType, PacketId, QoS, SubAckCode};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Broker errors.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Malformed subscription filter.
    #[error("{0}")]
    InvalidTopicFilter(#[source] TopicError),

    /// Malformed publish topic.
    #[error("{0}")]
    InvalidTopicName(#[source] TopicError),

    /// Unsubscribe for a filter the session does not hold.
    #[error("Not subscribed to filter: {0}")]
    NotSubscribed(String),

    /// The session was closed.
    #[error("Session closed: {0}")]
    SessionClosed(String),

    /// Maximum topics reached.
    #[error("Maximum topics reached")]
    MaxTopicsReached,

    /// A QoS 1 or QoS 2 publish arrived without a packet id.
    #[error("Publish to {0} is missing its packet id")]
    MissingPacketId(String),

    /// A frame only the broker sends arrived from a client.
    #[error("Unexpected frame from client: {0:?}")]
    UnexpectedFrame(FrameType),
}

/// The broker.
pub struct Broker {
    config: BrokerConfig,
    executor: Arc<dyn Executor>,
    log_factory: LogFactory,
    topics: DashMap<Arc<str>, Arc<Topic>>,
    sessions: DashMap<Arc<str>, Arc<Session>>,
    wildcards: DashMap<SubscriberKey, Arc<SubscriptionRelation>>,
    /// Exact relations by topic name, rebound when a removed topic returns.
    exact: DashMap<Arc<str>, Vec<Arc<SubscriptionRelation>>>,
}

impl Broker {
    /// Create a broker whose topic passes run on `executor`.
    #[must_use]
    pub fn new(config: BrokerConfig, executor: Arc<dyn Executor>) -> Self {
        let log_factory = memory_log_factory(config.topics.log_capacity);
        Self::with_log_factory(config, executor, log_factory)
    }

    /// Create a broker with a custom log backend.
    #[must_use]
    pub fn with_log_factory(
        config: BrokerConfig,
        executor: Arc<dyn Executor>,
        log_factory: LogFactory,
    ) -> Self {
        info!("Creating broker with config: {:?}", config);
        Self {
            config,
            executor,
            log_factory,
            topics: DashMap::new(),
            sessions: DashMap::new(),
            wildcards: DashMap::new(),
            exact: DashMap::new(),
        }
    }

    /// Get the configuration.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Open a session for `client_id`, taking over any existing one.
    ///
    /// `receive_maximum` is the client's announced in-flight window.
    pub fn open_session(
        &self,
        client_id: &str,
        receive_maximum: Option<u16>,
        outbound: mpsc::UnboundedSender<Frame>,
    ) -> Arc<Session> {
        let window = self.config.window_for(receive_maximum);
        let session = Session::new(client_id, window, outbound);
        let previous = self
            .sessions
            .insert(session.client_id_arc(), Arc::clone(&session));

        if let Some(previous) = previous {
            info!(client = %client_id, "Session taken over");
            self.close_session(&previous);
        }

        metrics::set_sessions(self.sessions.len());
        debug!(client = %client_id, window, "Session opened");
        session
    }

    /// Look up a live session.
    #[must_use]
    pub fn session(&self, client_id: &str) -> Option<Arc<Session>> {
        self.sessions
            .get(client_id)
            .map(|session| Arc::clone(session.value()))
    }

    /// Close a session and remove every subscription it holds.
    pub fn close_session(&self, session: &Arc<Session>) {
        if !session.close() {
            return;
        }
        for relation in session.take_subscriptions() {
            self.teardown(&relation);
        }
        self.sessions
            .remove_if(session.client_id(), |_, current| Arc::ptr_eq(current, session));
        metrics::set_sessions(self.sessions.len());
        debug!(client = %session.client_id(), "Session removed");
    }

    /// Subscribe `session` to `filter`.
    ///
    /// Resubscribing to a filter first removes the old subscription.
    /// Returns the granted QoS.
    ///
    /// # Errors
    ///
    /// Returns an error if the filter is malformed, the session is closed,
    /// or the topic limit is reached. No state changes on error.
    pub fn subscribe(
        &self,
        session: &Arc<Session>,
        filter: &str,
        qos: QoS,
    ) -> Result<QoS, BrokerError> {
        let token = TopicToken::parse_filter(filter).map_err(BrokerError::InvalidTopicFilter)?;
        if session.is_closed() {
            return Err(BrokerError::SessionClosed(session.client_id().to_string()));
        }
        let qos = qos.min(self.config.limits.max_qos);

        let exact = if token.is_wildcard() {
            None
        } else {
            Some(self.topic_or_create(token.filter())?)
        };

        let mut subscriptions = session.lock_subscriptions();
        if session.is_closed() {
            return Err(BrokerError::SessionClosed(session.client_id().to_string()));
        }
        if let Some(previous) = subscriptions.remove(filter) {
            debug!(client = %session.client_id(), filter = %filter, "Replacing subscription");
            self.teardown(&previous);
        }

        let shared = token.is_shared();
        let relation = SubscriptionRelation::new(session, token, qos);
        subscriptions.insert(filter.to_string(), Arc::clone(&relation));

        match exact {
            Some(topic) => {
                self.exact
                    .entry(Arc::from(relation.token().filter()))
                    .or_default()
                    .push(Arc::clone(&relation));
                // The topic may have been removed since the lookup.
                let topic = self.topic(topic.name()).unwrap_or(topic);
                self.bind(&relation, &topic);
            }
            None => {
                self.wildcards
                    .insert(relation.key().clone(), Arc::clone(&relation));
                let matching: Vec<Arc<Topic>> = self
                    .topics
                    .iter()
                    .filter(|topic| relation.token().matches(topic.name()))
                    .map(|topic| Arc::clone(topic.value()))
                    .collect();
                for topic in &matching {
                    self.bind(&relation, topic);
                }
            }
        }
        drop(subscriptions);

        metrics::record_subscription(shared);
        debug!(
            client = %session.client_id(),
            filter = %filter,
            ?qos,
            topics = relation.binding_count(),
            "Subscribed"
        );
        Ok(qos)
    }

    /// Remove the subscription `session` holds for `filter`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::NotSubscribed`] if there is none.
    pub fn unsubscribe(&self, session: &Arc<Session>, filter: &str) -> Result<(), BrokerError> {
        let relation = session
            .lock_subscriptions()
            .remove(filter)
            .ok_or_else(|| BrokerError::NotSubscribed(filter.to_string()))?;
        self.teardown(&relation);
        debug!(client = %session.client_id(), filter = %filter, "Unsubscribed");
        Ok(())
    }

    /// Publish to `topic`, creating it if needed.
    ///
    /// Returns the offset assigned to the message.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic name is malformed or the topic limit is
    /// reached.
    pub fn publish(
        &self,
        topic: &str,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes>,
    ) -> Result<Offset, BrokerError> {
        TopicToken::parse_name(topic).map_err(BrokerError::InvalidTopicName)?;
        let topic = self.topic_or_create(topic)?;
        let payload = payload.into();
        let bytes = payload.len();
        let message = topic.publish(qos, retain, payload);

        metrics::record_publish(bytes);
        trace!(topic = %topic.name(), offset = message.offset, bytes, "Published");
        Ok(message.offset)
    }

    /// Handle a frame decoded from `session`'s connection.
    ///
    /// Responses are written to the session's outbound channel.
    ///
    /// # Errors
    ///
    /// Returns an error for malformed publishes and frames a client must
    /// not send. Subscribe failures are reported in the SUBACK instead.
    pub fn handle_frame(&self, session: &Arc<Session>, frame: Frame) -> Result<(), BrokerError> {
        match frame {
            Frame::Publish {
                packet_id,
                topic,
                qos,
                retain,
                payload,
                ..
            } => self.handle_publish(session, packet_id, topic, qos, retain, payload),
            Frame::PubAck { packet_id } => {
                session.on_puback(packet_id);
                Ok(())
            }
            Frame::PubRec { packet_id } => {
                session.on_pubrec(packet_id);
                Ok(())
            }
            Frame::PubComp { packet_id } => {
                session.on_pubcomp(packet_id);
                Ok(())
            }
            Frame::PubRel { packet_id } => {
                let result = match session.release_inbound(packet_id) {
                    Some(staged) => self
                        .publish(&staged.topic, staged.qos, staged.retain, staged.payload)
                        .map(|_| ()),
                    None => {
                        debug!(client = %session.client_id(), packet_id, "PUBREL for unknown packet id");
                        Ok(())
                    }
                };
                session.write(Frame::pubcomp(packet_id));
                result
            }
            Frame::Subscribe { packet_id, filters } => {
                let codes = filters
                    .iter()
                    .map(|(filter, qos)| match self.subscribe(session, filter, *qos) {
                        Ok(granted) => SubAckCode::Granted(granted),
                        Err(e) => {
                            warn!(client = %session.client_id(), filter = %filter, error = %e, "Subscribe refused");
                            SubAckCode::Failure
                        }
                    })
                    .collect();
                session.write(Frame::suback(packet_id, codes));
                Ok(())
            }
            Frame::Unsubscribe { packet_id, filters } => {
                for filter in &filters {
                    if let Err(e) = self.unsubscribe(session, filter) {
                        debug!(client = %session.client_id(), error = %e, "Unsubscribe ignored");
                    }
                }
                session.write(Frame::unsuback(packet_id));
                Ok(())
            }
            other @ (Frame::SubAck { .. } | Frame::UnsubAck { .. }) => {
                Err(BrokerError::UnexpectedFrame(other.frame_type()))
            }
        }
    }

    fn handle_publish(
        &self,
        session: &Arc<Session>,
        packet_id: Option<PacketId>,
        topic: Arc<str>,
        qos: QoS,
        retain: bool,
        payload: Bytes,
    ) -> Result<(), BrokerError> {
        match qos {
            QoS::AtMostOnce => self.publish(&topic, qos, retain, payload).map(|_| ()),
            QoS::AtLeastOnce => {
                let packet_id =
                    packet_id.ok_or_else(|| BrokerError::MissingPacketId(topic.to_string()))?;
                self.publish(&topic, qos, retain, payload)?;
                session.write(Frame::puback(packet_id));
                Ok(())
            }
            QoS::ExactlyOnce => {
                let packet_id =
                    packet_id.ok_or_else(|| BrokerError::MissingPacketId(topic.to_string()))?;
                TopicToken::parse_name(&topic).map_err(BrokerError::InvalidTopicName)?;
                let staged = StagedPublish {
                    topic,
                    qos,
                    retain,
                    payload,
                };
                if !session.stage_inbound(packet_id, staged) {
                    debug!(client = %session.client_id(), packet_id, "Duplicate QoS 2 publish");
                }
                session.write(Frame::pubrec(packet_id));
                Ok(())
            }
        }
    }

    /// Remove a topic, detaching every subscription bound to it.
    ///
    /// Subscriptions stay installed on their sessions. Matching ones bind
    /// again if the topic is recreated.
    ///
    /// Returns `false` if the topic does not exist.
    pub fn remove_topic(&self, name: &str) -> bool {
        let Some((_, topic)) = self.topics.remove(name) else {
            return false;
        };

        topic.disable();
        let bindings = topic.bindings();
        let detached = bindings.len();
        for (relation, binding) in bindings {
            if let Some(relation) = relation.upgrade() {
                let _ = relation.deregister(&topic);
            }
            binding.detach(&topic);
        }

        metrics::set_topics(self.topics.len());
        debug!(topic = %name, detached, "Topic removed");
        true
    }

    /// Get a topic.
    #[must_use]
    pub fn topic(&self, name: &str) -> Option<Arc<Topic>> {
        self.topics.get(name).map(|topic| Arc::clone(topic.value()))
    }

    /// Whether a topic exists.
    #[must_use]
    pub fn topic_exists(&self, name: &str) -> bool {
        self.topics.contains_key(name)
    }

    /// Get all topic names.
    #[must_use]
    pub fn topic_names(&self) -> Vec<String> {
        self.topics.iter().map(|topic| topic.key().to_string()).collect()
    }

    /// Get broker statistics.
    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            topic_count: self.topics.len(),
            session_count: self.sessions.len(),
            wildcard_subscriptions: self.wildcards.len(),
            total_subscribers: self
                .topics
                .iter()
                .map(|topic| topic.subscriber_count())
                .sum(),
        }
    }

    /// Get statistics for one topic.
    #[must_use]
    pub fn topic_stats(&self, name: &str) -> Option<TopicStats> {
        self.topics.get(name).map(|topic| TopicStats {
            name: topic.name().to_string(),
            subscriber_count: topic.subscriber_count(),
            shared_groups: topic.shared_group_count(),
            log_len: topic.log().len(),
            next_offset: topic.log().next_offset(),
            retained: topic.retained().is_some(),
        })
    }

    fn topic_or_create(&self, name: &str) -> Result<Arc<Topic>, BrokerError> {
        if let Some(topic) = self.topics.get(name) {
            return Ok(Arc::clone(topic.value()));
        }
        if self.topics.len() >= self.config.limits.max_topics {
            return Err(BrokerError::MaxTopicsReached);
        }

        let topic = match self.topics.entry(Arc::from(name)) {
            Entry::Occupied(entry) => return Ok(Arc::clone(entry.get())),
            Entry::Vacant(entry) => {
                let topic = Topic::with_policy(
                    name,
                    (self.log_factory)(name),
                    Arc::clone(&self.executor),
                    self.config.shared.policy,
                );
                entry.insert(Arc::clone(&topic));
                topic
            }
        };

        debug!(topic = %name, "Creating new topic");
        metrics::set_topics(self.topics.len());

        let mut matching: Vec<Arc<SubscriptionRelation>> = self
            .wildcards
            .iter()
            .filter(|relation| relation.token().matches(name))
            .map(|relation| Arc::clone(relation.value()))
            .collect();
        if let Some(exact) = self.exact.get(name) {
            matching.extend(exact.iter().cloned());
        }
        for relation in &matching {
            self.bind(relation, &topic);
        }

        Ok(topic)
    }

    /// Bind `relation` to `topic`, rolling back if the relation was closed
    /// or the topic removed concurrently.
    fn bind(&self, relation: &Arc<SubscriptionRelation>, topic: &Arc<Topic>) {
        if !relation.is_active() {
            return;
        }
        let Some(session) = relation.session() else {
            return;
        };

        let key = relation.key().clone();
        let binding = match relation.token().share_group() {
            Some(_) => Binding::Shared {
                group: Arc::from(relation.token().as_str()),
                member: SharedMember::new(key, relation.qos(), &session, Arc::downgrade(relation)),
            },
            None => Binding::Cursor(Cursor::new(
                key,
                relation.qos(),
                topic,
                &session,
                Arc::downgrade(relation),
            )),
        };

        if let Err(e) = relation.register(topic, binding.clone()) {
            trace!(error = %e, "Skipping bind");
            return;
        }
        binding.install(topic);

        if !relation.is_active() || !topic.is_enabled() {
            let _ = relation.deregister(topic);
            binding.detach(topic);
        }
    }

    fn teardown(&self, relation: &Arc<SubscriptionRelation>) {
        if relation.is_wildcard() {
            self.wildcards
                .remove_if(relation.key(), |_, current| Arc::ptr_eq(current, relation));
        } else {
            let name = relation.token().filter();
            if let Some(mut exact) = self.exact.get_mut(name) {
                exact.retain(|current| !Arc::ptr_eq(current, relation));
            }
            self.exact.remove_if(name, |_, exact| exact.is_empty());
        }
        relation.close();
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("topics", &self.topics.len())
            .field("sessions", &self.sessions.len())
            .field("wildcards", &self.wildcards.len())
            .field("exact", &self.exact.len())
            .finish()
    }
}

/// Broker statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerStats {
    /// Number of topics.
    pub topic_count: usize,
    /// Number of open sessions.
    pub session_count: usize,
    /// Number of wildcard subscriptions waiting for new topics.
    pub wildcard_subscriptions: usize,
    /// Cursors plus shared-group members across all topics.
    pub total_subscribers: usize,
}

/// Statistics for one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicStats {
    pub name: String,
    pub subscriber_count: usize,
    pub shared_groups: usize,
    pub log_len: usize,
    pub next_offset: Offset,
    pub retained: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::{InlineExecutor, TokioExecutor};

    fn broker() -> Broker {
        broker_with_capacity(64)
    }

    fn broker_with_capacity(capacity: usize) -> Broker {
        let mut config = BrokerConfig::default();
        config.topics.log_capacity = capacity;
        config.session.inflight_window = 16;
        config.session.max_inflight_window = 64;
        config.limits.max_qos = QoS::ExactlyOnce;
        Broker::new(config, Arc::new(InlineExecutor))
    }

    fn connect(
        broker: &Broker,
        client_id: &str,
    ) -> (Arc<Session>, mpsc::UnboundedReceiver<Frame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (broker.open_session(client_id, None, tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Frame>) -> Vec<Frame> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    fn published(frames: &[Frame]) -> Vec<(String, Bytes)> {
        frames
            .iter()
            .filter_map(|frame| match frame {
                Frame::Publish { topic, payload, .. } => {
                    Some((topic.to_string(), payload.clone()))
                }
                _ => None,
            })
            .collect()
    }

    fn ack_all(broker: &Broker, session: &Arc<Session>, frames: &[Frame]) {
        for frame in frames {
            if let Frame::Publish {
                packet_id: Some(id),
                ..
            } = frame
            {
                broker.handle_frame(session, Frame::puback(*id)).unwrap();
            }
        }
    }

    #[test]
    fn test_wildcard_subscription_matches_new_topics() {
        let broker = broker();
        let (session, mut rx) = connect(&broker, "c1");

        broker
            .subscribe(&session, "sensors/+/temp", QoS::AtMostOnce)
            .unwrap();
        broker.publish("sensors/7/temp", QoS::AtMostOnce, false, "21.5").unwrap();
        broker
            .publish("sensors/7/humidity", QoS::AtMostOnce, false, "40")
            .unwrap();

        let frames = drain(&mut rx);
        assert_eq!(
            published(&frames),
            vec![("sensors/7/temp".to_string(), Bytes::from("21.5"))]
        );
        assert_eq!(broker.stats().topic_count, 2);
        assert_eq!(broker.stats().wildcard_subscriptions, 1);
    }

    #[test]
    fn test_wildcard_binds_existing_topics() {
        let broker = broker();
        broker.publish("a/1", QoS::AtMostOnce, false, "old").unwrap();
        broker.publish("a/2", QoS::AtMostOnce, false, "old").unwrap();
        let (session, mut rx) = connect(&broker, "c1");

        broker.subscribe(&session, "a/#", QoS::AtMostOnce).unwrap();
        assert!(drain(&mut rx).is_empty());
        assert_eq!(session.subscription("a/#").unwrap().binding_count(), 2);

        broker.publish("a/2", QoS::AtMostOnce, false, "new").unwrap();
        assert_eq!(
            published(&drain(&mut rx)),
            vec![("a/2".to_string(), Bytes::from("new"))]
        );
    }

    #[test]
    fn test_invalid_filter_mutates_nothing() {
        let broker = broker();
        let (session, _rx) = connect(&broker, "c1");

        let result = broker.subscribe(&session, "a/#/b", QoS::AtLeastOnce);
        assert!(matches!(result, Err(BrokerError::InvalidTopicFilter(_))));
        assert!(session.subscriptions().is_empty());
        assert_eq!(broker.stats().topic_count, 0);

        assert!(matches!(
            broker.publish("a/+", QoS::AtMostOnce, false, "x"),
            Err(BrokerError::InvalidTopicName(_))
        ));
    }

    #[test]
    fn test_resubscribe_keeps_one_cursor() {
        let broker = broker();
        let (session, mut rx) = connect(&broker, "c1");

        broker.subscribe(&session, "a/b", QoS::AtMostOnce).unwrap();
        broker.subscribe(&session, "a/b", QoS::AtLeastOnce).unwrap();

        let topic = broker.topic("a/b").unwrap();
        assert_eq!(topic.subscriber_count(), 1);
        let cursor = topic
            .cursor(&SubscriberKey::new("c1", "a/b"))
            .unwrap();
        assert_eq!(cursor.qos(), QoS::AtLeastOnce);

        broker.publish("a/b", QoS::AtLeastOnce, false, "x").unwrap();
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        assert!(frames[0].packet_id().is_some());
    }

    #[test]
    fn test_resubscribe_wildcard_replaces_index_entry() {
        let broker = broker();
        let (session, mut rx) = connect(&broker, "c1");

        broker.subscribe(&session, "a/+", QoS::AtMostOnce).unwrap();
        broker.subscribe(&session, "a/+", QoS::AtMostOnce).unwrap();
        assert_eq!(broker.stats().wildcard_subscriptions, 1);

        broker.publish("a/x", QoS::AtMostOnce, false, "once").unwrap();
        assert_eq!(drain(&mut rx).len(), 1);
    }

    #[test]
    fn test_qos1_offsets_strictly_increase() {
        let broker = broker();
        let (session, mut rx) = connect(&broker, "c1");
        broker.subscribe(&session, "log", QoS::AtLeastOnce).unwrap();

        for i in 0..5 {
            broker
                .publish("log", QoS::AtLeastOnce, false, i.to_string())
                .unwrap();
        }

        let mut received = Vec::new();
        loop {
            let frames = drain(&mut rx);
            if frames.is_empty() {
                break;
            }
            assert_eq!(frames.len(), 1);
            received.extend(published(&frames).into_iter().map(|(_, p)| p));
            ack_all(&broker, &session, &frames);
        }
        assert_eq!(received, vec!["0", "1", "2", "3", "4"]);
    }

    #[test]
    fn test_unsubscribe_during_in_flight() {
        let broker = broker();
        let (session, mut rx) = connect(&broker, "c1");
        broker.subscribe(&session, "a", QoS::AtLeastOnce).unwrap();

        broker.publish("a", QoS::AtLeastOnce, false, "1").unwrap();
        broker.publish("a", QoS::AtLeastOnce, false, "2").unwrap();
        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);

        broker.unsubscribe(&session, "a").unwrap();
        ack_all(&broker, &session, &frames);
        broker.publish("a", QoS::AtLeastOnce, false, "3").unwrap();

        assert!(drain(&mut rx).is_empty());
        assert_eq!(broker.topic("a").unwrap().subscriber_count(), 0);
        assert!(matches!(
            broker.unsubscribe(&session, "a"),
            Err(BrokerError::NotSubscribed(_))
        ));
    }

    #[test]
    fn test_close_session_clears_every_group() {
        let broker = broker();
        let (session, _rx) = connect(&broker, "c1");
        broker.subscribe(&session, "a/b", QoS::AtLeastOnce).unwrap();
        broker.subscribe(&session, "a/#", QoS::AtMostOnce).unwrap();
        broker
            .subscribe(&session, "$share/g/a/b", QoS::AtLeastOnce)
            .unwrap();
        broker.publish("a/c", QoS::AtMostOnce, false, "x").unwrap();
        assert_eq!(broker.stats().total_subscribers, 4);

        broker.close_session(&session);

        assert!(session.is_closed());
        assert!(broker.session("c1").is_none());
        let stats = broker.stats();
        assert_eq!(stats.session_count, 0);
        assert_eq!(stats.wildcard_subscriptions, 0);
        assert_eq!(stats.total_subscribers, 0);
        assert_eq!(broker.topic("a/b").unwrap().shared_group_count(), 0);
        assert!(matches!(
            broker.subscribe(&session, "a/b", QoS::AtMostOnce),
            Err(BrokerError::SessionClosed(_))
        ));
    }

    #[test]
    fn test_session_takeover_closes_previous() {
        let broker = broker();
        let (first, _rx1) = connect(&broker, "c1");
        broker.subscribe(&first, "a", QoS::AtMostOnce).unwrap();

        let (second, mut rx2) = connect(&broker, "c1");
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(broker.stats().session_count, 1);
        assert_eq!(broker.topic("a").unwrap().subscriber_count(), 0);

        broker.subscribe(&second, "a", QoS::AtMostOnce).unwrap();
        broker.publish("a", QoS::AtMostOnce, false, "x").unwrap();
        assert_eq!(drain(&mut rx2).len(), 1);
    }

    #[test]
    fn test_eviction_scenario() {
        let broker = broker_with_capacity(4);
        let (stalled, mut stalled_rx) = connect(&broker, "stalled");
        broker.subscribe(&stalled, "t", QoS::AtLeastOnce).unwrap();

        for i in 0..6 {
            broker
                .publish("t", QoS::AtLeastOnce, false, i.to_string())
                .unwrap();
        }
        let topic = broker.topic("t").unwrap();
        assert_eq!(topic.log().oldest_offset(), 2);

        let (late, mut late_rx) = connect(&broker, "late");
        broker.subscribe(&late, "t", QoS::AtMostOnce).unwrap();
        assert!(drain(&mut late_rx).is_empty());

        let first = drain(&mut stalled_rx);
        assert_eq!(published(&first)[0].1, "0");
        ack_all(&broker, &stalled, &first);

        let next = drain(&mut stalled_rx);
        assert_eq!(published(&next)[0].1, "2");
        let cursor = topic.cursor(&SubscriberKey::new("stalled", "t")).unwrap();
        assert_eq!(cursor.skipped(), 1);

        broker.publish("t", QoS::AtLeastOnce, false, "6").unwrap();
        let late_frames = drain(&mut late_rx);
        assert_eq!(published(&late_frames)[0].1, "6");
        assert_eq!(
            topic.cursor(&SubscriberKey::new("late", "t")).unwrap().next_offset(),
            7
        );
    }

    #[test]
    fn test_shared_subscription_round_robin() {
        let broker = broker();
        let (a, mut rx_a) = connect(&broker, "a");
        let (b, mut rx_b) = connect(&broker, "b");
        broker.subscribe(&a, "$share/g/jobs/+", QoS::AtMostOnce).unwrap();
        broker.subscribe(&b, "$share/g/jobs/+", QoS::AtMostOnce).unwrap();

        for i in 0..9 {
            broker
                .publish("jobs/x", QoS::AtMostOnce, false, i.to_string())
                .unwrap();
        }

        let count_a = drain(&mut rx_a).len();
        let count_b = drain(&mut rx_b).len();
        assert_eq!(count_a + count_b, 9);
        assert!(count_a.abs_diff(count_b) <= 1);
        assert_eq!(broker.topic_stats("jobs/x").unwrap().shared_groups, 1);
    }

    #[test]
    fn test_retained_message_for_late_subscriber() {
        let broker = broker();
        broker
            .publish("status", QoS::AtLeastOnce, true, "online")
            .unwrap();
        broker.publish("status", QoS::AtMostOnce, false, "ping").unwrap();

        let (session, mut rx) = connect(&broker, "c1");
        broker.subscribe(&session, "status", QoS::AtMostOnce).unwrap();
        let frames = drain(&mut rx);
        assert_eq!(published(&frames), vec![("status".to_string(), Bytes::from("online"))]);
        assert!(matches!(frames[0], Frame::Publish { retain: true, .. }));

        broker.publish("status", QoS::AtLeastOnce, true, "").unwrap();
        drain(&mut rx);
        let (other, mut other_rx) = connect(&broker, "c2");
        broker.subscribe(&other, "status", QoS::AtMostOnce).unwrap();
        assert!(drain(&mut other_rx).is_empty());
        assert!(!broker.topic_stats("status").unwrap().retained);
    }

    #[test]
    fn test_inbound_qos2_duplicate_is_published_once() {
        let broker = broker();
        let (subscriber, mut sub_rx) = connect(&broker, "sub");
        broker.subscribe(&subscriber, "q2", QoS::AtMostOnce).unwrap();
        let (publisher, mut pub_rx) = connect(&broker, "pub");

        let frame = Frame::publish_with_id(9, "q2", QoS::ExactlyOnce, "once");
        broker.handle_frame(&publisher, frame.clone()).unwrap();
        broker.handle_frame(&publisher, frame).unwrap();
        assert_eq!(drain(&mut pub_rx), vec![Frame::pubrec(9), Frame::pubrec(9)]);
        assert!(drain(&mut sub_rx).is_empty());

        broker.handle_frame(&publisher, Frame::pubrel(9)).unwrap();
        broker.handle_frame(&publisher, Frame::pubrel(9)).unwrap();
        assert_eq!(drain(&mut pub_rx), vec![Frame::pubcomp(9), Frame::pubcomp(9)]);
        assert_eq!(drain(&mut sub_rx).len(), 1);
        assert_eq!(broker.topic_stats("q2").unwrap().next_offset, 1);
    }

    #[test]
    fn test_outbound_qos2_handshake() {
        let broker = broker();
        let (session, mut rx) = connect(&broker, "c1");
        broker.subscribe(&session, "x", QoS::ExactlyOnce).unwrap();
        broker.publish("x", QoS::ExactlyOnce, false, "1").unwrap();
        broker.publish("x", QoS::ExactlyOnce, false, "2").unwrap();

        let frames = drain(&mut rx);
        assert_eq!(frames.len(), 1);
        let id = frames[0].packet_id().unwrap();

        broker.handle_frame(&session, Frame::pubrec(id)).unwrap();
        assert_eq!(drain(&mut rx), vec![Frame::pubrel(id)]);
        broker.handle_frame(&session, Frame::pubcomp(id)).unwrap();

        let frames = drain(&mut rx);
        assert_eq!(published(&frames), vec![("x".to_string(), Bytes::from("2"))]);
    }

    #[test]
    fn test_subscribe_frame_answers_suback() {
        let broker = broker();
        let (session, mut rx) = connect(&broker, "c1");

        let frame = Frame::subscribe(
            3,
            vec![
                ("good/+".to_string(), QoS::AtLeastOnce),
                ("bad/#/x".to_string(), QoS::AtLeastOnce),
            ],
        );
        broker.handle_frame(&session, frame).unwrap();
        assert_eq!(
            drain(&mut rx),
            vec![Frame::suback(
                3,
                vec![SubAckCode::Granted(QoS::AtLeastOnce), SubAckCode::Failure]
            )]
        );

        broker
            .handle_frame(&session, Frame::unsubscribe(4, vec!["good/+".to_string()]))
            .unwrap();
        assert_eq!(drain(&mut rx), vec![Frame::unsuback(4)]);
        assert!(session.subscriptions().is_empty());

        assert!(matches!(
            broker.handle_frame(&session, Frame::unsuback(5)),
            Err(BrokerError::UnexpectedFrame(FrameType::UnsubAck))
        ));
    }

    #[test]
    fn test_qos1_publish_answers_puback() {
        let broker = broker();
        let (session, mut rx) = connect(&broker, "c1");

        broker
            .handle_frame(&session, Frame::publish_with_id(2, "a", QoS::AtLeastOnce, "x"))
            .unwrap();
        assert_eq!(drain(&mut rx), vec![Frame::puback(2)]);
        assert!(matches!(
            broker.handle_frame(&session, Frame::publish("a", QoS::AtLeastOnce, "x")),
            Err(BrokerError::MissingPacketId(_))
        ));
    }

    #[test]
    fn test_remove_topic_detaches_relations() {
        let broker = broker();
        let (session, _rx) = connect(&broker, "c1");
        broker.subscribe(&session, "a/+", QoS::AtMostOnce).unwrap();
        broker.subscribe(&session, "a/b", QoS::AtMostOnce).unwrap();
        broker.publish("a/b", QoS::AtMostOnce, false, "x").unwrap();
        assert_eq!(session.subscription("a/+").unwrap().binding_count(), 1);

        assert!(broker.remove_topic("a/b"));
        assert!(!broker.remove_topic("a/b"));
        assert!(!broker.topic_exists("a/b"));
        assert_eq!(session.subscription("a/+").unwrap().binding_count(), 0);
        assert_eq!(session.subscription("a/b").unwrap().binding_count(), 0);
    }

    #[test]
    fn test_exact_subscription_rebinds_after_topic_removal() {
        let broker = broker();
        let (session, mut rx) = connect(&broker, "c1");
        let (worker, mut worker_rx) = connect(&broker, "w1");
        broker.subscribe(&session, "a/b", QoS::AtMostOnce).unwrap();
        broker.subscribe(&worker, "$share/g/a/b", QoS::AtMostOnce).unwrap();

        assert!(broker.remove_topic("a/b"));
        assert_eq!(session.subscription("a/b").unwrap().binding_count(), 0);

        broker.publish("a/b", QoS::AtMostOnce, false, "after").unwrap();
        assert_eq!(
            published(&drain(&mut rx)),
            vec![("a/b".to_string(), Bytes::from("after"))]
        );
        assert_eq!(published(&drain(&mut worker_rx)).len(), 1);
        assert_eq!(session.subscription("a/b").unwrap().binding_count(), 1);
        assert_eq!(broker.topic_stats("a/b").unwrap().subscriber_count, 2);

        // Once unsubscribed, a recreated topic has nobody to bind.
        broker.unsubscribe(&session, "a/b").unwrap();
        broker.unsubscribe(&worker, "$share/g/a/b").unwrap();
        assert!(broker.remove_topic("a/b"));
        broker.publish("a/b", QoS::AtMostOnce, false, "orphan").unwrap();
        assert!(drain(&mut rx).is_empty());
        assert!(drain(&mut worker_rx).is_empty());
        assert_eq!(broker.topic_stats("a/b").unwrap().subscriber_count, 0);
    }

    #[test]
    fn test_max_topics_limit() {
        let mut config = BrokerConfig::default();
        config.limits.max_topics = 1;
        let broker = Broker::new(config, Arc::new(InlineExecutor));

        broker.publish("a", QoS::AtMostOnce, false, "x").unwrap();
        assert!(matches!(
            broker.publish("b", QoS::AtMostOnce, false, "x"),
            Err(BrokerError::MaxTopicsReached)
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_fan_out_on_tokio() {
        let mut config = BrokerConfig::default();
        config.session.inflight_window = 8;
        config.session.max_inflight_window = 8;
        let broker = Arc::new(Broker::new(config, Arc::new(TokioExecutor::current())));

        let mut consumers = Vec::new();
        for i in 0..4 {
            let (tx, mut rx) = mpsc::unbounded_channel();
            let session = broker.open_session(&format!("c{i}"), None, tx);
            broker.subscribe(&session, "feed/#", QoS::AtLeastOnce).unwrap();
            let broker = Arc::clone(&broker);
            consumers.push(tokio::spawn(async move {
                let mut payloads = Vec::new();
                while payloads.len() < 50 {
                    let Some(frame) = rx.recv().await else { break };
                    if let Frame::Publish {
                        packet_id, payload, ..
                    } = frame
                    {
                        payloads.push(payload);
                        if let Some(id) = packet_id {
                            broker.handle_frame(&session, Frame::puback(id)).unwrap();
                        }
                    }
                }
                payloads
            }));
        }

        for i in 0..50 {
            broker
                .publish("feed/a", QoS::AtLeastOnce, false, i.to_string())
                .unwrap();
        }

        for consumer in consumers {
            let payloads = tokio::time::timeout(std::time::Duration::from_secs(10), consumer)
                .await
                .unwrap()
                .unwrap();
            let expected: Vec<Bytes> = (0..50).map(|i| Bytes::from(i.to_string())).collect();
            assert_eq!(payloads, expected);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_close_and_unsubscribe_race_with_publish() {
        use std::sync::atomic::{AtomicBool, Ordering};
        use std::time::Duration;

        const TOPICS: [&str; 3] = ["load/a", "load/b", "load/c"];
        const FILTERS: [&str; 3] = ["load/#", "load/a", "$share/g/load/b"];

        let broker = Arc::new(Broker::new(
            BrokerConfig::default(),
            Arc::new(TokioExecutor::current()),
        ));

        for round in 0..20 {
            let (closing, mut closing_rx) = connect(&broker, &format!("closing-{round}"));
            let (leaving, mut leaving_rx) = connect(&broker, &format!("leaving-{round}"));
            for session in [&closing, &leaving] {
                for filter in FILTERS {
                    broker.subscribe(session, filter, QoS::AtLeastOnce).unwrap();
                }
            }

            let running = Arc::new(AtomicBool::new(true));
            let publisher = {
                let broker = Arc::clone(&broker);
                let running = Arc::clone(&running);
                tokio::spawn(async move {
                    let mut i = 0u64;
                    while running.load(Ordering::Relaxed) {
                        for topic in TOPICS {
                            broker
                                .publish(topic, QoS::AtLeastOnce, false, i.to_string())
                                .unwrap();
                        }
                        i += 1;
                        tokio::task::yield_now().await;
                    }
                })
            };

            tokio::time::sleep(Duration::from_millis(1)).await;
            for filter in FILTERS {
                broker.unsubscribe(&leaving, filter).unwrap();
            }
            broker.close_session(&closing);
            drain(&mut closing_rx);
            drain(&mut leaving_rx);

            // Keep publishing after teardown returned.
            tokio::time::sleep(Duration::from_millis(2)).await;
            running.store(false, Ordering::Relaxed);
            publisher.await.unwrap();
            tokio::time::sleep(Duration::from_millis(2)).await;

            assert!(
                drain(&mut closing_rx).is_empty(),
                "round {round}: closed session got frames"
            );
            assert!(
                drain(&mut leaving_rx).is_empty(),
                "round {round}: unsubscribed session got frames"
            );
            for topic in TOPICS {
                assert_eq!(broker.topic_stats(topic).unwrap().subscriber_count, 0);
            }
            let stats = broker.stats();
            assert_eq!(stats.total_subscribers, 0);
            assert_eq!(stats.wildcard_subscriptions, 0);

            broker.close_session(&leaving);
        }
        assert_eq!(broker.stats().session_count, 0);
    }
}
