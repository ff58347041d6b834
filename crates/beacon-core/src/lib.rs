//! # tenvis-beacon-core
//!
//! Topic subscription and message delivery engine for the Beacon broker.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **Token** - Topic names, topic filters and wildcard matching
//! - **Log** - Bounded, offset-indexed message log per topic
//! - **Topic** - Log, retained message and subscribers of one topic
//! - **Cursor** - One subscriber's QoS-aware read position
//! - **Group** - Shared subscriptions, one member per message
//! - **Scheduler** - Single-flight push passes per topic
//! - **Session** - In-flight window, packet ids, inbound QoS 2 staging
//! - **Broker** - Registry of topics, sessions and subscriptions
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Wire layer │────▶│   Broker    │────▶│   Topic     │──▶ Log
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                   │                   │ notify
//!        │                   ▼                   ▼
//!        │            ┌─────────────┐     ┌─────────────┐
//!        └────────────│   Session   │◀────│  Cursor /   │
//!          frames     └─────────────┘     │  Group      │
//!                                         └─────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use tenvis_beacon_core::{Broker, BrokerConfig, InlineExecutor};
//! use beacon_protocol::{Frame, QoS};
//! use std::sync::Arc;
//! use tokio::sync::mpsc;
//!
//! let broker = Broker::new(BrokerConfig::default(), Arc::new(InlineExecutor));
//! let (tx, mut rx) = mpsc::unbounded_channel();
//! let session = broker.open_session("client-1", None, tx);
//!
//! broker.subscribe(&session, "sensors/+/temp", QoS::AtMostOnce).unwrap();
//! broker.publish("sensors/7/temp", QoS::AtMostOnce, false, "21.5").unwrap();
//!
//! assert!(matches!(rx.try_recv(), Ok(Frame::Publish { .. })));
//! ```

pub mod broker;
pub mod config;
pub mod cursor;
pub mod group;
pub mod inflight;
pub mod log;
pub mod message;
pub mod metrics;
pub mod relation;
pub mod scheduler;
pub mod session;
pub mod token;
pub mod topic;

pub use broker::{Broker, BrokerError, BrokerStats, TopicStats};
pub use config::{BrokerConfig, ConfigError, SharePolicy};
pub use cursor::Cursor;
pub use group::{SharedGroup, SharedMember};
pub use log::{memory_log_factory, LogFactory, LogRead, MemoryLog, MessageLog};
pub use message::{Offset, StoredMessage};
pub use relation::{Binding, RelationError, SubscriberKey, SubscriptionRelation};
pub use scheduler::{DeliveryError, Executor, InlineExecutor, TokioExecutor};
pub use session::{Offer, Session};
pub use token::{TopicError, TopicToken};
pub use topic::Topic;
