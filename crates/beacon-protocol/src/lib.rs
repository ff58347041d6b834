//! # beacon-protocol
//!
//! Frame contract between the Beacon delivery engine and the wire layer.
//!
//! The wire layer owns the byte-level codec and the connection lifecycle. It
//! hands decoded [`Frame`]s to the broker and writes the frames the broker
//! emits back to the client. This crate only defines those frames and the
//! small value types they carry.
//!
//! ## Frame Types
//!
//! - `Publish` - Application message, inbound or outbound
//! - `PubAck` / `PubRec` / `PubRel` / `PubComp` - QoS 1 and QoS 2 handshakes
//! - `Subscribe` / `SubAck` - Topic filter membership
//! - `Unsubscribe` / `UnsubAck` - Leaving a topic filter
//!
//! ## Example
//!
//! ```rust
//! use beacon_protocol::{Frame, QoS};
//!
//! let frame = Frame::publish("sensors/7/temp", QoS::AtMostOnce, b"21.5".to_vec());
//! assert_eq!(frame.packet_id(), None);
//! ```

pub mod frames;

pub use frames::{Frame, FrameType, InvalidQoS, PacketId, QoS, SubAckCode};
