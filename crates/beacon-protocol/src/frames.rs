//! Frame types for the Beacon protocol.
//!
//! Frames are the unit of exchange with the wire layer. Inbound frames are
//! produced by the wire layer's decoder; outbound frames are built by the
//! broker and handed back for encoding.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Packet identifier for QoS 1 and QoS 2 exchanges. Zero is reserved.
pub type PacketId = u16;

/// Delivery guarantee of a publish or subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum QoS {
    /// Fire and forget.
    AtMostOnce = 0,
    /// Acknowledged with PUBACK.
    AtLeastOnce = 1,
    /// Four-step PUBLISH / PUBREC / PUBREL / PUBCOMP handshake.
    ExactlyOnce = 2,
}

/// Error returned when a byte does not name a QoS level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Invalid QoS level: {0}")]
pub struct InvalidQoS(pub u8);

impl QoS {
    /// Whether deliveries at this level wait for an acknowledgment.
    #[must_use]
    pub fn is_acknowledged(self) -> bool {
        self != QoS::AtMostOnce
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> u8 {
        qos as u8
    }
}

impl TryFrom<u8> for QoS {
    type Error = InvalidQoS;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(InvalidQoS(other)),
        }
    }
}

/// Per-filter result carried in a SUBACK.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubAckCode {
    /// Subscription accepted with the given maximum QoS.
    Granted(QoS),
    /// Subscription refused.
    Failure,
}

impl From<SubAckCode> for u8 {
    fn from(code: SubAckCode) -> u8 {
        match code {
            SubAckCode::Granted(qos) => qos.into(),
            SubAckCode::Failure => 0x80,
        }
    }
}

impl TryFrom<u8> for SubAckCode {
    type Error = InvalidQoS;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x80 => Ok(SubAckCode::Failure),
            other => QoS::try_from(other).map(SubAckCode::Granted),
        }
    }
}

/// Frame type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    Publish = 0x03,
    PubAck = 0x04,
    PubRec = 0x05,
    PubRel = 0x06,
    PubComp = 0x07,
    Subscribe = 0x08,
    SubAck = 0x09,
    Unsubscribe = 0x0A,
    UnsubAck = 0x0B,
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Application message.
    Publish {
        /// Present only for QoS 1 and QoS 2.
        packet_id: Option<PacketId>,
        /// Concrete topic name.
        topic: Arc<str>,
        /// Delivery guarantee of this frame.
        qos: QoS,
        /// Retain flag.
        retain: bool,
        /// Set on retransmission.
        dup: bool,
        /// Message payload.
        payload: Bytes,
    },

    /// QoS 1 acknowledgment.
    PubAck { packet_id: PacketId },

    /// QoS 2 step one: publish received.
    PubRec { packet_id: PacketId },

    /// QoS 2 step two: publish release.
    PubRel { packet_id: PacketId },

    /// QoS 2 step three: publish complete.
    PubComp { packet_id: PacketId },

    /// Subscribe request.
    Subscribe {
        packet_id: PacketId,
        /// Topic filters with their requested maximum QoS.
        filters: Vec<(String, QoS)>,
    },

    /// Subscribe response, one code per requested filter.
    SubAck {
        packet_id: PacketId,
        codes: Vec<SubAckCode>,
    },

    /// Unsubscribe request.
    Unsubscribe {
        packet_id: PacketId,
        filters: Vec<String>,
    },

    /// Unsubscribe response.
    UnsubAck { packet_id: PacketId },
}

impl Frame {
    /// Get the frame type.
    #[must_use]
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Publish { .. } => FrameType::Publish,
            Frame::PubAck { .. } => FrameType::PubAck,
            Frame::PubRec { .. } => FrameType::PubRec,
            Frame::PubRel { .. } => FrameType::PubRel,
            Frame::PubComp { .. } => FrameType::PubComp,
            Frame::Subscribe { .. } => FrameType::Subscribe,
            Frame::SubAck { .. } => FrameType::SubAck,
            Frame::Unsubscribe { .. } => FrameType::Unsubscribe,
            Frame::UnsubAck { .. } => FrameType::UnsubAck,
        }
    }

    /// Get the packet identifier, if the frame carries one.
    #[must_use]
    pub fn packet_id(&self) -> Option<PacketId> {
        match self {
            Frame::Publish { packet_id, .. } => *packet_id,
            Frame::PubAck { packet_id }
            | Frame::PubRec { packet_id }
            | Frame::PubRel { packet_id }
            | Frame::PubComp { packet_id }
            | Frame::Subscribe { packet_id, .. }
            | Frame::SubAck { packet_id, .. }
            | Frame::Unsubscribe { packet_id, .. }
            | Frame::UnsubAck { packet_id } => Some(*packet_id),
        }
    }

    /// Create a Publish frame without a packet identifier.
    #[must_use]
    pub fn publish(topic: impl Into<Arc<str>>, qos: QoS, payload: impl Into<Bytes>) -> Self {
        Frame::Publish {
            packet_id: None,
            topic: topic.into(),
            qos,
            retain: false,
            dup: false,
            payload: payload.into(),
        }
    }

    /// Create a Publish frame with a packet identifier for QoS 1 and QoS 2.
    #[must_use]
    pub fn publish_with_id(
        packet_id: PacketId,
        topic: impl Into<Arc<str>>,
        qos: QoS,
        payload: impl Into<Bytes>,
    ) -> Self {
        Frame::Publish {
            packet_id: Some(packet_id),
            topic: topic.into(),
            qos,
            retain: false,
            dup: false,
            payload: payload.into(),
        }
    }

    /// Set the retain flag on a Publish frame. Other frames are returned unchanged.
    #[must_use]
    pub fn retained(mut self, value: bool) -> Self {
        if let Frame::Publish { retain, .. } = &mut self {
            *retain = value;
        }
        self
    }

    /// Create a PubAck frame.
    #[must_use]
    pub fn puback(packet_id: PacketId) -> Self {
        Frame::PubAck { packet_id }
    }

    /// Create a PubRec frame.
    #[must_use]
    pub fn pubrec(packet_id: PacketId) -> Self {
        Frame::PubRec { packet_id }
    }

    /// Create a PubRel frame.
    #[must_use]
    pub fn pubrel(packet_id: PacketId) -> Self {
        Frame::PubRel { packet_id }
    }

    /// Create a PubComp frame.
    #[must_use]
    pub fn pubcomp(packet_id: PacketId) -> Self {
        Frame::PubComp { packet_id }
    }

    /// Create a Subscribe frame.
    #[must_use]
    pub fn subscribe(packet_id: PacketId, filters: Vec<(String, QoS)>) -> Self {
        Frame::Subscribe { packet_id, filters }
    }

    /// Create a SubAck frame.
    #[must_use]
    pub fn suback(packet_id: PacketId, codes: Vec<SubAckCode>) -> Self {
        Frame::SubAck { packet_id, codes }
    }

    /// Create an Unsubscribe frame.
    #[must_use]
    pub fn unsubscribe(packet_id: PacketId, filters: Vec<String>) -> Self {
        Frame::Unsubscribe { packet_id, filters }
    }

    /// Create an UnsubAck frame.
    #[must_use]
    pub fn unsuback(packet_id: PacketId) -> Self {
        Frame::UnsubAck { packet_id }
    }
}
