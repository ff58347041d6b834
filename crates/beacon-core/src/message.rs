//! Messages as stored in a topic's log.

use beacon_protocol::{Frame, PacketId, QoS};
use bytes::Bytes;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Position of a message in its topic's log.
pub type Offset = u64;

/// A published message, immutable once appended.
///
/// Messages are handed out as `Arc<StoredMessage>` so a reader keeps its
/// message alive even after the log evicts the slot.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    /// Offset assigned by the log.
    pub offset: Offset,
    /// Topic the message was published to.
    pub topic: Arc<str>,
    /// QoS the publisher used.
    pub qos: QoS,
    /// Retain flag of the original publish.
    pub retain: bool,
    /// Message payload (shared for zero-copy fan-out).
    pub payload: Bytes,
    /// Milliseconds since the Unix epoch when the message was appended.
    pub timestamp: u64,
}

impl StoredMessage {
    /// Create a new message at the given offset.
    #[must_use]
    pub fn new(
        offset: Offset,
        topic: Arc<str>,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            offset,
            topic,
            qos,
            retain,
            payload: payload.into(),
            timestamp: now_millis(),
        }
    }

    /// Get the payload size in bytes.
    #[must_use]
    pub fn payload_size(&self) -> usize {
        self.payload.len()
    }

    /// Build the outbound Publish frame for a subscriber.
    ///
    /// `packet_id` is required for QoS 1 and QoS 2 deliveries.
    #[must_use]
    pub fn to_frame(&self, qos: QoS, packet_id: Option<PacketId>) -> Frame {
        Frame::Publish {
            packet_id,
            topic: Arc::clone(&self.topic),
            qos,
            retain: false,
            dup: false,
            payload: self.payload.clone(),
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_creation() {
        let msg = StoredMessage::new(3, "sensors/1".into(), QoS::AtLeastOnce, false, b"hi".to_vec());
        assert_eq!(msg.offset, 3);
        assert_eq!(&*msg.topic, "sensors/1");
        assert_eq!(msg.payload_size(), 2);
        assert!(msg.timestamp > 0);
    }

    #[test]
    fn test_frame_uses_subscriber_qos() {
        let msg = StoredMessage::new(0, "a".into(), QoS::ExactlyOnce, true, b"x".to_vec());
        match msg.to_frame(QoS::AtLeastOnce, Some(4)) {
            Frame::Publish {
                packet_id,
                qos,
                retain,
                payload,
                ..
            } => {
                assert_eq!(packet_id, Some(4));
                assert_eq!(qos, QoS::AtLeastOnce);
                assert!(!retain);
                assert_eq!(&payload[..], b"x");
            }
            other => panic!("Expected Publish, got {:?}", other),
        }
    }
}
