//! Owned message types.
//!
//! Decoded packets borrow from the receive buffer. Anything that must outlive that
//! buffer (inbound deliveries handed to the application, pending QoS 2 messages) is
//! copied into these fixed-capacity types.

use heapless::{String, Vec};

use crate::QoS;
use crate::packet::Publish;

/// Maximum length for a single topic name or filter.
pub const MAX_TOPIC_LEN: usize = 128;

/// Maximum payload size of a single message.
pub const MAX_PAYLOAD_LEN: usize = 512;

/// A topic name or filter stored inline.
pub type Topic = String<MAX_TOPIC_LEN>;

/// A message payload stored inline.
pub type Payload = Vec<u8, MAX_PAYLOAD_LEN>;

/// An inbound application message, delivered once it is fully acknowledged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// The topic the message was published to.
    pub topic: Topic,
    /// The payload bytes.
    pub payload: Payload,
    /// The QoS the broker delivered it with.
    pub qos: QoS,
    /// Whether the broker sent it from its retained store.
    pub retain: bool,
}

impl Message {
    /// Copies a decoded PUBLISH into owned storage.
    ///
    /// Returns `None` if the topic or payload exceed the inline capacity.
    pub fn from_publish(publish: &Publish<'_>) -> Option<Self> {
        let mut topic = Topic::new();
        topic.push_str(publish.topic).ok()?;
        let payload = Payload::from_slice(publish.payload).ok()?;
        Some(Self {
            topic,
            payload,
            qos: publish.qos,
            retain: publish.retain,
        })
    }

    /// The payload as UTF-8 text, if it is valid UTF-8.
    pub fn payload_str(&self) -> Option<&str> {
        core::str::from_utf8(&self.payload).ok()
    }
}

/// Copies `s` into a fixed-capacity string, or returns `None` when it does not fit.
pub(crate) fn copy_str<const N: usize>(s: &str) -> Option<String<N>> {
    let mut owned = String::new();
    owned.push_str(s).ok()?;
    Some(owned)
}
