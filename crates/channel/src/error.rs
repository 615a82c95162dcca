//! Channel error types

use thiserror::Error;

/// Failure to interpret an inbound message.
///
/// Never fatal: the message is logged and dropped.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Topic does not follow `<prefix>/<kind>/<device_id|all>`
    #[error("unknown topic '{topic}': {reason}")]
    UnknownTopic { topic: String, reason: String },

    /// Payload is not valid JSON or lacks a required field
    #[error("malformed payload on '{topic}': {message}")]
    Malformed { topic: String, message: String },

    /// Payload names a different device than its topic
    #[error("topic '{topic}' carries payload for device '{payload_device}'")]
    TopicMismatch {
        topic: String,
        payload_device: String,
    },

    /// Payload could not be serialized
    #[error("failed to encode '{topic}': {message}")]
    Encode { topic: String, message: String },
}

impl ProtocolError {
    pub fn unknown_topic(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnknownTopic {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    pub fn malformed(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Malformed {
            topic: topic.into(),
            message: message.into(),
        }
    }
}

/// Delivery-side errors
#[derive(Debug, Error)]
pub enum LinkError {
    /// Node link refused or failed the write
    #[error("delivery to '{link}' failed: {message}")]
    Delivery { link: String, message: String },

    /// Receiving side has gone away
    #[error("channel '{0}' closed")]
    Closed(String),

    /// Outbound message could not be encoded
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl LinkError {
    pub fn delivery(link: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Delivery {
            link: link.into(),
            message: message.into(),
        }
    }
}
