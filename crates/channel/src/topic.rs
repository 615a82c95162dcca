//! Topic grammar: `<prefix>/<kind>/<device_id|all>`

use std::fmt;

use contracts::{is_valid_segment, DeviceId, BROADCAST_SEGMENT};

use crate::error::ProtocolError;

/// Delivery guarantee of a topic kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Delivery {
    /// Sender waits for queue space; link workers retry failed writes
    AtLeastOnce,
    /// Dropped when the queue is full; never retried
    AtMostOnce,
}

/// Message kind, the middle topic segment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicKind {
    Drift,
    BufferOffset,
    Command,
    Status,
    Heartbeat,
    Register,
}

impl TopicKind {
    pub const ALL: [TopicKind; 6] = [
        TopicKind::Drift,
        TopicKind::BufferOffset,
        TopicKind::Command,
        TopicKind::Status,
        TopicKind::Heartbeat,
        TopicKind::Register,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TopicKind::Drift => "drift",
            TopicKind::BufferOffset => "buffer_offset",
            TopicKind::Command => "command",
            TopicKind::Status => "status",
            TopicKind::Heartbeat => "heartbeat",
            TopicKind::Register => "register",
        }
    }

    pub fn from_segment(segment: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == segment)
    }

    pub fn delivery(&self) -> Delivery {
        match self {
            TopicKind::Status | TopicKind::Heartbeat => Delivery::AtMostOnce,
            TopicKind::Drift
            | TopicKind::BufferOffset
            | TopicKind::Command
            | TopicKind::Register => Delivery::AtLeastOnce,
        }
    }

    /// Only commands may be broadcast
    pub fn allows_broadcast(&self) -> bool {
        matches!(self, TopicKind::Command)
    }
}

/// Addressee of a topic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Device(DeviceId),
    All,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Device(id) => f.write_str(id),
            Target::All => f.write_str(BROADCAST_SEGMENT),
        }
    }
}

/// Parsed topic
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Topic {
    pub kind: TopicKind,
    pub target: Target,
}

impl Topic {
    pub fn device(kind: TopicKind, device_id: DeviceId) -> Self {
        Self {
            kind,
            target: Target::Device(device_id),
        }
    }

    pub fn broadcast(kind: TopicKind) -> Self {
        Self {
            kind,
            target: Target::All,
        }
    }

    /// Render as a wire path under `prefix`
    pub fn to_path(&self, prefix: &str) -> String {
        format!("{prefix}/{}/{}", self.kind.as_str(), self.target)
    }

    /// Parse a wire path published under `prefix`
    pub fn parse(prefix: &str, path: &str) -> Result<Self, ProtocolError> {
        let mut parts = path.split('/');
        let (Some(head), Some(kind), Some(target), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(ProtocolError::unknown_topic(
                path,
                "expected <prefix>/<kind>/<target>",
            ));
        };

        if head != prefix {
            return Err(ProtocolError::unknown_topic(
                path,
                format!("prefix is not '{prefix}'"),
            ));
        }

        let kind = TopicKind::from_segment(kind)
            .ok_or_else(|| ProtocolError::unknown_topic(path, format!("unknown kind '{kind}'")))?;

        let target = if target == BROADCAST_SEGMENT {
            if !kind.allows_broadcast() {
                return Err(ProtocolError::unknown_topic(
                    path,
                    format!("'{}' cannot be broadcast", kind.as_str()),
                ));
            }
            Target::All
        } else if is_valid_segment(target) {
            Target::Device(DeviceId::new(target))
        } else {
            return Err(ProtocolError::unknown_topic(path, "invalid device segment"));
        };

        Ok(Self { kind, target })
    }
}
