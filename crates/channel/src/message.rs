//! Closed message type and JSON codec
//!
//! Every payload is a JSON object with named fields. Unknown fields are
//! ignored so older peers keep working; a missing required field rejects
//! the message.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use contracts::{DeviceId, DeviceProfile, DriftSample, NodeCommand, OffsetCommand};

use crate::error::ProtocolError;
use crate::topic::{Delivery, Target, Topic, TopicKind};

/// `drift/{device_id}` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriftReport {
    pub device_id: DeviceId,
    pub raw_drift_ms: f64,
    pub correlation_score: f64,
    pub timestamp: f64,
    /// Node-side verdict; absent means the node did not validate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid: Option<bool>,
}

impl DriftReport {
    pub fn from_sample(sample: &DriftSample) -> Self {
        Self {
            device_id: sample.device_id.clone(),
            raw_drift_ms: sample.raw_drift_ms,
            correlation_score: sample.correlation_score,
            timestamp: sample.timestamp,
            valid: Some(sample.valid),
        }
    }
}

/// `command/{device_id|all}` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandPayload {
    pub command: NodeCommand,
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
}

impl CommandPayload {
    pub fn new(command: NodeCommand) -> Self {
        Self {
            command,
            params: serde_json::Map::new(),
        }
    }
}

/// `status/{device_id}` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub device_id: DeviceId,
    pub is_playing: bool,
    pub current_offset_ms: f64,
    pub last_drift_ms: f64,
    pub correlation_quality: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f64>,
    pub timestamp: f64,
}

/// `heartbeat/{device_id}` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub timestamp: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
}

/// Every message that travels on the channel
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Drift(DriftReport),
    BufferOffset(OffsetCommand),
    Command {
        target: Target,
        payload: CommandPayload,
    },
    Status(StatusReport),
    Heartbeat {
        device_id: DeviceId,
        payload: Heartbeat,
    },
    Register(DeviceProfile),
}

/// Encoded message as it crosses the transport
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub topic: String,
    pub payload: Bytes,
}

impl Message {
    pub fn kind(&self) -> TopicKind {
        match self {
            Message::Drift(_) => TopicKind::Drift,
            Message::BufferOffset(_) => TopicKind::BufferOffset,
            Message::Command { .. } => TopicKind::Command,
            Message::Status(_) => TopicKind::Status,
            Message::Heartbeat { .. } => TopicKind::Heartbeat,
            Message::Register(_) => TopicKind::Register,
        }
    }

    pub fn delivery(&self) -> Delivery {
        self.kind().delivery()
    }

    pub fn topic(&self) -> Topic {
        let target = match self {
            Message::Drift(r) => Target::Device(r.device_id.clone()),
            Message::BufferOffset(c) => Target::Device(c.device_id.clone()),
            Message::Command { target, .. } => target.clone(),
            Message::Status(s) => Target::Device(s.device_id.clone()),
            Message::Heartbeat { device_id, .. } => Target::Device(device_id.clone()),
            Message::Register(p) => Target::Device(p.device_id.clone()),
        };
        Topic {
            kind: self.kind(),
            target,
        }
    }

    /// Encode under `prefix`
    pub fn encode(&self, prefix: &str) -> Result<Envelope, ProtocolError> {
        let topic = self.topic().to_path(prefix);
        let bytes = match self {
            Message::Drift(r) => serde_json::to_vec(r),
            Message::BufferOffset(c) => serde_json::to_vec(c),
            Message::Command { payload, .. } => serde_json::to_vec(payload),
            Message::Status(s) => serde_json::to_vec(s),
            Message::Heartbeat { payload, .. } => serde_json::to_vec(payload),
            Message::Register(p) => serde_json::to_vec(p),
        }
        .map_err(|e| ProtocolError::Encode {
            topic: topic.clone(),
            message: e.to_string(),
        })?;
        Ok(Envelope {
            topic,
            payload: Bytes::from(bytes),
        })
    }

    /// Decode an envelope published under `prefix`
    pub fn decode(prefix: &str, envelope: &Envelope) -> Result<Self, ProtocolError> {
        let topic = Topic::parse(prefix, &envelope.topic)?;
        let path = envelope.topic.as_str();

        match topic.kind {
            TopicKind::Command => Ok(Message::Command {
                target: topic.target,
                payload: parse_payload(path, &envelope.payload)?,
            }),
            TopicKind::Drift => {
                let device_id = addressed_device(path, topic.target)?;
                let report: DriftReport = parse_payload(path, &envelope.payload)?;
                ensure_same_device(path, &device_id, &report.device_id)?;
                Ok(Message::Drift(report))
            }
            TopicKind::BufferOffset => {
                let device_id = addressed_device(path, topic.target)?;
                let command: OffsetCommand = parse_payload(path, &envelope.payload)?;
                ensure_same_device(path, &device_id, &command.device_id)?;
                Ok(Message::BufferOffset(command))
            }
            TopicKind::Status => {
                let device_id = addressed_device(path, topic.target)?;
                let status: StatusReport = parse_payload(path, &envelope.payload)?;
                ensure_same_device(path, &device_id, &status.device_id)?;
                Ok(Message::Status(status))
            }
            TopicKind::Heartbeat => Ok(Message::Heartbeat {
                device_id: addressed_device(path, topic.target)?,
                payload: parse_payload(path, &envelope.payload)?,
            }),
            TopicKind::Register => {
                let device_id = addressed_device(path, topic.target)?;
                let profile: DeviceProfile = parse_payload(path, &envelope.payload)?;
                ensure_same_device(path, &device_id, &profile.device_id)?;
                Ok(Message::Register(profile))
            }
        }
    }
}

fn addressed_device(topic: &str, target: Target) -> Result<DeviceId, ProtocolError> {
    match target {
        Target::Device(device_id) => Ok(device_id),
        Target::All => Err(ProtocolError::unknown_topic(topic, "broadcast not allowed")),
    }
}

fn parse_payload<T: DeserializeOwned>(topic: &str, payload: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(payload).map_err(|e| ProtocolError::malformed(topic, e.to_string()))
}

fn ensure_same_device(
    topic: &str,
    topic_device: &DeviceId,
    payload_device: &DeviceId,
) -> Result<(), ProtocolError> {
    if topic_device == payload_device {
        Ok(())
    } else {
        Err(ProtocolError::TopicMismatch {
            topic: topic.to_string(),
            payload_device: payload_device.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{DeviceType, OffsetReason};

    const PREFIX: &str = "syncstream";

    fn round_trip(message: Message) {
        let envelope = message.encode(PREFIX).unwrap();
        let decoded = Message::decode(PREFIX, &envelope).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_every_payload_round_trips() {
        round_trip(Message::Drift(DriftReport {
            device_id: "kitchen".into(),
            raw_drift_ms: -12.375,
            correlation_score: 0.91,
            timestamp: 1_700_000_000.25,
            valid: Some(true),
        }));
        round_trip(Message::BufferOffset(OffsetCommand {
            device_id: "kitchen".into(),
            new_offset_ms: 42.5,
            reason: OffsetReason::GroupRebalance,
            issued_at: 1_700_000_001.0,
        }));

        let mut params = serde_json::Map::new();
        params.insert("frequency_hz".into(), serde_json::json!(1000));
        round_trip(Message::Command {
            target: Target::All,
            payload: CommandPayload {
                command: NodeCommand::TestTone,
                params,
            },
        });
        round_trip(Message::Command {
            target: Target::Device("den".into()),
            payload: CommandPayload::new(NodeCommand::Resync),
        });
        round_trip(Message::Status(StatusReport {
            device_id: "den".into(),
            is_playing: true,
            current_offset_ms: 3.0,
            last_drift_ms: 1.5,
            correlation_quality: 0.88,
            cpu_usage: Some(12.0),
            timestamp: 1_700_000_002.0,
        }));
        round_trip(Message::Heartbeat {
            device_id: "den".into(),
            payload: Heartbeat {
                timestamp: 1_700_000_003.0,
                sequence: Some(7),
            },
        });
        round_trip(Message::Register(DeviceProfile {
            device_id: "patio".into(),
            device_name: Some("Patio speaker".into()),
            device_type: DeviceType::Bluetooth,
            base_latency_ms: 150.0,
            sync_group: "outdoor".into(),
        }));
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let envelope = Envelope {
            topic: "syncstream/drift/kitchen".into(),
            payload: Bytes::from_static(
                br#"{"device_id":"kitchen","raw_drift_ms":4.0,"correlation_score":0.9,
                    "timestamp":10.0,"signal_strength":-40,"firmware":"2.1"}"#,
            ),
        };
        let Message::Drift(report) = Message::decode(PREFIX, &envelope).unwrap() else {
            panic!("expected drift report");
        };
        assert_eq!(report.raw_drift_ms, 4.0);
        assert_eq!(report.valid, None);
    }

    #[test]
    fn test_missing_required_field_is_malformed() {
        let envelope = Envelope {
            topic: "syncstream/drift/kitchen".into(),
            payload: Bytes::from_static(br#"{"device_id":"kitchen","timestamp":10.0}"#),
        };
        let err = Message::decode(PREFIX, &envelope).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { .. }), "got: {err}");
        assert!(err.to_string().contains("raw_drift_ms"), "got: {err}");
    }

    #[test]
    fn test_payload_device_must_match_topic() {
        let envelope = Message::Drift(DriftReport {
            device_id: "kitchen".into(),
            raw_drift_ms: 0.0,
            correlation_score: 1.0,
            timestamp: 1.0,
            valid: None,
        })
        .encode(PREFIX)
        .unwrap();
        let forged = Envelope {
            topic: "syncstream/drift/den".into(),
            payload: envelope.payload,
        };
        let err = Message::decode(PREFIX, &forged).unwrap_err();
        assert!(matches!(err, ProtocolError::TopicMismatch { .. }));
    }

    #[test]
    fn test_heartbeat_needs_only_timestamp() {
        let envelope = Envelope {
            topic: "syncstream/heartbeat/den".into(),
            payload: Bytes::from_static(br#"{"timestamp":5.5}"#),
        };
        let message = Message::decode(PREFIX, &envelope).unwrap();
        assert_eq!(message.delivery(), Delivery::AtMostOnce);
        assert_eq!(message.topic(), Topic::device(TopicKind::Heartbeat, "den".into()));
    }

    #[test]
    fn test_register_defaults_group() {
        let envelope = Envelope {
            topic: "syncstream/register/den".into(),
            payload: Bytes::from_static(br#"{"device_id":"den","device_type":"hdmi"}"#),
        };
        let Message::Register(profile) = Message::decode(PREFIX, &envelope).unwrap() else {
            panic!("expected register");
        };
        assert_eq!(profile.sync_group, "default");
        assert_eq!(profile.device_type, DeviceType::Hdmi);
    }
}
