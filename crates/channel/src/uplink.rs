//! Uplink - node -> controller publishing with per-topic delivery guarantees

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{trace, warn};

use contracts::ChannelConfig;

use crate::error::LinkError;
use crate::message::{Envelope, Message};
use crate::metrics::LinkMetrics;
use crate::topic::Delivery;

/// Cloneable publisher shared by every node task
#[derive(Clone)]
pub struct Uplink {
    prefix: Arc<str>,
    tx: mpsc::Sender<Envelope>,
    metrics: Arc<LinkMetrics>,
}

impl Uplink {
    pub fn new(prefix: &str, tx: mpsc::Sender<Envelope>) -> Self {
        Self {
            prefix: Arc::from(prefix),
            tx,
            metrics: Arc::new(LinkMetrics::new()),
        }
    }

    /// Uplink plus the controller's receiving end
    pub fn channel(config: &ChannelConfig) -> (Self, mpsc::Receiver<Envelope>) {
        let (tx, rx) = mpsc::channel(config.inbound_capacity.max(1));
        (Self::new(&config.topic_prefix, tx), rx)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn metrics(&self) -> &Arc<LinkMetrics> {
        &self.metrics
    }

    /// Publish a message.
    ///
    /// Returns `Ok(false)` when an at-most-once message was dropped on a
    /// full queue. At-least-once messages wait for space instead.
    pub async fn publish(&self, message: &Message) -> Result<bool, LinkError> {
        let envelope = message.encode(&self.prefix)?;
        let topic = envelope.topic.clone();

        match message.delivery() {
            Delivery::AtLeastOnce => {
                self.tx
                    .send(envelope)
                    .await
                    .map_err(|_| LinkError::Closed(self.prefix.to_string()))?;
            }
            Delivery::AtMostOnce => match self.tx.try_send(envelope) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.metrics.inc_dropped_count();
                    warn!(topic = %topic, "Uplink full, message dropped");
                    return Ok(false);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    return Err(LinkError::Closed(self.prefix.to_string()));
                }
            },
        }

        self.metrics.inc_delivered_count();
        trace!(topic = %topic, "Published");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{DriftReport, Heartbeat};

    fn heartbeat(seq: u64) -> Message {
        Message::Heartbeat {
            device_id: "den".into(),
            payload: Heartbeat {
                timestamp: seq as f64,
                sequence: Some(seq),
            },
        }
    }

    #[tokio::test]
    async fn test_heartbeat_dropped_when_full() {
        let (tx, mut rx) = mpsc::channel(1);
        let uplink = Uplink::new("syncstream", tx);

        assert!(uplink.publish(&heartbeat(1)).await.unwrap());
        assert!(!uplink.publish(&heartbeat(2)).await.unwrap());
        assert_eq!(uplink.metrics().dropped_count(), 1);

        let envelope = rx.recv().await.unwrap();
        assert_eq!(
            Message::decode("syncstream", &envelope).unwrap(),
            heartbeat(1)
        );
    }

    #[tokio::test]
    async fn test_drift_waits_for_space() {
        let (tx, mut rx) = mpsc::channel(1);
        let uplink = Uplink::new("syncstream", tx);
        let drift = Message::Drift(DriftReport {
            device_id: "den".into(),
            raw_drift_ms: 3.0,
            correlation_score: 0.9,
            timestamp: 1.0,
            valid: Some(true),
        });

        uplink.publish(&heartbeat(1)).await.unwrap();
        let publisher = {
            let uplink = uplink.clone();
            let drift = drift.clone();
            tokio::spawn(async move { uplink.publish(&drift).await })
        };

        // Free the slot; the blocked drift report then goes through
        rx.recv().await.unwrap();
        assert!(publisher.await.unwrap().unwrap());
        let envelope = rx.recv().await.unwrap();
        assert_eq!(Message::decode("syncstream", &envelope).unwrap(), drift);
        assert_eq!(uplink.metrics().dropped_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_after_close_fails() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let uplink = Uplink::new("syncstream", tx);
        assert!(matches!(
            uplink.publish(&heartbeat(1)).await,
            Err(LinkError::Closed(_))
        ));
    }
}
