//! Dispatcher - routes controller output to node links

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use contracts::{ChannelConfig, DeviceId};

use crate::link::{LinkHandle, NodeLink};
use crate::message::Message;
use crate::metrics::MetricsSnapshot;
use crate::topic::Target;

/// Builder for creating a Dispatcher
pub struct DispatcherBuilder {
    prefix: String,
    queue_capacity: usize,
    links: HashMap<DeviceId, LinkHandle>,
    input_rx: mpsc::Receiver<Message>,
}

impl DispatcherBuilder {
    pub fn new(config: &ChannelConfig, input_rx: mpsc::Receiver<Message>) -> Self {
        Self {
            prefix: config.topic_prefix.clone(),
            queue_capacity: config.link_queue_capacity,
            links: HashMap::new(),
            input_rx,
        }
    }

    /// Attach a node link; it gets its own queue and worker
    pub fn link<L: NodeLink + Send + 'static>(mut self, device_id: DeviceId, link: L) -> Self {
        let handle = LinkHandle::spawn(link, self.queue_capacity);
        self.links.insert(device_id, handle);
        self
    }

    #[instrument(name = "dispatcher_builder_build", skip(self), fields(links = self.links.len()))]
    pub fn build(self) -> Dispatcher {
        Dispatcher {
            prefix: self.prefix,
            links: self.links,
            input_rx: self.input_rx,
            unroutable: Arc::new(AtomicU64::new(0)),
        }
    }
}

/// Fans controller messages out to per-node links.
///
/// Device-addressed messages go to that node's link; `command/all` goes to
/// every link. A slow node only fills its own queue.
pub struct Dispatcher {
    prefix: String,
    links: HashMap<DeviceId, LinkHandle>,
    input_rx: mpsc::Receiver<Message>,
    unroutable: Arc<AtomicU64>,
}

impl Dispatcher {
    /// Create a dispatcher with prepared link handles (for testing)
    pub fn with_links(
        prefix: impl Into<String>,
        links: Vec<(DeviceId, LinkHandle)>,
        input_rx: mpsc::Receiver<Message>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            links: links.into_iter().collect(),
            input_rx,
            unroutable: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Get metrics for all links
    pub fn metrics(&self) -> Vec<(String, MetricsSnapshot)> {
        self.links
            .values()
            .map(|h| (h.name().to_string(), h.metrics().snapshot()))
            .collect()
    }

    /// Counter of messages addressed to devices without a link
    pub fn unroutable_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.unroutable)
    }

    /// Run the dispatcher main loop
    ///
    /// Returns when the input channel is closed, after draining every link.
    #[instrument(name = "dispatcher_run", skip(self))]
    pub async fn run(mut self) {
        info!(links = self.links.len(), "Dispatcher started");

        let mut message_count: u64 = 0;

        while let Some(message) = self.input_rx.recv().await {
            message_count += 1;
            self.dispatch(&message).await;

            if message_count.is_multiple_of(100) {
                debug!(messages = message_count, "Dispatcher progress");
            }
        }

        info!(
            messages = message_count,
            "Dispatcher input closed, shutting down"
        );

        for (_, handle) in self.links.drain() {
            handle.shutdown().await;
        }

        info!("Dispatcher shutdown complete");
    }

    /// Spawn the dispatcher as a background task
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    /// Returns the number of links the message was queued on
    async fn dispatch(&self, message: &Message) -> usize {
        let envelope = match message.encode(&self.prefix) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Dropping unencodable message");
                return 0;
            }
        };
        let delivery = message.delivery();

        match message.topic().target {
            Target::Device(device_id) => match self.links.get(&device_id) {
                Some(handle) => usize::from(handle.send(envelope, delivery).await),
                None => {
                    self.unroutable.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        device_id = %device_id,
                        topic = %envelope.topic,
                        "No link for device, message dropped"
                    );
                    0
                }
            },
            Target::All => {
                let mut queued = 0;
                for handle in self.links.values() {
                    if handle.send(envelope.clone(), delivery).await {
                        queued += 1;
                    }
                }
                queued
            }
        }
    }
}

/// Convenience function: controller-side sender plus a dispatcher with no links
pub fn create_dispatcher(config: &ChannelConfig) -> (mpsc::Sender<Message>, DispatcherBuilder) {
    let (tx, rx) = mpsc::channel(config.inbound_capacity.max(1));
    (tx, DispatcherBuilder::new(config, rx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::links::{LocalLink, LogLink};
    use crate::message::{CommandPayload, Envelope};
    use contracts::{NodeCommand, OffsetCommand, OffsetReason};

    fn offset(device: &str, value: f64) -> Message {
        Message::BufferOffset(OffsetCommand {
            device_id: device.into(),
            new_offset_ms: value,
            reason: OffsetReason::Reactive,
            issued_at: 1.0,
        })
    }

    async fn drain(rx: &mut mpsc::Receiver<Envelope>) -> Vec<Envelope> {
        let mut out = Vec::new();
        while let Ok(envelope) = rx.try_recv() {
            out.push(envelope);
        }
        out
    }

    #[tokio::test]
    async fn test_dispatcher_routes_by_device() {
        let config = ChannelConfig::default();
        let (tx, builder) = create_dispatcher(&config);
        let (kitchen, mut kitchen_rx) = LocalLink::pair("kitchen", 8);
        let (den, mut den_rx) = LocalLink::pair("den", 8);

        let dispatcher = builder
            .link("kitchen".into(), kitchen)
            .link("den".into(), den)
            .build();
        let handle = dispatcher.spawn();

        tx.send(offset("kitchen", 5.0)).await.unwrap();
        tx.send(offset("kitchen", 7.0)).await.unwrap();
        tx.send(offset("den", -3.0)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        let kitchen_msgs = drain(&mut kitchen_rx).await;
        let den_msgs = drain(&mut den_rx).await;
        assert_eq!(kitchen_msgs.len(), 2);
        assert_eq!(den_msgs.len(), 1);
        assert_eq!(den_msgs[0].topic, "syncstream/buffer_offset/den");

        // Submission order is preserved per device
        let decoded: Vec<Message> = kitchen_msgs
            .iter()
            .map(|e| Message::decode("syncstream", e).unwrap())
            .collect();
        assert_eq!(decoded, vec![offset("kitchen", 5.0), offset("kitchen", 7.0)]);
    }

    #[tokio::test]
    async fn test_dispatcher_broadcasts_command_all() {
        let config = ChannelConfig::default();
        let (tx, builder) = create_dispatcher(&config);
        let (a, mut a_rx) = LocalLink::pair("a", 8);
        let (b, mut b_rx) = LocalLink::pair("b", 8);
        let handle = builder
            .link("a".into(), a)
            .link("b".into(), b)
            .link("c".into(), LogLink::new("c"))
            .build()
            .spawn();

        tx.send(Message::Command {
            target: Target::All,
            payload: CommandPayload::new(NodeCommand::Resync),
        })
        .await
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(drain(&mut a_rx).await[0].topic, "syncstream/command/all");
        assert_eq!(drain(&mut b_rx).await.len(), 1);
    }

    #[tokio::test]
    async fn test_dispatcher_counts_unroutable() {
        let config = ChannelConfig::default();
        let (tx, builder) = create_dispatcher(&config);
        let dispatcher = builder.link("a".into(), LogLink::new("a")).build();
        let unroutable = dispatcher.unroutable_counter();
        let handle = dispatcher.spawn();

        tx.send(offset("ghost", 1.0)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(unroutable.load(Ordering::Relaxed), 1);
    }
}
