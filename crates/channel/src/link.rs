//! LinkHandle - manages a node link with isolated queue and worker task

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, instrument, warn};

use crate::error::LinkError;
use crate::message::Envelope;
use crate::metrics::LinkMetrics;
use crate::topic::Delivery;

/// Transport to one node (controller -> node direction)
#[trait_variant::make(NodeLink: Send)]
pub trait LocalNodeLink {
    /// Link name (used for logging/metrics)
    fn name(&self) -> &str;

    /// Hand one encoded message to the transport
    async fn deliver(&mut self, envelope: &Envelope) -> Result<(), LinkError>;

    /// Close the transport
    async fn close(&mut self) -> Result<(), LinkError>;
}

/// Retry schedule for at-least-once deliveries
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Wait before the first retry; doubles each time
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(50),
        }
    }
}

struct Outbound {
    envelope: Envelope,
    delivery: Delivery,
}

/// Handle to a running link worker
pub struct LinkHandle {
    name: String,
    tx: mpsc::Sender<Outbound>,
    metrics: Arc<LinkMetrics>,
    worker_handle: JoinHandle<()>,
}

impl LinkHandle {
    /// Create a new LinkHandle and spawn the worker task
    pub fn spawn<L: NodeLink + Send + 'static>(link: L, queue_capacity: usize) -> Self {
        Self::spawn_with_policy(link, queue_capacity, RetryPolicy::default())
    }

    pub fn spawn_with_policy<L: NodeLink + Send + 'static>(
        link: L,
        queue_capacity: usize,
        policy: RetryPolicy,
    ) -> Self {
        let name = link.name().to_string();
        let (tx, rx) = mpsc::channel(queue_capacity.max(1));
        let metrics = Arc::new(LinkMetrics::new());

        let worker_metrics = Arc::clone(&metrics);
        let worker_name = name.clone();

        let worker_handle = tokio::spawn(async move {
            link_worker(link, rx, worker_metrics, worker_name, policy).await;
        });

        Self {
            name,
            tx,
            metrics,
            worker_handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metrics(&self) -> &Arc<LinkMetrics> {
        &self.metrics
    }

    /// Queue an envelope for delivery.
    ///
    /// At-least-once waits for queue space; at-most-once drops on a full
    /// queue. Returns false if the envelope was not queued.
    pub async fn send(&self, envelope: Envelope, delivery: Delivery) -> bool {
        let outbound = Outbound { envelope, delivery };
        match delivery {
            Delivery::AtLeastOnce => match self.tx.send(outbound).await {
                Ok(()) => {
                    self.metrics.set_queue_len(self.queued());
                    true
                }
                Err(_) => {
                    error!(link = %self.name, "Link worker closed unexpectedly");
                    false
                }
            },
            Delivery::AtMostOnce => match self.tx.try_send(outbound) {
                Ok(()) => {
                    self.metrics.set_queue_len(self.queued());
                    true
                }
                Err(mpsc::error::TrySendError::Full(o)) => {
                    self.metrics.inc_dropped_count();
                    warn!(
                        link = %self.name,
                        topic = %o.envelope.topic,
                        "Queue full, message dropped"
                    );
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    error!(link = %self.name, "Link worker closed unexpectedly");
                    false
                }
            },
        }
    }

    fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Shutdown the link worker gracefully, draining queued messages
    #[instrument(name = "link_handle_shutdown", skip(self), fields(link = %self.name))]
    pub async fn shutdown(self) {
        drop(self.tx);
        if let Err(e) = self.worker_handle.await {
            error!(link = %self.name, error = ?e, "Worker task panicked");
        }
        debug!(link = %self.name, "LinkHandle shutdown complete");
    }
}

/// Worker task that consumes envelopes and writes them to the link
#[instrument(
    name = "link_worker_loop",
    skip(link, rx, metrics, policy),
    fields(link = %name)
)]
async fn link_worker<L: NodeLink>(
    mut link: L,
    mut rx: mpsc::Receiver<Outbound>,
    metrics: Arc<LinkMetrics>,
    name: String,
    policy: RetryPolicy,
) {
    debug!(link = %name, "Link worker started");

    while let Some(outbound) = rx.recv().await {
        metrics.set_queue_len(rx.len());

        let attempts = match outbound.delivery {
            Delivery::AtLeastOnce => policy.max_attempts.max(1),
            Delivery::AtMostOnce => 1,
        };
        let mut backoff = policy.initial_backoff;
        let mut attempt = 1;

        loop {
            match link.deliver(&outbound.envelope).await {
                Ok(()) => {
                    metrics.inc_delivered_count();
                    break;
                }
                Err(e) if attempt < attempts => {
                    metrics.inc_retry_count();
                    debug!(
                        link = %name,
                        topic = %outbound.envelope.topic,
                        attempt,
                        error = %e,
                        "Delivery failed, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                    backoff = backoff.saturating_mul(2);
                    attempt += 1;
                }
                Err(e) => {
                    metrics.inc_failure_count();
                    error!(
                        link = %name,
                        topic = %outbound.envelope.topic,
                        attempts = attempt,
                        error = %e,
                        "Delivery failed"
                    );
                    // Continue processing - one failed message must not stall the link
                    break;
                }
            }
        }
    }

    if let Err(e) = link.close().await {
        error!(link = %name, error = %e, "Close failed on shutdown");
    }

    debug!(link = %name, "Link worker stopped");
}
