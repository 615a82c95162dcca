//! Sync engine actor.
//!
//! One task owns the [`SyncCore`]. Inbound envelopes, liveness sweeps,
//! predictive passes and control requests are all handled on that task, so
//! state is never shared across threads. Outbound messages go to the channel
//! dispatcher.

use std::time::Duration;

use channel::{Envelope, Message, ProtocolError};
use contracts::{DeviceId, DeviceSnapshot, OffsetCommand, SyncGroup, SyncStreamConfig};
use observability::MetricsSummary;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};

use crate::error::{EngineError, RegistryError};
use crate::sync_core::{ResyncScope, SyncCore, SyncStatus};

const CONTROL_QUEUE: usize = 32;

/// Requests from the monitoring layer
enum ControlRequest {
    Snapshots(oneshot::Sender<Vec<DeviceSnapshot>>),
    Groups(oneshot::Sender<Vec<SyncGroup>>),
    Status(oneshot::Sender<SyncStatus>),
    Metrics(oneshot::Sender<MetricsSummary>),
    ManualOffset {
        device_id: DeviceId,
        offset_ms: f64,
        reply: oneshot::Sender<Result<OffsetCommand, RegistryError>>,
    },
    Resync {
        scope: ResyncScope,
        reply: oneshot::Sender<Result<(), RegistryError>>,
    },
    Deregister {
        device_id: DeviceId,
        reply: oneshot::Sender<Result<(), RegistryError>>,
    },
    Shutdown,
}

/// Cloneable handle to a running engine
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<ControlRequest>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ControlRequest,
    ) -> Result<T, EngineError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| EngineError::Closed)?;
        rx.await.map_err(|_| EngineError::Closed)
    }

    pub async fn snapshots(&self) -> Result<Vec<DeviceSnapshot>, EngineError> {
        self.request(ControlRequest::Snapshots).await
    }

    pub async fn groups(&self) -> Result<Vec<SyncGroup>, EngineError> {
        self.request(ControlRequest::Groups).await
    }

    pub async fn status(&self) -> Result<SyncStatus, EngineError> {
        self.request(ControlRequest::Status).await
    }

    pub async fn metrics(&self) -> Result<MetricsSummary, EngineError> {
        self.request(ControlRequest::Metrics).await
    }

    /// Set a device's offset by hand
    pub async fn manual_offset(
        &self,
        device_id: DeviceId,
        offset_ms: f64,
    ) -> Result<OffsetCommand, EngineError> {
        Ok(self
            .request(|reply| ControlRequest::ManualOffset {
                device_id,
                offset_ms,
                reply,
            })
            .await??)
    }

    pub async fn resync(&self, scope: ResyncScope) -> Result<(), EngineError> {
        Ok(self
            .request(|reply| ControlRequest::Resync { scope, reply })
            .await??)
    }

    pub async fn deregister(&self, device_id: DeviceId) -> Result<(), EngineError> {
        Ok(self
            .request(|reply| ControlRequest::Deregister { device_id, reply })
            .await??)
    }

    /// Ask the engine to stop after the current message
    pub async fn shutdown(&self) -> Result<(), EngineError> {
        self.tx
            .send(ControlRequest::Shutdown)
            .await
            .map_err(|_| EngineError::Closed)
    }
}

/// Final state returned when the engine stops
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub summary: MetricsSummary,
    pub status: SyncStatus,
    pub devices: Vec<DeviceSnapshot>,
    pub groups: Vec<SyncGroup>,
}

pub struct SyncEngine {
    core: SyncCore,
    prefix: String,
    inbound: mpsc::Receiver<Envelope>,
    outbound: mpsc::Sender<Message>,
    control: mpsc::Receiver<ControlRequest>,
    sweep_interval: Duration,
    predictive_interval: Option<Duration>,
}

fn now() -> std::time::Instant {
    Instant::now().into_std()
}

fn protocol_reason(error: &ProtocolError) -> &'static str {
    match error {
        ProtocolError::UnknownTopic { .. } => "unknown_topic",
        ProtocolError::Malformed { .. } => "malformed",
        ProtocolError::TopicMismatch { .. } => "topic_mismatch",
        ProtocolError::Encode { .. } => "encode",
    }
}

impl SyncEngine {
    /// Build an engine reading node envelopes from `inbound` and publishing
    /// controller messages on `outbound`
    pub fn new(
        config: &SyncStreamConfig,
        inbound: mpsc::Receiver<Envelope>,
        outbound: mpsc::Sender<Message>,
    ) -> Result<(Self, EngineHandle), RegistryError> {
        let core = SyncCore::new(config, now())?;
        let (tx, control) = mpsc::channel(CONTROL_QUEUE);
        let predictive = &config.controller.predictive;

        let engine = Self {
            core,
            prefix: config.channel.topic_prefix.clone(),
            inbound,
            outbound,
            control,
            sweep_interval: config.registry.sweep_interval(),
            predictive_interval: predictive.enabled.then(|| predictive.interval()),
        };
        Ok((engine, EngineHandle { tx }))
    }

    /// Run until the inbound channel closes or shutdown is requested
    #[instrument(name = "sync_engine_run", skip(self))]
    pub async fn run(mut self) -> SyncReport {
        info!(
            devices = self.core.registry().len(),
            sweep_interval_ms = self.sweep_interval.as_millis() as u64,
            predictive = self.predictive_interval.is_some(),
            "Sync engine started"
        );

        let mut sweep = time::interval_at(Instant::now() + self.sweep_interval, self.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let predictive_period = self.predictive_interval.unwrap_or(Duration::from_secs(3600));
        let mut predictive = time::interval_at(Instant::now() + predictive_period, predictive_period);
        predictive.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let predictive_enabled = self.predictive_interval.is_some();

        let mut processed: u64 = 0;

        loop {
            tokio::select! {
                envelope = self.inbound.recv() => {
                    let Some(envelope) = envelope else {
                        info!("Inbound channel closed");
                        break;
                    };
                    processed += 1;
                    self.on_envelope(envelope).await;
                    if processed.is_multiple_of(100) {
                        debug!(messages = processed, "Sync engine progress");
                    }
                }
                Some(request) = self.control.recv() => {
                    if !self.on_control(request).await {
                        info!("Shutdown requested");
                        break;
                    }
                }
                _ = sweep.tick() => {
                    let report = self.core.sweep(now());
                    if !report.evicted.is_empty() {
                        metrics::counter!("syncstream_engine_evictions_total")
                            .increment(report.evicted.len() as u64);
                    }
                    if !report.is_empty() {
                        debug!(
                            changes = report.changes.len(),
                            frozen = report.frozen.len(),
                            evicted = report.evicted.len(),
                            "Liveness sweep"
                        );
                    }
                }
                _ = predictive.tick(), if predictive_enabled => {
                    for command in self.core.predictive_pass() {
                        self.send(Message::BufferOffset(command)).await;
                    }
                }
            }
        }

        let report = SyncReport {
            summary: self.core.metrics_summary(),
            status: self.core.status(),
            devices: self.core.snapshots(now()),
            groups: self.core.groups(),
        };
        info!(
            messages = processed,
            sync_events = report.status.sync_events,
            "Sync engine stopped"
        );
        report
    }

    /// Spawn the engine as a background task
    pub fn spawn(self) -> JoinHandle<SyncReport> {
        tokio::spawn(self.run())
    }

    async fn on_envelope(&mut self, envelope: Envelope) {
        let message = match Message::decode(&self.prefix, &envelope) {
            Ok(message) => message,
            Err(e) => {
                warn!(topic = %envelope.topic, error = %e, "Dropping undecodable message");
                observability::record_decode_failure(protocol_reason(&e));
                self.core.note_decode_failure();
                return;
            }
        };

        metrics::counter!("syncstream_engine_messages_total", "kind" => message.kind().as_str())
            .increment(1);
        for outbound in self.core.handle_message(message, now()) {
            self.send(outbound).await;
        }
    }

    /// Returns false on shutdown
    async fn on_control(&mut self, request: ControlRequest) -> bool {
        match request {
            ControlRequest::Snapshots(reply) => {
                let _ = reply.send(self.core.snapshots(now()));
            }
            ControlRequest::Groups(reply) => {
                let _ = reply.send(self.core.groups());
            }
            ControlRequest::Status(reply) => {
                let _ = reply.send(self.core.status());
            }
            ControlRequest::Metrics(reply) => {
                let _ = reply.send(self.core.metrics_summary());
            }
            ControlRequest::ManualOffset {
                device_id,
                offset_ms,
                reply,
            } => {
                let result = self.core.manual_offset(&device_id, offset_ms);
                if let Ok(command) = &result {
                    self.send(Message::BufferOffset(command.clone())).await;
                }
                let _ = reply.send(result);
            }
            ControlRequest::Resync { scope, reply } => {
                let result = match self.core.resync(scope) {
                    Ok(messages) => {
                        for message in messages {
                            self.send(message).await;
                        }
                        Ok(())
                    }
                    Err(e) => Err(e),
                };
                let _ = reply.send(result);
            }
            ControlRequest::Deregister { device_id, reply } => {
                let _ = reply.send(self.core.deregister(&device_id));
            }
            ControlRequest::Shutdown => return false,
        }
        true
    }

    async fn send(&self, message: Message) {
        if self.outbound.send(message).await.is_err() {
            metrics::counter!("syncstream_engine_outbound_dropped_total").increment(1);
            warn!("Outbound channel closed, message dropped");
        }
    }
}
