//! Simulation orchestrator - wires a simulated fleet to a live engine.
//!
//! Every node runs a real `NodeAgent` against simulated acoustics. Node
//! messages travel through the uplink into the `SyncEngine`; the engine's
//! commands go out through the dispatcher and one `LocalLink` per node.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use channel::{LocalLink, Uplink};
use contracts::{
    unix_now, BufferDelay, DeviceProfile, DeviceType, SyncStreamConfig, TonePlayer,
    WindowSource, DEFAULT_GROUP,
};
use drift_detector::{
    AgentStats, DriftDetector, DriftModel, NodeAgent, NodeAudio, ReferenceSource, SharedOffset,
    SimulatedAcoustics, SimulatedCapture, ToneLog,
};
use sync_engine::SyncEngine;

use super::{NodeOutcome, SimulationStats};
use crate::error::CliError;

/// Length of the looping reference signal
const REFERENCE_LOOP_S: f64 = 10.0;

/// Grace period for tasks to drain on shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

const DEVICE_TYPES: [DeviceType; 8] = [
    DeviceType::Analog,
    DeviceType::Hdmi,
    DeviceType::Chromecast,
    DeviceType::Airplay,
    DeviceType::Bluetooth,
    DeviceType::Snapcast,
    DeviceType::Pulse,
    DeviceType::Alsa,
];

/// Simulation configuration
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Engine, detector and node configuration
    pub config: SyncStreamConfig,

    /// Generated node count when `config.devices` is empty
    pub nodes: usize,

    /// Generated nodes are spread round-robin over this many groups
    pub groups: usize,

    /// How long the fleet runs
    pub duration: Duration,

    pub seed: u64,

    /// Initial intrinsic drift is drawn from `[-max_drift_ms, max_drift_ms]`
    pub max_drift_ms: f64,

    /// Drift rate is drawn from `[-drift_rate, drift_rate]` ms/s
    pub drift_rate_ms_per_s: f64,

    pub noise: f32,

    pub sample_rate: u32,

    /// Progress log period (None = disabled)
    pub progress: Option<Duration>,

    /// Metrics server port (None = disabled)
    pub metrics_port: Option<u16>,
}

/// One simulated node before it is started
#[derive(Debug, Clone, PartialEq)]
pub struct NodePlan {
    pub profile: DeviceProfile,
    pub initial_drift_ms: f64,
    pub drift_rate_ms_per_s: f64,
}

/// Typical output latency of a device class
fn typical_latency_ms(device_type: DeviceType) -> f64 {
    match device_type {
        DeviceType::Analog => 5.0,
        DeviceType::Alsa => 8.0,
        DeviceType::Snapcast => 10.0,
        DeviceType::Pulse => 20.0,
        DeviceType::Hdmi => 25.0,
        DeviceType::Chromecast => 60.0,
        DeviceType::Airplay => 80.0,
        DeviceType::Bluetooth => 150.0,
    }
}

/// Lay out the fleet: configured devices when present, generated ones otherwise
pub fn plan_fleet(sim: &SimulationConfig) -> Vec<NodePlan> {
    let mut rng = StdRng::seed_from_u64(sim.seed);
    let max_drift = sim.max_drift_ms.abs();
    let max_rate = sim.drift_rate_ms_per_s.abs();

    let profiles: Vec<DeviceProfile> = if sim.config.devices.is_empty() {
        let groups = sim.groups.max(1);
        (0..sim.nodes)
            .map(|i| {
                let device_type = DEVICE_TYPES[i % DEVICE_TYPES.len()];
                DeviceProfile {
                    device_id: format!("node-{:02}", i + 1).into(),
                    device_name: Some(format!("Simulated {:?} {}", device_type, i + 1)),
                    device_type,
                    base_latency_ms: typical_latency_ms(device_type),
                    sync_group: if groups == 1 {
                        DEFAULT_GROUP.to_string()
                    } else {
                        format!("zone-{}", i % groups + 1)
                    },
                }
            })
            .collect()
    } else {
        sim.config.devices.clone()
    };

    profiles
        .into_iter()
        .map(|profile| NodePlan {
            profile,
            initial_drift_ms: if max_drift > 0.0 {
                rng.random_range(-max_drift..=max_drift)
            } else {
                0.0
            },
            drift_rate_ms_per_s: if max_rate > 0.0 {
                rng.random_range(-max_rate..=max_rate)
            } else {
                0.0
            },
        })
        .collect()
}

/// A started node and the handles needed to inspect it afterwards
struct RunningNode {
    plan: NodePlan,
    capture: Arc<SimulatedCapture>,
    delay: Arc<SharedOffset>,
    stats: Arc<AgentStats>,
    task: JoinHandle<()>,
}

/// Main simulation orchestrator
pub struct Simulation {
    config: SimulationConfig,
}

impl Simulation {
    pub fn new(config: SimulationConfig) -> Self {
        Self { config }
    }

    /// Run until the configured duration elapses or `shutdown` resolves
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<SimulationStats> {
        let start_time = Instant::now();
        let config = &self.config.config;

        if let Some(port) = self.config.metrics_port {
            observability::init_metrics_only(port)?;
            info!("Metrics endpoint available on port {}", port);
        }

        let fleet = plan_fleet(&self.config);
        if fleet.is_empty() {
            return Err(CliError::invalid_simulation("the fleet has no nodes").into());
        }

        // Channel: nodes -> engine, engine -> dispatcher -> nodes
        let (uplink, inbound_rx) = Uplink::channel(&config.channel);
        let (outbound_tx, mut links) = channel::create_dispatcher(&config.channel);

        let acoustics = Arc::new(SimulatedAcoustics::new(
            self.config.sample_rate,
            REFERENCE_LOOP_S,
            self.config.seed,
        ));
        let detector = Arc::new(DriftDetector::from_config(config));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let epoch = unix_now();

        let (engine, handle) = SyncEngine::new(config, inbound_rx, outbound_tx)
            .map_err(|e| CliError::engine(e.to_string()))?;

        let mut nodes = Vec::with_capacity(fleet.len());
        for plan in fleet {
            let device_id = plan.profile.device_id.clone();
            let (link, inbox) =
                LocalLink::pair(device_id.as_str(), config.channel.link_queue_capacity);
            links = links.link(device_id.clone(), link);

            // Registry and node both start at the base latency
            let delay = Arc::new(SharedOffset::new(plan.profile.base_latency_ms));
            let capture = Arc::new(SimulatedCapture::new(
                format!("{device_id}-mic"),
                Arc::clone(&acoustics),
                DriftModel {
                    initial_ms: plan.initial_drift_ms,
                    rate_ms_per_s: plan.drift_rate_ms_per_s,
                    epoch,
                },
                plan.profile.base_latency_ms,
                Arc::clone(&delay),
                self.config.noise,
            ));
            let audio = NodeAudio {
                reference: Arc::new(ReferenceSource::new(Arc::clone(&acoustics))),
                capture: Arc::clone(&capture) as Arc<dyn WindowSource>,
                delay: Arc::clone(&delay) as Arc<dyn BufferDelay>,
                tone: Arc::new(ToneLog::default()) as Arc<dyn TonePlayer>,
            };

            let agent = NodeAgent::new(
                plan.profile.clone(),
                config,
                Arc::clone(&detector),
                audio,
                uplink.clone(),
                inbox,
            );
            info!(
                device_id = %device_id,
                group = %plan.profile.sync_group,
                initial_drift_ms = format!("{:.2}", plan.initial_drift_ms),
                drift_rate = format!("{:.4}", plan.drift_rate_ms_per_s),
                "Simulated node configured"
            );
            nodes.push(RunningNode {
                stats: agent.stats(),
                task: agent.spawn(shutdown_rx.clone()),
                plan,
                capture,
                delay,
            });
        }
        // Only the agents hold uplinks now
        drop(uplink);

        let dispatcher_handle = links.build().spawn();
        let engine_task = engine.spawn();

        info!(
            nodes = nodes.len(),
            duration_secs = self.config.duration.as_secs_f64(),
            "Simulation running"
        );

        let deadline = tokio::time::sleep(self.config.duration);
        tokio::pin!(deadline);
        tokio::pin!(shutdown);
        let progress_period = self.config.progress.unwrap_or(Duration::from_secs(3600));
        let mut progress = tokio::time::interval_at(
            tokio::time::Instant::now() + progress_period,
            progress_period,
        );
        let progress_enabled = self.config.progress.is_some();
        let mut interrupted = false;

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    info!("Simulation duration reached");
                    break;
                }
                _ = &mut shutdown => {
                    warn!("Received shutdown signal, stopping simulation...");
                    interrupted = true;
                    break;
                }
                _ = progress.tick(), if progress_enabled => {
                    match handle.status().await {
                        Ok(status) => info!(
                            elapsed_secs = start_time.elapsed().as_secs(),
                            online = status.online_devices,
                            degraded = status.degraded_devices,
                            offline = status.offline_devices,
                            sync_events = status.sync_events,
                            max_drift_ms = format!("{:.2}", status.max_drift_ms),
                            "Simulation progress"
                        ),
                        Err(e) => {
                            warn!(error = %e, "Sync engine stopped early");
                            break;
                        }
                    }
                }
            }
        }

        // Shutdown: nodes first, then the engine, then the dispatcher drains
        info!("Shutting down simulation...");
        let _ = shutdown_tx.send(true);
        let now = unix_now();
        let mut outcomes = Vec::with_capacity(nodes.len());
        for node in nodes {
            if tokio::time::timeout(DRAIN_TIMEOUT, node.task).await.is_err() {
                warn!(device_id = %node.plan.profile.device_id, "Node agent did not stop in time");
            }
            outcomes.push(NodeOutcome {
                device_id: node.plan.profile.device_id.clone(),
                sync_group: node.plan.profile.sync_group.clone(),
                intrinsic_drift_ms: DriftModel {
                    initial_ms: node.plan.initial_drift_ms,
                    rate_ms_per_s: node.plan.drift_rate_ms_per_s,
                    epoch,
                }
                .intrinsic_at(now),
                applied_offset_ms: node.delay.current_offset_ms(),
                residual_lag_ms: node.capture.acoustic_lag_ms(now),
                measurements: node.stats.measurements(),
                skipped: node.stats.skipped(),
                offsets_applied: node.stats.offsets_applied(),
            });
        }

        // The engine may already be gone if every uplink closed first
        let _ = handle.shutdown().await;
        let report = engine_task.await.context("Sync engine task panicked")?;

        if tokio::time::timeout(DRAIN_TIMEOUT, dispatcher_handle)
            .await
            .is_err()
        {
            warn!("Dispatcher did not drain in time");
        }

        let stats = SimulationStats {
            duration: start_time.elapsed(),
            interrupted,
            report,
            nodes: outcomes,
        };

        info!(
            duration_secs = stats.duration.as_secs_f64(),
            sync_events = stats.report.status.sync_events,
            "Simulation shutdown complete"
        );

        Ok(stats)
    }
}
