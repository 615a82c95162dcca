//! # Integration Tests
//!
//! 集成测试与端到端测试。
//!
//! 负责：
//! - 配置文件 -> 引擎启动
//! - 模拟节点 e2e 测试：NodeAgent -> Uplink -> SyncEngine -> Dispatcher -> LocalLink
//! - 离线检测与手动偏移下发

#[cfg(test)]
mod config_tests {
    use std::io::Write;

    use config_loader::{ConfigFormat, ConfigLoader};
    use contracts::DeviceStatus;
    use sync_engine::SyncEngine;
    use tokio::sync::mpsc;

    const CONFIG: &str = r#"
[controller]
tolerance_ms = 10.0

[registry]
auto_register = false

[[groups]]
group_id = "living"
priority = 2

[[devices]]
device_id = "tv"
device_type = "hdmi"
base_latency_ms = 25.0
sync_group = "living"

[[devices]]
device_id = "soundbar"
device_type = "analog"
sync_group = "living"
"#;

    #[test]
    fn test_config_round_trip() {
        let config = ConfigLoader::load_from_str(CONFIG, ConfigFormat::Toml).unwrap();
        let toml = ConfigLoader::to_toml(&config).unwrap();
        let again = ConfigLoader::load_from_str(&toml, ConfigFormat::Toml).unwrap();

        assert_eq!(again.devices, config.devices);
        assert_eq!(again.controller.tolerance_ms, 10.0);
        assert!(!again.registry.auto_register);
    }

    /// Static devices from a config file are registered before any node speaks
    #[tokio::test]
    async fn test_engine_starts_from_config_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(CONFIG.as_bytes()).unwrap();
        let config = ConfigLoader::load_from_path(file.path()).unwrap();

        let (_inbound_tx, inbound_rx) = mpsc::channel(8);
        let (outbound_tx, _outbound_rx) = mpsc::channel(8);
        let (engine, handle) = SyncEngine::new(&config, inbound_rx, outbound_tx).unwrap();
        let task = engine.spawn();

        let snapshots = handle.snapshots().await.unwrap();
        assert_eq!(snapshots.len(), 2);
        assert_eq!(snapshots[0].device_id, "soundbar");
        assert_eq!(snapshots[1].device_id, "tv");
        assert_eq!(snapshots[1].current_offset_ms, 25.0);
        assert!(snapshots
            .iter()
            .all(|s| s.status == DeviceStatus::Registering));

        let groups = handle.groups().await.unwrap();
        assert_eq!(groups[0].group_id, "living");
        assert_eq!(groups[0].member_device_ids.len(), 2);

        handle.shutdown().await.unwrap();
        let report = task.await.unwrap();
        assert_eq!(report.status.device_count, 2);
    }
}

#[cfg(test)]
mod e2e_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use channel::{Envelope, LocalLink, Uplink};
    use contracts::{
        unix_now, BufferDelay, DeviceId, DeviceProfile, DeviceStatus, OffsetReason,
        SyncStreamConfig, TonePlayer, WindowSource,
    };
    use drift_detector::{
        AgentStats, DriftDetector, DriftModel, NodeAgent, NodeAudio, ReferenceSource,
        SharedOffset, SimulatedAcoustics, SimulatedCapture, ToneLog,
    };
    use sync_engine::{EngineHandle, ResyncScope, SyncEngine, SyncReport};
    use tokio::sync::{mpsc, watch};
    use tokio::task::JoinHandle;

    /// Fast cadence so a fleet converges in a few seconds of wall time
    fn fast_config() -> SyncStreamConfig {
        let mut config = SyncStreamConfig::default();
        config.sampling.base_interval_s = 0.1;
        config.sampling.max_interval_s = 0.2;
        config.sampling.heartbeat_interval_s = 0.1;
        config.sampling.lookback_s = 0.0;
        config.detector.window_s = 0.5;
        config.detector.max_drift_ms = 200.0;
        config.registry.sweep_interval_s = 0.1;
        config.controller.predictive.enabled = false;
        config
    }

    struct Node {
        device_id: DeviceId,
        capture: Arc<SimulatedCapture>,
        delay: Arc<SharedOffset>,
        stats: Arc<AgentStats>,
        task: JoinHandle<()>,
        shutdown: watch::Sender<bool>,
    }

    impl Node {
        fn acoustic_lag_ms(&self) -> f64 {
            self.capture.acoustic_lag_ms(unix_now())
        }
    }

    struct Fleet {
        nodes: Vec<Node>,
        handle: EngineHandle,
        engine: JoinHandle<SyncReport>,
        dispatcher: JoinHandle<()>,
        /// Raw access to the controller's inbound queue
        raw: mpsc::Sender<Envelope>,
    }

    /// Start an engine plus one agent per `(profile, intrinsic drift)`
    fn start_fleet(config: &SyncStreamConfig, specs: Vec<(DeviceProfile, f64)>) -> Fleet {
        let (raw, inbound_rx) = mpsc::channel(config.channel.inbound_capacity);
        let uplink = Uplink::new(&config.channel.topic_prefix, raw.clone());
        let (outbound_tx, mut links) = channel::create_dispatcher(&config.channel);
        let (engine, handle) = SyncEngine::new(config, inbound_rx, outbound_tx).unwrap();

        let acoustics = Arc::new(SimulatedAcoustics::new(8_000, 10.0, 11));
        let detector = Arc::new(DriftDetector::from_config(config));
        let epoch = unix_now();

        let mut nodes = Vec::new();
        for (profile, intrinsic_ms) in specs {
            let device_id = profile.device_id.clone();
            let (link, inbox) = LocalLink::pair(device_id.as_str(), 16);
            links = links.link(device_id.clone(), link);

            let delay = Arc::new(SharedOffset::new(profile.base_latency_ms));
            let capture = Arc::new(SimulatedCapture::new(
                format!("{device_id}-mic"),
                Arc::clone(&acoustics),
                DriftModel {
                    initial_ms: intrinsic_ms,
                    rate_ms_per_s: 0.0,
                    epoch,
                },
                profile.base_latency_ms,
                Arc::clone(&delay),
                0.02,
            ));
            let audio = NodeAudio {
                reference: Arc::new(ReferenceSource::new(Arc::clone(&acoustics))),
                capture: Arc::clone(&capture) as Arc<dyn WindowSource>,
                delay: Arc::clone(&delay) as Arc<dyn BufferDelay>,
                tone: Arc::new(ToneLog::default()) as Arc<dyn TonePlayer>,
            };
            let agent = NodeAgent::new(
                profile,
                config,
                Arc::clone(&detector),
                audio,
                uplink.clone(),
                inbox,
            );
            let (shutdown, shutdown_rx) = watch::channel(false);
            nodes.push(Node {
                device_id,
                capture,
                delay,
                stats: agent.stats(),
                task: agent.spawn(shutdown_rx),
                shutdown,
            });
        }

        Fleet {
            nodes,
            handle,
            engine: engine.spawn(),
            dispatcher: links.build().spawn(),
            raw,
        }
    }

    impl Fleet {
        async fn stop(self) -> SyncReport {
            for node in &self.nodes {
                let _ = node.shutdown.send(true);
            }
            for node in self.nodes {
                let _ = tokio::time::timeout(Duration::from_secs(5), node.task).await;
            }
            let _ = self.handle.shutdown().await;
            let report = self.engine.await.unwrap();
            let _ = tokio::time::timeout(Duration::from_secs(2), self.dispatcher).await;
            report
        }
    }

    fn profile(id: &str, base_latency_ms: f64) -> DeviceProfile {
        let mut profile = DeviceProfile::anonymous(id.into());
        profile.base_latency_ms = base_latency_ms;
        profile
    }

    /// Poll `check` every 100 ms until it holds or `limit` passes
    async fn eventually<F, Fut>(limit: Duration, mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        tokio::time::timeout(limit, async {
            loop {
                if check().await {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await
        .is_ok()
    }

    /// End-to-end: two drifting nodes in one group end up acoustically aligned
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_e2e_group_converges() {
        let config = fast_config();
        let fleet = start_fleet(
            &config,
            vec![(profile("den", 0.0), 30.0), (profile("hall", 20.0), -10.0)],
        );

        let aligned = eventually(Duration::from_secs(20), || {
            let spread = (fleet.nodes[0].acoustic_lag_ms() - fleet.nodes[1].acoustic_lag_ms()).abs();
            async move { spread < 3.0 }
        })
        .await;

        let den_lag = fleet.nodes[0].acoustic_lag_ms();
        let hall_lag = fleet.nodes[1].acoustic_lag_ms();
        assert!(aligned, "den {den_lag:.2} ms vs hall {hall_lag:.2} ms");
        assert!(fleet.nodes.iter().all(|n| n.stats.offsets_applied() >= 1));

        let snapshots = fleet.handle.snapshots().await.unwrap();
        for (node, snapshot) in fleet.nodes.iter().zip(&snapshots) {
            assert_eq!(node.device_id, snapshot.device_id);
            assert_eq!(snapshot.status, DeviceStatus::Online);
            assert!(snapshot.stats.commands_applied >= 1);
        }

        let report = fleet.stop().await;
        assert!(report.status.sync_events >= 2);
        assert_eq!(report.summary.decode_failures, 0);
        assert!(report.summary.valid_samples > 0);
    }

    /// A node that stops talking is taken offline; its offset is kept
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_e2e_silent_node_goes_offline() {
        let mut config = fast_config();
        config.registry.device_timeout_s = 0.5;
        let fleet = start_fleet(&config, vec![(profile("garage", 10.0), 0.0)]);
        let handle = fleet.handle.clone();

        let online = eventually(Duration::from_secs(10), || {
            let handle = handle.clone();
            async move {
                let snapshots = handle.snapshots().await.unwrap();
                snapshots.first().map(|s| s.status) == Some(DeviceStatus::Online)
            }
        })
        .await;
        assert!(online, "node never came online");

        let _ = fleet.nodes[0].shutdown.send(true);
        let offline = eventually(Duration::from_secs(5), || {
            let handle = handle.clone();
            async move {
                let snapshots = handle.snapshots().await.unwrap();
                snapshots[0].status == DeviceStatus::Offline
            }
        })
        .await;
        assert!(offline, "silent node still reachable");

        let snapshots = handle.snapshots().await.unwrap();
        assert_eq!(snapshots[0].current_offset_ms, 10.0);
        let status = handle.status().await.unwrap();
        assert_eq!(status.offline_devices, 1);

        fleet.stop().await;
    }

    /// Manual offsets and resync commands travel through the dispatcher to the node
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_e2e_manual_offset_and_resync_reach_node() {
        let config = fast_config();
        let fleet = start_fleet(&config, vec![(profile("kitchen", 0.0), 0.0)]);
        let handle = fleet.handle.clone();

        let registered = eventually(Duration::from_secs(10), || {
            let handle = handle.clone();
            async move { !handle.snapshots().await.unwrap().is_empty() }
        })
        .await;
        assert!(registered);

        let command = handle.manual_offset("kitchen".into(), 42.0).await.unwrap();
        assert_eq!(command.reason, OffsetReason::Manual);

        let node = &fleet.nodes[0];
        let applied = eventually(Duration::from_secs(5), || {
            let offset = node.delay.current_offset_ms();
            async move { offset == 42.0 }
        })
        .await;
        assert!(applied, "offset never reached the node");

        let commands_before = node.stats.commands();
        handle.resync(ResyncScope::All).await.unwrap();
        let resynced = eventually(Duration::from_secs(5), || {
            let commands = node.stats.commands();
            async move { commands > commands_before }
        })
        .await;
        assert!(resynced, "resync command never reached the node");

        // Resync hands control back to the loop
        let snapshots = handle.snapshots().await.unwrap();
        assert!(!snapshots[0].manual_override);

        fleet.stop().await;
    }

    /// Garbage on the wire is counted and dropped, the fleet keeps running
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_e2e_malformed_messages_are_counted() {
        let config = fast_config();
        let fleet = start_fleet(&config, vec![(profile("attic", 0.0), 5.0)]);

        fleet
            .raw
            .send(Envelope {
                topic: "syncstream/drift/attic".to_string(),
                payload: b"not json".to_vec().into(),
            })
            .await
            .unwrap();
        fleet
            .raw
            .send(Envelope {
                topic: "elsewhere/drift/attic".to_string(),
                payload: b"{}".to_vec().into(),
            })
            .await
            .unwrap();

        let handle = fleet.handle.clone();
        let counted = eventually(Duration::from_secs(5), || {
            let handle = handle.clone();
            async move { handle.metrics().await.unwrap().decode_failures == 2 }
        })
        .await;
        assert!(counted);

        let report = fleet.stop().await;
        assert_eq!(report.status.device_count, 1);
    }
}
