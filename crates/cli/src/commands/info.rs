//! `info` command implementation.

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use contracts::SyncStreamConfig;

use crate::cli::InfoArgs;

/// Configuration info for JSON output
#[derive(Serialize)]
struct ConfigInfo {
    version: String,
    channel: ChannelInfo,
    detector: DetectorInfo,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    devices: Vec<DeviceInfo>,
    groups: Vec<GroupInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    controller: Option<ControllerInfo>,
}

#[derive(Serialize)]
struct ChannelInfo {
    topic_prefix: String,
    inbound_capacity: usize,
    link_queue_capacity: usize,
}

#[derive(Serialize)]
struct DetectorInfo {
    window_s: f64,
    max_drift_ms: f64,
    min_correlation: f64,
    highpass_cutoff_hz: f64,
}

#[derive(Serialize)]
struct DeviceInfo {
    device_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_name: Option<String>,
    device_type: String,
    base_latency_ms: f64,
    sync_group: String,
}

#[derive(Serialize)]
struct GroupInfo {
    group_id: String,
    priority: i32,
    configured_devices: usize,
}

#[derive(Serialize)]
struct ControllerInfo {
    adjustment_rate: f64,
    tolerance_ms: f64,
    step_clamp_ms: f64,
    settle_ms: f64,
    outlier_sigma: f64,
    group_spread_tolerance_ms: f64,
    device_timeout_s: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    predictive: Option<PredictiveInfo>,
}

#[derive(Serialize)]
struct PredictiveInfo {
    interval_s: f64,
    horizon_s: f64,
    trigger_ms: f64,
    step_ms: f64,
}

/// Execute the `info` command
pub fn run_info(args: &InfoArgs) -> Result<()> {
    info!(config = %args.config.display(), "Loading configuration info");

    if !args.config.exists() {
        anyhow::bail!("Configuration file not found: {}", args.config.display());
    }

    let config = config_loader::ConfigLoader::load_from_path(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;

    if args.json {
        let info = build_config_info(&config, args);
        let json =
            serde_json::to_string_pretty(&info).context("Failed to serialize config info")?;
        println!("{}", json);
    } else {
        print_config_info(&config, args);
    }

    Ok(())
}

/// Declared groups first, then groups only referenced by devices
fn collect_groups(config: &SyncStreamConfig) -> Vec<GroupInfo> {
    let mut groups: Vec<GroupInfo> = config
        .groups
        .iter()
        .map(|g| GroupInfo {
            group_id: g.group_id.clone(),
            priority: g.priority,
            configured_devices: 0,
        })
        .collect();

    for device in &config.devices {
        match groups.iter_mut().find(|g| g.group_id == device.sync_group) {
            Some(group) => group.configured_devices += 1,
            None => groups.push(GroupInfo {
                group_id: device.sync_group.clone(),
                priority: 0,
                configured_devices: 1,
            }),
        }
    }
    groups
}

fn build_config_info(config: &SyncStreamConfig, args: &InfoArgs) -> ConfigInfo {
    let devices = if args.devices {
        config
            .devices
            .iter()
            .map(|d| DeviceInfo {
                device_id: d.device_id.to_string(),
                device_name: d.device_name.clone(),
                device_type: format!("{:?}", d.device_type),
                base_latency_ms: d.base_latency_ms,
                sync_group: d.sync_group.clone(),
            })
            .collect()
    } else {
        Vec::new()
    };

    let controller = args.controller.then(|| {
        let c = &config.controller;
        ControllerInfo {
            adjustment_rate: c.adjustment_rate,
            tolerance_ms: c.tolerance_ms,
            step_clamp_ms: c.step_clamp_ms(),
            settle_ms: c.settle_ms,
            outlier_sigma: c.outlier_sigma,
            group_spread_tolerance_ms: c.group_spread_tolerance_ms,
            device_timeout_s: config.registry.device_timeout_s,
            predictive: c.predictive.enabled.then(|| PredictiveInfo {
                interval_s: c.predictive.interval_s,
                horizon_s: c.predictive.horizon_s,
                trigger_ms: c.predictive.trigger_ms,
                step_ms: c.predictive.step_ms,
            }),
        }
    });

    ConfigInfo {
        version: format!("{:?}", config.version),
        channel: ChannelInfo {
            topic_prefix: config.channel.topic_prefix.clone(),
            inbound_capacity: config.channel.inbound_capacity,
            link_queue_capacity: config.channel.link_queue_capacity,
        },
        detector: DetectorInfo {
            window_s: config.detector.window_s,
            max_drift_ms: config.detector.max_drift_ms,
            min_correlation: config.detector.min_correlation,
            highpass_cutoff_hz: config.preprocess.highpass_cutoff_hz,
        },
        devices,
        groups: collect_groups(config),
        controller,
    }
}

fn print_config_info(config: &SyncStreamConfig, args: &InfoArgs) {
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║               SyncStream Configuration                       ║");
    println!("╚══════════════════════════════════════════════════════════════╝\n");

    println!("📡 Channel");
    println!("   ├─ Version: {:?}", config.version);
    println!("   ├─ Topic prefix: {}", config.channel.topic_prefix);
    println!(
        "   └─ Queues: inbound {}, per node {}",
        config.channel.inbound_capacity, config.channel.link_queue_capacity
    );

    let detector = &config.detector;
    println!("\n🎙  Detector");
    println!("   ├─ Window: {} s", detector.window_s);
    println!("   ├─ Max drift: ±{} ms", detector.max_drift_ms);
    println!("   ├─ Min correlation: {}", detector.min_correlation);
    println!(
        "   └─ High-pass: {} Hz",
        config.preprocess.highpass_cutoff_hz
    );

    println!("\n🔊 Devices ({})", config.devices.len());
    if args.devices {
        for (i, device) in config.devices.iter().enumerate() {
            let prefix = if i == config.devices.len() - 1 { "└─" } else { "├─" };
            println!(
                "   {} {} ({:?}, base {} ms, group {})",
                prefix,
                device.device_id,
                device.device_type,
                device.base_latency_ms,
                device.sync_group
            );
        }
    } else if config.registry.auto_register {
        println!("   └─ unknown nodes are registered on first contact");
    }

    let groups = collect_groups(config);
    if !groups.is_empty() {
        println!("\n🏠 Groups ({})", groups.len());
        for (i, group) in groups.iter().enumerate() {
            let prefix = if i == groups.len() - 1 { "└─" } else { "├─" };
            println!(
                "   {} {} (priority {}, {} devices)",
                prefix, group.group_id, group.priority, group.configured_devices
            );
        }
    }

    if args.controller {
        let c = &config.controller;
        println!("\n⚙️  Controller");
        println!("   ├─ Adjustment rate: {}", c.adjustment_rate);
        println!(
            "   ├─ Tolerance: {} ms (step ≤ {} ms, settle {} ms)",
            c.tolerance_ms,
            c.step_clamp_ms(),
            c.settle_ms
        );
        println!("   ├─ Outlier threshold: {}σ", c.outlier_sigma);
        println!("   ├─ Group spread tolerance: {} ms", c.group_spread_tolerance_ms);
        if c.predictive.enabled {
            println!(
                "   └─ Predictive: every {} s, horizon {} s, trigger {} ms",
                c.predictive.interval_s, c.predictive.horizon_s, c.predictive.trigger_ms
            );
        } else {
            println!("   └─ Predictive: off");
        }
    }

    println!();
}
