//! `simulate` command implementation.

use anyhow::{Context, Result};
use std::time::Duration;
use tracing::{info, warn};

use config_loader::ConfigLoader;
use contracts::SyncStreamConfig;

use crate::cli::SimulateArgs;
use crate::error::CliError;
use crate::simulation::{plan_fleet, Simulation, SimulationConfig};

/// Execute the `simulate` command
pub async fn run_simulate(args: &SimulateArgs) -> Result<()> {
    let mut config = load_config(args)?;

    // Apply CLI overrides
    if let Some(interval) = args.interval {
        info!(interval_s = interval, "Overriding sampling interval from CLI");
        config.sampling.base_interval_s = interval;
        config.sampling.max_interval_s = config.sampling.max_interval_s.max(interval);
    }
    ConfigLoader::validate(&config).context("Configuration invalid after CLI overrides")?;

    if args.sample_rate == 0 {
        return Err(CliError::invalid_simulation("sample rate must be positive").into());
    }
    if config.preprocess.highpass_cutoff_hz >= f64::from(args.sample_rate) / 2.0 {
        return Err(CliError::invalid_simulation(format!(
            "high-pass cutoff {} Hz is above the Nyquist frequency of {} Hz audio",
            config.preprocess.highpass_cutoff_hz, args.sample_rate
        ))
        .into());
    }

    let sim_config = SimulationConfig {
        config,
        nodes: args.nodes,
        groups: args.groups,
        duration: Duration::from_secs(args.duration),
        seed: args.seed,
        max_drift_ms: args.max_drift,
        drift_rate_ms_per_s: args.drift_rate,
        noise: args.noise,
        sample_rate: args.sample_rate,
        progress: (args.progress > 0).then(|| Duration::from_secs(args.progress)),
        metrics_port: (args.metrics_port > 0).then_some(args.metrics_port),
    };

    info!(
        nodes = args.nodes,
        groups = args.groups,
        duration_secs = args.duration,
        seed = args.seed,
        "Simulation configured"
    );

    // Dry run - just print the fleet and exit
    if args.dry_run {
        info!("Dry run mode - configuration is valid, exiting");
        print_fleet(&sim_config);
        return Ok(());
    }

    let stats = Simulation::new(sim_config)
        .run(shutdown_signal())
        .await
        .context("Simulation failed")?;

    info!(
        measurements = stats.measurements(),
        sync_events = stats.report.status.sync_events,
        duration_secs = stats.duration.as_secs_f64(),
        "Simulation completed"
    );
    stats.print_summary();

    info!("SyncStream simulation finished");
    Ok(())
}

fn load_config(args: &SimulateArgs) -> Result<SyncStreamConfig> {
    let Some(path) = &args.config else {
        info!("No configuration file given, using defaults");
        return Ok(SyncStreamConfig::default());
    };

    info!(config = %path.display(), "Loading configuration");
    if !path.exists() {
        return Err(CliError::config_not_found(path).into());
    }
    ConfigLoader::load_from_path(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Print the planned fleet for dry-run mode
fn print_fleet(sim: &SimulationConfig) {
    let fleet = plan_fleet(sim);
    println!("\n=== Simulated Fleet ===\n");
    println!(
        "Duration: {}s, seed {}, {} Hz audio",
        sim.duration.as_secs(),
        sim.seed,
        sim.sample_rate
    );
    println!("\nNodes ({}):", fleet.len());
    for plan in &fleet {
        println!(
            "  - {} ({:?}, group {}) base {:.1} ms, drift {:+.2} ms at {:+.4} ms/s",
            plan.profile.device_id,
            plan.profile.device_type,
            plan.profile.sync_group,
            plan.profile.base_latency_ms,
            plan.initial_drift_ms,
            plan.drift_rate_ms_per_s
        );
    }
    println!();
}
