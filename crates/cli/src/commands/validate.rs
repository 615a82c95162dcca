//! `validate` command implementation.

use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::info;

use contracts::SyncStreamConfig;

use crate::cli::ValidateArgs;

/// Fewer heartbeats than this per device timeout risks false offline transitions
const MIN_HEARTBEATS_PER_TIMEOUT: f64 = 3.0;

/// Validation result for JSON output
#[derive(Serialize)]
struct ValidationResult {
    valid: bool,
    config_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warnings: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    summary: Option<ConfigSummary>,
}

#[derive(Serialize)]
struct ConfigSummary {
    version: String,
    device_count: usize,
    group_count: usize,
    tolerance_ms: f64,
    predictive: bool,
}

/// Execute the `validate` command
pub fn run_validate(args: &ValidateArgs) -> Result<()> {
    info!(config = %args.config.display(), "Validating configuration");

    let result = validate_config(args);

    if args.json {
        let json = serde_json::to_string_pretty(&result)
            .context("Failed to serialize validation result")?;
        println!("{}", json);
    } else {
        print_validation_result(&result);
    }

    if result.valid {
        Ok(())
    } else {
        anyhow::bail!("Configuration validation failed")
    }
}

fn validate_config(args: &ValidateArgs) -> ValidationResult {
    let config_path = args.config.display().to_string();

    if !args.config.exists() {
        return ValidationResult {
            valid: false,
            config_path,
            error: Some(format!("File not found: {}", args.config.display())),
            warnings: None,
            summary: None,
        };
    }

    match config_loader::ConfigLoader::load_from_path(&args.config) {
        Ok(config) => {
            let warnings = collect_warnings(&config);
            ValidationResult {
                valid: true,
                config_path,
                error: None,
                warnings: if warnings.is_empty() {
                    None
                } else {
                    Some(warnings)
                },
                summary: Some(ConfigSummary {
                    version: format!("{:?}", config.version),
                    device_count: config.devices.len(),
                    group_count: group_ids(&config).len(),
                    tolerance_ms: config.controller.tolerance_ms,
                    predictive: config.controller.predictive.enabled,
                }),
            }
        }
        Err(e) => ValidationResult {
            valid: false,
            config_path,
            error: Some(e.to_string()),
            warnings: None,
            summary: None,
        },
    }
}

/// Declared groups plus groups referenced by static devices
fn group_ids(config: &SyncStreamConfig) -> BTreeSet<&str> {
    config
        .groups
        .iter()
        .map(|g| g.group_id.as_str())
        .chain(config.devices.iter().map(|d| d.sync_group.as_str()))
        .collect()
}

/// Collect configuration warnings (non-fatal issues)
fn collect_warnings(config: &SyncStreamConfig) -> Vec<String> {
    let mut warnings = Vec::new();

    if config.devices.is_empty() && !config.registry.auto_register {
        warnings.push(
            "No devices configured and auto_register is off - every node will be rejected"
                .to_string(),
        );
    }

    for group in &config.groups {
        if !config
            .devices
            .iter()
            .any(|d| d.sync_group == group.group_id)
        {
            warnings.push(format!(
                "Group '{}' has no configured devices",
                group.group_id
            ));
        }
    }

    let heartbeats =
        config.registry.device_timeout_s / config.sampling.heartbeat_interval_s.max(f64::EPSILON);
    if heartbeats < MIN_HEARTBEATS_PER_TIMEOUT {
        warnings.push(format!(
            "registry.device_timeout_s allows only {:.1} heartbeats - nodes may flap offline",
            heartbeats
        ));
    }

    // A lag larger than half the window cannot be measured reliably
    if config.detector.max_drift_ms > config.detector.window_s * 500.0 {
        warnings.push(format!(
            "detector.max_drift_ms ({}) exceeds half of detector.window_s",
            config.detector.max_drift_ms
        ));
    }

    if config.controller.step_clamp_ms() < config.controller.settle_ms {
        warnings.push("controller.max_step_ms is below settle_ms - corrections will never settle".to_string());
    }

    warnings
}

fn print_validation_result(result: &ValidationResult) {
    if result.valid {
        println!("✓ Configuration is valid: {}", result.config_path);

        if let Some(ref summary) = result.summary {
            println!("\n  Version: {}", summary.version);
            println!("  Devices: {}", summary.device_count);
            println!("  Groups: {}", summary.group_count);
            println!("  Tolerance: {} ms", summary.tolerance_ms);
            println!(
                "  Predictive correction: {}",
                if summary.predictive { "on" } else { "off" }
            );
        }

        if let Some(ref warnings) = result.warnings {
            println!("\n⚠ Warnings:");
            for warning in warnings {
                println!("  - {}", warning);
            }
        }
    } else {
        println!("✗ Configuration is invalid: {}", result.config_path);
        if let Some(ref error) = result.error {
            println!("\n  Error: {}", error);
        }
    }
}
