//! Simulation statistics.

use std::collections::BTreeMap;
use std::time::Duration;

use contracts::DeviceId;
use sync_engine::SyncReport;

/// Final state of one simulated node
#[derive(Debug, Clone)]
pub struct NodeOutcome {
    pub device_id: DeviceId,
    pub sync_group: String,
    /// Drift the node's clock has accumulated by the end of the run
    pub intrinsic_drift_ms: f64,
    /// Buffer offset the node ended up applying
    pub applied_offset_ms: f64,
    /// Lag the microphone hears with that offset applied
    pub residual_lag_ms: f64,
    pub measurements: u64,
    pub skipped: u64,
    pub offsets_applied: u64,
}

/// Statistics from a simulation run
#[derive(Debug, Clone)]
pub struct SimulationStats {
    pub duration: Duration,

    /// Stopped by a signal before the configured duration
    pub interrupted: bool,

    /// Engine state at shutdown
    pub report: SyncReport,

    pub nodes: Vec<NodeOutcome>,
}

impl SimulationStats {
    /// Max minus min residual lag per group, as heard acoustically
    pub fn residual_spreads(&self) -> BTreeMap<&str, f64> {
        let mut bounds: BTreeMap<&str, (f64, f64)> = BTreeMap::new();
        for node in &self.nodes {
            let entry = bounds
                .entry(node.sync_group.as_str())
                .or_insert((f64::INFINITY, f64::NEG_INFINITY));
            entry.0 = entry.0.min(node.residual_lag_ms);
            entry.1 = entry.1.max(node.residual_lag_ms);
        }
        bounds
            .into_iter()
            .map(|(group, (min, max))| (group, max - min))
            .collect()
    }

    pub fn measurements(&self) -> u64 {
        self.nodes.iter().map(|n| n.measurements).sum()
    }

    /// Print detailed summary
    pub fn print_summary(&self) {
        println!("\n╔══════════════════════════════════════════════════════════════╗");
        println!("║                   Simulation Statistics                      ║");
        println!("╚══════════════════════════════════════════════════════════════╝\n");

        let status = &self.report.status;
        println!("📊 Overview");
        println!("   ├─ Duration: {:.2}s", self.duration.as_secs_f64());
        if self.interrupted {
            println!("   ├─ Stopped early by signal");
        }
        println!("   ├─ Measurements: {}", self.measurements());
        println!(
            "   ├─ Devices: {} ({} online, {} degraded, {} offline)",
            status.device_count,
            status.online_devices,
            status.degraded_devices,
            status.offline_devices
        );
        println!("   ├─ Sync events: {}", status.sync_events);
        println!("   └─ Mean |drift|: {:.2} ms", status.average_drift_ms);

        println!("\n🔊 Nodes");
        for (i, node) in self.nodes.iter().enumerate() {
            let prefix = if i == self.nodes.len() - 1 { "└─" } else { "├─" };
            println!(
                "   {} {} [{}] drift {:+.2} ms, offset {:.2} ms, residual {:+.2} ms ({} measured, {} skipped, {} applied)",
                prefix,
                node.device_id,
                node.sync_group,
                node.intrinsic_drift_ms,
                node.applied_offset_ms,
                node.residual_lag_ms,
                node.measurements,
                node.skipped,
                node.offsets_applied
            );
        }

        let spreads = self.residual_spreads();
        println!("\n🎯 Groups");
        for (i, group) in self.report.groups.iter().enumerate() {
            let prefix = if i == self.report.groups.len() - 1 { "└─" } else { "├─" };
            let residual = spreads.get(group.group_id.as_str()).copied().unwrap_or(0.0);
            println!(
                "   {} {} ({} members): {} (spread {:.2} ms, residual {:.2} ms)",
                prefix,
                group.group_id,
                group.member_device_ids.len(),
                group.quality.as_str(),
                group.spread_ms,
                residual
            );
        }

        println!("\n📈 Sync Engine Metrics");
        for line in self.report.summary.to_string().lines().skip(1) {
            println!("   {}", line);
        }

        println!();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use observability::MetricsSummary;
    use sync_engine::SyncStatus;

    fn node(id: &str, group: &str, residual: f64) -> NodeOutcome {
        NodeOutcome {
            device_id: id.into(),
            sync_group: group.to_string(),
            intrinsic_drift_ms: 0.0,
            applied_offset_ms: 0.0,
            residual_lag_ms: residual,
            measurements: 4,
            skipped: 0,
            offsets_applied: 1,
        }
    }

    #[test]
    fn test_residual_spreads_per_group() {
        let stats = SimulationStats {
            duration: Duration::from_secs(1),
            interrupted: false,
            report: SyncReport {
                summary: MetricsSummary::default(),
                status: SyncStatus::default(),
                devices: Vec::new(),
                groups: Vec::new(),
            },
            nodes: vec![
                node("a", "den", 1.5),
                node("b", "den", -0.5),
                node("c", "patio", 3.0),
            ],
        };

        let spreads = stats.residual_spreads();
        assert_eq!(spreads["den"], 2.0);
        assert_eq!(spreads["patio"], 0.0);
        assert_eq!(stats.measurements(), 12);
    }
}
