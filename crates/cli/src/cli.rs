//! CLI argument definitions using clap.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// SyncStream - multi-room audio synchronization controller
#[derive(Parser, Debug)]
#[command(
    name = "syncstream",
    author,
    version,
    about = "Multi-room audio drift detection and offset control",
    long_about = "Keeps audio output nodes in different rooms sample-aligned.\n\n\
                  Nodes measure their playback drift against the reference stream \n\
                  by cross-correlation; the controller smooths the reports and \n\
                  sends back buffer offset corrections."
)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true, env = "SYNCSTREAM_VERBOSE")]
    pub verbose: u8,

    /// Suppress all output except warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    /// Log output format
    #[arg(
        long,
        value_enum,
        default_value = "pretty",
        global = true,
        env = "SYNCSTREAM_LOG_FORMAT"
    )]
    pub log_format: LogFormat,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Default log level when `RUST_LOG` is not set
    pub fn log_level(&self) -> &'static str {
        if self.quiet {
            return "warn";
        }
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a simulated fleet of nodes against a live sync engine
    Simulate(SimulateArgs),

    /// Validate configuration file without running
    Validate(ValidateArgs),

    /// Display configuration information
    Info(InfoArgs),
}

/// Arguments for the `simulate` command
#[derive(Parser, Debug, Clone)]
pub struct SimulateArgs {
    /// Path to configuration file (TOML or JSON); built-in defaults when omitted
    #[arg(short, long, env = "SYNCSTREAM_CONFIG")]
    pub config: Option<PathBuf>,

    /// Number of simulated nodes (ignored when the configuration lists devices)
    #[arg(short, long, default_value = "4", env = "SYNCSTREAM_NODES")]
    pub nodes: usize,

    /// Spread the generated nodes over this many sync groups
    #[arg(long, default_value = "1")]
    pub groups: usize,

    /// Simulation length in seconds
    #[arg(short, long, default_value = "60", env = "SYNCSTREAM_DURATION")]
    pub duration: u64,

    /// Seed for the reference signal and the fleet layout
    #[arg(long, default_value = "42")]
    pub seed: u64,

    /// Largest initial drift of a node, in ms (either sign)
    #[arg(long, default_value = "40.0")]
    pub max_drift: f64,

    /// Largest clock drift rate of a node, in ms per second (either sign)
    #[arg(long, default_value = "0.05")]
    pub drift_rate: f64,

    /// Microphone noise amplitude relative to the reference signal
    #[arg(long, default_value = "0.05")]
    pub noise: f32,

    /// Sample rate of the simulated audio
    #[arg(long, default_value = "16000")]
    pub sample_rate: u32,

    /// Override `sampling.base_interval_s` from configuration
    #[arg(long)]
    pub interval: Option<f64>,

    /// Seconds between progress reports (0 = disabled)
    #[arg(long, default_value = "10")]
    pub progress: u64,

    /// Validate configuration and print the fleet without running
    #[arg(long)]
    pub dry_run: bool,

    /// Metrics server port (0 = disabled)
    #[arg(long, default_value = "0", env = "SYNCSTREAM_METRICS_PORT")]
    pub metrics_port: u16,
}

/// Arguments for the `validate` command
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// Path to configuration file to validate
    #[arg(
        short,
        long,
        default_value = "syncstream.toml",
        env = "SYNCSTREAM_CONFIG"
    )]
    pub config: PathBuf,

    /// Output validation result as JSON
    #[arg(long)]
    pub json: bool,
}

/// Arguments for the `info` command
#[derive(Parser, Debug)]
pub struct InfoArgs {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "syncstream.toml",
        env = "SYNCSTREAM_CONFIG"
    )]
    pub config: PathBuf,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,

    /// Show every statically configured device
    #[arg(long)]
    pub devices: bool,

    /// Show controller and predictive correction settings
    #[arg(long)]
    pub controller: bool,
}

/// Log output format
#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum LogFormat {
    /// JSON structured logging
    Json,
    /// Human-readable pretty format
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
}

impl From<LogFormat> for observability::LogFormat {
    fn from(format: LogFormat) -> Self {
        match format {
            LogFormat::Json => Self::Json,
            LogFormat::Pretty => Self::Pretty,
            LogFormat::Compact => Self::Compact,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simulate_defaults() {
        let cli = Cli::try_parse_from(["syncstream", "simulate"]).unwrap();
        let Commands::Simulate(ref args) = cli.command else {
            panic!("expected simulate");
        };
        assert_eq!(args.nodes, 4);
        assert_eq!(args.duration, 60);
        assert_eq!(args.sample_rate, 16_000);
        assert!(args.config.is_none());
        assert_eq!(cli.log_level(), "info");
    }

    #[test]
    fn test_verbosity_levels() {
        let cli = Cli::try_parse_from(["syncstream", "-vv", "info"]).unwrap();
        assert_eq!(cli.log_level(), "trace");

        let cli = Cli::try_parse_from(["syncstream", "-q", "validate"]).unwrap();
        assert_eq!(cli.log_level(), "warn");
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["syncstream", "-q", "-v", "info"]).is_err());
    }
}
