use crate::aggregator::AggregatorConfig;
use crate::bands::BandConfig;
use crate::clutter::ClutterConfig;
use crate::error::{ProcessingError, Result};
use crate::estimator::EstimatorConfig;
use crate::monitor::{OverflowPolicy, QueueConfig};
use crate::risk::RiskConfig;
use crate::window::{TrailingPolicy, WindowConfig, WindowMode};
use anyhow::Context;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Settings for every stage of a channel pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub window: WindowConfig,
    pub clutter: ClutterConfig,
    pub bands: BandConfig,
    pub estimator: EstimatorConfig,
    pub aggregator: AggregatorConfig,
    pub risk: RiskConfig,
    pub queue: QueueConfig,
}

impl PipelineConfig {
    /// Read a JSON file; missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: PipelineConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid configuration in {}", path.display()))?;
        Ok(config)
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        self.window.validate()?;
        let rate = self.window.sampling_rate;
        self.clutter.validate(rate)?;
        self.bands.validate(rate)?;
        self.estimator.validate()?;
        self.aggregator.validate()?;
        self.risk.validate()?;
        self.queue.validate()?;

        let needed = self.bands.min_signal_len();
        if self.window.window_len() < needed {
            return Err(ProcessingError::config(format!(
                "window of {} samples is too short for order-{} band filters (need {})",
                self.window.window_len(),
                self.bands.filter_order,
                needed
            )));
        }
        // the respiratory band should hold at least one full cycle of its lowest rate
        if self.window.window_seconds * self.bands.respiratory.low_hz < 1.0 {
            log::warn!(
                "{} s window cannot resolve {} Hz breathing",
                self.window.window_seconds,
                self.bands.respiratory.low_hz
            );
        }
        Ok(())
    }
}

impl FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "reject" | "reject-new" => Ok(OverflowPolicy::RejectNew),
            "drop-oldest" => Ok(OverflowPolicy::DropOldest),
            _ => Err(format!(
                "Invalid overflow policy: {}. Use reject-new or drop-oldest",
                s
            )),
        }
    }
}

/// Replay radar IQ captures through the vital-sign and risk pipeline
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Capture file (.json or .csv) or directory of captures
    #[arg(help = "Capture file (.json or .csv) or directory of captures")]
    pub input_path: PathBuf,

    /// JSON pipeline configuration; flags below override it
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Sampling rate in Hz, for captures that do not record one
    #[arg(long, env = "GUARDIAN_SAMPLING_RATE")]
    pub sampling_rate: Option<f64>,

    /// Analysis window length in seconds
    #[arg(long)]
    pub window_seconds: Option<f64>,

    /// Sliding window overlap (0.0 to 1.0); tumbling windows when absent
    #[arg(long)]
    pub overlap: Option<f64>,

    /// Zero-pad and analyse the trailing short window instead of dropping it
    #[arg(long)]
    pub zero_pad: bool,

    /// Treat the cabin as occupied
    #[arg(long)]
    pub occupied: bool,

    /// Minutes the occupant had already been left alone when the capture starts
    #[arg(long, default_value = "0.0")]
    pub unattended_minutes: f64,

    /// Cabin temperature in degrees Celsius
    #[arg(long)]
    pub cabin_temp: Option<f64>,

    /// Samples submitted per call, like a live sensor feed
    #[arg(long, default_value = "100")]
    pub batch_size: usize,

    /// Queue overflow policy for --queued replay (reject-new or drop-oldest)
    #[arg(long)]
    pub overflow: Option<OverflowPolicy>,

    /// Replay through the queued ingestion service instead of the direct API
    #[arg(long)]
    pub queued: bool,

    /// Channel id used when replaying a single capture
    #[arg(long, default_value = "cabin")]
    pub channel: String,

    /// CSV output file prefix (e.g. /path/to/output/prefix)
    #[arg(long)]
    pub csv_output: Option<String>,

    /// Print the effective configuration as JSON and exit
    #[arg(long)]
    pub print_config: bool,
}

impl Args {
    /// Base configuration with command-line overrides applied.
    pub fn pipeline_config(&self) -> anyhow::Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_json_file(path)?,
            None => PipelineConfig::default(),
        };
        if let Some(rate) = self.sampling_rate {
            config.window.sampling_rate = rate;
        }
        if let Some(seconds) = self.window_seconds {
            config.window.window_seconds = seconds;
        }
        if let Some(overlap) = self.overlap {
            config.window.mode = WindowMode::Sliding { overlap };
        }
        if self.zero_pad {
            config.window.trailing = TrailingPolicy::ZeroPad;
        }
        if let Some(policy) = self.overflow {
            config.queue.overflow = policy;
        }
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}
