pub mod aggregator;
pub mod bands;
pub mod clutter;
pub mod config;
pub mod data_loading;
pub mod error;
pub mod estimator;
pub mod monitor;
pub mod output;
pub mod pipeline;
pub mod risk;
pub mod spectrum;
pub mod window;

use rustfft::num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use aggregator::{OccupantClass, VitalField, VitalSignAggregator, VitalSignHistory};
pub use config::PipelineConfig;
pub use error::ProcessingError;
pub use estimator::{EstimateFlags, SignalQuality, VitalSignEstimate};
pub use monitor::{IngestService, OccupancySource, OverflowPolicy, StaticOccupancy, VitalMonitor};
pub use pipeline::{ChannelPipeline, WindowReport};
pub use risk::{RiskCause, RiskEngine, RiskLevel, RiskState, RiskTransition};
pub use window::{AnalysisWindow, SampleWindow, TrailingPolicy, WindowMode};

/// One complex radar return (in-phase, quadrature).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct IQSample {
    pub i: f64,
    pub q: f64,
}

impl IQSample {
    pub const fn new(i: f64, q: f64) -> Self {
        Self { i, q }
    }

    pub fn to_complex(self) -> Complex64 {
        Complex64::new(self.i, self.q)
    }

    pub fn is_finite(&self) -> bool {
        self.i.is_finite() && self.q.is_finite()
    }
}

impl From<(f64, f64)> for IQSample {
    fn from((i, q): (f64, f64)) -> Self {
        Self { i, q }
    }
}

/// Identifies one monitored occupant / sensor channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(pub String);

impl From<&str> for ChannelId {
    fn from(id: &str) -> Self {
        ChannelId(id.to_string())
    }
}

impl From<String> for ChannelId {
    fn from(id: String) -> Self {
        ChannelId(id)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
