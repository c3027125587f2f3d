use crate::aggregator::{OccupantAssessment, VitalField, VitalSignAggregator};
use crate::bands::BandSeparator;
use crate::clutter::ClutterSuppressor;
use crate::config::PipelineConfig;
use crate::error::Result;
use crate::estimator::{RateEstimator, VitalSignEstimate};
use crate::risk::{RiskEngine, RiskInputs, RiskState, RiskTransition};
use crate::window::{AnalysisWindow, SampleWindow};
use crate::{ChannelId, IQSample};
use chrono::{DateTime, Utc};
use log::debug;
use serde::Serialize;
use std::time::Duration;

/// What the collaborator reports about the cabin at submission time.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CabinContext {
    pub occupied: bool,
    pub unattended: Duration,
    pub cabin_temperature: Option<f64>,
}

/// Result of analysing one window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WindowReport {
    pub channel: ChannelId,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub estimate: VitalSignEstimate,
    pub aggregated: Option<VitalSignEstimate>,
    pub occupant: OccupantAssessment,
    pub risk: RiskState,
    pub transitions: Vec<RiskTransition>,
}

/// All stateful stages of one channel, run in order on each completed window.
pub struct ChannelPipeline {
    channel: ChannelId,
    window: SampleWindow,
    suppressor: ClutterSuppressor,
    separator: BandSeparator,
    estimator: RateEstimator,
    aggregator: VitalSignAggregator,
    risk: RiskEngine,
}

impl ChannelPipeline {
    pub fn new(
        channel: ChannelId,
        config: &PipelineConfig,
        stream_start: DateTime<Utc>,
    ) -> Result<Self> {
        config.validate()?;
        let rate = config.window.sampling_rate;
        debug!("Creating pipeline for channel {} at {} Hz", channel, rate);
        Ok(Self {
            window: SampleWindow::new(config.window.clone(), stream_start)?,
            suppressor: ClutterSuppressor::new(config.clutter.clone(), rate)?,
            separator: BandSeparator::new(config.bands.clone(), rate)?,
            estimator: RateEstimator::new(config.estimator.clone(), config.bands.clone(), rate)?,
            aggregator: VitalSignAggregator::new(config.aggregator.clone())?,
            risk: RiskEngine::new(config.risk.clone(), stream_start)?,
            channel,
        })
    }

    /// Buffer a batch and analyse every window it completes, in order.
    ///
    /// Fails with `BufferOverflow` without consuming anything if the batch
    /// completes more windows than the backlog holds.
    pub fn push_samples(
        &mut self,
        samples: &[IQSample],
        cabin: &CabinContext,
    ) -> Result<Vec<WindowReport>> {
        self.window.push_batch(samples)?;
        let windows = self.window.drain_windows();
        Ok(windows
            .iter()
            .map(|window| self.process_window(window, cabin))
            .collect())
    }

    /// Record samples lost before reaching this pipeline.
    pub fn skip_samples(&mut self, count: u64) {
        self.window.skip(count);
    }

    /// Flush the trailing short window per the trailing policy.
    pub fn finish(&mut self, cabin: &CabinContext) -> Option<WindowReport> {
        let window = self.window.finish()?;
        Some(self.process_window(&window, cabin))
    }

    /// Per-window reading without touching the aggregator or risk engine.
    pub fn analyze(&mut self, window: &AnalysisWindow) -> VitalSignEstimate {
        let motion = self.suppressor.suppress(window);
        let separated = match motion.signal() {
            Some(signal) if !motion.is_partial() => {
                Some(self.separator.separate(signal, motion.valid_len()))
            }
            _ => None,
        };
        self.estimator.estimate(&motion, separated.as_ref())
    }

    pub fn process_window(&mut self, window: &AnalysisWindow, cabin: &CabinContext) -> WindowReport {
        let estimate = self.analyze(window);
        let aggregated = self.aggregator.push(estimate.clone());
        let breathing_trend = self.aggregator.trend(VitalField::BreathingRate);

        let transitions = self.risk.evaluate(&RiskInputs {
            estimate: &estimate,
            aggregated: aggregated.as_ref(),
            breathing_trend,
            occupied: cabin.occupied,
            unattended: cabin.unattended,
            cabin_temperature: cabin.cabin_temperature,
            now: window.end_timestamp(),
        });

        WindowReport {
            channel: self.channel.clone(),
            window_start: window.start_timestamp(),
            window_end: window.end_timestamp(),
            occupant: OccupantAssessment::from_heart_rate(
                aggregated.as_ref().and_then(|e| e.heart_rate_bpm),
            ),
            estimate,
            aggregated,
            risk: self.risk.state(),
            transitions,
        }
    }

    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub fn sampling_rate(&self) -> f64 {
        self.window.sampling_rate()
    }

    pub fn risk_state(&self) -> RiskState {
        self.risk.state()
    }

    pub fn risk_history(&self) -> Vec<RiskState> {
        self.risk.history()
    }

    pub fn transitions(&self) -> Vec<RiskTransition> {
        self.risk.transitions().copied().collect()
    }

    pub fn latest_estimate(&self) -> Option<VitalSignEstimate> {
        self.aggregator.latest()
    }

    pub fn window_len(&self) -> usize {
        self.window.window_len()
    }

    pub fn hop_len(&self) -> usize {
        self.window.hop_len()
    }

    pub fn samples_seen(&self) -> u64 {
        self.window.samples_seen()
    }
}
