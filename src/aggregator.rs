//! Bounded history of per-window estimates with confidence-weighted smoothing,
//! per-field trends and occupant classification.

use crate::error::{ProcessingError, Result};
use crate::estimator::{EstimateFlags, VitalSignEstimate};
use log::trace;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VitalField {
    HeartRate,
    BreathingRate,
}

impl VitalField {
    fn rate(self, estimate: &VitalSignEstimate) -> Option<f64> {
        match self {
            VitalField::HeartRate => estimate.heart_rate_bpm,
            VitalField::BreathingRate => estimate.breathing_rate_bpm,
        }
    }

    fn confidence(self, estimate: &VitalSignEstimate) -> f64 {
        match self {
            VitalField::HeartRate => estimate.heart_confidence,
            VitalField::BreathingRate => estimate.breathing_confidence,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OccupantClass {
    Child,
    Adult,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OccupantAssessment {
    pub class: OccupantClass,
    pub confidence: f64,
}

impl OccupantAssessment {
    /// Children run faster heart rates; 100 bpm separates the two classes.
    pub fn from_heart_rate(heart_rate_bpm: Option<f64>) -> Self {
        match heart_rate_bpm {
            Some(hr) if hr > 100.0 => Self {
                class: OccupantClass::Child,
                confidence: ((hr - 100.0) / 20.0).min(1.0),
            },
            Some(hr) => Self {
                class: OccupantClass::Adult,
                confidence: ((100.0 - hr) / 40.0).clamp(0.0, 1.0),
            },
            None => Self {
                class: OccupantClass::Unknown,
                confidence: 0.0,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregatorConfig {
    /// Estimates retained, oldest evicted first
    pub history_len: usize,
    /// Valid estimates averaged into the smoothed reading
    pub smoothing_len: usize,
    /// Estimates below this confidence are kept but not used
    pub min_confidence: f64,
    /// Consecutive invalid estimates after which the smoothed reading lapses
    pub stale_after: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            history_len: 10,
            smoothing_len: 5,
            min_confidence: 0.5,
            stale_after: 3,
        }
    }
}

impl AggregatorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.history_len == 0 || self.smoothing_len == 0 || self.stale_after == 0 {
            return Err(ProcessingError::config(
                "history_len, smoothing_len and stale_after must be at least 1",
            ));
        }
        if self.smoothing_len > self.history_len {
            return Err(ProcessingError::config(format!(
                "smoothing_len {} exceeds history_len {}",
                self.smoothing_len, self.history_len
            )));
        }
        if !(0.0..=1.0).contains(&self.min_confidence) {
            return Err(ProcessingError::config("min_confidence must be in [0, 1]"));
        }
        Ok(())
    }
}

/// Last N estimates in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct VitalSignHistory {
    entries: VecDeque<VitalSignEstimate>,
    capacity: usize,
}

impl VitalSignHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, estimate: VitalSignEstimate) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(estimate);
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &VitalSignEstimate> {
        self.entries.iter()
    }

    pub fn newest(&self) -> Option<&VitalSignEstimate> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

pub struct VitalSignAggregator {
    config: AggregatorConfig,
    history: VitalSignHistory,
}

impl VitalSignAggregator {
    pub fn new(config: AggregatorConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            history: VitalSignHistory::new(config.history_len),
            config,
        })
    }

    /// Record an estimate and return the updated smoothed reading.
    pub fn push(&mut self, estimate: VitalSignEstimate) -> Option<VitalSignEstimate> {
        if !self.is_valid(&estimate) {
            trace!(
                "Estimate at {} kept for audit only (confidence {:.2})",
                estimate.timestamp,
                estimate.confidence
            );
        }
        self.history.push(estimate);
        self.latest()
    }

    pub fn is_valid(&self, estimate: &VitalSignEstimate) -> bool {
        estimate.confidence >= self.config.min_confidence && estimate.has_rates()
    }

    fn valid(&self) -> impl DoubleEndedIterator<Item = &VitalSignEstimate> {
        self.history.iter().filter(|e| self.is_valid(e))
    }

    /// Invalid estimates at the newest end of the history.
    pub fn invalid_run(&self) -> usize {
        self.history
            .iter()
            .rev()
            .take_while(|e| !self.is_valid(e))
            .count()
    }

    /// Confidence-weighted average of the most recent valid estimates.
    /// `None` while no valid estimate is retained, or once the newest
    /// `stale_after` estimates are all invalid.
    pub fn latest(&self) -> Option<VitalSignEstimate> {
        if self.invalid_run() >= self.config.stale_after {
            return None;
        }
        let recent: Vec<&VitalSignEstimate> =
            self.valid().rev().take(self.config.smoothing_len).collect();
        let newest = *recent.first()?;

        let weighted = |field: VitalField| {
            let (sum, weight) = recent
                .iter()
                .filter_map(|e| field.rate(e).map(|rate| (rate, field.confidence(e))))
                .filter(|&(_, w)| w > 0.0)
                .fold((0.0, 0.0), |(s, w), (rate, c)| (s + rate * c, w + c));
            (weight > 0.0).then(|| sum / weight)
        };
        let mean_confidence = |field: VitalField| {
            recent.iter().map(|e| field.confidence(e)).sum::<f64>() / recent.len() as f64
        };

        let heart_confidence = mean_confidence(VitalField::HeartRate);
        let breathing_confidence = mean_confidence(VitalField::BreathingRate);
        Some(VitalSignEstimate {
            heart_rate_bpm: weighted(VitalField::HeartRate),
            breathing_rate_bpm: weighted(VitalField::BreathingRate),
            confidence: heart_confidence.max(breathing_confidence),
            heart_confidence,
            breathing_confidence,
            timestamp: newest.timestamp,
            samples_processed: recent.iter().map(|e| e.samples_processed).sum(),
            flags: EstimateFlags::default(),
            quality: newest.quality,
        })
    }

    /// Least-squares slope of `field` in bpm per minute over the valid
    /// retained estimates. Needs at least two points spread over time.
    pub fn trend(&self, field: VitalField) -> Option<f64> {
        let series: Vec<_> = self
            .valid()
            .filter_map(|e| field.rate(e).map(|rate| (e.timestamp, rate)))
            .collect();
        let first = series.first()?.0;
        let points: Vec<(f64, f64)> = series
            .iter()
            .map(|&(t, rate)| ((t - first).num_milliseconds() as f64 / 60_000.0, rate))
            .collect();
        if points.len() < 2 {
            return None;
        }

        let n = points.len() as f64;
        let x_mean = points.iter().map(|p| p.0).sum::<f64>() / n;
        let y_mean = points.iter().map(|p| p.1).sum::<f64>() / n;
        let (num, den) = points.iter().fold((0.0, 0.0), |(num, den), &(x, y)| {
            (num + (x - x_mean) * (y - y_mean), den + (x - x_mean).powi(2))
        });
        (den > 0.0).then(|| num / den)
    }

    pub fn occupant(&self) -> OccupantAssessment {
        OccupantAssessment::from_heart_rate(self.latest().and_then(|e| e.heart_rate_bpm))
    }

    pub fn history(&self) -> &VitalSignHistory {
        &self.history
    }

    pub fn config(&self) -> &AggregatorConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{DateTime, Duration, TimeZone, Utc};

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap() + Duration::seconds(seconds)
    }

    fn reading(seconds: i64, hr: f64, hc: f64, br: f64, bc: f64) -> VitalSignEstimate {
        let mut e = VitalSignEstimate::empty(at(seconds), 3000, EstimateFlags::default());
        e.heart_rate_bpm = Some(hr);
        e.breathing_rate_bpm = Some(br);
        e.heart_confidence = hc;
        e.breathing_confidence = bc;
        e.confidence = hc.max(bc);
        e
    }

    fn aggregator() -> VitalSignAggregator {
        VitalSignAggregator::new(AggregatorConfig::default()).unwrap()
    }

    #[test]
    fn history_evicts_oldest() {
        let mut agg = aggregator();
        for k in 0..15 {
            agg.push(reading(k * 30, 70.0 + k as f64, 0.9, 15.0, 0.9));
        }
        assert_eq!(agg.history().len(), 10);
        assert_eq!(agg.history().iter().next().unwrap().heart_rate_bpm, Some(75.0));
    }

    #[test]
    fn no_valid_estimate_means_no_reading() {
        let mut agg = aggregator();
        assert!(agg.latest().is_none());
        assert!(agg.push(reading(0, 70.0, 0.1, 15.0, 0.2)).is_none());
        assert_eq!(agg.history().len(), 1);
    }

    #[test]
    fn average_is_confidence_weighted() {
        let mut agg = aggregator();
        agg.push(reading(0, 60.0, 0.9, 12.0, 0.6));
        let smoothed = agg.push(reading(30, 90.0, 0.6, 18.0, 0.9)).unwrap();
        assert_relative_eq!(smoothed.heart_rate_bpm.unwrap(), (60.0 * 0.9 + 90.0 * 0.6) / 1.5);
        assert_relative_eq!(smoothed.breathing_rate_bpm.unwrap(), (12.0 * 0.6 + 18.0 * 0.9) / 1.5);
        assert_eq!(smoothed.timestamp, at(30));
    }

    #[test]
    fn low_confidence_estimates_do_not_move_the_average() {
        let mut agg = aggregator();
        agg.push(reading(0, 72.0, 0.9, 14.0, 0.9));
        let smoothed = agg.push(reading(30, 150.0, 0.2, 40.0, 0.1)).unwrap();
        assert_relative_eq!(smoothed.heart_rate_bpm.unwrap(), 72.0);
        assert_eq!(smoothed.timestamp, at(0));
    }

    #[test]
    fn reading_lapses_after_a_run_of_invalid_estimates() {
        let mut agg = aggregator();
        for k in 0..4 {
            agg.push(reading(k * 30, 78.0, 0.9, 16.0, 0.9));
        }
        assert!(agg.push(reading(120, 0.0, 0.0, 0.0, 0.0)).is_some());
        assert!(agg.push(reading(150, 0.0, 0.0, 0.0, 0.0)).is_some());
        assert!(agg.push(reading(180, 0.0, 0.0, 0.0, 0.0)).is_none());
        assert_eq!(agg.invalid_run(), 3);
        assert_eq!(agg.occupant().class, OccupantClass::Unknown);

        // one valid estimate brings the older ones back into the average
        let smoothed = agg.push(reading(210, 80.0, 0.9, 16.0, 0.9)).unwrap();
        assert_eq!(smoothed.timestamp, at(210));
        assert_eq!(agg.invalid_run(), 0);
    }

    #[test]
    fn smoothing_uses_only_recent_estimates() {
        let mut agg = aggregator();
        for k in 0..5 {
            agg.push(reading(k * 30, 60.0, 0.9, 15.0, 0.9));
        }
        for k in 5..10 {
            agg.push(reading(k * 30, 80.0, 0.9, 15.0, 0.9));
        }
        assert_relative_eq!(agg.latest().unwrap().heart_rate_bpm.unwrap(), 80.0);
    }

    #[test]
    fn trend_reports_bpm_per_minute() {
        let mut agg = aggregator();
        for k in 0..4 {
            // one window every 30 s, rising 1 bpm per window
            agg.push(reading(k * 30, 70.0 + k as f64, 0.9, 20.0 - k as f64, 0.9));
        }
        assert_relative_eq!(agg.trend(VitalField::HeartRate).unwrap(), 2.0, epsilon = 1e-9);
        assert_relative_eq!(
            agg.trend(VitalField::BreathingRate).unwrap(),
            -2.0,
            epsilon = 1e-9
        );
    }

    #[test]
    fn trend_needs_two_points() {
        let mut agg = aggregator();
        agg.push(reading(0, 70.0, 0.9, 15.0, 0.9));
        assert!(agg.trend(VitalField::HeartRate).is_none());
    }

    #[test]
    fn occupant_classification_follows_heart_rate() {
        let child = OccupantAssessment::from_heart_rate(Some(130.0));
        assert_eq!(child.class, OccupantClass::Child);
        assert_relative_eq!(child.confidence, 1.0);

        let adult = OccupantAssessment::from_heart_rate(Some(80.0));
        assert_eq!(adult.class, OccupantClass::Adult);
        assert_relative_eq!(adult.confidence, 0.5);

        assert_eq!(
            OccupantAssessment::from_heart_rate(None).class,
            OccupantClass::Unknown
        );
    }

    #[test]
    fn smoothing_longer_than_history_is_rejected() {
        let config = AggregatorConfig {
            history_len: 3,
            smoothing_len: 5,
            ..AggregatorConfig::default()
        };
        assert!(VitalSignAggregator::new(config).is_err());
    }
}
