#![allow(dead_code)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use guardian_vitals::estimator::{EstimateFlags, VitalSignEstimate};
use guardian_vitals::window::WindowConfig;
use guardian_vitals::{IQSample, PipelineConfig};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use std::f64::consts::PI;

pub fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap()
}

pub fn at(seconds: i64) -> DateTime<Utc> {
    start() + Duration::seconds(seconds)
}

pub fn config(sampling_rate: f64, window_seconds: f64) -> PipelineConfig {
    PipelineConfig {
        window: WindowConfig {
            sampling_rate,
            window_seconds,
            ..WindowConfig::default()
        },
        ..PipelineConfig::default()
    }
}

/// Unit-amplitude return whose phase is the sum of `(amplitude, hz)` tones.
pub fn chest_motion(tones: &[(f64, f64)], sampling_rate: f64, n: usize) -> Vec<IQSample> {
    (0..n)
        .map(|k| {
            let t = k as f64 / sampling_rate;
            let phi: f64 = tones
                .iter()
                .map(|&(amp, hz)| amp * (2.0 * PI * hz * t).sin())
                .sum();
            IQSample::new(phi.cos(), phi.sin())
        })
        .collect()
}

/// Circular complex Gaussian noise, reproducible per seed.
pub fn noise(seed: u64, n: usize) -> Vec<IQSample> {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0, 1.0).unwrap();
    (0..n)
        .map(|_| IQSample::new(normal.sample(&mut rng), normal.sample(&mut rng)))
        .collect()
}

pub fn as_pairs(samples: &[IQSample]) -> Vec<(f64, f64)> {
    samples.iter().map(|s| (s.i, s.q)).collect()
}

/// A reading with both rates set and the same confidence in both bands.
pub fn reading(seconds: i64, heart: f64, breathing: f64, confidence: f64) -> VitalSignEstimate {
    let mut e = VitalSignEstimate::empty(at(seconds), 3000, EstimateFlags::default());
    e.heart_rate_bpm = Some(heart);
    e.breathing_rate_bpm = Some(breathing);
    e.heart_confidence = confidence;
    e.breathing_confidence = confidence;
    e.confidence = confidence;
    e
}
