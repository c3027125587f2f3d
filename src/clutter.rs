//! Static clutter and DC removal, phase extraction and motion-artifact scoring.
//!
//! Turns an [`AnalysisWindow`] of IQ samples into a real-valued body-motion
//! signal of the same length, or a low-energy marker when the window carries
//! nothing worth analysing.

use crate::bands::filtfilt;
use crate::error::{ProcessingError, Result};
use crate::window::AnalysisWindow;
use chrono::{DateTime, Utc};
use log::{debug, trace};
use rustfft::num_complex::Complex64;
use sci_rs::signal::filter::design::Sos;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// How the static reflection is estimated in the IQ domain.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackgroundMode {
    Off,
    /// Subtract the complex mean of each window.
    WindowMean,
    /// Subtract a background estimate carried across windows,
    /// updated as `bg = (1 - alpha) * bg + alpha * window_mean`.
    Exponential { alpha: f64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClutterConfig {
    pub background: BackgroundMode,
    /// Difference the unwrapped phase (sample-to-sample displacement)
    pub phase_differencing: bool,
    /// Remove a linear trend instead of just the mean
    pub detrend: bool,
    /// RMS amplitude below which the window is reported as low energy
    pub min_energy: f64,
    /// Centre of an optional interference notch (Hz)
    pub notch_hz: Option<f64>,
    pub notch_q: f64,
}

impl Default for ClutterConfig {
    fn default() -> Self {
        Self {
            background: BackgroundMode::Off,
            phase_differencing: true,
            detrend: true,
            min_energy: 1e-6,
            notch_hz: None,
            notch_q: 30.0,
        }
    }
}

impl ClutterConfig {
    pub fn validate(&self, sampling_rate: f64) -> Result<()> {
        if let BackgroundMode::Exponential { alpha } = self.background {
            if !(alpha > 0.0 && alpha <= 1.0) {
                return Err(ProcessingError::config(format!(
                    "background alpha must be in (0, 1], got {}",
                    alpha
                )));
            }
        }
        if !self.min_energy.is_finite() || self.min_energy < 0.0 {
            return Err(ProcessingError::config(format!(
                "min_energy must be a non-negative number, got {}",
                self.min_energy
            )));
        }
        if let Some(freq) = self.notch_hz {
            if !(freq > 0.0 && freq < sampling_rate / 2.0) {
                return Err(ProcessingError::config(format!(
                    "notch at {} Hz is outside (0, {}) Hz",
                    freq,
                    sampling_rate / 2.0
                )));
            }
            if !(self.notch_q > 0.0) {
                return Err(ProcessingError::config("notch_q must be positive"));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MotionSeverity {
    Low,
    Medium,
    High,
}

/// Gross body movement within a window, scored from amplitude variation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionReport {
    /// Mean absolute sample-to-sample change of the max-normalised amplitude
    pub movement_index: f64,
    pub severity: MotionSeverity,
}

impl MotionReport {
    fn from_index(movement_index: f64) -> Self {
        let severity = if movement_index > 0.2 {
            MotionSeverity::High
        } else if movement_index > 0.1 {
            MotionSeverity::Medium
        } else {
            MotionSeverity::Low
        };
        Self {
            movement_index,
            severity,
        }
    }

    pub fn has_artifact(&self) -> bool {
        self.severity != MotionSeverity::Low
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MotionPayload {
    Signal(Vec<f64>),
    /// The window was below the minimum energy threshold.
    LowEnergy { rms: f64 },
}

/// Output of the suppressor; same length and time axis as the input window.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionWindow {
    start_timestamp: DateTime<Utc>,
    sampling_rate: f64,
    len: usize,
    valid_len: usize,
    motion: MotionReport,
    payload: MotionPayload,
}

impl MotionWindow {
    pub fn signal(&self) -> Option<&[f64]> {
        match &self.payload {
            MotionPayload::Signal(samples) => Some(samples),
            MotionPayload::LowEnergy { .. } => None,
        }
    }

    pub fn payload(&self) -> &MotionPayload {
        &self.payload
    }

    pub fn is_low_energy(&self) -> bool {
        matches!(self.payload, MotionPayload::LowEnergy { .. })
    }

    pub fn is_partial(&self) -> bool {
        self.valid_len < self.len
    }

    pub fn start_timestamp(&self) -> DateTime<Utc> {
        self.start_timestamp
    }

    pub fn sampling_rate(&self) -> f64 {
        self.sampling_rate
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn valid_len(&self) -> usize {
        self.valid_len
    }

    pub fn motion(&self) -> MotionReport {
        self.motion
    }
}

/// Per-channel clutter suppressor. Owns the channel's background estimate.
pub struct ClutterSuppressor {
    config: ClutterConfig,
    sampling_rate: f64,
    notch: Option<Vec<Sos<f64>>>,
    background: Option<Complex64>,
}

impl ClutterSuppressor {
    pub fn new(config: ClutterConfig, sampling_rate: f64) -> Result<Self> {
        config.validate(sampling_rate)?;
        let notch = match config.notch_hz {
            Some(freq) => Some(vec![notch_section(freq, config.notch_q, sampling_rate)?]),
            None => None,
        };
        Ok(Self {
            config,
            sampling_rate,
            notch,
            background: None,
        })
    }

    /// Current carried-over background estimate (exponential mode only).
    pub fn background(&self) -> Option<Complex64> {
        self.background
    }

    pub fn reset(&mut self) {
        self.background = None;
    }

    pub fn suppress(&mut self, window: &AnalysisWindow) -> MotionWindow {
        let valid = window.valid_samples();
        let (mut iq, scale) = normalise(&hold_non_finite(valid));
        let motion = motion_report(&iq);

        if let Some(clutter) = self.clutter_estimate(&iq, scale) {
            for z in iq.iter_mut() {
                *z -= clutter;
            }
        }

        let rms = scale * rms_amplitude(&iq);
        let payload = if !(rms >= self.config.min_energy) || valid.is_empty() {
            debug!(
                "Window at {} below energy floor (rms {:.3e} < {:.3e})",
                window.start_timestamp(),
                rms,
                self.config.min_energy
            );
            MotionPayload::LowEnergy { rms }
        } else {
            MotionPayload::Signal(self.motion_signal(&iq, window.len()))
        };

        trace!(
            "Suppressed window at {}: movement index {:.3}",
            window.start_timestamp(),
            motion.movement_index
        );
        MotionWindow {
            start_timestamp: window.start_timestamp(),
            sampling_rate: window.sampling_rate(),
            len: window.len(),
            valid_len: window.valid_len(),
            motion,
            payload,
        }
    }

    /// Static component to subtract, in the normalised units of `iq`.
    fn clutter_estimate(&mut self, iq: &[Complex64], scale: f64) -> Option<Complex64> {
        match self.config.background {
            BackgroundMode::Off => None,
            BackgroundMode::WindowMean => Some(complex_mean(iq)),
            BackgroundMode::Exponential { alpha } => {
                // background is kept in absolute units so windows with different scales mix correctly
                let mean = complex_mean(iq) * scale;
                let updated = match self.background {
                    Some(bg) => bg * (1.0 - alpha) + mean * alpha,
                    None => mean,
                };
                if updated.re.is_finite() && updated.im.is_finite() {
                    self.background = Some(updated);
                }
                self.background
                    .filter(|_| scale > 0.0)
                    .map(|bg| bg / scale)
            }
        }
    }

    fn motion_signal(&self, iq: &[Complex64], window_len: usize) -> Vec<f64> {
        let wrapped: Vec<f64> = iq.iter().map(|z| z.im.atan2(z.re)).collect();
        let mut signal = unwrap_phase(&wrapped);

        if self.config.phase_differencing {
            signal = difference(&signal);
        }

        if self.config.detrend {
            detrend_linear(&mut signal);
        } else {
            subtract_mean(&mut signal);
        }

        if let Some(notch) = &self.notch {
            if let Some(filtered) = filtfilt(&signal, notch) {
                signal = filtered;
            }
        }

        for x in signal.iter_mut() {
            if !x.is_finite() {
                *x = 0.0;
            }
        }
        signal.resize(window_len, 0.0);
        signal
    }

    pub fn sampling_rate(&self) -> f64 {
        self.sampling_rate
    }
}

/// Replace non-finite samples with the previous finite one (zero at the start).
fn hold_non_finite(samples: &[crate::IQSample]) -> Vec<Complex64> {
    let mut last = Complex64::new(0.0, 0.0);
    samples
        .iter()
        .map(|s| {
            if s.is_finite() {
                last = s.to_complex();
            }
            last
        })
        .collect()
}

/// Scale so the largest component is 1. Returns the samples and the scale.
fn normalise(iq: &[Complex64]) -> (Vec<Complex64>, f64) {
    let scale = iq
        .iter()
        .map(|z| z.re.abs().max(z.im.abs()))
        .fold(0.0_f64, f64::max);
    if scale == 0.0 {
        return (iq.to_vec(), 0.0);
    }
    (iq.iter().map(|z| *z / scale).collect(), scale)
}

fn complex_mean(iq: &[Complex64]) -> Complex64 {
    if iq.is_empty() {
        return Complex64::new(0.0, 0.0);
    }
    iq.iter().sum::<Complex64>() / iq.len() as f64
}

fn rms_amplitude(iq: &[Complex64]) -> f64 {
    if iq.is_empty() {
        return 0.0;
    }
    (iq.iter().map(|z| z.norm_sqr()).sum::<f64>() / iq.len() as f64).sqrt()
}

fn motion_report(iq: &[Complex64]) -> MotionReport {
    let amplitude: Vec<f64> = iq.iter().map(|z| z.norm()).collect();
    let peak = amplitude.iter().cloned().fold(0.0_f64, f64::max);
    if peak == 0.0 || amplitude.len() < 2 {
        return MotionReport::from_index(0.0);
    }
    let index = amplitude
        .windows(2)
        .map(|w| ((w[1] - w[0]) / peak).abs())
        .sum::<f64>()
        / (amplitude.len() - 1) as f64;
    MotionReport::from_index(index)
}

/// Remove 2*pi jumps between consecutive phase samples.
pub fn unwrap_phase(wrapped: &[f64]) -> Vec<f64> {
    let mut out = Vec::with_capacity(wrapped.len());
    let Some(&first) = wrapped.first() else {
        return out;
    };
    out.push(first);

    let mut correction = 0.0;
    for w in wrapped.windows(2) {
        let dd = w[1] - w[0];
        let mut ddmod = (dd + PI).rem_euclid(2.0 * PI) - PI;
        if ddmod == -PI && dd > 0.0 {
            ddmod = PI;
        }
        if dd.abs() >= PI {
            correction += ddmod - dd;
        }
        out.push(w[1] + correction);
    }
    out
}

/// First difference, padded at the front so the length is unchanged.
fn difference(signal: &[f64]) -> Vec<f64> {
    if signal.len() < 2 {
        return vec![0.0; signal.len()];
    }
    let mut out = Vec::with_capacity(signal.len());
    out.push(signal[1] - signal[0]);
    out.extend(signal.windows(2).map(|w| w[1] - w[0]));
    out
}

fn subtract_mean(signal: &mut [f64]) {
    if signal.is_empty() {
        return;
    }
    let mean = signal.iter().sum::<f64>() / signal.len() as f64;
    for x in signal.iter_mut() {
        *x -= mean;
    }
}

/// Least-squares linear detrend in place.
fn detrend_linear(signal: &mut [f64]) {
    let n = signal.len();
    if n < 2 {
        subtract_mean(signal);
        return;
    }
    let x_mean = (n - 1) as f64 / 2.0;
    let y_mean = signal.iter().sum::<f64>() / n as f64;
    let (num, den) = signal
        .iter()
        .enumerate()
        .fold((0.0, 0.0), |(num, den), (i, &y)| {
            let dx = i as f64 - x_mean;
            (num + dx * (y - y_mean), den + dx * dx)
        });
    let slope = num / den;
    for (i, y) in signal.iter_mut().enumerate() {
        *y -= y_mean + slope * (i as f64 - x_mean);
    }
}

/// Design a notch digital filter as a single second-order section.
///
/// - w0: frequency to remove, in the same units as fs
/// - q: quality factor, Q = w0 / bandwidth
fn notch_section(w0: f64, q: f64, fs: f64) -> Result<Sos<f64>> {
    // Normalise to Nyquist
    let w0 = 2.0 * w0 / fs;
    if !(w0 > 0.0 && w0 < 1.0) {
        return Err(ProcessingError::config(
            "notch frequency must satisfy 0 < w0 < fs/2",
        ));
    }

    let bw = w0 / q * PI;
    let w0 = w0 * PI;

    let beta = (bw / 2.0).tan();
    let gain = 1.0 / (1.0 + beta);

    let b = [gain, -2.0 * w0.cos() * gain, gain];
    let a = [1.0, -2.0 * gain * w0.cos(), 2.0 * gain - 1.0];
    Ok(Sos::new(b, a))
}
