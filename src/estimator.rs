use crate::bands::{Band, BandConfig, SeparatedBands};
use crate::clutter::{MotionSeverity, MotionWindow};
use crate::error::{ProcessingError, Result};
use crate::spectrum::PowerSpectrum;
use chrono::{DateTime, Utc};
use log::{debug, trace};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Minimum FFT length; signals are zero padded up to it
    pub fft_size: usize,
    /// Peaks within this fraction of the strongest one count as a tie
    pub tie_tolerance: f64,
    /// Half width, in unpadded bins, of the region counted as peak energy
    pub peak_halfwidth_bins: f64,
    /// Band share of the motion energy below which the band is treated as empty
    pub min_band_share: f64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            fft_size: 4096,
            tie_tolerance: 0.05,
            peak_halfwidth_bins: 2.0,
            min_band_share: 1e-4,
        }
    }
}

impl EstimatorConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.fft_size.is_power_of_two() {
            return Err(ProcessingError::config(format!(
                "fft_size must be a power of two, got {}",
                self.fft_size
            )));
        }
        if !(0.0..1.0).contains(&self.tie_tolerance) {
            return Err(ProcessingError::config("tie_tolerance must be in [0, 1)"));
        }
        if !(self.peak_halfwidth_bins > 0.0) {
            return Err(ProcessingError::config("peak_halfwidth_bins must be positive"));
        }
        if !(0.0..1.0).contains(&self.min_band_share) {
            return Err(ProcessingError::config("min_band_share must be in [0, 1)"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EstimateFlags {
    /// The window was zero padded
    pub partial: bool,
    /// The window carried too little energy to analyse
    pub low_energy: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SignalQuality {
    pub breathing_snr_db: f64,
    pub heart_snr_db: f64,
    pub breathing_purity: f64,
    pub heart_purity: f64,
    /// Combined score in [0, 1]
    pub overall: f64,
    pub movement_index: f64,
    pub motion: MotionSeverity,
}

impl Default for SignalQuality {
    fn default() -> Self {
        Self {
            breathing_snr_db: 0.0,
            heart_snr_db: 0.0,
            breathing_purity: 0.0,
            heart_purity: 0.0,
            overall: 0.0,
            movement_index: 0.0,
            motion: MotionSeverity::Low,
        }
    }
}

/// Per-window vital-sign reading. `None` rates mean "not a rate".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VitalSignEstimate {
    pub heart_rate_bpm: Option<f64>,
    pub breathing_rate_bpm: Option<f64>,
    /// Larger of the two band confidences
    pub confidence: f64,
    pub heart_confidence: f64,
    pub breathing_confidence: f64,
    pub timestamp: DateTime<Utc>,
    pub samples_processed: usize,
    pub flags: EstimateFlags,
    pub quality: SignalQuality,
}

impl VitalSignEstimate {
    /// Reading with no rates and zero confidence.
    pub fn empty(timestamp: DateTime<Utc>, samples_processed: usize, flags: EstimateFlags) -> Self {
        Self {
            heart_rate_bpm: None,
            breathing_rate_bpm: None,
            confidence: 0.0,
            heart_confidence: 0.0,
            breathing_confidence: 0.0,
            timestamp,
            samples_processed,
            flags,
            quality: SignalQuality::default(),
        }
    }

    pub fn has_rates(&self) -> bool {
        self.heart_rate_bpm.is_some() || self.breathing_rate_bpm.is_some()
    }
}

/// Dominant-peak analysis of one band.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BandEstimate {
    pub peak_hz: Option<f64>,
    pub confidence: f64,
    pub snr_db: f64,
    pub purity: f64,
}

impl BandEstimate {
    pub fn rate_bpm(&self) -> Option<f64> {
        self.peak_hz.map(|hz| hz * 60.0)
    }
}

pub struct RateEstimator {
    config: EstimatorConfig,
    bands: BandConfig,
    sampling_rate: f64,
}

impl RateEstimator {
    pub fn new(config: EstimatorConfig, bands: BandConfig, sampling_rate: f64) -> Result<Self> {
        config.validate()?;
        bands.validate(sampling_rate)?;
        Ok(Self {
            config,
            bands,
            sampling_rate,
        })
    }

    /// Build the reading for one window. `separated` is ignored for windows
    /// that are low energy or partial; those always yield an empty reading.
    pub fn estimate(
        &self,
        window: &MotionWindow,
        separated: Option<&SeparatedBands>,
    ) -> VitalSignEstimate {
        let flags = EstimateFlags {
            partial: window.is_partial(),
            low_energy: window.is_low_energy(),
        };
        let motion = window.motion();
        let mut estimate =
            VitalSignEstimate::empty(window.start_timestamp(), window.valid_len(), flags);
        estimate.quality.movement_index = motion.movement_index;
        estimate.quality.motion = motion.severity;

        let separated = match separated {
            Some(s) if !flags.partial && !flags.low_energy => s,
            _ => {
                debug!(
                    "Window at {} not analysed (partial: {}, low energy: {})",
                    window.start_timestamp(),
                    flags.partial,
                    flags.low_energy
                );
                return estimate;
            }
        };

        let breathing = self.estimate_band(
            &separated.respiratory,
            self.bands.respiratory,
            separated.respiratory_share,
        );
        let heart =
            self.estimate_band(&separated.cardiac, self.bands.cardiac, separated.cardiac_share);

        estimate.breathing_rate_bpm = breathing.rate_bpm();
        estimate.heart_rate_bpm = heart.rate_bpm();
        estimate.breathing_confidence = breathing.confidence;
        estimate.heart_confidence = heart.confidence;
        estimate.confidence = breathing.confidence.max(heart.confidence);
        estimate.quality.breathing_snr_db = breathing.snr_db;
        estimate.quality.heart_snr_db = heart.snr_db;
        estimate.quality.breathing_purity = breathing.purity;
        estimate.quality.heart_purity = heart.purity;
        estimate.quality.overall = ((breathing.snr_db / 20.0
            + heart.snr_db / 20.0
            + breathing.purity
            + heart.purity)
            / 4.0)
            .clamp(0.0, 1.0);

        debug!(
            "Window at {}: HR {:?} bpm ({:.2}), BR {:?} bpm ({:.2})",
            estimate.timestamp,
            estimate.heart_rate_bpm,
            estimate.heart_confidence,
            estimate.breathing_rate_bpm,
            estimate.breathing_confidence
        );
        estimate
    }

    /// Dominant in-band peak of `signal` with its confidence.
    pub fn estimate_band(&self, signal: &[f64], band: Band, share: f64) -> BandEstimate {
        let spectrum = PowerSpectrum::compute(signal, self.sampling_rate, self.config.fft_size);
        let snr_db = estimate_snr(signal);
        let Some(range) = spectrum.bin_range(band.low_hz, band.high_hz) else {
            return BandEstimate {
                peak_hz: None,
                confidence: 0.0,
                snr_db,
                purity: 0.0,
            };
        };
        let power = spectrum.power();
        let purity = spectral_purity(&power[range.clone()]);

        let Some(peak) = self.dominant_peak(power, range.start().to_owned(), *range.end()) else {
            trace!("No spectral peak inside {:?}", band);
            return BandEstimate {
                peak_hz: None,
                confidence: 0.0,
                snr_db,
                purity,
            };
        };

        let peak_hz = (peak as f64 + parabolic_offset(power, peak)) * spectrum.resolution();
        let confidence = if share < self.config.min_band_share {
            trace!(
                "Band {:?} holds {:.2e} of motion energy, below {:.2e}",
                band,
                share,
                self.config.min_band_share
            );
            0.0
        } else {
            self.peak_confidence(&spectrum, band, peak_hz)
        };

        BandEstimate {
            peak_hz: Some(peak_hz),
            confidence,
            snr_db,
            purity,
        }
    }

    /// Strongest interior local maximum in `lo..=hi`, preferring the lowest
    /// frequency among near-ties.
    fn dominant_peak(&self, power: &[f64], lo: usize, hi: usize) -> Option<usize> {
        let candidates: Vec<usize> = (lo.max(1)..=hi.min(power.len().saturating_sub(2)))
            .filter(|&k| power[k] > power[k - 1] && power[k] >= power[k + 1])
            .collect();
        let strongest = candidates
            .iter()
            .map(|&k| power[k])
            .fold(f64::NEG_INFINITY, f64::max);
        if !(strongest > 0.0) {
            return None;
        }
        let floor = strongest * (1.0 - self.config.tie_tolerance);
        candidates.into_iter().find(|&k| power[k] >= floor)
    }

    /// Peak energy over in-band energy, rescaled so a flat band scores 0 and
    /// a lone tone scores 1.
    fn peak_confidence(&self, spectrum: &PowerSpectrum, band: Band, peak_hz: f64) -> f64 {
        let halfwidth = self.config.peak_halfwidth_bins * spectrum.native_resolution();
        let (Some(band_bins), Some(peak_bins)) = (
            spectrum.bin_range(band.low_hz, band.high_hz),
            spectrum.bin_range(
                (peak_hz - halfwidth).max(band.low_hz),
                (peak_hz + halfwidth).min(band.high_hz),
            ),
        ) else {
            return 0.0;
        };

        let band_energy: f64 = spectrum.power()[band_bins.clone()].iter().sum();
        let peak_energy: f64 = spectrum.power()[peak_bins.clone()].iter().sum();
        if !(band_energy > 0.0) {
            return 0.0;
        }

        let ratio = peak_energy / band_energy;
        let baseline = peak_bins.count() as f64 / band_bins.count() as f64;
        if baseline >= 1.0 {
            return 0.0;
        }
        let contrast = ((ratio - baseline) / (1.0 - baseline)).clamp(0.0, 1.0);
        contrast * contrast
    }
}

/// Sub-bin offset of a peak from a parabola through the log power of its neighbours.
fn parabolic_offset(power: &[f64], k: usize) -> f64 {
    if k == 0 || k + 1 >= power.len() {
        return 0.0;
    }
    let (a, b, c) = (power[k - 1], power[k], power[k + 1]);
    if a <= 0.0 || b <= 0.0 || c <= 0.0 {
        return 0.0;
    }
    let (a, b, c) = (a.ln(), b.ln(), c.ln());
    let denom = a - 2.0 * b + c;
    if denom == 0.0 || !denom.is_finite() {
        return 0.0;
    }
    (0.5 * (a - c) / denom).clamp(-0.5, 0.5)
}

/// Signal power over the power of the residual left by a 5-point median
/// filter, in dB, floored at 0.
fn estimate_snr(signal: &[f64]) -> f64 {
    if signal.is_empty() {
        return 0.0;
    }
    let n = signal.len() as f64;
    let signal_power = signal.iter().map(|x| x * x).sum::<f64>() / n;
    let residual: Vec<f64> = signal
        .iter()
        .zip(median_filter(signal, 5))
        .map(|(x, m)| x - m)
        .collect();
    let mean = residual.iter().sum::<f64>() / n;
    let noise_power = residual.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;

    if noise_power > 0.0 && signal_power > 0.0 {
        (10.0 * (signal_power / noise_power).log10()).max(0.0)
    } else {
        0.0
    }
}

/// Median filter with zero padding at the edges.
fn median_filter(signal: &[f64], kernel: usize) -> Vec<f64> {
    let half = kernel / 2;
    let mut buf = Vec::with_capacity(kernel);
    (0..signal.len())
        .map(|i| {
            buf.clear();
            for j in 0..kernel {
                let idx = i as isize + j as isize - half as isize;
                buf.push(if idx >= 0 && (idx as usize) < signal.len() {
                    signal[idx as usize]
                } else {
                    0.0
                });
            }
            buf.sort_by(f64::total_cmp);
            buf[half]
        })
        .collect()
}

/// One minus the normalised Shannon entropy of the spectrum.
fn spectral_purity(power: &[f64]) -> f64 {
    let total: f64 = power.iter().sum();
    if power.len() < 2 || !(total > 0.0) {
        return 0.0;
    }
    let entropy: f64 = power
        .iter()
        .map(|p| p / total)
        .filter(|&p| p > 0.0)
        .map(|p| -p * p.log2())
        .sum();
    (1.0 - entropy / (power.len() as f64).log2()).clamp(0.0, 1.0)
}
