//! Zero-phase band-pass separation of the motion signal into respiratory and
//! cardiac components.

use crate::error::{ProcessingError, Result};
use crate::spectrum::PowerSpectrum;
use log::{debug, trace};
use sci_rs::signal::filter::design::{
    butter_dyn, DigitalFilter, FilterBandType, FilterOutputType, Sos, SosFormatFilter,
};
use sci_rs::signal::filter::sosfiltfilt_dyn;
use serde::{Deserialize, Serialize};

/// Frequency band in Hz, inclusive on both edges.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Band {
    pub low_hz: f64,
    pub high_hz: f64,
}

impl Band {
    pub const fn new(low_hz: f64, high_hz: f64) -> Self {
        Self { low_hz, high_hz }
    }

    pub fn contains(&self, freq_hz: f64) -> bool {
        freq_hz >= self.low_hz && freq_hz <= self.high_hz
    }

    pub fn width(&self) -> f64 {
        self.high_hz - self.low_hz
    }

    fn validate(&self, name: &str, sampling_rate: f64) -> Result<()> {
        let nyquist = sampling_rate / 2.0;
        if !(self.low_hz > 0.0 && self.low_hz < self.high_hz && self.high_hz < nyquist) {
            return Err(ProcessingError::config(format!(
                "{} band {}-{} Hz must satisfy 0 < low < high < {} Hz",
                name, self.low_hz, self.high_hz, nyquist
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandConfig {
    /// 6-30 breaths/min
    pub respiratory: Band,
    /// 48-120 beats/min
    pub cardiac: Band,
    pub filter_order: usize,
}

impl Default for BandConfig {
    fn default() -> Self {
        Self {
            respiratory: Band::new(0.1, 0.5),
            cardiac: Band::new(0.8, 2.0),
            filter_order: 4,
        }
    }
}

impl BandConfig {
    pub fn validate(&self, sampling_rate: f64) -> Result<()> {
        if !(1..=8).contains(&self.filter_order) {
            return Err(ProcessingError::config(format!(
                "filter order must be between 1 and 8, got {}",
                self.filter_order
            )));
        }
        self.respiratory.validate("respiratory", sampling_rate)?;
        self.cardiac.validate("cardiac", sampling_rate)?;
        Ok(())
    }

    /// Shortest signal the forward-backward filters can process.
    pub fn min_signal_len(&self) -> usize {
        // a band-pass of order N is N second-order sections
        padding_len(self.filter_order) + 1
    }
}

/// Edge padding used by forward-backward filtering of `sections` SOS stages.
fn padding_len(sections: usize) -> usize {
    3 * (2 * sections + 1)
}

/// Zero-phase filtering. `None` when the signal is too short for the edge padding.
pub(crate) fn filtfilt(signal: &[f64], sos: &[Sos<f64>]) -> Option<Vec<f64>> {
    if sos.is_empty() || signal.len() <= padding_len(sos.len()) {
        return None;
    }
    Some(sosfiltfilt_dyn(signal.iter(), sos))
}

fn design_bandpass(band: Band, order: usize, sampling_rate: f64) -> Result<Vec<Sos<f64>>> {
    let filter = butter_dyn(
        order,
        vec![band.low_hz, band.high_hz],
        Some(FilterBandType::Bandpass),
        Some(false),
        Some(FilterOutputType::Sos),
        Some(sampling_rate),
    );
    let DigitalFilter::Sos(SosFormatFilter { sos }) = filter else {
        return Err(ProcessingError::config(
            "Butterworth design did not return second-order sections",
        ));
    };
    Ok(sos)
}

/// Respiratory and cardiac components of one window, on the window's time axis.
#[derive(Debug, Clone, PartialEq)]
pub struct SeparatedBands {
    pub respiratory: Vec<f64>,
    pub cardiac: Vec<f64>,
    /// Fraction of the motion spectrum energy inside the respiratory band
    pub respiratory_share: f64,
    /// Fraction of the motion spectrum energy inside the cardiac band
    pub cardiac_share: f64,
}

/// Per-channel filter bank, designed once at setup.
pub struct BandSeparator {
    config: BandConfig,
    sampling_rate: f64,
    respiratory_sos: Vec<Sos<f64>>,
    cardiac_sos: Vec<Sos<f64>>,
}

impl BandSeparator {
    pub fn new(config: BandConfig, sampling_rate: f64) -> Result<Self> {
        config.validate(sampling_rate)?;
        let respiratory_sos =
            design_bandpass(config.respiratory, config.filter_order, sampling_rate)?;
        let cardiac_sos = design_bandpass(config.cardiac, config.filter_order, sampling_rate)?;
        debug!(
            "Designed band-pass filters: respiratory {} sections, cardiac {} sections",
            respiratory_sos.len(),
            cardiac_sos.len()
        );
        Ok(Self {
            config,
            sampling_rate,
            respiratory_sos,
            cardiac_sos,
        })
    }

    pub fn config(&self) -> &BandConfig {
        &self.config
    }

    /// Split `signal` into the two bands.
    ///
    /// `valid_len` marks where zero padding of a partial window starts; only
    /// the valid prefix is filtered and the padding stays zero.
    pub fn separate(&self, signal: &[f64], valid_len: usize) -> SeparatedBands {
        let valid = &signal[..valid_len.min(signal.len())];

        let spectrum = PowerSpectrum::compute(valid, self.sampling_rate, 0);
        let total = spectrum.total_energy();
        let share = |band: Band| {
            if total > 0.0 {
                spectrum.band_energy(band.low_hz, band.high_hz) / total
            } else {
                0.0
            }
        };
        let respiratory_share = share(self.config.respiratory);
        let cardiac_share = share(self.config.cardiac);

        let filter = |sos: &[Sos<f64>]| {
            let mut out = filtfilt(valid, sos).unwrap_or_else(|| vec![0.0; valid.len()]);
            for x in out.iter_mut() {
                if !x.is_finite() {
                    *x = 0.0;
                }
            }
            out.resize(signal.len(), 0.0);
            out
        };

        trace!(
            "Band shares: respiratory {:.4}, cardiac {:.4}",
            respiratory_share,
            cardiac_share
        );
        SeparatedBands {
            respiratory: filter(&self.respiratory_sos),
            cardiac: filter(&self.cardiac_sos),
            respiratory_share,
            cardiac_share,
        }
    }
}
