use rustfft::{num_complex::Complex64, FftPlanner};
use std::f64::consts::PI;
use std::ops::RangeInclusive;

/// Create a Hann window of the specified size
pub fn hann_window(size: usize) -> Vec<f64> {
    (0..size)
        .map(|i| 0.5 * (1.0 - (2.0 * PI * i as f64 / size as f64).cos()))
        .collect()
}

/// One-sided power spectrum of a Hann-windowed, zero-padded real signal.
#[derive(Debug, Clone, PartialEq)]
pub struct PowerSpectrum {
    power: Vec<f64>,
    /// Bin spacing after zero padding (Hz)
    resolution: f64,
    /// Bin spacing of the unpadded signal (Hz)
    native_resolution: f64,
}

impl PowerSpectrum {
    /// FFT length is the larger of `min_fft` and the next power of two above the signal length.
    pub fn compute(signal: &[f64], sample_rate: f64, min_fft: usize) -> Self {
        if signal.is_empty() {
            return Self {
                power: Vec::new(),
                resolution: sample_rate,
                native_resolution: sample_rate,
            };
        }

        let n = signal.len().next_power_of_two().max(min_fft);
        let window = hann_window(signal.len());

        // Convert to complex numbers, zero padded
        let mut buffer = vec![Complex64::new(0.0, 0.0); n];
        for (slot, (&s, &w)) in buffer.iter_mut().zip(signal.iter().zip(window.iter())) {
            *slot = Complex64::new(s * w, 0.0);
        }

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(n);
        fft.process(&mut buffer);

        let power = buffer[..=n / 2].iter().map(|c| c.norm_sqr()).collect();

        Self {
            power,
            resolution: sample_rate / n as f64,
            native_resolution: sample_rate / signal.len() as f64,
        }
    }

    pub fn power(&self) -> &[f64] {
        &self.power
    }

    pub fn len(&self) -> usize {
        self.power.len()
    }

    pub fn is_empty(&self) -> bool {
        self.power.is_empty()
    }

    pub fn resolution(&self) -> f64 {
        self.resolution
    }

    pub fn native_resolution(&self) -> f64 {
        self.native_resolution
    }

    pub fn frequency(&self, bin: usize) -> f64 {
        bin as f64 * self.resolution
    }

    /// Bins whose centre frequency lies in `[low_hz, high_hz]`.
    pub fn bin_range(&self, low_hz: f64, high_hz: f64) -> Option<RangeInclusive<usize>> {
        if self.power.is_empty() {
            return None;
        }
        let last = self.power.len() - 1;
        let lo = (low_hz / self.resolution).ceil().max(0.0) as usize;
        let hi = ((high_hz / self.resolution).floor().max(0.0) as usize).min(last);
        (lo <= hi).then_some(lo..=hi)
    }

    pub fn band_energy(&self, low_hz: f64, high_hz: f64) -> f64 {
        self.bin_range(low_hz, high_hz)
            .map(|range| self.power[range].iter().sum())
            .unwrap_or(0.0)
    }

    pub fn total_energy(&self) -> f64 {
        self.power.iter().sum()
    }
}
