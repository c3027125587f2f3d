//! Accumulates raw IQ samples into fixed-length analysis windows.
//!
//! Windows are either tumbling (non-overlapping) or sliding with a fixed
//! overlap fraction. Completed windows from batch pushes wait in a bounded
//! backlog until the caller drains them.

use crate::error::{ProcessingError, Result};
use crate::IQSample;
use chrono::{DateTime, Duration, Utc};
use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowMode {
    /// Each sample belongs to exactly one window.
    Tumbling,
    /// Consecutive windows share `overlap` (fraction in `[0, 1)`) of their samples.
    Sliding { overlap: f64 },
}

/// What happens to samples left over when the stream ends mid-window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrailingPolicy {
    /// Pad with zeros and emit a window tagged `partial`.
    ZeroPad,
    /// Drop the leftover samples.
    Discard,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Declared sampling rate of the producer (Hz)
    pub sampling_rate: f64,
    /// Window duration in seconds
    pub window_seconds: f64,
    pub mode: WindowMode,
    pub trailing: TrailingPolicy,
    /// Completed windows allowed to wait for consumption
    pub max_backlog: usize,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            sampling_rate: 100.0,
            window_seconds: 30.0,
            mode: WindowMode::Tumbling,
            trailing: TrailingPolicy::Discard,
            max_backlog: 8,
        }
    }
}

impl WindowConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.sampling_rate.is_finite() || self.sampling_rate <= 0.0 {
            return Err(ProcessingError::InvalidSampleRate(self.sampling_rate));
        }
        if !self.window_seconds.is_finite() || self.window_seconds <= 0.0 {
            return Err(ProcessingError::config(format!(
                "window duration must be positive, got {} s",
                self.window_seconds
            )));
        }
        if self.window_len() < 2 {
            return Err(ProcessingError::config(format!(
                "window of {} s at {} Hz holds fewer than 2 samples",
                self.window_seconds, self.sampling_rate
            )));
        }
        if let WindowMode::Sliding { overlap } = self.mode {
            if !(0.0..1.0).contains(&overlap) {
                return Err(ProcessingError::config(format!(
                    "sliding overlap must be in [0, 1), got {}",
                    overlap
                )));
            }
        }
        if self.max_backlog == 0 {
            return Err(ProcessingError::config("max_backlog must be at least 1"));
        }
        Ok(())
    }

    /// Samples per window: sampling rate x duration, rounded.
    pub fn window_len(&self) -> usize {
        (self.sampling_rate * self.window_seconds).round() as usize
    }

    /// Samples the window advances by after each emission.
    pub fn hop_len(&self) -> usize {
        let len = self.window_len();
        match self.mode {
            WindowMode::Tumbling => len,
            WindowMode::Sliding { overlap } => {
                let retained = (len as f64 * overlap).round() as usize;
                len.saturating_sub(retained).max(1)
            }
        }
    }
}

/// Timestamp of the sample at `index` in a stream that started at `stream_start`.
pub(crate) fn sample_time(stream_start: DateTime<Utc>, index: u64, sampling_rate: f64) -> DateTime<Utc> {
    let nanos = (index as f64 / sampling_rate * 1e9).round() as i64;
    stream_start + Duration::nanoseconds(nanos)
}

/// A fixed-length, gap-free run of samples plus its timing metadata.
///
/// Windows are never mutated after creation; every pipeline stage borrows them.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisWindow {
    samples: Vec<IQSample>,
    sampling_rate: f64,
    start_timestamp: DateTime<Utc>,
    start_index: u64,
    valid_len: usize,
}

impl AnalysisWindow {
    /// Build a complete window from already collected samples.
    pub fn new(
        samples: Vec<IQSample>,
        sampling_rate: f64,
        start_timestamp: DateTime<Utc>,
    ) -> Result<Self> {
        if !sampling_rate.is_finite() || sampling_rate <= 0.0 {
            return Err(ProcessingError::InvalidSampleRate(sampling_rate));
        }
        if samples.is_empty() {
            return Err(ProcessingError::config("analysis window cannot be empty"));
        }
        let valid_len = samples.len();
        Ok(Self {
            samples,
            sampling_rate,
            start_timestamp,
            start_index: 0,
            valid_len,
        })
    }

    pub fn samples(&self) -> &[IQSample] {
        &self.samples
    }

    /// Samples that came from the producer (excludes zero padding).
    pub fn valid_samples(&self) -> &[IQSample] {
        &self.samples[..self.valid_len]
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn valid_len(&self) -> usize {
        self.valid_len
    }

    pub fn sampling_rate(&self) -> f64 {
        self.sampling_rate
    }

    pub fn start_timestamp(&self) -> DateTime<Utc> {
        self.start_timestamp
    }

    /// Stream index of the first sample.
    pub fn start_index(&self) -> u64 {
        self.start_index
    }

    pub fn window_duration(&self) -> Duration {
        Duration::nanoseconds((self.samples.len() as f64 / self.sampling_rate * 1e9).round() as i64)
    }

    pub fn end_timestamp(&self) -> DateTime<Utc> {
        self.start_timestamp + self.window_duration()
    }

    /// Timestamp of the sample at `offset` within this window.
    pub fn timestamp_of(&self, offset: usize) -> DateTime<Utc> {
        sample_time(self.start_timestamp, offset as u64, self.sampling_rate)
    }

    /// True when the window was zero-padded at stream end.
    pub fn is_partial(&self) -> bool {
        self.valid_len < self.samples.len()
    }
}

/// Ring-style accumulator turning a sample stream into analysis windows.
pub struct SampleWindow {
    config: WindowConfig,
    window_len: usize,
    hop_len: usize,
    stream_start: DateTime<Utc>,
    /// Samples of the window currently being filled
    pending: Vec<IQSample>,
    /// Stream index of `pending[0]`
    pending_start: u64,
    /// Samples in `pending` that have not been part of an emitted window yet
    fresh: usize,
    backlog: VecDeque<AnalysisWindow>,
    samples_seen: u64,
}

impl SampleWindow {
    pub fn new(config: WindowConfig, stream_start: DateTime<Utc>) -> Result<Self> {
        config.validate()?;
        let window_len = config.window_len();
        let hop_len = config.hop_len();
        debug!(
            "Sample window: {} samples per window, hop {} ({:?}, trailing {:?})",
            window_len, hop_len, config.mode, config.trailing
        );
        Ok(Self {
            pending: Vec::with_capacity(window_len),
            config,
            window_len,
            hop_len,
            stream_start,
            pending_start: 0,
            fresh: 0,
            backlog: VecDeque::new(),
            samples_seen: 0,
        })
    }

    /// Add one sample. Returns the window it completed, if any.
    pub fn push(&mut self, sample: IQSample) -> Result<Option<AnalysisWindow>> {
        self.pending.push(sample);
        self.fresh += 1;
        self.samples_seen += 1;

        if self.pending.len() < self.window_len {
            return Ok(None);
        }
        Ok(Some(self.emit()))
    }

    /// Add a batch. Completed windows go to the backlog; returns how many completed.
    ///
    /// The batch is rejected as a whole with `BufferOverflow` if its windows
    /// would not fit in the backlog. Nothing is consumed in that case.
    pub fn push_batch(&mut self, samples: &[IQSample]) -> Result<usize> {
        let completing = self.windows_completed_by(samples.len());
        if self.backlog.len() + completing > self.config.max_backlog {
            return Err(ProcessingError::BufferOverflow {
                pending: self.backlog.len(),
                limit: self.config.max_backlog,
            });
        }

        for &sample in samples {
            if let Some(window) = self.push(sample)? {
                self.backlog.push_back(window);
            }
        }
        trace!(
            "Pushed batch of {} samples, {} windows completed, backlog {}",
            samples.len(),
            completing,
            self.backlog.len()
        );
        Ok(completing)
    }

    /// Account for `count` samples lost upstream. The window being filled is
    /// discarded so that no window spans the gap; later windows keep their
    /// true timestamps.
    pub fn skip(&mut self, count: u64) {
        if count == 0 {
            return;
        }
        debug!(
            "Gap of {} samples at stream index {}, discarding {} pending samples",
            count,
            self.samples_seen,
            self.pending.len()
        );
        self.pending.clear();
        self.fresh = 0;
        self.samples_seen += count;
        self.pending_start = self.samples_seen;
    }

    /// Flush the trailing short window according to the trailing policy.
    pub fn finish(&mut self) -> Option<AnalysisWindow> {
        let fresh = self.fresh;
        let leftover = std::mem::take(&mut self.pending);
        self.pending_start = self.samples_seen;
        self.fresh = 0;

        if fresh == 0 {
            return None;
        }

        match self.config.trailing {
            TrailingPolicy::Discard => {
                debug!("Discarding {} trailing samples", fresh);
                None
            }
            TrailingPolicy::ZeroPad => {
                let valid_len = leftover.len();
                let start_index = self.samples_seen - valid_len as u64;
                let mut samples = leftover;
                samples.resize(self.window_len, IQSample::default());
                debug!(
                    "Zero-padding trailing window: {} of {} samples valid",
                    valid_len, self.window_len
                );
                Some(AnalysisWindow {
                    samples,
                    sampling_rate: self.config.sampling_rate,
                    start_timestamp: sample_time(
                        self.stream_start,
                        start_index,
                        self.config.sampling_rate,
                    ),
                    start_index,
                    valid_len,
                })
            }
        }
    }

    pub fn pop_window(&mut self) -> Option<AnalysisWindow> {
        self.backlog.pop_front()
    }

    pub fn drain_windows(&mut self) -> Vec<AnalysisWindow> {
        self.backlog.drain(..).collect()
    }

    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    pub fn trailing_policy(&self) -> TrailingPolicy {
        self.config.trailing
    }

    pub fn window_len(&self) -> usize {
        self.window_len
    }

    pub fn hop_len(&self) -> usize {
        self.hop_len
    }

    pub fn sampling_rate(&self) -> f64 {
        self.config.sampling_rate
    }

    pub fn samples_seen(&self) -> u64 {
        self.samples_seen
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn windows_completed_by(&self, incoming: usize) -> usize {
        let missing = self.window_len - self.pending.len();
        if incoming < missing {
            0
        } else {
            1 + (incoming - missing) / self.hop_len
        }
    }

    fn emit(&mut self) -> AnalysisWindow {
        let start_index = self.pending_start;
        let samples = if self.hop_len >= self.window_len {
            std::mem::take(&mut self.pending)
        } else {
            let samples = self.pending.clone();
            self.pending.drain(..self.hop_len);
            samples
        };
        self.pending_start += self.hop_len as u64;
        self.fresh = 0;

        trace!("Window complete at stream index {}", start_index);
        AnalysisWindow {
            valid_len: samples.len(),
            samples,
            sampling_rate: self.config.sampling_rate,
            start_timestamp: sample_time(self.stream_start, start_index, self.config.sampling_rate),
            start_index,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 12, 0, 0).unwrap()
    }

    fn config(rate: f64, secs: f64) -> WindowConfig {
        WindowConfig {
            sampling_rate: rate,
            window_seconds: secs,
            ..WindowConfig::default()
        }
    }

    fn ramp(n: usize) -> Vec<IQSample> {
        (0..n).map(|k| IQSample::new(k as f64, 0.0)).collect()
    }

    #[test]
    fn rejects_non_positive_sampling_rate() {
        let err = SampleWindow::new(config(0.0, 1.0), start()).err();
        assert_eq!(err, Some(ProcessingError::InvalidSampleRate(0.0)));
        let err = SampleWindow::new(config(-10.0, 1.0), start()).err();
        assert_eq!(err, Some(ProcessingError::InvalidSampleRate(-10.0)));
    }

    #[test]
    fn rejects_overlap_of_one() {
        let cfg = WindowConfig {
            mode: WindowMode::Sliding { overlap: 1.0 },
            ..config(10.0, 1.0)
        };
        assert!(matches!(
            SampleWindow::new(cfg, start()),
            Err(ProcessingError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn tumbling_windows_emit_at_exact_length() {
        let mut buf = SampleWindow::new(config(10.0, 1.0), start()).unwrap();
        let mut emitted = Vec::new();
        for s in ramp(25) {
            if let Some(w) = buf.push(s).unwrap() {
                emitted.push(w);
            }
        }
        assert_eq!(emitted.len(), 2);
        assert_eq!(emitted[0].len(), 10);
        assert_eq!(emitted[0].samples()[0].i, 0.0);
        assert_eq!(emitted[1].samples()[0].i, 10.0);
        assert_eq!(emitted[1].start_index(), 10);
        assert_eq!(buf.pending_len(), 5);
    }

    #[test]
    fn window_length_rounds_rate_times_duration() {
        let cfg = config(33.3, 3.0);
        assert_eq!(cfg.window_len(), 100);
    }

    #[test]
    fn sliding_windows_share_overlap() {
        let cfg = WindowConfig {
            mode: WindowMode::Sliding { overlap: 0.5 },
            ..config(10.0, 1.0)
        };
        let mut buf = SampleWindow::new(cfg, start()).unwrap();
        assert_eq!(buf.hop_len(), 5);

        let windows: Vec<_> = ramp(20)
            .into_iter()
            .filter_map(|s| buf.push(s).unwrap())
            .collect();
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[1].start_index(), 5);
        assert_eq!(windows[1].samples()[0].i, 5.0);
        assert_eq!(windows[2].samples()[9].i, 19.0);
    }

    #[test]
    fn window_timestamps_are_monotonic_and_gap_free() {
        let mut buf = SampleWindow::new(config(4.0, 2.0), start()).unwrap();
        let windows: Vec<_> = ramp(24)
            .into_iter()
            .filter_map(|s| buf.push(s).unwrap())
            .collect();
        assert_eq!(windows.len(), 3);
        for pair in windows.windows(2) {
            assert_eq!(pair[0].end_timestamp(), pair[1].start_timestamp());
        }
        assert_eq!(windows[0].window_duration(), Duration::seconds(2));
        assert_eq!(windows[2].start_timestamp(), start() + Duration::seconds(4));
    }

    #[test]
    fn batch_overflow_is_rejected_without_consuming() {
        let cfg = WindowConfig {
            max_backlog: 2,
            ..config(10.0, 1.0)
        };
        let mut buf = SampleWindow::new(cfg, start()).unwrap();

        assert_eq!(buf.push_batch(&ramp(20)).unwrap(), 2);
        assert_eq!(buf.backlog_len(), 2);

        let err = buf.push_batch(&ramp(10)).unwrap_err();
        assert_eq!(
            err,
            ProcessingError::BufferOverflow {
                pending: 2,
                limit: 2
            }
        );
        assert_eq!(buf.samples_seen(), 20);

        // partial batches that complete nothing are still accepted
        assert_eq!(buf.push_batch(&ramp(3)).unwrap(), 0);

        buf.pop_window();
        assert_eq!(buf.push_batch(&ramp(7)).unwrap(), 1);
        assert_eq!(buf.drain_windows().len(), 2);
    }

    #[test]
    fn skipped_samples_restart_the_window_at_the_true_time() {
        let cfg = WindowConfig {
            mode: WindowMode::Sliding { overlap: 0.5 },
            ..config(10.0, 1.0)
        };
        let mut buf = SampleWindow::new(cfg, start()).unwrap();
        buf.push_batch(&ramp(13)).unwrap();
        assert_eq!(buf.drain_windows().len(), 1);

        buf.skip(20);
        assert_eq!(buf.pending_len(), 0);
        assert_eq!(buf.samples_seen(), 33);

        buf.push_batch(&ramp(10)).unwrap();
        let after = buf.pop_window().unwrap();
        assert_eq!(after.start_index(), 33);
        assert_eq!(after.samples()[0].i, 0.0);
        assert_eq!(
            after.start_timestamp(),
            start() + Duration::milliseconds(3300)
        );
    }

    #[test]
    fn zero_pad_policy_tags_partial_window() {
        let cfg = WindowConfig {
            trailing: TrailingPolicy::ZeroPad,
            ..config(10.0, 1.0)
        };
        let mut buf = SampleWindow::new(cfg, start()).unwrap();
        buf.push_batch(&ramp(14)).unwrap();
        assert_eq!(buf.trailing_policy(), TrailingPolicy::ZeroPad);

        let tail = buf.finish().expect("trailing window");
        assert!(tail.is_partial());
        assert_eq!(tail.len(), 10);
        assert_eq!(tail.valid_len(), 4);
        assert_eq!(tail.start_index(), 10);
        assert_eq!(tail.samples()[9], IQSample::default());
        assert!(buf.finish().is_none());
    }

    #[test]
    fn discard_policy_drops_trailing_samples() {
        let mut buf = SampleWindow::new(config(10.0, 1.0), start()).unwrap();
        buf.push_batch(&ramp(14)).unwrap();
        assert!(buf.finish().is_none());
        assert_eq!(buf.pending_len(), 0);
    }

    #[test]
    fn sliding_overlap_alone_is_not_a_trailing_window() {
        let cfg = WindowConfig {
            mode: WindowMode::Sliding { overlap: 0.5 },
            trailing: TrailingPolicy::ZeroPad,
            ..config(10.0, 1.0)
        };
        let mut buf = SampleWindow::new(cfg, start()).unwrap();
        buf.push_batch(&ramp(10)).unwrap();
        assert_eq!(buf.pending_len(), 5);
        assert!(buf.finish().is_none());
    }
}
