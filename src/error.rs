use crate::ChannelId;
use thiserror::Error;

/// Errors surfaced by the vital-sign core.
///
/// Low signal energy, low confidence and partial windows are not errors; they
/// travel through the pipeline as flags on the estimate.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProcessingError {
    /// Sampling rate was zero, negative or not finite.
    #[error("invalid sampling rate: {0} Hz")]
    InvalidSampleRate(f64),

    /// Configuration rejected at setup time.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The bounded backlog is full; the producer must back off.
    #[error("buffer overflow: {pending} windows pending, limit is {limit}")]
    BufferOverflow { pending: usize, limit: usize },

    /// A channel received samples at a different rate than it was created with.
    #[error("sampling rate mismatch: channel runs at {expected} Hz, got {actual} Hz")]
    SampleRateMismatch { expected: f64, actual: f64 },

    /// The channel was torn down or its worker is gone.
    #[error("channel {0} is closed")]
    ChannelClosed(ChannelId),
}

impl ProcessingError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        ProcessingError::InvalidConfiguration(msg.into())
    }

    /// Whether the caller can retry after backing off.
    pub fn is_backpressure(&self) -> bool {
        matches!(self, ProcessingError::BufferOverflow { .. })
    }
}

pub type Result<T> = std::result::Result<T, ProcessingError>;
