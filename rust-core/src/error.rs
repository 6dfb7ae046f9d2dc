//! Error types for the reconstruction pipeline.
//!
//! Only structural violations of the data contract are errors. Missing or
//! noisy evidence (idle gaps, unclassified events, rejected outliers) is an
//! expected outcome and never surfaces here.

use thiserror::Error;

/// A sample stream broke its ordering or shape contract.
///
/// Fatal to the current session: downstream state would be undefined.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DataIntegrityError {
    /// A sample arrived with a timestamp at or before its predecessor.
    #[error("non-monotonic timestamp: {current_us}us after {previous_us}us")]
    NonMonotonic {
        /// Timestamp of the last accepted sample.
        previous_us: u64,
        /// Offending timestamp.
        current_us: u64,
    },

    /// A sample carried no readings.
    #[error("sample at {timestamp_us}us has no channel readings")]
    EmptySample { timestamp_us: u64 },

    /// A sample's width differs from the first sample of the stream.
    #[error("sample at {timestamp_us}us has {actual} channels, stream width is {expected}")]
    ChannelWidth {
        timestamp_us: u64,
        expected: usize,
        actual: usize,
    },

    /// A reading was NaN or infinite.
    #[error("sample at {timestamp_us}us has a non-finite reading on channel {channel}")]
    NonFinite { timestamp_us: u64, channel: usize },
}

/// Configuration or mapping artifact problems, detected at session start.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The mapping artifact was produced for a different schema.
    #[error("fingerprint schema mismatch: expected v{expected}, artifact is v{found}")]
    SchemaMismatch { expected: u32, found: u32 },

    /// A configuration value is out of range.
    #[error("invalid configuration: {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: String,
    },

    /// The mapping artifact is structurally inconsistent.
    #[error("invalid fingerprint artifact: {0}")]
    InvalidArtifact(String),

    /// The mapping artifact could not be parsed.
    #[error("failed to parse fingerprint artifact: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}

/// Failures at the trajectory boundary.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The consumer side of a bounded sink went away.
    #[error("trajectory consumer disconnected")]
    Disconnected,

    /// An estimate would rewrite or reorder history.
    #[error("estimate at {current_us}us does not follow {previous_us}us")]
    OutOfOrder { previous_us: u64, current_us: u64 },

    /// Persistence layer failure.
    #[error("trajectory write failed: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding failure.
    #[error("trajectory encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Top-level error for a reconstruction session.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("data integrity error: {0}")]
    DataIntegrity(#[from] DataIntegrityError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("sink error: {0}")]
    Sink(#[from] SinkError),
}

impl PipelineError {
    /// True when the error came from the sample stream itself.
    pub fn is_data_integrity(&self) -> bool {
        matches!(self, PipelineError::DataIntegrity(_))
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
