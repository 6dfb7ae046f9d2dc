//! Configuration for every pipeline stage.
//!
//! Each stage owns a small config struct with documented defaults. They are
//! bundled into [`ReconstructionConfig`] for a whole session. All structs
//! deserialize with per-field defaults so a host can load a partial JSON or
//! TOML document; loading itself is the host's job.

use serde::{Deserialize, Serialize};

use crate::classifier::MatchStrategy;
use crate::error::ConfigError;

/// Parameters for waveform segmentation.
///
/// Tuned for a power-rail sensor sampled around 20-100 kHz, where a single
/// draw-call burst lasts a few hundred microseconds to a few milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Changepoint threshold as a multiple of the baseline noise std dev.
    /// Typical: 3.0 - 6.0. Lower = more events, more false positives.
    pub changepoint_sensitivity: f64,

    /// Segments shorter than this are discarded as glitches (µs).
    pub min_event_duration_us: u64,

    /// An open event is force-closed at this length (µs).
    pub max_event_duration_us: u64,

    /// Segments separated by less than this are coalesced (µs).
    /// Handles GPU pipeline stalls that split one burst into two humps.
    pub merge_window_us: u64,

    /// Silence longer than this produces an explicit idle-gap marker (µs).
    pub idle_timeout_us: u64,

    /// Smoothing factor for the baseline energy mean/variance.
    /// Range: (0.0, 1.0]. Typical: 0.01.
    pub baseline_alpha: f64,

    /// Quiet samples required before any changepoint may fire.
    pub baseline_warmup_samples: usize,

    /// Lower bound on baseline std dev, so a perfectly flat rail does not
    /// turn every bit of quantization noise into an event.
    pub min_noise_floor: f64,

    /// Number of spectral band energies appended to each feature vector.
    pub spectral_bands: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            changepoint_sensitivity: 4.0,
            min_event_duration_us: 200,
            max_event_duration_us: 20_000,
            merge_window_us: 500,
            idle_timeout_us: 100_000,
            baseline_alpha: 0.01,
            baseline_warmup_samples: 32,
            min_noise_floor: 1e-3,
            spectral_bands: 4,
        }
    }
}

/// Parameters for fingerprint matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Candidates scoring below this floor are excluded. Range: [0.0, 1.0].
    pub min_confidence: f64,

    /// Feature comparison strategy.
    pub strategy: MatchStrategy,

    /// Below this compared-dimension fraction a classification is flagged
    /// as reduced confidence. Range: [0.0, 1.0].
    pub min_overlap_fraction: f64,

    /// Maximum ranked candidates kept per classification.
    pub max_candidates: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            min_confidence: 0.2,
            strategy: MatchStrategy::WeightedDistance,
            min_overlap_fraction: 0.5,
            max_candidates: 5,
        }
    }
}

/// Parameters for the recursive motion estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Fixed output tick (µs). Typical: 100 ms.
    pub tick_interval_us: u64,

    /// Initial pose variance per axis (m² or rad²).
    pub initial_pose_variance: f64,

    /// Initial velocity variance per axis.
    pub initial_velocity_variance: f64,

    /// Pose random-walk noise, variance per second.
    pub pose_process_noise: f64,

    /// Velocity random-walk noise, variance per second.
    /// Head motion changes quickly, so this dominates dead-reckoning growth.
    pub velocity_process_noise: f64,

    /// Observations whose normalized innovation exceeds this many standard
    /// deviations on any axis are rejected.
    pub outlier_rejection_multiple: f64,

    /// Consecutive ticks without an accepted observation before the
    /// covariance is reset to the wide prior.
    pub recalibration_run_length: u32,

    /// Wide-prior variance per axis applied on recalibration.
    pub recalibration_variance: f64,

    /// Measurement noise multiplier for reduced-confidence classifications.
    pub reduced_confidence_noise_scale: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            tick_interval_us: 100_000,
            initial_pose_variance: 0.05,
            initial_velocity_variance: 1.0,
            pose_process_noise: 0.001,
            velocity_process_noise: 0.5,
            outlier_rejection_multiple: 5.0,
            recalibration_run_length: 20,
            recalibration_variance: 25.0,
            reduced_confidence_noise_scale: 4.0,
        }
    }
}

/// What the sink does when its buffer is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressurePolicy {
    /// Block the producer. Lossless; may stall real-time capture.
    Block,
    /// Evict the oldest buffered estimate and count the drop.
    DropOldest,
}

/// Parameters for the trajectory boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Bounded buffer capacity in estimates.
    pub capacity: usize,
    pub policy: BackpressurePolicy,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            policy: BackpressurePolicy::DropOldest,
        }
    }
}

/// Configuration for one reconstruction session.
///
/// Bundles all sub-component configurations into a single, coherent package.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconstructionConfig {
    pub segmenter: SegmenterConfig,
    pub classifier: ClassifierConfig,
    pub tracker: TrackerConfig,
    pub sink: SinkConfig,

    /// Live mode: longest wait for the next sample before the segmenter
    /// emits an idle-gap marker on its own (µs).
    pub max_sample_wait_us: u64,
}

impl Default for ReconstructionConfig {
    fn default() -> Self {
        Self {
            segmenter: SegmenterConfig::default(),
            classifier: ClassifierConfig::default(),
            tracker: TrackerConfig::default(),
            sink: SinkConfig::default(),
            max_sample_wait_us: 250_000,
        }
    }
}

impl ReconstructionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject values that would make the pipeline meaningless.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let seg = &self.segmenter;
        if !(seg.changepoint_sensitivity > 0.0) {
            return Err(ConfigError::invalid(
                "segmenter.changepoint_sensitivity",
                "must be positive",
            ));
        }
        if seg.max_event_duration_us == 0 {
            return Err(ConfigError::invalid(
                "segmenter.max_event_duration_us",
                "must be positive",
            ));
        }
        if seg.min_event_duration_us > seg.max_event_duration_us {
            return Err(ConfigError::invalid(
                "segmenter.min_event_duration_us",
                format!(
                    "{} exceeds max_event_duration_us {}",
                    seg.min_event_duration_us, seg.max_event_duration_us
                ),
            ));
        }
        if seg.idle_timeout_us == 0 {
            return Err(ConfigError::invalid(
                "segmenter.idle_timeout_us",
                "must be positive",
            ));
        }
        if !(seg.baseline_alpha > 0.0 && seg.baseline_alpha <= 1.0) {
            return Err(ConfigError::invalid(
                "segmenter.baseline_alpha",
                "must be in (0, 1]",
            ));
        }
        if !(seg.min_noise_floor >= 0.0) {
            return Err(ConfigError::invalid(
                "segmenter.min_noise_floor",
                "must be non-negative",
            ));
        }

        let cls = &self.classifier;
        if !(0.0..=1.0).contains(&cls.min_confidence) {
            return Err(ConfigError::invalid(
                "classifier.min_confidence",
                "must be in [0, 1]",
            ));
        }
        if !(0.0..=1.0).contains(&cls.min_overlap_fraction) {
            return Err(ConfigError::invalid(
                "classifier.min_overlap_fraction",
                "must be in [0, 1]",
            ));
        }
        if cls.max_candidates == 0 {
            return Err(ConfigError::invalid(
                "classifier.max_candidates",
                "must be at least 1",
            ));
        }

        let trk = &self.tracker;
        if trk.tick_interval_us == 0 {
            return Err(ConfigError::invalid(
                "tracker.tick_interval_us",
                "must be positive",
            ));
        }
        for (field, value) in [
            ("tracker.initial_pose_variance", trk.initial_pose_variance),
            ("tracker.initial_velocity_variance", trk.initial_velocity_variance),
            ("tracker.recalibration_variance", trk.recalibration_variance),
            ("tracker.outlier_rejection_multiple", trk.outlier_rejection_multiple),
            (
                "tracker.reduced_confidence_noise_scale",
                trk.reduced_confidence_noise_scale,
            ),
        ] {
            if !(value > 0.0) {
                return Err(ConfigError::invalid(field, "must be positive"));
            }
        }
        for (field, value) in [
            ("tracker.pose_process_noise", trk.pose_process_noise),
            ("tracker.velocity_process_noise", trk.velocity_process_noise),
        ] {
            if !(value >= 0.0) {
                return Err(ConfigError::invalid(field, "must be non-negative"));
            }
        }
        if trk.recalibration_run_length == 0 {
            return Err(ConfigError::invalid(
                "tracker.recalibration_run_length",
                "must be at least 1",
            ));
        }

        if self.sink.capacity == 0 {
            return Err(ConfigError::invalid("sink.capacity", "must be at least 1"));
        }
        if self.max_sample_wait_us == 0 {
            return Err(ConfigError::invalid(
                "max_sample_wait_us",
                "must be positive",
            ));
        }
        Ok(())
    }
}
