//! Core data types for the motion reconstruction pipeline.
//!
//! This module defines the values that flow between pipeline stages:
//! samples in, events, classifications, and pose estimates out. Every
//! stage boundary is expressed with one of these types.
//!
//! Design principle: Types should make intent obvious. If a concept exists,
//! it gets a type. Never pass raw tuples or untyped collections across boundaries.
//!
//! All values are immutable once produced. Ownership moves forward through
//! the pipeline; nothing here is shared mutably between stages.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::orientation::Quaternion;

/// Degrees of freedom in a head pose: translation x, y, z then roll, pitch, yaw.
pub const POSE_DOF: usize = 6;

/// Index of each pose axis inside pose/velocity arrays.
pub mod axis {
    pub const X: usize = 0;
    pub const Y: usize = 1;
    pub const Z: usize = 2;
    pub const ROLL: usize = 3;
    pub const PITCH: usize = 4;
    pub const YAW: usize = 5;
}

/// A single waveform reading from the side-channel sensor.
///
/// This represents the minimal input contract: a monotonic timestamp and a
/// fixed-width vector of readings (one per measured rail or frequency bin).
/// Where the sample came from (live sensor or recorded file) is opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Monotonic timestamp in microseconds. Required for temporal ordering.
    pub timestamp_us: u64,

    /// Raw readings. Width must stay constant within a stream.
    pub channels: Vec<f32>,
}

impl Sample {
    /// Creates a new multi-channel sample.
    ///
    /// Assumptions:
    /// - timestamp_us must be strictly increasing within a stream
    /// - channels has the same width for every sample of the stream
    pub fn new(timestamp_us: u64, channels: Vec<f32>) -> Self {
        Self {
            timestamp_us,
            channels,
        }
    }

    /// Creates a single-channel sample.
    pub fn scalar(timestamp_us: u64, amplitude: f32) -> Self {
        Self::new(timestamp_us, vec![amplitude])
    }

    /// Instantaneous energy: mean of squared readings.
    pub fn energy(&self) -> f64 {
        if self.channels.is_empty() {
            return 0.0;
        }
        let sum: f64 = self
            .channels
            .iter()
            .map(|&v| (v as f64) * (v as f64))
            .sum();
        sum / self.channels.len() as f64
    }

    /// RMS amplitude across channels.
    pub fn amplitude(&self) -> f64 {
        self.energy().sqrt()
    }
}

// ============================================================================
// EVENTS AND FEATURES
// ============================================================================

/// Feature vector derived from one event.
///
/// Layout is fixed: energy, duration, peak, mean, then spectral bands.
/// Any dimension may be missing (`None`) when the capture layer dropped a
/// band or the event was too short to estimate it.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureVector {
    dims: Vec<Option<f64>>,
}

impl FeatureVector {
    /// Total event energy (sum of per-sample energy).
    pub const ENERGY: usize = 0;
    /// Event duration in milliseconds.
    pub const DURATION_MS: usize = 1;
    /// Peak RMS amplitude.
    pub const PEAK: usize = 2;
    /// Mean RMS amplitude.
    pub const MEAN: usize = 3;
    /// First spectral band energy. Bands follow contiguously.
    pub const SPECTRAL_START: usize = 4;

    pub fn new(dims: Vec<Option<f64>>) -> Self {
        Self { dims }
    }

    /// Build a fully-populated vector.
    pub fn from_values(values: &[f64]) -> Self {
        Self {
            dims: values.iter().map(|&v| Some(v)).collect(),
        }
    }

    /// Value of one dimension, `None` when missing or out of range.
    pub fn get(&self, index: usize) -> Option<f64> {
        self.dims.get(index).copied().flatten()
    }

    /// Declared width, including missing dimensions.
    pub fn len(&self) -> usize {
        self.dims.len()
    }

    /// Number of dimensions that carry a value.
    pub fn present_count(&self) -> usize {
        self.dims.iter().filter(|d| d.is_some()).count()
    }

    /// True when no dimension carries a value.
    pub fn is_empty(&self) -> bool {
        self.present_count() == 0
    }

    pub fn dims(&self) -> &[Option<f64>] {
        &self.dims
    }

    /// Mark one dimension missing. Used by capture layers that detect a
    /// corrupted band after feature extraction.
    pub fn drop_dimension(&mut self, index: usize) {
        if let Some(d) = self.dims.get_mut(index) {
            *d = None;
        }
    }
}

/// What a segmented window represents.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// One putative GPU rendering operation.
    Activity(FeatureVector),
    /// Prolonged silence. Means "no evidence available", never "user is still".
    IdleGap,
}

/// A bounded time window over the sample stream.
///
/// Interval is half-open: `[start_us, end_us)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    /// Per-session sequence number, strictly increasing.
    pub id: u64,
    pub start_us: u64,
    pub end_us: u64,
    pub kind: EventKind,
}

impl Event {
    pub fn activity(id: u64, start_us: u64, end_us: u64, features: FeatureVector) -> Self {
        Self {
            id,
            start_us,
            end_us,
            kind: EventKind::Activity(features),
        }
    }

    pub fn idle_gap(id: u64, start_us: u64, end_us: u64) -> Self {
        Self {
            id,
            start_us,
            end_us,
            kind: EventKind::IdleGap,
        }
    }

    pub fn duration_us(&self) -> u64 {
        self.end_us.saturating_sub(self.start_us)
    }

    pub fn is_idle_gap(&self) -> bool {
        matches!(self.kind, EventKind::IdleGap)
    }

    /// Feature vector for activity events.
    pub fn features(&self) -> Option<&FeatureVector> {
        match &self.kind {
            EventKind::Activity(f) => Some(f),
            EventKind::IdleGap => None,
        }
    }

    /// True if the two half-open intervals share any instant.
    pub fn overlaps(&self, other: &Event) -> bool {
        self.start_us < other.end_us && other.start_us < self.end_us
    }
}

// ============================================================================
// CLASSIFICATION TYPES
// ============================================================================

/// Semantic rendering label assigned by Phase I (e.g. "yaw_right_moderate").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SemanticLabel(pub String);

impl SemanticLabel {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SemanticLabel {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for SemanticLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One ranked match against the fingerprint store.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub label: SemanticLabel,
    /// Match score in [0.0, 1.0], already scaled by dimension overlap.
    pub score: f64,
    /// Training-sample count of the matching entry (tie-break key).
    pub sample_count: u32,
    /// RMS distance in tolerance units; the score is derived from it.
    pub normalized_distance: f64,
    /// Euclidean distance in feature units over the compared dimensions
    /// (final tie-break key).
    pub raw_distance: f64,
}

/// Outcome of classifying one activity event.
///
/// An empty candidate list is the explicit "unclassified" outcome, which is
/// distinct from a segmenter idle gap.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub event_id: u64,
    pub start_us: u64,
    pub end_us: u64,
    /// Sorted by descending score.
    pub candidates: Vec<Candidate>,
    /// Fraction of template dimensions actually compared for the best match.
    pub overlap_fraction: f64,
    /// Set when too few dimensions overlapped to trust the score.
    pub reduced_confidence: bool,
}

impl Classification {
    pub fn top(&self) -> Option<&Candidate> {
        self.candidates.first()
    }

    pub fn is_unclassified(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn duration_us(&self) -> u64 {
        self.end_us.saturating_sub(self.start_us)
    }
}

/// Input to the motion tracker: either a classification or an idle marker.
#[derive(Debug, Clone, PartialEq)]
pub enum Evidence {
    Classified(Classification),
    IdleGap { start_us: u64, end_us: u64 },
}

impl Evidence {
    /// The instant at which this evidence becomes known.
    pub fn timestamp_us(&self) -> u64 {
        match self {
            Evidence::Classified(c) => c.end_us,
            Evidence::IdleGap { end_us, .. } => *end_us,
        }
    }
}

// ============================================================================
// POSE AND TRAJECTORY TYPES
// ============================================================================

/// Whether an estimate absorbed any observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EstimateKind {
    /// At least one observation was fused on this tick.
    Fused,
    /// Pure dead-reckoning step.
    Predicted,
}

/// A 6-DoF head pose estimate with uncertainty.
///
/// Once emitted this is never mutated; corrections arrive as later estimates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoseEstimate {
    pub timestamp_us: u64,
    /// Pose mean: [x, y, z] in meters, [roll, pitch, yaw] in radians.
    pub pose: [f64; POSE_DOF],
    /// Velocity mean in the same axes, per second.
    pub velocity: [f64; POSE_DOF],
    /// Pose covariance, row-major.
    pub covariance: [[f64; POSE_DOF]; POSE_DOF],
    pub kind: EstimateKind,
    /// Confidence has collapsed; consumers should not trust the mean.
    pub low_confidence: bool,
    /// Covariance was reset to the wide prior on this tick.
    pub recalibrated: bool,
    /// Observations fused on this tick.
    pub fused_observations: u32,
    /// Observations rejected as outliers on this tick.
    pub rejected_observations: u32,
}

impl PoseEstimate {
    pub fn position(&self) -> [f64; 3] {
        [self.pose[axis::X], self.pose[axis::Y], self.pose[axis::Z]]
    }

    /// Head orientation as a unit quaternion.
    pub fn orientation(&self) -> Quaternion {
        Quaternion::from_euler(
            self.pose[axis::ROLL],
            self.pose[axis::PITCH],
            self.pose[axis::YAW],
        )
    }

    /// Pose laid out as `[x, y, z, i, j, k, w]`, the capture harness order.
    pub fn pose7(&self) -> [f64; 7] {
        let q = self.orientation();
        [
            self.pose[axis::X],
            self.pose[axis::Y],
            self.pose[axis::Z],
            q.xyz[0],
            q.xyz[1],
            q.xyz[2],
            q.w,
        ]
    }

    /// Sum of pose variances.
    pub fn variance_trace(&self) -> f64 {
        (0..POSE_DOF).map(|i| self.covariance[i][i]).sum()
    }

    /// RMS standard deviation across pose axes.
    pub fn uncertainty(&self) -> f64 {
        (self.variance_trace() / POSE_DOF as f64).max(0.0).sqrt()
    }

    pub fn is_prediction(&self) -> bool {
        self.kind == EstimateKind::Predicted
    }
}
