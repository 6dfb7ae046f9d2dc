//! Fingerprint mapping store.
//!
//! The store is the read-only artifact produced by offline protocol mapping:
//! a set of feature templates, each tagged with the semantic rendering label
//! it stands for, plus the motion hint that label implies for the tracker.
//!
//! The store is loaded once per artifact and shared behind an `Arc` by every
//! session; nothing in this module mutates it after load.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Read;

use crate::error::ConfigError;
use crate::types::{FeatureVector, SemanticLabel, POSE_DOF};

/// Schema version this build of the core understands.
pub const FINGERPRINT_SCHEMA_VERSION: u32 = 1;

/// One learned workload template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FingerprintEntry {
    pub label: SemanticLabel,

    /// Mean feature vector of the training events. Missing dimensions are
    /// simply not compared.
    pub template: FeatureVector,

    /// Training events behind this template. More samples = tighter match.
    pub sample_count: u32,

    /// Per-dimension spread (std dev) of the training events.
    pub spread: Vec<f64>,
}

impl FingerprintEntry {
    /// Matching tolerance for one dimension.
    ///
    /// The spread is widened for thinly-trained entries: `spread · (1 + 1/√n)`.
    pub fn tolerance(&self, dim: usize) -> Option<f64> {
        let spread = *self.spread.get(dim)?;
        let n = self.sample_count.max(1) as f64;
        Some(spread * (1.0 + 1.0 / n.sqrt()))
    }
}

/// How a label moves the head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HintKind {
    /// `delta` is a velocity (per second) observed directly.
    Velocity,
    /// `delta` is a pose change relative to the previous estimate.
    Displacement,
}

/// Motion implied by a semantic label.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionHint {
    pub kind: HintKind,

    /// [x, y, z, roll, pitch, yaw] in meters / radians (per second for
    /// velocity hints).
    pub delta: [f64; POSE_DOF],

    /// Per-axis measurement std dev at full confidence.
    pub noise: [f64; POSE_DOF],
}

/// Immutable set of fingerprint entries and motion hints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MappingStore {
    /// Layout version of the artifact. Checked against the core's version
    /// before a session starts.
    pub schema_version: u32,

    /// Free-form version of the trained artifact itself.
    #[serde(default)]
    pub artifact_version: String,

    pub entries: Vec<FingerprintEntry>,

    #[serde(default)]
    pub motion_hints: HashMap<SemanticLabel, MotionHint>,
}

impl MappingStore {
    /// Build a store in memory, validating its structure.
    pub fn new(
        schema_version: u32,
        artifact_version: impl Into<String>,
        entries: Vec<FingerprintEntry>,
        motion_hints: HashMap<SemanticLabel, MotionHint>,
    ) -> Result<Self, ConfigError> {
        let store = Self {
            schema_version,
            artifact_version: artifact_version.into(),
            entries,
            motion_hints,
        };
        store.validate()?;
        Ok(store)
    }

    /// Parse and validate a JSON artifact.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let store: MappingStore = serde_json::from_str(json)?;
        store.validate()?;
        Ok(store)
    }

    /// Parse and validate a JSON artifact from any reader.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, ConfigError> {
        let store: MappingStore = serde_json::from_reader(reader)?;
        store.validate()?;
        Ok(store)
    }

    /// Structural checks that do not depend on the core's schema version.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for entry in &self.entries {
            if entry.spread.len() != entry.template.len() {
                return Err(ConfigError::InvalidArtifact(format!(
                    "entry '{}' has {} spreads for {} template dimensions",
                    entry.label,
                    entry.spread.len(),
                    entry.template.len()
                )));
            }
            if let Some(bad) = entry.spread.iter().find(|s| !(s.is_finite() && **s > 0.0)) {
                return Err(ConfigError::InvalidArtifact(format!(
                    "entry '{}' has non-positive spread {}",
                    entry.label, bad
                )));
            }
            if entry.template.dims().iter().flatten().any(|v| !v.is_finite()) {
                return Err(ConfigError::InvalidArtifact(format!(
                    "entry '{}' has a non-finite template value",
                    entry.label
                )));
            }
        }

        for (label, hint) in &self.motion_hints {
            let finite = hint.delta.iter().all(|v| v.is_finite());
            let positive = hint.noise.iter().all(|n| n.is_finite() && *n > 0.0);
            if !finite || !positive {
                return Err(ConfigError::InvalidArtifact(format!(
                    "motion hint for '{}' needs finite deltas and positive noise",
                    label
                )));
            }
        }
        Ok(())
    }

    /// Refuse artifacts built for a different schema.
    pub fn check_schema(&self, expected: u32) -> Result<(), ConfigError> {
        if self.schema_version != expected {
            return Err(ConfigError::SchemaMismatch {
                expected,
                found: self.schema_version,
            });
        }
        Ok(())
    }

    pub fn entries(&self) -> &[FingerprintEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Motion implied by a label, if the artifact knows one.
    pub fn motion_for(&self, label: &SemanticLabel) -> Option<&MotionHint> {
        self.motion_hints.get(label)
    }
}
