//! Side-Channel Motion Reconstruction Library
//!
//! Reconstructs a VR user's head motion from the power draw a GPU emits
//! while rendering. The waveform is cut into rendering events, each event is
//! matched against a fingerprint mapping learned offline, and the matches
//! are fused into a 6-DoF pose trajectory in real time.
//!
//! # Design Philosophy
//!
//! - **Evidence, not assumption**: silence is reported as "no evidence",
//!   never as "the head is still"; uncertainty grows instead.
//! - **Fail-loud behavior**: malformed or out-of-order samples end the
//!   session with an error rather than being repaired.
//! - **Never rewrite history**: an emitted estimate is final; corrections
//!   arrive as later estimates.
//! - **Bounded work per sample**: every stage is incremental.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use sidechannel_motion::{MappingStore, ReconstructionConfig, SessionContext};
//!
//! let store = Arc::new(MappingStore::from_json_str(&artifact_json)?);
//! let session = SessionContext::new(ReconstructionConfig::default(), store)?;
//! let (trajectory, report) = session.reconstruct_recorded(&samples)?;
//! for estimate in &trajectory {
//!     println!("{} {:?}", estimate.timestamp_us, estimate.pose7());
//! }
//! ```

pub mod beacon;
pub mod classifier;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod orientation;
pub mod segmentation;
pub mod session;
pub mod signal;
pub mod sink;
pub mod tracker;
pub mod types;
pub mod wire;

#[cfg(test)]
mod integration_tests;

// Re-export commonly used types
pub use beacon::{BeaconTimeline, SyncBeacon};
pub use classifier::{EventClassifier, MatchStrategy};
pub use config::{BackpressurePolicy, ReconstructionConfig};
pub use error::{ConfigError, DataIntegrityError, PipelineError, Result, SinkError};
pub use fingerprint::{MappingStore, FINGERPRINT_SCHEMA_VERSION};
pub use segmentation::{SegmentExt, WaveformSegmenter};
pub use session::{CancelToken, SessionContext, SessionReport};
pub use sink::{bounded, bounded_from, BoundedSink, JsonLinesSink, PoseSink, Trajectory, TrajectoryStream, WireSink};
pub use tracker::MotionTracker;
pub use types::{Classification, Event, EventKind, EstimateKind, PoseEstimate, Sample};
