//! Recursive head-motion estimation.
//!
//! Implements a linear Kalman filter over a 12-dimensional state:
//! - 6 pose components: x, y, z (m), roll, pitch, yaw (rad)
//! - 6 matching velocities (per second)
//!
//! The filter is driven by a fixed output clock. Between ticks it collects
//! evidence (classified events and idle markers); on each tick it predicts
//! forward with a constant-velocity model and fuses whatever motion hints the
//! collected classifications imply.
//!
//! Velocity hints observe the velocity block directly. Displacement hints
//! are summed over the tick and observed once, as the previous estimate's
//! pose plus the summed change; their variances add up the same way.
//!
//! `step` is a pure function over an explicit [`TrackerState`] value.
//! [`MotionTracker`] only schedules ticks and buffers evidence around it, so
//! the estimator can be tested and replayed without any hidden state.

use nalgebra::{SMatrix, SVector};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::config::TrackerConfig;
use crate::fingerprint::{HintKind, MappingStore, MotionHint};
use crate::orientation::wrap_angle;
use crate::types::{axis, Classification, EstimateKind, Evidence, PoseEstimate, POSE_DOF};

/// Pose plus velocity.
pub const STATE_DIM: usize = 2 * POSE_DOF;

pub type StateVector = SVector<f64, STATE_DIM>;
pub type StateCovariance = SMatrix<f64, STATE_DIM, STATE_DIM>;
type Observation = SVector<f64, POSE_DOF>;
type ObservationModel = SMatrix<f64, POSE_DOF, STATE_DIM>;
type InnovationCovariance = SMatrix<f64, POSE_DOF, POSE_DOF>;

/// Offset of the velocity block inside the state vector.
const VELOCITY_OFFSET: usize = POSE_DOF;

/// Smallest confidence used to weight an observation.
const MIN_OBSERVATION_WEIGHT: f64 = 1e-6;

/// Complete estimator state between two ticks.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackerState {
    pub mean: StateVector,
    pub covariance: StateCovariance,
    /// Time of the last emitted estimate (or the session origin).
    pub timestamp_us: u64,
    /// Consecutive ticks without an accepted observation.
    pub ticks_without_evidence: u32,
    /// Set on recalibration, cleared by the next fused observation.
    pub low_confidence: bool,
}

impl TrackerState {
    /// At rest at the origin with the configured initial uncertainty.
    pub fn initial(config: &TrackerConfig, origin_us: u64) -> Self {
        let mut covariance = StateCovariance::zeros();
        for i in 0..POSE_DOF {
            covariance[(i, i)] = config.initial_pose_variance;
            covariance[(VELOCITY_OFFSET + i, VELOCITY_OFFSET + i)] =
                config.initial_velocity_variance;
        }
        Self {
            mean: StateVector::zeros(),
            covariance,
            timestamp_us: origin_us,
            ticks_without_evidence: 0,
            low_confidence: false,
        }
    }

    pub fn pose(&self) -> [f64; POSE_DOF] {
        std::array::from_fn(|i| self.mean[i])
    }

    pub fn velocity(&self) -> [f64; POSE_DOF] {
        std::array::from_fn(|i| self.mean[VELOCITY_OFFSET + i])
    }

    /// Sum of pose variances.
    pub fn pose_variance_trace(&self) -> f64 {
        (0..POSE_DOF).map(|i| self.covariance[(i, i)]).sum()
    }
}

/// What happened to one piece of evidence during a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObservationOutcome {
    Fused,
    Rejected,
    NoEvidence,
}

/// Advance the estimator to `tick_us`, fusing `evidence`.
///
/// Pure: the input state is untouched. Evidence is applied in slice order.
pub fn step(
    state: &TrackerState,
    config: &TrackerConfig,
    store: &MappingStore,
    tick_us: u64,
    evidence: &[Evidence],
) -> (TrackerState, PoseEstimate) {
    let dt = tick_us.saturating_sub(state.timestamp_us) as f64 / 1_000_000.0;
    let (mut mean, mut covariance) = predict(&state.mean, &state.covariance, config, dt);

    let mut fused = 0u32;
    let mut rejected = 0u32;
    let mut displacement: Option<DisplacementSum> = None;

    for item in evidence {
        let Evidence::Classified(classification) = item else {
            continue;
        };
        let Some((hint, weight)) = hint_for(classification, store, config) else {
            continue;
        };

        let delta = Observation::from_row_slice(&hint.delta);
        let variance = Observation::from_fn(|i, _| hint.noise[i] * hint.noise[i] / weight);

        match hint.kind {
            HintKind::Velocity => {
                let outcome = observe(
                    &mut mean,
                    &mut covariance,
                    VELOCITY_OFFSET,
                    delta,
                    &variance,
                    config,
                );
                tally(outcome, 1, &mut fused, &mut rejected);
                debug!(
                    event = classification.event_id,
                    tick_us,
                    weight,
                    outcome = ?outcome,
                    "velocity observation"
                );
            }
            HintKind::Displacement => {
                let sum = displacement.get_or_insert_with(DisplacementSum::new);
                sum.delta += delta;
                sum.variance += variance;
                sum.count += 1;
            }
        }
    }

    if let Some(sum) = displacement {
        let anchor: Observation = state.mean.fixed_rows::<POSE_DOF>(0).into_owned();
        let outcome = observe(
            &mut mean,
            &mut covariance,
            0,
            anchor + sum.delta,
            &sum.variance,
            config,
        );
        tally(outcome, sum.count, &mut fused, &mut rejected);
        debug!(tick_us, hints = sum.count, outcome = ?outcome, "displacement observation");
    }

    let mut next = TrackerState {
        mean,
        covariance,
        timestamp_us: tick_us,
        ticks_without_evidence: state.ticks_without_evidence,
        low_confidence: state.low_confidence,
    };

    let mut recalibrated = false;
    if fused > 0 {
        next.ticks_without_evidence = 0;
        next.low_confidence = false;
    } else {
        next.ticks_without_evidence = state.ticks_without_evidence.saturating_add(1);
        if next.ticks_without_evidence == config.recalibration_run_length.saturating_add(1) {
            recalibrate(&mut next.covariance, config.recalibration_variance);
            next.low_confidence = true;
            recalibrated = true;
            warn!(
                tick_us,
                idle_ticks = next.ticks_without_evidence,
                "no evidence for too long, covariance reset to wide prior"
            );
        }
    }

    let estimate = PoseEstimate {
        timestamp_us: tick_us,
        pose: next.pose(),
        velocity: next.velocity(),
        covariance: std::array::from_fn(|i| std::array::from_fn(|j| next.covariance[(i, j)])),
        kind: if fused > 0 {
            EstimateKind::Fused
        } else {
            EstimateKind::Predicted
        },
        low_confidence: next.low_confidence,
        recalibrated,
        fused_observations: fused,
        rejected_observations: rejected,
    };

    (next, estimate)
}

/// Constant-velocity prediction over `dt` seconds.
fn predict(
    mean: &StateVector,
    covariance: &StateCovariance,
    config: &TrackerConfig,
    dt: f64,
) -> (StateVector, StateCovariance) {
    let mut transition = StateCovariance::identity();
    let mut process_noise = StateCovariance::zeros();
    for i in 0..POSE_DOF {
        transition[(i, VELOCITY_OFFSET + i)] = dt;
        process_noise[(i, i)] = config.pose_process_noise * dt;
        process_noise[(VELOCITY_OFFSET + i, VELOCITY_OFFSET + i)] =
            config.velocity_process_noise * dt;
    }

    let mut predicted = transition * mean;
    wrap_orientation(&mut predicted);
    let covariance = transition * covariance * transition.transpose() + process_noise;
    (predicted, covariance)
}

/// Motion hint and observation weight for a classification, if it carries
/// any evidence at all.
fn hint_for<'a>(
    classification: &Classification,
    store: &'a MappingStore,
    config: &TrackerConfig,
) -> Option<(&'a MotionHint, f64)> {
    let top = classification.top()?;
    let hint = store.motion_for(&top.label)?;
    let mut weight = top.score.clamp(MIN_OBSERVATION_WEIGHT, 1.0);
    if classification.reduced_confidence {
        weight /= config.reduced_confidence_noise_scale;
    }
    Some((hint, weight))
}

/// Displacement hints collected over one tick.
#[derive(Debug)]
struct DisplacementSum {
    delta: Observation,
    variance: Observation,
    count: u32,
}

impl DisplacementSum {
    fn new() -> Self {
        Self {
            delta: Observation::zeros(),
            variance: Observation::zeros(),
            count: 0,
        }
    }
}

fn tally(outcome: ObservationOutcome, count: u32, fused: &mut u32, rejected: &mut u32) {
    match outcome {
        ObservationOutcome::Fused => *fused += count,
        ObservationOutcome::Rejected => *rejected += count,
        ObservationOutcome::NoEvidence => {}
    }
}

/// Kalman update observing the 6-wide block at `offset` (pose or velocity).
fn observe(
    mean: &mut StateVector,
    covariance: &mut StateCovariance,
    offset: usize,
    measured: Observation,
    variance: &Observation,
    config: &TrackerConfig,
) -> ObservationOutcome {
    let mut h = ObservationModel::zeros();
    let mut r = InnovationCovariance::zeros();
    for i in 0..POSE_DOF {
        h[(i, offset + i)] = 1.0;
        r[(i, i)] = variance[i];
    }

    let mut innovation = measured - h * *mean;
    if offset == 0 {
        for i in [axis::ROLL, axis::PITCH, axis::YAW] {
            innovation[i] = wrap_angle(innovation[i]);
        }
    }

    let s = h * *covariance * h.transpose() + r;
    let outlier = (0..POSE_DOF).any(|i| {
        let sigma = s[(i, i)].max(0.0).sqrt();
        sigma > 0.0 && innovation[i].abs() / sigma > config.outlier_rejection_multiple
    });
    if outlier {
        return ObservationOutcome::Rejected;
    }

    let Some(s_inv) = s.try_inverse() else {
        return ObservationOutcome::NoEvidence;
    };

    let gain = *covariance * h.transpose() * s_inv;
    *mean += gain * innovation;
    wrap_orientation(mean);

    // Joseph form keeps the covariance symmetric and positive semi-definite.
    let i_kh = StateCovariance::identity() - gain * h;
    *covariance = i_kh * *covariance * i_kh.transpose() + gain * r * gain.transpose();
    ObservationOutcome::Fused
}

/// Widen every variance to at least the wide prior. Never shrinks.
fn recalibrate(covariance: &mut StateCovariance, variance: f64) {
    for i in 0..STATE_DIM {
        covariance[(i, i)] = covariance[(i, i)].max(variance);
    }
}

fn wrap_orientation(mean: &mut StateVector) {
    for i in [axis::ROLL, axis::PITCH, axis::YAW] {
        mean[i] = wrap_angle(mean[i]);
    }
}

/// Running counts across a tracker's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerStats {
    pub ticks: u64,
    pub fused_observations: u64,
    pub rejected_observations: u64,
    pub recalibrations: u64,
    pub late_evidence: u64,
}

/// Drives [`step`] on a fixed tick schedule.
///
/// Evidence whose timestamp falls in `(previous tick, tick]` is fused on
/// that tick. Evidence that arrives after its tick was already emitted is
/// fused on the next one; estimates are never revised.
pub struct MotionTracker {
    config: TrackerConfig,
    store: Arc<MappingStore>,
    state: Option<TrackerState>,
    next_tick_us: u64,
    buffered: Vec<Evidence>,
    stats: TrackerStats,
}

impl MotionTracker {
    pub fn new(config: TrackerConfig, store: Arc<MappingStore>) -> Self {
        Self {
            config,
            store,
            state: None,
            next_tick_us: 0,
            buffered: Vec::new(),
            stats: TrackerStats::default(),
        }
    }

    /// Anchor the tick schedule. Ignored once started.
    pub fn start(&mut self, origin_us: u64) {
        if self.state.is_none() {
            self.state = Some(TrackerState::initial(&self.config, origin_us));
            self.next_tick_us = origin_us + self.config.tick_interval_us;
        }
    }

    pub fn is_started(&self) -> bool {
        self.state.is_some()
    }

    /// Queue one piece of evidence, emitting every tick strictly before it.
    pub fn push(&mut self, evidence: Evidence) -> Vec<PoseEstimate> {
        let t = evidence.timestamp_us();
        self.start(t);

        let mut estimates = Vec::new();
        while self.next_tick_us < t {
            estimates.push(self.emit_tick());
        }

        let previous_tick = self.next_tick_us - self.config.tick_interval_us;
        if self.stats.ticks > 0 && t <= previous_tick {
            self.stats.late_evidence += 1;
            debug!(timestamp_us = t, previous_tick, "late evidence deferred to next tick");
        }
        self.buffered.push(evidence);
        estimates
    }

    /// Emit every tick at or before `now_us`.
    pub fn advance_to(&mut self, now_us: u64) -> Vec<PoseEstimate> {
        let mut estimates = Vec::new();
        if self.state.is_none() {
            return estimates;
        }
        while self.next_tick_us <= now_us {
            estimates.push(self.emit_tick());
        }
        estimates
    }

    /// Emit every tick up to `end_us`, plus one final tick if evidence is
    /// still waiting.
    pub fn finish(&mut self, end_us: u64) -> Vec<PoseEstimate> {
        let mut estimates = self.advance_to(end_us);
        if self.state.is_some() && !self.buffered.is_empty() {
            estimates.push(self.emit_tick());
        }
        estimates
    }

    fn emit_tick(&mut self) -> PoseEstimate {
        let tick_us = self.next_tick_us;
        let evidence = std::mem::take(&mut self.buffered);
        let state = self
            .state
            .take()
            .unwrap_or_else(|| TrackerState::initial(&self.config, tick_us));

        let (next, estimate) = step(&state, &self.config, &self.store, tick_us, &evidence);

        self.stats.ticks += 1;
        self.stats.fused_observations += estimate.fused_observations as u64;
        self.stats.rejected_observations += estimate.rejected_observations as u64;
        if estimate.recalibrated {
            self.stats.recalibrations += 1;
        }

        self.state = Some(next);
        self.next_tick_us = tick_us + self.config.tick_interval_us;
        estimate
    }

    pub fn state(&self) -> Option<&TrackerState> {
        self.state.as_ref()
    }

    pub fn stats(&self) -> TrackerStats {
        self.stats
    }

    pub fn next_tick_us(&self) -> u64 {
        self.next_tick_us
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }
}
