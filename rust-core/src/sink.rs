//! Trajectory sinks.
//!
//! The boundary between reconstruction and whoever consumes the trajectory:
//! - **Trajectory**: in-memory append-only record, for recorded captures
//! - **bounded**: channel pair with an explicit back-pressure policy, for
//!   live consumers running on another thread
//! - **JsonLinesSink**: newline-delimited JSON, one record per estimate
//! - **WireSink**: the compact binary framing from [`crate::wire`]
//!
//! Every sink enforces strictly increasing timestamps. An estimate that would
//! reorder or rewrite history is refused with [`SinkError::OutOfOrder`].

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::config::{BackpressurePolicy, SinkConfig};
use crate::error::SinkError;
use crate::types::{EstimateKind, PoseEstimate, POSE_DOF};
use crate::wire::{WireHeader, WirePose, WireSessionSummary, WireWriter};

/// Receives pose estimates in timestamp order.
pub trait PoseSink {
    fn emit(&mut self, estimate: PoseEstimate) -> Result<(), SinkError>;

    /// Push buffered output to the underlying medium.
    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    /// Estimates this sink discarded under back-pressure.
    fn dropped(&self) -> u64 {
        0
    }
}

impl<S: PoseSink + ?Sized> PoseSink for &mut S {
    fn emit(&mut self, estimate: PoseEstimate) -> Result<(), SinkError> {
        (**self).emit(estimate)
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        (**self).flush()
    }

    fn dropped(&self) -> u64 {
        (**self).dropped()
    }
}

/// Tracks the last accepted timestamp.
#[derive(Debug, Clone, Copy, Default)]
struct OrderGuard {
    last_us: Option<u64>,
}

impl OrderGuard {
    fn admit(&mut self, timestamp_us: u64) -> Result<(), SinkError> {
        if let Some(previous) = self.last_us {
            if timestamp_us <= previous {
                return Err(SinkError::OutOfOrder {
                    previous_us: previous,
                    current_us: timestamp_us,
                });
            }
        }
        self.last_us = Some(timestamp_us);
        Ok(())
    }
}

// ============================================================================
// IN-MEMORY TRAJECTORY
// ============================================================================

/// Append-only ordered sequence of pose estimates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trajectory {
    estimates: Vec<PoseEstimate>,
}

impl Trajectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn estimates(&self) -> &[PoseEstimate] {
        &self.estimates
    }

    pub fn len(&self) -> usize {
        self.estimates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.estimates.is_empty()
    }

    pub fn first(&self) -> Option<&PoseEstimate> {
        self.estimates.first()
    }

    pub fn last(&self) -> Option<&PoseEstimate> {
        self.estimates.last()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, PoseEstimate> {
        self.estimates.iter()
    }

    /// Estimates with `start_us <= timestamp < end_us`.
    pub fn between(&self, start_us: u64, end_us: u64) -> &[PoseEstimate] {
        let lo = self.estimates.partition_point(|e| e.timestamp_us < start_us);
        let hi = self.estimates.partition_point(|e| e.timestamp_us < end_us);
        &self.estimates[lo..hi.max(lo)]
    }

    /// Count of estimates that fused at least one observation.
    pub fn fused_count(&self) -> usize {
        self.estimates
            .iter()
            .filter(|e| e.kind == EstimateKind::Fused)
            .count()
    }

    pub fn into_vec(self) -> Vec<PoseEstimate> {
        self.estimates
    }
}

impl PoseSink for Trajectory {
    fn emit(&mut self, estimate: PoseEstimate) -> Result<(), SinkError> {
        if let Some(last) = self.estimates.last() {
            if estimate.timestamp_us <= last.timestamp_us {
                return Err(SinkError::OutOfOrder {
                    previous_us: last.timestamp_us,
                    current_us: estimate.timestamp_us,
                });
            }
        }
        self.estimates.push(estimate);
        Ok(())
    }
}

impl<'a> IntoIterator for &'a Trajectory {
    type Item = &'a PoseEstimate;
    type IntoIter = std::slice::Iter<'a, PoseEstimate>;

    fn into_iter(self) -> Self::IntoIter {
        self.estimates.iter()
    }
}

// ============================================================================
// BOUNDED CHANNEL SINK
// ============================================================================

/// Create a bounded producer/consumer pair.
///
/// With [`BackpressurePolicy::Block`] the producer waits for the consumer.
/// With [`BackpressurePolicy::DropOldest`] the oldest buffered estimate is
/// evicted and counted instead.
pub fn bounded(capacity: usize, policy: BackpressurePolicy) -> (BoundedSink, TrajectoryStream) {
    let capacity = capacity.max(1);
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    let dropped = Arc::new(AtomicU64::new(0));
    let closed = Arc::new(AtomicBool::new(false));

    let evict = match policy {
        BackpressurePolicy::Block => None,
        BackpressurePolicy::DropOldest => Some(rx.clone()),
    };

    let sink = BoundedSink {
        tx,
        evict,
        capacity,
        policy,
        dropped: Arc::clone(&dropped),
        closed: Arc::clone(&closed),
        order: OrderGuard::default(),
    };
    let stream = TrajectoryStream {
        rx,
        dropped,
        closed,
    };
    (sink, stream)
}

/// [`bounded`] with the capacity and policy from a [`SinkConfig`].
pub fn bounded_from(config: &SinkConfig) -> (BoundedSink, TrajectoryStream) {
    bounded(config.capacity, config.policy)
}

/// Producer half of [`bounded`].
pub struct BoundedSink {
    tx: Sender<PoseEstimate>,
    /// Receiver clone used only to evict under `DropOldest`.
    evict: Option<Receiver<PoseEstimate>>,
    capacity: usize,
    policy: BackpressurePolicy,
    dropped: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
    order: OrderGuard,
}

impl BoundedSink {
    pub fn policy(&self) -> BackpressurePolicy {
        self.policy
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl PoseSink for BoundedSink {
    fn emit(&mut self, estimate: PoseEstimate) -> Result<(), SinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SinkError::Disconnected);
        }
        self.order.admit(estimate.timestamp_us)?;

        let Some(evict) = self.evict.as_ref() else {
            return self.tx.send(estimate).map_err(|_| SinkError::Disconnected);
        };

        let mut pending = estimate;
        loop {
            match self.tx.try_send(pending) {
                Ok(()) => return Ok(()),
                Err(TrySendError::Disconnected(_)) => return Err(SinkError::Disconnected),
                Err(TrySendError::Full(back)) => {
                    pending = back;
                    if let Ok(oldest) = evict.try_recv() {
                        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        warn!(
                            evicted_us = oldest.timestamp_us,
                            dropped = total,
                            "trajectory buffer full, oldest estimate dropped"
                        );
                    }
                }
            }
        }
    }

    fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Consumer half of [`bounded`]. Iterates until the producer is dropped.
pub struct TrajectoryStream {
    rx: Receiver<PoseEstimate>,
    dropped: Arc<AtomicU64>,
    closed: Arc<AtomicBool>,
}

impl TrajectoryStream {
    /// Estimates the producer had to evict.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Currently buffered estimates.
    pub fn buffered(&self) -> usize {
        self.rx.len()
    }

    pub fn try_next(&self) -> Option<PoseEstimate> {
        self.rx.try_recv().ok()
    }

    /// Wait up to `timeout` for the next estimate.
    ///
    /// `Ok(None)` means the wait timed out; an error means the producer is
    /// gone and the buffer is empty.
    pub fn next_timeout(&self, timeout: Duration) -> Result<Option<PoseEstimate>, SinkError> {
        match self.rx.recv_timeout(timeout) {
            Ok(estimate) => Ok(Some(estimate)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(SinkError::Disconnected),
        }
    }
}

impl Iterator for TrajectoryStream {
    type Item = PoseEstimate;

    fn next(&mut self) -> Option<PoseEstimate> {
        self.rx.recv().ok()
    }
}

impl Drop for TrajectoryStream {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Release);
    }
}

// ============================================================================
// JSON LINES SINK
// ============================================================================

/// One trajectory line as written by [`JsonLinesSink`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryRecord {
    pub session: String,
    pub seq: u64,
    pub timestamp_us: u64,
    /// `[x, y, z, i, j, k, w]`
    pub pose: [f64; 7],
    /// Canonical `[roll, pitch, yaw]` in radians
    pub euler: [f64; 3],
    /// Unit view direction, +x at rest
    pub gaze: [f64; 3],
    pub velocity: [f64; POSE_DOF],
    /// Diagonal of the pose covariance.
    pub variance: [f64; POSE_DOF],
    pub kind: EstimateKind,
    pub low_confidence: bool,
    pub recalibrated: bool,
}

impl TrajectoryRecord {
    pub fn from_estimate(session: &str, seq: u64, estimate: &PoseEstimate) -> Self {
        let orientation = estimate.orientation();
        Self {
            session: session.to_string(),
            seq,
            timestamp_us: estimate.timestamp_us,
            pose: estimate.pose7(),
            euler: orientation.to_euler(),
            gaze: orientation.gaze_direction(),
            velocity: estimate.velocity,
            variance: std::array::from_fn(|i| estimate.covariance[i][i]),
            kind: estimate.kind,
            low_confidence: estimate.low_confidence,
            recalibrated: estimate.recalibrated,
        }
    }
}

/// Writes one JSON object per line.
pub struct JsonLinesSink<W: Write> {
    writer: W,
    session: String,
    sequence: u64,
    order: OrderGuard,
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W, session: impl Into<String>) -> Self {
        Self {
            writer,
            session: session.into(),
            sequence: 0,
            order: OrderGuard::default(),
        }
    }

    /// Lines written so far.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn into_inner(mut self) -> Result<W, SinkError> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

impl<W: Write> PoseSink for JsonLinesSink<W> {
    fn emit(&mut self, estimate: PoseEstimate) -> Result<(), SinkError> {
        self.order.admit(estimate.timestamp_us)?;
        let record = TrajectoryRecord::from_estimate(&self.session, self.sequence, &estimate);
        serde_json::to_writer(&mut self.writer, &record)?;
        self.writer.write_all(b"\n")?;
        self.sequence += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}

// ============================================================================
// BINARY WIRE SINK
// ============================================================================

/// Estimates buffered before a write to the underlying medium.
const WIRE_BATCH: usize = 64;

/// Frames estimates with the binary wire format.
pub struct WireSink<W: Write> {
    writer: W,
    wire: WireWriter,
    order: OrderGuard,
}

impl<W: Write> WireSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            wire: WireWriter::new(WIRE_BATCH * (WireHeader::SIZE + WirePose::SIZE)),
            order: OrderGuard::default(),
        }
    }

    /// Messages framed so far.
    pub fn sequence(&self) -> u64 {
        self.wire.sequence()
    }

    /// Append the end-of-session summary and flush.
    pub fn write_summary(&mut self, summary: &WireSessionSummary) -> Result<(), SinkError> {
        if !self.wire.write_session_summary(summary) {
            self.drain()?;
            self.wire.write_session_summary(summary);
        }
        self.flush()
    }

    pub fn into_inner(mut self) -> Result<W, SinkError> {
        self.flush()?;
        Ok(self.writer)
    }

    fn drain(&mut self) -> Result<(), SinkError> {
        self.writer.write_all(self.wire.as_bytes())?;
        self.wire.reset();
        Ok(())
    }
}

impl<W: Write> PoseSink for WireSink<W> {
    fn emit(&mut self, estimate: PoseEstimate) -> Result<(), SinkError> {
        self.order.admit(estimate.timestamp_us)?;
        if !self.wire.write_estimate(&estimate) {
            self.drain()?;
            self.wire.write_estimate(&estimate);
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.drain()?;
        self.writer.flush()?;
        Ok(())
    }
}
