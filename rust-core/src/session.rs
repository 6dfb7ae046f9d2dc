/// Per-session reconstruction pipeline.
///
/// This module wires the stages into one forward flow:
/// 1. **Segmentation**: samples become activity events and idle markers
/// 2. **Classification**: each activity event is ranked against the store
/// 3. **Tracking**: classifications become evidence on a fixed tick grid
/// 4. **Sink**: estimates leave in strict timestamp order
///
/// A [`SessionContext`] owns everything one session needs (configuration,
/// shared mapping store, cancellation flag). Sessions share nothing mutable,
/// so any number of them can run side by side on their own threads.
///
/// The tracker only advances to the *settled horizon*: the latest instant
/// for which no further event can still appear. Segments wait one merge
/// window before they are final, so the horizon trails the newest sample by
/// that window.
use crossbeam_channel::{Receiver, RecvTimeoutError};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::classifier::EventClassifier;
use crate::config::ReconstructionConfig;
use crate::error::{ConfigError, Result};
use crate::fingerprint::{MappingStore, FINGERPRINT_SCHEMA_VERSION};
use crate::segmentation::{validate_samples, WaveformSegmenter};
use crate::sink::{bounded_from, BoundedSink, PoseSink, Trajectory, TrajectoryStream};
use crate::tracker::MotionTracker;
use crate::types::{Evidence, EventKind, PoseEstimate, Sample};
use crate::wire::WireSessionSummary;

/// Cooperative cancellation flag shared between a session and its owner.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Outcome of one session.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionReport {
    pub session: String,
    /// The session stopped on request before its input ended.
    pub cancelled: bool,
    pub samples: u64,
    pub late_samples: u64,
    pub events: u64,
    pub idle_gaps: u64,
    pub glitches: u64,
    pub classified: u64,
    pub unclassified: u64,
    pub estimates: u64,
    pub fused_observations: u64,
    pub rejected_observations: u64,
    pub recalibrations: u64,
    pub late_evidence: u64,
    /// Estimates a lossy sink had to discard.
    pub dropped: u64,
    pub first_sample_us: Option<u64>,
    pub last_sample_us: Option<u64>,
}

impl SessionReport {
    /// Compact summary record for the binary wire format.
    pub fn to_wire(&self) -> WireSessionSummary {
        let narrow = |v: u64| u32::try_from(v).unwrap_or(u32::MAX);
        WireSessionSummary {
            start_us: self.first_sample_us.unwrap_or(0),
            end_us: self.last_sample_us.unwrap_or(0),
            estimates: narrow(self.estimates),
            events: narrow(self.events),
            idle_gaps: narrow(self.idle_gaps),
            unclassified: narrow(self.unclassified),
            rejected_observations: narrow(self.rejected_observations),
            dropped: narrow(self.dropped),
            recalibrations: u16::try_from(self.recalibrations).unwrap_or(u16::MAX),
            flags: if self.cancelled {
                WireSessionSummary::FLAG_CANCELLED
            } else {
                0
            },
        }
    }
}

/// Everything one reconstruction session needs. No globals.
#[derive(Debug, Clone)]
pub struct SessionContext {
    id: String,
    config: ReconstructionConfig,
    store: Arc<MappingStore>,
    cancel: CancelToken,
}

impl SessionContext {
    /// Validate the configuration and the artifact's schema up front, so a
    /// mismatch fails before any sample is looked at.
    pub fn new(config: ReconstructionConfig, store: Arc<MappingStore>) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        store.check_schema(FINGERPRINT_SCHEMA_VERSION)?;
        Ok(Self {
            id: String::from("session"),
            config,
            store,
            cancel: CancelToken::new(),
        })
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &ReconstructionConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<MappingStore> {
        &self.store
    }

    /// Bounded estimate channel sized and policed by this session's sink
    /// configuration.
    pub fn trajectory_channel(&self) -> (BoundedSink, TrajectoryStream) {
        bounded_from(&self.config.sink)
    }

    /// Handle that stops this session's runs at the next stage boundary.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run over any sample iterator, emitting into `sink` as estimates
    /// settle.
    pub fn run<I, S>(&self, samples: I, sink: &mut S) -> Result<SessionReport>
    where
        I: IntoIterator<Item = Sample>,
        S: PoseSink + ?Sized,
    {
        let mut pipeline = SessionPipeline::new(self);
        info!(session = %self.id, artifact = %self.store.artifact_version, "session started");

        for sample in samples {
            if self.cancel.is_cancelled() || pipeline.ingest(&sample, sink)? == Flow::Cancelled {
                return pipeline.cancelled(sink);
            }
        }
        pipeline.finish(sink)
    }

    /// Reconstruct a recorded capture in one go.
    ///
    /// The whole capture is validated before anything is emitted, so a bad
    /// sample anywhere yields an error and no trajectory at all.
    pub fn reconstruct_recorded(&self, samples: &[Sample]) -> Result<(Trajectory, SessionReport)> {
        validate_samples(samples)?;
        let mut trajectory = Trajectory::new();
        let report = self.run(samples.iter().cloned(), &mut trajectory)?;
        Ok((trajectory, report))
    }

    /// Run against a live sample feed.
    ///
    /// When no sample arrives within `max_sample_wait_us` the segmenter is
    /// told the stream is silent up to `last + max_sample_wait_us` on the
    /// sample clock. Ends when every sender is dropped.
    pub fn run_live<S>(&self, samples: &Receiver<Sample>, sink: &mut S) -> Result<SessionReport>
    where
        S: PoseSink + ?Sized,
    {
        let wait_us = self.config.max_sample_wait_us;
        let wait = Duration::from_micros(wait_us);
        let mut pipeline = SessionPipeline::new(self);
        let mut clock_us: Option<u64> = None;
        info!(session = %self.id, wait_us, "live session started");

        loop {
            if self.cancel.is_cancelled() {
                return pipeline.cancelled(sink);
            }
            match samples.recv_timeout(wait) {
                Ok(sample) => {
                    let t = sample.timestamp_us;
                    if pipeline.ingest(&sample, sink)? == Flow::Cancelled {
                        return pipeline.cancelled(sink);
                    }
                    clock_us = Some(clock_us.map_or(t, |c| c.max(t)));
                }
                Err(RecvTimeoutError::Timeout) => {
                    if let Some(clock) = clock_us {
                        let now = clock + wait_us;
                        debug!(session = %self.id, now_us = now, "sample feed stalled");
                        if pipeline.idle(now, sink)? == Flow::Cancelled {
                            return pipeline.cancelled(sink);
                        }
                        clock_us = Some(now);
                    }
                }
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        pipeline.finish(sink)
    }
}

/// Whether a pipeline step ran to completion or stopped on cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Cancelled,
}

/// Mutable per-run state. Built fresh for every run.
struct SessionPipeline<'a> {
    ctx: &'a SessionContext,
    segmenter: WaveformSegmenter,
    classifier: EventClassifier,
    tracker: MotionTracker,
    report: SessionReport,
}

impl<'a> SessionPipeline<'a> {
    fn new(ctx: &'a SessionContext) -> Self {
        let config = &ctx.config;
        Self {
            ctx,
            segmenter: WaveformSegmenter::new(config.segmenter.clone()),
            classifier: EventClassifier::new(Arc::clone(&ctx.store), config.classifier.clone()),
            tracker: MotionTracker::new(config.tracker.clone(), Arc::clone(&ctx.store)),
            report: SessionReport {
                session: ctx.id.clone(),
                ..Default::default()
            },
        }
    }

    fn ingest<S: PoseSink + ?Sized>(&mut self, sample: &Sample, sink: &mut S) -> Result<Flow> {
        self.segmenter.process_sample(sample)?;

        let t = sample.timestamp_us;
        self.report.samples += 1;
        self.report.first_sample_us.get_or_insert(t);
        self.report.last_sample_us = Some(t);
        self.tracker.start(t);

        if self.drain_events(sink)? == Flow::Cancelled {
            return Ok(Flow::Cancelled);
        }
        let horizon = t.saturating_sub(self.ctx.config.segmenter.merge_window_us);
        let settled = self.tracker.advance_to(horizon);
        self.emit_all(settled, sink)?;
        Ok(Flow::Continue)
    }

    /// Silence up to `now_us`: everything before it is final.
    fn idle<S: PoseSink + ?Sized>(&mut self, now_us: u64, sink: &mut S) -> Result<Flow> {
        self.segmenter.mark_idle(now_us);
        if self.drain_events(sink)? == Flow::Cancelled {
            return Ok(Flow::Cancelled);
        }
        let settled = self.tracker.advance_to(now_us);
        self.emit_all(settled, sink)?;
        Ok(Flow::Continue)
    }

    /// Classify and track every finished event. Stops before taking the
    /// next event once the session is cancelled.
    fn drain_events<S: PoseSink + ?Sized>(&mut self, sink: &mut S) -> Result<Flow> {
        loop {
            if self.ctx.cancel.is_cancelled() {
                return Ok(Flow::Cancelled);
            }
            let Some(event) = self.segmenter.next_event() else {
                return Ok(Flow::Continue);
            };
            let evidence = match &event.kind {
                EventKind::IdleGap => {
                    self.report.idle_gaps += 1;
                    Evidence::IdleGap {
                        start_us: event.start_us,
                        end_us: event.end_us,
                    }
                }
                EventKind::Activity(_) => {
                    self.report.events += 1;
                    match self.classifier.classify(&event) {
                        Some(classification) => {
                            if classification.is_unclassified() {
                                self.report.unclassified += 1;
                            } else {
                                self.report.classified += 1;
                            }
                            Evidence::Classified(classification)
                        }
                        None => continue,
                    }
                }
            };
            let estimates = self.tracker.push(evidence);
            self.emit_all(estimates, sink)?;
        }
    }

    fn emit_all<S: PoseSink + ?Sized>(&mut self, estimates: Vec<PoseEstimate>, sink: &mut S) -> Result<()> {
        for estimate in estimates {
            sink.emit(estimate)?;
            self.report.estimates += 1;
        }
        Ok(())
    }

    fn finish<S: PoseSink + ?Sized>(mut self, sink: &mut S) -> Result<SessionReport> {
        self.segmenter.finish();
        if self.drain_events(sink)? == Flow::Cancelled {
            return self.cancelled(sink);
        }
        if let Some(end) = self.report.last_sample_us {
            let tail = self.tracker.finish(end);
            self.emit_all(tail, sink)?;
        }
        sink.flush()?;
        Ok(self.close(sink))
    }

    fn cancelled<S: PoseSink + ?Sized>(mut self, sink: &mut S) -> Result<SessionReport> {
        self.report.cancelled = true;
        sink.flush()?;
        Ok(self.close(sink))
    }

    fn close<S: PoseSink + ?Sized>(mut self, sink: &S) -> SessionReport {
        let stats = self.tracker.stats();
        let report = &mut self.report;
        report.glitches = self.segmenter.glitches_discarded();
        report.late_samples = self.segmenter.late_samples();
        report.fused_observations = stats.fused_observations;
        report.rejected_observations = stats.rejected_observations;
        report.recalibrations = stats.recalibrations;
        report.late_evidence = stats.late_evidence;
        report.dropped = sink.dropped();

        info!(
            session = %report.session,
            cancelled = report.cancelled,
            samples = report.samples,
            events = report.events,
            idle_gaps = report.idle_gaps,
            estimates = report.estimates,
            rejected = report.rejected_observations,
            dropped = report.dropped,
            "session finished"
        );
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackpressurePolicy;
    use crate::error::PipelineError;
    use std::collections::HashMap;
    use std::thread;

    fn context(schema_version: u32) -> std::result::Result<SessionContext, ConfigError> {
        let store = MappingStore {
            schema_version,
            artifact_version: "test".into(),
            entries: Vec::new(),
            motion_hints: HashMap::new(),
        };
        SessionContext::new(ReconstructionConfig::default(), Arc::new(store))
    }

    fn quiet(n: u64) -> Vec<Sample> {
        (0..n).map(|i| Sample::scalar(i * 1_000, 0.01)).collect()
    }

    #[test]
    fn test_schema_mismatch_refused() {
        let err = context(FINGERPRINT_SCHEMA_VERSION + 1).unwrap_err();
        assert!(matches!(err, ConfigError::SchemaMismatch { .. }));
    }

    #[test]
    fn test_invalid_config_refused() {
        let mut config = ReconstructionConfig::default();
        config.tracker.tick_interval_us = 0;
        let store = Arc::new(MappingStore {
            schema_version: FINGERPRINT_SCHEMA_VERSION,
            artifact_version: String::new(),
            entries: Vec::new(),
            motion_hints: HashMap::new(),
        });
        assert!(SessionContext::new(config, store).is_err());
    }

    #[test]
    fn test_quiet_run_predicts_on_tick_grid() {
        let ctx = context(FINGERPRINT_SCHEMA_VERSION).unwrap().with_id("quiet");
        let (trajectory, report) = ctx.reconstruct_recorded(&quiet(1_001)).unwrap();

        // one second of samples at the default 100 ms tick
        assert_eq!(trajectory.len(), 10);
        assert_eq!(report.estimates, 10);
        assert_eq!(report.session, "quiet");
        assert_eq!(report.first_sample_us, Some(0));
        assert_eq!(report.last_sample_us, Some(1_000_000));
        assert!(trajectory.iter().all(|e| e.is_prediction()));
    }

    #[test]
    fn test_recorded_rejects_bad_ordering_before_emitting() {
        let ctx = context(FINGERPRINT_SCHEMA_VERSION).unwrap();
        let mut samples = quiet(500);
        samples[400].timestamp_us = samples[10].timestamp_us;

        let err = ctx.reconstruct_recorded(&samples).unwrap_err();
        assert!(err.is_data_integrity());
    }

    #[test]
    fn test_streaming_run_stops_at_bad_sample() {
        let ctx = context(FINGERPRINT_SCHEMA_VERSION).unwrap();
        let mut samples = quiet(500);
        samples[400].timestamp_us = samples[10].timestamp_us;

        let mut trajectory = Trajectory::new();
        let err = ctx.run(samples, &mut trajectory).unwrap_err();
        assert!(matches!(err, PipelineError::DataIntegrity(_)));
        // estimates before the fault stand
        assert!(!trajectory.is_empty());
    }

    #[test]
    fn test_cancel_before_run() {
        let ctx = context(FINGERPRINT_SCHEMA_VERSION).unwrap();
        ctx.cancel_token().cancel();

        let mut trajectory = Trajectory::new();
        let report = ctx.run(quiet(1_000), &mut trajectory).unwrap();
        assert!(report.cancelled);
        assert_eq!(report.samples, 0);
        assert!(trajectory.is_empty());
        assert_eq!(report.to_wire().flags, WireSessionSummary::FLAG_CANCELLED);
    }

    /// Cancels its session as soon as the first estimate arrives.
    struct CancelOnFirst {
        token: CancelToken,
        received: Vec<PoseEstimate>,
    }

    impl PoseSink for CancelOnFirst {
        fn emit(&mut self, estimate: PoseEstimate) -> std::result::Result<(), crate::error::SinkError> {
            self.token.cancel();
            self.received.push(estimate);
            Ok(())
        }
    }

    #[test]
    fn test_cancel_mid_drain_stops_before_advancing() {
        let ctx = context(FINGERPRINT_SCHEMA_VERSION).unwrap();
        // 50 ms of samples, then a jump that queues nine idle markers at once
        let mut samples = quiet(51);
        samples.push(Sample::scalar(1_000_000, 0.01));

        let mut sink = CancelOnFirst {
            token: ctx.cancel_token(),
            received: Vec::new(),
        };
        let report = ctx.run(samples, &mut sink).unwrap();

        // The second marker releases the 100 ms tick; nothing follows it
        assert!(report.cancelled);
        assert_eq!(sink.received.len(), 1);
        assert_eq!(sink.received[0].timestamp_us, 100_000);
        assert_eq!(report.estimates, 1);
        assert_eq!(report.idle_gaps, 2);
    }

    #[test]
    fn test_trajectory_channel_follows_sink_config() {
        let mut config = ReconstructionConfig::default();
        config.sink.capacity = 3;
        config.sink.policy = BackpressurePolicy::DropOldest;
        let store = Arc::new(MappingStore {
            schema_version: FINGERPRINT_SCHEMA_VERSION,
            artifact_version: String::new(),
            entries: Vec::new(),
            motion_hints: HashMap::new(),
        });
        let ctx = SessionContext::new(config, store).unwrap();

        let (mut sink, stream) = ctx.trajectory_channel();
        assert_eq!(sink.policy(), BackpressurePolicy::DropOldest);
        assert_eq!(sink.capacity(), 3);

        // one second of quiet: ten estimates into a buffer of three
        let report = ctx.run(quiet(1_001), &mut sink).unwrap();
        drop(sink);

        let kept: Vec<u64> = stream.map(|e| e.timestamp_us).collect();
        assert_eq!(report.estimates, 10);
        assert_eq!(report.dropped, 7);
        assert_eq!(kept, vec![800_000, 900_000, 1_000_000]);
    }

    #[test]
    fn test_live_stall_emits_idle_markers() {
        let mut config = ReconstructionConfig::default();
        config.max_sample_wait_us = 10_000;
        config.segmenter.idle_timeout_us = 5_000;
        let store = Arc::new(MappingStore {
            schema_version: FINGERPRINT_SCHEMA_VERSION,
            artifact_version: String::new(),
            entries: Vec::new(),
            motion_hints: HashMap::new(),
        });
        let ctx = SessionContext::new(config, store).unwrap();

        let (tx, rx) = crossbeam_channel::unbounded();
        let producer = thread::spawn(move || {
            for sample in quiet(20) {
                tx.send(sample).unwrap();
            }
            thread::sleep(Duration::from_millis(60));
        });

        let mut trajectory = Trajectory::new();
        let report = ctx.run_live(&rx, &mut trajectory).unwrap();
        producer.join().unwrap();

        assert_eq!(report.samples, 20);
        assert!(report.idle_gaps >= 1);
        assert!(!report.cancelled);
    }

    #[test]
    fn test_report_to_wire_saturates() {
        let report = SessionReport {
            estimates: u64::MAX,
            recalibrations: 70_000,
            first_sample_us: Some(5),
            last_sample_us: Some(9),
            ..Default::default()
        };
        let wire = report.to_wire();
        assert_eq!(wire.estimates, u32::MAX);
        assert_eq!(wire.recalibrations, u16::MAX);
        assert_eq!((wire.start_us, wire.end_us), (5, 9));
        assert_eq!(wire.flags, 0);
    }
}
