/// Integration tests for the complete reconstruction pipeline
/// Tests realistic captures end to end: synthetic waveforms with rendering
/// bursts go in, trajectories come out of the various sinks.
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;

use crate::beacon::{BeaconTimeline, SyncBeacon};
use crate::config::{BackpressurePolicy, ReconstructionConfig, SegmenterConfig};
use crate::error::{ConfigError, DataIntegrityError, PipelineError};
use crate::fingerprint::{FingerprintEntry, HintKind, MappingStore, MotionHint, FINGERPRINT_SCHEMA_VERSION};
use crate::segmentation::SegmentExt;
use crate::session::SessionContext;
use crate::sink::{bounded, JsonLinesSink, PoseSink, Trajectory, TrajectoryRecord, WireSink};
use crate::classifier::EventClassifier;
use crate::types::{axis, EventKind, EstimateKind, FeatureVector, Sample, SemanticLabel, POSE_DOF};
use crate::wire::{WireMessage, WireReader};

/// Sample period of every synthetic capture.
pub(crate) const PERIOD_US: u64 = 1_000;

/// A rendering burst: start, length in samples, amplitude.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Burst {
    pub start_us: u64,
    pub samples: u64,
    pub amplitude: f32,
}

pub(crate) const TURN_RIGHT: Burst = Burst {
    start_us: 0,
    samples: 6,
    amplitude: 1.0,
};
pub(crate) const LOOK_UP: Burst = Burst {
    start_us: 0,
    samples: 12,
    amplitude: 0.6,
};
pub(crate) const MENU_OPEN: Burst = Burst {
    start_us: 0,
    samples: 9,
    amplitude: 2.0,
};
/// Not in any fingerprint.
pub(crate) const UNKNOWN: Burst = Burst {
    start_us: 0,
    samples: 15,
    amplitude: 3.5,
};

impl Burst {
    pub(crate) fn at(self, start_us: u64) -> Self {
        Self { start_us, ..self }
    }

    fn covers(&self, t: u64) -> bool {
        t >= self.start_us && t < self.start_us + self.samples * PERIOD_US
    }
}

/// Quiet rail with deterministic jitter, plus the given bursts.
pub(crate) fn capture(duration_us: u64, bursts: &[Burst]) -> Vec<Sample> {
    (0..=duration_us / PERIOD_US)
        .map(|i| {
            let t = i * PERIOD_US;
            let amplitude = match bursts.iter().find(|b| b.covers(t)) {
                Some(burst) => burst.amplitude,
                None => {
                    let jitter = (i.wrapping_mul(2_654_435_761) % 1_000) as f32 / 1_000.0;
                    0.01 + 0.005 * (2.0 * jitter - 1.0)
                }
            };
            Sample::scalar(t, amplitude)
        })
        .collect()
}

/// One burst every `spacing_us`, starting at `first_us`.
pub(crate) fn train_of(burst: Burst, count: u64, first_us: u64, spacing_us: u64) -> Vec<Burst> {
    (0..count).map(|k| burst.at(first_us + k * spacing_us)).collect()
}

/// Features the segmenter extracts for a burst of this shape.
fn learn_template(burst: Burst) -> FeatureVector {
    let samples = capture(300_000, &[burst.at(100_000)]);
    samples
        .into_iter()
        .segments(SegmenterConfig::default())
        .filter_map(Result::ok)
        .find_map(|event| match event.kind {
            EventKind::Activity(features) => Some(features),
            EventKind::IdleGap => None,
        })
        .expect("training burst segmented")
}

pub(crate) fn entry(label: &str, burst: Burst) -> FingerprintEntry {
    let template = learn_template(burst);
    let spread = template
        .dims()
        .iter()
        .map(|d| d.map_or(1.0, |v| (v.abs() * 0.05).max(1e-3)))
        .collect();
    FingerprintEntry {
        label: label.into(),
        template,
        sample_count: 200,
        spread,
    }
}

/// Yaw step of each `turn_right` event.
pub(crate) const TURN_STEP: f64 = 0.05;

pub(crate) fn store() -> Arc<MappingStore> {
    let mut hints = HashMap::new();
    let mut turn = [0.0; POSE_DOF];
    turn[axis::YAW] = TURN_STEP;
    hints.insert(
        SemanticLabel::from("turn_right"),
        MotionHint {
            kind: HintKind::Displacement,
            delta: turn,
            noise: [0.01; POSE_DOF],
        },
    );
    let mut tilt = [0.0; POSE_DOF];
    tilt[axis::PITCH] = 0.2;
    hints.insert(
        SemanticLabel::from("look_up"),
        MotionHint {
            kind: HintKind::Velocity,
            delta: tilt,
            noise: [0.05; POSE_DOF],
        },
    );

    let entries = vec![
        entry("turn_right", TURN_RIGHT),
        entry("look_up", LOOK_UP),
        entry("menu_open", MENU_OPEN),
    ];
    Arc::new(MappingStore::new(FINGERPRINT_SCHEMA_VERSION, "synthetic-1", entries, hints).unwrap())
}

pub(crate) fn session(id: &str) -> SessionContext {
    SessionContext::new(ReconstructionConfig::default(), store())
        .unwrap()
        .with_id(id)
}

fn assert_strictly_increasing(trajectory: &Trajectory) {
    for pair in trajectory.estimates().windows(2) {
        assert!(pair[0].timestamp_us < pair[1].timestamp_us);
    }
}

// ============================================================================
// SCENARIOS
// ============================================================================

#[test]
fn test_consistent_events_build_smooth_trajectory() {
    // Ten turn_right bursts, one inside every tick interval.
    let bursts = train_of(TURN_RIGHT, 10, 50_000, 100_000);
    let samples = capture(1_300_000, &bursts);

    let (trajectory, report) = session("scenario-a").reconstruct_recorded(&samples).unwrap();

    assert_eq!(report.events, 10);
    assert_eq!(report.classified, 10);
    assert_eq!(report.rejected_observations, 0);

    let fused: Vec<_> = trajectory
        .iter()
        .filter(|e| e.kind == EstimateKind::Fused)
        .collect();
    assert_eq!(fused.len(), 10);

    for pair in fused.windows(2) {
        assert!(pair[1].pose[axis::YAW] > pair[0].pose[axis::YAW]);
        assert!(pair[1].variance_trace() <= pair[0].variance_trace() + 1e-12);
    }
    let first = fused[0];
    let last = fused[fused.len() - 1];
    assert!(last.variance_trace() < first.variance_trace());
    assert!((last.pose[axis::YAW] - (10.0 * TURN_STEP)).abs() < 0.02);
    assert!(last.pose[axis::X].abs() < 1e-6);
    assert!(fused.iter().all(|e| !e.low_confidence));
}

#[test]
fn test_idle_stream_is_predict_only() {
    let samples = capture(5_000_000, &[]);
    let (trajectory, report) = session("scenario-b").reconstruct_recorded(&samples).unwrap();

    assert_eq!(trajectory.len(), 50);
    assert!(report.idle_gaps > 0);
    assert!(trajectory.iter().all(|e| e.is_prediction()));

    for pair in trajectory.estimates().windows(2) {
        assert!(pair[1].variance_trace() >= pair[0].variance_trace());
    }

    // default run length is 20 ticks: the 21st idle tick recalibrates
    let estimates = trajectory.estimates();
    for (i, estimate) in estimates.iter().enumerate() {
        assert_eq!(estimate.recalibrated, i == 20, "tick {}", i);
        assert_eq!(estimate.low_confidence, i >= 20, "tick {}", i);
    }
    assert_eq!(report.recalibrations, 1);
    assert!(estimates[20].covariance[axis::X][axis::X] >= 25.0);
}

#[test]
fn test_out_of_order_sample_yields_no_trajectory() {
    let bursts = train_of(TURN_RIGHT, 10, 50_000, 100_000);
    let mut samples = capture(1_200_000, &bursts);
    samples.swap(700, 701);

    let err = session("scenario-c").reconstruct_recorded(&samples).unwrap_err();
    assert!(matches!(
        err,
        PipelineError::DataIntegrity(DataIntegrityError::NonMonotonic {
            previous_us: 701_000,
            current_us: 700_000
        })
    ));
}

#[test]
fn test_schema_mismatch_fails_before_processing() {
    let mut value = serde_json::to_value(&*store()).unwrap();
    value["schema_version"] = serde_json::json!(FINGERPRINT_SCHEMA_VERSION + 1);
    let artifact = MappingStore::from_json_str(&value.to_string()).unwrap();

    let err = SessionContext::new(ReconstructionConfig::default(), Arc::new(artifact)).unwrap_err();
    assert!(matches!(
        err,
        ConfigError::SchemaMismatch { expected, found }
            if expected == FINGERPRINT_SCHEMA_VERSION && found == FINGERPRINT_SCHEMA_VERSION + 1
    ));
}

// ============================================================================
// PIPELINE PROPERTIES
// ============================================================================

#[test]
fn test_events_never_overlap_and_classify_once() {
    let mut bursts = train_of(TURN_RIGHT, 5, 40_000, 70_000);
    bursts.extend(train_of(LOOK_UP, 5, 400_000, 90_000));
    bursts.extend(train_of(UNKNOWN, 3, 900_000, 60_000));
    let samples = capture(1_300_000, &bursts);

    let events: Vec<_> = samples
        .into_iter()
        .segments(SegmenterConfig::default())
        .collect::<Result<_, _>>()
        .unwrap();

    for pair in events.windows(2) {
        assert!(pair[0].end_us <= pair[1].start_us);
        assert!(pair[0].id < pair[1].id);
    }

    let mut classifier = EventClassifier::new(store(), Default::default());
    let activity: Vec<_> = events.iter().filter(|e| !e.is_idle_gap()).collect();
    assert_eq!(activity.len(), 13);

    for event in &activity {
        let classification = classifier.classify(event).unwrap();
        assert_eq!(classification.event_id, event.id);
        for pair in classification.candidates.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }
    assert_eq!(classifier.classified_count(), 10);
    assert_eq!(classifier.unclassified_count(), 3);
}

#[test]
fn test_unknown_bursts_carry_no_evidence() {
    let bursts = train_of(UNKNOWN, 6, 50_000, 100_000);
    let (trajectory, report) = session("unknown")
        .reconstruct_recorded(&capture(800_000, &bursts))
        .unwrap();

    assert_eq!(report.events, 6);
    assert_eq!(report.unclassified, 6);
    assert_eq!(trajectory.fused_count(), 0);
}

#[test]
fn test_labels_without_motion_hint_are_ignored() {
    let bursts = train_of(MENU_OPEN, 4, 50_000, 100_000);
    let (trajectory, report) = session("menu")
        .reconstruct_recorded(&capture(600_000, &bursts))
        .unwrap();

    assert_eq!(report.classified, 4);
    assert_eq!(report.fused_observations, 0);
    assert_eq!(trajectory.fused_count(), 0);
}

#[test]
fn test_velocity_hint_drives_pitch() {
    let bursts = train_of(LOOK_UP, 5, 50_000, 100_000);
    let (trajectory, report) = session("tilt")
        .reconstruct_recorded(&capture(700_000, &bursts))
        .unwrap();

    assert_eq!(report.fused_observations, 5);
    let last = trajectory.last().unwrap();
    assert!(last.velocity[axis::PITCH] > 0.1);
    assert!(last.pose[axis::PITCH] > 0.0);
    assert!(last.velocity[axis::YAW].abs() < 1e-9);
}

#[test]
fn test_trajectory_read_back_is_idempotent() {
    let bursts = train_of(TURN_RIGHT, 4, 50_000, 100_000);
    let (trajectory, _) = session("read-back")
        .reconstruct_recorded(&capture(500_000, &bursts))
        .unwrap();

    assert_strictly_increasing(&trajectory);
    let once: Vec<_> = trajectory.iter().cloned().collect();
    let twice: Vec<_> = trajectory.iter().cloned().collect();
    assert_eq!(once, twice);
}

// ============================================================================
// CONCURRENCY AND SINKS
// ============================================================================

#[test]
fn test_parallel_sessions_share_store() {
    let shared = store();
    let bursts = train_of(TURN_RIGHT, 8, 50_000, 100_000);
    let samples = capture(1_000_000, &bursts);

    let trajectories: Vec<Trajectory> = thread::scope(|scope| {
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let ctx = SessionContext::new(ReconstructionConfig::default(), Arc::clone(&shared))
                    .unwrap()
                    .with_id(format!("parallel-{}", i));
                let samples = &samples;
                scope.spawn(move || ctx.reconstruct_recorded(samples).unwrap().0)
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    for trajectory in &trajectories[1..] {
        assert_eq!(trajectory, &trajectories[0]);
    }
}

#[test]
fn test_live_session_matches_recorded() {
    let bursts = train_of(TURN_RIGHT, 6, 50_000, 100_000);
    let samples = capture(800_000, &bursts);
    let (recorded, _) = session("recorded").reconstruct_recorded(&samples).unwrap();

    // generous wait so a slow producer thread never looks like a stall
    let mut config = ReconstructionConfig::default();
    config.max_sample_wait_us = 5_000_000;
    let ctx = SessionContext::new(config, store()).unwrap().with_id("live");
    let (tx, rx) = crossbeam_channel::bounded(64);
    let (mut sink, stream) = bounded(8, BackpressurePolicy::Block);

    let live: Vec<_> = thread::scope(|scope| {
        scope.spawn(move || {
            for sample in samples {
                tx.send(sample).unwrap();
            }
        });
        let consumer = scope.spawn(move || stream.collect::<Vec<_>>());
        let report = ctx.run_live(&rx, &mut sink).unwrap();
        assert_eq!(report.dropped, 0);
        drop(sink);
        consumer.join().unwrap()
    });

    assert_eq!(live.as_slice(), recorded.estimates());
}

#[test]
fn test_lossy_sink_counts_drops() {
    let samples = capture(3_000_000, &[]);
    let (mut sink, stream) = bounded(5, BackpressurePolicy::DropOldest);

    let report = session("lossy").run(samples, &mut sink).unwrap();
    drop(sink);

    assert_eq!(report.estimates, 30);
    assert_eq!(report.dropped, 25);
    assert_eq!(stream.dropped(), 25);
    let kept: Vec<_> = stream.collect();
    assert_eq!(kept.len(), 5);
    assert_eq!(kept[4].timestamp_us, 3_000_000);
}

#[test]
fn test_json_lines_sink_persists_every_estimate() {
    let bursts = train_of(TURN_RIGHT, 3, 50_000, 100_000);
    let mut sink = JsonLinesSink::new(Vec::new(), "jsonl");
    let report = session("jsonl").run(capture(500_000, &bursts), &mut sink).unwrap();

    let text = String::from_utf8(sink.into_inner().unwrap()).unwrap();
    let records: Vec<TrajectoryRecord> = text
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(records.len() as u64, report.estimates);
    assert_eq!(
        records.iter().filter(|r| r.kind == EstimateKind::Fused).count(),
        3
    );
}

#[test]
fn test_wire_sink_with_session_summary() {
    let bursts = train_of(TURN_RIGHT, 3, 50_000, 100_000);
    let mut sink = WireSink::new(Vec::new());
    let ctx = session("wire");
    let report = ctx.run(capture(500_000, &bursts), &mut sink).unwrap();
    sink.write_summary(&report.to_wire()).unwrap();
    let bytes = sink.into_inner().unwrap();

    let mut reader = WireReader::new(&bytes);
    let mut poses = 0u64;
    let mut summary = None;
    for message in reader.by_ref() {
        match message {
            WireMessage::Pose(_) => poses += 1,
            WireMessage::Summary(s) => summary = Some(s),
        }
    }
    assert!(reader.consumed_all());
    let summary = summary.unwrap();
    assert_eq!(poses, report.estimates);
    assert_eq!(summary.estimates as u64, report.estimates);
    assert_eq!(summary.events, 3);
    assert!(!summary.cancelled());
}

#[test]
fn test_cancellation_mid_stream() {
    let ctx = session("cancel");
    let token = ctx.cancel_token();
    let samples = capture(2_000_000, &[]);

    let mut trajectory = Trajectory::new();
    let cancelling = samples.into_iter().inspect(move |s| {
        if s.timestamp_us == 1_000_000 {
            token.cancel();
        }
    });
    let report = ctx.run(cancelling, &mut trajectory).unwrap();

    assert!(report.cancelled);
    assert!(report.samples <= 1_001);
    assert!(trajectory.len() <= 10);
    assert_strictly_increasing(&trajectory);
}

#[test]
fn test_beacons_slice_session_trajectory() {
    let bursts = train_of(TURN_RIGHT, 10, 50_000, 100_000);
    let (trajectory, _) = session("beacons")
        .reconstruct_recorded(&capture(1_200_000, &bursts))
        .unwrap();

    let timeline = BeaconTimeline::from_beacons([
        (0, SyncBeacon::parse("SYNC_BEACON|global_start").unwrap()),
        (300_000, SyncBeacon::parse("SYNC_BEACON|replay_start|r1").unwrap()),
        (700_000, SyncBeacon::parse("SYNC_BEACON|replay_end|r1").unwrap()),
    ])
    .unwrap();

    let slice = timeline.slice(&trajectory, "r1", 0).unwrap();
    let stamps: Vec<u64> = slice.iter().map(|e| e.timestamp_us).collect();
    assert_eq!(stamps, vec![300_000, 400_000, 500_000, 600_000]);
}

#[test]
fn test_sink_refuses_rewrites_from_any_source() {
    let bursts = train_of(TURN_RIGHT, 2, 50_000, 100_000);
    let (mut trajectory, _) = session("rewrite")
        .reconstruct_recorded(&capture(400_000, &bursts))
        .unwrap();

    let stale = trajectory.first().cloned().unwrap();
    assert!(trajectory.emit(stale).is_err());
}
