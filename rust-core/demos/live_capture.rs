/// Live example: feed samples from a capture thread, consume estimates on
/// another
///
/// The producer paces a synthetic waveform in real time and stalls for a
/// while in the middle, so the session reports silence on its own. Estimates
/// flow through a lossy bounded sink to a consumer thread; the session
/// summary is framed with the binary wire format at the end.
///
/// Idle markers are stamped on the sample clock, so samples that arrive
/// after a stall but carry older timestamps are counted as late.
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use sidechannel_motion::fingerprint::{FingerprintEntry, HintKind, MotionHint};
use sidechannel_motion::types::{axis, FeatureVector, POSE_DOF};
use sidechannel_motion::wire::{WireMessage, WireReader, WireSessionSummary, WireWriter};
use sidechannel_motion::{
    BackpressurePolicy, EventKind, MappingStore, ReconstructionConfig, Sample,
    SegmentExt, SessionContext, FINGERPRINT_SCHEMA_VERSION,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

const PERIOD_US: u64 = 1_000;
const BURST_LEN: u64 = 8;

fn reading(i: u64) -> f32 {
    // an 8 ms burst 20 ms into every 100 ms
    let phase = (i * PERIOD_US) % 100_000;
    if (20_000..20_000 + BURST_LEN * PERIOD_US).contains(&phase) {
        0.8
    } else {
        0.01 + 0.004 * ((i * 7_919 % 97) as f32 / 97.0 - 0.5)
    }
}

/// Features the segmenter extracts from one burst of the live waveform.
fn learn_template() -> Option<FeatureVector> {
    (0..300u64)
        .map(|i| Sample::scalar(i * PERIOD_US, reading(i)))
        .segments(Default::default())
        .filter_map(Result::ok)
        .find_map(|event| match event.kind {
            EventKind::Activity(features) => Some(features),
            EventKind::IdleGap => None,
        })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let template = learn_template().ok_or("training waveform produced no event")?;
    let spread = template
        .dims()
        .iter()
        .map(|d| d.map_or(1.0, |v| (v.abs() * 0.1).max(1e-3)))
        .collect();
    let mut hints = HashMap::new();
    let mut turn = [0.0; POSE_DOF];
    turn[axis::YAW] = 0.3;
    hints.insert(
        "head_turn".into(),
        MotionHint {
            kind: HintKind::Velocity,
            delta: turn,
            noise: [0.1; POSE_DOF],
        },
    );
    let store = Arc::new(MappingStore::new(
        FINGERPRINT_SCHEMA_VERSION,
        "live-demo",
        vec![FingerprintEntry {
            label: "head_turn".into(),
            template,
            sample_count: 50,
            spread,
        }],
        hints,
    )?);

    let mut config = ReconstructionConfig::default();
    config.max_sample_wait_us = 150_000;
    config.sink.capacity = 16;
    config.sink.policy = BackpressurePolicy::DropOldest;
    let session = SessionContext::new(config, store)?.with_id("live");
    let cancel = session.cancel_token();

    let (sample_tx, sample_rx) = crossbeam_channel::bounded::<Sample>(256);
    let (mut sink, stream) = session.trajectory_channel();

    let report = thread::scope(|scope| {
        // Capture thread: 3 s of waveform, with a 600 ms stall after 1.5 s
        scope.spawn(move || {
            for i in 0..3_000u64 {
                if i == 1_500 {
                    thread::sleep(Duration::from_millis(600));
                }
                if sample_tx.send(Sample::scalar(i * PERIOD_US, reading(i))).is_err() {
                    break;
                }
                thread::sleep(Duration::from_micros(PERIOD_US));
            }
        });

        // Consumer thread
        scope.spawn(move || {
            for estimate in stream {
                info!(
                    t_ms = estimate.timestamp_us / 1_000,
                    yaw = estimate.pose[axis::YAW],
                    sigma = estimate.uncertainty(),
                    fused = !estimate.is_prediction(),
                    low_confidence = estimate.low_confidence,
                    "pose"
                );
            }
        });

        // Stop after 10 s even if the feed never ends
        let watchdog = cancel.clone();
        scope.spawn(move || {
            for _ in 0..200 {
                if watchdog.is_cancelled() {
                    return;
                }
                thread::sleep(Duration::from_millis(50));
            }
            watchdog.cancel();
        });

        let report = session.run_live(&sample_rx, &mut sink);
        drop(sink);
        drop(sample_rx);
        cancel.cancel();
        report
    })?;

    let mut writer = WireWriter::new(WireSessionSummary::SIZE + 16);
    writer.write_session_summary(&report.to_wire());
    for message in WireReader::new(writer.as_bytes()) {
        if let WireMessage::Summary(summary) = message {
            println!("wire summary: {:?}", summary);
        }
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
