/// Replay example: reconstruct a recorded capture and print the trajectory
///
/// Builds a small fingerprint artifact from synthetic training bursts, loads
/// it back from JSON the way a host would, then reconstructs a capture that
/// contains a few head turns followed by silence.
///
/// Run with `RUST_LOG=debug` to see per-event decisions.
use std::collections::HashMap;
use std::sync::Arc;

use sidechannel_motion::fingerprint::{FingerprintEntry, HintKind, MotionHint};
use sidechannel_motion::types::{axis, POSE_DOF};
use sidechannel_motion::{
    EventKind, JsonLinesSink, MappingStore, PoseSink, ReconstructionConfig, Sample, SegmentExt,
    SessionContext, FINGERPRINT_SCHEMA_VERSION,
};
use tracing_subscriber::EnvFilter;

const PERIOD_US: u64 = 1_000;

/// Quiet rail with a burst of `len` samples at `amplitude` wherever
/// `bursts` says.
fn synthesize(duration_us: u64, bursts: &[(u64, u64, f32)]) -> Vec<Sample> {
    (0..=duration_us / PERIOD_US)
        .map(|i| {
            let t = i * PERIOD_US;
            let burst = bursts
                .iter()
                .find(|(start, len, _)| t >= *start && t < start + len * PERIOD_US);
            let amplitude = match burst {
                Some((_, _, a)) => *a,
                None => 0.01 + 0.004 * ((i * 7_919 % 97) as f32 / 97.0 - 0.5),
            };
            Sample::scalar(t, amplitude)
        })
        .collect()
}

fn train(label: &str, len: u64, amplitude: f32) -> Option<FingerprintEntry> {
    let template = synthesize(300_000, &[(100_000, len, amplitude)])
        .into_iter()
        .segments(Default::default())
        .filter_map(Result::ok)
        .find_map(|event| match event.kind {
            EventKind::Activity(features) => Some(features),
            EventKind::IdleGap => None,
        })?;
    let spread = template
        .dims()
        .iter()
        .map(|d| d.map_or(1.0, |v| (v.abs() * 0.05).max(1e-3)))
        .collect();
    Some(FingerprintEntry {
        label: label.into(),
        template,
        sample_count: 120,
        spread,
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    println!("=== Side-Channel Motion: Replay Example ===\n");

    // Phase I stand-in: one label per burst shape
    let mut hints = HashMap::new();
    let mut yaw = [0.0; POSE_DOF];
    yaw[axis::YAW] = 0.08;
    hints.insert(
        "turn_right".into(),
        MotionHint {
            kind: HintKind::Displacement,
            delta: yaw,
            noise: [0.02; POSE_DOF],
        },
    );
    let entries = [train("turn_right", 6, 1.0), train("menu_open", 10, 2.0)]
        .into_iter()
        .flatten()
        .collect();
    let artifact = MappingStore::new(FINGERPRINT_SCHEMA_VERSION, "demo-1", entries, hints)?;
    let json = serde_json::to_string_pretty(&artifact)?;
    println!("Artifact: {} entries, {} bytes of JSON", artifact.len(), json.len());

    // Host side: load the artifact and open a session
    let store = Arc::new(MappingStore::from_json_str(&json)?);
    let session = SessionContext::new(ReconstructionConfig::default(), store)?.with_id("replay");

    let mut bursts: Vec<(u64, u64, f32)> = (0..8).map(|k| (50_000 + k * 100_000, 6, 1.0)).collect();
    bursts.push((1_050_000, 10, 2.0));
    let samples = synthesize(4_000_000, &bursts);
    println!("Reconstructing {} samples...\n", samples.len());

    let (trajectory, report) = session.reconstruct_recorded(&samples)?;

    println!("{:>8}  {:>8}  {:>8}  {:>9}  flags", "t (ms)", "yaw", "yaw/s", "σ");
    for estimate in &trajectory {
        let mut flags = String::new();
        if !estimate.is_prediction() {
            flags.push('F');
        }
        if estimate.low_confidence {
            flags.push('L');
        }
        if estimate.recalibrated {
            flags.push('R');
        }
        println!(
            "{:>8}  {:>8.4}  {:>8.4}  {:>9.5}  {}",
            estimate.timestamp_us / 1_000,
            estimate.pose[axis::YAW],
            estimate.velocity[axis::YAW],
            estimate.uncertainty(),
            flags
        );
    }

    // Persist the first few estimates as JSON lines
    let mut sink = JsonLinesSink::new(Vec::new(), session.id());
    for estimate in trajectory.iter().take(3) {
        sink.emit(estimate.clone())?;
    }
    let jsonl = String::from_utf8(sink.into_inner()?)?;
    println!("\nJSON lines preview:\n{}", jsonl);

    println!("=== Summary ===");
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
