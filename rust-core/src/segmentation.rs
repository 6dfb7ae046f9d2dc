//! Waveform segmentation into rendering events.
//!
//! This module cuts the continuous side-channel waveform into discrete
//! windows, each standing for one putative GPU rendering operation, and
//! marks prolonged silence explicitly.
//!
//! Design: State machine over incremental statistics
//! - An exponentially weighted baseline tracks the quiet-rail energy
//! - A sample above `mean + k·σ` opens an event; falling back closes it
//! - Closed segments wait one merge window in case the burst resumes
//! - Silence longer than the idle timeout becomes an `IdleGap` event
//! - O(1) per sample except the per-event amplitude trace
//!
//! Why this matters:
//! A frame that re-renders because the head moved draws a burst of power.
//! Getting the burst boundaries right is what makes its features comparable
//! with the fingerprint templates.

use std::collections::VecDeque;
use tracing::{debug, trace, warn};

use crate::config::SegmenterConfig;
use crate::error::DataIntegrityError;
use crate::signal::{EnergyBaseline, EventAccumulator};
use crate::types::{Event, Sample};

/// An event whose falling edge has not been seen yet.
#[derive(Debug)]
struct OpenEvent {
    start_us: u64,
    acc: EventAccumulator,
}

/// A closed segment held back for the merge window.
#[derive(Debug)]
struct PendingSegment {
    start_us: u64,
    end_us: u64,
    acc: EventAccumulator,
}

/// Online changepoint segmenter.
///
/// Maintains:
/// - Baseline noise statistics (updated only outside events)
/// - At most one open event and one pending segment
/// - The start of the current silent span for idle detection
/// - A queue of finished events ready to be taken
pub struct WaveformSegmenter {
    config: SegmenterConfig,
    baseline: EnergyBaseline,
    /// Quiet-candidate energies collected until the baseline is seeded.
    warmup: Vec<f64>,
    warmed: bool,

    last_timestamp_us: Option<u64>,
    channel_width: Option<usize>,
    /// Samples at or before this instant were already covered by an idle
    /// marker issued on a timeout.
    horizon_us: Option<u64>,

    open: Option<OpenEvent>,
    pending: Option<PendingSegment>,
    /// Start of the current silent span.
    quiet_since_us: Option<u64>,

    next_id: u64,
    ready: VecDeque<Event>,

    // Diagnostics
    samples_processed: u64,
    events_emitted: u64,
    idle_gaps_emitted: u64,
    glitches_discarded: u64,
    merges: u64,
    late_samples: u64,
}

impl WaveformSegmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        let baseline = EnergyBaseline::new(config.baseline_alpha, config.min_noise_floor);
        Self {
            warmup: Vec::with_capacity(config.baseline_warmup_samples),
            warmed: config.baseline_warmup_samples == 0,
            config,
            baseline,
            last_timestamp_us: None,
            channel_width: None,
            horizon_us: None,
            open: None,
            pending: None,
            quiet_since_us: None,
            next_id: 0,
            ready: VecDeque::new(),
            samples_processed: 0,
            events_emitted: 0,
            idle_gaps_emitted: 0,
            glitches_discarded: 0,
            merges: 0,
            late_samples: 0,
        }
    }

    /// Drop all state. Call between sessions.
    pub fn reset(&mut self) {
        *self = Self::new(self.config.clone());
    }

    /// Process one sample. Finished events are queued for [`next_event`].
    ///
    /// Fails without touching any state when the sample breaks ordering or
    /// shape; the session should be abandoned at that point.
    ///
    /// [`next_event`]: WaveformSegmenter::next_event
    pub fn process_sample(&mut self, sample: &Sample) -> Result<(), DataIntegrityError> {
        self.validate(sample)?;

        let t = sample.timestamp_us;
        self.last_timestamp_us = Some(t);
        self.channel_width.get_or_insert(sample.channels.len());
        self.samples_processed += 1;
        self.quiet_since_us.get_or_insert(t);

        if self.horizon_us.is_some_and(|h| t <= h) {
            self.late_samples += 1;
            warn!(timestamp_us = t, "sample predates idle marker, skipped");
            return Ok(());
        }

        // Force-close an event that reached the maximum duration.
        if self
            .open
            .as_ref()
            .is_some_and(|o| t - o.start_us >= self.config.max_event_duration_us)
        {
            if let Some(open) = self.open.take() {
                trace!(start_us = open.start_us, end_us = t, "event reached max duration");
                self.emit_segment(open.start_us, t, open.acc);
            }
        }

        self.flush_expired_pending(t);

        let energy = sample.energy();
        let above = self.warmed && energy > self.baseline.threshold(self.config.changepoint_sensitivity);

        match (self.open.is_some(), above) {
            (true, true) => {
                if let Some(open) = self.open.as_mut() {
                    open.acc.push(energy);
                }
            }
            (true, false) => {
                // Falling changepoint
                if let Some(open) = self.open.take() {
                    self.pending = Some(PendingSegment {
                        start_us: open.start_us,
                        end_us: t,
                        acc: open.acc,
                    });
                }
                self.observe_quiet(energy);
            }
            (false, true) => self.open_event(t, energy),
            (false, false) => {
                self.observe_quiet(energy);
                if self.pending.is_none() {
                    self.emit_idle_gaps(t);
                }
            }
        }

        Ok(())
    }

    /// Take the next finished event, oldest first.
    pub fn next_event(&mut self) -> Option<Event> {
        self.ready.pop_front()
    }

    /// Report silence up to `now_us` when no sample has arrived in time.
    ///
    /// Closes any open or pending segment, then covers the silent span with
    /// idle markers ending exactly at `now_us`. Samples that later arrive
    /// at or before `now_us` are skipped and counted as late.
    pub fn mark_idle(&mut self, now_us: u64) {
        if self.last_timestamp_us.is_some_and(|last| now_us <= last) {
            return;
        }
        self.close_all();

        self.quiet_since_us.get_or_insert(now_us);
        self.emit_idle_gaps(now_us);
        if let Some(start) = self.quiet_since_us {
            if now_us > start {
                self.push_idle_gap(start, now_us);
            }
        }
        self.horizon_us = Some(now_us);
    }

    /// Flush any open or pending segment at end of stream.
    pub fn finish(&mut self) {
        self.close_all();
    }

    fn close_all(&mut self) {
        if let Some(open) = self.open.take() {
            let end = self.last_timestamp_us.unwrap_or(open.start_us);
            self.pending = Some(PendingSegment {
                start_us: open.start_us,
                end_us: end,
                acc: open.acc,
            });
        }
        if let Some(pending) = self.pending.take() {
            self.emit_segment(pending.start_us, pending.end_us, pending.acc);
        }
    }

    /// Feed a non-event energy to the baseline. Until warm-up completes
    /// energies are buffered and the baseline is seeded from the window
    /// with its outliers left out; bursts inside the window are never
    /// segmented.
    fn observe_quiet(&mut self, energy: f64) {
        if self.warmed {
            self.baseline.update(energy);
            return;
        }
        self.warmup.push(energy);
        if self.warmup.len() >= self.config.baseline_warmup_samples {
            let excluded = self
                .baseline
                .seed(&self.warmup, self.config.changepoint_sensitivity);
            if excluded > 0 {
                debug!(excluded, "warm-up outliers left out of the baseline");
            }
            self.warmup = Vec::new();
            self.warmed = true;
        }
    }

    fn validate(&self, sample: &Sample) -> Result<(), DataIntegrityError> {
        check_sample(self.last_timestamp_us, self.channel_width, sample)
    }

    /// Rising changepoint: start a new event or resume the pending one.
    fn open_event(&mut self, t: u64, energy: f64) {
        let resumable = self.pending.as_ref().is_some_and(|p| {
            t - p.end_us < self.config.merge_window_us
                && t - p.start_us < self.config.max_event_duration_us
        });

        let mut open = match self.pending.take() {
            Some(p) if resumable => {
                self.merges += 1;
                trace!(start_us = p.start_us, gap_us = t - p.end_us, "coalescing segments");
                OpenEvent {
                    start_us: p.start_us,
                    acc: p.acc,
                }
            }
            Some(p) => {
                self.emit_segment(p.start_us, p.end_us, p.acc);
                OpenEvent {
                    start_us: t,
                    acc: EventAccumulator::new(),
                }
            }
            None => {
                self.emit_idle_gaps(t);
                OpenEvent {
                    start_us: t,
                    acc: EventAccumulator::new(),
                }
            }
        };
        open.acc.push(energy);
        self.open = Some(open);
    }

    fn flush_expired_pending(&mut self, t: u64) {
        let expired = self
            .pending
            .as_ref()
            .is_some_and(|p| t - p.end_us >= self.config.merge_window_us);
        if expired {
            if let Some(p) = self.pending.take() {
                self.emit_segment(p.start_us, p.end_us, p.acc);
            }
        }
    }

    /// Emit a closed segment, or discard it if it is a glitch.
    fn emit_segment(&mut self, start_us: u64, end_us: u64, acc: EventAccumulator) {
        let duration = end_us.saturating_sub(start_us);
        if duration < self.config.min_event_duration_us || acc.is_empty() {
            self.glitches_discarded += 1;
            debug!(start_us, duration_us = duration, "glitch discarded");
            return;
        }

        let features = acc.features(duration, self.config.spectral_bands);
        let event = Event::activity(self.next_id, start_us, end_us, features);
        debug!(
            event = event.id,
            start_us,
            duration_us = duration,
            samples = acc.len(),
            "event segmented"
        );
        self.next_id += 1;
        self.events_emitted += 1;
        self.quiet_since_us = Some(end_us);
        self.ready.push_back(event);
    }

    /// Emit one idle marker per full idle timeout of silence before `t`.
    fn emit_idle_gaps(&mut self, t: u64) {
        let timeout = self.config.idle_timeout_us;
        while let Some(since) = self.quiet_since_us {
            if t - since.min(t) <= timeout {
                break;
            }
            self.push_idle_gap(since, since + timeout);
        }
    }

    fn push_idle_gap(&mut self, start_us: u64, end_us: u64) {
        let event = Event::idle_gap(self.next_id, start_us, end_us);
        debug!(event = event.id, start_us, end_us, "idle gap");
        self.next_id += 1;
        self.idle_gaps_emitted += 1;
        self.quiet_since_us = Some(end_us);
        self.ready.push_back(event);
    }

    pub fn config(&self) -> &SegmenterConfig {
        &self.config
    }

    pub fn samples_processed(&self) -> u64 {
        self.samples_processed
    }

    pub fn events_emitted(&self) -> u64 {
        self.events_emitted
    }

    pub fn idle_gaps_emitted(&self) -> u64 {
        self.idle_gaps_emitted
    }

    pub fn glitches_discarded(&self) -> u64 {
        self.glitches_discarded
    }

    pub fn merges(&self) -> u64 {
        self.merges
    }

    pub fn late_samples(&self) -> u64 {
        self.late_samples
    }

    /// True while an event is open or held for merging.
    pub fn in_event(&self) -> bool {
        self.open.is_some() || self.pending.is_some()
    }
}

impl Default for WaveformSegmenter {
    fn default() -> Self {
        Self::new(SegmenterConfig::default())
    }
}

/// Check one sample against the previous timestamp and the stream's
/// channel width.
pub fn check_sample(
    previous_us: Option<u64>,
    channel_width: Option<usize>,
    sample: &Sample,
) -> Result<(), DataIntegrityError> {
    let t = sample.timestamp_us;
    if let Some(previous) = previous_us {
        if t <= previous {
            return Err(DataIntegrityError::NonMonotonic {
                previous_us: previous,
                current_us: t,
            });
        }
    }
    if sample.channels.is_empty() {
        return Err(DataIntegrityError::EmptySample { timestamp_us: t });
    }
    if let Some(expected) = channel_width {
        if sample.channels.len() != expected {
            return Err(DataIntegrityError::ChannelWidth {
                timestamp_us: t,
                expected,
                actual: sample.channels.len(),
            });
        }
    }
    if let Some(channel) = sample.channels.iter().position(|v| !v.is_finite()) {
        return Err(DataIntegrityError::NonFinite {
            timestamp_us: t,
            channel,
        });
    }
    Ok(())
}

/// Validate a whole recorded capture without segmenting it.
pub fn validate_samples(samples: &[Sample]) -> Result<(), DataIntegrityError> {
    let mut previous = None;
    let mut width = None;
    for sample in samples {
        check_sample(previous, width, sample)?;
        previous = Some(sample.timestamp_us);
        width.get_or_insert(sample.channels.len());
    }
    Ok(())
}

/// Lazy event stream over a sample iterator.
///
/// Yields events as soon as they are final. The first integrity error is
/// yielded once and ends the stream.
pub struct Segments<I> {
    samples: I,
    segmenter: WaveformSegmenter,
    finished: bool,
}

impl<I: Iterator<Item = Sample>> Segments<I> {
    pub fn new(samples: I, config: SegmenterConfig) -> Self {
        Self {
            samples,
            segmenter: WaveformSegmenter::new(config),
            finished: false,
        }
    }

    pub fn segmenter(&self) -> &WaveformSegmenter {
        &self.segmenter
    }
}

impl<I: Iterator<Item = Sample>> Iterator for Segments<I> {
    type Item = Result<Event, DataIntegrityError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(event) = self.segmenter.next_event() {
                return Some(Ok(event));
            }
            if self.finished {
                return None;
            }
            match self.samples.next() {
                Some(sample) => {
                    if let Err(e) = self.segmenter.process_sample(&sample) {
                        self.finished = true;
                        return Some(Err(e));
                    }
                }
                None => {
                    self.segmenter.finish();
                    self.finished = true;
                }
            }
        }
    }
}

/// Extension for turning any sample iterator into an event stream.
pub trait SegmentExt: Iterator<Item = Sample> + Sized {
    fn segments(self, config: SegmenterConfig) -> Segments<Self> {
        Segments::new(self, config)
    }
}

impl<I: Iterator<Item = Sample>> SegmentExt for I {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FeatureVector;

    const PERIOD_US: u64 = 10;

    /// Alternating low-level noise, `n` samples from `t0`.
    fn quiet(t0: u64, n: usize) -> Vec<Sample> {
        (0..n)
            .map(|i| {
                let amp = if i % 2 == 0 { 0.010 } else { 0.012 };
                Sample::scalar(t0 + i as u64 * PERIOD_US, amp)
            })
            .collect()
    }

    fn burst(t0: u64, n: usize, amp: f32) -> Vec<Sample> {
        (0..n)
            .map(|i| Sample::scalar(t0 + i as u64 * PERIOD_US, amp))
            .collect()
    }

    fn run(samples: Vec<Sample>, config: SegmenterConfig) -> Vec<Event> {
        samples
            .into_iter()
            .segments(config)
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    fn stream(parts: Vec<Vec<Sample>>) -> Vec<Sample> {
        parts.into_iter().flatten().collect()
    }

    #[test]
    fn test_segmenter_config_default() {
        let config = SegmenterConfig::default();
        assert_eq!(config.spectral_bands, 4);
        assert!(config.min_event_duration_us < config.max_event_duration_us);
    }

    #[test]
    fn test_single_burst_becomes_event() {
        let samples = stream(vec![quiet(0, 100), burst(1_000, 50, 1.0), quiet(1_500, 100)]);
        let events = run(samples, SegmenterConfig::default());

        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.start_us, 1_000);
        assert_eq!(event.end_us, 1_500);

        let features = event.features().unwrap();
        assert!((features.get(FeatureVector::ENERGY).unwrap() - 50.0).abs() < 1e-6);
        assert_eq!(features.get(FeatureVector::DURATION_MS), Some(0.5));
        assert!((features.get(FeatureVector::PEAK).unwrap() - 1.0).abs() < 1e-6);
        assert!(features.get(FeatureVector::SPECTRAL_START).is_some());
    }

    #[test]
    fn test_no_events_during_warmup() {
        let samples = stream(vec![quiet(0, 10), burst(100, 50, 1.0), quiet(600, 10)]);
        let events = run(samples, SegmenterConfig::default());
        assert!(events.is_empty());
    }

    #[test]
    fn test_burst_during_warmup_does_not_raise_threshold() {
        // Capture starts mid-burst; the next burst of the same height must
        // still be found.
        let samples = stream(vec![
            quiet(0, 10),
            burst(100, 8, 1.0),
            quiet(180, 82),
            burst(1_000, 50, 1.0),
            quiet(1_500, 100),
        ]);
        let events = run(samples, SegmenterConfig::default());

        assert_eq!(events.len(), 1);
        assert_eq!((events[0].start_us, events[0].end_us), (1_000, 1_500));
    }

    #[test]
    fn test_glitch_discarded() {
        let samples = stream(vec![quiet(0, 100), burst(1_000, 5, 1.0), quiet(1_050, 100)]);
        let mut segmenter = WaveformSegmenter::default();
        for s in &samples {
            segmenter.process_sample(s).unwrap();
        }
        segmenter.finish();
        assert!(segmenter.next_event().is_none());
        assert_eq!(segmenter.glitches_discarded(), 1);
    }

    #[test]
    fn test_split_humps_coalesce() {
        let samples = stream(vec![
            quiet(0, 100),
            burst(1_000, 30, 1.0),
            quiet(1_300, 20),
            burst(1_500, 30, 0.8),
            quiet(1_800, 100),
        ]);
        let mut segmenter = WaveformSegmenter::default();
        for s in &samples {
            segmenter.process_sample(s).unwrap();
        }
        segmenter.finish();

        let event = segmenter.next_event().unwrap();
        assert_eq!((event.start_us, event.end_us), (1_000, 1_800));
        assert!(segmenter.next_event().is_none());
        assert_eq!(segmenter.merges(), 1);
    }

    #[test]
    fn test_distant_humps_stay_separate() {
        let samples = stream(vec![
            quiet(0, 100),
            burst(1_000, 30, 1.0),
            quiet(1_300, 100),
            burst(2_300, 30, 1.0),
            quiet(2_600, 100),
        ]);
        let events = run(samples, SegmenterConfig::default());
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].end_us, 1_300);
        assert_eq!(events[1].start_us, 2_300);
        assert!(events[0].id < events[1].id);
    }

    #[test]
    fn test_max_duration_splits_long_burst() {
        let config = SegmenterConfig {
            max_event_duration_us: 1_000,
            ..Default::default()
        };
        let samples = stream(vec![quiet(0, 100), burst(1_000, 300, 1.0), quiet(4_000, 100)]);
        let events = run(samples, config);

        let spans: Vec<(u64, u64)> = events.iter().map(|e| (e.start_us, e.end_us)).collect();
        assert_eq!(spans, vec![(1_000, 2_000), (2_000, 3_000), (3_000, 4_000)]);
    }

    #[test]
    fn test_idle_gaps_repeat_during_silence() {
        // 1 kHz quiet stream for 350 ms
        let samples: Vec<Sample> = (0..=350)
            .map(|i| Sample::scalar(i * 1_000, 0.01))
            .collect();
        let events = run(samples, SegmenterConfig::default());

        let spans: Vec<(u64, u64)> = events.iter().map(|e| (e.start_us, e.end_us)).collect();
        assert!(events.iter().all(|e| e.is_idle_gap()));
        assert_eq!(
            spans,
            vec![(0, 100_000), (100_000, 200_000), (200_000, 300_000)]
        );
    }

    #[test]
    fn test_idle_gap_follows_event() {
        let mut samples = stream(vec![quiet(0, 100), burst(1_000, 50, 1.0)]);
        samples.extend((0..=110).map(|i| Sample::scalar(1_500 + i * 1_000, 0.01)));
        let events = run(samples, SegmenterConfig::default());

        assert_eq!(events.len(), 2);
        assert!(!events[0].is_idle_gap());
        assert!(events[1].is_idle_gap());
        assert_eq!(events[1].start_us, 1_500);
        assert_eq!(events[1].end_us, 101_500);
    }

    #[test]
    fn test_mark_idle_covers_silence() {
        let mut segmenter = WaveformSegmenter::default();
        for s in quiet(0, 100) {
            segmenter.process_sample(&s).unwrap();
        }
        segmenter.mark_idle(251_000);

        let spans: Vec<(u64, u64)> = std::iter::from_fn(|| segmenter.next_event())
            .map(|e| (e.start_us, e.end_us))
            .collect();
        assert_eq!(
            spans,
            vec![(0, 100_000), (100_000, 200_000), (200_000, 251_000)]
        );

        // Late sample is skipped, not fatal
        segmenter.process_sample(&Sample::scalar(250_500, 0.01)).unwrap();
        assert_eq!(segmenter.late_samples(), 1);
        segmenter.process_sample(&Sample::scalar(251_010, 0.01)).unwrap();
        assert_eq!(segmenter.late_samples(), 1);
    }

    #[test]
    fn test_non_monotonic_rejected() {
        let mut segmenter = WaveformSegmenter::default();
        segmenter.process_sample(&Sample::scalar(10, 0.0)).unwrap();
        segmenter.process_sample(&Sample::scalar(20, 0.0)).unwrap();

        assert_eq!(
            segmenter.process_sample(&Sample::scalar(15, 0.0)),
            Err(DataIntegrityError::NonMonotonic {
                previous_us: 20,
                current_us: 15
            })
        );
        assert!(segmenter.process_sample(&Sample::scalar(20, 0.0)).is_err());
        assert_eq!(segmenter.samples_processed(), 2);
    }

    #[test]
    fn test_validate_samples_up_front() {
        let good: Vec<Sample> = (0..10).map(|i| Sample::scalar(i * 10, 0.0)).collect();
        assert!(validate_samples(&good).is_ok());

        let mut bad = good.clone();
        bad.swap(4, 5);
        assert!(matches!(
            validate_samples(&bad),
            Err(DataIntegrityError::NonMonotonic { previous_us: 50, current_us: 40 })
        ));
    }

    #[test]
    fn test_malformed_samples_rejected() {
        let mut segmenter = WaveformSegmenter::default();
        segmenter.process_sample(&Sample::new(0, vec![0.1, 0.2])).unwrap();

        assert!(matches!(
            segmenter.process_sample(&Sample::new(10, vec![0.1])),
            Err(DataIntegrityError::ChannelWidth { expected: 2, actual: 1, .. })
        ));
        assert!(matches!(
            segmenter.process_sample(&Sample::new(20, vec![])),
            Err(DataIntegrityError::EmptySample { .. })
        ));
        assert!(matches!(
            segmenter.process_sample(&Sample::new(30, vec![0.1, f32::NAN])),
            Err(DataIntegrityError::NonFinite { channel: 1, .. })
        ));
    }

    #[test]
    fn test_segments_stops_after_error() {
        let samples = vec![
            Sample::scalar(0, 0.0),
            Sample::scalar(10, 0.0),
            Sample::scalar(5, 0.0),
            Sample::scalar(20, 0.0),
        ];
        let results: Vec<_> = samples
            .into_iter()
            .segments(SegmenterConfig::default())
            .collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }

    #[test]
    fn test_reset_clears_state() {
        let mut segmenter = WaveformSegmenter::default();
        for s in stream(vec![quiet(0, 100), burst(1_000, 10, 1.0)]) {
            segmenter.process_sample(&s).unwrap();
        }
        assert!(segmenter.in_event());

        segmenter.reset();
        assert!(!segmenter.in_event());
        assert_eq!(segmenter.samples_processed(), 0);
        // Earlier timestamps are accepted again after reset
        segmenter.process_sample(&Sample::scalar(0, 0.0)).unwrap();
    }

    #[test]
    fn test_events_never_overlap() {
        // Bursty stream with irregular spacing
        let mut samples = quiet(0, 100);
        let mut t = 1_000;
        for k in 0..40u64 {
            let len = 5 + (k * 7 % 40) as usize;
            samples.extend(burst(t, len, 0.5 + (k % 3) as f32 * 0.2));
            t += len as u64 * PERIOD_US;
            let gap = 10 + (k * 13 % 90) as usize;
            samples.extend(quiet(t, gap));
            t += gap as u64 * PERIOD_US;
        }
        let events = run(samples, SegmenterConfig::default());

        assert!(!events.is_empty());
        for pair in events.windows(2) {
            assert!(pair[0].end_us <= pair[1].start_us);
            assert!(!pair[0].overlaps(&pair[1]));
            assert!(pair[0].id < pair[1].id);
        }
    }
}
