//! Waveform signal statistics.
//!
//! This module provides low-level signal processing for the segmenter:
//! - Baseline noise estimation using incremental exponential filtering
//! - Per-event amplitude accumulation and feature extraction
//! - Spectral band energies via a Goertzel filter bank
//!
//! Design note: The baseline uses incremental updates (O(1) per sample).
//! Only the event accumulator keeps a buffer, bounded by the maximum event
//! duration.

use crate::types::FeatureVector;

/// Exponentially weighted mean and variance of sample energy.
///
/// During warm-up the effective smoothing factor is `max(alpha, 1/n)`, so
/// the first few samples behave like a plain running average instead of
/// dragging an arbitrary initial value along.
#[derive(Debug, Clone)]
pub struct EnergyBaseline {
    alpha: f64,
    mean: f64,
    variance: f64,
    noise_floor: f64,
    sample_count: u64,
}

impl EnergyBaseline {
    pub fn new(alpha: f64, noise_floor: f64) -> Self {
        Self {
            alpha,
            mean: 0.0,
            variance: 0.0,
            noise_floor,
            sample_count: 0,
        }
    }

    /// Fold one quiet-sample energy into the baseline.
    pub fn update(&mut self, energy: f64) {
        self.sample_count += 1;
        let alpha = self.alpha.max(1.0 / self.sample_count as f64);

        let delta = energy - self.mean;
        self.mean += alpha * delta;
        self.variance = (1.0 - alpha) * (self.variance + alpha * delta * delta);
    }

    /// Seed the baseline from a warm-up window.
    ///
    /// Energies above the window's robust threshold (median plus
    /// `sensitivity` robust standard deviations, from the median absolute
    /// deviation) are left out, so a burst already under way when capture
    /// starts does not raise the noise floor. Returns how many were left out.
    pub fn seed(&mut self, energies: &[f64], sensitivity: f64) -> usize {
        if energies.is_empty() {
            return 0;
        }
        let center = median(energies.to_vec());
        let mad = median(energies.iter().map(|e| (e - center).abs()).collect());
        let cutoff = center + sensitivity * (MAD_TO_SIGMA * mad).max(self.noise_floor);

        let mut excluded = 0;
        for &energy in energies {
            if energy > cutoff {
                excluded += 1;
            } else {
                self.update(energy);
            }
        }
        excluded
    }

    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// Standard deviation, never below the configured noise floor.
    pub fn std_dev(&self) -> f64 {
        self.variance.max(0.0).sqrt().max(self.noise_floor)
    }

    /// Energy level above which a sample counts as a changepoint.
    pub fn threshold(&self, sensitivity: f64) -> f64 {
        self.mean + sensitivity * self.std_dev()
    }

    pub fn sample_count(&self) -> u64 {
        self.sample_count
    }

    pub fn reset(&mut self) {
        self.mean = 0.0;
        self.variance = 0.0;
        self.sample_count = 0;
    }
}

/// Scale from median absolute deviation to standard deviation for Gaussian
/// noise.
const MAD_TO_SIGMA: f64 = 1.4826;

fn median(mut values: Vec<f64>) -> f64 {
    values.sort_by(|a, b| a.total_cmp(b));
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}

/// Collects the samples of one open event and turns them into features.
#[derive(Debug, Clone, Default)]
pub struct EventAccumulator {
    /// RMS amplitude per sample, in arrival order.
    trace: Vec<f64>,
    energy_sum: f64,
    peak: f64,
    running_mean: f64,
}

impl EventAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one sample's energy to the event.
    pub fn push(&mut self, energy: f64) {
        let amplitude = energy.max(0.0).sqrt();
        self.trace.push(amplitude);
        self.energy_sum += energy;
        self.peak = self.peak.max(amplitude);

        // Welford-style incremental mean for numerical stability
        let count = self.trace.len() as f64;
        self.running_mean += (amplitude - self.running_mean) / count;
    }

    /// Absorb another accumulator (used when coalescing split humps).
    pub fn merge(&mut self, other: EventAccumulator) {
        for amplitude in other.trace {
            self.push(amplitude * amplitude);
        }
    }

    pub fn len(&self) -> usize {
        self.trace.len()
    }

    pub fn is_empty(&self) -> bool {
        self.trace.is_empty()
    }

    pub fn energy_sum(&self) -> f64 {
        self.energy_sum
    }

    pub fn peak(&self) -> f64 {
        self.peak
    }

    pub fn mean_amplitude(&self) -> f64 {
        self.running_mean
    }

    /// Build the event feature vector.
    ///
    /// Spectral bands are reported missing when the event holds fewer than
    /// two samples per band; too short a trace cannot resolve them.
    pub fn features(&self, duration_us: u64, bands: usize) -> FeatureVector {
        let mut dims = Vec::with_capacity(FeatureVector::SPECTRAL_START + bands);
        dims.push(Some(self.energy_sum));
        dims.push(Some(duration_us as f64 / 1000.0));
        dims.push(Some(self.peak));
        dims.push(Some(self.running_mean));

        match band_energies(&self.trace, bands) {
            Some(energies) => dims.extend(energies.into_iter().map(Some)),
            None => dims.extend(std::iter::repeat(None).take(bands)),
        }

        FeatureVector::new(dims)
    }
}

/// Goertzel power at `bands` evenly spaced normalized frequencies.
///
/// Band `k` is centered at `(k + 0.5) / (2 * bands)` cycles per sample, so
/// the bank covers DC..Nyquist. The trace mean is removed first so the
/// first band is not swamped by the DC offset. Power is normalized by n².
pub fn band_energies(trace: &[f64], bands: usize) -> Option<Vec<f64>> {
    if bands == 0 {
        return Some(Vec::new());
    }
    let n = trace.len();
    if n < 2 * bands {
        return None;
    }

    let mean = trace.iter().sum::<f64>() / n as f64;
    let norm = (n * n) as f64;

    let energies = (0..bands)
        .map(|k| {
            let freq = (k as f64 + 0.5) / (2.0 * bands as f64);
            goertzel_power(trace, mean, freq) / norm
        })
        .collect();
    Some(energies)
}

fn goertzel_power(trace: &[f64], mean: f64, freq: f64) -> f64 {
    let omega = 2.0 * std::f64::consts::PI * freq;
    let coeff = 2.0 * omega.cos();
    let (mut s1, mut s2) = (0.0, 0.0);
    for &x in trace {
        let s0 = (x - mean) + coeff * s1 - s2;
        s2 = s1;
        s1 = s0;
    }
    (s1 * s1 + s2 * s2 - coeff * s1 * s2).max(0.0)
}
