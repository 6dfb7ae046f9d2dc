//! Event classification against the fingerprint store.
//!
//! Each activity event is compared with every fingerprint entry and turned
//! into a ranked list of candidate labels. Comparison happens only over the
//! dimensions present on both sides; the score is the Gaussian likelihood of
//! the normalized distance, scaled down by how much of the template was
//! actually compared.
//!
//! Classification never fails. An event that matches nothing produces an
//! empty ranked list, which downstream treats as "no evidence".

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::debug;

use crate::config::ClassifierConfig;
use crate::fingerprint::{FingerprintEntry, MappingStore};
use crate::types::{Candidate, Classification, Event, FeatureVector};

/// How an event is compared against a template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrategy {
    /// Every template dimension must be present and within tolerance.
    ExactMatch,
    /// Missing dimensions are skipped; every compared one must be within
    /// tolerance.
    PartialOverlap,
    /// Soft match over shared dimensions, no per-dimension gate.
    WeightedDistance,
}

/// Result of comparing one event against one entry.
#[derive(Debug, Clone, Copy, PartialEq)]
struct MatchOutcome {
    score: f64,
    /// RMS of per-dimension distances in tolerance units.
    distance: f64,
    /// Euclidean distance in feature units.
    raw_distance: f64,
    /// Compared dimensions / template dimensions.
    overlap: f64,
}

/// Per-dimension comparison over dimensions present on both sides.
struct Comparison {
    /// Distance in tolerance units for each compared dimension.
    normalized: Vec<f64>,
    /// Sum of squared differences in feature units.
    raw_sq: f64,
    template_dims: usize,
}

impl Comparison {
    fn between(features: &FeatureVector, entry: &FingerprintEntry) -> Self {
        let mut normalized = Vec::with_capacity(entry.template.len());
        let mut raw_sq = 0.0;
        let mut template_dims = 0;

        for (dim, template_value) in entry.template.dims().iter().enumerate() {
            let Some(expected) = template_value else {
                continue;
            };
            template_dims += 1;

            let (Some(observed), Some(tolerance)) = (features.get(dim), entry.tolerance(dim)) else {
                continue;
            };
            let diff = observed - expected;
            normalized.push(diff.abs() / tolerance);
            raw_sq += diff * diff;
        }

        Self {
            normalized,
            raw_sq,
            template_dims,
        }
    }

    fn overlap(&self) -> f64 {
        if self.template_dims == 0 {
            return 0.0;
        }
        self.normalized.len() as f64 / self.template_dims as f64
    }

    fn distance(&self) -> f64 {
        if self.normalized.is_empty() {
            return f64::INFINITY;
        }
        let mean_sq =
            self.normalized.iter().map(|d| d * d).sum::<f64>() / self.normalized.len() as f64;
        mean_sq.sqrt()
    }

    fn raw_distance(&self) -> f64 {
        if self.normalized.is_empty() {
            return f64::INFINITY;
        }
        self.raw_sq.sqrt()
    }

    fn all_within_tolerance(&self) -> bool {
        self.normalized.iter().all(|&d| d <= 1.0)
    }
}

/// Gaussian likelihood of a normalized distance, in (0, 1].
fn gaussian_score(distance: f64) -> f64 {
    (-0.5 * distance * distance).exp()
}

fn score_entry(
    strategy: MatchStrategy,
    features: &FeatureVector,
    entry: &FingerprintEntry,
) -> Option<MatchOutcome> {
    let comparison = Comparison::between(features, entry);
    let overlap = comparison.overlap();
    if overlap <= 0.0 {
        return None;
    }

    let admitted = match strategy {
        MatchStrategy::ExactMatch => overlap >= 1.0 && comparison.all_within_tolerance(),
        MatchStrategy::PartialOverlap => comparison.all_within_tolerance(),
        MatchStrategy::WeightedDistance => true,
    };
    if !admitted {
        return None;
    }

    let distance = comparison.distance();
    Some(MatchOutcome {
        score: gaussian_score(distance) * overlap,
        distance,
        raw_distance: comparison.raw_distance(),
        overlap,
    })
}

/// Ranks fingerprint entries for each activity event.
pub struct EventClassifier {
    store: Arc<MappingStore>,
    config: ClassifierConfig,
    classified_count: u64,
    unclassified_count: u64,
}

impl EventClassifier {
    pub fn new(store: Arc<MappingStore>, config: ClassifierConfig) -> Self {
        Self {
            store,
            config,
            classified_count: 0,
            unclassified_count: 0,
        }
    }

    /// Classify one event.
    ///
    /// Returns `None` for idle gaps; every activity event yields exactly one
    /// classification, possibly with an empty candidate list.
    pub fn classify(&mut self, event: &Event) -> Option<Classification> {
        let features = event.features()?;

        let mut scored: Vec<(Candidate, f64)> = Vec::new();
        let mut best_overlap: f64 = 0.0;

        if !features.is_empty() {
            for entry in self.store.entries() {
                let Some(outcome) = score_entry(self.config.strategy, features, entry) else {
                    continue;
                };
                best_overlap = best_overlap.max(outcome.overlap);
                if outcome.score < self.config.min_confidence {
                    continue;
                }
                scored.push((
                    Candidate {
                        label: entry.label.clone(),
                        score: outcome.score,
                        sample_count: entry.sample_count,
                        normalized_distance: outcome.distance,
                        raw_distance: outcome.raw_distance,
                    },
                    outcome.overlap,
                ));
            }
        }

        scored.sort_by(|(a, _), (b, _)| rank(a, b));
        scored.truncate(self.config.max_candidates);

        let overlap_fraction = scored.first().map(|(_, o)| *o).unwrap_or(best_overlap);
        let candidates: Vec<Candidate> = scored.into_iter().map(|(c, _)| c).collect();
        let reduced_confidence = overlap_fraction < self.config.min_overlap_fraction;

        match candidates.first() {
            Some(top) => {
                self.classified_count += 1;
                debug!(
                    event = event.id,
                    label = %top.label,
                    score = top.score,
                    overlap = overlap_fraction,
                    reduced_confidence,
                    "event classified"
                );
            }
            None => {
                self.unclassified_count += 1;
                debug!(event = event.id, overlap = overlap_fraction, "event unclassified");
            }
        }

        Some(Classification {
            event_id: event.id,
            start_us: event.start_us,
            end_us: event.end_us,
            candidates,
            overlap_fraction,
            reduced_confidence,
        })
    }

    pub fn classified_count(&self) -> u64 {
        self.classified_count
    }

    pub fn unclassified_count(&self) -> u64 {
        self.unclassified_count
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }
}

/// Score desc, then sample count desc, then raw distance asc.
fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| b.sample_count.cmp(&a.sample_count))
        .then_with(|| a.raw_distance.total_cmp(&b.raw_distance))
}
