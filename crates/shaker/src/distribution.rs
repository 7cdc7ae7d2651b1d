//! Target/decoy score distributions and their conversion into posterior error
//! probabilities (PEP), FDR estimates and score thresholds.
//!
//! Scores are "higher is better". Observations sharing a score form one
//! bucket, so nothing computed here depends on the order in which
//! observations were added.

use std::collections::BTreeMap;
use std::ops::Bound;

use ordered_float::OrderedFloat;
use serde::Serialize;

use crate::ml::kde;
use crate::progress::Progress;
use crate::settings::EstimationMethod;

/// Minimal number of target and decoy observations for a distribution to
/// be trusted
pub const ROBUSTNESS_FLOOR: usize = 100;

/// Smallest sliding window, in observations
const MIN_WINDOW: usize = 10;

type Score = OrderedFloat<f64>;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
struct Counts {
    targets: usize,
    decoys: usize,
}

impl Counts {
    fn total(&self) -> usize {
        self.targets + self.decoys
    }
}

/// Summary of validating a distribution at a given FDR
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize)]
pub struct TargetDecoyResults {
    /// Worst score still accepted, `None` if nothing can be accepted
    pub score_threshold: Option<f64>,
    pub n_targets: usize,
    pub n_decoys: usize,
    /// Estimated FDR among accepted matches
    pub fdr: f64,
    /// Estimated fraction of true positives rejected, when PEPs are available
    pub fnr: Option<f64>,
    /// Confidence (%) of a match scoring exactly at the threshold
    pub confidence_at_threshold: Option<f64>,
}

/// Confidence (%) corresponding to a PEP
pub fn confidence(pep: f64) -> f64 {
    (100.0 * (1.0 - pep)).clamp(0.0, 100.0)
}

/// Number of observations the sliding window must hold for a distribution
/// of `n` observations
pub fn window_population(n: usize) -> usize {
    let root = (n as f64).sqrt().ceil() as usize;
    root.max(MIN_WINDOW).min(n)
}

#[derive(Clone, Debug, Default)]
pub struct TargetDecoyDistribution {
    buckets: BTreeMap<Score, Counts>,
    n_targets: usize,
    n_decoys: usize,
    pep: BTreeMap<Score, f64>,
}

impl TargetDecoyDistribution {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an observation. NaN scores are ignored.
    pub fn put(&mut self, score: f64, is_decoy: bool) {
        if score.is_nan() {
            log::trace!("ignoring NaN score");
            return;
        }
        let counts = self.buckets.entry(OrderedFloat(score)).or_default();
        match is_decoy {
            true => {
                counts.decoys += 1;
                self.n_decoys += 1;
            }
            false => {
                counts.targets += 1;
                self.n_targets += 1;
            }
        }
        self.pep.clear();
    }

    /// Remove one previously recorded observation, returning whether it was
    /// present
    pub fn remove(&mut self, score: f64, is_decoy: bool) -> bool {
        let key = OrderedFloat(score);
        let Some(counts) = self.buckets.get_mut(&key) else {
            return false;
        };
        match is_decoy {
            true if counts.decoys > 0 => {
                counts.decoys -= 1;
                self.n_decoys -= 1;
            }
            false if counts.targets > 0 => {
                counts.targets -= 1;
                self.n_targets -= 1;
            }
            _ => return false,
        }
        if counts.total() == 0 {
            self.buckets.remove(&key);
        }
        self.pep.clear();
        true
    }

    /// Fold every observation of `other` into this distribution
    pub fn merge(&mut self, other: &TargetDecoyDistribution) {
        for (score, counts) in &other.buckets {
            let entry = self.buckets.entry(*score).or_default();
            entry.targets += counts.targets;
            entry.decoys += counts.decoys;
        }
        self.n_targets += other.n_targets;
        self.n_decoys += other.n_decoys;
        self.pep.clear();
    }

    pub fn len(&self) -> usize {
        self.n_targets + self.n_decoys
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn n_targets(&self) -> usize {
        self.n_targets
    }

    pub fn n_decoys(&self) -> usize {
        self.n_decoys
    }

    pub fn has_decoys(&self) -> bool {
        self.n_decoys > 0
    }

    /// `(score, targets, decoys)` for every distinct score, best first
    pub fn observations(&self) -> impl Iterator<Item = (f64, usize, usize)> + '_ {
        self.buckets
            .iter()
            .rev()
            .map(|(s, c)| (s.0, c.targets, c.decoys))
    }

    pub fn is_estimated(&self) -> bool {
        !self.pep.is_empty()
    }

    /// True when too few targets or decoys were observed for the estimates to
    /// be trusted
    pub fn suspicious_input(&self, floor: usize) -> bool {
        self.n_targets < floor || self.n_decoys < floor
    }

    /// Estimate a PEP for every distinct score. Empty or decoy-free
    /// distributions are left unestimated; lookups then return 1.0.
    pub fn estimate_probabilities(&mut self, method: EstimationMethod, progress: &dyn Progress) {
        self.pep.clear();
        if self.is_empty() || !self.has_decoys() {
            progress.inc(1);
            return;
        }

        let mut peps = match method {
            EstimationMethod::SlidingWindow => self.sliding_window(),
            EstimationMethod::KernelDensity => self.kernel_density().unwrap_or_else(|| {
                log::debug!("kernel density fit failed, falling back to sliding window");
                self.sliding_window()
            }),
        };

        // Worse-or-equal scores never get a strictly better PEP
        let mut running = 0.0f64;
        for pep in peps.iter_mut() {
            running = running.max(*pep);
            *pep = running;
        }

        self.pep = self
            .buckets
            .keys()
            .rev()
            .copied()
            .zip(peps)
            .collect();
        progress.inc(1);
    }

    /// Adaptive window PEP estimate for each bucket, best bucket first.
    ///
    /// The window is centered (in observation rank) on the bucket and holds at
    /// least [`window_population`] observations; it is shifted inwards at
    /// either end of the distribution. Buckets are never split.
    fn sliding_window(&self) -> Vec<f64> {
        let counts = self.buckets.values().rev().copied().collect::<Vec<_>>();
        let n = self.len();
        let width = window_population(n);

        // prefix[i] = observations strictly better than bucket i
        let mut prefix = Vec::with_capacity(counts.len() + 1);
        let mut prefix_decoys = Vec::with_capacity(counts.len() + 1);
        prefix.push(0usize);
        prefix_decoys.push(0usize);
        for c in &counts {
            prefix.push(prefix[prefix.len() - 1] + c.total());
            prefix_decoys.push(prefix_decoys[prefix_decoys.len() - 1] + c.decoys);
        }

        // Bucket holding the observation at a given rank
        let bucket_of = |rank: usize| prefix.partition_point(|&p| p <= rank) - 1;

        counts
            .iter()
            .enumerate()
            .map(|(ix, c)| {
                let center = prefix[ix] + c.total() / 2;
                let mut start = center.saturating_sub(width / 2);
                let mut end = start + width;
                if end > n {
                    end = n;
                    start = n.saturating_sub(width);
                }
                let lo = bucket_of(start).min(ix);
                let hi = (bucket_of(end - 1) + 1).max(ix + 1);

                let total = prefix[hi] - prefix[lo];
                let decoys = prefix_decoys[hi] - prefix_decoys[lo];
                decoys as f64 / total as f64
            })
            .collect()
    }

    /// Kernel density PEP for each bucket, best bucket first
    fn kernel_density(&self) -> Option<Vec<f64>> {
        let mut scores = Vec::with_capacity(self.len());
        let mut decoys = Vec::with_capacity(self.len());
        for (score, counts) in &self.buckets {
            for _ in 0..counts.targets {
                scores.push(score.0);
                decoys.push(false);
            }
            for _ in 0..counts.decoys {
                scores.push(score.0);
                decoys.push(true);
            }
        }
        let estimator = kde::Builder::default().build(&scores, &decoys)?;
        Some(
            self.buckets
                .keys()
                .rev()
                .map(|s| estimator.posterior_error(s.0))
                .collect(),
        )
    }

    /// PEP of the nearest estimated score. Equidistant neighbours resolve to
    /// the worse score. Returns 1.0 if the distribution was not estimated.
    pub fn probability(&self, score: f64) -> f64 {
        let key = OrderedFloat(score);
        let below = self.pep.range(..=key).next_back();
        let above = self
            .pep
            .range((Bound::Excluded(key), Bound::Unbounded))
            .next();
        match (below, above) {
            (Some((s, p)), _) if s.0 == score => *p,
            (Some((lo, p_lo)), Some((hi, p_hi))) => {
                if hi.0 - score < score - lo.0 {
                    *p_hi
                } else {
                    *p_lo
                }
            }
            (Some((_, p)), None) | (None, Some((_, p))) => *p,
            (None, None) => 1.0,
        }
    }

    /// PEP linearly interpolated between the two bracketing scores
    pub fn interpolated_probability(&self, score: f64) -> f64 {
        let key = OrderedFloat(score);
        let below = self.pep.range(..=key).next_back();
        let above = self.pep.range(key..).next();
        match (below, above) {
            (Some((lo, p_lo)), Some((hi, p_hi))) if hi.0 > lo.0 => {
                let t = (score - lo.0) / (hi.0 - lo.0);
                p_lo + (p_hi - p_lo) * t
            }
            (Some((_, p)), _) | (None, Some((_, p))) => *p,
            (None, None) => 1.0,
        }
    }

    /// Decoys over targets among observations scoring at least `score`,
    /// `None` if no target reaches it
    pub fn fdr_at(&self, score: f64) -> Option<f64> {
        let (targets, decoys) = self
            .buckets
            .range(OrderedFloat(score)..)
            .fold((0, 0), |(t, d), (_, c)| (t + c.targets, d + c.decoys));
        match targets {
            0 => None,
            _ => Some((decoys as f64 / targets as f64).min(1.0)),
        }
    }

    /// `(score, q-value)` for every distinct score, best first. The q-value is
    /// the minimal FDR at which a score is accepted.
    pub fn q_values(&self) -> Vec<(f64, f64)> {
        let mut decoys = 0;
        let mut targets = 0;
        let mut q = self
            .buckets
            .iter()
            .rev()
            .map(|(score, c)| {
                decoys += c.decoys;
                targets += c.targets;
                let fdr = match targets {
                    0 => 1.0,
                    _ => (decoys as f64 / targets as f64).min(1.0),
                };
                (score.0, fdr)
            })
            .collect::<Vec<_>>();

        // Reverse, and calculate the cumulative minimum
        let mut q_min = 1.0f64;
        for (_, q) in q.iter_mut().rev() {
            q_min = q_min.min(*q);
            *q = q_min;
        }
        q
    }

    /// Accept every observation whose q-value is at most `max_fdr`
    pub fn results_at_fdr(&self, max_fdr: f64) -> TargetDecoyResults {
        let threshold = self
            .q_values()
            .into_iter()
            .filter(|&(_, q)| q <= max_fdr)
            .map(|(score, _)| score)
            .last();

        let Some(threshold) = threshold else {
            return TargetDecoyResults {
                fnr: self.is_estimated().then_some(1.0),
                ..Default::default()
            };
        };

        let mut results = TargetDecoyResults {
            score_threshold: Some(threshold),
            confidence_at_threshold: self
                .is_estimated()
                .then(|| confidence(self.probability(threshold))),
            ..Default::default()
        };
        let mut accepted_tp = 0.0;
        let mut total_tp = 0.0;
        for (score, c) in self.buckets.iter().rev() {
            let tp = c.targets as f64 * (1.0 - self.probability(score.0));
            total_tp += tp;
            if score.0 >= threshold {
                results.n_targets += c.targets;
                results.n_decoys += c.decoys;
                accepted_tp += tp;
            }
        }
        if results.n_targets > 0 {
            results.fdr = (results.n_decoys as f64 / results.n_targets as f64).min(1.0);
        }
        if self.is_estimated() && total_tp > 0.0 {
            results.fnr = Some((total_tp - accepted_tp) / total_tp);
        }
        results
    }
}
