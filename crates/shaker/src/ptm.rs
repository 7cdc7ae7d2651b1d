//! Modification site localization.
//!
//! For every variable modification carried by the best peptide of a spectrum,
//! each candidate site receives two scores computed from the alternative
//! placements of the modification (positional isoforms of the best peptide):
//!
//! * the delta score, how much better the best placement using the site scores
//!   than the best placement not using it
//! * the probabilistic score, the share (%) of the placement likelihood that
//!   uses the site, unless localization probabilities are supplied for the
//!   spectrum
//!
//! A localization is in conflict when the sites ranked best by probabilistic
//! score are not the sites of the best placement. Conflicts play the role of
//! decoys when estimating the false localization rate (FLR).

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::identification::BestAssumption;
use crate::providers::SpectrumProvider;
use crate::settings::ValidationSettings;
use crate::validation::composite_score;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PtmConfidence {
    #[default]
    NotFound,
    Random,
    Doubtful,
    Confident,
    VeryConfident,
}

impl PtmConfidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            PtmConfidence::NotFound => "not_found",
            PtmConfidence::Random => "random",
            PtmConfidence::Doubtful => "doubtful",
            PtmConfidence::Confident => "confident",
            PtmConfidence::VeryConfident => "very_confident",
        }
    }
}

/// Site scores and confidence for one modification on one match
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PtmScoring {
    pub delta: BTreeMap<usize, f64>,
    pub probabilistic: BTreeMap<usize, f64>,
    pub levels: BTreeMap<usize, PtmConfidence>,
}

fn keep_max<T: PartialOrd + Copy>(map: &mut BTreeMap<usize, T>, site: usize, value: T) {
    match map.get_mut(&site) {
        Some(current) if *current >= value => {}
        Some(current) => *current = value,
        None => {
            map.insert(site, value);
        }
    }
}

impl PtmScoring {
    /// Merge `other` into `self`, keeping the best score and level of every
    /// site
    pub fn add_all(&mut self, other: &PtmScoring) {
        for (&site, &score) in &other.delta {
            keep_max(&mut self.delta, site, score);
        }
        for (&site, &score) in &other.probabilistic {
            keep_max(&mut self.probabilistic, site, score);
        }
        for (&site, &level) in &other.levels {
            keep_max(&mut self.levels, site, level);
        }
    }

    /// The same scores with every site moved by `offset`, e.g. from peptide
    /// to protein coordinates
    pub fn shifted(&self, offset: usize) -> PtmScoring {
        let shift = |map: &BTreeMap<usize, f64>| -> BTreeMap<usize, f64> {
            map.iter()
                .map(|(site, score)| (site + offset, *score))
                .collect()
        };
        PtmScoring {
            delta: shift(&self.delta),
            probabilistic: shift(&self.probabilistic),
            levels: self
                .levels
                .iter()
                .map(|(site, level)| (site + offset, *level))
                .collect(),
        }
    }

    pub fn level(&self, site: usize) -> PtmConfidence {
        self.levels.get(&site).copied().unwrap_or_default()
    }

    /// Sites localized with at least the given confidence
    pub fn sites_at_least(&self, level: PtmConfidence) -> Vec<usize> {
        self.levels
            .iter()
            .filter(|(_, l)| **l >= level)
            .map(|(site, _)| *site)
            .collect()
    }
}

/// Localization of one modification on the best peptide of a spectrum,
/// before confidence levels are assigned
#[derive(Clone, Debug, PartialEq)]
pub struct SiteLocalization {
    pub modification: String,
    /// Copies of the modification on the peptide
    pub n_mods: usize,
    pub possible_sites: Vec<usize>,
    /// Sites occupied in the best peptide
    pub sites: Vec<usize>,
    pub scoring: PtmScoring,
    pub conflict: bool,
}

impl SiteLocalization {
    /// Score of the localization as a whole: its least supported site
    pub fn score(&self) -> f64 {
        self.sites
            .iter()
            .map(|site| self.probabilistic(*site))
            .fold(100.0, f64::min)
    }

    pub fn probabilistic(&self, site: usize) -> f64 {
        self.scoring
            .probabilistic
            .get(&site)
            .copied()
            .unwrap_or(0.0)
    }

    /// Every site is occupied, so there is nothing to localize
    pub fn is_trivial(&self) -> bool {
        self.possible_sites.len() <= self.n_mods
    }

    /// Probabilistic score expected from a random placement
    pub fn random_score(&self) -> f64 {
        100.0 * self.n_mods as f64 / self.possible_sites.len().max(1) as f64
    }
}

pub struct PtmLocalizationScorer<'a> {
    pub settings: &'a ValidationSettings,
    pub spectra: &'a dyn SpectrumProvider,
}

impl<'a> PtmLocalizationScorer<'a> {
    /// Localize every variable modification of the best assumption
    pub fn localize(&self, spectrum: &str, best: &BestAssumption) -> Vec<SiteLocalization> {
        let peptide = &best.peptide;
        let names = peptide
            .variable_modifications()
            .map(|m| m.name.as_str())
            .collect::<BTreeSet<_>>();

        names
            .into_iter()
            .map(|name| {
                let sites = peptide.modification_sites(name);
                let placements = best
                    .alternatives
                    .iter()
                    .map(|(p, prob)| (p.modification_sites(name), composite_score(*prob)))
                    .collect::<Vec<_>>();

                let mut possible = self
                    .settings
                    .modification(name)
                    .map(|m| m.possible_sites(&peptide.sequence))
                    .unwrap_or_default()
                    .into_iter()
                    .collect::<BTreeSet<_>>();
                possible.extend(sites.iter().copied());
                for (placed, _) in &placements {
                    possible.extend(placed.iter().copied());
                }

                let mut scoring = PtmScoring::default();
                for &site in &possible {
                    let best_with = placements
                        .iter()
                        .filter(|(placed, _)| placed.contains(&site))
                        .map(|(_, score)| *score)
                        .fold(f64::NEG_INFINITY, f64::max);
                    let best_without = placements
                        .iter()
                        .filter(|(placed, _)| !placed.contains(&site))
                        .map(|(_, score)| *score)
                        .fold(0.0, f64::max);
                    let delta = match best_with.is_finite() {
                        true => (best_with - best_without).max(0.0),
                        false => 0.0,
                    };
                    scoring.delta.insert(site, delta);
                }

                scoring.probabilistic = match self.spectra.site_probabilities(spectrum, peptide, name)
                {
                    Some(external) => possible
                        .iter()
                        .map(|site| (*site, external.get(site).copied().unwrap_or(0.0)))
                        .collect(),
                    None => likelihood_shares(&possible, &placements),
                };

                let n_mods = sites.len();
                let mut top = possible
                    .iter()
                    .copied()
                    .map(|site| {
                        let prob = scoring.probabilistic.get(&site).copied().unwrap_or(0.0);
                        let delta = scoring.delta.get(&site).copied().unwrap_or(0.0);
                        (site, prob, delta)
                    })
                    .collect::<Vec<_>>();
                top.sort_by(|a, b| {
                    b.1.total_cmp(&a.1)
                        .then_with(|| b.2.total_cmp(&a.2))
                        .then_with(|| a.0.cmp(&b.0))
                });
                let top = top
                    .iter()
                    .take(n_mods)
                    .map(|(site, _, _)| *site)
                    .collect::<BTreeSet<_>>();
                let conflict = top != sites.iter().copied().collect::<BTreeSet<_>>();

                SiteLocalization {
                    modification: name.to_string(),
                    n_mods,
                    possible_sites: possible.into_iter().collect(),
                    sites,
                    scoring,
                    conflict,
                }
            })
            .collect()
    }

    /// Confidence of every occupied site. `flr` looks up the false
    /// localization rate at a probabilistic score; `reliable` is false when the
    /// FLR estimate cannot be trusted, in which case a fixed probabilistic
    /// score threshold is used instead.
    pub fn site_levels<F>(
        &self,
        localization: &SiteLocalization,
        flr: F,
        reliable: bool,
    ) -> BTreeMap<usize, PtmConfidence>
    where
        F: Fn(f64) -> Option<f64>,
    {
        let localized = match localization.conflict {
            true => PtmConfidence::Confident,
            false => PtmConfidence::VeryConfident,
        };
        localization
            .sites
            .iter()
            .map(|&site| {
                let prob = localization.probabilistic(site);
                let level = if localization.is_trivial() {
                    PtmConfidence::VeryConfident
                } else if prob <= localization.random_score() {
                    PtmConfidence::Random
                } else if !reliable {
                    match prob >= self.settings.probabilistic_score_threshold {
                        true => localized,
                        false => PtmConfidence::Doubtful,
                    }
                } else {
                    match flr(prob).unwrap_or(1.0) <= self.settings.flr {
                        true => localized,
                        false => PtmConfidence::Doubtful,
                    }
                };
                (site, level)
            })
            .collect()
    }
}

/// Share (%) of the placement likelihood that uses each site. Placement
/// scores are on a `-10 log10(p)` scale.
fn likelihood_shares(possible: &BTreeSet<usize>, placements: &[(Vec<usize>, f64)]) -> BTreeMap<usize, f64> {
    let max = placements
        .iter()
        .map(|(_, score)| *score)
        .fold(f64::NEG_INFINITY, f64::max);
    let weights = placements
        .iter()
        .map(|(_, score)| 10f64.powf((score - max) / 10.0))
        .collect::<Vec<_>>();
    let total = weights.iter().fold(0.0f64, |acc, w| acc + w);

    possible
        .iter()
        .map(|&site| {
            let with = placements
                .iter()
                .zip(&weights)
                .filter(|((placed, _), _)| placed.contains(&site))
                .fold(0.0f64, |acc, (_, w)| acc + w);
            let share = match total > 0.0 {
                true => 100.0 * with / total,
                false => 0.0,
            };
            (site, share)
        })
        .collect()
}
