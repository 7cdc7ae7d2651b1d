//! Reduction of the candidate assumptions of a spectrum, possibly reported by
//! several search engines, to a single best peptide.
//!
//! Candidates are ranked by, in order:
//! 1. combined probability (product of the engine PEPs), lower first
//! 2. protein occurrence, the highest number of spectra mapping to one of the
//!    candidate's proteins
//! 3. number of engines reporting the candidate
//! 4. fragment ion coverage, the number of residues confirmed by fragment ions
//! 5. absolute precursor error
//! 6. sequence and modification composition, lexicographically
//!
//! Positional isoforms of the winner are then compared on their best single
//! engine PEP, so that the best supported modification placement is kept.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use fnv::FnvHashMap;
use itertools::Itertools;

use crate::identification::{BestAssumption, Identification, PeptideAssumption, SpectrumMatch};
use crate::mass::{mz, ppm_error};
use crate::peptide::Peptide;
use crate::providers::{SequenceProvider, SpectrumProvider};
use crate::settings::{TiePolicy, ValidationSettings};
use crate::validation::composite_score;
use crate::{Error, Result};

/// Decides whether an assumption may compete for a spectrum at all
pub trait AssumptionFilter: Sync {
    fn is_valid(&self, spectrum: &str, assumption: &PeptideAssumption) -> bool;
}

/// Default filter: charge range, known proteins and modifications, precursor
/// tolerance. Missing precursor information does not reject an assumption.
pub struct PrecursorFilter<'a> {
    pub settings: &'a ValidationSettings,
    pub sequences: &'a dyn SequenceProvider,
    pub spectra: &'a dyn SpectrumProvider,
}

impl<'a> AssumptionFilter for PrecursorFilter<'a> {
    fn is_valid(&self, spectrum: &str, assumption: &PeptideAssumption) -> bool {
        let charge = assumption.charge;
        if charge < self.settings.min_charge || charge > self.settings.max_charge {
            return false;
        }
        let peptide = &assumption.peptide;
        if self.sequences.protein_hits(&peptide.sequence).is_empty() {
            return false;
        }
        if !self.settings.modifications.is_empty()
            && peptide
                .variable_modifications()
                .any(|m| self.settings.modification(&m.name).is_none())
        {
            return false;
        }
        match (self.spectra.precursor_mz(spectrum), peptide.monoisotopic()) {
            (Some(observed), Some(mass)) => self
                .settings
                .precursor_tol
                .contains(mz(mass, charge), observed),
            _ => true,
        }
    }
}

/// Number of spectra whose valid candidates map to each protein. A protein is
/// counted once per spectrum.
#[derive(Clone, Debug, Default)]
pub struct ProteinOccurrence(FnvHashMap<String, usize>);

impl ProteinOccurrence {
    pub fn count(
        identification: &Identification,
        filter: &dyn AssumptionFilter,
        sequences: &dyn SequenceProvider,
    ) -> Self {
        let mut counts: FnvHashMap<String, usize> = FnvHashMap::default();
        for spectrum in identification.spectra() {
            let accessions = spectrum
                .assumptions
                .iter()
                .filter(|a| filter.is_valid(&spectrum.key, a))
                .flat_map(|a| sequences.protein_hits(&a.peptide.sequence))
                .map(|hit| hit.accession)
                .collect::<BTreeSet<_>>();
            for accession in accessions {
                *counts.entry(accession).or_default() += 1;
            }
        }
        Self(counts)
    }

    pub fn get(&self, accession: &str) -> usize {
        self.0.get(accession).copied().unwrap_or(0)
    }
}

#[derive(Clone, Debug)]
struct Candidate {
    peptide: Peptide,
    matching: String,
    charge: u8,
    charge_pep: f64,
    engine_peps: BTreeMap<String, f64>,
    p: f64,
    occurrence: usize,
    coverage: Option<usize>,
    mass_error: Option<f64>,
}

impl Candidate {
    fn n_engines(&self) -> usize {
        self.engine_peps.len()
    }

    fn best_engine_pep(&self) -> f64 {
        self.engine_peps.values().copied().fold(1.0, f64::min)
    }

    fn mass_error(&self) -> f64 {
        self.mass_error.unwrap_or(f64::INFINITY)
    }

    /// Strict ranking used across candidates
    fn rank(&self, other: &Self) -> Ordering {
        self.p
            .total_cmp(&other.p)
            .then_with(|| other.occurrence.cmp(&self.occurrence))
            .then_with(|| other.n_engines().cmp(&self.n_engines()))
            .then_with(|| other.coverage.cmp(&self.coverage))
            .then_with(|| self.mass_error().total_cmp(&other.mass_error()))
            .then_with(|| self.matching.cmp(&other.matching))
    }

    /// Ranking among positional isoforms of the winner
    fn rank_placement(&self, other: &Self) -> Ordering {
        self.best_engine_pep()
            .total_cmp(&other.best_engine_pep())
            .then_with(|| other.n_engines().cmp(&self.n_engines()))
            .then_with(|| other.coverage.cmp(&self.coverage))
            .then_with(|| self.mass_error().total_cmp(&other.mass_error()))
    }
}

/// Outcome of selecting the best assumption of one spectrum
#[derive(Clone, Debug, PartialEq)]
pub struct Selection {
    pub best: BestAssumption,
    /// Combined probability gap to the runner-up
    pub delta_pep: f64,
    /// Best single engine PEP supporting the winner
    pub engine_pep: f64,
}

pub struct BestMatchSelector<'a> {
    pub settings: &'a ValidationSettings,
    pub sequences: &'a dyn SequenceProvider,
    pub spectra: &'a dyn SpectrumProvider,
    pub filter: &'a dyn AssumptionFilter,
    pub occurrence: &'a ProteinOccurrence,
}

impl<'a> BestMatchSelector<'a> {
    fn candidates(&self, spectrum: &SpectrumMatch) -> Vec<Candidate> {
        let matching = self.settings.sequence_matching;
        let observed = self.spectra.precursor_mz(&spectrum.key);

        // Fixed visiting order, whatever order the engines reported in
        let assumptions = spectrum
            .assumptions
            .iter()
            .filter(|a| self.filter.is_valid(&spectrum.key, a))
            .sorted_by(|a, b| {
                a.pep
                    .unwrap_or(1.0)
                    .total_cmp(&b.pep.unwrap_or(1.0))
                    .then_with(|| a.engine.cmp(&b.engine))
                    .then_with(|| a.charge.cmp(&b.charge))
                    .then_with(|| a.peptide.key().cmp(&b.peptide.key()))
                    .then_with(|| a.rank.cmp(&b.rank))
            });

        let mut candidates: BTreeMap<String, Candidate> = BTreeMap::new();
        for assumption in assumptions {
            let pep = assumption.pep.unwrap_or(1.0);
            let candidate = candidates
                .entry(assumption.peptide.identity_key(matching))
                .or_insert_with(|| Candidate {
                    peptide: assumption.peptide.clone(),
                    matching: assumption.peptide.matching_key(matching),
                    charge: assumption.charge,
                    charge_pep: pep,
                    engine_peps: BTreeMap::new(),
                    p: 1.0,
                    occurrence: 0,
                    coverage: None,
                    mass_error: None,
                });
            if pep < candidate.charge_pep {
                candidate.charge = assumption.charge;
                candidate.charge_pep = pep;
            }
            let engine = candidate
                .engine_peps
                .entry(assumption.engine.clone())
                .or_insert(pep);
            *engine = engine.min(pep);
        }

        candidates
            .into_values()
            .map(|mut c| {
                c.p = c.engine_peps.values().product();
                c.occurrence = self
                    .sequences
                    .protein_hits(&c.peptide.sequence)
                    .iter()
                    .map(|hit| self.occurrence.get(&hit.accession))
                    .max()
                    .unwrap_or(0);
                c.coverage = self.spectra.coverage(&spectrum.key, &c.peptide);
                c.mass_error = match (observed, c.peptide.monoisotopic()) {
                    (Some(observed), Some(mass)) => {
                        Some(ppm_error(mz(mass, c.charge), observed).abs())
                    }
                    _ => None,
                };
                c
            })
            .collect()
    }

    /// Pick the best assumption of a spectrum, `None` when no assumption
    /// passes the filter
    pub fn select(&self, spectrum: &SpectrumMatch) -> Result<Option<Selection>> {
        let mut candidates = self.candidates(spectrum);
        if candidates.is_empty() {
            return Ok(None);
        }
        candidates.sort_by(|a, b| a.rank(b));

        let leader = &candidates[0];
        let mut isoforms = candidates
            .iter()
            .filter(|c| c.matching == leader.matching && c.p == leader.p)
            .collect::<Vec<_>>();
        isoforms.sort_by(|a, b| a.rank_placement(b));

        let tied = isoforms
            .iter()
            .take_while(|c| c.rank_placement(isoforms[0]) == Ordering::Equal)
            .collect::<Vec<_>>();
        let winner = match (tied.len(), self.settings.tie_policy) {
            (1, _) => *tied[0],
            (_, TiePolicy::FirstLexicographic) => tied
                .iter()
                .map(|c| **c)
                .min_by_key(|c| c.peptide.key())
                .unwrap_or(isoforms[0]),
            (_, TiePolicy::Strict) => {
                return Err(Error::UnresolvedTie {
                    spectrum: spectrum.key.clone(),
                    candidates: tied.iter().map(|c| c.peptide.key()).sorted().collect(),
                })
            }
        };

        let delta_pep = candidates
            .iter()
            .find(|c| !std::ptr::eq(*c, winner))
            .map(|c| c.p - winner.p)
            .unwrap_or(1.0 - winner.p);

        let alternatives = candidates
            .iter()
            .filter(|c| c.matching == winner.matching)
            .map(|c| (c.peptide.clone(), c.p))
            .collect();

        log::trace!(
            "{}: {} candidates, kept {} (p = {:e})",
            spectrum.key,
            candidates.len(),
            winner.peptide,
            winner.p
        );

        Ok(Some(Selection {
            engine_pep: winner.best_engine_pep(),
            delta_pep,
            best: BestAssumption {
                peptide: winner.peptide.clone(),
                charge: winner.charge,
                score: composite_score(winner.p),
                probability: winner.p,
                engines: winner.engine_peps.keys().cloned().collect(),
                engine_peps: winner.engine_peps.clone(),
                protein_occurrence: winner.occurrence,
                coverage: winner.coverage,
                mass_error: winner.mass_error,
                decoy: self.sequences.is_decoy_peptide(&winner.peptide.sequence),
                alternatives,
            },
        }))
    }
}
