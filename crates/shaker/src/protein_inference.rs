//! Simplification of protein groups: redundant groups are removed, then every
//! peptide is assigned to the best scoring group(s) explaining it, and groups
//! left without peptides are dropped.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use fnv::FnvHashMap;
use itertools::Itertools;
use log::info;

use crate::protein_grouping::ProteinGroup;
use crate::providers::SequenceProvider;
use crate::validation::{aggregate_score, ProteinInference, ValidationLevel};

/// What the resolver needs to know about a peptide
#[derive(Clone, Debug, PartialEq)]
pub struct PeptideEvidence {
    pub pep: f64,
    pub level: ValidationLevel,
    pub n_validated_spectra: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct ResolvedGroup {
    pub group: ProteinGroup,
    /// Peptides for which this group is (one of) the best explanation(s)
    pub assigned: BTreeSet<String>,
    /// Score over the assigned peptides
    pub score: f64,
    pub probability: f64,
    pub n_confident_peptides: usize,
    pub n_doubtful_peptides: usize,
    pub n_validated_spectra: usize,
    /// No peptide is assigned to this group alone
    pub shared: bool,
}

#[derive(Clone, Debug, Default)]
pub struct InferenceResult {
    pub retained: Vec<ResolvedGroup>,
    /// Groups whose peptides are a strict subset of another group's
    pub redundant: Vec<ProteinGroup>,
    /// Groups that are the best explanation of none of their peptides
    pub unassigned: Vec<ProteinGroup>,
    pub inference: BTreeMap<String, PeptideInference>,
}

/// Protein inference outcome of one peptide, from the retained groups it was
/// assigned to
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PeptideInference {
    pub class: ProteinInference,
    /// Exactly one group explains the peptide
    pub unique: bool,
}

/// Score and probability of a group from its peptides. Validated peptides
/// count if there are any, otherwise all of them do.
pub fn group_score<'a, I>(peptides: I, evidence: &BTreeMap<String, PeptideEvidence>) -> (f64, f64)
where
    I: IntoIterator<Item = &'a String>,
{
    aggregate_score(
        peptides
            .into_iter()
            .filter_map(|p| evidence.get(p))
            .map(|e| (e.pep, e.level.is_validated())),
    )
}

pub struct ProteinGroupResolver<'a> {
    pub sequences: &'a dyn SequenceProvider,
    pub remove_redundant: bool,
}

impl<'a> ProteinGroupResolver<'a> {
    /// Split `groups` into the groups to keep and those whose peptide set is
    /// a strict subset of another group's
    pub fn remove_redundant_groups(
        &self,
        groups: Vec<ProteinGroup>,
    ) -> (Vec<ProteinGroup>, Vec<ProteinGroup>) {
        let mut by_peptide: FnvHashMap<&str, Vec<usize>> = FnvHashMap::default();
        for (ix, group) in groups.iter().enumerate() {
            for peptide in &group.peptides {
                by_peptide.entry(peptide.as_str()).or_default().push(ix);
            }
        }

        let redundant = groups
            .iter()
            .enumerate()
            .map(|(ix, group)| {
                let Some(first) = group.peptides.iter().next() else {
                    return true;
                };
                // Any superset must also contain the first peptide
                by_peptide[first.as_str()].iter().any(|&other| {
                    other != ix
                        && groups[other].peptides.len() > group.peptides.len()
                        && group.peptides.is_subset(&groups[other].peptides)
                })
            })
            .collect::<Vec<_>>();

        let (removed, kept): (Vec<_>, Vec<_>) = groups
            .into_iter()
            .zip(redundant)
            .partition(|(_, redundant)| *redundant);
        (
            kept.into_iter().map(|(g, _)| g).collect(),
            removed.into_iter().map(|(g, _)| g).collect(),
        )
    }

    /// Assign every peptide to the best scoring group(s) explaining it.
    /// Returns the groups explaining at least one peptide, and the others.
    pub fn retain_best_scoring_groups(
        &self,
        groups: Vec<ProteinGroup>,
        evidence: &BTreeMap<String, PeptideEvidence>,
    ) -> (Vec<ResolvedGroup>, Vec<ProteinGroup>) {
        let preliminary = groups
            .iter()
            .map(|g| group_score(&g.peptides, evidence).0)
            .collect::<Vec<_>>();

        let mut by_peptide: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
        for (ix, group) in groups.iter().enumerate() {
            for peptide in &group.peptides {
                by_peptide.entry(peptide.as_str()).or_default().push(ix);
            }
        }

        let mut assigned: Vec<BTreeSet<String>> = vec![BTreeSet::new(); groups.len()];
        let mut unique: Vec<bool> = vec![false; groups.len()];
        for (peptide, candidates) in &by_peptide {
            let best = candidates
                .iter()
                .map(|&ix| preliminary[ix])
                .fold(f64::NEG_INFINITY, f64::max);
            let winners = candidates
                .iter()
                .copied()
                .filter(|&ix| preliminary[ix] == best)
                .collect::<Vec<_>>();
            for &ix in &winners {
                assigned[ix].insert(peptide.to_string());
            }
            if let [ix] = winners[..] {
                unique[ix] = true;
            }
        }

        let mut retained = Vec::new();
        let mut unassigned = Vec::new();
        for ((group, assigned), unique) in groups.into_iter().zip(assigned).zip(unique) {
            if assigned.is_empty() {
                log::trace!("dropping protein group {}", group.key);
                unassigned.push(group);
                continue;
            }
            let (score, probability) = group_score(&assigned, evidence);
            let levels = assigned.iter().filter_map(|p| evidence.get(p));
            let mut resolved = ResolvedGroup {
                group,
                assigned: BTreeSet::new(),
                score,
                probability,
                n_confident_peptides: 0,
                n_doubtful_peptides: 0,
                n_validated_spectra: 0,
                shared: !unique,
            };
            for peptide in levels {
                match peptide.level {
                    ValidationLevel::Confident => resolved.n_confident_peptides += 1,
                    ValidationLevel::Doubtful => resolved.n_doubtful_peptides += 1,
                    _ => continue,
                }
                resolved.n_validated_spectra += peptide.n_validated_spectra;
            }
            resolved.assigned = assigned;
            retained.push(resolved);
        }
        (retained, unassigned)
    }

    /// Protein inference class of a peptide from the proteins containing it.
    /// Proteins sharing a gene name are related; proteins without one are
    /// related to nothing.
    pub fn inference_class(&self, accessions: &[String]) -> ProteinInference {
        let accessions = accessions.iter().sorted().dedup().collect::<Vec<_>>();
        if accessions.len() <= 1 {
            return match accessions.len() {
                1 => ProteinInference::SingleProtein,
                _ => ProteinInference::NotDetermined,
            };
        }

        let mut clusters: BTreeMap<&str, usize> = BTreeMap::new();
        let mut singletons = 0;
        for accession in &accessions {
            match self.sequences.gene(accession) {
                Some(gene) => *clusters.entry(gene).or_default() += 1,
                None => singletons += 1,
            }
        }
        let n_clusters = clusters.len() + singletons;
        let any_related = clusters.values().any(|&n| n > 1);
        match (n_clusters, any_related) {
            (1, _) => ProteinInference::RelatedProteins,
            (_, true) => ProteinInference::RelatedAndUnrelated,
            (_, false) => ProteinInference::UnrelatedProteins,
        }
    }

    pub fn resolve(
        &self,
        groups: Vec<ProteinGroup>,
        evidence: &BTreeMap<String, PeptideEvidence>,
    ) -> InferenceResult {
        let time = Instant::now();
        let n_groups = groups.len();
        let (groups, redundant) = match self.remove_redundant {
            true => self.remove_redundant_groups(groups),
            false => (groups, Vec::new()),
        };
        let (retained, unassigned) = self.retain_best_scoring_groups(groups, evidence);

        let mut winners: BTreeMap<&str, Vec<&ProteinGroup>> = BTreeMap::new();
        for resolved in &retained {
            for peptide in &resolved.assigned {
                winners
                    .entry(peptide.as_str())
                    .or_default()
                    .push(&resolved.group);
            }
        }
        let inference = evidence
            .keys()
            .map(|peptide| {
                let groups = winners.get(peptide.as_str()).map(Vec::as_slice).unwrap_or(&[]);
                let accessions = groups
                    .iter()
                    .flat_map(|g| g.key.accessions().iter().cloned())
                    .collect::<Vec<_>>();
                let inference = PeptideInference {
                    class: self.inference_class(&accessions),
                    unique: groups.len() == 1,
                };
                (peptide.clone(), inference)
            })
            .collect();

        info!(
            "-  kept {} of {} protein groups ({} redundant, {} unassigned) in {:?}ms",
            retained.len(),
            n_groups,
            redundant.len(),
            unassigned.len(),
            time.elapsed().as_millis()
        );
        InferenceResult {
            retained,
            redundant,
            unassigned,
            inference,
        }
    }
}
