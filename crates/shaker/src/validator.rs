//! Sequencing of the validation stages over an [`Identification`].
//!
//! Every stage reads the match store, computes its updates, and applies them
//! only once the whole stage went through, so that a cancelled stage leaves
//! the store as the previous stage committed it. Completed stages are
//! recorded as a checkpoint on the store, and a later run resumes after it.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Instant;

use log::{info, warn};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::best_match::{AssumptionFilter, BestMatchSelector, PrecursorFilter, ProteinOccurrence};
use crate::distribution::TargetDecoyResults;
use crate::identification::{BestAssumption, Identification, PeptideMatch, ProteinMatch};
use crate::peptide::Peptide;
use crate::protein_grouping::group_proteins;
use crate::protein_inference::{group_score, PeptideEvidence, ProteinGroupResolver};
use crate::providers::{SequenceProvider, SpectrumProvider};
use crate::ptm::{PtmLocalizationScorer, PtmScoring, SiteLocalization};
use crate::progress::{CancellationToken, Progress, Silent};
use crate::score_map::{GroupKey, GroupSummary, HierarchicalScoreMap};
use crate::settings::ValidationSettings;
use crate::validation::{aggregate_score, level_for, ValidationLevel, ValidationParameter};
use crate::Result;

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Per search engine PEPs for assumptions lacking one
    InputMaps,
    BestMatch,
    PsmValidation,
    PtmScoring,
    PeptideValidation,
    /// Protein grouping, inference and validation
    ProteinValidation,
    /// Peptide and protein level localization summaries
    PtmAggregation,
}

impl Stage {
    pub const ALL: [Stage; 7] = [
        Stage::InputMaps,
        Stage::BestMatch,
        Stage::PsmValidation,
        Stage::PtmScoring,
        Stage::PeptideValidation,
        Stage::ProteinValidation,
        Stage::PtmAggregation,
    ];

    pub fn next(self) -> Option<Stage> {
        Stage::ALL.get(self as usize + 1).copied()
    }

    pub fn previous(self) -> Option<Stage> {
        (self as usize).checked_sub(1).map(|ix| Stage::ALL[ix])
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::InputMaps => "input maps",
            Stage::BestMatch => "best match",
            Stage::PsmValidation => "psm validation",
            Stage::PtmScoring => "ptm scoring",
            Stage::PeptideValidation => "peptide validation",
            Stage::ProteinValidation => "protein validation",
            Stage::PtmAggregation => "ptm aggregation",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Conditions under which results are produced but should not be trusted
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// No decoy was observed, so no PEP could be estimated. `group` is `None`
    /// when the whole map lacks decoys.
    NoDecoys {
        stage: Stage,
        map: String,
        group: Option<GroupKey>,
    },
    /// A group remains under the robustness floor after curation
    SuspiciousGroup {
        stage: Stage,
        map: String,
        group: GroupKey,
        n_targets: usize,
        n_decoys: usize,
    },
}

impl Warning {
    pub fn stage(&self) -> Stage {
        match self {
            Warning::NoDecoys { stage, .. } | Warning::SuspiciousGroup { stage, .. } => *stage,
        }
    }
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::NoDecoys {
                map, group: None, ..
            } => write!(f, "{}: no decoys, PEPs cannot be estimated", map),
            Warning::NoDecoys {
                map,
                group: Some(group),
                ..
            } => write!(f, "{}: no decoys in group {}", map, group),
            Warning::SuspiciousGroup {
                map,
                group,
                n_targets,
                n_decoys,
                ..
            } => write!(
                f,
                "{}: group {} has only {} targets and {} decoys",
                map, group, n_targets, n_decoys
            ),
        }
    }
}

/// Outcome of one level (PSM, peptide, protein, localization)
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct LevelSummary {
    pub n_matches: usize,
    pub n_decoys: usize,
    pub n_confident: usize,
    pub n_doubtful: usize,
    pub groups: Vec<GroupSummary>,
    /// Acceptance threshold by group
    pub thresholds: BTreeMap<String, TargetDecoyResults>,
}

impl LevelSummary {
    pub fn n_validated(&self) -> usize {
        self.n_confident + self.n_doubtful
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ValidationReport {
    pub warnings: Vec<Warning>,
    /// Score groups of the per engine input maps
    pub engines: Vec<GroupSummary>,
    pub psm: Option<LevelSummary>,
    pub ptm: Option<LevelSummary>,
    pub peptide: Option<LevelSummary>,
    pub protein: Option<LevelSummary>,
    /// Spectra left without any valid assumption
    pub n_unassigned: usize,
}

impl ValidationReport {
    /// Groups whose statistics should not be trusted
    pub fn suspicious_groups(&self) -> Vec<(&str, &GroupKey)> {
        self.warnings
            .iter()
            .filter_map(|w| match w {
                Warning::SuspiciousGroup { map, group, .. } => Some((map.as_str(), group)),
                _ => None,
            })
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Completion {
    Finished(ValidationReport),
    /// The run stopped during `stage`; every stage before it is committed
    Cancelled { stage: Stage },
}

/// Outcome of validating one match against its map
struct Assessment {
    key: String,
    group: GroupKey,
    pep: f64,
    level: ValidationLevel,
}

fn psm_key(best: &BestAssumption) -> GroupKey {
    GroupKey::label(best.charge.to_string())
}

fn summarize<'i, I>(map: &HierarchicalScoreMap, fdr: f64, matches: I) -> LevelSummary
where
    I: IntoIterator<Item = (&'i ValidationParameter, bool)>,
{
    let mut summary = LevelSummary {
        groups: map.summaries(),
        thresholds: map
            .keys()
            .filter_map(|key| Some((key.to_string(), map.results_at_fdr(key, fdr)?)))
            .collect(),
        ..Default::default()
    };
    for (param, decoy) in matches {
        summary.n_matches += 1;
        summary.n_decoys += decoy as usize;
        match param.level {
            ValidationLevel::Confident => summary.n_confident += 1,
            ValidationLevel::Doubtful => summary.n_doubtful += 1,
            _ => {}
        }
    }
    summary
}

pub struct Validator<'a> {
    settings: &'a ValidationSettings,
    sequences: &'a dyn SequenceProvider,
    spectra: &'a dyn SpectrumProvider,
    filter: Option<&'a dyn AssumptionFilter>,
    progress: &'a dyn Progress,
    token: CancellationToken,
    report: ValidationReport,
}

impl<'a> Validator<'a> {
    pub fn new(
        settings: &'a ValidationSettings,
        sequences: &'a dyn SequenceProvider,
        spectra: &'a dyn SpectrumProvider,
    ) -> Self {
        Self {
            settings,
            sequences,
            spectra,
            filter: None,
            progress: &Silent,
            token: CancellationToken::new(),
            report: ValidationReport::default(),
        }
    }

    /// Replace the default [`PrecursorFilter`]
    pub fn with_filter(mut self, filter: &'a dyn AssumptionFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_progress(mut self, progress: &'a dyn Progress) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn report(&self) -> &ValidationReport {
        &self.report
    }

    /// Run every stage after the store's checkpoint
    pub fn run(&mut self, id: &mut Identification) -> Result<Completion> {
        let start = Instant::now();
        let mut stage = match id.checkpoint() {
            Some(done) => done.next(),
            None => Some(Stage::InputMaps),
        };

        while let Some(current) = stage {
            let time = Instant::now();
            self.report.warnings.retain(|w| w.stage() != current);
            let completed = match current {
                Stage::InputMaps => self.input_maps(id)?,
                Stage::BestMatch => self.best_match(id)?,
                Stage::PsmValidation => self.psm_validation(id)?,
                Stage::PtmScoring => self.ptm_scoring(id)?,
                Stage::PeptideValidation => self.peptide_validation(id)?,
                Stage::ProteinValidation => self.protein_validation(id)?,
                Stage::PtmAggregation => self.ptm_aggregation(id)?,
            };
            self.progress.finish();
            if !completed {
                warn!("validation cancelled during {}", current);
                return Ok(Completion::Cancelled { stage: current });
            }
            id.commit(current);
            info!("- {:<18} {:8} ms", current.as_str(), time.elapsed().as_millis());
            stage = current.next();
        }

        for warning in &self.report.warnings {
            warn!("{}", warning);
        }
        if let Some(psm) = &self.report.psm {
            info!(
                "validated {} PSMs ({} confident) at {}% FDR",
                psm.n_validated(),
                psm.n_confident,
                self.settings.psm_fdr * 100.0
            );
        }
        if let Some(peptide) = &self.report.peptide {
            info!("validated {} peptides", peptide.n_validated());
        }
        if let Some(protein) = &self.report.protein {
            info!("validated {} protein groups", protein.n_validated());
        }
        info!("finished validation in {}ms", start.elapsed().as_millis());
        Ok(Completion::Finished(self.report.clone()))
    }

    /// Manually set the level of a PSM and revalidate everything downstream
    pub fn override_psm(
        &mut self,
        id: &mut Identification,
        key: &str,
        level: ValidationLevel,
    ) -> Result<Completion> {
        let psm = id.spectrum_mut(key)?;
        psm.validation = std::mem::take(&mut psm.validation).with_manual_level(level);
        id.invalidate_from(Stage::PtmScoring);
        self.run(id)
    }

    pub fn override_peptide(
        &mut self,
        id: &mut Identification,
        key: &str,
        level: ValidationLevel,
    ) -> Result<Completion> {
        let peptide = id.peptide_mut(key)?;
        peptide.validation = std::mem::take(&mut peptide.validation).with_manual_level(level);
        id.invalidate_from(Stage::ProteinValidation);
        self.run(id)
    }

    pub fn override_protein(
        &mut self,
        id: &mut Identification,
        key: &str,
        level: ValidationLevel,
    ) -> Result<Completion> {
        let protein = id.protein_mut(key)?;
        protein.validation = std::mem::take(&mut protein.validation).with_manual_level(level);
        id.invalidate_from(Stage::PtmAggregation);
        self.run(id)
    }

    fn estimate(&self, map: &mut HierarchicalScoreMap) {
        self.progress
            .start(&format!("estimating {} PEPs", map.name()), map.len());
        map.estimate_probabilities(self.settings.estimation, self.progress);
    }

    /// PEP and level of every item, `None` if cancelled. Items are
    /// `(match key, map key, score)`.
    fn assess<I>(
        &mut self,
        stage: Stage,
        map: &HierarchicalScoreMap,
        fdr: f64,
        items: I,
    ) -> Option<Vec<Assessment>>
    where
        I: IntoIterator<Item = (String, GroupKey, f64)>,
    {
        let floor = self.settings.min_group_population;
        let any_decoys = map.has_decoys();
        if !any_decoys {
            self.report.warnings.push(Warning::NoDecoys {
                stage,
                map: map.name().into(),
                group: None,
            });
        } else {
            for summary in map.summaries() {
                if summary.n_decoys == 0 {
                    self.report.warnings.push(Warning::NoDecoys {
                        stage,
                        map: map.name().into(),
                        group: Some(summary.key),
                    });
                } else if summary.suspicious {
                    self.report.warnings.push(Warning::SuspiciousGroup {
                        stage,
                        map: map.name().into(),
                        group: summary.key,
                        n_targets: summary.n_targets,
                        n_decoys: summary.n_decoys,
                    });
                }
            }
        }

        let thresholds = map
            .keys()
            .map(|key| {
                let results = map.results_at_fdr(key, fdr).unwrap_or_default();
                (key.clone(), results.score_threshold)
            })
            .collect::<BTreeMap<_, _>>();

        let mut assessments = Vec::new();
        for (key, group, score) in items {
            if self.token.is_cancelled() {
                return None;
            }
            let group = map.corrected_key(&group);
            let estimated = map.group(&group).map(|g| g.has_decoys()).unwrap_or(false);
            let (pep, level) = match estimated {
                false => (1.0, ValidationLevel::None),
                true => {
                    let pep = map.probability(&group, score);
                    let threshold = thresholds.get(&group).copied().flatten();
                    let suspicious = map
                        .group(&group)
                        .map(|g| g.suspicious_input(floor))
                        .unwrap_or(true);
                    let level = level_for(
                        score,
                        threshold,
                        crate::distribution::confidence(pep),
                        self.settings.confidence_threshold,
                        suspicious,
                    );
                    (pep, level)
                }
            };
            assessments.push(Assessment {
                key,
                group,
                pep,
                level,
            });
        }
        Some(assessments)
    }

    fn input_maps(&mut self, id: &mut Identification) -> Result<bool> {
        let mut map = HierarchicalScoreMap::new("input", self.settings.min_group_population);
        self.progress.start("input maps", id.n_spectra());
        for spectrum in id.spectra() {
            if self.token.is_cancelled() {
                return Ok(false);
            }
            for assumption in spectrum.assumptions.iter().filter(|a| a.rank == 1) {
                let decoy = self.sequences.is_decoy_peptide(&assumption.peptide.sequence);
                map.add_point(
                    &GroupKey::new(assumption.engine.as_str(), ""),
                    assumption.score,
                    decoy,
                );
            }
            self.progress.inc(1);
        }
        self.estimate(&mut map);

        let mut missing = BTreeSet::new();
        let mut updates = Vec::new();
        for spectrum in id.spectra() {
            if self.token.is_cancelled() {
                return Ok(false);
            }
            for (ix, assumption) in spectrum.assumptions.iter().enumerate() {
                if assumption.pep.is_some() {
                    continue;
                }
                let key = GroupKey::new(assumption.engine.as_str(), "");
                if !map.group(&key).map(|g| g.has_decoys()).unwrap_or(false) {
                    missing.insert(key.clone());
                }
                updates.push((spectrum.key.clone(), ix, map.probability(&key, assumption.score)));
            }
        }

        for group in missing {
            self.report.warnings.push(Warning::NoDecoys {
                stage: Stage::InputMaps,
                map: map.name().into(),
                group: Some(group),
            });
        }
        for (key, ix, pep) in updates {
            if let Some(assumption) = id.spectrum_mut(&key)?.assumptions.get_mut(ix) {
                assumption.pep = Some(pep);
            }
        }
        self.report.engines = map.summaries();
        Ok(true)
    }

    fn best_match(&mut self, id: &mut Identification) -> Result<bool> {
        let default_filter = PrecursorFilter {
            settings: self.settings,
            sequences: self.sequences,
            spectra: self.spectra,
        };
        let filter: &dyn AssumptionFilter = match self.filter {
            Some(filter) => filter,
            None => &default_filter,
        };
        let occurrence = ProteinOccurrence::count(id, filter, self.sequences);
        let selector = BestMatchSelector {
            settings: self.settings,
            sequences: self.sequences,
            spectra: self.spectra,
            filter,
            occurrence: &occurrence,
        };

        self.progress.start("best match", id.n_spectra());
        let mut updates = Vec::with_capacity(id.n_spectra());
        for spectrum in id.spectra() {
            if self.token.is_cancelled() {
                return Ok(false);
            }
            updates.push((spectrum.key.clone(), selector.select(spectrum)?));
            self.progress.inc(1);
        }

        let mut unassigned = 0;
        for (key, selection) in updates {
            let psm = id.spectrum_mut(&key)?;
            let previous = std::mem::take(&mut psm.validation);
            psm.ptm.clear();
            match selection {
                Some(selection) => {
                    psm.validation = ValidationParameter {
                        score: selection.best.score,
                        engine_pep: selection.engine_pep,
                        combined_pep: selection.best.probability,
                        delta_pep: selection.delta_pep,
                        ..previous
                    };
                    psm.best = Some(selection.best);
                }
                None => {
                    log::trace!("{}: no valid assumption", key);
                    unassigned += 1;
                    psm.best = None;
                    psm.validation = ValidationParameter {
                        starred: previous.starred,
                        hidden: previous.hidden,
                        ..Default::default()
                    };
                }
            }
        }
        self.report.n_unassigned = unassigned;
        Ok(true)
    }

    fn psm_validation(&mut self, id: &mut Identification) -> Result<bool> {
        let floor = self.settings.min_group_population;
        let mut map = HierarchicalScoreMap::new("psm", floor);
        for spectrum in id.spectra() {
            if let Some(best) = &spectrum.best {
                map.add_point(&psm_key(best), best.score, best.decoy);
            }
        }
        map.cure(floor)?;
        self.estimate(&mut map);

        let items = id
            .spectra()
            .filter_map(|s| {
                let best = s.best.as_ref()?;
                Some((s.key.clone(), psm_key(best), best.score))
            })
            .collect::<Vec<_>>();
        let Some(assessments) = self.assess(Stage::PsmValidation, &map, self.settings.psm_fdr, items)
        else {
            return Ok(false);
        };

        for a in assessments {
            let psm = id.spectrum_mut(&a.key)?;
            psm.validation = std::mem::take(&mut psm.validation)
                .with_group(a.group)
                .with_pep(a.pep)
                .with_level(a.level);
        }
        self.report.psm = Some(summarize(
            &map,
            self.settings.psm_fdr,
            id.spectra()
                .filter(|s| s.best.is_some())
                .map(|s| (&s.validation, s.is_decoy())),
        ));
        Ok(true)
    }

    fn ptm_scoring(&mut self, id: &mut Identification) -> Result<bool> {
        let scorer = PtmLocalizationScorer {
            settings: self.settings,
            spectra: self.spectra,
        };
        let candidates = id
            .spectra()
            .filter(|s| s.validation.is_validated())
            .filter_map(|s| {
                let best = s.best.as_ref()?;
                best.peptide
                    .has_variable_modifications()
                    .then(|| (s.key.as_str(), best))
            })
            .collect::<Vec<_>>();

        self.progress.start("ptm scoring", candidates.len());
        let token = &self.token;
        let progress = self.progress;
        let localized = candidates
            .par_iter()
            .map(|(key, best)| {
                if token.is_cancelled() {
                    return None;
                }
                progress.inc(1);
                Some((key.to_string(), best.charge, scorer.localize(key, best)))
            })
            .collect::<Vec<_>>();
        if self.token.is_cancelled() {
            return Ok(false);
        }
        let localized = localized.into_iter().flatten().collect::<Vec<_>>();

        let floor = self.settings.min_group_population;
        let mut map = HierarchicalScoreMap::new("ptm", floor);
        let ptm_key = |charge: u8, loc: &SiteLocalization| {
            GroupKey::new(loc.modification.as_str(), charge.to_string())
        };
        for (_, charge, localizations) in &localized {
            for loc in localizations {
                map.add_point(&ptm_key(*charge, loc), loc.score(), loc.conflict);
            }
        }
        map.cure(floor)?;
        self.estimate(&mut map);

        for summary in map.summaries().into_iter().filter(|s| s.suspicious) {
            self.report.warnings.push(Warning::SuspiciousGroup {
                stage: Stage::PtmScoring,
                map: map.name().into(),
                group: summary.key,
                n_targets: summary.n_targets,
                n_decoys: summary.n_decoys,
            });
        }

        let mut updates = Vec::with_capacity(localized.len());
        for (key, charge, localizations) in localized {
            if self.token.is_cancelled() {
                return Ok(false);
            }
            let mut scorings = BTreeMap::new();
            for loc in localizations {
                let group = map.corrected_key(&ptm_key(charge, &loc));
                let reliable = map.group(&group).map(|g| g.has_decoys()).unwrap_or(false)
                    && !map.is_suspicious(&group);
                let levels = scorer.site_levels(&loc, |score| map.fdr_at(&group, score), reliable);
                let scoring = PtmScoring {
                    levels,
                    ..loc.scoring
                };
                scorings.insert(loc.modification, scoring);
            }
            updates.push((key, scorings));
        }

        let keys = id.spectra().map(|s| s.key.clone()).collect::<Vec<_>>();
        for key in keys {
            id.spectrum_mut(&key)?.ptm.clear();
        }
        for (key, scorings) in updates {
            id.spectrum_mut(&key)?.ptm = scorings;
        }
        self.report.ptm = Some(LevelSummary {
            groups: map.summaries(),
            ..Default::default()
        });
        Ok(true)
    }

    fn peptide_validation(&mut self, id: &mut Identification) -> Result<bool> {
        let matching = self.settings.sequence_matching;
        // First spectrum in key order supplies the reported peptide
        let mut spectra_by_peptide: BTreeMap<String, (&Peptide, Vec<&str>)> = BTreeMap::new();
        for spectrum in id.spectra() {
            if let Some(best) = &spectrum.best {
                spectra_by_peptide
                    .entry(best.peptide.identity_key(matching))
                    .or_insert_with(|| (&best.peptide, Vec::new()))
                    .1
                    .push(spectrum.key.as_str());
            }
        }

        let floor = self.settings.min_group_population;
        let mut map = HierarchicalScoreMap::new("peptide", floor);
        let mut peptides = Vec::with_capacity(spectra_by_peptide.len());
        self.progress.start("peptides", spectra_by_peptide.len());
        for (key, (peptide, spectra)) in &spectra_by_peptide {
            if self.token.is_cancelled() {
                return Ok(false);
            }
            let peptide = Peptide::clone(peptide);
            let psms = spectra
                .iter()
                .filter_map(|s| id.spectrum(s))
                .map(|s| &s.validation)
                .collect::<Vec<_>>();
            let (score, p) = aggregate_score(psms.iter().map(|v| (v.pep, v.is_validated())));
            let engine_pep = psms.iter().map(|v| v.engine_pep).fold(1.0, f64::min);
            let decoy = self.sequences.is_decoy_peptide(&peptide.sequence);
            let proteins = self
                .sequences
                .protein_hits(&peptide.sequence)
                .into_iter()
                .map(|hit| hit.accession)
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect::<Vec<_>>();

            let group = GroupKey::label(peptide.modification_profile());
            map.add_point(&group, score, decoy);

            let previous = id
                .peptide(key)
                .map(|p| p.validation.clone())
                .unwrap_or_default();
            peptides.push((
                group,
                PeptideMatch {
                    key: key.clone(),
                    spectra: spectra.iter().map(|s| s.to_string()).collect(),
                    proteins,
                    decoy,
                    validation: ValidationParameter {
                        engine_pep,
                        ..previous.with_score(score, p)
                    },
                    ptm: BTreeMap::new(),
                    peptide,
                },
            ));
            self.progress.inc(1);
        }
        map.cure(floor)?;
        self.estimate(&mut map);

        let items = peptides
            .iter()
            .map(|(group, p)| (p.key.clone(), group.clone(), p.validation.score))
            .collect::<Vec<_>>();
        let Some(assessments) =
            self.assess(Stage::PeptideValidation, &map, self.settings.peptide_fdr, items)
        else {
            return Ok(false);
        };

        let peptides = peptides
            .into_iter()
            .zip(assessments)
            .map(|((_, mut peptide), a)| {
                peptide.validation = peptide
                    .validation
                    .with_group(a.group)
                    .with_pep(a.pep)
                    .with_level(a.level);
                peptide
            })
            .collect::<Vec<_>>();

        self.report.peptide = Some(summarize(
            &map,
            self.settings.peptide_fdr,
            peptides.iter().map(|p| (&p.validation, p.decoy)),
        ));
        id.set_peptides(peptides);
        Ok(true)
    }

    fn protein_validation(&mut self, id: &mut Identification) -> Result<bool> {
        let evidence = id
            .peptides()
            .map(|p| {
                let n_validated_spectra = p
                    .spectra
                    .iter()
                    .filter_map(|s| id.spectrum(s))
                    .filter(|s| s.validation.is_validated())
                    .count();
                (
                    p.key.clone(),
                    PeptideEvidence {
                        pep: p.validation.pep,
                        level: p.validation.level,
                        n_validated_spectra,
                    },
                )
            })
            .collect::<BTreeMap<_, _>>();

        let sequences = self.sequences;
        let groups = group_proteins(
            id.peptides().map(|p| (p.key.as_str(), p.proteins.as_slice())),
            |accession| sequences.is_decoy(accession),
            self.settings.decoy_policy,
        );
        if self.token.is_cancelled() {
            return Ok(false);
        }

        // Every group first contributes its preliminary score; inference then
        // removes some groups and changes the score of the others
        let floor = self.settings.min_group_population;
        let key = GroupKey::label("");
        let mut map = HierarchicalScoreMap::new("protein", floor);
        let preliminary = groups
            .iter()
            .map(|g| {
                let score = group_score(&g.peptides, &evidence).0;
                map.add_point(&key, score, g.decoy);
                (g.key.clone(), score)
            })
            .collect::<BTreeMap<_, _>>();

        let resolver = ProteinGroupResolver {
            sequences: self.sequences,
            remove_redundant: self.settings.remove_redundant_groups,
        };
        let result = resolver.resolve(groups, &evidence);
        if self.token.is_cancelled() {
            return Ok(false);
        }
        let dropped = result
            .redundant
            .iter()
            .chain(&result.unassigned)
            .chain(result.retained.iter().map(|r| &r.group));
        for group in dropped {
            if let Some(&score) = preliminary.get(&group.key) {
                map.remove_point(&key, score, group.decoy);
            }
        }
        for resolved in &result.retained {
            map.add_point(&key, resolved.score, resolved.group.decoy);
        }
        map.cure(floor)?;
        self.estimate(&mut map);

        let items = result
            .retained
            .iter()
            .map(|r| (r.group.key.to_string(), key.clone(), r.score))
            .collect::<Vec<_>>();
        let Some(assessments) =
            self.assess(Stage::ProteinValidation, &map, self.settings.protein_fdr, items)
        else {
            return Ok(false);
        };

        let proteins = result
            .retained
            .into_iter()
            .zip(assessments)
            .map(|(resolved, a)| {
                let previous = id
                    .protein(&a.key)
                    .map(|p| p.validation.clone())
                    .unwrap_or_default();
                ProteinMatch {
                    peptides: resolved.assigned.into_iter().collect(),
                    decoy: resolved.group.decoy,
                    validation: previous
                        .with_score(resolved.score, resolved.probability)
                        .with_group(a.group)
                        .with_pep(a.pep)
                        .with_level(a.level),
                    n_confident_peptides: resolved.n_confident_peptides,
                    n_doubtful_peptides: resolved.n_doubtful_peptides,
                    n_validated_spectra: resolved.n_validated_spectra,
                    shared: resolved.shared,
                    ptm: BTreeMap::new(),
                    key: resolved.group.key,
                }
            })
            .collect::<Vec<_>>();

        self.report.protein = Some(summarize(
            &map,
            self.settings.protein_fdr,
            proteins.iter().map(|p| (&p.validation, p.decoy)),
        ));
        id.set_proteins(proteins);
        for (peptide, inference) in result.inference {
            let peptide = id.peptide_mut(&peptide)?;
            peptide.validation = std::mem::take(&mut peptide.validation)
                .with_inference(inference.class, inference.unique);
        }
        Ok(true)
    }

    fn ptm_aggregation(&mut self, id: &mut Identification) -> Result<bool> {
        let mut peptide_ptms = BTreeMap::new();
        for peptide in id.peptides() {
            if self.token.is_cancelled() {
                return Ok(false);
            }
            let mut ptms: BTreeMap<String, PtmScoring> = BTreeMap::new();
            let validated = peptide
                .spectra
                .iter()
                .filter_map(|s| id.spectrum(s))
                .filter(|s| s.validation.is_validated());
            for psm in validated {
                for (name, scoring) in &psm.ptm {
                    ptms.entry(name.clone()).or_default().add_all(scoring);
                }
            }
            peptide_ptms.insert(peptide.key.clone(), ptms);
        }

        let mut protein_ptms = BTreeMap::new();
        for protein in id.proteins() {
            if self.token.is_cancelled() {
                return Ok(false);
            }
            let mut ptms: BTreeMap<String, PtmScoring> = BTreeMap::new();
            for key in &protein.peptides {
                let Some(peptide) = id.peptide(key).filter(|p| p.validation.is_validated()) else {
                    continue;
                };
                let Some(scorings) = peptide_ptms.get(key) else {
                    continue;
                };
                // Positions on the first member containing the peptide
                let offset = self
                    .sequences
                    .protein_hits(&peptide.peptide.sequence)
                    .into_iter()
                    .filter(|hit| protein.key.contains(&hit.accession))
                    .min_by(|a, b| a.accession.cmp(&b.accession))
                    .map(|hit| hit.position);
                let Some(offset) = offset else {
                    continue;
                };
                for (name, scoring) in scorings {
                    ptms.entry(name.clone())
                        .or_default()
                        .add_all(&scoring.shifted(offset));
                }
            }
            protein_ptms.insert(protein.key.to_string(), ptms);
        }

        for (key, ptms) in peptide_ptms {
            id.peptide_mut(&key)?.ptm = ptms;
        }
        for (key, ptms) in protein_ptms {
            id.protein_mut(&key)?.ptm = ptms;
        }
        Ok(true)
    }
}
