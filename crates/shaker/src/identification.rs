//! In-memory match store: spectra with their candidate assumptions, and the
//! peptide and protein matches derived from them. Every collection iterates
//! in key order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::peptide::Peptide;
use crate::protein_grouping::ProteinGroupKey;
use crate::ptm::PtmScoring;
use crate::validation::ValidationParameter;
use crate::validator::Stage;
use crate::{Error, Result};

/// One candidate explanation of a spectrum reported by a search engine
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeptideAssumption {
    pub engine: String,
    /// 1-based rank within the engine's candidates for the spectrum
    pub rank: usize,
    pub peptide: Peptide,
    pub charge: u8,
    /// Engine score, higher is better
    pub score: f64,
    /// Engine PEP; estimated from the engine's score distribution when absent
    #[serde(default)]
    pub pep: Option<f64>,
}

/// The single best explanation of a spectrum retained after combining the
/// search engines
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BestAssumption {
    pub peptide: Peptide,
    pub charge: u8,
    /// `-10 log10(probability)`
    pub score: f64,
    /// Product of the PEPs of the engines supporting the peptide
    pub probability: f64,
    pub engines: Vec<String>,
    /// Best PEP per supporting engine
    pub engine_peps: BTreeMap<String, f64>,
    pub protein_occurrence: usize,
    /// Residues confirmed by fragment ions
    pub coverage: Option<usize>,
    /// Precursor error in ppm
    pub mass_error: Option<f64>,
    pub decoy: bool,
    /// Every candidate sharing the peptide's sequence and modification
    /// composition, with its combined probability. Used for localization.
    pub alternatives: Vec<(Peptide, f64)>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SpectrumMatch {
    pub key: String,
    pub assumptions: Vec<PeptideAssumption>,
    #[serde(default)]
    pub best: Option<BestAssumption>,
    #[serde(default)]
    pub validation: ValidationParameter,
    /// Localization by modification name
    #[serde(default)]
    pub ptm: BTreeMap<String, PtmScoring>,
}

impl SpectrumMatch {
    pub fn new<S: Into<String>>(key: S, assumptions: Vec<PeptideAssumption>) -> Self {
        Self {
            key: key.into(),
            assumptions,
            ..Default::default()
        }
    }

    pub fn is_decoy(&self) -> bool {
        self.best.as_ref().map(|b| b.decoy).unwrap_or(false)
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PeptideMatch {
    pub key: String,
    pub peptide: Peptide,
    /// Spectra whose best assumption is this peptide
    pub spectra: Vec<String>,
    pub proteins: Vec<String>,
    pub decoy: bool,
    pub validation: ValidationParameter,
    pub ptm: BTreeMap<String, PtmScoring>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProteinMatch {
    pub key: ProteinGroupKey,
    pub peptides: Vec<String>,
    pub decoy: bool,
    pub validation: ValidationParameter,
    pub n_confident_peptides: usize,
    pub n_doubtful_peptides: usize,
    pub n_validated_spectra: usize,
    /// No peptide is assigned to this group alone
    pub shared: bool,
    /// Localization by modification name, keyed by protein site of the first
    /// member
    pub ptm: BTreeMap<String, PtmScoring>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Identification {
    spectra: BTreeMap<String, SpectrumMatch>,
    #[serde(default)]
    peptides: BTreeMap<String, PeptideMatch>,
    #[serde(default)]
    proteins: BTreeMap<String, ProteinMatch>,
    #[serde(default)]
    checkpoint: Option<Stage>,
}

impl Identification {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a spectrum match. Keys must be unique.
    pub fn add_spectrum(&mut self, spectrum: SpectrumMatch) -> Result<()> {
        if self.spectra.contains_key(&spectrum.key) {
            return Err(Error::DuplicateMatch(spectrum.key));
        }
        self.spectra.insert(spectrum.key.clone(), spectrum);
        self.checkpoint = None;
        Ok(())
    }

    pub fn spectra(&self) -> impl Iterator<Item = &SpectrumMatch> {
        self.spectra.values()
    }

    pub fn spectrum(&self, key: &str) -> Option<&SpectrumMatch> {
        self.spectra.get(key)
    }

    pub fn spectrum_mut(&mut self, key: &str) -> Result<&mut SpectrumMatch> {
        self.spectra
            .get_mut(key)
            .ok_or_else(|| Error::UnknownMatch(key.into()))
    }

    pub fn peptides(&self) -> impl Iterator<Item = &PeptideMatch> {
        self.peptides.values()
    }

    pub fn peptide(&self, key: &str) -> Option<&PeptideMatch> {
        self.peptides.get(key)
    }

    pub fn peptide_mut(&mut self, key: &str) -> Result<&mut PeptideMatch> {
        self.peptides
            .get_mut(key)
            .ok_or_else(|| Error::UnknownMatch(key.into()))
    }

    pub fn proteins(&self) -> impl Iterator<Item = &ProteinMatch> {
        self.proteins.values()
    }

    pub fn protein(&self, key: &str) -> Option<&ProteinMatch> {
        self.proteins.get(key)
    }

    pub fn protein_mut(&mut self, key: &str) -> Result<&mut ProteinMatch> {
        self.proteins
            .get_mut(key)
            .ok_or_else(|| Error::UnknownMatch(key.into()))
    }

    pub fn n_spectra(&self) -> usize {
        self.spectra.len()
    }

    pub fn n_peptides(&self) -> usize {
        self.peptides.len()
    }

    pub fn n_proteins(&self) -> usize {
        self.proteins.len()
    }

    /// Replace every peptide match
    pub fn set_peptides(&mut self, peptides: Vec<PeptideMatch>) {
        self.peptides = peptides.into_iter().map(|p| (p.key.clone(), p)).collect();
    }

    /// Replace every protein match
    pub fn set_proteins(&mut self, proteins: Vec<ProteinMatch>) {
        self.proteins = proteins
            .into_iter()
            .map(|p| (p.key.to_string(), p))
            .collect();
    }

    /// Last stage whose results were committed
    pub fn checkpoint(&self) -> Option<Stage> {
        self.checkpoint
    }

    pub fn commit(&mut self, stage: Stage) {
        log::trace!("committing checkpoint {:?}", stage);
        self.checkpoint = Some(stage);
    }

    /// Roll the checkpoint back so that `stage` and everything after it runs
    /// again
    pub fn invalidate_from(&mut self, stage: Stage) {
        self.checkpoint = match (self.checkpoint, stage.previous()) {
            (Some(current), previous) if current >= stage => previous,
            (current, _) => current,
        };
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unique_keys_and_checkpoints() {
        let mut id = Identification::new();
        id.add_spectrum(SpectrumMatch::new("a", vec![])).unwrap();
        assert!(matches!(
            id.add_spectrum(SpectrumMatch::new("a", vec![])),
            Err(Error::DuplicateMatch(_))
        ));
        assert!(id.spectrum_mut("b").is_err());

        id.commit(Stage::PeptideValidation);
        id.invalidate_from(Stage::PsmValidation);
        assert_eq!(id.checkpoint(), Some(Stage::BestMatch));
        id.invalidate_from(Stage::ProteinValidation);
        assert_eq!(id.checkpoint(), Some(Stage::BestMatch));
        id.invalidate_from(Stage::InputMaps);
        assert_eq!(id.checkpoint(), None);
    }
}
