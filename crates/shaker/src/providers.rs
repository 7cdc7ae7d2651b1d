//! Collaborators supplying what the validation engine does not compute itself:
//! peptide to protein mapping and per-spectrum evidence.

use std::collections::BTreeMap;

use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};

use crate::peptide::Peptide;
use crate::settings::SequenceMatching;

/// Occurrence of a peptide in a protein
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProteinHit {
    pub accession: String,
    /// 0-based offset of the first peptide residue in the protein
    #[serde(default)]
    pub position: usize,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProteinInfo {
    pub accession: String,
    #[serde(default)]
    pub decoy: bool,
    /// Proteins sharing a gene name are considered related
    #[serde(default)]
    pub gene: Option<String>,
    #[serde(default)]
    pub description: String,
}

pub trait SequenceProvider: Sync {
    /// Proteins containing `sequence`, empty if unknown
    fn protein_hits(&self, sequence: &str) -> Vec<ProteinHit>;

    fn protein(&self, accession: &str) -> Option<&ProteinInfo>;

    fn is_decoy(&self, accession: &str) -> bool;

    /// A peptide is a decoy when every protein it maps to is a decoy
    fn is_decoy_peptide(&self, sequence: &str) -> bool {
        let hits = self.protein_hits(sequence);
        !hits.is_empty() && hits.iter().all(|hit| self.is_decoy(&hit.accession))
    }

    fn gene(&self, accession: &str) -> Option<&str> {
        self.protein(accession).and_then(|p| p.gene.as_deref())
    }
}

pub trait SpectrumProvider: Sync {
    fn precursor_mz(&self, spectrum: &str) -> Option<f64>;

    /// Number of distinct residues of the peptide confirmed by annotated
    /// fragment ions
    fn coverage(&self, spectrum: &str, peptide: &Peptide) -> Option<usize>;

    /// Externally computed localization probabilities (%), by site
    fn site_probabilities(
        &self,
        _spectrum: &str,
        _peptide: &Peptide,
        _modification: &str,
    ) -> Option<BTreeMap<usize, f64>> {
        None
    }
}

/// In-memory protein database with peptide to protein mapping
#[derive(Clone, Debug, Default)]
pub struct ProteinDatabase {
    proteins: FnvHashMap<String, ProteinInfo>,
    hits: FnvHashMap<String, Vec<ProteinHit>>,
    decoy_tag: String,
    matching: SequenceMatching,
}

impl ProteinDatabase {
    /// Accessions starting with `decoy_tag` are decoys, whatever their
    /// `decoy` flag says
    pub fn new<S: Into<String>>(decoy_tag: S, matching: SequenceMatching) -> Self {
        Self {
            decoy_tag: decoy_tag.into(),
            matching,
            ..Default::default()
        }
    }

    pub fn add_protein(&mut self, protein: ProteinInfo) {
        self.proteins.insert(protein.accession.clone(), protein);
    }

    pub fn add_peptide(&mut self, sequence: &str, hits: Vec<ProteinHit>) {
        let key = self.matching.normalize(sequence).into_owned();
        let entry = self.hits.entry(key).or_default();
        for hit in hits {
            if !entry.contains(&hit) {
                entry.push(hit);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.proteins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.proteins.is_empty()
    }
}

impl SequenceProvider for ProteinDatabase {
    fn protein_hits(&self, sequence: &str) -> Vec<ProteinHit> {
        self.hits
            .get(self.matching.normalize(sequence).as_ref())
            .cloned()
            .unwrap_or_default()
    }

    fn protein(&self, accession: &str) -> Option<&ProteinInfo> {
        self.proteins.get(accession)
    }

    fn is_decoy(&self, accession: &str) -> bool {
        (!self.decoy_tag.is_empty() && accession.starts_with(&self.decoy_tag))
            || self.proteins.get(accession).map(|p| p.decoy).unwrap_or(false)
    }
}

/// Evidence recorded for one spectrum
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SpectrumEvidence {
    #[serde(default)]
    pub precursor_mz: Option<f64>,
    /// Residues confirmed by fragment ions, by peptide key
    #[serde(default)]
    pub coverage: BTreeMap<String, usize>,
    /// Site probabilities by peptide key, then modification name
    #[serde(default)]
    pub site_probabilities: BTreeMap<String, BTreeMap<String, BTreeMap<usize, f64>>>,
}

/// In-memory spectrum evidence keyed by spectrum title
#[derive(Clone, Debug, Default)]
pub struct SpectrumTable {
    spectra: FnvHashMap<String, SpectrumEvidence>,
}

impl SpectrumTable {
    pub fn insert<S: Into<String>>(&mut self, spectrum: S, evidence: SpectrumEvidence) {
        self.spectra.insert(spectrum.into(), evidence);
    }

    pub fn len(&self) -> usize {
        self.spectra.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spectra.is_empty()
    }
}

impl SpectrumProvider for SpectrumTable {
    fn precursor_mz(&self, spectrum: &str) -> Option<f64> {
        self.spectra.get(spectrum)?.precursor_mz
    }

    fn coverage(&self, spectrum: &str, peptide: &Peptide) -> Option<usize> {
        self.spectra
            .get(spectrum)?
            .coverage
            .get(&peptide.key())
            .copied()
    }

    fn site_probabilities(
        &self,
        spectrum: &str,
        peptide: &Peptide,
        modification: &str,
    ) -> Option<BTreeMap<usize, f64>> {
        self.spectra
            .get(spectrum)?
            .site_probabilities
            .get(&peptide.key())?
            .get(modification)
            .cloned()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn hit(accession: &str) -> ProteinHit {
        ProteinHit {
            accession: accession.into(),
            position: 0,
        }
    }

    #[test]
    fn decoy_peptides() {
        let mut db = ProteinDatabase::new("rev_", SequenceMatching::IndistinguishableAminoAcids);
        db.add_protein(ProteinInfo {
            accession: "P1".into(),
            gene: Some("ALB".into()),
            ..Default::default()
        });
        db.add_protein(ProteinInfo {
            accession: "D1".into(),
            decoy: true,
            ..Default::default()
        });
        db.add_peptide("PEPTIDE", vec![hit("P1"), hit("rev_P1")]);
        db.add_peptide("PEPTLDE", vec![hit("P1")]);
        db.add_peptide("KEDITPEP", vec![hit("rev_P1"), hit("D1")]);

        assert!(!db.is_decoy_peptide("PEPTIDE"));
        assert!(db.is_decoy_peptide("KEDITPEP"));
        assert!(!db.is_decoy_peptide("UNKNOWN"));
        // I and L collapse onto the same entry, hits are not duplicated
        assert_eq!(db.protein_hits("PEPTLDE").len(), 2);
        assert_eq!(db.gene("P1"), Some("ALB"));
        assert_eq!(db.gene("D1"), None);
    }

    #[test]
    fn spectrum_lookup() {
        let peptide = Peptide::unmodified("PEPTIDE");
        let mut table = SpectrumTable::default();
        let mut evidence = SpectrumEvidence {
            precursor_mz: Some(400.69),
            ..Default::default()
        };
        evidence.coverage.insert(peptide.key(), 5);
        table.insert("scan=1", evidence);

        assert_eq!(table.precursor_mz("scan=1"), Some(400.69));
        assert_eq!(table.coverage("scan=1", &peptide), Some(5));
        assert_eq!(table.coverage("scan=2", &peptide), None);
        assert_eq!(table.site_probabilities("scan=1", &peptide, "Phospho"), None);
    }
}
