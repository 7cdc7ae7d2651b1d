use std::borrow::Cow;

use serde::{Deserialize, Serialize};

use crate::distribution::ROBUSTNESS_FLOOR;
use crate::mass::Tolerance;

/// How strictly two peptide sequences must agree to be considered the same
/// peptide
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SequenceMatching {
    /// Residues must be identical
    #[default]
    Exact,
    /// Isoleucine and leucine are treated as the same residue
    IndistinguishableAminoAcids,
}

impl SequenceMatching {
    pub fn normalize<'a>(&self, sequence: &'a str) -> Cow<'a, str> {
        match self {
            SequenceMatching::Exact => Cow::Borrowed(sequence),
            SequenceMatching::IndistinguishableAminoAcids => {
                if sequence.contains('I') {
                    Cow::Owned(sequence.replace('I', "L"))
                } else {
                    Cow::Borrowed(sequence)
                }
            }
        }
    }
}

/// What to do when best-hit selection exhausts every tie-breaker
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TiePolicy {
    /// Abort the validation pass with [`crate::Error::UnresolvedTie`]
    #[default]
    Strict,
    /// Keep the candidate whose modified sequence sorts first
    FirstLexicographic,
}

/// When a protein group counts as a decoy
#[derive(Copy, Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecoyGroupPolicy {
    #[default]
    AllMembers,
    AnyMember,
    /// At least this fraction of the members are decoys
    Fraction(f64),
}

impl DecoyGroupPolicy {
    pub fn is_decoy(&self, decoys: usize, total: usize) -> bool {
        if total == 0 {
            return false;
        }
        match self {
            DecoyGroupPolicy::AllMembers => decoys == total,
            DecoyGroupPolicy::AnyMember => decoys > 0,
            DecoyGroupPolicy::Fraction(f) => decoys as f64 / total as f64 >= *f,
        }
    }
}

/// Kernel used to turn a target/decoy score distribution into PEPs
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimationMethod {
    #[default]
    SlidingWindow,
    KernelDensity,
}

/// A variable modification and the residues it may sit on. `^` and `$` stand
/// for the peptide N- and C-terminus.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModificationDefinition {
    pub name: String,
    pub mass: f64,
    #[serde(default)]
    pub residues: String,
}

impl ModificationDefinition {
    /// Sites (1-based residue index, 0 = N-term, len + 1 = C-term) where this
    /// modification could be placed on `sequence`
    pub fn possible_sites(&self, sequence: &str) -> Vec<usize> {
        let mut sites = Vec::new();
        if self.residues.contains('^') {
            sites.push(0);
        }
        for (ix, aa) in sequence.chars().enumerate() {
            if self.residues.contains(aa) {
                sites.push(ix + 1);
            }
        }
        if self.residues.contains('$') {
            sites.push(sequence.len() + 1);
        }
        sites
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationSettings {
    /// Maximum FDR (fraction) for validated PSMs
    pub psm_fdr: f64,
    pub peptide_fdr: f64,
    pub protein_fdr: f64,
    /// Maximum false localization rate (fraction) for confident PTM sites
    pub flr: f64,
    /// Minimal confidence (%) for a validated match to be `Confident`
    /// rather than `Doubtful`
    pub confidence_threshold: f64,
    /// Probabilistic site score (%) used when the FLR can't be estimated
    pub probabilistic_score_threshold: f64,
    pub min_group_population: usize,
    pub sequence_matching: SequenceMatching,
    pub tie_policy: TiePolicy,
    pub remove_redundant_groups: bool,
    pub decoy_policy: DecoyGroupPolicy,
    pub estimation: EstimationMethod,
    pub precursor_tol: Tolerance,
    pub min_charge: u8,
    pub max_charge: u8,
    pub modifications: Vec<ModificationDefinition>,
}

impl Default for ValidationSettings {
    fn default() -> Self {
        Self {
            psm_fdr: 0.01,
            peptide_fdr: 0.01,
            protein_fdr: 0.01,
            flr: 0.01,
            confidence_threshold: 95.0,
            probabilistic_score_threshold: 95.0,
            min_group_population: ROBUSTNESS_FLOOR,
            sequence_matching: SequenceMatching::default(),
            tie_policy: TiePolicy::default(),
            remove_redundant_groups: true,
            decoy_policy: DecoyGroupPolicy::default(),
            estimation: EstimationMethod::default(),
            precursor_tol: Tolerance::default(),
            min_charge: 1,
            max_charge: 8,
            modifications: Vec::new(),
        }
    }
}

impl ValidationSettings {
    pub fn modification(&self, name: &str) -> Option<&ModificationDefinition> {
        self.modifications.iter().find(|m| m.name == name)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn leucine_isoleucine() {
        let m = SequenceMatching::IndistinguishableAminoAcids;
        assert_eq!(m.normalize("PEPTIDE"), "PEPTLDE");
        assert_eq!(SequenceMatching::Exact.normalize("PEPTIDE"), "PEPTIDE");
    }

    #[test]
    fn decoy_policy() {
        assert!(DecoyGroupPolicy::AllMembers.is_decoy(2, 2));
        assert!(!DecoyGroupPolicy::AllMembers.is_decoy(1, 2));
        assert!(DecoyGroupPolicy::AnyMember.is_decoy(1, 2));
        assert!(DecoyGroupPolicy::Fraction(0.5).is_decoy(1, 2));
        assert!(!DecoyGroupPolicy::Fraction(0.75).is_decoy(1, 2));
        assert!(!DecoyGroupPolicy::AnyMember.is_decoy(0, 0));
    }

    #[test]
    fn possible_sites() {
        let phospho = ModificationDefinition {
            name: "Phospho".into(),
            mass: 79.966331,
            residues: "STY".into(),
        };
        assert_eq!(phospho.possible_sites("PESTKY"), vec![3, 4, 6]);

        let acetyl = ModificationDefinition {
            name: "Acetyl".into(),
            mass: 42.010565,
            residues: "^K".into(),
        };
        assert_eq!(acetyl.possible_sites("PEKR"), vec![0, 3]);
    }

    #[test]
    fn defaults_from_empty_json() {
        let settings: ValidationSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, ValidationSettings::default());
        assert_eq!(settings.min_group_population, 100);
    }
}
