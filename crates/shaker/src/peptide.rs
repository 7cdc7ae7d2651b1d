use std::collections::BTreeSet;
use std::fmt::Write;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::mass::{residue_mass, H2O};
use crate::settings::SequenceMatching;

/// A modification placed on a peptide. `site` is the 1-based residue index;
/// 0 denotes the N-terminus and `len + 1` the C-terminus.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModificationMatch {
    pub name: String,
    pub mass: f64,
    pub site: usize,
    #[serde(default = "variable")]
    pub variable: bool,
}

fn variable() -> bool {
    true
}

impl ModificationMatch {
    pub fn new<S: Into<String>>(name: S, mass: f64, site: usize) -> Self {
        Self {
            name: name.into(),
            mass,
            site,
            variable: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Peptide {
    pub sequence: String,
    #[serde(default)]
    pub modifications: Vec<ModificationMatch>,
}

impl Peptide {
    pub fn new<S: Into<String>>(sequence: S, mut modifications: Vec<ModificationMatch>) -> Self {
        modifications.sort_by(|a, b| a.site.cmp(&b.site).then_with(|| a.name.cmp(&b.name)));
        Self {
            sequence: sequence.into(),
            modifications,
        }
    }

    pub fn unmodified<S: Into<String>>(sequence: S) -> Self {
        Self::new(sequence, Vec::new())
    }

    pub fn len(&self) -> usize {
        self.sequence.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequence.is_empty()
    }

    /// Neutral monoisotopic mass, `None` if the sequence contains a residue
    /// without a defined mass
    pub fn monoisotopic(&self) -> Option<f64> {
        let residues = self
            .sequence
            .bytes()
            .map(residue_mass)
            .sum::<Option<f64>>()?;
        let mods = self.modifications.iter().map(|m| m.mass).sum::<f64>();
        Some(residues + mods + H2O)
    }

    pub fn variable_modifications(&self) -> impl Iterator<Item = &ModificationMatch> {
        self.modifications.iter().filter(|m| m.variable)
    }

    pub fn has_variable_modifications(&self) -> bool {
        self.variable_modifications().next().is_some()
    }

    /// Sorted, distinct names of the variable modifications carried by this
    /// peptide: the peptide-level grouping attribute
    pub fn modification_profile(&self) -> String {
        self.variable_modifications()
            .map(|m| m.name.as_str())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .join("_")
    }

    /// Sites occupied by a given variable modification
    pub fn modification_sites(&self, name: &str) -> Vec<usize> {
        self.variable_modifications()
            .filter(|m| m.name == name)
            .map(|m| m.site)
            .sorted()
            .collect()
    }

    fn sorted_modifications(&self) -> Vec<&ModificationMatch> {
        self.modifications
            .iter()
            .sorted_by(|a, b| a.site.cmp(&b.site).then_with(|| a.name.cmp(&b.name)))
            .collect()
    }

    fn write_modified(&self, sequence: &str, out: &mut String) {
        let mods = self.sorted_modifications();
        for m in mods.iter().filter(|m| m.site == 0) {
            let _ = write!(out, "[{}]-", m.name);
        }
        for (ix, aa) in sequence.chars().enumerate() {
            out.push(aa);
            for m in mods.iter().filter(|m| m.site == ix + 1) {
                let _ = write!(out, "[{}]", m.name);
            }
        }
        for m in mods.iter().filter(|m| m.site > sequence.len()) {
            let _ = write!(out, "-[{}]", m.name);
        }
    }

    /// Unique identifier: sequence with every modification at its site
    pub fn key(&self) -> String {
        let mut out = String::with_capacity(self.sequence.len() + 16);
        self.write_modified(&self.sequence, &mut out);
        out
    }

    /// Identity of the peptide under a given sequence matching strictness
    pub fn identity_key(&self, matching: SequenceMatching) -> String {
        let sequence = matching.normalize(&self.sequence);
        let mut out = String::with_capacity(sequence.len() + 16);
        self.write_modified(&sequence, &mut out);
        out
    }

    /// Sequence plus modification composition, ignoring where the
    /// modifications are placed. Positional isoforms share a matching key.
    pub fn matching_key(&self, matching: SequenceMatching) -> String {
        let mut out = matching.normalize(&self.sequence).into_owned();
        let composition = self
            .modifications
            .iter()
            .map(|m| m.name.as_str())
            .sorted()
            .join(",");
        if !composition.is_empty() {
            out.push('|');
            out.push_str(&composition);
        }
        out
    }
}

impl std::fmt::Display for Peptide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}
