//! # Protein Grouping
//!
//! Proteins that are supported by exactly the same set of peptides cannot be
//! told apart and are reported together as one protein group. Groups are
//! built by interning accessions, collecting for every protein the sorted list
//! of peptides it explains, and collapsing proteins whose lists are identical.
//!
//! Group naming is deterministic: members are sorted and joined with `/`.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use fnv::FnvHashMap;
use itertools::Itertools;
use log::info;
use serde::{Deserialize, Serialize};

use crate::settings::DecoyGroupPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct ProteinIx(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
struct PeptideIx(u32);

/// Sorted accessions of the proteins forming a group
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ProteinGroupKey(Vec<String>);

impl ProteinGroupKey {
    pub fn new<I, S>(accessions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(
            accessions
                .into_iter()
                .map(Into::into)
                .sorted()
                .dedup()
                .collect(),
        )
    }

    pub fn accessions(&self) -> &[String] {
        &self.0
    }

    pub fn contains(&self, accession: &str) -> bool {
        self.0.iter().any(|a| a == accession)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ProteinGroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProteinGroup {
    pub key: ProteinGroupKey,
    /// Keys of the peptides supporting every member
    pub peptides: BTreeSet<String>,
    pub decoy: bool,
}

#[derive(Default)]
struct ProteinGrouping {
    prot_name_map: FnvHashMap<Arc<str>, ProteinIx>,
    proteins: Vec<Arc<str>>,
    peptides: Vec<Arc<str>>,
}

impl ProteinGrouping {
    fn get_or_insert_prot(&mut self, prot: &str) -> ProteinIx {
        match self.prot_name_map.get(prot) {
            Some(&prot_id) => prot_id,
            None => {
                let prot: Arc<str> = Arc::from(prot);
                let prot_id = ProteinIx(self.proteins.len() as u32);
                self.prot_name_map.insert(prot.clone(), prot_id);
                self.proteins.push(prot);
                prot_id
            }
        }
    }

    /// Every protein with the (sorted) peptides it explains
    fn evidence<'a, I>(&mut self, peptides: I) -> FnvHashMap<ProteinIx, Vec<PeptideIx>>
    where
        I: IntoIterator<Item = (&'a str, &'a [String])>,
    {
        let mut evidence: FnvHashMap<ProteinIx, Vec<PeptideIx>> = FnvHashMap::default();
        // Sorted so that interned indices, and thus group order, are stable
        for (peptide, accessions) in peptides.into_iter().sorted_by_key(|(p, _)| *p) {
            let pep_ix = PeptideIx(self.peptides.len() as u32);
            self.peptides.push(Arc::from(peptide));
            for accession in accessions.iter().sorted().dedup() {
                let prot_ix = self.get_or_insert_prot(accession);
                evidence.entry(prot_ix).or_default().push(pep_ix);
            }
        }
        evidence
    }
}

/// Group proteins with identical peptide evidence. `peptides` yields each
/// peptide key with the accessions of the proteins containing it.
pub fn group_proteins<'a, I, F>(
    peptides: I,
    is_decoy: F,
    policy: DecoyGroupPolicy,
) -> Vec<ProteinGroup>
where
    I: IntoIterator<Item = (&'a str, &'a [String])>,
    F: Fn(&str) -> bool,
{
    let time = Instant::now();
    let mut grouping = ProteinGrouping::default();
    let evidence = grouping.evidence(peptides);

    let mut mapping: FnvHashMap<Vec<PeptideIx>, Vec<ProteinIx>> = FnvHashMap::default();
    for (prot_ix, peps) in evidence {
        mapping.entry(peps).or_default().push(prot_ix);
    }

    let groups = mapping
        .into_iter()
        .map(|(peps, prots)| {
            let accessions = prots
                .iter()
                .map(|ix| grouping.proteins[ix.0 as usize].to_string())
                .collect::<Vec<_>>();
            let decoys = accessions.iter().filter(|a| is_decoy(a.as_str())).count();
            ProteinGroup {
                decoy: policy.is_decoy(decoys, accessions.len()),
                key: ProteinGroupKey::new(accessions),
                peptides: peps
                    .iter()
                    .map(|ix| grouping.peptides[ix.0 as usize].to_string())
                    .collect(),
            }
        })
        .sorted_by(|a, b| a.key.cmp(&b.key))
        .collect::<Vec<_>>();

    info!(
        "-  found {} protein groups from {} proteins in {:?}ms",
        groups.len(),
        grouping.proteins.len(),
        time.elapsed().as_millis()
    );
    groups
}
