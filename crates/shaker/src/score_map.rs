//! Score distributions partitioned by a group key, with curation of weak
//! groups into a per-family dustbin before estimation.

use std::collections::BTreeMap;
use std::fmt;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::distribution::{TargetDecoyDistribution, TargetDecoyResults};
use crate::progress::Progress;
use crate::settings::EstimationMethod;
use crate::{Error, Result};

/// Label of the group collecting the weak groups of a family
pub const DUSTBIN: &str = "OTHER";

/// Identifies one statistically independent group. Curation never merges
/// groups across families.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupKey {
    pub family: String,
    pub label: String,
}

impl GroupKey {
    pub fn new<F: Into<String>, L: Into<String>>(family: F, label: L) -> Self {
        Self {
            family: family.into(),
            label: label.into(),
        }
    }

    /// Key in the anonymous family used by the PSM, peptide and protein maps
    pub fn label<L: Into<String>>(label: L) -> Self {
        Self::new("", label)
    }

    pub fn dustbin<F: Into<String>>(family: F) -> Self {
        Self::new(family, DUSTBIN)
    }

    pub fn is_dustbin(&self) -> bool {
        self.label == DUSTBIN
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.family.is_empty(), self.label.is_empty()) {
            (true, true) => f.write_str("all"),
            (true, false) => f.write_str(&self.label),
            (false, true) => f.write_str(&self.family),
            (false, false) => write!(f, "{}/{}", self.family, self.label),
        }
    }
}

/// Immutable outcome of curation: which groups were folded into which dustbin
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct GroupResolution {
    merged_into: BTreeMap<GroupKey, GroupKey>,
}

impl GroupResolution {
    pub fn corrected<'a>(&'a self, key: &'a GroupKey) -> &'a GroupKey {
        self.merged_into.get(key).unwrap_or(key)
    }

    pub fn is_merged(&self, key: &GroupKey) -> bool {
        self.merged_into.contains_key(key)
    }

    /// Groups that were folded into `target`
    pub fn merged(&self, target: &GroupKey) -> Vec<GroupKey> {
        self.merged_into
            .iter()
            .filter(|(_, to)| *to == target)
            .map(|(from, _)| from.clone())
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.merged_into.is_empty()
    }
}

/// Reporting view of one live group
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct GroupSummary {
    pub key: GroupKey,
    pub n_targets: usize,
    pub n_decoys: usize,
    pub merged: Vec<GroupKey>,
    pub suspicious: bool,
}

#[derive(Clone, Debug)]
pub struct HierarchicalScoreMap {
    name: String,
    groups: BTreeMap<GroupKey, TargetDecoyDistribution>,
    resolution: Option<GroupResolution>,
    floor: usize,
}

impl HierarchicalScoreMap {
    /// `floor` is the population under which a group is reported as
    /// suspicious
    pub fn new<S: Into<String>>(name: S, floor: usize) -> Self {
        Self {
            name: name.into(),
            groups: BTreeMap::new(),
            resolution: None,
            floor,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add an observation. After curation, points are routed to the group the
    /// key was merged into.
    pub fn add_point(&mut self, key: &GroupKey, score: f64, is_decoy: bool) {
        let key = self.corrected_key(key);
        self.groups.entry(key).or_default().put(score, is_decoy);
    }

    pub fn remove_point(&mut self, key: &GroupKey, score: f64, is_decoy: bool) -> bool {
        let key = self.corrected_key(key);
        match self.groups.get_mut(&key) {
            Some(group) => group.remove(score, is_decoy),
            None => false,
        }
    }

    /// Fold every group with fewer than `min_population` targets or decoys
    /// into its family's dustbin. Families consisting of a single group are
    /// left alone. May only run once per map.
    pub fn cure(&mut self, min_population: usize) -> Result<&GroupResolution> {
        if self.resolution.is_some() {
            return Err(Error::AlreadyCured(self.name.clone()));
        }

        let mut families: BTreeMap<&str, usize> = BTreeMap::new();
        for key in self.groups.keys() {
            *families.entry(key.family.as_str()).or_default() += 1;
        }

        let merged_into = self
            .groups
            .iter()
            .filter(|(key, group)| {
                !key.is_dustbin()
                    && families.get(key.family.as_str()).copied().unwrap_or(0) > 1
                    && group.suspicious_input(min_population)
            })
            .map(|(key, _)| (key.clone(), GroupKey::dustbin(key.family.clone())))
            .collect::<BTreeMap<_, _>>();

        for (from, to) in &merged_into {
            if let Some(group) = self.groups.remove(from) {
                log::debug!(
                    "{}: merging group {} ({} targets, {} decoys) into {}",
                    self.name,
                    from,
                    group.n_targets(),
                    group.n_decoys(),
                    to
                );
                self.groups.entry(to.clone()).or_default().merge(&group);
            }
        }

        Ok(&*self.resolution.insert(GroupResolution { merged_into }))
    }

    pub fn is_cured(&self) -> bool {
        self.resolution.is_some()
    }

    pub fn resolution(&self) -> Option<&GroupResolution> {
        self.resolution.as_ref()
    }

    /// The group an observation keyed by `key` ends up in
    pub fn corrected_key(&self, key: &GroupKey) -> GroupKey {
        match &self.resolution {
            Some(resolution) => resolution.corrected(key).clone(),
            None => key.clone(),
        }
    }

    pub fn group(&self, key: &GroupKey) -> Option<&TargetDecoyDistribution> {
        self.groups.get(&self.corrected_key(key))
    }

    pub fn keys(&self) -> impl Iterator<Item = &GroupKey> {
        self.groups.keys()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn has_decoys(&self) -> bool {
        self.groups.values().any(|g| g.has_decoys())
    }

    /// Estimate PEPs in every live group. Groups are independent, so they
    /// are processed in parallel.
    pub fn estimate_probabilities(&mut self, method: EstimationMethod, progress: &dyn Progress) {
        let name = &self.name;
        self.groups.par_iter_mut().for_each(|(key, group)| {
            if !group.has_decoys() {
                log::debug!("{}: no decoys in group {}, skipping estimation", name, key);
            }
            group.estimate_probabilities(method, progress);
        });
    }

    /// PEP of `score` in the group of `key`, 1.0 if that group is unknown or
    /// was not estimated
    pub fn probability(&self, key: &GroupKey, score: f64) -> f64 {
        self.group(key).map(|g| g.probability(score)).unwrap_or(1.0)
    }

    pub fn fdr_at(&self, key: &GroupKey, score: f64) -> Option<f64> {
        self.group(key)?.fdr_at(score)
    }

    pub fn results_at_fdr(&self, key: &GroupKey, fdr: f64) -> Option<TargetDecoyResults> {
        self.group(key).map(|g| g.results_at_fdr(fdr))
    }

    pub fn is_suspicious(&self, key: &GroupKey) -> bool {
        self.group(key)
            .map(|g| g.suspicious_input(self.floor))
            .unwrap_or(true)
    }

    /// Live groups whose population remains under the floor
    pub fn suspicious_groups(&self) -> Vec<GroupKey> {
        self.groups
            .iter()
            .filter(|(_, g)| g.suspicious_input(self.floor))
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn summaries(&self) -> Vec<GroupSummary> {
        self.groups
            .iter()
            .map(|(key, group)| GroupSummary {
                key: key.clone(),
                n_targets: group.n_targets(),
                n_decoys: group.n_decoys(),
                merged: self
                    .resolution
                    .as_ref()
                    .map(|r| r.merged(key))
                    .unwrap_or_default(),
                suspicious: group.suspicious_input(self.floor),
            })
            .collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::progress::Silent;
    use quickcheck_macros::quickcheck;

    fn populate(map: &mut HierarchicalScoreMap, key: &GroupKey, targets: usize, decoys: usize) {
        for i in 0..targets {
            map.add_point(key, 50.0 + i as f64, false);
        }
        for i in 0..decoys {
            map.add_point(key, i as f64, true);
        }
    }

    #[test]
    fn weak_groups_fold_into_family_dustbin() {
        let mut map = HierarchicalScoreMap::new("ptm", 100);
        let phospho_2 = GroupKey::new("Phospho", "2");
        let phospho_3 = GroupKey::new("Phospho", "3");
        let oxidation_2 = GroupKey::new("Oxidation", "2");
        populate(&mut map, &phospho_2, 200, 150);
        populate(&mut map, &phospho_3, 20, 10);
        populate(&mut map, &oxidation_2, 20, 10);

        let resolution = map.cure(100).unwrap().clone();
        assert_eq!(resolution.corrected(&phospho_3), &GroupKey::dustbin("Phospho"));
        assert_eq!(resolution.corrected(&phospho_2), &phospho_2);
        // alone in its family
        assert!(!resolution.is_merged(&oxidation_2));

        assert_eq!(map.len(), 3);
        let dustbin = map.group(&phospho_3).unwrap();
        assert_eq!((dustbin.n_targets(), dustbin.n_decoys()), (20, 10));

        let suspicious = map.suspicious_groups();
        assert!(suspicious.contains(&GroupKey::dustbin("Phospho")));
        assert!(suspicious.contains(&oxidation_2));
        assert!(!suspicious.contains(&phospho_2));

        assert!(matches!(map.cure(100), Err(Error::AlreadyCured(_))));
    }

    #[test]
    fn points_follow_resolution() {
        let mut map = HierarchicalScoreMap::new("psm", 100);
        let big = GroupKey::label("2");
        let small = GroupKey::label("4");
        populate(&mut map, &big, 150, 150);
        populate(&mut map, &small, 5, 5);
        map.cure(100).unwrap();

        map.add_point(&small, 1000.0, false);
        assert!(map.remove_point(&small, 1000.0, false));
        assert_eq!(map.group(&small).unwrap().len(), 10);
        assert!(!map.remove_point(&small, 1000.0, false));

        let summary = map
            .summaries()
            .into_iter()
            .find(|s| s.key.is_dustbin())
            .unwrap();
        assert_eq!(summary.merged, vec![small]);
        assert!(summary.suspicious);
    }

    #[test]
    fn estimation_and_lookup() {
        let mut map = HierarchicalScoreMap::new("psm", 100);
        let key = GroupKey::label("2");
        populate(&mut map, &key, 200, 50);
        map.add_point(&GroupKey::label("3"), 10.0, false);
        map.cure(100).unwrap();
        map.estimate_probabilities(EstimationMethod::SlidingWindow, &Silent);

        assert_eq!(map.probability(&key, 240.0), 0.0);
        assert_eq!(map.probability(&key, 0.0), 1.0);
        assert_eq!(map.probability(&GroupKey::label("unknown"), 240.0), 1.0);
        assert_eq!(map.fdr_at(&key, 50.0), Some(0.0));
        assert_eq!(
            map.results_at_fdr(&key, 0.001).unwrap().score_threshold,
            Some(50.0)
        );
        assert!(map.has_decoys());
    }

    #[quickcheck]
    fn corrected_keys_are_live(groups: Vec<(u8, u8, u8)>) -> bool {
        let mut map = HierarchicalScoreMap::new("prop", 100);
        let mut keys = Vec::new();
        for (label, targets, decoys) in groups {
            let key = GroupKey::new(format!("f{}", label % 3), label.to_string());
            populate(&mut map, &key, targets as usize, decoys as usize);
            keys.push(key);
        }
        let total = map.groups.values().map(|g| g.len()).sum::<usize>();
        if map.cure(100).is_err() {
            return false;
        }
        let cured_total = map.groups.values().map(|g| g.len()).sum::<usize>();
        // empty groups are never created, so unpopulated keys need not be live
        keys.iter()
            .filter(|k| map.groups.contains_key(*k) || map.resolution().unwrap().is_merged(k))
            .all(|k| map.groups.contains_key(&map.corrected_key(k)))
            && total == cured_total
    }
}
