use serde::{Deserialize, Serialize};

use crate::distribution::confidence;
use crate::score_map::GroupKey;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationLevel {
    /// Not assessed, e.g. because no decoy was available
    #[default]
    None,
    NotValidated,
    Doubtful,
    Confident,
}

impl ValidationLevel {
    pub fn is_validated(&self) -> bool {
        matches!(self, ValidationLevel::Doubtful | ValidationLevel::Confident)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationLevel::None => "none",
            ValidationLevel::NotValidated => "not_validated",
            ValidationLevel::Doubtful => "doubtful",
            ValidationLevel::Confident => "confident",
        }
    }
}

/// How unambiguously the proteins explaining a peptide can be told apart
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProteinInference {
    #[default]
    NotDetermined,
    SingleProtein,
    RelatedProteins,
    RelatedAndUnrelated,
    UnrelatedProteins,
}

impl ProteinInference {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProteinInference::NotDetermined => "not_determined",
            ProteinInference::SingleProtein => "single_protein",
            ProteinInference::RelatedProteins => "related_proteins",
            ProteinInference::RelatedAndUnrelated => "related_and_unrelated",
            ProteinInference::UnrelatedProteins => "unrelated_proteins",
        }
    }
}

/// Validation state of a PSM, peptide or protein match. Values are replaced
/// wholesale by the stage owning the level; use the `with_*` helpers to derive
/// an updated copy.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ValidationParameter {
    /// Composite score, higher is better
    pub score: f64,
    /// Best search engine PEP among the supporting assumptions
    pub engine_pep: f64,
    /// Product of the per-engine PEPs
    pub combined_pep: f64,
    /// PEP estimated in the score map
    pub pep: f64,
    /// Gap between the PEP of the next-best candidate and this one
    pub delta_pep: f64,
    pub confidence: f64,
    pub level: ValidationLevel,
    pub starred: bool,
    pub hidden: bool,
    /// Set when a user overrode the validation level
    pub manual: bool,
    /// Map group the match was validated in, after curation
    pub group: GroupKey,
    /// Peptides only
    pub inference: ProteinInference,
    /// Peptides only: exactly one protein group explains the peptide
    pub unique: bool,
}

impl Default for ValidationParameter {
    fn default() -> Self {
        Self {
            score: 0.0,
            engine_pep: 1.0,
            combined_pep: 1.0,
            pep: 1.0,
            delta_pep: 0.0,
            confidence: 0.0,
            level: ValidationLevel::None,
            starred: false,
            hidden: false,
            manual: false,
            group: GroupKey::default(),
            inference: ProteinInference::NotDetermined,
            unique: false,
        }
    }
}

impl ValidationParameter {
    pub fn with_score(self, score: f64, combined_pep: f64) -> Self {
        Self {
            score,
            combined_pep,
            ..self
        }
    }

    /// Set the map PEP and the confidence derived from it
    pub fn with_pep(self, pep: f64) -> Self {
        Self {
            pep,
            confidence: confidence(pep),
            ..self
        }
    }

    pub fn with_group(self, group: GroupKey) -> Self {
        Self { group, ..self }
    }

    /// Manually set levels are kept
    pub fn with_level(self, level: ValidationLevel) -> Self {
        match self.manual {
            true => self,
            false => Self { level, ..self },
        }
    }

    pub fn with_manual_level(self, level: ValidationLevel) -> Self {
        Self {
            level,
            manual: true,
            ..self
        }
    }

    pub fn with_inference(self, inference: ProteinInference, unique: bool) -> Self {
        Self {
            inference,
            unique,
            ..self
        }
    }

    pub fn is_validated(&self) -> bool {
        self.level.is_validated()
    }
}

/// Composite score `-10 log10(p)`; a zero probability maps to a large finite
/// score.
pub fn composite_score(p: f64) -> f64 {
    // adding 0.0 turns -0.0 (p = 1) into 0.0
    -10.0 * p.max(f64::MIN_POSITIVE).log10() + 0.0
}

/// Score and combined probability of a match from the PEPs of its children
/// (PSMs for a peptide, peptides for a protein). Only validated children count,
/// unless none is validated, in which case all children do.
pub fn aggregate_score<I>(children: I) -> (f64, f64)
where
    I: IntoIterator<Item = (f64, bool)>,
{
    let children = children.into_iter().collect::<Vec<_>>();
    let any_validated = children.iter().any(|(_, v)| *v);
    let p = children
        .iter()
        .filter(|(_, validated)| *validated || !any_validated)
        .map(|(pep, _)| *pep)
        .product::<f64>();
    (composite_score(p), p)
}

/// Validation level of a match scoring `score` in a group whose acceptance
/// threshold is `threshold`
pub fn level_for(
    score: f64,
    threshold: Option<f64>,
    confidence: f64,
    confidence_threshold: f64,
    suspicious: bool,
) -> ValidationLevel {
    match threshold {
        Some(threshold) if score >= threshold => {
            if confidence >= confidence_threshold && !suspicious {
                ValidationLevel::Confident
            } else {
                ValidationLevel::Doubtful
            }
        }
        _ => ValidationLevel::NotValidated,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn scores() {
        assert!((composite_score(0.01) - 20.0).abs() < 1e-9);
        assert!(composite_score(1.0).is_sign_positive());
        assert_eq!(composite_score(1.0), 0.0);
        assert!(composite_score(0.0).is_finite());

        let (score, p) = aggregate_score([(0.1, true), (0.1, true), (0.5, false)]);
        assert!((p - 0.01).abs() < 1e-12);
        assert!((score - 20.0).abs() < 1e-9);

        let (_, p) = aggregate_score([(0.5, false), (0.5, false)]);
        assert!((p - 0.25).abs() < 1e-12);
    }

    #[test]
    fn levels() {
        use ValidationLevel::*;
        assert_eq!(level_for(10.0, Some(5.0), 99.0, 95.0, false), Confident);
        assert_eq!(level_for(10.0, Some(5.0), 90.0, 95.0, false), Doubtful);
        assert_eq!(level_for(10.0, Some(5.0), 99.0, 95.0, true), Doubtful);
        assert_eq!(level_for(4.0, Some(5.0), 99.0, 95.0, false), NotValidated);
        assert_eq!(level_for(4.0, Option::None, 99.0, 95.0, false), NotValidated);
    }

    #[test]
    fn manual_levels_stick() {
        let param = ValidationParameter::default()
            .with_pep(0.02)
            .with_manual_level(ValidationLevel::NotValidated);
        assert!((param.confidence - 98.0).abs() < 1e-9);
        let param = param.with_level(ValidationLevel::Confident);
        assert_eq!(param.level, ValidationLevel::NotValidated);
        assert!(param.manual);
    }
}
