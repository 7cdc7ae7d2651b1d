//! End-to-end validation runs over synthetic identifications

use std::collections::BTreeMap;

use shaker_core::identification::{Identification, PeptideAssumption, SpectrumMatch};
use shaker_core::peptide::{ModificationMatch, Peptide};
use shaker_core::progress::{CancellationToken, Progress};
use shaker_core::providers::{ProteinDatabase, ProteinHit, SpectrumEvidence, SpectrumTable};
use shaker_core::ptm::PtmConfidence;
use shaker_core::score_map::GroupKey;
use shaker_core::settings::{ModificationDefinition, ValidationSettings};
use shaker_core::validation::ValidationLevel;
use shaker_core::validator::{Completion, Stage, ValidationReport, Validator, Warning};

const RESIDUES: &[u8] = b"ACDEFGHKLMNPQRSTVWY";

/// A distinct tryptic-looking sequence for every index
fn sequence(mut ix: usize) -> String {
    let mut s = String::from("PEP");
    for _ in 0..4 {
        s.push(RESIDUES[ix % RESIDUES.len()] as char);
        ix /= RESIDUES.len();
    }
    s.push('K');
    s
}

struct Dataset {
    settings: ValidationSettings,
    database: ProteinDatabase,
    spectra: SpectrumTable,
    id: Identification,
}

impl Dataset {
    fn new() -> Self {
        let settings = ValidationSettings::default();
        Self {
            database: ProteinDatabase::new("rev_", settings.sequence_matching),
            settings,
            spectra: SpectrumTable::default(),
            id: Identification::new(),
        }
    }

    /// Register `peptide` on its own protein and add a single-assumption PSM
    fn psm(&mut self, key: &str, peptide: Peptide, score: f64, pep: Option<f64>, decoy: bool) {
        let accession = match decoy {
            true => format!("rev_{}", peptide.sequence),
            false => format!("sp_{}", peptide.sequence),
        };
        self.database.add_peptide(
            &peptide.sequence,
            vec![ProteinHit {
                accession,
                position: 0,
            }],
        );
        self.assumptions(key, vec![("engine", peptide, score, pep)]);
    }

    fn assumptions(&mut self, key: &str, assumptions: Vec<(&str, Peptide, f64, Option<f64>)>) {
        self.charged(key, 2, assumptions)
    }

    fn charged(
        &mut self,
        key: &str,
        charge: u8,
        assumptions: Vec<(&str, Peptide, f64, Option<f64>)>,
    ) {
        let assumptions = assumptions
            .into_iter()
            .map(|(engine, peptide, score, pep)| PeptideAssumption {
                engine: engine.into(),
                rank: 1,
                peptide,
                charge,
                score,
                pep,
            })
            .collect();
        self.id
            .add_spectrum(SpectrumMatch::new(key, assumptions))
            .unwrap();
    }

    fn run(&mut self) -> ValidationReport {
        let mut validator = Validator::new(&self.settings, &self.database, &self.spectra);
        match validator.run(&mut self.id).unwrap() {
            Completion::Finished(report) => report,
            Completion::Cancelled { stage } => panic!("cancelled during {}", stage),
        }
    }
}

/// Decoys spread over [0, 50)
fn decoy_score(ix: usize) -> f64 {
    ix as f64 * 0.1
}

/// 100 targets among the decoys, 400 well above them
fn target_score(ix: usize) -> f64 {
    match ix < 100 {
        true => ix as f64 * 0.5,
        false => 60.0 + ix as f64 * 0.1,
    }
}

/// Decoys over targets scoring at least `cutoff` in the generated layout
fn layout_fdr(cutoff: f64) -> (f64, usize) {
    let decoys = (0..500).filter(|&ix| decoy_score(ix) >= cutoff).count();
    let targets = (0..500).filter(|&ix| target_score(ix) >= cutoff).count();
    (decoys as f64 / targets as f64, targets)
}

#[test]
fn separated_single_engine() {
    let mut data = Dataset::new();
    for ix in 0..500 {
        data.psm(
            &format!("decoy_{}", ix),
            Peptide::unmodified(sequence(ix)),
            decoy_score(ix),
            None,
            true,
        );
        data.psm(
            &format!("target_{}", ix),
            Peptide::unmodified(sequence(500 + ix)),
            target_score(ix),
            None,
            false,
        );
    }

    let report = data.run();
    assert_eq!(data.id.checkpoint(), Some(Stage::PtmAggregation));
    assert!(data.id.spectra().all(|s| s.assumptions[0].pep.is_some()));

    let psm = report.psm.as_ref().unwrap();
    assert_eq!(psm.n_matches, 1000);
    assert_eq!(psm.n_decoys, 500);
    let results = psm.thresholds["2"];
    let threshold = results.score_threshold.unwrap();

    // Accepted PSMs are those above a cutoff on the engine score
    let cutoff = data
        .id
        .spectra()
        .filter(|s| s.validation.score >= threshold)
        .map(|s| s.assumptions[0].score)
        .fold(f64::INFINITY, f64::min);
    let (expected, targets) = layout_fdr(cutoff);
    assert!((results.fdr - expected).abs() < 1e-12);
    assert_eq!(results.n_targets, targets);

    // Best achievable cutoff: every target above the decoys, plus the
    // overlapping ones while the FDR stays under 1%
    let (optimum, _) = (0..500)
        .map(decoy_score)
        .chain((0..500).map(target_score))
        .map(layout_fdr)
        .filter(|(fdr, _)| *fdr <= 0.01)
        .max_by_key(|(_, targets)| *targets)
        .unwrap();

    assert!(results.fdr <= 0.01);
    assert!((results.fdr - optimum).abs() <= 0.01);
    assert!(targets >= 400);
    assert_eq!(psm.n_validated(), results.n_targets + results.n_decoys);
    assert!(report.suspicious_groups().is_empty());
}

#[test]
fn lower_pep_wins_when_occurrence_ties() {
    let mut data = Dataset::new();
    data.database.add_peptide(
        "ELVISK",
        vec![ProteinHit {
            accession: "P1".into(),
            position: 10,
        }],
    );
    data.database.add_peptide(
        "LVESSK",
        vec![ProteinHit {
            accession: "P2".into(),
            position: 4,
        }],
    );
    data.assumptions(
        "s1",
        vec![
            ("a", Peptide::unmodified("ELVISK"), 40.0, Some(0.001)),
            ("b", Peptide::unmodified("LVESSK"), 30.0, Some(0.05)),
        ],
    );
    data.assumptions(
        "s2",
        vec![("b", Peptide::unmodified("LVESSK"), 35.0, Some(0.01))],
    );
    data.assumptions(
        "s3",
        vec![("a", Peptide::unmodified("ELVISK"), 35.0, Some(0.01))],
    );

    data.run();
    let s1 = data.id.spectrum("s1").unwrap();
    let best = s1.best.as_ref().unwrap();
    assert_eq!(best.peptide.sequence, "ELVISK");
    assert_eq!(best.engines, vec!["a".to_string()]);
    assert!((s1.validation.delta_pep - 0.049).abs() < 1e-9);

    let peptides = data.id.peptides().map(|p| p.key.clone()).collect::<Vec<_>>();
    assert_eq!(peptides.len(), 2);
    assert_eq!(data.id.n_proteins(), 2);
}

fn modification_groups(data: &mut Dataset, modified: &[(&str, usize)]) {
    for ix in 0..150 {
        data.psm(
            &format!("decoy_{}", ix),
            Peptide::unmodified(sequence(ix)),
            ix as f64 * 0.1,
            Some(0.5),
            true,
        );
        data.psm(
            &format!("target_{}", ix),
            Peptide::unmodified(sequence(1000 + ix)),
            30.0 + ix as f64 * 0.1,
            Some(0.001),
            false,
        );
    }
    let mut offset = 2000;
    for &(name, n) in modified {
        for ix in 0..n {
            let peptide = Peptide::new(
                sequence(offset + ix),
                vec![ModificationMatch::new(name, 15.994915, 1)],
            );
            let decoy = ix % 2 == 0;
            let pep = if decoy { 0.5 } else { 0.001 };
            data.psm(&format!("{}_{}", name, ix), peptide, ix as f64, Some(pep), decoy);
        }
        offset += n;
    }
}

#[test]
fn weak_modification_group_is_folded() {
    let mut data = Dataset::new();
    modification_groups(&mut data, &[("Oxidation", 30)]);
    let report = data.run();

    let peptide = report.peptide.as_ref().unwrap();
    let dustbin = GroupKey::dustbin("");
    let group = peptide.groups.iter().find(|g| g.key == dustbin).unwrap();
    assert_eq!(group.merged, vec![GroupKey::label("Oxidation")]);
    assert_eq!(group.n_targets + group.n_decoys, 30);
    assert!(group.suspicious);
    assert!(!peptide.groups.iter().any(|g| g.key == GroupKey::label("Oxidation")));

    let suspicious = report.suspicious_groups();
    assert!(suspicious.contains(&("peptide", &dustbin)));
    assert!(!suspicious.contains(&("peptide", &GroupKey::label(""))));

    let oxidized = data
        .id
        .peptides()
        .find(|p| p.peptide.has_variable_modifications())
        .unwrap();
    assert_eq!(oxidized.validation.group, dustbin);
}

#[test]
fn folded_groups_can_reach_the_floor() {
    let mut data = Dataset::new();
    data.settings.min_group_population = 20;
    modification_groups(&mut data, &[("Oxidation", 30), ("Deamidated", 30)]);
    let report = data.run();

    let peptide = report.peptide.as_ref().unwrap();
    let dustbin = GroupKey::dustbin("");
    let group = peptide.groups.iter().find(|g| g.key == dustbin).unwrap();
    assert_eq!(group.merged.len(), 2);
    assert_eq!((group.n_targets, group.n_decoys), (30, 30));
    assert!(!group.suspicious);
    assert!(!report
        .suspicious_groups()
        .contains(&("peptide", &dustbin)));
}

#[test]
fn no_decoys() {
    let mut data = Dataset::new();
    for ix in 0..50 {
        data.psm(
            &format!("s{}", ix),
            Peptide::unmodified(sequence(ix)),
            ix as f64,
            None,
            false,
        );
    }
    let report = data.run();

    for psm in data.id.spectra() {
        assert_eq!(psm.validation.pep, 1.0);
        assert_eq!(psm.validation.level, ValidationLevel::None);
    }
    assert!(data.id.peptides().all(|p| p.validation.pep == 1.0));
    assert!(data.id.proteins().all(|p| p.validation.pep == 1.0));
    assert_eq!(data.id.n_proteins(), 50);

    for map in ["psm", "peptide", "protein"] {
        assert!(report.warnings.iter().any(|w| matches!(
            w,
            Warning::NoDecoys { map: m, group: None, .. } if m == map
        )));
    }
    assert!(report.warnings.iter().any(|w| matches!(
        w,
        Warning::NoDecoys { map: m, group: Some(_), .. } if m == "input"
    )));
}

/// Cancels as soon as a stage with the given label starts
struct CancelAt {
    label: &'static str,
    token: CancellationToken,
}

impl Progress for CancelAt {
    fn start(&self, label: &str, _total: usize) {
        if label == self.label {
            self.token.cancel();
        }
    }
}

#[test]
fn cancelled_runs_resume() {
    let mut data = Dataset::new();
    for ix in 0..20 {
        data.psm(
            &format!("s{}", ix),
            Peptide::unmodified(sequence(ix)),
            ix as f64,
            Some(0.01),
            ix % 4 == 0,
        );
    }

    let token = CancellationToken::new();
    let progress = CancelAt {
        label: "peptides",
        token: token.clone(),
    };
    let mut validator = Validator::new(&data.settings, &data.database, &data.spectra)
        .with_progress(&progress)
        .with_cancellation(token);
    let completion = validator.run(&mut data.id).unwrap();
    assert_eq!(
        completion,
        Completion::Cancelled {
            stage: Stage::PeptideValidation
        }
    );
    assert_eq!(data.id.checkpoint(), Some(Stage::PtmScoring));
    assert_eq!(data.id.n_peptides(), 0);
    assert!(data.id.spectra().all(|s| s.best.is_some()));

    data.run();
    assert_eq!(data.id.checkpoint(), Some(Stage::PtmAggregation));
    assert_eq!(data.id.n_peptides(), 20);
}

#[test]
fn overrides_propagate_downstream() {
    let mut data = Dataset::new();
    for ix in 0..10 {
        data.psm(
            &format!("s{}", ix),
            Peptide::unmodified(sequence(ix)),
            ix as f64,
            None,
            false,
        );
    }
    data.run();
    assert!(data.id.proteins().all(|p| p.n_validated_spectra == 0));

    let mut validator = Validator::new(&data.settings, &data.database, &data.spectra);
    let completion = validator
        .override_psm(&mut data.id, "s3", ValidationLevel::Confident)
        .unwrap();
    assert!(matches!(completion, Completion::Finished(_)));

    let psm = data.id.spectrum("s3").unwrap();
    assert!(psm.validation.manual);
    assert_eq!(psm.validation.level, ValidationLevel::Confident);

    let protein = data
        .id
        .proteins()
        .find(|p| p.key.contains(&format!("sp_{}", sequence(3))))
        .unwrap();
    assert_eq!(protein.n_validated_spectra, 1);

    let key = protein.key.to_string();
    validator
        .override_protein(&mut data.id, &key, ValidationLevel::Doubtful)
        .unwrap();
    validator
        .override_peptide(&mut data.id, &sequence(3), ValidationLevel::Confident)
        .unwrap();
    assert_eq!(
        data.id.protein(&key).unwrap().validation.level,
        ValidationLevel::Doubtful
    );
    assert!(data.id.peptide(&sequence(3)).unwrap().validation.manual);
}

/// A distinct peptide with candidate phosphosites S4, T6 and Y8
fn phosphopeptide(mut ix: usize) -> String {
    const NO_SITES: &[u8] = b"ACDEFGHLMNPQRVW";
    let mut s = String::new();
    for _ in 0..3 {
        s.push(NO_SITES[ix % NO_SITES.len()] as char);
        ix /= NO_SITES.len();
    }
    s.push_str("SATAYK");
    s
}

fn phospho(sequence: &str, site: usize) -> Peptide {
    Peptide::new(sequence, vec![ModificationMatch::new("Phospho", 79.966331, site)])
}

impl Dataset {
    fn phospho_target(&mut self, ix: usize) -> String {
        let sequence = phosphopeptide(ix);
        self.database.add_peptide(
            &sequence,
            vec![ProteinHit {
                accession: format!("sp_{}", sequence),
                position: 100,
            }],
        );
        sequence
    }

    /// Phosphorylated on S4, with T6 as an alternative placement
    fn localized(&mut self, key: &str, ix: usize, charge: u8, alternative_pep: f64) {
        let sequence = self.phospho_target(ix);
        self.charged(
            key,
            charge,
            vec![
                ("engine", phospho(&sequence, 4), 30.0, Some(0.001)),
                ("engine", phospho(&sequence, 6), 20.0, Some(alternative_pep)),
            ],
        );
    }

    /// Phosphorylated on S4, with externally supplied site probabilities
    fn externally_localized(&mut self, key: &str, ix: usize, probabilities: [(usize, f64); 2]) {
        let sequence = self.phospho_target(ix);
        let peptide = phospho(&sequence, 4);
        let mut evidence = SpectrumEvidence::default();
        evidence.site_probabilities.insert(
            peptide.key(),
            BTreeMap::from([("Phospho".to_string(), BTreeMap::from(probabilities))]),
        );
        self.spectra.insert(key, evidence);
        self.charged(key, 2, vec![("engine", peptide, 30.0, Some(0.001))]);
    }
}

#[test]
fn phosphosite_localization() {
    let mut data = Dataset::new();
    data.settings.min_group_population = 10;
    data.settings.flr = 0.15;
    data.settings.modifications = vec![ModificationDefinition {
        name: "Phospho".into(),
        mass: 79.966331,
        residues: "STY".into(),
    }];

    for charge in [2, 3] {
        for ix in 0..20 {
            let offset = 100 * charge as usize;
            for (decoy, pep) in [(true, 0.5), (false, 0.001)] {
                let sequence = sequence(offset + 2 * ix + decoy as usize);
                let accession = match decoy {
                    true => format!("rev_{}", sequence),
                    false => format!("sp_{}", sequence),
                };
                data.database.add_peptide(
                    &sequence,
                    vec![ProteinHit {
                        accession,
                        position: 0,
                    }],
                );
                data.charged(
                    &format!("bg{}_{}_{}", charge, decoy, ix),
                    charge,
                    vec![("engine", Peptide::unmodified(sequence), 10.0, Some(pep))],
                );
            }
        }
    }

    // Phosphorylated decoys are never validated
    for ix in 0..12 {
        let sequence = phosphopeptide(100 + ix);
        data.database.add_peptide(
            &sequence,
            vec![ProteinHit {
                accession: format!("rev_{}", sequence),
                position: 0,
            }],
        );
        data.charged(
            &format!("decoy_{}", ix),
            2,
            vec![("engine", phospho(&sequence, 4), 5.0, Some(0.5))],
        );
    }

    // Charge 2: 20 agreeing localizations and 12 conflicts
    for ix in 0..10 {
        data.localized(&format!("high_{}", ix), ix, 2, 0.1);
        data.localized(&format!("mid_{}", ix), 10 + ix, 2, 0.01);
        // the first one shares a peptide with mid_0
        let peptide = if ix == 0 { 10 } else { 20 + ix };
        data.externally_localized(&format!("low_{}", ix), peptide, [(4, 40.0), (6, 60.0)]);
    }
    data.externally_localized("close", 30, [(4, 95.0), (6, 96.0)]);
    data.externally_localized("random", 31, [(4, 20.0), (6, 80.0)]);
    // Charge 3: too few to be estimated on their own
    for ix in 0..3 {
        data.localized(&format!("charge3_{}", ix), 10 + ix, 3, 0.01);
    }

    let report = data.run();

    let site = |key: &str| {
        let psm = data.id.spectrum(key).unwrap();
        assert!(psm.validation.is_validated(), "{} not validated", key);
        psm.ptm["Phospho"].level(4)
    };
    // 99% of the placement likelihood, no conflict scoring as high
    assert_eq!(site("high_0"), PtmConfidence::VeryConfident);
    // FLR 1/20
    assert_eq!(site("mid_3"), PtmConfidence::VeryConfident);
    // FLR 1/10, but T6 is preferred by the site probabilities
    assert_eq!(site("close"), PtmConfidence::Confident);
    // FLR 11/20
    assert_eq!(site("low_4"), PtmConfidence::Doubtful);
    // under the 1/3 expected from a random placement
    assert_eq!(site("random"), PtmConfidence::Random);
    // folded group without conflicts, 91% is under the fixed threshold
    assert_eq!(site("charge3_2"), PtmConfidence::Doubtful);

    for ix in 0..12 {
        let decoy = data.id.spectrum(&format!("decoy_{}", ix)).unwrap();
        assert!(decoy.best.is_some());
        assert!(!decoy.validation.is_validated());
        assert!(decoy.ptm.is_empty());
    }

    let ptm = report.ptm.as_ref().unwrap();
    let charge2 = ptm
        .groups
        .iter()
        .find(|g| g.key == GroupKey::new("Phospho", "2"))
        .unwrap();
    assert_eq!((charge2.n_targets, charge2.n_decoys), (20, 12));
    assert!(!charge2.suspicious);
    let dustbin = GroupKey::dustbin("Phospho");
    let folded = ptm.groups.iter().find(|g| g.key == dustbin).unwrap();
    assert_eq!(folded.merged, vec![GroupKey::new("Phospho", "3")]);
    assert_eq!((folded.n_targets, folded.n_decoys), (3, 0));
    assert!(report.suspicious_groups().contains(&("ptm", &dustbin)));

    let peptide = |ix: usize| {
        let sequence = phosphopeptide(ix);
        let peptide = data
            .id
            .peptides()
            .find(|p| p.peptide.sequence == sequence)
            .unwrap();
        assert!(peptide.validation.is_validated());
        peptide
    };
    // mid_0, low_0 and charge3_0 disagree; the best level is kept
    assert_eq!(peptide(10).spectra.len(), 3);
    assert_eq!(peptide(10).ptm["Phospho"].level(4), PtmConfidence::VeryConfident);
    assert_eq!(peptide(11).ptm["Phospho"].level(4), PtmConfidence::VeryConfident);
    assert_eq!(peptide(21).ptm["Phospho"].level(4), PtmConfidence::Doubtful);
    assert_eq!(peptide(30).ptm["Phospho"].level(4), PtmConfidence::Confident);

    let protein = data
        .id
        .protein(&format!("sp_{}", phosphopeptide(10)))
        .unwrap();
    assert!(protein.validation.is_validated());
    let scoring = &protein.ptm["Phospho"];
    assert_eq!(scoring.level(104), PtmConfidence::VeryConfident);
    assert_eq!(scoring.level(4), PtmConfidence::NotFound);
}
