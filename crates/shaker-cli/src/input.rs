use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{ensure, Context};
use clap::ArgMatches;
use serde::{Deserialize, Serialize};
use shaker_core::identification::{Identification, PeptideAssumption, SpectrumMatch};
use shaker_core::mass::Tolerance;
use shaker_core::providers::{
    ProteinDatabase, ProteinHit, ProteinInfo, SpectrumEvidence, SpectrumTable,
};
use shaker_core::settings::ValidationSettings;

#[derive(Serialize)]
/// Actual validation parameters - may include overrides or default values not set by user
pub struct Settings {
    pub version: String,
    pub validation: ValidationSettings,
    pub decoy_tag: String,
    pub identifications: String,
    pub output_paths: Vec<String>,

    #[serde(skip_serializing)]
    pub output_directory: PathBuf,
}

#[derive(Deserialize)]
/// Input validation parameters deserialized from JSON file
pub struct Input {
    validation: Option<ValidationSettings>,
    decoy_tag: Option<String>,
    identifications: Option<String>,
    output_directory: Option<String>,
}

/// Search engine results and the evidence needed to validate them
#[derive(Serialize, Deserialize, Default, Debug)]
pub struct IdentificationFile {
    #[serde(default)]
    pub proteins: Vec<ProteinInfo>,
    /// Peptide to protein mapping
    #[serde(default)]
    pub peptides: Vec<PeptideEntry>,
    pub spectra: Vec<SpectrumEntry>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct PeptideEntry {
    pub sequence: String,
    pub proteins: Vec<ProteinHit>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct SpectrumEntry {
    pub key: String,
    pub assumptions: Vec<PeptideAssumption>,
    #[serde(default)]
    pub precursor_mz: Option<f64>,
    /// Residues confirmed by fragment ions, by peptide key
    #[serde(default)]
    pub coverage: BTreeMap<String, usize>,
    /// Site probabilities (%) by peptide key, then modification name
    #[serde(default)]
    pub site_probabilities: BTreeMap<String, BTreeMap<String, BTreeMap<usize, f64>>>,
}

/// Everything the validator consumes, built from an [`IdentificationFile`]
pub struct Inputs {
    pub database: ProteinDatabase,
    pub spectra: SpectrumTable,
    pub identification: Identification,
}

impl IdentificationFile {
    pub fn load<S: AsRef<std::path::Path>>(path: S) -> anyhow::Result<Self> {
        shaker_core::read_json(path).map_err(anyhow::Error::from)
    }

    pub fn build(self, settings: &Settings) -> anyhow::Result<Inputs> {
        let mut database =
            ProteinDatabase::new(&settings.decoy_tag, settings.validation.sequence_matching);
        for protein in self.proteins {
            database.add_protein(protein);
        }
        for peptide in self.peptides {
            database.add_peptide(&peptide.sequence, peptide.proteins);
        }

        let mut spectra = SpectrumTable::default();
        let mut identification = Identification::new();
        for entry in self.spectra {
            let evidence = SpectrumEvidence {
                precursor_mz: entry.precursor_mz,
                coverage: entry.coverage,
                site_probabilities: entry.site_probabilities,
            };
            spectra.insert(entry.key.clone(), evidence);
            identification
                .add_spectrum(SpectrumMatch::new(entry.key, entry.assumptions))
                .context("Invalid identification file")?;
        }

        log::info!(
            "loaded {} spectra, {} proteins",
            identification.n_spectra(),
            database.len()
        );
        Ok(Inputs {
            database,
            spectra,
            identification,
        })
    }
}

impl Input {
    pub fn from_arguments(matches: ArgMatches) -> anyhow::Result<Self> {
        let path = matches
            .get_one::<String>("parameters")
            .context("`parameters` must be set")?;
        let mut input = Input::load(path)
            .with_context(|| format!("Failed to read parameters from `{path}`"))?;

        // Handle JSON configuration overrides
        if let Some(output_directory) = matches.get_one::<String>("output_directory") {
            log::trace!("overriding `output_directory` parameter.");
            input.output_directory = Some(output_directory.into());
        }
        if let Some(identifications) = matches.get_one::<String>("identifications") {
            log::trace!("overriding `identifications` parameter.");
            input.identifications = Some(identifications.into());
        }
        if let Some(fdr) = matches.get_one::<f64>("fdr").copied() {
            log::trace!("overriding FDR parameters.");
            let validation = input.validation.get_or_insert_with(Default::default);
            validation.psm_fdr = fdr;
            validation.peptide_fdr = fdr;
            validation.protein_fdr = fdr;
        }

        ensure!(
            input.identifications.is_some(),
            "`identifications` must be set. For more information try '--help'"
        );

        Ok(input)
    }

    pub fn load<S: AsRef<str>>(path: S) -> anyhow::Result<Self> {
        shaker_core::read_json(path.as_ref()).map_err(anyhow::Error::from)
    }

    fn check_tolerance(tolerance: &Tolerance) {
        let (lo, hi) = match tolerance {
            Tolerance::Ppm(lo, hi) | Tolerance::Da(lo, hi) => (lo, hi),
        };
        if lo > hi {
            log::warn!("Precursor tolerance is empty: [{} - {}]", lo, hi);
        }
    }

    fn check_rate(name: &str, value: f64) {
        if !(0.0..=1.0).contains(&value) {
            log::warn!("`{}` should be a fraction between 0 and 1, got {}", name, value);
        } else if value > 0.1 {
            log::warn!("`{}` is higher than expected: {}", name, value);
        }
    }

    pub fn build(self) -> anyhow::Result<Settings> {
        let validation = self.validation.unwrap_or_default();

        Self::check_tolerance(&validation.precursor_tol);
        Self::check_rate("psm_fdr", validation.psm_fdr);
        Self::check_rate("peptide_fdr", validation.peptide_fdr);
        Self::check_rate("protein_fdr", validation.protein_fdr);
        Self::check_rate("flr", validation.flr);
        if validation.min_charge > validation.max_charge {
            log::warn!(
                "Minimum charge greater than maximum! No assumption will pass: [{} - {}]",
                validation.min_charge,
                validation.max_charge
            );
        }

        let identifications = self
            .identifications
            .context("'identifications' must be provided!")?;

        let output_directory = match self.output_directory {
            Some(path) => {
                let path = PathBuf::from(path);
                std::fs::create_dir_all(&path)?;
                path
            }
            None => std::env::current_dir()?,
        };

        Ok(Settings {
            version: clap::crate_version!().into(),
            validation,
            decoy_tag: self.decoy_tag.unwrap_or_else(|| "rev_".into()),
            identifications,
            output_paths: Vec::new(),
            output_directory,
        })
    }
}
