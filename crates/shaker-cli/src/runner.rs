use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use serde::Serialize;
use shaker_core::identification::Identification;
use shaker_core::progress::{CancellationToken, Progress};
use shaker_core::providers::{ProteinDatabase, SpectrumTable};
use shaker_core::validator::{Completion, ValidationReport, Validator};

use crate::input::{IdentificationFile, Settings};
use crate::output;

/// Progress reporting on stderr
pub struct Bar(ProgressBar);

impl Bar {
    pub fn new(visible: bool) -> Self {
        let bar = match visible {
            true => ProgressBar::new(0),
            false => ProgressBar::hidden(),
        };
        if let Ok(style) = ProgressStyle::with_template("{msg:>24} [{bar:40}] {pos}/{len}") {
            bar.set_style(style.progress_chars("=> "));
        }
        Self(bar)
    }
}

impl Progress for Bar {
    fn start(&self, label: &str, total: usize) {
        self.0.reset();
        self.0.set_length(total as u64);
        self.0.set_message(label.to_string());
        self.0.enable_steady_tick(Duration::from_millis(200));
    }

    fn inc(&self, delta: usize) {
        self.0.inc(delta as u64);
    }

    fn finish(&self) {
        self.0.finish_and_clear();
    }
}

#[derive(Serialize)]
struct Results<'a> {
    #[serde(flatten)]
    settings: &'a Settings,
    report: &'a ValidationReport,
}

pub struct Runner {
    pub settings: Settings,
    database: ProteinDatabase,
    spectra: SpectrumTable,
    identification: Identification,
    token: CancellationToken,
    start: Instant,
}

impl Runner {
    pub fn new(settings: Settings) -> anyhow::Result<Self> {
        let start = Instant::now();
        let inputs = IdentificationFile::load(&settings.identifications)
            .with_context(|| {
                format!(
                    "Failed to read identifications from `{}`",
                    settings.identifications
                )
            })?
            .build(&settings)?;
        info!(
            "- loaded inputs in {}ms",
            (Instant::now() - start).as_millis()
        );

        Ok(Self {
            settings,
            database: inputs.database,
            spectra: inputs.spectra,
            identification: inputs.identification,
            token: CancellationToken::new(),
            start,
        })
    }

    /// Token that stops the run at the next unit of work when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    fn make_path<S: AsRef<str>>(&self, file_name: S) -> PathBuf {
        self.settings.output_directory.join(file_name.as_ref())
    }

    fn write<S: AsRef<str>>(&mut self, file_name: S, bytes: Vec<u8>) -> anyhow::Result<()> {
        let path = self.make_path(file_name);
        std::fs::write(&path, bytes)
            .with_context(|| format!("Failed to write `{}`", path.display()))?;
        self.settings
            .output_paths
            .push(path.to_string_lossy().into_owned());
        Ok(())
    }

    fn write_tables(&mut self) -> anyhow::Result<()> {
        let psms = self
            .identification
            .spectra()
            .filter(|s| s.best.is_some())
            .collect::<Vec<_>>();
        let bytes = output::write_table(&output::psm_columns(), &psms)?;
        self.write("psms.tsv", bytes)?;

        let peptides = self.identification.peptides().collect::<Vec<_>>();
        let bytes = output::write_table(&output::peptide_columns(), &peptides)?;
        self.write("peptides.tsv", bytes)?;

        let proteins = self.identification.proteins().collect::<Vec<_>>();
        let bytes = output::write_table(&output::protein_columns(), &proteins)?;
        self.write("proteins.tsv", bytes)
    }

    pub fn run(mut self, show_progress: bool) -> anyhow::Result<ValidationReport> {
        let bar = Bar::new(show_progress);
        let mut validator = Validator::new(
            &self.settings.validation,
            &self.database,
            &self.spectra,
        )
        .with_progress(&bar)
        .with_cancellation(self.token.clone());

        let report = match validator.run(&mut self.identification)? {
            Completion::Finished(report) => report,
            Completion::Cancelled { stage } => bail!("validation cancelled during {}", stage),
        };

        log::trace!("writing outputs");

        self.write_tables()?;

        let path = self.make_path("results.json");
        self.settings
            .output_paths
            .push(path.to_string_lossy().into_owned());
        let results = Results {
            settings: &self.settings,
            report: &report,
        };
        println!("{}", serde_json::to_string_pretty(&self.settings)?);
        std::fs::write(&path, serde_json::to_vec_pretty(&results)?)?;

        info!("finished in {}s", (Instant::now() - self.start).as_secs());
        Ok(report)
    }
}
