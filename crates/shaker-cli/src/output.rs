//! Tabular export. Every table is a list of named columns, each computing its
//! field from the public accessors of one match type.

use std::borrow::Cow;
use std::collections::BTreeMap;

use rayon::prelude::*;
use shaker_core::identification::{PeptideMatch, ProteinMatch, SpectrumMatch};
use shaker_core::ptm::PtmScoring;
use shaker_core::validation::ValidationParameter;

pub enum Value<'a> {
    Str(Cow<'a, str>),
    Int(usize),
    Float(f64),
    Bool(bool),
}

impl<'a> Value<'a> {
    fn push(&self, record: &mut csv::ByteRecord) {
        match self {
            Value::Str(s) => record.push_field(s.as_bytes()),
            Value::Int(n) => record.push_field(itoa::Buffer::new().format(*n).as_bytes()),
            Value::Float(x) => record.push_field(ryu::Buffer::new().format(*x).as_bytes()),
            Value::Bool(b) => record.push_field(if *b { b"1" } else { b"0" }),
        }
    }
}

impl<'a> From<&'a str> for Value<'a> {
    fn from(s: &'a str) -> Self {
        Value::Str(Cow::Borrowed(s))
    }
}

impl From<String> for Value<'_> {
    fn from(s: String) -> Self {
        Value::Str(Cow::Owned(s))
    }
}

pub struct Column<T> {
    pub name: &'static str,
    pub value: fn(&T) -> Value<'_>,
}

impl<T> Column<T> {
    pub const fn new(name: &'static str, value: fn(&T) -> Value<'_>) -> Self {
        Self { name, value }
    }
}

/// Render site confidences as `Phospho(3:confident;5:random)`
pub fn localization(ptm: &BTreeMap<String, PtmScoring>) -> String {
    ptm.iter()
        .map(|(name, scoring)| {
            let sites = scoring
                .levels
                .iter()
                .map(|(site, level)| format!("{}:{}", site, level.as_str()))
                .collect::<Vec<_>>()
                .join(";");
            format!("{}({})", name, sites)
        })
        .collect::<Vec<_>>()
        .join(",")
}

/// Columns shared by every level, in order
macro_rules! validation_columns {
    ($t:ty) => {
        [
            Column::<$t>::new("score", |m| Value::Float(validation(m).score)),
            Column::<$t>::new("pep", |m| Value::Float(validation(m).pep)),
            Column::<$t>::new("confidence", |m| Value::Float(validation(m).confidence)),
            Column::<$t>::new("validation", |m| validation(m).level.as_str().into()),
            Column::<$t>::new("manual", |m| Value::Bool(validation(m).manual)),
            Column::<$t>::new("group", |m| validation(m).group.to_string().into()),
        ]
    };
}

trait Validated {
    fn validation(&self) -> &ValidationParameter;
}

impl Validated for SpectrumMatch {
    fn validation(&self) -> &ValidationParameter {
        &self.validation
    }
}

impl Validated for PeptideMatch {
    fn validation(&self) -> &ValidationParameter {
        &self.validation
    }
}

impl Validated for ProteinMatch {
    fn validation(&self) -> &ValidationParameter {
        &self.validation
    }
}

fn validation<T: Validated>(m: &T) -> &ValidationParameter {
    m.validation()
}

pub fn psm_columns() -> Vec<Column<SpectrumMatch>> {
    let col = Column::<SpectrumMatch>::new;
    let mut columns = vec![
        col("spectrum", |s| s.key.as_str().into()),
        col("peptide", |s| {
            s.best
                .as_ref()
                .map(|b| b.peptide.key())
                .unwrap_or_default()
                .into()
        }),
        col("charge", |s| {
            Value::Int(s.best.as_ref().map(|b| b.charge as usize).unwrap_or(0))
        }),
        col("engines", |s| {
            s.best
                .as_ref()
                .map(|b| b.engines.join(";"))
                .unwrap_or_default()
                .into()
        }),
        col("label", |s| Value::Int(if s.is_decoy() { 0 } else { 1 })),
        col("combined_pep", |s| Value::Float(s.validation.combined_pep)),
        col("engine_pep", |s| Value::Float(s.validation.engine_pep)),
        col("delta_pep", |s| Value::Float(s.validation.delta_pep)),
    ];
    columns.extend(validation_columns!(SpectrumMatch));
    columns.push(col("localization", |s| localization(&s.ptm).into()));
    columns
}

pub fn peptide_columns() -> Vec<Column<PeptideMatch>> {
    let col = Column::<PeptideMatch>::new;
    let mut columns = vec![
        col("peptide", |p| p.key.as_str().into()),
        col("sequence", |p| p.peptide.sequence.as_str().into()),
        col("proteins", |p| p.proteins.join(";").into()),
        col("num_spectra", |p| Value::Int(p.spectra.len())),
        col("label", |p| Value::Int(if p.decoy { 0 } else { 1 })),
        col("inference", |p| p.validation.inference.as_str().into()),
        col("unique", |p| Value::Bool(p.validation.unique)),
    ];
    columns.extend(validation_columns!(PeptideMatch));
    columns.push(col("localization", |p| localization(&p.ptm).into()));
    columns
}

pub fn protein_columns() -> Vec<Column<ProteinMatch>> {
    let col = Column::<ProteinMatch>::new;
    let mut columns = vec![
        col("protein_group", |p| p.key.to_string().into()),
        col("num_proteins", |p| Value::Int(p.key.len())),
        col("num_peptides", |p| Value::Int(p.peptides.len())),
        col("confident_peptides", |p| Value::Int(p.n_confident_peptides)),
        col("doubtful_peptides", |p| Value::Int(p.n_doubtful_peptides)),
        col("validated_spectra", |p| Value::Int(p.n_validated_spectra)),
        col("label", |p| Value::Int(if p.decoy { 0 } else { 1 })),
        col("shared", |p| Value::Bool(p.shared)),
    ];
    columns.extend(validation_columns!(ProteinMatch));
    columns.push(col("localization", |p| localization(&p.ptm).into()));
    columns
}

/// Serialize `rows` as a tab-separated table
pub fn write_table<T: Sync>(columns: &[Column<T>], rows: &[&T]) -> anyhow::Result<Vec<u8>> {
    let mut wtr = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(vec![]);

    let headers = csv::ByteRecord::from(columns.iter().map(|c| c.name).collect::<Vec<_>>());
    wtr.write_byte_record(&headers)?;

    let records = rows
        .par_iter()
        .map(|row| {
            let mut record = csv::ByteRecord::new();
            for column in columns {
                (column.value)(row).push(&mut record);
            }
            record
        })
        .collect::<Vec<_>>();

    for record in records {
        wtr.write_byte_record(&record)?;
    }
    wtr.flush()?;
    Ok(wtr.into_inner()?)
}

#[cfg(test)]
mod test {
    use super::*;
    use shaker_core::ptm::PtmConfidence;
    use shaker_core::validation::ValidationLevel;

    #[test]
    fn psm_table() -> anyhow::Result<()> {
        let mut psm = SpectrumMatch::new("scan=1", Vec::new());
        psm.validation = ValidationParameter::default()
            .with_pep(0.25)
            .with_level(ValidationLevel::Doubtful);
        let mut scoring = PtmScoring::default();
        scoring.levels.insert(3, PtmConfidence::Confident);
        scoring.levels.insert(5, PtmConfidence::Random);
        psm.ptm.insert("Phospho".into(), scoring);

        let columns = psm_columns();
        let bytes = write_table(&columns, &[&psm])?;
        let text = String::from_utf8(bytes)?;
        let mut lines = text.lines();

        let header = lines.next().unwrap().split('\t').collect::<Vec<_>>();
        let row = lines.next().unwrap().split('\t').collect::<Vec<_>>();
        assert_eq!(header.len(), columns.len());
        assert_eq!(row.len(), columns.len());

        let field = |name: &str| {
            let ix = header.iter().position(|h| *h == name).unwrap();
            row[ix]
        };
        assert_eq!(field("spectrum"), "scan=1");
        assert_eq!(field("pep"), "0.25");
        assert_eq!(field("confidence"), "75.0");
        assert_eq!(field("validation"), ValidationLevel::Doubtful.as_str());
        assert_eq!(
            field("localization"),
            format!(
                "Phospho(3:{};5:{})",
                PtmConfidence::Confident.as_str(),
                PtmConfidence::Random.as_str()
            )
        );
        Ok(())
    }
}
