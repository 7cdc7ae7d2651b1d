pub mod best_match;
pub mod distribution;
pub mod identification;
pub mod mass;
pub mod ml;
pub mod peptide;
pub mod progress;
pub mod protein_grouping;
pub mod protein_inference;
pub mod providers;
pub mod ptm;
pub mod score_map;
pub mod settings;
pub mod validation;
pub mod validator;

#[derive(Debug)]
pub enum Error {
    /// Best-hit selection could not tell candidates apart
    UnresolvedTie {
        spectrum: String,
        candidates: Vec<String>,
    },
    /// A score map was curated twice within one validation pass
    AlreadyCured(String),
    UnknownMatch(String),
    DuplicateMatch(String),
    Io(std::io::Error),
    Json(serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnresolvedTie {
                spectrum,
                candidates,
            } => write!(
                f,
                "unable to choose between {} for spectrum {}",
                candidates.join(", "),
                spectrum
            ),
            Self::AlreadyCured(map) => write!(f, "score map {} was already curated", map),
            Self::UnknownMatch(key) => write!(f, "no match with key {}", key),
            Self::DuplicateMatch(key) => write!(f, "duplicate match key {}", key),
            Self::Io(e) => e.fmt(f),
            Self::Json(e) => e.fmt(f),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Json(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e)
    }
}

pub fn read_json<S, T>(path: S) -> Result<T>
where
    S: AsRef<std::path::Path>,
    T: for<'de> serde::Deserialize<'de>,
{
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}
