use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum PaperError {
    #[error("invalid DOI: {0}")]
    InvalidDoi(String),

    #[error("Crossref request failed: {0}")]
    CrossrefHttp(String),

    #[error("Crossref returned status {status}: {message}")]
    CrossrefStatus { status: u16, message: String },

    #[error("failed to decode Crossref response: {0}")]
    CrossrefDecode(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("malformed note {path}: expected {expected}, found {found}")]
    NoteParse {
        path: Utf8PathBuf,
        expected: &'static str,
        found: String,
    },

    #[error("no note file at {0}")]
    NoteNotFound(Utf8PathBuf),

    #[error("no paper with DOI {0} in the catalogue")]
    PaperNotFound(String),

    #[error("invalid tag value for {name}: {message}")]
    InvalidTag { name: String, message: String },

    #[error("could not locate a work with DOI {0}")]
    WorkNotFound(String),

    #[error("unable to resolve data directory for the catalogue database")]
    MissingDataDir,
}
