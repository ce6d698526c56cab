use std::sync::Arc;

use camino::Utf8PathBuf;
use serde::Serialize;
use serde_yaml::{Mapping, Value};
use tracing::info;

use crate::api::{CitationProgress, PaperProvider};
use crate::db::{AuthorMatch, Database, PaperSummary};
use crate::domain::{AuthorOfPaper, Doi, Paper};
use crate::error::PaperError;
use crate::note::{self, Note};

/// Metadata keys the note generator owns. Everything else in the front
/// matter is user territory and round-trips through the tags table.
const SPECIAL_META_KEYS: [&str; 5] = ["aliases", "authors", "conference", "year", "url"];

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

#[derive(Debug, Clone, Serialize)]
pub struct AddOutcome {
    pub doi: String,
    pub title: String,
    pub inserted: bool,
    pub note_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub doi: String,
    pub title: String,
    pub tags: Vec<(String, String)>,
}

pub struct App<P: PaperProvider> {
    db: Arc<Database>,
    provider: P,
}

impl<P: PaperProvider> App<P> {
    pub fn new(db: Arc<Database>, provider: P) -> Self {
        Self { db, provider }
    }

    /// Fetch a paper, persist it with its authors and enriched citations,
    /// and generate (or refresh) its note file. Re-adding an existing DOI
    /// only regenerates the note.
    pub fn add(
        &self,
        doi: &Doi,
        sink: &dyn ProgressSink,
        progress: &dyn CitationProgress,
    ) -> Result<AddOutcome, PaperError> {
        sink.event(ProgressEvent {
            message: format!("fetching {doi}..."),
        });
        let paper = self
            .provider
            .paper_by_doi(doi)?
            .ok_or_else(|| PaperError::WorkNotFound(doi.to_string()))?;
        sink.event(ProgressEvent {
            message: format!(
                "found it on {}, title \"{}\"",
                self.provider.name(),
                paper.title
            ),
        });

        let inserted = self.db.add_paper(&paper)?;
        if inserted {
            self.db
                .add_authors(doi, &self.provider.authors_of_paper(doi)?)?;
            sink.event(ProgressEvent {
                message: "fetching citations...".to_string(),
            });
            let citations = self.provider.citations_by_doi(doi, progress)?;
            self.db.add_citations(doi, &citations)?;
        } else {
            sink.event(ProgressEvent {
                message: "existing paper, keeping stored authors and citations".to_string(),
            });
        }

        let note_path = self.generate_note(doi, sink)?;
        Ok(AddOutcome {
            doi: doi.to_string(),
            title: paper.title,
            inserted,
            note_path: note_path.to_string(),
        })
    }

    /// Regenerate the note file from the database. An existing file's notes
    /// and unowned metadata keys are carried over, never clobbered.
    pub fn generate_note(
        &self,
        doi: &Doi,
        sink: &dyn ProgressSink,
    ) -> Result<Utf8PathBuf, PaperError> {
        let paper = self
            .db
            .get_paper(doi)?
            .ok_or_else(|| PaperError::PaperNotFound(doi.to_string()))?;
        let authors = self.db.get_authors(doi)?;
        let citations = self.db.get_citations(doi)?;
        let tags = self.db.tags(doi)?;

        let path = note::note_path(&self.db.paper_dir()?, doi);
        let mut fresh = Note {
            path: path.clone(),
            meta: build_note_meta(&paper, &authors, &tags)?,
            title: paper.title.clone(),
            abstract_text: paper.abstract_text.clone(),
            notes: String::new(),
            references: note::build_refs(&citations),
        };

        if let Some(existing) = note::read_note(&path)? {
            sink.event(ProgressEvent {
                message: "loading notes and metadata from existing file...".to_string(),
            });
            fresh.merge_existing(existing);
        }

        note::write_note(&fresh)?;
        info!(doi = %doi, path = %path, "generated note");
        Ok(path)
    }

    /// Read the note file back into the database: title, conference, year,
    /// abstract and url update the paper row; non-special metadata keys
    /// replace the paper's tags.
    pub fn sync_note(&self, doi: &Doi) -> Result<SyncOutcome, PaperError> {
        let path = note::note_path(&self.db.paper_dir()?, doi);
        let doc = note::read_note(&path)?.ok_or(PaperError::NoteNotFound(path))?;
        if self.db.get_paper(doi)?.is_none() {
            return Err(PaperError::PaperNotFound(doi.to_string()));
        }

        self.db.update_paper_from_note(
            doi,
            &doc.title,
            doc.meta.get("conference").and_then(Value::as_str),
            doc.meta.get("year").and_then(Value::as_i64),
            doc.abstract_text.as_deref(),
            doc.meta.get("url").and_then(Value::as_str),
        )?;

        let mut tags = Vec::new();
        for (key, value) in &doc.meta {
            let Some(key) = key.as_str() else {
                continue;
            };
            if SPECIAL_META_KEYS.contains(&key) {
                continue;
            }
            let encoded =
                serde_json::to_string(value).map_err(|err| PaperError::InvalidTag {
                    name: key.to_string(),
                    message: err.to_string(),
                })?;
            tags.push((key.to_string(), encoded));
        }
        self.db.replace_tags(doi, &tags)?;

        Ok(SyncOutcome {
            doi: doi.to_string(),
            title: doc.title,
            tags,
        })
    }

    /// Drop the paper and its joins from the database. The note file stays.
    pub fn remove(&self, doi: &Doi) -> Result<(), PaperError> {
        self.db.remove_paper(doi)
    }

    pub fn list(&self) -> Result<Vec<PaperSummary>, PaperError> {
        self.db.list_papers()
    }

    /// Ranked candidates for an author name. Which candidate to bind is the
    /// caller's decision (interactive prompt, auto-accept, ...).
    pub fn find_author_candidates(&self, name: &str) -> Result<Vec<AuthorMatch>, PaperError> {
        self.db.similar_authors(name)
    }

    /// Forget the cached registry response for one identifier so the next
    /// add refetches it. This is the only retry path after a cached miss.
    pub fn purge_cache(&self, doi: &Doi) -> Result<(), PaperError> {
        self.db
            .purge_cached_response(&format!("{}+{}", self.provider.name(), doi.as_str()))
    }

    pub fn set_paper_dir(&self, folder: &str) -> Result<(), PaperError> {
        self.db.set_paper_dir(folder)
    }

    pub fn paper_dir(&self) -> Result<Utf8PathBuf, PaperError> {
        self.db.paper_dir()
    }
}

fn build_note_meta(
    paper: &Paper,
    authors: &[AuthorOfPaper],
    tags: &[(String, String)],
) -> Result<Mapping, PaperError> {
    let mut meta = Mapping::new();
    meta.insert(
        Value::String("aliases".to_string()),
        Value::Sequence(vec![Value::String(paper.title.clone())]),
    );
    meta.insert(
        Value::String("year".to_string()),
        paper.year.map(Into::into).unwrap_or(Value::Null),
    );
    meta.insert(
        Value::String("conference".to_string()),
        paper
            .conference
            .clone()
            .map(Value::String)
            .unwrap_or(Value::Null),
    );
    meta.insert(
        Value::String("authors".to_string()),
        Value::Sequence(
            authors
                .iter()
                .map(|author| Value::String(author.name.clone()))
                .collect(),
        ),
    );
    meta.insert(
        Value::String("url".to_string()),
        paper.url.clone().map(Value::String).unwrap_or(Value::Null),
    );
    for (name, encoded) in tags {
        // tag values are stored as JSON, which parses as YAML
        let value: Value =
            serde_yaml::from_str(encoded).map_err(|err| PaperError::InvalidTag {
                name: name.clone(),
                message: err.to_string(),
            })?;
        meta.insert(Value::String(name.clone()), value);
    }
    Ok(meta)
}
