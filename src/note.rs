use std::fs;
use std::io::Write;
use std::iter::Peekable;
use std::str::Lines;

use camino::{Utf8Path, Utf8PathBuf};
use serde_yaml::Mapping;

use crate::domain::{Citation, Doi};
use crate::error::PaperError;

/// One paper's note file: YAML front matter, a title heading, an optional
/// Abstract section, a Notes section (user territory), and a References
/// section of verbatim bullet lines (each including its `- ` marker).
#[derive(Debug, Clone, PartialEq)]
pub struct Note {
    pub path: Utf8PathBuf,
    pub meta: Mapping,
    pub title: String,
    pub abstract_text: Option<String>,
    pub notes: String,
    pub references: Vec<String>,
}

impl Note {
    /// Regeneration policy: the existing document's notes always win, and
    /// its metadata is the base mapping with freshly computed keys overlaid.
    /// Keys the generator does not own survive verbatim.
    pub fn merge_existing(&mut self, existing: Note) {
        self.notes = existing.notes;
        let mut merged = existing.meta;
        for (key, value) in std::mem::take(&mut self.meta) {
            merged.insert(key, value);
        }
        self.meta = merged;
    }
}

/// Deterministic note location: `<paper_dir>/<namespace>/<safe remainder>.md`.
pub fn note_path(paper_dir: &Utf8Path, doi: &Doi) -> Utf8PathBuf {
    let (namespace, stem) = doi.path_parts();
    paper_dir.join(namespace).join(format!("{stem}.md"))
}

/// Read and parse the note at `path`. A missing file is `None`; a malformed
/// file is an error, never a fabricated document.
pub fn read_note(path: &Utf8Path) -> Result<Option<Note>, PaperError> {
    if !path.as_std_path().exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path.as_std_path())
        .map_err(|err| PaperError::Filesystem(format!("read {path}: {err}")))?;
    parse_note(path, &content).map(Some)
}

/// Serialize and write atomically (temp file in the target directory, then
/// persist over the destination).
pub fn write_note(note: &Note) -> Result<(), PaperError> {
    let parent = note
        .path
        .parent()
        .ok_or_else(|| PaperError::Filesystem("invalid note path".to_string()))?;
    fs::create_dir_all(parent.as_std_path())
        .map_err(|err| PaperError::Filesystem(err.to_string()))?;
    let mut temp = tempfile::Builder::new()
        .prefix(".paperstack-note")
        .tempfile_in(parent.as_std_path())
        .map_err(|err| PaperError::Filesystem(err.to_string()))?;
    temp.write_all(render_note(note).as_bytes())
        .map_err(|err| PaperError::Filesystem(err.to_string()))?;
    if note.path.as_std_path().exists() {
        fs::remove_file(note.path.as_std_path())
            .map_err(|err| PaperError::Filesystem(err.to_string()))?;
    }
    temp.persist(note.path.as_std_path())
        .map_err(|err| PaperError::Filesystem(err.to_string()))?;
    Ok(())
}

pub fn render_note(note: &Note) -> String {
    let mut out = String::new();
    if !note.meta.is_empty() {
        out.push_str("---\n");
        out.push_str(&serde_yaml::to_string(&note.meta).unwrap_or_default());
        out.push_str("---\n\n");
    }
    out.push_str("# ");
    out.push_str(&note.title);
    out.push('\n');

    if let Some(abstract_text) = &note.abstract_text {
        out.push_str("\n## Abstract\n\n");
        if !abstract_text.is_empty() {
            out.push_str(abstract_text);
            out.push('\n');
        }
    }

    out.push_str("\n## Notes\n\n");
    if !note.notes.is_empty() {
        out.push_str(&note.notes);
        out.push('\n');
    }

    out.push_str("\n## References\n\n");
    for reference in &note.references {
        if !reference.starts_with("- ") {
            out.push_str("- ");
        }
        out.push_str(reference);
        out.push('\n');
    }
    out
}

/// Reference bullet lines for a citation list, one `- ` entry per citation.
pub fn build_refs(citations: &[Citation]) -> Vec<String> {
    citations
        .iter()
        .map(|cite| {
            let mut line = String::from("- ");
            match &cite.title {
                Some(title) => line.push_str(title),
                None => line.push_str("(untitled)"),
            }
            if let Some(author) = &cite.author {
                line.push_str(", ");
                line.push_str(author);
            }
            match (&cite.journal, cite.year) {
                (Some(journal), Some(year)) => line.push_str(&format!(" ({journal} {year})")),
                (Some(journal), None) => line.push_str(&format!(" ({journal})")),
                (None, Some(year)) => line.push_str(&format!(" ({year})")),
                (None, None) => {}
            }
            if let Some(doi) = &cite.doi {
                line.push_str(&format!(" [doi:{doi}]"));
            }
            line
        })
        .collect()
}

/// Strictly ordered line parser: front matter, title, optional abstract,
/// Notes, References. Each stage consumes a prefix of the remaining lines.
pub fn parse_note(path: &Utf8Path, content: &str) -> Result<Note, PaperError> {
    let mut parser = Parser {
        path,
        lines: content.lines().peekable(),
    };
    let meta = parser.parse_meta()?;
    let title = parser.parse_title()?;
    let abstract_text = parser.parse_abstract();
    let notes = parser.parse_notes()?;
    let references = parser.parse_references()?;
    Ok(Note {
        path: path.to_path_buf(),
        meta,
        title,
        abstract_text,
        notes,
        references,
    })
}

struct Parser<'a> {
    path: &'a Utf8Path,
    lines: Peekable<Lines<'a>>,
}

impl<'a> Parser<'a> {
    fn error(&self, expected: &'static str) -> PaperError {
        PaperError::NoteParse {
            path: self.path.to_path_buf(),
            expected,
            found: self
                .lines
                .clone()
                .next()
                .map(str::to_string)
                .unwrap_or_else(|| "end of file".to_string()),
        }
    }

    fn take_while(&mut self, pred: impl Fn(&str) -> bool) -> Vec<&'a str> {
        let mut taken = Vec::new();
        while let Some(line) = self.lines.peek() {
            if !pred(line) {
                break;
            }
            taken.push(*line);
            self.lines.next();
        }
        taken
    }

    fn skip_blank(&mut self) {
        self.take_while(|line| line.trim().is_empty());
    }

    fn parse_meta(&mut self) -> Result<Mapping, PaperError> {
        if !self.lines.peek().is_some_and(|line| line.starts_with("---")) {
            return Ok(Mapping::new());
        }
        self.lines.next();
        let body = self.take_while(|line| !line.starts_with("---"));
        if self.lines.next().is_none() {
            return Err(self.error("closing front matter delimiter"));
        }
        if body.iter().all(|line| line.trim().is_empty()) {
            return Ok(Mapping::new());
        }
        serde_yaml::from_str(&body.join("\n")).map_err(|err| PaperError::NoteParse {
            path: self.path.to_path_buf(),
            expected: "front matter mapping",
            found: err.to_string(),
        })
    }

    fn parse_title(&mut self) -> Result<String, PaperError> {
        self.skip_blank();
        let title = self
            .lines
            .peek()
            .and_then(|line| line.trim().strip_prefix("# "))
            .map(|rest| rest.trim().to_string());
        match title {
            Some(title) => {
                self.lines.next();
                Ok(title)
            }
            None => Err(self.error("title heading")),
        }
    }

    fn parse_abstract(&mut self) -> Option<String> {
        self.skip_blank();
        if !self
            .lines
            .peek()
            .is_some_and(|line| line.trim().starts_with("## Abstract"))
        {
            return None;
        }
        self.lines.next();
        let body = self.take_while(|line| !line.trim().starts_with("## "));
        Some(body.join("\n").trim().to_string())
    }

    fn parse_notes(&mut self) -> Result<String, PaperError> {
        self.skip_blank();
        if !self
            .lines
            .peek()
            .is_some_and(|line| line.trim().starts_with("## Notes"))
        {
            return Err(self.error("Notes heading"));
        }
        self.lines.next();
        let body = self.take_while(|line| !line.trim().starts_with("## "));
        Ok(body.join("\n").trim().to_string())
    }

    fn parse_references(&mut self) -> Result<Vec<String>, PaperError> {
        self.skip_blank();
        if !self
            .lines
            .peek()
            .is_some_and(|line| line.trim().starts_with("## References"))
        {
            return Err(self.error("References heading"));
        }
        self.lines.next();
        self.skip_blank();
        let bullets = self.take_while(|line| line.trim().starts_with("- "));
        Ok(bullets.into_iter().map(str::to_string).collect())
    }
}
