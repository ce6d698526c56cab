use std::sync::Mutex;

use camino::{Utf8Path, Utf8PathBuf};
use directories::BaseDirs;
use rusqlite::{Connection, OptionalExtension, params};

use crate::cache::ResponseCache;
use crate::domain::{AuthorOfPaper, CachedResponse, Citation, Doi, Paper};
use crate::error::PaperError;

/// SQLite-backed catalogue store. The connection is owned here and guarded by
/// a mutex so the store can be shared by reference across enrichment workers;
/// there is no ambient global pool.
pub struct Database {
    conn: Mutex<Connection>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PaperSummary {
    pub doi: String,
    pub title: String,
    pub conference: Option<String>,
    pub year: Option<i64>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AuthorMatch {
    pub author_id: i64,
    pub name: String,
    pub papers: Vec<(String, Option<i64>)>,
}

impl Database {
    /// Open (and migrate) the catalogue database in the XDG data directory.
    pub fn open_default() -> Result<Self, PaperError> {
        let dirs = BaseDirs::new().ok_or(PaperError::MissingDataDir)?;
        let dir = dirs.data_dir().join("paperstack");
        std::fs::create_dir_all(&dir).map_err(|err| PaperError::Filesystem(err.to_string()))?;
        let path = Utf8PathBuf::from_path_buf(dir.join("paperstack.db"))
            .map_err(|_| PaperError::Filesystem("non-utf8 data directory".to_string()))?;
        Self::open(&path)
    }

    pub fn open(path: &Utf8Path) -> Result<Self, PaperError> {
        let conn = Connection::open(path.as_std_path())?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, PaperError> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.migrate()?;
        Ok(db)
    }

    fn migrate(&self) -> Result<(), PaperError> {
        let conn = self.conn.lock().unwrap();
        let existing: Option<String> = conn
            .query_row(
                "SELECT name FROM sqlite_master WHERE type='table' AND name='settings'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_none() {
            conn.execute_batch(SCHEMA)?;
            tracing::info!("created catalogue schema");
        }
        Ok(())
    }

    /// Insert a paper, returning whether a new row was created. Re-adding an
    /// existing DOI is a no-op.
    pub fn add_paper(&self, paper: &Paper) -> Result<bool, PaperError> {
        let conn = self.conn.lock().unwrap();
        let inserted: Option<String> = conn
            .query_row(
                "INSERT OR IGNORE INTO papers (doi, title, conference, year, abstract, url) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6) RETURNING doi",
                params![
                    paper.doi.as_str(),
                    paper.title,
                    paper.conference,
                    paper.year,
                    paper.abstract_text,
                    paper.url,
                ],
                |row| row.get(0),
            )
            .optional()?;
        Ok(inserted.is_some())
    }

    pub fn get_paper(&self, doi: &Doi) -> Result<Option<Paper>, PaperError> {
        let conn = self.conn.lock().unwrap();
        let paper = conn
            .query_row(
                "SELECT title, conference, year, abstract, url FROM papers WHERE doi = ?1",
                params![doi.as_str()],
                |row| {
                    Ok(Paper {
                        doi: doi.clone(),
                        title: row.get(0)?,
                        conference: row.get(1)?,
                        year: row.get(2)?,
                        abstract_text: row.get(3)?,
                        url: row.get(4)?,
                    })
                },
            )
            .optional()?;
        Ok(paper)
    }

    /// Attach authors to a paper in order. Authors with an ORCID are
    /// insert-or-get on that identity; authors without one are matched
    /// case-insensitively by name before a new row is created.
    pub fn add_authors(&self, doi: &Doi, authors: &[AuthorOfPaper]) -> Result<(), PaperError> {
        let conn = self.conn.lock().unwrap();
        for (idx, author) in authors.iter().enumerate() {
            let author_id = match author.id {
                Some(id) => id,
                None => resolve_author_id(&conn, author)?,
            };
            conn.execute(
                "INSERT OR IGNORE INTO paper_authors (doi, author_id, idx, affiliation) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![doi.as_str(), author_id, idx as i64, author.affiliation],
            )?;
        }
        Ok(())
    }

    pub fn get_authors(&self, doi: &Doi) -> Result<Vec<AuthorOfPaper>, PaperError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT authors.id, authors.orcid, authors.name, paper_authors.affiliation \
             FROM authors JOIN paper_authors ON authors.id = paper_authors.author_id \
             WHERE paper_authors.doi = ?1 ORDER BY paper_authors.idx",
        )?;
        let rows = stmt.query_map(params![doi.as_str()], |row| {
            Ok(AuthorOfPaper {
                id: row.get(0)?,
                orcid: row.get(1)?,
                name: row.get(2)?,
                affiliation: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn add_citations(&self, doi: &Doi, citations: &[Citation]) -> Result<(), PaperError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "INSERT INTO cites (source_doi, title, journal, doi, year, author) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )?;
        for cite in citations {
            stmt.execute(params![
                doi.as_str(),
                cite.title,
                cite.journal,
                cite.doi,
                cite.year,
                cite.author,
            ])?;
        }
        Ok(())
    }

    pub fn get_citations(&self, doi: &Doi) -> Result<Vec<Citation>, PaperError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT title, journal, doi, year, author FROM cites \
             WHERE source_doi = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map(params![doi.as_str()], |row| {
            Ok(Citation {
                title: row.get(0)?,
                journal: row.get(1)?,
                doi: row.get(2)?,
                year: row.get(3)?,
                author: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn list_papers(&self) -> Result<Vec<PaperSummary>, PaperError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT doi, title, conference, year FROM papers ORDER BY doi")?;
        let rows = stmt.query_map([], |row| {
            Ok(PaperSummary {
                doi: row.get(0)?,
                title: row.get(1)?,
                conference: row.get(2)?,
                year: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Remove a paper and its joins. The note file is left on disk.
    pub fn remove_paper(&self, doi: &Doi) -> Result<(), PaperError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM paper_authors WHERE doi = ?1",
            params![doi.as_str()],
        )?;
        conn.execute("DELETE FROM tags WHERE doi = ?1", params![doi.as_str()])?;
        conn.execute(
            "DELETE FROM cites WHERE source_doi = ?1",
            params![doi.as_str()],
        )?;
        conn.execute("DELETE FROM papers WHERE doi = ?1", params![doi.as_str()])?;
        Ok(())
    }

    pub fn update_paper_from_note(
        &self,
        doi: &Doi,
        title: &str,
        conference: Option<&str>,
        year: Option<i64>,
        abstract_text: Option<&str>,
        url: Option<&str>,
    ) -> Result<(), PaperError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE papers SET title = ?1, conference = ?2, year = ?3, abstract = ?4, url = ?5 \
             WHERE doi = ?6",
            params![title, conference, year, abstract_text, url, doi.as_str()],
        )?;
        Ok(())
    }

    pub fn tags(&self, doi: &Doi) -> Result<Vec<(String, String)>, PaperError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT name, value FROM tags WHERE doi = ?1 ORDER BY name")?;
        let rows = stmt.query_map(params![doi.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Replace a paper's tag rows wholesale; `values` are JSON-encoded.
    pub fn replace_tags(&self, doi: &Doi, tags: &[(String, String)]) -> Result<(), PaperError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM tags WHERE doi = ?1", params![doi.as_str()])?;
        let mut stmt =
            conn.prepare("INSERT OR REPLACE INTO tags (doi, name, value) VALUES (?1, ?2, ?3)")?;
        for (name, value) in tags {
            stmt.execute(params![doi.as_str(), name, value])?;
        }
        Ok(())
    }

    /// Case-insensitive author lookup, grouped per author row and ranked by
    /// how many catalogued papers each candidate has.
    pub fn similar_authors(&self, name: &str) -> Result<Vec<AuthorMatch>, PaperError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT authors.id, authors.name, papers.title, papers.year \
             FROM authors \
             JOIN paper_authors ON paper_authors.author_id = authors.id \
             JOIN papers ON paper_authors.doi = papers.doi \
             WHERE authors.name = ?1 COLLATE NOCASE \
             ORDER BY authors.id, papers.year DESC",
        )?;
        let rows = stmt.query_map(params![name], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, Option<i64>>(3)?,
            ))
        })?;

        let mut matches: Vec<AuthorMatch> = Vec::new();
        for row in rows {
            let (id, name, title, year) = row?;
            match matches.last_mut() {
                Some(last) if last.author_id == id => last.papers.push((title, year)),
                _ => matches.push(AuthorMatch {
                    author_id: id,
                    name,
                    papers: vec![(title, year)],
                }),
            }
        }
        matches.sort_by(|a, b| b.papers.len().cmp(&a.papers.len()));
        Ok(matches)
    }

    pub fn paper_dir(&self) -> Result<Utf8PathBuf, PaperError> {
        let folder: String = {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                "SELECT folder FROM settings ORDER BY schema_version DESC LIMIT 1",
                [],
                |row| row.get(0),
            )?
        };
        if let Some(rest) = folder.strip_prefix("~/") {
            let dirs = BaseDirs::new().ok_or(PaperError::MissingDataDir)?;
            return Utf8PathBuf::from_path_buf(dirs.home_dir().join(rest))
                .map_err(|_| PaperError::Filesystem("non-utf8 home directory".to_string()));
        }
        Ok(Utf8PathBuf::from(folder))
    }

    pub fn set_paper_dir(&self, folder: &str) -> Result<(), PaperError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("UPDATE settings SET folder = ?1", params![folder])?;
        Ok(())
    }

    pub fn cached_response(
        &self,
        key: &str,
        max_age: Option<i64>,
    ) -> Result<Option<CachedResponse>, PaperError> {
        fn map(row: &rusqlite::Row<'_>) -> rusqlite::Result<CachedResponse> {
            Ok(CachedResponse {
                key: row.get(0)?,
                extra: row.get(1)?,
                time: row.get(2)?,
                response: row.get(3)?,
            })
        }
        let conn = self.conn.lock().unwrap();
        let entry = match max_age {
            Some(max_age) => conn
                .query_row(
                    "SELECT id, extra, time, response FROM query_cache \
                     WHERE id = ?1 AND time > ?2",
                    params![key, chrono::Utc::now().timestamp() - max_age],
                    map,
                )
                .optional()?,
            None => conn
                .query_row(
                    "SELECT id, extra, time, response FROM query_cache WHERE id = ?1",
                    params![key],
                    map,
                )
                .optional()?,
        };
        Ok(entry)
    }

    pub fn cache_response(&self, key: &str, payload: &str) -> Result<(), PaperError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO query_cache (id, extra, time, response) \
             VALUES (?1, NULL, ?2, ?3)",
            params![key, chrono::Utc::now().timestamp(), payload],
        )?;
        Ok(())
    }

    pub fn purge_cached_response(&self, key: &str) -> Result<(), PaperError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM query_cache WHERE id = ?1", params![key])?;
        Ok(())
    }
}

impl ResponseCache for Database {
    fn get(&self, key: &str) -> Result<Option<CachedResponse>, PaperError> {
        self.cached_response(key, None)
    }

    fn put(&self, key: &str, payload: &str) -> Result<(), PaperError> {
        self.cache_response(key, payload)
    }

    fn purge(&self, key: &str) -> Result<(), PaperError> {
        self.purge_cached_response(key)
    }
}

fn resolve_author_id(conn: &Connection, author: &AuthorOfPaper) -> Result<i64, PaperError> {
    if author.orcid.is_none() {
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM authors WHERE orcid IS NULL AND name = ?1 COLLATE NOCASE LIMIT 1",
                params![author.name],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Ok(id);
        }
    }
    let inserted: Option<i64> = conn
        .query_row(
            "INSERT OR IGNORE INTO authors (orcid, name) VALUES (?1, ?2) RETURNING id",
            params![author.orcid, author.name],
            |row| row.get(0),
        )
        .optional()?;
    match inserted {
        Some(id) => Ok(id),
        // insert was ignored, the orcid row already exists
        None => Ok(conn.query_row(
            "SELECT id FROM authors WHERE orcid = ?1 LIMIT 1",
            params![author.orcid],
            |row| row.get(0),
        )?),
    }
}

const SCHEMA: &str = r#"
CREATE TABLE papers (
    doi char(32) primary key not null,
    title text not null,
    conference text,
    year integer,
    abstract text,
    url text
);

CREATE INDEX paper_doi ON papers(doi);

CREATE TABLE settings (
    schema_version integer not null,
    folder text not null
);

INSERT INTO settings (schema_version, folder) VALUES (1, '~/papers');

CREATE TABLE tags (
    doi char(32) not null,
    name text not null,
    value text not null,
    UNIQUE(doi, name)
);

CREATE INDEX tags_doi ON tags(doi);

CREATE TABLE authors (
    id integer primary key autoincrement not null,
    orcid char(32),
    name text not null,
    UNIQUE(orcid)
);

CREATE INDEX authors_orcid ON authors(orcid);

CREATE TABLE paper_authors (
    doi char(32) not null,
    author_id integer not null,
    idx integer not null,
    affiliation text,
    UNIQUE(doi, author_id)
);

CREATE INDEX paper_authors_doi ON paper_authors(doi);

CREATE TABLE cites (
    source_doi char(32),
    title text,
    journal text,
    doi text,
    year integer,
    author text
);

CREATE INDEX cites_source_doi ON cites(source_doi);
CREATE INDEX cites_doi ON cites(doi);

CREATE TABLE query_cache (
    id text primary key not null,
    time integer not null,
    extra text,
    response text
);
"#;
