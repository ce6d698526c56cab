use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::PaperError;

/// A DOI in canonical (upper-cased) form, e.g. `10.1145/3578360.3580261`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Doi(String);

fn namespace_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^10\.\d+$").unwrap())
}

impl Doi {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Registration agency prefix, everything before the first slash.
    pub fn namespace(&self) -> &str {
        self.0.split_once('/').map(|(ns, _)| ns).unwrap_or(&self.0)
    }

    pub fn remainder(&self) -> &str {
        self.0.split_once('/').map(|(_, rest)| rest).unwrap_or("")
    }

    /// Split into a namespace directory segment and a filesystem-safe file
    /// stem. Colons and slashes in the remainder become underscores.
    pub fn path_parts(&self) -> (String, String) {
        let safe = self
            .remainder()
            .chars()
            .map(|ch| if ch == ':' || ch == '/' { '_' } else { ch })
            .collect();
        (self.namespace().to_string(), safe)
    }
}

impl fmt::Display for Doi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Doi {
    type Err = PaperError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value
            .trim()
            .trim_start_matches("https://doi.org/")
            .trim_start_matches("doi:")
            .to_uppercase();
        let Some((namespace, remainder)) = normalized.split_once('/') else {
            return Err(PaperError::InvalidDoi(value.to_string()));
        };
        if !namespace_re().is_match(namespace) || remainder.is_empty() {
            return Err(PaperError::InvalidDoi(value.to_string()));
        }
        Ok(Self(normalized))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Paper {
    pub doi: Doi,
    pub title: String,
    pub conference: Option<String>,
    pub year: Option<i64>,
    pub abstract_text: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorOfPaper {
    pub id: Option<i64>,
    pub orcid: Option<String>,
    pub name: String,
    pub affiliation: Option<String>,
}

/// A denormalized reference entry. Partially populated: an entry carrying a
/// DOI but no title is a candidate for enrichment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub title: Option<String>,
    pub journal: Option<String>,
    pub doi: Option<String>,
    pub year: Option<i64>,
    pub author: Option<String>,
}

impl Citation {
    pub fn needs_enrichment(&self) -> bool {
        self.doi.is_some() && self.title.is_none()
    }

    /// An entry with neither a DOI nor a title is an unusable stub.
    pub fn is_usable(&self) -> bool {
        self.doi.is_some() || self.title.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub key: String,
    pub extra: Option<String>,
    pub time: i64,
    pub response: String,
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn parse_doi_normalizes_case() {
        let doi: Doi = "10.1145/3578360.3580261a".parse().unwrap();
        assert_eq!(doi.as_str(), "10.1145/3578360.3580261A");
    }

    #[test]
    fn parse_doi_strips_url_prefix() {
        let doi: Doi = "https://doi.org/10.1038/s41586-020-2649-2".parse().unwrap();
        assert_eq!(doi.as_str(), "10.1038/S41586-020-2649-2");
    }

    #[test]
    fn parse_doi_rejects_missing_slash() {
        let err = "10.1145".parse::<Doi>().unwrap_err();
        assert_matches!(err, PaperError::InvalidDoi(_));
    }

    #[test]
    fn parse_doi_rejects_bad_namespace() {
        let err = "nature/s41586".parse::<Doi>().unwrap_err();
        assert_matches!(err, PaperError::InvalidDoi(_));
    }

    #[test]
    fn path_parts_replace_unsafe_characters() {
        let doi: Doi = "10.1145/ABC:DEF/GHI".parse().unwrap();
        let (namespace, stem) = doi.path_parts();
        assert_eq!(namespace, "10.1145");
        assert_eq!(stem, "ABC_DEF_GHI");
    }

    #[test]
    fn citation_enrichment_rules() {
        let bare_doi = Citation {
            doi: Some("10.1/X".to_string()),
            ..Citation::default()
        };
        assert!(bare_doi.needs_enrichment());
        assert!(bare_doi.is_usable());

        let titled = Citation {
            doi: Some("10.1/X".to_string()),
            title: Some("already known".to_string()),
            ..Citation::default()
        };
        assert!(!titled.needs_enrichment());

        assert!(!Citation::default().is_usable());
    }
}
