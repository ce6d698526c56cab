use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::Doi;
use crate::error::PaperError;

const CROSSREF_BASE: &str = "https://api.crossref.org";
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Upstream scholarly registry. One lookup per identifier; rate limiting and
/// caching live above this layer.
pub trait RegistryClient: Send + Sync {
    fn lookup(&self, doi: &Doi) -> Result<RegistryWork, PaperError>;
}

#[derive(Clone)]
pub struct CrossrefHttpClient {
    client: Client,
    base_url: String,
}

impl CrossrefHttpClient {
    pub fn new() -> Result<Self, PaperError> {
        let client = Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(format!(
                "paperstack/{} (https://github.com/paperstack-dev/paperstack; mailto:hello@paperstack.dev)",
                env!("CARGO_PKG_VERSION")
            ))
            .build()
            .map_err(|err| PaperError::CrossrefHttp(err.to_string()))?;
        Ok(Self {
            client,
            base_url: CROSSREF_BASE.to_string(),
        })
    }

    pub fn with_base_url(mut self, base_url: &str) -> Self {
        self.base_url = base_url.to_string();
        self
    }
}

impl RegistryClient for CrossrefHttpClient {
    fn lookup(&self, doi: &Doi) -> Result<RegistryWork, PaperError> {
        let url = format!(
            "{}/works/{}",
            self.base_url,
            encode_url_component(doi.as_str())
        );
        let response = self
            .client
            .get(&url)
            .send()
            .map_err(|err| PaperError::CrossrefHttp(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let message = response
                .text()
                .unwrap_or_else(|_| "Crossref request failed".to_string());
            return Err(PaperError::CrossrefStatus { status, message });
        }
        let payload: CrossrefResponse = response
            .json()
            .map_err(|err| PaperError::CrossrefDecode(err.to_string()))?;
        Ok(payload.message)
    }
}

#[derive(Debug, Deserialize)]
struct CrossrefResponse {
    message: RegistryWork,
}

/// The subset of a Crossref work record the engine consumes. Round-trips
/// through serde so resolved records can be cached as JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryWork {
    #[serde(default)]
    pub title: Vec<String>,
    #[serde(rename = "abstract", default, skip_serializing_if = "Option::is_none")]
    pub abstract_text: Option<String>,
    #[serde(
        rename = "published-print",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub published_print: Option<PartialDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<WorkEvent>,
    #[serde(default)]
    pub author: Vec<WorkAuthor>,
    #[serde(default)]
    pub reference: Vec<WorkReference>,
    #[serde(rename = "URL", default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartialDate {
    #[serde(rename = "date-parts", default)]
    pub date_parts: Vec<Vec<i64>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acronym: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkAuthor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub given: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub family: Option<String>,
    #[serde(rename = "ORCID", default, skip_serializing_if = "Option::is_none")]
    pub orcid: Option<String>,
    #[serde(default)]
    pub affiliation: Vec<WorkAffiliation>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkAffiliation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkReference {
    #[serde(rename = "DOI", default, skip_serializing_if = "Option::is_none")]
    pub doi: Option<String>,
    #[serde(
        rename = "article-title",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub article_title: Option<String>,
    #[serde(
        rename = "journal-title",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub journal_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<Value>,
}

impl RegistryWork {
    pub fn primary_title(&self) -> Option<&str> {
        self.title.first().map(String::as_str)
    }

    pub fn year(&self) -> Option<i64> {
        self.published_print
            .as_ref()
            .and_then(|date| date.date_parts.first())
            .and_then(|parts| parts.first())
            .copied()
    }

    /// Event acronym if present, full event name otherwise.
    pub fn event_title(&self) -> Option<String> {
        let event = self.event.as_ref()?;
        event.acronym.clone().or_else(|| event.name.clone())
    }

    pub fn abstract_plain(&self) -> Option<String> {
        self.abstract_text.as_deref().map(html_to_plain)
    }

    pub fn first_author_name(&self) -> Option<String> {
        self.author
            .first()
            .map(WorkAuthor::display_name)
            .filter(|name| !name.is_empty())
    }
}

impl WorkAuthor {
    pub fn display_name(&self) -> String {
        match (&self.given, &self.family) {
            (Some(given), Some(family)) => format!("{given} {family}"),
            (Some(given), None) => given.clone(),
            (None, Some(family)) => family.clone(),
            (None, None) => String::new(),
        }
    }

    /// Bare ORCID identifier, with any `https://orcid.org/` prefix removed.
    pub fn orcid_id(&self) -> Option<String> {
        self.orcid
            .as_deref()
            .map(|orcid| orcid.rsplit('/').next().unwrap_or(orcid).to_string())
    }
}

/// Coerce a reference-entry year, which Crossref serves as either a number
/// or a string.
pub fn year_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(num) => num.as_i64(),
        Value::String(text) => text.trim().parse().ok(),
        _ => None,
    }
}

/// Strip markup from a JATS-flavored abstract, keeping the text content.
pub fn html_to_plain(value: &str) -> String {
    static TAG_RE: OnceLock<Regex> = OnceLock::new();
    let re = TAG_RE.get_or_init(|| Regex::new(r"<[^>]*>").unwrap());
    re.replace_all(value, "").trim().to_string()
}

fn encode_url_component(value: &str) -> String {
    let mut out = String::new();
    for byte in value.as_bytes() {
        let ch = *byte as char;
        if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.' || ch == '~' {
            out.push(ch);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_work_message() {
        let payload = r#"{
            "title": ["A Sample Paper"],
            "abstract": "<jats:p>We present <jats:italic>things</jats:italic>.</jats:p>",
            "published-print": {"date-parts": [[2023, 2, 17]]},
            "event": {"name": "International Conference on Samples", "acronym": "ICS"},
            "author": [
                {"given": "Ada", "family": "Lovelace",
                 "ORCID": "https://orcid.org/0000-0002-1825-0097",
                 "affiliation": [{"name": "Analytical Engines"}]}
            ],
            "reference": [
                {"DOI": "10.1/x", "year": "2004"},
                {"article-title": "Known", "journal-title": "J. Known", "year": 2001}
            ],
            "URL": "https://doi.org/10.1145/3578360.3580261"
        }"#;
        let work: RegistryWork = serde_json::from_str(payload).unwrap();

        assert_eq!(work.primary_title(), Some("A Sample Paper"));
        assert_eq!(work.year(), Some(2023));
        assert_eq!(work.event_title().as_deref(), Some("ICS"));
        assert_eq!(work.abstract_plain().as_deref(), Some("We present things."));
        assert_eq!(work.first_author_name().as_deref(), Some("Ada Lovelace"));
        assert_eq!(
            work.author[0].orcid_id().as_deref(),
            Some("0000-0002-1825-0097")
        );
        assert_eq!(year_value(work.reference[0].year.as_ref().unwrap()), Some(2004));
        assert_eq!(year_value(work.reference[1].year.as_ref().unwrap()), Some(2001));
    }

    #[test]
    fn event_title_falls_back_to_name() {
        let work = RegistryWork {
            event: Some(WorkEvent {
                name: Some("Workshop on Examples".to_string()),
                acronym: None,
            }),
            ..RegistryWork::default()
        };
        assert_eq!(work.event_title().as_deref(), Some("Workshop on Examples"));
    }

    #[test]
    fn work_round_trips_through_json() {
        let payload = r#"{"title":["T"],"published-print":{"date-parts":[[1999]]}}"#;
        let work: RegistryWork = serde_json::from_str(payload).unwrap();
        let encoded = serde_json::to_string(&work).unwrap();
        let again: RegistryWork = serde_json::from_str(&encoded).unwrap();
        assert_eq!(again.primary_title(), Some("T"));
        assert_eq!(again.year(), Some(1999));
    }
}
