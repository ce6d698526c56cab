use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::cache::ResponseCache;
use crate::domain::{AuthorOfPaper, Citation, Doi, Paper};
use crate::error::PaperError;
use crate::limit::RateLimiter;
use crate::registry::{CrossrefHttpClient, RegistryClient, RegistryWork, WorkReference, year_value};

/// Fixed enrichment pool size; bounds simultaneous pressure on the limiter.
pub const WORKER_THREADS: usize = 8;

const RATE_LIMIT_REQUESTS: u32 = 5;
const RATE_LIMIT_INTERVAL: Duration = Duration::from_secs(1);
const RATE_LIMIT_STAGGER: Duration = Duration::from_millis(200);

/// Side channel for enrichment progress: total once candidates are known,
/// one tick per completed task. Completion order is unspecified.
pub trait CitationProgress: Sync {
    fn begin(&self, total: usize);
    fn tick(&self);
}

pub struct NoProgress;

impl CitationProgress for NoProgress {
    fn begin(&self, _total: usize) {}
    fn tick(&self) {}
}

/// Fetch-provider abstraction over one scholarly registry. Exactly one
/// implementation today (Crossref); the seam exists so another registry can
/// slot in without touching callers.
pub trait PaperProvider: Send + Sync {
    fn name(&self) -> &'static str;
    fn paper_by_doi(&self, doi: &Doi) -> Result<Option<Paper>, PaperError>;
    fn authors_of_paper(&self, doi: &Doi) -> Result<Vec<AuthorOfPaper>, PaperError>;
    fn citations_by_doi(
        &self,
        doi: &Doi,
        progress: &dyn CitationProgress,
    ) -> Result<Vec<Citation>, PaperError>;
    fn titles_by_dois(&self, dois: &[Doi]) -> Result<Vec<Option<String>>, PaperError>;
}

/// Crossref-backed provider. Lookups go through a token-bucket rate limiter,
/// a cross-run response cache, and a per-process memo table so concurrent
/// callers for one identifier converge on a single network call.
pub struct CrossrefProvider<C: RegistryClient = CrossrefHttpClient> {
    client: C,
    cache: Arc<dyn ResponseCache>,
    limiter: RateLimiter,
    memo: Mutex<HashMap<String, Arc<OnceLock<Option<RegistryWork>>>>>,
}

impl<C: RegistryClient> CrossrefProvider<C> {
    pub const NAME: &'static str = "crossref";

    pub fn new(client: C, cache: Arc<dyn ResponseCache>) -> Self {
        Self {
            client,
            cache,
            limiter: RateLimiter::new(
                RATE_LIMIT_REQUESTS,
                RATE_LIMIT_INTERVAL,
                RATE_LIMIT_STAGGER,
            ),
            memo: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiter) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn cache_key(doi: &Doi) -> String {
        format!("{}+{}", Self::NAME, doi.as_str())
    }

    /// Resolve one identifier to a raw work record, or `None` for a
    /// definitive miss. The miss is cached too, so a bad identifier is not
    /// refetched on later runs until its cache entry is purged.
    fn fetch_work(&self, doi: &Doi) -> Option<RegistryWork> {
        let key = Self::cache_key(doi);
        let cell = {
            let mut memo = self.memo.lock().unwrap();
            memo.entry(key.clone())
                .or_insert_with(|| Arc::new(OnceLock::new()))
                .clone()
        };
        cell.get_or_init(|| self.fetch_uncached(doi, &key)).clone()
    }

    fn fetch_uncached(&self, doi: &Doi, key: &str) -> Option<RegistryWork> {
        if let Some(cached) = self.cached(doi, key) {
            return cached;
        }

        self.limiter.acquire();
        let work = match self.client.lookup(doi) {
            Ok(work) => Some(work),
            Err(err) => {
                warn!(doi = %doi, error = %err, "error fetching DOI");
                None
            }
        };

        let payload = serde_json::to_string(&work).unwrap_or_else(|_| "null".to_string());
        if let Err(err) = self.cache.put(key, &payload) {
            warn!(key, error = %err, "failed to cache registry response");
        }
        work
    }

    /// Outer `Some` means the cache answered (possibly with a cached miss).
    fn cached(&self, doi: &Doi, key: &str) -> Option<Option<RegistryWork>> {
        match self.cache.get(key) {
            Ok(Some(entry)) => match serde_json::from_str(&entry.response) {
                Ok(work) => {
                    debug!(doi = %doi, "registry cache hit");
                    Some(work)
                }
                Err(err) => {
                    warn!(key, error = %err, "discarding undecodable cache entry");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(key, error = %err, "cache lookup failed, falling back to network");
                None
            }
        }
    }

    /// Run `(index, doi)` tasks on the bounded pool, collecting resolved
    /// works by index. Failed fetches are logged and skipped; siblings are
    /// unaffected.
    fn fetch_batch(
        &self,
        tasks: Vec<(usize, Doi)>,
        progress: &dyn CitationProgress,
    ) -> HashMap<usize, RegistryWork> {
        let workers = WORKER_THREADS.min(tasks.len());
        let queue = Mutex::new(VecDeque::from(tasks));
        let resolved = Mutex::new(HashMap::new());

        thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    loop {
                        let task = queue.lock().unwrap().pop_front();
                        let Some((index, doi)) = task else {
                            break;
                        };
                        match self.fetch_work(&doi) {
                            Some(work) => {
                                resolved.lock().unwrap().insert(index, work);
                            }
                            None => {
                                warn!(doi = %doi, "reference left unenriched");
                            }
                        }
                        progress.tick();
                    }
                });
            }
        });

        resolved.into_inner().unwrap()
    }
}

impl<C: RegistryClient> PaperProvider for CrossrefProvider<C> {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn paper_by_doi(&self, doi: &Doi) -> Result<Option<Paper>, PaperError> {
        let Some(work) = self.fetch_work(doi) else {
            return Ok(None);
        };
        let Some(title) = work.primary_title() else {
            warn!(doi = %doi, "work record carries no title, treating as miss");
            return Ok(None);
        };
        Ok(Some(Paper {
            doi: doi.clone(),
            title: title.to_string(),
            conference: work.event_title(),
            year: work.year(),
            abstract_text: work.abstract_plain(),
            url: work.url.clone(),
        }))
    }

    fn authors_of_paper(&self, doi: &Doi) -> Result<Vec<AuthorOfPaper>, PaperError> {
        let Some(work) = self.fetch_work(doi) else {
            return Ok(Vec::new());
        };
        Ok(work
            .author
            .iter()
            .map(|author| AuthorOfPaper {
                id: None,
                orcid: author.orcid_id(),
                name: author.display_name(),
                affiliation: author
                    .affiliation
                    .first()
                    .and_then(|affiliation| affiliation.name.clone()),
            })
            .collect())
    }

    /// Enrich the primary record's reference list. Candidates (DOI present,
    /// title missing) are fetched concurrently; the final list keeps source
    /// order and drops entries with neither a DOI nor a title.
    fn citations_by_doi(
        &self,
        doi: &Doi,
        progress: &dyn CitationProgress,
    ) -> Result<Vec<Citation>, PaperError> {
        let Some(work) = self.fetch_work(doi) else {
            return Ok(Vec::new());
        };

        let mut citations: Vec<Citation> =
            work.reference.iter().map(reference_to_citation).collect();

        let tasks: Vec<(usize, Doi)> = citations
            .iter()
            .enumerate()
            .filter(|(_, citation)| citation.needs_enrichment())
            .filter_map(|(index, citation)| {
                let raw = citation.doi.as_deref()?;
                match raw.parse::<Doi>() {
                    Ok(parsed) => Some((index, parsed)),
                    Err(_) => {
                        warn!(reference = raw, "skipping malformed reference DOI");
                        None
                    }
                }
            })
            .collect();

        progress.begin(tasks.len());
        if !tasks.is_empty() {
            for (index, resolved) in self.fetch_batch(tasks, progress) {
                let citation = &mut citations[index];
                citation.title = resolved.primary_title().map(str::to_string);
                citation.journal = resolved.event_title();
                citation.year = resolved.year();
                citation.author = resolved.first_author_name();
            }
        }

        citations.retain(Citation::is_usable);
        Ok(citations)
    }

    fn titles_by_dois(&self, dois: &[Doi]) -> Result<Vec<Option<String>>, PaperError> {
        let tasks: Vec<(usize, Doi)> = dois.iter().cloned().enumerate().collect();
        let resolved = self.fetch_batch(tasks, &NoProgress);
        Ok((0..dois.len())
            .map(|index| {
                resolved
                    .get(&index)
                    .and_then(|work| work.primary_title().map(str::to_string))
            })
            .collect())
    }
}

fn reference_to_citation(entry: &WorkReference) -> Citation {
    Citation {
        title: entry.article_title.clone(),
        journal: entry.journal_title.clone(),
        doi: entry.doi.clone(),
        year: entry.year.as_ref().and_then(year_value),
        author: None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::cache::MemoryCache;
    use crate::registry::{PartialDate, WorkAuthor, WorkEvent};

    struct MockRegistry {
        works: HashMap<String, RegistryWork>,
        failing: HashSet<String>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl MockRegistry {
        fn new() -> Self {
            Self {
                works: HashMap::new(),
                failing: HashSet::new(),
                calls: AtomicUsize::new(0),
                delay: Duration::ZERO,
            }
        }

        fn with_work(mut self, doi: &str, work: RegistryWork) -> Self {
            self.works.insert(doi.to_string(), work);
            self
        }

        fn with_failure(mut self, doi: &str) -> Self {
            self.failing.insert(doi.to_string());
            self
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl RegistryClient for MockRegistry {
        fn lookup(&self, doi: &Doi) -> Result<RegistryWork, PaperError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            if self.failing.contains(doi.as_str()) {
                return Err(PaperError::CrossrefDecode("bad payload".to_string()));
            }
            self.works
                .get(doi.as_str())
                .cloned()
                .ok_or_else(|| PaperError::CrossrefStatus {
                    status: 404,
                    message: "Resource not found".to_string(),
                })
        }
    }

    fn titled_work(title: &str, year: i64) -> RegistryWork {
        RegistryWork {
            title: vec![title.to_string()],
            published_print: Some(PartialDate {
                date_parts: vec![vec![year]],
            }),
            event: Some(WorkEvent {
                name: None,
                acronym: Some("CONF".to_string()),
            }),
            author: vec![WorkAuthor {
                given: Some("Grace".to_string()),
                family: Some("Hopper".to_string()),
                orcid: None,
                affiliation: Vec::new(),
            }],
            ..RegistryWork::default()
        }
    }

    fn fast_provider(client: MockRegistry) -> CrossrefProvider<MockRegistry> {
        CrossrefProvider::new(client, Arc::new(MemoryCache::new())).with_rate_limiter(
            RateLimiter::new(1000, Duration::from_secs(1), Duration::ZERO),
        )
    }

    fn primary_with_references(references: Vec<WorkReference>) -> RegistryWork {
        RegistryWork {
            title: vec!["Primary".to_string()],
            reference: references,
            ..RegistryWork::default()
        }
    }

    #[test]
    fn fetch_is_memoized_within_a_process() {
        let client = MockRegistry::new().with_work("10.1/A", titled_work("A", 2001));
        let provider = fast_provider(client);
        let doi: Doi = "10.1/a".parse().unwrap();

        assert!(provider.paper_by_doi(&doi).unwrap().is_some());
        assert!(provider.paper_by_doi(&doi).unwrap().is_some());
        assert_eq!(provider.client.calls(), 1);
    }

    #[test]
    fn concurrent_callers_converge_on_one_fetch() {
        let mut client = MockRegistry::new().with_work("10.1/A", titled_work("A", 2001));
        client.delay = Duration::from_millis(30);
        let provider = fast_provider(client);
        let doi: Doi = "10.1/A".parse().unwrap();

        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| provider.paper_by_doi(&doi).unwrap());
            }
        });
        assert_eq!(provider.client.calls(), 1);
    }

    #[test]
    fn cache_hit_skips_the_network() {
        let cache = Arc::new(MemoryCache::new());
        let work = titled_work("Cached", 1999);
        cache
            .put(
                "crossref+10.1/A",
                &serde_json::to_string(&Some(work)).unwrap(),
            )
            .unwrap();

        let provider = CrossrefProvider::new(MockRegistry::new(), cache).with_rate_limiter(
            RateLimiter::new(1000, Duration::from_secs(1), Duration::ZERO),
        );
        let doi: Doi = "10.1/A".parse().unwrap();
        let paper = provider.paper_by_doi(&doi).unwrap().unwrap();
        assert_eq!(paper.title, "Cached");
        assert_eq!(provider.client.calls(), 0);
    }

    #[test]
    fn failed_lookup_is_cached_as_a_miss() {
        let cache = Arc::new(MemoryCache::new());
        let provider = CrossrefProvider::new(
            MockRegistry::new().with_failure("10.1/BAD"),
            Arc::clone(&cache) as Arc<dyn ResponseCache>,
        )
        .with_rate_limiter(RateLimiter::new(1000, Duration::from_secs(1), Duration::ZERO));
        let doi: Doi = "10.1/BAD".parse().unwrap();

        assert!(provider.paper_by_doi(&doi).unwrap().is_none());
        assert_eq!(provider.client.calls(), 1);

        // fresh memo, shared cache: the miss is served without a new call
        let second = CrossrefProvider::new(MockRegistry::new(), cache).with_rate_limiter(
            RateLimiter::new(1000, Duration::from_secs(1), Duration::ZERO),
        );
        assert!(second.paper_by_doi(&doi).unwrap().is_none());
        assert_eq!(second.client.calls(), 0);
    }

    #[test]
    fn enrichment_preserves_order_and_drops_stubs() {
        let references = vec![
            WorkReference {
                doi: Some("10.1/X".to_string()),
                ..WorkReference::default()
            },
            WorkReference {
                article_title: Some("Already titled".to_string()),
                journal_title: Some("J. Things".to_string()),
                year: Some(serde_json::json!("2004")),
                ..WorkReference::default()
            },
            WorkReference::default(),
        ];
        let client = MockRegistry::new()
            .with_work("10.1/PRIMARY", primary_with_references(references))
            .with_work("10.1/X", titled_work("Resolved X", 2010));
        let provider = fast_provider(client);
        let doi: Doi = "10.1/PRIMARY".parse().unwrap();

        let citations = provider.citations_by_doi(&doi, &NoProgress).unwrap();
        assert_eq!(citations.len(), 2);
        assert_eq!(citations[0].title.as_deref(), Some("Resolved X"));
        assert_eq!(citations[0].journal.as_deref(), Some("CONF"));
        assert_eq!(citations[0].year, Some(2010));
        assert_eq!(citations[0].author.as_deref(), Some("Grace Hopper"));
        assert_eq!(citations[1].title.as_deref(), Some("Already titled"));
        assert_eq!(citations[1].year, Some(2004));
    }

    #[test]
    fn one_failing_reference_does_not_abort_the_batch() {
        let references = vec![
            WorkReference {
                doi: Some("10.1/BAD".to_string()),
                ..WorkReference::default()
            },
            WorkReference {
                doi: Some("10.1/GOOD".to_string()),
                ..WorkReference::default()
            },
        ];
        let client = MockRegistry::new()
            .with_work("10.1/PRIMARY", primary_with_references(references))
            .with_work("10.1/GOOD", titled_work("Good", 2015))
            .with_failure("10.1/BAD");
        let provider = fast_provider(client);
        let doi: Doi = "10.1/PRIMARY".parse().unwrap();

        let citations = provider.citations_by_doi(&doi, &NoProgress).unwrap();
        assert_eq!(citations.len(), 2);
        // the failing entry stays, unenriched
        assert_eq!(citations[0].doi.as_deref(), Some("10.1/BAD"));
        assert!(citations[0].title.is_none());
        assert_eq!(citations[1].title.as_deref(), Some("Good"));
    }

    #[test]
    fn progress_reports_total_and_ticks() {
        struct CountingProgress {
            total: AtomicUsize,
            ticks: AtomicUsize,
        }
        impl CitationProgress for CountingProgress {
            fn begin(&self, total: usize) {
                self.total.store(total, Ordering::SeqCst);
            }
            fn tick(&self) {
                self.ticks.fetch_add(1, Ordering::SeqCst);
            }
        }

        let references = vec![
            WorkReference {
                doi: Some("10.1/X".to_string()),
                ..WorkReference::default()
            },
            WorkReference {
                doi: Some("10.1/Y".to_string()),
                ..WorkReference::default()
            },
        ];
        let client = MockRegistry::new()
            .with_work("10.1/PRIMARY", primary_with_references(references))
            .with_work("10.1/X", titled_work("X", 2001))
            .with_work("10.1/Y", titled_work("Y", 2002));
        let provider = fast_provider(client);
        let doi: Doi = "10.1/PRIMARY".parse().unwrap();

        let progress = CountingProgress {
            total: AtomicUsize::new(usize::MAX),
            ticks: AtomicUsize::new(0),
        };
        provider.citations_by_doi(&doi, &progress).unwrap();
        assert_eq!(progress.total.load(Ordering::SeqCst), 2);
        assert_eq!(progress.ticks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn titles_by_dois_keeps_input_order() {
        let client = MockRegistry::new()
            .with_work("10.1/A", titled_work("Alpha", 2001))
            .with_work("10.1/C", titled_work("Gamma", 2003));
        let provider = fast_provider(client);
        let dois: Vec<Doi> = ["10.1/A", "10.1/B", "10.1/C"]
            .iter()
            .map(|raw| raw.parse().unwrap())
            .collect();

        let titles = provider.titles_by_dois(&dois).unwrap();
        assert_eq!(
            titles,
            vec![Some("Alpha".to_string()), None, Some("Gamma".to_string())]
        );
    }
}
