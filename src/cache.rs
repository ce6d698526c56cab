use std::collections::HashMap;
use std::sync::Mutex;

use crate::domain::CachedResponse;
use crate::error::PaperError;

/// Capability for the cross-run response cache. Any backing store works as
/// long as it keeps one entry per key and serializes writes to the same key.
pub trait ResponseCache: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<CachedResponse>, PaperError>;
    fn put(&self, key: &str, payload: &str) -> Result<(), PaperError>;
    fn purge(&self, key: &str) -> Result<(), PaperError>;
}

/// Process-local cache, used by tests and as a fallback when no database is
/// wired in.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, CachedResponse>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ResponseCache for MemoryCache {
    fn get(&self, key: &str) -> Result<Option<CachedResponse>, PaperError> {
        Ok(self.entries.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &str, payload: &str) -> Result<(), PaperError> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key.to_string(),
            CachedResponse {
                key: key.to_string(),
                extra: None,
                time: chrono::Utc::now().timestamp(),
                response: payload.to_string(),
            },
        );
        Ok(())
    }

    fn purge(&self, key: &str) -> Result<(), PaperError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }
}
