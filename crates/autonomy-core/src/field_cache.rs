use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

use tracing::debug;

#[derive(Debug, Clone)]
struct CachedField {
    id: String,
    fetched_at: Instant,
}

/// Repo-keyed cache of project board field identifiers.
///
/// Entries expire after `ttl`; an expired or missing entry is refetched
/// through the caller's lookup, and callers invalidate an entry whose
/// identifier no longer resolves.
#[derive(Debug)]
pub struct FieldCache {
    ttl: Duration,
    entries: RwLock<HashMap<(String, String), CachedField>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

impl FieldCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn resolve<E, F>(&self, repo: &str, name: &str, fetch: F) -> Result<String, E>
    where
        F: FnOnce() -> Result<String, E>,
    {
        let key = (repo.to_string(), name.to_string());
        {
            let entries = self
                .entries
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some(entry) = entries.get(&key) {
                if entry.fetched_at.elapsed() < self.ttl {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(entry.id.clone());
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let id = fetch()?;
        debug!(repo, field = name, field_id = %id, "field id refreshed");
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(
            key,
            CachedField {
                id: id.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(id)
    }

    pub fn invalidate(&self, repo: &str, name: &str) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.remove(&(repo.to_string(), name.to_string()));
    }

    pub fn clear_repo(&self, repo: &str) {
        let mut entries = self
            .entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.retain(|(entry_repo, _), _| entry_repo != repo);
    }

    pub fn stats(&self) -> FieldCacheStats {
        let entries = self
            .entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        FieldCacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: entries.len(),
        }
    }
}
