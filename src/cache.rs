//! Response cache for remote queries.
//!
//! Query results are cached by full request URL so that overlapping
//! refreshes, and the permits query shared by sources with the same keys, hit
//! the remote API once per TTL. Keys are SHA-256 digests of the URL; permit
//! filters can run to tens of kilobytes.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use permit_leads_core::models::RawRecord;
use sha2::{Digest, Sha256};

/// A keyed store of fetched record batches.
pub trait ResponseCache: Send + Sync {
    fn get(&self, url: &str) -> Option<Arc<Vec<RawRecord>>>;

    fn put(&self, url: &str, records: Arc<Vec<RawRecord>>);

    /// Number of live entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Entry {
    stored_at: Instant,
    records: Arc<Vec<RawRecord>>,
}

/// In-memory TTL cache behind an `RwLock`.
pub struct MemoryCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn key(url: &str) -> String {
        hex::encode(Sha256::digest(url.as_bytes()))
    }

    fn fresh(&self, entry: &Entry) -> bool {
        entry.stored_at.elapsed() < self.ttl
    }
}

impl ResponseCache for MemoryCache {
    fn get(&self, url: &str) -> Option<Arc<Vec<RawRecord>>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries
            .get(&Self::key(url))
            .filter(|e| self.fresh(e))
            .map(|e| e.records.clone())
    }

    fn put(&self, url: &str, records: Arc<Vec<RawRecord>>) {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let ttl = self.ttl;
        entries.retain(|_, e| e.stored_at.elapsed() < ttl);
        entries.insert(
            Self::key(url),
            Entry {
                stored_at: Instant::now(),
                records,
            },
        );
    }

    fn len(&self) -> usize {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.values().filter(|e| self.fresh(e)).count()
    }
}

/// Cache that stores nothing.
pub struct NoCache;

impl ResponseCache for NoCache {
    fn get(&self, _url: &str) -> Option<Arc<Vec<RawRecord>>> {
        None
    }

    fn put(&self, _url: &str, _records: Arc<Vec<RawRecord>>) {}

    fn len(&self) -> usize {
        0
    }
}

/// [`MemoryCache`] for a positive TTL, [`NoCache`] for zero.
pub fn cache_for_ttl(ttl_secs: u64) -> Arc<dyn ResponseCache> {
    if ttl_secs == 0 {
        Arc::new(NoCache)
    } else {
        Arc::new(MemoryCache::new(Duration::from_secs(ttl_secs)))
    }
}
