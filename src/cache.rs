//! Generated-artifact cache
//!
//! Maps a [`GenerationSpec`] digest to the digest of the image last generated
//! for it. The map is volatile: every hit is cross-checked against the blob
//! store before it is trusted, so losing or mis-remembering an entry only
//! ever costs a regeneration.

use crate::models::{GenerationSpec, RemoteKey};
use crate::store::BlobStore;
use crate::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Generated images are always JPEG.
pub const OUTPUT_EXTENSION: &str = "jpg";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub output_digest: String,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    Hit { key: RemoteKey, digest: String },
    Miss,
}

/// Remote key of the generated output for `spec` with content `digest`.
pub fn output_key(spec: &GenerationSpec, digest: &str) -> RemoteKey {
    RemoteKey::new(&spec.dest_prefix, digest, Some(OUTPUT_EXTENSION))
}

pub struct GenerationCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
    store: Arc<dyn BlobStore>,
}

impl GenerationCache {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            store,
        }
    }

    // Entries are only ever replaced or removed whole, so a poisoned map is
    // still consistent.
    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub async fn lookup(&self, spec: &GenerationSpec) -> Result<CacheLookup> {
        let spec_digest = spec.digest()?;
        let cached = self.entries().get(&spec_digest).cloned();

        let Some(entry) = cached else {
            debug!("[{}] Cache miss", spec.identifier());
            return Ok(CacheLookup::Miss);
        };

        let key = output_key(spec, &entry.output_digest);
        match self.store.head_object(key.as_str()).await? {
            Some(live) if live.digest == entry.output_digest => {
                self.touch(&spec_digest, &entry.output_digest, Utc::now());
                debug!("[{}] Cache hit at {}", spec.identifier(), key);
                Ok(CacheLookup::Hit {
                    key,
                    digest: entry.output_digest,
                })
            }
            Some(live) => {
                warn!(
                    "[{}] Stale cache entry: {} now has digest {}",
                    spec.identifier(),
                    key,
                    live.digest
                );
                Ok(CacheLookup::Miss)
            }
            None => {
                warn!(
                    "[{}] Stale cache entry: {} no longer exists",
                    spec.identifier(),
                    key
                );
                Ok(CacheLookup::Miss)
            }
        }
    }

    pub fn record(&self, spec: &GenerationSpec, output_digest: &str) -> Result<()> {
        let spec_digest = spec.digest()?;
        self.insert(spec_digest, output_digest.to_string(), Utc::now());
        Ok(())
    }

    fn insert(&self, spec_digest: String, output_digest: String, at: DateTime<Utc>) {
        self.entries().insert(
            spec_digest,
            CacheEntry {
                output_digest,
                last_seen: at,
            },
        );
    }

    // Only refreshes if the entry still points at the validated output.
    fn touch(&self, spec_digest: &str, output_digest: &str, at: DateTime<Utc>) {
        if let Some(entry) = self.entries().get_mut(spec_digest) {
            if entry.output_digest == output_digest {
                entry.last_seen = at;
            }
        }
    }

    /// Drop entries older than `ttl`, then trim the oldest until at most
    /// `max_entries` remain. Returns the number removed.
    pub fn evict(&self, ttl: Duration, max_entries: usize) -> usize {
        self.evict_at(Utc::now(), ttl, max_entries)
    }

    fn evict_at(&self, now: DateTime<Utc>, ttl: Duration, max_entries: usize) -> usize {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        let mut entries = self.entries();

        let mut by_age: Vec<(String, DateTime<Utc>)> = entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.last_seen))
            .collect();
        by_age.sort_by_key(|(_, last_seen)| *last_seen);

        // Computed once from the pre-sweep size.
        let mut excess = by_age.len().saturating_sub(max_entries);
        let mut removed = 0;

        for (key, last_seen) in by_age {
            let stale = now - last_seen > ttl;
            if !stale && excess == 0 {
                // Ascending order: nothing after this entry is older.
                break;
            }
            entries.remove(&key);
            removed += 1;
            excess = excess.saturating_sub(1);
        }

        removed
    }
}

/// Run [`GenerationCache::evict`] every `every`, independent of traffic.
pub fn spawn_eviction_task(
    cache: Arc<GenerationCache>,
    every: Duration,
    ttl: Duration,
    max_entries: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let removed = cache.evict(ttl, max_entries);
            if removed > 0 {
                info!(
                    "Evicted {} cache entries, {} remaining",
                    removed,
                    cache.len()
                );
            }
        }
    })
}
