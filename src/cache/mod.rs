//! TTL + LRU result cache.
//!
//! Stores finished (merged + flagged) batches keyed by request identity so
//! repeated queries for the same subject and time range skip the
//! rate-limited network round trips.
//!
//! The whole cache map lives under one key in the injected [`KvStore`];
//! every operation reads the full map, mutates a local copy and writes it
//! back. Last-writer-wins under concurrent requests is acceptable because
//! entries are idempotent re-derivable results, not source-of-truth data.
//! Any store or parse failure is absorbed as a cold cache and never
//! surfaced to the caller.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::store::KvStore;

/// Default entry lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(30 * 60);

/// Default capacity bound in keys.
pub const DEFAULT_CAPACITY: usize = 50;

/// Build the cache key for one request:
/// `sourceId:subjectId:startDate:endDate`, all components trimmed and
/// lower-cased, empty string for absent bounds.
pub fn build_cache_key(
    source_id: &str,
    subject_id: &str,
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
) -> String {
    fn normalize(s: &str) -> String {
        s.trim().to_lowercase()
    }
    format!(
        "{}:{}:{}:{}",
        normalize(source_id),
        normalize(subject_id),
        start.map(|d| d.to_string()).unwrap_or_default(),
        end.map(|d| d.to_string()).unwrap_or_default(),
    )
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheEntry<P> {
    payload: P,
    /// Refreshed on every successful read: retention is recency-based,
    /// not insertion-based.
    cached_at: DateTime<Utc>,
    ttl_millis: u64,
}

/// Result cache over an injected key-value store.
pub struct ResultCache<P> {
    store: Arc<dyn KvStore>,
    store_key: String,
    default_ttl: Duration,
    capacity: usize,
    _payload: PhantomData<P>,
}

impl<P> ResultCache<P>
where
    P: Serialize + DeserializeOwned + Clone,
{
    pub fn new(store: Arc<dyn KvStore>, store_key: &str) -> Self {
        Self::with_limits(store, store_key, DEFAULT_TTL, DEFAULT_CAPACITY)
    }

    pub fn with_limits(
        store: Arc<dyn KvStore>,
        store_key: &str,
        default_ttl: Duration,
        capacity: usize,
    ) -> Self {
        Self {
            store,
            store_key: store_key.to_string(),
            default_ttl,
            capacity,
            _payload: PhantomData,
        }
    }

    /// Look up a finished result. A hit refreshes the entry's `cached_at`;
    /// an expired entry is evicted from the backing store on the spot.
    pub fn get(&self, key: &str) -> Option<P> {
        let mut map = self.read_map();
        let entry = map.get(key)?.clone();

        let age = Utc::now().signed_duration_since(entry.cached_at);
        let ttl = chrono::Duration::milliseconds(entry.ttl_millis.min(i64::MAX as u64) as i64);

        if age > ttl {
            log::debug!("Cache entry '{}' expired, evicting", key);
            map.remove(key);
            self.write_map(&map);
            return None;
        }

        if let Some(stored) = map.get_mut(key) {
            stored.cached_at = Utc::now();
        }
        self.write_map(&map);
        Some(entry.payload)
    }

    /// Store a finished result with the default TTL.
    pub fn set(&self, key: &str, payload: P) {
        self.set_with_ttl(key, payload, self.default_ttl);
    }

    /// Store a finished result. If the map now exceeds capacity, entries
    /// are evicted in ascending `cached_at` order until back at capacity.
    pub fn set_with_ttl(&self, key: &str, payload: P, ttl: Duration) {
        let mut map = self.read_map();
        map.insert(
            key.to_string(),
            CacheEntry {
                payload,
                cached_at: Utc::now(),
                ttl_millis: ttl.as_millis().min(u64::MAX as u128) as u64,
            },
        );

        while map.len() > self.capacity {
            let oldest = map
                .iter()
                .min_by_key(|(_, entry)| entry.cached_at)
                .map(|(k, _)| k.clone());
            match oldest {
                Some(k) => {
                    log::debug!("Cache over capacity, evicting least recently touched '{}'", k);
                    map.remove(&k);
                }
                None => break,
            }
        }

        self.write_map(&map);
    }

    /// Drop one entry.
    pub fn invalidate(&self, key: &str) {
        let mut map = self.read_map();
        if map.remove(key).is_some() {
            self.write_map(&map);
        }
    }

    /// Number of live keys (expired entries still count until touched).
    pub fn len(&self) -> usize {
        self.read_map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_map().is_empty()
    }

    fn read_map(&self) -> HashMap<String, CacheEntry<P>> {
        let raw = match self.store.get(&self.store_key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return HashMap::new(),
            Err(e) => {
                log::warn!("Cache store read failed, treating as cold: {}", e);
                return HashMap::new();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(map) => map,
            Err(e) => {
                log::warn!("Cache store content unreadable, treating as cold: {}", e);
                HashMap::new()
            }
        }
    }

    fn write_map(&self, map: &HashMap<String, CacheEntry<P>>) {
        match serde_json::to_string(map) {
            Ok(raw) => {
                if let Err(e) = self.store.set(&self.store_key, &raw) {
                    log::warn!("Cache store write failed: {}", e);
                }
            }
            Err(e) => log::warn!("Cache serialization failed: {}", e),
        }
    }
}
