//! Manage provider records per content key.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use bytes::Bytes;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::trace;

use crate::common::{Cid, ContentId, PeerId};
use crate::config::{DEFAULT_MAX_PROVIDED_KEYS, DEFAULT_MAX_PROVIDERS_PER_KEY};

/// Default lifetime of a provider record.
pub const DEFAULT_PROVIDER_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Longest lifetime a record can get, larger ttls are clamped to it.
pub const MAX_PROVIDER_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

#[derive(Debug)]
/// An expiring multimap from content to the peers that provide it.
///
/// Records are keyed by [ContentId::key], and bounded by two LRU caches: one of
/// content keys, and one of providers per key. Adding an existing
/// (content, peer) pair refreshes its expiry.
///
/// Expired records are never returned, whether or not [ContentRouter::purge_expired]
/// has removed them yet.
pub struct ContentRouter {
    records: Mutex<LruCache<Bytes, LruCache<PeerId, Instant>>>,
    max_providers_per_key: NonZeroUsize,
    provider_ttl: Mutex<Duration>,
}

impl Default for ContentRouter {
    fn default() -> Self {
        Self::new(
            NonZeroUsize::new(DEFAULT_MAX_PROVIDED_KEYS).unwrap_or(NonZeroUsize::MIN),
            NonZeroUsize::new(DEFAULT_MAX_PROVIDERS_PER_KEY).unwrap_or(NonZeroUsize::MIN),
        )
    }
}

impl ContentRouter {
    pub fn new(max_keys: NonZeroUsize, max_providers_per_key: NonZeroUsize) -> Self {
        Self {
            records: Mutex::new(LruCache::new(max_keys)),
            max_providers_per_key,
            provider_ttl: Mutex::new(DEFAULT_PROVIDER_TTL),
        }
    }

    // === Getters ===

    /// Lifetime given to records added by [ContentRouter::add].
    pub fn provider_ttl(&self) -> Duration {
        *self.provider_ttl.lock()
    }

    /// Number of records currently held, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.records.lock().iter().map(|(_, peers)| peers.len()).sum()
    }

    /// Number of records that haven't expired.
    pub fn live_len(&self) -> usize {
        let now = Instant::now();

        self.records
            .lock()
            .iter()
            .map(|(_, peers)| peers.iter().filter(|(_, expiry)| now < **expiry).count())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // === Public Methods ===

    pub fn set_provider_ttl(&self, ttl: Duration) {
        *self.provider_ttl.lock() = ttl;
    }

    /// Record that `provider` provides `cid`, until now + [ContentRouter::provider_ttl].
    ///
    /// The ttl is capped at [MAX_PROVIDER_TTL].
    pub fn add(&self, cid: &Cid, provider: PeerId) {
        let now = Instant::now();
        let expiry = now
            .checked_add(self.provider_ttl().min(MAX_PROVIDER_TTL))
            .unwrap_or(now);

        self.add_with_expiry(cid, provider, expiry);
    }

    /// Record that `provider` provides `cid` until `expiry`.
    ///
    /// An expiry in the past is stored as is, and is invisible to [ContentRouter::get].
    pub fn add_with_expiry(&self, cid: &Cid, provider: PeerId, expiry: Instant) {
        trace!(?cid, ?provider, "Adding provider record");

        let key = cid.key();
        let mut records = self.records.lock();

        if let Some(providers) = records.get_mut(&key) {
            providers.put(provider, expiry);
        } else {
            let mut providers = LruCache::new(self.max_providers_per_key);
            providers.put(provider, expiry);
            records.put(key, providers);
        }
    }

    /// Distinct peers with a live record for `cid`, empty if there are none.
    pub fn get(&self, cid: &Cid) -> Vec<PeerId> {
        let now = Instant::now();

        self.records
            .lock()
            .get(&cid.key())
            .map(|providers| {
                providers
                    .iter()
                    .filter(|(_, expiry)| now < **expiry)
                    .map(|(id, _)| id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove every expired record, and every key left without providers.
    ///
    /// Returns the number of records removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut records = self.records.lock();

        let mut removed = 0;
        let mut empty_keys = vec![];

        for (key, providers) in records.iter_mut() {
            let expired: Vec<PeerId> = providers
                .iter()
                .filter(|(_, expiry)| now >= **expiry)
                .map(|(id, _)| id.clone())
                .collect();

            for id in expired {
                providers.pop(&id);
                removed += 1;
            }

            if providers.is_empty() {
                empty_keys.push(key.clone());
            }
        }

        for key in empty_keys {
            records.pop(&key);
        }

        removed
    }
}
