//! The shared content cache.
//!
//! # Responsibilities
//! - Look up, insert and evict entries keyed by [`CacheKey`]
//! - Keep heap and direct memory accounting equal to the live entries
//! - Run the periodic expiry/eviction sweep
//!
//! # Design Decisions
//! - `DashMap` shards give concurrent reads and writes without a global lock
//! - Inserts account under the shard lock through the entry API
//! - Removals only succeed against the exact `Arc` that was inspected
//!   (`remove_if` + `Arc::ptr_eq`), so a sweep that picked an entry which a
//!   concurrent commit has since replaced leaves the newer entry alone
//! - Two concurrent captures of one key both commit; the last one wins

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use axum::http::{HeaderMap, Method};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{broadcast, Notify};

use crate::cache::capture::CacheWriteHandle;
use crate::cache::directives::CacheDirectives;
use crate::cache::entry::CacheEntry;
use crate::cache::key::CacheKey;
use crate::clock;
use crate::config::schema::CacheConfig;
use crate::observability::metrics;

/// Body size at which the eviction score doubles.
const EVICTION_SIZE_UNIT: f64 = 64.0 * 1024.0;

/// Aggregate cache counters.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    entries: AtomicU64,
    heap_bytes: AtomicU64,
    direct_bytes: AtomicU64,
}

impl CacheStats {
    fn admit(&self, entry: &CacheEntry) {
        self.entries.fetch_add(1, Ordering::AcqRel);
        self.heap_bytes.fetch_add(entry.heap_bytes(), Ordering::AcqRel);
        self.direct_bytes.fetch_add(entry.direct_bytes(), Ordering::AcqRel);
    }

    fn release(&self, entry: &CacheEntry) {
        self.entries.fetch_sub(1, Ordering::AcqRel);
        self.heap_bytes.fetch_sub(entry.heap_bytes(), Ordering::AcqRel);
        self.direct_bytes.fetch_sub(entry.direct_bytes(), Ordering::AcqRel);
    }

    fn total_bytes(&self) -> u64 {
        self.heap_bytes.load(Ordering::Acquire) + self.direct_bytes.load(Ordering::Acquire)
    }

    fn publish(&self) {
        metrics::record_cache_usage(
            self.heap_bytes.load(Ordering::Relaxed),
            self.direct_bytes.load(Ordering::Relaxed),
        );
    }
}

/// Point-in-time copy of [`CacheStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entries: u64,
    pub heap_bytes: u64,
    pub direct_bytes: u64,
}

/// What one maintenance pass removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub evicted: usize,
}

/// Limits the cache enforces.
#[derive(Debug, Clone)]
pub struct CachePolicy {
    pub enabled: bool,
    pub max_size: u64,
    pub max_file_size: u64,
    pub disable_secure_without_public: bool,
    pub default_ttl: Duration,
    pub sweep_interval: Duration,
}

impl From<&CacheConfig> for CachePolicy {
    fn from(config: &CacheConfig) -> Self {
        Self {
            enabled: config.enabled,
            max_size: config.max_size_bytes,
            max_file_size: config.max_file_size_bytes,
            disable_secure_without_public: config.disable_secure_without_public,
            default_ttl: config.default_ttl(),
            sweep_interval: config.sweep_interval(),
        }
    }
}

/// In-memory response cache shared by all requests.
pub struct ContentCache {
    entries: DashMap<CacheKey, Arc<CacheEntry>>,
    stats: CacheStats,
    policy: CachePolicy,
    pressure: Notify,
}

impl ContentCache {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            entries: DashMap::new(),
            stats: CacheStats::default(),
            policy,
            pressure: Notify::new(),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(CachePolicy::from(config))
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    pub fn is_enabled(&self) -> bool {
        self.policy.enabled
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            entries: self.stats.entries.load(Ordering::Relaxed),
            heap_bytes: self.stats.heap_bytes.load(Ordering::Relaxed),
            direct_bytes: self.stats.direct_bytes.load(Ordering::Relaxed),
        }
    }

    /// Request-path lookup. Counts a hit or a miss; an expired entry is
    /// removed and counts as a miss.
    pub async fn lookup(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        let found = self.entries.get(key).map(|entry| entry.value().clone());
        let result = match found {
            Some(entry) if entry.is_expired(SystemTime::now()) => {
                if self.remove_exact(key, &entry) {
                    self.stats.publish();
                }
                None
            }
            Some(entry) => {
                entry.touch();
                Some(entry)
            }
            None => None,
        };

        let counter = if result.is_some() { &self.stats.hits } else { &self.stats.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::record_cache_lookup(result.is_some());
        result
    }

    /// Start capturing the response for `key` if the request is a candidate.
    ///
    /// Only GETs are captured. TLS requests are refused while the policy
    /// disables secure caching, unless they send `Cache-Control: public`.
    pub fn begin_capture(&self, key: CacheKey, request_headers: &HeaderMap) -> Option<CacheWriteHandle> {
        if !self.policy.enabled || key.method() != Method::GET {
            return None;
        }
        if key.is_secure()
            && self.policy.disable_secure_without_public
            && !CacheDirectives::from_headers(request_headers).public
        {
            return None;
        }
        Some(CacheWriteHandle::new(
            key,
            self.policy.max_file_size,
            self.policy.default_ttl,
        ))
    }

    /// Insert a finished capture. Replaces any entry under the same key.
    pub async fn commit(&self, handle: CacheWriteHandle) -> bool {
        let Some((key, entry)) = handle.finish() else {
            return false;
        };
        let entry = Arc::new(entry);
        let size = entry.footprint();

        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) => {
                self.stats.admit(&entry);
                let previous = occupied.insert(entry);
                self.stats.release(&previous);
            }
            Entry::Vacant(vacant) => {
                self.stats.admit(&entry);
                vacant.insert(entry);
            }
        }
        self.stats.publish();

        if self.stats.total_bytes() > self.policy.max_size {
            self.pressure.notify_one();
        }
        tracing::trace!(size, entries = self.entries.len(), "Cache entry committed");
        true
    }

    /// Drop a partial capture. The cache is not touched.
    pub async fn abort(&self, handle: CacheWriteHandle) {
        tracing::trace!(key = %handle.key(), "Cache capture aborted");
        drop(handle);
    }

    fn remove_exact(&self, key: &CacheKey, expected: &Arc<CacheEntry>) -> bool {
        match self.entries.remove_if(key, |_, current| Arc::ptr_eq(current, expected)) {
            Some((_, removed)) => {
                self.stats.release(&removed);
                true
            }
            None => false,
        }
    }

    /// One maintenance pass: drop expired entries, then evict the least
    /// valuable entries until memory is within budget.
    ///
    /// Value decays with idle time and with size, so large cold entries go
    /// first. Does not touch hit/miss counters.
    pub fn sweep(&self) -> SweepReport {
        let now = SystemTime::now();
        let mut report = SweepReport::default();

        let expired: Vec<(CacheKey, Arc<CacheEntry>)> = self
            .entries
            .iter()
            .filter(|e| e.value().is_expired(now))
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        for (key, entry) in expired {
            if self.remove_exact(&key, &entry) {
                report.expired += 1;
            }
        }

        if self.stats.total_bytes() > self.policy.max_size {
            let now_ms = clock::unix_millis(now);
            let mut candidates: Vec<(f64, CacheKey, Arc<CacheEntry>)> = self
                .entries
                .iter()
                .map(|e| {
                    let idle = now_ms.saturating_sub(e.value().last_access_ms()) as f64;
                    let weight = 1.0 + e.value().footprint() as f64 / EVICTION_SIZE_UNIT;
                    ((idle + 1.0) * weight, e.key().clone(), e.value().clone())
                })
                .collect();
            candidates.sort_by(|a, b| b.0.total_cmp(&a.0));

            for (_, key, entry) in candidates {
                if self.stats.total_bytes() <= self.policy.max_size {
                    break;
                }
                if self.remove_exact(&key, &entry) {
                    report.evicted += 1;
                }
            }
        }

        let removed = (report.expired + report.evicted) as u64;
        if removed > 0 {
            self.stats.evictions.fetch_add(removed, Ordering::Relaxed);
            metrics::record_cache_evictions(removed);
            self.stats.publish();
            tracing::debug!(
                expired = report.expired,
                evicted = report.evicted,
                remaining = self.entries.len(),
                "Cache sweep finished"
            );
        }
        report
    }

    /// Sweep on every interval tick and whenever a commit pushes the cache
    /// over budget, until shutdown.
    pub async fn run_maintenance(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(self.policy.sweep_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.pressure.notified() => {}
                _ = shutdown.recv() => {
                    tracing::debug!("Cache maintenance stopped");
                    return;
                }
            }
            self.sweep();
        }
    }
}
