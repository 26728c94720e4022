use axum::http::{HeaderMap, header};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

use crate::coalesce::{CoalesceStats, GroupRegistry, JoinOutcome, Waiter};
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::response::CachedResponse;
use crate::ring_buffer::{PutOutcome, RingBuffer};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub evictions: u64,
    pub hosts: usize,
    pub total_entries: usize,
    pub buffer_size_per_host: usize,
    pub hit_ratio: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
    Coalesced,
    Bypass,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
            CacheStatus::Coalesced => "COALESCED",
            CacheStatus::Bypass => "BYPASS",
        }
    }
}

struct CacheInner {
    /// Host -> that host's ring buffer. The map only guards existence; each
    /// buffer has its own lock.
    host_buffers: DashMap<String, Arc<RwLock<RingBuffer>>>,
    /// In-flight fetches, locked independently of the buffers
    groups: GroupRegistry,
    buffer_size_per_host: NonZeroUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    evictions: AtomicU64,
}

/// Response cache sharded by host, plus the registry of in-flight fetches.
///
/// Cloning is cheap and every clone shares the same storage.
#[derive(Clone)]
pub struct ResponseCache {
    inner: Arc<CacheInner>,
}

impl ResponseCache {
    pub fn new(config: &CacheConfig) -> CacheResult<Self> {
        config.validate()?;
        Self::with_capacity(config.buffer_size_per_host)
    }

    /// Build a cache whose per-host buffers hold `buffer_size_per_host` entries.
    pub fn with_capacity(buffer_size_per_host: usize) -> CacheResult<Self> {
        let buffer_size_per_host = NonZeroUsize::new(buffer_size_per_host).ok_or_else(|| {
            CacheError::ConfigError("buffer size per host must be positive".to_string())
        })?;

        // Configure DashMap with optimal shard count based on CPU cores
        let shard_count = (num_cpus::get() * 4).next_power_of_two();
        let host_buffers = DashMap::with_shard_amount(shard_count);

        info!(
            shards = shard_count,
            buffer_size_per_host = buffer_size_per_host.get(),
            "Initialized response cache"
        );

        Ok(Self {
            inner: Arc::new(CacheInner {
                host_buffers,
                groups: GroupRegistry::new(),
                buffer_size_per_host,
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                stores: AtomicU64::new(0),
                evictions: AtomicU64::new(0),
            }),
        })
    }

    fn buffer(&self, host: &str) -> Option<Arc<RwLock<RingBuffer>>> {
        self.inner
            .host_buffers
            .get(host)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn get(&self, host: &str, path: &str) -> Option<CachedResponse> {
        let found = self
            .buffer(host)
            .and_then(|buffer| buffer.read().get(path));

        if found.is_some() {
            self.inner.hits.fetch_add(1, Ordering::Relaxed);
            debug!(host = %host, path = %path, "Cache HIT");
        } else {
            self.inner.misses.fetch_add(1, Ordering::Relaxed);
            debug!(host = %host, path = %path, "Cache MISS");
        }
        found
    }

    pub fn store(&self, host: &str, path: &str, response: CachedResponse) {
        let buffer = match self.buffer(host) {
            Some(buffer) => buffer,
            None => {
                let capacity = self.inner.buffer_size_per_host;
                let entry = self
                    .inner
                    .host_buffers
                    .entry(host.to_string())
                    .or_insert_with(|| {
                        debug!(host = %host, capacity = capacity.get(), "Creating host buffer");
                        Arc::new(RwLock::new(RingBuffer::new(capacity)))
                    });
                Arc::clone(entry.value())
            }
        };

        let size = response.size();
        let status = response.status().as_u16();
        let outcome = buffer.write().put(path, response);
        self.inner.stores.fetch_add(1, Ordering::Relaxed);

        if let PutOutcome::Evicted(evicted) = &outcome {
            self.inner.evictions.fetch_add(1, Ordering::Relaxed);
            debug!(host = %host, evicted = %evicted, "Evicted oldest entry");
        }
        debug!(host = %host, path = %path, status = status, size = size, "Cached response");
    }

    /// See [`GroupRegistry::try_become_leader_or_join`].
    pub fn try_become_leader_or_join(&self, key: &str, waiter: Arc<dyn Waiter>) -> JoinOutcome {
        self.inner.groups.try_become_leader_or_join(key, waiter)
    }

    pub fn remove_group(&self, key: &str) -> bool {
        self.inner.groups.remove_group(key)
    }

    pub fn groups(&self) -> &GroupRegistry {
        &self.inner.groups
    }

    pub fn buffer_size_per_host(&self) -> usize {
        self.inner.buffer_size_per_host.get()
    }

    /// Number of entries held for `host`, if it has a buffer
    pub fn host_len(&self, host: &str) -> Option<usize> {
        self.buffer(host).map(|buffer| buffer.read().len())
    }

    pub fn purge_host(&self, host: &str) -> usize {
        let count = self
            .inner
            .host_buffers
            .remove(host)
            .map(|(_, buffer)| buffer.read().len())
            .unwrap_or(0);
        info!(host = %host, count = count, "Purged host cache");
        count
    }

    pub fn purge_all(&self) -> usize {
        let buffers: Vec<Arc<RwLock<RingBuffer>>> = self
            .inner
            .host_buffers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        self.inner.host_buffers.clear();

        let count = buffers.iter().map(|b| b.read().len()).sum();
        info!(count = count, "Purged all cache entries");
        count
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.inner.hits.load(Ordering::Relaxed);
        let misses = self.inner.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let hit_ratio = if total > 0 {
            hits as f64 / total as f64
        } else {
            0.0
        };

        let buffers: Vec<Arc<RwLock<RingBuffer>>> = self
            .inner
            .host_buffers
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        CacheStats {
            hits,
            misses,
            stores: self.inner.stores.load(Ordering::Relaxed),
            evictions: self.inner.evictions.load(Ordering::Relaxed),
            hosts: buffers.len(),
            total_entries: buffers.iter().map(|b| b.read().len()).sum(),
            buffer_size_per_host: self.inner.buffer_size_per_host.get(),
            hit_ratio,
        }
    }

    pub fn coalesce_stats(&self) -> CoalesceStats {
        self.inner.groups.stats()
    }
}

pub fn generate_cache_key(host: &str, path: &str) -> String {
    format!("{}{}", host, path)
}

pub fn parse_cache_control(header: &str) -> CacheControlDirectives {
    let mut directives = CacheControlDirectives::default();

    for part in header.split(',') {
        let part = part.trim().to_lowercase();

        if part == "no-cache" {
            directives.no_cache = true;
        } else if part == "no-store" {
            directives.no_store = true;
        }
    }

    directives
}

#[derive(Debug, Default, Clone)]
pub struct CacheControlDirectives {
    pub no_cache: bool,
    pub no_store: bool,
}

/// Whether a request asks to skip the cache entirely.
pub fn is_bypass(headers: &HeaderMap) -> bool {
    let cache_control = headers
        .get_all(header::CACHE_CONTROL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(parse_cache_control)
        .any(|d| d.no_cache || d.no_store);

    let pragma = headers
        .get_all(header::PRAGMA)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| v.trim().eq_ignore_ascii_case("no-cache"));

    cache_control || pragma
}
