//! Read-through registry cache
//!
//! Relays consult the registry for every packet whose source or destination
//! is not in their local tables. Unrouted or spoofed traffic is all cache
//! misses, so without a local cache a packet flood turns directly into a
//! request flood on the shared store. `CachedRegistry` keeps both hits and
//! misses for a bounded time and caps every backend read with a deadline.
//!
//! A deadline overrun or backend error is reported to the caller as
//! `RegistryError::Unavailable` and is not cached; the next packet tries
//! again.
//!
//! Endpoint strings from the registry may name hosts rather than literal
//! addresses. [`CachedRegistry::resolve`] puts those resolutions under the
//! same deadline and cache.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{resolve_endpoint, Keyspace, Registry};
use crate::error::RegistryError;

/// Default lifetime of a cached registry answer
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(30);

/// Default deadline for a backend read on the forwarding path
pub const DEFAULT_LOOKUP_TIMEOUT: Duration = Duration::from_millis(100);

/// Default maximum number of cached answers
pub const DEFAULT_CACHE_CAPACITY: u64 = 65_536;

/// Registry cache statistics
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    timeouts: AtomicU64,
    errors: AtomicU64,
}

impl CacheStats {
    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Answers served from the cache
    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Lookups that went to the backend
    #[must_use]
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Backend reads that overran the deadline
    #[must_use]
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Backend reads that failed
    #[must_use]
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Point-in-time copy of the counters
    #[must_use]
    pub fn snapshot(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            timeouts: self.timeouts(),
            errors: self.errors(),
        }
    }
}

/// Snapshot of registry cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub timeouts: u64,
    pub errors: u64,
}

/// Registry wrapper with a bounded read-through cache
#[derive(Debug)]
pub struct CachedRegistry {
    backend: Arc<dyn Registry>,
    cache: Cache<(Keyspace, String), Option<String>>,
    resolved: Cache<String, SocketAddr>,
    lookup_timeout: Duration,
    stats: CacheStats,
}

impl CachedRegistry {
    /// Wrap `backend` with the default TTL, capacity and deadline
    #[must_use]
    pub fn new(backend: Arc<dyn Registry>) -> Self {
        Self::with_options(
            backend,
            DEFAULT_CACHE_TTL,
            DEFAULT_CACHE_CAPACITY,
            DEFAULT_LOOKUP_TIMEOUT,
        )
    }

    /// Wrap `backend` with explicit cache TTL, capacity and lookup deadline
    #[must_use]
    pub fn with_options(
        backend: Arc<dyn Registry>,
        ttl: Duration,
        capacity: u64,
        lookup_timeout: Duration,
    ) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .build();
        let resolved = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .build();
        Self {
            backend,
            cache,
            resolved,
            lookup_timeout,
            stats: CacheStats::default(),
        }
    }

    /// Deadline applied to every backend read and name resolution
    #[must_use]
    pub const fn lookup_timeout(&self) -> Duration {
        self.lookup_timeout
    }

    /// The wrapped backend
    #[must_use]
    pub fn backend(&self) -> &Arc<dyn Registry> {
        &self.backend
    }

    /// Cache statistics
    #[must_use]
    pub const fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Drop a cached answer
    pub fn invalidate(&self, keyspace: Keyspace, key: &str) {
        self.cache.invalidate(&(keyspace, key.to_string()));
    }

    /// Cached read bounded by the lookup deadline.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Unavailable` if the backend does not answer in
    /// time, or the backend error. Neither outcome is cached.
    pub async fn lookup(
        &self,
        keyspace: Keyspace,
        key: &str,
    ) -> Result<Option<String>, RegistryError> {
        let cache_key = (keyspace, key.to_string());
        if let Some(answer) = self.cache.get(&cache_key) {
            self.stats.record_hit();
            return Ok(answer);
        }
        self.stats.record_miss();

        match tokio::time::timeout(self.lookup_timeout, self.backend.get(keyspace, key)).await {
            Ok(Ok(answer)) => {
                self.cache.insert(cache_key, answer.clone());
                Ok(answer)
            }
            Ok(Err(e)) => {
                self.stats.record_error();
                debug!(keyspace = %keyspace, key, error = %e, "registry lookup failed");
                Err(e)
            }
            Err(_) => {
                self.stats.record_timeout();
                debug!(keyspace = %keyspace, key, "registry lookup timed out");
                Err(self.deadline_error())
            }
        }
    }

    /// Resolve a `host:port` endpoint under the lookup deadline.
    ///
    /// Literal addresses are parsed in place. Resolved names are cached for
    /// the cache TTL; names that do not resolve are not.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Unavailable` if resolution overruns the
    /// deadline.
    pub async fn resolve(&self, endpoint: &str) -> Result<Option<SocketAddr>, RegistryError> {
        if let Ok(addr) = endpoint.parse::<SocketAddr>() {
            return Ok(Some(addr));
        }
        if let Some(addr) = self.resolved.get(endpoint) {
            self.stats.record_hit();
            return Ok(Some(addr));
        }
        self.stats.record_miss();

        match tokio::time::timeout(self.lookup_timeout, resolve_endpoint(endpoint)).await {
            Ok(Some(addr)) => {
                self.resolved.insert(endpoint.to_string(), addr);
                Ok(Some(addr))
            }
            Ok(None) => Ok(None),
            Err(_) => {
                self.stats.record_timeout();
                debug!(endpoint, "endpoint resolution timed out");
                Err(self.deadline_error())
            }
        }
    }

    fn deadline_error(&self) -> RegistryError {
        RegistryError::unavailable(format!(
            "no answer within {} ms",
            self.lookup_timeout.as_millis()
        ))
    }
}

#[async_trait]
impl Registry for CachedRegistry {
    async fn get(&self, keyspace: Keyspace, key: &str) -> Result<Option<String>, RegistryError> {
        self.lookup(keyspace, key).await
    }

    async fn set(
        &self,
        keyspace: Keyspace,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), RegistryError> {
        self.backend.set(keyspace, key, value, ttl).await?;
        self.invalidate(keyspace, key);
        Ok(())
    }

    async fn delete(&self, keyspace: Keyspace, key: &str) -> Result<bool, RegistryError> {
        let existed = self.backend.delete(keyspace, key).await?;
        self.invalidate(keyspace, key);
        Ok(existed)
    }

    async fn keys(&self, keyspace: Keyspace) -> Result<Vec<String>, RegistryError> {
        self.backend.keys(keyspace).await
    }

    async fn len(&self, keyspace: Keyspace) -> Result<usize, RegistryError> {
        self.backend.len(keyspace).await
    }

    async fn entries(&self, keyspace: Keyspace) -> Result<Vec<(String, String)>, RegistryError> {
        self.backend.entries(keyspace).await
    }
}
