//! Shared routing registry
//!
//! The registry is the single cross-process source of truth for fleet
//! membership and routing assignments. It is a TTL-aware key-value store
//! split into three keyspaces:
//!
//! | Keyspace   | Key                    | Value                        | TTL        |
//! |------------|------------------------|------------------------------|------------|
//! | `Clients`  | client overlay address | assigned relay `host:port`   | none       |
//! | `Relays`   | relay name             | relay `host:port`            | heartbeat  |
//! | `Services` | service overlay address| service endpoint `host:port` | heartbeat  |
//!
//! Backends:
//!
//! - [`RedisRegistry`]: production backend, one Redis database per keyspace
//! - [`MemoryRegistry`]: in-process backend for tests and single-host setups
//!
//! Per-process reads go through [`CachedRegistry`], a bounded read-through
//! cache with a hard lookup deadline.

mod cached;
mod memory;
mod redis_store;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::RegistryError;

pub use cached::{
    CacheStats, CacheStatsSnapshot, CachedRegistry, DEFAULT_CACHE_CAPACITY, DEFAULT_CACHE_TTL,
    DEFAULT_LOOKUP_TIMEOUT,
};
pub use memory::MemoryRegistry;
pub use redis_store::RedisRegistry;

/// Registry keyspace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Keyspace {
    /// Client overlay address -> assigned relay endpoint
    Clients,
    /// Relay name -> relay endpoint, expires without heartbeats
    Relays,
    /// Service overlay address -> service endpoint, expires without heartbeats
    Services,
}

impl Keyspace {
    /// All keyspaces
    pub const ALL: [Self; 3] = [Self::Clients, Self::Relays, Self::Services];

    /// Redis logical database holding this keyspace
    #[must_use]
    pub const fn database(self) -> i64 {
        match self {
            Self::Clients => 0,
            Self::Relays => 1,
            Self::Services => 2,
        }
    }

    const fn index(self) -> usize {
        match self {
            Self::Clients => 0,
            Self::Relays => 1,
            Self::Services => 2,
        }
    }
}

impl fmt::Display for Keyspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Clients => write!(f, "clients"),
            Self::Relays => write!(f, "relays"),
            Self::Services => write!(f, "services"),
        }
    }
}

/// TTL-aware key-value store shared by the fleet
#[async_trait]
pub trait Registry: Send + Sync + fmt::Debug {
    /// Read a key; `None` if absent or expired
    async fn get(&self, keyspace: Keyspace, key: &str) -> Result<Option<String>, RegistryError>;

    /// Write a key, optionally expiring after `ttl`
    async fn set(
        &self,
        keyspace: Keyspace,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), RegistryError>;

    /// Delete a key; returns whether it existed
    async fn delete(&self, keyspace: Keyspace, key: &str) -> Result<bool, RegistryError>;

    /// All live keys of a keyspace, in backend order
    async fn keys(&self, keyspace: Keyspace) -> Result<Vec<String>, RegistryError>;

    /// Number of live keys in a keyspace
    async fn len(&self, keyspace: Keyspace) -> Result<usize, RegistryError>;

    /// All live key/value pairs of a keyspace
    async fn entries(&self, keyspace: Keyspace) -> Result<Vec<(String, String)>, RegistryError> {
        let mut entries = Vec::new();
        for key in self.keys(keyspace).await? {
            // A key may expire between listing and reading
            if let Some(value) = self.get(keyspace, &key).await? {
                entries.push((key, value));
            }
        }
        Ok(entries)
    }
}

/// A live relay as published by its heartbeat
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRecord {
    /// Relay identity
    pub name: String,
    /// Public `host:port` clients send to
    pub endpoint: String,
}

/// List live relays sorted by name.
///
/// Sorting gives every scheduler the same stable order regardless of how the
/// backend enumerates keys.
///
/// # Errors
///
/// Propagates backend errors.
pub async fn live_relays(registry: &dyn Registry) -> Result<Vec<RelayRecord>, RegistryError> {
    let mut relays: Vec<RelayRecord> = registry
        .entries(Keyspace::Relays)
        .await?
        .into_iter()
        .map(|(name, endpoint)| RelayRecord { name, endpoint })
        .collect();
    relays.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(relays)
}

/// Host part of a `host:port` endpoint string
#[must_use]
pub fn endpoint_host(endpoint: &str) -> &str {
    endpoint
        .rsplit_once(':')
        .map_or(endpoint, |(host, _)| host)
        .trim_start_matches('[')
        .trim_end_matches(']')
}

/// Resolve a `host:port` endpoint string to an IPv4 socket address.
///
/// Literal addresses are parsed directly; names go through the system
/// resolver.
pub async fn resolve_endpoint(endpoint: &str) -> Option<SocketAddr> {
    if let Ok(addr) = endpoint.parse::<SocketAddr>() {
        return Some(addr);
    }
    match tokio::net::lookup_host(endpoint).await {
        Ok(mut addrs) => addrs.find(SocketAddr::is_ipv4),
        Err(e) => {
            debug!(endpoint, error = %e, "endpoint resolution failed");
            None
        }
    }
}

/// Open a registry backend from a URL.
///
/// `memory://` selects the in-process backend; `redis://` and `rediss://`
/// URLs select Redis.
///
/// # Errors
///
/// Returns `RegistryError::Unavailable` for unknown schemes or when the
/// Redis connection cannot be established.
pub async fn connect(url: &str) -> Result<Arc<dyn Registry>, RegistryError> {
    if url.starts_with("memory://") {
        return Ok(Arc::new(MemoryRegistry::new()));
    }
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        return Ok(Arc::new(RedisRegistry::connect(url).await?));
    }
    Err(RegistryError::unavailable(format!(
        "unsupported registry URL scheme: {url}"
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_host() {
        assert_eq!(endpoint_host("203.0.113.9:5114"), "203.0.113.9");
        assert_eq!(endpoint_host("relay2:5114"), "relay2");
        assert_eq!(endpoint_host("[2001:db8::1]:5114"), "2001:db8::1");
        assert_eq!(endpoint_host("relay2"), "relay2");
    }

    #[tokio::test]
    async fn test_live_relays_sorted_by_name() {
        let registry = MemoryRegistry::new();
        let fleet = [("relay-c", "c:5114"), ("relay-a", "a:5114"), ("relay-b", "b:5114")];
        for (name, endpoint) in fleet {
            registry
                .set(Keyspace::Relays, name, endpoint, Some(Duration::from_secs(2)))
                .await
                .unwrap();
        }

        let relays = live_relays(&registry).await.unwrap();
        let names: Vec<_> = relays.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, ["relay-a", "relay-b", "relay-c"]);
        assert_eq!(relays[0].endpoint, "a:5114");
    }

    #[tokio::test]
    async fn test_resolve_endpoint_literal() {
        assert_eq!(
            resolve_endpoint("198.51.100.7:32000").await,
            Some("198.51.100.7:32000".parse().unwrap())
        );
        assert_eq!(resolve_endpoint("no-port").await, None);
    }

    #[tokio::test]
    async fn test_connect_memory_and_unknown_scheme() {
        let registry = connect("memory://").await.unwrap();
        registry.set(Keyspace::Clients, "7.0.0.2", "relay1:5114", None).await.unwrap();
        assert_eq!(registry.len(Keyspace::Clients).await.unwrap(), 1);

        assert!(connect("etcd://localhost").await.is_err());
    }
}
