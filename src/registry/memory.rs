//! In-process registry backend
//!
//! Expiry is evaluated lazily against `tokio::time::Instant`, so tests that
//! pause and advance the tokio clock observe TTL expiry deterministically.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use super::{Keyspace, Registry};
use crate::error::RegistryError;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |deadline| now < deadline)
    }
}

/// Registry held in process memory
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    spaces: [DashMap<String, Entry>; 3],
}

impl MemoryRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn space(&self, keyspace: Keyspace) -> &DashMap<String, Entry> {
        &self.spaces[keyspace.index()]
    }

    fn purge_expired(&self, keyspace: Keyspace) {
        let now = Instant::now();
        self.space(keyspace).retain(|_, entry| entry.is_live(now));
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn get(&self, keyspace: Keyspace, key: &str) -> Result<Option<String>, RegistryError> {
        let now = Instant::now();
        let space = self.space(keyspace);
        let live = space
            .get(key)
            .map(|entry| entry.is_live(now).then(|| entry.value.clone()));
        match live {
            Some(Some(value)) => Ok(Some(value)),
            Some(None) => {
                space.remove_if(key, |_, entry| !entry.is_live(now));
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        keyspace: Keyspace,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), RegistryError> {
        let entry = Entry {
            value: value.to_string(),
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        };
        self.space(keyspace).insert(key.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, keyspace: Keyspace, key: &str) -> Result<bool, RegistryError> {
        let now = Instant::now();
        Ok(self
            .space(keyspace)
            .remove(key)
            .is_some_and(|(_, entry)| entry.is_live(now)))
    }

    async fn keys(&self, keyspace: Keyspace) -> Result<Vec<String>, RegistryError> {
        self.purge_expired(keyspace);
        Ok(self
            .space(keyspace)
            .iter()
            .map(|entry| entry.key().clone())
            .collect())
    }

    async fn len(&self, keyspace: Keyspace) -> Result<usize, RegistryError> {
        self.purge_expired(keyspace);
        Ok(self.space(keyspace).len())
    }

    async fn entries(&self, keyspace: Keyspace) -> Result<Vec<(String, String)>, RegistryError> {
        self.purge_expired(keyspace);
        Ok(self
            .space(keyspace)
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().value.clone()))
            .collect())
    }
}
