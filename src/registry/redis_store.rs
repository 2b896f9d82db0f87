//! Redis registry backend
//!
//! Each keyspace lives in its own logical database (see
//! [`Keyspace::database`]). One multiplexed connection per database is
//! opened up front and cloned per request.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, IntoConnectionInfo};
use tracing::info;

use super::{Keyspace, Registry};
use crate::error::RegistryError;

/// Registry stored in Redis
#[derive(Clone)]
pub struct RedisRegistry {
    connections: [MultiplexedConnection; 3],
}

impl std::fmt::Debug for RedisRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisRegistry").finish_non_exhaustive()
    }
}

impl RedisRegistry {
    /// Connect to Redis at `url`, one connection per keyspace database.
    ///
    /// Any database number in the URL is ignored.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Unavailable` if the URL is invalid or a
    /// connection cannot be established.
    pub async fn connect(url: &str) -> Result<Self, RegistryError> {
        let base = url.into_connection_info()?;

        let clients = Self::open(&base, Keyspace::Clients).await?;
        let relays = Self::open(&base, Keyspace::Relays).await?;
        let services = Self::open(&base, Keyspace::Services).await?;

        info!(addr = %base.addr, "connected to redis registry");

        Ok(Self {
            connections: [clients, relays, services],
        })
    }

    async fn open(
        base: &redis::ConnectionInfo,
        keyspace: Keyspace,
    ) -> Result<MultiplexedConnection, RegistryError> {
        let mut info = base.clone();
        info.redis.db = keyspace.database();
        let client = redis::Client::open(info)?;
        Ok(client.get_multiplexed_async_connection().await?)
    }

    fn conn(&self, keyspace: Keyspace) -> MultiplexedConnection {
        self.connections[keyspace.index()].clone()
    }
}

#[async_trait]
impl Registry for RedisRegistry {
    async fn get(&self, keyspace: Keyspace, key: &str) -> Result<Option<String>, RegistryError> {
        let mut conn = self.conn(keyspace);
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn set(
        &self,
        keyspace: Keyspace,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<(), RegistryError> {
        let mut conn = self.conn(keyspace);
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            // PX with 0 is rejected by Redis
            let millis = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);
            cmd.arg("PX").arg(millis);
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn delete(&self, keyspace: Keyspace, key: &str) -> Result<bool, RegistryError> {
        let mut conn = self.conn(keyspace);
        let removed: usize = conn.del(key).await?;
        Ok(removed > 0)
    }

    async fn keys(&self, keyspace: Keyspace) -> Result<Vec<String>, RegistryError> {
        let mut conn = self.conn(keyspace);
        let keys: Vec<String> = conn.keys("*").await?;
        Ok(keys)
    }

    async fn len(&self, keyspace: Keyspace) -> Result<usize, RegistryError> {
        let mut conn = self.conn(keyspace);
        let size: usize = redis::cmd("DBSIZE").query_async(&mut conn).await?;
        Ok(size)
    }

    async fn entries(&self, keyspace: Keyspace) -> Result<Vec<(String, String)>, RegistryError> {
        let keys = self.keys(keyspace).await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn(keyspace);
        let values: Vec<Option<String>> =
            redis::cmd("MGET").arg(&keys).query_async(&mut conn).await?;
        Ok(keys
            .into_iter()
            .zip(values)
            .filter_map(|(key, value)| value.map(|value| (key, value)))
            .collect())
    }
}
