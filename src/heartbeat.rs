//! Registry liveness heartbeats
//!
//! Relays and services announce themselves by rewriting their registry
//! record on a fixed interval with a TTL longer than the interval. A node
//! that stops beating disappears from the registry once the TTL runs out;
//! nothing else has to notice it died.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::RegistryError;
use crate::registry::{Keyspace, Registry};

/// Relay heartbeat interval
pub const RELAY_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Relay record lifetime
pub const RELAY_HEARTBEAT_TTL: Duration = Duration::from_secs(2);

/// Service heartbeat interval
pub const SERVICE_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Service record lifetime
pub const SERVICE_HEARTBEAT_TTL: Duration = Duration::from_secs(10);

/// Periodic writer of one TTL'd registry record
#[derive(Debug, Clone)]
pub struct Heartbeat {
    registry: Arc<dyn Registry>,
    keyspace: Keyspace,
    key: String,
    value: String,
    interval: Duration,
    ttl: Duration,
}

impl Heartbeat {
    /// Heartbeat for an arbitrary record
    pub fn new(
        registry: Arc<dyn Registry>,
        keyspace: Keyspace,
        key: impl Into<String>,
        value: impl Into<String>,
        interval: Duration,
        ttl: Duration,
    ) -> Self {
        Self {
            registry,
            keyspace,
            key: key.into(),
            value: value.into(),
            interval,
            ttl,
        }
    }

    /// `Relays[name] = endpoint`, every second with a two second TTL
    pub fn relay(
        registry: Arc<dyn Registry>,
        name: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self::new(
            registry,
            Keyspace::Relays,
            name,
            endpoint,
            RELAY_HEARTBEAT_INTERVAL,
            RELAY_HEARTBEAT_TTL,
        )
    }

    /// `Services[address] = endpoint`, every five seconds with a ten second TTL
    pub fn service(
        registry: Arc<dyn Registry>,
        address: Ipv4Addr,
        endpoint: impl Into<String>,
    ) -> Self {
        Self::new(
            registry,
            Keyspace::Services,
            address.to_string(),
            endpoint,
            SERVICE_HEARTBEAT_INTERVAL,
            SERVICE_HEARTBEAT_TTL,
        )
    }

    /// Override interval and TTL
    #[must_use]
    pub fn with_timing(mut self, interval: Duration, ttl: Duration) -> Self {
        self.interval = interval;
        self.ttl = ttl;
        self
    }

    /// Record key
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Beat interval
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    /// Record lifetime
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Write the record once.
    ///
    /// A write that takes longer than the interval is abandoned.
    ///
    /// # Errors
    ///
    /// Returns `RegistryError::Timeout` on overrun, or the backend error.
    pub async fn beat_once(&self) -> Result<(), RegistryError> {
        let write = self
            .registry
            .set(self.keyspace, &self.key, &self.value, Some(self.ttl));
        match tokio::time::timeout(self.interval, write).await {
            Ok(result) => result,
            Err(_) => Err(RegistryError::Timeout(self.interval)),
        }
    }

    /// Beat until `cancel` fires.
    ///
    /// Failed writes are logged and retried on the next tick.
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            keyspace = %self.keyspace,
            key = %self.key,
            value = %self.value,
            interval_ms = self.interval.as_millis() as u64,
            ttl_ms = self.ttl.as_millis() as u64,
            "heartbeat started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut failures: u32 = 0;

        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.beat_once().await {
                Ok(()) => {
                    if failures > 0 {
                        info!(key = %self.key, failures, "heartbeat recovered");
                    }
                    failures = 0;
                    debug!(keyspace = %self.keyspace, key = %self.key, "heartbeat written");
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    warn!(
                        keyspace = %self.keyspace,
                        key = %self.key,
                        error = %e,
                        failures,
                        "heartbeat write failed"
                    );
                }
            }
        }

        info!(key = %self.key, "heartbeat stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MemoryRegistry;

    #[test]
    fn test_role_timings() {
        let registry: Arc<dyn Registry> = Arc::new(MemoryRegistry::new());

        let relay = Heartbeat::relay(Arc::clone(&registry), "relay-a", "203.0.113.1:5114");
        assert_eq!(relay.interval(), Duration::from_secs(1));
        assert_eq!(relay.ttl(), Duration::from_secs(2));

        let service =
            Heartbeat::service(registry, Ipv4Addr::new(10, 0, 0, 5), "198.51.100.7:32000");
        assert_eq!(service.key(), "10.0.0.5");
        assert_eq!(service.interval(), Duration::from_secs(5));
        assert_eq!(service.ttl(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_record_lives_while_beating_and_expires_after() {
        let backend = Arc::new(MemoryRegistry::new());
        let registry: Arc<dyn Registry> = backend.clone();
        let heartbeat = Heartbeat::relay(registry, "relay-a", "203.0.113.1:5114");

        let cancel = CancellationToken::new();
        let task = tokio::spawn(heartbeat.run(cancel.clone()));

        for _ in 0..5 {
            tokio::time::sleep(Duration::from_millis(700)).await;
            assert_eq!(
                backend.get(Keyspace::Relays, "relay-a").await.unwrap().as_deref(),
                Some("203.0.113.1:5114")
            );
        }

        cancel.cancel();
        task.await.unwrap();

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(backend.get(Keyspace::Relays, "relay-a").await.unwrap(), None);
    }
}
