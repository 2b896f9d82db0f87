//! Fleet configuration
//!
//! A client needs four facts before it can join the overlay: its own
//! overlay address, the overlay ranges served through relays, the relay to
//! start with and where the scheduler listens. The identity service hands
//! these out as a JSON record:
//!
//! ```json
//! {
//!   "serverCIDR": "10.0.0.0/24,10.0.1.0/24",
//!   "firstProxyAddress": "relay1:5114",
//!   "schedulerAddress": "10.0.0.250:5525",
//!   "vip": "7.12.34.56"
//! }
//! ```
//!
//! [`FleetDirectory`] abstracts where the record comes from.

use std::net::Ipv4Addr;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::allocator::{AddressAllocator, AllocatorError};
use crate::error::RegistryError;
use crate::registry::{Keyspace, Registry};

/// Fleet configuration errors
#[derive(Debug, thiserror::Error)]
pub enum FleetError {
    /// Record field could not be interpreted
    #[error("Invalid fleet record field {field}: {reason}")]
    InvalidRecord { field: &'static str, reason: String },

    /// No overlay address could be assigned
    #[error("Address allocation failed: {0}")]
    Allocation(#[from] AllocatorError),

    /// Assignment could not be recorded
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

impl FleetError {
    fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidRecord {
            field,
            reason: reason.into(),
        }
    }
}

/// Wire form of the identity service record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetRecord {
    /// Comma-separated overlay ranges reachable through relays
    #[serde(rename = "serverCIDR")]
    pub server_cidr: String,
    /// Initial relay `host:port`
    #[serde(rename = "firstProxyAddress")]
    pub first_proxy_address: String,
    /// Scheduler `host:port`
    #[serde(rename = "schedulerAddress")]
    pub scheduler_address: String,
    /// Client overlay address
    pub vip: String,
}

impl FleetRecord {
    /// Parse a record from JSON
    ///
    /// # Errors
    ///
    /// Returns `FleetError::InvalidRecord` if the JSON is malformed.
    pub fn from_json(json: &str) -> Result<Self, FleetError> {
        serde_json::from_str(json).map_err(|e| FleetError::invalid("record", e.to_string()))
    }

    /// Validate and convert into a [`FleetConfig`]
    ///
    /// # Errors
    ///
    /// Returns `FleetError::InvalidRecord` naming the first bad field.
    pub fn into_config(self) -> Result<FleetConfig, FleetError> {
        let relay_cidrs = parse_cidr_list(&self.server_cidr)?;
        let overlay_address = self
            .vip
            .trim()
            .parse::<Ipv4Addr>()
            .map_err(|e| FleetError::invalid("vip", format!("{}: {e}", self.vip)))?;
        if self.first_proxy_address.trim().is_empty() {
            return Err(FleetError::invalid("firstProxyAddress", "empty"));
        }
        if self.scheduler_address.trim().is_empty() {
            return Err(FleetError::invalid("schedulerAddress", "empty"));
        }
        Ok(FleetConfig {
            overlay_address,
            relay_cidrs,
            initial_relay: self.first_proxy_address.trim().to_string(),
            scheduler_address: self.scheduler_address.trim().to_string(),
        })
    }
}

fn parse_cidr_list(list: &str) -> Result<Vec<Ipv4Net>, FleetError> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<Ipv4Net>()
                .map(|net| net.trunc())
                .map_err(|e| FleetError::invalid("serverCIDR", format!("{s}: {e}")))
        })
        .collect()
}

/// Everything a client needs to join the overlay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FleetConfig {
    /// This client's overlay address
    pub overlay_address: Ipv4Addr,
    /// Overlay ranges reachable through relays
    pub relay_cidrs: Vec<Ipv4Net>,
    /// Relay to use until the scheduler assigns one
    pub initial_relay: String,
    /// Scheduler control endpoint
    pub scheduler_address: String,
}

impl FleetConfig {
    /// Convert back to the wire record
    #[must_use]
    pub fn to_record(&self) -> FleetRecord {
        FleetRecord {
            server_cidr: self
                .relay_cidrs
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(","),
            first_proxy_address: self.initial_relay.clone(),
            scheduler_address: self.scheduler_address.clone(),
            vip: self.overlay_address.to_string(),
        }
    }

    /// Record the initial relay as this client's assignment, so the relay
    /// admits it before the scheduler has run.
    ///
    /// # Errors
    ///
    /// Propagates the registry error.
    pub async fn seed_assignment(&self, registry: &dyn Registry) -> Result<(), FleetError> {
        registry
            .set(
                Keyspace::Clients,
                &self.overlay_address.to_string(),
                &self.initial_relay,
                None,
            )
            .await?;
        debug!(
            client = %self.overlay_address,
            relay = %self.initial_relay,
            "seeded relay assignment"
        );
        Ok(())
    }
}

/// Source of per-account fleet configuration
#[async_trait]
pub trait FleetDirectory: Send + Sync + std::fmt::Debug {
    /// Fleet configuration for `account`
    async fn fleet_config(&self, account: &str) -> Result<FleetConfig, FleetError>;
}

/// Directory returning one fixed configuration
#[derive(Debug, Clone)]
pub struct StaticFleetDirectory {
    config: FleetConfig,
}

impl StaticFleetDirectory {
    /// Serve `config` for every account
    #[must_use]
    pub fn new(config: FleetConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl FleetDirectory for StaticFleetDirectory {
    async fn fleet_config(&self, _account: &str) -> Result<FleetConfig, FleetError> {
        Ok(self.config.clone())
    }
}

/// Directory that assigns each account its own overlay address and seeds
/// its relay assignment, for single-host deployments without an identity
/// service.
#[derive(Debug)]
pub struct LocalFleetDirectory {
    relay_cidrs: Vec<Ipv4Net>,
    initial_relay: String,
    scheduler_address: String,
    allocator: AddressAllocator,
    accounts: DashMap<String, Ipv4Addr>,
    registry: Arc<dyn Registry>,
}

impl LocalFleetDirectory {
    /// Create a directory allocating from `client_range`
    pub fn new(
        client_range: Ipv4Net,
        relay_cidrs: Vec<Ipv4Net>,
        initial_relay: impl Into<String>,
        scheduler_address: impl Into<String>,
        registry: Arc<dyn Registry>,
    ) -> Self {
        Self {
            relay_cidrs,
            initial_relay: initial_relay.into(),
            scheduler_address: scheduler_address.into(),
            allocator: AddressAllocator::new(client_range),
            accounts: DashMap::new(),
            registry,
        }
    }

    /// Address assigned to `account`, if any
    #[must_use]
    pub fn address_of(&self, account: &str) -> Option<Ipv4Addr> {
        self.accounts.get(account).map(|entry| *entry.value())
    }
}

#[async_trait]
impl FleetDirectory for LocalFleetDirectory {
    async fn fleet_config(&self, account: &str) -> Result<FleetConfig, FleetError> {
        let overlay_address = match self.address_of(account) {
            Some(addr) => addr,
            None => {
                let addr = self.allocator.allocate()?;
                let assigned = *self.accounts.entry(account.to_string()).or_insert(addr);
                if assigned == addr {
                    info!(account, address = %addr, "assigned overlay address");
                } else {
                    // Lost a race with a concurrent request for the same account
                    self.allocator.release(addr);
                }
                assigned
            }
        };
        let config = FleetConfig {
            overlay_address,
            relay_cidrs: self.relay_cidrs.clone(),
            initial_relay: self.initial_relay.clone(),
            scheduler_address: self.scheduler_address.clone(),
        };
        config.seed_assignment(self.registry.as_ref()).await?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::is_assignable;
    use crate::registry::MemoryRegistry;

    const RECORD: &str = r#"{
        "serverCIDR": "10.0.0.0/24, 10.0.1.7/24",
        "firstProxyAddress": "relay1:5114",
        "schedulerAddress": "10.0.0.250:5525",
        "vip": "7.12.34.56"
    }"#;

    #[test]
    fn test_record_into_config() {
        let config = FleetRecord::from_json(RECORD).unwrap().into_config().unwrap();
        assert_eq!(config.overlay_address, Ipv4Addr::new(7, 12, 34, 56));
        assert_eq!(
            config.relay_cidrs,
            vec!["10.0.0.0/24".parse::<Ipv4Net>().unwrap(), "10.0.1.0/24".parse().unwrap()]
        );
        assert_eq!(config.initial_relay, "relay1:5114");
        assert_eq!(config.to_record().server_cidr, "10.0.0.0/24,10.0.1.0/24");
    }

    #[test]
    fn test_record_rejects_bad_fields() {
        let mut record = FleetRecord::from_json(RECORD).unwrap();
        record.vip = "not-an-ip".into();
        assert!(matches!(
            record.into_config(),
            Err(FleetError::InvalidRecord { field: "vip", .. })
        ));

        let mut record = FleetRecord::from_json(RECORD).unwrap();
        record.server_cidr = "10.0.0.0/33".into();
        assert!(matches!(
            record.into_config(),
            Err(FleetError::InvalidRecord { field: "serverCIDR", .. })
        ));
    }

    #[tokio::test]
    async fn test_local_directory_assigns_stable_addresses() {
        let registry = Arc::new(MemoryRegistry::new());
        let range: Ipv4Net = "7.0.0.0/24".parse().unwrap();
        let directory = LocalFleetDirectory::new(
            range,
            vec!["10.0.0.0/24".parse().unwrap()],
            "relay1:5114",
            "10.0.0.250:5525",
            registry.clone(),
        );

        let alice = directory.fleet_config("alice").await.unwrap();
        let again = directory.fleet_config("alice").await.unwrap();
        let bob = directory.fleet_config("bob").await.unwrap();

        assert_eq!(alice.overlay_address, again.overlay_address);
        assert_ne!(alice.overlay_address, bob.overlay_address);
        assert!(is_assignable(&range, alice.overlay_address));
        assert_eq!(
            registry
                .get(Keyspace::Clients, &alice.overlay_address.to_string())
                .await
                .unwrap()
                .as_deref(),
            Some("relay1:5114")
        );
    }
}
