//! overlay-router: overlay network data plane and fleet control
//!
//! Clients reach protected services through a fleet of relays. Each client
//! and service endpoint bridges a virtual interface to a UDP socket; relays
//! forward raw IPv4 packets between them, and a scheduler spreads clients
//! across the relays that are currently alive.
//!
//! # Features
//!
//! - **Bridges**: virtual interface <-> UDP transport, one per client or service
//! - **Relay forwarding**: admission gate, learned return paths, registry lookups
//! - **Liveness**: TTL heartbeats into a shared registry (Redis or in-memory)
//! - **Scheduling**: round-robin relay assignment over a line-oriented TCP protocol
//!
//! # Architecture
//!
//! ```text
//! app → TUN → client bridge ──UDP──▶ relay ──UDP──▶ service bridge → TUN → service
//!                 ▲                    │ ▲
//!            switch relay        heartbeat│ │Clients / Services
//!                 │                    ▼ │
//!             scheduler ─────────────▶ registry
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use overlay_router::config::{load_config, Role};
//! use overlay_router::runtime::{open_registry, run_relay};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/overlay-router/config.json")?;
//! config.validate_for(Role::Relay)?;
//!
//! let registry = open_registry(&config).await?;
//! run_relay(&config, registry, CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`allocator`]: Overlay address allocation
//! - [`bridge`]: Interface bridges and the relay forwarder
//! - [`config`]: Configuration types and loading
//! - [`error`]: Error types
//! - [`fleet`]: Per-client fleet configuration
//! - [`heartbeat`]: Registry liveness records
//! - [`iface`]: Virtual interfaces
//! - [`nexthop`]: Learned client endpoints and static routes
//! - [`packet`]: IPv4 packet views and the legacy frame codec
//! - [`registry`]: Shared key/value registry
//! - [`runtime`]: Role runtimes
//! - [`scheduler`]: Fleet scheduler and client control agent

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod allocator;
pub mod bridge;
pub mod config;
pub mod error;
pub mod fleet;
pub mod heartbeat;
pub mod iface;
pub mod nexthop;
pub mod packet;
pub mod registry;
pub mod runtime;
pub mod scheduler;

// Re-export commonly used types at the crate root
pub use bridge::{Bridge, ClientStrategy, ForwardingStrategy, RelayForwarder, ServiceStrategy};
pub use config::{Config, Role};
pub use error::{
    BridgeError, ConfigError, OverlayError, PacketError, RegistryError, RouteError, SchedulerError,
};
pub use fleet::{FleetConfig, FleetDirectory, FleetError, FleetRecord};
pub use heartbeat::Heartbeat;
pub use iface::{ChannelInterface, VirtualInterface};
pub use nexthop::{ClientPool, NextHopTable, RouteKey};
pub use packet::{Ipv4View, LegacyFrame, Packet};
pub use registry::{Keyspace, MemoryRegistry, Registry};
pub use scheduler::{ControlAgent, FleetScheduler};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
