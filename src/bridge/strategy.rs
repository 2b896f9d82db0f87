//! Per-role forwarding strategies
//!
//! A [`Bridge`](super::Bridge) is the same pair of pumps for every role; what
//! differs is how an outbound packet picks its transport endpoint and which
//! inbound packets are let through. Those decisions live here.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use ipnet::Ipv4Net;
use tracing::{debug, info};

use crate::error::RouteError;
use crate::nexthop::{ClientPool, Learned};
use crate::packet::Ipv4View;

/// Routing and admission policy plugged into a bridge
pub trait ForwardingStrategy: Send + Sync + 'static {
    /// Transport endpoint for a packet read from the virtual interface
    ///
    /// # Errors
    ///
    /// Returns `RouteError::NotFound` if the packet has nowhere to go; the
    /// bridge drops it.
    fn resolve(&self, packet: &Ipv4View<'_>) -> Result<SocketAddr, RouteError>;

    /// Decide whether a packet received from `from` is written to the
    /// interface. Implementations may learn `from` as the source's endpoint.
    fn admit(&self, packet: &Ipv4View<'_>, from: SocketAddr) -> bool;

    /// Role name for logs
    fn role(&self) -> &'static str;
}

/// Client role: one correspondent, the currently assigned relay.
///
/// The relay can be replaced at any time with [`switch_relay`]; the next
/// outbound packet goes to the new relay and no pump is interrupted.
///
/// [`switch_relay`]: ClientStrategy::switch_relay
#[derive(Debug)]
pub struct ClientStrategy {
    relay: ArcSwap<SocketAddr>,
    relay_cidrs: Vec<Ipv4Net>,
    switches: AtomicU64,
}

impl ClientStrategy {
    /// Create a client strategy.
    ///
    /// Only destinations inside `relay_cidrs` are sent to the relay; an
    /// empty list sends everything.
    #[must_use]
    pub fn new(initial_relay: SocketAddr, relay_cidrs: Vec<Ipv4Net>) -> Self {
        Self {
            relay: ArcSwap::from_pointee(initial_relay),
            relay_cidrs,
            switches: AtomicU64::new(0),
        }
    }

    /// Relay currently receiving outbound traffic
    #[must_use]
    pub fn current_relay(&self) -> SocketAddr {
        **self.relay.load()
    }

    /// Replace the relay, returning the previous one
    pub fn switch_relay(&self, relay: SocketAddr) -> SocketAddr {
        let previous = *self.relay.swap(Arc::new(relay));
        if previous != relay {
            self.switches.fetch_add(1, Ordering::Relaxed);
            info!(from = %previous, to = %relay, "switched relay");
        }
        previous
    }

    /// Number of relay changes so far
    #[must_use]
    pub fn switch_count(&self) -> u64 {
        self.switches.load(Ordering::Relaxed)
    }

    /// Overlay ranges reachable through the relay
    #[must_use]
    pub fn relay_cidrs(&self) -> &[Ipv4Net] {
        &self.relay_cidrs
    }
}

impl ForwardingStrategy for ClientStrategy {
    fn resolve(&self, packet: &Ipv4View<'_>) -> Result<SocketAddr, RouteError> {
        let destination = packet.destination();
        if !self.relay_cidrs.is_empty()
            && !self.relay_cidrs.iter().any(|net| net.contains(&destination))
        {
            return Err(RouteError::NotFound(destination));
        }
        Ok(self.current_relay())
    }

    fn admit(&self, _packet: &Ipv4View<'_>, _from: SocketAddr) -> bool {
        true
    }

    fn role(&self) -> &'static str {
        "client"
    }
}

/// Service role: many clients, each reached at the endpoint its traffic last
/// arrived from.
#[derive(Debug)]
pub struct ServiceStrategy {
    clients: Arc<ClientPool>,
}

impl ServiceStrategy {
    /// Create a service strategy over a client pool
    #[must_use]
    pub fn new(clients: Arc<ClientPool>) -> Self {
        Self { clients }
    }

    /// Learned client endpoints
    #[must_use]
    pub fn clients(&self) -> &Arc<ClientPool> {
        &self.clients
    }
}

impl ForwardingStrategy for ServiceStrategy {
    fn resolve(&self, packet: &Ipv4View<'_>) -> Result<SocketAddr, RouteError> {
        let destination = packet.destination();
        self.clients
            .get(destination)
            .ok_or(RouteError::NotFound(destination))
    }

    fn admit(&self, packet: &Ipv4View<'_>, from: SocketAddr) -> bool {
        let source = packet.source();
        match self.clients.learn(source, from) {
            Learned::New => debug!(client = %source, endpoint = %from, "adding new connection"),
            Learned::Moved(old) => {
                debug!(client = %source, from = %old, to = %from, "client endpoint moved");
            }
            Learned::Refreshed => {}
        }
        true
    }

    fn role(&self) -> &'static str {
        "service"
    }
}
