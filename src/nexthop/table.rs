//! Next-hop routing table
//!
//! Resolves an overlay destination to the physical endpoint that currently
//! represents it. Exact single-address routes win over CIDR routes; CIDR
//! routes are tried in insertion order and the first containing range wins.
//! Overlapping CIDRs are not ordered by prefix length.
//!
//! Exact routes are held in a bounded [`ClientPool`]; once it is full the
//! least recently used exact route is evicted. CIDR routes come from
//! configuration and are not bounded.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;

use ipnet::Ipv4Net;
use parking_lot::RwLock;

use super::pool::{ClientPool, DEFAULT_CLIENT_POOL_CAPACITY};
use crate::error::RouteError;

/// Key of a routing entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteKey {
    /// A single overlay address
    Address(Ipv4Addr),
    /// A range of overlay addresses
    Cidr(Ipv4Net),
}

impl RouteKey {
    /// Normalize a `/32` range to a single address and truncate host bits
    #[must_use]
    pub fn normalized(self) -> Self {
        match self {
            Self::Cidr(net) if net.prefix_len() == 32 => Self::Address(net.addr()),
            Self::Cidr(net) => Self::Cidr(net.trunc()),
            key @ Self::Address(_) => key,
        }
    }
}

impl From<Ipv4Addr> for RouteKey {
    fn from(addr: Ipv4Addr) -> Self {
        Self::Address(addr)
    }
}

impl From<Ipv4Net> for RouteKey {
    fn from(net: Ipv4Net) -> Self {
        Self::Cidr(net).normalized()
    }
}

impl FromStr for RouteKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains('/') {
            s.parse::<Ipv4Net>()
                .map(Self::from)
                .map_err(|e| format!("invalid CIDR {s:?}: {e}"))
        } else {
            s.parse::<Ipv4Addr>()
                .map(Self::from)
                .map_err(|e| format!("invalid address {s:?}: {e}"))
        }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address(addr) => write!(f, "{addr}"),
            Self::Cidr(net) => write!(f, "{net}"),
        }
    }
}

/// Thread-safe next-hop table
#[derive(Debug)]
pub struct NextHopTable {
    exact: ClientPool,
    cidrs: RwLock<Vec<(Ipv4Net, SocketAddr)>>,
}

impl NextHopTable {
    /// Create an empty table with the default exact-route capacity
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CLIENT_POOL_CAPACITY)
    }

    /// Create an empty table holding at most `capacity` exact routes
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            exact: ClientPool::new(capacity),
            cidrs: RwLock::new(Vec::new()),
        }
    }

    /// Insert or replace the route for `key`
    pub fn set_route(&self, key: impl Into<RouteKey>, endpoint: SocketAddr) {
        match key.into().normalized() {
            RouteKey::Address(addr) => {
                self.exact.learn(addr, endpoint);
            }
            RouteKey::Cidr(net) => {
                let mut cidrs = self.cidrs.write();
                if let Some(entry) = cidrs.iter_mut().find(|(existing, _)| *existing == net) {
                    entry.1 = endpoint;
                } else {
                    cidrs.push((net, endpoint));
                }
            }
        }
    }

    /// Resolve `addr` to its next hop.
    ///
    /// # Errors
    ///
    /// Returns `RouteError::NotFound` if no exact or CIDR route covers `addr`.
    pub fn lookup(&self, addr: Ipv4Addr) -> Result<SocketAddr, RouteError> {
        if let Some(endpoint) = self.exact.get(addr) {
            return Ok(endpoint);
        }
        self.cidrs
            .read()
            .iter()
            .find(|(net, _)| net.contains(&addr))
            .map(|(_, endpoint)| *endpoint)
            .ok_or(RouteError::NotFound(addr))
    }

    /// Remove the route for `key`, returning its endpoint if present
    pub fn remove_route(&self, key: impl Into<RouteKey>) -> Option<SocketAddr> {
        match key.into().normalized() {
            RouteKey::Address(addr) => self.exact.remove(addr),
            RouteKey::Cidr(net) => {
                let mut cidrs = self.cidrs.write();
                let index = cidrs.iter().position(|(existing, _)| *existing == net)?;
                Some(cidrs.remove(index).1)
            }
        }
    }

    /// Number of routes of both kinds
    #[must_use]
    pub fn len(&self) -> usize {
        self.exact.len() + self.cidrs.read().len()
    }

    /// True if the table holds no routes
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for NextHopTable {
    fn default() -> Self {
        Self::new()
    }
}
