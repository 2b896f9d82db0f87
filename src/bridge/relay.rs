//! Relay forwarder
//!
//! A relay terminates no traffic. Every datagram it receives carries an
//! overlay packet that is sent on, unmodified, to the endpoint of the
//! packet's destination:
//!
//! 1. Admission: the source must be a client assigned to this relay (its
//!    `Clients` record names this relay's public host) or a registered
//!    service.
//! 2. Next hop: learned endpoints first, then static and preloaded routes,
//!    then the `Services` keyspace.
//! 3. The source address is learned at the endpoint the datagram came from,
//!    so replies find their way back.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::stats::{run_reporter, DropReason, TrafficStats};
use super::stats::{DEFAULT_REPORT_INTERVAL, DEFAULT_REPORT_THRESHOLD};
use crate::error::{BridgeError, RegistryError};
use crate::iface::PACKET_BUFFER_SIZE;
use crate::nexthop::{ClientPool, Learned, NextHopTable, RouteKey};
use crate::packet::Ipv4View;
use crate::registry::{endpoint_host, CachedRegistry, Keyspace, Registry};

/// Forwarding core of a relay node
#[derive(Debug)]
pub struct RelayForwarder {
    socket: Arc<UdpSocket>,
    registry: Arc<CachedRegistry>,
    public_host: String,
    learned: ClientPool,
    routes: NextHopTable,
    stats: Arc<TrafficStats>,
    report_interval: Duration,
    report_threshold: u64,
}

impl RelayForwarder {
    /// Create a forwarder.
    ///
    /// `public_host` is the host part of the endpoint this relay publishes;
    /// clients whose assignment names it are admitted.
    pub fn new(
        socket: Arc<UdpSocket>,
        registry: Arc<CachedRegistry>,
        public_host: impl Into<String>,
        learned: ClientPool,
    ) -> Self {
        Self {
            socket,
            registry,
            public_host: public_host.into(),
            learned,
            routes: NextHopTable::new(),
            stats: Arc::new(TrafficStats::new()),
            report_interval: DEFAULT_REPORT_INTERVAL,
            report_threshold: DEFAULT_REPORT_THRESHOLD,
        }
    }

    /// Override the throughput report interval and byte threshold
    #[must_use]
    pub fn with_report(mut self, interval: Duration, threshold: u64) -> Self {
        self.report_interval = interval;
        self.report_threshold = threshold;
        self
    }

    /// Static and preloaded routes
    #[must_use]
    pub fn routes(&self) -> &NextHopTable {
        &self.routes
    }

    /// Endpoints learned from inbound traffic
    #[must_use]
    pub fn learned(&self) -> &ClientPool {
        &self.learned
    }

    /// Traffic counters
    #[must_use]
    pub fn stats(&self) -> Arc<TrafficStats> {
        Arc::clone(&self.stats)
    }

    /// Local address of the relay socket
    ///
    /// # Errors
    ///
    /// Returns the socket error if the address cannot be read.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Install a static route
    pub fn add_route(&self, key: impl Into<RouteKey>, endpoint: SocketAddr) {
        self.routes.set_route(key, endpoint);
    }

    /// Load every registered service into the route table.
    ///
    /// Entries with an unparseable address or unresolvable endpoint are
    /// skipped. Returns the number of routes installed.
    ///
    /// # Errors
    ///
    /// Propagates the registry error if the keyspace cannot be listed.
    pub async fn preload_services(&self) -> Result<usize, RegistryError> {
        let entries = self.registry.entries(Keyspace::Services).await?;
        let mut installed = 0;
        for (vip, endpoint) in entries {
            let Ok(address) = vip.parse::<Ipv4Addr>() else {
                warn!(key = %vip, "ignoring service record with invalid address");
                continue;
            };
            let Ok(Some(resolved)) = self.registry.resolve(&endpoint).await else {
                warn!(service = %address, endpoint = %endpoint, "cannot resolve service endpoint");
                continue;
            };
            self.routes.set_route(address, resolved);
            debug!(service = %address, endpoint = %resolved, "preloaded service route");
            installed += 1;
        }
        info!(count = installed, "service routes preloaded");
        Ok(installed)
    }

    /// Whether traffic from `source` may transit this relay
    pub async fn is_admitted(&self, source: Ipv4Addr) -> bool {
        let key = source.to_string();
        match self.registry.lookup(Keyspace::Clients, &key).await {
            Ok(Some(assigned)) if endpoint_host(&assigned) == self.public_host => return true,
            Ok(_) => {}
            Err(e) => trace!(src = %source, error = %e, "client lookup failed"),
        }
        match self.registry.lookup(Keyspace::Services, &key).await {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                trace!(src = %source, error = %e, "service lookup failed");
                false
            }
        }
    }

    /// Endpoint for `destination`, or `None` if it is unknown everywhere
    pub async fn next_hop(&self, destination: Ipv4Addr) -> Option<SocketAddr> {
        if let Some(endpoint) = self.learned.get(destination) {
            return Some(endpoint);
        }
        if let Ok(endpoint) = self.routes.lookup(destination) {
            return Some(endpoint);
        }
        match self
            .registry
            .lookup(Keyspace::Services, &destination.to_string())
            .await
        {
            Ok(Some(endpoint)) => match self.registry.resolve(&endpoint).await {
                Ok(resolved) => resolved,
                Err(e) => {
                    trace!(
                        dst = %destination,
                        endpoint = %endpoint,
                        error = %e,
                        "resolution failed"
                    );
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                trace!(dst = %destination, error = %e, "service lookup failed");
                None
            }
        }
    }

    /// Process one datagram received from `from`.
    ///
    /// Returns the endpoint the packet was sent to, or `None` if it was
    /// dropped.
    pub async fn forward(&self, packet: &[u8], from: SocketAddr) -> Option<SocketAddr> {
        let view = match Ipv4View::new(packet) {
            Ok(view) => view,
            Err(e) => {
                self.stats.record_drop(DropReason::Malformed);
                debug!(
                    from = %from,
                    len = packet.len(),
                    error = %e,
                    "dropping unparseable datagram"
                );
                return None;
            }
        };
        let (source, destination) = (view.source(), view.destination());

        if !self.is_admitted(source).await {
            self.stats.record_drop(DropReason::NotAdmitted);
            trace!(src = %source, from = %from, "source not admitted");
            return None;
        }

        let Some(endpoint) = self.next_hop(destination).await else {
            self.stats.record_drop(DropReason::NoRoute);
            trace!(src = %source, dst = %destination, "no next hop");
            return None;
        };

        match self.learned.learn(source, from) {
            Learned::New => debug!(client = %source, endpoint = %from, "learned endpoint"),
            Learned::Moved(old) => {
                debug!(client = %source, from = %old, to = %from, "endpoint moved");
            }
            Learned::Refreshed => {}
        }

        match self.socket.send_to(packet, endpoint).await {
            Ok(sent) => {
                self.stats.record_tx(sent);
                trace!(src = %source, dst = %destination, next_hop = %endpoint, "forwarded");
                Some(endpoint)
            }
            Err(e) => {
                self.stats.record_drop(DropReason::SendFailed);
                debug!(next_hop = %endpoint, error = %e, "relay send failed");
                None
            }
        }
    }

    /// Receive and forward until `cancel` fires.
    ///
    /// # Errors
    ///
    /// Returns `TransportClosed` if the socket read fails outside shutdown.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<(), BridgeError> {
        let shutdown = cancel.child_token();
        let reporter = tokio::spawn(run_reporter(
            Arc::clone(&self.stats),
            self.report_interval,
            self.report_threshold,
            shutdown.clone(),
        ));
        info!(
            local = ?self.socket.local_addr().ok(),
            public_host = %self.public_host,
            "relay forwarding started"
        );

        let mut buf = vec![0u8; PACKET_BUFFER_SIZE];
        let result = loop {
            let (n, from) = tokio::select! {
                biased;
                () = shutdown.cancelled() => break Ok(()),
                res = self.socket.recv_from(&mut buf) => match res {
                    Ok(received) => received,
                    Err(_) if shutdown.is_cancelled() => break Ok(()),
                    Err(e) => {
                        warn!(error = %e, "relay socket read failed");
                        break Err(BridgeError::TransportClosed(e));
                    }
                },
            };
            self.stats.record_rx(n);
            self.forward(&buf[..n], from).await;
        };

        shutdown.cancel();
        if let Err(e) = reporter.await {
            debug!(error = %e, "reporter task ended abnormally");
        }
        info!("relay forwarding stopped");
        result
    }
}
