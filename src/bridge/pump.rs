//! Interface/transport packet pumps
//!
//! A bridge couples one virtual interface with one UDP socket through two
//! independent loops:
//!
//! - outbound: interface -> parse -> resolve endpoint -> `send_to`
//! - inbound: `recv_from` -> parse -> admit -> interface write
//!
//! Bytes are forwarded exactly as read. Packets that fail to parse, have no
//! route or are not admitted are dropped and counted; they never stop a loop.
//! A read failure that is not part of a requested shutdown ends its loop
//! with an error, and either loop ending tears the whole bridge down.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::stats::{run_reporter, DropReason, TrafficStats};
use super::stats::{DEFAULT_REPORT_INTERVAL, DEFAULT_REPORT_THRESHOLD};
use super::strategy::ForwardingStrategy;
use crate::error::BridgeError;
use crate::iface::{VirtualInterface, PACKET_BUFFER_SIZE};
use crate::packet::Ipv4View;

/// Bidirectional forwarder between a virtual interface and a UDP transport
pub struct Bridge<I: ?Sized, S: ?Sized> {
    iface: Arc<I>,
    socket: Arc<UdpSocket>,
    strategy: Arc<S>,
    stats: Arc<TrafficStats>,
    report_interval: Duration,
    report_threshold: u64,
}

impl<I, S> Bridge<I, S>
where
    I: VirtualInterface + ?Sized,
    S: ForwardingStrategy + ?Sized,
{
    /// Create a bridge with fresh statistics and the default report cadence
    pub fn new(iface: Arc<I>, socket: Arc<UdpSocket>, strategy: Arc<S>) -> Self {
        Self {
            iface,
            socket,
            strategy,
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

    /// Traffic counters, shared with the running pumps
    pub fn stats(&self) -> Arc<TrafficStats> {
        Arc::clone(&self.stats)
    }

    /// Local address of the transport socket
    ///
    /// # Errors
    ///
    /// Returns the socket error if the address cannot be read.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Run both pumps until `cancel` fires or one of them fails.
    ///
    /// On return both pumps and the reporter have stopped and the interface
    /// has been closed. Cancellation yields `Ok(())`.
    ///
    /// # Errors
    ///
    /// Returns the first pump failure: `TransportClosed` if the socket read
    /// failed, `Interface` if the interface failed, `Task` if a pump panicked.
    pub async fn run(self, cancel: CancellationToken) -> Result<(), BridgeError> {
        let shutdown = cancel.child_token();
        let role = self.strategy.role();
        info!(
            role,
            iface = self.iface.name(),
            local = ?self.socket.local_addr().ok(),
            "bridge started"
        );

        let mut outbound = tokio::spawn(outbound_loop(
            Arc::clone(&self.iface),
            Arc::clone(&self.socket),
            Arc::clone(&self.strategy),
            Arc::clone(&self.stats),
            shutdown.clone(),
        ));
        let mut inbound = tokio::spawn(inbound_loop(
            Arc::clone(&self.iface),
            Arc::clone(&self.socket),
            Arc::clone(&self.strategy),
            Arc::clone(&self.stats),
            shutdown.clone(),
        ));
        let reporter = tokio::spawn(run_reporter(
            Arc::clone(&self.stats),
            self.report_interval,
            self.report_threshold,
            shutdown.clone(),
        ));

        let (first, second) = tokio::select! {
            res = &mut outbound => {
                shutdown.cancel();
                self.iface.close();
                (res, inbound.await)
            }
            res = &mut inbound => {
                shutdown.cancel();
                self.iface.close();
                (res, outbound.await)
            }
        };
        shutdown.cancel();
        if let Err(e) = reporter.await {
            debug!(error = %e, "reporter task ended abnormally");
        }

        let result = flatten(first).and(flatten(second));
        let snapshot = self.stats.snapshot();
        match &result {
            Ok(()) => info!(role, rx = snapshot.rx_bytes, tx = snapshot.tx_bytes, "bridge stopped"),
            Err(e) => warn!(role, error = %e, "bridge stopped with error"),
        }
        result
    }
}

fn flatten(joined: Result<Result<(), BridgeError>, JoinError>) -> Result<(), BridgeError> {
    joined.map_err(|e| BridgeError::Task(e.to_string()))?
}

async fn outbound_loop<I, S>(
    iface: Arc<I>,
    socket: Arc<UdpSocket>,
    strategy: Arc<S>,
    stats: Arc<TrafficStats>,
    cancel: CancellationToken,
) -> Result<(), BridgeError>
where
    I: VirtualInterface + ?Sized,
    S: ForwardingStrategy + ?Sized,
{
    let mut buf = vec![0u8; PACKET_BUFFER_SIZE];
    loop {
        let n = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            res = iface.recv(&mut buf) => match res {
                Ok(n) => n,
                Err(_) if cancel.is_cancelled() => return Ok(()),
                Err(e) => {
                    warn!(iface = iface.name(), error = %e, "interface read failed");
                    return Err(BridgeError::Interface(e));
                }
            },
        };
        let packet = &buf[..n];

        let view = match Ipv4View::new(packet) {
            Ok(view) => view,
            Err(e) => {
                stats.record_drop(DropReason::Malformed);
                debug!(len = n, error = %e, "dropping unparseable packet from interface");
                continue;
            }
        };
        let endpoint = match strategy.resolve(&view) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                stats.record_drop(DropReason::NoRoute);
                trace!(src = %view.source(), error = %e, "dropping unroutable packet");
                continue;
            }
        };

        match socket.send_to(packet, endpoint).await {
            Ok(sent) => stats.record_tx(sent),
            Err(_) if cancel.is_cancelled() => return Ok(()),
            Err(e) => {
                stats.record_drop(DropReason::SendFailed);
                debug!(endpoint = %endpoint, error = %e, "transport send failed");
            }
        }
    }
}

async fn inbound_loop<I, S>(
    iface: Arc<I>,
    socket: Arc<UdpSocket>,
    strategy: Arc<S>,
    stats: Arc<TrafficStats>,
    cancel: CancellationToken,
) -> Result<(), BridgeError>
where
    I: VirtualInterface + ?Sized,
    S: ForwardingStrategy + ?Sized,
{
    let mut buf = vec![0u8; PACKET_BUFFER_SIZE];
    loop {
        let (n, from) = tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            res = socket.recv_from(&mut buf) => match res {
                Ok(received) => received,
                Err(_) if cancel.is_cancelled() => return Ok(()),
                Err(e) => {
                    warn!(error = %e, "transport read failed");
                    return Err(BridgeError::TransportClosed(e));
                }
            },
        };
        stats.record_rx(n);
        let packet = &buf[..n];

        let view = match Ipv4View::new(packet) {
            Ok(view) => view,
            Err(e) => {
                stats.record_drop(DropReason::Malformed);
                debug!(
                    from = %from,
                    len = n,
                    error = %e,
                    "dropping unparseable packet from transport"
                );
                continue;
            }
        };
        if !strategy.admit(&view, from) {
            stats.record_drop(DropReason::NotAdmitted);
            trace!(from = %from, src = %view.source(), "packet not admitted");
            continue;
        }

        // A host that stops draining must not hold the loop past shutdown
        tokio::select! {
            biased;
            () = cancel.cancelled() => return Ok(()),
            res = iface.send(packet) => match res {
                Ok(_) => {}
                Err(_) if cancel.is_cancelled() => return Ok(()),
                Err(e) => {
                    warn!(iface = iface.name(), error = %e, "interface write failed");
                    return Err(BridgeError::Interface(e));
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{bind_transport, ClientStrategy};
    use crate::iface::ChannelInterface;
    use crate::packet::Packet;
    use std::net::Ipv4Addr;

    fn udp(src: [u8; 4], dst: [u8; 4], payload: &[u8]) -> Vec<u8> {
        Packet::udp(Ipv4Addr::from(src), Ipv4Addr::from(dst), 1000, 2000, payload.to_vec())
            .serialize()
            .unwrap()
    }

    #[tokio::test]
    async fn test_client_bridge_forwards_both_ways() {
        let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = relay.local_addr().unwrap();

        let (iface, mut handle) = ChannelInterface::pair("ov0", 16);
        let socket = Arc::new(bind_transport("127.0.0.1:0".parse().unwrap()).unwrap());
        let client_addr = socket.local_addr().unwrap();
        let strategy = Arc::new(ClientStrategy::new(relay_addr, Vec::new()));
        let bridge = Bridge::new(Arc::new(iface), socket, strategy);
        let stats = bridge.stats();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(bridge.run(cancel.clone()));

        let outbound = udp([7, 0, 0, 2], [10, 0, 0, 5], b"ping");
        handle.inject(outbound.clone()).await.unwrap();
        let mut buf = [0u8; 2000];
        let (n, from) = relay.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], outbound.as_slice());
        assert_eq!(from, client_addr);

        let reply = udp([10, 0, 0, 5], [7, 0, 0, 2], b"pong");
        relay.send_to(&reply, client_addr).await.unwrap();
        let delivered = handle.capture().await.unwrap();
        assert_eq!(delivered.as_ref(), reply.as_slice());

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert_eq!(stats.tx_bytes(), outbound.len() as u64);
        assert_eq!(stats.rx_bytes(), reply.len() as u64);
    }

    #[tokio::test]
    async fn test_malformed_packet_is_dropped_not_fatal() {
        let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = relay.local_addr().unwrap();

        let (iface, handle) = ChannelInterface::pair("ov0", 16);
        let socket = Arc::new(bind_transport("127.0.0.1:0".parse().unwrap()).unwrap());
        let strategy = Arc::new(ClientStrategy::new(relay_addr, Vec::new()));
        let bridge = Bridge::new(Arc::new(iface), socket, strategy);
        let stats = bridge.stats();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(bridge.run(cancel.clone()));

        handle.inject(vec![0u8; 10]).await.unwrap();
        let good = udp([7, 0, 0, 2], [10, 0, 0, 5], b"after");
        handle.inject(good.clone()).await.unwrap();

        let mut buf = [0u8; 2000];
        let (n, _) = relay.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], good.as_slice());
        assert_eq!(stats.dropped(DropReason::Malformed), 1);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_interface_failure_ends_bridge_with_error() {
        let (iface, handle) = ChannelInterface::pair("ov0", 16);
        let iface = Arc::new(iface);
        let socket = Arc::new(bind_transport("127.0.0.1:0".parse().unwrap()).unwrap());
        let strategy = Arc::new(ClientStrategy::new("127.0.0.1:9".parse().unwrap(), Vec::new()));
        let bridge = Bridge::new(Arc::clone(&iface), socket, strategy);

        let task = tokio::spawn(bridge.run(CancellationToken::new()));
        // Dropping the host side makes interface reads fail
        drop(handle);

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(BridgeError::Interface(_))));
        assert!(iface.is_closed());
    }

    #[tokio::test]
    async fn test_cancel_while_interface_is_full() {
        let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let relay_addr = relay.local_addr().unwrap();

        // Room for one packet, and the host never captures
        let (iface, _handle) = ChannelInterface::pair("ov0", 1);
        let socket = Arc::new(bind_transport("127.0.0.1:0".parse().unwrap()).unwrap());
        let client_addr = socket.local_addr().unwrap();
        let strategy = Arc::new(ClientStrategy::new(relay_addr, Vec::new()));
        let bridge = Bridge::new(Arc::new(iface), socket, strategy);
        let stats = bridge.stats();

        let cancel = CancellationToken::new();
        let task = tokio::spawn(bridge.run(cancel.clone()));

        for i in 0..3u8 {
            let packet = udp([10, 0, 0, 5], [7, 0, 0, 2], &[i; 16]);
            relay.send_to(&packet, client_addr).await.unwrap();
        }
        // Wait until the inbound loop is parked on the full interface
        while stats.snapshot().rx_packets < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        cancel.cancel();
        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("bridge did not stop after cancel")
            .unwrap();
        assert!(result.is_ok());
    }
}
