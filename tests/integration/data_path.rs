//! Data path tests
//!
//! A client bridge, a relay started through the relay runtime and a service
//! bridge exchange packets over loopback UDP.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use overlay_router::bridge::{bind_transport, Bridge, ClientStrategy, ServiceStrategy};
use overlay_router::config::Config;
use overlay_router::error::OverlayError;
use overlay_router::iface::{ChannelInterface, InterfaceHandle};
use overlay_router::nexthop::ClientPool;
use overlay_router::registry::{Keyspace, MemoryRegistry, Registry};
use overlay_router::runtime;

use super::{udp_packet, wait_for};

const CLIENT: Ipv4Addr = Ipv4Addr::new(7, 0, 0, 2);
const SERVICE: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
const RELAY_NAME: &str = "relay-it";

struct RunningRelay {
    addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<Result<(), OverlayError>>,
}

async fn start_relay(registry: Arc<MemoryRegistry>) -> RunningRelay {
    let mut config = Config::default();
    config.relay.name = RELAY_NAME.into();
    config.relay.listen = "127.0.0.1:0".parse().unwrap();
    config.relay.public_host = "127.0.0.1".into();
    config.relay.heartbeat_interval_ms = 50;
    config.relay.heartbeat_ttl_ms = 200;

    let cancel = CancellationToken::new();
    let task = {
        let registry: Arc<dyn Registry> = registry.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { runtime::run_relay(&config, registry, cancel).await })
    };

    let endpoint = wait_for("relay heartbeat", || {
        let registry = registry.clone();
        async move { registry.get(Keyspace::Relays, RELAY_NAME).await.unwrap() }
    })
    .await;

    RunningRelay {
        addr: endpoint.parse().unwrap(),
        cancel,
        task,
    }
}

fn start_service(
    cancel: &CancellationToken,
) -> (SocketAddr, InterfaceHandle, JoinHandle<Result<(), overlay_router::BridgeError>>) {
    let (iface, handle) = ChannelInterface::pair("ovs0", 16);
    let socket = Arc::new(bind_transport("127.0.0.1:0".parse().unwrap()).unwrap());
    let addr = socket.local_addr().unwrap();
    let strategy = Arc::new(ServiceStrategy::new(Arc::new(ClientPool::new(64))));
    let bridge = Bridge::new(Arc::new(iface), socket, strategy);
    (addr, handle, tokio::spawn(bridge.run(cancel.clone())))
}

async fn capture(handle: &mut InterfaceHandle) -> Vec<u8> {
    tokio::time::timeout(Duration::from_secs(5), handle.capture())
        .await
        .expect("no packet delivered")
        .expect("interface closed")
        .to_vec()
}

#[tokio::test]
async fn test_client_reaches_service_through_relay() {
    let registry = Arc::new(MemoryRegistry::new());
    let cancel = CancellationToken::new();

    let (service_addr, mut service_handle, service_task) = start_service(&cancel);
    registry
        .set(Keyspace::Services, &SERVICE.to_string(), &service_addr.to_string(), None)
        .await
        .unwrap();

    let relay = start_relay(registry.clone()).await;
    registry
        .set(Keyspace::Clients, &CLIENT.to_string(), &relay.addr.to_string(), None)
        .await
        .unwrap();

    let (client_iface, mut client_handle) = ChannelInterface::pair("ov0", 16);
    let client_socket = Arc::new(bind_transport("127.0.0.1:0".parse().unwrap()).unwrap());
    let strategy = Arc::new(ClientStrategy::new(
        relay.addr,
        vec!["10.0.0.0/24".parse().unwrap()],
    ));
    let client = Bridge::new(Arc::new(client_iface), client_socket, strategy);
    let client_stats = client.stats();
    let client_task = tokio::spawn(client.run(cancel.clone()));

    let request = udp_packet(CLIENT, SERVICE, b"GET /");
    client_handle.inject(request.clone()).await.unwrap();
    assert_eq!(capture(&mut service_handle).await, request);

    // The reply finds its way back through the endpoint the relay learned
    let reply = udp_packet(SERVICE, CLIENT, b"200 OK");
    service_handle.inject(reply.clone()).await.unwrap();
    assert_eq!(capture(&mut client_handle).await, reply);

    // Traffic outside the relay ranges never leaves the client
    client_handle
        .inject(udp_packet(CLIENT, Ipv4Addr::new(192, 168, 1, 1), b"lan"))
        .await
        .unwrap();

    cancel.cancel();
    relay.cancel.cancel();
    client_task.await.unwrap().unwrap();
    service_task.await.unwrap().unwrap();
    relay.task.await.unwrap().unwrap();

    assert_eq!(client_stats.tx_bytes(), request.len() as u64);
    assert_eq!(client_stats.rx_bytes(), reply.len() as u64);
}

#[tokio::test]
async fn test_relay_drops_unassigned_clients() {
    let registry = Arc::new(MemoryRegistry::new());
    let cancel = CancellationToken::new();

    let (service_addr, mut service_handle, service_task) = start_service(&cancel);
    registry
        .set(Keyspace::Services, &SERVICE.to_string(), &service_addr.to_string(), None)
        .await
        .unwrap();

    let relay = start_relay(registry.clone()).await;
    // Assigned to some other relay
    registry
        .set(Keyspace::Clients, "7.0.0.9", "198.51.100.20:5114", None)
        .await
        .unwrap();
    registry
        .set(Keyspace::Clients, &CLIENT.to_string(), &relay.addr.to_string(), None)
        .await
        .unwrap();

    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let rejected = udp_packet(Ipv4Addr::new(7, 0, 0, 9), SERVICE, b"elsewhere");
    let unknown = udp_packet(Ipv4Addr::new(7, 0, 0, 77), SERVICE, b"stranger");
    let admitted = udp_packet(CLIENT, SERVICE, b"hello");
    sender.send_to(&rejected, relay.addr).await.unwrap();
    sender.send_to(&unknown, relay.addr).await.unwrap();
    sender.send_to(&admitted, relay.addr).await.unwrap();

    assert_eq!(capture(&mut service_handle).await, admitted);
    assert!(service_handle.try_capture().is_none());

    cancel.cancel();
    relay.cancel.cancel();
    service_task.await.unwrap().unwrap();
    relay.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_relay_shutdown_stops_heartbeat() {
    let registry = Arc::new(MemoryRegistry::new());
    let relay = start_relay(registry.clone()).await;

    relay.cancel.cancel();
    let result = tokio::time::timeout(Duration::from_secs(5), relay.task)
        .await
        .expect("relay did not stop");
    assert!(result.unwrap().is_ok());

    // No more beats, so the record lapses after its TTL
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(registry
        .get(Keyspace::Relays, RELAY_NAME)
        .await
        .unwrap()
        .is_none());
}
