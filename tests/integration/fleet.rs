//! Fleet control tests
//!
//! Relay liveness through heartbeats, scheduler assignment and the client
//! switching relays on command.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;

use overlay_router::bridge::{bind_transport, Bridge, ClientStrategy};
use overlay_router::heartbeat::Heartbeat;
use overlay_router::iface::ChannelInterface;
use overlay_router::registry::{live_relays, Keyspace, MemoryRegistry, Registry};
use overlay_router::scheduler::{ControlAgent, FleetScheduler, SessionState};

use super::{udp_packet, wait_for};

const CLIENT: Ipv4Addr = Ipv4Addr::new(7, 0, 0, 2);
const SERVICE: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);

async fn recv_packet(socket: &UdpSocket) -> (Vec<u8>, SocketAddr) {
    let mut buf = [0u8; 2000];
    let (n, from) = tokio::time::timeout(Duration::from_secs(5), socket.recv_from(&mut buf))
        .await
        .expect("no packet received")
        .unwrap();
    (buf[..n].to_vec(), from)
}

#[tokio::test]
async fn test_scheduler_switches_client_relay() {
    let registry = Arc::new(MemoryRegistry::new());
    let relay_a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let relay_b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let relay_b_addr = relay_b.local_addr().unwrap();
    // Only relay B is alive
    registry
        .set(Keyspace::Relays, "relay-b", &relay_b_addr.to_string(), Some(Duration::from_secs(30)))
        .await
        .unwrap();

    let cancel = CancellationToken::new();

    let (iface, handle) = ChannelInterface::pair("ov0", 16);
    let socket = Arc::new(bind_transport("127.0.0.1:0".parse().unwrap()).unwrap());
    let client_addr = socket.local_addr().unwrap();
    let strategy = Arc::new(ClientStrategy::new(relay_a.local_addr().unwrap(), Vec::new()));
    let bridge_task = tokio::spawn(
        Bridge::new(Arc::new(iface), socket, Arc::clone(&strategy)).run(cancel.clone()),
    );

    let first = udp_packet(CLIENT, SERVICE, b"before");
    handle.inject(first.clone()).await.unwrap();
    assert_eq!(recv_packet(&relay_a).await, (first, client_addr));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let scheduler_addr = listener.local_addr().unwrap();
    let scheduler = Arc::new(
        FleetScheduler::new(registry.clone())
            .with_interval(Duration::from_millis(50))
            .with_ack_timeout(Duration::from_secs(1)),
    );
    let scheduler_task = tokio::spawn(Arc::clone(&scheduler).run(listener, cancel.clone()));

    let agent = ControlAgent::new(scheduler_addr.to_string(), Arc::clone(&strategy))
        .with_reconnect_delay(Duration::from_millis(50));
    let agent_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { agent.run(cancel).await })
    };

    wait_for("relay switch", || {
        let strategy = Arc::clone(&strategy);
        async move { (strategy.current_relay() == relay_b_addr).then_some(()) }
    })
    .await;
    assert_eq!(strategy.switch_count(), 1);

    let second = udp_packet(CLIENT, SERVICE, b"after");
    handle.inject(second.clone()).await.unwrap();
    assert_eq!(recv_packet(&relay_b).await, (second, client_addr));

    // The assignment is keyed by the address the control session came from
    let assigned = registry.get(Keyspace::Clients, "127.0.0.1").await.unwrap();
    assert_eq!(assigned, Some(relay_b_addr.to_string()));

    let state = wait_for("acknowledged assignment", || {
        let scheduler = Arc::clone(&scheduler);
        async move {
            scheduler
                .sessions()
                .into_values()
                .find(|state| matches!(state, SessionState::Assigned(_)))
        }
    })
    .await;
    assert_eq!(state, SessionState::Assigned(relay_b_addr.to_string()));

    cancel.cancel();
    bridge_task.await.unwrap().unwrap();
    scheduler_task.await.unwrap();
    agent_task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_silent_relay_leaves_rotation() {
    let registry = Arc::new(MemoryRegistry::new());
    let mut beats = HashMap::new();
    for (name, endpoint) in [
        ("relay-a", "203.0.113.1:5114"),
        ("relay-b", "203.0.113.2:5114"),
        ("relay-c", "203.0.113.3:5114"),
    ] {
        let cancel = CancellationToken::new();
        let registry: Arc<dyn Registry> = registry.clone();
        let task = tokio::spawn(Heartbeat::relay(registry, name, endpoint).run(cancel.clone()));
        beats.insert(name, (cancel, task));
    }

    tokio::time::sleep(Duration::from_millis(10)).await;
    let names: Vec<_> = live_relays(registry.as_ref())
        .await
        .unwrap()
        .into_iter()
        .map(|relay| relay.name)
        .collect();
    assert_eq!(names, ["relay-a", "relay-b", "relay-c"]);

    let (cancel, task) = beats.remove("relay-b").unwrap();
    cancel.cancel();
    task.await.unwrap();

    // Past the 2s TTL the silent relay is gone while the others keep beating
    tokio::time::sleep(Duration::from_millis(2100)).await;
    let names: Vec<_> = live_relays(registry.as_ref())
        .await
        .unwrap()
        .into_iter()
        .map(|relay| relay.name)
        .collect();
    assert_eq!(names, ["relay-a", "relay-c"]);

    let scheduler = FleetScheduler::new(registry.clone());
    for host in 1..=6u8 {
        let client = IpAddr::V4(Ipv4Addr::new(7, 0, 0, host));
        let endpoint = scheduler.assign(client).await.unwrap().unwrap();
        assert_ne!(endpoint, "203.0.113.2:5114");
    }

    for (cancel, task) in beats.into_values() {
        cancel.cancel();
        task.await.unwrap();
    }
}

#[tokio::test]
async fn test_assignments_spread_evenly() {
    let registry = Arc::new(MemoryRegistry::new());
    let endpoints = ["203.0.113.1:5114", "203.0.113.2:5114", "203.0.113.3:5114"];
    for (i, endpoint) in endpoints.iter().enumerate() {
        registry
            .set(Keyspace::Relays, &format!("relay-{i}"), endpoint, Some(Duration::from_secs(30)))
            .await
            .unwrap();
    }

    let scheduler = FleetScheduler::new(registry.clone());
    let clients = 7u8;
    let mut load: HashMap<String, usize> = HashMap::new();
    for host in 1..=clients {
        let client = IpAddr::V4(Ipv4Addr::new(7, 0, 0, host));
        let endpoint = scheduler.assign(client).await.unwrap().unwrap();
        assert_eq!(
            registry.get(Keyspace::Clients, &client.to_string()).await.unwrap(),
            Some(endpoint.clone())
        );
        *load.entry(endpoint).or_default() += 1;
    }

    // 7 clients over 3 relays: nobody carries more than ceil(7/3)
    assert_eq!(load.len(), endpoints.len());
    assert!(load.values().all(|&n| (2..=3).contains(&n)), "{load:?}");
}
