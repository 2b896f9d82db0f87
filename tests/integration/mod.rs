//! Integration tests for overlay-router
//!
//! Every test runs on loopback sockets with in-process interfaces and the
//! in-memory registry, so no TUN device, Redis or privileges are needed.
//!
//! # Test Organization
//!
//! - `data_path`: client -> relay -> service round trips and relay teardown
//! - `fleet`: scheduler switchover, liveness expiry and assignment balance

pub mod data_path;
pub mod fleet;

use std::future::Future;
use std::net::Ipv4Addr;
use std::time::Duration;

use overlay_router::packet::Packet;

/// Serialized UDP-in-IPv4 packet
pub fn udp_packet(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8]) -> Vec<u8> {
    Packet::udp(src, dst, 40000, 8080, payload.to_vec())
        .serialize()
        .unwrap()
}

/// Poll `probe` every 10ms until it yields a value, panicking after 5s
pub async fn wait_for<T, F, Fut>(what: &str, mut probe: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(value) = probe().await {
            return value;
        }
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
