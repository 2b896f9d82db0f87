//! TUN device interface
//!
//! Creates a layer-3 TUN device with `tun-rs`, assigns the local overlay
//! address and MTU, and exposes it as a [`VirtualInterface`]. Routing the
//! remote overlay ranges into the device is left to the host configuration.

use std::io;
use std::net::Ipv4Addr;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tun_rs::{AsyncDevice, DeviceBuilder};

use super::{closed_error, VirtualInterface};

/// Virtual interface backed by an OS TUN device
pub struct TunInterface {
    device: AsyncDevice,
    name: String,
    closed: CancellationToken,
}

impl std::fmt::Debug for TunInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunInterface").field("name", &self.name).finish()
    }
}

impl TunInterface {
    /// Create and bring up a TUN device.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the device cannot be created, typically for
    /// lack of `CAP_NET_ADMIN`.
    pub fn create(name: &str, address: Ipv4Addr, prefix_len: u8, mtu: u16) -> io::Result<Self> {
        let device = DeviceBuilder::new()
            .name(name)
            .ipv4(address, prefix_len, None)
            .mtu(mtu)
            .build_async()?;
        let name = device.name().unwrap_or_else(|_| name.to_string());

        info!(name = %name, address = %address, prefix_len, mtu, "TUN device created");

        Ok(Self {
            device,
            name,
            closed: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl VirtualInterface for TunInterface {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        tokio::select! {
            biased;
            () = self.closed.cancelled() => Err(closed_error(&self.name)),
            result = self.device.recv(buf) => result,
        }
    }

    async fn send(&self, packet: &[u8]) -> io::Result<usize> {
        if self.closed.is_cancelled() {
            return Err(closed_error(&self.name));
        }
        self.device.send(packet).await
    }

    fn close(&self) {
        self.closed.cancel();
    }

    fn name(&self) -> &str {
        &self.name
    }
}
