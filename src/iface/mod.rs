//! Virtual network interfaces
//!
//! The bridge only needs to read and write whole raw IPv4 packets. Creating
//! and addressing the OS device is outside the data plane; this module hides
//! it behind [`VirtualInterface`].
//!
//! - [`ChannelInterface`]: in-process interface backed by mpsc channels
//! - `TunInterface` (feature `tun`): a real TUN device via `tun-rs`

mod channel;
#[cfg(feature = "tun")]
mod tun;

use std::io;

use async_trait::async_trait;

pub use channel::{ChannelInterface, InterfaceHandle};
#[cfg(feature = "tun")]
pub use tun::TunInterface;

/// Default interface MTU
pub const DEFAULT_MTU: u16 = 1400;

/// Read buffer size; larger than any packet the interface delivers
pub const PACKET_BUFFER_SIZE: usize = 2000;

/// A packet-oriented virtual interface.
///
/// `recv` and `send` take `&self` so that the inbound and outbound pumps can
/// use the interface concurrently.
#[async_trait]
pub trait VirtualInterface: Send + Sync + 'static {
    /// Read one packet into `buf`, returning its length.
    ///
    /// A packet longer than `buf` is dropped, never truncated. After
    /// [`close`](Self::close) this returns an error promptly.
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write one packet
    async fn send(&self, packet: &[u8]) -> io::Result<usize>;

    /// Unblock pending reads and refuse further I/O
    fn close(&self);

    /// Interface name for logs
    fn name(&self) -> &str;
}

pub(crate) fn closed_error(name: &str) -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, format!("interface {name} closed"))
}
