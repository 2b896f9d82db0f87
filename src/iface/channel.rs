//! Channel-backed virtual interface
//!
//! Packets injected through the [`InterfaceHandle`] appear as reads on the
//! interface (traffic leaving the host), and packets the bridge writes to the
//! interface can be captured from the handle (traffic delivered to the host).
//! Used by tests and by embedders that run their own IP stack.
//!
//! # Example
//!
//! ```
//! use overlay_router::iface::{ChannelInterface, VirtualInterface};
//!
//! # async fn example() -> std::io::Result<()> {
//! let (iface, handle) = ChannelInterface::pair("ov0", 64);
//! handle.inject(vec![0x45u8; 20]).await.unwrap();
//!
//! let mut buf = [0u8; 2000];
//! let n = iface.recv(&mut buf).await?;
//! assert_eq!(n, 20);
//! # Ok(())
//! # }
//! ```

use std::io;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{closed_error, VirtualInterface};

/// In-process virtual interface
#[derive(Debug)]
pub struct ChannelInterface {
    name: String,
    outgoing: Mutex<mpsc::Receiver<Bytes>>,
    delivered: mpsc::Sender<Bytes>,
    closed: CancellationToken,
}

/// Host side of a [`ChannelInterface`]
#[derive(Debug)]
pub struct InterfaceHandle {
    outgoing: mpsc::Sender<Bytes>,
    delivered: mpsc::Receiver<Bytes>,
}

impl ChannelInterface {
    /// Create an interface and its host-side handle
    #[must_use]
    pub fn pair(name: impl Into<String>, capacity: usize) -> (Self, InterfaceHandle) {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(capacity);
        let (delivered_tx, delivered_rx) = mpsc::channel(capacity);
        let iface = Self {
            name: name.into(),
            outgoing: Mutex::new(outgoing_rx),
            delivered: delivered_tx,
            closed: CancellationToken::new(),
        };
        let handle = InterfaceHandle {
            outgoing: outgoing_tx,
            delivered: delivered_rx,
        };
        (iface, handle)
    }

    /// True once [`VirtualInterface::close`] has been called
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

#[async_trait]
impl VirtualInterface for ChannelInterface {
    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut outgoing = tokio::select! {
            biased;
            () = self.closed.cancelled() => return Err(closed_error(&self.name)),
            guard = self.outgoing.lock() => guard,
        };
        loop {
            let packet = tokio::select! {
                biased;
                () = self.closed.cancelled() => return Err(closed_error(&self.name)),
                packet = outgoing.recv() => packet,
            };
            let packet = packet.ok_or_else(|| {
                io::Error::new(io::ErrorKind::UnexpectedEof, "interface handle dropped")
            })?;
            if packet.len() > buf.len() {
                warn!(
                    iface = %self.name,
                    len = packet.len(),
                    capacity = buf.len(),
                    "dropping oversized packet"
                );
                continue;
            }
            buf[..packet.len()].copy_from_slice(&packet);
            return Ok(packet.len());
        }
    }

    async fn send(&self, packet: &[u8]) -> io::Result<usize> {
        let delivered = tokio::select! {
            biased;
            () = self.closed.cancelled() => return Err(closed_error(&self.name)),
            res = self.delivered.send(Bytes::copy_from_slice(packet)) => res,
        };
        delivered
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "interface handle dropped"))?;
        Ok(packet.len())
    }

    fn close(&self) {
        self.closed.cancel();
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl InterfaceHandle {
    /// Queue a packet to be read from the interface
    ///
    /// # Errors
    ///
    /// Returns the packet back if the interface was dropped.
    pub async fn inject(&self, packet: impl Into<Bytes>) -> Result<(), Bytes> {
        self.outgoing.send(packet.into()).await.map_err(|e| e.0)
    }

    /// Next packet the bridge delivered to the interface
    pub async fn capture(&mut self) -> Option<Bytes> {
        self.delivered.recv().await
    }

    /// Non-blocking variant of [`capture`](Self::capture)
    pub fn try_capture(&mut self) -> Option<Bytes> {
        self.delivered.try_recv().ok()
    }
}
