//! UDP transport socket setup

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::error::BridgeError;

/// Kernel socket buffer size requested for transport sockets
pub const SOCKET_BUFFER_SIZE: usize = 4 * 1024 * 1024;

/// Bind a non-blocking UDP socket for the overlay transport.
///
/// Larger kernel buffers are requested so short bursts are not dropped while
/// a pump is busy; failure to enlarge them is logged and ignored.
///
/// # Errors
///
/// Returns `BridgeError::Bind` if the socket cannot be created or bound.
pub fn bind_transport(addr: SocketAddr) -> Result<UdpSocket, BridgeError> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| BridgeError::bind(addr, format!("socket creation failed: {e}")))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| BridgeError::bind(addr, format!("set SO_REUSEADDR failed: {e}")))?;

    if let Err(e) = socket.set_recv_buffer_size(SOCKET_BUFFER_SIZE) {
        warn!(addr = %addr, error = %e, "could not enlarge UDP receive buffer");
    }
    if let Err(e) = socket.set_send_buffer_size(SOCKET_BUFFER_SIZE) {
        warn!(addr = %addr, error = %e, "could not enlarge UDP send buffer");
    }

    socket
        .set_nonblocking(true)
        .map_err(|e| BridgeError::bind(addr, format!("set nonblocking failed: {e}")))?;
    socket
        .bind(&addr.into())
        .map_err(|e| BridgeError::bind(addr, e.to_string()))?;

    let socket = UdpSocket::from_std(socket.into())
        .map_err(|e| BridgeError::bind(addr, format!("tokio registration failed: {e}")))?;

    debug!(local = ?socket.local_addr().ok(), "transport socket bound");
    Ok(socket)
}
