//! Overlay data plane
//!
//! Moves raw IPv4 packets between virtual interfaces and UDP transport
//! sockets.
//!
//! # Roles
//!
//! - Client: [`Bridge`] with [`ClientStrategy`], everything goes to the
//!   assigned relay, which can be switched at runtime
//! - Service: [`Bridge`] with [`ServiceStrategy`], replies go to the endpoint
//!   each client was last seen at
//! - Relay: [`RelayForwarder`], socket to socket with an admission gate and
//!   registry-backed next-hop resolution

mod pump;
mod relay;
mod stats;
mod strategy;
mod transport;

pub use pump::Bridge;
pub use relay::RelayForwarder;
pub use stats::{
    format_bytes, run_reporter, DropReason, IntervalReport, TrafficSnapshot, TrafficStats,
    DEFAULT_REPORT_INTERVAL, DEFAULT_REPORT_THRESHOLD,
};
pub use strategy::{ClientStrategy, ForwardingStrategy, ServiceStrategy};
pub use transport::{bind_transport, SOCKET_BUFFER_SIZE};
