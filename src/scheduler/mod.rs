//! Fleet scheduling
//!
//! - [`FleetScheduler`]: server side, assigns clients to live relays over
//!   TCP control sessions and records assignments in the registry
//! - [`ControlAgent`]: client side, applies switch commands to the client
//!   bridge and acknowledges them
//!
//! See [`protocol`] for the wire format.

mod agent;
pub mod protocol;
mod server;

pub use agent::{ControlAgent, DEFAULT_RECONNECT_DELAY};
pub use server::{FleetScheduler, SessionState, DEFAULT_ACK_TIMEOUT, DEFAULT_SCHEDULE_INTERVAL};
