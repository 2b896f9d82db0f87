//! IPv4 packet codec
//!
//! - [`Ipv4View`]: borrowed header view for the forwarding hot path
//! - [`Packet`]: owned, editable model with checksum-correct serialization
//! - [`legacy::LegacyFrame`]: the superseded envelope format

pub mod checksum;
mod ipv4;
pub mod legacy;
mod view;

pub use checksum::{ipv4_header_checksum, transport_checksum, verify_ipv4_checksum};
pub use ipv4::{Field, Packet, TcpHeader, Transport};
pub use legacy::LegacyFrame;
pub use view::{Ipv4View, IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP, IPV4_MIN_HEADER_LEN};
