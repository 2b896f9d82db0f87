//! Zero-copy IPv4 header view
//!
//! The forwarding loops only need addresses (and occasionally ports) to pick
//! a next hop, and they forward the original bytes untouched. `Ipv4View`
//! validates just enough of the header to read those fields without
//! allocating.

use std::net::Ipv4Addr;

use crate::error::PacketError;

/// Minimum IPv4 header length (no options)
pub const IPV4_MIN_HEADER_LEN: usize = 20;

/// IP protocol number for TCP
pub const IPPROTO_TCP: u8 = 6;

/// IP protocol number for UDP
pub const IPPROTO_UDP: u8 = 17;

/// IP protocol number for ICMP
pub const IPPROTO_ICMP: u8 = 1;

/// Borrowed view over a raw IPv4 datagram
#[derive(Debug, Clone, Copy)]
pub struct Ipv4View<'a> {
    buf: &'a [u8],
    header_len: usize,
    total_len: usize,
}

impl<'a> Ipv4View<'a> {
    /// Validate the IPv4 header of `buf` and return a view over it.
    ///
    /// Trailing bytes beyond the header's total length are ignored.
    ///
    /// # Errors
    ///
    /// Returns `PacketError::Malformed` if the buffer is too short, is not
    /// IPv4, or carries an inconsistent header or total length.
    pub fn new(buf: &'a [u8]) -> Result<Self, PacketError> {
        if buf.len() < IPV4_MIN_HEADER_LEN {
            return Err(PacketError::malformed(format!(
                "IPv4 packet too short: {} < {}",
                buf.len(),
                IPV4_MIN_HEADER_LEN
            )));
        }

        let version = buf[0] >> 4;
        if version != 4 {
            return Err(PacketError::malformed(format!("IP version {version} is not 4")));
        }

        let header_len = usize::from(buf[0] & 0x0F) * 4;
        if header_len < IPV4_MIN_HEADER_LEN || header_len > buf.len() {
            return Err(PacketError::malformed(format!(
                "invalid IPv4 header length {header_len} for {} byte buffer",
                buf.len()
            )));
        }

        let total_len = usize::from(u16::from_be_bytes([buf[2], buf[3]]));
        if total_len < header_len || total_len > buf.len() {
            return Err(PacketError::malformed(format!(
                "invalid IPv4 total length {total_len} for {} byte buffer",
                buf.len()
            )));
        }

        Ok(Self {
            buf,
            header_len,
            total_len,
        })
    }

    /// Source overlay address
    #[must_use]
    pub fn source(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.buf[12], self.buf[13], self.buf[14], self.buf[15])
    }

    /// Destination overlay address
    #[must_use]
    pub fn destination(&self) -> Ipv4Addr {
        Ipv4Addr::new(self.buf[16], self.buf[17], self.buf[18], self.buf[19])
    }

    /// IP protocol number
    #[must_use]
    pub fn protocol(&self) -> u8 {
        self.buf[9]
    }

    /// Header length in bytes, options included
    #[must_use]
    pub const fn header_len(&self) -> usize {
        self.header_len
    }

    /// Total datagram length from the header
    #[must_use]
    pub const fn total_len(&self) -> usize {
        self.total_len
    }

    /// Raw flags + fragment offset word
    #[must_use]
    pub fn flags_fragment(&self) -> u16 {
        u16::from_be_bytes([self.buf[6], self.buf[7]])
    }

    /// True if this is a fragment (MF set or non-zero offset)
    #[must_use]
    pub fn is_fragment(&self) -> bool {
        self.flags_fragment() & 0x3FFF != 0
    }

    /// Header bytes, options included
    #[must_use]
    pub fn header(&self) -> &'a [u8] {
        &self.buf[..self.header_len]
    }

    /// Bytes after the IPv4 header, up to the total length
    #[must_use]
    pub fn payload(&self) -> &'a [u8] {
        &self.buf[self.header_len..self.total_len]
    }

    /// The datagram bytes, trailing padding excluded
    #[must_use]
    pub fn as_bytes(&self) -> &'a [u8] {
        &self.buf[..self.total_len]
    }

    fn has_ports(&self) -> bool {
        matches!(self.protocol(), IPPROTO_TCP | IPPROTO_UDP)
            && !self.is_fragment()
            && self.payload().len() >= 4
    }

    /// Transport source port, if a TCP or UDP header is present
    #[must_use]
    pub fn source_port(&self) -> Option<u16> {
        self.has_ports().then(|| {
            let l4 = self.payload();
            u16::from_be_bytes([l4[0], l4[1]])
        })
    }

    /// Transport destination port, if a TCP or UDP header is present
    #[must_use]
    pub fn destination_port(&self) -> Option<u16> {
        self.has_ports().then(|| {
            let l4 = self.payload();
            u16::from_be_bytes([l4[2], l4[3]])
        })
    }
}
