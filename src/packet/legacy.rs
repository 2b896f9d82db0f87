//! Legacy 15-byte envelope
//!
//! Early relays wrapped each payload in a small envelope instead of carrying
//! raw IP packets. The current transport sends raw datagrams; this codec only
//! exists so old captures and peers can be decoded in compatibility tests.
//!
//! ```text
//! byte 0      : version (bits 0-2) | ip version (bit 3) | type (bits 4-7)
//! bytes 1-4   : source IPv4
//! bytes 5-6   : source port (little-endian)
//! bytes 7-10  : destination IPv4
//! bytes 11-12 : destination port (little-endian)
//! bytes 13-14 : data length (little-endian)
//! bytes 15..  : data
//! ```

use std::net::{Ipv4Addr, SocketAddrV4};

use crate::error::PacketError;

/// Envelope header length
pub const LEGACY_HEADER_LEN: usize = 15;

const VERSION_MASK: u8 = 0b0000_0111;
const IP_VERSION_MASK: u8 = 0b0000_1000;
const TYPE_MASK: u8 = 0b1111_0000;

/// A decoded legacy envelope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyFrame {
    /// Envelope version, 0-7
    pub version: u8,
    /// 0 for IPv4, 1 for IPv6
    pub ip_version: u8,
    /// Frame type, 0-15 (0 = data transfer)
    pub kind: u8,
    pub source: SocketAddrV4,
    pub destination: SocketAddrV4,
    pub data: Vec<u8>,
}

impl LegacyFrame {
    /// Encode into the envelope wire format.
    ///
    /// # Errors
    ///
    /// Returns `PacketError::Malformed` if a bit field overflows its width
    /// or the data does not fit the 16-bit length.
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        if self.version > VERSION_MASK || self.ip_version > 1 || self.kind > 0x0F {
            return Err(PacketError::malformed(format!(
                "legacy header fields out of range: version={}, ip_version={}, type={}",
                self.version, self.ip_version, self.kind
            )));
        }
        let len = u16::try_from(self.data.len())
            .map_err(|_| PacketError::malformed("legacy frame data exceeds 65535 bytes"))?;

        let mut out = Vec::with_capacity(LEGACY_HEADER_LEN + self.data.len());
        out.push(self.version | (self.ip_version << 3) | (self.kind << 4));
        out.extend_from_slice(&self.source.ip().octets());
        out.extend_from_slice(&self.source.port().to_le_bytes());
        out.extend_from_slice(&self.destination.ip().octets());
        out.extend_from_slice(&self.destination.port().to_le_bytes());
        out.extend_from_slice(&len.to_le_bytes());
        out.extend_from_slice(&self.data);
        Ok(out)
    }

    /// Decode an envelope.
    ///
    /// # Errors
    ///
    /// Returns `PacketError::Malformed` if the buffer is shorter than the
    /// header or than the declared data length.
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < LEGACY_HEADER_LEN {
            return Err(PacketError::malformed(format!(
                "legacy frame too short: {} < {LEGACY_HEADER_LEN}",
                bytes.len()
            )));
        }

        let byte0 = bytes[0];
        let len = usize::from(u16::from_le_bytes([bytes[13], bytes[14]]));
        let data = &bytes[LEGACY_HEADER_LEN..];
        if data.len() < len {
            return Err(PacketError::malformed(format!(
                "legacy frame declares {len} data bytes, has {}",
                data.len()
            )));
        }

        Ok(Self {
            version: byte0 & VERSION_MASK,
            ip_version: (byte0 & IP_VERSION_MASK) >> 3,
            kind: (byte0 & TYPE_MASK) >> 4,
            source: SocketAddrV4::new(
                Ipv4Addr::new(bytes[1], bytes[2], bytes[3], bytes[4]),
                u16::from_le_bytes([bytes[5], bytes[6]]),
            ),
            destination: SocketAddrV4::new(
                Ipv4Addr::new(bytes[7], bytes[8], bytes[9], bytes[10]),
                u16::from_le_bytes([bytes[11], bytes[12]]),
            ),
            data: data[..len].to_vec(),
        })
    }
}
