//! Owned IPv4 packet model
//!
//! [`Packet`] is the editable representation used when addressing fields have
//! to change. Length and checksum fields are not stored: [`Packet::serialize`]
//! derives them from the content, so any packet produced by
//! [`Packet::parse`] serializes back to a datagram that parses to an equal
//! value, and edits never leave stale checksums behind.

use std::net::Ipv4Addr;

use crate::error::PacketError;

use super::checksum::{ipv4_header_checksum, transport_checksum};
use super::view::{Ipv4View, IPPROTO_TCP, IPPROTO_UDP, IPV4_MIN_HEADER_LEN};

const UDP_HEADER_LEN: usize = 8;
const TCP_MIN_HEADER_LEN: usize = 20;

/// Addressing field edit applied by [`Packet::mutate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Field {
    /// IPv4 source address
    Source(Ipv4Addr),
    /// IPv4 destination address
    Destination(Ipv4Addr),
    /// TCP/UDP source port
    SourcePort(u16),
    /// TCP/UDP destination port
    DestinationPort(u16),
    /// IP protocol number
    Protocol(u8),
    /// Transport payload (or the whole IP payload for other protocols)
    Payload(Vec<u8>),
}

/// TCP header fields other than ports and checksum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpHeader {
    pub sequence: u32,
    pub acknowledgement: u32,
    /// Control bits (NS..FIN), low 9 bits
    pub flags: u16,
    pub window: u16,
    pub urgent: u16,
    /// Options, padded to a 32-bit boundary
    pub options: Vec<u8>,
}

impl Default for TcpHeader {
    fn default() -> Self {
        Self {
            sequence: 0,
            acknowledgement: 0,
            flags: 0x018, // PSH | ACK
            window: 65535,
            urgent: 0,
            options: Vec::new(),
        }
    }
}

/// Transport layer of a packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transport {
    /// UDP datagram
    Udp {
        source_port: u16,
        destination_port: u16,
        payload: Vec<u8>,
    },
    /// TCP segment
    Tcp {
        source_port: u16,
        destination_port: u16,
        header: TcpHeader,
        payload: Vec<u8>,
    },
    /// Any other protocol, or a fragment
    Opaque(Vec<u8>),
}

/// An IPv4 datagram with its transport layer decoded where possible
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    tos: u8,
    identification: u16,
    flags_fragment: u16,
    ttl: u8,
    protocol: u8,
    source: Ipv4Addr,
    destination: Ipv4Addr,
    options: Vec<u8>,
    transport: Transport,
}

impl Packet {
    /// Build an unfragmented UDP packet
    #[must_use]
    pub fn udp(
        source: Ipv4Addr,
        destination: Ipv4Addr,
        source_port: u16,
        destination_port: u16,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self::with_transport(
            source,
            destination,
            IPPROTO_UDP,
            Transport::Udp {
                source_port,
                destination_port,
                payload: payload.into(),
            },
        )
    }

    /// Build an unfragmented TCP packet with default header fields
    #[must_use]
    pub fn tcp(
        source: Ipv4Addr,
        destination: Ipv4Addr,
        source_port: u16,
        destination_port: u16,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self::with_transport(
            source,
            destination,
            IPPROTO_TCP,
            Transport::Tcp {
                source_port,
                destination_port,
                header: TcpHeader::default(),
                payload: payload.into(),
            },
        )
    }

    fn with_transport(
        source: Ipv4Addr,
        destination: Ipv4Addr,
        protocol: u8,
        transport: Transport,
    ) -> Self {
        Self {
            tos: 0,
            identification: 0,
            flags_fragment: 0x4000, // DF
            ttl: 64,
            protocol,
            source,
            destination,
            options: Vec::new(),
            transport,
        }
    }

    /// Parse a raw IPv4 datagram.
    ///
    /// # Errors
    ///
    /// Returns `PacketError::Malformed` if the IPv4 header is invalid or a
    /// TCP/UDP header is truncated.
    pub fn parse(bytes: &[u8]) -> Result<Self, PacketError> {
        let view = Ipv4View::new(bytes)?;
        let header = view.header();
        let data = view.payload();

        let transport = if view.is_fragment() {
            Transport::Opaque(data.to_vec())
        } else {
            match view.protocol() {
                IPPROTO_UDP => parse_udp(data)?,
                IPPROTO_TCP => parse_tcp(data)?,
                _ => Transport::Opaque(data.to_vec()),
            }
        };

        Ok(Self {
            tos: header[1],
            identification: u16::from_be_bytes([header[4], header[5]]),
            flags_fragment: view.flags_fragment(),
            ttl: header[8],
            protocol: view.protocol(),
            source: view.source(),
            destination: view.destination(),
            options: header[IPV4_MIN_HEADER_LEN..].to_vec(),
            transport,
        })
    }

    /// Source address
    #[must_use]
    pub const fn source(&self) -> Ipv4Addr {
        self.source
    }

    /// Destination address
    #[must_use]
    pub const fn destination(&self) -> Ipv4Addr {
        self.destination
    }

    /// IP protocol number
    #[must_use]
    pub const fn protocol(&self) -> u8 {
        self.protocol
    }

    /// Time to live
    #[must_use]
    pub const fn ttl(&self) -> u8 {
        self.ttl
    }

    /// Decoded transport layer
    #[must_use]
    pub const fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Transport source port, if a TCP or UDP header is present
    #[must_use]
    pub fn source_port(&self) -> Option<u16> {
        match &self.transport {
            Transport::Udp { source_port, .. } | Transport::Tcp { source_port, .. } => {
                Some(*source_port)
            }
            Transport::Opaque(_) => None,
        }
    }

    /// Transport destination port, if a TCP or UDP header is present
    #[must_use]
    pub fn destination_port(&self) -> Option<u16> {
        match &self.transport {
            Transport::Udp {
                destination_port, ..
            }
            | Transport::Tcp {
                destination_port, ..
            } => Some(*destination_port),
            Transport::Opaque(_) => None,
        }
    }

    /// Transport payload (the whole IP payload for opaque packets)
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        match &self.transport {
            Transport::Udp { payload, .. } | Transport::Tcp { payload, .. } => payload,
            Transport::Opaque(data) => data,
        }
    }

    /// Overwrite one field in place.
    ///
    /// # Errors
    ///
    /// Returns `PacketError::MissingLayer` when a port is set on a packet
    /// without a TCP or UDP header.
    pub fn mutate(&mut self, field: Field) -> Result<(), PacketError> {
        match field {
            Field::Source(addr) => self.source = addr,
            Field::Destination(addr) => self.destination = addr,
            Field::Protocol(protocol) => self.protocol = protocol,
            Field::SourcePort(port) => match &mut self.transport {
                Transport::Udp { source_port, .. } | Transport::Tcp { source_port, .. } => {
                    *source_port = port;
                }
                Transport::Opaque(_) => return Err(PacketError::MissingLayer("transport")),
            },
            Field::DestinationPort(port) => match &mut self.transport {
                Transport::Udp {
                    destination_port, ..
                }
                | Transport::Tcp {
                    destination_port, ..
                } => *destination_port = port,
                Transport::Opaque(_) => return Err(PacketError::MissingLayer("transport")),
            },
            Field::Payload(bytes) => match &mut self.transport {
                Transport::Udp { payload, .. } | Transport::Tcp { payload, .. } => {
                    *payload = bytes;
                }
                Transport::Opaque(data) => *data = bytes,
            },
        }
        Ok(())
    }

    /// Serialize to wire format, recomputing lengths and checksums.
    ///
    /// # Errors
    ///
    /// Returns `PacketError::MissingLayer` if the protocol number calls for a
    /// TCP or UDP header that is not present (or the reverse), and
    /// `PacketError::Malformed` if the options are not 32-bit aligned or the
    /// datagram would exceed 65535 bytes.
    pub fn serialize(&self) -> Result<Vec<u8>, PacketError> {
        let fragment = self.flags_fragment & 0x3FFF != 0;
        match (&self.transport, self.protocol) {
            (Transport::Udp { .. }, IPPROTO_UDP) | (Transport::Tcp { .. }, IPPROTO_TCP) => {}
            (Transport::Opaque(_), IPPROTO_UDP) if !fragment => {
                return Err(PacketError::MissingLayer("UDP"));
            }
            (Transport::Opaque(_), IPPROTO_TCP) if !fragment => {
                return Err(PacketError::MissingLayer("TCP"));
            }
            (Transport::Opaque(_), _) => {}
            (Transport::Udp { .. }, _) => return Err(PacketError::MissingLayer("UDP protocol")),
            (Transport::Tcp { .. }, _) => return Err(PacketError::MissingLayer("TCP protocol")),
        }

        if self.options.len() % 4 != 0 || self.options.len() > 40 {
            return Err(PacketError::malformed(format!(
                "IPv4 options length {} is not a multiple of 4 up to 40",
                self.options.len()
            )));
        }

        let segment = self.serialize_transport()?;
        let header_len = IPV4_MIN_HEADER_LEN + self.options.len();
        let total_len = u16::try_from(header_len + segment.len()).map_err(|_| {
            PacketError::malformed(format!(
                "datagram length {} exceeds 65535",
                header_len + segment.len()
            ))
        })?;

        let mut out = Vec::with_capacity(usize::from(total_len));
        out.push(0x40 | (header_len / 4) as u8);
        out.push(self.tos);
        out.extend_from_slice(&total_len.to_be_bytes());
        out.extend_from_slice(&self.identification.to_be_bytes());
        out.extend_from_slice(&self.flags_fragment.to_be_bytes());
        out.push(self.ttl);
        out.push(self.protocol);
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&self.source.octets());
        out.extend_from_slice(&self.destination.octets());
        out.extend_from_slice(&self.options);

        let checksum = ipv4_header_checksum(&out[..header_len]);
        out[10..12].copy_from_slice(&checksum.to_be_bytes());

        out.extend_from_slice(&segment);
        Ok(out)
    }

    fn serialize_transport(&self) -> Result<Vec<u8>, PacketError> {
        match &self.transport {
            Transport::Opaque(data) => Ok(data.clone()),
            Transport::Udp {
                source_port,
                destination_port,
                payload,
            } => {
                let len = u16::try_from(UDP_HEADER_LEN + payload.len())
                    .map_err(|_| PacketError::malformed("UDP datagram exceeds 65535 bytes"))?;
                let mut segment = Vec::with_capacity(usize::from(len));
                segment.extend_from_slice(&source_port.to_be_bytes());
                segment.extend_from_slice(&destination_port.to_be_bytes());
                segment.extend_from_slice(&len.to_be_bytes());
                segment.extend_from_slice(&[0, 0]);
                segment.extend_from_slice(payload);

                let mut checksum =
                    transport_checksum(self.source, self.destination, IPPROTO_UDP, &segment);
                // Zero means "no checksum" for UDP over IPv4
                if checksum == 0 {
                    checksum = 0xFFFF;
                }
                segment[6..8].copy_from_slice(&checksum.to_be_bytes());
                Ok(segment)
            }
            Transport::Tcp {
                source_port,
                destination_port,
                header,
                payload,
            } => {
                if header.options.len() % 4 != 0 || header.options.len() > 40 {
                    return Err(PacketError::malformed(format!(
                        "TCP options length {} is not a multiple of 4 up to 40",
                        header.options.len()
                    )));
                }
                let header_len = TCP_MIN_HEADER_LEN + header.options.len();
                let data_offset = (header_len / 4) as u16;

                let mut segment = Vec::with_capacity(header_len + payload.len());
                segment.extend_from_slice(&source_port.to_be_bytes());
                segment.extend_from_slice(&destination_port.to_be_bytes());
                segment.extend_from_slice(&header.sequence.to_be_bytes());
                segment.extend_from_slice(&header.acknowledgement.to_be_bytes());
                let offset_flags = (data_offset << 12) | (header.flags & 0x01FF);
                segment.extend_from_slice(&offset_flags.to_be_bytes());
                segment.extend_from_slice(&header.window.to_be_bytes());
                segment.extend_from_slice(&[0, 0]);
                segment.extend_from_slice(&header.urgent.to_be_bytes());
                segment.extend_from_slice(&header.options);
                segment.extend_from_slice(payload);

                let checksum =
                    transport_checksum(self.source, self.destination, IPPROTO_TCP, &segment);
                segment[16..18].copy_from_slice(&checksum.to_be_bytes());
                Ok(segment)
            }
        }
    }
}

fn parse_udp(data: &[u8]) -> Result<Transport, PacketError> {
    if data.len() < UDP_HEADER_LEN {
        return Err(PacketError::malformed(format!(
            "UDP header truncated: {} < {UDP_HEADER_LEN}",
            data.len()
        )));
    }
    let len = usize::from(u16::from_be_bytes([data[4], data[5]]));
    if len < UDP_HEADER_LEN || len > data.len() {
        return Err(PacketError::malformed(format!(
            "invalid UDP length {len} for {} byte payload",
            data.len()
        )));
    }
    Ok(Transport::Udp {
        source_port: u16::from_be_bytes([data[0], data[1]]),
        destination_port: u16::from_be_bytes([data[2], data[3]]),
        payload: data[UDP_HEADER_LEN..len].to_vec(),
    })
}

fn parse_tcp(data: &[u8]) -> Result<Transport, PacketError> {
    if data.len() < TCP_MIN_HEADER_LEN {
        return Err(PacketError::malformed(format!(
            "TCP header truncated: {} < {TCP_MIN_HEADER_LEN}",
            data.len()
        )));
    }
    let offset_flags = u16::from_be_bytes([data[12], data[13]]);
    let header_len = usize::from(offset_flags >> 12) * 4;
    if header_len < TCP_MIN_HEADER_LEN || header_len > data.len() {
        return Err(PacketError::malformed(format!(
            "invalid TCP data offset {header_len} for {} byte segment",
            data.len()
        )));
    }
    Ok(Transport::Tcp {
        source_port: u16::from_be_bytes([data[0], data[1]]),
        destination_port: u16::from_be_bytes([data[2], data[3]]),
        header: TcpHeader {
            sequence: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
            acknowledgement: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            flags: offset_flags & 0x01FF,
            window: u16::from_be_bytes([data[14], data[15]]),
            urgent: u16::from_be_bytes([data[18], data[19]]),
            options: data[TCP_MIN_HEADER_LEN..header_len].to_vec(),
        },
        payload: data[header_len..].to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::checksum::verify_ipv4_checksum;

    const CLIENT: Ipv4Addr = Ipv4Addr::new(7, 0, 0, 2);
    const SERVICE: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);

    /// Transport checksum over a finished datagram must verify to zero
    fn transport_checksum_ok(bytes: &[u8]) -> bool {
        let view = Ipv4View::new(bytes).unwrap();
        transport_checksum(view.source(), view.destination(), view.protocol(), view.payload())
            == 0
    }

    #[test]
    fn test_parse_serialize_udp() {
        let packet = Packet::udp(CLIENT, SERVICE, 40000, 53, b"query".to_vec());
        let bytes = packet.serialize().unwrap();

        assert_eq!(bytes.len(), 20 + 8 + 5);
        assert!(verify_ipv4_checksum(&bytes));
        assert!(transport_checksum_ok(&bytes));

        let parsed = Packet::parse(&bytes).unwrap();
        assert_eq!(parsed, packet);
        assert_eq!(parsed.source_port(), Some(40000));
        assert_eq!(parsed.destination_port(), Some(53));
        assert_eq!(parsed.payload(), b"query");
    }

    #[test]
    fn test_parse_serialize_tcp_with_options() {
        let mut packet = Packet::tcp(CLIENT, SERVICE, 50000, 443, b"hello".to_vec());
        if let Transport::Tcp { header, .. } = &mut packet.transport {
            header.sequence = 0xDEAD_BEEF;
            header.options = vec![0x02, 0x04, 0x05, 0xB4]; // MSS 1460
        }
        let bytes = packet.serialize().unwrap();

        assert!(verify_ipv4_checksum(&bytes));
        assert!(transport_checksum_ok(&bytes));
        assert_eq!(Packet::parse(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_mutate_recomputes_checksums() {
        let packet = Packet::udp(CLIENT, SERVICE, 40000, 53, b"abc".to_vec());
        let original = packet.serialize().unwrap();

        let mut edited = Packet::parse(&original).unwrap();
        edited.mutate(Field::Destination(Ipv4Addr::new(10, 0, 0, 9))).unwrap();
        edited.mutate(Field::DestinationPort(5353)).unwrap();
        let bytes = edited.serialize().unwrap();

        assert_ne!(bytes[10..12], original[10..12]);
        assert!(verify_ipv4_checksum(&bytes));
        assert!(transport_checksum_ok(&bytes));

        let view = Ipv4View::new(&bytes).unwrap();
        assert_eq!(view.destination(), Ipv4Addr::new(10, 0, 0, 9));
        assert_eq!(view.destination_port(), Some(5353));
    }

    #[test]
    fn test_mutate_payload_fixes_lengths() {
        let mut packet = Packet::udp(CLIENT, SERVICE, 1, 2, Vec::new());
        packet.mutate(Field::Payload(vec![0u8; 100])).unwrap();
        let bytes = packet.serialize().unwrap();

        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), 128);
        assert_eq!(u16::from_be_bytes([bytes[24], bytes[25]]), 108);
    }

    #[test]
    fn test_port_on_icmp_is_missing_layer() {
        let mut bytes = Packet::udp(CLIENT, SERVICE, 1, 2, vec![8, 0, 0, 0])
            .serialize()
            .unwrap();
        bytes[9] = 1; // ICMP
        let mut packet = Packet::parse(&bytes).unwrap();

        assert_eq!(packet.source_port(), None);
        assert_eq!(
            packet.mutate(Field::SourcePort(1)),
            Err(PacketError::MissingLayer("transport"))
        );
    }

    #[test]
    fn test_serialize_missing_layer_after_protocol_change() {
        let mut bytes = Packet::udp(CLIENT, SERVICE, 1, 2, vec![1, 2, 3, 4])
            .serialize()
            .unwrap();
        bytes[9] = 47; // GRE
        let mut packet = Packet::parse(&bytes).unwrap();
        packet.mutate(Field::Protocol(IPPROTO_TCP)).unwrap();

        assert!(matches!(
            packet.serialize(),
            Err(PacketError::MissingLayer(_))
        ));
    }

    #[test]
    fn test_fragment_is_opaque() {
        let mut bytes = Packet::udp(CLIENT, SERVICE, 1, 2, vec![0; 16])
            .serialize()
            .unwrap();
        bytes[6] = 0x20; // MF, DF cleared
        let packet = Packet::parse(&bytes).unwrap();

        assert!(matches!(packet.transport(), Transport::Opaque(_)));
        assert_eq!(packet.destination_port(), None);
        // Still serializable even though protocol says UDP
        assert_eq!(Packet::parse(&packet.serialize().unwrap()).unwrap(), packet);
    }

    #[test]
    fn test_truncated_transport_is_malformed() {
        let mut bytes = Packet::tcp(CLIENT, SERVICE, 1, 2, Vec::new())
            .serialize()
            .unwrap();
        bytes.truncate(30);
        bytes[2..4].copy_from_slice(&30u16.to_be_bytes());
        assert!(matches!(Packet::parse(&bytes), Err(PacketError::Malformed(_))));
    }

    #[test]
    fn test_round_trip_table() {
        let with_ip_options = {
            let mut packet = Packet::udp(CLIENT, SERVICE, 40000, 53, b"opt".to_vec());
            // Record route with room for one hop, then end of options
            packet.options = vec![0x07, 0x07, 0x04, 0, 0, 0, 0, 0x00];
            packet
        };
        let tcp_with_options = {
            let mut packet = Packet::tcp(CLIENT, SERVICE, 50000, 443, b"GET / HTTP/1.1".to_vec());
            if let Transport::Tcp { header, .. } = &mut packet.transport {
                header.flags = 0x002; // SYN
                header.acknowledgement = 7;
                // MSS 1460, SACK permitted, window scale 7, NOP padding
                header.options = vec![
                    0x02, 0x04, 0x05, 0xB4, 0x04, 0x02, 0x03, 0x03, 0x07, 0x01, 0x01, 0x01,
                ];
            }
            packet
        };
        let fragment = Packet {
            identification: 0x1234,
            flags_fragment: 0x2000 | 3, // MF, offset 24 bytes
            ..Packet::with_transport(CLIENT, SERVICE, IPPROTO_UDP, Transport::Opaque(vec![9; 13]))
        };
        // Payload word chosen so the computed UDP checksum is zero
        let zero_udp_checksum = Packet::udp(CLIENT, SERVICE, 40000, 53, vec![0x52, 0x5E]);

        let cases = [
            ("ip options", with_ip_options, None),
            ("tcp options", tcp_with_options, None),
            ("odd udp payload", Packet::udp(CLIENT, SERVICE, 1, 2, vec![1, 2, 3]), None),
            ("odd tcp payload", Packet::tcp(CLIENT, SERVICE, 1, 2, vec![0xAB; 7]), None),
            ("fragment", fragment, None),
            ("udp checksum zero", zero_udp_checksum, Some(0xFFFF)),
        ];

        for (name, packet, udp_checksum) in cases {
            let bytes = packet.serialize().unwrap();
            assert_eq!(Packet::parse(&bytes).unwrap(), packet, "{name}");
            assert!(verify_ipv4_checksum(&bytes), "{name}: header checksum");

            let view = Ipv4View::new(&bytes).unwrap();
            if view.is_fragment() {
                assert!(matches!(packet.transport(), Transport::Opaque(_)), "{name}");
            } else {
                assert!(transport_checksum_ok(&bytes), "{name}: transport checksum");
            }
            if let Some(expected) = udp_checksum {
                let segment = view.payload();
                assert_eq!(u16::from_be_bytes([segment[6], segment[7]]), expected, "{name}");
            }
        }
    }
}
