//! Internet checksum helpers (RFC 1071)

use std::net::Ipv4Addr;

/// Add big-endian 16-bit words of `data` to `sum`, padding an odd tail with zero.
fn add_words(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([chunk[0], chunk[1]])));
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add(u32::from(u16::from_be_bytes([*last, 0])));
    }
    sum
}

/// Fold a 32-bit accumulator to 16 bits and take the one's complement.
fn finish(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Checksum of an IPv4 header whose checksum field (bytes 10-11) is zero.
#[must_use]
pub fn ipv4_header_checksum(header: &[u8]) -> u16 {
    finish(add_words(header, 0))
}

/// TCP/UDP checksum over the IPv4 pseudo-header and `segment`.
///
/// `segment` must have its own checksum field zeroed.
#[must_use]
pub fn transport_checksum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    let mut sum = add_words(&src.octets(), 0);
    sum = add_words(&dst.octets(), sum);
    sum = sum.wrapping_add(u32::from(protocol));
    sum = sum.wrapping_add(segment.len() as u32);
    finish(add_words(segment, sum))
}

/// Verify the header checksum of a raw IPv4 packet.
#[must_use]
pub fn verify_ipv4_checksum(packet: &[u8]) -> bool {
    if packet.len() < 20 || packet[0] >> 4 != 4 {
        return false;
    }
    let header_len = usize::from(packet[0] & 0x0F) * 4;
    if header_len < 20 || packet.len() < header_len {
        return false;
    }
    // Summing a header including a valid checksum yields 0xFFFF
    finish(add_words(&packet[..header_len], 0)) == 0
}
