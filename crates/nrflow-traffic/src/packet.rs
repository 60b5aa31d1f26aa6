//! Message framing shared by the generator and the analyzer.
//!
//! Every message starts with a one-byte kind, followed by the PDU or packet.

/// Message kind prefixes
pub mod kind {
    /// NR MAC PDU
    pub const MAC_PDU: u8 = 1;
    /// IPv4 packet
    pub const IPV4: u8 = 4;
    /// IPv6 packet
    pub const IPV6: u8 = 6;
}

/// IP protocol numbers the generator emits
pub mod protocol {
    /// ICMP
    pub const ICMP: u8 = 1;
    /// TCP
    pub const TCP: u8 = 6;
    /// UDP
    pub const UDP: u8 = 17;
    /// ICMPv6
    pub const ICMPV6: u8 = 58;
}

/// MAC subheader LCID of a padding subPDU (consumes the rest of the PDU)
pub const LCID_PADDING: u8 = 63;

/// Highest LCID carrying a logical-channel SDU
pub const MAX_DATA_LCID: u8 = 32;

/// IPv4 header length without options
pub const IPV4_HEADER_LEN: usize = 20;

/// IPv6 fixed header length
pub const IPV6_HEADER_LEN: usize = 40;

/// TCP header length without options
pub const TCP_HEADER_LEN: usize = 20;

/// UDP header length
pub const UDP_HEADER_LEN: usize = 8;

/// ICMP / ICMPv6 echo header length
pub const ICMP_HEADER_LEN: usize = 8;

/// RFC 1071 Internet checksum
///
/// Computing it over a header whose checksum field is already filled in
/// yields zero.
#[must_use]
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(*last) << 8;
    }
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Read a big-endian u16 at `offset`
#[must_use]
pub fn be16(data: &[u8], offset: usize) -> Option<u16> {
    data.get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_known_header() {
        let mut header = [
            0x45, 0x00, 0x00, 0x73, 0x00, 0x00, 0x40, 0x00, 0x40, 0x11, 0x00, 0x00, 0xc0, 0xa8,
            0x00, 0x01, 0xc0, 0xa8, 0x00, 0xc7,
        ];
        assert_eq!(internet_checksum(&header), 0xb861);

        header[10] = 0xb8;
        header[11] = 0x61;
        assert_eq!(internet_checksum(&header), 0);
    }

    #[test]
    fn test_checksum_odd_length() {
        assert_eq!(internet_checksum(&[0xFF]), !0xFF00);
    }

    #[test]
    fn test_be16_bounds() {
        assert_eq!(be16(&[0x12, 0x34], 0), Some(0x1234));
        assert_eq!(be16(&[0x12], 0), None);
    }
}
