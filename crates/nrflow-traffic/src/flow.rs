//! 5-tuple flow identification.
//!
//! Flow keys route every packet of a flow to the same ring, which keeps
//! per-flow order. Keys are the first 8 bytes of a BLAKE3 hash over a
//! canonical encoding of the tuple.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use serde::Serialize;

use crate::packet::{IPV4_HEADER_LEN, IPV6_HEADER_LEN, be16, kind, protocol};

/// Transport-level flow identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct FiveTuple {
    /// Source address
    pub src: IpAddr,
    /// Destination address
    pub dst: IpAddr,
    /// Source port (0 for protocols without ports)
    pub src_port: u16,
    /// Destination port (0 for protocols without ports)
    pub dst_port: u16,
    /// IP protocol number
    pub protocol: u8,
}

impl FiveTuple {
    /// 64-bit flow key
    #[must_use]
    pub fn flow_key(&self) -> u64 {
        let mut hasher = blake3::Hasher::new();
        hash_addr(&mut hasher, self.src);
        hash_addr(&mut hasher, self.dst);
        hasher.update(&self.src_port.to_be_bytes());
        hasher.update(&self.dst_port.to_be_bytes());
        hasher.update(&[self.protocol]);
        let digest = hasher.finalize();
        let mut key = [0u8; 8];
        key.copy_from_slice(&digest.as_bytes()[..8]);
        u64::from_le_bytes(key)
    }

    /// Extract the tuple from a kind-prefixed message
    ///
    /// Returns `None` for MAC PDUs and packets too short to carry the
    /// fields.
    #[must_use]
    pub fn parse(message: &[u8]) -> Option<Self> {
        let (&kind, packet) = message.split_first()?;
        match kind {
            kind::IPV4 => Self::parse_ipv4(packet),
            kind::IPV6 => Self::parse_ipv6(packet),
            _ => None,
        }
    }

    fn parse_ipv4(packet: &[u8]) -> Option<Self> {
        if packet.len() < IPV4_HEADER_LEN {
            return None;
        }
        let ihl = usize::from(packet[0] & 0x0F) * 4;
        let src = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
        let dst = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
        let proto = packet[9];
        let (src_port, dst_port) = ports(packet, ihl, proto)?;
        Some(Self {
            src: IpAddr::V4(src),
            dst: IpAddr::V4(dst),
            src_port,
            dst_port,
            protocol: proto,
        })
    }

    fn parse_ipv6(packet: &[u8]) -> Option<Self> {
        if packet.len() < IPV6_HEADER_LEN {
            return None;
        }
        let mut src = [0u8; 16];
        let mut dst = [0u8; 16];
        src.copy_from_slice(&packet[8..24]);
        dst.copy_from_slice(&packet[24..40]);
        let proto = packet[6];
        let (src_port, dst_port) = ports(packet, IPV6_HEADER_LEN, proto)?;
        Some(Self {
            src: IpAddr::V6(Ipv6Addr::from(src)),
            dst: IpAddr::V6(Ipv6Addr::from(dst)),
            src_port,
            dst_port,
            protocol: proto,
        })
    }
}

fn ports(packet: &[u8], l4: usize, proto: u8) -> Option<(u16, u16)> {
    match proto {
        protocol::TCP | protocol::UDP => Some((be16(packet, l4)?, be16(packet, l4 + 2)?)),
        _ => Some((0, 0)),
    }
}

fn hash_addr(hasher: &mut blake3::Hasher, addr: IpAddr) {
    match addr {
        IpAddr::V4(v4) => hasher.update(&v4.to_ipv6_mapped().octets()),
        IpAddr::V6(v6) => hasher.update(&v6.octets()),
    };
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} proto {} (key {})",
            self.src,
            self.src_port,
            self.dst,
            self.dst_port,
            self.protocol,
            hex::encode(self.flow_key().to_be_bytes())
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tuple(src_port: u16) -> FiveTuple {
        FiveTuple {
            src: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)),
            dst: IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            src_port,
            dst_port: 443,
            protocol: protocol::TCP,
        }
    }

    #[test]
    fn test_flow_key_is_stable_and_discriminating() {
        assert_eq!(tuple(1000).flow_key(), tuple(1000).flow_key());
        assert_ne!(tuple(1000).flow_key(), tuple(1001).flow_key());
    }

    #[test]
    fn test_parse_ipv4_udp() {
        let mut message = vec![kind::IPV4, 0x45, 0, 0, 28, 0, 0, 0, 0, 64, protocol::UDP, 0, 0];
        message.extend_from_slice(&[192, 168, 1, 1, 192, 168, 1, 2]);
        message.extend_from_slice(&[0x13, 0x88, 0x00, 0x35, 0, 8, 0, 0]);

        let parsed = FiveTuple::parse(&message).unwrap();
        assert_eq!(parsed.src, IpAddr::V4(Ipv4Addr::new(192, 168, 1, 1)));
        assert_eq!(parsed.src_port, 5000);
        assert_eq!(parsed.dst_port, 53);
        assert_eq!(parsed.protocol, protocol::UDP);
    }

    #[test]
    fn test_parse_rejects_mac_and_short() {
        assert!(FiveTuple::parse(&[kind::MAC_PDU, 0x01, 0x00]).is_none());
        assert!(FiveTuple::parse(&[kind::IPV4, 0x45]).is_none());
        assert!(FiveTuple::parse(&[]).is_none());
    }

    #[test]
    fn test_display_includes_hex_key() {
        let shown = tuple(1).to_string();
        assert!(shown.starts_with("10.0.0.1:1 -> 10.0.0.2:443 proto 6 (key "));
        assert_eq!(shown.len(), "10.0.0.1:1 -> 10.0.0.2:443 proto 6 (key )".len() + 16);
    }
}
