//! Synthetic traffic generator.
//!
//! Produces kind-prefixed messages: NR MAC PDUs built from R/F/LCID/L
//! subheaders (optionally closed by a padding subPDU), IPv4 packets with a
//! valid header checksum and IPv6 packets, each carrying TCP, UDP or ICMP.
//! A configurable share of messages is deliberately malformed so that the
//! analyzer error path is exercised under load.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use rand_distr::Exp;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::flow::FiveTuple;
use crate::packet::{
    ICMP_HEADER_LEN, IPV4_HEADER_LEN, IPV6_HEADER_LEN, LCID_PADDING, MAX_DATA_LCID,
    TCP_HEADER_LEN, UDP_HEADER_LEN, internet_checksum, kind, protocol,
};

/// Generator configuration errors
#[derive(Debug, Error)]
pub enum TrafficError {
    /// Weights or sizes that cannot drive the generator
    #[error("invalid traffic mix: {0}")]
    InvalidMix(String),
}

/// Shape of the generated traffic
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrafficMix {
    /// Relative weight of MAC PDUs
    pub mac_weight: u32,
    /// Relative weight of IPv4 packets
    pub ipv4_weight: u32,
    /// Relative weight of IPv6 packets
    pub ipv6_weight: u32,
    /// Distinct IP flows to draw from
    pub flows: u32,
    /// Mean payload size in bytes (exponentially distributed)
    pub mean_payload: f64,
    /// Largest message in bytes, kind prefix included
    pub max_message: usize,
    /// Fraction of deliberately malformed messages
    pub malformed_ratio: f64,
    /// Fixed seed for reproducible runs
    pub seed: Option<u64>,
}

impl Default for TrafficMix {
    fn default() -> Self {
        Self {
            mac_weight: 2,
            ipv4_weight: 2,
            ipv6_weight: 1,
            flows: 256,
            mean_payload: 256.0,
            max_message: 1400,
            malformed_ratio: 0.01,
            seed: None,
        }
    }
}

/// Smallest `max_message` the generator accepts
pub const MIN_MESSAGE: usize = 1 + IPV6_HEADER_LEN + TCP_HEADER_LEN + 16;

/// Metadata of one generated message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generated {
    /// Kind prefix byte
    pub kind: u8,
    /// Flow key for IP packets
    pub flow_key: Option<u64>,
    /// Whether the message was corrupted on purpose
    pub malformed: bool,
}

/// Deterministic-when-seeded traffic source
pub struct TrafficGenerator {
    rng: StdRng,
    kinds: WeightedIndex<u32>,
    payload: Exp<f64>,
    mix: TrafficMix,
    v4_flows: Vec<FiveTuple>,
    v6_flows: Vec<FiveTuple>,
    ip_id: u16,
}

const KINDS: [u8; 3] = [kind::MAC_PDU, kind::IPV4, kind::IPV6];

impl TrafficGenerator {
    /// Create a generator for `mix`
    ///
    /// # Errors
    ///
    /// Returns `TrafficError::InvalidMix` for all-zero weights, a
    /// non-positive mean, a ratio outside `0..=1` or a `max_message` below
    /// `MIN_MESSAGE`.
    pub fn new(mix: TrafficMix) -> Result<Self, TrafficError> {
        let kinds = WeightedIndex::new([mix.mac_weight, mix.ipv4_weight, mix.ipv6_weight])
            .map_err(|e| TrafficError::InvalidMix(e.to_string()))?;
        if mix.mean_payload.is_nan() || mix.mean_payload <= 0.0 {
            return Err(TrafficError::InvalidMix(format!(
                "mean_payload must be positive, got {}",
                mix.mean_payload
            )));
        }
        let payload = Exp::new(1.0 / mix.mean_payload)
            .map_err(|e| TrafficError::InvalidMix(e.to_string()))?;
        if !(0.0..=1.0).contains(&mix.malformed_ratio) {
            return Err(TrafficError::InvalidMix(format!(
                "malformed_ratio must be within 0..=1, got {}",
                mix.malformed_ratio
            )));
        }
        if mix.max_message < MIN_MESSAGE {
            return Err(TrafficError::InvalidMix(format!(
                "max_message must be at least {MIN_MESSAGE}, got {}",
                mix.max_message
            )));
        }

        let mut rng = match mix.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let flows = mix.flows.max(1);
        let v4_flows = (0..flows).map(|_| random_v4_flow(&mut rng)).collect();
        let v6_flows = (0..flows).map(|_| random_v6_flow(&mut rng)).collect();

        Ok(Self {
            rng,
            kinds,
            payload,
            mix,
            v4_flows,
            v6_flows,
            ip_id: 0,
        })
    }

    /// Traffic shape in use
    pub fn mix(&self) -> &TrafficMix {
        &self.mix
    }

    /// Write the next message into `out` (cleared first)
    pub fn next_into(&mut self, out: &mut Vec<u8>) -> Generated {
        out.clear();
        let kind = KINDS[self.kinds.sample(&mut self.rng)];
        let malformed = self.mix.malformed_ratio > 0.0 && self.rng.gen_bool(self.mix.malformed_ratio);
        out.push(kind);

        let flow_key = match kind {
            kind::MAC_PDU => {
                self.write_mac(out, malformed);
                None
            }
            kind::IPV4 => {
                let flow = self.v4_flows[self.rng.gen_range(0..self.v4_flows.len())];
                self.write_ipv4(out, &flow, malformed);
                Some(flow.flow_key())
            }
            _ => {
                let flow = self.v6_flows[self.rng.gen_range(0..self.v6_flows.len())];
                self.write_ipv6(out, &flow, malformed);
                Some(flow.flow_key())
            }
        };

        Generated {
            kind,
            flow_key,
            malformed,
        }
    }

    /// Allocate and return the next message
    pub fn next_message(&mut self) -> (Vec<u8>, Generated) {
        let mut out = Vec::with_capacity(self.mix.max_message);
        let generated = self.next_into(&mut out);
        (out, generated)
    }

    fn payload_len(&mut self, room: usize) -> usize {
        let sampled = self.payload.sample(&mut self.rng) as usize;
        sampled.clamp(1, room.max(1))
    }

    fn fill_random(&mut self, out: &mut Vec<u8>, len: usize) {
        let start = out.len();
        out.resize(start + len, 0);
        self.rng.fill_bytes(&mut out[start..]);
    }

    fn write_mac(&mut self, out: &mut Vec<u8>, malformed: bool) {
        // Room for the trailing broken subheader of a malformed PDU
        let budget = self.mix.max_message - 1 - 2;
        let subpdus = self.rng.gen_range(1..=4usize);
        let mut used = 0;

        for _ in 0..subpdus {
            let room = budget.saturating_sub(used + 3);
            if room == 0 {
                break;
            }
            let len = self.payload_len(room.min(self.mix.max_message / subpdus));
            let lcid = self.rng.gen_range(1..=MAX_DATA_LCID);
            if len > usize::from(u8::MAX) {
                out.push(0x40 | lcid);
                out.extend_from_slice(&(len as u16).to_be_bytes());
                used += 3;
            } else {
                out.push(lcid);
                out.push(len as u8);
                used += 2;
            }
            self.fill_random(out, len);
            used += len;
        }

        if malformed {
            // Subheader announcing 200 bytes that never follow
            out.push(1);
            out.push(200);
            return;
        }
        if self.rng.gen_bool(0.3) && used < budget {
            out.push(LCID_PADDING);
            let pad = self.rng.gen_range(0..=(budget - used).min(32));
            out.resize(out.len() + pad, 0);
        }
    }

    fn transport(&mut self, flow: &FiveTuple, out: &mut Vec<u8>, payload: usize) {
        match flow.protocol {
            protocol::TCP => {
                out.extend_from_slice(&flow.src_port.to_be_bytes());
                out.extend_from_slice(&flow.dst_port.to_be_bytes());
                out.extend_from_slice(&self.rng.next_u32().to_be_bytes());
                out.extend_from_slice(&self.rng.next_u32().to_be_bytes());
                out.push(0x50);
                out.push(0x18);
                out.extend_from_slice(&65535u16.to_be_bytes());
                out.extend_from_slice(&[0, 0, 0, 0]);
            }
            protocol::UDP => {
                out.extend_from_slice(&flow.src_port.to_be_bytes());
                out.extend_from_slice(&flow.dst_port.to_be_bytes());
                out.extend_from_slice(&((UDP_HEADER_LEN + payload) as u16).to_be_bytes());
                out.extend_from_slice(&[0, 0]);
            }
            _ => {
                out.extend_from_slice(&[8, 0, 0, 0]);
                out.extend_from_slice(&self.rng.next_u32().to_be_bytes());
            }
        }
        self.fill_random(out, payload);
    }

    fn write_ipv4(&mut self, out: &mut Vec<u8>, flow: &FiveTuple, malformed: bool) {
        let l4_len = l4_header_len(flow.protocol);
        let room = self.mix.max_message - 1 - IPV4_HEADER_LEN - l4_len;
        let payload = self.payload_len(room);
        let total = (IPV4_HEADER_LEN + l4_len + payload) as u16;
        self.ip_id = self.ip_id.wrapping_add(1);

        let start = out.len();
        out.extend_from_slice(&[0x45, 0x00]);
        out.extend_from_slice(&total.to_be_bytes());
        out.extend_from_slice(&self.ip_id.to_be_bytes());
        out.extend_from_slice(&[0x40, 0x00, 64, flow.protocol, 0, 0]);
        if let (IpAddr::V4(src), IpAddr::V4(dst)) = (flow.src, flow.dst) {
            out.extend_from_slice(&src.octets());
            out.extend_from_slice(&dst.octets());
        }
        let checksum = internet_checksum(&out[start..start + IPV4_HEADER_LEN]);
        out[start + 10..start + 12].copy_from_slice(&checksum.to_be_bytes());
        if malformed {
            out[start + 10] ^= 0xFF;
        }

        self.transport(flow, out, payload);
    }

    fn write_ipv6(&mut self, out: &mut Vec<u8>, flow: &FiveTuple, malformed: bool) {
        let l4_len = l4_header_len(flow.protocol);
        let room = self.mix.max_message - 1 - IPV6_HEADER_LEN - l4_len;
        let payload = self.payload_len(room);
        let mut payload_len = (l4_len + payload) as u16;
        if malformed {
            // Claims more than the packet carries
            payload_len = payload_len.saturating_add(64);
        }

        let flow_label = self.rng.next_u32() & 0x000F_FFFF;
        out.extend_from_slice(&(0x6000_0000u32 | flow_label).to_be_bytes());
        out.extend_from_slice(&payload_len.to_be_bytes());
        out.push(flow.protocol);
        out.push(64);
        if let (IpAddr::V6(src), IpAddr::V6(dst)) = (flow.src, flow.dst) {
            out.extend_from_slice(&src.octets());
            out.extend_from_slice(&dst.octets());
        }

        self.transport(flow, out, payload);
    }
}

fn l4_header_len(proto: u8) -> usize {
    match proto {
        protocol::TCP => TCP_HEADER_LEN,
        protocol::UDP => UDP_HEADER_LEN,
        _ => ICMP_HEADER_LEN,
    }
}

fn random_protocol<R: Rng>(rng: &mut R, other: u8) -> u8 {
    match rng.gen_range(0..10u8) {
        0..=5 => protocol::TCP,
        6..=8 => protocol::UDP,
        _ => other,
    }
}

fn random_ports<R: Rng>(rng: &mut R, proto: u8) -> (u16, u16) {
    if proto == protocol::TCP || proto == protocol::UDP {
        const SERVICES: [u16; 6] = [53, 80, 443, 2152, 5060, 8080];
        (
            rng.gen_range(1024..=u16::MAX),
            SERVICES[rng.gen_range(0..SERVICES.len())],
        )
    } else {
        (0, 0)
    }
}

fn random_v4_flow<R: Rng>(rng: &mut R) -> FiveTuple {
    let proto = random_protocol(rng, protocol::ICMP);
    let (src_port, dst_port) = random_ports(rng, proto);
    FiveTuple {
        src: Ipv4Addr::new(10, rng.gen_range(0..=255), rng.gen_range(0..=255), rng.gen_range(1..=254))
            .into(),
        dst: Ipv4Addr::new(192, 0, 2, rng.gen_range(1..=254)).into(),
        src_port,
        dst_port,
        protocol: proto,
    }
}

fn random_v6_flow<R: Rng>(rng: &mut R) -> FiveTuple {
    let proto = random_protocol(rng, protocol::ICMPV6);
    let (src_port, dst_port) = random_ports(rng, proto);
    FiveTuple {
        src: Ipv6Addr::new(0xfd00, 0, 0, 0, 0, 0, rng.gen_range(0..=u16::MAX), rng.gen_range(1..=u16::MAX))
            .into(),
        dst: Ipv6Addr::new(0x2001, 0x0db8, 0, 0, 0, 0, 0, rng.gen_range(1..=u16::MAX)).into(),
        src_port,
        dst_port,
        protocol: proto,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(mix: TrafficMix) -> TrafficGenerator {
        TrafficGenerator::new(TrafficMix {
            seed: Some(7),
            ..mix
        })
        .unwrap()
    }

    #[test]
    fn test_same_seed_same_traffic() {
        let mut a = seeded(TrafficMix::default());
        let mut b = seeded(TrafficMix::default());
        for _ in 0..50 {
            assert_eq!(a.next_message(), b.next_message());
        }
    }

    #[test]
    fn test_messages_respect_max_size() {
        let mut generator = seeded(TrafficMix {
            max_message: 256,
            mean_payload: 1000.0,
            malformed_ratio: 0.5,
            ..Default::default()
        });
        let mut buf = Vec::new();
        for _ in 0..500 {
            generator.next_into(&mut buf);
            assert!(buf.len() <= 256, "{} bytes", buf.len());
        }
    }

    #[test]
    fn test_weights_select_kinds() {
        let mut generator = seeded(TrafficMix {
            mac_weight: 0,
            ipv4_weight: 0,
            ipv6_weight: 1,
            ..Default::default()
        });
        for _ in 0..20 {
            let (message, generated) = generator.next_message();
            assert_eq!(message[0], kind::IPV6);
            assert_eq!(generated.kind, kind::IPV6);
            assert!(generated.flow_key.is_some());
        }
    }

    #[test]
    fn test_ipv4_header_checksum_valid() {
        let mut generator = seeded(TrafficMix {
            mac_weight: 0,
            ipv6_weight: 0,
            malformed_ratio: 0.0,
            ..Default::default()
        });
        for _ in 0..20 {
            let (message, _) = generator.next_message();
            assert_eq!(internet_checksum(&message[1..1 + IPV4_HEADER_LEN]), 0);
        }
    }

    #[test]
    fn test_invalid_mix_rejected() {
        let zero = TrafficMix {
            mac_weight: 0,
            ipv4_weight: 0,
            ipv6_weight: 0,
            ..Default::default()
        };
        assert!(TrafficGenerator::new(zero).is_err());
        assert!(
            TrafficGenerator::new(TrafficMix {
                malformed_ratio: 1.5,
                ..Default::default()
            })
            .is_err()
        );
        assert!(
            TrafficGenerator::new(TrafficMix {
                max_message: 16,
                ..Default::default()
            })
            .is_err()
        );
        assert!(
            TrafficGenerator::new(TrafficMix {
                mean_payload: 0.0,
                ..Default::default()
            })
            .is_err()
        );
    }
}
