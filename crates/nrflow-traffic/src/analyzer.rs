//! Protocol analyzer run inside every worker.
//!
//! Validates each kind-prefixed message and classifies it into one of
//! eight protocol classes. Malformed input is an `AnalysisError`, never a
//! panic.

use std::fmt;

use nrflow_core::analyzer::{AnalysisError, AnalysisResult, Analyzer, Classification};
use nrflow_core::pool::BlockView;
use serde::Serialize;
use tracing::trace;

use crate::packet::{
    IPV4_HEADER_LEN, IPV6_HEADER_LEN, LCID_PADDING, MAX_DATA_LCID, TCP_HEADER_LEN,
    UDP_HEADER_LEN, be16, internet_checksum, kind, protocol,
};

/// Protocol classes reported to the statistics blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ProtocolClass {
    /// MAC PDU of SDU subPDUs only
    MacData = 0,
    /// MAC PDU closed by a padding subPDU
    MacPadded = 1,
    /// IPv4 / TCP
    Ipv4Tcp = 2,
    /// IPv4 / UDP
    Ipv4Udp = 3,
    /// IPv6 / TCP
    Ipv6Tcp = 4,
    /// IPv6 / UDP
    Ipv6Udp = 5,
    /// IPv4, any other protocol
    Ipv4Other = 6,
    /// IPv6, any other next header
    Ipv6Other = 7,
}

impl ProtocolClass {
    /// Every class, in index order
    pub const ALL: [ProtocolClass; 8] = [
        ProtocolClass::MacData,
        ProtocolClass::MacPadded,
        ProtocolClass::Ipv4Tcp,
        ProtocolClass::Ipv4Udp,
        ProtocolClass::Ipv6Tcp,
        ProtocolClass::Ipv6Udp,
        ProtocolClass::Ipv4Other,
        ProtocolClass::Ipv6Other,
    ];

    /// Short label for reports
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            ProtocolClass::MacData => "mac",
            ProtocolClass::MacPadded => "mac+pad",
            ProtocolClass::Ipv4Tcp => "v4/tcp",
            ProtocolClass::Ipv4Udp => "v4/udp",
            ProtocolClass::Ipv6Tcp => "v6/tcp",
            ProtocolClass::Ipv6Udp => "v6/udp",
            ProtocolClass::Ipv4Other => "v4/other",
            ProtocolClass::Ipv6Other => "v6/other",
        }
    }

    /// Class for a statistics index
    #[must_use]
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }
}

impl From<ProtocolClass> for Classification {
    fn from(class: ProtocolClass) -> Self {
        Classification(class as u8)
    }
}

impl fmt::Display for ProtocolClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Classify a kind-prefixed message
///
/// # Errors
///
/// Returns `AnalysisError::Malformed` naming the first check that failed.
pub fn classify(message: &[u8]) -> Result<ProtocolClass, AnalysisError> {
    let (&kind, body) = message
        .split_first()
        .ok_or(AnalysisError::Malformed("empty message"))?;
    match kind {
        kind::MAC_PDU => classify_mac(body),
        kind::IPV4 => classify_ipv4(body),
        kind::IPV6 => classify_ipv6(body),
        _ => Err(AnalysisError::Malformed("unknown message kind")),
    }
}

fn classify_mac(pdu: &[u8]) -> Result<ProtocolClass, AnalysisError> {
    if pdu.is_empty() {
        return Err(AnalysisError::Malformed("empty MAC PDU"));
    }

    let mut offset = 0;
    while offset < pdu.len() {
        let subheader = pdu[offset];
        let lcid = subheader & 0x3F;
        if subheader & 0x80 != 0 {
            return Err(AnalysisError::Malformed("reserved bit set in MAC subheader"));
        }
        if lcid == LCID_PADDING {
            return Ok(ProtocolClass::MacPadded);
        }
        if lcid > MAX_DATA_LCID {
            return Err(AnalysisError::Malformed("unsupported LCID"));
        }

        let long = subheader & 0x40 != 0;
        let (len, header) = if long {
            let len = be16(pdu, offset + 1).ok_or(AnalysisError::Malformed(
                "truncated MAC subheader",
            ))?;
            (usize::from(len), 3)
        } else {
            let len = *pdu
                .get(offset + 1)
                .ok_or(AnalysisError::Malformed("truncated MAC subheader"))?;
            (usize::from(len), 2)
        };

        offset += header;
        if pdu.len() - offset < len {
            return Err(AnalysisError::Malformed("MAC SDU exceeds PDU"));
        }
        offset += len;
    }
    Ok(ProtocolClass::MacData)
}

fn classify_ipv4(packet: &[u8]) -> Result<ProtocolClass, AnalysisError> {
    if packet.len() < IPV4_HEADER_LEN {
        return Err(AnalysisError::Malformed("truncated IPv4 header"));
    }
    if packet[0] >> 4 != 4 {
        return Err(AnalysisError::Malformed("IPv4 version mismatch"));
    }
    let ihl = usize::from(packet[0] & 0x0F) * 4;
    if ihl < IPV4_HEADER_LEN || packet.len() < ihl {
        return Err(AnalysisError::Malformed("bad IPv4 header length"));
    }
    let total = usize::from(be16(packet, 2).unwrap_or(0));
    if total < ihl || total > packet.len() {
        return Err(AnalysisError::Malformed("bad IPv4 total length"));
    }
    if internet_checksum(&packet[..ihl]) != 0 {
        return Err(AnalysisError::Malformed("bad IPv4 header checksum"));
    }

    let l4 = total - ihl;
    match packet[9] {
        protocol::TCP if l4 >= TCP_HEADER_LEN => Ok(ProtocolClass::Ipv4Tcp),
        protocol::UDP if l4 >= UDP_HEADER_LEN => Ok(ProtocolClass::Ipv4Udp),
        protocol::TCP | protocol::UDP => Err(AnalysisError::Malformed("truncated transport header")),
        _ => Ok(ProtocolClass::Ipv4Other),
    }
}

fn classify_ipv6(packet: &[u8]) -> Result<ProtocolClass, AnalysisError> {
    if packet.len() < IPV6_HEADER_LEN {
        return Err(AnalysisError::Malformed("truncated IPv6 header"));
    }
    if packet[0] >> 4 != 6 {
        return Err(AnalysisError::Malformed("IPv6 version mismatch"));
    }
    let payload = usize::from(be16(packet, 4).unwrap_or(0));
    if IPV6_HEADER_LEN + payload > packet.len() {
        return Err(AnalysisError::Malformed("IPv6 payload length exceeds packet"));
    }

    match packet[6] {
        protocol::TCP if payload >= TCP_HEADER_LEN => Ok(ProtocolClass::Ipv6Tcp),
        protocol::UDP if payload >= UDP_HEADER_LEN => Ok(ProtocolClass::Ipv6Udp),
        protocol::TCP | protocol::UDP => Err(AnalysisError::Malformed("truncated transport header")),
        _ => Ok(ProtocolClass::Ipv6Other),
    }
}

/// `Analyzer` over the generator's message formats
#[derive(Debug, Default)]
pub struct ProtocolAnalyzer {
    analyzed: u64,
    malformed: u64,
}

impl ProtocolAnalyzer {
    /// Fresh analyzer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages seen by this instance
    pub fn analyzed(&self) -> u64 {
        self.analyzed
    }

    /// Malformed messages seen by this instance
    pub fn malformed(&self) -> u64 {
        self.malformed
    }
}

impl Analyzer for ProtocolAnalyzer {
    fn analyze(&mut self, block: BlockView<'_>) -> AnalysisResult {
        self.analyzed += 1;
        match classify(block.data) {
            Ok(class) => Ok(class.into()),
            Err(e) => {
                self.malformed += 1;
                let prefix = &block.data[..block.data.len().min(16)];
                trace!(
                    "Block {} (ring {}, seq {}) rejected: {} [{}]",
                    block.index,
                    block.ring,
                    block.seq,
                    e,
                    hex::encode(prefix)
                );
                Err(e)
            }
        }
    }
}
