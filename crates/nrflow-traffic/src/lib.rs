//! # nrflow Traffic
//!
//! Synthetic NR MAC PDU, IPv4 and IPv6 traffic for driving the nrflow
//! transport, and the protocol analyzer the workers run on it.
//!
//! Every message is prefixed with a one-byte kind (see [`packet::kind`]).
//! IP packets carry a 5-tuple whose BLAKE3-derived [`FiveTuple::flow_key`]
//! can be passed to `Producer::submit_keyed` to keep flows on one ring.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod analyzer;
pub mod flow;
pub mod generator;
pub mod packet;

pub use analyzer::{ProtocolAnalyzer, ProtocolClass, classify};
pub use flow::FiveTuple;
pub use generator::{Generated, TrafficError, TrafficGenerator, TrafficMix};
