//! Osprey Packet Model
//!
//! Zero-copy view over an already framed IP packet plus the
//! direction-agnostic flow key used to group packets into flows.

pub mod synth;

use osprey_schema::{FlowId, L4Protocol};
use serde::{Deserialize, Serialize};
use std::hash::BuildHasher;
use std::net::IpAddr;
use thiserror::Error;

use etherparse::{NetSlice, SlicedPacket, TransportSlice};

/// Errors raised while framing a single packet
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PacketError {
    #[error("Not an IP packet")]
    NotIp,

    #[error("Malformed packet: {0}")]
    Malformed(String),

    #[error("Fragmented packet")]
    Fragmented,

    #[error("Failed to build packet: {0}")]
    Build(String),
}

pub type PacketResult<T> = Result<T, PacketError>;

/// Parsed L3/L4 summary of one packet, borrowing the payload
#[derive(Debug, Clone, Copy)]
pub struct PacketView<'a> {
    pub src: IpAddr,
    pub dst: IpAddr,
    /// Zero for transports without ports
    pub src_port: u16,
    pub dst_port: u16,
    pub l4: L4Protocol,
    /// L4 payload (for non TCP/UDP transports, the whole IP payload)
    pub payload: &'a [u8],
    /// Length of the packet as received
    pub wire_len: usize,
}

impl<'a> PacketView<'a> {
    /// Frame raw IP bytes (no link layer)
    pub fn parse(bytes: &'a [u8]) -> PacketResult<Self> {
        match bytes.first().map(|b| b >> 4) {
            Some(4) | Some(6) => {}
            _ => return Err(PacketError::NotIp),
        }

        let sliced =
            SlicedPacket::from_ip(bytes).map_err(|e| PacketError::Malformed(e.to_string()))?;

        let (src, dst, ip_payload) = match &sliced.net {
            Some(NetSlice::Ipv4(ipv4)) => {
                let header = ipv4.header();
                (
                    IpAddr::V4(header.source_addr()),
                    IpAddr::V4(header.destination_addr()),
                    ipv4.payload(),
                )
            }
            Some(NetSlice::Ipv6(ipv6)) => {
                let header = ipv6.header();
                (
                    IpAddr::V6(header.source_addr()),
                    IpAddr::V6(header.destination_addr()),
                    ipv6.payload(),
                )
            }
            _ => return Err(PacketError::NotIp),
        };

        if ip_payload.fragmented {
            return Err(PacketError::Fragmented);
        }

        let l4 = L4Protocol::from_number(ip_payload.ip_number.0);
        let (src_port, dst_port, payload) = match &sliced.transport {
            Some(TransportSlice::Tcp(tcp)) => {
                (tcp.source_port(), tcp.destination_port(), tcp.payload())
            }
            Some(TransportSlice::Udp(udp)) => {
                (udp.source_port(), udp.destination_port(), udp.payload())
            }
            _ if l4.has_ports() => {
                return Err(PacketError::Malformed(format!("truncated {} header", l4)))
            }
            _ => (0, 0, ip_payload.payload),
        };

        Ok(Self {
            src,
            dst,
            src_port,
            dst_port,
            l4,
            payload,
            wire_len: bytes.len(),
        })
    }

    pub fn is_ipv6(&self) -> bool {
        self.src.is_ipv6()
    }

    pub fn has_payload(&self) -> bool {
        !self.payload.is_empty()
    }

    pub fn flow_key(&self) -> FlowKey {
        FlowKey::new(self.l4, (self.src, self.src_port), (self.dst, self.dst_port))
    }
}

/// Which side of the flow sent a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Sent by the endpoint that opened the flow
    ToServer,
    ToClient,
}

impl Direction {
    pub fn flip(self) -> Self {
        match self {
            Direction::ToServer => Direction::ToClient,
            Direction::ToClient => Direction::ToServer,
        }
    }

    /// Slot index for per-direction counters
    pub fn index(self) -> usize {
        match self {
            Direction::ToServer => 0,
            Direction::ToClient => 1,
        }
    }
}

/// Direction-agnostic 5-tuple
///
/// Endpoints are stored sorted, so both directions of a connection
/// produce the same key and the same [`FlowId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowKey {
    pub l4: L4Protocol,
    pub lower: (IpAddr, u16),
    pub upper: (IpAddr, u16),
}

// Fixed seeds keep flow ids stable across processes
const FLOW_HASH_SEEDS: (u64, u64, u64, u64) = (
    0x243f_6a88_85a3_08d3,
    0x1319_8a2e_0370_7344,
    0xa409_3822_299f_31d0,
    0x082e_fa98_ec4e_6c89,
);

impl FlowKey {
    pub fn new(l4: L4Protocol, a: (IpAddr, u16), b: (IpAddr, u16)) -> Self {
        if a <= b {
            Self { l4, lower: a, upper: b }
        } else {
            Self { l4, lower: b, upper: a }
        }
    }

    /// Deterministic 64-bit identifier of the flow
    pub fn id(&self) -> FlowId {
        let (k0, k1, k2, k3) = FLOW_HASH_SEEDS;
        ahash::RandomState::with_seeds(k0, k1, k2, k3).hash_one(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_tcp_v4() {
        let bytes = synth::tcp_v4([10, 0, 0, 1], 51000, [93, 184, 216, 34], 443, b"hello").unwrap();
        let view = PacketView::parse(&bytes).unwrap();
        assert_eq!(view.src, "10.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(view.dst_port, 443);
        assert_eq!(view.l4, L4Protocol::Tcp);
        assert_eq!(view.payload, b"hello");
        assert_eq!(view.wire_len, bytes.len());
        assert!(!view.is_ipv6());
    }

    #[test]
    fn test_parse_udp_v6() {
        let mut src = [0u8; 16];
        src[0] = 0x20;
        src[1] = 0x01;
        src[15] = 1;
        let mut dst = src;
        dst[15] = 2;
        let bytes = synth::udp_v6(src, 5353, dst, 53, b"\x00\x01").unwrap();
        let view = PacketView::parse(&bytes).unwrap();
        assert!(view.is_ipv6());
        assert_eq!(view.l4, L4Protocol::Udp);
        assert_eq!(view.src_port, 5353);
        assert_eq!(view.payload.len(), 2);
    }

    #[test]
    fn test_reject_non_ip() {
        assert_eq!(PacketView::parse(&[]).unwrap_err(), PacketError::NotIp);
        assert_eq!(PacketView::parse(&[0x00, 0x01]).unwrap_err(), PacketError::NotIp);
    }

    #[test]
    fn test_reject_truncated() {
        let bytes = synth::tcp_v4([10, 0, 0, 1], 1, [10, 0, 0, 2], 2, b"payload").unwrap();
        let err = PacketView::parse(&bytes[..24]).unwrap_err();
        assert!(matches!(err, PacketError::Malformed(_)));
    }

    #[test]
    fn test_flow_key_is_direction_agnostic() {
        let fwd = synth::tcp_v4([10, 0, 0, 1], 51000, [10, 0, 0, 2], 80, b"").unwrap();
        let rev = synth::tcp_v4([10, 0, 0, 2], 80, [10, 0, 0, 1], 51000, b"").unwrap();
        let a = PacketView::parse(&fwd).unwrap().flow_key();
        let b = PacketView::parse(&rev).unwrap().flow_key();
        assert_eq!(a, b);
        assert_eq!(a.id(), b.id());

        let other = synth::tcp_v4([10, 0, 0, 1], 51001, [10, 0, 0, 2], 80, b"").unwrap();
        let c = PacketView::parse(&other).unwrap().flow_key();
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn test_direction_flip() {
        assert_eq!(Direction::ToServer.flip(), Direction::ToClient);
        assert_eq!(Direction::ToClient.index(), 1);
    }
}
