// Fixed-width prefixes
//
// Bits beyond the mask length are always zero, so two prefixes with the
// same length compare equal iff they cover the same range.

use crate::{TrieError, TrieResult, MAX_KEY_BITS};
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

const KEY_BYTES: usize = (MAX_KEY_BITS as usize) / 8;

/// Address family of a prefix, used for display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddrFamily {
    V4,
    V6,
    Mac,
    Raw,
}

impl AddrFamily {
    pub fn max_bits(&self) -> u16 {
        match self {
            AddrFamily::V4 => 32,
            AddrFamily::V6 => 128,
            AddrFamily::Mac => 48,
            AddrFamily::Raw => MAX_KEY_BITS,
        }
    }
}

/// A key plus mask length
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Prefix {
    family: AddrFamily,
    bytes: [u8; KEY_BYTES],
    bitlen: u16,
}

impl Prefix {
    /// Build from raw big-endian bytes; bits past `bitlen` are cleared
    pub fn from_bytes(family: AddrFamily, key: &[u8], bitlen: u16) -> TrieResult<Self> {
        let max = family.max_bits();
        if bitlen > max {
            return Err(TrieError::PrefixTooLong { bits: bitlen, max });
        }
        if key.len() * 8 < bitlen as usize || key.len() > KEY_BYTES {
            return Err(TrieError::InvalidPrefix(format!(
                "{} key bytes cannot hold a /{} prefix",
                key.len(),
                bitlen
            )));
        }

        let mut bytes = [0u8; KEY_BYTES];
        bytes[..key.len()].copy_from_slice(key);
        mask_tail(&mut bytes, bitlen);
        Ok(Self {
            family,
            bytes,
            bitlen,
        })
    }

    pub fn v4(addr: Ipv4Addr, bitlen: u16) -> TrieResult<Self> {
        Self::from_bytes(AddrFamily::V4, &addr.octets(), bitlen)
    }

    pub fn v6(addr: Ipv6Addr, bitlen: u16) -> TrieResult<Self> {
        Self::from_bytes(AddrFamily::V6, &addr.octets(), bitlen)
    }

    pub fn mac(addr: [u8; 6], bitlen: u16) -> TrieResult<Self> {
        Self::from_bytes(AddrFamily::Mac, &addr, bitlen)
    }

    /// Full-length prefix for a single address
    pub fn host(addr: IpAddr) -> Self {
        // Full-width lengths always fit
        match addr {
            IpAddr::V4(v4) => Self::full(AddrFamily::V4, &v4.octets()),
            IpAddr::V6(v6) => Self::full(AddrFamily::V6, &v6.octets()),
        }
    }

    fn full(family: AddrFamily, key: &[u8]) -> Self {
        let mut bytes = [0u8; KEY_BYTES];
        bytes[..key.len()].copy_from_slice(key);
        Self {
            family,
            bytes,
            bitlen: family.max_bits(),
        }
    }

    pub fn from_network(network: IpNetwork) -> TrieResult<Self> {
        match network {
            IpNetwork::V4(net) => Self::v4(net.ip(), net.prefix() as u16),
            IpNetwork::V6(net) => Self::v6(net.ip(), net.prefix() as u16),
        }
    }

    pub fn family(&self) -> AddrFamily {
        self.family
    }

    pub fn bitlen(&self) -> u16 {
        self.bitlen
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes[..(self.family.max_bits() as usize).div_ceil(8)]
    }

    /// Value of bit `index`, counted from the most significant bit
    pub(crate) fn bit(&self, index: u16) -> bool {
        let index = index as usize;
        index < MAX_KEY_BITS as usize && self.bytes[index / 8] & (0x80 >> (index % 8)) != 0
    }

    /// Index of the first bit where `self` and `other` differ, capped at `limit`
    pub(crate) fn first_difference(&self, other: &Prefix, limit: u16) -> u16 {
        for (i, (a, b)) in self.bytes.iter().zip(other.bytes.iter()).enumerate() {
            let base = (i * 8) as u16;
            if base >= limit {
                break;
            }
            let diff = a ^ b;
            if diff != 0 {
                return (base + diff.leading_zeros() as u16).min(limit);
            }
        }
        limit
    }

    /// Whether the first `mask` bits of both keys agree
    pub(crate) fn matches_under(&self, other: &Prefix, mask: u16) -> bool {
        self.first_difference(other, mask) >= mask
    }

    /// Whether `self` covers `other`
    pub fn contains(&self, other: &Prefix) -> bool {
        self.bitlen <= other.bitlen && self.matches_under(other, self.bitlen)
    }
}

fn mask_tail(bytes: &mut [u8; KEY_BYTES], bitlen: u16) {
    let full = bitlen as usize / 8;
    let rem = bitlen as usize % 8;
    if full < KEY_BYTES {
        if rem > 0 {
            bytes[full] &= 0xffu8 << (8 - rem);
            bytes[full + 1..].fill(0);
        } else {
            bytes[full..].fill(0);
        }
    }
}

impl fmt::Display for Prefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.family {
            AddrFamily::V4 => {
                let mut octets = [0u8; 4];
                octets.copy_from_slice(&self.bytes[..4]);
                write!(f, "{}/{}", Ipv4Addr::from(octets), self.bitlen)
            }
            AddrFamily::V6 => write!(f, "{}/{}", Ipv6Addr::from(self.bytes), self.bitlen),
            AddrFamily::Mac => {
                let parts: Vec<String> = self.bytes[..6].iter().map(|b| format!("{:02x}", b)).collect();
                write!(f, "{}/{}", parts.join(":"), self.bitlen)
            }
            AddrFamily::Raw => {
                let used = (self.bitlen as usize).div_ceil(8);
                for b in &self.bytes[..used] {
                    write!(f, "{:02x}", b)?;
                }
                write!(f, "/{}", self.bitlen)
            }
        }
    }
}
