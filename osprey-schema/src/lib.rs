//! Osprey Classification Schema
//!
//! This crate defines the vocabulary shared by every Osprey component:
//! protocol identities, categories, breeds, confidence levels, risk flags,
//! and the [`ProtocolRegistry`] that catalogs known protocols.
//! Protocol ids are dense integers in `[0, N)`; id `0` is always `Unknown`.

mod catalog;
mod registry;
mod risk;
mod verdict;

pub use registry::{ProtocolRegistry, RegistryStats};
pub use risk::RiskFlags;
pub use verdict::Verdict;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use thiserror::Error;

/// Protocol identifier (dense index into the registry)
pub type ProtocolId = u16;

/// Identifier reserved for the `Unknown` protocol
pub const UNKNOWN_PROTOCOL: ProtocolId = 0;

/// Flow identifier (direction-agnostic 5-tuple hash)
pub type FlowId = u64;

// ============================================================================
// Protocol identity
// ============================================================================

/// A (master, application) protocol pair
///
/// `app` may equal `master` when the protocol is undifferentiated, e.g.
/// plain TLS with no recognized server name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ProtocolPair {
    pub master: ProtocolId,
    pub app: ProtocolId,
}

impl ProtocolPair {
    /// The unknown pair
    pub const UNKNOWN: ProtocolPair = ProtocolPair {
        master: UNKNOWN_PROTOCOL,
        app: UNKNOWN_PROTOCOL,
    };

    pub fn new(master: ProtocolId, app: ProtocolId) -> Self {
        Self { master, app }
    }

    /// A pair where master and application are the same protocol
    pub fn single(id: ProtocolId) -> Self {
        Self { master: id, app: id }
    }

    pub fn is_unknown(&self) -> bool {
        self.master == UNKNOWN_PROTOCOL && self.app == UNKNOWN_PROTOCOL
    }

    /// The most specific known id (application first)
    pub fn upper(&self) -> ProtocolId {
        if self.app != UNKNOWN_PROTOCOL {
            self.app
        } else {
            self.master
        }
    }
}

/// Protocol category (immutable tag attached to each protocol)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Category {
    #[default]
    Unspecified,
    Web,
    Network,
    Mail,
    Streaming,
    SocialNetwork,
    Chat,
    FileSharing,
    RemoteAccess,
    Cloud,
    Download,
    System,
    Collaborative,
    Malware,
}

impl Category {
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Unspecified => "Unspecified",
            Category::Web => "Web",
            Category::Network => "Network",
            Category::Mail => "Email",
            Category::Streaming => "Streaming",
            Category::SocialNetwork => "SocialNetwork",
            Category::Chat => "Chat",
            Category::FileSharing => "FileSharing",
            Category::RemoteAccess => "RemoteAccess",
            Category::Cloud => "Cloud",
            Category::Download => "Download",
            Category::System => "System",
            Category::Collaborative => "Collaborative",
            Category::Malware => "Malware",
        }
    }

    /// Numeric code used on the wire
    pub fn code(&self) -> u16 {
        *self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        const ALL: [Category; 14] = [
            Category::Unspecified,
            Category::Web,
            Category::Network,
            Category::Mail,
            Category::Streaming,
            Category::SocialNetwork,
            Category::Chat,
            Category::FileSharing,
            Category::RemoteAccess,
            Category::Cloud,
            Category::Download,
            Category::System,
            Category::Collaborative,
            Category::Malware,
        ];
        ALL.get(code as usize).copied()
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Safety classification of a protocol, ordered from safe to dangerous
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum Breed {
    Safe,
    Acceptable,
    Fun,
    #[default]
    Unrated,
    Unsafe,
    PotentiallyDangerous,
    Dangerous,
}

impl Breed {
    pub fn as_str(&self) -> &'static str {
        match self {
            Breed::Safe => "Safe",
            Breed::Acceptable => "Acceptable",
            Breed::Fun => "Fun",
            Breed::Unrated => "Unrated",
            Breed::Unsafe => "Unsafe",
            Breed::PotentiallyDangerous => "Potentially Dangerous",
            Breed::Dangerous => "Dangerous",
        }
    }

    pub fn code(&self) -> u16 {
        *self as u16
    }

    pub fn from_code(code: u16) -> Option<Self> {
        const ALL: [Breed; 7] = [
            Breed::Safe,
            Breed::Acceptable,
            Breed::Fun,
            Breed::Unrated,
            Breed::Unsafe,
            Breed::PotentiallyDangerous,
            Breed::Dangerous,
        ];
        ALL.get(code as usize).copied()
    }

    /// Whether flows of this breed should carry the unsafe-protocol risk
    pub fn is_risky(&self) -> bool {
        *self >= Breed::Unsafe
    }
}

impl std::fmt::Display for Breed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Certainty of a classification
///
/// Ordered: a flow's confidence only moves upward until give-up or reset.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub enum Confidence {
    #[default]
    None,
    Guessed,
    PortMatch,
    IpMatch,
    ContentMatch,
    FullMatch,
}

impl Confidence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Confidence::None => "Unknown",
            Confidence::Guessed => "Guessed",
            Confidence::PortMatch => "Match by port",
            Confidence::IpMatch => "Match by IP",
            Confidence::ContentMatch => "DPI",
            Confidence::FullMatch => "DPI (full)",
        }
    }

    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Confidence::None),
            1 => Some(Confidence::Guessed),
            2 => Some(Confidence::PortMatch),
            3 => Some(Confidence::IpMatch),
            4 => Some(Confidence::ContentMatch),
            5 => Some(Confidence::FullMatch),
            _ => None,
        }
    }

    /// Confidence levels that end classification
    pub fn is_conclusive(&self) -> bool {
        *self >= Confidence::ContentMatch
    }
}

impl std::fmt::Display for Confidence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a flow's classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FlowState {
    #[default]
    Fresh,
    Guessing,
    Refining,
    Classified,
    GivenUp,
}

impl FlowState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, FlowState::Classified | FlowState::GivenUp)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FlowState::Fresh => "fresh",
            FlowState::Guessing => "guessing",
            FlowState::Refining => "refining",
            FlowState::Classified => "classified",
            FlowState::GivenUp => "given_up",
        }
    }

    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(FlowState::Fresh),
            1 => Some(FlowState::Guessing),
            2 => Some(FlowState::Refining),
            3 => Some(FlowState::Classified),
            4 => Some(FlowState::GivenUp),
            _ => None,
        }
    }
}

// ============================================================================
// Transport and detection masks
// ============================================================================

/// Layer-4 protocol of a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum L4Protocol {
    Tcp,
    Udp,
    Icmp,
    Icmpv6,
    Other(u8),
}

impl L4Protocol {
    /// IANA protocol number
    pub fn number(&self) -> u8 {
        match self {
            L4Protocol::Tcp => 6,
            L4Protocol::Udp => 17,
            L4Protocol::Icmp => 1,
            L4Protocol::Icmpv6 => 58,
            L4Protocol::Other(n) => *n,
        }
    }

    pub fn from_number(n: u8) -> Self {
        match n {
            6 => L4Protocol::Tcp,
            17 => L4Protocol::Udp,
            1 => L4Protocol::Icmp,
            58 => L4Protocol::Icmpv6,
            other => L4Protocol::Other(other),
        }
    }

    pub fn has_ports(&self) -> bool {
        matches!(self, L4Protocol::Tcp | L4Protocol::Udp)
    }
}

impl std::fmt::Display for L4Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            L4Protocol::Tcp => write!(f, "tcp"),
            L4Protocol::Udp => write!(f, "udp"),
            L4Protocol::Icmp => write!(f, "icmp"),
            L4Protocol::Icmpv6 => write!(f, "icmpv6"),
            L4Protocol::Other(n) => write!(f, "ip-{}", n),
        }
    }
}

bitflags::bitflags! {
    /// Which L3/L4 families a protocol (or dissector) applies to
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct DetectionMask: u16 {
        const IPV4 = 0x0001;
        const IPV6 = 0x0002;
        const TCP = 0x0004;
        const UDP = 0x0008;
        /// Only meaningful once payload bytes are present
        const PAYLOAD = 0x0010;

        const IPV4_OR_IPV6 = Self::IPV4.bits() | Self::IPV6.bits();
        const TCP_WITH_PAYLOAD = Self::IPV4_OR_IPV6.bits() | Self::TCP.bits() | Self::PAYLOAD.bits();
        const UDP_WITH_PAYLOAD = Self::IPV4_OR_IPV6.bits() | Self::UDP.bits() | Self::PAYLOAD.bits();
        const TCP_OR_UDP_WITH_PAYLOAD = Self::TCP_WITH_PAYLOAD.bits() | Self::UDP.bits();
    }
}

impl Default for DetectionMask {
    fn default() -> Self {
        DetectionMask::TCP_OR_UDP_WITH_PAYLOAD
    }
}

impl DetectionMask {
    /// Check whether a packet with the given shape is selected by this mask
    pub fn selects(&self, is_ipv6: bool, l4: L4Protocol, has_payload: bool) -> bool {
        let l3 = if is_ipv6 {
            DetectionMask::IPV6
        } else {
            DetectionMask::IPV4
        };
        if !self.contains(l3) {
            return false;
        }
        let l4_ok = match l4 {
            L4Protocol::Tcp => self.contains(DetectionMask::TCP),
            L4Protocol::Udp => self.contains(DetectionMask::UDP),
            _ => false,
        };
        l4_ok && (has_payload || !self.contains(DetectionMask::PAYLOAD))
    }
}

/// An inclusive port range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }

    pub fn new(start: u16, end: u16) -> Self {
        if start <= end {
            Self { start, end }
        } else {
            Self {
                start: end,
                end: start,
            }
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port <= self.end
    }
}

// ============================================================================
// Protocol descriptor
// ============================================================================

/// Static description of a known protocol
///
/// Immutable once the registry is finalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolDescriptor {
    /// Human-readable name (unique, case-sensitive)
    pub name: String,
    /// Master protocol for application protocols (e.g. QUIC for a QUIC-only app)
    pub master: Option<ProtocolId>,
    pub category: Category,
    pub breed: Breed,
    /// Default detection bitmask
    pub detection: DetectionMask,
    /// Child protocols that only annotate the master
    pub is_informative: bool,
    pub tcp_ports: SmallVec<[PortRange; 2]>,
    pub udp_ports: SmallVec<[PortRange; 2]>,
    /// Hostname patterns matched as domain suffixes
    pub host_patterns: Vec<String>,
    /// Payload markers matched as substrings
    pub content_patterns: Vec<String>,
}

impl ProtocolDescriptor {
    /// Create a descriptor with default values
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            master: None,
            category: Category::Unspecified,
            breed: Breed::Unrated,
            detection: DetectionMask::default(),
            is_informative: false,
            tcp_ports: SmallVec::new(),
            udp_ports: SmallVec::new(),
            host_patterns: Vec::new(),
            content_patterns: Vec::new(),
        }
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = category;
        self
    }

    pub fn with_breed(mut self, breed: Breed) -> Self {
        self.breed = breed;
        self
    }

    pub fn with_master(mut self, master: ProtocolId) -> Self {
        self.master = Some(master);
        self
    }

    pub fn with_detection(mut self, detection: DetectionMask) -> Self {
        self.detection = detection;
        self
    }

    pub fn informative(mut self) -> Self {
        self.is_informative = true;
        self
    }

    pub fn with_tcp_ports(mut self, ports: &[PortRange]) -> Self {
        self.tcp_ports.extend_from_slice(ports);
        self
    }

    pub fn with_udp_ports(mut self, ports: &[PortRange]) -> Self {
        self.udp_ports.extend_from_slice(ports);
        self
    }

    pub fn with_hosts(mut self, hosts: &[&str]) -> Self {
        self.host_patterns
            .extend(hosts.iter().map(|h| h.to_string()));
        self
    }

    pub fn with_content(mut self, markers: &[&str]) -> Self {
        self.content_patterns
            .extend(markers.iter().map(|m| m.to_string()));
        self
    }

    /// Default ports for an L4 protocol
    pub fn ports(&self, l4: L4Protocol) -> &[PortRange] {
        match l4 {
            L4Protocol::Tcp => &self.tcp_ports,
            L4Protocol::Udp => &self.udp_ports,
            _ => &[],
        }
    }

    pub fn has_default_ports(&self, l4: L4Protocol) -> bool {
        !self.ports(l4).is_empty()
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Registry errors
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Protocol already registered: {0}")]
    Duplicate(String),

    #[error("Registry is frozen; cannot register {0}")]
    Frozen(String),

    #[error("Registry is not finalized")]
    NotFinalized,

    #[error("Inconsistent registry: {0}")]
    Inconsistent(String),

    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),

    #[error("Too many protocols: max {max}")]
    TooManyProtocols { max: usize },
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_ordering() {
        assert!(Confidence::FullMatch > Confidence::ContentMatch);
        assert!(Confidence::ContentMatch > Confidence::IpMatch);
        assert!(Confidence::IpMatch > Confidence::PortMatch);
        assert!(Confidence::PortMatch > Confidence::Guessed);
        assert!(Confidence::Guessed > Confidence::None);
        assert!(Confidence::ContentMatch.is_conclusive());
        assert!(!Confidence::IpMatch.is_conclusive());
    }

    #[test]
    fn test_confidence_code_roundtrip() {
        for code in 0..6u8 {
            let c = Confidence::from_code(code).unwrap();
            assert_eq!(c.code(), code);
        }
        assert!(Confidence::from_code(6).is_none());
    }

    #[test]
    fn test_breed_ordering() {
        assert!(Breed::Dangerous > Breed::Unsafe);
        assert!(Breed::Unsafe > Breed::Unrated);
        assert!(Breed::Safe < Breed::Acceptable);
        assert!(Breed::PotentiallyDangerous.is_risky());
        assert!(!Breed::Fun.is_risky());
    }

    #[test]
    fn test_category_codes() {
        assert_eq!(Category::from_code(Category::Streaming.code()), Some(Category::Streaming));
        assert_eq!(Category::from_code(999), None);
        assert_eq!(Category::Mail.to_string(), "Email");
    }

    #[test]
    fn test_detection_mask_selects() {
        let mask = DetectionMask::TCP_WITH_PAYLOAD;
        assert!(mask.selects(false, L4Protocol::Tcp, true));
        assert!(mask.selects(true, L4Protocol::Tcp, true));
        assert!(!mask.selects(false, L4Protocol::Tcp, false));
        assert!(!mask.selects(false, L4Protocol::Udp, true));

        let v4_udp = DetectionMask::IPV4 | DetectionMask::UDP;
        assert!(v4_udp.selects(false, L4Protocol::Udp, false));
        assert!(!v4_udp.selects(true, L4Protocol::Udp, false));
    }

    #[test]
    fn test_protocol_pair() {
        let pair = ProtocolPair::new(3, 17);
        assert_eq!(pair.upper(), 17);
        assert!(!pair.is_unknown());
        assert!(ProtocolPair::UNKNOWN.is_unknown());
        assert_eq!(ProtocolPair::new(3, UNKNOWN_PROTOCOL).upper(), 3);
    }

    #[test]
    fn test_port_range() {
        let range = PortRange::new(6889, 6881);
        assert_eq!(range.start, 6881);
        assert!(range.contains(6885));
        assert!(!range.contains(6890));
    }

    #[test]
    fn test_flow_state_terminal() {
        assert!(FlowState::Classified.is_terminal());
        assert!(FlowState::GivenUp.is_terminal());
        assert!(!FlowState::Refining.is_terminal());
    }
}
