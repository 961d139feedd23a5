// Dissector capability interface
//
// A dissector inspects the payload of one packet, keeps whatever it needs
// in its own slot of the flow's scratch state, and reports a summarized
// outcome. The driver never looks inside the scratch state.

use crate::dns::DnsState;
use crate::http::HttpState;
use crate::tls::TlsState;
use crate::{FlowError, FlowResult};
use osprey_packet::{Direction, PacketView};
use osprey_schema::{Category, Confidence, DetectionMask, ProtocolId, ProtocolPair, RiskFlags};

/// A protocol dissector
///
/// Implementations are stateless; per-flow state lives in
/// [`DissectorState`] and is handed in through [`DissectContext`].
pub trait Dissector: Send + Sync {
    /// Short identifier used in logs
    fn name(&self) -> &'static str;

    /// Registry name of the protocol this dissector recognizes
    fn protocol(&self) -> &str;

    /// Packet shapes this dissector applies to
    fn selection(&self) -> DetectionMask;

    /// Inspect one packet
    fn dissect(&self, ctx: &mut DissectContext<'_>) -> Dissection;

    /// Whether the dissector still expects useful data after the flow
    /// has been classified (certificates, response codes, ...)
    fn wants_extra_dissection(&self, _state: &DissectorState) -> bool {
        false
    }

    /// Whether names this dissector reports belong to the server it talks
    /// to, so a result can stand for that endpoint in later flows
    fn identifies_server(&self) -> bool {
        true
    }
}

/// Outcome of one dissector invocation
#[derive(Debug, Clone, PartialEq)]
pub enum Dissection {
    /// Not decided yet; call again with the next packet
    NeedMore,
    /// Definitely not this protocol; stop calling for this flow
    Exclude,
    /// Protocol recognized
    Found(MatchResult),
    /// Recognized but nothing more worth looking at
    Done,
    /// Content claimed to be this protocol but failed to decode
    Malformed(&'static str),
    /// The flow switched protocols (e.g. an acknowledged tunnel)
    Renegotiate,
}

/// Candidate produced by one matcher invocation
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub protocol: ProtocolPair,
    pub confidence: Confidence,
    pub category: Option<Category>,
    pub risk: RiskFlags,
    /// The dissector is certain; classification ends regardless of level
    pub definitive: bool,
}

impl MatchResult {
    pub fn new(protocol: ProtocolPair, confidence: Confidence) -> Self {
        Self {
            protocol,
            confidence,
            category: None,
            risk: RiskFlags::empty(),
            definitive: false,
        }
    }

    pub fn with_category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    pub fn with_risk(mut self, risk: RiskFlags) -> Self {
        self.risk |= risk;
        self
    }

    pub fn definitive(mut self) -> Self {
        self.definitive = true;
        self
    }
}

/// Resource limits handed to dissectors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DissectLimits {
    /// Bytes buffered per direction while reassembling records
    pub tls_reassembly_limit: usize,
}

impl Default for DissectLimits {
    fn default() -> Self {
        Self {
            tls_reassembly_limit: 16 * 1024,
        }
    }
}

/// Side outputs of a dissector, applied to the flow by the driver
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Findings {
    pub server_name: Option<String>,
    pub user_agent: Option<String>,
    pub http_method: Option<String>,
    pub http_status: Option<u16>,
    pub tls_version: Option<u16>,
    /// JA3 text of a ClientHello
    pub tls_fingerprint: Option<String>,
    pub risk: RiskFlags,
}

impl Findings {
    pub fn is_empty(&self) -> bool {
        *self == Findings::default()
    }
}

/// Everything a dissector sees for one packet
pub struct DissectContext<'a> {
    pub packet: PacketView<'a>,
    pub direction: Direction,
    /// Registry id bound to the running dissector
    pub protocol_id: ProtocolId,
    pub state: &'a mut DissectorState,
    pub limits: DissectLimits,
    /// Set when the flow is already classified
    pub extra: bool,
    pub findings: Findings,
}

impl<'a> DissectContext<'a> {
    pub fn new(
        packet: PacketView<'a>,
        direction: Direction,
        protocol_id: ProtocolId,
        state: &'a mut DissectorState,
        limits: DissectLimits,
    ) -> Self {
        Self {
            packet,
            direction,
            protocol_id,
            state,
            limits,
            extra: false,
            findings: Findings::default(),
        }
    }

    pub fn payload(&self) -> &'a [u8] {
        self.packet.payload
    }

    /// A content-level match of the bound protocol
    pub fn content_match(&self) -> MatchResult {
        MatchResult::new(
            ProtocolPair::single(self.protocol_id),
            Confidence::ContentMatch,
        )
    }
}

/// Per-dissector scratch state for one flow
#[derive(Debug, Default)]
pub enum DissectorState {
    #[default]
    Empty,
    Tls(TlsState),
    Http(HttpState),
    Dns(DnsState),
}

impl DissectorState {
    pub fn is_empty(&self) -> bool {
        matches!(self, DissectorState::Empty)
    }

    /// Heap bytes held by the state
    pub fn memory_usage(&self) -> usize {
        match self {
            DissectorState::Empty => 0,
            DissectorState::Tls(tls) => tls.buffered(),
            DissectorState::Http(_) | DissectorState::Dns(_) => 0,
        }
    }

    pub fn tls_mut(&mut self) -> Option<&mut TlsState> {
        if self.is_empty() {
            *self = DissectorState::Tls(TlsState::default());
        }
        match self {
            DissectorState::Tls(state) => Some(state),
            _ => None,
        }
    }

    pub fn http_mut(&mut self) -> Option<&mut HttpState> {
        if self.is_empty() {
            *self = DissectorState::Http(HttpState::default());
        }
        match self {
            DissectorState::Http(state) => Some(state),
            _ => None,
        }
    }

    pub fn dns_mut(&mut self) -> Option<&mut DnsState> {
        if self.is_empty() {
            *self = DissectorState::Dns(DnsState::default());
        }
        match self {
            DissectorState::Dns(state) => Some(state),
            _ => None,
        }
    }
}

/// Big-endian cursor over untrusted bytes
pub(crate) struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(buf: &'a [u8], what: &'static str) -> Self {
        Self { buf, pos: 0, what }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn take(&mut self, n: usize) -> FlowResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(FlowError::Truncated(self.what));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub(crate) fn skip(&mut self, n: usize) -> FlowResult<()> {
        self.take(n).map(|_| ())
    }

    pub(crate) fn u8(&mut self) -> FlowResult<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> FlowResult<u16> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub(crate) fn u24(&mut self) -> FlowResult<usize> {
        let b = self.take(3)?;
        Ok(((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
    }

    /// A length-prefixed slice with a `u8` length
    pub(crate) fn vec8(&mut self) -> FlowResult<&'a [u8]> {
        let len = self.u8()? as usize;
        self.take(len)
    }

    /// A length-prefixed slice with a `u16` length
    pub(crate) fn vec16(&mut self) -> FlowResult<&'a [u8]> {
        let len = self.u16()? as usize;
        self.take(len)
    }
}
