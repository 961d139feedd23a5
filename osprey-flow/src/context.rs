// Per-flow classification state

use crate::dissector::{DissectorState, Findings};
use osprey_packet::{Direction, PacketView};
use osprey_schema::{
    Breed, Category, Confidence, FlowId, FlowState, L4Protocol, ProtocolPair, ProtocolRegistry,
    RiskFlags, Verdict,
};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tracing::debug;

/// Summarized application metadata gathered by dissectors
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowMetadata {
    pub server_name: Option<String>,
    pub user_agent: Option<String>,
    pub http_method: Option<String>,
    pub http_status: Option<u16>,
    pub tls_version: Option<u16>,
    pub tls_fingerprint: Option<String>,
}

/// One dissector's view of a flow
#[derive(Debug, Default)]
pub struct DissectorSlot {
    pub state: DissectorState,
    /// The dissector ruled the flow out
    pub excluded: bool,
    /// Packets handed over after classification
    pub extra_used: u32,
    /// The dissector signalled it has nothing more to read
    pub finished: bool,
}

impl DissectorSlot {
    fn reset(&mut self) {
        *self = DissectorSlot::default();
    }
}

/// Mutable state of one bidirectional connection
///
/// Created by the flow manager on the first packet and advanced only by
/// the classification driver.
#[derive(Debug)]
pub struct FlowContext {
    id: FlowId,
    l4: L4Protocol,
    client: Option<(IpAddr, u16)>,
    server: Option<(IpAddr, u16)>,
    packets: [u64; 2],
    bytes: [u64; 2],

    detected: ProtocolPair,
    confidence: Confidence,
    category: Category,
    breed: Breed,
    risk: RiskFlags,
    state: FlowState,

    packets_examined: u32,
    bytes_examined: u64,
    given_up: bool,
    malformed: u32,
    renegotiations: u32,

    metadata: FlowMetadata,
    slots: Vec<DissectorSlot>,

    first_seen_ms: u64,
    last_seen_ms: u64,
}

impl FlowContext {
    pub fn new(id: FlowId, l4: L4Protocol, now_ms: u64) -> Self {
        Self {
            id,
            l4,
            client: None,
            server: None,
            packets: [0; 2],
            bytes: [0; 2],
            detected: ProtocolPair::UNKNOWN,
            confidence: Confidence::None,
            category: Category::Unspecified,
            breed: Breed::Unrated,
            risk: RiskFlags::empty(),
            state: FlowState::Fresh,
            packets_examined: 0,
            bytes_examined: 0,
            given_up: false,
            malformed: 0,
            renegotiations: 0,
            metadata: FlowMetadata::default(),
            slots: Vec::new(),
            first_seen_ms: now_ms,
            last_seen_ms: now_ms,
        }
    }

    /// Create a context for the flow a packet belongs to
    pub fn for_packet(packet: &PacketView<'_>, now_ms: u64) -> Self {
        Self::new(packet.flow_key().id(), packet.l4, now_ms)
    }

    /// Seed a server name known out of band (e.g. from a proxy log)
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.metadata.server_name = Some(name.into().to_ascii_lowercase());
        self
    }

    pub fn id(&self) -> FlowId {
        self.id
    }

    pub fn l4(&self) -> L4Protocol {
        self.l4
    }

    pub fn client(&self) -> Option<(IpAddr, u16)> {
        self.client
    }

    pub fn server(&self) -> Option<(IpAddr, u16)> {
        self.server
    }

    pub fn detected(&self) -> ProtocolPair {
        self.detected
    }

    pub fn confidence(&self) -> Confidence {
        self.confidence
    }

    pub fn category(&self) -> Category {
        self.category
    }

    pub fn breed(&self) -> Breed {
        self.breed
    }

    pub fn risk(&self) -> RiskFlags {
        self.risk
    }

    pub fn state(&self) -> FlowState {
        self.state
    }

    pub fn packets_examined(&self) -> u32 {
        self.packets_examined
    }

    pub fn bytes_examined(&self) -> u64 {
        self.bytes_examined
    }

    pub fn is_given_up(&self) -> bool {
        self.given_up
    }

    pub fn malformed_count(&self) -> u32 {
        self.malformed
    }

    pub fn renegotiations(&self) -> u32 {
        self.renegotiations
    }

    pub fn metadata(&self) -> &FlowMetadata {
        &self.metadata
    }

    pub fn server_name(&self) -> Option<&str> {
        self.metadata.server_name.as_deref()
    }

    /// Packets seen in one direction
    pub fn packets(&self, direction: Direction) -> u64 {
        self.packets[direction.index()]
    }

    /// Wire bytes seen in one direction
    pub fn bytes(&self, direction: Direction) -> u64 {
        self.bytes[direction.index()]
    }

    pub fn total_packets(&self) -> u64 {
        self.packets[0] + self.packets[1]
    }

    pub fn total_bytes(&self) -> u64 {
        self.bytes[0] + self.bytes[1]
    }

    pub fn first_seen_ms(&self) -> u64 {
        self.first_seen_ms
    }

    pub fn last_seen_ms(&self) -> u64 {
        self.last_seen_ms
    }

    /// Account a packet and work out which way it travels
    ///
    /// The sender of the first packet is taken to be the client.
    pub fn observe_packet(&mut self, packet: &PacketView<'_>, now_ms: u64) -> Direction {
        let src = (packet.src, packet.src_port);
        let dst = (packet.dst, packet.dst_port);
        if self.client.is_none() {
            self.client = Some(src);
            self.server = Some(dst);
        }

        let direction = if self.client == Some(src) {
            Direction::ToServer
        } else {
            Direction::ToClient
        };

        let idx = direction.index();
        self.packets[idx] += 1;
        self.bytes[idx] += packet.wire_len as u64;
        self.last_seen_ms = self.last_seen_ms.max(now_ms);
        direction
    }

    /// Count a packet against the classification budget
    pub fn mark_examined(&mut self, payload_len: usize) {
        self.packets_examined = self.packets_examined.saturating_add(1);
        self.bytes_examined += payload_len as u64;
    }

    /// Both directions have carried traffic
    pub fn is_bidirectional(&self) -> bool {
        self.packets[0] > 0 && self.packets[1] > 0
    }

    /// Adopt a candidate if it does not lower confidence
    ///
    /// At equal confidence only a refinement is accepted: a first
    /// protocol, or an application under the same master.
    pub fn raise(
        &mut self,
        protocol: ProtocolPair,
        confidence: Confidence,
        category: Category,
        breed: Breed,
    ) -> bool {
        if self.state.is_terminal() || protocol.is_unknown() {
            return false;
        }

        let accept = confidence > self.confidence
            || (confidence == self.confidence && self.refines(protocol));
        if !accept {
            return false;
        }

        debug!(
            flow_id = self.id,
            master = protocol.master,
            app = protocol.app,
            from = %self.confidence,
            to = %confidence,
            "Flow classification raised"
        );
        self.detected = protocol;
        self.confidence = confidence;
        self.category = category;
        self.breed = breed;
        true
    }

    fn refines(&self, protocol: ProtocolPair) -> bool {
        if self.detected.is_unknown() {
            return true;
        }
        protocol.master == self.detected.master
            && protocol.app != self.detected.app
            && self.detected.app == self.detected.master
    }

    /// Risk bits are only ever added
    pub fn add_risk(&mut self, risk: RiskFlags) {
        self.risk |= risk;
    }

    pub fn set_state(&mut self, state: FlowState) {
        if state != self.state {
            debug!(
                flow_id = self.id,
                from = self.state.as_str(),
                to = state.as_str(),
                "Flow state transition"
            );
            self.state = state;
        }
    }

    /// Stop classifying and keep the best candidate as a guess
    ///
    /// Returns `false` if the flow had already reached a terminal state.
    pub fn give_up(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.given_up = true;
        self.confidence = Confidence::Guessed;
        self.set_state(FlowState::GivenUp);
        true
    }

    /// Forget the classification after a mid-flow protocol switch
    ///
    /// Risk bits and counters survive; dissectors start from scratch.
    pub fn reset_classification(&mut self) {
        debug!(flow_id = self.id, "Flow classification reset");
        self.detected = ProtocolPair::UNKNOWN;
        self.confidence = Confidence::None;
        self.category = Category::Unspecified;
        self.breed = Breed::Unrated;
        self.given_up = false;
        self.renegotiations += 1;
        self.slots.iter_mut().for_each(DissectorSlot::reset);
        self.state = FlowState::Refining;
    }

    /// Make sure there is one slot per registered dissector
    pub fn ensure_slots(&mut self, count: usize) {
        if self.slots.len() < count {
            self.slots.resize_with(count, DissectorSlot::default);
        }
    }

    pub fn slot_mut(&mut self, index: usize) -> Option<&mut DissectorSlot> {
        self.slots.get_mut(index)
    }

    pub fn slots(&self) -> &[DissectorSlot] {
        &self.slots
    }

    /// Heap bytes held by dissector scratch state
    pub fn scratch_usage(&self) -> usize {
        self.slots.iter().map(|s| s.state.memory_usage()).sum()
    }

    /// Drop all dissector scratch state
    pub fn release_scratch(&mut self) {
        self.slots.clear();
        self.slots.shrink_to_fit();
    }

    pub fn record_malformed(&mut self) {
        self.malformed = self.malformed.saturating_add(1);
        self.risk |= RiskFlags::MALFORMED_PACKET;
    }

    /// Merge dissector side outputs into the flow
    ///
    /// A server name already known is kept.
    pub fn apply_findings(&mut self, findings: Findings) {
        self.risk |= findings.risk;
        let meta = &mut self.metadata;
        if meta.server_name.is_none() {
            meta.server_name = findings.server_name;
        }
        if findings.user_agent.is_some() {
            meta.user_agent = findings.user_agent;
        }
        if findings.http_method.is_some() {
            meta.http_method = findings.http_method;
        }
        if findings.http_status.is_some() {
            meta.http_status = findings.http_status;
        }
        if findings.tls_version.is_some() {
            meta.tls_version = findings.tls_version;
        }
        if findings.tls_fingerprint.is_some() {
            meta.tls_fingerprint = findings.tls_fingerprint;
        }
    }

    /// Snapshot the current classification
    pub fn verdict(&self, registry: &ProtocolRegistry) -> Verdict {
        Verdict {
            flow_id: self.id,
            protocol: self.detected,
            protocol_name: registry.protocol_name(self.detected),
            confidence: self.confidence,
            category: self.category,
            breed: self.breed,
            risk: self.risk,
            state: self.state,
            packets: self.total_packets(),
            bytes: self.total_bytes(),
            server_name: self.metadata.server_name.clone(),
        }
    }
}
