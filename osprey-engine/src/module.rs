// Classification driver
//
// A DetectionModule is immutable after `ModuleBuilder::build`. Each call to
// `process_packet` advances one flow through
// Fresh -> Guessing -> Refining -> {Classified | GivenUp}.
// Confidence only ever rises until a give-up or a renegotiation reset, and
// risk bits are never cleared.

use crate::config::EngineConfig;
use crate::metrics::{EngineMetrics, ModuleStats};
use crate::{EngineError, EngineResult};
use ahash::{AHashSet, RandomState};
use osprey_ac_dfa::Automaton;
use osprey_flow::{DissectContext, DissectLimits, Dissection, Dissector, FlowContext, Findings};
use osprey_lru::MemoCache;
use osprey_packet::{Direction, PacketError, PacketView};
use osprey_patricia::{PatriciaTree, Prefix};
use osprey_schema::{
    Breed, Category, Confidence, DetectionMask, FlowState, L4Protocol, ProtocolId, ProtocolPair,
    ProtocolRegistry, RiskFlags, Verdict, UNKNOWN_PROTOCOL,
};
use smallvec::SmallVec;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Content decode failures tolerated before a flow is given up
const MALFORMED_LIMIT: u32 = 3;

/// Address cache values carry the authoritative flag in the top bit
const AUTHORITATIVE_BIT: u16 = 0x8000;

/// Memo cache value for "looked up, nothing matched"
const NO_MATCH: u16 = 0;

// Fixed seeds so that modules sharing a cache agree on keys
const CACHE_HASH_SEEDS: (u64, u64, u64, u64) = (
    0x9e37_79b9_7f4a_7c15,
    0xbf58_476d_1ce4_e5b9,
    0x94d0_49bb_1331_11eb,
    0x2545_f491_4f6c_dd1d,
);

// Key namespaces inside the memo caches
const KEY_HOST: u8 = 1;
const KEY_ADDRESS: u8 = 2;
const KEY_REFINED: u8 = 3;

pub(crate) fn cache_hasher() -> RandomState {
    let (k0, k1, k2, k3) = CACHE_HASH_SEEDS;
    RandomState::with_seeds(k0, k1, k2, k3)
}

/// A dissector bound to its registry id
pub(crate) struct BoundDissector {
    pub(crate) dissector: Box<dyn Dissector>,
    pub(crate) protocol: ProtocolId,
    /// Selection mask narrowed by the protocol's own detection mask
    pub(crate) mask: DetectionMask,
}

/// Protocols bound to one address prefix
#[derive(Debug, Clone, Default)]
pub(crate) struct AddressEntry {
    /// Port-less rule; a hint only
    pub(crate) any_port: Option<ProtocolId>,
    /// `(port, protocol)` rules; authoritative
    pub(crate) ports: SmallVec<[(u16, ProtocolId); 2]>,
}

impl AddressEntry {
    fn lookup(&self, port: u16) -> Option<(ProtocolId, bool)> {
        self.ports
            .iter()
            .find(|(p, _)| *p == port)
            .map(|&(_, id)| (id, true))
            .or_else(|| self.any_port.map(|id| (id, false)))
    }
}

/// A classification candidate produced while handling one packet
#[derive(Debug, Clone, Copy)]
struct Candidate {
    protocol: ProtocolPair,
    confidence: Confidence,
    category: Option<Category>,
    definitive: bool,
    /// May be remembered for the flow's server endpoint
    memoize: bool,
}

/// Finalized, thread-safe protocol detection module
pub struct DetectionModule {
    config: EngineConfig,
    registry: ProtocolRegistry,
    dissectors: Vec<BoundDissector>,
    hosts: Automaton,
    content: Automaton,
    ipv4: PatriciaTree<AddressEntry>,
    ipv6: PatriciaTree<AddressEntry>,
    host_cache: Arc<MemoCache>,
    address_cache: Arc<MemoCache>,
    limits: DissectLimits,
    hasher: RandomState,
    /// Mixed into every cache key; differs between modules whose lookups
    /// could disagree
    fingerprint: u64,
    risky_hosts: Automaton,
    malicious_fingerprints: AHashSet<String>,
    metrics: EngineMetrics,
}

impl DetectionModule {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: EngineConfig,
        registry: ProtocolRegistry,
        dissectors: Vec<BoundDissector>,
        hosts: Automaton,
        content: Automaton,
        ipv4: PatriciaTree<AddressEntry>,
        ipv6: PatriciaTree<AddressEntry>,
        host_cache: Arc<MemoCache>,
        address_cache: Arc<MemoCache>,
        limits: DissectLimits,
        fingerprint: u64,
        risky_hosts: Automaton,
        malicious_fingerprints: AHashSet<String>,
    ) -> Self {
        Self {
            config,
            registry,
            dissectors,
            hosts,
            content,
            ipv4,
            ipv6,
            host_cache,
            address_cache,
            limits,
            hasher: cache_hasher(),
            fingerprint,
            risky_hosts,
            malicious_fingerprints,
            metrics: EngineMetrics::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ProtocolRegistry {
        &self.registry
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// Hash of everything memoized lookups depend on
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// Start tracking a new flow from its first packet
    pub fn create_flow(&self, packet: &PacketView<'_>, now_ms: u64) -> FlowContext {
        EngineMetrics::incr(&self.metrics.flows_created);
        let mut flow = FlowContext::for_packet(packet, now_ms);
        flow.ensure_slots(self.dissectors.len());
        flow
    }

    /// Frame raw IP bytes, counting failures
    pub fn parse<'a>(&self, bytes: &'a [u8]) -> EngineResult<PacketView<'a>> {
        PacketView::parse(bytes).map_err(|err| {
            EngineMetrics::incr(&self.metrics.malformed_packets);
            EngineError::Packet(err)
        })
    }

    /// Advance a flow by one raw packet
    ///
    /// Unparsable framing is returned as an error; the flow records it as
    /// a risk and stays usable.
    pub fn process_packet(
        &self,
        flow: &mut FlowContext,
        bytes: &[u8],
        now_ms: u64,
    ) -> EngineResult<Verdict> {
        let view = match self.parse(bytes) {
            Ok(view) => view,
            Err(err) => {
                if matches!(err, EngineError::Packet(PacketError::Malformed(_))) {
                    flow.record_malformed();
                }
                debug!(flow_id = flow.id(), error = %err, "Packet skipped");
                return Err(err);
            }
        };
        Ok(self.process_parsed(flow, &view, now_ms))
    }

    /// Advance a flow by one framed packet
    pub fn process_parsed(&self, flow: &mut FlowContext, view: &PacketView<'_>, now_ms: u64) -> Verdict {
        self.metrics.record_packet(view.wire_len);
        let direction = flow.observe_packet(view, now_ms);
        trace!(
            flow_id = flow.id(),
            direction = ?direction,
            payload = view.payload.len(),
            state = flow.state().as_str(),
            "Processing packet"
        );

        match flow.state() {
            FlowState::GivenUp => return flow.verdict(&self.registry),
            FlowState::Classified => {
                self.extra_dissection(flow, view, direction);
                return flow.verdict(&self.registry);
            }
            _ => {}
        }

        flow.ensure_slots(self.dissectors.len());
        flow.mark_examined(view.payload.len());
        let now_secs = u32::try_from(now_ms / 1000).unwrap_or(u32::MAX);

        if flow.state() == FlowState::Fresh {
            self.guess(flow, view.l4, now_secs);
        }
        if !flow.state().is_terminal() {
            self.refine(flow, view, direction, now_secs);
        }
        self.check_terminal(flow, view);
        flow.verdict(&self.registry)
    }

    /// Stop classifying a flow and keep its best candidate
    pub fn giveup(&self, flow: &mut FlowContext) -> Verdict {
        self.give_up(flow, "requested");
        flow.verdict(&self.registry)
    }

    /// Interim verdict without touching the flow
    pub fn verdict(&self, flow: &FlowContext) -> Verdict {
        flow.verdict(&self.registry)
    }

    /// Free dissector scratch state before the flow is dropped
    pub fn release_flow(&self, flow: &mut FlowContext) {
        flow.release_scratch();
        EngineMetrics::incr(&self.metrics.flows_released);
    }

    /// Best protocol for a hostname, consulting the host cache
    pub fn match_host(&self, name: &str, now_secs: u32) -> Option<ProtocolId> {
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        let key = self.hasher.hash_one((self.fingerprint, KEY_HOST, name.as_str()));
        if let Some(value) = self.host_cache.find(key, now_secs) {
            return (value != NO_MATCH).then_some(value);
        }

        let found = match self.hosts.find_longest(name.as_bytes()) {
            Ok(m) => m.map(|m| m.id as ProtocolId),
            Err(err) => {
                warn!(error = %err, "Host automaton lookup failed");
                return None;
            }
        };
        self.host_cache.insert(key, found.unwrap_or(NO_MATCH), now_secs);
        if found.is_some() {
            EngineMetrics::incr(&self.metrics.host_matches);
        }
        trace!(host = %name, protocol = ?found, "Host lookup");
        found
    }

    /// Protocol bound to an address (and port), with whether the rule is authoritative
    pub fn match_address(
        &self,
        addr: IpAddr,
        port: u16,
        l4: L4Protocol,
        now_secs: u32,
    ) -> Option<(ProtocolId, bool)> {
        let key = self.hasher.hash_one((self.fingerprint, KEY_ADDRESS, addr, port, l4.number()));
        if let Some(value) = self.address_cache.find(key, now_secs) {
            if value == NO_MATCH {
                return None;
            }
            return Some((value & !AUTHORITATIVE_BIT, value & AUTHORITATIVE_BIT != 0));
        }

        let tree = match addr {
            IpAddr::V4(_) => &self.ipv4,
            IpAddr::V6(_) => &self.ipv6,
        };
        let found = tree
            .search_best(&Prefix::host(addr))
            .and_then(|entry| entry.lookup(port));

        match found {
            // Ids that collide with the flag bit are not memoized
            Some((id, _)) if id & AUTHORITATIVE_BIT != 0 => {}
            Some((id, authoritative)) => {
                let value = if authoritative { id | AUTHORITATIVE_BIT } else { id };
                self.address_cache.insert(key, value, now_secs);
            }
            None => self.address_cache.insert(key, NO_MATCH, now_secs),
        }
        if found.is_some() {
            EngineMetrics::incr(&self.metrics.address_matches);
        }
        found
    }

    /// Whether a hostname falls under a risky-domain rule
    pub fn is_risky_host(&self, name: &str) -> bool {
        if self.risky_hosts.pattern_count() == 0 {
            return false;
        }
        let name = name.trim_end_matches('.').to_ascii_lowercase();
        match self.risky_hosts.find_longest(name.as_bytes()) {
            Ok(found) => found.is_some(),
            Err(err) => {
                warn!(error = %err, "Risky host lookup failed");
                false
            }
        }
    }

    pub fn stats(&self) -> ModuleStats {
        ModuleStats {
            registry: self.registry.stats(),
            host_automaton: self.hosts.stats(),
            content_automaton: self.content.stats(),
            ipv4_trie: self.ipv4.stats(),
            ipv6_trie: self.ipv6.stats(),
            host_cache: self.host_cache.stats(),
            address_cache: self.address_cache.stats(),
            dissectors: self
                .dissectors
                .iter()
                .map(|b| b.dissector.name().to_string())
                .collect(),
            metrics: self.metrics.snapshot(),
        }
    }

    // ------------------------------------------------------------------
    // Guessing
    // ------------------------------------------------------------------

    fn guess(&self, flow: &mut FlowContext, l4: L4Protocol, now_secs: u32) {
        let (Some(client), Some(server)) = (flow.client(), flow.server()) else {
            return;
        };
        let by_port = self.registry.guess_by_port(l4, client.1, server.1);

        let by_address = self
            .match_address(server.0, server.1, l4, now_secs)
            .or_else(|| self.match_address(client.0, client.1, l4, now_secs));

        if let Some((app, authoritative)) = by_address {
            let pair = self.compose(by_port.unwrap_or(UNKNOWN_PROTOCOL), app);
            self.raise(flow, Candidate {
                protocol: pair,
                confidence: Confidence::IpMatch,
                category: None,
                definitive: authoritative,
                memoize: false,
            });
            if authoritative {
                self.classify(flow);
                return;
            }
        } else if let Some(app) = self.recall_refined(server, l4, now_secs) {
            self.raise(flow, Candidate {
                protocol: self.compose(by_port.unwrap_or(UNKNOWN_PROTOCOL), app),
                confidence: Confidence::IpMatch,
                category: None,
                definitive: false,
                memoize: false,
            });
        } else if let Some(id) = by_port {
            self.raise(flow, Candidate {
                protocol: ProtocolPair::single(id),
                confidence: Confidence::PortMatch,
                category: None,
                definitive: false,
                memoize: false,
            });
        }
        flow.set_state(FlowState::Guessing);
    }

    fn refined_key(&self, server: (IpAddr, u16), l4: L4Protocol) -> u64 {
        self.hasher
            .hash_one((self.fingerprint, KEY_REFINED, server.0, server.1, l4.number()))
    }

    /// Application an earlier flow to the same server endpoint was refined to
    fn recall_refined(&self, server: (IpAddr, u16), l4: L4Protocol, now_secs: u32) -> Option<ProtocolId> {
        let app = self.address_cache.find(self.refined_key(server, l4), now_secs)?;
        trace!(server = %server.0, port = server.1, app, "Refined result recalled");
        Some(app)
    }

    /// Remember a content-level application for the flow's server endpoint
    fn memoize_refined(&self, flow: &FlowContext, candidate: &Candidate, now_secs: u32) {
        let pair = candidate.protocol;
        if !candidate.memoize
            || candidate.confidence < Confidence::ContentMatch
            || pair.app == UNKNOWN_PROTOCOL
            || pair.app == pair.master
            || pair.app & AUTHORITATIVE_BIT != 0
        {
            return;
        }
        if let Some(server) = flow.server() {
            self.address_cache
                .insert(self.refined_key(server, flow.l4()), pair.app, now_secs);
        }
    }

    /// Risk conditions that depend on module-level lists
    fn screen(&self, flow: &mut FlowContext, findings: &Findings) {
        if let Some(name) = findings.server_name.as_deref() {
            if self.is_risky_host(name) {
                flow.add_risk(RiskFlags::RISKY_DOMAIN);
            }
        }
        if let Some(fingerprint) = findings.tls_fingerprint.as_deref() {
            if self.malicious_fingerprints.contains(fingerprint) {
                debug!(flow_id = flow.id(), fingerprint, "Malicious TLS fingerprint");
                flow.add_risk(RiskFlags::MALICIOUS_FINGERPRINT);
            }
        }
    }

    // ------------------------------------------------------------------
    // Refining
    // ------------------------------------------------------------------

    fn refine(&self, flow: &mut FlowContext, view: &PacketView<'_>, direction: Direction, now_secs: u32) {
        let mut candidates: SmallVec<[Candidate; 4]> = SmallVec::new();

        // A name seeded by the caller is resolved once
        if flow.packets_examined() == 1 {
            if let Some(name) = flow.server_name().map(str::to_string) {
                if self.is_risky_host(&name) {
                    flow.add_risk(RiskFlags::RISKY_DOMAIN);
                }
                if let Some(app) = self.match_host(&name, now_secs) {
                    candidates.push(self.host_candidate(flow.detected().master, app, true));
                }
            }
        }

        for index in self.dispatch_order(flow, view) {
            let protocol = self.dissectors[index].protocol;
            let identifies_server = self.dissectors[index].dissector.identifies_server();
            let Some((outcome, findings)) = self.run_dissector(flow, index, view, direction, false) else {
                continue;
            };

            if let Some(name) = findings.server_name.as_deref() {
                if let Some(app) = self.match_host(name, now_secs) {
                    candidates.push(self.host_candidate(protocol, app, identifies_server));
                }
            }
            self.screen(flow, &findings);
            flow.apply_findings(findings);

            match outcome {
                Dissection::NeedMore => {}
                Dissection::Found(result) => {
                    flow.add_risk(result.risk);
                    candidates.push(Candidate {
                        protocol: result.protocol,
                        confidence: result.confidence,
                        category: result.category,
                        definitive: result.definitive,
                        memoize: identifies_server,
                    });
                }
                Dissection::Renegotiate => {
                    self.renegotiate(flow);
                    return;
                }
                other => self.settle_slot(flow, index, other),
            }
        }

        if self.config.enable_content_matching
            && flow.confidence() < Confidence::ContentMatch
            && view.has_payload()
        {
            if let Some(candidate) = self.content_candidate(view.payload) {
                candidates.push(candidate);
            }
        }

        let Some(mut best) = candidates.into_iter().max_by_key(|c| self.rank(c)) else {
            return;
        };

        // An address rule names the application; content names the master
        let current = flow.detected();
        if flow.confidence() == Confidence::IpMatch
            && best.protocol.app == best.protocol.master
            && current.app != UNKNOWN_PROTOCOL
            && current.app != best.protocol.master
        {
            best.protocol = self.compose(best.protocol.master, current.app);
        }

        if self.raise(flow, best) {
            self.memoize_refined(flow, &best, now_secs);
            if best.definitive {
                self.classify(flow);
            }
        }
    }

    /// Dissectors selected for this packet, the current master's first
    fn dispatch_order(&self, flow: &FlowContext, view: &PacketView<'_>) -> SmallVec<[usize; 8]> {
        let master = flow.detected().master;
        let slots = flow.slots();
        let mut order: SmallVec<[usize; 8]> = self
            .dissectors
            .iter()
            .enumerate()
            .filter(|(i, b)| {
                b.mask.selects(view.is_ipv6(), view.l4, view.has_payload())
                    && slots.get(*i).is_some_and(|s| !s.excluded && !s.finished)
            })
            .map(|(i, _)| i)
            .collect();
        if let Some(pos) = order.iter().position(|&i| self.dissectors[i].protocol == master) {
            let first = order.remove(pos);
            order.insert(0, first);
        }
        order
    }

    fn run_dissector(
        &self,
        flow: &mut FlowContext,
        index: usize,
        view: &PacketView<'_>,
        direction: Direction,
        extra: bool,
    ) -> Option<(Dissection, Findings)> {
        let bound = &self.dissectors[index];
        let flow_id = flow.id();
        let slot = flow.slot_mut(index)?;
        let mut ctx = DissectContext::new(*view, direction, bound.protocol, &mut slot.state, self.limits);
        ctx.extra = extra;
        let outcome = bound.dissector.dissect(&mut ctx);
        let findings = std::mem::take(&mut ctx.findings);
        EngineMetrics::incr(&self.metrics.dissector_calls);
        trace!(
            flow_id,
            dissector = bound.dissector.name(),
            outcome = ?outcome,
            extra,
            "Dissector invoked"
        );
        Some((outcome, findings))
    }

    /// Record an outcome that ends a dissector's interest in the flow
    fn settle_slot(&self, flow: &mut FlowContext, index: usize, outcome: Dissection) {
        let dissector = self.dissectors[index].dissector.name();
        match outcome {
            Dissection::Exclude => {
                if let Some(slot) = flow.slot_mut(index) {
                    slot.excluded = true;
                    slot.state = Default::default();
                }
            }
            Dissection::Done => {
                if let Some(slot) = flow.slot_mut(index) {
                    slot.finished = true;
                }
            }
            Dissection::Malformed(what) => {
                debug!(flow_id = flow.id(), dissector, what, "Malformed content");
                EngineMetrics::incr(&self.metrics.malformed_content);
                flow.record_malformed();
                if let Some(slot) = flow.slot_mut(index) {
                    slot.excluded = true;
                    slot.state = Default::default();
                }
            }
            Dissection::NeedMore | Dissection::Found(_) | Dissection::Renegotiate => {}
        }
    }

    fn renegotiate(&self, flow: &mut FlowContext) {
        EngineMetrics::incr(&self.metrics.renegotiations);
        flow.reset_classification();
        flow.ensure_slots(self.dissectors.len());
    }

    fn host_candidate(&self, base: ProtocolId, app: ProtocolId, memoize: bool) -> Candidate {
        Candidate {
            protocol: self.compose(base, app),
            confidence: Confidence::ContentMatch,
            category: None,
            definitive: false,
            memoize,
        }
    }

    fn content_candidate(&self, payload: &[u8]) -> Option<Candidate> {
        let found = match self.content.find_first(payload) {
            Ok(found) => found?,
            Err(err) => {
                warn!(error = %err, "Content automaton lookup failed");
                return None;
            }
        };
        EngineMetrics::incr(&self.metrics.content_matches);
        Some(Candidate {
            protocol: self.compose(UNKNOWN_PROTOCOL, found.id as ProtocolId),
            confidence: Confidence::ContentMatch,
            category: None,
            definitive: false,
            memoize: false,
        })
    }

    /// Combine a transport-level master with a matched protocol
    fn compose(&self, base: ProtocolId, app: ProtocolId) -> ProtocolPair {
        let Some(descriptor) = self.registry.lookup_by_id(app) else {
            return ProtocolPair::single(base);
        };
        if let Some(master) = descriptor.master {
            return ProtocolPair::new(master, app);
        }
        if descriptor.is_informative && base == UNKNOWN_PROTOCOL {
            return ProtocolPair::new(UNKNOWN_PROTOCOL, app);
        }
        if base != UNKNOWN_PROTOCOL && base != app {
            ProtocolPair::new(base, app)
        } else {
            ProtocolPair::single(app)
        }
    }

    /// Candidate ordering: confidence, then danger, then specificity
    fn rank(&self, candidate: &Candidate) -> (Confidence, Breed, bool) {
        let pair = candidate.protocol;
        let has_app = pair.app != UNKNOWN_PROTOCOL && pair.app != pair.master;
        (candidate.confidence, self.describe(pair).1, has_app)
    }

    /// Category and breed reported for a pair
    fn describe(&self, pair: ProtocolPair) -> (Category, Breed) {
        let app = self
            .registry
            .lookup_by_id(pair.app)
            .filter(|_| pair.app != UNKNOWN_PROTOCOL);
        let master = self
            .registry
            .lookup_by_id(pair.master)
            .filter(|_| pair.master != UNKNOWN_PROTOCOL);
        let descriptor = match (app, master) {
            (Some(app), Some(master)) if app.is_informative => master,
            (Some(app), _) => app,
            (None, Some(master)) => master,
            (None, None) => return (Category::Unspecified, Breed::Unrated),
        };
        (descriptor.category, descriptor.breed)
    }

    fn raise(&self, flow: &mut FlowContext, candidate: Candidate) -> bool {
        let (category, breed) = self.describe(candidate.protocol);
        flow.raise(
            candidate.protocol,
            candidate.confidence,
            candidate.category.unwrap_or(category),
            breed,
        )
    }

    // ------------------------------------------------------------------
    // Extra dissection
    // ------------------------------------------------------------------

    fn extra_dissection(&self, flow: &mut FlowContext, view: &PacketView<'_>, direction: Direction) {
        if flow.slots().is_empty() {
            return;
        }
        let budget = self.config.extra_dissection_packets;

        for (index, bound) in self.dissectors.iter().enumerate() {
            if !bound.mask.selects(view.is_ipv6(), view.l4, view.has_payload()) {
                continue;
            }
            let Some(slot) = flow.slot_mut(index) else {
                continue;
            };
            if slot.excluded
                || slot.finished
                || slot.state.is_empty()
                || slot.extra_used >= budget
                || !bound.dissector.wants_extra_dissection(&slot.state)
            {
                continue;
            }
            slot.extra_used += 1;

            let Some((outcome, findings)) = self.run_dissector(flow, index, view, direction, true) else {
                continue;
            };
            self.screen(flow, &findings);
            flow.apply_findings(findings);
            match outcome {
                Dissection::Found(result) => flow.add_risk(result.risk),
                Dissection::Renegotiate => {
                    self.renegotiate(flow);
                    return;
                }
                other => self.settle_slot(flow, index, other),
            }
        }

        if !self.wants_more(flow) {
            trace!(flow_id = flow.id(), "Extra dissection complete");
            flow.release_scratch();
        }
    }

    /// Some dissector still has extra-dissection budget and interest
    fn wants_more(&self, flow: &FlowContext) -> bool {
        let budget = self.config.extra_dissection_packets;
        flow.slots().iter().zip(&self.dissectors).any(|(slot, bound)| {
            !slot.excluded
                && !slot.finished
                && !slot.state.is_empty()
                && slot.extra_used < budget
                && bound.dissector.wants_extra_dissection(&slot.state)
        })
    }

    // ------------------------------------------------------------------
    // Terminal conditions
    // ------------------------------------------------------------------

    fn check_terminal(&self, flow: &mut FlowContext, view: &PacketView<'_>) {
        if flow.state().is_terminal() {
            return;
        }
        if flow.confidence().is_conclusive() {
            self.classify(flow);
            return;
        }

        if flow.packets_examined() >= self.config.max_packets_to_process {
            self.give_up(flow, "packet budget");
            return;
        }
        if flow.bytes_examined() >= self.config.max_bytes_to_process {
            self.give_up(flow, "byte budget");
            return;
        }
        if flow.malformed_count() >= MALFORMED_LIMIT {
            self.give_up(flow, "malformed content");
            return;
        }
        if self.nothing_left_to_try(flow, view) {
            self.give_up(flow, "no applicable dissector");
            return;
        }

        let engaged = flow
            .slots()
            .iter()
            .any(|s| !s.excluded && !s.state.is_empty());
        if flow.state() == FlowState::Guessing
            && (flow.confidence() >= Confidence::IpMatch || engaged)
        {
            flow.set_state(FlowState::Refining);
        }
    }

    /// Every dissector for this packet family has ruled itself out and no
    /// content markers are left to try
    fn nothing_left_to_try(&self, flow: &FlowContext, view: &PacketView<'_>) -> bool {
        if self.config.enable_content_matching && self.content.pattern_count() > 0 {
            return false;
        }
        let slots = flow.slots();
        self.dissectors
            .iter()
            .enumerate()
            .filter(|(_, b)| b.mask.selects(view.is_ipv6(), view.l4, true))
            .all(|(i, _)| slots.get(i).map_or(true, |s| s.excluded || s.finished))
    }

    fn classify(&self, flow: &mut FlowContext) {
        flow.set_state(FlowState::Classified);
        EngineMetrics::incr(&self.metrics.flows_classified);

        let detected = flow.detected();
        if flow.confidence() >= Confidence::ContentMatch && detected.master != UNKNOWN_PROTOCOL {
            if let Some((_, port)) = flow.server() {
                let l4 = flow.l4();
                let has_ports = self
                    .registry
                    .lookup_by_id(detected.master)
                    .is_some_and(|d| d.has_default_ports(l4));
                if has_ports && !self.registry.is_default_port(detected.master, l4, port) {
                    flow.add_risk(RiskFlags::KNOWN_PROTOCOL_ON_NON_STANDARD_PORT);
                }
            }
        }
        if flow.breed().is_risky() {
            flow.add_risk(RiskFlags::UNSAFE_PROTOCOL);
        }
        debug!(
            flow_id = flow.id(),
            protocol = %self.registry.protocol_name(detected),
            confidence = %flow.confidence(),
            "Flow classified"
        );
    }

    fn give_up(&self, flow: &mut FlowContext, reason: &'static str) {
        if !flow.give_up() {
            return;
        }
        if !flow.is_bidirectional() {
            flow.add_risk(RiskFlags::UNIDIRECTIONAL_TRAFFIC);
        }
        EngineMetrics::incr(&self.metrics.flows_given_up);
        debug!(
            flow_id = flow.id(),
            reason,
            protocol = %self.registry.protocol_name(flow.detected()),
            packets = flow.packets_examined(),
            "Flow given up"
        );
    }
}
