// Engine metrics
//
// Counters are updated from every flow-processing thread with relaxed
// ordering; snapshots are therefore approximate while traffic is flowing.

use osprey_ac_dfa::AutomatonStats;
use osprey_lru::CacheStats;
use osprey_patricia::TreeStats;
use osprey_schema::RegistryStats;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Engine-wide counters
#[derive(Debug, Default)]
pub struct EngineMetrics {
    /// Packets handed to the driver
    pub packets: AtomicU64,

    /// Wire bytes handed to the driver
    pub bytes: AtomicU64,

    /// Packets rejected during framing
    pub malformed_packets: AtomicU64,

    /// Dissector reports of undecodable content
    pub malformed_content: AtomicU64,

    pub flows_created: AtomicU64,
    pub flows_classified: AtomicU64,
    pub flows_given_up: AtomicU64,
    pub flows_released: AtomicU64,

    /// Individual dissector invocations
    pub dissector_calls: AtomicU64,

    /// Mid-flow protocol switches
    pub renegotiations: AtomicU64,

    pub content_matches: AtomicU64,
    pub host_matches: AtomicU64,
    pub address_matches: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_packet(&self, wire_len: usize) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(wire_len as u64, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            packets: load(&self.packets),
            bytes: load(&self.bytes),
            malformed_packets: load(&self.malformed_packets),
            malformed_content: load(&self.malformed_content),
            flows_created: load(&self.flows_created),
            flows_classified: load(&self.flows_classified),
            flows_given_up: load(&self.flows_given_up),
            flows_released: load(&self.flows_released),
            dissector_calls: load(&self.dissector_calls),
            renegotiations: load(&self.renegotiations),
            content_matches: load(&self.content_matches),
            host_matches: load(&self.host_matches),
            address_matches: load(&self.address_matches),
        }
    }
}

/// Point-in-time copy of [`EngineMetrics`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub packets: u64,
    pub bytes: u64,
    pub malformed_packets: u64,
    pub malformed_content: u64,
    pub flows_created: u64,
    pub flows_classified: u64,
    pub flows_given_up: u64,
    pub flows_released: u64,
    pub dissector_calls: u64,
    pub renegotiations: u64,
    pub content_matches: u64,
    pub host_matches: u64,
    pub address_matches: u64,
}

/// Everything a detection module can report about itself
#[derive(Debug, Clone, Serialize)]
pub struct ModuleStats {
    pub registry: RegistryStats,
    pub host_automaton: AutomatonStats,
    pub content_automaton: AutomatonStats,
    pub ipv4_trie: TreeStats,
    pub ipv6_trie: TreeStats,
    pub host_cache: CacheStats,
    pub address_cache: CacheStats,
    pub dissectors: Vec<String>,
    pub metrics: MetricsSnapshot,
}
