//! Osprey Classification Engine
//!
//! Coordinates the registry, pattern automata, address tries and memo
//! caches to classify flows one packet at a time.
//!
//! Usage follows two strictly separated phases:
//!
//! 1. Build: a [`ModuleBuilder`] collects protocols, rules and dissectors,
//!    then [`ModuleBuilder::build`] finalizes everything into an immutable
//!    [`DetectionModule`].
//! 2. Query: any number of threads call [`DetectionModule::process_packet`]
//!    on their own [`FlowContext`]s. Only the memo caches are written to.

mod builder;
mod config;
mod flow_table;
mod metrics;
mod module;
pub mod rules;

pub use builder::ModuleBuilder;
pub use config::EngineConfig;
pub use flow_table::FlowTable;
pub use metrics::{EngineMetrics, MetricsSnapshot, ModuleStats};
pub use module::DetectionModule;

pub use osprey_flow::FlowContext;
pub use osprey_schema::Verdict;

use osprey_ac_dfa::AutomatonError;
use osprey_lru::CacheError;
use osprey_packet::PacketError;
use osprey_patricia::TrieError;
use osprey_schema::RegistryError;
use thiserror::Error;

/// Engine errors
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Automaton error: {0}")]
    Automaton(#[from] AutomatonError),

    #[error("Address trie error: {0}")]
    Trie(#[from] TrieError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Rules error at line {line}: {reason}")]
    Rules { line: usize, reason: String },

    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
