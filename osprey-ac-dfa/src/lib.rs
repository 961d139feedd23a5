// Osprey AC-DFA - Aho-Corasick Multi-Pattern Automaton
//!
// This crate provides fast multi-pattern byte matching using the
// Aho-Corasick algorithm, used by Osprey to map hostnames and payload
// markers to protocol ids.
//
// ## Overview
//
// Several automata coexist in one detection module (one for hostnames,
// one for payload markers), so each query runs against the narrowest
// pattern set that applies.
//
// ## Pattern kinds
//
// - Contains: `"BitTorrent protocol"` anywhere in a payload
// - Prefix: payload starts with `"SSH-2.0-"`
// - Suffix / Exact: plain string anchoring
// - Domain: `"example.com"` matches `example.com` and `www.example.com`
//
// ## Architecture
//
// ```text
// ┌─────────────────────────────────────────────────┐
// │           Automaton (open)                      │
// │  add_pattern(bytes, id) / add(MatchPattern)     │
// └──────────────┬──────────────────────────────────┘
//                │ finalize()
//                v
// ┌─────────────────────────────────────────────────┐
// │         Aho-Corasick DFA                        │
// │  (overlapping matches in O(n) time)             │
// └──────────────┬──────────────────────────────────┘
//                │
//                v
// ┌─────────────────────────────────────────────────┐
// │         Query Interface                         │
// │  - find_first / find_longest                    │
// │  - find_all: lazy (span, id) iterator           │
// └─────────────────────────────────────────────────┘
// ```

mod builder;
mod matcher;
mod pattern;

#[cfg(test)]
mod perf;

pub use builder::AutomatonBuilder;
pub use matcher::{Automaton, AutomatonStats, Matches, PatternMatch};
pub use pattern::{MatchPattern, PatternId, PatternKind};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur in the automaton
#[derive(Debug, Error)]
pub enum AutomatonError {
    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Duplicate pattern: {0}")]
    DuplicatePattern(String),

    #[error("Pattern too long: {length} bytes (max: {max})")]
    PatternTooLong { length: usize, max: usize },

    #[error("Too many patterns: {count} (max: {max})")]
    TooManyPatterns { count: usize, max: usize },

    #[error("Automaton is finalized; no more patterns can be added")]
    Frozen,

    #[error("Automaton is not finalized")]
    NotFinalized,
}

/// Result type for automaton operations
pub type AutomatonResult<T> = Result<T, AutomatonError>;

/// Configuration for an automaton
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutomatonConfig {
    /// Maximum number of patterns (0 = unlimited)
    pub max_patterns: usize,

    /// Maximum pattern length in bytes (0 = unlimited)
    pub max_pattern_length: usize,

    /// ASCII case-folded matching
    pub case_insensitive: bool,
}

impl Default for AutomatonConfig {
    fn default() -> Self {
        Self {
            max_patterns: 10_000,
            max_pattern_length: 4096,
            case_insensitive: false,
        }
    }
}
