//! Osprey Patricia Tree
//!
//! Longest-prefix matching over fixed-width keys (IPv4, IPv6, MAC).
//! One generic tree parameterized by its maximum bit width; nodes live in
//! an arena and are addressed by [`NodeId`].
//!
//! A node whose `prefix` is unset is a glue node: a pure branch point
//! created when two prefixes diverge below their common ancestor.

mod prefix;
mod tree;

pub use prefix::{AddrFamily, Prefix};
pub use tree::{NodeId, PatriciaTree, TreeStats};

use thiserror::Error;

/// Widest supported key (IPv6)
pub const MAX_KEY_BITS: u16 = 128;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TrieError {
    #[error("Prefix length {bits} exceeds tree width {max}")]
    PrefixTooLong { bits: u16, max: u16 },

    #[error("Unsupported tree width: {0} bits")]
    InvalidWidth(u16),

    #[error("Invalid prefix: {0}")]
    InvalidPrefix(String),

    #[error("Tree structure corrupted: {0}")]
    Corrupted(&'static str),
}

pub type TrieResult<T> = Result<T, TrieError>;
