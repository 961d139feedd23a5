// Pattern types for the automaton
//
// A pattern is a byte string bound to a numeric id plus the kind of
// containment check a raw Aho-Corasick hit must satisfy.

use crate::{AutomatonError, AutomatonResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Numeric id bound to a pattern (usually a protocol id)
pub type PatternId = u32;

/// A byte pattern bound to a numeric id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatchPattern {
    /// The bytes to search for
    pub bytes: Vec<u8>,

    /// Value reported when the pattern matches
    pub id: PatternId,

    /// What kind of match a hit must satisfy
    pub kind: PatternKind,
}

impl MatchPattern {
    /// Create a new match pattern
    pub fn new(bytes: impl Into<Vec<u8>>, id: PatternId, kind: PatternKind) -> AutomatonResult<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(AutomatonError::InvalidPattern(
                "Pattern cannot be empty".to_string(),
            ));
        }
        if kind == PatternKind::Domain && bytes.iter().all(|&b| b == b'.') {
            return Err(AutomatonError::InvalidPattern(
                "Domain pattern needs at least one label".to_string(),
            ));
        }
        Ok(Self { bytes, id, kind })
    }

    /// Substring anywhere in the haystack
    pub fn contains(bytes: impl Into<Vec<u8>>, id: PatternId) -> AutomatonResult<Self> {
        Self::new(bytes, id, PatternKind::Contains)
    }

    /// Haystack starts with the pattern
    pub fn prefix(bytes: impl Into<Vec<u8>>, id: PatternId) -> AutomatonResult<Self> {
        Self::new(bytes, id, PatternKind::Prefix)
    }

    /// Haystack ends with the pattern
    pub fn suffix(bytes: impl Into<Vec<u8>>, id: PatternId) -> AutomatonResult<Self> {
        Self::new(bytes, id, PatternKind::Suffix)
    }

    /// Haystack equals the pattern
    pub fn exact(bytes: impl Into<Vec<u8>>, id: PatternId) -> AutomatonResult<Self> {
        Self::new(bytes, id, PatternKind::Exact)
    }

    /// Hostname equals the pattern or is a subdomain of it
    pub fn domain(bytes: impl Into<Vec<u8>>, id: PatternId) -> AutomatonResult<Self> {
        Self::new(bytes, id, PatternKind::Domain)
    }

    /// Validate this pattern
    pub fn validate(&self, max_length: usize) -> AutomatonResult<()> {
        if max_length > 0 && self.bytes.len() > max_length {
            return Err(AutomatonError::PatternTooLong {
                length: self.bytes.len(),
                max: max_length,
            });
        }
        Ok(())
    }

    /// Check whether a raw hit at `[start, end)` satisfies this pattern's kind
    pub fn accepts(&self, haystack: &[u8], start: usize, end: usize) -> bool {
        match self.kind {
            PatternKind::Contains => true,
            PatternKind::Prefix => start == 0,
            PatternKind::Suffix => end == haystack.len(),
            PatternKind::Exact => start == 0 && end == haystack.len(),
            PatternKind::Domain => {
                end == haystack.len()
                    && (start == 0
                        || self.bytes.first() == Some(&b'.')
                        || haystack[start - 1] == b'.')
            }
        }
    }
}

/// The type of containment check to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PatternKind {
    Contains,
    Prefix,
    Suffix,
    Exact,
    /// Suffix aligned on a `.` label boundary
    Domain,
}

impl PatternKind {
    /// Get all pattern kinds
    pub fn all() -> &'static [PatternKind] {
        &[
            PatternKind::Contains,
            PatternKind::Prefix,
            PatternKind::Suffix,
            PatternKind::Exact,
            PatternKind::Domain,
        ]
    }
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatternKind::Contains => write!(f, "contains"),
            PatternKind::Prefix => write!(f, "prefix"),
            PatternKind::Suffix => write!(f, "suffix"),
            PatternKind::Exact => write!(f, "exact"),
            PatternKind::Domain => write!(f, "domain"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pattern_creation() {
        let pattern = MatchPattern::domain("example.com", 7).unwrap();
        assert_eq!(pattern.bytes, b"example.com");
        assert_eq!(pattern.id, 7);
        assert_eq!(pattern.kind, PatternKind::Domain);
    }

    #[test]
    fn test_pattern_empty() {
        assert!(MatchPattern::contains("", 1).is_err());
        assert!(MatchPattern::domain("..", 1).is_err());
    }

    #[test]
    fn test_pattern_validation() {
        let pattern = MatchPattern::contains("a".repeat(100), 1).unwrap();
        assert!(pattern.validate(50).is_err());
        assert!(pattern.validate(100).is_ok());
        assert!(pattern.validate(0).is_ok());
    }

    #[test]
    fn test_domain_accepts_label_boundary() {
        let pattern = MatchPattern::domain("example.com", 1).unwrap();
        let host = b"www.example.com";
        assert!(pattern.accepts(host, 4, host.len()));
        assert!(pattern.accepts(b"example.com", 0, 11));

        // "badexample.com" is not a subdomain
        assert!(!pattern.accepts(b"badexample.com", 3, 14));
        // Must end the haystack
        assert!(!pattern.accepts(b"example.com.evil", 0, 11));
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(PatternKind::Domain.to_string(), "domain");
        assert_eq!(PatternKind::all().len(), 5);
    }
}
