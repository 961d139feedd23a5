// Automaton - multi-pattern matching over byte haystacks
//
// Patterns are collected while the automaton is open, compiled once by
// `finalize()`, and only read afterwards. Every raw Aho-Corasick hit is
// filtered through the pattern's kind (prefix, suffix, domain...) before
// it is reported.

use crate::pattern::{MatchPattern, PatternId, PatternKind};
use crate::{AutomatonConfig, AutomatonError, AutomatonResult};
use ahash::AHashSet;
use aho_corasick::{AhoCorasick, AhoCorasickBuilder, FindOverlappingIter, MatchKind};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, trace};

/// A match reported by the automaton
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternMatch {
    /// Id bound to the matched pattern
    pub id: PatternId,

    /// Kind of the matched pattern
    pub kind: PatternKind,

    /// Start of the matched span
    pub start: usize,

    /// End of the matched span (exclusive)
    pub end: usize,
}

impl PatternMatch {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Automaton statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AutomatonStats {
    pub patterns: usize,
    pub searches: u64,
    pub matches: u64,
    pub finalized: bool,
}

/// Multi-pattern matcher with an explicit build phase
pub struct Automaton {
    /// Label used in logs and stats
    name: String,

    config: AutomatonConfig,

    /// Indexed by Aho-Corasick pattern id
    patterns: Vec<MatchPattern>,

    /// (normalized bytes, kind) already added
    seen: AHashSet<(Vec<u8>, PatternKind)>,

    /// Compiled matcher, present once finalized
    compiled: Option<AhoCorasick>,

    searches: AtomicU64,
    matches: AtomicU64,
}

impl Automaton {
    /// Create an empty, open automaton
    pub fn new(name: impl Into<String>, config: AutomatonConfig) -> Self {
        Self {
            name: name.into(),
            config,
            patterns: Vec::new(),
            seen: AHashSet::default(),
            compiled: None,
            searches: AtomicU64::new(0),
            matches: AtomicU64::new(0),
        }
    }

    /// Add a substring pattern bound to `id`
    pub fn add_pattern(&mut self, bytes: impl AsRef<[u8]>, id: PatternId) -> AutomatonResult<()> {
        self.add(MatchPattern::contains(bytes.as_ref(), id)?)
    }

    /// Add a pattern of any kind
    pub fn add(&mut self, pattern: MatchPattern) -> AutomatonResult<()> {
        if self.compiled.is_some() {
            return Err(AutomatonError::Frozen);
        }
        if self.config.max_patterns > 0 && self.patterns.len() >= self.config.max_patterns {
            return Err(AutomatonError::TooManyPatterns {
                count: self.patterns.len() + 1,
                max: self.config.max_patterns,
            });
        }
        pattern.validate(self.config.max_pattern_length)?;

        let key = (self.normalize(&pattern.bytes), pattern.kind);
        if !self.seen.insert(key) {
            return Err(AutomatonError::DuplicatePattern(
                String::from_utf8_lossy(&pattern.bytes).into_owned(),
            ));
        }

        self.patterns.push(pattern);
        Ok(())
    }

    fn normalize(&self, bytes: &[u8]) -> Vec<u8> {
        if self.config.case_insensitive {
            bytes.to_ascii_lowercase()
        } else {
            bytes.to_vec()
        }
    }

    /// Compile the pattern set; the automaton is read-only afterwards
    ///
    /// Finalizing twice is a no-op. An empty automaton never matches.
    pub fn finalize(&mut self) -> AutomatonResult<()> {
        if self.compiled.is_some() {
            return Ok(());
        }

        let mut builder = AhoCorasickBuilder::new();
        // Standard semantics are required for overlapping iteration
        builder.match_kind(MatchKind::Standard);
        if self.config.case_insensitive {
            builder.ascii_case_insensitive(true);
        }

        let compiled = builder
            .build(self.patterns.iter().map(|p| p.bytes.as_slice()))
            .map_err(|e| {
                AutomatonError::InvalidPattern(format!("Failed to build automaton: {}", e))
            })?;

        info!(
            automaton = %self.name,
            patterns = self.patterns.len(),
            memory = compiled.memory_usage(),
            "Automaton finalized"
        );
        self.compiled = Some(compiled);
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.compiled.is_some()
    }

    /// First accepted match, ordered by end position
    pub fn find_first(&self, haystack: &[u8]) -> AutomatonResult<Option<PatternMatch>> {
        Ok(self.find_all(haystack)?.next())
    }

    /// Longest accepted match; the earliest one wins ties
    pub fn find_longest(&self, haystack: &[u8]) -> AutomatonResult<Option<PatternMatch>> {
        let mut best: Option<PatternMatch> = None;
        for m in self.find_all(haystack)? {
            if best.map_or(true, |b| m.len() > b.len()) {
                best = Some(m);
            }
        }
        Ok(best)
    }

    /// Lazy iterator over every accepted match
    ///
    /// Each call starts a fresh scan of `haystack`.
    pub fn find_all<'a, 'h>(&'a self, haystack: &'h [u8]) -> AutomatonResult<Matches<'a, 'h>> {
        let compiled = self.compiled.as_ref().ok_or(AutomatonError::NotFinalized)?;
        self.searches.fetch_add(1, Ordering::Relaxed);
        trace!(automaton = %self.name, len = haystack.len(), "Automaton search");
        Ok(Matches {
            automaton: self,
            haystack,
            inner: compiled.find_overlapping_iter(haystack),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get the number of patterns in this automaton
    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    /// Get a reference to the configuration
    pub fn config(&self) -> &AutomatonConfig {
        &self.config
    }

    pub fn stats(&self) -> AutomatonStats {
        AutomatonStats {
            patterns: self.patterns.len(),
            searches: self.searches.load(Ordering::Relaxed),
            matches: self.matches.load(Ordering::Relaxed),
            finalized: self.is_finalized(),
        }
    }
}

impl std::fmt::Debug for Automaton {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Automaton")
            .field("name", &self.name)
            .field("patterns", &self.patterns.len())
            .field("finalized", &self.is_finalized())
            .finish()
    }
}

/// Iterator returned by [`Automaton::find_all`]
pub struct Matches<'a, 'h> {
    automaton: &'a Automaton,
    haystack: &'h [u8],
    inner: FindOverlappingIter<'a, 'h>,
}

impl Iterator for Matches<'_, '_> {
    type Item = PatternMatch;

    fn next(&mut self) -> Option<PatternMatch> {
        for hit in self.inner.by_ref() {
            let pattern = match self.automaton.patterns.get(hit.pattern().as_usize()) {
                Some(p) => p,
                None => continue,
            };
            if pattern.accepts(self.haystack, hit.start(), hit.end()) {
                self.automaton.matches.fetch_add(1, Ordering::Relaxed);
                return Some(PatternMatch {
                    id: pattern.id,
                    kind: pattern.kind,
                    start: hit.start(),
                    end: hit.end(),
                });
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finalized(patterns: Vec<MatchPattern>, config: AutomatonConfig) -> Automaton {
        let mut automaton = Automaton::new("test", config);
        for p in patterns {
            automaton.add(p).unwrap();
        }
        automaton.finalize().unwrap();
        automaton
    }

    #[test]
    fn test_find_first_contains() {
        let mut automaton = Automaton::new("content", AutomatonConfig::default());
        automaton.add_pattern("BitTorrent protocol", 11).unwrap();
        automaton.add_pattern("SSH-2.0-", 5).unwrap();
        automaton.finalize().unwrap();

        let hit = automaton
            .find_first(b"\x13BitTorrent protocol\x00\x00")
            .unwrap()
            .unwrap();
        assert_eq!(hit.id, 11);
        assert_eq!((hit.start, hit.end), (1, 20));

        assert!(automaton.find_first(b"GET / HTTP/1.1").unwrap().is_none());
    }

    #[test]
    fn test_not_finalized() {
        let mut automaton = Automaton::new("open", AutomatonConfig::default());
        automaton.add_pattern("abc", 1).unwrap();
        assert!(matches!(
            automaton.find_first(b"abc"),
            Err(AutomatonError::NotFinalized)
        ));
        assert!(automaton.find_all(b"abc").is_err());
    }

    #[test]
    fn test_frozen_after_finalize() {
        let mut automaton = Automaton::new("frozen", AutomatonConfig::default());
        automaton.add_pattern("abc", 1).unwrap();
        automaton.finalize().unwrap();
        assert!(matches!(
            automaton.add_pattern("def", 2),
            Err(AutomatonError::Frozen)
        ));
        // Idempotent
        automaton.finalize().unwrap();
    }

    #[test]
    fn test_duplicate_pattern() {
        let mut automaton = Automaton::new("dup", AutomatonConfig::default());
        automaton.add_pattern("abc", 1).unwrap();
        assert!(matches!(
            automaton.add_pattern("abc", 2),
            Err(AutomatonError::DuplicatePattern(_))
        ));
        // Same bytes with another kind are distinct
        automaton.add(MatchPattern::exact("abc", 3).unwrap()).unwrap();
    }

    #[test]
    fn test_case_folded_duplicates() {
        let config = AutomatonConfig {
            case_insensitive: true,
            ..Default::default()
        };
        let mut automaton = Automaton::new("ci", config);
        automaton.add_pattern("Host", 1).unwrap();
        assert!(automaton.add_pattern("HOST", 2).is_err());
        automaton.finalize().unwrap();
        assert_eq!(automaton.find_first(b"xxhOsT").unwrap().unwrap().id, 1);
    }

    #[test]
    fn test_case_sensitive_by_default() {
        let automaton = finalized(
            vec![MatchPattern::contains("Host", 1).unwrap()],
            AutomatonConfig::default(),
        );
        assert!(automaton.find_first(b"host").unwrap().is_none());
    }

    #[test]
    fn test_find_all_is_lazy_and_restartable() {
        let automaton = finalized(
            vec![
                MatchPattern::contains("ab", 1).unwrap(),
                MatchPattern::contains("b", 2).unwrap(),
            ],
            AutomatonConfig::default(),
        );
        let haystack = b"abab";
        let first: Vec<_> = automaton.find_all(haystack).unwrap().map(|m| m.id).collect();
        let second: Vec<_> = automaton.find_all(haystack).unwrap().map(|m| m.id).collect();
        assert_eq!(first.len(), 4);
        assert_eq!(first, second);

        let mut iter = automaton.find_all(haystack).unwrap();
        assert!(iter.next().is_some());
        assert_eq!(automaton.stats().matches, 9);
    }

    #[test]
    fn test_domain_matching() {
        let automaton = finalized(
            vec![
                MatchPattern::domain("google.com", 1).unwrap(),
                MatchPattern::domain("googlevideo.com", 2).unwrap(),
                MatchPattern::domain("video.com", 3).unwrap(),
            ],
            AutomatonConfig::default(),
        );

        let best = automaton
            .find_longest(b"rr3.googlevideo.com")
            .unwrap()
            .unwrap();
        assert_eq!(best.id, 2);

        assert_eq!(
            automaton.find_longest(b"www.google.com").unwrap().unwrap().id,
            1
        );
        assert!(automaton.find_first(b"notgoogle.com").unwrap().is_none());
        assert!(automaton.find_first(b"google.com.evil.net").unwrap().is_none());
    }

    #[test]
    fn test_prefix_suffix_exact() {
        let automaton = finalized(
            vec![
                MatchPattern::prefix("GET ", 1).unwrap(),
                MatchPattern::suffix(".exe", 2).unwrap(),
                MatchPattern::exact("PING", 3).unwrap(),
            ],
            AutomatonConfig::default(),
        );
        assert_eq!(automaton.find_first(b"GET /index").unwrap().unwrap().id, 1);
        assert!(automaton.find_first(b"xGET /").unwrap().is_none());
        assert_eq!(automaton.find_first(b"run.exe").unwrap().unwrap().id, 2);
        assert!(automaton.find_first(b"run.exe ").unwrap().is_none());
        assert_eq!(automaton.find_first(b"PING").unwrap().unwrap().id, 3);
        assert!(automaton.find_first(b"PINGPONG").unwrap().is_none());
    }

    #[test]
    fn test_limits() {
        let config = AutomatonConfig {
            max_patterns: 2,
            max_pattern_length: 8,
            ..Default::default()
        };
        let mut automaton = Automaton::new("limits", config);
        assert!(matches!(
            automaton.add_pattern("way too long pattern", 1),
            Err(AutomatonError::PatternTooLong { .. })
        ));
        automaton.add_pattern("a", 1).unwrap();
        automaton.add_pattern("b", 2).unwrap();
        assert!(matches!(
            automaton.add_pattern("c", 3),
            Err(AutomatonError::TooManyPatterns { max: 2, .. })
        ));
    }

    #[test]
    fn test_empty_automaton_never_matches() {
        let mut automaton = Automaton::new("empty", AutomatonConfig::default());
        automaton.finalize().unwrap();
        assert!(automaton.find_first(b"anything").unwrap().is_none());
        assert_eq!(automaton.stats().searches, 1);
    }
}
