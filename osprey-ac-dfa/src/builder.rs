// Fluent builder for finalized automata

use crate::matcher::Automaton;
use crate::pattern::MatchPattern;
use crate::{AutomatonConfig, AutomatonResult};

/// Collects patterns and produces a finalized [`Automaton`]
#[derive(Debug, Default)]
pub struct AutomatonBuilder {
    name: String,
    patterns: Vec<MatchPattern>,
    config: AutomatonConfig,
}

impl AutomatonBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Add a pattern to the automaton
    pub fn add_pattern(mut self, pattern: MatchPattern) -> Self {
        self.patterns.push(pattern);
        self
    }

    /// Add multiple patterns
    pub fn add_patterns(mut self, patterns: impl IntoIterator<Item = MatchPattern>) -> Self {
        self.patterns.extend(patterns);
        self
    }

    /// Set the configuration
    pub fn config(mut self, config: AutomatonConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate every pattern and compile
    pub fn build(self) -> AutomatonResult<Automaton> {
        let mut automaton = Automaton::new(self.name, self.config);
        for pattern in self.patterns {
            automaton.add(pattern)?;
        }
        automaton.finalize()?;
        Ok(automaton)
    }
}
