// Osprey Flow - per-connection classification state
//
// This crate holds everything that lives for the duration of one flow:
// - FlowContext: counters, current verdict, risk, dissector scratch state
// - Dissector: capability interface implemented per protocol
// - Built-in summarizing dissectors for TLS, HTTP and DNS
//
// A FlowContext is owned by the external flow manager and advanced by the
// classification driver one packet at a time; it is never shared between
// threads while a packet is being processed.

mod context;
mod dissector;
pub mod dns;
pub mod http;
pub mod tls;

pub use context::{DissectorSlot, FlowContext, FlowMetadata};
pub use dissector::{
    DissectContext, DissectLimits, Dissection, Dissector, DissectorState, Findings, MatchResult,
};
pub use dns::DnsDissector;
pub use http::HttpDissector;
pub use tls::TlsDissector;

use thiserror::Error;

/// Errors raised while decoding protocol content
///
/// These never escape the driver: they are turned into risk bits.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FlowError {
    #[error("Truncated {0}")]
    Truncated(&'static str),

    #[error("Malformed {what}: {reason}")]
    Malformed { what: &'static str, reason: String },
}

/// Result type for content decoding
pub type FlowResult<T> = Result<T, FlowError>;

/// The built-in dissectors, in dispatch order
pub fn builtin_dissectors() -> Vec<Box<dyn Dissector>> {
    vec![
        Box::new(TlsDissector::new()),
        Box::new(HttpDissector::new()),
        Box::new(DnsDissector::new()),
    ]
}
