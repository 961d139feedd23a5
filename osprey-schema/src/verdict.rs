// Classification verdict
//
// A snapshot of a flow's classification, produced by the driver and
// consumed by the serializer.

use crate::{Breed, Category, Confidence, FlowId, FlowState, ProtocolPair, RiskFlags};
use serde::{Deserialize, Serialize};

/// Current or final classification of one flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub flow_id: FlowId,
    pub protocol: ProtocolPair,
    /// Rendered name, e.g. `"TLS.Google"`
    pub protocol_name: String,
    pub confidence: Confidence,
    pub category: Category,
    pub breed: Breed,
    pub risk: RiskFlags,
    pub state: FlowState,
    pub packets: u64,
    pub bytes: u64,
    pub server_name: Option<String>,
}

impl Verdict {
    /// A verdict for a flow nothing is known about yet
    pub fn unknown(flow_id: FlowId) -> Self {
        Self {
            flow_id,
            protocol: ProtocolPair::UNKNOWN,
            protocol_name: "Unknown".to_string(),
            confidence: Confidence::None,
            category: Category::Unspecified,
            breed: Breed::Unrated,
            risk: RiskFlags::empty(),
            state: FlowState::Fresh,
            packets: 0,
            bytes: 0,
            server_name: None,
        }
    }

    pub fn is_final(&self) -> bool {
        self.state.is_terminal()
    }

    /// Guessed verdicts come from give-up, not from a positive match
    pub fn was_guessed(&self) -> bool {
        self.state == FlowState::GivenUp
    }
}
