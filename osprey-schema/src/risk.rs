// Flow risk flags
//
// Each bit is an independently detected risk condition. Bits accumulate
// over a flow's lifetime and are never cleared.

use serde::{Deserialize, Serialize};

bitflags::bitflags! {
    /// Accumulated risk conditions of a flow
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct RiskFlags: u64 {
        const MALFORMED_PACKET = 1 << 0;
        const KNOWN_PROTOCOL_ON_NON_STANDARD_PORT = 1 << 1;
        const UNSAFE_PROTOCOL = 1 << 2;
        const TLS_SELFSIGNED_CERTIFICATE = 1 << 3;
        const TLS_OBSOLETE_VERSION = 1 << 4;
        const TLS_WEAK_CIPHER = 1 << 5;
        const TLS_MISSING_SNI = 1 << 6;
        const TLS_SUSPICIOUS_EXTENSION = 1 << 7;
        const HTTP_NUMERIC_IP_HOST = 1 << 8;
        const HTTP_SUSPICIOUS_USER_AGENT = 1 << 9;
        const HTTP_SUSPICIOUS_HEADER = 1 << 10;
        const DNS_SUSPICIOUS_TRAFFIC = 1 << 11;
        const SUSPICIOUS_DGA_DOMAIN = 1 << 12;
        const MALICIOUS_FINGERPRINT = 1 << 13;
        const RISKY_DOMAIN = 1 << 14;
        const CLEAR_TEXT_CREDENTIALS = 1 << 15;
        const UNIDIRECTIONAL_TRAFFIC = 1 << 16;
    }
}

impl RiskFlags {
    /// Human-readable names of the set bits
    pub fn names(&self) -> Vec<&'static str> {
        self.iter()
            .filter_map(|flag| risk_name(flag))
            .collect()
    }
}

fn risk_name(flag: RiskFlags) -> Option<&'static str> {
    let name = if flag == RiskFlags::MALFORMED_PACKET {
        "Malformed Packet"
    } else if flag == RiskFlags::KNOWN_PROTOCOL_ON_NON_STANDARD_PORT {
        "Known Proto on Non Std Port"
    } else if flag == RiskFlags::UNSAFE_PROTOCOL {
        "Unsafe Protocol"
    } else if flag == RiskFlags::TLS_SELFSIGNED_CERTIFICATE {
        "Self-signed Cert"
    } else if flag == RiskFlags::TLS_OBSOLETE_VERSION {
        "Obsolete TLS Version"
    } else if flag == RiskFlags::TLS_WEAK_CIPHER {
        "Weak TLS Cipher"
    } else if flag == RiskFlags::TLS_MISSING_SNI {
        "Missing SNI TLS Extn"
    } else if flag == RiskFlags::TLS_SUSPICIOUS_EXTENSION {
        "TLS Suspicious Extn"
    } else if flag == RiskFlags::HTTP_NUMERIC_IP_HOST {
        "HTTP Numeric IP Address"
    } else if flag == RiskFlags::HTTP_SUSPICIOUS_USER_AGENT {
        "HTTP Susp User-Agent"
    } else if flag == RiskFlags::HTTP_SUSPICIOUS_HEADER {
        "HTTP Susp Header"
    } else if flag == RiskFlags::DNS_SUSPICIOUS_TRAFFIC {
        "Suspicious DNS Traffic"
    } else if flag == RiskFlags::SUSPICIOUS_DGA_DOMAIN {
        "Susp DGA Domain name"
    } else if flag == RiskFlags::MALICIOUS_FINGERPRINT {
        "Possibly Malicious Fingerprint"
    } else if flag == RiskFlags::RISKY_DOMAIN {
        "Risky Domain Name"
    } else if flag == RiskFlags::CLEAR_TEXT_CREDENTIALS {
        "Clear-Text Credentials"
    } else if flag == RiskFlags::UNIDIRECTIONAL_TRAFFIC {
        "Unidirectional Traffic"
    } else {
        return None;
    };
    Some(name)
}
