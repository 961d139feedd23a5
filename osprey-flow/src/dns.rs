// DNS summarizing dissector

use crate::dissector::{ByteReader, DissectContext, Dissection, Dissector, DissectorState};
use crate::{FlowError, FlowResult};
use osprey_schema::{DetectionMask, L4Protocol, RiskFlags};
use tracing::trace;

const HEADER_LEN: usize = 12;
const MAX_LABEL: usize = 63;
const MAX_NAME: usize = 253;

/// Labels this long are typical of tunnelling over DNS
const SUSPICIOUS_LABEL: usize = 48;

/// Per-flow DNS state
#[derive(Debug, Default)]
pub struct DnsState {
    pub queries: u32,
    pub responses: u32,
}

/// Fixed header plus the first question
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsMessage {
    pub id: u16,
    pub is_response: bool,
    pub opcode: u8,
    pub rcode: u8,
    pub questions: u16,
    pub answers: u16,
    pub qname: Option<String>,
    pub qtype: Option<u16>,
}

/// Dissector for DNS over UDP and TCP
#[derive(Debug, Default)]
pub struct DnsDissector;

impl DnsDissector {
    pub fn new() -> Self {
        Self
    }
}

impl Dissector for DnsDissector {
    fn name(&self) -> &'static str {
        "dns"
    }

    fn protocol(&self) -> &str {
        "DNS"
    }

    /// Queried names are third-party hosts
    fn identifies_server(&self) -> bool {
        false
    }

    fn selection(&self) -> DetectionMask {
        DetectionMask::TCP_OR_UDP_WITH_PAYLOAD
    }

    fn dissect(&self, ctx: &mut DissectContext<'_>) -> Dissection {
        let mut payload = ctx.payload();
        if ctx.packet.l4 == L4Protocol::Tcp {
            // Two-byte length prefix
            if payload.len() < 2 {
                return Dissection::NeedMore;
            }
            let declared = u16::from_be_bytes([payload[0], payload[1]]) as usize;
            payload = &payload[2..];
            if declared < HEADER_LEN {
                return Dissection::Exclude;
            }
        }
        if payload.len() < HEADER_LEN {
            return Dissection::Exclude;
        }
        let protocol = ctx.content_match();
        let Some(state) = ctx.state.dns_mut() else {
            return Dissection::Exclude;
        };

        if !plausible_header(payload) {
            return if state.queries + state.responses > 0 {
                Dissection::NeedMore
            } else {
                Dissection::Exclude
            };
        }

        let message = match parse_message(payload) {
            Ok(message) => message,
            Err(err) => {
                trace!(error = %err, "DNS decode failed");
                return Dissection::Malformed("dns message");
            }
        };
        trace!(id = message.id, qname = ?message.qname, response = message.is_response, "DNS message");

        let first = state.queries + state.responses == 0;
        if message.is_response {
            state.responses += 1;
        } else {
            state.queries += 1;
        }
        let answered = state.queries > 0 && state.responses > 0;

        if let Some(name) = &message.qname {
            ctx.findings.risk |= name_risk(name);
        }
        ctx.findings.server_name = message.qname;

        if first {
            Dissection::Found(protocol)
        } else if answered {
            Dissection::Done
        } else {
            Dissection::NeedMore
        }
    }

    fn wants_extra_dissection(&self, state: &DissectorState) -> bool {
        match state {
            DissectorState::Dns(dns) => dns.responses == 0,
            _ => false,
        }
    }
}

/// Cheap header checks before decoding anything
fn plausible_header(data: &[u8]) -> bool {
    let flags = u16::from_be_bytes([data[2], data[3]]);
    let opcode = (flags >> 11) & 0x0f;
    let z = (flags >> 6) & 0x01;
    let rcode = flags & 0x0f;
    let questions = u16::from_be_bytes([data[4], data[5]]);
    let answers = u16::from_be_bytes([data[6], data[7]]);

    matches!(opcode, 0 | 1 | 2 | 4 | 5)
        && z == 0
        && rcode <= 10
        && (1..=16).contains(&questions)
        && answers <= 512
}

/// Decode the header and first question
pub fn parse_message(data: &[u8]) -> FlowResult<DnsMessage> {
    let mut r = ByteReader::new(data, "dns header");
    let id = r.u16()?;
    let flags = r.u16()?;
    let questions = r.u16()?;
    let answers = r.u16()?;
    r.skip(4)?;

    let mut message = DnsMessage {
        id,
        is_response: flags & 0x8000 != 0,
        opcode: ((flags >> 11) & 0x0f) as u8,
        rcode: (flags & 0x0f) as u8,
        questions,
        answers,
        qname: None,
        qtype: None,
    };
    if questions > 0 {
        message.qname = Some(read_name(&mut r)?);
        message.qtype = Some(r.u16()?);
        r.u16()?; // class
    }
    Ok(message)
}

/// Read an uncompressed question name
fn read_name(r: &mut ByteReader<'_>) -> FlowResult<String> {
    let mut name = String::new();
    loop {
        let len = r.u8()? as usize;
        if len == 0 {
            break;
        }
        if len & 0xc0 == 0xc0 {
            // Compression pointer; a question has nothing earlier to point at
            r.u8()?;
            break;
        }
        if len > MAX_LABEL {
            return Err(FlowError::Malformed {
                what: "dns label",
                reason: format!("length {}", len),
            });
        }
        let label = r.take(len)?;
        if !name.is_empty() {
            name.push('.');
        }
        name.extend(label.iter().map(|b| b.to_ascii_lowercase() as char));
        if name.len() > MAX_NAME {
            return Err(FlowError::Malformed {
                what: "dns name",
                reason: format!("longer than {} bytes", MAX_NAME),
            });
        }
    }
    Ok(name)
}

/// Risk bits derived from a queried name
pub fn name_risk(name: &str) -> RiskFlags {
    let mut risk = RiskFlags::empty();
    if name.split('.').any(|label| label.len() >= SUSPICIOUS_LABEL)
        || name.bytes().any(|b| !(b.is_ascii_alphanumeric() || b == b'.' || b == b'-' || b == b'_'))
    {
        risk |= RiskFlags::DNS_SUSPICIOUS_TRAFFIC;
    }
    if looks_generated(name) {
        risk |= RiskFlags::SUSPICIOUS_DGA_DOMAIN;
    }
    risk
}

/// A crude generated-domain check on the label left of the TLD
///
/// Long labels with few vowels or many digits rarely come from humans.
fn looks_generated(name: &str) -> bool {
    let mut labels = name.rsplit('.');
    let _tld = labels.next();
    let Some(label) = labels.next() else {
        return false;
    };
    if label.len() < 12 {
        return false;
    }
    let vowels = label.bytes().filter(|b| b"aeiou".contains(b)).count();
    let digits = label.bytes().filter(|b| b.is_ascii_digit()).count();
    vowels * 5 < label.len() || digits * 3 > label.len()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dissector::DissectLimits;
    use osprey_packet::{synth, Direction, PacketView};

    fn run_udp(state: &mut DissectorState, direction: Direction, payload: &[u8]) -> (Dissection, crate::Findings) {
        let bytes = match direction {
            Direction::ToServer => synth::udp_v4([10, 0, 0, 1], 53000, [8, 8, 8, 8], 53, payload),
            Direction::ToClient => synth::udp_v4([8, 8, 8, 8], 53, [10, 0, 0, 1], 53000, payload),
        }
        .unwrap();
        let packet = PacketView::parse(&bytes).unwrap();
        let mut ctx = DissectContext::new(packet, direction, 3, state, DissectLimits::default());
        let outcome = DnsDissector::new().dissect(&mut ctx);
        (outcome, ctx.findings)
    }

    fn response_for(query: &[u8]) -> Vec<u8> {
        let mut resp = query.to_vec();
        resp[2] |= 0x80;
        resp
    }

    #[test]
    fn test_parse_query() {
        let q = synth::dns_query(0xbeef, "WWW.Example.com");
        let msg = parse_message(&q).unwrap();
        assert_eq!(msg.id, 0xbeef);
        assert!(!msg.is_response);
        assert_eq!(msg.qname.as_deref(), Some("www.example.com"));
        assert_eq!(msg.qtype, Some(1));
    }

    #[test]
    fn test_query_then_response() {
        let mut state = DissectorState::default();
        let q = synth::dns_query(7, "github.com");
        let (outcome, findings) = run_udp(&mut state, Direction::ToServer, &q);
        assert!(matches!(outcome, Dissection::Found(_)));
        assert_eq!(findings.server_name.as_deref(), Some("github.com"));
        assert!(findings.risk.is_empty());
        assert!(DnsDissector.wants_extra_dissection(&state));

        let (outcome, _) = run_udp(&mut state, Direction::ToClient, &response_for(&q));
        assert_eq!(outcome, Dissection::Done);
        assert!(!DnsDissector.wants_extra_dissection(&state));
    }

    #[test]
    fn test_tcp_length_prefix() {
        let q = synth::dns_query(9, "example.org");
        let mut framed = (q.len() as u16).to_be_bytes().to_vec();
        framed.extend(&q);
        let bytes = synth::tcp_v4([10, 0, 0, 1], 40001, [10, 0, 0, 53], 53, &framed).unwrap();
        let packet = PacketView::parse(&bytes).unwrap();
        let mut state = DissectorState::default();
        let mut ctx = DissectContext::new(packet, Direction::ToServer, 3, &mut state, DissectLimits::default());
        let outcome = DnsDissector::new().dissect(&mut ctx);
        assert!(matches!(outcome, Dissection::Found(_)));
        assert_eq!(ctx.findings.server_name.as_deref(), Some("example.org"));
    }

    #[test]
    fn test_random_bytes_excluded() {
        let mut state = DissectorState::default();
        let (outcome, _) = run_udp(&mut state, Direction::ToServer, &[0xff; 40]);
        assert_eq!(outcome, Dissection::Exclude);
        let (outcome, _) = run_udp(&mut DissectorState::default(), Direction::ToServer, b"short");
        assert_eq!(outcome, Dissection::Exclude);
    }

    #[test]
    fn test_truncated_question_is_malformed() {
        let q = synth::dns_query(1, "example.com");
        let (outcome, _) = run_udp(&mut DissectorState::default(), Direction::ToServer, &q[..16]);
        assert_eq!(outcome, Dissection::Malformed("dns message"));
    }

    #[test]
    fn test_name_risks() {
        let tunnel = format!("{}.t.example.com", "a".repeat(50));
        assert!(name_risk(&tunnel).contains(RiskFlags::DNS_SUSPICIOUS_TRAFFIC));
        assert!(name_risk("xkqzvbtrplmw.com").contains(RiskFlags::SUSPICIOUS_DGA_DOMAIN));
        assert!(name_risk("a8d7f6s5d4f3.net").contains(RiskFlags::SUSPICIOUS_DGA_DOMAIN));
        assert!(name_risk("www.wikipedia.org").is_empty());
        assert!(name_risk("documentation.example.com").is_empty());
    }
}
