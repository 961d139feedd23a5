// HTTP/1.x summarizing dissector

use crate::dissector::{DissectContext, Dissection, Dissector, DissectorState};
use osprey_packet::Direction;
use osprey_schema::{DetectionMask, RiskFlags};
use std::net::IpAddr;
use tracing::trace;

const METHODS: &[&str] = &[
    "GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH", "CONNECT", "TRACE",
];

/// User-Agent prefixes of common scanners and exploitation tools
const SUSPICIOUS_AGENTS: &[&str] = &["sqlmap", "nikto", "masscan", "zgrab", "nmap", "dirbuster"];

/// Headers are only looked for in the first part of a message
const MAX_HEADER_BYTES: usize = 8192;

/// Per-flow HTTP state
#[derive(Debug, Default)]
pub struct HttpState {
    pub request_seen: bool,
    pub response_seen: bool,
    /// A CONNECT request is waiting for the server's answer
    pub connect_pending: bool,
    pub status: Option<u16>,
}

/// Request line and the headers classification uses
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestSummary {
    pub method: String,
    pub target: String,
    pub host: Option<String>,
    pub user_agent: Option<String>,
    pub basic_auth: bool,
}

/// Dissector for HTTP/1.x over TCP
#[derive(Debug, Default)]
pub struct HttpDissector;

impl HttpDissector {
    pub fn new() -> Self {
        Self
    }
}

impl Dissector for HttpDissector {
    fn name(&self) -> &'static str {
        "http"
    }

    fn protocol(&self) -> &str {
        "HTTP"
    }

    fn selection(&self) -> DetectionMask {
        DetectionMask::TCP_WITH_PAYLOAD
    }

    fn dissect(&self, ctx: &mut DissectContext<'_>) -> Dissection {
        let payload = ctx.payload();
        if payload.is_empty() {
            return Dissection::NeedMore;
        }
        let direction = ctx.direction;
        let protocol = ctx.content_match();
        let Some(state) = ctx.state.http_mut() else {
            return Dissection::Exclude;
        };
        let head = &payload[..payload.len().min(MAX_HEADER_BYTES)];

        match direction {
            Direction::ToServer => {
                let Some(request) = parse_request(head) else {
                    return if state.request_seen || state.response_seen {
                        Dissection::NeedMore
                    } else {
                        Dissection::Exclude
                    };
                };
                trace!(method = %request.method, host = ?request.host, "HTTP request");

                let first = !state.request_seen && !state.response_seen;
                state.request_seen = true;
                state.connect_pending = request.method == "CONNECT";

                let mut risk = RiskFlags::empty();
                if let Some(host) = &request.host {
                    if host.parse::<IpAddr>().is_ok() {
                        risk |= RiskFlags::HTTP_NUMERIC_IP_HOST;
                    }
                }
                match &request.user_agent {
                    Some(agent) if is_suspicious_agent(agent) => {
                        risk |= RiskFlags::HTTP_SUSPICIOUS_USER_AGENT
                    }
                    None => risk |= RiskFlags::HTTP_SUSPICIOUS_HEADER,
                    _ => {}
                }
                if request.basic_auth {
                    risk |= RiskFlags::CLEAR_TEXT_CREDENTIALS;
                }

                ctx.findings.risk |= risk;
                ctx.findings.server_name = request.host;
                ctx.findings.user_agent = request.user_agent;
                ctx.findings.http_method = Some(request.method);

                if first {
                    Dissection::Found(protocol)
                } else {
                    Dissection::NeedMore
                }
            }
            Direction::ToClient => {
                let Some(status) = parse_status(head) else {
                    return if state.request_seen || state.response_seen {
                        Dissection::NeedMore
                    } else {
                        Dissection::Exclude
                    };
                };
                trace!(status, "HTTP response");

                let first = !state.request_seen && !state.response_seen;
                state.response_seen = true;
                state.status = Some(status);
                ctx.findings.http_status = Some(status);

                if state.connect_pending {
                    state.connect_pending = false;
                    if (200..300).contains(&status) {
                        return Dissection::Renegotiate;
                    }
                }
                if first {
                    Dissection::Found(protocol)
                } else {
                    Dissection::Done
                }
            }
        }
    }

    fn wants_extra_dissection(&self, state: &DissectorState) -> bool {
        match state {
            DissectorState::Http(http) => {
                http.connect_pending || (http.request_seen && !http.response_seen)
            }
            _ => false,
        }
    }
}

fn is_suspicious_agent(agent: &str) -> bool {
    let lower = agent.to_ascii_lowercase();
    lower.len() < 3
        || !lower.bytes().any(|b| b.is_ascii_alphabetic())
        || SUSPICIOUS_AGENTS.iter().any(|s| lower.starts_with(s))
}

/// Parse a request line and the interesting headers
///
/// Returns `None` unless the data starts with a known method and an
/// `HTTP/1.x` request line.
pub fn parse_request(data: &[u8]) -> Option<RequestSummary> {
    let text = String::from_utf8_lossy(data);
    let mut lines = text.split("\r\n");
    let mut parts = lines.next()?.split(' ');

    let method = parts.next()?;
    if !METHODS.contains(&method) {
        return None;
    }
    let target = parts.next()?;
    let version = parts.next()?;
    if !version.starts_with("HTTP/1.") {
        return None;
    }

    let mut summary = RequestSummary {
        method: method.to_string(),
        target: target.to_string(),
        ..Default::default()
    };

    for line in lines {
        if line.is_empty() {
            break;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("host") {
            summary.host = Some(strip_port(value).to_ascii_lowercase());
        } else if name.eq_ignore_ascii_case("user-agent") {
            summary.user_agent = Some(value.to_string());
        } else if name.eq_ignore_ascii_case("authorization") {
            summary.basic_auth = value
                .get(..6)
                .is_some_and(|scheme| scheme.eq_ignore_ascii_case("basic "));
        }
    }

    // CONNECT carries the authority in the target
    if summary.host.is_none() && summary.method == "CONNECT" {
        summary.host = Some(strip_port(target).to_ascii_lowercase());
    }
    Some(summary)
}

/// Status code of an `HTTP/1.x` status line
pub fn parse_status(data: &[u8]) -> Option<u16> {
    let rest = data.strip_prefix(b"HTTP/1.")?;
    let line_end = rest.iter().position(|&b| b == b'\r').unwrap_or(rest.len());
    let line = std::str::from_utf8(&rest[..line_end]).ok()?;
    let code = line.split(' ').nth(1)?;
    if code.len() != 3 {
        return None;
    }
    code.parse().ok().filter(|c| (100..600).contains(c))
}

fn strip_port(host: &str) -> &str {
    if let Some(inner) = host.strip_prefix('[') {
        return inner.split(']').next().unwrap_or(inner);
    }
    match host.rsplit_once(':') {
        // A bare IPv6 address has more than one colon
        Some((name, port)) if !name.contains(':') && port.bytes().all(|b| b.is_ascii_digit()) => {
            name
        }
        _ => host,
    }
}
