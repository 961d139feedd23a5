//! Line-oriented protocol rules
//!
//! One rule per line, `#` starts a comment line:
//!
//! ```text
//! tcp:80,tcp:8080-8081,udp:5000@MyProto
//! host:"example.com"@ExampleApp
//! content:"BitTorrent protocol"@BitTorrent
//! ip:10.0.0.0/8@CorpLan
//! ip:10.1.2.3:8443@CorpAdmin
//! ip:[2001:db8::/32]:443@CorpV6
//! risk:"bad.example"
//! fingerprint:"771,4865-4866,0-10-11,29-23,0"
//! ```
//!
//! Protocol names not already in the registry are registered as custom
//! protocols when the rules are applied. `risk:` marks a domain (and its
//! subdomains) as risky and `fingerprint:` marks a TLS ClientHello JA3
//! text as malicious; neither names a protocol.

use crate::{EngineError, EngineResult};
use ipnetwork::IpNetwork;
use osprey_schema::PortRange;
use regex::Regex;

/// One parsed rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rule {
    Ports {
        protocol: String,
        tcp: Vec<PortRange>,
        udp: Vec<PortRange>,
    },
    Host {
        protocol: String,
        pattern: String,
    },
    Content {
        protocol: String,
        marker: String,
    },
    Address {
        protocol: String,
        network: IpNetwork,
        /// With a port the rule is authoritative
        port: Option<u16>,
    },
    RiskyHost {
        pattern: String,
    },
    Fingerprint {
        value: String,
    },
}

impl Rule {
    /// Protocol the rule binds to, if it binds to one
    pub fn protocol(&self) -> Option<&str> {
        match self {
            Rule::Ports { protocol, .. }
            | Rule::Host { protocol, .. }
            | Rule::Content { protocol, .. }
            | Rule::Address { protocol, .. } => Some(protocol),
            Rule::RiskyHost { .. } | Rule::Fingerprint { .. } => None,
        }
    }
}

/// Parse a whole rules document
pub fn parse_rules(text: &str) -> EngineResult<Vec<Rule>> {
    RuleParser::new()?.parse(text)
}

/// Rules parser with its token patterns compiled once
pub struct RuleParser {
    quoted: Regex,
    port: Regex,
    marker: Regex,
}

impl RuleParser {
    pub fn new() -> EngineResult<Self> {
        let compile = |pattern: &str| {
            Regex::new(pattern).map_err(|e| EngineError::Config(format!("rule pattern: {}", e)))
        };
        Ok(Self {
            quoted: compile(r#"^(host|content):"([^"]+)"$"#)?,
            port: compile(r"^(tcp|udp):(\d{1,5})(?:-(\d{1,5}))?$")?,
            marker: compile(r#"^(risk|fingerprint):"([^"]+)"$"#)?,
        })
    }

    pub fn parse(&self, text: &str) -> EngineResult<Vec<Rule>> {
        let mut rules = Vec::new();
        for (index, line) in text.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let rule = self.parse_line(line).map_err(|reason| EngineError::Rules {
                line: index + 1,
                reason,
            })?;
            rules.push(rule);
        }
        Ok(rules)
    }

    fn parse_line(&self, line: &str) -> Result<Rule, String> {
        if let Some(caps) = self.marker.captures(line) {
            let value = caps[2].trim().to_string();
            return Ok(match &caps[1] {
                "risk" => Rule::RiskyHost {
                    pattern: value.trim_end_matches('.').to_ascii_lowercase(),
                },
                _ => Rule::Fingerprint { value },
            });
        }

        let (body, protocol) = line
            .rsplit_once('@')
            .ok_or_else(|| "missing '@protocol'".to_string())?;
        let protocol = protocol.trim();
        if protocol.is_empty() {
            return Err("empty protocol name".to_string());
        }
        let protocol = protocol.to_string();
        let body = body.trim();

        if let Some(caps) = self.quoted.captures(body) {
            let value = caps[2].to_string();
            return Ok(match &caps[1] {
                "host" => Rule::Host {
                    protocol,
                    pattern: value.to_ascii_lowercase(),
                },
                _ => Rule::Content {
                    protocol,
                    marker: value,
                },
            });
        }

        if let Some(address) = body.strip_prefix("ip:") {
            let (network, port) = parse_address(address)?;
            return Ok(Rule::Address {
                protocol,
                network,
                port,
            });
        }

        let mut tcp = Vec::new();
        let mut udp = Vec::new();
        for item in body.split(',').map(str::trim) {
            let caps = self.port
                .captures(item)
                .ok_or_else(|| format!("unrecognized rule '{}'", item))?;
            let start = parse_port(&caps[2])?;
            let end = match caps.get(3) {
                Some(m) => parse_port(m.as_str())?,
                None => start,
            };
            let range = PortRange::new(start, end);
            match &caps[1] {
                "tcp" => tcp.push(range),
                _ => udp.push(range),
            }
        }
        Ok(Rule::Ports { protocol, tcp, udp })
    }
}

fn parse_port(text: &str) -> Result<u16, String> {
    text.parse::<u16>()
        .map_err(|_| format!("invalid port '{}'", text))
}

/// `10.0.0.0/8`, `10.1.2.3:8443`, `2001:db8::/32`, `[2001:db8::1]:443`
fn parse_address(text: &str) -> Result<(IpNetwork, Option<u16>), String> {
    let (addr, port) = if let Some(rest) = text.strip_prefix('[') {
        let (addr, after) = rest
            .split_once(']')
            .ok_or_else(|| format!("unterminated '[' in '{}'", text))?;
        let port = match after.strip_prefix(':') {
            Some(port) => Some(parse_port(port)?),
            None if after.is_empty() => None,
            None => return Err(format!("unexpected '{}' after address", after)),
        };
        (addr, port)
    } else if text.matches(':').count() == 1 {
        let (addr, port) = text.split_once(':').unwrap_or((text, ""));
        (addr, Some(parse_port(port)?))
    } else {
        (text, None)
    };

    let network = addr
        .parse::<IpNetwork>()
        .map_err(|e| format!("invalid address '{}': {}", addr, e))?;
    Ok((network, port))
}
