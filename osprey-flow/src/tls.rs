// TLS summarizing dissector
//
// Reassembles handshake records per direction and extracts the handful of
// fields classification cares about: ClientHello server name, version and
// JA3 fingerprint text, negotiated version and cipher, repeated extensions,
// and whether the leaf certificate is self-signed. Nothing is validated
// beyond what is needed to find them.

use crate::dissector::{ByteReader, DissectContext, Dissection, Dissector, DissectorState};
use crate::{FlowError, FlowResult};
use bytes::{Buf, BytesMut};
use osprey_schema::{DetectionMask, RiskFlags};
use tracing::trace;

const CONTENT_CHANGE_CIPHER_SPEC: u8 = 20;
const CONTENT_HANDSHAKE: u8 = 22;
const CONTENT_HEARTBEAT: u8 = 24;
const CONTENT_APPLICATION_DATA: u8 = 23;

const HANDSHAKE_CLIENT_HELLO: u8 = 1;
const HANDSHAKE_SERVER_HELLO: u8 = 2;
const HANDSHAKE_CERTIFICATE: u8 = 11;

const EXT_SERVER_NAME: u16 = 0x0000;
const EXT_SUPPORTED_GROUPS: u16 = 0x000a;
const EXT_EC_POINT_FORMATS: u16 = 0x000b;
const EXT_SUPPORTED_VERSIONS: u16 = 0x002b;

const TLS_1_2: u16 = 0x0303;
const TLS_1_3: u16 = 0x0304;

/// Largest record body allowed by RFC 8446 plus expansion
const MAX_RECORD: usize = 16384 + 2048;

/// NULL, export, RC4 and single-DES suites
const WEAK_CIPHERS: &[u16] = &[
    0x0000, 0x0001, 0x0002, 0x0003, 0x0004, 0x0005, 0x0006, 0x0008, 0x0009, 0x0014, 0x0017,
    0x0018, 0xc002, 0xc007, 0xc00c, 0xc011,
];

/// Per-flow TLS reassembly state
#[derive(Debug, Default)]
pub struct TlsState {
    records: [BytesMut; 2],
    handshake: [BytesMut; 2],
    pub client_hello_seen: bool,
    pub server_hello_seen: bool,
    pub certificate_checked: bool,
    /// Negotiated (or offered, until the server answers) version
    pub version: Option<u16>,
    /// No further handshake data is expected in clear text
    pub done: bool,
}

impl TlsState {
    /// Bytes currently held for reassembly
    pub fn buffered(&self) -> usize {
        self.records.iter().chain(self.handshake.iter()).map(|b| b.capacity()).sum()
    }

    fn seen_anything(&self) -> bool {
        self.client_hello_seen || self.server_hello_seen
    }

    fn clear_buffers(&mut self) {
        self.records = Default::default();
        self.handshake = Default::default();
    }
}

/// Summarized fields of a ClientHello
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHello {
    pub version: u16,
    pub server_name: Option<String>,
    /// Highest non-GREASE entry of supported_versions
    pub max_supported_version: Option<u16>,
    /// JA3 text: version, ciphers, extensions, groups, point formats
    pub fingerprint: String,
    /// Some extension type appears more than once
    pub duplicate_extension: bool,
}

/// Summarized fields of a ServerHello
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerHello {
    pub version: u16,
    pub cipher: u16,
    pub duplicate_extension: bool,
}

/// Dissector for TLS over TCP
#[derive(Debug, Default)]
pub struct TlsDissector;

impl TlsDissector {
    pub fn new() -> Self {
        Self
    }
}

impl Dissector for TlsDissector {
    fn name(&self) -> &'static str {
        "tls"
    }

    fn protocol(&self) -> &str {
        "TLS"
    }

    fn selection(&self) -> DetectionMask {
        DetectionMask::TCP_WITH_PAYLOAD
    }

    fn dissect(&self, ctx: &mut DissectContext<'_>) -> Dissection {
        let payload = ctx.payload();
        if payload.is_empty() {
            return Dissection::NeedMore;
        }
        let limit = ctx.limits.tls_reassembly_limit;
        let dir = ctx.direction.index();
        let protocol = ctx.content_match();

        let Some(state) = ctx.state.tls_mut() else {
            return Dissection::Exclude;
        };
        if state.done {
            return Dissection::Done;
        }

        // A fresh direction must start on a record boundary
        if state.records[dir].is_empty() && !looks_like_record(payload) {
            if state.seen_anything() {
                return Dissection::NeedMore;
            }
            return Dissection::Exclude;
        }

        if state.records[dir].len() + payload.len() > limit {
            trace!(limit, "TLS reassembly limit reached");
            let seen = state.seen_anything();
            state.clear_buffers();
            state.done = true;
            return if seen {
                Dissection::Done
            } else {
                Dissection::Exclude
            };
        }
        state.records[dir].extend_from_slice(payload);

        let mut found = false;
        let mut risk = RiskFlags::empty();
        let mut server_name = None;
        let mut fingerprint = None;

        loop {
            match next_record(&mut state.records[dir]) {
                Ok(Some((content_type, body))) => match content_type {
                    CONTENT_HANDSHAKE => {
                        if state.handshake[dir].len() + body.len() > limit {
                            state.clear_buffers();
                            state.done = true;
                            break;
                        }
                        state.handshake[dir].extend_from_slice(&body);
                        match drain_handshake(state, dir) {
                            Ok(outcome) => {
                                found |= outcome.found;
                                risk |= outcome.risk;
                                if outcome.server_name.is_some() {
                                    server_name = outcome.server_name;
                                }
                                if outcome.fingerprint.is_some() {
                                    fingerprint = outcome.fingerprint;
                                }
                            }
                            Err(err) => {
                                trace!(error = %err, "TLS handshake decode failed");
                                state.clear_buffers();
                                return Dissection::Malformed("tls handshake");
                            }
                        }
                    }
                    CONTENT_APPLICATION_DATA if state.seen_anything() => {
                        // Encrypted from here on
                        state.done = true;
                    }
                    _ => {}
                },
                Ok(None) => break,
                Err(_) if !state.seen_anything() => {
                    state.clear_buffers();
                    return Dissection::Exclude;
                }
                Err(_) => {
                    state.clear_buffers();
                    return Dissection::Malformed("tls record");
                }
            }
            if state.done {
                break;
            }
        }

        if state.done {
            state.clear_buffers();
        }
        let version = state.version;
        let done = state.done;

        ctx.findings.risk |= risk;
        if let Some(name) = server_name {
            ctx.findings.server_name = Some(name);
        }
        if fingerprint.is_some() {
            ctx.findings.tls_fingerprint = fingerprint;
        }
        if found {
            ctx.findings.tls_version = version;
            Dissection::Found(protocol)
        } else if done {
            Dissection::Done
        } else {
            Dissection::NeedMore
        }
    }

    fn wants_extra_dissection(&self, state: &DissectorState) -> bool {
        match state {
            DissectorState::Tls(tls) => !tls.done && !tls.certificate_checked,
            _ => false,
        }
    }
}

fn looks_like_record(data: &[u8]) -> bool {
    match data {
        [content_type, major, ..] => {
            (CONTENT_CHANGE_CIPHER_SPEC..=CONTENT_HEARTBEAT).contains(content_type) && *major == 3
        }
        [content_type] => (CONTENT_CHANGE_CIPHER_SPEC..=CONTENT_HEARTBEAT).contains(content_type),
        [] => false,
    }
}

/// Split one complete record off the front of the buffer
fn next_record(buf: &mut BytesMut) -> FlowResult<Option<(u8, BytesMut)>> {
    if buf.len() < 5 {
        return Ok(None);
    }
    if !looks_like_record(&buf[..2]) {
        return Err(FlowError::Malformed {
            what: "tls record",
            reason: format!("content type {} version {}", buf[0], buf[1]),
        });
    }
    let len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
    if len > MAX_RECORD {
        return Err(FlowError::Malformed {
            what: "tls record",
            reason: format!("length {}", len),
        });
    }
    if buf.len() < 5 + len {
        return Ok(None);
    }
    let content_type = buf[0];
    buf.advance(5);
    Ok(Some((content_type, buf.split_to(len))))
}

#[derive(Default)]
struct HandshakeOutcome {
    found: bool,
    risk: RiskFlags,
    server_name: Option<String>,
    fingerprint: Option<String>,
}

/// Consume every complete handshake message buffered for one direction
fn drain_handshake(state: &mut TlsState, dir: usize) -> FlowResult<HandshakeOutcome> {
    let mut outcome = HandshakeOutcome::default();
    loop {
        let buf = &state.handshake[dir];
        if buf.len() < 4 {
            break;
        }
        let len = ((buf[1] as usize) << 16) | ((buf[2] as usize) << 8) | buf[3] as usize;
        if len > MAX_RECORD * 4 {
            return Err(FlowError::Malformed {
                what: "tls handshake",
                reason: format!("message length {}", len),
            });
        }
        if buf.len() < 4 + len {
            break;
        }
        let msg_type = buf[0];
        let mut msg = state.handshake[dir].split_to(4 + len);
        msg.advance(4);

        match msg_type {
            HANDSHAKE_CLIENT_HELLO => {
                let hello = parse_client_hello(&msg)?;
                trace!(server_name = ?hello.server_name, version = hello.version, "ClientHello");
                state.client_hello_seen = true;
                state.version = Some(hello.max_supported_version.unwrap_or(hello.version));
                if hello.server_name.is_none() {
                    outcome.risk |= RiskFlags::TLS_MISSING_SNI;
                }
                if hello.duplicate_extension {
                    outcome.risk |= RiskFlags::TLS_SUSPICIOUS_EXTENSION;
                }
                outcome.server_name = hello.server_name;
                outcome.fingerprint = Some(hello.fingerprint);
                outcome.found = true;
            }
            HANDSHAKE_SERVER_HELLO => {
                let hello = parse_server_hello(&msg)?;
                trace!(version = hello.version, cipher = hello.cipher, "ServerHello");
                if !state.client_hello_seen {
                    outcome.found = true;
                }
                state.server_hello_seen = true;
                state.version = Some(hello.version);
                if hello.version < TLS_1_2 {
                    outcome.risk |= RiskFlags::TLS_OBSOLETE_VERSION;
                }
                if WEAK_CIPHERS.contains(&hello.cipher) {
                    outcome.risk |= RiskFlags::TLS_WEAK_CIPHER;
                }
                if hello.duplicate_extension {
                    outcome.risk |= RiskFlags::TLS_SUSPICIOUS_EXTENSION;
                }
                if hello.version >= TLS_1_3 {
                    // Certificates are encrypted
                    state.done = true;
                }
            }
            HANDSHAKE_CERTIFICATE => {
                if let Some(self_signed) = leaf_is_self_signed(&msg)? {
                    if self_signed {
                        outcome.risk |= RiskFlags::TLS_SELFSIGNED_CERTIFICATE;
                    }
                    state.certificate_checked = true;
                    state.done = true;
                }
            }
            _ => {}
        }
        if state.done {
            break;
        }
    }
    Ok(outcome)
}

fn is_grease(value: u16) -> bool {
    value & 0x0f0f == 0x0a0a && (value >> 8) == (value & 0xff)
}

fn u16_list(data: &[u8]) -> impl Iterator<Item = u16> + '_ {
    data.chunks_exact(2).map(|v| u16::from_be_bytes([v[0], v[1]]))
}

fn ja3_field<T: ToString>(values: impl IntoIterator<Item = T>) -> String {
    values
        .into_iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join("-")
}

/// Parse a ClientHello body (without the handshake header)
pub fn parse_client_hello(body: &[u8]) -> FlowResult<ClientHello> {
    let mut r = ByteReader::new(body, "tls client hello");
    let version = r.u16()?;
    r.skip(32)?;
    r.vec8()?; // session id
    let ciphers: Vec<u16> = u16_list(r.vec16()?).filter(|c| !is_grease(*c)).collect();
    r.vec8()?; // compression methods

    let mut hello = ClientHello {
        version,
        ..Default::default()
    };
    let mut seen: Vec<u16> = Vec::new();
    let mut extensions: Vec<u16> = Vec::new();
    let mut groups: Vec<u16> = Vec::new();
    let mut formats: Vec<u8> = Vec::new();

    if r.remaining() > 0 {
        let mut ext = ByteReader::new(r.vec16()?, "tls extensions");
        while ext.remaining() >= 4 {
            let ext_type = ext.u16()?;
            let data = ext.vec16()?;
            if seen.contains(&ext_type) {
                hello.duplicate_extension = true;
            } else {
                seen.push(ext_type);
            }
            if !is_grease(ext_type) {
                extensions.push(ext_type);
            }
            match ext_type {
                EXT_SERVER_NAME => hello.server_name = parse_server_name(data)?,
                EXT_SUPPORTED_VERSIONS => {
                    let mut versions = ByteReader::new(data, "tls supported versions");
                    hello.max_supported_version =
                        u16_list(versions.vec8()?).filter(|v| !is_grease(*v)).max();
                }
                EXT_SUPPORTED_GROUPS => {
                    let mut list = ByteReader::new(data, "tls supported groups");
                    groups = u16_list(list.vec16()?).filter(|g| !is_grease(*g)).collect();
                }
                EXT_EC_POINT_FORMATS => {
                    let mut list = ByteReader::new(data, "tls point formats");
                    formats = list.vec8()?.to_vec();
                }
                _ => {}
            }
        }
    }

    hello.fingerprint = format!(
        "{},{},{},{},{}",
        version,
        ja3_field(ciphers),
        ja3_field(extensions),
        ja3_field(groups),
        ja3_field(formats)
    );
    Ok(hello)
}

fn parse_server_name(data: &[u8]) -> FlowResult<Option<String>> {
    let mut r = ByteReader::new(data, "tls server name");
    let mut list = ByteReader::new(r.vec16()?, "tls server name list");
    while list.remaining() >= 3 {
        let name_type = list.u8()?;
        let name = list.vec16()?;
        if name_type == 0 && !name.is_empty() {
            return match std::str::from_utf8(name) {
                Ok(s) => Ok(Some(s.to_ascii_lowercase())),
                Err(e) => Err(FlowError::Malformed {
                    what: "tls server name",
                    reason: e.to_string(),
                }),
            };
        }
    }
    Ok(None)
}

/// Parse a ServerHello body (without the handshake header)
pub fn parse_server_hello(body: &[u8]) -> FlowResult<ServerHello> {
    let mut r = ByteReader::new(body, "tls server hello");
    let mut version = r.u16()?;
    r.skip(32)?;
    r.vec8()?;
    let cipher = r.u16()?;
    r.u8()?;

    let mut duplicate_extension = false;
    if r.remaining() >= 2 {
        let mut ext = ByteReader::new(r.vec16()?, "tls extensions");
        let mut seen: Vec<u16> = Vec::new();
        while ext.remaining() >= 4 {
            let ext_type = ext.u16()?;
            let data = ext.vec16()?;
            if seen.contains(&ext_type) {
                duplicate_extension = true;
            } else {
                seen.push(ext_type);
            }
            if ext_type == EXT_SUPPORTED_VERSIONS && data.len() == 2 {
                version = u16::from_be_bytes([data[0], data[1]]);
            }
        }
    }
    Ok(ServerHello {
        version,
        cipher,
        duplicate_extension,
    })
}

/// Whether the first certificate of a Certificate message names itself
/// as issuer
///
/// Returns `None` when the chain is empty.
pub fn leaf_is_self_signed(body: &[u8]) -> FlowResult<Option<bool>> {
    let mut r = ByteReader::new(body, "tls certificate");
    let list_len = r.u24()?;
    if list_len == 0 {
        return Ok(None);
    }
    let mut list = ByteReader::new(r.take(list_len)?, "tls certificate list");
    let cert_len = list.u24()?;
    let cert = list.take(cert_len)?;

    let (issuer, subject) = issuer_and_subject(cert)?;
    Ok(Some(issuer == subject))
}

/// A DER element: (tag, content, rest)
fn der_element(input: &[u8]) -> FlowResult<(u8, &[u8], &[u8])> {
    let mut r = ByteReader::new(input, "der element");
    let tag = r.u8()?;
    let first = r.u8()?;
    let len = if first < 0x80 {
        first as usize
    } else {
        let n = (first & 0x7f) as usize;
        if n == 0 || n > 4 {
            return Err(FlowError::Malformed {
                what: "der length",
                reason: format!("{} length bytes", n),
            });
        }
        r.take(n)?
            .iter()
            .fold(0usize, |acc, b| (acc << 8) | *b as usize)
    };
    let content = r.take(len)?;
    Ok((tag, content, &input[r.position()..]))
}

fn expect_sequence<'a>(input: &'a [u8], what: &'static str) -> FlowResult<(&'a [u8], &'a [u8])> {
    let (tag, content, rest) = der_element(input)?;
    if tag != 0x30 {
        return Err(FlowError::Malformed {
            what,
            reason: format!("tag {:#04x}", tag),
        });
    }
    Ok((content, rest))
}

fn issuer_and_subject(cert: &[u8]) -> FlowResult<(&[u8], &[u8])> {
    let (certificate, _) = expect_sequence(cert, "certificate")?;
    let (tbs, _) = expect_sequence(certificate, "tbs certificate")?;

    let mut rest = tbs;
    // Optional explicit version
    let (tag, _, after) = der_element(rest)?;
    if tag == 0xa0 {
        rest = after;
    }
    let (_, _, rest) = der_element(rest)?; // serial
    let (_, rest) = expect_sequence(rest, "signature algorithm")?;
    let (issuer, rest) = expect_sequence(rest, "issuer")?;
    let (_, rest) = expect_sequence(rest, "validity")?;
    let (subject, _) = expect_sequence(rest, "subject")?;
    Ok((issuer, subject))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dissector::DissectLimits;
    use osprey_packet::{synth, Direction, PacketView};

    const CLIENT: [u8; 4] = [10, 0, 0, 1];
    const SERVER: [u8; 4] = [10, 0, 0, 2];

    fn run(
        state: &mut DissectorState,
        direction: Direction,
        payload: &[u8],
        limits: DissectLimits,
    ) -> (Dissection, crate::Findings) {
        let bytes = match direction {
            Direction::ToServer => synth::tcp_v4(CLIENT, 50000, SERVER, 443, payload),
            Direction::ToClient => synth::tcp_v4(SERVER, 443, CLIENT, 50000, payload),
        }
        .unwrap();
        let packet = PacketView::parse(&bytes).unwrap();
        let mut ctx = DissectContext::new(packet, direction, 2, state, limits);
        let outcome = TlsDissector::new().dissect(&mut ctx);
        (outcome, ctx.findings)
    }

    #[test]
    fn test_client_hello_with_sni() {
        let mut state = DissectorState::default();
        let hello = synth::tls_client_hello(Some("Example.COM"));
        let (outcome, findings) = run(&mut state, Direction::ToServer, &hello, Default::default());

        match outcome {
            Dissection::Found(m) => assert_eq!(m.protocol.master, 2),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(findings.server_name.as_deref(), Some("example.com"));
        assert_eq!(findings.tls_version, Some(0x0303));
        assert!(!findings.risk.contains(RiskFlags::TLS_MISSING_SNI));
        assert!(TlsDissector.wants_extra_dissection(&state));
    }

    #[test]
    fn test_missing_sni() {
        let mut state = DissectorState::default();
        let hello = synth::tls_client_hello(None);
        let (_, findings) = run(&mut state, Direction::ToServer, &hello, Default::default());
        assert!(findings.risk.contains(RiskFlags::TLS_MISSING_SNI));
        assert!(findings.server_name.is_none());
    }

    #[test]
    fn test_ja3_fingerprint_skips_grease() {
        let mut state = DissectorState::default();
        let hello = synth::tls_client_hello(Some("a.example"));
        let (_, findings) = run(&mut state, Direction::ToServer, &hello, Default::default());
        // 0x1301, 0xc02f; the GREASE extension is left out
        assert_eq!(findings.tls_fingerprint.as_deref(), Some("771,4865-49199,0,,"));

        let parsed = parse_client_hello(&hello[9..]).unwrap();
        assert_eq!(parsed.fingerprint, "771,4865-49199,0,,");
        assert!(!parsed.duplicate_extension);
    }

    #[test]
    fn test_repeated_extension_is_suspicious() {
        let mut body = vec![3, 3];
        body.extend_from_slice(&[0x11; 32]);
        body.push(0);
        body.extend_from_slice(&[0, 2, 0x13, 0x01]);
        body.extend_from_slice(&[1, 0]);
        // extended_master_secret twice, then supported_groups
        let extensions = [0, 0x17, 0, 0, 0, 0x17, 0, 0, 0, 0x0a, 0, 4, 0, 2, 0, 0x1d];
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);
        let record = synth::tls_handshake_record(HANDSHAKE_CLIENT_HELLO, &body);

        let mut state = DissectorState::default();
        let (outcome, findings) = run(&mut state, Direction::ToServer, &record, Default::default());
        assert!(matches!(outcome, Dissection::Found(_)));
        assert!(findings.risk.contains(RiskFlags::TLS_SUSPICIOUS_EXTENSION));
        assert!(findings.risk.contains(RiskFlags::TLS_MISSING_SNI));
        assert_eq!(findings.tls_fingerprint.as_deref(), Some("771,4865,23-23-10,29,"));

        let (_, findings) = run(
            &mut DissectorState::default(),
            Direction::ToServer,
            &synth::tls_client_hello(Some("clean.example")),
            Default::default(),
        );
        assert!(!findings.risk.contains(RiskFlags::TLS_SUSPICIOUS_EXTENSION));
    }

    #[test]
    fn test_split_record_reassembly() {
        let mut state = DissectorState::default();
        let hello = synth::tls_client_hello(Some("split.example"));
        let (first, second) = hello.split_at(20);

        let (outcome, _) = run(&mut state, Direction::ToServer, first, Default::default());
        assert_eq!(outcome, Dissection::NeedMore);
        let (outcome, findings) = run(&mut state, Direction::ToServer, second, Default::default());
        assert!(matches!(outcome, Dissection::Found(_)));
        assert_eq!(findings.server_name.as_deref(), Some("split.example"));
    }

    #[test]
    fn test_not_tls_excluded() {
        let mut state = DissectorState::default();
        let (outcome, _) = run(
            &mut state,
            Direction::ToServer,
            b"GET / HTTP/1.1\r\n\r\n",
            Default::default(),
        );
        assert_eq!(outcome, Dissection::Exclude);
    }

    #[test]
    fn test_obsolete_version_and_weak_cipher() {
        let mut state = DissectorState::default();
        run(
            &mut state,
            Direction::ToServer,
            &synth::tls_client_hello(Some("old.example")),
            Default::default(),
        );
        let (_, findings) = run(
            &mut state,
            Direction::ToClient,
            &synth::tls_server_hello(0x0301, 0x0005),
            Default::default(),
        );
        assert!(findings.risk.contains(RiskFlags::TLS_OBSOLETE_VERSION));
        assert!(findings.risk.contains(RiskFlags::TLS_WEAK_CIPHER));
    }

    #[test]
    fn test_tls13_stops_before_certificates() {
        let mut state = DissectorState::default();
        run(
            &mut state,
            Direction::ToServer,
            &synth::tls_client_hello(Some("modern.example")),
            Default::default(),
        );
        let (outcome, findings) = run(
            &mut state,
            Direction::ToClient,
            &synth::tls_server_hello(0x0304, 0x1301),
            Default::default(),
        );
        assert_eq!(outcome, Dissection::Done);
        assert!(findings.risk.is_empty());
        assert!(!TlsDissector.wants_extra_dissection(&state));
        assert_eq!(state.memory_usage(), 0);
    }

    #[test]
    fn test_self_signed_certificate() {
        let mut state = DissectorState::default();
        run(
            &mut state,
            Direction::ToServer,
            &synth::tls_client_hello(Some("self.example")),
            Default::default(),
        );
        let mut server_flight = synth::tls_server_hello(0x0303, 0xc02f);
        server_flight.extend(synth::tls_certificate(&synth::der_certificate(
            "self.example",
            "self.example",
        )));
        let (outcome, findings) =
            run(&mut state, Direction::ToClient, &server_flight, Default::default());

        assert_eq!(outcome, Dissection::Done);
        assert!(findings.risk.contains(RiskFlags::TLS_SELFSIGNED_CERTIFICATE));
        assert!(!TlsDissector.wants_extra_dissection(&state));
    }

    #[test]
    fn test_ca_signed_certificate() {
        let cert = synth::der_certificate("Example CA", "www.example.com");
        let record = synth::tls_certificate(&cert);
        // Skip record and handshake headers
        assert_eq!(leaf_is_self_signed(&record[9..]).unwrap(), Some(false));
    }

    #[test]
    fn test_reassembly_limit() {
        let mut state = DissectorState::default();
        let limits = DissectLimits {
            tls_reassembly_limit: 64,
        };
        // A record header announcing far more than the limit
        let mut partial = vec![CONTENT_HANDSHAKE, 3, 1, 0x10, 0x00];
        partial.extend_from_slice(&[0u8; 40]);
        let (outcome, _) = run(&mut state, Direction::ToServer, &partial, limits);
        assert_eq!(outcome, Dissection::NeedMore);
        let (outcome, _) = run(&mut state, Direction::ToServer, &[0u8; 40], limits);
        assert_eq!(outcome, Dissection::Exclude);
    }

    #[test]
    fn test_garbage_handshake_is_malformed() {
        let mut state = DissectorState::default();
        // ClientHello claiming a body too short for its fixed fields
        let record = synth::tls_handshake_record(HANDSHAKE_CLIENT_HELLO, &[3, 3, 0, 0]);
        let (outcome, _) = run(&mut state, Direction::ToServer, &record, Default::default());
        assert_eq!(outcome, Dissection::Malformed("tls handshake"));
    }

    #[test]
    fn test_grease() {
        assert!(is_grease(0x0a0a));
        assert!(is_grease(0xfafa));
        assert!(!is_grease(0x0303));
        assert!(!is_grease(0x0a1a));
    }
}
