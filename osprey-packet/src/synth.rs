//! Synthetic packet construction
//!
//! Used by tests, benchmarks and the CLI to fabricate well-formed IP
//! packets around an arbitrary payload.

use crate::{PacketError, PacketResult};
use etherparse::PacketBuilder;

const TTL: u8 = 64;
const WINDOW: u16 = 65535;

pub fn tcp_v4(src: [u8; 4], src_port: u16, dst: [u8; 4], dst_port: u16, payload: &[u8]) -> PacketResult<Vec<u8>> {
    let builder = PacketBuilder::ipv4(src, dst, TTL)
        .tcp(src_port, dst_port, 1, WINDOW)
        .ack(1)
        .psh();
    let mut buf = Vec::with_capacity(builder.size(payload.len()));
    builder
        .write(&mut buf, payload)
        .map_err(|e| PacketError::Build(e.to_string()))?;
    Ok(buf)
}

pub fn udp_v4(src: [u8; 4], src_port: u16, dst: [u8; 4], dst_port: u16, payload: &[u8]) -> PacketResult<Vec<u8>> {
    let builder = PacketBuilder::ipv4(src, dst, TTL).udp(src_port, dst_port);
    let mut buf = Vec::with_capacity(builder.size(payload.len()));
    builder
        .write(&mut buf, payload)
        .map_err(|e| PacketError::Build(e.to_string()))?;
    Ok(buf)
}

pub fn tcp_v6(src: [u8; 16], src_port: u16, dst: [u8; 16], dst_port: u16, payload: &[u8]) -> PacketResult<Vec<u8>> {
    let builder = PacketBuilder::ipv6(src, dst, TTL)
        .tcp(src_port, dst_port, 1, WINDOW)
        .ack(1)
        .psh();
    let mut buf = Vec::with_capacity(builder.size(payload.len()));
    builder
        .write(&mut buf, payload)
        .map_err(|e| PacketError::Build(e.to_string()))?;
    Ok(buf)
}

pub fn udp_v6(src: [u8; 16], src_port: u16, dst: [u8; 16], dst_port: u16, payload: &[u8]) -> PacketResult<Vec<u8>> {
    let builder = PacketBuilder::ipv6(src, dst, TTL).udp(src_port, dst_port);
    let mut buf = Vec::with_capacity(builder.size(payload.len()));
    builder
        .write(&mut buf, payload)
        .map_err(|e| PacketError::Build(e.to_string()))?;
    Ok(buf)
}

// ============================================================================
// Application payloads
// ============================================================================

const TLS_HANDSHAKE: u8 = 22;

fn push_u16(out: &mut Vec<u8>, v: u16) {
    out.extend_from_slice(&v.to_be_bytes());
}

fn push_u24(out: &mut Vec<u8>, v: usize) {
    out.extend_from_slice(&[(v >> 16) as u8, (v >> 8) as u8, v as u8]);
}

/// Wrap a handshake message body into a single TLS record
pub fn tls_handshake_record(msg_type: u8, body: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(body.len() + 4);
    msg.push(msg_type);
    push_u24(&mut msg, body.len());
    msg.extend_from_slice(body);

    let mut record = Vec::with_capacity(msg.len() + 5);
    record.push(TLS_HANDSHAKE);
    push_u16(&mut record, 0x0301);
    push_u16(&mut record, msg.len() as u16);
    record.extend_from_slice(&msg);
    record
}

/// A minimal TLS 1.2 ClientHello record, optionally carrying SNI
pub fn tls_client_hello(server_name: Option<&str>) -> Vec<u8> {
    let mut body = Vec::new();
    push_u16(&mut body, 0x0303);
    body.extend_from_slice(&[0x5a; 32]);
    body.push(0); // session id
    push_u16(&mut body, 4);
    push_u16(&mut body, 0x1301);
    push_u16(&mut body, 0xc02f);
    body.extend_from_slice(&[1, 0]); // null compression

    let mut extensions = Vec::new();
    // GREASE extension ahead of the real ones
    push_u16(&mut extensions, 0x0a0a);
    push_u16(&mut extensions, 0);
    if let Some(name) = server_name {
        let name = name.as_bytes();
        push_u16(&mut extensions, 0x0000);
        push_u16(&mut extensions, (name.len() + 5) as u16);
        push_u16(&mut extensions, (name.len() + 3) as u16);
        extensions.push(0);
        push_u16(&mut extensions, name.len() as u16);
        extensions.extend_from_slice(name);
    }
    push_u16(&mut body, extensions.len() as u16);
    body.extend_from_slice(&extensions);

    tls_handshake_record(1, &body)
}

/// A ServerHello record negotiating `version` (TLS 1.3 via supported_versions)
pub fn tls_server_hello(version: u16, cipher: u16) -> Vec<u8> {
    let mut body = Vec::new();
    push_u16(&mut body, version.min(0x0303));
    body.extend_from_slice(&[0xa5; 32]);
    body.push(0);
    push_u16(&mut body, cipher);
    body.push(0);

    let mut extensions = Vec::new();
    if version >= 0x0304 {
        push_u16(&mut extensions, 0x002b);
        push_u16(&mut extensions, 2);
        push_u16(&mut extensions, version);
    }
    push_u16(&mut body, extensions.len() as u16);
    body.extend_from_slice(&extensions);

    tls_handshake_record(2, &body)
}

/// A Certificate handshake record carrying one DER certificate
pub fn tls_certificate(der: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    push_u24(&mut body, der.len() + 3);
    push_u24(&mut body, der.len());
    body.extend_from_slice(der);
    tls_handshake_record(11, &body)
}

fn der(tag: u8, content: &[u8]) -> Vec<u8> {
    let mut out = vec![tag];
    let len = content.len();
    if len < 0x80 {
        out.push(len as u8);
    } else if len <= 0xff {
        out.extend_from_slice(&[0x81, len as u8]);
    } else {
        out.extend_from_slice(&[0x82, (len >> 8) as u8, len as u8]);
    }
    out.extend_from_slice(content);
    out
}

fn der_name(common_name: &str) -> Vec<u8> {
    let mut attr = der(0x06, &[0x55, 0x04, 0x03]);
    attr.extend(der(0x0c, common_name.as_bytes()));
    der(0x30, &der(0x31, &der(0x30, &attr)))
}

/// A structurally valid X.509 certificate skeleton
///
/// Only the fields a summarizing dissector reads are meaningful; the
/// signature is filler.
pub fn der_certificate(issuer_cn: &str, subject_cn: &str) -> Vec<u8> {
    let sha256_rsa = der(0x30, &der(0x06, &[0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x0b]));

    let mut validity = der(0x17, b"250101000000Z");
    validity.extend(der(0x17, b"350101000000Z"));

    let mut tbs = der(0xa0, &der(0x02, &[2]));
    tbs.extend(der(0x02, &[0x01, 0x23]));
    tbs.extend(&sha256_rsa);
    tbs.extend(der_name(issuer_cn));
    tbs.extend(der(0x30, &validity));
    tbs.extend(der_name(subject_cn));
    tbs.extend(der(0x30, &sha256_rsa));

    let mut cert = der(0x30, &tbs);
    cert.extend(&sha256_rsa);
    cert.extend(der(0x03, &[0x00; 33]));
    der(0x30, &cert)
}

/// An HTTP/1.1 request with the given extra header lines
pub fn http_request(method: &str, host: &str, path: &str, headers: &[(&str, &str)]) -> Vec<u8> {
    let mut out = format!("{} {} HTTP/1.1\r\nHost: {}\r\n", method, path, host);
    for (name, value) in headers {
        out.push_str(&format!("{}: {}\r\n", name, value));
    }
    out.push_str("\r\n");
    out.into_bytes()
}

pub fn http_response(status: u16, reason: &str) -> Vec<u8> {
    format!("HTTP/1.1 {} {}\r\nContent-Length: 0\r\n\r\n", status, reason).into_bytes()
}

/// A standard recursive DNS query for one A record
pub fn dns_query(id: u16, name: &str) -> Vec<u8> {
    let mut out = Vec::new();
    push_u16(&mut out, id);
    push_u16(&mut out, 0x0100); // RD
    push_u16(&mut out, 1);
    out.extend_from_slice(&[0; 6]);
    for label in name.trim_end_matches('.').split('.') {
        out.push(label.len() as u8);
        out.extend_from_slice(label.as_bytes());
    }
    out.push(0);
    push_u16(&mut out, 1);
    push_u16(&mut out, 1);
    out
}
