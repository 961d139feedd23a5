// Packet trace input
//
// One packet per line: `<timestamp_ms> <hex bytes>`. Blank lines and lines
// starting with `#` are skipped.

use anyhow::{bail, Context, Result};
use std::io::BufRead;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TracePacket {
    pub line: usize,
    pub timestamp_ms: u64,
    pub bytes: Vec<u8>,
}

pub fn parse_line(line: &str) -> Result<Option<(u64, Vec<u8>)>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let Some((ts, data)) = line.split_once(char::is_whitespace) else {
        bail!("expected '<timestamp_ms> <hex>'");
    };
    let timestamp_ms = ts
        .parse::<u64>()
        .with_context(|| format!("bad timestamp '{}'", ts))?;
    let compact: String = data.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = hex::decode(&compact).context("bad hex payload")?;
    if bytes.is_empty() {
        bail!("empty packet");
    }
    Ok(Some((timestamp_ms, bytes)))
}

/// Read every packet, skipping (and reporting) unparsable lines
pub fn read_trace(reader: impl BufRead) -> Result<(Vec<TracePacket>, usize)> {
    let mut packets = Vec::new();
    let mut rejected = 0;
    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        match parse_line(&line) {
            Ok(Some((timestamp_ms, bytes))) => packets.push(TracePacket {
                line: idx + 1,
                timestamp_ms,
                bytes,
            }),
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(line = idx + 1, error = %err, "Skipping trace line");
                rejected += 1;
            }
        }
    }
    Ok((packets, rejected))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_line() {
        assert_eq!(
            parse_line("1000 4500 00ff").unwrap(),
            Some((1000, vec![0x45, 0x00, 0x00, 0xff]))
        );
        assert_eq!(parse_line("  # comment").unwrap(), None);
        assert_eq!(parse_line("").unwrap(), None);
        assert!(parse_line("abc 4500").is_err());
        assert!(parse_line("10 zz").is_err());
        assert!(parse_line("10").is_err());
    }

    #[test]
    fn test_read_trace_counts_rejects() {
        let input = "# trace\n1 45\nnot-a-line\n2 4500\n";
        let (packets, rejected) = read_trace(input.as_bytes()).unwrap();
        assert_eq!(rejected, 1);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[1].line, 4);
        assert_eq!(packets[1].timestamp_ms, 2);
    }
}
