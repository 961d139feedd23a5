// Append-only record serializer
//
// Items are encoded straight into the output buffer as they are written.
// Container bookkeeping is a small stack so JSON separators and balance
// checks need no look-back into the buffer.

use crate::tlv::{self, HEADER_LEN};
use crate::{Format, Key, SerializerError, SerializerResult};
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt::Write as _;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Record,
    Block,
    List,
}

#[derive(Debug, Clone, Copy)]
struct Frame {
    kind: Kind,
    has_items: bool,
}

/// Everything needed to undo writes made after a snapshot
#[derive(Debug, Clone)]
struct Snapshot {
    len: usize,
    stack: Vec<Frame>,
    header_len: usize,
    csv_fields: usize,
    records: usize,
}

enum Value<'a> {
    Uint(u64),
    Int(i64),
    Float(f32),
    Str(&'a str),
    Bool(bool),
}

/// Record serializer for one of the supported [`Format`]s
#[derive(Debug)]
pub struct Serializer {
    format: Format,
    buf: BytesMut,
    /// Open containers; empty between records
    stack: Vec<Frame>,
    records: usize,
    /// CSV column names, collected while writing the first record
    header: Vec<String>,
    csv_fields: usize,
    snapshot: Option<Snapshot>,
}

impl Serializer {
    pub fn new(format: Format) -> Self {
        Self::with_capacity(format, 256)
    }

    pub fn with_capacity(format: Format, capacity: usize) -> Self {
        let mut buf = BytesMut::with_capacity(capacity);
        if format == Format::Tlv {
            tlv::put_header(&mut buf);
        }
        Self {
            format,
            buf,
            stack: Vec::new(),
            records: 0,
            header: Vec::new(),
            csv_fields: 0,
            snapshot: None,
        }
    }

    pub fn format(&self) -> Format {
        self.format
    }

    /// Completed records
    pub fn records(&self) -> usize {
        self.records
    }

    /// Bytes written so far, including any unterminated record
    pub fn buffer(&self) -> &[u8] {
        &self.buf
    }

    /// True if nothing but the format header has been written
    pub fn is_empty(&self) -> bool {
        self.buf.len() == self.base_len() && self.stack.is_empty()
    }

    /// CSV header line built from the first record's keys
    ///
    /// `None` for other formats or before any CSV key has been written.
    pub fn header(&self) -> Option<String> {
        if self.format != Format::Csv || self.header.is_empty() {
            return None;
        }
        let mut line = String::new();
        for (i, name) in self.header.iter().enumerate() {
            if i > 0 {
                line.push(',');
            }
            push_csv_field(&mut line, name);
        }
        Some(line)
    }

    /// Discard all output and start over in the same format
    pub fn reset(&mut self) {
        self.buf.clear();
        if self.format == Format::Tlv {
            tlv::put_header(&mut self.buf);
        }
        self.stack.clear();
        self.records = 0;
        self.header.clear();
        self.csv_fields = 0;
        self.snapshot = None;
    }

    pub fn write_u32<'k>(&mut self, key: impl Into<Key<'k>>, v: u32) -> SerializerResult<()> {
        self.write_value(key.into(), Value::Uint(v as u64))
    }

    pub fn write_u64<'k>(&mut self, key: impl Into<Key<'k>>, v: u64) -> SerializerResult<()> {
        self.write_value(key.into(), Value::Uint(v))
    }

    pub fn write_i32<'k>(&mut self, key: impl Into<Key<'k>>, v: i32) -> SerializerResult<()> {
        self.write_value(key.into(), Value::Int(v as i64))
    }

    pub fn write_i64<'k>(&mut self, key: impl Into<Key<'k>>, v: i64) -> SerializerResult<()> {
        self.write_value(key.into(), Value::Int(v))
    }

    pub fn write_f32<'k>(&mut self, key: impl Into<Key<'k>>, v: f32) -> SerializerResult<()> {
        self.write_value(key.into(), Value::Float(v))
    }

    pub fn write_str<'k>(&mut self, key: impl Into<Key<'k>>, v: &str) -> SerializerResult<()> {
        self.write_value(key.into(), Value::Str(v))
    }

    pub fn write_bool<'k>(&mut self, key: impl Into<Key<'k>>, v: bool) -> SerializerResult<()> {
        self.write_value(key.into(), Value::Bool(v))
    }

    /// Open a nested block under `key`
    pub fn start_block<'k>(&mut self, key: impl Into<Key<'k>>) -> SerializerResult<()> {
        self.open(key.into(), Kind::Block)
    }

    pub fn end_block(&mut self) -> SerializerResult<()> {
        self.close(Kind::Block)
    }

    /// Open a list under `key`; keys of items inside it are dropped in JSON
    pub fn start_list<'k>(&mut self, key: impl Into<Key<'k>>) -> SerializerResult<()> {
        self.open(key.into(), Kind::List)
    }

    pub fn end_list(&mut self) -> SerializerResult<()> {
        self.close(Kind::List)
    }

    /// Close the current record; the next write starts a new one
    pub fn end_of_record(&mut self) -> SerializerResult<()> {
        if self.stack.len() > 1 {
            return Err(SerializerError::Unbalanced("record ended inside a block or list"));
        }
        match self.format {
            Format::Json => {
                if self.stack.is_empty() {
                    self.buf.put_u8(b'{');
                }
                self.buf.put_slice(b"}\n");
            }
            Format::Tlv => self.buf.put_u8(tlv::T_END_OF_RECORD),
            Format::Csv => {
                if self.records > 0 && self.csv_fields != self.header.len() {
                    return Err(SerializerError::ColumnCount {
                        expected: self.header.len(),
                        found: self.csv_fields,
                    });
                }
                self.buf.put_u8(b'\n');
                self.csv_fields = 0;
            }
        }
        self.stack.clear();
        self.records += 1;
        Ok(())
    }

    /// Remember the current position for a later [`rollback`](Self::rollback)
    ///
    /// Only one snapshot is kept; a new one replaces the old.
    pub fn snapshot(&mut self) {
        self.snapshot = Some(Snapshot {
            len: self.buf.len(),
            stack: self.stack.clone(),
            header_len: self.header.len(),
            csv_fields: self.csv_fields,
            records: self.records,
        });
    }

    /// Discard everything written since the last snapshot
    pub fn rollback(&mut self) -> SerializerResult<()> {
        let snapshot = self.snapshot.take().ok_or(SerializerError::NoSnapshot)?;
        debug!(
            format = %self.format,
            discarded = self.buf.len() - snapshot.len,
            "Serializer rollback"
        );
        self.buf.truncate(snapshot.len);
        self.stack = snapshot.stack;
        self.header.truncate(snapshot.header_len);
        self.csv_fields = snapshot.csv_fields;
        self.records = snapshot.records;
        Ok(())
    }

    /// Terminate and hand out the encoded bytes
    ///
    /// An open top-level record is closed first; open blocks or lists are
    /// an error.
    pub fn finish(mut self) -> SerializerResult<Bytes> {
        if !self.stack.is_empty() {
            self.end_of_record()?;
        }
        debug!(format = %self.format, records = self.records, bytes = self.buf.len(), "Serializer finished");
        Ok(self.buf.freeze())
    }

    fn base_len(&self) -> usize {
        if self.format == Format::Tlv {
            HEADER_LEN
        } else {
            0
        }
    }

    fn ensure_record(&mut self) {
        if self.stack.is_empty() {
            if self.format == Format::Json {
                self.buf.put_u8(b'{');
            }
            self.stack.push(Frame {
                kind: Kind::Record,
                has_items: false,
            });
        }
    }

    fn check_tlv_len(&self, len: usize) -> SerializerResult<()> {
        if len > u16::MAX as usize {
            return Err(SerializerError::TooLong {
                format: self.format,
                len,
            });
        }
        Ok(())
    }

    /// Separator and key for the next JSON member or list element
    fn json_prefix(&mut self, key: Key<'_>) -> SerializerResult<()> {
        self.ensure_record();
        let Some(top) = self.stack.last_mut() else {
            return Err(SerializerError::Unbalanced("no open record"));
        };
        let comma = top.has_items;
        let in_list = top.kind == Kind::List;
        top.has_items = true;

        if comma {
            self.buf.put_u8(b',');
        }
        if !in_list {
            let rendered = match key {
                Key::Name(name) => serde_json::to_string(name)?,
                Key::Id(id) => format!("\"{}\"", id),
            };
            self.buf.put_slice(rendered.as_bytes());
            self.buf.put_u8(b':');
        }
        Ok(())
    }

    fn tlv_item(&mut self, key: Key<'_>, value_type: u8) -> SerializerResult<()> {
        self.ensure_record();
        match key {
            Key::Id(id) => {
                let key_type = tlv::uint_type(id as u64);
                self.buf.put_u8((key_type << 4) | value_type);
                tlv::put_uint(&mut self.buf, key_type, id as u64);
            }
            Key::Name(name) => {
                self.check_tlv_len(name.len())?;
                self.buf.put_u8((tlv::T_STRING << 4) | value_type);
                tlv::put_str(&mut self.buf, name);
            }
        }
        Ok(())
    }

    fn write_value(&mut self, key: Key<'_>, value: Value<'_>) -> SerializerResult<()> {
        match self.format {
            Format::Json => {
                self.json_prefix(key)?;
                let rendered = match value {
                    Value::Uint(v) => v.to_string(),
                    Value::Int(v) => v.to_string(),
                    Value::Float(v) => serde_json::to_string(&v)?,
                    Value::Str(s) => serde_json::to_string(s)?,
                    Value::Bool(b) => b.to_string(),
                };
                self.buf.put_slice(rendered.as_bytes());
            }
            Format::Tlv => match value {
                Value::Uint(v) => {
                    let ty = tlv::uint_type(v);
                    self.tlv_item(key, ty)?;
                    tlv::put_uint(&mut self.buf, ty, v);
                }
                Value::Int(v) => {
                    let ty = tlv::int_type(v);
                    self.tlv_item(key, ty)?;
                    tlv::put_int(&mut self.buf, ty, v);
                }
                Value::Float(v) => {
                    self.tlv_item(key, tlv::T_FLOAT)?;
                    self.buf.put_f32(v);
                }
                Value::Str(s) => {
                    self.check_tlv_len(s.len())?;
                    self.tlv_item(key, tlv::T_STRING)?;
                    tlv::put_str(&mut self.buf, s);
                }
                Value::Bool(b) => {
                    self.tlv_item(key, tlv::T_BOOL)?;
                    self.buf.put_u8(b as u8);
                }
            },
            Format::Csv => {
                if self.stack.len() > 1 {
                    return Err(SerializerError::Unsupported {
                        format: self.format,
                        what: "nested values",
                    });
                }
                if self.records == 0 {
                    self.header.push(key.to_string());
                } else if self.csv_fields >= self.header.len() {
                    return Err(SerializerError::ColumnCount {
                        expected: self.header.len(),
                        found: self.csv_fields + 1,
                    });
                }
                self.ensure_record();
                let mut field = String::new();
                match value {
                    Value::Uint(v) => {
                        let _ = write!(field, "{}", v);
                    }
                    Value::Int(v) => {
                        let _ = write!(field, "{}", v);
                    }
                    Value::Float(v) => {
                        let _ = write!(field, "{}", v);
                    }
                    Value::Str(s) => push_csv_field(&mut field, s),
                    Value::Bool(b) => field.push_str(if b { "true" } else { "false" }),
                }
                if self.csv_fields > 0 {
                    self.buf.put_u8(b',');
                }
                self.buf.put_slice(field.as_bytes());
                self.csv_fields += 1;
            }
        }
        Ok(())
    }

    fn open(&mut self, key: Key<'_>, kind: Kind) -> SerializerResult<()> {
        match self.format {
            Format::Json => {
                self.json_prefix(key)?;
                self.buf.put_u8(if kind == Kind::Block { b'{' } else { b'[' });
            }
            Format::Tlv => {
                let ty = if kind == Kind::Block {
                    tlv::T_START_BLOCK
                } else {
                    tlv::T_START_LIST
                };
                self.tlv_item(key, ty)?;
            }
            Format::Csv => {
                return Err(SerializerError::Unsupported {
                    format: self.format,
                    what: "blocks and lists",
                })
            }
        }
        self.stack.push(Frame {
            kind,
            has_items: false,
        });
        Ok(())
    }

    fn close(&mut self, kind: Kind) -> SerializerResult<()> {
        match self.stack.last() {
            Some(frame) if frame.kind == kind => {}
            _ => {
                return Err(SerializerError::Unbalanced(if kind == Kind::Block {
                    "end_block without open block"
                } else {
                    "end_list without open list"
                }))
            }
        }
        self.stack.pop();
        match self.format {
            Format::Json => self.buf.put_u8(if kind == Kind::Block { b'}' } else { b']' }),
            Format::Tlv => self.buf.put_u8(if kind == Kind::Block {
                tlv::T_END_BLOCK
            } else {
                tlv::T_END_LIST
            }),
            Format::Csv => {}
        }
        Ok(())
    }
}

fn push_csv_field(out: &mut String, value: &str) {
    if value.contains([',', '"', '\n', '\r']) {
        out.push('"');
        out.push_str(&value.replace('"', "\"\""));
        out.push('"');
    } else {
        out.push_str(value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ItemKey, TlvDeserializer, TlvValue};

    #[test]
    fn test_json_nested_record() {
        let mut ser = Serializer::new(Format::Json);
        ser.write_u32("id", 7).unwrap();
        ser.start_block("proto").unwrap();
        ser.write_str("name", "TLS.Google").unwrap();
        ser.write_bool("guessed", false).unwrap();
        ser.end_block().unwrap();
        ser.start_list("risks").unwrap();
        ser.write_str("", "Self-signed Cert").unwrap();
        ser.write_str("", "Missing SNI").unwrap();
        ser.end_list().unwrap();
        ser.write_i32(9u32, -3).unwrap();
        ser.end_of_record().unwrap();

        let text = String::from_utf8(ser.finish().unwrap().to_vec()).unwrap();
        assert_eq!(
            text,
            "{\"id\":7,\"proto\":{\"name\":\"TLS.Google\",\"guessed\":false},\
             \"risks\":[\"Self-signed Cert\",\"Missing SNI\"],\"9\":-3}\n"
        );
        let parsed: serde_json::Value = serde_json::from_str(text.trim()).unwrap();
        assert_eq!(parsed["proto"]["name"], "TLS.Google");
    }

    #[test]
    fn test_json_escapes_strings_and_keys() {
        let mut ser = Serializer::new(Format::Json);
        ser.write_str("host\"name", "a\"b\n").unwrap();
        let bytes = ser.finish().unwrap();
        let parsed: serde_json::Value =
            serde_json::from_slice(bytes.strip_suffix(b"\n").unwrap()).unwrap();
        assert_eq!(parsed["host\"name"], "a\"b\n");
    }

    #[test]
    fn test_empty_json_record() {
        let mut ser = Serializer::new(Format::Json);
        ser.end_of_record().unwrap();
        assert_eq!(ser.buffer(), b"{}\n");
        assert_eq!(ser.records(), 1);
    }

    #[test]
    fn test_tlv_items_in_write_order() {
        let mut ser = Serializer::new(Format::Tlv);
        ser.write_u64(1u32, 70_000).unwrap();
        ser.write_i64("delta", -2).unwrap();
        ser.write_f32("ratio", 0.5).unwrap();
        ser.start_list(2u32).unwrap();
        ser.write_u32(0u32, 1).unwrap();
        ser.end_list().unwrap();
        ser.end_of_record().unwrap();
        let bytes = ser.finish().unwrap();

        let items: Vec<_> = TlvDeserializer::new(&bytes)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        let values: Vec<_> = items.iter().map(|i| i.value.clone()).collect();
        assert_eq!(
            values,
            vec![
                TlvValue::Uint(70_000),
                TlvValue::Int(-2),
                TlvValue::Float(0.5),
                TlvValue::StartList,
                TlvValue::Uint(1),
                TlvValue::EndList,
                TlvValue::EndOfRecord,
            ]
        );
        assert_eq!(items[0].key, Some(ItemKey::Id(1)));
        assert_eq!(items[1].key, Some(ItemKey::Name("delta".to_string())));
        assert_eq!(items[5].key, None);
    }

    #[test]
    fn test_csv_header_from_first_record() {
        let mut ser = Serializer::new(Format::Csv);
        assert_eq!(ser.header(), None);
        for (id, name) in [(1u32, "DNS"), (2, "TLS, maybe")] {
            ser.write_u32("flow", id).unwrap();
            ser.write_str("protocol", name).unwrap();
            ser.end_of_record().unwrap();
        }
        assert_eq!(ser.header().as_deref(), Some("flow,protocol"));
        assert_eq!(ser.buffer(), b"1,DNS\n2,\"TLS, maybe\"\n");
    }

    #[test]
    fn test_csv_rejects_nesting() {
        let mut ser = Serializer::new(Format::Csv);
        assert!(matches!(
            ser.start_block("x"),
            Err(SerializerError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_rollback_discards_speculative_writes() {
        let mut ser = Serializer::new(Format::Json);
        ser.write_u32("a", 1).unwrap();
        ser.snapshot();
        ser.start_block("partial").unwrap();
        ser.write_str("half", "written").unwrap();
        ser.rollback().unwrap();
        ser.write_u32("b", 2).unwrap();
        ser.end_of_record().unwrap();
        assert_eq!(ser.buffer(), b"{\"a\":1,\"b\":2}\n");
        assert!(matches!(ser.rollback(), Err(SerializerError::NoSnapshot)));
    }

    #[test]
    fn test_rollback_restores_csv_header() {
        let mut ser = Serializer::new(Format::Csv);
        ser.write_u32("a", 1).unwrap();
        ser.snapshot();
        ser.write_u32("b", 2).unwrap();
        ser.rollback().unwrap();
        ser.end_of_record().unwrap();
        assert_eq!(ser.header().as_deref(), Some("a"));
        assert_eq!(ser.buffer(), b"1\n");
    }

    #[test]
    fn test_unbalanced_containers() {
        let mut ser = Serializer::new(Format::Tlv);
        assert!(matches!(ser.end_block(), Err(SerializerError::Unbalanced(_))));
        ser.start_block("b").unwrap();
        assert!(matches!(ser.end_list(), Err(SerializerError::Unbalanced(_))));
        assert!(matches!(ser.end_of_record(), Err(SerializerError::Unbalanced(_))));
        assert!(ser.finish().is_err());
    }

    #[test]
    fn test_finish_closes_open_record() {
        let mut ser = Serializer::new(Format::Tlv);
        ser.write_bool("ok", true).unwrap();
        let bytes = ser.finish().unwrap();
        assert_eq!(bytes.last(), Some(&tlv::T_END_OF_RECORD));
    }

    #[test]
    fn test_tlv_bool_keeps_its_type() {
        let mut ser = Serializer::new(Format::Tlv);
        ser.write_bool("authoritative", true).unwrap();
        ser.write_bool(3u32, false).unwrap();
        ser.write_u32("count", 1).unwrap();
        let bytes = ser.finish().unwrap();

        let values: Vec<_> = TlvDeserializer::new(&bytes)
            .unwrap()
            .map(|item| item.unwrap().value)
            .collect();
        assert_eq!(
            values,
            vec![
                TlvValue::Bool(true),
                TlvValue::Bool(false),
                TlvValue::Uint(1),
                TlvValue::EndOfRecord,
            ]
        );
    }

    #[test]
    fn test_csv_rows_must_match_header() {
        let mut ser = Serializer::new(Format::Csv);
        ser.write_u32("flow", 1).unwrap();
        ser.write_str("protocol", "DNS").unwrap();
        ser.end_of_record().unwrap();

        // Short row
        ser.snapshot();
        ser.write_u32("flow", 2).unwrap();
        assert!(matches!(
            ser.end_of_record(),
            Err(SerializerError::ColumnCount { expected: 2, found: 1 })
        ));
        ser.rollback().unwrap();

        // Long row
        ser.write_u32("flow", 3).unwrap();
        ser.write_str("protocol", "TLS").unwrap();
        assert!(matches!(
            ser.write_str("extra", "x"),
            Err(SerializerError::ColumnCount { expected: 2, found: 3 })
        ));
        ser.end_of_record().unwrap();

        assert_eq!(ser.records(), 2);
        assert_eq!(ser.buffer(), b"1,DNS\n3,TLS\n");
    }

    #[test]
    fn test_reset() {
        let mut ser = Serializer::new(Format::Tlv);
        assert!(ser.is_empty());
        ser.write_u32("x", 1).unwrap();
        ser.end_of_record().unwrap();
        assert!(!ser.is_empty());
        ser.reset();
        assert!(ser.is_empty());
        assert_eq!(ser.records(), 0);
        assert_eq!(ser.buffer(), &[crate::TLV_VERSION, 0]);
    }

    #[test]
    fn test_tlv_string_too_long() {
        let mut ser = Serializer::new(Format::Tlv);
        let long = "x".repeat(70_000);
        assert!(matches!(
            ser.write_str("k", &long),
            Err(SerializerError::TooLong { len: 70_000, .. })
        ));
    }
}
