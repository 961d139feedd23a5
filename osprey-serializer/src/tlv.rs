// TLV wire format
//
// Buffer layout: a two byte header (version, reserved) followed by items.
// Each item starts with a type byte, key type in the high nibble and value
// type in the low nibble. Integers are packed into the narrowest width that
// holds them; strings carry a big-endian u16 length. Value type 0 (never a
// key type other than "no key") carries a one byte boolean.

use crate::{SerializerError, SerializerResult};
use bytes::{Buf, BufMut, BytesMut};

/// Current TLV layout version
pub const TLV_VERSION: u8 = 1;

pub(crate) const HEADER_LEN: usize = 2;

pub(crate) const T_NONE: u8 = 0;
pub(crate) const T_BOOL: u8 = T_NONE;
pub(crate) const T_END_OF_RECORD: u8 = 1;
pub(crate) const T_U8: u8 = 2;
pub(crate) const T_U16: u8 = 3;
pub(crate) const T_U32: u8 = 4;
pub(crate) const T_U64: u8 = 5;
pub(crate) const T_I8: u8 = 6;
pub(crate) const T_I16: u8 = 7;
pub(crate) const T_I32: u8 = 8;
pub(crate) const T_I64: u8 = 9;
pub(crate) const T_FLOAT: u8 = 10;
pub(crate) const T_STRING: u8 = 11;
pub(crate) const T_START_BLOCK: u8 = 12;
pub(crate) const T_END_BLOCK: u8 = 13;
pub(crate) const T_START_LIST: u8 = 14;
pub(crate) const T_END_LIST: u8 = 15;

pub(crate) fn put_header(buf: &mut BytesMut) {
    buf.put_u8(TLV_VERSION);
    buf.put_u8(0);
}

pub(crate) fn uint_type(v: u64) -> u8 {
    if v <= u8::MAX as u64 {
        T_U8
    } else if v <= u16::MAX as u64 {
        T_U16
    } else if v <= u32::MAX as u64 {
        T_U32
    } else {
        T_U64
    }
}

pub(crate) fn int_type(v: i64) -> u8 {
    if i8::try_from(v).is_ok() {
        T_I8
    } else if i16::try_from(v).is_ok() {
        T_I16
    } else if i32::try_from(v).is_ok() {
        T_I32
    } else {
        T_I64
    }
}

pub(crate) fn put_uint(buf: &mut BytesMut, ty: u8, v: u64) {
    match ty {
        T_U8 => buf.put_u8(v as u8),
        T_U16 => buf.put_u16(v as u16),
        T_U32 => buf.put_u32(v as u32),
        _ => buf.put_u64(v),
    }
}

pub(crate) fn put_int(buf: &mut BytesMut, ty: u8, v: i64) {
    match ty {
        T_I8 => buf.put_i8(v as i8),
        T_I16 => buf.put_i16(v as i16),
        T_I32 => buf.put_i32(v as i32),
        _ => buf.put_i64(v),
    }
}

pub(crate) fn put_str(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.put_slice(s.as_bytes());
}

/// Owned item key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemKey {
    Id(u32),
    Name(String),
}

impl ItemKey {
    pub fn as_name(&self) -> Option<&str> {
        match self {
            ItemKey::Name(name) => Some(name),
            ItemKey::Id(_) => None,
        }
    }
}

/// Decoded item value
#[derive(Debug, Clone, PartialEq)]
pub enum TlvValue {
    EndOfRecord,
    Bool(bool),
    Uint(u64),
    Int(i64),
    Float(f32),
    Str(String),
    StartBlock,
    EndBlock,
    StartList,
    EndList,
}

impl TlvValue {
    /// Unsigned view of an integer value, if it has one
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            TlvValue::Uint(v) => Some(*v),
            TlvValue::Int(v) => u64::try_from(*v).ok(),
            TlvValue::Bool(b) => Some(*b as u64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            TlvValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// One decoded TLV item
#[derive(Debug, Clone, PartialEq)]
pub struct TlvItem {
    pub key: Option<ItemKey>,
    pub value: TlvValue,
}

/// Sequential reader over a TLV buffer
///
/// Yields items in write order, including structural markers (block and
/// list bounds, end of record).
pub struct TlvDeserializer<'a> {
    buf: &'a [u8],
    offset: usize,
    failed: bool,
}

impl<'a> TlvDeserializer<'a> {
    /// Validate the header and position at the first item
    pub fn new(buf: &'a [u8]) -> SerializerResult<Self> {
        if buf.len() < HEADER_LEN {
            return Err(SerializerError::Truncated(0));
        }
        if buf[0] != TLV_VERSION {
            return Err(SerializerError::Version(buf[0]));
        }
        Ok(Self {
            buf,
            offset: HEADER_LEN,
            failed: false,
        })
    }

    /// Bytes not yet consumed
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.offset
    }

    /// Decode the next item, `None` at a clean end of buffer
    pub fn next_item(&mut self) -> SerializerResult<Option<TlvItem>> {
        if self.offset >= self.buf.len() {
            return Ok(None);
        }
        let start = self.offset;
        let mut cursor = &self.buf[self.offset..];
        let ty = cursor.get_u8();
        let key_type = ty >> 4;
        let value_type = ty & 0x0f;

        let key = match key_type {
            T_NONE => None,
            T_U8 | T_U16 | T_U32 => Some(ItemKey::Id(read_uint(&mut cursor, key_type, start)? as u32)),
            T_STRING => Some(ItemKey::Name(read_str(&mut cursor, start)?)),
            _ => return Err(SerializerError::UnknownType { ty, offset: start }),
        };

        let value = match value_type {
            T_END_OF_RECORD => TlvValue::EndOfRecord,
            T_BOOL => {
                need(&cursor, 1, start)?;
                TlvValue::Bool(cursor.get_u8() != 0)
            }
            T_U8 | T_U16 | T_U32 | T_U64 => TlvValue::Uint(read_uint(&mut cursor, value_type, start)?),
            T_I8 | T_I16 | T_I32 | T_I64 => TlvValue::Int(read_int(&mut cursor, value_type, start)?),
            T_FLOAT => {
                need(&cursor, 4, start)?;
                TlvValue::Float(cursor.get_f32())
            }
            T_STRING => TlvValue::Str(read_str(&mut cursor, start)?),
            T_START_BLOCK => TlvValue::StartBlock,
            T_END_BLOCK => TlvValue::EndBlock,
            T_START_LIST => TlvValue::StartList,
            T_END_LIST => TlvValue::EndList,
            _ => return Err(SerializerError::UnknownType { ty, offset: start }),
        };

        self.offset = self.buf.len() - cursor.remaining();
        Ok(Some(TlvItem { key, value }))
    }
}

impl Iterator for TlvDeserializer<'_> {
    type Item = SerializerResult<TlvItem>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_item() {
            Ok(item) => item.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

fn need(cursor: &&[u8], n: usize, offset: usize) -> SerializerResult<()> {
    if cursor.remaining() < n {
        return Err(SerializerError::Truncated(offset));
    }
    Ok(())
}

fn read_uint(cursor: &mut &[u8], ty: u8, offset: usize) -> SerializerResult<u64> {
    Ok(match ty {
        T_U8 => {
            need(cursor, 1, offset)?;
            cursor.get_u8() as u64
        }
        T_U16 => {
            need(cursor, 2, offset)?;
            cursor.get_u16() as u64
        }
        T_U32 => {
            need(cursor, 4, offset)?;
            cursor.get_u32() as u64
        }
        _ => {
            need(cursor, 8, offset)?;
            cursor.get_u64()
        }
    })
}

fn read_int(cursor: &mut &[u8], ty: u8, offset: usize) -> SerializerResult<i64> {
    Ok(match ty {
        T_I8 => {
            need(cursor, 1, offset)?;
            cursor.get_i8() as i64
        }
        T_I16 => {
            need(cursor, 2, offset)?;
            cursor.get_i16() as i64
        }
        T_I32 => {
            need(cursor, 4, offset)?;
            cursor.get_i32() as i64
        }
        _ => {
            need(cursor, 8, offset)?;
            cursor.get_i64()
        }
    })
}

fn read_str(cursor: &mut &[u8], offset: usize) -> SerializerResult<String> {
    need(cursor, 2, offset)?;
    let len = cursor.get_u16() as usize;
    need(cursor, len, offset)?;
    let s = std::str::from_utf8(&cursor[..len])
        .map_err(|_| SerializerError::Utf8(offset))?
        .to_string();
    cursor.advance(len);
    Ok(s)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_width_selection() {
        assert_eq!(uint_type(0), T_U8);
        assert_eq!(uint_type(300), T_U16);
        assert_eq!(uint_type(70_000), T_U32);
        assert_eq!(uint_type(u64::MAX), T_U64);
        assert_eq!(int_type(-1), T_I8);
        assert_eq!(int_type(-40_000), T_I32);
        assert_eq!(int_type(i64::MIN), T_I64);
    }

    #[test]
    fn test_rejects_bad_header() {
        assert!(matches!(
            TlvDeserializer::new(&[]),
            Err(SerializerError::Truncated(0))
        ));
        assert!(matches!(
            TlvDeserializer::new(&[9, 0]),
            Err(SerializerError::Version(9))
        ));
    }

    #[test]
    fn test_truncated_string_is_reported_once() {
        // header, then a string-keyed string value whose length overruns
        let buf = [TLV_VERSION, 0, (T_STRING << 4) | T_STRING, 0, 1, b'k', 0, 10, b'a'];
        let mut de = TlvDeserializer::new(&buf).unwrap();
        assert!(matches!(de.next(), Some(Err(SerializerError::Truncated(2)))));
        assert!(de.next().is_none());
    }

    #[test]
    fn test_unknown_key_type() {
        let buf = [TLV_VERSION, 0, (T_FLOAT << 4) | T_U8, 1];
        let mut de = TlvDeserializer::new(&buf).unwrap();
        assert!(matches!(
            de.next_item(),
            Err(SerializerError::UnknownType { offset: 2, .. })
        ));
    }
}
