//! Wire primitives shared by method bodies and content headers.
//!
//! - short string: `u8` length + UTF-8 bytes (at most 255 bytes)
//! - long string: `u32` length + raw bytes
//! - field table: `u32` byte length + `(short string key, tagged value)` pairs

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::{DecodeError, Result};

/// Fail with `BufferUnderrun` unless `needed` bytes remain in `buf`.
#[inline]
pub fn ensure_remaining(buf: &Bytes, needed: usize) -> Result<()> {
    if buf.remaining() < needed {
        return Err(DecodeError::BufferUnderrun {
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

pub fn read_u8(buf: &mut Bytes) -> Result<u8> {
    ensure_remaining(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn read_u16(buf: &mut Bytes) -> Result<u16> {
    ensure_remaining(buf, 2)?;
    Ok(buf.get_u16())
}

pub fn read_u32(buf: &mut Bytes) -> Result<u32> {
    ensure_remaining(buf, 4)?;
    Ok(buf.get_u32())
}

pub fn read_u64(buf: &mut Bytes) -> Result<u64> {
    ensure_remaining(buf, 8)?;
    Ok(buf.get_u64())
}

pub fn read_bool(buf: &mut Bytes) -> Result<bool> {
    Ok(read_u8(buf)? != 0)
}

pub fn skip(buf: &mut Bytes, count: usize) -> Result<()> {
    ensure_remaining(buf, count)?;
    buf.advance(count);
    Ok(())
}

pub fn read_short_string(buf: &mut Bytes) -> Result<String> {
    let len = read_u8(buf)? as usize;
    ensure_remaining(buf, len)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|e| DecodeError::InvalidFormat(format!("Short string is not UTF-8: {}", e)))
}

pub fn read_long_string(buf: &mut Bytes) -> Result<Bytes> {
    let len = read_u32(buf)? as usize;
    ensure_remaining(buf, len)?;
    Ok(buf.split_to(len))
}

pub fn put_short_string(dst: &mut BytesMut, value: &str) -> Result<()> {
    let len = u8::try_from(value.len()).map_err(|_| {
        DecodeError::InvalidFormat(format!(
            "Short string of {} bytes exceeds 255 bytes",
            value.len()
        ))
    })?;
    dst.put_u8(len);
    dst.put_slice(value.as_bytes());
    Ok(())
}

pub fn put_long_string(dst: &mut BytesMut, value: &[u8]) -> Result<()> {
    let len = u32::try_from(value.len()).map_err(|_| {
        DecodeError::InvalidFormat("Long string exceeds u32::MAX bytes".to_string())
    })?;
    dst.put_u32(len);
    dst.put_slice(value);
    Ok(())
}

/// Pack up to eight booleans into a single flag octet, lowest bit first.
pub fn pack_flags(flags: &[bool]) -> u8 {
    flags
        .iter()
        .enumerate()
        .fold(0u8, |acc, (bit, set)| if *set { acc | (1 << bit) } else { acc })
}

#[inline]
pub fn flag_set(flags: u8, mask: u8) -> bool {
    flags & mask == mask
}

/// A tagged field table value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Boolean(bool),
    ShortShortInt(i8),
    ShortShortUint(u8),
    ShortInt(i16),
    ShortUint(u16),
    LongInt(i32),
    LongUint(u32),
    LongLongInt(i64),
    Float(f32),
    Double(f64),
    Decimal { scale: u8, value: i32 },
    ShortString(String),
    LongString(Bytes),
    FieldTable(FieldTable),
}

impl FieldValue {
    pub fn type_tag(&self) -> u8 {
        match self {
            FieldValue::Boolean(_) => b't',
            FieldValue::ShortShortInt(_) => b'b',
            FieldValue::ShortShortUint(_) => b'B',
            FieldValue::ShortInt(_) => b's',
            FieldValue::ShortUint(_) => b'u',
            FieldValue::LongInt(_) => b'I',
            FieldValue::LongUint(_) => b'i',
            FieldValue::LongLongInt(_) => b'l',
            FieldValue::Float(_) => b'f',
            FieldValue::Double(_) => b'd',
            FieldValue::Decimal { .. } => b'D',
            FieldValue::ShortString(_) => b'z',
            FieldValue::LongString(_) => b'S',
            FieldValue::FieldTable(_) => b'F',
        }
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        Self::decode_nested(buf, 0)
    }

    /// `depth` counts the field tables enclosing this value
    fn decode_nested(buf: &mut Bytes, depth: usize) -> Result<Self> {
        let tag = read_u8(buf)?;
        let value = match tag {
            b't' => FieldValue::Boolean(read_bool(buf)?),
            b'b' => FieldValue::ShortShortInt(read_u8(buf)? as i8),
            b'B' => FieldValue::ShortShortUint(read_u8(buf)?),
            b's' => FieldValue::ShortInt(read_u16(buf)? as i16),
            b'u' => FieldValue::ShortUint(read_u16(buf)?),
            b'I' => FieldValue::LongInt(read_u32(buf)? as i32),
            b'i' => FieldValue::LongUint(read_u32(buf)?),
            b'l' => FieldValue::LongLongInt(read_u64(buf)? as i64),
            b'f' => FieldValue::Float(f32::from_bits(read_u32(buf)?)),
            b'd' => FieldValue::Double(f64::from_bits(read_u64(buf)?)),
            b'D' => FieldValue::Decimal {
                scale: read_u8(buf)?,
                value: read_u32(buf)? as i32,
            },
            b'z' => FieldValue::ShortString(read_short_string(buf)?),
            b'S' => FieldValue::LongString(read_long_string(buf)?),
            b'F' => FieldValue::FieldTable(FieldTable::decode_nested(buf, depth + 1)?),
            other => return Err(DecodeError::UnknownFieldType(other)),
        };
        Ok(value)
    }

    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        dst.put_u8(self.type_tag());
        match self {
            FieldValue::Boolean(v) => dst.put_u8(u8::from(*v)),
            FieldValue::ShortShortInt(v) => dst.put_i8(*v),
            FieldValue::ShortShortUint(v) => dst.put_u8(*v),
            FieldValue::ShortInt(v) => dst.put_i16(*v),
            FieldValue::ShortUint(v) => dst.put_u16(*v),
            FieldValue::LongInt(v) => dst.put_i32(*v),
            FieldValue::LongUint(v) => dst.put_u32(*v),
            FieldValue::LongLongInt(v) => dst.put_i64(*v),
            FieldValue::Float(v) => dst.put_f32(*v),
            FieldValue::Double(v) => dst.put_f64(*v),
            FieldValue::Decimal { scale, value } => {
                dst.put_u8(*scale);
                dst.put_i32(*value);
            }
            FieldValue::ShortString(v) => put_short_string(dst, v)?,
            FieldValue::LongString(v) => put_long_string(dst, v)?,
            FieldValue::FieldTable(v) => v.encode(dst)?,
        }
        Ok(())
    }
}

/// Field tables nested inside a field table, not counting the outermost one
pub const MAX_TABLE_DEPTH: usize = 64;

/// An AMQP field table. Keys are kept sorted so encoding is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldTable {
    entries: BTreeMap<String, FieldValue>,
}

impl FieldTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: FieldValue) -> Option<FieldValue> {
        self.entries.insert(key.into(), value)
    }

    pub fn with(mut self, key: impl Into<String>, value: FieldValue) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&FieldValue> {
        self.entries.get(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.entries.iter()
    }

    pub fn decode(buf: &mut Bytes) -> Result<Self> {
        Self::decode_nested(buf, 0)
    }

    fn decode_nested(buf: &mut Bytes, depth: usize) -> Result<Self> {
        if depth > MAX_TABLE_DEPTH {
            return Err(DecodeError::NestingTooDeep {
                max: MAX_TABLE_DEPTH,
            });
        }
        let size = read_u32(buf)? as usize;
        ensure_remaining(buf, size)?;
        let mut body = buf.split_to(size);

        let mut entries = BTreeMap::new();
        while body.has_remaining() {
            let key = read_short_string(&mut body)?;
            let value = FieldValue::decode_nested(&mut body, depth)?;
            entries.insert(key, value);
        }
        Ok(Self { entries })
    }

    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        let size_at = dst.len();
        dst.put_u32(0);
        let start = dst.len();
        for (key, value) in &self.entries {
            put_short_string(dst, key)?;
            value.encode(dst)?;
        }
        let size = u32::try_from(dst.len() - start)
            .map_err(|_| DecodeError::InvalidFormat("Field table too large".to_string()))?;
        dst[size_at..size_at + 4].copy_from_slice(&size.to_be_bytes());
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    fn encoded(table: &FieldTable) -> Bytes {
        let mut dst = BytesMut::new();
        table.encode(&mut dst).unwrap();
        dst.freeze()
    }

    #[test]
    fn test_field_table_with_nested_values() {
        let inner = FieldTable::new().with("depth", FieldValue::ShortUint(2));
        let table = FieldTable::new()
            .with("x-flag", FieldValue::Boolean(true))
            .with("x-count", FieldValue::LongLongInt(-42))
            .with("x-name", FieldValue::LongString(Bytes::from_static(b"queue-a")))
            .with("x-tag", FieldValue::ShortString("z".to_string()))
            .with("x-inner", FieldValue::FieldTable(inner));

        let mut buf = encoded(&table);
        let decoded = FieldTable::decode(&mut buf).unwrap();

        assert_eq!(decoded, table);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_field_table_size_prefix_counts_entry_bytes() {
        let table = FieldTable::new().with("a", FieldValue::Boolean(false));
        let buf = encoded(&table);

        // key "a" (1 + 1) + tag (1) + bool (1)
        assert_eq!(&buf[..4], &4u32.to_be_bytes());
        assert_eq!(buf.len(), 8);
    }

    #[test]
    fn test_unknown_field_tag_is_rejected() {
        let mut raw = BytesMut::new();
        raw.put_u32(3);
        raw.put_u8(1);
        raw.put_u8(b'k');
        raw.put_u8(b'Q');

        let err = FieldTable::decode(&mut raw.freeze()).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownFieldType(b'Q')));
    }

    #[test]
    fn test_truncated_table_reports_underrun() {
        let mut raw = BytesMut::new();
        raw.put_u32(10);
        raw.put_u8(1);

        let err = FieldTable::decode(&mut raw.freeze()).unwrap_err();
        assert!(matches!(err, DecodeError::BufferUnderrun { needed: 10, .. }));
    }

    /// A table holding `levels` tables, each wrapping the next under key "n"
    pub(crate) fn nested_tables(levels: usize) -> Bytes {
        let mut buf = BytesMut::with_capacity(levels * 7 + 4);
        for level in (1..=levels).rev() {
            // a table wrapping `level` tables spans 7 * level + 4 bytes
            buf.put_u32((7 * (level - 1) + 4 + 3) as u32);
            buf.put_u8(1);
            buf.put_u8(b'n');
            buf.put_u8(b'F');
        }
        buf.put_u32(0);
        buf.freeze()
    }

    #[test]
    fn test_nesting_limit() {
        let mut buf = nested_tables(MAX_TABLE_DEPTH);
        assert!(FieldTable::decode(&mut buf).is_ok());
        assert!(buf.is_empty());

        let err = FieldTable::decode(&mut nested_tables(MAX_TABLE_DEPTH + 1)).unwrap_err();
        assert!(matches!(err, DecodeError::NestingTooDeep { max: MAX_TABLE_DEPTH }));
    }

    #[test]
    fn test_deeply_nested_tables_fail_without_recursing_through() {
        // about 18k levels fit in a default sized frame
        let mut buf = nested_tables(18_000);
        let err = FieldTable::decode(&mut buf).unwrap_err();
        assert!(matches!(err, DecodeError::NestingTooDeep { .. }));
    }

    #[test]
    fn test_short_string_length_limit() {
        let mut dst = BytesMut::new();
        let long = "x".repeat(256);
        assert!(put_short_string(&mut dst, &long).is_err());
        assert!(put_short_string(&mut dst, &long[..255]).is_ok());
        assert_eq!(dst[0], 255);
    }

    #[test]
    fn test_pack_flags() {
        assert_eq!(pack_flags(&[true, false, true]), 0b101);
        assert!(flag_set(0b101, 0x4));
        assert!(!flag_set(0b101, 0x2));
    }
}
