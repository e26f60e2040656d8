// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Compact binary encoding for row images.
//!
//! Primitives:
//! - unsigned integers: LEB128
//! - signed integers: zig-zag LEB128
//! - floats: the IEEE-754 bit pattern written as an unsigned varint
//! - booleans: one byte, `0x00` / `0x01`
//! - strings and blobs: unsigned varint length, then the bytes
//!
//! Row-level encoding, decoding and dirty diffing live in [`row`].

pub mod row;

use std::fmt;

use crate::error::OrmError;

pub use row::{decode_row, diff, encode_row, encode_segments, Diff, Row};

/// Growable output buffer for the varint encoding.
#[derive(Debug, Default, Clone)]
pub struct Serializer {
    buf: Vec<u8>,
}

impl Serializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn write_unsigned(&mut self, mut value: u64) {
        while value >= 0x80 {
            self.buf.push((value as u8 & 0x7f) | 0x80);
            value >>= 7;
        }
        self.buf.push(value as u8);
    }

    pub fn write_signed(&mut self, value: i64) {
        self.write_unsigned(((value << 1) ^ (value >> 63)) as u64);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(u8::from(value));
    }

    pub fn write_float(&mut self, value: f64) {
        self.write_unsigned(value.to_bits());
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    pub fn write_bytes(&mut self, value: &[u8]) {
        self.write_unsigned(value.len() as u64);
        self.buf.extend_from_slice(value);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over an encoded buffer.
#[derive(Debug, Clone)]
pub struct Deserializer<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Deserializer<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_exhausted(&self) -> bool {
        self.pos >= self.buf.len()
    }

    pub fn read_unsigned(&mut self) -> Result<u64, OrmError> {
        let mut result: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = *self
                .buf
                .get(self.pos)
                .ok_or_else(|| {
                    OrmError::CodecIo(format!("truncated varint at byte {}", self.pos))
                })?;
            self.pos += 1;
            if shift == 63 && byte > 1 {
                return Err(OrmError::CodecIo("varint overflows 64 bits".into()));
            }
            result |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
            if shift > 63 {
                return Err(OrmError::CodecIo("varint overflows 64 bits".into()));
            }
        }
    }

    pub fn read_signed(&mut self) -> Result<i64, OrmError> {
        let raw = self.read_unsigned()?;
        Ok(((raw >> 1) as i64) ^ -((raw & 1) as i64))
    }

    pub fn read_bool(&mut self) -> Result<bool, OrmError> {
        match self.take(1)?[0] {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(OrmError::CodecIo(format!("invalid bool byte {other:#04x}"))),
        }
    }

    pub fn read_float(&mut self) -> Result<f64, OrmError> {
        Ok(f64::from_bits(self.read_unsigned()?))
    }

    pub fn read_string(&mut self) -> Result<String, OrmError> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|e| OrmError::CodecIo(format!("invalid utf-8: {e}")))
    }

    pub fn read_bytes(&mut self) -> Result<Vec<u8>, OrmError> {
        let len = usize::try_from(self.read_unsigned()?)
            .map_err(|_| OrmError::CodecIo("length does not fit in memory".into()))?;
        Ok(self.take(len)?.to_vec())
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], OrmError> {
        if self.remaining() < len {
            return Err(OrmError::CodecIo(format!(
                "truncated buffer: need {len} bytes at {}, have {}",
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }
}

/// A single SQL parameter, already converted from the entity's value.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Null,
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl BindValue {
    pub fn is_null(&self) -> bool {
        matches!(self, BindValue::Null)
    }

    /// Literal form without quoting, as used in attribute hashes and async payloads.
    pub fn literal(&self) -> String {
        match self {
            BindValue::Null => "NULL".to_string(),
            BindValue::Int(v) => v.to_string(),
            BindValue::UInt(v) => v.to_string(),
            BindValue::Float(v) => v.to_string(),
            BindValue::Text(v) => v.clone(),
            BindValue::Bytes(v) => hex::encode(v),
        }
    }
}

/// Parameter preview for query logs.
impl fmt::Display for BindValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindValue::Null => f.write_str("NULL"),
            BindValue::Int(v) => write!(f, "{v}"),
            BindValue::UInt(v) => write!(f, "{v}"),
            BindValue::Float(v) => write!(f, "{v}"),
            BindValue::Text(v) => write!(f, "'{}'", v.replace('\'', "''")),
            BindValue::Bytes(v) => write!(f, "x'{}'", hex::encode(v)),
        }
    }
}

/// Ordered column → bind value mapping.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindMap {
    entries: Vec<(String, BindValue)>,
}

impl BindMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace, keeping first-insertion order.
    pub fn insert(&mut self, column: impl Into<String>, value: BindValue) {
        let column = column.into();
        match self.entries.iter_mut().find(|(c, _)| *c == column) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((column, value)),
        }
    }

    pub fn get(&self, column: &str) -> Option<&BindValue> {
        self.entries.iter().find(|(c, _)| c == column).map(|(_, v)| v)
    }

    pub fn contains(&self, column: &str) -> bool {
        self.get(column).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &BindValue)> {
        self.entries.iter().map(|(c, v)| (c.as_str(), v))
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(c, _)| c.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &BindValue> {
        self.entries.iter().map(|(_, v)| v)
    }

    /// Copy of `self` with every entry of `other` applied on top.
    pub fn overlay(&self, other: &BindMap) -> BindMap {
        let mut merged = self.clone();
        for (column, value) in other.iter() {
            merged.insert(column, value.clone());
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsigned_varint_layout() {
        let mut s = Serializer::new();
        s.write_unsigned(0);
        s.write_unsigned(127);
        s.write_unsigned(128);
        s.write_unsigned(300);
        assert_eq!(s.as_slice(), &[0x00, 0x7f, 0x80, 0x01, 0xac, 0x02]);
    }

    #[test]
    fn test_signed_zigzag() {
        let mut s = Serializer::new();
        for v in [0i64, -1, 1, -2, i64::MIN, i64::MAX] {
            s.write_signed(v);
        }
        assert_eq!(&s.as_slice()[..4], &[0x00, 0x01, 0x02, 0x03]);

        let bytes = s.into_bytes();
        let mut d = Deserializer::new(&bytes);
        for v in [0i64, -1, 1, -2, i64::MIN, i64::MAX] {
            assert_eq!(d.read_signed().unwrap(), v);
        }
        assert!(d.is_exhausted());
    }

    #[test]
    fn test_mixed_primitives() {
        let mut s = Serializer::new();
        s.write_bool(true);
        s.write_float(-0.5);
        s.write_string("héllo");
        s.write_bytes(&[1, 2, 3]);
        s.write_unsigned(u64::MAX);

        let bytes = s.into_bytes();
        let mut d = Deserializer::new(&bytes);
        assert!(d.read_bool().unwrap());
        assert_eq!(d.read_float().unwrap(), -0.5);
        assert_eq!(d.read_string().unwrap(), "héllo");
        assert_eq!(d.read_bytes().unwrap(), vec![1, 2, 3]);
        assert_eq!(d.read_unsigned().unwrap(), u64::MAX);
    }

    #[test]
    fn test_truncated_buffer_is_codec_io() {
        let mut s = Serializer::new();
        s.write_string("abcdef");
        let bytes = s.into_bytes();
        let mut d = Deserializer::new(&bytes[..3]);
        assert!(matches!(d.read_string(), Err(OrmError::CodecIo(_))));

        let mut d = Deserializer::new(&[0x80, 0x80]);
        assert!(matches!(d.read_unsigned(), Err(OrmError::CodecIo(_))));
    }

    #[test]
    fn test_overlong_varint_rejected() {
        let bytes = [0xff; 11];
        let mut d = Deserializer::new(&bytes);
        assert!(matches!(d.read_unsigned(), Err(OrmError::CodecIo(_))));
    }

    #[test]
    fn test_invalid_bool_byte() {
        let mut d = Deserializer::new(&[0x02]);
        assert!(d.read_bool().is_err());
    }

    #[test]
    fn test_bind_map_overlay_keeps_order() {
        let mut old = BindMap::new();
        old.insert("Name", BindValue::Text("Tom".into()));
        old.insert("Age", BindValue::UInt(30));
        let mut new = BindMap::new();
        new.insert("Age", BindValue::UInt(31));

        let merged = old.overlay(&new);
        let cols: Vec<_> = merged.columns().collect();
        assert_eq!(cols, vec!["Name", "Age"]);
        assert_eq!(merged.get("Age"), Some(&BindValue::UInt(31)));
    }

    #[test]
    fn test_bind_value_display_quotes_text() {
        assert_eq!(BindValue::Text("O'Hara".into()).to_string(), "'O''Hara'");
        assert_eq!(BindValue::Null.to_string(), "NULL");
        assert_eq!(BindValue::Bytes(vec![0xab]).to_string(), "x'ab'");
    }
}
