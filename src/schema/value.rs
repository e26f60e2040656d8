// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Language-agnostic column values.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::entity::{Entity, Ref, TrackedRecord};
use crate::error::OrmError;

/// Unix seconds standing in for SQL `0000-00-00`.
pub const ZERO_DATE_SECONDS: i64 = -62_167_219_200;

/// Added to Unix seconds before encoding so every valid date is non-negative.
pub const TIME_BIAS: i64 = 62_167_219_200;

/// A single column value as seen by the codec, the binders and the scanners.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Set(Vec<String>),
    /// Unix seconds, UTC.
    Time(i64),
    Json(serde_json::Value),
    Ref(Reference),
    Refs(Vec<u64>),
}

/// Target of a single-reference column.
#[derive(Clone)]
pub enum Reference {
    Id(u64),
    /// Tracked entity that has no id yet; resolved during flush.
    Pending(Arc<dyn TrackedRecord>),
}

impl Reference {
    /// Current id of the target, 0 while a pending target is unsaved.
    pub fn id(&self) -> u64 {
        match self {
            Reference::Id(id) => *id,
            Reference::Pending(record) => record.id(),
        }
    }
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reference::Id(id) => write!(f, "Id({id})"),
            Reference::Pending(record) => {
                write!(f, "Pending({}#{})", record.entity_name(), record.id())
            }
        }
    }
}

impl PartialEq for Reference {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Reference::Pending(a), Reference::Pending(b)) => Arc::ptr_eq(a, b),
            _ => self.id() == other.id() && self.id() != 0,
        }
    }
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// JSON value from anything serializable; serialization failures become NULL.
    pub fn json<T: Serialize>(value: &T) -> Value {
        match serde_json::to_value(value) {
            Ok(serde_json::Value::Null) | Err(_) => Value::Null,
            Ok(v) => Value::Json(v),
        }
    }

    pub fn reference(id: u64) -> Value {
        if id == 0 {
            Value::Null
        } else {
            Value::Ref(Reference::Id(id))
        }
    }

    pub fn set<I, S>(members: I) -> Value
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Value::Set(members.into_iter().map(Into::into).collect())
    }

    pub fn date(date: NaiveDate) -> Value {
        Value::Time(date_to_seconds(date))
    }

    pub(crate) fn as_u64(&self) -> Option<u64> {
        match self {
            Value::UInt(v) => Some(*v),
            Value::Int(v) => u64::try_from(*v).ok(),
            Value::Bool(b) => Some(u64::from(*b)),
            Value::Ref(r) => Some(r.id()),
            Value::Float(f) if *f >= 0.0 && f.fract() == 0.0 => Some(*f as u64),
            _ => None,
        }
    }

    pub(crate) fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            Value::UInt(v) => i64::try_from(*v).ok(),
            Value::Bool(b) => Some(i64::from(*b)),
            Value::Time(t) => Some(*t),
            Value::Float(f) if f.fract() == 0.0 => Some(*f as i64),
            _ => None,
        }
    }

    pub(crate) fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            Value::UInt(v) => Some(*v as f64),
            _ => None,
        }
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Set(_) => "set",
            Value::Time(_) => "time",
            Value::Json(_) => "json",
            Value::Ref(_) => "ref",
            Value::Refs(_) => "refs",
        }
    }

    /// Total order used to sort rows of ordered cached indexes. NULL sorts first.
    pub fn sort_cmp(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Null, _) => Ordering::Less,
            (_, Value::Null) => Ordering::Greater,
            (Value::Str(a), Value::Str(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::Time(a), Value::Time(b)) => a.cmp(b),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(x), Some(y)) => x.total_cmp(&y),
                _ => a.type_name().cmp(b.type_name()),
            },
        }
    }
}

pub(crate) fn date_to_seconds(date: NaiveDate) -> i64 {
    date.and_hms_opt(0, 0, 0)
        .map(|dt| dt.and_utc().timestamp())
        .unwrap_or(ZERO_DATE_SECONDS)
}

macro_rules! value_from_unsigned {
    ($($t:ty),*) => {$(
        impl From<$t> for Value {
            fn from(v: $t) -> Self { Value::UInt(u64::from(v)) }
        }
    )*};
}

macro_rules! value_from_signed {
    ($($t:ty),*) => {$(
        impl From<$t> for Value {
            fn from(v: $t) -> Self { Value::Int(i64::from(v)) }
        }
    )*};
}

value_from_unsigned!(u8, u16, u32, u64);
value_from_signed!(i8, i16, i32, i64);

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::Float(f64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Time(v.timestamp())
    }
}

impl From<NaiveDate> for Value {
    fn from(v: NaiveDate) -> Self {
        Value::date(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            other => Value::Json(other),
        }
    }
}

impl<E: Entity> From<&Ref<E>> for Value {
    fn from(r: &Ref<E>) -> Self {
        r.to_value()
    }
}

impl<E: Entity> From<Ref<E>> for Value {
    fn from(r: Ref<E>) -> Self {
        r.to_value()
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Sequential reader handed to [`Entity::from_values`].
///
/// Values arrive in the same order `to_values` produced them.
pub struct ValueReader {
    entity: &'static str,
    values: std::vec::IntoIter<Value>,
    position: usize,
}

macro_rules! reader_unsigned {
    ($($name:ident, $opt:ident => $t:ty),* $(,)?) => {$(
        pub fn $name(&mut self) -> Result<$t, OrmError> {
            Ok(self.$opt()?.unwrap_or_default())
        }

        pub fn $opt(&mut self) -> Result<Option<$t>, OrmError> {
            match self.next_value()? {
                Value::Null => Ok(None),
                v => v
                    .as_u64()
                    .and_then(|n| <$t>::try_from(n).ok())
                    .map(Some)
                    .ok_or_else(|| self.mismatch(stringify!($t), &v)),
            }
        }
    )*};
}

macro_rules! reader_signed {
    ($($name:ident, $opt:ident => $t:ty),* $(,)?) => {$(
        pub fn $name(&mut self) -> Result<$t, OrmError> {
            Ok(self.$opt()?.unwrap_or_default())
        }

        pub fn $opt(&mut self) -> Result<Option<$t>, OrmError> {
            match self.next_value()? {
                Value::Null => Ok(None),
                v => v
                    .as_i64()
                    .and_then(|n| <$t>::try_from(n).ok())
                    .map(Some)
                    .ok_or_else(|| self.mismatch(stringify!($t), &v)),
            }
        }
    )*};
}

impl ValueReader {
    pub fn new(entity: &'static str, values: Vec<Value>) -> Self {
        Self {
            entity,
            values: values.into_iter(),
            position: 0,
        }
    }

    pub fn next_value(&mut self) -> Result<Value, OrmError> {
        self.position += 1;
        self.values.next().ok_or_else(|| {
            OrmError::CodecIo(format!(
                "{} has fewer columns than requested (column {})",
                self.entity, self.position
            ))
        })
    }

    fn mismatch(&self, expected: &str, found: &Value) -> OrmError {
        OrmError::CodecIo(format!(
            "{} column {}: expected {expected}, found {}",
            self.entity,
            self.position,
            found.type_name()
        ))
    }

    reader_unsigned!(
        u8, opt_u8 => u8,
        u16, opt_u16 => u16,
        u32, opt_u32 => u32,
        u64, opt_u64 => u64,
    );

    reader_signed!(
        i8, opt_i8 => i8,
        i16, opt_i16 => i16,
        i32, opt_i32 => i32,
        i64, opt_i64 => i64,
    );

    pub fn bool(&mut self) -> Result<bool, OrmError> {
        Ok(self.opt_bool()?.unwrap_or(false))
    }

    pub fn opt_bool(&mut self) -> Result<Option<bool>, OrmError> {
        match self.next_value()? {
            Value::Null => Ok(None),
            Value::Bool(b) => Ok(Some(b)),
            v => v
                .as_i64()
                .map(|n| Some(n != 0))
                .ok_or_else(|| self.mismatch("bool", &v)),
        }
    }

    pub fn f64(&mut self) -> Result<f64, OrmError> {
        Ok(self.opt_f64()?.unwrap_or(0.0))
    }

    pub fn opt_f64(&mut self) -> Result<Option<f64>, OrmError> {
        match self.next_value()? {
            Value::Null => Ok(None),
            v => v.as_f64().map(Some).ok_or_else(|| self.mismatch("float", &v)),
        }
    }

    pub fn f32(&mut self) -> Result<f32, OrmError> {
        Ok(self.f64()? as f32)
    }

    pub fn opt_f32(&mut self) -> Result<Option<f32>, OrmError> {
        Ok(self.opt_f64()?.map(|v| v as f32))
    }

    /// String column; NULL reads as the empty string.
    pub fn string(&mut self) -> Result<String, OrmError> {
        Ok(self.opt_string()?.unwrap_or_default())
    }

    pub fn opt_string(&mut self) -> Result<Option<String>, OrmError> {
        match self.next_value()? {
            Value::Null => Ok(None),
            Value::Str(s) => Ok(Some(s)),
            v => Err(self.mismatch("string", &v)),
        }
    }

    pub fn bytes(&mut self) -> Result<Vec<u8>, OrmError> {
        match self.next_value()? {
            Value::Null => Ok(Vec::new()),
            Value::Bytes(b) => Ok(b),
            Value::Str(s) => Ok(s.into_bytes()),
            v => Err(self.mismatch("bytes", &v)),
        }
    }

    pub fn set(&mut self) -> Result<Vec<String>, OrmError> {
        match self.next_value()? {
            Value::Null => Ok(Vec::new()),
            Value::Set(members) => Ok(members),
            v => Err(self.mismatch("set", &v)),
        }
    }

    /// Unix seconds of a date or datetime column.
    pub fn timestamp(&mut self) -> Result<i64, OrmError> {
        Ok(self.opt_timestamp()?.unwrap_or(ZERO_DATE_SECONDS))
    }

    pub fn opt_timestamp(&mut self) -> Result<Option<i64>, OrmError> {
        match self.next_value()? {
            Value::Null => Ok(None),
            Value::Time(t) => Ok(Some(t)),
            v => Err(self.mismatch("time", &v)),
        }
    }

    pub fn datetime(&mut self) -> Result<DateTime<Utc>, OrmError> {
        let secs = self.timestamp()?;
        self.seconds_to_datetime(secs)
    }

    pub fn opt_datetime(&mut self) -> Result<Option<DateTime<Utc>>, OrmError> {
        match self.opt_timestamp()? {
            Some(secs) => self.seconds_to_datetime(secs).map(Some),
            None => Ok(None),
        }
    }

    pub fn date(&mut self) -> Result<NaiveDate, OrmError> {
        Ok(self.datetime()?.date_naive())
    }

    pub fn opt_date(&mut self) -> Result<Option<NaiveDate>, OrmError> {
        Ok(self.opt_datetime()?.map(|dt| dt.date_naive()))
    }

    fn seconds_to_datetime(&self, secs: i64) -> Result<DateTime<Utc>, OrmError> {
        Utc.timestamp_opt(secs, 0).single().ok_or_else(|| {
            OrmError::CodecIo(format!(
                "{} column {}: {secs} is not a valid timestamp",
                self.entity, self.position
            ))
        })
    }

    pub fn json<T: DeserializeOwned + Default>(&mut self) -> Result<T, OrmError> {
        Ok(self.opt_json()?.unwrap_or_default())
    }

    pub fn opt_json<T: DeserializeOwned>(&mut self) -> Result<Option<T>, OrmError> {
        match self.next_value()? {
            Value::Null => Ok(None),
            Value::Json(v) => Ok(Some(serde_json::from_value(v)?)),
            Value::Str(s) => Ok(Some(serde_json::from_str(&s)?)),
            v => Err(self.mismatch("json", &v)),
        }
    }

    /// Single reference; unresolved targets come back as [`Ref::Id`].
    pub fn reference<E: Entity>(&mut self) -> Result<Option<Ref<E>>, OrmError> {
        match self.next_value()? {
            Value::Null => Ok(None),
            v => match v.as_u64() {
                Some(0) => Ok(None),
                Some(id) => Ok(Some(Ref::Id(id))),
                None => Err(self.mismatch("ref", &v)),
            },
        }
    }

    pub fn references(&mut self) -> Result<Vec<u64>, OrmError> {
        match self.next_value()? {
            Value::Null => Ok(Vec::new()),
            Value::Refs(ids) => Ok(ids),
            v => Err(self.mismatch("refs", &v)),
        }
    }
}
