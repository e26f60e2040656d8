// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Column descriptors.
//!
//! A [`FieldDescriptor`] is everything the engine knows about one column:
//! its logical kind, nullability and shape hints. The codec, the binders,
//! the scanners and the DDL generator all dispatch on it, so a column's
//! behaviour is defined in exactly one place.

use std::sync::Arc;

use chrono::{TimeZone, Utc};
use sqlx::any::AnyRow;
use sqlx::Row as _;

use super::search::SearchFieldOptions;
use super::value::{Reference, Value, TIME_BIAS, ZERO_DATE_SECONDS};
use crate::codec::{BindValue, Deserializer, Serializer};
use crate::error::OrmError;
use crate::storage::sql::Dialect;

const SECONDS_PER_DAY: i64 = 86_400;

/// Logical column type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FieldKind {
    UInt8,
    UInt16,
    UInt24,
    UInt32,
    UInt64,
    Int8,
    Int16,
    Int24,
    Int32,
    Int64,
    Bool,
    Float32,
    Float64,
    String,
    /// Named enum declared on the registry.
    Enum(String),
    /// Multi-valued enum.
    Set(String),
    Bytes,
    Date,
    DateTime,
    Json,
    /// Single reference to the named entity.
    Ref(String),
    /// Ordered list of references to the named entity.
    Refs(String),
}

impl FieldKind {
    pub fn reference(entity: &str) -> Self {
        FieldKind::Ref(entity.to_string())
    }

    pub fn references(entity: &str) -> Self {
        FieldKind::Refs(entity.to_string())
    }

    pub fn enumeration(name: &str) -> Self {
        FieldKind::Enum(name.to_string())
    }

    pub fn set(name: &str) -> Self {
        FieldKind::Set(name.to_string())
    }

    fn unsigned_max(&self) -> Option<u64> {
        match self {
            FieldKind::UInt8 => Some(u64::from(u8::MAX)),
            FieldKind::UInt16 => Some(u64::from(u16::MAX)),
            FieldKind::UInt24 => Some(16_777_215),
            FieldKind::UInt32 => Some(u64::from(u32::MAX)),
            FieldKind::UInt64 => Some(u64::MAX),
            _ => None,
        }
    }

    fn signed_range(&self) -> Option<(i64, i64)> {
        match self {
            FieldKind::Int8 => Some((i64::from(i8::MIN), i64::from(i8::MAX))),
            FieldKind::Int16 => Some((i64::from(i16::MIN), i64::from(i16::MAX))),
            FieldKind::Int24 => Some((-8_388_608, 8_388_607)),
            FieldKind::Int32 => Some((i64::from(i32::MIN), i64::from(i32::MAX))),
            FieldKind::Int64 => Some((i64::MIN, i64::MAX)),
            _ => None,
        }
    }

    pub(crate) fn is_float(&self) -> bool {
        matches!(self, FieldKind::Float32 | FieldKind::Float64)
    }

    pub(crate) fn is_time(&self) -> bool {
        matches!(self, FieldKind::Date | FieldKind::DateTime)
    }

    /// Kinds that can be declared nullable; the rest are governed by their own
    /// empty-value rules.
    pub(crate) fn supports_nullable(&self) -> bool {
        self.unsigned_max().is_some()
            || self.signed_range().is_some()
            || self.is_float()
            || self.is_time()
            || matches!(self, FieldKind::Bool)
    }
}

/// Declared enum: ordered string constants with stable 1-based indexes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnumDefinition {
    name: String,
    values: Vec<String>,
}

impl EnumDefinition {
    pub fn new<I, S>(name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn index_of(&self, value: &str) -> Option<usize> {
        self.values.iter().position(|v| v == value).map(|i| i + 1)
    }

    pub fn value_at(&self, index: usize) -> Option<&str> {
        index
            .checked_sub(1)
            .and_then(|i| self.values.get(i))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlobSize {
    #[default]
    Blob,
    Medium,
    Long,
}

/// One non-ID column.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldDescriptor {
    pub(crate) name: String,
    pub(crate) kind: FieldKind,
    pub(crate) nullable: bool,
    pub(crate) required: bool,
    pub(crate) length: Option<u32>,
    pub(crate) precision: Option<u32>,
    pub(crate) decimal: Option<(u32, u32)>,
    pub(crate) unsigned: bool,
    pub(crate) year: bool,
    pub(crate) blob: BlobSize,
    pub(crate) enum_def: Option<Arc<EnumDefinition>>,
    pub(crate) cached_reference: bool,
    pub(crate) search: Option<SearchFieldOptions>,
}

impl FieldDescriptor {
    pub(crate) fn new(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            nullable: false,
            required: false,
            length: None,
            precision: None,
            decimal: None,
            unsigned: false,
            year: false,
            blob: BlobSize::default(),
            enum_def: None,
            cached_reference: false,
            search: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    pub fn is_nullable(&self) -> bool {
        self.nullable
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    /// Whether the column can hold NULL: declared nullable, or mapped to a
    /// NULL-able type (required strings and sets, enums, blobs, JSON and
    /// references).
    pub(crate) fn admits_null(&self) -> bool {
        self.nullable
            || match &self.kind {
                FieldKind::String | FieldKind::Set(_) => self.required,
                FieldKind::Enum(_)
                | FieldKind::Bytes
                | FieldKind::Json
                | FieldKind::Ref(_)
                | FieldKind::Refs(_) => true,
                _ => false,
            }
    }

    /// Decimal places used by float comparison.
    pub fn precision(&self) -> u32 {
        match (self.decimal, self.precision) {
            (_, Some(p)) => p,
            (Some((_, scale)), None) => scale,
            (None, None) if self.kind == FieldKind::Float32 => 4,
            (None, None) => 8,
        }
    }

    /// Whether the column is stored with a leading nil flag.
    fn has_nil_flag(&self) -> bool {
        self.nullable
            || matches!(
                self.kind,
                FieldKind::String
                    | FieldKind::Set(_)
                    | FieldKind::Bytes
                    | FieldKind::Json
                    | FieldKind::Refs(_)
            )
    }

    pub(crate) fn structure_code(&self) -> String {
        let enum_values = self
            .enum_def
            .as_ref()
            .map(|e| e.values().join("|"))
            .unwrap_or_default();
        format!(
            "{}:{:?}:{}:{}:{}",
            self.name,
            self.kind,
            u8::from(self.nullable),
            u8::from(self.required),
            enum_values
        )
    }

    fn type_error(&self, value: &Value) -> OrmError {
        OrmError::InvalidArgument(format!(
            "value {value:?} does not fit column '{}' of kind {:?}",
            self.name, self.kind
        ))
    }

    fn enum_def(&self) -> Result<&EnumDefinition, OrmError> {
        self.enum_def.as_deref().ok_or_else(|| {
            OrmError::InvalidArgument(format!("enum of column '{}' is not resolved", self.name))
        })
    }

    fn check_enum(&self, member: &str) -> Result<usize, OrmError> {
        self.enum_def()?
            .index_of(member)
            .ok_or_else(|| OrmError::EnumUnknown {
                field: self.name.clone(),
                value: member.to_string(),
            })
    }

    /// Canonical form of an application value for this column.
    ///
    /// Everything downstream (encoding, diffing, binding) assumes its input
    /// went through here.
    pub fn normalize(&self, value: Value) -> Result<Value, OrmError> {
        let null_default = |fallback: Value| {
            if self.nullable {
                Value::Null
            } else {
                fallback
            }
        };

        match &self.kind {
            kind if kind.unsigned_max().is_some() => match value {
                Value::Null => Ok(null_default(Value::UInt(0))),
                v => match v.as_u64() {
                    Some(n) if kind.unsigned_max().is_some_and(|max| n <= max) => {
                        Ok(Value::UInt(n))
                    }
                    _ => Err(self.type_error(&v)),
                },
            },
            kind if kind.signed_range().is_some() => match value {
                Value::Null => Ok(null_default(Value::Int(0))),
                v => match (v.as_i64(), kind.signed_range()) {
                    (Some(n), Some((min, max))) if n >= min && n <= max => Ok(Value::Int(n)),
                    _ => Err(self.type_error(&v)),
                },
            },
            FieldKind::Bool => match value {
                Value::Null => Ok(null_default(Value::Bool(false))),
                Value::Bool(b) => Ok(Value::Bool(b)),
                v => v
                    .as_i64()
                    .map(|n| Value::Bool(n != 0))
                    .ok_or_else(|| self.type_error(&v)),
            },
            FieldKind::Float32 | FieldKind::Float64 => match value {
                Value::Null => Ok(null_default(Value::Float(0.0))),
                v => v.as_f64().map(Value::Float).ok_or_else(|| self.type_error(&v)),
            },
            FieldKind::String => match value {
                Value::Str(s) if s.is_empty() && self.required => Ok(Value::Null),
                Value::Null if !self.required => Ok(Value::Str(String::new())),
                v @ (Value::Str(_) | Value::Null) => Ok(v),
                v => Err(self.type_error(&v)),
            },
            FieldKind::Enum(_) => match value {
                Value::Null => Ok(Value::Null),
                Value::Str(s) if s.is_empty() => Ok(Value::Null),
                Value::Str(s) => {
                    self.check_enum(&s)?;
                    Ok(Value::Str(s))
                }
                v => Err(self.type_error(&v)),
            },
            FieldKind::Set(_) => {
                let members = match value {
                    Value::Null => Vec::new(),
                    Value::Set(members) => members,
                    Value::Str(s) => s
                        .split(',')
                        .filter(|m| !m.is_empty())
                        .map(str::to_string)
                        .collect(),
                    v => return Err(self.type_error(&v)),
                };
                let mut indexed = Vec::with_capacity(members.len());
                for member in members {
                    indexed.push((self.check_enum(&member)?, member));
                }
                indexed.sort_by_key(|(i, _)| *i);
                indexed.dedup_by_key(|(i, _)| *i);
                if indexed.is_empty() && self.required {
                    Ok(Value::Null)
                } else {
                    Ok(Value::Set(indexed.into_iter().map(|(_, m)| m).collect()))
                }
            }
            FieldKind::Bytes => match value {
                Value::Null => Ok(Value::Null),
                Value::Bytes(b) if b.is_empty() => Ok(Value::Null),
                Value::Bytes(b) => Ok(Value::Bytes(b)),
                Value::Str(s) if s.is_empty() => Ok(Value::Null),
                Value::Str(s) => Ok(Value::Bytes(s.into_bytes())),
                v => Err(self.type_error(&v)),
            },
            FieldKind::Date => match value {
                Value::Null => Ok(null_default(Value::Time(ZERO_DATE_SECONDS))),
                Value::Time(t) if t == ZERO_DATE_SECONDS => Ok(Value::Time(t)),
                Value::Time(t) => Ok(Value::Time(t - t.rem_euclid(SECONDS_PER_DAY))),
                v => Err(self.type_error(&v)),
            },
            FieldKind::DateTime => match value {
                Value::Null => Ok(null_default(Value::Time(ZERO_DATE_SECONDS))),
                Value::Time(t) => Ok(Value::Time(t)),
                v => Err(self.type_error(&v)),
            },
            FieldKind::Json => match value {
                Value::Null | Value::Json(serde_json::Value::Null) => Ok(Value::Null),
                Value::Json(v) => Ok(Value::Json(v)),
                Value::Str(s) if s.is_empty() => Ok(Value::Null),
                Value::Str(s) => Ok(Value::from(serde_json::from_str::<serde_json::Value>(&s)?)),
                v => Err(self.type_error(&v)),
            },
            FieldKind::Ref(_) => match value {
                Value::Null => Ok(Value::Null),
                Value::Ref(Reference::Pending(record)) => match record.id() {
                    0 => Ok(Value::Ref(Reference::Pending(record))),
                    id => Ok(Value::reference(id)),
                },
                v => v.as_u64().map(Value::reference).ok_or_else(|| self.type_error(&v)),
            },
            FieldKind::Refs(_) => match value {
                Value::Null => Ok(Value::Null),
                Value::Refs(ids) => {
                    let ids: Vec<u64> = ids.into_iter().filter(|id| *id != 0).collect();
                    Ok(if ids.is_empty() { Value::Null } else { Value::Refs(ids) })
                }
                v => Err(self.type_error(&v)),
            },
            _ => Err(self.type_error(&value)),
        }
    }

    fn unresolved(&self) -> OrmError {
        OrmError::InvalidArgument(format!(
            "reference column '{}' points at an entity without an id",
            self.name
        ))
    }

    /// Append this column's encoding of a normalized value.
    pub(crate) fn encode(&self, out: &mut Serializer, value: &Value) -> Result<(), OrmError> {
        if self.has_nil_flag() {
            out.write_bool(!value.is_null());
            if value.is_null() {
                return Ok(());
            }
        }

        match (&self.kind, value) {
            (FieldKind::Enum(_), Value::Null) | (FieldKind::Ref(_), Value::Null) => {
                out.write_unsigned(0)
            }
            (FieldKind::Enum(_), Value::Str(s)) => out.write_unsigned(self.check_enum(s)? as u64),
            (FieldKind::Ref(_), Value::Ref(r)) => match r.id() {
                0 => return Err(self.unresolved()),
                id => out.write_unsigned(id),
            },
            (FieldKind::Set(_), Value::Set(members)) => {
                out.write_unsigned(members.len() as u64);
                for member in members {
                    out.write_unsigned(self.check_enum(member)? as u64);
                }
            }
            (FieldKind::Refs(_), Value::Refs(ids)) => {
                out.write_unsigned(ids.len() as u64);
                for id in ids {
                    out.write_unsigned(*id);
                }
            }
            (_, Value::UInt(v)) => out.write_unsigned(*v),
            (_, Value::Int(v)) => out.write_signed(*v),
            (_, Value::Bool(v)) => out.write_bool(*v),
            (_, Value::Float(v)) => out.write_float(*v),
            (_, Value::Str(v)) => out.write_string(v),
            (_, Value::Bytes(v)) => out.write_bytes(v),
            (_, Value::Time(v)) => out.write_signed(v.saturating_add(TIME_BIAS)),
            (_, Value::Json(v)) => out.write_string(&v.to_string()),
            (_, v) => return Err(self.type_error(v)),
        }
        Ok(())
    }

    pub(crate) fn decode(&self, input: &mut Deserializer<'_>) -> Result<Value, OrmError> {
        if self.has_nil_flag() && !input.read_bool()? {
            return Ok(Value::Null);
        }

        Ok(match &self.kind {
            kind if kind.unsigned_max().is_some() => Value::UInt(input.read_unsigned()?),
            kind if kind.signed_range().is_some() => Value::Int(input.read_signed()?),
            FieldKind::Bool => Value::Bool(input.read_bool()?),
            FieldKind::Float32 | FieldKind::Float64 => Value::Float(input.read_float()?),
            FieldKind::String => Value::Str(input.read_string()?),
            FieldKind::Enum(_) => match input.read_unsigned()? {
                0 => Value::Null,
                index => {
                    let index = index as usize;
                    let member = self.enum_def()?.value_at(index).ok_or_else(|| {
                        OrmError::CodecIo(format!(
                            "enum index {index} out of range for '{}'",
                            self.name
                        ))
                    })?;
                    Value::Str(member.to_string())
                }
            },
            FieldKind::Set(_) => {
                let count = input.read_unsigned()?;
                let definition = self.enum_def()?;
                let mut members = Vec::new();
                for _ in 0..count {
                    let index = input.read_unsigned()? as usize;
                    let member = definition.value_at(index).ok_or_else(|| {
                        OrmError::CodecIo(format!(
                            "set index {index} out of range for '{}'",
                            self.name
                        ))
                    })?;
                    members.push(member.to_string());
                }
                Value::Set(members)
            }
            FieldKind::Bytes => Value::Bytes(input.read_bytes()?),
            FieldKind::Date | FieldKind::DateTime => {
                Value::Time(input.read_signed()?.saturating_sub(TIME_BIAS))
            }
            FieldKind::Json => {
                let raw = input.read_string()?;
                Value::Json(
                    serde_json::from_str(&raw).map_err(|e| {
                        OrmError::CodecIo(format!("invalid json in '{}': {e}", self.name))
                    })?,
                )
            }
            FieldKind::Ref(_) => Value::reference(input.read_unsigned()?),
            FieldKind::Refs(_) => {
                let count = input.read_unsigned()?;
                let mut ids = Vec::new();
                for _ in 0..count {
                    ids.push(input.read_unsigned()?);
                }
                Value::Refs(ids)
            }
            _ => return Err(OrmError::CodecIo(format!("unsupported kind for '{}'", self.name))),
        })
    }

    /// Dirty-check equality between two normalized values.
    pub(crate) fn equal(&self, old: &Value, new: &Value) -> bool {
        match (old, new) {
            (Value::Float(a), Value::Float(b)) => {
                let tolerance = 10f64.powi(-(self.precision() as i32));
                (a - b).abs() < tolerance
            }
            (a, b) => a == b,
        }
    }

    /// SQL parameter for a normalized value.
    pub fn bind(&self, value: &Value) -> Result<BindValue, OrmError> {
        Ok(match value {
            Value::Null => BindValue::Null,
            Value::Bool(b) => BindValue::Int(i64::from(*b)),
            Value::Int(v) => BindValue::Int(*v),
            Value::UInt(v) => BindValue::UInt(*v),
            Value::Float(v) => BindValue::Float(*v),
            Value::Str(v) => BindValue::Text(v.clone()),
            Value::Set(members) => BindValue::Text(members.join(",")),
            Value::Bytes(v) => BindValue::Bytes(v.clone()),
            Value::Time(secs) => BindValue::Text(self.format_time(*secs)),
            Value::Json(v) => BindValue::Text(v.to_string()),
            Value::Ref(r) => match r.id() {
                0 => return Err(self.unresolved()),
                id => BindValue::UInt(id),
            },
            Value::Refs(ids) => BindValue::Text(serde_json::to_string(ids)?),
        })
    }

    fn format_time(&self, secs: i64) -> String {
        let date_only = self.kind == FieldKind::Date;
        if secs == ZERO_DATE_SECONDS {
            return if date_only {
                "0000-00-00".to_string()
            } else {
                "0000-00-00 00:00:00".to_string()
            };
        }
        match Utc.timestamp_opt(secs, 0).single() {
            Some(dt) if date_only => dt.format("%Y-%m-%d").to_string(),
            Some(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
            None => "0000-00-00 00:00:00".to_string(),
        }
    }

    /// Read this column from a result row produced by the schema's projection.
    pub(crate) fn scan(&self, row: &AnyRow, idx: usize) -> Result<Value, OrmError> {
        let raw = match &self.kind {
            kind if kind.unsigned_max().is_some() || kind.signed_range().is_some() => {
                scan_i64(row, idx)?.map_or(Value::Null, |n| {
                    if kind.unsigned_max().is_some() {
                        u64::try_from(n).map_or(Value::Int(n), Value::UInt)
                    } else {
                        Value::Int(n)
                    }
                })
            }
            FieldKind::Bool => scan_i64(row, idx)?.map_or(Value::Null, |n| Value::Bool(n != 0)),
            FieldKind::Float32 | FieldKind::Float64 => {
                scan_f64(row, idx)?.map_or(Value::Null, Value::Float)
            }
            FieldKind::String | FieldKind::Enum(_) | FieldKind::Set(_) => {
                scan_string(row, idx)?.map_or(Value::Null, Value::Str)
            }
            FieldKind::Bytes => scan_bytes(row, idx)?.map_or(Value::Null, Value::Bytes),
            FieldKind::Date | FieldKind::DateTime => match scan_i64(row, idx)? {
                None => Value::Null,
                Some(0) if !self.nullable => Value::Time(ZERO_DATE_SECONDS),
                Some(secs) => Value::Time(secs),
            },
            FieldKind::Json => scan_string(row, idx)?.map_or(Value::Null, Value::Str),
            FieldKind::Ref(_) => scan_i64(row, idx)?
                .map_or(Value::Null, |n| Value::reference(u64::try_from(n).unwrap_or(0))),
            FieldKind::Refs(_) => match scan_string(row, idx)? {
                None => Value::Null,
                Some(s) if s.is_empty() => Value::Null,
                Some(s) => Value::Refs(serde_json::from_str(&s)?),
            },
            _ => Value::Null,
        };
        self.normalize(raw)
    }

    /// `SELECT` projection expression for this column.
    pub(crate) fn projection(&self, dialect: Dialect) -> String {
        let column = format!("`{}`", self.name);
        match (&self.kind, dialect) {
            (kind, Dialect::MySql) if kind.is_time() => format!("UNIX_TIMESTAMP({column})"),
            (kind, Dialect::Sqlite) if kind.is_time() => {
                format!("CAST(strftime('%s', {column}) AS INTEGER)")
            }
            (_, Dialect::MySql) if self.decimal.is_some() => format!("CAST({column} AS DOUBLE)"),
            _ => column,
        }
    }

    /// Column type and nullability for `CREATE TABLE` / `ADD COLUMN`.
    pub(crate) fn column_definition(&self, dialect: Dialect) -> String {
        let name = &self.name;
        match dialect {
            Dialect::MySql => format!("`{name}` {}", self.mysql_type()),
            Dialect::Sqlite => format!("`{name}` {}", self.sqlite_type()),
        }
    }

    fn null_clause(&self, default: &str) -> String {
        if self.nullable {
            "DEFAULT NULL".to_string()
        } else {
            format!("NOT NULL DEFAULT {default}")
        }
    }

    fn mysql_type(&self) -> String {
        let unsigned = |base: &str| format!("{base} unsigned {}", self.null_clause("'0'"));
        let signed = |base: &str| format!("{base} {}", self.null_clause("'0'"));
        match &self.kind {
            FieldKind::UInt16 if self.year => format!("year(4) {}", self.null_clause("'0000'")),
            FieldKind::UInt8 => unsigned("tinyint(3)"),
            FieldKind::UInt16 => unsigned("smallint(5)"),
            FieldKind::UInt24 => unsigned("mediumint(8)"),
            FieldKind::UInt32 => unsigned("int(10)"),
            FieldKind::UInt64 => unsigned("bigint(20)"),
            FieldKind::Int8 => signed("tinyint(4)"),
            FieldKind::Int16 => signed("smallint(6)"),
            FieldKind::Int24 => signed("mediumint(9)"),
            FieldKind::Int32 => signed("int(11)"),
            FieldKind::Int64 => signed("bigint(20)"),
            FieldKind::Bool => signed("tinyint(1)"),
            FieldKind::Float32 | FieldKind::Float64 => {
                let base = match (self.decimal, &self.kind) {
                    (Some((m, d)), _) => format!("decimal({m},{d})"),
                    (None, FieldKind::Float32) => "float".to_string(),
                    (None, _) => "double".to_string(),
                };
                let sign = if self.unsigned { " unsigned" } else { "" };
                format!("{base}{sign} {}", self.null_clause("'0'"))
            }
            FieldKind::String => {
                let base = match self.length {
                    Some(0) => "mediumtext".to_string(),
                    Some(n) if n > 65_535 => "longtext".to_string(),
                    Some(n) => format!("varchar({n})"),
                    None => "varchar(255)".to_string(),
                };
                if self.required {
                    format!("{base} DEFAULT NULL")
                } else if base.ends_with("text") {
                    format!("{base} NOT NULL")
                } else {
                    format!("{base} NOT NULL DEFAULT ''")
                }
            }
            FieldKind::Enum(_) | FieldKind::Set(_) => {
                let keyword = if matches!(self.kind, FieldKind::Enum(_)) { "enum" } else { "set" };
                let members = self
                    .enum_def
                    .as_ref()
                    .map(|e| {
                        e.values()
                            .iter()
                            .map(|v| format!("'{}'", v.replace('\'', "''")))
                            .collect::<Vec<_>>()
                            .join(",")
                    })
                    .unwrap_or_default();
                if matches!(self.kind, FieldKind::Set(_)) && !self.required {
                    format!("{keyword}({members}) NOT NULL DEFAULT ''")
                } else {
                    format!("{keyword}({members}) DEFAULT NULL")
                }
            }
            FieldKind::Bytes => match self.blob {
                BlobSize::Blob => "blob".to_string(),
                BlobSize::Medium => "mediumblob".to_string(),
                BlobSize::Long => "longblob".to_string(),
            },
            FieldKind::Date => format!("date {}", self.time_null_clause()),
            FieldKind::DateTime => format!("datetime {}", self.time_null_clause()),
            FieldKind::Json => "json DEFAULT NULL".to_string(),
            FieldKind::Ref(_) => "bigint(20) unsigned DEFAULT NULL".to_string(),
            FieldKind::Refs(_) => "text DEFAULT NULL".to_string(),
        }
    }

    fn time_null_clause(&self) -> &'static str {
        if self.nullable {
            "DEFAULT NULL"
        } else {
            "NOT NULL"
        }
    }

    fn sqlite_type(&self) -> String {
        let base = match &self.kind {
            kind if kind.unsigned_max().is_some() || kind.signed_range().is_some() => "INTEGER",
            FieldKind::Bool | FieldKind::Ref(_) => "INTEGER",
            FieldKind::Float32 | FieldKind::Float64 => "REAL",
            FieldKind::Bytes => "BLOB",
            _ => "TEXT",
        };
        let not_null = match &self.kind {
            FieldKind::String | FieldKind::Set(_) => !self.required,
            kind if kind.supports_nullable() => !self.nullable,
            _ => false,
        };
        let default = match &self.kind {
            FieldKind::String | FieldKind::Set(_) => " DEFAULT ''",
            kind if kind.is_time() => "",
            _ if not_null => " DEFAULT 0",
            _ => "",
        };
        if not_null {
            format!("{base} NOT NULL{default}")
        } else {
            base.to_string()
        }
    }
}

fn scan_error(idx: usize, err: sqlx::Error) -> OrmError {
    OrmError::CodecIo(format!("cannot read column {idx}: {err}"))
}

pub(crate) fn scan_i64(row: &AnyRow, idx: usize) -> Result<Option<i64>, OrmError> {
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return Ok(v);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(idx) {
        return Ok(v.map(i64::from));
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return Ok(v.map(|f| f as i64));
    }
    match row.try_get::<Option<String>, _>(idx) {
        Ok(None) => Ok(None),
        Ok(Some(s)) => s
            .trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|e| OrmError::CodecIo(format!("column {idx} is not an integer: {e}"))),
        Err(e) => Err(scan_error(idx, e)),
    }
}

pub(crate) fn scan_f64(row: &AnyRow, idx: usize) -> Result<Option<f64>, OrmError> {
    if let Ok(v) = row.try_get::<Option<f64>, _>(idx) {
        return Ok(v);
    }
    if let Ok(v) = row.try_get::<Option<f32>, _>(idx) {
        return Ok(v.map(f64::from));
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(idx) {
        return Ok(v.map(|n| n as f64));
    }
    match scan_string(row, idx)? {
        None => Ok(None),
        Some(s) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|e| OrmError::CodecIo(format!("column {idx} is not a number: {e}"))),
    }
}

/// Text columns may arrive as BLOB through the `Any` driver.
pub(crate) fn scan_string(row: &AnyRow, idx: usize) -> Result<Option<String>, OrmError> {
    if let Ok(v) = row.try_get::<Option<String>, _>(idx) {
        return Ok(v);
    }
    match row.try_get::<Option<Vec<u8>>, _>(idx) {
        Ok(None) => Ok(None),
        Ok(Some(bytes)) => String::from_utf8(bytes)
            .map(Some)
            .map_err(|e| OrmError::CodecIo(format!("column {idx} is not utf-8: {e}"))),
        Err(e) => Err(scan_error(idx, e)),
    }
}

pub(crate) fn scan_bytes(row: &AnyRow, idx: usize) -> Result<Option<Vec<u8>>, OrmError> {
    if let Ok(v) = row.try_get::<Option<Vec<u8>>, _>(idx) {
        return Ok(v);
    }
    match row.try_get::<Option<String>, _>(idx) {
        Ok(v) => Ok(v.map(String::into_bytes)),
        Err(e) => Err(scan_error(idx, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn field(kind: FieldKind) -> FieldDescriptor {
        FieldDescriptor::new("F", kind)
    }

    fn colors() -> Arc<EnumDefinition> {
        Arc::new(EnumDefinition::new("Color", ["red", "green", "blue"]))
    }

    #[test]
    fn test_required_string_maps_empty_to_null() {
        let mut f = field(FieldKind::String);
        f.required = true;
        assert_eq!(f.normalize(Value::from("")).unwrap(), Value::Null);

        let plain = field(FieldKind::String);
        assert_eq!(plain.normalize(Value::Null).unwrap(), Value::from(""));
    }

    #[test]
    fn test_unsigned_range_enforced() {
        let f = field(FieldKind::UInt8);
        assert_eq!(f.normalize(Value::Int(200)).unwrap(), Value::UInt(200));
        assert!(f.normalize(Value::UInt(256)).is_err());
        assert!(f.normalize(Value::Int(-1)).is_err());
    }

    #[test]
    fn test_unknown_enum_value_is_fatal() {
        let mut f = field(FieldKind::enumeration("Color"));
        f.enum_def = Some(colors());
        let err = f.normalize(Value::from("purple")).unwrap_err();
        assert!(matches!(err, OrmError::EnumUnknown { ref value, .. } if value == "purple"));
    }

    #[test]
    fn test_set_is_sorted_by_declaration_and_deduplicated() {
        let mut f = field(FieldKind::set("Color"));
        f.enum_def = Some(colors());
        let v = f
            .normalize(Value::set(["blue", "red", "blue"]))
            .unwrap();
        assert_eq!(v, Value::set(["red", "blue"]));
        assert_eq!(f.bind(&v).unwrap(), BindValue::Text("red,blue".into()));
    }

    #[test]
    fn test_date_truncates_to_midnight() {
        let f = field(FieldKind::Date);
        let v = f.normalize(Value::Time(86_400 + 3_600)).unwrap();
        assert_eq!(v, Value::Time(86_400));
        assert_eq!(f.bind(&v).unwrap(), BindValue::Text("1970-01-02".into()));
        assert_eq!(
            f.bind(&Value::Time(ZERO_DATE_SECONDS)).unwrap(),
            BindValue::Text("0000-00-00".into())
        );
    }

    #[test]
    fn test_float_tolerance_follows_precision() {
        let mut f = field(FieldKind::Float64);
        f.precision = Some(2);
        assert!(f.equal(&Value::Float(1.234), &Value::Float(1.235)));
        assert!(!f.equal(&Value::Float(1.234), &Value::Float(1.254)));
    }

    #[test]
    fn test_pending_reference_cannot_bind() {
        let f = field(FieldKind::reference("User"));
        assert_eq!(f.bind(&Value::reference(9)).unwrap(), BindValue::UInt(9));
        assert_eq!(f.normalize(Value::UInt(0)).unwrap(), Value::Null);
    }

    #[test]
    fn test_column_encoding_roundtrip_per_kind() {
        let mut nullable_int = field(FieldKind::Int32);
        nullable_int.nullable = true;
        let mut color = field(FieldKind::enumeration("Color"));
        color.enum_def = Some(colors());
        let cases = vec![
            (field(FieldKind::UInt64), Value::UInt(u64::MAX)),
            (nullable_int.clone(), Value::Null),
            (nullable_int, Value::Int(-5)),
            (field(FieldKind::Bool), Value::Bool(true)),
            (field(FieldKind::String), Value::from("ß")),
            (color, Value::from("green")),
            (field(FieldKind::Json), Value::Json(serde_json::json!({"a": [1, 2]}))),
            (field(FieldKind::DateTime), Value::Time(ZERO_DATE_SECONDS)),
            (field(FieldKind::references("User")), Value::Refs(vec![3, 1])),
        ];
        for (f, v) in cases {
            let mut out = Serializer::new();
            f.encode(&mut out, &v).unwrap();
            let bytes = out.into_bytes();
            let mut input = Deserializer::new(&bytes);
            assert_eq!(f.decode(&mut input).unwrap(), v, "kind {:?}", f.kind);
            assert!(input.is_exhausted());
        }
    }

    #[test]
    fn test_time_projection_per_dialect() {
        let f = field(FieldKind::DateTime);
        assert_eq!(f.projection(Dialect::MySql), "UNIX_TIMESTAMP(`F`)");
        assert_eq!(
            f.projection(Dialect::Sqlite),
            "CAST(strftime('%s', `F`) AS INTEGER)"
        );
    }

    #[test]
    fn test_mysql_column_types() {
        let mut age = FieldDescriptor::new("Age", FieldKind::UInt16);
        assert_eq!(
            age.column_definition(Dialect::MySql),
            "`Age` smallint(5) unsigned NOT NULL DEFAULT '0'"
        );
        age.nullable = true;
        assert_eq!(
            age.column_definition(Dialect::MySql),
            "`Age` smallint(5) unsigned DEFAULT NULL"
        );
        let mut name = FieldDescriptor::new("Name", FieldKind::String);
        name.length = Some(64);
        name.required = true;
        assert_eq!(
            name.column_definition(Dialect::MySql),
            "`Name` varchar(64) DEFAULT NULL"
        );
    }
}
