// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Row images and dirty diffing.
//!
//! A row image is a sequence of segments:
//!
//! ```text
//! [structure_hash] [id] [col 1] ... [col N]
//! ```
//!
//! Each segment is self-delimiting, so the concatenated image can be decoded
//! in one pass while RCACHE keeps the segments as separate list elements.

use super::{BindMap, Deserializer, Serializer};
use crate::error::OrmError;
use crate::schema::{EntitySchema, Value};

/// A decoded row: the id plus the non-ID column values in schema order.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    pub id: u64,
    pub values: Vec<Value>,
}

impl Row {
    pub fn new(id: u64, values: Vec<Value>) -> Self {
        Self { id, values }
    }
}

/// Per-segment encoding of a row. Values must be normalized.
pub fn encode_segments(schema: &EntitySchema, row: &Row) -> Result<Vec<Vec<u8>>, OrmError> {
    check_width(schema, row.values.len())?;
    let mut segments = Vec::with_capacity(row.values.len() + 2);

    let mut head = Serializer::with_capacity(10);
    head.write_unsigned(schema.structure_hash());
    segments.push(head.into_bytes());

    let mut id = Serializer::with_capacity(10);
    id.write_unsigned(row.id);
    segments.push(id.into_bytes());

    for (field, value) in schema.fields().iter().zip(&row.values) {
        let mut out = Serializer::new();
        field.encode(&mut out, value)?;
        segments.push(out.into_bytes());
    }
    Ok(segments)
}

pub fn encode_row(schema: &EntitySchema, row: &Row) -> Result<Vec<u8>, OrmError> {
    Ok(encode_segments(schema, row)?.concat())
}

/// Decode an image; a leading hash from another schema version is rejected.
pub fn decode_row(schema: &EntitySchema, bytes: &[u8]) -> Result<Row, OrmError> {
    let mut input = Deserializer::new(bytes);
    let found = input.read_unsigned()?;
    if found != schema.structure_hash() {
        return Err(OrmError::CodecHashMismatch {
            expected: schema.structure_hash(),
            found,
        });
    }
    let id = input.read_unsigned()?;
    let values = schema
        .fields()
        .iter()
        .map(|field| field.decode(&mut input))
        .collect::<Result<Vec<_>, _>>()?;
    if !input.is_exhausted() {
        return Err(OrmError::CodecIo(format!(
            "{} trailing bytes after row image",
            input.remaining()
        )));
    }
    Ok(Row { id, values })
}

/// Outcome of comparing a stored image with the entity's current values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Diff {
    /// Positions of changed columns; every column for an insert.
    pub changed: Vec<usize>,
    /// Decoded prior row, absent for inserts.
    pub old: Option<Row>,
    /// Prior value of every column, absent columns for inserts.
    pub old_bind: BindMap,
    /// New value of every changed column.
    pub new_bind: BindMap,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty()
    }

    pub fn touches(&self, positions: &[usize]) -> bool {
        positions.iter().any(|p| self.changed.contains(p))
    }
}

/// Compare `values` (normalized) against the stored image.
pub fn diff(
    schema: &EntitySchema,
    image: Option<&[u8]>,
    values: &[Value],
) -> Result<Diff, OrmError> {
    check_width(schema, values.len())?;
    let old = image.map(|bytes| decode_row(schema, bytes)).transpose()?;

    let mut result = Diff::default();
    for (position, (field, new)) in schema.fields().iter().zip(values).enumerate() {
        let changed = match &old {
            Some(old) => {
                let prior = &old.values[position];
                result.old_bind.insert(field.name(), field.bind(prior)?);
                !field.equal(prior, new)
            }
            None => true,
        };
        if changed {
            result.changed.push(position);
            result.new_bind.insert(field.name(), field.bind(new)?);
        }
    }
    result.old = old;
    Ok(result)
}

fn check_width(schema: &EntitySchema, len: usize) -> Result<(), OrmError> {
    if len == schema.fields().len() {
        Ok(())
    } else {
        Err(OrmError::InvalidArgument(format!(
            "{} has {} columns, row carries {len}",
            schema.name(),
            schema.fields().len()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::BindValue;
    use crate::schema::test_support::compile;
    use crate::schema::{EntityDefinition, FieldKind};

    fn account() -> EntitySchema {
        let mut def = EntityDefinition::new("Account");
        def.field("Name", FieldKind::String).required();
        def.field("Balance", FieldKind::Float64).precision(2);
        def.field("Opened", FieldKind::Date).nullable();
        def.field("Tags", FieldKind::Json);
        compile(def)
    }

    fn row(balance: f64) -> Row {
        Row::new(
            4,
            vec![
                Value::from("Tom"),
                Value::Float(balance),
                Value::Null,
                Value::Json(serde_json::json!(["a"])),
            ],
        )
    }

    #[test]
    fn test_roundtrip() {
        let schema = account();
        let bytes = encode_row(&schema, &row(1.5)).unwrap();
        assert_eq!(decode_row(&schema, &bytes).unwrap(), row(1.5));
    }

    #[test]
    fn test_segments_concatenate_to_image() {
        let schema = account();
        let segments = encode_segments(&schema, &row(1.5)).unwrap();
        assert_eq!(segments.len(), schema.fields().len() + 2);
        assert_eq!(segments.concat(), encode_row(&schema, &row(1.5)).unwrap());
    }

    #[test]
    fn test_hash_gate() {
        let schema = account();
        let mut other = EntityDefinition::new("Account");
        other.field("Name", FieldKind::String).required();
        let other = compile(other);
        let bytes = encode_row(&other, &Row::new(1, vec![Value::from("x")])).unwrap();
        assert!(matches!(
            decode_row(&schema, &bytes),
            Err(OrmError::CodecHashMismatch { .. })
        ));
    }

    #[test]
    fn test_insert_diff_binds_everything() {
        let schema = account();
        let d = diff(&schema, None, &row(1.0).values).unwrap();
        assert_eq!(d.changed, vec![0, 1, 2, 3]);
        assert!(d.old_bind.is_empty());
        assert_eq!(d.new_bind.get("Opened"), Some(&BindValue::Null));
    }

    #[test]
    fn test_update_diff_respects_precision() {
        let schema = account();
        let image = encode_row(&schema, &row(1.234)).unwrap();
        let d = diff(&schema, Some(&image), &row(1.235).values).unwrap();
        assert!(d.is_empty());

        let d = diff(&schema, Some(&image), &row(2.0).values).unwrap();
        assert_eq!(d.changed, vec![1]);
        assert_eq!(d.new_bind.get("Balance"), Some(&BindValue::Float(2.0)));
        assert_eq!(d.old_bind.get("Balance"), Some(&BindValue::Float(1.234)));
        assert_eq!(d.old_bind.len(), 4);
    }
}
