// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Property-based tests for the row codec.
//!
//! Random rows must survive an encode/decode cycle, images written under a
//! different structure hash must be rejected, and arbitrary bytes must never
//! panic the decoder.
//!
//! Run with: `cargo test --test proptest_codec`

use std::sync::Arc;

use proptest::prelude::*;

use tiered_orm::codec::{decode_row, encode_row, encode_segments, Row, Serializer};
use tiered_orm::schema::EntitySchema;
use tiered_orm::{
    Entity, EntityDefinition, EntityMeta, FieldKind, OrmError, Registry, Value, ValueReader,
};

#[derive(Debug, Clone, Default)]
struct Note {
    id: u64,
    meta: EntityMeta,
}

impl Entity for Note {
    fn entity_name() -> &'static str {
        "Note"
    }
    fn define(def: &mut EntityDefinition) {
        def.field("Title", FieldKind::String).required();
        def.field("Score", FieldKind::Int64);
        def.field("Views", FieldKind::UInt32).nullable();
        def.field("Pinned", FieldKind::Bool);
        def.field("Weight", FieldKind::Float64);
        def.field("Blob", FieldKind::Bytes);
    }
    fn id(&self) -> u64 {
        self.id
    }
    fn set_id(&mut self, id: u64) {
        self.id = id;
    }
    fn meta(&self) -> &EntityMeta {
        &self.meta
    }
    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }
    fn to_values(&self) -> Vec<Value> {
        Vec::new()
    }
    fn from_values(id: u64, _r: &mut ValueReader) -> Result<Self, OrmError> {
        Ok(Self {
            id,
            meta: EntityMeta::default(),
        })
    }
}

fn schema() -> Arc<EntitySchema> {
    let mut registry = Registry::new();
    registry
        .register_mysql_pool("default", "sqlite::memory:")
        .register_entity::<Note>();
    registry.validate().unwrap().schema_of::<Note>().unwrap().clone()
}

// =============================================================================
// Strategies
// =============================================================================

fn note_values() -> impl Strategy<Value = Vec<Value>> {
    (
        "[a-zA-Z0-9 ]{1,40}",
        any::<i64>(),
        prop::option::of(any::<u32>()),
        any::<bool>(),
        -1.0e9f64..1.0e9,
        prop::collection::vec(any::<u8>(), 0..64),
    )
        .prop_map(|(title, score, views, pinned, weight, blob)| {
            vec![
                Value::from(title),
                Value::from(score),
                views.map_or(Value::Null, Value::from),
                Value::from(pinned),
                Value::from(weight),
                Value::from(blob),
            ]
        })
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #[test]
    fn roundtrip_preserves_row(id in 1u64..u64::MAX, values in note_values()) {
        let schema = schema();
        let row = Row::new(id, schema.normalize_values(values).unwrap());
        let image = encode_row(&schema, &row).unwrap();
        prop_assert_eq!(decode_row(&schema, &image).unwrap(), row);
    }

    #[test]
    fn foreign_structure_hash_is_rejected(values in note_values(), other in any::<u64>()) {
        let schema = schema();
        prop_assume!(other != schema.structure_hash());
        let row = Row::new(1, schema.normalize_values(values).unwrap());
        let mut segments = encode_segments(&schema, &row).unwrap();
        let mut head = Serializer::new();
        head.write_unsigned(other);
        segments[0] = head.into_bytes();
        let is_mismatch = matches!(
            decode_row(&schema, &segments.concat()),
            Err(OrmError::CodecHashMismatch { found, .. }) if found == other
        );
        prop_assert!(is_mismatch);
    }

    #[test]
    fn arbitrary_bytes_never_panic(bytes in prop::collection::vec(any::<u8>(), 0..256)) {
        let schema = schema();
        let _ = decode_row(&schema, &bytes);
    }

    #[test]
    fn truncated_image_is_an_error(values in note_values(), cut in 1usize..8) {
        let schema = schema();
        let row = Row::new(9, schema.normalize_values(values).unwrap());
        let image = encode_row(&schema, &row).unwrap();
        let keep = image.len().saturating_sub(cut);
        prop_assert!(decode_row(&schema, &image[..keep]).is_err());
    }
}
