// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Builder that entity types use to describe their storage layout.
//!
//! Table-level options (pools, table name, async queue routing) are set on
//! [`EntityDefinition`]; column options are chained on the
//! [`FieldDefinition`] returned by [`EntityDefinition::field`]. Nothing is
//! validated here; the registry compiles and validates the result.

use super::field::{BlobSize, FieldDescriptor, FieldKind};
use super::search::SearchFieldOptions;

pub(crate) const DEFAULT_POOL: &str = "default";

/// Membership of a column in a named index, with its 1-based position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct IndexMembership {
    pub(crate) index: String,
    pub(crate) order: usize,
    pub(crate) unique: bool,
}

#[derive(Debug, Clone)]
pub struct FieldDefinition {
    pub(crate) descriptor: FieldDescriptor,
    pub(crate) memberships: Vec<IndexMembership>,
}

impl FieldDefinition {
    /// Empty strings and sets are stored as NULL.
    pub fn required(&mut self) -> &mut Self {
        self.descriptor.required = true;
        self
    }

    /// Numeric, bool and time columns accept NULL.
    pub fn nullable(&mut self) -> &mut Self {
        self.descriptor.nullable = true;
        self
    }

    /// Maximum string length; 0 selects a text column.
    pub fn length(&mut self, length: u32) -> &mut Self {
        self.descriptor.length = Some(length);
        self
    }

    pub fn precision(&mut self, decimals: u32) -> &mut Self {
        self.descriptor.precision = Some(decimals);
        self
    }

    /// Fixed-point storage, `decimal(total, scale)`.
    pub fn decimal(&mut self, total: u32, scale: u32) -> &mut Self {
        self.descriptor.decimal = Some((total, scale));
        self
    }

    pub fn unsigned(&mut self) -> &mut Self {
        self.descriptor.unsigned = true;
        self
    }

    /// 24-bit integer storage for 32-bit fields.
    pub fn mediumint(&mut self) -> &mut Self {
        self.descriptor.kind = match self.descriptor.kind {
            FieldKind::UInt32 => FieldKind::UInt24,
            FieldKind::Int32 => FieldKind::Int24,
            ref other => other.clone(),
        };
        self
    }

    pub fn year(&mut self) -> &mut Self {
        self.descriptor.kind = FieldKind::UInt16;
        self.descriptor.year = true;
        self
    }

    /// Keep the time of day on a date column.
    pub fn time(&mut self) -> &mut Self {
        if self.descriptor.kind == FieldKind::Date {
            self.descriptor.kind = FieldKind::DateTime;
        }
        self
    }

    pub fn mediumblob(&mut self) -> &mut Self {
        self.descriptor.blob = BlobSize::Medium;
        self
    }

    pub fn longblob(&mut self) -> &mut Self {
        self.descriptor.blob = BlobSize::Long;
        self
    }

    /// Non-unique index membership at position 1.
    pub fn index(&mut self, name: &str) -> &mut Self {
        self.index_at(name, 1)
    }

    pub fn index_at(&mut self, name: &str, order: usize) -> &mut Self {
        self.memberships.push(IndexMembership {
            index: name.to_string(),
            order,
            unique: false,
        });
        self
    }

    pub fn unique(&mut self, name: &str) -> &mut Self {
        self.unique_at(name, 1)
    }

    pub fn unique_at(&mut self, name: &str, order: usize) -> &mut Self {
        self.memberships.push(IndexMembership {
            index: name.to_string(),
            order,
            unique: true,
        });
        self
    }

    /// Cache the list of rows referencing each parent.
    pub fn cached(&mut self) -> &mut Self {
        self.descriptor.cached_reference = true;
        self
    }

    pub fn searchable(&mut self) -> &mut Self {
        self.search_options();
        self
    }

    pub fn sortable(&mut self) -> &mut Self {
        self.search_options().sortable = true;
        self
    }

    pub fn stem(&mut self) -> &mut Self {
        self.search_options().stem = true;
        self
    }

    pub fn no_index(&mut self) -> &mut Self {
        self.search_options().no_index = true;
        self
    }

    pub fn search_weight(&mut self, weight: f64) -> &mut Self {
        self.search_options().weight = Some(weight);
        self
    }

    fn search_options(&mut self) -> &mut SearchFieldOptions {
        self.descriptor.search.get_or_insert_with(SearchFieldOptions::default)
    }
}

/// Index options that cannot be expressed on a single field.
#[derive(Debug, Clone, Default)]
pub struct IndexDeclaration {
    pub(crate) name: String,
    pub(crate) columns: Vec<String>,
    pub(crate) cached: bool,
    pub(crate) single: bool,
    pub(crate) order_by: Vec<String>,
}

impl IndexDeclaration {
    /// Columns for an index no field declares membership in.
    pub fn columns(&mut self, columns: &[&str]) -> &mut Self {
        self.columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn cached(&mut self) -> &mut Self {
        self.cached = true;
        self
    }

    /// One-result cached query; needs a unique index on the same columns.
    pub fn single(&mut self) -> &mut Self {
        self.cached = true;
        self.single = true;
        self
    }

    pub fn order_by(&mut self, columns: &[&str]) -> &mut Self {
        self.order_by = columns.iter().map(|c| c.to_string()).collect();
        self
    }
}

/// Storage layout of an entity type, filled in by [`crate::Entity::define`].
#[derive(Debug, Clone)]
pub struct EntityDefinition {
    pub(crate) name: &'static str,
    pub(crate) table: Option<String>,
    pub(crate) mysql_pool: String,
    pub(crate) local_cache: Option<String>,
    pub(crate) redis_cache: Option<String>,
    pub(crate) redis_search: Option<String>,
    pub(crate) async_group: Option<String>,
    pub(crate) split_async: bool,
    pub(crate) fields: Vec<FieldDefinition>,
    pub(crate) indexes: Vec<IndexDeclaration>,
    prefix: Vec<String>,
}

impl EntityDefinition {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            table: None,
            mysql_pool: DEFAULT_POOL.to_string(),
            local_cache: None,
            redis_cache: None,
            redis_search: None,
            async_group: None,
            split_async: false,
            fields: Vec::new(),
            indexes: Vec::new(),
            prefix: Vec::new(),
        }
    }

    pub fn table(&mut self, table: &str) -> &mut Self {
        self.table = Some(table.to_string());
        self
    }

    pub fn mysql_pool(&mut self, pool: &str) -> &mut Self {
        self.mysql_pool = pool.to_string();
        self
    }

    /// Empty code disables the layer.
    pub fn local_cache(&mut self, pool: &str) -> &mut Self {
        self.local_cache = non_empty(pool);
        self
    }

    pub fn redis_cache(&mut self, pool: &str) -> &mut Self {
        self.redis_cache = non_empty(pool);
        self
    }

    pub fn redis_search(&mut self, pool: &str) -> &mut Self {
        self.redis_search = non_empty(pool);
        self
    }

    pub fn custom_async_group(&mut self, group: &str) -> &mut Self {
        self.async_group = non_empty(group);
        self
    }

    pub fn custom_lazy_group(&mut self, group: &str) -> &mut Self {
        self.custom_async_group(group)
    }

    pub fn split_async_flush(&mut self) -> &mut Self {
        self.split_async = true;
        self
    }

    /// Declare the next column. Names inside [`nested`](Self::nested) get the
    /// nested prefix.
    pub fn field(&mut self, name: &str, kind: FieldKind) -> &mut FieldDefinition {
        let full_name = format!("{}{name}", self.prefix.concat());
        self.fields.push(FieldDefinition {
            descriptor: FieldDescriptor::new(&full_name, kind),
            memberships: Vec::new(),
        });
        let last = self.fields.len() - 1;
        &mut self.fields[last]
    }

    /// Flatten a nested structure into prefixed columns.
    pub fn nested(&mut self, prefix: &str, build: impl FnOnce(&mut EntityDefinition)) -> &mut Self {
        self.prefix.push(prefix.to_string());
        build(self);
        self.prefix.pop();
        self
    }

    /// Options for a named index, created on first use.
    pub fn index(&mut self, name: &str) -> &mut IndexDeclaration {
        let pos = match self.indexes.iter().position(|i| i.name == name) {
            Some(pos) => pos,
            None => {
                self.indexes.push(IndexDeclaration {
                    name: name.to_string(),
                    ..Default::default()
                });
                self.indexes.len() - 1
            }
        };
        &mut self.indexes[pos]
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

fn non_empty(code: &str) -> Option<String> {
    (!code.is_empty()).then(|| code.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_prefixes_columns() {
        let mut def = EntityDefinition::new("User");
        def.field("Name", FieldKind::String);
        def.nested("Address", |d| {
            d.field("City", FieldKind::String);
            d.nested("Geo", |g| {
                g.field("Lat", FieldKind::Float64);
            });
        });
        let names: Vec<_> = def.fields.iter().map(|f| f.descriptor.name.clone()).collect();
        assert_eq!(names, vec!["Name", "AddressCity", "AddressGeoLat"]);
    }

    #[test]
    fn test_field_chaining() {
        let mut def = EntityDefinition::new("User");
        def.field("Age", FieldKind::UInt32)
            .mediumint()
            .nullable()
            .index_at("byAgeName", 1);
        let f = &def.fields[0];
        assert_eq!(f.descriptor.kind, FieldKind::UInt24);
        assert!(f.descriptor.nullable);
        assert_eq!(f.memberships[0].index, "byAgeName");
    }

    #[test]
    fn test_index_declaration_is_reused() {
        let mut def = EntityDefinition::new("User");
        def.index("byAge").cached();
        def.index("byAge").order_by(&["Name"]);
        assert_eq!(def.indexes.len(), 1);
        assert!(def.indexes[0].cached);
        assert_eq!(def.indexes[0].order_by, vec!["Name"]);
    }

    #[test]
    fn test_empty_pool_disables_layer() {
        let mut def = EntityDefinition::new("User");
        def.redis_cache("default").redis_cache("");
        assert!(def.redis_cache.is_none());
    }
}
