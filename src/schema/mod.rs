// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-entity metadata compiled from an [`EntityDefinition`].
//!
//! An [`EntitySchema`] is built once at registry validation and is immutable
//! afterwards. It owns the column layout, the index and reference maps, the
//! cache key layout and the precomputed SQL fragments every other component
//! works from.
//!
//! # Cache keys
//!
//! ```text
//! <prefix>:<id>                          row image (LIST)
//! <prefix>:<index>:<attr_hash>           cached non-unique index (SET)
//! <prefix>:<unique_index>                unique index (HASH, field = attr_hash)
//! <prefix>:ref:<column>:<parent_id>      cached reference list (SET)
//! ```

pub mod ddl;
pub mod definition;
pub mod entity;
pub mod field;
pub mod index;
pub mod search;
pub mod value;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use sqlx::any::AnyRow;

pub use definition::{EntityDefinition, FieldDefinition, IndexDeclaration};
pub use entity::{Entity, EntityMeta, Ref, Tracked, TrackedRecord};
pub use field::{BlobSize, EnumDefinition, FieldDescriptor, FieldKind};
pub use index::{IndexDefinition, ReferenceDefinition};
pub use search::{DocumentAdd, DocumentPusher, SearchIndexDescriptor};
pub use value::{Reference, Value, ValueReader, ZERO_DATE_SECONDS};

use crate::codec::{BindValue, Row};
use crate::error::OrmError;
use crate::hash::{cache_prefix, fnv1a_64};
use crate::storage::sql::Dialect;

/// Column holding the soft-delete flag.
pub const FAKE_DELETE_COLUMN: &str = "FakeDelete";

/// Prefix of every async flush queue key.
pub const ASYNC_QUEUE_PREFIX: &str = "_orm_async";

/// Known-absent marker: the only element of a row list, or the only id
/// member of an index set.
pub const NIL_MARKER: &str = "_nil";

/// Member flagging an index or reference set as complete.
pub const VALID_MEMBER: &str = "VALID";

/// Field flagging a unique-index HASH as fully warmed.
pub const UNIQUE_VALID_FIELD: &str = "_is_valid";

/// Stream receiving re-index requests for searchable entities.
pub const SEARCH_CHANNEL: &str = "orm-redis-search-channel";

/// Pool-level facts the compiler needs from the registry.
pub(crate) struct CompileInput<'a> {
    pub enums: &'a HashMap<String, Arc<EnumDefinition>>,
    pub dialect: Dialect,
    pub dsn: &'a str,
    pub prefix_len: usize,
}

#[derive(Debug)]
pub struct EntitySchema {
    name: String,
    table: String,
    db_pool: String,
    dialect: Dialect,
    local_pool: Option<String>,
    redis_pool: Option<String>,
    fields: Vec<FieldDescriptor>,
    field_index: HashMap<String, usize>,
    indexes: Vec<IndexDefinition>,
    index_by_name: HashMap<String, usize>,
    references: Vec<ReferenceDefinition>,
    fake_delete: Option<usize>,
    structure_hash: u64,
    cache_prefix: String,
    fields_query: String,
    async_queue: String,
    search: Option<SearchIndexDescriptor>,
}

fn invariant(entity: &str, reason: impl Into<String>) -> OrmError {
    OrmError::SchemaInvariant {
        entity: entity.to_string(),
        reason: reason.into(),
    }
}

impl EntitySchema {
    pub(crate) fn compile(
        def: EntityDefinition,
        input: &CompileInput<'_>,
    ) -> Result<Self, OrmError> {
        let entity = def.name;

        let mut fields = Vec::with_capacity(def.fields.len());
        let mut field_index = HashMap::new();
        let mut memberships: BTreeMap<String, Vec<(usize, usize, bool)>> = BTreeMap::new();

        for (position, field) in def.fields.into_iter().enumerate() {
            let mut descriptor = field.descriptor;
            if descriptor.name.eq_ignore_ascii_case("ID") {
                return Err(invariant(entity, "column ID is implicit and cannot be declared"));
            }
            if field_index.insert(descriptor.name.clone(), position).is_some() {
                return Err(invariant(
                    entity,
                    format!("column '{}' declared twice", descriptor.name),
                ));
            }
            if descriptor.nullable && !descriptor.kind.supports_nullable() {
                return Err(invariant(
                    entity,
                    format!(
                        "column '{}' of kind {:?} cannot be nullable",
                        descriptor.name, descriptor.kind
                    ),
                ));
            }
            if let FieldKind::Enum(enum_name) | FieldKind::Set(enum_name) = &descriptor.kind {
                let resolved = input.enums.get(enum_name).ok_or_else(|| {
                    invariant(
                        entity,
                        format!(
                            "enum '{enum_name}' used by '{}' is not registered",
                            descriptor.name
                        ),
                    )
                })?;
                descriptor.enum_def = Some(resolved.clone());
            }
            for m in field.memberships {
                memberships
                    .entry(m.index)
                    .or_default()
                    .push((m.order, position, m.unique));
            }
            fields.push(descriptor);
        }

        let fake_delete = field_index
            .get(FAKE_DELETE_COLUMN)
            .copied()
            .filter(|pos| fields[*pos].kind == FieldKind::Bool);

        let column_position = |column: &str| {
            field_index.get(column).copied().ok_or_else(|| OrmError::UnknownField {
                entity: entity.to_string(),
                field: column.to_string(),
            })
        };

        // Field-declared indexes first, then explicit declarations.
        let mut indexes: Vec<IndexDefinition> = Vec::new();
        for (name, mut members) in memberships {
            members.sort_by_key(|(order, _, _)| *order);
            let unique = members.iter().any(|(_, _, u)| *u);
            if unique && !members.iter().all(|(_, _, u)| *u) {
                return Err(invariant(
                    entity,
                    format!("index '{name}' mixes unique and non-unique members"),
                ));
            }
            let positions: Vec<usize> = members.iter().map(|(_, p, _)| *p).collect();
            indexes.push(IndexDefinition {
                name,
                columns: positions.iter().map(|p| fields[*p].name.clone()).collect(),
                positions,
                unique,
                cached: false,
                single: false,
                order_by: Vec::new(),
                order_positions: Vec::new(),
                in_database: true,
                where_clause: String::new(),
                tracked: Vec::new(),
            });
        }

        for decl in def.indexes {
            let existing = indexes.iter().position(|i| i.name == decl.name);
            let idx = match existing {
                Some(idx) => {
                    if !decl.columns.is_empty() && decl.columns != indexes[idx].columns {
                        return Err(invariant(
                            entity,
                            format!(
                                "index '{}' columns disagree with field declarations",
                                decl.name
                            ),
                        ));
                    }
                    idx
                }
                None => {
                    if decl.columns.is_empty() {
                        return Err(invariant(
                            entity,
                            format!("index '{}' has no columns", decl.name),
                        ));
                    }
                    let positions = decl
                        .columns
                        .iter()
                        .map(|c| column_position(c))
                        .collect::<Result<Vec<_>, _>>()?;
                    indexes.push(IndexDefinition {
                        name: decl.name.clone(),
                        columns: decl.columns.clone(),
                        positions,
                        unique: false,
                        cached: false,
                        single: false,
                        order_by: Vec::new(),
                        order_positions: Vec::new(),
                        in_database: false,
                        where_clause: String::new(),
                        tracked: Vec::new(),
                    });
                    indexes.len() - 1
                }
            };
            let index = &mut indexes[idx];
            if index.unique && (decl.cached || !decl.order_by.is_empty()) {
                return Err(invariant(
                    entity,
                    format!("unique index '{}' is always cached and cannot be ordered", index.name),
                ));
            }
            index.cached = decl.cached;
            index.single = decl.single;
            if decl.single {
                index.in_database = false;
            }
            index.order_positions = decl
                .order_by
                .iter()
                .map(|c| column_position(c))
                .collect::<Result<Vec<_>, _>>()?;
            index.order_by = decl.order_by;
        }

        validate_indexes(entity, &indexes)?;

        for index in &mut indexes {
            let soft = fake_delete.is_some() && !index.unique;
            let columns: Vec<(&str, bool)> = index
                .positions
                .iter()
                .map(|p| (fields[*p].name.as_str(), fields[*p].admits_null()))
                .collect();
            index.where_clause = IndexDefinition::build_where(input.dialect, &columns, soft);
            let mut tracked = index.positions.clone();
            tracked.extend(index.order_positions.iter().copied());
            if let (Some(pos), false) = (fake_delete, index.unique) {
                tracked.push(pos);
            }
            tracked.sort_unstable();
            tracked.dedup();
            index.tracked = tracked;
        }
        indexes.sort_by(|a, b| a.name.cmp(&b.name));
        let index_by_name = indexes
            .iter()
            .enumerate()
            .map(|(i, index)| (index.name.clone(), i))
            .collect();

        let references = fields
            .iter()
            .enumerate()
            .filter_map(|(position, f)| match &f.kind {
                FieldKind::Ref(target) => Some(ReferenceDefinition {
                    column: f.name.clone(),
                    position,
                    target: target.clone(),
                    cached: f.cached_reference,
                }),
                _ => None,
            })
            .collect();

        let structure = std::iter::once("ID:UInt64".to_string())
            .chain(fields.iter().map(FieldDescriptor::structure_code))
            .collect::<Vec<_>>()
            .join(";");
        let structure_hash = fnv1a_64(structure.as_bytes());

        let prefix = cache_prefix(entity, input.dsn, input.prefix_len);
        let fields_query = std::iter::once("`ID`".to_string())
            .chain(fields.iter().map(|f| f.projection(input.dialect)))
            .collect::<Vec<_>>()
            .join(", ");

        let async_queue = match (&def.async_group, def.split_async) {
            (Some(group), _) => format!("{ASYNC_QUEUE_PREFIX}:{group}"),
            (None, true) => format!("{ASYNC_QUEUE_PREFIX}:{}:{entity}", def.mysql_pool),
            (None, false) => format!("{ASYNC_QUEUE_PREFIX}:{}", def.mysql_pool),
        };

        let search = def
            .redis_search
            .as_deref()
            .and_then(|pool| SearchIndexDescriptor::from_fields(entity, pool, &prefix, &fields));

        Ok(Self {
            name: entity.to_string(),
            table: def.table.unwrap_or_else(|| entity.to_string()),
            db_pool: def.mysql_pool,
            dialect: input.dialect,
            local_pool: def.local_cache,
            redis_pool: def.redis_cache,
            fields,
            field_index,
            indexes,
            index_by_name,
            references,
            fake_delete,
            structure_hash,
            cache_prefix: prefix,
            fields_query,
            async_queue,
            search,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn db_pool(&self) -> &str {
        &self.db_pool
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn local_pool(&self) -> Option<&str> {
        self.local_pool.as_deref()
    }

    pub fn redis_pool(&self) -> Option<&str> {
        self.redis_pool.as_deref()
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    /// Column names including `ID`, in canonical order.
    pub fn column_names(&self) -> Vec<&str> {
        std::iter::once("ID")
            .chain(self.fields.iter().map(FieldDescriptor::name))
            .collect()
    }

    pub fn field(&self, column: &str) -> Result<(usize, &FieldDescriptor), OrmError> {
        self.field_index
            .get(column)
            .map(|pos| (*pos, &self.fields[*pos]))
            .ok_or_else(|| OrmError::UnknownField {
                entity: self.name.clone(),
                field: column.to_string(),
            })
    }

    pub fn indexes(&self) -> &[IndexDefinition] {
        &self.indexes
    }

    pub fn index(&self, name: &str) -> Result<&IndexDefinition, OrmError> {
        self.index_by_name
            .get(name)
            .map(|i| &self.indexes[*i])
            .ok_or_else(|| OrmError::UnknownIndex {
                entity: self.name.clone(),
                index: name.to_string(),
            })
    }

    pub fn unique_indexes(&self) -> impl Iterator<Item = &IndexDefinition> {
        self.indexes.iter().filter(|i| i.unique)
    }

    pub fn cached_indexes(&self) -> impl Iterator<Item = &IndexDefinition> {
        self.indexes.iter().filter(|i| i.cached)
    }

    pub fn references(&self) -> &[ReferenceDefinition] {
        &self.references
    }

    pub fn reference(&self, column: &str) -> Result<&ReferenceDefinition, OrmError> {
        self.references
            .iter()
            .find(|r| r.column == column)
            .ok_or_else(|| OrmError::UnknownField {
                entity: self.name.clone(),
                field: column.to_string(),
            })
    }

    pub fn fake_delete_position(&self) -> Option<usize> {
        self.fake_delete
    }

    pub fn structure_hash(&self) -> u64 {
        self.structure_hash
    }

    pub fn cache_prefix(&self) -> &str {
        &self.cache_prefix
    }

    pub fn fields_query(&self) -> &str {
        &self.fields_query
    }

    pub fn async_queue(&self) -> &str {
        &self.async_queue
    }

    pub fn search(&self) -> Option<&SearchIndexDescriptor> {
        self.search.as_ref()
    }

    pub fn row_key(&self, id: u64) -> String {
        format!("{}:{id}", self.cache_prefix)
    }

    pub fn index_key(&self, index: &str, attr_hash: u64) -> String {
        format!("{}:{index}:{attr_hash}", self.cache_prefix)
    }

    pub fn unique_key(&self, index: &str) -> String {
        format!("{}:{index}", self.cache_prefix)
    }

    pub fn reference_key(&self, column: &str, parent: u64) -> String {
        format!("{}:ref:{column}:{parent}", self.cache_prefix)
    }

    /// Normalize a full value list from [`Entity::to_values`].
    pub fn normalize_values(&self, values: Vec<Value>) -> Result<Vec<Value>, OrmError> {
        if values.len() != self.fields.len() {
            return Err(OrmError::InvalidArgument(format!(
                "{} expects {} values, got {}",
                self.name,
                self.fields.len(),
                values.len()
            )));
        }
        self.fields
            .iter()
            .zip(values)
            .map(|(field, value)| field.normalize(value))
            .collect()
    }

    /// Bind values for selected positions, e.g. an index's columns.
    pub fn bind_positions(
        &self,
        positions: &[usize],
        values: &[Value],
    ) -> Result<Vec<BindValue>, OrmError> {
        positions
            .iter()
            .map(|p| self.fields[*p].bind(&values[*p]))
            .collect()
    }

    /// Normalize and bind user-supplied index attributes.
    pub fn bind_attributes(
        &self,
        index: &IndexDefinition,
        attrs: &[Value],
    ) -> Result<Vec<BindValue>, OrmError> {
        if attrs.len() != index.positions.len() {
            return Err(OrmError::InvalidArgument(format!(
                "index '{}' of {} takes {} attributes, got {}",
                index.name,
                self.name,
                index.positions.len(),
                attrs.len()
            )));
        }
        index
            .positions
            .iter()
            .zip(attrs)
            .map(|(p, attr)| {
                let field = &self.fields[*p];
                field.bind(&field.normalize(attr.clone())?)
            })
            .collect()
    }

    /// Decode one result row produced by a `SELECT <fields_query>`.
    pub(crate) fn scan_row(&self, row: &AnyRow) -> Result<Row, OrmError> {
        let id = field::scan_i64(row, 0)?
            .and_then(|n| u64::try_from(n).ok())
            .ok_or_else(|| OrmError::CodecIo(format!("{} row without a valid ID", self.name)))?;
        let values = self
            .fields
            .iter()
            .enumerate()
            .map(|(i, f)| f.scan(row, i + 1))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Row { id, values })
    }

    pub(crate) fn select_by_id_sql(&self) -> String {
        format!(
            "SELECT {} FROM `{}` WHERE `ID` = ? LIMIT 1",
            self.fields_query, self.table
        )
    }

    pub(crate) fn select_by_ids_sql(&self, count: usize) -> String {
        let placeholders = vec!["?"; count].join(",");
        format!(
            "SELECT {} FROM `{}` WHERE `ID` IN ({placeholders})",
            self.fields_query, self.table
        )
    }

    /// `SELECT ID` for a cached index or reference search.
    pub(crate) fn select_ids_sql(&self, where_clause: &str, order: &str) -> String {
        format!("SELECT `ID` FROM `{}` WHERE {where_clause} {order}", self.table)
    }

    /// Parent ids are never NULL, so plain equality keeps the column index usable.
    pub(crate) fn reference_where(&self, column: &str) -> String {
        IndexDefinition::build_where(self.dialect, &[(column, false)], self.fake_delete.is_some())
    }
}

fn validate_indexes(entity: &str, indexes: &[IndexDefinition]) -> Result<(), OrmError> {
    let in_db: Vec<&IndexDefinition> = indexes.iter().filter(|i| i.in_database).collect();
    for (i, a) in in_db.iter().enumerate() {
        for b in &in_db[i + 1..] {
            if a.columns == b.columns {
                return Err(invariant(
                    entity,
                    format!("indexes '{}' and '{}' cover the same columns", a.name, b.name),
                ));
            }
        }
    }

    for index in indexes.iter().filter(|i| i.single) {
        let backed = in_db.iter().any(|u| u.unique && u.columns == index.columns);
        if !backed {
            return Err(invariant(
                entity,
                format!(
                    "one-result index '{}' needs a unique index on {:?}",
                    index.name, index.columns
                ),
            ));
        }
    }

    for index in indexes.iter().filter(|i| !i.order_by.is_empty()) {
        let mut wanted = index.columns.clone();
        wanted.extend(index.order_by.iter().cloned());
        let aligned = in_db.iter().any(|candidate| candidate.columns.starts_with(&wanted));
        if !aligned {
            return Err(invariant(
                entity,
                format!(
                    "ordering {:?} of index '{}' is not a suffix of any index on {:?}",
                    index.order_by, index.name, index.columns
                ),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub(crate) fn compile(def: EntityDefinition) -> EntitySchema {
        compile_with(def, &[])
    }

    pub(crate) fn compile_with(def: EntityDefinition, enums: &[EnumDefinition]) -> EntitySchema {
        let enums: HashMap<String, Arc<EnumDefinition>> = enums
            .iter()
            .map(|e| (e.name().to_string(), Arc::new(e.clone())))
            .collect();
        let input = CompileInput {
            enums: &enums,
            dialect: Dialect::Sqlite,
            dsn: "sqlite::memory:",
            prefix_len: 5,
        };
        EntitySchema::compile(def, &input).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(enums: &HashMap<String, Arc<EnumDefinition>>) -> CompileInput<'_> {
        CompileInput {
            enums,
            dialect: Dialect::MySql,
            dsn: "mysql://localhost/test",
            prefix_len: 5,
        }
    }

    fn user_definition() -> EntityDefinition {
        let mut def = EntityDefinition::new("User");
        def.redis_cache("default");
        def.field("Name", FieldKind::String).required().length(64).unique("Name");
        def.field("Age", FieldKind::UInt16).index("byAge");
        def.field("Born", FieldKind::Date).nullable();
        def.index("byAge").cached();
        def
    }

    #[test]
    fn test_compile_user() {
        let enums = HashMap::new();
        let schema = EntitySchema::compile(user_definition(), &input(&enums)).unwrap();
        assert_eq!(schema.table(), "User");
        assert_eq!(schema.column_names(), vec!["ID", "Name", "Age", "Born"]);
        assert_eq!(
            schema.fields_query(),
            "`ID`, `Name`, `Age`, UNIX_TIMESTAMP(`Born`)"
        );
        assert_eq!(schema.async_queue(), "_orm_async:default");
        let by_age = schema.index("byAge").unwrap();
        assert!(by_age.cached);
        assert_eq!(by_age.where_clause, "`Age` = ?");
        assert_eq!(schema.unique_indexes().count(), 1);
        assert_eq!(schema.row_key(1), format!("{}:1", schema.cache_prefix()));
    }

    #[test]
    fn test_structure_hash_tracks_layout() {
        let enums = HashMap::new();
        let a = EntitySchema::compile(user_definition(), &input(&enums)).unwrap();
        let mut changed = user_definition();
        changed.field("Extra", FieldKind::Bool);
        let b = EntitySchema::compile(changed, &input(&enums)).unwrap();
        assert_ne!(a.structure_hash(), b.structure_hash());
        let again = EntitySchema::compile(user_definition(), &input(&enums)).unwrap();
        assert_eq!(a.structure_hash(), again.structure_hash());
    }

    #[test]
    fn test_duplicate_index_rejected() {
        let enums = HashMap::new();
        let mut def = user_definition();
        def.field("Nick", FieldKind::String).index("byNick");
        def.fields[0].index("alsoName");
        let err = EntitySchema::compile(def, &input(&enums)).unwrap_err();
        assert!(matches!(err, OrmError::SchemaInvariant { .. }));
    }

    #[test]
    fn test_single_needs_unique_backing() {
        let enums = HashMap::new();
        let mut def = user_definition();
        def.index("oneByName").columns(&["Name"]).single();
        assert!(EntitySchema::compile(def, &input(&enums)).is_ok());

        let mut def = user_definition();
        def.index("oneByAge").columns(&["Age"]).single();
        let err = EntitySchema::compile(def, &input(&enums)).unwrap_err();
        assert!(matches!(err, OrmError::SchemaInvariant { .. }));
    }

    #[test]
    fn test_order_must_be_index_suffix() {
        let enums = HashMap::new();
        let mut def = user_definition();
        def.index("byAge").order_by(&["Name"]);
        assert!(matches!(
            EntitySchema::compile(def, &input(&enums)),
            Err(OrmError::SchemaInvariant { .. })
        ));

        let mut def = user_definition();
        def.fields[1].index_at("byAgeName", 1);
        def.fields[0].index_at("byAgeName", 2);
        def.index("byAge").order_by(&["Name"]);
        let schema = EntitySchema::compile(def, &input(&enums)).unwrap();
        let by_age = schema.index("byAge").unwrap();
        assert_eq!(by_age.order_clause(), "ORDER BY `Name`");
        assert_eq!(by_age.tracked, vec![0, 1]);
    }

    #[test]
    fn test_unregistered_enum_rejected() {
        let enums = HashMap::new();
        let mut def = EntityDefinition::new("Car");
        def.field("Color", FieldKind::enumeration("Color"));
        assert!(matches!(
            EntitySchema::compile(def, &input(&enums)),
            Err(OrmError::SchemaInvariant { .. })
        ));
    }

    #[test]
    fn test_fake_delete_injected_in_where() {
        let enums = HashMap::new();
        let mut def = user_definition();
        def.field("FakeDelete", FieldKind::Bool);
        let schema = EntitySchema::compile(def, &input(&enums)).unwrap();
        assert_eq!(schema.fake_delete_position(), Some(3));
        let by_age = schema.index("byAge").unwrap();
        assert_eq!(by_age.where_clause, "`Age` = ? AND `FakeDelete` = 0");
        assert!(by_age.is_tracking(3));
        // Required strings store empty values as NULL.
        assert_eq!(schema.index("Name").unwrap().where_clause, "`Name` <=> ?");
    }

    #[test]
    fn test_split_and_group_queues() {
        let enums = HashMap::new();
        let mut def = user_definition();
        def.split_async_flush();
        let schema = EntitySchema::compile(def, &input(&enums)).unwrap();
        assert_eq!(schema.async_queue(), "_orm_async:default:User");

        let mut def = user_definition();
        def.custom_async_group("mail");
        let schema = EntitySchema::compile(def, &input(&enums)).unwrap();
        assert_eq!(schema.async_queue(), "_orm_async:mail");
    }
}
