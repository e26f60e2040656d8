// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Index lookups.
//!
//! Non-unique cached indexes keep one RCACHE set per attribute hash at
//! `<prefix>:<index>:<hash>`; unique indexes share one HASH per index at
//! `<prefix>:<index>` mapping attribute hash to id, warmed by the unique-key
//! loader and maintained incrementally by flushes.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, instrument};

use crate::codec::BindValue;
use crate::error::OrmError;
use crate::hash::attribute_hash;
use crate::schema::field::scan_i64;
use crate::schema::{Entity, EntitySchema, IndexDefinition, Value, UNIQUE_VALID_FIELD};
use crate::storage::local::{CachedRow, LocalKey};

use super::loader::{materialize, IdSearch};
use super::Context;

impl Context {
    /// Rows matching `attrs` on index `index`.
    ///
    /// Ordered indexes return rows by their ordering columns, others by id.
    #[instrument(skip(self, attrs), fields(entity = E::entity_name()))]
    pub async fn get_by_index<E: Entity>(
        &self,
        index: &str,
        attrs: &[Value],
    ) -> Result<Vec<E>, OrmError> {
        let schema = self.engine.schema_of::<E>()?.clone();
        self.index_rows(&schema, index, attrs)
            .await?
            .iter()
            .map(|row| materialize(row))
            .collect()
    }

    /// The row holding `attrs` on a unique index, or on a one-result index
    /// backed by one.
    #[instrument(skip(self, attrs), fields(entity = E::entity_name()))]
    pub async fn get_by_unique_index<E: Entity>(
        &self,
        index: &str,
        attrs: &[Value],
    ) -> Result<Option<E>, OrmError> {
        let schema = self.engine.schema_of::<E>()?.clone();
        let definition = schema.index(index)?.clone();
        let row = if definition.unique || definition.single {
            let unique = backing_unique(&schema, &definition)?;
            self.unique_row(&schema, &unique, attrs).await?
        } else {
            self.index_rows(&schema, index, attrs).await?.into_iter().next()
        };
        row.map(|row| materialize(&row)).transpose()
    }

    pub(crate) async fn index_rows(
        &self,
        schema: &Arc<EntitySchema>,
        index: &str,
        attrs: &[Value],
    ) -> Result<Vec<Arc<CachedRow>>, OrmError> {
        let definition = schema.index(index)?.clone();
        if definition.unique || definition.single {
            let unique = backing_unique(schema, &definition)?;
            return Ok(self.unique_row(schema, &unique, attrs).await?.into_iter().collect());
        }

        let binds = schema.bind_attributes(&definition, attrs)?;
        let hash = attribute_hash(&binds);
        let search = IdSearch {
            cached: definition.cached,
            local_key: LocalKey::Index {
                index: definition.name.clone(),
                hash,
            },
            redis_key: schema.index_key(&definition.name, hash),
            where_clause: definition.where_clause.clone(),
            order: definition.order_clause(),
            binds,
        };
        let ids = self.search_ids(schema, search).await?;
        let mut rows: Vec<Arc<CachedRow>> = self
            .load_rows(schema, &ids)
            .await?
            .into_iter()
            .flatten()
            .collect();
        if !definition.order_positions.is_empty() {
            rows.sort_by(|a, b| compare_by(&definition.order_positions, a, b));
        }
        Ok(rows)
    }

    /// Id from the unique HASH when the entity has an RCACHE pool; without
    /// one the lookup falls back to `SELECT ID ... LIMIT 1` on the database.
    async fn unique_row(
        &self,
        schema: &Arc<EntitySchema>,
        index: &IndexDefinition,
        attrs: &[Value],
    ) -> Result<Option<Arc<CachedRow>>, OrmError> {
        let binds = schema.bind_attributes(index, attrs)?;
        // NULL never collides in a unique index, so it is never stored.
        if binds.iter().any(BindValue::is_null) {
            return Ok(None);
        }
        let id = match self.schema_redis(schema)? {
            Some(_) => self.unique_id(schema, index, &binds).await?,
            None => {
                self.check_cancelled()?;
                let sql = schema.select_ids_sql(&index.where_clause, "LIMIT 1");
                let row = self.db(schema)?.query_row(self.db_loggers(), &sql, &binds).await?;
                row.map(|row| scan_i64(&row, 0))
                    .transpose()?
                    .flatten()
                    .and_then(|id| u64::try_from(id).ok())
            }
        };
        match id {
            Some(id) => Ok(self.load_rows(schema, &[id]).await?.pop().flatten()),
            None => Ok(None),
        }
    }

    /// HGET the attribute hash; a HASH that was never warmed is warmed first.
    async fn unique_id(
        &self,
        schema: &Arc<EntitySchema>,
        index: &IndexDefinition,
        binds: &[BindValue],
    ) -> Result<Option<u64>, OrmError> {
        let Some(redis) = self.schema_redis(schema)? else {
            return Ok(None);
        };
        let key = schema.unique_key(&index.name);
        let field = attribute_hash(binds).to_string();
        self.check_cancelled()?;
        if let Some(id) = redis.hget(&key, &field).await? {
            return Ok(id.parse().ok());
        }
        if redis.hget(&key, UNIQUE_VALID_FIELD).await?.is_some() {
            return Ok(None);
        }
        debug!(entity = schema.name(), index = %index.name, "unique index not warmed, loading");
        self.engine
            .load_unique_keys(self, false, std::slice::from_ref(schema))
            .await?;
        Ok(redis.hget(&key, &field).await?.and_then(|id| id.parse().ok()))
    }
}

/// The unique index answering lookups on `index`.
fn backing_unique(
    schema: &EntitySchema,
    index: &IndexDefinition,
) -> Result<IndexDefinition, OrmError> {
    if index.unique {
        return Ok(index.clone());
    }
    schema
        .unique_indexes()
        .find(|u| u.columns == index.columns)
        .cloned()
        .ok_or_else(|| OrmError::SchemaInvariant {
            entity: schema.name().to_string(),
            reason: format!("one-result index '{}' has no unique index behind it", index.name),
        })
}

fn compare_by(positions: &[usize], a: &CachedRow, b: &CachedRow) -> Ordering {
    positions
        .iter()
        .map(|p| a.row.values[*p].sort_cmp(&b.row.values[*p]))
        .find(|o| *o != Ordering::Equal)
        .unwrap_or_else(|| a.row.id.cmp(&b.row.id))
}
