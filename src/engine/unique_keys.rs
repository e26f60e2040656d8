// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Warming of the unique-index HASHes.
//!
//! Each unique index owns one HASH at `<prefix>:<index>` mapping the
//! attribute hash of a row to its id. A complete HASH carries the
//! `_is_valid` field; lookups that miss on an incomplete HASH land here.

use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::codec::BindValue;
use crate::context::Context;
use crate::error::OrmError;
use crate::hash::attribute_hash;
use crate::metrics;
use crate::schema::field::scan_i64;
use crate::schema::{EntitySchema, IndexDefinition, UNIQUE_VALID_FIELD};
use crate::storage::lock::Locker;

use super::Engine;

pub(crate) const UNIQUE_KEYS_LOCK: &str = "_orm_unique_keys_lock";

impl Engine {
    /// Rebuild the unique HASHes of `schemas` (all when empty) that are not
    /// marked complete, or all of them with `force`. Returns the number of
    /// ids written.
    #[instrument(skip(self, ctx, schemas), fields(schemas = schemas.len()))]
    pub async fn load_unique_keys(
        &self,
        ctx: &Context,
        force: bool,
        schemas: &[Arc<EntitySchema>],
    ) -> Result<usize, OrmError> {
        let targets: Vec<Arc<EntitySchema>> = if schemas.is_empty() {
            self.registry().schemas().cloned().collect()
        } else {
            schemas.to_vec()
        };

        let ttl = self.config().unique_keys_lock_ttl();
        let locker = Locker::new(self.default_redis()?.clone());
        let lock = locker
            .obtain(UNIQUE_KEYS_LOCK, ttl, ttl)
            .await?
            .ok_or_else(|| OrmError::LockTimeout(UNIQUE_KEYS_LOCK.to_string()))?;

        let mut outcome = Ok(0);
        'schemas: for schema in targets.iter().filter(|s| s.redis_pool().is_some()) {
            for index in schema.unique_indexes() {
                match self.load_unique_index(ctx, force, schema, index).await {
                    Ok(count) => {
                        outcome = outcome.map(|total| total + count);
                    }
                    Err(e) => {
                        outcome = Err(e);
                        break 'schemas;
                    }
                }
            }
        }
        lock.release().await?;
        outcome
    }

    async fn load_unique_index(
        &self,
        ctx: &Context,
        force: bool,
        schema: &EntitySchema,
        index: &IndexDefinition,
    ) -> Result<usize, OrmError> {
        let Some(code) = schema.redis_pool() else {
            return Ok(0);
        };
        let redis = ctx.redis(code)?;
        let key = schema.unique_key(&index.name);
        if !force && redis.hget(&key, UNIQUE_VALID_FIELD).await?.is_some() {
            debug!(entity = schema.name(), index = %index.name, "unique keys already loaded");
            return Ok(0);
        }
        redis.del(&[key.as_str()]).await?;

        let fields: Vec<_> = index.positions.iter().map(|p| &schema.fields()[*p]).collect();
        let projections: Vec<String> =
            fields.iter().map(|f| f.projection(schema.dialect())).collect();
        let not_null: Vec<String> =
            index.columns.iter().map(|c| format!("`{c}` IS NOT NULL")).collect();
        let page_size = self.config().unique_keys_page_size.max(1);
        let statement = self.db(schema.db_pool())?.prepare(format!(
            "SELECT `ID`, {} FROM `{}` WHERE {} AND `ID` > ? ORDER BY `ID` LIMIT {page_size}",
            projections.join(", "),
            schema.table(),
            not_null.join(" AND "),
        ));

        let mut last_id = 0u64;
        let mut loaded = 0;
        loop {
            ctx.check_cancelled()?;
            let rows = statement.query(ctx.db_loggers(), &[BindValue::UInt(last_id)]).await?;
            let mut entries = Vec::with_capacity(rows.len());
            for row in &rows {
                let id = scan_i64(row, 0)?
                    .and_then(|n| u64::try_from(n).ok())
                    .unwrap_or_default();
                let binds = fields
                    .iter()
                    .enumerate()
                    .map(|(i, field)| field.bind(&field.scan(row, i + 1)?))
                    .collect::<Result<Vec<_>, OrmError>>()?;
                entries.push((attribute_hash(&binds).to_string(), id.to_string()));
                last_id = last_id.max(id);
            }
            if !entries.is_empty() {
                redis.hset(&key, &entries).await?;
                loaded += entries.len();
            }
            if rows.len() < page_size {
                break;
            }
        }
        redis
            .hset(&key, &[(UNIQUE_VALID_FIELD.to_string(), "1".to_string())])
            .await?;
        metrics::record_unique_keys_loaded(schema.name(), &index.name, loaded);
        info!(entity = schema.name(), index = %index.name, loaded, "unique keys loaded");
        Ok(loaded)
    }
}
