// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Reads by id, cascading local → RCACHE → database.
//!
//! Every layer that misses is back-filled from the layer below it, including
//! negative results: an id the database does not know is cached as absent
//! so the next read stops at the first cache tier.
//!
//! In RCACHE a row is a list of encoded segments
//! `[structure_hash, id, col1, ..., colN]` whose concatenation is the row
//! image, or the single element [`NIL_MARKER`].

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::codec::{decode_row, encode_segments, BindValue, Row};
use crate::error::OrmError;
use crate::metrics;
use crate::schema::field::scan_i64;
use crate::schema::{Entity, EntitySchema, ValueReader, NIL_MARKER, VALID_MEMBER};
use crate::storage::local::{CachedRow, LocalKey, LocalValue};

use super::Context;

/// Ids per `SELECT ... WHERE ID IN (...)`.
const DB_CHUNK: usize = 1_000;

/// Rebuild an entity from a cached row, remembering its image.
pub(crate) fn materialize<E: Entity>(cached: &CachedRow) -> Result<E, OrmError> {
    let mut reader = ValueReader::new(E::entity_name(), cached.row.values.clone());
    let mut entity = E::from_values(cached.row.id, &mut reader)?;
    entity.set_id(cached.row.id);
    entity.meta_mut().image = Some(cached.image.clone());
    Ok(entity)
}

pub(crate) fn cached_row(
    schema: &EntitySchema,
    row: Row,
) -> Result<(Arc<CachedRow>, Vec<Vec<u8>>), OrmError> {
    let segments = encode_segments(schema, &row)?;
    let image: Arc<[u8]> = Arc::from(segments.concat());
    Ok((Arc::new(CachedRow { row, image }), segments))
}

enum RemoteRow {
    Hit(Arc<CachedRow>),
    Absent,
    Miss,
    /// Written by another schema version or damaged; evict it.
    Stale,
}

fn parse_remote(schema: &EntitySchema, segments: Vec<Vec<u8>>) -> RemoteRow {
    if segments.is_empty() {
        return RemoteRow::Miss;
    }
    if segments.len() == 1 && segments[0] == NIL_MARKER.as_bytes() {
        return RemoteRow::Absent;
    }
    let image = segments.concat();
    match decode_row(schema, &image) {
        Ok(row) => RemoteRow::Hit(Arc::new(CachedRow {
            row,
            image: Arc::from(image),
        })),
        Err(OrmError::CodecHashMismatch { expected, found }) => {
            debug!(
                entity = schema.name(),
                expected,
                found,
                "cached row from another schema version"
            );
            RemoteRow::Stale
        }
        Err(e) => {
            warn!(entity = schema.name(), error = %e, "undecodable cached row");
            RemoteRow::Stale
        }
    }
}

/// Where an id search looks before going to the database.
pub(crate) struct IdSearch {
    pub cached: bool,
    pub local_key: LocalKey,
    pub redis_key: String,
    pub where_clause: String,
    pub order: String,
    pub binds: Vec<BindValue>,
}

impl Context {
    #[instrument(skip(self), fields(entity = E::entity_name()))]
    pub async fn get_by_id<E: Entity>(&self, id: u64) -> Result<Option<E>, OrmError> {
        let schema = self.engine.schema_of::<E>()?.clone();
        let mut rows = self.load_rows(&schema, &[id]).await?;
        rows.pop()
            .flatten()
            .map(|row| materialize(&row))
            .transpose()
    }

    /// Entities for `ids`, in input order; `None` where a row does not exist.
    #[instrument(skip(self, ids), fields(entity = E::entity_name(), count = ids.len()))]
    pub async fn get_by_ids<E: Entity>(&self, ids: &[u64]) -> Result<Vec<Option<E>>, OrmError> {
        let schema = self.engine.schema_of::<E>()?.clone();
        self.load_rows(&schema, ids)
            .await?
            .into_iter()
            .map(|row| row.map(|r| materialize(&r)).transpose())
            .collect()
    }

    /// Rows whose reference `column` points at `parent`, ordered by id.
    #[instrument(skip(self), fields(entity = E::entity_name()))]
    pub async fn get_by_reference<E: Entity>(
        &self,
        column: &str,
        parent: u64,
    ) -> Result<Vec<E>, OrmError> {
        let schema = self.engine.schema_of::<E>()?.clone();
        let reference = schema.reference(column)?;
        if parent == 0 {
            return Ok(Vec::new());
        }
        let search = IdSearch {
            cached: reference.cached,
            local_key: LocalKey::Reference {
                column: reference.column.clone(),
                parent,
            },
            redis_key: schema.reference_key(&reference.column, parent),
            where_clause: schema.reference_where(&reference.column),
            order: "ORDER BY `ID`".to_string(),
            binds: vec![BindValue::UInt(parent)],
        };
        let ids = self.search_ids(&schema, search).await?;
        self.load_rows(&schema, &ids)
            .await?
            .into_iter()
            .flatten()
            .map(|row| materialize(&row))
            .collect()
    }

    /// Rows for `ids` in input order, filling every cache tier that missed.
    pub(crate) async fn load_rows(
        &self,
        schema: &Arc<EntitySchema>,
        ids: &[u64],
    ) -> Result<Vec<Option<Arc<CachedRow>>>, OrmError> {
        let entity = schema.name();
        let mut wanted: Vec<u64> = Vec::with_capacity(ids.len());
        for id in ids {
            if *id != 0 && !wanted.contains(id) {
                wanted.push(*id);
            }
        }
        // Some(None) is a known-absent row.
        let mut found: HashMap<u64, Option<Arc<CachedRow>>> = HashMap::with_capacity(wanted.len());

        let local = self.schema_local(schema)?;
        if let Some(local) = &local {
            let keys: Vec<LocalKey> = wanted.iter().map(|id| LocalKey::Row(*id)).collect();
            for (id, value) in wanted.iter().zip(local.get_many(entity, &keys)) {
                match value {
                    Some(LocalValue::Row(row)) => {
                        metrics::record_lookup("local", entity, "hit");
                        found.insert(*id, Some(row));
                    }
                    Some(LocalValue::Absent) => {
                        metrics::record_lookup("local", entity, "absent");
                        found.insert(*id, None);
                    }
                    _ => metrics::record_lookup("local", entity, "miss"),
                }
            }
        }

        let redis = self.schema_redis(schema)?;
        if let Some(redis) = &redis {
            let missing: Vec<u64> =
                wanted.iter().copied().filter(|id| !found.contains_key(id)).collect();
            if !missing.is_empty() {
                self.check_cancelled()?;
                let mut pipeline = redis.pipeline();
                let handles: Vec<_> = missing
                    .iter()
                    .map(|id| pipeline.lrange(&schema.row_key(*id), 0, -1))
                    .collect();
                let replies = pipeline.exec().await?;
                let mut backfill = Vec::new();
                let mut stale = Vec::new();
                for (id, handle) in missing.iter().zip(handles) {
                    match parse_remote(schema, replies.get(handle)?) {
                        RemoteRow::Hit(row) => {
                            metrics::record_lookup("redis", entity, "hit");
                            backfill.push((LocalKey::Row(*id), LocalValue::Row(row.clone())));
                            found.insert(*id, Some(row));
                        }
                        RemoteRow::Absent => {
                            metrics::record_lookup("redis", entity, "absent");
                            backfill.push((LocalKey::Row(*id), LocalValue::Absent));
                            found.insert(*id, None);
                        }
                        RemoteRow::Miss => metrics::record_lookup("redis", entity, "miss"),
                        RemoteRow::Stale => {
                            metrics::record_lookup("redis", entity, "miss");
                            stale.push(schema.row_key(*id));
                        }
                    }
                }
                if !stale.is_empty() {
                    let keys: Vec<&str> = stale.iter().map(String::as_str).collect();
                    redis.del(&keys).await?;
                }
                if let Some(local) = &local {
                    local.multi_set(entity, backfill);
                }
            }
        }

        let missing: Vec<u64> =
            wanted.iter().copied().filter(|id| !found.contains_key(id)).collect();
        if !missing.is_empty() {
            let db = self.db(schema)?;
            let mut loaded: HashMap<u64, (Arc<CachedRow>, Vec<Vec<u8>>)> = HashMap::new();
            for chunk in missing.chunks(DB_CHUNK) {
                self.check_cancelled()?;
                let args: Vec<BindValue> = chunk.iter().map(|id| BindValue::UInt(*id)).collect();
                let sql = if chunk.len() == 1 {
                    schema.select_by_id_sql()
                } else {
                    schema.select_by_ids_sql(chunk.len())
                };
                for raw in db.query(self.db_loggers(), &sql, &args).await? {
                    let row = schema.scan_row(&raw)?;
                    let id = row.id;
                    loaded.insert(id, cached_row(schema, row)?);
                }
            }
            debug!(
                entity,
                requested = missing.len(),
                loaded = loaded.len(),
                "rows loaded from database"
            );

            let mut pipeline = redis.as_ref().map(|r| {
                let mut p = r.pipeline();
                p.atomic();
                p
            });
            let mut backfill = Vec::with_capacity(missing.len());
            for id in &missing {
                let key = schema.row_key(*id);
                match loaded.remove(id) {
                    Some((row, segments)) => {
                        metrics::record_lookup("db", entity, "hit");
                        if let Some(p) = pipeline.as_mut() {
                            p.del(&key);
                            p.rpush(&key, segments.as_slice());
                        }
                        backfill.push((LocalKey::Row(*id), LocalValue::Row(row.clone())));
                        found.insert(*id, Some(row));
                    }
                    None => {
                        metrics::record_lookup("db", entity, "absent");
                        if let Some(p) = pipeline.as_mut() {
                            p.del(&key);
                            p.rpush(&key, &[NIL_MARKER]);
                        }
                        backfill.push((LocalKey::Row(*id), LocalValue::Absent));
                        found.insert(*id, None);
                    }
                }
            }
            if let Some(mut p) = pipeline {
                p.exec().await?;
            }
            if let Some(local) = &local {
                local.multi_set(entity, backfill);
            }
        }

        Ok(ids
            .iter()
            .map(|id| found.get(id).cloned().flatten())
            .collect())
    }

    /// Ids matching a cached index or reference search.
    ///
    /// A complete set in RCACHE carries [`VALID_MEMBER`]; without it the
    /// database is queried and the set rebuilt.
    pub(crate) async fn search_ids(
        &self,
        schema: &Arc<EntitySchema>,
        search: IdSearch,
    ) -> Result<Vec<u64>, OrmError> {
        let entity = schema.name();
        let local = if search.cached { self.schema_local(schema)? } else { None };
        let redis = if search.cached { self.schema_redis(schema)? } else { None };

        if let Some(local) = &local {
            if let Some(LocalValue::Ids(ids)) = local.get(entity, &search.local_key) {
                metrics::record_lookup("local", entity, "hit");
                return Ok(ids.as_ref().clone());
            }
            metrics::record_lookup("local", entity, "miss");
        }

        if let Some(redis) = &redis {
            self.check_cancelled()?;
            let members = redis.smembers(&search.redis_key).await?;
            if members.iter().any(|m| m == VALID_MEMBER) {
                metrics::record_lookup("redis", entity, "hit");
                let mut ids: Vec<u64> = members.iter().filter_map(|m| m.parse().ok()).collect();
                ids.sort_unstable();
                if let Some(local) = &local {
                    local.set(entity, search.local_key, LocalValue::Ids(Arc::new(ids.clone())));
                }
                return Ok(ids);
            }
            metrics::record_lookup("redis", entity, "miss");
        }

        self.check_cancelled()?;
        let sql = schema.select_ids_sql(&search.where_clause, &search.order);
        let rows = self.db(schema)?.query(self.db_loggers(), &sql, &search.binds).await?;
        let ids = rows
            .iter()
            .map(|row| {
                scan_i64(row, 0)?
                    .and_then(|id| u64::try_from(id).ok())
                    .ok_or_else(|| {
                        OrmError::CodecIo(format!("{entity} search returned an invalid ID"))
                    })
            })
            .collect::<Result<Vec<u64>, _>>()?;
        metrics::record_lookup("db", entity, if ids.is_empty() { "absent" } else { "hit" });

        if let Some(redis) = &redis {
            let mut members = vec![VALID_MEMBER.to_string()];
            if ids.is_empty() {
                members.push(NIL_MARKER.to_string());
            } else {
                members.extend(ids.iter().map(u64::to_string));
            }
            let mut pipeline = redis.pipeline();
            pipeline.atomic();
            pipeline.del(&search.redis_key);
            pipeline.sadd(&search.redis_key, &members);
            pipeline.exec().await?;
        }
        if let Some(local) = &local {
            local.set(entity, search.local_key, LocalValue::Ids(Arc::new(ids.clone())));
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::{engine, Post, User};
    use crate::schema::Ref;

    #[test]
    fn test_parse_remote_markers() {
        let schema = crate::schema::test_support::compile({
            let mut def = crate::schema::EntityDefinition::new("User");
            def.field("Name", crate::schema::FieldKind::String);
            def
        });
        assert!(matches!(parse_remote(&schema, Vec::new()), RemoteRow::Miss));
        let nil = vec![NIL_MARKER.as_bytes().to_vec()];
        assert!(matches!(parse_remote(&schema, nil), RemoteRow::Absent));
        assert!(matches!(parse_remote(&schema, vec![vec![0xff]]), RemoteRow::Stale));

        let (row, segments) = cached_row(&schema, Row::new(3, vec!["Tom".into()])).unwrap();
        match parse_remote(&schema, segments) {
            RemoteRow::Hit(hit) => assert_eq!(hit, row),
            _ => panic!("expected a hit"),
        }
    }

    #[tokio::test]
    async fn test_get_by_ids_keeps_input_order() {
        let engine = engine().await;
        let mut ctx = engine.new_context();
        let ann = ctx.track(User::new("Ann", 20)).unwrap();
        let bob = ctx.track(User::new("Bob", 30)).unwrap();
        ctx.flush().await.unwrap();

        let users: Vec<Option<User>> =
            ctx.get_by_ids(&[bob.id(), 404, ann.id(), bob.id()]).await.unwrap();
        let names: Vec<Option<String>> = users.into_iter().map(|u| u.map(|u| u.name)).collect();
        assert_eq!(
            names,
            vec![Some("Bob".to_string()), None, Some("Ann".to_string()), Some("Bob".to_string())]
        );
        assert!(ctx.get_by_id::<User>(0).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_remote_row_is_replaced() {
        let engine = engine().await;
        let mut ctx = engine.new_context();
        let ann = ctx.track(User::new("Ann", 20)).unwrap();
        ctx.flush().await.unwrap();

        let schema = engine.schema_of::<User>().unwrap();
        let key = schema.row_key(ann.id());
        let redis = ctx.redis("default").unwrap();
        redis.rpush(&key, &[vec![0xffu8, 0x01]]).await.unwrap();
        engine.local("default").unwrap().clear(Some("User"));

        let user: User = ctx.get_by_id(ann.id()).await.unwrap().unwrap();
        assert_eq!(user.name, "Ann");
        assert!(user.meta.image.is_some());
        assert_eq!(redis.lrange(&key, 0, -1).await.unwrap().len(), schema.fields().len() + 2);
    }

    #[tokio::test]
    async fn test_reference_search_caches_ids() {
        let engine = engine().await;
        let mut ctx = engine.new_context();
        let ann = ctx.track(User::new("Ann", 20)).unwrap();
        ctx.track(Post::new("one", Ref::from(&ann))).unwrap();
        ctx.track(Post::new("two", Ref::from(&ann))).unwrap();
        ctx.flush().await.unwrap();

        let posts: Vec<Post> = ctx.get_by_reference("Author", ann.id()).await.unwrap();
        assert_eq!(posts.iter().map(|p| p.title.as_str()).collect::<Vec<_>>(), ["one", "two"]);

        let schema = engine.schema_of::<Post>().unwrap();
        let members = ctx
            .redis("default")
            .unwrap()
            .smembers(&schema.reference_key("Author", ann.id()))
            .await
            .unwrap();
        assert_eq!(members.len(), 3);
        assert!(members.iter().any(|m| m == VALID_MEMBER));

        assert!(ctx.get_by_reference::<Post>("Author", 0).await.unwrap().is_empty());
        assert!(ctx.get_by_reference::<Post>("Title", ann.id()).await.is_err());
    }
}
