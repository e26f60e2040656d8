// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cache invalidation after a write.
//!
//! A write is reduced to an [`Eviction`]: the index sets, reference sets and
//! unique HASH fields it makes stale. Synchronous flushes apply it right
//! away on the context's per-pool pipelines. Async flushes apply it when
//! queued and ship it inside the queue payload, so the consumer can apply
//! it again once the statement has reached the database.

use std::collections::BTreeSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::error::OrmError;
use crate::hash::attribute_hash;
use crate::schema::{EntitySchema, IndexDefinition, Value, SEARCH_CHANNEL, UNIQUE_VALID_FIELD};
use crate::storage::local::{CachedRow, LocalCache, LocalKey, LocalValue};
use crate::storage::redis::RedisPipeline;

use super::flush::ActionKind;
use super::Context;

/// What one write did to one row.
pub(crate) struct Change<'a> {
    pub schema: &'a Arc<EntitySchema>,
    /// 0 for an insert that is still waiting in an async queue.
    pub id: u64,
    pub kind: ActionKind,
    /// Stored values before the write, when known.
    pub old: Option<&'a [Value]>,
    /// Values after the write, `None` once the row is gone.
    pub new: Option<&'a [Value]>,
    pub changed: &'a [usize],
    pub async_mode: bool,
}

impl Change<'_> {
    /// Whether the write can move the row in or out of a key derived from
    /// `positions`.
    fn touches(&self, tracks: impl Fn(usize) -> bool) -> bool {
        match self.kind {
            ActionKind::Update => self.changed.iter().any(|p| tracks(*p)),
            ActionKind::Insert | ActionKind::Upsert | ActionKind::Delete => true,
        }
    }

    fn sides(&self) -> impl Iterator<Item = &[Value]> {
        self.old.into_iter().chain(self.new)
    }
}

fn attribute_hashes(
    schema: &EntitySchema,
    index: &IndexDefinition,
    change: &Change<'_>,
) -> Result<BTreeSet<u64>, OrmError> {
    let mut hashes = BTreeSet::new();
    for values in change.sides() {
        hashes.insert(attribute_hash(&schema.bind_positions(&index.positions, values)?));
    }
    Ok(hashes)
}

/// Cache entries one write makes stale.
///
/// `id` is 0 for an insert that has not reached the database; whoever
/// applies the eviction afterwards passes the assigned id in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Eviction {
    pub entity: String,
    #[serde(default)]
    pub id: u64,
    /// Cached non-unique index sets as `(index, attribute hash)`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<(String, u64)>,
    /// Cached reference sets as `(column, parent id)`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub references: Vec<(String, u64)>,
    /// Unique HASH fields the row no longer owns.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unique_del: Vec<(String, u64)>,
    /// Unique HASH fields that now point at the row.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unique_set: Vec<(String, u64)>,
    /// `index` or `delete` for entities with a full-text index.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
}

impl Eviction {
    pub(crate) fn from_change(change: &Change<'_>) -> Result<Self, OrmError> {
        let schema = change.schema;
        let mut eviction = Eviction {
            entity: schema.name().to_string(),
            id: change.id,
            ..Eviction::default()
        };

        for index in schema.cached_indexes() {
            if index.unique || !change.touches(|p| index.is_tracking(p)) {
                continue;
            }
            for hash in attribute_hashes(schema, index, change)? {
                eviction.indexes.push((index.name.clone(), hash));
            }
        }

        let fake_delete = schema.fake_delete_position();
        for reference in schema.references() {
            let tracks = |p: usize| p == reference.position || Some(p) == fake_delete;
            if !reference.cached || !change.touches(tracks) {
                continue;
            }
            let parents: BTreeSet<u64> = change
                .sides()
                .filter_map(|values| values[reference.position].as_u64())
                .filter(|parent| *parent != 0)
                .collect();
            for parent in parents {
                eviction.references.push((reference.column.clone(), parent));
            }
        }

        // NULL attributes are never stored in a unique HASH.
        for index in schema.unique_indexes() {
            if !change.touches(|p| index.positions.contains(&p)) {
                continue;
            }
            let old = match change.old {
                Some(values) => Some(schema.bind_positions(&index.positions, values)?),
                None => None,
            };
            let new = match change.new {
                Some(values) => Some(schema.bind_positions(&index.positions, values)?),
                None => None,
            };
            if let Some(binds) = old.filter(|b| !b.iter().any(|v| v.is_null())) {
                if new.as_ref() != Some(&binds) {
                    eviction.unique_del.push((index.name.clone(), attribute_hash(&binds)));
                }
            }
            if let Some(binds) = new.filter(|b| !b.iter().any(|v| v.is_null())) {
                eviction.unique_set.push((index.name.clone(), attribute_hash(&binds)));
            }
        }

        if schema.search().is_some() {
            let action = if change.new.is_some() { "index" } else { "delete" };
            eviction.search = Some(action.to_string());
        }
        Ok(eviction)
    }

    /// Index and reference entries; the row itself is handled by the caller.
    pub(crate) fn evict_local(&self, local: &LocalCache) {
        let keys: Vec<LocalKey> = self
            .indexes
            .iter()
            .map(|(index, hash)| LocalKey::Index {
                index: index.clone(),
                hash: *hash,
            })
            .chain(self.references.iter().map(|(column, parent)| LocalKey::Reference {
                column: column.clone(),
                parent: *parent,
            }))
            .collect();
        if !keys.is_empty() {
            local.remove(&self.entity, &keys);
        }
    }

    /// Queue the RCACHE side on the schema's pool. With `id` 0 the unique
    /// HASHes lose their `_is_valid` sentinel so the next lookup rebuilds
    /// them.
    pub(crate) fn queue_redis(&self, schema: &EntitySchema, id: u64, pipeline: &mut RedisPipeline) {
        if id != 0 {
            pipeline.del(&schema.row_key(id));
        }
        for (index, hash) in &self.indexes {
            pipeline.del(&schema.index_key(index, *hash));
        }
        for (column, parent) in &self.references {
            pipeline.del(&schema.reference_key(column, *parent));
        }
        for (index, hash) in &self.unique_del {
            pipeline.hdel(&schema.unique_key(index), &hash.to_string());
        }
        for (index, hash) in &self.unique_set {
            let key = schema.unique_key(index);
            if id == 0 {
                pipeline.hdel(&key, UNIQUE_VALID_FIELD);
            } else {
                pipeline.hset(&key, &hash.to_string(), &id.to_string());
            }
        }
    }

    /// Re-index request on the search channel; nothing without an id.
    pub(crate) fn queue_search(&self, id: u64, pipeline: &mut RedisPipeline) {
        let Some(action) = &self.search else {
            return;
        };
        if id == 0 {
            return;
        }
        pipeline.xadd(
            SEARCH_CHANNEL,
            &[
                ("entity".to_string(), self.entity.clone()),
                ("id".to_string(), id.to_string()),
                ("action".to_string(), action.clone()),
            ],
        );
    }
}

impl Context {
    /// Apply a write to the caches. Returns the eviction so async flushes
    /// can ship it to the consumer.
    pub(crate) fn invalidate(
        &mut self,
        change: Change<'_>,
        new_row: Option<Arc<CachedRow>>,
    ) -> Result<Eviction, OrmError> {
        let schema = change.schema;
        let entity = schema.name();
        let local = self.schema_local(schema)?;
        trace!(entity, id = change.id, kind = change.kind.as_str(), "invalidating");

        if change.id != 0 {
            if let Some(local) = &local {
                match (&new_row, change.kind) {
                    (Some(row), _) => {
                        local.set(entity, LocalKey::Row(change.id), LocalValue::Row(row.clone()))
                    }
                    (None, ActionKind::Delete) if !change.async_mode => {
                        local.set(entity, LocalKey::Row(change.id), LocalValue::Absent)
                    }
                    (None, _) => local.remove(entity, &[LocalKey::Row(change.id)]),
                }
            }
        }

        let eviction = Eviction::from_change(&change)?;
        if let Some(local) = &local {
            eviction.evict_local(local);
        }
        if let Some(pool) = schema.redis_pool() {
            eviction.queue_redis(schema, change.id, self.redis_pipeline(pool)?);
        }
        if eviction.search.is_some() {
            let pool = self.engine.config().default_redis_pool.clone();
            eviction.queue_search(change.id, self.redis_pipeline(&pool)?);
        }
        Ok(eviction)
    }
}

#[cfg(test)]
mod tests {
    use crate::context::test_support::{engine, Post, User};
    use crate::context::Context;
    use crate::schema::{Ref, Value, UNIQUE_VALID_FIELD};

    async fn users_aged(ctx: &Context, age: u16) -> Vec<User> {
        ctx.get_by_index("ByAge", &[Value::from(age)]).await.unwrap()
    }

    #[tokio::test]
    async fn test_rename_moves_unique_entry() {
        let engine = engine().await;
        let mut ctx = engine.new_context();
        let tom = ctx.track(User::new("Tom", 30)).unwrap();
        ctx.flush().await.unwrap();

        tom.write().name = "Thomas".to_string();
        ctx.track(&tom).unwrap();
        ctx.flush().await.unwrap();

        let old: Option<User> = ctx
            .get_by_unique_index("Name", &[Value::from("Tom")])
            .await
            .unwrap();
        assert!(old.is_none());
        let new: Option<User> = ctx
            .get_by_unique_index("Name", &[Value::from("Thomas")])
            .await
            .unwrap();
        assert_eq!(new.map(|u| u.id), Some(tom.id()));
    }

    #[tokio::test]
    async fn test_index_membership_follows_update() {
        let engine = engine().await;
        let mut ctx = engine.new_context();
        let ann = ctx.track(User::new("Ann", 20)).unwrap();
        ctx.flush().await.unwrap();
        assert_eq!(users_aged(&ctx, 20).await.len(), 1);

        ann.write().age = 21;
        ctx.track(&ann).unwrap();
        ctx.flush().await.unwrap();
        assert!(users_aged(&ctx, 20).await.is_empty());
        assert_eq!(users_aged(&ctx, 21).await.len(), 1);
    }

    #[tokio::test]
    async fn test_reference_set_refreshed_on_new_child() {
        let engine = engine().await;
        let mut ctx = engine.new_context();
        let author = ctx.track(User::new("Ann", 40)).unwrap();
        ctx.flush().await.unwrap();
        assert!(ctx.get_by_reference::<Post>("Author", author.id()).await.unwrap().is_empty());

        ctx.track(Post::new("first", Ref::from(&author))).unwrap();
        ctx.flush().await.unwrap();
        let posts: Vec<Post> = ctx.get_by_reference("Author", author.id()).await.unwrap();
        assert_eq!(posts.len(), 1);
        assert_eq!(posts[0].title, "first");
    }

    #[tokio::test]
    async fn test_async_insert_invalidates_unique_hash() {
        let engine = engine().await;
        let mut ctx = engine.new_context();
        ctx.track(User::new("Tom", 30)).unwrap();
        ctx.flush().await.unwrap();
        engine.load_unique_keys(&ctx, true, &[]).await.unwrap();

        let schema = engine.schema_of::<User>().unwrap();
        let redis = ctx.redis("default").unwrap();
        let key = schema.unique_key("Name");
        assert!(redis.hget(&key, UNIQUE_VALID_FIELD).await.unwrap().is_some());

        ctx.track(User::new("Queued", 1)).unwrap();
        ctx.flush_async().await.unwrap();
        assert!(redis.hget(&key, UNIQUE_VALID_FIELD).await.unwrap().is_none());
    }
}
