// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Full-text index maintenance.
//!
//! The engine creates RediSearch indexes and walks tables to produce
//! documents. Where the documents end up is decided by the
//! [`DocumentPusher`]; [`RedisHashPusher`] writes them as HASHes under the
//! index prefix.

use async_trait::async_trait;
use tracing::{debug, info, instrument};

use crate::codec::BindValue;
use crate::context::Context;
use crate::error::OrmError;
use crate::metrics;
use crate::schema::{DocumentAdd, DocumentPusher, Entity, EntitySchema};
use crate::storage::redis::RedisCache;

use super::Engine;

/// Writes documents as HASHes, replacing whatever was stored before.
#[derive(Debug, Clone)]
pub struct RedisHashPusher {
    cache: RedisCache,
}

impl RedisHashPusher {
    pub fn new(cache: RedisCache) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl DocumentPusher for RedisHashPusher {
    async fn push(&mut self, documents: Vec<DocumentAdd>) -> Result<(), OrmError> {
        if documents.is_empty() {
            return Ok(());
        }
        let mut pipeline = self.cache.pipeline();
        for document in &documents {
            pipeline.del(&document.key);
            if !document.fields.is_empty() {
                pipeline.hset_many(&document.key, &document.fields);
            }
        }
        pipeline.exec().await?;
        Ok(())
    }
}

fn search_schema<'a>(engine: &'a Engine, entity: &str) -> Result<&'a EntitySchema, OrmError> {
    let schema = engine.schema(entity)?;
    if schema.search().is_none() {
        return Err(OrmError::InvalidArgument(format!(
            "entity '{entity}' has no searchable fields"
        )));
    }
    Ok(schema)
}

impl Engine {
    /// `FT.CREATE` the index of `entity`. Returns `false` when it exists.
    pub async fn ensure_search_index(&self, entity: &str) -> Result<bool, OrmError> {
        let schema = search_schema(self, entity)?;
        let Some(descriptor) = schema.search() else {
            return Ok(false);
        };
        let cache = self.redis(&descriptor.pool)?;
        match cache.ft("FT.CREATE", &descriptor.ft_create_args(cache.namespace())).await {
            Ok(_) => {
                info!(entity, index = %descriptor.name, "search index created");
                Ok(true)
            }
            Err(e) if e.to_string().contains("Index already exists") => {
                debug!(entity, index = %descriptor.name, "search index exists");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Push a document for every row of `E`, one page at a time. Returns
    /// the number of documents pushed.
    #[instrument(skip(self, ctx, pusher), fields(entity = E::entity_name()))]
    pub async fn run_search_indexer<E: Entity>(
        &self,
        ctx: &Context,
        pusher: &mut dyn DocumentPusher,
    ) -> Result<usize, OrmError> {
        let schema = search_schema(self, E::entity_name())?;
        let Some(descriptor) = schema.search() else {
            return Ok(0);
        };
        let page_size = self.config().search_page_size.max(1);
        let statement = self.db(schema.db_pool())?.prepare(format!(
            "SELECT {} FROM `{}` WHERE `ID` > ? ORDER BY `ID` LIMIT {page_size}",
            schema.fields_query(),
            schema.table(),
        ));

        let mut last_id = 0u64;
        let mut pushed = 0;
        loop {
            ctx.check_cancelled()?;
            let rows = statement.query(ctx.db_loggers(), &[BindValue::UInt(last_id)]).await?;
            let mut documents = Vec::with_capacity(rows.len());
            for row in &rows {
                let row = schema.scan_row(row)?;
                last_id = last_id.max(row.id);
                documents.push(descriptor.document(row.id, &row.values));
            }
            let count = documents.len();
            if count > 0 {
                pusher.push(documents).await?;
                pushed += count;
                metrics::record_search_documents(schema.name(), count);
            }
            if rows.len() < page_size {
                break;
            }
        }
        info!(entity = schema.name(), pushed, "search indexer finished");
        Ok(pushed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::{engine_from, registry, User};
    use crate::schema::{EntityDefinition, EntityMeta, FieldKind, Value, ValueReader};

    #[derive(Debug, Clone, Default)]
    struct Article {
        id: u64,
        title: String,
        views: u32,
        meta: EntityMeta,
    }

    impl Entity for Article {
        fn entity_name() -> &'static str {
            "Article"
        }
        fn define(def: &mut EntityDefinition) {
            def.redis_search("default");
            def.field("Title", FieldKind::String).searchable().sortable();
            def.field("Views", FieldKind::UInt32).searchable();
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
            vec![self.title.as_str().into(), self.views.into()]
        }
        fn from_values(id: u64, r: &mut ValueReader) -> Result<Self, OrmError> {
            Ok(Self {
                id,
                title: r.string()?,
                views: r.u32()?,
                meta: EntityMeta::default(),
            })
        }
    }

    #[derive(Default)]
    struct Collecting {
        batches: Vec<Vec<DocumentAdd>>,
    }

    #[async_trait]
    impl DocumentPusher for Collecting {
        async fn push(&mut self, documents: Vec<DocumentAdd>) -> Result<(), OrmError> {
            self.batches.push(documents);
            Ok(())
        }
    }

    async fn article_engine(page_size: usize) -> Engine {
        let mut registry = registry();
        registry.register_entity::<Article>();
        registry.config_mut().search_page_size = page_size;
        engine_from(registry).await
    }

    #[tokio::test]
    async fn test_indexer_pages_through_table() {
        let engine = article_engine(2).await;
        let mut ctx = engine.new_context();
        for (title, views) in [("a", 1), ("b", 2), ("c", 3)] {
            ctx.track(Article {
                title: title.into(),
                views,
                ..Article::default()
            })
            .unwrap();
        }
        ctx.flush().await.unwrap();

        let mut pusher = Collecting::default();
        assert_eq!(engine.run_search_indexer::<Article>(&ctx, &mut pusher).await.unwrap(), 3);
        assert_eq!(pusher.batches.len(), 2);
        let first = &pusher.batches[0][0];
        assert!(first.key.ends_with(&format!(":doc:{}", first.id)));
        assert_eq!(first.fields[0], ("Title".to_string(), "a".to_string()));
        assert_eq!(first.fields[1], ("Views".to_string(), "1".to_string()));
    }

    #[tokio::test]
    async fn test_hash_pusher_writes_documents() {
        let engine = article_engine(10).await;
        let mut ctx = engine.new_context();
        let article = ctx
            .track(Article {
                title: "hello".into(),
                views: 7,
                ..Article::default()
            })
            .unwrap();
        ctx.flush().await.unwrap();

        let cache = engine.redis("default").unwrap().clone();
        let mut pusher = RedisHashPusher::new(cache.clone());
        engine.run_search_indexer::<Article>(&ctx, &mut pusher).await.unwrap();

        let schema = engine.schema_of::<Article>().unwrap();
        let key = schema.search().unwrap().document_key(article.id());
        assert_eq!(cache.hget(&key, "Title").await.unwrap(), Some("hello".to_string()));
        assert_eq!(cache.hget(&key, "Views").await.unwrap(), Some("7".to_string()));
    }

    #[tokio::test]
    async fn test_entity_without_search_is_rejected() {
        let engine = article_engine(10).await;
        let ctx = engine.new_context();
        let mut pusher = Collecting::default();
        assert!(matches!(
            engine.run_search_indexer::<User>(&ctx, &mut pusher).await,
            Err(OrmError::InvalidArgument(_))
        ));
        assert!(engine.ensure_search_index("User").await.is_err());
    }
}
