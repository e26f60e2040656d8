// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-request state.
//!
//! A [`Context`] is the unit callers work through: it reads entities
//! through the cache tiers, tracks changes and flushes them. It is owned by
//! one task; fan-out clones it, which shares the engine, loggers, options
//! and cancellation but starts with an empty tracked set and no pending
//! pipelines.
//!
//! The operations live in sibling modules:
//!
//! - [`loader`](self::loader): `get_by_id`, `get_by_ids`, `get_by_reference`
//! - [`index`](self::index): `get_by_index`, `get_by_unique_index`
//! - [`flush`](self::flush): `track`, `delete`, `flush` and friends
//! - [`invalidate`](self::invalidate): cache invalidation after writes
//! - [`logging`]: query loggers

mod flush;
mod index;
mod invalidate;
mod loader;
pub mod logging;

pub use flush::IntoTracked;
pub(crate) use flush::{decode_payload, QueuedStatement};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::watch;
use tracing::warn;

use crate::engine::Engine;
use crate::error::OrmError;
use crate::metrics;
use crate::schema::EntitySchema;
use crate::storage::local::LocalCache;
use crate::storage::redis::{RedisCache, RedisPipeline};
use crate::storage::sql::DbPool;

use self::flush::TrackedEntry;
use self::logging::{LoggerSet, QueryLogger, TracingQueryLogger};

pub struct Context {
    engine: Engine,
    cancel_tx: Arc<watch::Sender<bool>>,
    cancel_rx: watch::Receiver<bool>,
    parent: Option<watch::Receiver<bool>>,
    db_loggers: LoggerSet,
    redis_loggers: LoggerSet,
    local_loggers: LoggerSet,
    options: HashMap<String, serde_json::Value>,
    tracked: Vec<TrackedEntry>,
    /// Record address → position in `tracked`.
    slots: HashMap<usize, usize>,
    pipelines: BTreeMap<String, RedisPipeline>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("tracked", &self.tracked.len())
            .field("pipelines", &self.pipelines.keys().collect::<Vec<_>>())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl Clone for Context {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            cancel_tx: self.cancel_tx.clone(),
            cancel_rx: self.cancel_rx.clone(),
            parent: self.parent.clone(),
            db_loggers: self.db_loggers.clone(),
            redis_loggers: self.redis_loggers.clone(),
            local_loggers: self.local_loggers.clone(),
            options: self.options.clone(),
            tracked: Vec::new(),
            slots: HashMap::new(),
            pipelines: BTreeMap::new(),
        }
    }
}

impl Context {
    pub(crate) fn new(engine: Engine, parent: Option<watch::Receiver<bool>>) -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            engine,
            cancel_tx: Arc::new(tx),
            cancel_rx: rx,
            parent,
            db_loggers: LoggerSet::default(),
            redis_loggers: LoggerSet::default(),
            local_loggers: LoggerSet::default(),
            options: HashMap::new(),
            tracked: Vec::new(),
            slots: HashMap::new(),
            pipelines: BTreeMap::new(),
        }
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Cancel this context and every clone of it.
    pub fn cancel(&self) {
        self.cancel_tx.send_replace(true);
    }

    /// Receiver children can be created from.
    pub fn cancel_token(&self) -> watch::Receiver<bool> {
        self.cancel_rx.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow() || self.parent.as_ref().is_some_and(|p| *p.borrow())
    }

    pub(crate) fn check_cancelled(&self) -> Result<(), OrmError> {
        if self.is_cancelled() {
            Err(OrmError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once the context is cancelled.
    pub async fn cancelled(&self) {
        let own = wait_true(self.cancel_rx.clone());
        match self.parent.clone() {
            Some(parent) => {
                tokio::select! {
                    _ = own => {}
                    _ = wait_true(parent) => {}
                }
            }
            None => own.await,
        }
    }

    pub fn add_db_logger(&mut self, logger: Arc<dyn QueryLogger>) {
        self.db_loggers.push(logger);
    }

    pub fn add_redis_logger(&mut self, logger: Arc<dyn QueryLogger>) {
        self.redis_loggers.push(logger);
    }

    pub fn add_local_logger(&mut self, logger: Arc<dyn QueryLogger>) {
        self.local_loggers.push(logger);
    }

    /// Send every tier's queries to `tracing` at debug level.
    pub fn enable_query_debug(&mut self) {
        let logger: Arc<dyn QueryLogger> = Arc::new(TracingQueryLogger);
        self.add_db_logger(logger.clone());
        self.add_redis_logger(logger.clone());
        self.add_local_logger(logger);
    }

    pub(crate) fn db_loggers(&self) -> &LoggerSet {
        &self.db_loggers
    }

    /// Per-plugin option.
    pub fn set_option(&mut self, key: &str, value: serde_json::Value) {
        self.options.insert(key.to_string(), value);
    }

    pub fn option(&self, key: &str) -> Option<&serde_json::Value> {
        self.options.get(key)
    }

    pub(crate) fn db(&self, schema: &EntitySchema) -> Result<&DbPool, OrmError> {
        self.engine.db(schema.db_pool())
    }

    pub(crate) fn redis(&self, code: &str) -> Result<RedisCache, OrmError> {
        let cache = self.engine.redis(code)?;
        Ok(if self.redis_loggers.is_empty() {
            cache.clone()
        } else {
            cache.with_loggers(self.redis_loggers.clone())
        })
    }

    pub(crate) fn default_redis(&self) -> Result<RedisCache, OrmError> {
        self.redis(&self.engine.config().default_redis_pool)
    }

    pub(crate) fn schema_redis(
        &self,
        schema: &EntitySchema,
    ) -> Result<Option<RedisCache>, OrmError> {
        schema.redis_pool().map(|code| self.redis(code)).transpose()
    }

    pub(crate) fn schema_local(
        &self,
        schema: &EntitySchema,
    ) -> Result<Option<LocalCache>, OrmError> {
        schema
            .local_pool()
            .map(|code| {
                let cache = self.engine.local(code)?;
                Ok(if self.local_loggers.is_empty() {
                    cache.clone()
                } else {
                    cache.with_loggers(self.local_loggers.clone())
                })
            })
            .transpose()
    }

    /// Pipeline accumulated for `pool`, created on first use.
    pub fn redis_pipeline(&mut self, pool: &str) -> Result<&mut RedisPipeline, OrmError> {
        if !self.pipelines.contains_key(pool) {
            let pipeline = self.redis(pool)?.pipeline();
            self.pipelines.insert(pool.to_string(), pipeline);
        }
        self.pipelines
            .get_mut(pool)
            .ok_or_else(|| OrmError::Config(format!("redis pool '{pool}' is not registered")))
    }

    /// Execute every pending pipeline. Failures are logged and counted,
    /// never returned: the SQL they follow has already been applied.
    pub(crate) async fn exec_pipelines(&mut self) -> usize {
        let mut failures = 0;
        for (pool, pipeline) in &mut self.pipelines {
            if pipeline.is_empty() {
                continue;
            }
            if let Err(e) = pipeline.exec().await {
                failures += 1;
                metrics::record_invalidation_failure(pool);
                warn!(
                    pool = %pool,
                    error = %e,
                    "cache invalidation failed; entries may be stale until reloaded"
                );
            }
        }
        self.pipelines.clear();
        failures
    }
}

async fn wait_true(mut rx: watch::Receiver<bool>) {
    let closed = rx.wait_for(|cancelled| *cancelled).await.is_err();
    if closed {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    //! Entities and an engine over a throwaway SQLite file plus an
    //! in-memory RCACHE, shared by the context and engine tests.

    use std::collections::HashMap;
    use std::sync::Arc;

    use crate::engine::Engine;
    use crate::error::OrmError;
    use crate::registry::Registry;
    use crate::schema::{Entity, EntityDefinition, EntityMeta, FieldKind, Ref, Value, ValueReader};
    use crate::storage::sql::test_support::sqlite_pool;
    use crate::storage::{MemoryRedis, RedisConnection};

    #[derive(Debug, Clone, Default)]
    pub(crate) struct User {
        pub id: u64,
        pub name: String,
        pub age: u16,
        pub meta: EntityMeta,
    }

    impl User {
        pub(crate) fn new(name: &str, age: u16) -> Self {
            Self {
                name: name.to_string(),
                age,
                ..Self::default()
            }
        }
    }

    impl Entity for User {
        fn entity_name() -> &'static str {
            "User"
        }
        fn define(def: &mut EntityDefinition) {
            def.redis_cache("default").local_cache("default");
            def.field("Name", FieldKind::String).required().length(64).unique("Name");
            def.field("Age", FieldKind::UInt16).index("ByAge");
            def.index("ByAge").cached();
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
            vec![self.name.as_str().into(), self.age.into()]
        }
        fn from_values(id: u64, r: &mut ValueReader) -> Result<Self, OrmError> {
            Ok(Self {
                id,
                name: r.opt_string()?.unwrap_or_default(),
                age: r.u16()?,
                meta: EntityMeta::default(),
            })
        }
    }

    #[derive(Debug, Clone, Default)]
    pub(crate) struct Post {
        pub id: u64,
        pub title: String,
        pub author: Option<Ref<User>>,
        pub meta: EntityMeta,
    }

    impl Post {
        pub(crate) fn new(title: &str, author: Ref<User>) -> Self {
            Self {
                title: title.to_string(),
                author: Some(author),
                ..Self::default()
            }
        }
    }

    impl Entity for Post {
        fn entity_name() -> &'static str {
            "Post"
        }
        fn define(def: &mut EntityDefinition) {
            def.redis_cache("default").local_cache("default");
            def.field("Title", FieldKind::String);
            def.field("Author", FieldKind::reference("User")).cached();
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
            vec![self.title.as_str().into(), self.author.clone().into()]
        }
        fn from_values(id: u64, r: &mut ValueReader) -> Result<Self, OrmError> {
            Ok(Self {
                id,
                title: r.string()?,
                author: r.reference()?,
                meta: EntityMeta::default(),
            })
        }
    }

    /// Soft-deletable through its `FakeDelete` column.
    #[derive(Debug, Clone, Default)]
    pub(crate) struct Account {
        pub id: u64,
        pub name: String,
        pub balance: f64,
        pub fake_delete: bool,
        pub meta: EntityMeta,
    }

    impl Account {
        pub(crate) fn new(name: &str, balance: f64) -> Self {
            Self {
                name: name.to_string(),
                balance,
                ..Self::default()
            }
        }
    }

    impl Entity for Account {
        fn entity_name() -> &'static str {
            "Account"
        }
        fn define(def: &mut EntityDefinition) {
            def.local_cache("default");
            def.field("Name", FieldKind::String).index("ByName");
            def.field("Balance", FieldKind::Float64).decimal(10, 2);
            def.field("FakeDelete", FieldKind::Bool);
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
            vec![self.name.as_str().into(), self.balance.into(), self.fake_delete.into()]
        }
        fn from_values(id: u64, r: &mut ValueReader) -> Result<Self, OrmError> {
            Ok(Self {
                id,
                name: r.string()?,
                balance: r.f64()?,
                fake_delete: r.bool()?,
                meta: EntityMeta::default(),
            })
        }
    }

    pub(crate) fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register_redis_pool("default", "redis://unused", None)
            .register_local_cache("default", 1_000)
            .register_entity::<User>()
            .register_entity::<Post>()
            .register_entity::<Account>();
        registry
    }

    /// Engine over a fresh database with every table created.
    pub(crate) async fn engine() -> Engine {
        engine_from(registry()).await
    }

    pub(crate) async fn engine_from(mut registry: Registry) -> Engine {
        registry.register_db_pool(sqlite_pool("default").await, "sqlite://tiered-orm-test");
        let overrides = HashMap::from([(
            "default".to_string(),
            Arc::new(MemoryRedis::new()) as Arc<dyn RedisConnection>,
        )]);
        let engine = registry
            .validate()
            .unwrap()
            .connect_with_redis(overrides)
            .await
            .unwrap();
        engine.create_tables(&engine.new_context()).await.unwrap();
        engine
    }
}
