// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Registry: pools, enums and entity types, validated once.
//!
//! ```text
//! Registry ──validate()──▶ ValidatedRegistry ──connect()──▶ Engine
//!  (mutable)                 (immutable, shared)             (pools open)
//! ```
//!
//! Validation compiles every entity definition into an [`EntitySchema`],
//! checks that every pool an entity names is registered, that reference
//! targets exist, and that references between distinct types form no cycle.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tracing::info;

use crate::config::{DbPoolConfig, EngineConfig, RedisPoolConfig};
use crate::engine::Engine;
use crate::error::OrmError;
use crate::schema::definition::EntityDefinition;
use crate::schema::{CompileInput, EnumDefinition, Entity, EntitySchema};
use crate::storage::local::LocalCache;
use crate::storage::redis::{RedisCache, RedisConnection};
use crate::storage::sql::{DbPool, Dialect};

/// Builder for a [`ValidatedRegistry`].
#[derive(Debug, Default)]
pub struct Registry {
    config: EngineConfig,
    injected_pools: BTreeMap<String, (DbPool, String)>,
    enums: HashMap<String, Arc<EnumDefinition>>,
    entities: Vec<EntityDefinition>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a configuration; its pools are registered as declared.
    pub fn from_config(config: EngineConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut EngineConfig {
        &mut self.config
    }

    /// A MySQL or SQLite pool; the dialect follows the URL scheme.
    pub fn register_mysql_pool(&mut self, code: &str, url: &str) -> &mut Self {
        self.config.mysql_pools.insert(
            code.to_string(),
            DbPoolConfig {
                url: url.to_string(),
                max_connections: self
                    .config
                    .mysql_pools
                    .get(code)
                    .map_or(20, |p| p.max_connections),
            },
        );
        self
    }

    /// Use an already opened pool. `dsn` feeds the cache prefixes of the
    /// entities stored there.
    pub fn register_db_pool(&mut self, pool: DbPool, dsn: &str) -> &mut Self {
        self.injected_pools
            .insert(pool.code().to_string(), (pool, dsn.to_string()));
        self
    }

    pub fn register_redis_pool(
        &mut self,
        code: &str,
        url: &str,
        namespace: Option<&str>,
    ) -> &mut Self {
        self.config.redis_pools.insert(
            code.to_string(),
            RedisPoolConfig {
                url: url.to_string(),
                namespace: namespace.map(str::to_string),
            },
        );
        self
    }

    pub fn register_local_cache(&mut self, code: &str, size: usize) -> &mut Self {
        self.config.local_caches.insert(code.to_string(), size);
        self
    }

    pub fn register_enum(&mut self, definition: EnumDefinition) -> &mut Self {
        self.enums
            .insert(definition.name().to_string(), Arc::new(definition));
        self
    }

    pub fn register_entity<E: Entity>(&mut self) -> &mut Self {
        let mut definition = EntityDefinition::new(E::entity_name());
        E::define(&mut definition);
        self.entities.retain(|d| d.name() != E::entity_name());
        self.entities.push(definition);
        self
    }

    fn pool_source(&self, code: &str) -> Option<(Dialect, String)> {
        if let Some((pool, dsn)) = self.injected_pools.get(code) {
            return Some((pool.dialect(), dsn.clone()));
        }
        let url = &self.config.mysql_pools.get(code)?.url;
        Dialect::from_url(url).ok().map(|d| (d, url.clone()))
    }

    pub fn validate(&self) -> Result<ValidatedRegistry, OrmError> {
        for (code, pool) in &self.config.mysql_pools {
            if !self.injected_pools.contains_key(code) {
                Dialect::from_url(&pool.url).map_err(|_| {
                    OrmError::Config(format!("pool '{code}' has unsupported url '{}'", pool.url))
                })?;
            }
        }

        let mut schemas = BTreeMap::new();
        let mut order = Vec::with_capacity(self.entities.len());
        for definition in &self.entities {
            let name = definition.name();
            let (dialect, dsn) = self.pool_source(&definition.mysql_pool).ok_or_else(|| {
                OrmError::Config(format!(
                    "entity '{name}' uses unregistered database pool '{}'",
                    definition.mysql_pool
                ))
            })?;
            let input = CompileInput {
                enums: &self.enums,
                dialect,
                dsn: &dsn,
                prefix_len: self.config.cache_prefix_len,
            };
            let schema = EntitySchema::compile(definition.clone(), &input)?;
            self.check_pools(&schema)?;
            order.push(name.to_string());
            schemas.insert(name.to_string(), Arc::new(schema));
        }

        check_references(&schemas)?;
        check_queues(&schemas)?;

        info!(entities = schemas.len(), "registry validated");
        Ok(ValidatedRegistry {
            inner: Arc::new(RegistryInner {
                config: self.config.clone(),
                injected_pools: self
                    .injected_pools
                    .iter()
                    .map(|(code, (pool, _))| (code.clone(), pool.clone()))
                    .collect(),
                schemas,
                order,
            }),
        })
    }

    fn check_pools(&self, schema: &EntitySchema) -> Result<(), OrmError> {
        let missing = |kind: &str, code: &str| {
            OrmError::Config(format!(
                "entity '{}' uses unregistered {kind} pool '{code}'",
                schema.name()
            ))
        };
        if let Some(code) = schema.local_pool() {
            if !self.config.local_caches.contains_key(code) {
                return Err(missing("local cache", code));
            }
        }
        if let Some(code) = schema.redis_pool() {
            if !self.config.redis_pools.contains_key(code) {
                return Err(missing("redis", code));
            }
        }
        if let Some(search) = schema.search() {
            if !self.config.redis_pools.contains_key(&search.pool) {
                return Err(missing("redis search", &search.pool));
            }
        }
        Ok(())
    }
}

fn check_references(schemas: &BTreeMap<String, Arc<EntitySchema>>) -> Result<(), OrmError> {
    for schema in schemas.values() {
        for reference in schema.references() {
            if !schemas.contains_key(&reference.target) {
                return Err(OrmError::SchemaInvariant {
                    entity: schema.name().to_string(),
                    reason: format!(
                        "column '{}' references unregistered entity '{}'",
                        reference.column, reference.target
                    ),
                });
            }
        }
    }

    // Self references are allowed; longer chains back to a type are not.
    fn visit<'a>(
        name: &'a str,
        schemas: &'a BTreeMap<String, Arc<EntitySchema>>,
        stack: &mut Vec<&'a str>,
        done: &mut Vec<&'a str>,
    ) -> Result<(), OrmError> {
        if done.contains(&name) {
            return Ok(());
        }
        if let Some(start) = stack.iter().position(|n| *n == name) {
            let mut cycle = stack[start..].to_vec();
            cycle.push(name);
            return Err(OrmError::SchemaInvariant {
                entity: name.to_string(),
                reason: format!("reference cycle {}", cycle.join(" -> ")),
            });
        }
        stack.push(name);
        if let Some(schema) = schemas.get(name) {
            for reference in schema.references() {
                if reference.target != name {
                    visit(&reference.target, schemas, stack, done)?;
                }
            }
        }
        stack.pop();
        done.push(name);
        Ok(())
    }

    let mut done = Vec::new();
    for name in schemas.keys() {
        visit(name, schemas, &mut Vec::new(), &mut done)?;
    }
    Ok(())
}

/// A queue shared through a custom group must stay on one database pool,
/// since payloads do not name the pool they were written for.
fn check_queues(schemas: &BTreeMap<String, Arc<EntitySchema>>) -> Result<(), OrmError> {
    let mut pools: HashMap<&str, &str> = HashMap::new();
    for schema in schemas.values() {
        let pool = pools.entry(schema.async_queue()).or_insert(schema.db_pool());
        if *pool != schema.db_pool() {
            return Err(OrmError::SchemaInvariant {
                entity: schema.name().to_string(),
                reason: format!(
                    "async queue '{}' is shared by pools '{}' and '{}'",
                    schema.async_queue(),
                    pool,
                    schema.db_pool()
                ),
            });
        }
    }
    Ok(())
}

#[derive(Debug)]
struct RegistryInner {
    config: EngineConfig,
    injected_pools: BTreeMap<String, DbPool>,
    schemas: BTreeMap<String, Arc<EntitySchema>>,
    order: Vec<String>,
}

/// Immutable result of [`Registry::validate`]; cheap to clone.
#[derive(Debug, Clone)]
pub struct ValidatedRegistry {
    inner: Arc<RegistryInner>,
}

impl ValidatedRegistry {
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn schema(&self, entity: &str) -> Result<&Arc<EntitySchema>, OrmError> {
        self.inner
            .schemas
            .get(entity)
            .ok_or_else(|| OrmError::NotRegistered(entity.to_string()))
    }

    pub fn schema_of<E: Entity>(&self) -> Result<&Arc<EntitySchema>, OrmError> {
        self.schema(E::entity_name())
    }

    /// Schemas in registration order.
    pub fn schemas(&self) -> impl Iterator<Item = &Arc<EntitySchema>> {
        self.inner
            .order
            .iter()
            .filter_map(|name| self.inner.schemas.get(name))
    }

    /// Distinct async queues with the database pool they apply to.
    pub fn async_queues(&self) -> BTreeMap<String, String> {
        self.schemas()
            .map(|s| (s.async_queue().to_string(), s.db_pool().to_string()))
            .collect()
    }

    pub async fn connect(&self) -> Result<Engine, OrmError> {
        self.connect_with_redis(HashMap::new()).await
    }

    /// Open every pool; RCACHE pools found in `overrides` use the given
    /// connection instead of dialing their URL.
    pub async fn connect_with_redis(
        &self,
        mut overrides: HashMap<String, Arc<dyn RedisConnection>>,
    ) -> Result<Engine, OrmError> {
        let config = self.config();

        let mut db = HashMap::new();
        for (code, pool) in &self.inner.injected_pools {
            db.insert(code.clone(), pool.clone());
        }
        for (code, pool) in &config.mysql_pools {
            if !db.contains_key(code) {
                let connected = DbPool::connect(code, &pool.url, pool.max_connections).await?;
                db.insert(code.clone(), connected);
            }
        }

        let mut redis = HashMap::new();
        for (code, pool) in &config.redis_pools {
            let namespace = pool.namespace.as_deref();
            let cache = match overrides.remove(code) {
                Some(conn) => RedisCache::from_connection(code, namespace, conn),
                None => RedisCache::connect(code, &pool.url, namespace).await?,
            };
            redis.insert(code.clone(), cache);
        }

        let local = config
            .local_caches
            .iter()
            .map(|(code, size)| (code.clone(), LocalCache::new(code, *size)))
            .collect();

        info!(
            db_pools = db.len(),
            redis_pools = redis.len(),
            "engine connected"
        );
        Ok(Engine::new(self.clone(), db, redis, local))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{EntityMeta, FieldKind, Value, ValueReader};

    #[derive(Debug, Clone, Default)]
    struct Author {
        id: u64,
        meta: EntityMeta,
    }

    impl Entity for Author {
        fn entity_name() -> &'static str {
            "Author"
        }
        fn define(def: &mut EntityDefinition) {
            def.redis_cache("default");
            def.field("Name", FieldKind::String).required();
            def.field("Favourite", FieldKind::reference("Book"));
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
            vec![Value::Null, Value::Null]
        }
        fn from_values(id: u64, _values: &mut ValueReader) -> Result<Self, OrmError> {
            Ok(Self { id, ..Self::default() })
        }
    }

    #[derive(Debug, Clone, Default)]
    struct Book {
        id: u64,
        meta: EntityMeta,
    }

    impl Entity for Book {
        fn entity_name() -> &'static str {
            "Book"
        }
        fn define(def: &mut EntityDefinition) {
            def.field("Title", FieldKind::String);
            def.field("Author", FieldKind::reference("Author"));
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
            vec![Value::Null, Value::Null]
        }
        fn from_values(id: u64, _values: &mut ValueReader) -> Result<Self, OrmError> {
            Ok(Self { id, ..Self::default() })
        }
    }

    fn base() -> Registry {
        let mut registry = Registry::new();
        registry
            .register_mysql_pool("default", "sqlite::memory:")
            .register_redis_pool("default", "redis://localhost:6379", None);
        registry
    }

    #[test]
    fn test_unknown_entity_pool_rejected() {
        let mut registry = Registry::new();
        registry.register_entity::<Book>();
        assert!(matches!(registry.validate(), Err(OrmError::Config(_))));
    }

    #[test]
    fn test_missing_redis_pool_rejected() {
        let mut registry = Registry::new();
        registry
            .register_mysql_pool("default", "sqlite::memory:")
            .register_entity::<Author>()
            .register_entity::<Book>();
        let err = registry.validate().unwrap_err();
        assert!(err.to_string().contains("redis pool 'default'"));
    }

    #[test]
    fn test_unregistered_reference_target() {
        let mut registry = base();
        registry.register_entity::<Book>();
        assert!(matches!(
            registry.validate(),
            Err(OrmError::SchemaInvariant { .. })
        ));
    }

    #[test]
    fn test_reference_cycle_rejected() {
        let mut registry = base();
        registry.register_entity::<Author>().register_entity::<Book>();
        let err = registry.validate().unwrap_err();
        assert!(err.to_string().contains("reference cycle"));
    }

    #[test]
    fn test_reregistering_replaces_definition() {
        let mut registry = base();
        registry.register_entity::<Book>();
        // Replacing the definition keeps one copy.
        registry.register_entity::<Book>();
        let err = registry.validate().unwrap_err();
        assert!(err.to_string().contains("Author"));
        assert_eq!(registry.entities.len(), 1);
    }

    #[test]
    fn test_bad_url_rejected() {
        let mut registry = Registry::new();
        registry.register_mysql_pool("default", "postgres://localhost/db");
        assert!(matches!(registry.validate(), Err(OrmError::Config(_))));
    }
}
