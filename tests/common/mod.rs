// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared fixtures: SQLite temp databases and the in-memory RCACHE.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use tiered_orm::storage::RedisConnection;
use tiered_orm::{
    Engine, Entity, EntityDefinition, EntityMeta, FieldKind, MemoryRedis, OrmError, Ref, Registry,
    Value, ValueReader,
};

#[derive(Debug, Clone, Default)]
pub struct User {
    pub id: u64,
    pub name: String,
    pub age: u16,
    pub meta: EntityMeta,
}

impl User {
    pub fn new(name: &str, age: u16) -> Self {
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
        def.field("Age", FieldKind::UInt16).index("byAge");
        def.index("byAge").cached();
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
            name: r.string()?,
            age: r.u16()?,
            meta: EntityMeta::default(),
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Post {
    pub id: u64,
    pub title: String,
    pub author: Option<Ref<User>>,
    pub meta: EntityMeta,
}

impl Post {
    pub fn new(title: &str, author: Ref<User>) -> Self {
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

#[derive(Debug, Clone, Default)]
pub struct Wallet {
    pub id: u64,
    pub balance: f64,
    pub meta: EntityMeta,
}

impl Entity for Wallet {
    fn entity_name() -> &'static str {
        "Wallet"
    }
    fn define(def: &mut EntityDefinition) {
        def.redis_cache("default");
        def.field("Balance", FieldKind::Float64).precision(2);
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
        vec![self.balance.into()]
    }
    fn from_values(id: u64, r: &mut ValueReader) -> Result<Self, OrmError> {
        Ok(Self {
            id,
            balance: r.f64()?,
            meta: EntityMeta::default(),
        })
    }
}

/// Compact test logging; `RUST_LOG=tiered_orm=debug` shows every statement.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .with_test_writer()
        .compact()
        .try_init();
}

pub fn sqlite_url() -> String {
    let path = std::env::temp_dir().join(format!("tiered_orm_it_{}.db", uuid::Uuid::new_v4()));
    format!("sqlite://{}?mode=rwc", path.display())
}

pub fn registry(db_url: &str) -> Registry {
    let mut registry = Registry::new();
    registry
        .register_mysql_pool("default", db_url)
        .register_redis_pool("default", "redis://unused", None)
        .register_local_cache("default", 1_000)
        .register_entity::<User>()
        .register_entity::<Post>()
        .register_entity::<Wallet>();
    registry
}

/// Engine over a fresh SQLite file and an in-memory RCACHE, tables created.
pub async fn engine() -> Engine {
    init_tracing();
    let overrides = HashMap::from([(
        "default".to_string(),
        Arc::new(MemoryRedis::new()) as Arc<dyn RedisConnection>,
    )]);
    let engine = registry(&sqlite_url())
        .validate()
        .unwrap()
        .connect_with_redis(overrides)
        .await
        .unwrap();
    engine.create_tables(&engine.new_context()).await.unwrap();
    engine
}
