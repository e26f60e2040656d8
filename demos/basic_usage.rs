// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Basic usage: register an entity, write it, read it back through the tiers
//! and drain the async queue.
//!
//! Runs without external services (SQLite file + in-memory RCACHE):
//!
//! ```bash
//! cargo run --features test-util --example basic_usage
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use tiered_orm::storage::RedisConnection;
use tiered_orm::{
    Entity, EntityDefinition, EntityMeta, FieldKind, MemoryRedis, OrmError, Registry, Value,
    ValueReader,
};

#[derive(Debug, Clone, Default)]
struct Customer {
    id: u64,
    name: String,
    tier: u8,
    meta: EntityMeta,
}

impl Entity for Customer {
    fn entity_name() -> &'static str {
        "Customer"
    }
    fn define(def: &mut EntityDefinition) {
        def.redis_cache("default").local_cache("default");
        def.field("Name", FieldKind::String).required().length(64).unique("Name");
        def.field("Tier", FieldKind::UInt8).index("ByTier");
        def.index("ByTier").cached();
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
        vec![self.name.as_str().into(), self.tier.into()]
    }
    fn from_values(id: u64, r: &mut ValueReader) -> Result<Self, OrmError> {
        Ok(Self {
            id,
            name: r.string()?,
            tier: r.u8()?,
            meta: EntityMeta::default(),
        })
    }
}

fn customer(name: &str, tier: u8) -> Customer {
    Customer {
        name: name.to_string(),
        tier,
        ..Customer::default()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder.install().expect("failed to install metrics recorder");

    tracing_subscriber::fmt().with_target(false).compact().init();

    // ─────────────────────────────────────────────────────────────────────────
    // 1. Register and connect
    // ─────────────────────────────────────────────────────────────────────────
    let db_path = std::env::temp_dir().join(format!("tiered_orm_demo_{}.db", uuid::Uuid::new_v4()));
    let mut registry = Registry::new();
    registry
        .register_mysql_pool("default", &format!("sqlite://{}?mode=rwc", db_path.display()))
        .register_redis_pool("default", "redis://unused", Some("demo"))
        .register_local_cache("default", 10_000)
        .register_entity::<Customer>();

    let overrides = HashMap::from([(
        "default".to_string(),
        Arc::new(MemoryRedis::new()) as Arc<dyn RedisConnection>,
    )]);
    let engine = registry.validate()?.connect_with_redis(overrides).await?;

    println!("DDL:");
    for statement in engine.create_table_statements::<Customer>()? {
        println!("  {statement}");
    }
    let mut ctx = engine.new_context();
    engine.create_tables(&ctx).await?;

    // ─────────────────────────────────────────────────────────────────────────
    // 2. Write
    // ─────────────────────────────────────────────────────────────────────────
    let alice = ctx.track(customer("Alice", 1))?;
    ctx.track(customer("Bob", 2))?;
    ctx.track(customer("Carol", 2))?;
    let report = ctx.flush().await?;
    println!("\nflush: {report:?}");

    // ─────────────────────────────────────────────────────────────────────────
    // 3. Read through the tiers
    // ─────────────────────────────────────────────────────────────────────────
    for attempt in 1..=2 {
        let started = Instant::now();
        let found: Option<Customer> = ctx.get_by_id(alice.id()).await?;
        println!("get_by_id #{attempt}: {:?} ({:?})", found.map(|c| c.name), started.elapsed());
    }
    let tier_two: Vec<Customer> = ctx.get_by_index("ByTier", &[Value::from(2u8)]).await?;
    println!("tier 2: {:?}", tier_two.iter().map(|c| c.name.as_str()).collect::<Vec<_>>());
    let bob: Option<Customer> = ctx.get_by_unique_index("Name", &[Value::from("Bob")]).await?;
    println!("unique Name=Bob: {:?}", bob.map(|c| c.id));

    // ─────────────────────────────────────────────────────────────────────────
    // 4. Async writes
    // ─────────────────────────────────────────────────────────────────────────
    ctx.track(customer("Dave", 3))?;
    ctx.track(customer("Alice", 3))?;
    let queued = ctx.flush_async().await?;
    println!("\nqueued {} statements", queued.queued);
    let consumed = engine.consume(&ctx, false).await?;
    println!("consume: {consumed:?}");
    for stats in engine.async_queue_statistics().await? {
        println!("queue {}: pending={} errors={}", stats.queue, stats.pending, stats.errors);
        for error in engine.read_async_errors(&stats.queue, 10).await? {
            println!("  shelved {} → {}", error.payload, error.error);
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // 5. Health and metrics
    // ─────────────────────────────────────────────────────────────────────────
    let health = engine.health_check().await;
    println!("\nhealthy: {}", health.is_healthy());
    dump_metrics(&snapshotter);

    let _ = std::fs::remove_file(&db_path);
    Ok(())
}

fn dump_metrics(snapshotter: &Snapshotter) {
    let mut lines = Vec::new();
    for (composite_key, _, _, value) in snapshotter.snapshot().into_vec() {
        let (_, key) = composite_key.into_parts();
        let labels: Vec<_> = key.labels().map(|l| format!("{}={}", l.key(), l.value())).collect();
        let rendered = match value {
            DebugValue::Counter(v) => v.to_string(),
            DebugValue::Gauge(v) => v.into_inner().to_string(),
            DebugValue::Histogram(samples) => format!("{} samples", samples.len()),
        };
        lines.push(format!("  {}{{{}}} = {rendered}", key.name(), labels.join(",")));
    }
    lines.sort();
    println!("metrics:");
    for line in lines {
        println!("{line}");
    }
}
