// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! End-to-end behaviour over SQLite and the in-memory RCACHE.
//!
//! ```bash
//! cargo test --features test-util --test scenarios
//! ```

mod common;

use std::sync::Arc;

use tiered_orm::hash::attribute_hash;
use tiered_orm::schema::VALID_MEMBER;
use tiered_orm::storage::{LocalKey, LocalValue};
use tiered_orm::{ChannelQueryLogger, LogSource, Ref, Value};

use common::{engine, Post, User, Wallet};

// =============================================================================
// Reads and writes
// =============================================================================

#[tokio::test]
async fn insert_then_read_fills_both_tiers() {
    let engine = engine().await;
    let mut ctx = engine.new_context();
    let tom = ctx.track(User::new("Tom", 30)).unwrap();
    ctx.flush().await.unwrap();
    assert_eq!(tom.id(), 1);

    let local = engine.local("default").unwrap();
    assert!(matches!(local.get("User", &LocalKey::Row(1)), Some(LocalValue::Row(_))));

    // Force the read through RCACHE and the database.
    local.remove("User", &[LocalKey::Row(1)]);
    let user: User = ctx.get_by_id(1).await.unwrap().unwrap();
    assert_eq!(user.name, "Tom");
    assert_eq!(user.age, 30);

    let schema = engine.schema_of::<User>().unwrap();
    let redis = engine.redis("default").unwrap();
    let image = redis.lrange(&schema.row_key(1), 0, -1).await.unwrap();
    assert_eq!(image.len(), schema.fields().len() + 2);
    assert!(matches!(local.get("User", &LocalKey::Row(1)), Some(LocalValue::Row(_))));
}

#[tokio::test]
async fn duplicate_on_async_is_shelved() {
    let engine = engine().await;
    let mut ctx = engine.new_context();
    for name in ["A", "B", "C"] {
        ctx.track(User::new(name, 1)).unwrap();
    }
    ctx.flush().await.unwrap();
    engine.redis("default").unwrap().flush_db().await.unwrap();

    for name in ["D", "B", "E"] {
        ctx.track(User::new(name, 2)).unwrap();
    }
    ctx.flush_async().await.unwrap();
    let report = engine.consume(&ctx, false).await.unwrap();
    assert_eq!(report.applied, 2);
    assert_eq!(report.shelved, 1);

    let queue = engine.schema_of::<User>().unwrap().async_queue().to_string();
    assert_eq!(engine.redis("default").unwrap().llen(&queue).await.unwrap(), 0);
    // payload and error string
    assert_eq!(engine.redis("default").unwrap().llen(&format!("{queue}:err")).await.unwrap(), 2);
    let errors = engine.read_async_errors(&queue, 10).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].payload.starts_with(r#"["INSERT INTO `User`"#));
    assert!(
        errors[0].error.contains("Duplicate entry 'B'")
            || errors[0].error.contains("UNIQUE constraint failed")
    );

    for name in ["D", "E"] {
        let found: Option<User> = ctx
            .get_by_unique_index("Name", &[Value::from(name)])
            .await
            .unwrap();
        assert!(found.is_some(), "{name} missing");
    }
}

// =============================================================================
// Cached searches
// =============================================================================

#[tokio::test]
async fn cached_index_follows_updates() {
    let engine = engine().await;
    let mut ctx = engine.new_context();
    let first = ctx.track(User::new("first", 20)).unwrap();
    ctx.track(User::new("second", 20)).unwrap();
    ctx.flush().await.unwrap();

    let users: Vec<User> = ctx.get_by_index("byAge", &[Value::from(20u16)]).await.unwrap();
    assert_eq!(users.len(), 2);

    let schema = engine.schema_of::<User>().unwrap();
    let index = schema.index("byAge").unwrap();
    let key_for = |age: u16| {
        let binds = schema.bind_attributes(index, &[Value::from(age)]).unwrap();
        schema.index_key("byAge", attribute_hash(&binds))
    };
    let redis = engine.redis("default").unwrap();
    let members = redis.smembers(&key_for(20)).await.unwrap();
    assert_eq!(members.len(), 3);
    assert!(members.iter().any(|m| m == VALID_MEMBER));

    first.write().age = 21;
    ctx.track(&first).unwrap();
    ctx.flush().await.unwrap();
    assert!(redis.smembers(&key_for(20)).await.unwrap().is_empty());
    assert!(redis.smembers(&key_for(21)).await.unwrap().is_empty());

    let at_20: Vec<User> = ctx.get_by_index("byAge", &[Value::from(20u16)]).await.unwrap();
    let at_21: Vec<User> = ctx.get_by_index("byAge", &[Value::from(21u16)]).await.unwrap();
    assert_eq!(at_20.len(), 1);
    assert_eq!(at_21.len(), 1);
    assert_eq!(at_21[0].id, first.id());
    assert_eq!(redis.smembers(&key_for(21)).await.unwrap().len(), 2);
}

#[tokio::test]
async fn reference_fan_out() {
    let engine = engine().await;
    let mut ctx = engine.new_context();
    let ann = ctx.track(User::new("Ann", 30)).unwrap();
    let bob = ctx.track(User::new("Bob", 31)).unwrap();
    for i in 0..3 {
        ctx.track(Post::new(&format!("ann {i}"), Ref::from(&ann))).unwrap();
    }
    for i in 0..2 {
        ctx.track(Post::new(&format!("bob {i}"), Ref::from(&bob))).unwrap();
    }
    ctx.flush().await.unwrap();

    let posts: Vec<Post> = ctx.get_by_reference("Author", ann.id()).await.unwrap();
    assert_eq!(posts.len(), 3);
    assert!(posts.iter().all(|p| p.author.as_ref().map(Ref::id) == Some(ann.id())));

    let local = engine.local("default").unwrap();
    let key = LocalKey::Reference {
        column: "Author".to_string(),
        parent: ann.id(),
    };
    match local.get("Post", &key) {
        Some(LocalValue::Ids(ids)) => assert_eq!(ids.len(), 3),
        other => panic!("expected cached ids, got {other:?}"),
    }

    ctx.track(Post::new("ann 3", Ref::from(ann.id()))).unwrap();
    ctx.flush().await.unwrap();
    assert!(local.get("Post", &key).is_none());
    let posts: Vec<Post> = ctx.get_by_reference("Author", ann.id()).await.unwrap();
    assert_eq!(posts.len(), 4);
}

// =============================================================================
// Negative cache and dirty diff
// =============================================================================

#[tokio::test]
async fn missing_row_is_cached_as_absent() {
    let engine = engine().await;
    let mut ctx = engine.new_context();
    let (logger, mut entries) = ChannelQueryLogger::new();
    ctx.add_db_logger(Arc::new(logger));

    let missing: Option<User> = ctx.get_by_id(999).await.unwrap();
    assert!(missing.is_none());
    let schema = engine.schema_of::<User>().unwrap();
    let marker = engine
        .redis("default")
        .unwrap()
        .lrange(&schema.row_key(999), 0, -1)
        .await
        .unwrap();
    assert_eq!(marker.len(), 1);

    let db_queries = std::iter::from_fn(|| entries.try_recv().ok())
        .filter(|e| e.source == LogSource::Db)
        .count();
    assert_eq!(db_queries, 1);

    let again: Option<User> = ctx.get_by_id(999).await.unwrap();
    assert!(again.is_none());
    assert!(entries.try_recv().is_err());
}

#[tokio::test]
async fn float_change_below_precision_is_not_written() {
    let engine = engine().await;
    let mut ctx = engine.new_context();
    let wallet = ctx
        .track(Wallet {
            balance: 1.234,
            ..Wallet::default()
        })
        .unwrap();
    ctx.flush().await.unwrap();

    let (logger, mut entries) = ChannelQueryLogger::new();
    ctx.add_db_logger(Arc::new(logger));
    wallet.write().balance = 1.235;
    ctx.track(&wallet).unwrap();
    let report = ctx.flush().await.unwrap();
    assert_eq!(report.updated, 0);
    assert_eq!(report.skipped, 1);
    assert!(std::iter::from_fn(|| entries.try_recv().ok()).all(|e| !e.query.starts_with("UPDATE")));
}
