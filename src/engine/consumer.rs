// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Async queue consumer.
//!
//! Statements queued by [`Context::flush_async`](crate::Context::flush_async)
//! are applied here, one queue per database pool (or custom group), all
//! queues concurrently:
//!
//! ```text
//! LRANGE q 0 page-1 ──▶ BEGIN; exec all; COMMIT ──▶ LTRIM q n -1
//!                              │ skippable code
//!                              ▼
//!                       one by one: exec ──ok──▶ LTRIM q 1 -1
//!                                        └skip─▶ RPUSH q:err payload error; LTRIM q 1 -1
//! ```
//!
//! Every applied statement is followed by its eviction, so rows, index
//! sets and unique HASH entries read while it waited in the queue are
//! dropped once the database has changed.
//!
//! Only one consumer runs per cluster; the lock is refreshed in the
//! background and losing it ends the loop cleanly.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use crate::context::{decode_payload, Context, QueuedStatement};
use crate::error::OrmError;
use crate::metrics;
use crate::storage::local::LocalKey;
use crate::storage::lock::{Lock, Locker};
use crate::storage::redis::{RedisCache, RedisPipeline};
use crate::storage::sql::DbPool;

use super::{ConsumeReport, Engine};

/// MySQL error numbers that shelve a statement instead of aborting the
/// drain.
pub const SKIPPABLE_CODES: &[u16] = &[
    1022, 1048, 1049, 1051, 1054, 1062, 1063, 1064, 1067, 1109, 1146, 1149, 2032,
];

pub(crate) const CONSUMER_LOCK: &str = "_orm_async_consumer_lock";

pub(crate) fn error_queue(queue: &str) -> String {
    format!("{queue}:err")
}

fn is_skippable(err: &OrmError) -> bool {
    err.db_code().is_some_and(|code| SKIPPABLE_CODES.contains(&code))
}

/// Skippable driver faults and payloads that cannot be decoded.
fn is_shelvable(err: &OrmError) -> bool {
    is_skippable(err) || matches!(err, OrmError::InvalidArgument(_) | OrmError::Serialization(_))
}

/// Outcome of one page of one queue.
#[derive(Debug, Default)]
struct PageOutcome {
    applied: usize,
    shelved: usize,
    /// The page was full; more may be waiting.
    full: bool,
}

async fn refresh_lock(lock: Arc<Lock>, ttl: Duration, every: Duration, lost: watch::Sender<bool>) {
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match lock.refresh(ttl).await {
            Ok(true) => debug!(lock = lock.key(), "consumer lock refreshed"),
            Ok(false) => break,
            Err(e) => {
                warn!(lock = lock.key(), error = %e, "consumer lock refresh failed");
                break;
            }
        }
    }
    lost.send_replace(true);
}

impl Engine {
    /// Apply queued async statements.
    ///
    /// Without `block` this returns once every queue has been drained; with
    /// it the loop sleeps between empty polls until the context is cancelled
    /// or the lock is lost. Fails with [`OrmError::LockTimeout`] when another
    /// consumer holds the lock.
    #[instrument(skip(self, ctx))]
    pub async fn consume(&self, ctx: &Context, block: bool) -> Result<ConsumeReport, OrmError> {
        let config = self.config();
        let ttl = config.consumer_lock_ttl();
        let locker = Locker::new(self.default_redis()?.clone());
        let lock = locker
            .obtain(CONSUMER_LOCK, ttl, Duration::ZERO)
            .await?
            .ok_or_else(|| OrmError::LockTimeout(CONSUMER_LOCK.to_string()))?;
        let lock = Arc::new(lock);
        let (lost_tx, lost_rx) = watch::channel(false);
        let refresher = tokio::spawn(refresh_lock(
            lock.clone(),
            ttl,
            config.consumer_lock_refresh(),
            lost_tx,
        ));
        info!(block, "async consumer started");

        let outcome = self.consume_loop(ctx, block, lost_rx).await;

        refresher.abort();
        let _ = refresher.await;
        match Arc::try_unwrap(lock) {
            Ok(lock) => {
                lock.release().await?;
            }
            Err(_) => warn!("consumer lock still shared, leaving it to expire"),
        }
        match &outcome {
            Ok(report) => info!(
                applied = report.applied,
                shelved = report.shelved,
                "async consumer stopped"
            ),
            Err(e) => error!(error = %e, "async consumer aborted"),
        }
        outcome
    }

    async fn consume_loop(
        &self,
        ctx: &Context,
        block: bool,
        mut lost: watch::Receiver<bool>,
    ) -> Result<ConsumeReport, OrmError> {
        let queue_cache = ctx.default_redis()?;
        let queues = self.registry().async_queues();
        let mut report = ConsumeReport::default();
        loop {
            if *lost.borrow() {
                report.lock_lost = true;
                return Ok(report);
            }
            if ctx.is_cancelled() {
                return Ok(report);
            }
            let pages = join_all(queues.iter().map(|(queue, pool)| {
                let queue_cache = queue_cache.clone();
                async move {
                    let db = self.db(pool)?;
                    self.consume_page(ctx, &queue_cache, db, queue).await
                }
            }))
            .await;

            let mut more = false;
            for page in pages {
                let page = page?;
                report.applied += page.applied;
                report.shelved += page.shelved;
                more |= page.full;
            }
            if more {
                continue;
            }
            if !block {
                return Ok(report);
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config().consumer_block_interval()) => {}
                _ = ctx.cancelled() => return Ok(report),
                _ = lost.wait_for(|lost| *lost) => {
                    report.lock_lost = true;
                    return Ok(report);
                }
            }
        }
    }

    async fn consume_page(
        &self,
        ctx: &Context,
        cache: &RedisCache,
        db: &DbPool,
        queue: &str,
    ) -> Result<PageOutcome, OrmError> {
        let page_size = self.config().async_page_size.max(1);
        let payloads = cache.lrange_strings(queue, 0, page_size as i64 - 1).await?;
        let mut outcome = PageOutcome {
            full: payloads.len() == page_size,
            ..PageOutcome::default()
        };
        if payloads.is_empty() {
            metrics::set_async_queue_depth(queue, 0);
            return Ok(outcome);
        }

        match self.apply_batch(ctx, db, &payloads).await {
            Ok(applied) => {
                cache.ltrim(queue, payloads.len() as i64, -1).await?;
                outcome.applied = payloads.len();
                self.evict_applied(ctx, &applied).await?;
            }
            Err(e) if is_shelvable(&e) => {
                debug!(queue, error = %e, "batch rejected, applying one by one");
                self.apply_one_by_one(ctx, cache, db, queue, &payloads, &mut outcome).await?;
            }
            Err(e) => return Err(e),
        }
        metrics::record_async_applied(queue, outcome.applied);
        metrics::set_async_queue_depth(queue, cache.llen(queue).await?);
        Ok(outcome)
    }

    /// All payloads in one transaction; nothing is applied on failure.
    /// Returns each statement with the id its write reported.
    async fn apply_batch(
        &self,
        ctx: &Context,
        db: &DbPool,
        payloads: &[String],
    ) -> Result<Vec<(QueuedStatement, u64)>, OrmError> {
        let statements = payloads
            .iter()
            .map(|payload| decode_payload(payload))
            .collect::<Result<Vec<_>, _>>()?;
        ctx.check_cancelled()?;
        let loggers = ctx.db_loggers();
        if let [statement] = statements.as_slice() {
            let done = db.exec(loggers, &statement.sql, &statement.args).await?;
            return Ok(vec![(statement.clone(), done.last_insert_id)]);
        }
        let mut tx = db.begin(loggers).await?;
        let mut applied = Vec::with_capacity(statements.len());
        for statement in statements {
            match tx.exec(loggers, &statement.sql, &statement.args).await {
                Ok(done) => applied.push((statement, done.last_insert_id)),
                Err(e) => {
                    if let Err(rollback) = tx.rollback(loggers).await {
                        warn!(error = %rollback, "rollback of async batch failed");
                    }
                    return Err(e);
                }
            }
        }
        tx.commit(loggers).await?;
        Ok(applied)
    }

    async fn apply_one_by_one(
        &self,
        ctx: &Context,
        cache: &RedisCache,
        db: &DbPool,
        queue: &str,
        payloads: &[String],
        outcome: &mut PageOutcome,
    ) -> Result<(), OrmError> {
        let errors = error_queue(queue);
        for payload in payloads {
            ctx.check_cancelled()?;
            let applied = match decode_payload(payload) {
                Ok(statement) => db
                    .exec(ctx.db_loggers(), &statement.sql, &statement.args)
                    .await
                    .map(|done| (statement, done.last_insert_id)),
                Err(e) => Err(e),
            };
            let mut pipeline = cache.pipeline();
            pipeline.atomic();
            let mut evict = None;
            match applied {
                Ok(done) => {
                    outcome.applied += 1;
                    evict = Some(done);
                }
                Err(e) if is_shelvable(&e) => {
                    warn!(queue, error = %e, "async statement shelved");
                    metrics::record_async_shelved(queue);
                    pipeline.rpush(&errors, &[payload.clone(), e.to_string()]);
                    outcome.shelved += 1;
                }
                Err(e) => return Err(e),
            }
            pipeline.ltrim(queue, 1, -1);
            pipeline.exec().await?;
            if let Some(done) = evict {
                self.evict_applied(ctx, std::slice::from_ref(&done)).await?;
            }
        }
        Ok(())
    }

    /// Drop what readers cached while the statements waited in the queue.
    ///
    /// `inserted` ids fill in for evictions queued before the row had one.
    /// Failures are logged and counted like flush invalidation failures.
    async fn evict_applied(
        &self,
        ctx: &Context,
        applied: &[(QueuedStatement, u64)],
    ) -> Result<usize, OrmError> {
        let default_pool = self.config().default_redis_pool.clone();
        let mut pipelines: HashMap<String, RedisPipeline> = HashMap::new();
        for (statement, inserted) in applied {
            let Some(eviction) = &statement.eviction else {
                continue;
            };
            let schema = self.schema(&eviction.entity)?;
            let id = if eviction.id != 0 { eviction.id } else { *inserted };
            if let Some(local) = ctx.schema_local(schema)? {
                if id != 0 {
                    local.remove(&eviction.entity, &[LocalKey::Row(id)]);
                }
                eviction.evict_local(&local);
            }
            if let Some(pool) = schema.redis_pool() {
                eviction.queue_redis(schema, id, pipeline_for(ctx, &mut pipelines, pool)?);
            }
            if eviction.search.is_some() {
                eviction.queue_search(id, pipeline_for(ctx, &mut pipelines, &default_pool)?);
            }
        }

        let mut failures = 0;
        for (pool, mut pipeline) in pipelines {
            if let Err(e) = pipeline.exec().await {
                failures += 1;
                metrics::record_invalidation_failure(&pool);
                warn!(
                    pool = %pool,
                    error = %e,
                    "eviction after async apply failed; entries may be stale until reloaded"
                );
            }
        }
        Ok(failures)
    }
}

fn pipeline_for<'a>(
    ctx: &Context,
    pipelines: &'a mut HashMap<String, RedisPipeline>,
    pool: &str,
) -> Result<&'a mut RedisPipeline, OrmError> {
    if !pipelines.contains_key(pool) {
        pipelines.insert(pool.to_string(), ctx.redis(pool)?.pipeline());
    }
    pipelines
        .get_mut(pool)
        .ok_or_else(|| OrmError::Config(format!("redis pool '{pool}' is not registered")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::{engine, engine_from, registry, User};
    use crate::schema::Value;
    use crate::storage::lock::Locker;

    async fn user_named(ctx: &Context, name: &str) -> Option<User> {
        ctx.get_by_unique_index("Name", &[Value::from(name)]).await.unwrap()
    }

    async fn users_aged(ctx: &Context, age: u16) -> Vec<User> {
        ctx.get_by_index("ByAge", &[Value::from(age)]).await.unwrap()
    }

    #[test]
    fn test_skippable_codes() {
        assert!(is_skippable(&OrmError::database(Some(1062), "Duplicate entry")));
        assert!(is_skippable(&OrmError::DuplicateKey {
            index: "Name".into(),
            message: "dup".into()
        }));
        assert!(!is_skippable(&OrmError::database(Some(1205), "lock wait timeout")));
        assert!(!is_skippable(&OrmError::Cancelled));
    }

    #[tokio::test]
    async fn test_consume_applies_queued_inserts() {
        let engine = engine().await;
        let mut ctx = engine.new_context();
        ctx.track(User::new("Ann", 20)).unwrap();
        ctx.track(User::new("Bob", 21)).unwrap();
        ctx.flush_async().await.unwrap();
        assert!(user_named(&ctx, "Ann").await.is_none());

        let report = engine.consume(&ctx, false).await.unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(report.shelved, 0);
        assert_eq!(user_named(&ctx, "Ann").await.map(|u| u.age), Some(20));

        let stats = engine.async_queue_statistics().await.unwrap();
        assert!(stats.iter().all(|s| s.pending == 0 && s.errors == 0));
    }

    #[tokio::test]
    async fn test_duplicate_is_shelved() {
        let engine = engine().await;
        let mut ctx = engine.new_context();
        ctx.track(User::new("B", 1)).unwrap();
        ctx.flush().await.unwrap();

        for name in ["D", "B", "E"] {
            ctx.track(User::new(name, 2)).unwrap();
        }
        ctx.flush_async().await.unwrap();
        let report = engine.consume(&ctx, false).await.unwrap();
        assert_eq!(report.applied, 2);
        assert_eq!(report.shelved, 1);

        let queue = engine.schema_of::<User>().unwrap().async_queue().to_string();
        let errors = engine.read_async_errors(&queue, 10).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].payload.starts_with(r#"["INSERT INTO `User`"#));
        assert!(errors[0].error.contains("UNIQUE") || errors[0].error.contains("Duplicate"));
        for name in ["D", "E"] {
            assert!(user_named(&ctx, name).await.is_some());
        }
    }

    #[tokio::test]
    async fn test_garbage_payload_is_shelved() {
        let engine = engine().await;
        let ctx = engine.new_context();
        let queue = engine.schema_of::<User>().unwrap().async_queue().to_string();
        let redis = ctx.default_redis().unwrap();
        redis.rpush(&queue, &["not json"]).await.unwrap();

        let report = engine.consume(&ctx, false).await.unwrap();
        assert_eq!(report.shelved, 1);
        assert_eq!(redis.llen(&queue).await.unwrap(), 0);
        assert_eq!(redis.llen(&error_queue(&queue)).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_second_consumer_is_refused() {
        let engine = engine().await;
        let ctx = engine.new_context();
        let held = Locker::new(engine.default_redis().unwrap().clone())
            .obtain(CONSUMER_LOCK, Duration::from_secs(5), Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(engine.consume(&ctx, false).await, Err(OrmError::LockTimeout(_))));
        held.release().await.unwrap();
        assert!(engine.consume(&ctx, false).await.is_ok());
    }

    #[tokio::test]
    async fn test_blocking_consumer_stops_on_cancel() {
        let engine = engine().await;
        let ctx = engine.new_context();
        let worker = {
            let engine = engine.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { engine.consume(&ctx, true).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        ctx.cancel();
        let report = worker.await.unwrap().unwrap();
        assert!(!report.lock_lost);
    }

    #[tokio::test]
    async fn test_rows_read_before_consume_are_evicted_after() {
        let engine = engine().await;
        let mut ctx = engine.new_context();
        let tom = ctx.track(User::new("Tom", 30)).unwrap();
        ctx.flush().await.unwrap();

        tom.write().age = 31;
        ctx.track(&tom).unwrap();
        ctx.flush_async().await.unwrap();

        // Reads while the update waits cache the old state in both tiers.
        let between: User = ctx.get_by_id(tom.id()).await.unwrap().unwrap();
        assert_eq!(between.age, 30);
        assert_eq!(users_aged(&ctx, 30).await.len(), 1);

        let report = engine.consume(&ctx, false).await.unwrap();
        assert_eq!(report.applied, 1);
        let after: User = ctx.get_by_id(tom.id()).await.unwrap().unwrap();
        assert_eq!(after.age, 31);
        assert!(users_aged(&ctx, 30).await.is_empty());
        assert_eq!(users_aged(&ctx, 31).await.len(), 1);
    }

    #[tokio::test]
    async fn test_unique_lookup_finds_row_inserted_by_consumer() {
        let engine = engine().await;
        let mut ctx = engine.new_context();
        ctx.track(User::new("Tom", 30)).unwrap();
        ctx.flush().await.unwrap();

        ctx.track(User::new("Zed", 40)).unwrap();
        ctx.flush_async().await.unwrap();
        // Warms the unique HASH and caches an empty index set without Zed.
        assert!(user_named(&ctx, "Zed").await.is_none());
        assert!(users_aged(&ctx, 40).await.is_empty());

        engine.consume(&ctx, false).await.unwrap();
        let zed = user_named(&ctx, "Zed").await.unwrap();
        assert_eq!(zed.id, 2);
        let schema = engine.schema_of::<User>().unwrap();
        let redis = ctx.redis("default").unwrap();
        let fields = redis.hgetall(&schema.unique_key("Name")).await.unwrap();
        assert!(fields.values().any(|id| id == "2"));
        let by_age = users_aged(&ctx, 40).await;
        assert_eq!(by_age.iter().map(|u| u.id).collect::<Vec<_>>(), vec![2]);
    }

    #[tokio::test]
    async fn test_lost_lock_stops_blocking_consumer() {
        let mut registry = registry();
        registry.config_mut().consumer_lock_refresh_secs = 1;
        registry.config_mut().consumer_block_interval_ms = 20;
        let engine = engine_from(registry).await;
        let ctx = engine.new_context();
        let worker = {
            let engine = engine.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { engine.consume(&ctx, true).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        // The lock expired and is gone when the refresher next runs.
        engine.default_redis().unwrap().del(&[CONSUMER_LOCK]).await.unwrap();

        let report = tokio::time::timeout(Duration::from_secs(5), worker)
            .await
            .expect("consumer kept running without its lock")
            .unwrap()
            .unwrap();
        assert!(report.lock_lost);
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_context_applies_nothing_and_releases_lock() {
        let engine = engine().await;
        let mut ctx = engine.new_context();
        ctx.track(User::new("Ann", 20)).unwrap();
        ctx.flush_async().await.unwrap();
        let queue = engine.schema_of::<User>().unwrap().async_queue().to_string();

        let cancelled = engine.new_context();
        cancelled.cancel();
        let report = engine.consume(&cancelled, false).await.unwrap();
        assert_eq!((report.applied, report.shelved), (0, 0));
        assert_eq!(ctx.default_redis().unwrap().llen(&queue).await.unwrap(), 1);

        let report = engine.consume(&ctx, false).await.unwrap();
        assert_eq!(report.applied, 1);
    }
}
