// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Health checks and the schema passthroughs.
//!
//! The engine never migrates on its own. [`Engine::create_table_statements`]
//! renders DDL for review and [`Engine::exec_alters`] runs statements the
//! caller has approved.

use futures::future::join_all;
use tracing::{info, instrument, warn};

use crate::context::Context;
use crate::error::OrmError;
use crate::schema::ddl;
use crate::schema::Entity;

use super::{Engine, HealthReport, PoolHealth, PoolKind};

impl Engine {
    /// Ping every database and RCACHE pool concurrently.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> HealthReport {
        let db = join_all(self.db_pools().map(|pool| async move {
            let outcome = pool.ping().await;
            (pool.code().to_string(), PoolKind::Db, outcome)
        }));
        let redis = join_all(self.redis_pools().map(|cache| async move {
            let outcome = cache.ping().await;
            (cache.code().to_string(), PoolKind::Redis, outcome)
        }));
        let (db, redis) = futures::join!(db, redis);

        let mut pools: Vec<PoolHealth> = db
            .into_iter()
            .chain(redis)
            .map(|(code, kind, outcome)| match outcome {
                Ok(latency) => PoolHealth {
                    code,
                    kind,
                    latency: Some(latency),
                    error: None,
                },
                Err(e) => {
                    warn!(pool = %code, kind = ?kind, error = %e, "pool unhealthy");
                    PoolHealth {
                        code,
                        kind,
                        latency: None,
                        error: Some(e.to_string()),
                    }
                }
            })
            .collect();
        pools.sort_by(|a, b| {
            (&a.code, a.kind == PoolKind::Redis).cmp(&(&b.code, b.kind == PoolKind::Redis))
        });
        HealthReport { pools }
    }

    /// DDL creating the table of `E`, foreign keys included.
    pub fn create_table_statements<E: Entity>(&self) -> Result<Vec<String>, OrmError> {
        let schema = self.schema_of::<E>()?;
        Ok(ddl::create_table(schema, |target| {
            self.schema(target).ok().map(|s| s.table().to_string())
        }))
    }

    /// Run caller-approved DDL on `pool`, in order. Stops at the first
    /// failing statement.
    #[instrument(skip(self, ctx, statements), fields(count = statements.len()))]
    pub async fn exec_alters(
        &self,
        ctx: &Context,
        pool: &str,
        statements: &[String],
    ) -> Result<usize, OrmError> {
        let db = self.db(pool)?;
        for statement in statements {
            ctx.check_cancelled()?;
            db.exec(ctx.db_loggers(), statement, &[]).await?;
        }
        info!(pool, count = statements.len(), "alters applied");
        Ok(statements.len())
    }

    /// Create the tables of every registered entity. Tables come first,
    /// foreign key alters after, so registration order does not matter.
    pub async fn create_tables(&self, ctx: &Context) -> Result<usize, OrmError> {
        let mut tables: Vec<(String, String)> = Vec::new();
        let mut alters: Vec<(String, String)> = Vec::new();
        for schema in self.registry().schemas() {
            let statements = ddl::create_table(schema, |target| {
                self.schema(target).ok().map(|s| s.table().to_string())
            });
            for statement in statements {
                let pool = schema.db_pool().to_string();
                if statement.starts_with("ALTER TABLE") {
                    alters.push((pool, statement));
                } else {
                    tables.push((pool, statement));
                }
            }
        }
        let mut applied = 0;
        for (pool, statement) in tables.into_iter().chain(alters) {
            applied += self.exec_alters(ctx, &pool, std::slice::from_ref(&statement)).await?;
        }
        Ok(applied)
    }
}
