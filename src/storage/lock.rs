// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Named TTL locks on RCACHE.
//!
//! A lock is a key holding a random token, written with `SET NX PX`.
//! Refresh and release run as scripts that act only while the token still
//! matches, so a holder whose lock expired cannot disturb the next owner.

use std::time::{Duration, Instant};

use redis::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::OrmError;
use crate::metrics;
use crate::resilience::retry::RetryConfig;
use crate::storage::redis::RedisCache;

pub const REFRESH_SCRIPT: &str = r#"if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("pexpire", KEYS[1], ARGV[2])
else
    return 0
end"#;

pub const RELEASE_SCRIPT: &str = r#"if redis.call("get", KEYS[1]) == ARGV[1] then
    return redis.call("del", KEYS[1])
else
    return 0
end"#;

fn script_succeeded(value: &Value) -> bool {
    matches!(value, Value::Int(n) if *n > 0)
}

/// Lock factory bound to one RCACHE pool.
#[derive(Debug, Clone)]
pub struct Locker {
    cache: RedisCache,
}

impl Locker {
    pub fn new(cache: RedisCache) -> Self {
        Self { cache }
    }

    /// Try to take `key` for `ttl`, retrying until `wait` has passed.
    /// `Ok(None)` means another holder kept it the whole time.
    pub async fn obtain(
        &self,
        key: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Result<Option<Lock>, OrmError> {
        let token = Uuid::new_v4().to_string();
        let deadline = Instant::now() + wait;
        let retry = RetryConfig::lock();
        let mut delays = retry.delays();
        loop {
            if self.cache.set_nx(key, &token, Some(ttl)).await? {
                metrics::record_lock(key, "obtained");
                debug!(lock = key, ttl_ms = ttl.as_millis() as u64, "lock obtained");
                return Ok(Some(Lock {
                    cache: self.cache.clone(),
                    key: key.to_string(),
                    token,
                    released: false,
                }));
            }
            let now = Instant::now();
            if now >= deadline {
                metrics::record_lock(key, "busy");
                return Ok(None);
            }
            let delay = delays.next().unwrap_or(Duration::from_millis(20));
            tokio::time::sleep(delay.min(deadline - now)).await;
        }
    }
}

/// A held lock. Dropping without [`Lock::release`] leaves the key to expire.
#[derive(Debug)]
pub struct Lock {
    cache: RedisCache,
    key: String,
    token: String,
    released: bool,
}

impl Lock {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Extend the TTL; false when the lock is no longer ours.
    pub async fn refresh(&self, ttl: Duration) -> Result<bool, OrmError> {
        let reply = self
            .cache
            .eval(
                REFRESH_SCRIPT,
                &[&self.key],
                &[self.token.clone(), ttl.as_millis().to_string()],
            )
            .await?;
        let held = script_succeeded(&reply);
        if !held {
            metrics::record_lock(&self.key, "lost");
            warn!(lock = %self.key, "lock lost before refresh");
        }
        Ok(held)
    }

    /// Remaining TTL, `None` when the key is gone.
    pub async fn ttl(&self) -> Result<Option<Duration>, OrmError> {
        self.cache.pttl(&self.key).await
    }

    pub async fn release(mut self) -> Result<bool, OrmError> {
        self.released = true;
        let reply = self
            .cache
            .eval(RELEASE_SCRIPT, &[&self.key], &[self.token.clone()])
            .await?;
        let released = script_succeeded(&reply);
        metrics::record_lock(&self.key, if released { "released" } else { "lost" });
        Ok(released)
    }
}

impl Drop for Lock {
    fn drop(&mut self) {
        if !self.released {
            debug!(lock = %self.key, "lock dropped without release");
        }
    }
}
