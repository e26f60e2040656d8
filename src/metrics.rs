// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation.
//!
//! Uses the `metrics` facade; the embedding application installs the
//! exporter.
//!
//! # Naming
//! - `tiered_orm_` prefix
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `layer`: local, redis, db
//! - `outcome`: hit, miss, absent, error
//! - `kind`: insert, update, delete, upsert

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

/// A cache or database lookup and how it ended.
pub fn record_lookup(layer: &'static str, entity: &str, outcome: &'static str) {
    counter!(
        "tiered_orm_lookups_total",
        "layer" => layer,
        "entity" => entity.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_db_statement(pool: &str, operation: &'static str, duration: Duration, ok: bool) {
    histogram!(
        "tiered_orm_db_statement_seconds",
        "pool" => pool.to_string(),
        "operation" => operation
    )
    .record(duration.as_secs_f64());
    if !ok {
        counter!(
            "tiered_orm_db_errors_total",
            "pool" => pool.to_string(),
            "operation" => operation
        )
        .increment(1);
    }
}

pub fn record_redis_command(pool: &str, duration: Duration, ok: bool) {
    histogram!("tiered_orm_redis_command_seconds", "pool" => pool.to_string())
        .record(duration.as_secs_f64());
    if !ok {
        counter!("tiered_orm_redis_errors_total", "pool" => pool.to_string()).increment(1);
    }
}

/// One flush action by kind and mode (`sync` or `async`).
pub fn record_flush_action(entity: &str, kind: &'static str, mode: &'static str) {
    counter!(
        "tiered_orm_flush_actions_total",
        "entity" => entity.to_string(),
        "kind" => kind,
        "mode" => mode
    )
    .increment(1);
}

pub fn record_flush_duration(duration: Duration) {
    histogram!("tiered_orm_flush_seconds").record(duration.as_secs_f64());
}

pub fn record_invalidation_failure(pool: &str) {
    counter!("tiered_orm_invalidation_failures_total", "pool" => pool.to_string()).increment(1);
}

pub fn record_async_applied(queue: &str, count: usize) {
    counter!("tiered_orm_async_applied_total", "queue" => queue.to_string())
        .increment(count as u64);
}

pub fn record_async_shelved(queue: &str) {
    counter!("tiered_orm_async_shelved_total", "queue" => queue.to_string()).increment(1);
}

pub fn set_async_queue_depth(queue: &str, depth: u64) {
    gauge!("tiered_orm_async_queue_depth", "queue" => queue.to_string()).set(depth as f64);
}

/// `outcome`: obtained, busy, lost, released.
pub fn record_lock(name: &str, outcome: &'static str) {
    counter!(
        "tiered_orm_lock_total",
        "lock" => name.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

pub fn record_unique_keys_loaded(entity: &str, index: &str, count: usize) {
    counter!(
        "tiered_orm_unique_keys_loaded_total",
        "entity" => entity.to_string(),
        "index" => index.to_string()
    )
    .increment(count as u64);
}

pub fn record_search_documents(entity: &str, count: usize) {
    counter!("tiered_orm_search_documents_total", "entity" => entity.to_string())
        .increment(count as u64);
}

/// Records DB statement latency on drop.
pub struct StatementTimer {
    pool: String,
    operation: &'static str,
    start: Instant,
    ok: bool,
}

impl StatementTimer {
    pub fn new(pool: &str, operation: &'static str) -> Self {
        Self {
            pool: pool.to_string(),
            operation,
            start: Instant::now(),
            ok: false,
        }
    }

    pub fn succeed(&mut self) {
        self.ok = true;
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for StatementTimer {
    fn drop(&mut self) {
        record_db_statement(&self.pool, self.operation, self.start.elapsed(), self.ok);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder};

    fn counters(recorder: &DebuggingRecorder) -> Vec<(String, u64)> {
        recorder
            .snapshotter()
            .snapshot()
            .into_vec()
            .into_iter()
            .filter_map(|(key, _, _, value)| match value {
                DebugValue::Counter(n) => Some((key.key().name().to_string(), n)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_lookup_counter() {
        let recorder = DebuggingRecorder::new();
        metrics::with_local_recorder(&recorder, || {
            record_lookup("redis", "User", "hit");
            record_lookup("redis", "User", "hit");
        });
        assert_eq!(counters(&recorder), vec![("tiered_orm_lookups_total".to_string(), 2)]);
    }

    #[test]
    fn test_failed_statement_counts_error() {
        let recorder = DebuggingRecorder::new();
        metrics::with_local_recorder(&recorder, || {
            let _timer = StatementTimer::new("default", "exec");
        });
        assert_eq!(counters(&recorder), vec![("tiered_orm_db_errors_total".to_string(), 1)]);

        let recorder = DebuggingRecorder::new();
        metrics::with_local_recorder(&recorder, || {
            let mut timer = StatementTimer::new("default", "exec");
            timer.succeed();
        });
        assert!(counters(&recorder).is_empty());
    }

    #[test]
    fn test_helpers_without_recorder() {
        record_flush_action("User", "insert", "sync");
        record_async_applied("_orm_async:default", 3);
        set_async_queue_depth("_orm_async:default", 0);
        record_lock("consumer", "obtained");
    }
}
