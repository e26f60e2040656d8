// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Storage adapters for the three tiers.
//!
//! - [`sql`]: DB pools, transactions and driver error mapping
//! - [`redis`]: RCACHE facade and explicit pipelines
//! - `redis_memory`: in-process RCACHE server for tests (`test-util` feature)
//! - [`lock`]: TTL locks on RCACHE
//! - [`local`]: per-process LRU partitions

pub mod local;
pub mod lock;
pub mod redis;
#[cfg(any(test, feature = "test-util"))]
pub mod redis_memory;
pub mod sql;

pub use local::{CachedRow, LocalCache, LocalKey, LocalValue};
pub use lock::{Lock, Locker};
pub use redis::{
    Command, PipelineHandle, PipelineResults, RedisCache, RedisConnection, RedisPipeline,
    StreamEntry,
};
#[cfg(any(test, feature = "test-util"))]
pub use redis_memory::MemoryRedis;
pub use sql::{DbPool, DbTransaction, Dialect, ExecResult, PreparedStatement};
