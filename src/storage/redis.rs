// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! RCACHE adapter.
//!
//! [`RedisCache`] is a typed facade over one Redis pool. Commands are built
//! as [`Command`] values and sent through a [`RedisConnection`], which is a
//! `ConnectionManager` in production and `MemoryRedis` in tests.
//!
//! Keys receive the pool's namespace as `<namespace>:<key>` when one is
//! configured; identifiers read back from the server have it stripped.
//!
//! Pipelining is explicit: a [`RedisPipeline`] collects commands, hands out
//! typed [`PipelineHandle`]s and sends everything on [`RedisPipeline::exec`].
//! Conversion errors surface only when a handle is read.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, ErrorKind, FromRedisValue, RedisResult, ToRedisArgs, Value};
use tracing::info;

use crate::context::logging::{LogSource, LoggerSet};
use crate::error::OrmError;
use crate::metrics;
use crate::resilience::retry::{retry, RetryConfig};

const PREVIEW_ARG_LEN: usize = 64;

/// One command with its encoded arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    name: String,
    args: Vec<Vec<u8>>,
}

impl Command {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            args: Vec::new(),
        }
    }

    pub fn arg<T: ToRedisArgs>(mut self, arg: T) -> Self {
        self.args.extend(arg.to_redis_args());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Vec<u8>] {
        &self.args
    }

    fn to_cmd(&self) -> redis::Cmd {
        let mut cmd = redis::cmd(&self.name);
        for arg in &self.args {
            cmd.arg(arg.as_slice());
        }
        cmd
    }

    /// Command line for logs, long arguments shortened.
    pub fn preview(&self) -> String {
        let mut out = self.name.clone();
        for arg in &self.args {
            out.push(' ');
            let text = String::from_utf8_lossy(arg);
            match text.char_indices().nth(PREVIEW_ARG_LEN) {
                Some((cut, _)) => {
                    out.push_str(&text[..cut]);
                    out.push_str("...");
                }
                None => out.push_str(&text),
            }
        }
        out
    }
}

/// Transport for commands.
#[async_trait]
pub trait RedisConnection: Send + Sync {
    async fn query(&self, command: &Command) -> RedisResult<Value>;

    /// One result per command; `atomic` wraps them in MULTI/EXEC.
    async fn pipeline(&self, commands: &[Command], atomic: bool) -> RedisResult<Vec<Value>>;
}

#[async_trait]
impl RedisConnection for ConnectionManager {
    async fn query(&self, command: &Command) -> RedisResult<Value> {
        let mut conn = self.clone();
        let value: Value = command.to_cmd().query_async(&mut conn).await?;
        Ok(value)
    }

    async fn pipeline(&self, commands: &[Command], atomic: bool) -> RedisResult<Vec<Value>> {
        if commands.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        if atomic {
            pipe.atomic();
        }
        for command in commands {
            pipe.add_command(command.to_cmd());
        }
        let mut conn = self.clone();
        let values: Vec<Value> = pipe.query_async(&mut conn).await?;
        Ok(values)
    }
}

fn conversion<T: FromRedisValue>(value: &Value) -> Result<T, OrmError> {
    Ok(redis::from_redis_value(value)?)
}

/// Flat `[field, value, field, value]` reply as pairs.
fn pairs(value: &Value) -> Result<Vec<(String, String)>, OrmError> {
    let items: Vec<String> = conversion(value)?;
    Ok(items
        .chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect())
}

/// One stream entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: Vec<(String, String)>,
}

fn stream_entries(value: &Value) -> Result<Vec<StreamEntry>, OrmError> {
    let Value::Array(items) = value else {
        return Ok(Vec::new());
    };
    items
        .iter()
        .filter_map(|item| match item {
            Value::Array(parts) if parts.len() == 2 => Some(parts),
            _ => None,
        })
        .map(|parts| {
            Ok(StreamEntry {
                id: conversion(&parts[0])?,
                fields: pairs(&parts[1])?,
            })
        })
        .collect()
}

/// Typed facade over one Redis pool.
#[derive(Clone)]
pub struct RedisCache {
    code: Arc<str>,
    namespace: Option<Arc<str>>,
    conn: Arc<dyn RedisConnection>,
    loggers: LoggerSet,
}

impl fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCache")
            .field("code", &self.code)
            .field("namespace", &self.namespace)
            .finish()
    }
}

impl RedisCache {
    pub async fn connect(code: &str, url: &str, namespace: Option<&str>) -> Result<Self, OrmError> {
        let client = Client::open(url)?;
        let manager = retry("redis_connect", &RetryConfig::startup(), || {
            ConnectionManager::new(client.clone())
        })
        .await?;
        info!(pool = code, "redis pool connected");
        Ok(Self::from_connection(code, namespace, Arc::new(manager)))
    }

    pub fn from_connection(
        code: &str,
        namespace: Option<&str>,
        conn: Arc<dyn RedisConnection>,
    ) -> Self {
        Self {
            code: Arc::from(code),
            namespace: namespace.filter(|n| !n.is_empty()).map(|n| Arc::from(format!("{n}:"))),
            conn,
            loggers: LoggerSet::default(),
        }
    }

    /// Same pool, reporting to `loggers`.
    pub fn with_loggers(&self, loggers: LoggerSet) -> Self {
        Self {
            loggers,
            ..self.clone()
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    /// Namespace without the trailing colon.
    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref().map(|n| n.trim_end_matches(':'))
    }

    pub fn key(&self, key: &str) -> String {
        match &self.namespace {
            Some(ns) => format!("{ns}{key}"),
            None => key.to_string(),
        }
    }

    pub fn strip<'a>(&self, key: &'a str) -> &'a str {
        match &self.namespace {
            Some(ns) => key.strip_prefix(ns.as_ref()).unwrap_or(key),
            None => key,
        }
    }

    fn observe(
        &self,
        operation: &str,
        preview: impl FnOnce() -> String,
        started: Instant,
        error: Option<&redis::RedisError>,
    ) {
        metrics::record_redis_command(&self.code, started.elapsed(), error.is_none());
        self.loggers.emit(
            LogSource::Redis,
            &self.code,
            operation,
            preview,
            started,
            error.map(|e| e as &dyn fmt::Display),
        );
    }

    async fn run_raw(&self, command: &Command) -> RedisResult<Value> {
        let started = Instant::now();
        let result = self.conn.query(command).await;
        self.observe(command.name(), || command.preview(), started, result.as_ref().err());
        result
    }

    async fn run<T: FromRedisValue>(&self, command: Command) -> Result<T, OrmError> {
        let value = self.run_raw(&command).await?;
        conversion(&value)
    }

    /// Send a prebuilt command; keys must already be namespaced.
    pub async fn command(&self, command: Command) -> Result<Value, OrmError> {
        Ok(self.run_raw(&command).await?)
    }

    pub fn pipeline(&self) -> RedisPipeline {
        RedisPipeline::new(self.clone())
    }

    pub async fn ping(&self) -> Result<Duration, OrmError> {
        let started = Instant::now();
        let _: String = self.run(Command::new("PING")).await?;
        Ok(started.elapsed())
    }

    pub async fn flush_db(&self) -> Result<(), OrmError> {
        self.run::<()>(Command::new("FLUSHDB")).await
    }

    // strings and keys

    pub async fn get(&self, key: &str) -> Result<Option<String>, OrmError> {
        self.run(Command::new("GET").arg(self.key(key))).await
    }

    pub async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), OrmError> {
        let mut command = Command::new("SET").arg(self.key(key)).arg(value);
        if let Some(ttl) = ttl {
            command = command.arg("PX").arg(ttl.as_millis() as u64);
        }
        self.run::<()>(command).await
    }

    /// `SET NX`; true when the key was written.
    pub async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool, OrmError> {
        let mut command = Command::new("SET").arg(self.key(key)).arg(value).arg("NX");
        if let Some(ttl) = ttl {
            command = command.arg("PX").arg(ttl.as_millis() as u64);
        }
        let reply: Option<String> = self.run(command).await?;
        Ok(reply.is_some())
    }

    pub async fn del(&self, keys: &[&str]) -> Result<u64, OrmError> {
        if keys.is_empty() {
            return Ok(0);
        }
        let keys: Vec<String> = keys.iter().map(|k| self.key(k)).collect();
        self.run(Command::new("DEL").arg(keys)).await
    }

    pub async fn exists(&self, key: &str) -> Result<bool, OrmError> {
        let n: u64 = self.run(Command::new("EXISTS").arg(self.key(key))).await?;
        Ok(n > 0)
    }

    pub async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, OrmError> {
        self.run(Command::new("PEXPIRE").arg(self.key(key)).arg(ttl.as_millis() as u64))
            .await
    }

    /// Remaining TTL; `None` for a missing key or one without expiry.
    pub async fn pttl(&self, key: &str) -> Result<Option<Duration>, OrmError> {
        let ms: i64 = self.run(Command::new("PTTL").arg(self.key(key))).await?;
        Ok(u64::try_from(ms).ok().map(Duration::from_millis))
    }

    /// Keys matching `pattern`, namespace stripped.
    pub async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>, OrmError> {
        let mut cursor = 0u64;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = self
                .run(
                    Command::new("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(self.key(pattern))
                        .arg("COUNT")
                        .arg(1000),
                )
                .await?;
            keys.extend(batch.iter().map(|k| self.strip(k).to_string()));
            if next == 0 {
                return Ok(keys);
            }
            cursor = next;
        }
    }

    // hashes

    pub async fn hset(&self, key: &str, fields: &[(String, String)]) -> Result<u64, OrmError> {
        if fields.is_empty() {
            return Ok(0);
        }
        let mut command = Command::new("HSET").arg(self.key(key));
        for (field, value) in fields {
            command = command.arg(field).arg(value);
        }
        self.run(command).await
    }

    pub async fn hget(&self, key: &str, field: &str) -> Result<Option<String>, OrmError> {
        self.run(Command::new("HGET").arg(self.key(key)).arg(field)).await
    }

    pub async fn hmget(
        &self,
        key: &str,
        fields: &[String],
    ) -> Result<Vec<Option<String>>, OrmError> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        self.run(Command::new("HMGET").arg(self.key(key)).arg(fields)).await
    }

    pub async fn hdel(&self, key: &str, fields: &[String]) -> Result<u64, OrmError> {
        if fields.is_empty() {
            return Ok(0);
        }
        self.run(Command::new("HDEL").arg(self.key(key)).arg(fields)).await
    }

    pub async fn hgetall(&self, key: &str) -> Result<HashMap<String, String>, OrmError> {
        let value = self.run_raw(&Command::new("HGETALL").arg(self.key(key))).await?;
        Ok(pairs(&value)?.into_iter().collect())
    }

    pub async fn hlen(&self, key: &str) -> Result<u64, OrmError> {
        self.run(Command::new("HLEN").arg(self.key(key))).await
    }

    pub async fn hincrby(&self, key: &str, field: &str, delta: i64) -> Result<i64, OrmError> {
        self.run(Command::new("HINCRBY").arg(self.key(key)).arg(field).arg(delta))
            .await
    }

    // lists

    pub async fn lpush<V: ToRedisArgs + Sync>(
        &self,
        key: &str,
        values: &[V],
    ) -> Result<u64, OrmError> {
        self.run(Command::new("LPUSH").arg(self.key(key)).arg(values)).await
    }

    pub async fn rpush<V: ToRedisArgs + Sync>(
        &self,
        key: &str,
        values: &[V],
    ) -> Result<u64, OrmError> {
        self.run(Command::new("RPUSH").arg(self.key(key)).arg(values)).await
    }

    pub async fn lrange(&self, key: &str, start: i64, stop: i64) -> Result<Vec<Vec<u8>>, OrmError> {
        self.run(Command::new("LRANGE").arg(self.key(key)).arg(start).arg(stop))
            .await
    }

    pub async fn lrange_strings(
        &self,
        key: &str,
        start: i64,
        stop: i64,
    ) -> Result<Vec<String>, OrmError> {
        self.run(Command::new("LRANGE").arg(self.key(key)).arg(start).arg(stop))
            .await
    }

    pub async fn llen(&self, key: &str) -> Result<u64, OrmError> {
        self.run(Command::new("LLEN").arg(self.key(key))).await
    }

    pub async fn ltrim(&self, key: &str, start: i64, stop: i64) -> Result<(), OrmError> {
        self.run::<()>(Command::new("LTRIM").arg(self.key(key)).arg(start).arg(stop))
            .await
    }

    pub async fn lpop(&self, key: &str) -> Result<Option<String>, OrmError> {
        self.run(Command::new("LPOP").arg(self.key(key))).await
    }

    pub async fn rpop(&self, key: &str) -> Result<Option<String>, OrmError> {
        self.run(Command::new("RPOP").arg(self.key(key))).await
    }

    pub async fn lrem(&self, key: &str, count: i64, value: &str) -> Result<u64, OrmError> {
        self.run(Command::new("LREM").arg(self.key(key)).arg(count).arg(value))
            .await
    }

    pub async fn lset(&self, key: &str, index: i64, value: &str) -> Result<(), OrmError> {
        self.run::<()>(Command::new("LSET").arg(self.key(key)).arg(index).arg(value))
            .await
    }

    /// `BLMOVE source destination LEFT|RIGHT LEFT|RIGHT timeout`.
    pub async fn blmove(
        &self,
        source: &str,
        destination: &str,
        from_left: bool,
        to_left: bool,
        timeout: Duration,
    ) -> Result<Option<String>, OrmError> {
        let side = |left: bool| if left { "LEFT" } else { "RIGHT" };
        self.run(
            Command::new("BLMOVE")
                .arg(self.key(source))
                .arg(self.key(destination))
                .arg(side(from_left))
                .arg(side(to_left))
                .arg(timeout.as_secs_f64()),
        )
        .await
    }

    // sets

    pub async fn sadd<V: ToRedisArgs + Sync>(
        &self,
        key: &str,
        members: &[V],
    ) -> Result<u64, OrmError> {
        self.run(Command::new("SADD").arg(self.key(key)).arg(members)).await
    }

    pub async fn srem<V: ToRedisArgs + Sync>(
        &self,
        key: &str,
        members: &[V],
    ) -> Result<u64, OrmError> {
        self.run(Command::new("SREM").arg(self.key(key)).arg(members)).await
    }

    pub async fn smembers(&self, key: &str) -> Result<Vec<String>, OrmError> {
        self.run(Command::new("SMEMBERS").arg(self.key(key))).await
    }

    pub async fn scard(&self, key: &str) -> Result<u64, OrmError> {
        self.run(Command::new("SCARD").arg(self.key(key))).await
    }

    pub async fn spop(&self, key: &str) -> Result<Option<String>, OrmError> {
        self.run(Command::new("SPOP").arg(self.key(key))).await
    }

    // sorted sets

    pub async fn zadd(&self, key: &str, members: &[(f64, String)]) -> Result<u64, OrmError> {
        let mut command = Command::new("ZADD").arg(self.key(key));
        for (score, member) in members {
            command = command.arg(*score).arg(member);
        }
        self.run(command).await
    }

    pub async fn zrange_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: Option<(usize, usize)>,
    ) -> Result<Vec<String>, OrmError> {
        let mut command = Command::new("ZRANGEBYSCORE").arg(self.key(key)).arg(min).arg(max);
        if let Some((offset, count)) = limit {
            command = command.arg("LIMIT").arg(offset).arg(count);
        }
        self.run(command).await
    }

    pub async fn zscore(&self, key: &str, member: &str) -> Result<Option<f64>, OrmError> {
        self.run(Command::new("ZSCORE").arg(self.key(key)).arg(member)).await
    }

    pub async fn zrem(&self, key: &str, members: &[String]) -> Result<u64, OrmError> {
        self.run(Command::new("ZREM").arg(self.key(key)).arg(members)).await
    }

    pub async fn zcard(&self, key: &str) -> Result<u64, OrmError> {
        self.run(Command::new("ZCARD").arg(self.key(key))).await
    }

    // streams

    pub async fn xadd(
        &self,
        stream: &str,
        fields: &[(String, String)],
    ) -> Result<String, OrmError> {
        let mut command = Command::new("XADD").arg(self.key(stream)).arg("*");
        for (field, value) in fields {
            command = command.arg(field).arg(value);
        }
        self.run(command).await
    }

    pub async fn xlen(&self, stream: &str) -> Result<u64, OrmError> {
        self.run(Command::new("XLEN").arg(self.key(stream))).await
    }

    pub async fn xtrim(&self, stream: &str, max_len: u64) -> Result<u64, OrmError> {
        self.run(Command::new("XTRIM").arg(self.key(stream)).arg("MAXLEN").arg(max_len))
            .await
    }

    /// Create a consumer group; false when it already exists.
    pub async fn xgroup_create(
        &self,
        stream: &str,
        group: &str,
        start: &str,
    ) -> Result<bool, OrmError> {
        let command = Command::new("XGROUP")
            .arg("CREATE")
            .arg(self.key(stream))
            .arg(group)
            .arg(start)
            .arg("MKSTREAM");
        match self.run_raw(&command).await {
            Ok(_) => Ok(true),
            Err(e) if e.code() == Some("BUSYGROUP") || e.to_string().contains("BUSYGROUP") => {
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// New entries for `consumer`; an empty list when `block` elapses.
    pub async fn xread_group(
        &self,
        group: &str,
        consumer: &str,
        stream: &str,
        count: usize,
        block: Option<Duration>,
    ) -> Result<Vec<StreamEntry>, OrmError> {
        let mut command = Command::new("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count);
        if let Some(block) = block {
            command = command.arg("BLOCK").arg(block.as_millis() as u64);
        }
        let reply = self
            .run_raw(&command.arg("STREAMS").arg(self.key(stream)).arg(">"))
            .await?;
        let Value::Array(streams) = reply else {
            return Ok(Vec::new());
        };
        let mut entries = Vec::new();
        for stream in &streams {
            if let Value::Array(parts) = stream {
                if let Some(list) = parts.get(1) {
                    entries.extend(stream_entries(list)?);
                }
            }
        }
        Ok(entries)
    }

    pub async fn xack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, OrmError> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.run(Command::new("XACK").arg(self.key(stream)).arg(group).arg(ids))
            .await
    }

    /// Number of delivered but unacknowledged entries.
    pub async fn xpending(&self, stream: &str, group: &str) -> Result<u64, OrmError> {
        let reply = self
            .run_raw(&Command::new("XPENDING").arg(self.key(stream)).arg(group))
            .await?;
        match reply {
            Value::Array(parts) => parts.first().map_or(Ok(0), conversion),
            other => conversion(&other),
        }
    }

    pub async fn xclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> Result<Vec<StreamEntry>, OrmError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let reply = self
            .run_raw(
                &Command::new("XCLAIM")
                    .arg(self.key(stream))
                    .arg(group)
                    .arg(consumer)
                    .arg(min_idle.as_millis() as u64)
                    .arg(ids),
            )
            .await?;
        stream_entries(&reply)
    }

    // scripting

    /// `EVALSHA`, falling back to `EVAL` when the server lacks the script.
    pub async fn eval(
        &self,
        script: &str,
        keys: &[&str],
        args: &[String],
    ) -> Result<Value, OrmError> {
        let keys: Vec<String> = keys.iter().map(|k| self.key(k)).collect();
        let hash = redis::Script::new(script).get_hash().to_string();
        let cached = Command::new("EVALSHA")
            .arg(&hash)
            .arg(keys.len())
            .arg(&keys)
            .arg(args);
        match self.run_raw(&cached).await {
            Err(e) if e.kind() == ErrorKind::NoScriptError => {
                let full = Command::new("EVAL")
                    .arg(script)
                    .arg(keys.len())
                    .arg(&keys)
                    .arg(args);
                Ok(self.run_raw(&full).await?)
            }
            other => Ok(other?),
        }
    }

    /// `FT.*` passthrough, e.g. `ft("FT.CREATE", &descriptor.ft_create_args(ns))`.
    pub async fn ft(&self, command: &str, args: &[String]) -> Result<Value, OrmError> {
        Ok(self.run_raw(&Command::new(command).arg(args)).await?)
    }
}

/// Index of a queued pipeline command and the type it will be read as.
#[derive(Debug)]
pub struct PipelineHandle<T> {
    index: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for PipelineHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for PipelineHandle<T> {}

/// Replies of one executed pipeline.
#[derive(Debug, Default)]
pub struct PipelineResults {
    values: Vec<Value>,
}

impl PipelineResults {
    pub fn get<T: FromRedisValue>(&self, handle: PipelineHandle<T>) -> Result<T, OrmError> {
        let value = self.values.get(handle.index).ok_or_else(|| {
            OrmError::InvalidArgument(format!("pipeline has no reply #{}", handle.index))
        })?;
        conversion(value)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Commands accumulated for one pool.
#[derive(Debug)]
pub struct RedisPipeline {
    cache: RedisCache,
    commands: Vec<Command>,
    atomic: bool,
}

impl RedisPipeline {
    fn new(cache: RedisCache) -> Self {
        Self {
            cache,
            commands: Vec::new(),
            atomic: false,
        }
    }

    /// Run as MULTI/EXEC.
    pub fn atomic(&mut self) -> &mut Self {
        self.atomic = true;
        self
    }

    pub fn pool(&self) -> &str {
        self.cache.code()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    fn push<T>(&mut self, command: Command) -> PipelineHandle<T> {
        self.commands.push(command);
        PipelineHandle {
            index: self.commands.len() - 1,
            _marker: PhantomData,
        }
    }

    /// Queue a prebuilt command; keys must already be namespaced.
    pub fn command(&mut self, command: Command) -> PipelineHandle<Value> {
        self.push(command)
    }

    pub fn del(&mut self, key: &str) -> PipelineHandle<u64> {
        let key = self.cache.key(key);
        self.push(Command::new("DEL").arg(key))
    }

    pub fn set(&mut self, key: &str, value: &str, ttl: Option<Duration>) -> PipelineHandle<()> {
        let mut command = Command::new("SET").arg(self.cache.key(key)).arg(value);
        if let Some(ttl) = ttl {
            command = command.arg("PX").arg(ttl.as_millis() as u64);
        }
        self.push(command)
    }

    pub fn rpush<V: ToRedisArgs>(&mut self, key: &str, values: &[V]) -> PipelineHandle<u64> {
        let key = self.cache.key(key);
        self.push(Command::new("RPUSH").arg(key).arg(values))
    }

    pub fn sadd<V: ToRedisArgs>(&mut self, key: &str, members: &[V]) -> PipelineHandle<u64> {
        let key = self.cache.key(key);
        self.push(Command::new("SADD").arg(key).arg(members))
    }

    pub fn srem<V: ToRedisArgs>(&mut self, key: &str, members: &[V]) -> PipelineHandle<u64> {
        let key = self.cache.key(key);
        self.push(Command::new("SREM").arg(key).arg(members))
    }

    pub fn hset(&mut self, key: &str, field: &str, value: &str) -> PipelineHandle<u64> {
        let key = self.cache.key(key);
        self.push(Command::new("HSET").arg(key).arg(field).arg(value))
    }

    pub fn hdel(&mut self, key: &str, field: &str) -> PipelineHandle<u64> {
        let key = self.cache.key(key);
        self.push(Command::new("HDEL").arg(key).arg(field))
    }

    pub fn hset_many(&mut self, key: &str, fields: &[(String, String)]) -> PipelineHandle<u64> {
        let mut command = Command::new("HSET").arg(self.cache.key(key));
        for (field, value) in fields {
            command = command.arg(field).arg(value);
        }
        self.push(command)
    }

    pub fn ltrim(&mut self, key: &str, start: i64, stop: i64) -> PipelineHandle<()> {
        let key = self.cache.key(key);
        self.push(Command::new("LTRIM").arg(key).arg(start).arg(stop))
    }

    pub fn lrange(&mut self, key: &str, start: i64, stop: i64) -> PipelineHandle<Vec<Vec<u8>>> {
        let key = self.cache.key(key);
        self.push(Command::new("LRANGE").arg(key).arg(start).arg(stop))
    }

    pub fn smembers(&mut self, key: &str) -> PipelineHandle<Vec<String>> {
        let key = self.cache.key(key);
        self.push(Command::new("SMEMBERS").arg(key))
    }

    pub fn xadd(&mut self, stream: &str, fields: &[(String, String)]) -> PipelineHandle<String> {
        let mut command = Command::new("XADD").arg(self.cache.key(stream)).arg("*");
        for (field, value) in fields {
            command = command.arg(field).arg(value);
        }
        self.push(command)
    }

    /// Send every queued command and reset the pipeline.
    pub async fn exec(&mut self) -> Result<PipelineResults, OrmError> {
        let commands = std::mem::take(&mut self.commands);
        let atomic = std::mem::replace(&mut self.atomic, false);
        if commands.is_empty() {
            return Ok(PipelineResults::default());
        }
        let started = Instant::now();
        let result = self.cache.conn.pipeline(&commands, atomic).await;
        let operation = if atomic { "MULTI" } else { "PIPELINE" };
        self.cache.observe(
            operation,
            || {
                commands
                    .iter()
                    .map(Command::preview)
                    .collect::<Vec<_>>()
                    .join("; ")
            },
            started,
            result.as_ref().err(),
        );
        Ok(PipelineResults { values: result? })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::redis_memory::MemoryRedis;

    fn cache(namespace: Option<&str>) -> RedisCache {
        RedisCache::from_connection("default", namespace, Arc::new(MemoryRedis::new()))
    }

    #[test]
    fn test_namespace_applied_and_stripped() {
        let c = cache(Some("app"));
        assert_eq!(c.key("abc:1"), "app:abc:1");
        assert_eq!(c.strip("app:abc:1"), "abc:1");
        assert_eq!(c.namespace(), Some("app"));
        assert_eq!(cache(None).key("abc:1"), "abc:1");
    }

    #[test]
    fn test_preview_shortens_long_args() {
        let cmd = Command::new("SET").arg("k").arg("x".repeat(100));
        let preview = cmd.preview();
        assert!(preview.starts_with("SET k xxx"));
        assert!(preview.ends_with("..."));
    }

    #[tokio::test]
    async fn test_basic_ops_through_facade() {
        let c = cache(Some("app"));
        c.set("a", "1", None).await.unwrap();
        assert_eq!(c.get("a").await.unwrap().as_deref(), Some("1"));
        assert!(!c.set_nx("a", "2", None).await.unwrap());

        c.rpush("list", &["x", "y", "z"]).await.unwrap();
        assert_eq!(c.llen("list").await.unwrap(), 3);
        c.ltrim("list", 1, -1).await.unwrap();
        assert_eq!(c.lrange_strings("list", 0, -1).await.unwrap(), vec!["y", "z"]);

        c.hset("h", &[("f".into(), "v".into())]).await.unwrap();
        assert_eq!(c.hget("h", "f").await.unwrap().as_deref(), Some("v"));
        assert_eq!(c.hgetall("h").await.unwrap().len(), 1);

        assert_eq!(c.scan_keys("*").await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_pipeline_handles() {
        let c = cache(None);
        let mut pipe = c.pipeline();
        let pushed = pipe.rpush("l", &["a", "b"]);
        let added = pipe.sadd("s", &["m"]);
        let deleted = pipe.del("missing");
        let results = pipe.exec().await.unwrap();
        assert_eq!(results.get(pushed).unwrap(), 2);
        assert_eq!(results.get(added).unwrap(), 1);
        assert_eq!(results.get(deleted).unwrap(), 0);
        assert!(pipe.is_empty());
    }

    #[tokio::test]
    async fn test_eval_falls_back_to_full_script() {
        let c = cache(None);
        c.set("lock", "token", None).await.unwrap();
        let released = c
            .eval(crate::storage::lock::RELEASE_SCRIPT, &["lock"], &["token".to_string()])
            .await
            .unwrap();
        assert_eq!(released, Value::Int(1));
        assert!(!c.exists("lock").await.unwrap());
    }
}
