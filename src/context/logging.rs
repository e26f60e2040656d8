// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Per-context query loggers.
//!
//! Every DB statement, RCACHE command and local-cache access made through a
//! context is offered to the loggers registered for its source. A context
//! with no loggers pays nothing beyond an emptiness check.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::storage::redis::RedisCache;

/// List receiving published log entries.
pub const LOG_CHANNEL: &str = "orm-log-channel";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Db,
    Redis,
    Local,
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LogSource::Db => "db",
            LogSource::Redis => "redis",
            LogSource::Local => "local",
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryLogEntry {
    pub source: LogSource,
    pub pool: String,
    pub operation: String,
    /// Statement or command with a parameter preview.
    pub query: String,
    #[serde(serialize_with = "as_micros")]
    pub duration: Duration,
    pub error: Option<String>,
}

fn as_micros<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_micros() as u64)
}

pub trait QueryLogger: Send + Sync {
    fn log(&self, entry: &QueryLogEntry);
}

/// Forwards entries to `tracing` at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingQueryLogger;

impl QueryLogger for TracingQueryLogger {
    fn log(&self, entry: &QueryLogEntry) {
        match &entry.error {
            Some(error) => debug!(
                source = %entry.source,
                pool = %entry.pool,
                operation = %entry.operation,
                duration_us = entry.duration.as_micros() as u64,
                error = %error,
                "{}",
                entry.query
            ),
            None => debug!(
                source = %entry.source,
                pool = %entry.pool,
                operation = %entry.operation,
                duration_us = entry.duration.as_micros() as u64,
                "{}",
                entry.query
            ),
        }
    }
}

/// Sends entries over a channel; pair with [`spawn_log_publisher`].
#[derive(Debug, Clone)]
pub struct ChannelQueryLogger {
    tx: mpsc::UnboundedSender<QueryLogEntry>,
}

impl ChannelQueryLogger {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<QueryLogEntry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl QueryLogger for ChannelQueryLogger {
    fn log(&self, entry: &QueryLogEntry) {
        // Receiver gone means the publisher stopped; entries are dropped.
        let _ = self.tx.send(entry.clone());
    }
}

/// RPUSH every received entry as JSON onto [`LOG_CHANNEL`] until the
/// senders are dropped.
pub fn spawn_log_publisher(
    cache: RedisCache,
    mut rx: mpsc::UnboundedReceiver<QueryLogEntry>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(entry) = rx.recv().await {
            let payload = match serde_json::to_string(&entry) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(error = %e, "unserializable log entry");
                    continue;
                }
            };
            if let Err(e) = cache.rpush(LOG_CHANNEL, &[payload]).await {
                warn!(error = %e, "failed to publish log entry");
            }
        }
    })
}

/// Loggers registered for one source.
#[derive(Clone, Default)]
pub struct LoggerSet {
    loggers: Vec<Arc<dyn QueryLogger>>,
}

impl LoggerSet {
    pub fn push(&mut self, logger: Arc<dyn QueryLogger>) {
        self.loggers.push(logger);
    }

    pub fn is_empty(&self) -> bool {
        self.loggers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.loggers.len()
    }

    pub(crate) fn emit(
        &self,
        source: LogSource,
        pool: &str,
        operation: &str,
        query: impl FnOnce() -> String,
        started: Instant,
        error: Option<&dyn fmt::Display>,
    ) {
        if self.loggers.is_empty() {
            return;
        }
        let entry = QueryLogEntry {
            source,
            pool: pool.to_string(),
            operation: operation.to_string(),
            query: query(),
            duration: started.elapsed(),
            error: error.map(|e| e.to_string()),
        };
        for logger in &self.loggers {
            logger.log(&entry);
        }
    }
}

impl fmt::Debug for LoggerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoggerSet").field("len", &self.loggers.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_logger_receives_entries() {
        let (logger, mut rx) = ChannelQueryLogger::new();
        let mut set = LoggerSet::default();
        set.push(Arc::new(logger));
        set.emit(
            LogSource::Db,
            "default",
            "exec",
            || "DELETE FROM `User` WHERE `ID` = 1".to_string(),
            Instant::now(),
            None,
        );
        let entry = rx.recv().await.unwrap();
        assert_eq!(entry.source, LogSource::Db);
        assert_eq!(entry.operation, "exec");
        assert!(entry.error.is_none());

        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["source"], "db");
    }

    #[test]
    fn test_empty_set_skips_query_rendering() {
        let set = LoggerSet::default();
        set.emit(
            LogSource::Redis,
            "default",
            "GET",
            || panic!("query must not be rendered"),
            Instant::now(),
            None,
        );
    }
}
