// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Process-local cache tier.
//!
//! One LRU partition per entity, created on first use and bounded by the
//! pool's configured size. Three kinds of entries share a partition:
//!
//! ```text
//! Row(id)                    decoded row + image, or Absent
//! Index { index, hash }      ids of a cached non-unique index
//! Reference { column, id }   ids of rows pointing at a parent
//! ```

use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;

use crate::codec::Row;
use crate::context::logging::{LogSource, LoggerSet};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LocalKey {
    Row(u64),
    Index { index: String, hash: u64 },
    Reference { column: String, parent: u64 },
}

impl fmt::Display for LocalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LocalKey::Row(id) => write!(f, "{id}"),
            LocalKey::Index { index, hash } => write!(f, "{index}:{hash}"),
            LocalKey::Reference { column, parent } => write!(f, "ref:{column}:{parent}"),
        }
    }
}

/// A decoded row together with the image it was decoded from.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedRow {
    pub row: Row,
    pub image: Arc<[u8]>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LocalValue {
    Row(Arc<CachedRow>),
    /// Known absent.
    Absent,
    Ids(Arc<Vec<u64>>),
}

type Partition = Arc<Mutex<LruCache<LocalKey, LocalValue>>>;

struct Inner {
    code: String,
    capacity: NonZeroUsize,
    partitions: DashMap<String, Partition>,
}

/// Handle to one local cache pool. Clones share the partitions.
#[derive(Clone)]
pub struct LocalCache {
    inner: Arc<Inner>,
    loggers: LoggerSet,
}

impl fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalCache")
            .field("code", &self.inner.code)
            .field("capacity", &self.inner.capacity)
            .field("partitions", &self.inner.partitions.len())
            .finish()
    }
}

impl LocalCache {
    /// `capacity` bounds each entity partition; zero is raised to one.
    pub fn new(code: &str, capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                code: code.to_string(),
                capacity: NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
                partitions: DashMap::new(),
            }),
            loggers: LoggerSet::default(),
        }
    }

    pub fn with_loggers(&self, loggers: LoggerSet) -> Self {
        Self {
            inner: self.inner.clone(),
            loggers,
        }
    }

    pub fn code(&self) -> &str {
        &self.inner.code
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity.get()
    }

    fn partition(&self, entity: &str) -> Partition {
        if let Some(p) = self.inner.partitions.get(entity) {
            return p.clone();
        }
        self.inner
            .partitions
            .entry(entity.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(LruCache::new(self.inner.capacity))))
            .clone()
    }

    fn log(&self, operation: &str, entity: &str, keys: impl FnOnce() -> String, started: Instant) {
        self.loggers.emit(
            LogSource::Local,
            &self.inner.code,
            operation,
            || format!("{operation} {entity} {}", keys()),
            started,
            None,
        );
    }

    pub fn get(&self, entity: &str, key: &LocalKey) -> Option<LocalValue> {
        let started = Instant::now();
        let value = self.partition(entity).lock().get(key).cloned();
        self.log("GET", entity, || key.to_string(), started);
        value
    }

    /// Look up several keys at once; misses are `None`.
    pub fn get_many(&self, entity: &str, keys: &[LocalKey]) -> Vec<Option<LocalValue>> {
        let started = Instant::now();
        let partition = self.partition(entity);
        let values = {
            let mut lru = partition.lock();
            keys.iter().map(|k| lru.get(k).cloned()).collect()
        };
        self.log("MGET", entity, || join_keys(keys.iter()), started);
        values
    }

    pub fn set(&self, entity: &str, key: LocalKey, value: LocalValue) {
        let started = Instant::now();
        let rendered = if self.loggers.is_empty() {
            String::new()
        } else {
            key.to_string()
        };
        self.partition(entity).lock().put(key, value);
        self.log("SET", entity, || rendered, started);
    }

    pub fn multi_set(&self, entity: &str, entries: Vec<(LocalKey, LocalValue)>) {
        if entries.is_empty() {
            return;
        }
        let started = Instant::now();
        let rendered = if self.loggers.is_empty() {
            String::new()
        } else {
            join_keys(entries.iter().map(|(k, _)| k))
        };
        let partition = self.partition(entity);
        let mut lru = partition.lock();
        for (key, value) in entries {
            lru.put(key, value);
        }
        drop(lru);
        self.log("MSET", entity, || rendered, started);
    }

    pub fn remove(&self, entity: &str, keys: &[LocalKey]) {
        if keys.is_empty() {
            return;
        }
        let started = Instant::now();
        let partition = self.partition(entity);
        let mut lru = partition.lock();
        for key in keys {
            lru.pop(key);
        }
        drop(lru);
        self.log("REMOVE", entity, || join_keys(keys.iter()), started);
    }

    /// Drop one entity's partition, or every partition when `entity` is `None`.
    pub fn clear(&self, entity: Option<&str>) {
        let started = Instant::now();
        match entity {
            Some(entity) => {
                self.inner.partitions.remove(entity);
            }
            None => self.inner.partitions.clear(),
        }
        self.log("CLEAR", entity.unwrap_or("*"), String::new, started);
    }

    pub fn len(&self, entity: &str) -> usize {
        self.inner
            .partitions
            .get(entity)
            .map_or(0, |p| p.lock().len())
    }
}

fn join_keys<'a>(keys: impl Iterator<Item = &'a LocalKey>) -> String {
    keys.map(ToString::to_string).collect::<Vec<_>>().join(" ")
}
