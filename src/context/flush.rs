// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Change tracking and flush.
//!
//! Entities are tracked through shared [`Tracked`] handles. A flush walks
//! the tracked set in reference order (unsaved parents first), diffs every
//! entity against the image it was loaded with and turns the difference
//! into one statement:
//!
//! ```text
//! no id, no image        INSERT INTO t (...) VALUES (...)
//! upsert request         INSERT ... ON DUPLICATE KEY UPDATE / ON CONFLICT DO UPDATE
//! image, columns changed UPDATE t SET ... WHERE ID = ?
//! delete                 DELETE FROM t WHERE ID = ?  (or FakeDelete = 1)
//! ```
//!
//! Cache invalidation only starts once the SQL of the whole flush has
//! succeeded. [`Context::flush_async`] pushes the statements onto the
//! schema's async queue instead and invalidates right away; each queued
//! statement carries its eviction so the consumer invalidates again after
//! applying it.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use sqlx::any::AnyRow;
use tracing::{debug, instrument, warn};

use crate::codec::{decode_row, diff, BindValue, Diff, Row};
use crate::engine::{FlushCheck, FlushReport};
use crate::error::OrmError;
use crate::metrics;
use crate::schema::{Entity, EntitySchema, Reference, Tracked, TrackedRecord, Value};
use crate::storage::sql::{DbPool, DbTransaction, Dialect, ExecResult, RETURNING_ID};

use super::invalidate::{Change, Eviction};
use super::loader::cached_row;
use super::logging::LoggerSet;
use super::Context;

/// Anything [`Context::track`] accepts: an owned entity or a handle.
pub trait IntoTracked<E: Entity> {
    fn into_tracked(self) -> Tracked<E>;
}

impl<E: Entity> IntoTracked<E> for E {
    fn into_tracked(self) -> Tracked<E> {
        Tracked::new(self)
    }
}

impl<E: Entity> IntoTracked<E> for Tracked<E> {
    fn into_tracked(self) -> Tracked<E> {
        self
    }
}

impl<E: Entity> IntoTracked<E> for &Tracked<E> {
    fn into_tracked(self) -> Tracked<E> {
        self.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TrackOp {
    Save,
    Delete { force: bool },
    Upsert { columns: Vec<String> },
}

#[derive(Clone)]
pub(crate) struct TrackedEntry {
    pub record: Arc<dyn TrackedRecord>,
    pub op: TrackOp,
}

fn record_addr(record: &Arc<dyn TrackedRecord>) -> usize {
    Arc::as_ptr(record) as *const () as usize
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ActionKind {
    Insert,
    Upsert,
    Update,
    Delete,
}

impl ActionKind {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            ActionKind::Insert => "insert",
            ActionKind::Upsert => "upsert",
            ActionKind::Update => "update",
            ActionKind::Delete => "delete",
        }
    }
}

pub(crate) struct FlushAction {
    pub kind: ActionKind,
    pub schema: Arc<EntitySchema>,
    pub record: Arc<dyn TrackedRecord>,
    pub id: u64,
    /// New column values; the stored ones for a hard delete.
    pub values: Vec<Value>,
    pub diff: Diff,
    pub update_columns: Vec<String>,
    pub soft_delete: bool,
}

impl FlushAction {
    fn old_values(&self) -> Option<&[Value]> {
        self.diff.old.as_ref().map(|row| row.values.as_slice())
    }

    fn change(&self, async_mode: bool) -> Change<'_> {
        let hard_delete = self.kind == ActionKind::Delete;
        Change {
            schema: &self.schema,
            id: self.id,
            kind: self.kind,
            old: self.old_values(),
            new: if hard_delete { None } else { Some(self.values.as_slice()) },
            changed: &self.diff.changed,
            async_mode,
        }
    }

    fn statement(&self) -> Result<(String, Vec<BindValue>), OrmError> {
        let table = self.schema.table();
        match self.kind {
            ActionKind::Insert | ActionKind::Upsert => {
                let mut columns: Vec<String> = Vec::with_capacity(self.diff.new_bind.len() + 1);
                let mut args = Vec::with_capacity(columns.capacity());
                if self.id != 0 {
                    columns.push("`ID`".to_string());
                    args.push(BindValue::UInt(self.id));
                }
                for (column, value) in self.diff.new_bind.iter() {
                    columns.push(format!("`{column}`"));
                    args.push(value.clone());
                }
                let mut sql = format!(
                    "INSERT INTO `{table}` ({}) VALUES ({})",
                    columns.join(", "),
                    vec!["?"; columns.len()].join(", ")
                );
                if self.kind == ActionKind::Upsert {
                    sql.push_str(&upsert_clause(self.schema.dialect(), &self.update_columns));
                }
                Ok((sql, args))
            }
            ActionKind::Update => {
                let sets: Vec<String> =
                    self.diff.new_bind.columns().map(|c| format!("`{c}` = ?")).collect();
                let mut args: Vec<BindValue> = self.diff.new_bind.values().cloned().collect();
                args.push(BindValue::UInt(self.id));
                Ok((
                    format!("UPDATE `{table}` SET {} WHERE `ID` = ?", sets.join(", ")),
                    args,
                ))
            }
            ActionKind::Delete => Ok((
                format!("DELETE FROM `{table}` WHERE `ID` = ?"),
                vec![BindValue::UInt(self.id)],
            )),
        }
    }
}

fn upsert_clause(dialect: Dialect, columns: &[String]) -> String {
    match dialect {
        Dialect::MySql => {
            let mut sets = vec!["`ID` = LAST_INSERT_ID(`ID`)".to_string()];
            sets.extend(columns.iter().map(|c| format!("`{c}` = VALUES(`{c}`)")));
            format!(" ON DUPLICATE KEY UPDATE {}", sets.join(", "))
        }
        Dialect::Sqlite if columns.is_empty() => format!(" ON CONFLICT DO NOTHING{RETURNING_ID}"),
        Dialect::Sqlite => {
            let sets: Vec<String> =
                columns.iter().map(|c| format!("`{c}` = excluded.`{c}`")).collect();
            format!(" ON CONFLICT DO UPDATE SET {}{RETURNING_ID}", sets.join(", "))
        }
    }
}

/// Decoded async queue element.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct QueuedStatement {
    pub sql: String,
    pub args: Vec<BindValue>,
    /// Cache entries to drop once the statement is applied.
    pub eviction: Option<Eviction>,
}

/// Async queue element: `[sql, arg, ..., {"evict": {...}}]`.
///
/// NULL is the string `"NULL"`, blobs are `{"bytes": "<hex>"}`. The trailing
/// eviction object is optional.
pub(crate) fn encode_payload(
    sql: &str,
    args: &[BindValue],
    eviction: Option<&Eviction>,
) -> Result<String, OrmError> {
    let mut items = Vec::with_capacity(args.len() + 1);
    items.push(json!(sql));
    for arg in args {
        items.push(match arg {
            BindValue::Null => json!("NULL"),
            BindValue::Int(v) => json!(v),
            BindValue::UInt(v) => json!(v),
            BindValue::Float(v) => json!(v),
            BindValue::Text(v) => json!(v),
            BindValue::Bytes(v) => json!({ "bytes": hex::encode(v) }),
        });
    }
    if let Some(eviction) = eviction {
        items.push(json!({ "evict": serde_json::to_value(eviction)? }));
    }
    Ok(serde_json::to_string(&items)?)
}

pub(crate) fn decode_payload(payload: &str) -> Result<QueuedStatement, OrmError> {
    let malformed = || OrmError::InvalidArgument(format!("malformed async payload: {payload}"));
    let mut items: Vec<serde_json::Value> = serde_json::from_str(payload)?;
    let evict = match items.last() {
        Some(serde_json::Value::Object(map)) if map.contains_key("evict") => items.pop(),
        _ => None,
    };
    let eviction = evict
        .and_then(|mut item| item.get_mut("evict").map(serde_json::Value::take))
        .map(serde_json::from_value::<Eviction>)
        .transpose()?;
    let mut items = items.into_iter();
    let sql = match items.next() {
        Some(serde_json::Value::String(sql)) => sql,
        _ => return Err(malformed()),
    };
    let args = items
        .map(|item| match item {
            serde_json::Value::Null => Ok(BindValue::Null),
            serde_json::Value::String(s) if s == "NULL" => Ok(BindValue::Null),
            serde_json::Value::String(s) => Ok(BindValue::Text(s)),
            serde_json::Value::Bool(b) => Ok(BindValue::Int(i64::from(b))),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(BindValue::Int)
                .or_else(|| n.as_u64().map(BindValue::UInt))
                .or_else(|| n.as_f64().map(BindValue::Float))
                .ok_or_else(malformed),
            serde_json::Value::Object(map) => map
                .get("bytes")
                .and_then(serde_json::Value::as_str)
                .and_then(|h| hex::decode(h).ok())
                .map(BindValue::Bytes)
                .ok_or_else(malformed),
            serde_json::Value::Array(_) => Err(malformed()),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(QueuedStatement { sql, args, eviction })
}

/// Runs statements inside the flush transaction when there is one.
struct Executor {
    tx: Option<DbTransaction>,
}

impl Executor {
    async fn exec(
        &mut self,
        db: &DbPool,
        loggers: &LoggerSet,
        sql: &str,
        args: &[BindValue],
    ) -> Result<ExecResult, OrmError> {
        match self.tx.as_mut() {
            Some(tx) => tx.exec(loggers, sql, args).await,
            None => db.exec(loggers, sql, args).await,
        }
    }

    async fn query_row(
        &mut self,
        db: &DbPool,
        loggers: &LoggerSet,
        sql: &str,
        args: &[BindValue],
    ) -> Result<Option<AnyRow>, OrmError> {
        match self.tx.as_mut() {
            Some(tx) => tx.query_row(loggers, sql, args).await,
            None => db.query_row(loggers, sql, args).await,
        }
    }
}

fn visit(
    entry: TrackedEntry,
    known: &HashMap<usize, TrackOp>,
    done: &mut HashMap<usize, bool>,
    order: &mut Vec<TrackedEntry>,
    discovered: &mut Vec<Arc<dyn TrackedRecord>>,
) -> Result<(), OrmError> {
    let addr = record_addr(&entry.record);
    match done.get(&addr) {
        Some(true) => return Ok(()),
        Some(false) => {
            return Err(OrmError::SchemaInvariant {
                entity: entry.record.entity_name().to_string(),
                reason: "reference cycle between unsaved entities".to_string(),
            })
        }
        None => {}
    }
    done.insert(addr, false);
    for value in entry.record.values() {
        let Value::Ref(Reference::Pending(target)) = value else {
            continue;
        };
        if target.id() != 0 {
            continue;
        }
        let target_addr = record_addr(&target);
        let op = match known.get(&target_addr) {
            Some(op) => op.clone(),
            None => {
                if !done.contains_key(&target_addr) {
                    discovered.push(target.clone());
                }
                TrackOp::Save
            }
        };
        visit(TrackedEntry { record: target, op }, known, done, order, discovered)?;
    }
    done.insert(addr, true);
    order.push(entry);
    Ok(())
}

impl Context {
    /// Track an entity for the next flush. Tracking the same handle twice
    /// is a no-op.
    pub fn track<E: Entity>(
        &mut self,
        entity: impl IntoTracked<E>,
    ) -> Result<Tracked<E>, OrmError> {
        self.tracked_with(entity, TrackOp::Save)
    }

    /// Soft-delete when the schema has a `FakeDelete` column, else delete.
    pub fn delete<E: Entity>(
        &mut self,
        entity: impl IntoTracked<E>,
    ) -> Result<Tracked<E>, OrmError> {
        self.tracked_with(entity, TrackOp::Delete { force: false })
    }

    /// Delete the row even when the schema supports soft deletes.
    pub fn force_delete<E: Entity>(
        &mut self,
        entity: impl IntoTracked<E>,
    ) -> Result<Tracked<E>, OrmError> {
        self.tracked_with(entity, TrackOp::Delete { force: true })
    }

    /// Insert, or update `columns` of the row a unique index collides with.
    /// The entity ends up carrying the stored row either way.
    pub fn insert_on_duplicate_update<E: Entity>(
        &mut self,
        entity: impl IntoTracked<E>,
        columns: &[&str],
    ) -> Result<Tracked<E>, OrmError> {
        let schema = self.engine.schema_of::<E>()?;
        for column in columns {
            schema.field(column)?;
        }
        let columns = columns.iter().map(|c| c.to_string()).collect();
        self.tracked_with(entity, TrackOp::Upsert { columns })
    }

    pub fn tracked_len(&self) -> usize {
        self.tracked.len()
    }

    /// Forget every tracked entity without writing anything.
    pub fn clear_flush(&mut self) {
        self.tracked.clear();
        self.slots.clear();
    }

    fn tracked_with<E: Entity>(
        &mut self,
        entity: impl IntoTracked<E>,
        op: TrackOp,
    ) -> Result<Tracked<E>, OrmError> {
        self.engine.schema_of::<E>()?;
        let tracked = entity.into_tracked();
        self.enqueue(tracked.record(), op)?;
        Ok(tracked)
    }

    fn enqueue(&mut self, record: Arc<dyn TrackedRecord>, op: TrackOp) -> Result<(), OrmError> {
        let addr = record_addr(&record);
        if let Some(slot) = self.slots.get(&addr) {
            if op != TrackOp::Save {
                self.tracked[*slot].op = op;
            }
            return Ok(());
        }
        let limit = self.engine.config().tracked_limit;
        if self.tracked.len() >= limit {
            return Err(OrmError::TrackLimitExceeded { limit });
        }
        self.slots.insert(addr, self.tracked.len());
        self.tracked.push(TrackedEntry { record, op });
        Ok(())
    }

    /// Tracked entries with unsaved parents ahead of their children.
    /// Unsaved parents that were never tracked are tracked now.
    fn ordered_entries(&mut self) -> Result<Vec<TrackedEntry>, OrmError> {
        let known: HashMap<usize, TrackOp> = self
            .tracked
            .iter()
            .map(|e| (record_addr(&e.record), e.op.clone()))
            .collect();
        let mut done = HashMap::new();
        let mut order = Vec::with_capacity(self.tracked.len());
        let mut discovered = Vec::new();
        for entry in self.tracked.clone() {
            visit(entry, &known, &mut done, &mut order, &mut discovered)?;
        }
        for record in discovered {
            self.enqueue(record, TrackOp::Save)?;
        }
        Ok(order)
    }

    /// Decide what a tracked entry turns into; `None` when nothing changed.
    async fn plan(&self, entry: &TrackedEntry) -> Result<Option<FlushAction>, OrmError> {
        let record = entry.record.clone();
        let schema = self.engine.schema(record.entity_name())?.clone();
        let id = record.id();
        let mut image = record.image();
        if id != 0 && image.is_none() {
            // Created with a known id: diff against what is stored.
            image = self
                .load_rows(&schema, &[id])
                .await?
                .pop()
                .flatten()
                .map(|row| row.image.clone());
        }
        let mut values = schema.normalize_values(record.values())?;

        let action = |kind, values, changes, update_columns, soft_delete| FlushAction {
            kind,
            schema: schema.clone(),
            record: record.clone(),
            id,
            values,
            diff: changes,
            update_columns,
            soft_delete,
        };

        match &entry.op {
            TrackOp::Delete { force } => {
                let Some(image) = image.filter(|_| id != 0) else {
                    return Ok(None);
                };
                match schema.fake_delete_position().filter(|_| !force) {
                    Some(position) => {
                        values[position] = Value::Bool(true);
                        let changes = diff(&schema, Some(&*image), &values)?;
                        if changes.is_empty() {
                            return Ok(None);
                        }
                        Ok(Some(action(ActionKind::Update, values, changes, Vec::new(), true)))
                    }
                    None => {
                        let stored = decode_row(&schema, &image)?.values;
                        let changes = diff(&schema, Some(&*image), &stored)?;
                        Ok(Some(action(ActionKind::Delete, stored, changes, Vec::new(), false)))
                    }
                }
            }
            TrackOp::Upsert { columns } if id == 0 => {
                let changes = diff(&schema, None, &values)?;
                Ok(Some(action(ActionKind::Upsert, values, changes, columns.clone(), false)))
            }
            TrackOp::Save | TrackOp::Upsert { .. } => {
                let changes = diff(&schema, image.as_deref(), &values)?;
                if image.is_none() {
                    Ok(Some(action(ActionKind::Insert, values, changes, Vec::new(), false)))
                } else if changes.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(action(ActionKind::Update, values, changes, Vec::new(), false)))
                }
            }
        }
    }

    /// Apply tracked changes to the database, then invalidate the caches.
    ///
    /// Several statements against one pool run in a single transaction.
    /// On failure the tracked set is kept.
    #[instrument(skip(self), fields(tracked = self.tracked.len()))]
    pub async fn flush(&mut self) -> Result<FlushReport, OrmError> {
        let started = Instant::now();
        let entries = self.ordered_entries()?;
        let mut report = FlushReport::default();
        if entries.is_empty() {
            return Ok(report);
        }
        self.check_cancelled()?;

        let mut pools = BTreeSet::new();
        for entry in &entries {
            pools.insert(self.engine.schema(entry.record.entity_name())?.db_pool().to_string());
        }
        let loggers = self.db_loggers().clone();
        let mut executor = Executor { tx: None };
        if entries.len() > 1 && pools.len() == 1 {
            if let Some(pool) = pools.iter().next() {
                executor.tx = Some(self.engine.db(pool)?.begin(&loggers).await?);
            }
        }
        let transactional = executor.tx.is_some();

        let mut applied = Vec::with_capacity(entries.len());
        let outcome = self
            .run_actions(&entries, &mut executor, &loggers, &mut applied, &mut report)
            .await;
        let outcome = match (outcome, executor.tx.take()) {
            (Ok(()), Some(tx)) => tx.commit(&loggers).await,
            (Err(e), Some(tx)) => {
                if let Err(rollback) = tx.rollback(&loggers).await {
                    warn!(error = %rollback, "rollback after failed flush failed");
                }
                Err(e)
            }
            (outcome, None) => outcome,
        };
        if outcome.is_err() && transactional {
            for action in &applied {
                if matches!(action.kind, ActionKind::Insert | ActionKind::Upsert) {
                    action.record.set_id(0);
                }
            }
            applied.clear();
        }

        for action in &applied {
            let new_row = if action.kind == ActionKind::Delete {
                action.record.forget_image();
                None
            } else {
                let stored = Row::new(action.id, action.values.clone());
                let (row, _) = cached_row(&action.schema, stored)?;
                action.record.reload(action.id, action.values.clone(), row.image.clone())?;
                Some(row)
            };
            self.invalidate(action.change(false), new_row)?;
        }
        report.invalidation_failures = self.exec_pipelines().await;
        metrics::record_flush_duration(started.elapsed());

        outcome?;
        self.clear_flush();
        debug!(
            inserted = report.inserted,
            updated = report.updated,
            deleted = report.deleted,
            skipped = report.skipped,
            "flush complete"
        );
        Ok(report)
    }

    async fn run_actions(
        &self,
        entries: &[TrackedEntry],
        executor: &mut Executor,
        loggers: &LoggerSet,
        applied: &mut Vec<FlushAction>,
        report: &mut FlushReport,
    ) -> Result<(), OrmError> {
        for entry in entries {
            self.check_cancelled()?;
            let Some(mut action) = self.plan(entry).await? else {
                report.skipped += 1;
                continue;
            };
            let db = self.engine.db(action.schema.db_pool())?;
            let (sql, args) = action.statement()?;
            match action.kind {
                ActionKind::Insert => {
                    let result = executor.exec(db, loggers, &sql, &args).await?;
                    if action.id == 0 {
                        action.id = result.last_insert_id;
                    }
                    if action.id == 0 {
                        return Err(OrmError::database(
                            None,
                            format!("{} insert returned no id", action.schema.name()),
                        ));
                    }
                    action.record.set_id(action.id);
                    report.inserted += 1;
                }
                ActionKind::Upsert => {
                    let prior = self.find_conflict(executor, db, loggers, &action).await?;
                    let result = executor.exec(db, loggers, &sql, &args).await?;
                    // 0 only when a DO NOTHING upsert hit a conflict.
                    let id = match &prior {
                        _ if result.last_insert_id != 0 => result.last_insert_id,
                        Some(row) => row.id,
                        None => 0,
                    };
                    let select = action.schema.select_by_id_sql();
                    let stored = executor
                        .query_row(db, loggers, &select, &[BindValue::UInt(id)])
                        .await?
                        .ok_or_else(|| {
                            let entity = action.schema.name();
                            OrmError::database(None, format!("{entity} upsert left no row {id}"))
                        })?;
                    let stored = action.schema.scan_row(&stored)?;
                    action.id = stored.id;
                    action.values = stored.values;
                    if prior.is_some() {
                        report.updated += 1;
                    } else {
                        report.inserted += 1;
                    }
                    action.diff.old = prior;
                    action.record.set_id(action.id);
                }
                ActionKind::Update => {
                    executor.exec(db, loggers, &sql, &args).await?;
                    if action.soft_delete {
                        report.deleted += 1;
                    } else {
                        report.updated += 1;
                    }
                }
                ActionKind::Delete => {
                    executor.exec(db, loggers, &sql, &args).await?;
                    report.deleted += 1;
                }
            }
            metrics::record_flush_action(action.schema.name(), action.kind.as_str(), "sync");
            applied.push(action);
        }
        Ok(())
    }

    /// Row an upsert is about to collide with, looked up by every unique
    /// index whose columns are all set.
    async fn find_conflict(
        &self,
        executor: &mut Executor,
        db: &DbPool,
        loggers: &LoggerSet,
        action: &FlushAction,
    ) -> Result<Option<Row>, OrmError> {
        let schema = &action.schema;
        for index in schema.unique_indexes() {
            let binds = schema.bind_positions(&index.positions, &action.values)?;
            if binds.iter().any(BindValue::is_null) {
                continue;
            }
            let sql = format!(
                "SELECT {} FROM `{}` WHERE {} LIMIT 1",
                schema.fields_query(),
                schema.table(),
                index.where_clause
            );
            if let Some(row) = executor.query_row(db, loggers, &sql, &binds).await? {
                return Ok(Some(schema.scan_row(&row)?));
            }
        }
        Ok(None)
    }

    /// Like [`flush`](Self::flush), but duplicate-key and foreign-key
    /// rejections come back as values. The tracked set is kept for them.
    pub async fn flush_with_check(&mut self) -> Result<FlushCheck, OrmError> {
        match self.flush().await {
            Ok(report) => Ok(FlushCheck::Done(report)),
            Err(OrmError::DuplicateKey { index, message }) => {
                Ok(FlushCheck::DuplicateKey { index, message })
            }
            Err(OrmError::ForeignKey {
                constraint,
                message,
            }) => Ok(FlushCheck::ForeignKey {
                constraint,
                message,
            }),
            Err(e) => Err(e),
        }
    }

    /// Queue the tracked changes for the async consumer.
    ///
    /// Caches are invalidated immediately; until the consumer runs, reads
    /// that miss may still see the old database state. The consumer drops
    /// what they cached once it has applied the statement.
    #[instrument(skip(self), fields(tracked = self.tracked.len()))]
    pub async fn flush_async(&mut self) -> Result<FlushReport, OrmError> {
        let entries = self.ordered_entries()?;
        let mut report = FlushReport::default();
        if entries.is_empty() {
            return Ok(report);
        }
        let queue_cache = self.default_redis()?;

        let mut actions = Vec::with_capacity(entries.len());
        let mut pipeline = queue_cache.pipeline();
        let loggers = self.db_loggers().clone();
        for entry in &entries {
            let Some(mut action) = self.plan(entry).await? else {
                report.skipped += 1;
                continue;
            };
            let (sql, args) = action.statement()?;
            if action.kind == ActionKind::Upsert {
                // Both sides of the row it will collide with go stale.
                let db = self.engine.db(action.schema.db_pool())?;
                let mut executor = Executor { tx: None };
                action.diff.old = self.find_conflict(&mut executor, db, &loggers, &action).await?;
            }
            let mut eviction = Eviction::from_change(&action.change(true))?;
            let upsert = action.kind == ActionKind::Upsert;
            if let Some(prior) = action.diff.old.as_ref().filter(|_| upsert) {
                eviction.id = prior.id;
            }
            let payload = encode_payload(&sql, &args, Some(&eviction))?;
            pipeline.rpush(action.schema.async_queue(), &[payload]);
            actions.push(action);
        }
        self.check_cancelled()?;
        pipeline.exec().await?;

        for action in &actions {
            match action.kind {
                ActionKind::Insert | ActionKind::Upsert => {}
                ActionKind::Delete => action.record.forget_image(),
                ActionKind::Update => {
                    let stored = Row::new(action.id, action.values.clone());
                    let (row, _) = cached_row(&action.schema, stored)?;
                    action.record.reload(action.id, action.values.clone(), row.image.clone())?;
                }
            }
            metrics::record_flush_action(action.schema.name(), action.kind.as_str(), "async");
            self.invalidate(action.change(true), None)?;
        }
        report.queued = actions.len();
        report.invalidation_failures = self.exec_pipelines().await;
        self.clear_flush();
        debug!(queued = report.queued, skipped = report.skipped, "async flush queued");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_support::{engine, Account, Post, User};
    use crate::schema::Ref;
    use crate::storage::local::{LocalKey, LocalValue};

    #[test]
    fn test_payload_roundtrip() {
        let args = vec![
            BindValue::Null,
            BindValue::Int(-3),
            BindValue::UInt(u64::MAX),
            BindValue::Float(1.5),
            BindValue::Text("Tom".into()),
            BindValue::Bytes(vec![0, 255]),
        ];
        let sql = "INSERT INTO `User` (`Name`) VALUES (?)";
        let payload = encode_payload(sql, &args, None).unwrap();
        assert!(payload.starts_with(r#"["INSERT INTO `User`"#));
        assert!(payload.contains(r#""NULL""#));
        assert!(payload.contains(r#"{"bytes":"00ff"}"#));
        let decoded = decode_payload(&payload).unwrap();
        assert_eq!(decoded.sql, "INSERT INTO `User` (`Name`) VALUES (?)");
        assert_eq!(decoded.args, args);
        assert_eq!(decoded.eviction, None);
    }

    #[test]
    fn test_payload_carries_eviction() {
        let eviction = Eviction {
            entity: "User".into(),
            id: 7,
            indexes: vec![("ByAge".into(), 11)],
            unique_set: vec![("Name".into(), 42)],
            ..Eviction::default()
        };
        let args = vec![BindValue::UInt(31), BindValue::UInt(7)];
        let sql = "UPDATE `User` SET `Age` = ? WHERE `ID` = ?";
        let payload = encode_payload(sql, &args, Some(&eviction)).unwrap();
        assert!(payload.starts_with(r#"["UPDATE `User`"#));
        let evict = concat!(
            r#"{"evict":{"entity":"User","id":7,"indexes":[["ByAge",11]],"#,
            r#""unique_set":[["Name",42]]}}]"#
        );
        assert!(payload.ends_with(evict));

        let decoded = decode_payload(&payload).unwrap();
        assert_eq!(decoded.args, args);
        assert_eq!(decoded.eviction, Some(eviction));
        assert!(decode_payload(r#"["DELETE FROM t", {"evict": 3}]"#).is_err());
    }

    #[test]
    fn test_malformed_payload() {
        assert!(decode_payload("[]").is_err());
        assert!(decode_payload("[1, 2]").is_err());
        assert!(decode_payload("not json").is_err());
    }

    #[test]
    fn test_upsert_clause_per_dialect() {
        let columns = vec!["Age".to_string()];
        assert_eq!(
            upsert_clause(Dialect::MySql, &columns),
            " ON DUPLICATE KEY UPDATE `ID` = LAST_INSERT_ID(`ID`), `Age` = VALUES(`Age`)"
        );
        assert_eq!(
            upsert_clause(Dialect::Sqlite, &columns),
            " ON CONFLICT DO UPDATE SET `Age` = excluded.`Age` RETURNING `ID`"
        );
        assert_eq!(upsert_clause(Dialect::Sqlite, &[]), " ON CONFLICT DO NOTHING RETURNING `ID`");
    }

    #[tokio::test]
    async fn test_insert_assigns_id_and_image() {
        let engine = engine().await;
        let mut ctx = engine.new_context();
        let tom = ctx.track(User::new("Tom", 30)).unwrap();
        let report = ctx.flush().await.unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(tom.id(), 1);
        assert!(tom.read().meta.is_loaded());
        assert_eq!(ctx.tracked_len(), 0);

        // Unchanged re-track is skipped.
        ctx.track(&tom).unwrap();
        let report = ctx.flush().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.written(), 0);
    }

    #[tokio::test]
    async fn test_tracking_is_idempotent_and_capped() {
        let engine = engine().await;
        let mut ctx = engine.new_context();
        let tom = ctx.track(User::new("Tom", 30)).unwrap();
        ctx.track(&tom).unwrap();
        assert_eq!(ctx.tracked_len(), 1);

        let limit = engine.config().tracked_limit;
        for i in 1..limit {
            ctx.track(User::new(&format!("u{i}"), 1)).unwrap();
        }
        assert!(matches!(
            ctx.track(User::new("over", 1)),
            Err(OrmError::TrackLimitExceeded { .. })
        ));
        ctx.clear_flush();
        assert_eq!(ctx.tracked_len(), 0);
    }

    #[tokio::test]
    async fn test_parent_inserted_before_child() {
        let engine = engine().await;
        let mut ctx = engine.new_context();
        let author = Tracked::new(User::new("Ann", 40));
        let post = ctx
            .track(Post::new("hello", Ref::from(&author)))
            .unwrap();
        // The author was never tracked explicitly.
        let report = ctx.flush().await.unwrap();
        assert_eq!(report.inserted, 2);
        assert_ne!(author.id(), 0);
        assert_eq!(post.read().author.as_ref().map(Ref::id), Some(author.id()));

        let loaded: Post = ctx.get_by_id(post.id()).await.unwrap().unwrap();
        assert_eq!(loaded.author.map(|a| a.id()), Some(author.id()));
    }

    #[tokio::test]
    async fn test_update_then_delete_refreshes_local_row() {
        let engine = engine().await;
        let mut ctx = engine.new_context();
        let tom = ctx.track(User::new("Tom", 30)).unwrap();
        ctx.flush().await.unwrap();

        tom.write().age = 31;
        ctx.track(&tom).unwrap();
        assert_eq!(ctx.flush().await.unwrap().updated, 1);
        let local = engine.local("default").unwrap();
        match local.get("User", &LocalKey::Row(tom.id())) {
            Some(LocalValue::Row(row)) => assert_eq!(row.row.values[1], Value::UInt(31)),
            other => panic!("expected cached row, got {other:?}"),
        }

        ctx.delete(&tom).unwrap();
        assert_eq!(ctx.flush().await.unwrap().deleted, 1);
        assert_eq!(local.get("User", &LocalKey::Row(tom.id())), Some(LocalValue::Absent));
        assert!(ctx.get_by_id::<User>(tom.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_soft_delete_keeps_row_readable() {
        let engine = engine().await;
        let mut ctx = engine.new_context();
        let account = ctx.track(Account::new("acme", 1.0)).unwrap();
        ctx.flush().await.unwrap();

        ctx.delete(&account).unwrap();
        assert_eq!(ctx.flush().await.unwrap().deleted, 1);
        let loaded: Account = ctx.get_by_id(account.id()).await.unwrap().unwrap();
        assert!(loaded.fake_delete);

        ctx.force_delete(&account).unwrap();
        ctx.flush().await.unwrap();
        assert!(ctx.get_by_id::<Account>(account.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_rolls_back_and_keeps_tracked() {
        let engine = engine().await;
        let mut ctx = engine.new_context();
        ctx.track(User::new("Tom", 30)).unwrap();
        ctx.flush().await.unwrap();

        let ann = ctx.track(User::new("Ann", 1)).unwrap();
        ctx.track(User::new("Tom", 2)).unwrap();
        match ctx.flush_with_check().await.unwrap() {
            FlushCheck::DuplicateKey { index, .. } => assert_eq!(index, "Name"),
            other => panic!("expected duplicate key, got {other:?}"),
        }
        assert_eq!(ann.id(), 0);
        assert_eq!(ctx.tracked_len(), 2);
        let ann: Option<User> = ctx
            .get_by_unique_index("Name", &[Value::from("Ann")])
            .await
            .unwrap();
        assert!(ann.is_none());
    }

    #[tokio::test]
    async fn test_missing_parent_reports_foreign_key() {
        let engine = engine().await;
        let mut ctx = engine.new_context();
        let orphan = ctx.track(Post::new("orphan", Ref::Id(999))).unwrap();
        match ctx.flush_with_check().await.unwrap() {
            FlushCheck::ForeignKey { message, .. } => {
                assert!(message.contains("FOREIGN KEY"), "{message}")
            }
            other => panic!("expected foreign key, got {other:?}"),
        }
        assert_eq!(orphan.id(), 0);
        assert_eq!(ctx.tracked_len(), 1);
    }

    #[tokio::test]
    async fn test_insert_on_duplicate_update() {
        let engine = engine().await;
        let mut ctx = engine.new_context();
        let first = ctx.track(User::new("Tom", 30)).unwrap();
        ctx.flush().await.unwrap();

        let again = ctx.insert_on_duplicate_update(User::new("Tom", 45), &["Age"]).unwrap();
        ctx.flush().await.unwrap();
        assert_eq!(again.id(), first.id());
        assert_eq!(again.read().age, 45);

        let loaded: User = ctx.get_by_id(first.id()).await.unwrap().unwrap();
        assert_eq!(loaded.age, 45);
        assert!(ctx.insert_on_duplicate_update(User::new("x", 1), &["Nope"]).is_err());
    }

    #[tokio::test]
    async fn test_async_flush_queues_payload() {
        let engine = engine().await;
        let mut ctx = engine.new_context();
        ctx.track(User::new("Queued", 3)).unwrap();
        let report = ctx.flush_async().await.unwrap();
        assert_eq!(report.queued, 1);

        let schema = engine.schema_of::<User>().unwrap();
        let redis = ctx.default_redis().unwrap();
        let queued = redis.lrange_strings(schema.async_queue(), 0, -1).await.unwrap();
        assert_eq!(queued.len(), 1);
        let decoded = decode_payload(&queued[0]).unwrap();
        assert!(decoded.sql.starts_with("INSERT INTO `User`"));
        assert_eq!(decoded.args[0], BindValue::Text("Queued".into()));
        let eviction = decoded.eviction.unwrap();
        assert_eq!((eviction.entity.as_str(), eviction.id), ("User", 0));
        assert_eq!(eviction.unique_set.len(), 1);
    }

    #[tokio::test]
    async fn test_async_insert_with_unsaved_parent_is_rejected() {
        let engine = engine().await;
        let mut ctx = engine.new_context();
        let author = Tracked::new(User::new("Ann", 40));
        ctx.track(Post::new("hello", Ref::from(&author))).unwrap();
        let err = ctx.flush_async().await.unwrap_err();
        assert!(matches!(err, OrmError::InvalidArgument(_)));
    }
}
