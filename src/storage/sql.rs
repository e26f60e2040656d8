// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQL adapter over the sqlx `Any` driver.
//!
//! MySQL is the production target; SQLite is supported for tests and
//! embedded use. Every statement goes through [`DbPool`] or [`DbTransaction`],
//! which bind [`BindValue`] parameters, forward the statement to the
//! context's loggers, record latency and translate driver errors.
//!
//! ## Error translation
//!
//! | driver signal                         | result                          |
//! |---------------------------------------|---------------------------------|
//! | no rows                               | `Ok(None)` from `query_row`     |
//! | MySQL 1062 / SQLite UNIQUE            | [`OrmError::DuplicateKey`]      |
//! | MySQL 1451, 1452 / SQLite FOREIGN KEY | [`OrmError::ForeignKey`]        |
//! | anything else from the server         | `Io(Database { code })`         |
//!
//! SQLite failures are given the MySQL number of the equivalent error so the
//! async consumer's skippable-code table applies to both dialects.
//!
//! ## Sessions
//!
//! MySQL connections run in UTC with [`MYSQL_SQL_MODE`], so `UNIX_TIMESTAMP`
//! projections read back what was bound and zero dates are accepted. The
//! `Any` driver reports no row id for SQLite inserts; it is read with
//! `last_insert_rowid()` on the connection that ran the insert, or from the
//! row of a statement ending in [`RETURNING_ID`].

use std::sync::{Arc, Once};
use std::time::{Duration, Instant};

use sqlx::any::{AnyArguments, AnyPoolOptions, AnyRow};
use sqlx::AnyConnection;
use sqlx::error::{DatabaseError, ErrorKind};
use sqlx::query::Query;
use sqlx::{Any, AnyPool, Row, Transaction};
use tracing::{debug, info};

use crate::codec::BindValue;
use crate::context::logging::{LogSource, LoggerSet};
use crate::error::OrmError;
use crate::metrics::StatementTimer;
use crate::resilience::retry::{retry, RetryConfig};

static INSTALL_DRIVERS: Once = Once::new();

/// Session `sql_mode` for MySQL: strict, but without `NO_ZERO_DATE` and
/// `NO_ZERO_IN_DATE`, which reject the zero-date literal.
pub const MYSQL_SQL_MODE: &str =
    "STRICT_TRANS_TABLES,ERROR_FOR_DIVISION_BY_ZERO,NO_ENGINE_SUBSTITUTION";

fn mysql_session_statements() -> [String; 2] {
    [
        "SET time_zone = '+00:00'".to_string(),
        format!("SET SESSION sql_mode = '{MYSQL_SQL_MODE}'"),
    ]
}

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Dialect {
    MySql,
    Sqlite,
}

impl Dialect {
    pub fn from_url(url: &str) -> Result<Self, OrmError> {
        if url.starts_with("mysql:") || url.starts_with("mariadb:") {
            Ok(Dialect::MySql)
        } else if url.starts_with("sqlite:") {
            Ok(Dialect::Sqlite)
        } else {
            Err(OrmError::Config(format!("unsupported database url '{url}'")))
        }
    }
}

/// Outcome of a write statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExecResult {
    pub rows_affected: u64,
    pub last_insert_id: u64,
}

type AnyQuery<'q> = Query<'q, Any, AnyArguments<'q>>;

fn bind_all<'q>(mut query: AnyQuery<'q>, args: &[BindValue]) -> AnyQuery<'q> {
    for arg in args {
        query = match arg {
            BindValue::Null => query.bind(None::<i64>),
            BindValue::Int(v) => query.bind(*v),
            BindValue::UInt(v) => match i64::try_from(*v) {
                Ok(v) => query.bind(v),
                Err(_) => query.bind(v.to_string()),
            },
            BindValue::Float(v) => query.bind(*v),
            BindValue::Text(v) => query.bind(v.clone()),
            BindValue::Bytes(v) => query.bind(v.clone()),
        };
    }
    query
}

/// Suffix of SQLite upserts; the touched row's id comes back as a row.
pub const RETURNING_ID: &str = " RETURNING `ID`";

fn is_insert(sql: &str) -> bool {
    sql.trim_start()
        .get(..6)
        .is_some_and(|head| head.eq_ignore_ascii_case("INSERT"))
}

async fn exec_on(
    dialect: Dialect,
    conn: &mut AnyConnection,
    sql: &str,
    args: &[BindValue],
) -> Result<ExecResult, sqlx::Error> {
    if dialect == Dialect::Sqlite && sql.ends_with(RETURNING_ID) {
        let row = bind_all(sqlx::query(sql), args).fetch_optional(&mut *conn).await?;
        let id = match &row {
            Some(row) => row.try_get::<i64, _>(0)?,
            None => 0,
        };
        return Ok(ExecResult {
            rows_affected: u64::from(row.is_some()),
            last_insert_id: u64::try_from(id).unwrap_or(0),
        });
    }
    let done = bind_all(sqlx::query(sql), args).execute(&mut *conn).await?;
    let mut last_insert_id = done
        .last_insert_id()
        .and_then(|id| u64::try_from(id).ok())
        .unwrap_or(0);
    if dialect == Dialect::Sqlite
        && last_insert_id == 0
        && done.rows_affected() > 0
        && is_insert(sql)
    {
        let rowid: i64 = sqlx::query_scalar("SELECT last_insert_rowid()")
            .fetch_one(&mut *conn)
            .await?;
        last_insert_id = u64::try_from(rowid).unwrap_or(0);
    }
    Ok(ExecResult {
        rows_affected: done.rows_affected(),
        last_insert_id,
    })
}

fn preview(sql: &str, args: &[BindValue]) -> String {
    if args.is_empty() {
        return sql.to_string();
    }
    let params: Vec<String> = args.iter().map(ToString::to_string).collect();
    format!("{sql} [{}]", params.join(", "))
}

/// Text between the first pair of `open`/`close` after `marker`.
fn quoted_after(message: &str, marker: &str, quote: char) -> Option<String> {
    let rest = &message[message.find(marker)? + marker.len()..];
    let start = rest.find(quote)? + 1;
    let end = rest[start..].find(quote)? + start;
    Some(rest[start..end].to_string())
}

fn sqlite_code(err: &dyn DatabaseError) -> u16 {
    let message = err.message();
    match err.kind() {
        ErrorKind::UniqueViolation => 1062,
        ErrorKind::ForeignKeyViolation => 1452,
        ErrorKind::NotNullViolation => 1048,
        ErrorKind::CheckViolation => 3819,
        _ if message.contains("no such table") => 1146,
        _ if message.contains("no such column") || message.contains("has no column") => 1054,
        _ if message.contains("syntax error") => 1064,
        _ if message.contains("already exists") => 1050,
        _ => 1105,
    }
}

pub(crate) fn map_sqlx_error(dialect: Dialect, err: sqlx::Error) -> OrmError {
    match err {
        sqlx::Error::Database(db) => {
            let code = match dialect {
                Dialect::MySql => db
                    .try_downcast_ref::<sqlx::mysql::MySqlDatabaseError>()
                    .map(|e| e.number()),
                Dialect::Sqlite => Some(sqlite_code(db.as_ref())),
            };
            let message = db.message().to_string();
            match code {
                Some(1062) => {
                    let index = quoted_after(&message, "for key", '\'')
                        .or_else(|| message.split(": ").nth(1).map(str::to_string))
                        .unwrap_or_default();
                    let index = index.rsplit('.').next().unwrap_or_default().to_string();
                    OrmError::DuplicateKey { index, message }
                }
                Some(1451 | 1452) => {
                    let constraint = quoted_after(&message, "CONSTRAINT", '`').unwrap_or_default();
                    OrmError::ForeignKey { constraint, message }
                }
                code => OrmError::database(code, message),
            }
        }
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => OrmError::pool(err.to_string()),
        other => OrmError::database(None, other.to_string()),
    }
}

/// One database pool.
#[derive(Clone)]
pub struct DbPool {
    code: Arc<str>,
    dialect: Dialect,
    pool: AnyPool,
}

impl std::fmt::Debug for DbPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbPool")
            .field("code", &self.code)
            .field("dialect", &self.dialect)
            .finish()
    }
}

impl DbPool {
    pub async fn connect(code: &str, url: &str, max_connections: u32) -> Result<Self, OrmError> {
        install_drivers();
        let dialect = Dialect::from_url(url)?;

        let pool = retry("sql_connect", &RetryConfig::startup(), || async move {
            AnyPoolOptions::new()
                .max_connections(max_connections)
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .after_connect(move |conn, _meta| {
                    Box::pin(async move {
                        if dialect == Dialect::MySql {
                            for statement in mysql_session_statements() {
                                sqlx::query(&statement).execute(&mut *conn).await?;
                            }
                        }
                        Ok(())
                    })
                })
                .connect(url)
                .await
        })
        .await
        .map_err(|e| map_sqlx_error(dialect, e))?;

        let db = Self::from_pool(code, dialect, pool);
        if dialect == Dialect::Sqlite {
            db.enable_wal_mode().await?;
        }
        info!(pool = code, ?dialect, "database pool connected");
        Ok(db)
    }

    /// Wrap an existing pool, e.g. one a test suite prepared.
    pub fn from_pool(code: &str, dialect: Dialect, pool: AnyPool) -> Self {
        install_drivers();
        Self {
            code: Arc::from(code),
            dialect,
            pool,
        }
    }

    async fn enable_wal_mode(&self) -> Result<(), OrmError> {
        for pragma in ["PRAGMA journal_mode = WAL", "PRAGMA synchronous = NORMAL"] {
            sqlx::query(pragma)
                .execute(&self.pool)
                .await
                .map_err(|e| map_sqlx_error(self.dialect, e))?;
        }
        Ok(())
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    pub fn inner(&self) -> &AnyPool {
        &self.pool
    }

    fn finish<T>(
        &self,
        loggers: &LoggerSet,
        operation: &'static str,
        sql: &str,
        args: &[BindValue],
        started: Instant,
        mut timer: StatementTimer,
        result: Result<T, sqlx::Error>,
    ) -> Result<T, OrmError> {
        let result = result.map_err(|e| map_sqlx_error(self.dialect, e));
        if result.is_ok() {
            timer.succeed();
        }
        let error = result.as_ref().err().map(|e| e as &dyn std::fmt::Display);
        loggers.emit(LogSource::Db, &self.code, operation, || preview(sql, args), started, error);
        debug!(pool = %self.code, operation, elapsed = ?timer.elapsed(), "{sql}");
        result
    }

    pub async fn exec(
        &self,
        loggers: &LoggerSet,
        sql: &str,
        args: &[BindValue],
    ) -> Result<ExecResult, OrmError> {
        let (started, timer) = (Instant::now(), StatementTimer::new(&self.code, "exec"));
        let result = match self.pool.acquire().await {
            Ok(mut conn) => exec_on(self.dialect, &mut conn, sql, args).await,
            Err(e) => Err(e),
        };
        self.finish(loggers, "exec", sql, args, started, timer, result)
    }

    /// First row, or `None` when the statement matched nothing.
    pub async fn query_row(
        &self,
        loggers: &LoggerSet,
        sql: &str,
        args: &[BindValue],
    ) -> Result<Option<AnyRow>, OrmError> {
        let (started, timer) = (Instant::now(), StatementTimer::new(&self.code, "query_row"));
        let result = bind_all(sqlx::query(sql), args).fetch_optional(&self.pool).await;
        self.finish(loggers, "query_row", sql, args, started, timer, result)
    }

    pub async fn query(
        &self,
        loggers: &LoggerSet,
        sql: &str,
        args: &[BindValue],
    ) -> Result<Vec<AnyRow>, OrmError> {
        let (started, timer) = (Instant::now(), StatementTimer::new(&self.code, "query"));
        let result = bind_all(sqlx::query(sql), args).fetch_all(&self.pool).await;
        self.finish(loggers, "query", sql, args, started, timer, result)
    }

    /// Statement executed repeatedly with different arguments.
    ///
    /// sqlx keeps prepared statements per connection, so the handle only
    /// pins the SQL text.
    pub fn prepare(&self, sql: impl Into<String>) -> PreparedStatement {
        PreparedStatement {
            db: self.clone(),
            sql: sql.into(),
        }
    }

    pub async fn begin(&self, loggers: &LoggerSet) -> Result<DbTransaction, OrmError> {
        let (started, timer) = (Instant::now(), StatementTimer::new(&self.code, "begin"));
        let result = self.pool.begin().await;
        let tx = self.finish(loggers, "begin", "BEGIN", &[], started, timer, result)?;
        Ok(DbTransaction {
            db: self.clone(),
            tx: Some(tx),
        })
    }

    pub async fn ping(&self) -> Result<Duration, OrmError> {
        let started = Instant::now();
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error(self.dialect, e))?;
        Ok(started.elapsed())
    }
}

#[derive(Debug, Clone)]
pub struct PreparedStatement {
    db: DbPool,
    sql: String,
}

impl PreparedStatement {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub async fn query(
        &self,
        loggers: &LoggerSet,
        args: &[BindValue],
    ) -> Result<Vec<AnyRow>, OrmError> {
        self.db.query(loggers, &self.sql, args).await
    }

    pub async fn exec(
        &self,
        loggers: &LoggerSet,
        args: &[BindValue],
    ) -> Result<ExecResult, OrmError> {
        self.db.exec(loggers, &self.sql, args).await
    }
}

/// Open transaction holding one pooled connection.
///
/// Dropping it without [`commit`](Self::commit) rolls back.
pub struct DbTransaction {
    db: DbPool,
    tx: Option<Transaction<'static, Any>>,
}

impl DbTransaction {
    pub fn pool(&self) -> &DbPool {
        &self.db
    }

    fn conn(&mut self) -> Result<&mut Transaction<'static, Any>, OrmError> {
        self.tx
            .as_mut()
            .ok_or_else(|| OrmError::pool("transaction already finished"))
    }

    pub async fn exec(
        &mut self,
        loggers: &LoggerSet,
        sql: &str,
        args: &[BindValue],
    ) -> Result<ExecResult, OrmError> {
        let (started, timer) = (Instant::now(), StatementTimer::new(&self.db.code, "exec"));
        let dialect = self.db.dialect;
        let tx = self.conn()?;
        let result = exec_on(dialect, &mut **tx, sql, args).await;
        self.db.finish(loggers, "exec", sql, args, started, timer, result)
    }

    pub async fn query_row(
        &mut self,
        loggers: &LoggerSet,
        sql: &str,
        args: &[BindValue],
    ) -> Result<Option<AnyRow>, OrmError> {
        let (started, timer) = (Instant::now(), StatementTimer::new(&self.db.code, "query_row"));
        let tx = self.conn()?;
        let result = bind_all(sqlx::query(sql), args).fetch_optional(&mut **tx).await;
        self.db.finish(loggers, "query_row", sql, args, started, timer, result)
    }

    pub async fn query(
        &mut self,
        loggers: &LoggerSet,
        sql: &str,
        args: &[BindValue],
    ) -> Result<Vec<AnyRow>, OrmError> {
        let (started, timer) = (Instant::now(), StatementTimer::new(&self.db.code, "query"));
        let tx = self.conn()?;
        let result = bind_all(sqlx::query(sql), args).fetch_all(&mut **tx).await;
        self.db.finish(loggers, "query", sql, args, started, timer, result)
    }

    pub async fn commit(mut self, loggers: &LoggerSet) -> Result<(), OrmError> {
        let (started, timer) = (Instant::now(), StatementTimer::new(&self.db.code, "commit"));
        let tx = self
            .tx
            .take()
            .ok_or_else(|| OrmError::pool("transaction already finished"))?;
        let result = tx.commit().await;
        self.db.finish(loggers, "commit", "COMMIT", &[], started, timer, result)
    }

    pub async fn rollback(mut self, loggers: &LoggerSet) -> Result<(), OrmError> {
        let (started, timer) = (Instant::now(), StatementTimer::new(&self.db.code, "rollback"));
        let Some(tx) = self.tx.take() else {
            return Ok(());
        };
        let result = tx.rollback().await;
        self.db.finish(loggers, "rollback", "ROLLBACK", &[], started, timer, result)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Fresh SQLite database file under the system temp dir.
    pub(crate) async fn sqlite_pool(code: &str) -> DbPool {
        let path = std::env::temp_dir().join(format!("tiered_orm_{}.db", uuid::Uuid::new_v4()));
        let url = format!("sqlite://{}?mode=rwc", path.display());
        DbPool::connect(code, &url, 4).await.unwrap()
    }
}
