//! Minimal connection abstraction used by every pipeline stage, plus the
//! sqlx-backed Postgres implementation.
//!
//! Stages only ever need five things from a database: a liveness probe,
//! statement execution, single- and multi-row queries, and an explicit
//! close. Keeping it that small lets tests swap in an in-memory server.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{ConnectOptions, Connection as _};
use tokio::sync::Mutex;
use tracing::debug;

use crate::target::ConnectionTarget;
use crate::telemetry::SQL_LOG_TARGET;

pub type DbResult<T> = std::result::Result<T, sqlx::Error>;

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// A decoded column value. Only the types the pipeline reads are modelled.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

/// One result row, columns in select-list order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Row(pub Vec<Value>);

impl Row {
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.0.get(idx)
    }

    pub fn bool(&self, idx: usize) -> DbResult<bool> {
        match self.get(idx) {
            Some(Value::Bool(b)) => Ok(*b),
            other => Err(unexpected(idx, "bool", other)),
        }
    }

    pub fn text(&self, idx: usize) -> DbResult<String> {
        match self.get(idx) {
            Some(Value::Text(s)) => Ok(s.clone()),
            other => Err(unexpected(idx, "text", other)),
        }
    }

    pub fn timestamp(&self, idx: usize) -> DbResult<DateTime<Utc>> {
        match self.get(idx) {
            Some(Value::Timestamp(ts)) => Ok(*ts),
            other => Err(unexpected(idx, "timestamptz", other)),
        }
    }
}

fn unexpected(idx: usize, wanted: &str, got: Option<&Value>) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: idx.to_string(),
        source: format!("expected {wanted}, got {got:?}").into(),
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Connection: Send + Sync {
    /// Cheap round trip proving the server accepts queries.
    async fn probe(&self) -> DbResult<()>;

    /// Run a statement. With no params the text may hold several statements
    /// (simple-query protocol); with params it must be a single statement.
    async fn execute(&self, sql: &str, params: &[&str]) -> DbResult<u64>;

    async fn query_one(&self, sql: &str, params: &[&str]) -> DbResult<Option<Row>>;

    async fn query_many(&self, sql: &str, params: &[&str]) -> DbResult<Vec<Row>>;

    /// Release the underlying connection. Safe to call more than once.
    async fn close(&self);
}

/// Opens connections to a [`ConnectionTarget`].
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, target: &ConnectionTarget) -> DbResult<Box<dyn Connection>>;
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

/// Opens one plain sqlx connection per target. No pool: a failed connect
/// surfaces immediately with its real cause, so the only retrying is the
/// caller's [`RetryPolicy`](crate::waiter::RetryPolicy).
#[derive(Debug, Clone, Default)]
pub struct PgConnector;

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self, target: &ConnectionTarget) -> DbResult<Box<dyn Connection>> {
        let conn = target.connect_options().connect().await?;
        Ok(Box::new(PgConnection {
            conn: Mutex::new(Some(conn)),
        }))
    }
}

/// A single server session. Every statement of a run goes through the same
/// session, so session state (an open transaction) carries over between calls.
pub struct PgConnection {
    conn: Mutex<Option<sqlx::PgConnection>>,
}

#[async_trait]
impl Connection for PgConnection {
    async fn probe(&self) -> DbResult<()> {
        let mut guard = self.conn.lock().await;
        let conn = open_session(&mut guard)?;
        sqlx::query("SELECT 1").execute(&mut *conn).await?;
        Ok(())
    }

    async fn execute(&self, sql: &str, params: &[&str]) -> DbResult<u64> {
        log_sql(sql, params);
        let mut guard = self.conn.lock().await;
        let conn = open_session(&mut guard)?;
        let result = if params.is_empty() {
            sqlx::Executor::execute(&mut *conn, sqlx::raw_sql(sql)).await?
        } else {
            let mut query = sqlx::query(sql);
            for param in params {
                query = query.bind(param.to_string());
            }
            query.execute(&mut *conn).await?
        };
        Ok(result.rows_affected())
    }

    async fn query_one(&self, sql: &str, params: &[&str]) -> DbResult<Option<Row>> {
        log_sql(sql, params);
        let mut guard = self.conn.lock().await;
        let conn = open_session(&mut guard)?;
        let mut query = sqlx::query(sql);
        for param in params {
            query = query.bind(param.to_string());
        }
        let row = query.fetch_optional(&mut *conn).await?;
        row.as_ref().map(decode_row).transpose()
    }

    async fn query_many(&self, sql: &str, params: &[&str]) -> DbResult<Vec<Row>> {
        log_sql(sql, params);
        let mut guard = self.conn.lock().await;
        let conn = open_session(&mut guard)?;
        let mut query = sqlx::query(sql);
        for param in params {
            query = query.bind(param.to_string());
        }
        let rows = query.fetch_all(&mut *conn).await?;
        rows.iter().map(decode_row).collect()
    }

    async fn close(&self) {
        let conn = self.conn.lock().await.take();
        if let Some(conn) = conn {
            if let Err(e) = conn.close().await {
                debug!(error = %e, "Error closing database connection");
            }
        }
    }
}

fn open_session(slot: &mut Option<sqlx::PgConnection>) -> DbResult<&mut sqlx::PgConnection> {
    slot.as_mut().ok_or(sqlx::Error::PoolClosed)
}

fn log_sql(sql: &str, params: &[&str]) {
    debug!(target: SQL_LOG_TARGET, sql = sql.trim(), ?params, "executing");
}

fn decode_row(row: &PgRow) -> DbResult<Row> {
    use sqlx::{Column, Row as _, TypeInfo};

    let mut values = Vec::with_capacity(row.columns().len());
    for (i, column) in row.columns().iter().enumerate() {
        let value = match column.type_info().name() {
            "BOOL" => row.try_get::<Option<bool>, _>(i)?.map(Value::Bool),
            "INT2" => row.try_get::<Option<i16>, _>(i)?.map(|v| Value::Int(v.into())),
            "INT4" => row.try_get::<Option<i32>, _>(i)?.map(|v| Value::Int(v.into())),
            "INT8" => row.try_get::<Option<i64>, _>(i)?.map(Value::Int),
            "TIMESTAMPTZ" => row
                .try_get::<Option<DateTime<Utc>>, _>(i)?
                .map(Value::Timestamp),
            _ => row.try_get::<Option<String>, _>(i)?.map(Value::Text),
        };
        values.push(value.unwrap_or(Value::Null));
    }
    Ok(Row(values))
}
