//! Database access: a narrow trait the planner executes through, plus the
//! PostgreSQL implementation (bb8-pooled tokio-postgres, one SERIALIZABLE
//! READ ONLY transaction per request).
//!
//! Result cells come back pre-typed as JSON values; the generated SQL only
//! ever projects the types converted here.

use std::fmt;

use async_trait::async_trait;
use bb8_postgres::PostgresConnectionManager;
use serde_json::{Number, Value};
use tokio_postgres::types::{ToSql, Type};
use tokio_postgres::NoTls;

use crate::sql::SqlParam;

// ---------- errors ----------

#[derive(Debug)]
pub enum DbError {
    Connect(String),
    Query(String),
    Decode(String),
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbError::Connect(msg) => write!(f, "Connection error: {msg}"),
            DbError::Query(msg) => write!(f, "Query error: {msg}"),
            DbError::Decode(msg) => write!(f, "Row decode error: {msg}"),
        }
    }
}

impl std::error::Error for DbError {}

// ---------- the planner-facing handle ----------

/// Parameterized execution returning rows as arrays of pre-typed values.
/// A planner instance is bound to exactly one request and one transaction.
#[async_trait]
pub trait Database: Send + Sync {
    async fn query(&self, sql: &str, params: &[SqlParam]) -> Result<Vec<Vec<Value>>, DbError>;
}

// ---------- postgres implementation ----------

pub type PgPool = bb8::Pool<PostgresConnectionManager<NoTls>>;

/// Build the connection pool. The pool (not the planner) is the only
/// mutable shared resource; acquisition is serialized inside bb8 and release
/// happens on drop of the pooled connection, on every exit path.
pub async fn connect_pool(database_url: &str, max_size: u32) -> Result<PgPool, DbError> {
    let manager = PostgresConnectionManager::new_from_stringlike(database_url, NoTls)
        .map_err(|e| DbError::Connect(e.to_string()))?;
    bb8::Pool::builder()
        .max_size(max_size)
        .build(manager)
        .await
        .map_err(|e| DbError::Connect(e.to_string()))
}

/// `SELECT 1` through the pool, for readiness probes.
pub async fn health_check(pool: &PgPool) -> Result<(), DbError> {
    let conn = pool.get().await.map_err(|e| DbError::Connect(e.to_string()))?;
    conn.simple_query("SELECT 1").await.map_err(|e| DbError::Query(e.to_string()))?;
    Ok(())
}

/// A [`Database`] bound to one open read-only transaction.
pub struct TxDatabase<'a> {
    tx: &'a tokio_postgres::Transaction<'a>,
}

impl<'a> TxDatabase<'a> {
    pub fn new(tx: &'a tokio_postgres::Transaction<'a>) -> TxDatabase<'a> {
        TxDatabase { tx }
    }
}

#[async_trait]
impl Database for TxDatabase<'_> {
    async fn query(&self, sql: &str, params: &[SqlParam]) -> Result<Vec<Vec<Value>>, DbError> {
        let refs: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|p| match p {
                SqlParam::Text(s) => s as &(dyn ToSql + Sync),
                SqlParam::Int(i) => i as &(dyn ToSql + Sync),
            })
            .collect();

        let start = std::time::Instant::now();
        let rows =
            self.tx.query(sql, &refs).await.map_err(|e| DbError::Query(e.to_string()))?;
        tracing::debug!(rows = rows.len(), elapsed = ?start.elapsed(), sql = %sql, "Executed statement");

        rows.iter()
            .map(|row| {
                (0..row.len())
                    .map(|i| cell_to_json(row, i))
                    .collect::<Result<Vec<Value>, DbError>>()
            })
            .collect()
    }
}

/// Convert one result cell to a JSON value based on its declared type.
/// The planner's SQL only projects text, booleans, numbers, json and
/// arrays of those; anything else is a decode error.
fn cell_to_json(row: &tokio_postgres::Row, idx: usize) -> Result<Value, DbError> {
    let col_type = row.columns()[idx].type_().clone();
    let decode = |e: tokio_postgres::Error| DbError::Decode(e.to_string());

    let value = match col_type {
        t if t == Type::BOOL => {
            row.try_get::<_, Option<bool>>(idx).map_err(decode)?.map(Value::Bool)
        }
        t if t == Type::INT2 => {
            row.try_get::<_, Option<i16>>(idx).map_err(decode)?.map(|v| Value::from(v as i64))
        }
        t if t == Type::INT4 => {
            row.try_get::<_, Option<i32>>(idx).map_err(decode)?.map(|v| Value::from(v as i64))
        }
        t if t == Type::INT8 => {
            row.try_get::<_, Option<i64>>(idx).map_err(decode)?.map(Value::from)
        }
        t if t == Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(idx)
            .map_err(decode)?
            .map(|v| float_to_json(v as f64)),
        t if t == Type::FLOAT8 => {
            row.try_get::<_, Option<f64>>(idx).map_err(decode)?.map(float_to_json)
        }
        t if t == Type::TEXT
            || t == Type::VARCHAR
            || t == Type::BPCHAR
            || t == Type::NAME
            || t == Type::UNKNOWN =>
        {
            row.try_get::<_, Option<String>>(idx).map_err(decode)?.map(Value::String)
        }
        t if t == Type::JSON || t == Type::JSONB => {
            row.try_get::<_, Option<Value>>(idx).map_err(decode)?
        }
        t if t == Type::TEXT_ARRAY || t == Type::VARCHAR_ARRAY => row
            .try_get::<_, Option<Vec<String>>>(idx)
            .map_err(decode)?
            .map(|v| Value::Array(v.into_iter().map(Value::String).collect())),
        t if t == Type::INT4_ARRAY => row
            .try_get::<_, Option<Vec<i32>>>(idx)
            .map_err(decode)?
            .map(|v| Value::Array(v.into_iter().map(|n| Value::from(n as i64)).collect())),
        t if t == Type::INT8_ARRAY => row
            .try_get::<_, Option<Vec<i64>>>(idx)
            .map_err(decode)?
            .map(|v| Value::Array(v.into_iter().map(Value::from).collect())),
        t if t == Type::FLOAT8_ARRAY => row
            .try_get::<_, Option<Vec<f64>>>(idx)
            .map_err(decode)?
            .map(|v| Value::Array(v.into_iter().map(float_to_json).collect())),
        t if t == Type::BOOL_ARRAY => row
            .try_get::<_, Option<Vec<bool>>>(idx)
            .map_err(decode)?
            .map(|v| Value::Array(v.into_iter().map(Value::Bool).collect())),
        t if t == Type::JSON_ARRAY || t == Type::JSONB_ARRAY => row
            .try_get::<_, Option<Vec<Value>>>(idx)
            .map_err(decode)?
            .map(Value::Array),
        other => {
            return Err(DbError::Decode(format!(
                "unsupported column type {other} at index {idx}"
            )))
        }
    };
    Ok(value.unwrap_or(Value::Null))
}

fn float_to_json(v: f64) -> Value {
    Number::from_f64(v).map(Value::Number).unwrap_or(Value::Null)
}
