use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{Column, Executor, Row, TypeInfo};
use std::time::{Duration, Instant};

use super::{hex_string, map_sqlx_error, BackendError, BackendSession, SqlBackend, TableData};
use crate::domain::models::{DataSource, DataSourceKind};
use crate::infrastructure::config::PoolConfig;

pub struct PostgresBackend {
    pool: sqlx::PgPool,
}

impl PostgresBackend {
    /// Builds a bounded, lazily-connecting pool for one datasource. No
    /// network traffic happens until the first statement runs.
    pub fn connect_lazy(ds: &DataSource, password: &str, pool_config: &PoolConfig) -> Self {
        let options = PgConnectOptions::new()
            .host(&ds.host)
            .port(ds.port)
            .database(&ds.database_name)
            .username(&ds.username)
            .password(password);
        let pool = PgPoolOptions::new()
            .max_connections(pool_config.per_datasource_max)
            .idle_timeout(Duration::from_secs(pool_config.idle_timeout_secs))
            .connect_lazy_with(options);
        Self { pool }
    }
}

#[async_trait]
impl SqlBackend for PostgresBackend {
    fn kind(&self) -> DataSourceKind {
        DataSourceKind::Postgresql
    }

    async fn run_query(&self, sql: &str) -> Result<TableData, BackendError> {
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(map_sqlx_error)?;

        let mut data = TableData::default();
        if let Some(first) = rows.first() {
            for column in first.columns() {
                data.column_names.push(column.name().to_string());
                data.column_types.push(column.type_info().name().to_string());
            }
        } else if let Ok(described) = self.pool.describe(sql).await {
            // zero rows still deserve column metadata when the backend can
            // prepare the statement
            for column in described.columns() {
                data.column_names.push(column.name().to_string());
                data.column_types.push(column.type_info().name().to_string());
            }
        }

        for row in &rows {
            let mut object = serde_json::Map::with_capacity(data.column_names.len());
            for (idx, name) in data.column_names.iter().enumerate() {
                object.insert(name.clone(), decode_value(row, idx, &data.column_types[idx]));
            }
            data.rows.push(object);
        }
        Ok(data)
    }

    async fn run_write(&self, sql: &str) -> Result<u64, BackendError> {
        sqlx::query(sql)
            .execute(&self.pool)
            .await
            .map(|done| done.rows_affected())
            .map_err(map_sqlx_error)
    }

    async fn begin(&self) -> Result<Box<dyn BackendSession>, BackendError> {
        let tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        Ok(Box::new(PostgresSession { tx }))
    }

    async fn probe(&self) -> Result<Duration, BackendError> {
        let started = Instant::now();
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(map_sqlx_error)?;
        Ok(started.elapsed())
    }
}

struct PostgresSession {
    tx: sqlx::Transaction<'static, sqlx::Postgres>,
}

#[async_trait]
impl BackendSession for PostgresSession {
    async fn execute_write(&mut self, sql: &str) -> Result<u64, BackendError> {
        sqlx::query(sql)
            .execute(&mut *self.tx)
            .await
            .map(|done| done.rows_affected())
            .map_err(map_sqlx_error)
    }

    async fn commit(self: Box<Self>) -> Result<(), BackendError> {
        self.tx.commit().await.map_err(map_sqlx_error)
    }

    async fn rollback(self: Box<Self>) -> Result<(), BackendError> {
        self.tx.rollback().await.map_err(map_sqlx_error)
    }
}

/// Decodes one column into JSON by the backend's native type name. NULL maps
/// to JSON null; values the decoder does not recognize fall back to their
/// text rendering when the driver offers one.
fn decode_value(row: &PgRow, idx: usize, type_name: &str) -> Value {
    macro_rules! take {
        ($ty:ty, $conv:expr) => {
            match row.try_get::<Option<$ty>, _>(idx) {
                Ok(Some(v)) => $conv(v),
                Ok(None) => Value::Null,
                Err(_) => fallback_text(row, idx),
            }
        };
    }

    match type_name {
        "BOOL" => take!(bool, Value::Bool),
        "INT2" => take!(i16, |v: i16| Value::from(v)),
        "INT4" => take!(i32, |v: i32| Value::from(v)),
        "INT8" | "OID" => take!(i64, |v: i64| Value::from(v)),
        "FLOAT4" => take!(f32, |v: f32| Value::from(f64::from(v))),
        "FLOAT8" => take!(f64, Value::from),
        "NUMERIC" => take!(rust_decimal::Decimal, |v: rust_decimal::Decimal| {
            Value::String(v.to_string())
        }),
        "TEXT" | "VARCHAR" | "CHAR" | "BPCHAR" | "NAME" | "CITEXT" => {
            take!(String, Value::String)
        }
        "UUID" => take!(uuid::Uuid, |v: uuid::Uuid| Value::String(v.to_string())),
        "TIMESTAMPTZ" => take!(chrono::DateTime<chrono::Utc>, |v: chrono::DateTime<
            chrono::Utc,
        >| {
            Value::String(v.to_rfc3339())
        }),
        "TIMESTAMP" => take!(chrono::NaiveDateTime, |v: chrono::NaiveDateTime| {
            Value::String(v.to_string())
        }),
        "DATE" => take!(chrono::NaiveDate, |v: chrono::NaiveDate| Value::String(
            v.to_string()
        )),
        "TIME" => take!(chrono::NaiveTime, |v: chrono::NaiveTime| Value::String(
            v.to_string()
        )),
        "JSON" | "JSONB" => take!(Value, |v| v),
        "BYTEA" => take!(Vec<u8>, |v: Vec<u8>| Value::String(hex_string(&v))),
        _ => fallback_text(row, idx),
    }
}

fn fallback_text(row: &PgRow, idx: usize) -> Value {
    match row.try_get::<Option<String>, _>(idx) {
        Ok(Some(v)) => Value::String(v),
        _ => Value::Null,
    }
}
