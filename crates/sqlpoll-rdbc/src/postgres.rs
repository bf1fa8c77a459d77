//! PostgreSQL backend implementation for sqlpoll-rdbc
//!
//! Provides:
//! - [`PgConnection`] over a single `tokio-postgres` client
//! - Row-limited queries that stop reading the result stream early
//! - [`PgConnectionFactory`] with connect timeout and JDBC URL support
//!
//! Columns are decoded into typed [`Value`]s. A column whose type has no
//! mapping, or whose value does not fit the mapped type, fails the query with
//! a type conversion error instead of being read as NULL; cast such columns
//! to `text` in the statement.

use async_trait::async_trait;
use futures::TryStreamExt;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_postgres::types::{FromSql, ToSql, Type};
use tracing::{debug, error};

use crate::connection::{Connection, ConnectionConfig, ConnectionFactory, DatabaseType};
use crate::error::{Error, Result};
use crate::types::{Row, Value};

/// Convert a tokio-postgres row to a Row
fn pg_row_to_row(pg_row: &tokio_postgres::Row) -> Result<Row> {
    let columns: Vec<String> = pg_row
        .columns()
        .iter()
        .map(|c| c.name().to_string())
        .collect();

    let values = pg_row
        .columns()
        .iter()
        .enumerate()
        .map(|(i, col)| pg_value_to_value(pg_row, i, col.type_()))
        .collect::<Result<Vec<Value>>>()?;

    Ok(Row::new(columns, values))
}

fn decode_failure(column: &str, pg_type: &Type, detail: impl fmt::Display) -> Error {
    Error::type_conversion(format!(
        "cannot decode column '{}' of type {}: {}",
        column, pg_type, detail
    ))
}

fn unsupported_type(column: &str, pg_type: &Type) -> Error {
    decode_failure(
        column,
        pg_type,
        "unsupported type, cast the column to text in the query",
    )
}

fn column_name(row: &tokio_postgres::Row, idx: usize) -> &str {
    row.columns().get(idx).map(|c| c.name()).unwrap_or("?")
}

fn cell<'a, T>(row: &'a tokio_postgres::Row, idx: usize, wrap: fn(T) -> Value) -> Result<Value>
where
    T: FromSql<'a>,
{
    let value: Option<T> = row.try_get(idx).map_err(|e| {
        let pg_type = row.columns()[idx].type_();
        decode_failure(column_name(row, idx), pg_type, e)
    })?;
    Ok(value.map(wrap).unwrap_or(Value::Null))
}

fn array<'a, T>(row: &'a tokio_postgres::Row, idx: usize, wrap: fn(T) -> Value) -> Result<Value>
where
    T: FromSql<'a>,
{
    let items: Option<Vec<Option<T>>> = row.try_get(idx).map_err(|e| {
        let pg_type = row.columns()[idx].type_();
        decode_failure(column_name(row, idx), pg_type, e)
    })?;
    Ok(match items {
        Some(items) => Value::Array(
            items
                .into_iter()
                .map(|item| item.map(wrap).unwrap_or(Value::Null))
                .collect(),
        ),
        None => Value::Null,
    })
}

/// Convert a PostgreSQL value to a Value
fn pg_value_to_value(row: &tokio_postgres::Row, idx: usize, pg_type: &Type) -> Result<Value> {
    match *pg_type {
        Type::BOOL => cell(row, idx, Value::Bool),
        Type::CHAR => cell(row, idx, Value::Int8),
        Type::INT2 => cell(row, idx, Value::Int16),
        Type::INT4 => cell(row, idx, Value::Int32),
        Type::INT8 => cell(row, idx, Value::Int64),
        Type::OID => cell::<u32>(row, idx, |oid| Value::Int64(i64::from(oid))),
        Type::FLOAT4 => cell(row, idx, Value::Float32),
        Type::FLOAT8 => cell(row, idx, Value::Float64),
        Type::NUMERIC => cell(row, idx, Value::Decimal),
        Type::VARCHAR | Type::TEXT | Type::BPCHAR | Type::NAME | Type::UNKNOWN => {
            cell(row, idx, Value::String)
        }
        Type::BYTEA => cell(row, idx, Value::Bytes),
        Type::DATE => cell(row, idx, Value::Date),
        Type::TIME => cell(row, idx, Value::Time),
        Type::TIMESTAMP => cell(row, idx, Value::DateTime),
        Type::TIMESTAMPTZ => cell(row, idx, Value::DateTimeTz),
        Type::UUID => cell(row, idx, Value::Uuid),
        Type::JSON | Type::JSONB => cell(row, idx, Value::Json),
        Type::BOOL_ARRAY => array(row, idx, Value::Bool),
        Type::INT2_ARRAY => array(row, idx, Value::Int16),
        Type::INT4_ARRAY => array(row, idx, Value::Int32),
        Type::INT8_ARRAY => array(row, idx, Value::Int64),
        Type::FLOAT4_ARRAY => array(row, idx, Value::Float32),
        Type::FLOAT8_ARRAY => array(row, idx, Value::Float64),
        Type::NUMERIC_ARRAY => array(row, idx, Value::Decimal),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY | Type::BPCHAR_ARRAY | Type::NAME_ARRAY => {
            array(row, idx, Value::String)
        }
        Type::DATE_ARRAY => array(row, idx, Value::Date),
        Type::TIMESTAMP_ARRAY => array(row, idx, Value::DateTime),
        Type::TIMESTAMPTZ_ARRAY => array(row, idx, Value::DateTimeTz),
        Type::UUID_ARRAY => array(row, idx, Value::Uuid),
        _ => Err(unsupported_type(column_name(row, idx), pg_type)),
    }
}

/// Strip a JDBC prefix so `jdbc:postgresql://...` URLs are accepted
fn native_url(url: &str) -> &str {
    url.strip_prefix("jdbc:").unwrap_or(url)
}

/// PostgreSQL connection implementation
pub struct PgConnection {
    client: Arc<tokio_postgres::Client>,
    closed: AtomicBool,
}

impl PgConnection {
    /// Create a new connection from a tokio-postgres client
    pub fn new(client: tokio_postgres::Client) -> Self {
        Self {
            client: Arc::new(client),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) || self.client.is_closed() {
            return Err(Error::connection("connection is closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl Connection for PgConnection {
    async fn query_limited(&self, sql: &str, max_rows: usize) -> Result<Vec<Row>> {
        self.ensure_open()?;

        let stream = self
            .client
            .query_raw(sql, std::iter::empty::<&(dyn ToSql + Sync)>())
            .await
            .map_err(classify)?;
        futures::pin_mut!(stream);

        let mut rows = Vec::new();
        while rows.len() < max_rows {
            match stream.try_next().await.map_err(classify)? {
                Some(pg_row) => rows.push(pg_row_to_row(&pg_row)?),
                None => break,
            }
        }

        debug!(rows = rows.len(), max_rows, "postgres query finished");
        Ok(rows)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

/// Lost connections are retriable; everything else is a rejected statement
fn classify(err: tokio_postgres::Error) -> Error {
    if err.is_closed() {
        return Error::connection_with_source("connection lost", err);
    }
    let message = match err.as_db_error() {
        Some(db) => db.message().to_string(),
        None => err.to_string(),
    };
    Error::query_with_source(message, err)
}

/// PostgreSQL connection factory
#[derive(Debug, Clone, Default)]
pub struct PgConnectionFactory;

#[async_trait]
impl ConnectionFactory for PgConnectionFactory {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Box<dyn Connection>> {
        let mut pg_config: tokio_postgres::Config = native_url(&config.url)
            .parse()
            .map_err(|e| Error::config(format!("invalid postgres url: {}", e)))?;
        if let Some(name) = &config.application_name {
            pg_config.application_name(name);
        }
        let timeout = Duration::from_millis(config.connect_timeout_ms);
        pg_config.connect_timeout(timeout);

        let (client, connection) =
            tokio::time::timeout(timeout, pg_config.connect(tokio_postgres::NoTls))
                .await
                .map_err(|_| Error::timeout("connecting to postgres"))?
                .map_err(|e| Error::connection_with_source("failed to connect", e))?;

        // Spawn the connection handler
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "postgres connection error");
            }
        });

        Ok(Box::new(PgConnection::new(client)))
    }

    fn database_type(&self) -> DatabaseType {
        DatabaseType::PostgreSQL
    }
}
