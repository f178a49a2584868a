//! DuckDB backend implementation.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use async_trait::async_trait;
use duckdb::types::Value as DuckValue;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, Semaphore, SemaphorePermit};

use crate::config::ResolvedStoreConfig;
use crate::dialect::DuckDbDialect;
use crate::error::{CubistError, Result};
use crate::schema_cache::{ColumnSchema, TableSchema};

use super::{BackendConnection, ColumnMeta, QueryResult};

/// DuckDB database shared by a pool of connections.
#[derive(Clone)]
pub struct DuckDbConnection {
    location: String,
    dialect: DuckDbDialect,
    limiter: Arc<Semaphore>,
    root: Arc<StdMutex<duckdb::Connection>>,
    pool: Arc<Mutex<Vec<duckdb::Connection>>>,
}

impl DuckDbConnection {
    /// Open the database file at `path`, or an in-memory database for `None`.
    pub fn open(path: Option<&str>) -> Result<Self> {
        let root = match path {
            Some(path) => duckdb::Connection::open(path)?,
            None => duckdb::Connection::open_in_memory()?,
        };
        let location = path.unwrap_or(":memory:").to_string();
        tracing::info!(path = %location, max_concurrency = 16, "opened DuckDB database");
        Ok(Self {
            location,
            dialect: DuckDbDialect,
            limiter: Arc::new(Semaphore::new(16)),
            root: Arc::new(StdMutex::new(root)),
            pool: Arc::new(Mutex::new(Vec::new())),
        })
    }

    pub(crate) fn from_config(
        store: &str,
        config: &ResolvedStoreConfig,
    ) -> Result<Arc<dyn BackendConnection>> {
        tracing::debug!(store, "configuring DuckDB store");
        let conn = Self::open(config.path.as_deref())?.with_max_concurrency(config.max_concurrency);
        Ok(Arc::new(conn))
    }

    /// Configure maximum concurrent executions; callers can tune based on hardware.
    pub fn with_max_concurrency(mut self, max_in_flight: usize) -> Self {
        tracing::debug!(max_concurrency = max_in_flight, "configuring DuckDB concurrency");
        self.limiter = Arc::new(Semaphore::new(max_in_flight.max(1)));
        self
    }

    /// Run statements that return no rows, e.g. to create and seed tables.
    pub fn execute_batch(&self, sql: &str) -> Result<()> {
        let root = self
            .root
            .lock()
            .map_err(|_| CubistError::Execution("duckdb connection poisoned".to_string()))?;
        root.execute_batch(sql)?;
        Ok(())
    }

    async fn acquire_slot(&self) -> Result<SemaphorePermit<'_>> {
        if self.limiter.available_permits() == 0 {
            tracing::debug!("all DuckDB slots in use, waiting for permit");
        }
        self.limiter
            .acquire()
            .await
            .map_err(|e| CubistError::Execution(format!("limiter closed: {e}")))
    }

    async fn checkout_connection(&self) -> Result<duckdb::Connection> {
        let mut guard = self.pool.lock().await;
        if let Some(conn) = guard.pop() {
            let pool_size = guard.len();
            drop(guard);
            tracing::trace!(pool_remaining = pool_size, "reusing pooled DuckDB connection");
            return Ok(conn);
        }
        drop(guard);
        tracing::debug!(path = %self.location, "opening new DuckDB connection");
        let root = self
            .root
            .lock()
            .map_err(|_| CubistError::Execution("duckdb connection poisoned".to_string()))?;
        Ok(root.try_clone()?)
    }

    async fn checkin_connection(&self, conn: duckdb::Connection) {
        self.pool.lock().await.push(conn);
    }
}

#[async_trait]
impl BackendConnection for DuckDbConnection {
    fn dialect(&self) -> &(dyn crate::dialect::Dialect + Send + Sync) {
        &self.dialect
    }

    async fn fetch_schema(&self, schema: Option<&str>, table: &str) -> Result<TableSchema> {
        let schema = schema.map(str::to_string);
        let table = table.to_string();
        let conn = self.checkout_connection().await?;
        let result =
            tokio::task::spawn_blocking(move || -> (Result<TableSchema>, duckdb::Connection) {
                let start = Instant::now();
                let columns = table_columns(&conn, schema.as_deref(), &table);
                tracing::debug!(
                    table = table.as_str(),
                    ms = start.elapsed().as_millis(),
                    "duckdb fetch_schema"
                );
                let schema = columns.and_then(|columns| {
                    if columns.is_empty() {
                        Err(CubistError::Schema(format!("table '{table}' not found")))
                    } else {
                        Ok(TableSchema {
                            schema,
                            name: table,
                            columns,
                        })
                    }
                });
                (schema, conn)
            })
            .await
            .map_err(|e| CubistError::Execution(format!("task join error: {e}")))?;

        let (schema, conn) = result;
        self.checkin_connection(conn).await;
        schema
    }

    async fn execute_sql(&self, sql: &str) -> Result<QueryResult> {
        let sql = sql.to_string();
        let _permit = self.acquire_slot().await?;
        let conn = self.checkout_connection().await?;
        let (result, conn) =
            tokio::task::spawn_blocking(move || -> (Result<QueryResult>, duckdb::Connection) {
                let start = Instant::now();
                let result = run_query(&conn, &sql);
                if let Ok(result) = &result {
                    tracing::debug!(
                        rows = result.rows.len(),
                        columns = result.columns.len(),
                        ms = start.elapsed().as_millis(),
                        "duckdb execute_sql"
                    );
                }
                (result, conn)
            })
            .await
            .map_err(|e| CubistError::Execution(format!("task join error: {e}")))?;

        self.checkin_connection(conn).await;
        result
    }
}

fn table_columns(
    conn: &duckdb::Connection,
    schema: Option<&str>,
    table: &str,
) -> Result<Vec<ColumnSchema>> {
    let mut sql = String::from(
        "SELECT column_name, data_type, is_nullable FROM information_schema.columns WHERE table_name = ?",
    );
    let mut params: Vec<&str> = vec![table];
    if let Some(schema) = schema {
        sql.push_str(" AND table_schema = ?");
        params.push(schema);
    }
    sql.push_str(" ORDER BY ordinal_position");

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(duckdb::params_from_iter(params))?;
    let mut columns = Vec::new();
    while let Some(row) = rows.next()? {
        let name: String = row.get(0)?;
        let data_type: String = row.get(1)?;
        let nullable: String = row.get(2)?;
        columns.push(ColumnSchema {
            name,
            data_type,
            nullable: nullable.eq_ignore_ascii_case("YES"),
        });
    }
    Ok(columns)
}

fn run_query(conn: &duckdb::Connection, sql: &str) -> Result<QueryResult> {
    let mut stmt = conn.prepare(sql)?;
    let mut rows_iter = stmt.query([])?;
    let stmt_ref = rows_iter
        .as_ref()
        .ok_or_else(|| CubistError::Execution("statement missing".to_string()))?;
    let mut column_names = Vec::new();
    for idx in 0..stmt_ref.column_count() {
        let name = stmt_ref
            .column_name(idx)
            .map_err(|e| CubistError::Execution(e.to_string()))?;
        column_names.push(name.to_string());
    }
    let mut rows = Vec::new();
    while let Some(row) = rows_iter.next()? {
        let mut map = Map::new();
        for (idx, name) in column_names.iter().enumerate() {
            map.insert(name.clone(), duck_value_to_json(row.get_ref(idx)?.to_owned()));
        }
        rows.push(map);
    }
    Ok(QueryResult {
        columns: column_names
            .into_iter()
            .map(|name| ColumnMeta { name })
            .collect(),
        rows,
    })
}

fn duck_value_to_json(value: DuckValue) -> Value {
    match value {
        DuckValue::Null => Value::Null,
        DuckValue::Boolean(b) => Value::Bool(b),
        DuckValue::TinyInt(i) => Value::from(i),
        DuckValue::SmallInt(i) => Value::from(i),
        DuckValue::Int(i) => Value::from(i),
        DuckValue::BigInt(i) => Value::from(i),
        // i128 sums of integer columns
        DuckValue::HugeInt(i) => i64::try_from(i)
            .map(Value::from)
            .unwrap_or_else(|_| Value::String(i.to_string())),
        DuckValue::UTinyInt(i) => Value::from(i),
        DuckValue::USmallInt(i) => Value::from(i),
        DuckValue::UInt(i) => Value::from(i),
        DuckValue::UBigInt(i) => Value::from(i),
        DuckValue::Float(f) => Value::from(f),
        DuckValue::Double(f) => Value::from(f),
        DuckValue::Decimal(d) => Value::String(d.to_string()),
        DuckValue::Timestamp(unit, t) => Value::String(format!("{t} ({unit:?})")),
        DuckValue::Text(s) => Value::String(s),
        DuckValue::Blob(bytes) => Value::String(hex::encode(bytes)),
        DuckValue::Date32(d) => Value::from(d),
        DuckValue::Time64(unit, t) => Value::String(format!("{t} ({unit:?})")),
        DuckValue::Interval {
            months,
            days,
            nanos,
        } => Value::String(format!("{months} months {days} days {nanos} nanos")),
        DuckValue::List(items) | DuckValue::Array(items) => {
            Value::Array(items.into_iter().map(duck_value_to_json).collect())
        }
        DuckValue::Enum(s) => Value::String(s),
        DuckValue::Struct(fields) => {
            let mut map = Map::new();
            for (key, val) in fields.iter() {
                map.insert(key.clone(), duck_value_to_json(val.clone()));
            }
            Value::Object(map)
        }
        DuckValue::Map(entries) => Value::Array(
            entries
                .iter()
                .map(|(k, v)| {
                    Value::Array(vec![
                        duck_value_to_json(k.clone()),
                        duck_value_to_json(v.clone()),
                    ])
                })
                .collect(),
        ),
        DuckValue::Union(inner) => duck_value_to_json(*inner),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_schema_and_rows() {
        let conn = DuckDbConnection::open(None).unwrap();
        conn.execute_batch(
            "CREATE TABLE fact_sales (id INTEGER NOT NULL, amount DOUBLE); \
             INSERT INTO fact_sales VALUES (1, 2.5), (2, 4.0);",
        )
        .unwrap();

        let schema = conn.fetch_schema(None, "fact_sales").await.unwrap();
        assert_eq!(schema.columns.len(), 2);
        assert!(!schema.column("id").unwrap().nullable);
        assert!(schema.column("amount").unwrap().nullable);

        let err = conn.fetch_schema(None, "missing").await.unwrap_err();
        assert!(matches!(err, CubistError::Schema(_)));

        let result = conn
            .execute_sql("SELECT SUM(amount) AS total FROM fact_sales")
            .await
            .unwrap();
        assert_eq!(result.columns, vec![ColumnMeta { name: "total".to_string() }]);
        assert_eq!(result.rows[0]["total"], Value::from(6.5));
    }
}
