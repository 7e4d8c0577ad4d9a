//! PostgreSQL backend implementation.

use std::net::IpAddr;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::Value;
use tokio_postgres::types::{FromSql, ToSql, Type};
use tokio_postgres::{Column, Row};
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::connections::ConnectionProfile;
use crate::dialect::{Dialect, PostgresDialect};
use crate::error::{CanvasqlError, Result};

use super::{BackendConnection, ColumnRecord, ForeignKeyRecord, JsonRow, KeyColumnRecord};

const COLUMNS_SQL: &str = r#"
    SELECT table_name::text, column_name::text, data_type::text, udt_name::text,
           is_nullable::text, ordinal_position::int4, character_maximum_length::int4,
           numeric_precision::int4, numeric_scale::int4
    FROM information_schema.columns
    WHERE table_schema = $1 AND ($2::text IS NULL OR lower(table_name) = lower($2))
    ORDER BY table_name, ordinal_position
"#;

const PRIMARY_KEYS_SQL: &str = r#"
    SELECT tc.table_name::text, kcu.column_name::text, kcu.ordinal_position::int4
    FROM information_schema.table_constraints tc
    JOIN information_schema.key_column_usage kcu
        ON tc.constraint_name = kcu.constraint_name
        AND tc.table_schema = kcu.table_schema
        AND tc.table_name = kcu.table_name
    WHERE tc.constraint_type = 'PRIMARY KEY'
        AND tc.table_schema = $1
        AND ($2::text IS NULL OR lower(tc.table_name) = lower($2))
    ORDER BY tc.table_name, kcu.ordinal_position
"#;

const FOREIGN_KEYS_SQL: &str = r#"
    SELECT tc.table_name::text, kcu.column_name::text, ccu.table_name::text, ccu.column_name::text
    FROM information_schema.table_constraints tc
    JOIN information_schema.key_column_usage kcu
        ON tc.constraint_name = kcu.constraint_name
        AND tc.table_schema = kcu.table_schema
    JOIN information_schema.constraint_column_usage ccu
        ON tc.constraint_name = ccu.constraint_name
        AND tc.table_schema = ccu.table_schema
    WHERE tc.constraint_type = 'FOREIGN KEY' AND tc.table_schema = $1
"#;

pub struct PostgresConnection {
    pool: deadpool_postgres::Pool,
    schema: String,
    dialect: PostgresDialect,
}

impl PostgresConnection {
    /// Build a pool for one profile. No connection is opened until first use.
    pub fn connect(
        profile: &ConnectionProfile,
        pool_config: &PoolConfig,
        statement_timeout_ms: u64,
    ) -> Result<Self> {
        tracing::info!(
            host = %profile.host,
            database = %profile.database,
            schema = %profile.schema,
            "creating PostgreSQL connection pool"
        );

        let mut cfg = deadpool_postgres::Config::new();
        cfg.host = Some(profile.host.clone());
        cfg.port = Some(profile.port);
        cfg.user = Some(profile.username.clone());
        cfg.password = Some(profile.password.clone());
        cfg.dbname = Some(profile.database.clone());
        cfg.connect_timeout = Some(pool_config.connect_timeout());
        if statement_timeout_ms > 0 {
            cfg.options = Some(format!("-c statement_timeout={statement_timeout_ms}"));
        }
        cfg.pool = Some(deadpool_postgres::PoolConfig::new(pool_config.size));

        let pool = cfg
            .create_pool(
                Some(deadpool_postgres::Runtime::Tokio1),
                tokio_postgres::NoTls,
            )
            .map_err(|e| {
                tracing::error!(error = %e, "failed to create PostgreSQL pool");
                CanvasqlError::Execution(format!("create postgres pool: {e}"))
            })?;

        tracing::debug!(
            schema = %profile.schema,
            max_size = pool.status().max_size,
            "PostgreSQL connection pool created"
        );

        Ok(Self {
            pool,
            schema: profile.schema.clone(),
            dialect: PostgresDialect,
        })
    }

    /// Check out a pooled client.
    pub(crate) async fn client(&self) -> Result<deadpool_postgres::Object> {
        let pool_status = self.pool.status();
        tracing::trace!(
            available = pool_status.available,
            size = pool_status.size,
            max_size = pool_status.max_size,
            "acquiring PostgreSQL connection"
        );
        self.pool.get().await.map_err(|e| {
            tracing::error!(error = %e, "failed to get PostgreSQL connection");
            CanvasqlError::Execution(format!("get postgres connection: {e}"))
        })
    }
}

#[async_trait]
impl BackendConnection for PostgresConnection {
    fn dialect(&self) -> &dyn Dialect {
        &self.dialect
    }

    fn schema(&self) -> &str {
        &self.schema
    }

    async fn list_base_tables(&self) -> Result<Vec<String>> {
        let client = self.client().await?;
        let rows = client
            .query(
                "SELECT table_name::text FROM information_schema.tables \
                 WHERE table_schema = $1 AND table_type = 'BASE TABLE' ORDER BY table_name",
                &[&self.schema],
            )
            .await
            .map_err(|e| CanvasqlError::Execution(format!("list tables: {e}")))?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let client = self.client().await?;
        let row = client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
                 WHERE table_schema = $1 AND lower(table_name) = lower($2))",
                &[&self.schema, &table],
            )
            .await
            .map_err(|e| CanvasqlError::Execution(format!("check table: {e}")))?;
        Ok(row.get(0))
    }

    async fn fetch_columns(&self, table: Option<&str>) -> Result<Vec<ColumnRecord>> {
        let start = Instant::now();
        let client = self.client().await?;
        let rows = client
            .query(COLUMNS_SQL, &[&self.schema, &table])
            .await
            .map_err(|e| CanvasqlError::Execution(format!("fetch columns: {e}")))?;

        let columns: Vec<ColumnRecord> = rows
            .iter()
            .map(|row| {
                let is_nullable: String = row.get(4);
                ColumnRecord {
                    table: row.get(0),
                    name: row.get(1),
                    data_type: row.get(2),
                    udt_name: row.get(3),
                    nullable: is_nullable == "YES",
                    ordinal: row.get(5),
                    max_length: row.get(6),
                    precision: row.get(7),
                    scale: row.get(8),
                }
            })
            .collect();

        tracing::debug!(
            table = table.unwrap_or("*"),
            schema = self.schema.as_str(),
            columns = columns.len(),
            ms = start.elapsed().as_millis(),
            "postgres fetch_columns"
        );
        Ok(columns)
    }

    async fn fetch_primary_keys(&self, table: Option<&str>) -> Result<Vec<KeyColumnRecord>> {
        let client = self.client().await?;
        let rows = client
            .query(PRIMARY_KEYS_SQL, &[&self.schema, &table])
            .await
            .map_err(|e| CanvasqlError::Execution(format!("fetch primary keys: {e}")))?;
        Ok(rows
            .iter()
            .map(|row| KeyColumnRecord {
                table: row.get(0),
                column: row.get(1),
                position: row.get(2),
            })
            .collect())
    }

    async fn fetch_foreign_keys(&self) -> Result<Vec<ForeignKeyRecord>> {
        let client = self.client().await?;
        let rows = client
            .query(FOREIGN_KEYS_SQL, &[&self.schema])
            .await
            .map_err(|e| CanvasqlError::Execution(format!("fetch foreign keys: {e}")))?;
        Ok(rows
            .iter()
            .map(|row| ForeignKeyRecord {
                referencing_table: row.get(0),
                referencing_column: row.get(1),
                referenced_table: row.get(2),
                referenced_column: row.get(3),
            })
            .collect())
    }

    async fn execute_query(&self, sql: &str, params: &[String]) -> Result<Vec<JsonRow>> {
        let start = Instant::now();
        tracing::trace!(sql = %sql, params = params.len(), "executing PostgreSQL query");

        let client = self.client().await?;

        // Run the statement as compiled so its ORDER BY governs row order.
        let types = vec![Type::TEXT; params.len()];
        let statement = client.prepare_typed(sql, &types).await.map_err(|e| {
            tracing::error!(error = %e, "PostgreSQL prepare failed");
            CanvasqlError::Execution(format!("prepare query: {e}"))
        })?;
        let bound: Vec<&(dyn ToSql + Sync)> = params
            .iter()
            .map(|p| p as &(dyn ToSql + Sync))
            .collect();
        let rows = client.query(&statement, &bound).await.map_err(|e| {
            tracing::error!(error = %e, "PostgreSQL query execution failed");
            CanvasqlError::Execution(format!("execute query: {e}"))
        })?;

        let mut result_rows = Vec::with_capacity(rows.len());
        for row in &rows {
            let mut map = JsonRow::new();
            for (idx, col) in row.columns().iter().enumerate() {
                map.insert(col.name().to_string(), pg_value_to_json(row, idx, col));
            }
            result_rows.push(map);
        }

        tracing::debug!(
            rows = result_rows.len(),
            columns = statement.columns().len(),
            ms = start.elapsed().as_millis(),
            "postgres execute_query"
        );
        Ok(result_rows)
    }
}

/// Decode one column into JSON. NULLs and values that fail to decode become
/// `null`. Temporal values are rendered as text.
fn pg_value_to_json(row: &Row, idx: usize, col: &Column) -> Value {
    fn get<'a, T: FromSql<'a>>(row: &'a Row, idx: usize) -> Option<T> {
        match row.try_get::<_, Option<T>>(idx) {
            Ok(value) => value,
            Err(e) => {
                tracing::warn!(column = idx, error = %e, "failed to decode column value");
                None
            }
        }
    }

    let value = match col.type_() {
        &Type::BOOL => get::<bool>(row, idx).map(Value::Bool),
        &Type::INT2 => get::<i16>(row, idx).map(Value::from),
        &Type::INT4 => get::<i32>(row, idx).map(Value::from),
        &Type::INT8 => get::<i64>(row, idx).map(Value::from),
        &Type::OID => get::<u32>(row, idx).map(Value::from),
        &Type::FLOAT4 => get::<f32>(row, idx).and_then(|v| float_json(f64::from(v))),
        &Type::FLOAT8 => get::<f64>(row, idx).and_then(float_json),
        &Type::NUMERIC => get::<Decimal>(row, idx).map(decimal_json),
        &Type::DATE => get::<NaiveDate>(row, idx).map(|d| Value::String(d.to_string())),
        &Type::TIME => get::<NaiveTime>(row, idx).map(|t| Value::String(t.to_string())),
        &Type::TIMESTAMP => {
            get::<NaiveDateTime>(row, idx).map(|ts| Value::String(timestamp_text(&ts)))
        }
        &Type::TIMESTAMPTZ => {
            get::<DateTime<Utc>>(row, idx).map(|ts| Value::String(ts.to_rfc3339()))
        }
        &Type::JSON | &Type::JSONB => get::<Value>(row, idx),
        &Type::UUID => get::<Uuid>(row, idx).map(|u| Value::String(u.to_string())),
        &Type::INET => get::<IpAddr>(row, idx).map(|ip| Value::String(ip.to_string())),
        // Text-like types decode as strings; anything else is returned as null.
        _ => row
            .try_get::<_, Option<String>>(idx)
            .ok()
            .flatten()
            .map(Value::String),
    };
    value.unwrap_or(Value::Null)
}

fn float_json(v: f64) -> Option<Value> {
    serde_json::Number::from_f64(v).map(Value::Number)
}

/// Whole numbers stay integers; anything with a fraction becomes a float.
fn decimal_json(d: Decimal) -> Value {
    let d = d.normalize();
    if d.scale() == 0 {
        if let Some(i) = d.to_i64() {
            return Value::from(i);
        }
    }
    d.to_f64()
        .and_then(float_json)
        .unwrap_or_else(|| Value::String(d.to_string()))
}

fn timestamp_text(ts: &NaiveDateTime) -> String {
    ts.format("%Y-%m-%d %H:%M:%S%.f").to_string()
}
