//! PostgreSQL warehouse: DDL, one transaction per loaded table, post-load
//! constraints and indexes.

use std::time::Instant;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio_postgres::types::{ToSql, Type};

use crate::backends::{BackendConnection, ColumnRecord, PostgresConnection};
use crate::dialect::{Dialect, PostgresDialect};
use crate::error::{CanvasqlError, Result};

use super::{
    LoadMode, MappedColumn, Row, TableLoader, WarehouseTarget, CREATED_AT_COLUMN,
    UPDATED_AT_COLUMN,
};

fn quote(ident: &str) -> String {
    PostgresDialect.quote_ident(ident)
}

/// `CREATE TABLE` with the mapped columns followed by the audit columns.
pub(crate) fn create_table_sql(table: &str, columns: &[MappedColumn]) -> String {
    let mut defs: Vec<String> = columns
        .iter()
        .map(|c| {
            let null = if c.nullable { "" } else { " NOT NULL" };
            format!("{} {}{null}", quote(&c.name), c.dest)
        })
        .collect();
    for audit in [CREATED_AT_COLUMN, UPDATED_AT_COLUMN] {
        defs.push(format!("{} timestamp DEFAULT CURRENT_TIMESTAMP", quote(audit)));
    }
    format!("CREATE TABLE {} ({})", quote(table), defs.join(", "))
}

/// Multi-row INSERT whose text parameters are cast back to the column types.
pub(crate) fn insert_sql(table: &str, columns: &[MappedColumn], rows: usize) -> String {
    let names = columns
        .iter()
        .map(|c| quote(&c.name))
        .collect::<Vec<_>>()
        .join(", ");
    let width = columns.len();
    let values = (0..rows)
        .map(|r| {
            let cells = columns
                .iter()
                .enumerate()
                .map(|(i, c)| format!("CAST(${} AS {})", r * width + i + 1, c.dest))
                .collect::<Vec<_>>()
                .join(", ");
            format!("({cells})")
        })
        .collect::<Vec<_>>()
        .join(", ");
    format!("INSERT INTO {} ({names}) VALUES {values}", quote(table))
}

pub(crate) fn primary_key_sql(table: &str, primary_key: &[String]) -> Option<String> {
    if primary_key.is_empty() {
        return None;
    }
    let cols = primary_key
        .iter()
        .map(|c| quote(c))
        .collect::<Vec<_>>()
        .join(", ");
    Some(format!("ALTER TABLE {} ADD PRIMARY KEY ({cols})", quote(table)))
}

/// PostgreSQL silently truncates identifiers longer than this many bytes.
const MAX_IDENTIFIER_LEN: usize = 63;

/// `idx_{table}_{column}_{suffix}`. Names over the identifier limit are cut
/// short and tagged with a digest of the full name so they stay distinct.
pub fn index_name(table: &str, column: &str, suffix: &str) -> String {
    let full = format!("idx_{table}_{column}_{suffix}");
    if full.len() <= MAX_IDENTIFIER_LEN {
        return full;
    }
    let digest = format!("{:x}", Sha256::digest(full.as_bytes()));
    let tag = &digest[..8];
    let mut keep = MAX_IDENTIFIER_LEN - tag.len() - 1;
    while !full.is_char_boundary(keep) {
        keep -= 1;
    }
    format!("{}_{tag}", &full[..keep])
}

/// One index per date/time column and per numeric column.
pub(crate) fn index_sql(table: &str, columns: &[MappedColumn]) -> Vec<(String, String)> {
    columns
        .iter()
        .filter_map(|c| {
            let suffix = if c.dest.is_temporal() {
                "date"
            } else if c.dest.is_numeric() {
                "num"
            } else {
                return None;
            };
            let name = index_name(table, &c.name, suffix);
            let sql = format!(
                "CREATE INDEX IF NOT EXISTS {} ON {} ({})",
                quote(&name),
                quote(table),
                quote(&c.name)
            );
            Some((name, sql))
        })
        .collect()
}

pub struct PostgresWarehouse {
    conn: PostgresConnection,
}

impl PostgresWarehouse {
    pub fn new(conn: PostgresConnection) -> Self {
        Self { conn }
    }

    async fn execute(&self, sql: &str) -> Result<()> {
        let client = self.conn.client().await?;
        client
            .batch_execute(sql)
            .await
            .map_err(|e| CanvasqlError::Execution(e.to_string()))
    }
}

#[async_trait]
impl WarehouseTarget for PostgresWarehouse {
    async fn list_tables_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let client = self.conn.client().await?;
        let rows = client
            .query(
                "SELECT tablename::text FROM pg_tables \
                 WHERE schemaname = $1 AND left(tablename::text, char_length($2::text)) = $2::text \
                 ORDER BY tablename",
                &[&self.conn.schema(), &prefix],
            )
            .await
            .map_err(|e| CanvasqlError::Execution(format!("list warehouse tables: {e}")))?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn table_exists(&self, table: &str) -> Result<bool> {
        let client = self.conn.client().await?;
        let row = client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM pg_tables WHERE schemaname = $1 AND tablename = $2)",
                &[&self.conn.schema(), &table],
            )
            .await
            .map_err(|e| CanvasqlError::Execution(format!("check warehouse table: {e}")))?;
        Ok(row.get(0))
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        self.execute(&format!("DROP TABLE IF EXISTS {}", quote(table)))
            .await
    }

    async fn begin_load(
        &self,
        table: &str,
        columns: &[MappedColumn],
        mode: LoadMode,
    ) -> Result<Box<dyn TableLoader>> {
        let client = self.conn.client().await?;
        let setup = match mode {
            LoadMode::Create => format!("BEGIN; {}", create_table_sql(table, columns)),
            LoadMode::Replace => format!(
                "BEGIN; ALTER TABLE {t} DISABLE TRIGGER USER; TRUNCATE TABLE {t}",
                t = quote(table)
            ),
        };
        let started = client.batch_execute(&setup).await;
        if let Err(e) = started {
            drop(deadpool_postgres::Object::take(client));
            return Err(CanvasqlError::Execution(format!("prepare {table}: {e}")));
        }

        tracing::debug!(table = %table, mode = ?mode, "warehouse load started");
        Ok(Box::new(PgTableLoader {
            client: Some(client),
            table: table.to_string(),
            columns: columns.to_vec(),
            mode,
        }))
    }

    async fn finalize_table(
        &self,
        table: &str,
        primary_key: &[String],
        columns: &[MappedColumn],
    ) -> Result<()> {
        if let Some(sql) = primary_key_sql(table, primary_key) {
            self.execute(&sql).await?;
        }

        let start = Instant::now();
        let mut created = 0usize;
        for (name, sql) in index_sql(table, columns) {
            match self.execute(&sql).await {
                Ok(()) => created += 1,
                Err(e) => tracing::warn!(index = %name, error = %e, "index creation failed"),
            }
        }
        tracing::debug!(
            table = %table,
            indexes = created,
            ms = start.elapsed().as_millis(),
            "warehouse table finalized"
        );
        Ok(())
    }

    async fn describe_table(&self, table: &str) -> Result<Vec<ColumnRecord>> {
        let mut columns = self.conn.fetch_columns(Some(table)).await?;
        columns.retain(|c| c.table == table);
        Ok(columns)
    }

    async fn row_count(&self, table: &str) -> Result<u64> {
        let client = self.conn.client().await?;
        let sql = format!("SELECT COUNT(*) FROM {}", quote(table));
        let row = client
            .query_one(sql.as_str(), &[])
            .await
            .map_err(|e| CanvasqlError::Execution(format!("count {table}: {e}")))?;
        let count: i64 = row.get(0);
        Ok(u64::try_from(count).unwrap_or(0))
    }
}

/// Holds a pooled client with an open transaction for one table. Dropping
/// it before `commit`/`rollback` detaches the client so the transaction is
/// aborted with the connection.
pub struct PgTableLoader {
    client: Option<deadpool_postgres::Object>,
    table: String,
    columns: Vec<MappedColumn>,
    mode: LoadMode,
}

impl PgTableLoader {
    async fn finish(&mut self, sql: &str) -> Result<()> {
        let Some(client) = self.client.take() else {
            return Ok(());
        };
        let finished = client.batch_execute(sql).await;
        if let Err(e) = finished {
            drop(deadpool_postgres::Object::take(client));
            return Err(CanvasqlError::Execution(format!("finish {}: {e}", self.table)));
        }
        Ok(())
    }
}

#[async_trait]
impl TableLoader for PgTableLoader {
    async fn insert_batch(&mut self, rows: &[Row]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| CanvasqlError::Execution(format!("load of {} is closed", self.table)))?;

        let sql = insert_sql(&self.table, &self.columns, rows.len());
        let types = vec![Type::TEXT; rows.len() * self.columns.len()];
        let statement = client
            .prepare_typed_cached(&sql, &types)
            .await
            .map_err(|e| CanvasqlError::Execution(format!("prepare insert: {e}")))?;

        let params: Vec<&(dyn ToSql + Sync)> = rows
            .iter()
            .flat_map(|row| row.iter().map(|v| v as &(dyn ToSql + Sync)))
            .collect();
        if params.len() != types.len() {
            return Err(CanvasqlError::Execution(format!(
                "row width does not match {} columns of {}",
                self.columns.len(),
                self.table
            )));
        }

        client
            .execute(&statement, &params)
            .await
            .map_err(|e| CanvasqlError::Execution(format!("insert into {}: {e}", self.table)))
    }

    async fn commit(mut self: Box<Self>) -> Result<()> {
        let sql = match self.mode {
            LoadMode::Create => "COMMIT".to_string(),
            LoadMode::Replace => format!(
                "ALTER TABLE {} ENABLE TRIGGER USER; COMMIT",
                quote(&self.table)
            ),
        };
        self.finish(&sql).await?;
        tracing::debug!(table = %self.table, "warehouse load committed");
        Ok(())
    }

    async fn rollback(mut self: Box<Self>) -> Result<()> {
        self.finish("ROLLBACK").await
    }
}

impl Drop for PgTableLoader {
    fn drop(&mut self) {
        if let Some(client) = self.client.take() {
            tracing::debug!(table = %self.table, "discarding connection of unfinished load");
            drop(deadpool_postgres::Object::take(client));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::etl::DestinationType;

    fn col(name: &str, dest: DestinationType, nullable: bool) -> MappedColumn {
        MappedColumn {
            name: name.to_string(),
            dest,
            nullable,
            fallback: false,
        }
    }

    fn users() -> Vec<MappedColumn> {
        vec![
            col("id", DestinationType::Integer, false),
            col("email", DestinationType::Varchar(120), true),
            col("created", DestinationType::Timestamp, true),
        ]
    }

    #[test]
    fn create_table_appends_audit_columns() {
        assert_eq!(
            create_table_sql("shop__users", &users()),
            "CREATE TABLE \"shop__users\" (\"id\" integer NOT NULL, \"email\" varchar(120), \
             \"created\" timestamp, \"_etl_created_at\" timestamp DEFAULT CURRENT_TIMESTAMP, \
             \"_etl_updated_at\" timestamp DEFAULT CURRENT_TIMESTAMP)"
        );
    }

    #[test]
    fn insert_numbers_parameters_row_major() {
        let cols = &users()[..2];
        assert_eq!(
            insert_sql("shop__users", cols, 2),
            "INSERT INTO \"shop__users\" (\"id\", \"email\") VALUES \
             (CAST($1 AS integer), CAST($2 AS varchar(120))), \
             (CAST($3 AS integer), CAST($4 AS varchar(120)))"
        );
    }

    #[test]
    fn indexes_cover_date_and_numeric_columns() {
        let names: Vec<String> = index_sql("shop__users", &users())
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(
            names,
            vec!["idx_shop__users_id_num", "idx_shop__users_created_date"]
        );
    }

    #[test]
    fn long_index_names_fit_and_stay_distinct() {
        let table = format!("warehouse_{}__events", "x".repeat(40));
        let created = index_name(&table, "created_at_utc", "date");
        let updated = index_name(&table, "updated_at_utc", "date");
        assert_eq!(created.len(), MAX_IDENTIFIER_LEN);
        assert_eq!(updated.len(), MAX_IDENTIFIER_LEN);
        assert_ne!(created, updated);
        assert_eq!(created[..54], updated[..54]);
        assert_eq!(created, index_name(&table, "created_at_utc", "date"));
        assert_eq!(index_name("shop__users", "id", "num"), "idx_shop__users_id_num");
    }

    #[test]
    fn composite_primary_key() {
        assert_eq!(
            primary_key_sql("shop__lines", &["order_id".to_string(), "line".to_string()]),
            Some("ALTER TABLE \"shop__lines\" ADD PRIMARY KEY (\"order_id\", \"line\")".to_string())
        );
        assert_eq!(primary_key_sql("shop__log", &[]), None);
    }
}
